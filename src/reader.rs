//! Stream Reader: presents one file, or an ordered sequence of file parts
//! representing a split MRF document, as a single forward-only byte
//! stream.

use crate::error::{CoreError, CoreResult};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// What a [`StreamReader`] is reading: a single path, or an ordered list
/// of part paths to be concatenated byte-exact.
#[derive(Debug, Clone)]
pub enum StreamInput {
    Single(PathBuf),
    Parts(Vec<PathBuf>),
}

fn open_one(path: &Path) -> CoreResult<Box<dyn Read + Send>> {
    let file = File::open(path).map_err(|e| CoreError::IoError {
        path: path.display().to_string(),
        source: e,
    })?;
    let buffered = BufReader::with_capacity(64 * 1024, file);
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(GzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}

/// Forward-only byte stream over a [`StreamInput`].
///
/// Each part is independently gzip-detected by its own `.gz` suffix. Parts
/// are never concatenated at the compressed byte level; each part's own
/// decompression (if any) finishes before its bytes join the logical
/// stream, so there is no cross-part gzip framing to worry about.
pub struct StreamReader {
    input: StreamInput,
    next_part: usize,
    current: Option<Box<dyn Read + Send>>,
}

impl StreamReader {
    pub fn open(input: StreamInput) -> CoreResult<Self> {
        let mut reader = Self {
            input,
            next_part: 0,
            current: None,
        };
        reader.advance()?;
        Ok(reader)
    }

    pub fn for_path(path: impl Into<PathBuf>) -> CoreResult<Self> {
        Self::open(StreamInput::Single(path.into()))
    }

    pub fn for_parts(paths: Vec<PathBuf>) -> CoreResult<Self> {
        Self::open(StreamInput::Parts(paths))
    }

    fn advance(&mut self) -> CoreResult<bool> {
        let path = match &self.input {
            StreamInput::Single(p) => {
                if self.next_part > 0 {
                    return Ok(false);
                }
                p.clone()
            }
            StreamInput::Parts(parts) => {
                if self.next_part >= parts.len() {
                    return Ok(false);
                }
                parts[self.next_part].clone()
            }
        };
        self.current = Some(open_one(&path)?);
        self.next_part += 1;
        Ok(true)
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match &mut self.current {
                None => return Ok(0),
                Some(r) => {
                    let n = r.read(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                    // Current part is exhausted; move to the next one
                    // with no injected bytes at the boundary.
                    self.current = None;
                    if !self
                        .advance()
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
                    {
                        return Ok(0);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write};

    #[test]
    fn single_plain_file_reads_back_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        std::fs::write(&path, b"hello world").unwrap();
        let mut r = StreamReader::for_path(path).unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn gzip_file_is_transparently_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json.gz");
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"{\"a\":1}").unwrap();
        let bytes = enc.finish().unwrap();
        std::fs::write(&path, bytes).unwrap();

        let mut r = StreamReader::for_path(path).unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "{\"a\":1}");
    }

    #[test]
    fn multi_part_concatenation_is_byte_exact_with_no_separators() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("part1");
        let p2 = dir.path().join("part2");
        // Split a JSON number token across the boundary on purpose.
        std::fs::write(&p1, b"{\"x\": 12").unwrap();
        std::fs::write(&p2, b"3.45}").unwrap();

        let mut r = StreamReader::for_parts(vec![p1, p2]).unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "{\"x\": 123.45}");
    }

    #[test]
    fn missing_file_surfaces_as_io_error() {
        let err = StreamReader::for_path("/nonexistent/path/x.json").unwrap_err();
        assert!(matches!(err, CoreError::IoError { .. }));
    }
}
