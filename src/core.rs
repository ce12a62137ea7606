//! The `Core` facade: the external operations a transport adapter (HTTP
//! handler, CLI) drives one at a time per session. Everything below is a
//! thin, logged wrapper around the Source Store, the two comparators, and
//! the session table; none of it contains aggregation or comparison logic
//! of its own.

use crate::aggregate::CompareRule;
use crate::comparator::{self, ComparisonReport};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::extractor::{ExtractedDocument, InNetworkItem, JsonItemExtractor};
use crate::fetch;
use crate::loaders;
use crate::model::{RateRecord, Source};
use crate::reader::StreamReader;
use crate::session::{IncrementalSnapshot, SessionTable};
use crate::store::SourceStore;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

/// Input format accepted by `load_source_from_path`. `Json` relies on the
/// `.gz` suffix to decide whether to decompress; `JsonGz` forces
/// decompression even when a caller has stored a gzipped file under a
/// different extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Json,
    JsonGz,
    Csv,
    Excel,
}

impl SourceFormat {
    pub fn parse(token: &str) -> CoreResult<Self> {
        match token {
            "json" => Ok(Self::Json),
            "json_gz" => Ok(Self::JsonGz),
            "csv" => Ok(Self::Csv),
            "excel" => Ok(Self::Excel),
            other => Err(CoreError::ParseError(format!("unknown source format '{other}'"))),
        }
    }
}

/// One entry in a `LoadReport`'s bounded preview.
#[derive(Debug, Clone)]
pub struct PreviewEntry {
    pub code: String,
    pub description: String,
    pub rate_count: usize,
}

/// Result of a successful ingest: how many rate rows were accepted, and a
/// preview capped at `Config::preview_limit`.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub source_name: String,
    pub count: usize,
    pub preview: Vec<PreviewEntry>,
}

/// `load_source_from_path` on a JSON document can find either an
/// in-network payload (ingested directly) or an index file (a list of
/// URLs for a surrounding layer to fetch, never ingested here).
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Ingested(LoadReport),
    Index(Vec<String>),
}

/// `fetch_and_ingest_url` distinguishes a normal ingest from a link that
/// the remote host has explicitly revoked.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ingested(LoadReport),
    ExpiredLink(String),
}

fn make_preview(items: &[(String, String, usize)], limit: usize) -> Vec<PreviewEntry> {
    items
        .iter()
        .take(limit)
        .map(|(code, description, rate_count)| PreviewEntry {
            code: code.clone(),
            description: description.clone(),
            rate_count: *rate_count,
        })
        .collect()
}

/// Drain every accepted `in_network[*]` item from an already-detected
/// extractor, feeding each one into `sink` as it arrives so the full
/// document is never buffered.
fn drain_items<R: Read>(
    extractor: &mut JsonItemExtractor<R>,
    mut sink: impl FnMut(InNetworkItem),
) -> CoreResult<usize> {
    let mut count = 0usize;
    while let Some(item) = extractor.next_item()? {
        count += 1;
        sink(item);
    }
    Ok(count)
}

fn ingest_reader<R: Read>(reader: R, source_name: &str, store: &SourceStore, preview_limit: usize) -> CoreResult<LoadOutcome> {
    let mut extractor = JsonItemExtractor::new(reader);
    match extractor.detect()? {
        ExtractedDocument::IndexLocations(locations) => Ok(LoadOutcome::Index(locations)),
        ExtractedDocument::Unrecognized => Err(CoreError::ParseError(
            "document has neither an 'in_network' nor a 'reporting_structure' top-level key".to_string(),
        )),
        ExtractedDocument::InNetworkArray => {
            let mut preview_source: Vec<(String, String, usize)> = Vec::new();
            let mut entries: Vec<(String, String, Vec<RateRecord>)> = Vec::new();
            let count = drain_items(&mut extractor, |item| {
                if preview_source.len() < preview_limit {
                    preview_source.push((item.billing_code.clone(), item.description.clone(), item.rates.len()));
                }
                entries.push((item.billing_code, item.description, item.rates));
            })?;
            store.upsert_many(source_name, entries);
            Ok(LoadOutcome::Ingested(LoadReport {
                source_name: source_name.to_string(),
                count,
                preview: make_preview(&preview_source, preview_limit),
            }))
        }
    }
}

fn ingest_loaded_rows(rows: Vec<loaders::LoadedRow>, source_name: &str, store: &SourceStore, preview_limit: usize) -> LoadReport {
    let count = rows.len();
    let mut preview_source: Vec<(String, String, usize)> = Vec::new();
    let mut entries: Vec<(String, String, Vec<RateRecord>)> = Vec::with_capacity(rows.len());
    for row in rows {
        if preview_source.len() < preview_limit {
            preview_source.push((row.code.clone(), row.description.clone(), 1));
        }
        entries.push((row.code, row.description, vec![row.rate]));
    }
    store.upsert_many(source_name, entries);
    LoadReport {
        source_name: source_name.to_string(),
        count,
        preview: make_preview(&preview_source, preview_limit),
    }
}

/// The crate's single public facade: owns the Source Store, the session
/// table, the HTTP client used by `fetch_and_ingest_url`, and the resolved
/// `Config`. Constructed once per process; every operation takes `&self`
/// and is safe to call concurrently across different sources/sessions.
pub struct Core {
    config: Config,
    store: SourceStore,
    sessions: SessionTable,
    http: reqwest::Client,
}

impl Core {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: SourceStore::new(),
            sessions: SessionTable::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ingest (or index-discover) a single file, plain or gzipped, in any
    /// of the four supported formats.
    pub fn load_source_from_path(&self, path: &Path, source_name: &str, format: SourceFormat) -> CoreResult<LoadOutcome> {
        info!(path = %path.display(), source = source_name, format = ?format, "load_source_from_path");
        match format {
            SourceFormat::Csv => {
                let rows = loaders::load_csv(path)?;
                Ok(LoadOutcome::Ingested(ingest_loaded_rows(rows, source_name, &self.store, self.config.preview_limit)))
            }
            SourceFormat::Excel => {
                let rows = loaders::load_excel(path)?;
                Ok(LoadOutcome::Ingested(ingest_loaded_rows(rows, source_name, &self.store, self.config.preview_limit)))
            }
            SourceFormat::Json => {
                let reader = StreamReader::for_path(path.to_path_buf())?;
                ingest_reader(reader, source_name, &self.store, self.config.preview_limit)
            }
            SourceFormat::JsonGz => {
                let file = std::fs::File::open(path).map_err(|e| CoreError::IoError { path: path.display().to_string(), source: e })?;
                let reader = GzDecoder::new(std::io::BufReader::with_capacity(64 * 1024, file));
                ingest_reader(reader, source_name, &self.store, self.config.preview_limit)
            }
        }
    }

    /// Parts are concatenated byte-exact by `StreamReader`, then treated
    /// exactly like a single in-network document.
    pub fn load_source_from_parts(&self, paths: Vec<PathBuf>, source_name: &str) -> CoreResult<LoadOutcome> {
        info!(parts = paths.len(), source = source_name, "load_source_from_parts");
        let reader = StreamReader::for_parts(paths)?;
        ingest_reader(reader, source_name, &self.store, self.config.preview_limit)
    }

    /// Fetch `url` through the content-addressed cache and ingest whatever
    /// it resolves to as an in-network document.
    pub async fn fetch_and_ingest_url(&self, url: &str, source_name: &str) -> CoreResult<FetchOutcome> {
        info!(url, source = source_name, "fetch_and_ingest_url");
        let fetched = match fetch::fetch_and_cache(&self.http, &self.config, url).await {
            Ok(f) => f,
            Err(CoreError::ExpiredLink(url)) => return Ok(FetchOutcome::ExpiredLink(url)),
            Err(e) => return Err(e),
        };
        let path = fetch::ensure_extension_hint(&fetched.path, url);
        let reader = StreamReader::for_path(path)?;
        match ingest_reader(reader, source_name, &self.store, self.config.preview_limit)? {
            LoadOutcome::Ingested(report) => Ok(FetchOutcome::Ingested(report)),
            LoadOutcome::Index(locations) => {
                // An index file fetched directly has no rates of its own;
                // surface it as a zero-count report carrying the referenced
                // URLs would require widening `LoadReport`, so instead this
                // is reported the same way a local index load would be.
                Err(CoreError::ParseError(format!(
                    "{url} is an index file ({} referenced locations), not an in-network document",
                    locations.len()
                )))
            }
        }
    }

    pub fn list_sources(&self) -> Vec<String> {
        self.store.list_names()
    }

    pub fn delete_source(&self, source_name: &str) -> bool {
        self.store.delete(source_name)
    }

    /// Batch comparison of two fully loaded sources.
    pub fn compare(
        &self,
        source1_name: &str,
        source2_name: &str,
        rule: CompareRule,
        negotiated_type: Option<&str>,
        exclude_expired: bool,
        as_of: Option<NaiveDate>,
    ) -> CoreResult<ComparisonReport> {
        info!(source1 = source1_name, source2 = source2_name, rule = rule.as_str(), "compare");
        let source1 = self.store.snapshot(source1_name);
        let source2 = self.store.snapshot(source2_name);
        let (s1, s2) = comparator::require_sources(source1.as_ref(), source2.as_ref(), source1_name, source2_name)?;
        let as_of = as_of.unwrap_or_else(|| chrono::Utc::now().date_naive());
        comparator::compare(source1_name, source2_name, s1, s2, rule, negotiated_type, exclude_expired, as_of)
    }

    /// Start a new incremental session, or resume an existing one by id.
    pub fn session_begin_or_resume(&self, session_id: Option<String>, source1_name: &str, baseline_name: &str) -> CoreResult<String> {
        info!(session_id = ?session_id, source1 = source1_name, baseline = baseline_name, "session_begin_or_resume");
        self.sessions.begin_or_resume(&self.store, session_id, source1_name, baseline_name)
    }

    /// Process one part to completion against one session.
    pub fn session_process_part(
        &self,
        session_id: &str,
        part_path: &Path,
        rule: CompareRule,
        negotiated_type: Option<&str>,
        exclude_expired: bool,
        as_of: Option<NaiveDate>,
    ) -> CoreResult<IncrementalSnapshot> {
        info!(session_id, part = %part_path.display(), rule = rule.as_str(), "session_process_part");
        self.sessions.with_session(session_id, |session| {
            session.process_part(&self.config, part_path, rule, negotiated_type, exclude_expired, as_of)
        })
    }

    /// Return the current snapshot for a session without processing a part.
    pub fn session_status(&self, session_id: &str) -> CoreResult<IncrementalSnapshot> {
        self.sessions.with_session(session_id, |session| Ok(session.snapshot(&self.config)))
    }

    /// Re-run a full-stream comparison over every part processed so far,
    /// for verification against the session's running summary.
    pub fn session_finalize(&self, session_id: &str, baseline_name: &str) -> CoreResult<ComparisonReport> {
        info!(session_id, baseline = baseline_name, "session_finalize");
        self.sessions.with_session(session_id, |session| {
            if session.baseline_source != baseline_name {
                return Err(CoreError::SessionBaselineChanged {
                    session_id: session_id.to_string(),
                    expected: session.baseline_source.clone(),
                    actual: baseline_name.to_string(),
                });
            }
            session.finalize()
        })
    }

    /// Terminal session `close`: releases in-memory state; the last
    /// persisted snapshot on disk is left untouched.
    pub fn session_close(&self, session_id: &str) -> bool {
        self.sessions.close(session_id)
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
