//! Incremental JSON Extractor: a hand-written, event-driven byte scanner
//! that yields `in_network[*]` items one at a time without ever
//! buffering the surrounding array, and a sibling mode that collects the
//! (small) list of index-file locations from `reporting_structure[*]`.
//!
//! The scanner only parses enough structure to (a) find the one top-level
//! key it's looking for, skipping every other top-level value wholesale,
//! and (b) capture one array element's raw bytes at a time, which are
//! then handed to `serde_json::from_slice` for structured decoding. A
//! token split across a part boundary is handled for free: the scanner
//! reads from whatever `Read` it's given, and `StreamReader` is what
//! stitches parts together without a seam.

use crate::error::{CoreError, CoreResult};
use crate::model::RateRecord;
use serde::Deserialize;
use std::io::{BufReader, Read};

fn parse_err(msg: impl Into<String>) -> CoreError {
    CoreError::ParseError(msg.into())
}

/// Low-level byte cursor with one byte of lookahead.
struct ByteCursor<R: Read> {
    reader: BufReader<R>,
    peeked: Option<u8>,
}

impl<R: Read> ByteCursor<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader),
            peeked: None,
        }
    }

    fn peek(&mut self) -> CoreResult<Option<u8>> {
        if self.peeked.is_none() {
            let mut b = [0u8; 1];
            let n = self
                .reader
                .read(&mut b)
                .map_err(|e| CoreError::IoError { path: String::new(), source: e })?;
            if n == 1 {
                self.peeked = Some(b[0]);
            }
        }
        Ok(self.peeked)
    }

    fn next(&mut self) -> CoreResult<Option<u8>> {
        let b = self.peek()?;
        self.peeked = None;
        Ok(b)
    }

    fn next_tracked(&mut self, out: &mut Option<&mut Vec<u8>>) -> CoreResult<u8> {
        let b = self.next()?.ok_or_else(|| parse_err("unexpected end of stream"))?;
        if let Some(buf) = out.as_deref_mut() {
            buf.push(b);
        }
        Ok(b)
    }

    fn skip_ws(&mut self) -> CoreResult<()> {
        while let Some(b) = self.peek()? {
            if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                self.next()?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn expect(&mut self, byte: u8) -> CoreResult<()> {
        match self.next()? {
            Some(b) if b == byte => Ok(()),
            Some(b) => Err(parse_err(format!(
                "expected '{}' but found '{}'",
                byte as char, b as char
            ))),
            None => Err(parse_err(format!("expected '{}' but found end of stream", byte as char))),
        }
    }

    /// Consume a complete JSON value, optionally appending every consumed
    /// byte to `out`. Recursive, balance-aware, string/escape-aware.
    fn skip_value(&mut self, out: &mut Option<&mut Vec<u8>>) -> CoreResult<()> {
        self.skip_ws()?;
        match self.peek()?.ok_or_else(|| parse_err("unexpected end of stream in value"))? {
            b'{' => self.skip_object(out),
            b'[' => self.skip_array(out),
            b'"' => self.skip_string(out),
            b't' => self.skip_literal("true", out),
            b'f' => self.skip_literal("false", out),
            b'n' => self.skip_literal("null", out),
            b'-' | b'0'..=b'9' => self.skip_number(out),
            other => Err(parse_err(format!("unexpected byte '{}' at start of value", other as char))),
        }
    }

    fn skip_object(&mut self, out: &mut Option<&mut Vec<u8>>) -> CoreResult<()> {
        self.next_tracked(out)?; // '{'
        self.skip_ws()?;
        if self.peek()? == Some(b'}') {
            self.next_tracked(out)?;
            return Ok(());
        }
        loop {
            self.skip_ws()?;
            self.skip_string(out)?; // key
            self.skip_ws()?;
            let colon = self.next_tracked(out)?;
            if colon != b':' {
                return Err(parse_err("expected ':' after object key"));
            }
            self.skip_value(out)?;
            self.skip_ws()?;
            match self.next_tracked(out)? {
                b',' => continue,
                b'}' => return Ok(()),
                other => return Err(parse_err(format!("expected ',' or '}}' but found '{}'", other as char))),
            }
        }
    }

    fn skip_array(&mut self, out: &mut Option<&mut Vec<u8>>) -> CoreResult<()> {
        self.next_tracked(out)?; // '['
        self.skip_ws()?;
        if self.peek()? == Some(b']') {
            self.next_tracked(out)?;
            return Ok(());
        }
        loop {
            self.skip_value(out)?;
            self.skip_ws()?;
            match self.next_tracked(out)? {
                b',' => continue,
                b']' => return Ok(()),
                other => return Err(parse_err(format!("expected ',' or ']' but found '{}'", other as char))),
            }
        }
    }

    fn skip_string(&mut self, out: &mut Option<&mut Vec<u8>>) -> CoreResult<()> {
        let open = self.next_tracked(out)?;
        if open != b'"' {
            return Err(parse_err("expected '\"' to start string"));
        }
        loop {
            let b = self.next_tracked(out)?;
            match b {
                b'"' => return Ok(()),
                b'\\' => {
                    let escaped = self.next_tracked(out)?;
                    if escaped == b'u' {
                        for _ in 0..4 {
                            self.next_tracked(out)?;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn skip_number(&mut self, out: &mut Option<&mut Vec<u8>>) -> CoreResult<()> {
        self.next_tracked(out)?; // first digit or '-'
        while let Some(b) = self.peek()? {
            if b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-') {
                self.next_tracked(out)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn skip_literal(&mut self, literal: &str, out: &mut Option<&mut Vec<u8>>) -> CoreResult<()> {
        for expected in literal.bytes() {
            let b = self.next_tracked(out)?;
            if b != expected {
                return Err(parse_err(format!("malformed literal, expected '{literal}'")));
            }
        }
        Ok(())
    }

    /// Read a string value and return its raw (still-escaped) bytes,
    /// excluding the surrounding quotes. Only used for keys, which in
    /// every shape this extractor cares about are plain ASCII with no
    /// escapes.
    fn read_raw_string_bytes(&mut self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        let mut out = Some(&mut buf);
        self.skip_string(&mut out)?;
        // Strip the surrounding quote bytes captured by skip_string.
        buf.remove(0);
        buf.pop();
        Ok(buf)
    }
}

/// What the top-level scan found.
pub enum ExtractedDocument {
    /// `in_network` was found; the cursor is positioned just after `[`,
    /// ready for repeated `next_item` calls.
    InNetworkArray,
    /// `reporting_structure` was found and fully consumed; these are the
    /// `in_network_files[*].location` URLs it referenced.
    IndexLocations(Vec<String>),
    /// Neither top-level key was present.
    Unrecognized,
}

#[derive(Debug, Deserialize, Default)]
struct RawFileLocation {
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawReportingStructureItem {
    #[serde(default)]
    in_network_files: Vec<RawFileLocation>,
}

#[derive(Debug, Deserialize, Default)]
struct RawNegotiatedPrice {
    #[serde(default)]
    negotiated_type: Option<String>,
    #[serde(default)]
    negotiated_rate: Option<serde_json::Value>,
    #[serde(default)]
    expiration_date: Option<String>,
    #[serde(default)]
    billing_class: Option<String>,
    #[serde(default)]
    service_code: Option<Vec<String>>,
    #[serde(default)]
    billing_code_modifier: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawNegotiatedRateDetail {
    #[serde(default)]
    negotiated_prices: Vec<RawNegotiatedPrice>,
}

#[derive(Debug, Deserialize, Default)]
struct RawInNetworkItem {
    #[serde(default)]
    billing_code: Option<serde_json::Value>,
    #[serde(default)]
    billing_code_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    negotiated_rates: Vec<RawNegotiatedRateDetail>,
}

/// An accepted `in_network[*]` item: `billing_code_type == "CPT"` and a
/// non-empty trimmed `billing_code`.
#[derive(Debug, Clone)]
pub struct InNetworkItem {
    pub billing_code: String,
    pub description: String,
    pub rates: Vec<RateRecord>,
}

fn coerce_code(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce_rate(value: &Option<serde_json::Value>) -> f64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(serde_json::Value::String(s)) => s.parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

fn accept(raw: RawInNetworkItem) -> Option<InNetworkItem> {
    if raw.billing_code_type.as_deref() != Some("CPT") {
        return None;
    }
    let code = raw.billing_code.as_ref().and_then(coerce_code)?;
    if code.is_empty() {
        return None;
    }
    let mut rates = Vec::new();
    for detail in &raw.negotiated_rates {
        for price in &detail.negotiated_prices {
            rates.push(RateRecord {
                negotiated_rate: coerce_rate(&price.negotiated_rate),
                billing_class: price.billing_class.clone().unwrap_or_default(),
                billing_code_modifier: price.billing_code_modifier.clone().unwrap_or_default(),
                service_code: price.service_code.clone().unwrap_or_default(),
                negotiated_type: price.negotiated_type.clone().unwrap_or_default(),
                expiration_date: price
                    .expiration_date
                    .as_deref()
                    .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            });
        }
    }
    Some(InNetworkItem {
        billing_code: code,
        description: raw.description.unwrap_or_default(),
        rates,
    })
}

/// Event-driven extractor over a byte stream.
pub struct JsonItemExtractor<R: Read> {
    cursor: ByteCursor<R>,
    array_done: bool,
}

impl<R: Read> JsonItemExtractor<R> {
    pub fn new(reader: R) -> Self {
        Self {
            cursor: ByteCursor::new(reader),
            array_done: false,
        }
    }

    /// Scan the top level once. Must be called before `next_item`.
    pub fn detect(&mut self) -> CoreResult<ExtractedDocument> {
        self.cursor.skip_ws()?;
        self.cursor.expect(b'{')?;
        self.cursor.skip_ws()?;
        if self.cursor.peek()? == Some(b'}') {
            self.cursor.next()?;
            return Ok(ExtractedDocument::Unrecognized);
        }
        loop {
            self.cursor.skip_ws()?;
            let key = self.cursor.read_raw_string_bytes()?;
            self.cursor.skip_ws()?;
            self.cursor.expect(b':')?;
            self.cursor.skip_ws()?;

            if key == b"in_network" {
                self.cursor.expect(b'[')?;
                return Ok(ExtractedDocument::InNetworkArray);
            } else if key == b"reporting_structure" {
                self.cursor.expect(b'[')?;
                let locations = self.collect_reporting_structure()?;
                return Ok(ExtractedDocument::IndexLocations(locations));
            } else {
                let mut none = None;
                self.cursor.skip_value(&mut none)?;
            }

            self.cursor.skip_ws()?;
            match self.cursor.next()?.ok_or_else(|| parse_err("unexpected end of stream in object"))? {
                b',' => continue,
                b'}' => return Ok(ExtractedDocument::Unrecognized),
                other => return Err(parse_err(format!("expected ',' or '}}' but found '{}'", other as char))),
            }
        }
    }

    fn collect_reporting_structure(&mut self) -> CoreResult<Vec<String>> {
        let mut locations = Vec::new();
        self.cursor.skip_ws()?;
        if self.cursor.peek()? == Some(b']') {
            self.cursor.next()?;
            return Ok(locations);
        }
        loop {
            let mut buf = Vec::new();
            let mut out = Some(&mut buf);
            self.cursor.skip_value(&mut out)?;
            if let Ok(item) = serde_json::from_slice::<RawReportingStructureItem>(&buf) {
                for f in item.in_network_files {
                    if let Some(loc) = f.location {
                        locations.push(loc);
                    }
                }
            }
            self.cursor.skip_ws()?;
            match self.cursor.next()?.ok_or_else(|| parse_err("unexpected end of stream in reporting_structure"))? {
                b',' => continue,
                b']' => return Ok(locations),
                other => return Err(parse_err(format!("expected ',' or ']' but found '{}'", other as char))),
            }
        }
    }

    /// Yield the next accepted `in_network[*]` item, or `None` at the end
    /// of the array. Non-accepted items are skipped silently, never
    /// surfaced as an error.
    pub fn next_item(&mut self) -> CoreResult<Option<InNetworkItem>> {
        if self.array_done {
            return Ok(None);
        }
        loop {
            self.cursor.skip_ws()?;
            if self.cursor.peek()? == Some(b']') {
                self.cursor.next()?;
                self.array_done = true;
                return Ok(None);
            }

            let mut buf = Vec::new();
            let mut out = Some(&mut buf);
            self.cursor.skip_value(&mut out)?;

            self.cursor.skip_ws()?;
            match self.cursor.next()?.ok_or_else(|| parse_err("unexpected end of stream in in_network array"))? {
                b',' => {}
                b']' => self.array_done = true,
                other => return Err(parse_err(format!("expected ',' or ']' but found '{}'", other as char))),
            }

            let parsed = serde_json::from_slice::<RawInNetworkItem>(&buf).ok().and_then(accept);
            if let Some(item) = parsed {
                return Ok(Some(item));
            }
            if self.array_done {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn extractor(json: &str) -> JsonItemExtractor<Cursor<Vec<u8>>> {
        JsonItemExtractor::new(Cursor::new(json.as_bytes().to_vec()))
    }

    #[test]
    fn finds_in_network_array_and_yields_accepted_items() {
        let json = r#"{
            "reporting_entity_name": "Acme",
            "in_network": [
                {"billing_code_type":"CPT","billing_code":"99213","description":"Office visit",
                 "negotiated_rates":[{"negotiated_prices":[{"negotiated_type":"negotiated","negotiated_rate":150.0,"billing_class":"professional","expiration_date":"9999-12-31"}]}]},
                {"billing_code_type":"HCPCS","billing_code":"J1234","description":"not cpt",
                 "negotiated_rates":[]},
                {"billing_code_type":"CPT","billing_code":"  ","description":"blank code",
                 "negotiated_rates":[]}
            ],
            "last_updated_on": "2024-01-01"
        }"#;
        let mut ex = extractor(json);
        assert!(matches!(ex.detect().unwrap(), ExtractedDocument::InNetworkArray));
        let item = ex.next_item().unwrap().unwrap();
        assert_eq!(item.billing_code, "99213");
        assert_eq!(item.description, "Office visit");
        assert_eq!(item.rates.len(), 1);
        assert_eq!(item.rates[0].negotiated_rate, 150.0);
        // HCPCS item and blank-code item are both skipped silently.
        assert!(ex.next_item().unwrap().is_none());
    }

    #[test]
    fn numeric_billing_code_is_coerced_to_string() {
        let json = r#"{"in_network":[{"billing_code_type":"CPT","billing_code":99213,"negotiated_rates":[]}]}"#;
        let mut ex = extractor(json);
        ex.detect().unwrap();
        let item = ex.next_item().unwrap().unwrap();
        assert_eq!(item.billing_code, "99213");
    }

    #[test]
    fn finds_reporting_structure_locations() {
        let json = r#"{
            "reporting_entity_name": "Acme",
            "reporting_structure": [
                {"reporting_plans": [], "in_network_files": [{"description":"d1","location":"https://x/1.json"}]},
                {"reporting_plans": [], "in_network_files": [{"description":"d2","location":"https://x/2.json"}]}
            ]
        }"#;
        let mut ex = extractor(json);
        match ex.detect().unwrap() {
            ExtractedDocument::IndexLocations(locs) => {
                assert_eq!(locs, vec!["https://x/1.json".to_string(), "https://x/2.json".to_string()]);
            }
            _ => panic!("expected IndexLocations"),
        }
    }

    #[test]
    fn unrecognized_top_level_shape() {
        let json = r#"{"foo": 1, "bar": [1,2,3]}"#;
        let mut ex = extractor(json);
        assert!(matches!(ex.detect().unwrap(), ExtractedDocument::Unrecognized));
    }

    #[test]
    fn empty_in_network_array_yields_no_items() {
        let json = r#"{"in_network": []}"#;
        let mut ex = extractor(json);
        ex.detect().unwrap();
        assert!(ex.next_item().unwrap().is_none());
        assert!(ex.next_item().unwrap().is_none());
    }

    #[test]
    fn truncated_mid_item_is_a_parse_error() {
        let json = r#"{"in_network": [{"billing_code_type":"CPT","billing_code":"99213""#;
        let mut ex = extractor(json);
        ex.detect().unwrap();
        assert!(ex.next_item().is_err());
    }

    #[test]
    fn string_containing_escaped_brace_does_not_confuse_the_scanner() {
        let json = r#"{"in_network": [{"billing_code_type":"CPT","billing_code":"99213","description":"contains \" and } chars","negotiated_rates":[]}]}"#;
        let mut ex = extractor(json);
        ex.detect().unwrap();
        let item = ex.next_item().unwrap().unwrap();
        assert_eq!(item.description, "contains \" and } chars");
    }
}
