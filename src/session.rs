//! Incremental Comparator: one session tracks a single baseline against a
//! Source 1 arriving as an ordered sequence of parts, keeping accurate
//! running counts, sums, and bounded bucket samples as each part lands.
//!
//! Each `process_part` call stages every mutation it would make — summary
//! updates, bucket reassignments, sample insertions — into a clone of the
//! session's mutable state, and only swaps that clone back onto the
//! session once the part's stream reaches a clean end-of-array. A
//! mid-item I/O failure or parse error leaves the session exactly as it
//! was after the previous successful part and never persists a snapshot.

use crate::aggregate::{batch_reduce, CompareRule, ReductionOutput, RuleSummary};
use crate::comparator::{self, bucket_for, percent_difference, Bucket};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::extractor::{ExtractedDocument, JsonItemExtractor};
use crate::model::{filter_rates, CptEntry, RateRecord, Source};
use crate::reader::StreamReader;
use crate::store::SourceStore;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// `Fresh -> Accumulating -> Snapshotted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Accumulating,
    Snapshotted,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Accumulating => "accumulating",
            Self::Snapshotted => "snapshotted",
        }
    }
}

/// A sample item for a matched-key bucket, carrying both sides' reduced
/// values so a client can render a difference row without recomputing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSampleItem {
    pub key: String,
    pub source1_value: f64,
    pub source1_class: String,
    pub source2_value: f64,
    pub source2_class: String,
    pub difference: f64,
    pub percent_difference: f64,
}

/// A sample item for an `only_in_*` list: one side's representative rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlySampleItem {
    pub key: String,
    pub value: f64,
    pub billing_class: String,
}

/// The baseline's reduction, cached the first time a code is touched so
/// repeated parts never recompute it.
#[derive(Debug, Clone)]
enum BaselineCache {
    Scalar(f64, String),
    Classes(HashMap<String, f64>),
}

/// Every field that mutates during `process_part`, isolated so a part can
/// be staged as a clone and committed in one assignment.
#[derive(Debug, Clone, Default)]
struct MutableState {
    seen_source1_codes: HashSet<String>,
    matched_baseline_codes: HashSet<String>,
    matched_code_classes: HashSet<String>,
    only_in_source1_codes: HashSet<String>,
    only_in_source1_sample: BTreeMap<String, OnlySampleItem>,
    source1_summary: HashMap<String, RuleSummary>,
    baseline_rate_cache: HashMap<String, BaselineCache>,
    code_bucket: HashMap<String, Bucket>,
    code_diff: HashMap<String, f64>,
    sample_higher_in_source1: BTreeMap<String, BucketSampleItem>,
    sample_higher_in_source2: BTreeMap<String, BucketSampleItem>,
    sample_equal: BTreeMap<String, BucketSampleItem>,
    higher_in_source1_count: u64,
    higher_in_source2_count: u64,
    equal_count: u64,
    total_higher_in_source1_amount: f64,
    total_higher_in_source2_amount: f64,
}

impl MutableState {
    fn sample_map(&mut self, bucket: Bucket) -> &mut BTreeMap<String, BucketSampleItem> {
        match bucket {
            Bucket::HigherInSource1 => &mut self.sample_higher_in_source1,
            Bucket::HigherInSource2 => &mut self.sample_higher_in_source2,
            Bucket::Equal => &mut self.sample_equal,
        }
    }
}

/// Live state for one Source 1 -> baseline incremental comparison.
#[derive(Debug)]
pub struct IncrementalSession {
    pub session_id: String,
    pub source1_name: String,
    pub baseline_source: String,
    baseline_entries: HashMap<String, CptEntry>,
    pub compare_rule: Option<CompareRule>,
    pub negotiated_type: Option<String>,
    pub exclude_expired: bool,
    pub as_of_date: Option<NaiveDate>,
    pub state: SessionState,
    pub parts_processed: u64,
    pub last_part: Option<String>,
    pub parts: Vec<String>,
    pub updated_at: DateTime<Utc>,
    mutable: MutableState,
}

/// Wire-level view of an [`IncrementalSession`]: every field the session
/// tracks except the bounded-memory maps, which are serialized as ordered
/// lists instead of raw maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalSnapshot {
    pub session_id: String,
    pub source1_name: String,
    pub baseline_source: String,
    pub compare_rule: Option<String>,
    pub negotiated_type: Option<String>,
    pub exclude_expired: bool,
    pub as_of_date: Option<NaiveDate>,
    pub state: String,
    pub parts_processed: u64,
    pub last_part: Option<String>,
    pub updated_at: DateTime<Utc>,

    pub total_source1_count: u64,
    pub total_compared: u64,
    pub only_in_source1_count: u64,
    pub only_in_source2_count: u64,

    pub higher_in_source1_count: u64,
    pub higher_in_source2_count: u64,
    pub equal_count: u64,
    pub total_higher_in_source1_amount: f64,
    pub total_higher_in_source2_amount: f64,

    pub higher_in_source1_sample: Vec<BucketSampleItem>,
    pub higher_in_source2_sample: Vec<BucketSampleItem>,
    pub equal_sample: Vec<BucketSampleItem>,
    pub only_in_source1_sample: Vec<OnlySampleItem>,
    pub only_in_source2_sample: Vec<OnlySampleItem>,

    /// Always `None` from `process_part`/`session_status`: there is no
    /// per-item "source 2 description" to compare against as items
    /// stream in. `session_finalize` returns a `ComparisonReport` instead,
    /// which carries a real `descriptions_match` per matched key.
    pub descriptions_match: Option<bool>,
}

fn all_classes_map_for(
    entry: &CptEntry,
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> CoreResult<HashMap<String, f64>> {
    let filtered = filter_rates(&entry.rates, negotiated_type, exclude_expired, as_of);
    match batch_reduce(CompareRule::AllClasses, &filtered)? {
        ReductionOutput::AllClasses(classes) => Ok(classes.into_iter().map(|(k, v)| (k, v.max)).collect()),
        _ => unreachable!("all_classes rule always reduces to AllClasses"),
    }
}

/// Best-effort representative rate for a single item with no baseline
/// counterpart: the average of its own negotiated prices, independent of
/// the session's configured comparison rule.
fn scalar_from_item_rates(rates: &[RateRecord], negotiated_type: Option<&str>, exclude_expired: bool, as_of: NaiveDate) -> (f64, String) {
    let filtered = filter_rates(rates, negotiated_type, exclude_expired, as_of);
    match batch_reduce(CompareRule::Avg, &filtered) {
        Ok(output) => comparator::scalar_value(&output),
        Err(_) => (0.0, "unknown".to_string()),
    }
}

impl IncrementalSession {
    fn new(session_id: String, source1_name: String, baseline_source: String, baseline_entries: HashMap<String, CptEntry>) -> Self {
        Self {
            session_id,
            source1_name,
            baseline_source,
            baseline_entries,
            compare_rule: None,
            negotiated_type: None,
            exclude_expired: false,
            as_of_date: None,
            state: SessionState::Fresh,
            parts_processed: 0,
            last_part: None,
            parts: Vec::new(),
            updated_at: Utc::now(),
            mutable: MutableState::default(),
        }
    }

    /// Process one part to completion. Any error leaves the session's
    /// observable state exactly as it was before this call.
    pub fn process_part(
        &mut self,
        config: &Config,
        part_path: &Path,
        rule: CompareRule,
        negotiated_type: Option<&str>,
        exclude_expired: bool,
        as_of: Option<NaiveDate>,
    ) -> CoreResult<IncrementalSnapshot> {
        if rule == CompareRule::Context {
            return Err(CoreError::BadRule(
                "context is a batch-only rule and cannot drive an incremental session".to_string(),
            ));
        }

        let effective_as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());

        if let Some(recorded_rule) = self.compare_rule {
            if recorded_rule != rule {
                return Err(CoreError::SessionParamMismatch {
                    session_id: self.session_id.clone(),
                    detail: format!("rule changed from '{}' to '{}'", recorded_rule.as_str(), rule.as_str()),
                });
            }
            if self.negotiated_type.as_deref() != negotiated_type {
                return Err(CoreError::SessionParamMismatch {
                    session_id: self.session_id.clone(),
                    detail: "negotiated_type changed between parts".to_string(),
                });
            }
            if self.exclude_expired != exclude_expired {
                return Err(CoreError::SessionParamMismatch {
                    session_id: self.session_id.clone(),
                    detail: "exclude_expired changed between parts".to_string(),
                });
            }
            if let Some(recorded_as_of) = self.as_of_date {
                if recorded_as_of != effective_as_of {
                    return Err(CoreError::SessionParamMismatch {
                        session_id: self.session_id.clone(),
                        detail: "as_of changed between parts".to_string(),
                    });
                }
            }
        }

        let mut staging = self.mutable.clone();
        self.run_part(&mut staging, config, part_path, rule, negotiated_type, exclude_expired, effective_as_of)?;

        self.mutable = staging;
        self.compare_rule = Some(rule);
        self.negotiated_type = negotiated_type.map(str::to_string);
        self.exclude_expired = exclude_expired;
        self.as_of_date = Some(effective_as_of);
        self.parts_processed += 1;
        self.last_part = Some(part_path.display().to_string());
        self.parts.push(part_path.display().to_string());
        self.updated_at = Utc::now();
        self.state = SessionState::Accumulating;

        let snapshot = self.snapshot(config);
        self.persist(config, &snapshot)?;
        self.state = SessionState::Snapshotted;
        Ok(snapshot)
    }

    fn run_part(
        &self,
        staging: &mut MutableState,
        config: &Config,
        part_path: &Path,
        rule: CompareRule,
        negotiated_type: Option<&str>,
        exclude_expired: bool,
        as_of: NaiveDate,
    ) -> CoreResult<()> {
        let reader = StreamReader::for_path(part_path.to_path_buf())?;
        let mut extractor = JsonItemExtractor::new(reader);
        match extractor.detect()? {
            ExtractedDocument::InNetworkArray => {}
            ExtractedDocument::IndexLocations(_) | ExtractedDocument::Unrecognized => {
                return Err(CoreError::ParseError(
                    "session part did not contain an in_network array".to_string(),
                ));
            }
        }

        while let Some(item) = extractor.next_item()? {
            let code = item.billing_code.trim().to_string();
            if code.is_empty() {
                continue;
            }
            staging.seen_source1_codes.insert(code.clone());

            let Some(baseline_entry) = self.baseline_entries.get(&code) else {
                if staging.only_in_source1_codes.insert(code.clone())
                    && staging.only_in_source1_sample.len() < config.only_in_source1_sample_limit
                {
                    let (value, billing_class) = scalar_from_item_rates(&item.rates, negotiated_type, exclude_expired, as_of);
                    staging
                        .only_in_source1_sample
                        .insert(code.clone(), OnlySampleItem { key: code, value, billing_class });
                }
                continue;
            };

            staging.matched_baseline_codes.insert(code.clone());
            let filtered = filter_rates(&item.rates, negotiated_type, exclude_expired, as_of);

            if rule == CompareRule::AllClasses {
                let baseline_classes = match staging
                    .baseline_rate_cache
                    .entry(code.clone())
                    .or_insert_with(|| BaselineCache::Classes(all_classes_map_for(baseline_entry, negotiated_type, exclude_expired, as_of).unwrap_or_default()))
                {
                    BaselineCache::Classes(m) => m.clone(),
                    BaselineCache::Scalar(..) => unreachable!("all_classes session never caches a scalar baseline"),
                };

                let summary = staging.source1_summary.entry(code.clone()).or_insert_with(|| RuleSummary::new(rule));
                for r in &filtered {
                    summary.update(r);
                }
                let current_classes = match summary.finalize() {
                    ReductionOutput::AllClasses(classes) => classes.into_iter().map(|(k, v)| (k, v.max)).collect::<HashMap<_, _>>(),
                    _ => unreachable!("all_classes summary always finalizes to AllClasses"),
                };

                for (class, &v1) in &current_classes {
                    if let Some(&v2) = baseline_classes.get(class) {
                        let key = format!("{code}|{class}");
                        staging.matched_code_classes.insert(key.clone());
                        let diff = v1 - v2;
                        reassign(staging, config, &key, diff, v1, class.clone(), v2, class.clone());
                    }
                }
            } else {
                let (v2, c2) = match staging.baseline_rate_cache.entry(code.clone()).or_insert_with(|| {
                    let baseline_filtered = filter_rates(&baseline_entry.rates, negotiated_type, exclude_expired, as_of);
                    let (value, class) = batch_reduce(rule, &baseline_filtered)
                        .map(|o| comparator::scalar_value(&o))
                        .unwrap_or((0.0, "unknown".to_string()));
                    BaselineCache::Scalar(value, class)
                }) {
                    BaselineCache::Scalar(v, c) => (*v, c.clone()),
                    BaselineCache::Classes(..) => unreachable!("scalar session never caches an all_classes baseline"),
                };

                let summary = staging.source1_summary.entry(code.clone()).or_insert_with(|| RuleSummary::new(rule));
                for r in &filtered {
                    summary.update(r);
                }
                let (v1, c1) = comparator::scalar_value(&summary.finalize());
                let diff = v1 - v2;
                reassign(staging, config, &code, diff, v1, c1, v2, c2);
            }
        }

        Ok(())
    }

    fn total_compared(&self) -> u64 {
        match self.compare_rule {
            Some(CompareRule::AllClasses) => self.mutable.matched_code_classes.len() as u64,
            _ => self.mutable.matched_baseline_codes.len() as u64,
        }
    }

    fn only_in_source2_sample(&self, config: &Config) -> Vec<OnlySampleItem> {
        let rule = self.compare_rule.unwrap_or(CompareRule::Max);
        let negotiated_type = self.negotiated_type.as_deref();
        let as_of = self.as_of_date.unwrap_or_else(|| Utc::now().date_naive());

        let mut codes: Vec<&String> = self
            .baseline_entries
            .keys()
            .filter(|c| !self.mutable.matched_baseline_codes.contains(*c))
            .collect();
        codes.sort();
        codes
            .into_iter()
            .take(config.only_in_source2_sample_limit)
            .map(|code| {
                let entry = &self.baseline_entries[code];
                let (value, billing_class) = if rule == CompareRule::AllClasses {
                    let classes = all_classes_map_for(entry, negotiated_type, self.exclude_expired, as_of).unwrap_or_default();
                    classes
                        .into_iter()
                        .max_by(|a, b| a.1.total_cmp(&b.1))
                        .map(|(class, v)| (v, class))
                        .unwrap_or((0.0, "unknown".to_string()))
                } else {
                    let filtered = filter_rates(&entry.rates, negotiated_type, self.exclude_expired, as_of);
                    batch_reduce(rule, &filtered).map(|o| comparator::scalar_value(&o)).unwrap_or((0.0, "unknown".to_string()))
                };
                OnlySampleItem {
                    key: code.clone(),
                    value,
                    billing_class,
                }
            })
            .collect()
    }

    /// Build the persisted, wire-level view of this session's current
    /// state.
    pub fn snapshot(&self, config: &Config) -> IncrementalSnapshot {
        let only_in_source2_count = self.baseline_entries.len().saturating_sub(self.mutable.matched_baseline_codes.len()) as u64;
        IncrementalSnapshot {
            session_id: self.session_id.clone(),
            source1_name: self.source1_name.clone(),
            baseline_source: self.baseline_source.clone(),
            compare_rule: self.compare_rule.map(|r| r.as_str().to_string()),
            negotiated_type: self.negotiated_type.clone(),
            exclude_expired: self.exclude_expired,
            as_of_date: self.as_of_date,
            state: self.state.as_str().to_string(),
            parts_processed: self.parts_processed,
            last_part: self.last_part.clone(),
            updated_at: self.updated_at,

            total_source1_count: self.mutable.seen_source1_codes.len() as u64,
            total_compared: self.total_compared(),
            only_in_source1_count: self.mutable.only_in_source1_codes.len() as u64,
            only_in_source2_count,

            higher_in_source1_count: self.mutable.higher_in_source1_count,
            higher_in_source2_count: self.mutable.higher_in_source2_count,
            equal_count: self.mutable.equal_count,
            total_higher_in_source1_amount: self.mutable.total_higher_in_source1_amount,
            total_higher_in_source2_amount: self.mutable.total_higher_in_source2_amount,

            higher_in_source1_sample: self.mutable.sample_higher_in_source1.values().cloned().collect(),
            higher_in_source2_sample: self.mutable.sample_higher_in_source2.values().cloned().collect(),
            equal_sample: self.mutable.sample_equal.values().cloned().collect(),
            only_in_source1_sample: self.mutable.only_in_source1_sample.values().cloned().collect(),
            only_in_source2_sample: self.only_in_source2_sample(config),

            descriptions_match: None,
        }
    }

    fn persist(&self, config: &Config, snapshot: &IncrementalSnapshot) -> CoreResult<()> {
        let path = config.session_snapshot_path(&self.session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::IoError { path: parent.display().to_string(), source: e })?;
        }
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&path, bytes).map_err(|e| CoreError::IoError { path: path.display().to_string(), source: e })?;
        Ok(())
    }

    /// Re-run a full-stream comparison over every part processed so far,
    /// against the baseline, for verification.
    pub fn finalize(&self) -> CoreResult<comparator::ComparisonReport> {
        let rule = self
            .compare_rule
            .ok_or_else(|| CoreError::ParseError("session has no processed parts to finalize".to_string()))?;
        let negotiated_type = self.negotiated_type.as_deref();
        let as_of = self.as_of_date.unwrap_or_else(|| Utc::now().date_naive());

        let part_paths: Vec<std::path::PathBuf> = self.parts.iter().map(std::path::PathBuf::from).collect();
        let reader = StreamReader::for_parts(part_paths)?;
        let mut extractor = JsonItemExtractor::new(reader);
        let mut source1 = Source::new(self.source1_name.clone());
        match extractor.detect()? {
            ExtractedDocument::InNetworkArray => {
                while let Some(item) = extractor.next_item()? {
                    source1.upsert(&item.billing_code, &item.description, item.rates);
                }
            }
            ExtractedDocument::IndexLocations(_) | ExtractedDocument::Unrecognized => {
                return Err(CoreError::ParseError("session parts did not contain an in_network array".to_string()));
            }
        }

        comparator::compare(
            &self.source1_name,
            &self.baseline_source,
            &source1.entries,
            &self.baseline_entries,
            rule,
            negotiated_type,
            self.exclude_expired,
            as_of,
        )
    }
}

fn reassign(staging: &mut MutableState, config: &Config, key: &str, new_diff: f64, v1: f64, c1: String, v2: f64, c2: String) {
    let new_bucket = bucket_for(new_diff);

    if let Some(&prev_bucket) = staging.code_bucket.get(key) {
        let prev_diff = *staging.code_diff.get(key).unwrap_or(&0.0);
        match prev_bucket {
            Bucket::HigherInSource1 => {
                staging.higher_in_source1_count -= 1;
                staging.total_higher_in_source1_amount -= prev_diff.max(0.0);
            }
            Bucket::HigherInSource2 => {
                staging.higher_in_source2_count -= 1;
                staging.total_higher_in_source2_amount -= (-prev_diff).max(0.0);
            }
            Bucket::Equal => staging.equal_count -= 1,
        }
        if prev_bucket != new_bucket {
            staging.sample_map(prev_bucket).remove(key);
        }
    }

    match new_bucket {
        Bucket::HigherInSource1 => {
            staging.higher_in_source1_count += 1;
            staging.total_higher_in_source1_amount += new_diff.max(0.0);
        }
        Bucket::HigherInSource2 => {
            staging.higher_in_source2_count += 1;
            staging.total_higher_in_source2_amount += (-new_diff).max(0.0);
        }
        Bucket::Equal => staging.equal_count += 1,
    }
    staging.code_bucket.insert(key.to_string(), new_bucket);
    staging.code_diff.insert(key.to_string(), new_diff);

    let item = BucketSampleItem {
        key: key.to_string(),
        source1_value: v1,
        source1_class: c1,
        source2_value: v2,
        source2_class: c2,
        difference: new_diff,
        percent_difference: percent_difference(v1, v2),
    };
    let limit = config.incremental_sample_limit;
    let bucket_map = staging.sample_map(new_bucket);
    if bucket_map.contains_key(key) || bucket_map.len() < limit {
        bucket_map.insert(key.to_string(), item);
    }
}

/// In-memory table of incremental sessions, one `Mutex` per session so
/// that parallel calls against *different* sessions never block each
/// other; parallel calls against the *same* session are the caller's
/// responsibility to serialize.
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Arc<Mutex<IncrementalSession>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Resumes an existing session if `session_id` is given and found,
    /// rejecting a mismatched baseline; otherwise creates a new one
    /// (generating an id if none was given).
    pub fn begin_or_resume(&self, store: &SourceStore, session_id: Option<String>, source1_name: &str, baseline_name: &str) -> CoreResult<String> {
        let mut sessions = self.sessions.lock().expect("session table poisoned");

        if let Some(id) = session_id {
            if let Some(existing) = sessions.get(&id) {
                let session = existing.lock().expect("session poisoned");
                if session.baseline_source != baseline_name {
                    return Err(CoreError::SessionBaselineChanged {
                        session_id: id.clone(),
                        expected: session.baseline_source.clone(),
                        actual: baseline_name.to_string(),
                    });
                }
                return Ok(id);
            }
            let baseline_entries = store.snapshot(baseline_name).ok_or_else(|| CoreError::MissingSource(baseline_name.to_string()))?;
            sessions.insert(
                id.clone(),
                Arc::new(Mutex::new(IncrementalSession::new(id.clone(), source1_name.to_string(), baseline_name.to_string(), baseline_entries))),
            );
            return Ok(id);
        }

        let baseline_entries = store.snapshot(baseline_name).ok_or_else(|| CoreError::MissingSource(baseline_name.to_string()))?;
        let id = Uuid::new_v4().to_string();
        sessions.insert(
            id.clone(),
            Arc::new(Mutex::new(IncrementalSession::new(id.clone(), source1_name.to_string(), baseline_name.to_string(), baseline_entries))),
        );
        Ok(id)
    }

    /// Run `f` against the named session while holding only that
    /// session's lock.
    pub fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut IncrementalSession) -> CoreResult<T>) -> CoreResult<T> {
        let handle = {
            let sessions = self.sessions.lock().expect("session table poisoned");
            sessions.get(session_id).cloned().ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?
        };
        let mut session = handle.lock().expect("session poisoned");
        f(&mut session)
    }

    /// Terminal `close`: releases in-memory state; the last persisted
    /// snapshot on disk is left untouched.
    pub fn close(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        sessions.remove(session_id).is_some()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_part(dir: &Path, name: &str, items_json: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let body = format!(r#"{{"in_network":[{items_json}]}}"#);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn item_json(code: &str, rate: f64, class: &str) -> String {
        format!(
            r#"{{"billing_code":"{code}","billing_code_type":"CPT","description":"x","negotiated_rates":[{{"negotiated_prices":[{{"negotiated_rate":{rate},"billing_class":"{class}","negotiated_type":"negotiated","service_code":[],"billing_code_modifier":[]}}]}}]}}"#
        )
    }

    fn baseline_with(code: &str, rate: f64, class: &str) -> HashMap<String, CptEntry> {
        let mut map = HashMap::new();
        map.insert(
            code.to_string(),
            CptEntry {
                description: "Office visit".to_string(),
                rates: vec![RateRecord {
                    negotiated_rate: rate,
                    billing_class: class.to_string(),
                    billing_code_modifier: vec![],
                    service_code: vec![],
                    negotiated_type: "negotiated".to_string(),
                    expiration_date: None,
                }],
            },
        );
        map
    }

    #[test]
    fn scenario_three_bucket_flips_across_parts() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            scratch_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let mut session = IncrementalSession::new(
            "s1".to_string(),
            "source1".to_string(),
            "baseline".to_string(),
            baseline_with("99213", 100.0, "professional"),
        );

        let part1 = write_part(dir.path(), "part1.json", &item_json("99213", 90.0, "professional"));
        let snap1 = session.process_part(&config, &part1, CompareRule::Max, None, false, Some("2025-01-01".parse().unwrap())).unwrap();
        assert_eq!(snap1.higher_in_source2_count, 1);
        assert_eq!(snap1.total_higher_in_source2_amount, 10.0);
        assert_eq!(snap1.higher_in_source1_count, 0);

        let part2 = write_part(dir.path(), "part2.json", &item_json("99213", 110.0, "professional"));
        let snap2 = session.process_part(&config, &part2, CompareRule::Max, None, false, Some("2025-01-01".parse().unwrap())).unwrap();
        assert_eq!(snap2.higher_in_source1_count, 1);
        assert_eq!(snap2.total_higher_in_source1_amount, 10.0);
        assert_eq!(snap2.higher_in_source2_count, 0);
        assert_eq!(snap2.total_higher_in_source2_amount, 0.0);
    }

    #[test]
    fn mismatched_rule_on_second_part_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            scratch_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let mut session = IncrementalSession::new(
            "s1".to_string(),
            "source1".to_string(),
            "baseline".to_string(),
            baseline_with("99213", 100.0, "professional"),
        );
        let part1 = write_part(dir.path(), "part1.json", &item_json("99213", 90.0, "professional"));
        session.process_part(&config, &part1, CompareRule::Max, None, false, None).unwrap();

        let part2 = write_part(dir.path(), "part2.json", &item_json("99213", 110.0, "professional"));
        let err = session.process_part(&config, &part2, CompareRule::Avg, None, false, None).unwrap_err();
        assert!(matches!(err, CoreError::SessionParamMismatch { .. }));
    }

    #[test]
    fn code_not_in_baseline_is_only_in_source1_and_not_compared() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            scratch_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let mut session = IncrementalSession::new(
            "s1".to_string(),
            "source1".to_string(),
            "baseline".to_string(),
            baseline_with("99213", 100.0, "professional"),
        );
        let part1 = write_part(dir.path(), "part1.json", &item_json("00000", 50.0, "professional"));
        let snap = session.process_part(&config, &part1, CompareRule::Max, None, false, None).unwrap();
        assert_eq!(snap.only_in_source1_count, 1);
        assert_eq!(snap.total_compared, 0);
        assert_eq!(snap.only_in_source2_count, 1);
    }

    #[test]
    fn failed_part_leaves_session_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            scratch_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let mut session = IncrementalSession::new(
            "s1".to_string(),
            "source1".to_string(),
            "baseline".to_string(),
            baseline_with("99213", 100.0, "professional"),
        );
        let part1 = write_part(dir.path(), "part1.json", &item_json("99213", 90.0, "professional"));
        session.process_part(&config, &part1, CompareRule::Max, None, false, None).unwrap();
        let before = session.snapshot(&config).total_source1_count;

        let bad_part = dir.path().join("bad.json");
        std::fs::write(&bad_part, b"{\"in_network\": [ { \"billing_code\"").unwrap();
        let err = session.process_part(&config, &bad_part, CompareRule::Max, None, false, None).unwrap_err();
        assert!(matches!(err, CoreError::ParseError(_) | CoreError::IoError { .. }));
        assert_eq!(session.snapshot(&config).total_source1_count, before);
        assert_eq!(session.parts_processed, 1);
    }

    #[test]
    fn session_table_rejects_mismatched_baseline_on_resume() {
        let store = SourceStore::new();
        store.upsert_many("baseline-a", vec![("99213".to_string(), "x".to_string(), vec![])]);
        store.upsert_many("baseline-b", vec![("99213".to_string(), "x".to_string(), vec![])]);
        let table = SessionTable::new();
        let id = table.begin_or_resume(&store, None, "source1", "baseline-a").unwrap();
        let err = table.begin_or_resume(&store, Some(id), "source1", "baseline-b").unwrap_err();
        assert!(matches!(err, CoreError::SessionBaselineChanged { .. }));
    }
}
