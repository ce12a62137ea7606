//! Batch Comparator: compares two fully loaded sources under a chosen
//! rule and buckets every key into `higher_in_source1`,
//! `higher_in_source2`, or `equal`.
//!
//! Scalar rules (`max`, `min`, `avg`, `median`, `max_avg_by_billing_class`,
//! `per_occurrence`) bucket at CPT-code granularity. The two multi-valued
//! rules, `all_classes` and `context`, bucket at a finer granularity —
//! `"code|billing_class"` or `"code|billing_class|modifiers"` — and a class
//! or context present on only one side surfaces as an `only_in_*` entry at
//! that same finer key instead of participating in the code-level
//! comparison.

use crate::aggregate::{batch_reduce, context_reduce, CompareRule, ReductionOutput};
use crate::error::{CoreError, CoreResult};
use crate::model::{filter_rates, CptEntry};
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};

/// Which side of a matched pair has the higher reduced rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    HigherInSource1,
    HigherInSource2,
    Equal,
}

/// A key present on both sides, with both sides' reduced rates.
#[derive(Debug, Clone)]
pub struct MatchedEntry {
    pub key: String,
    pub source1_value: f64,
    pub source2_value: f64,
    pub source1_class: String,
    pub source2_class: String,
    pub difference: f64,
    pub percent_difference: f64,
    pub descriptions_match: bool,
    pub bucket: Bucket,
}

/// A key present on exactly one side, with its representative (scalar
/// reduction) rate.
#[derive(Debug, Clone)]
pub struct OnlyInOneEntry {
    pub key: String,
    pub value: f64,
    pub billing_class: String,
}

/// Full output of a batch comparison.
#[derive(Debug, Clone)]
pub struct ComparisonReport {
    pub rule: CompareRule,
    pub source1_name: String,
    pub source2_name: String,
    pub higher_in_source1: Vec<MatchedEntry>,
    pub higher_in_source2: Vec<MatchedEntry>,
    pub equal: Vec<MatchedEntry>,
    pub only_in_source1: Vec<OnlyInOneEntry>,
    pub only_in_source2: Vec<OnlyInOneEntry>,
    pub total_compared: usize,
    pub total_higher_in_source1_amount: f64,
    pub total_higher_in_source2_amount: f64,
}

impl ComparisonReport {
    pub fn higher_in_source1_count(&self) -> usize {
        self.higher_in_source1.len()
    }

    pub fn higher_in_source2_count(&self) -> usize {
        self.higher_in_source2.len()
    }

    pub fn equal_count(&self) -> usize {
        self.equal.len()
    }
}

pub(crate) fn percent_difference(r1: f64, r2: f64) -> f64 {
    let denom = r1.max(r2);
    if denom == 0.0 {
        0.0
    } else {
        (r1 - r2).abs() / denom * 100.0
    }
}

pub(crate) fn bucket_for(diff: f64) -> Bucket {
    if diff > 0.0 {
        Bucket::HigherInSource1
    } else if diff < 0.0 {
        Bucket::HigherInSource2
    } else {
        Bucket::Equal
    }
}

fn matched_entry(
    key: String,
    source1_value: f64,
    source1_class: String,
    source2_value: f64,
    source2_class: String,
    descriptions_match: bool,
) -> MatchedEntry {
    let difference = source1_value - source2_value;
    MatchedEntry {
        key,
        source1_value,
        source2_value,
        source1_class,
        source2_class,
        difference,
        percent_difference: percent_difference(source1_value, source2_value),
        descriptions_match,
        bucket: bucket_for(difference),
    }
}

fn push_bucketed(report: &mut ComparisonReport, entry: MatchedEntry) {
    match entry.bucket {
        Bucket::HigherInSource1 => {
            report.total_higher_in_source1_amount += entry.difference;
            report.higher_in_source1.push(entry);
        }
        Bucket::HigherInSource2 => {
            report.total_higher_in_source2_amount += -entry.difference;
            report.higher_in_source2.push(entry);
        }
        Bucket::Equal => report.equal.push(entry),
    }
}

/// Extract `(value, billing_class)` from any reduction output, scalar or
/// `max_avg_by_billing_class`. Callers only ever reach for this on a rule
/// that is not `all_classes`/`context`, both of which have their own
/// dedicated code paths below.
pub(crate) fn scalar_value(output: &ReductionOutput) -> (f64, String) {
    match output {
        ReductionOutput::Scalar(s) => (s.value, s.billing_class.clone()),
        ReductionOutput::MaxAvgByClass(m) => (m.value, m.representative_class.clone()),
        ReductionOutput::AllClasses(_) => unreachable!("all_classes has no scalar reduction"),
    }
}

fn reduce_entry(
    rule: CompareRule,
    entry: &CptEntry,
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> CoreResult<ReductionOutput> {
    let filtered = filter_rates(&entry.rates, negotiated_type, exclude_expired, as_of);
    batch_reduce(rule, &filtered)
}

/// Compare two fully loaded sources. `source1`/`source2` are the
/// CPT-code maps already looked up from the `SourceStore`; `source1_name`/
/// `source2_name` are carried through only for the report header.
pub fn compare(
    source1_name: &str,
    source2_name: &str,
    source1: &HashMap<String, CptEntry>,
    source2: &HashMap<String, CptEntry>,
    rule: CompareRule,
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> CoreResult<ComparisonReport> {
    let mut report = ComparisonReport {
        rule,
        source1_name: source1_name.to_string(),
        source2_name: source2_name.to_string(),
        higher_in_source1: Vec::new(),
        higher_in_source2: Vec::new(),
        equal: Vec::new(),
        only_in_source1: Vec::new(),
        only_in_source2: Vec::new(),
        total_compared: 0,
        total_higher_in_source1_amount: 0.0,
        total_higher_in_source2_amount: 0.0,
    };

    match rule {
        CompareRule::AllClasses => {
            compare_all_classes(&mut report, source1, source2, negotiated_type, exclude_expired, as_of)?
        }
        CompareRule::Context => {
            compare_context(&mut report, source1, source2, negotiated_type, exclude_expired, as_of)?
        }
        scalar_rule => compare_scalar(
            &mut report,
            source1,
            source2,
            scalar_rule,
            negotiated_type,
            exclude_expired,
            as_of,
        )?,
    }

    Ok(report)
}

fn compare_scalar(
    report: &mut ComparisonReport,
    source1: &HashMap<String, CptEntry>,
    source2: &HashMap<String, CptEntry>,
    rule: CompareRule,
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> CoreResult<()> {
    let codes: BTreeSet<&String> = source1.keys().chain(source2.keys()).collect();
    for code in codes {
        match (source1.get(code), source2.get(code)) {
            (Some(e1), Some(e2)) => {
                let (v1, c1) = scalar_value(&reduce_entry(rule, e1, negotiated_type, exclude_expired, as_of)?);
                let (v2, c2) = scalar_value(&reduce_entry(rule, e2, negotiated_type, exclude_expired, as_of)?);
                let descriptions_match = e1.description.trim() == e2.description.trim();
                report.total_compared += 1;
                push_bucketed(report, matched_entry(code.clone(), v1, c1, v2, c2, descriptions_match));
            }
            (Some(e1), None) => {
                let (v, c) = scalar_value(&reduce_entry(rule, e1, negotiated_type, exclude_expired, as_of)?);
                report.only_in_source1.push(OnlyInOneEntry {
                    key: code.clone(),
                    value: v,
                    billing_class: c,
                });
            }
            (None, Some(e2)) => {
                let (v, c) = scalar_value(&reduce_entry(rule, e2, negotiated_type, exclude_expired, as_of)?);
                report.only_in_source2.push(OnlyInOneEntry {
                    key: code.clone(),
                    value: v,
                    billing_class: c,
                });
            }
            (None, None) => unreachable!("code came from the union of both key sets"),
        }
    }
    Ok(())
}

pub(crate) fn all_classes_map(
    entry: &CptEntry,
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> CoreResult<HashMap<String, f64>> {
    let output = reduce_entry(CompareRule::AllClasses, entry, negotiated_type, exclude_expired, as_of)?;
    match output {
        ReductionOutput::AllClasses(classes) => Ok(classes.into_iter().map(|(k, v)| (k, v.max)).collect()),
        _ => unreachable!("all_classes rule always reduces to AllClasses"),
    }
}

fn compare_all_classes(
    report: &mut ComparisonReport,
    source1: &HashMap<String, CptEntry>,
    source2: &HashMap<String, CptEntry>,
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> CoreResult<()> {
    let codes: BTreeSet<&String> = source1.keys().chain(source2.keys()).collect();
    for code in codes {
        let classes1 = source1
            .get(code)
            .map(|e| all_classes_map(e, negotiated_type, exclude_expired, as_of))
            .transpose()?
            .unwrap_or_default();
        let classes2 = source2
            .get(code)
            .map(|e| all_classes_map(e, negotiated_type, exclude_expired, as_of))
            .transpose()?
            .unwrap_or_default();

        let class_names: BTreeSet<&String> = classes1.keys().chain(classes2.keys()).collect();
        for class in class_names {
            let key = format!("{code}|{class}");
            match (classes1.get(class), classes2.get(class)) {
                (Some(&v1), Some(&v2)) => {
                    report.total_compared += 1;
                    push_bucketed(
                        report,
                        matched_entry(key, v1, class.clone(), v2, class.clone(), true),
                    );
                }
                (Some(&v1), None) => report.only_in_source1.push(OnlyInOneEntry {
                    key,
                    value: v1,
                    billing_class: class.clone(),
                }),
                (None, Some(&v2)) => report.only_in_source2.push(OnlyInOneEntry {
                    key,
                    value: v2,
                    billing_class: class.clone(),
                }),
                (None, None) => unreachable!("class came from the union of both class sets"),
            }
        }
    }
    Ok(())
}

fn context_map(
    entry: &CptEntry,
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> HashMap<(String, Vec<String>), f64> {
    let filtered = filter_rates(&entry.rates, negotiated_type, exclude_expired, as_of);
    context_reduce(&filtered)
}

fn context_key_str(code: &str, class: &str, modifiers: &[String]) -> String {
    format!("{code}|{class}|{}", modifiers.join(","))
}

fn compare_context(
    report: &mut ComparisonReport,
    source1: &HashMap<String, CptEntry>,
    source2: &HashMap<String, CptEntry>,
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> CoreResult<()> {
    let codes: BTreeSet<&String> = source1.keys().chain(source2.keys()).collect();
    for code in codes {
        let ctx1 = source1
            .get(code)
            .map(|e| context_map(e, negotiated_type, exclude_expired, as_of))
            .unwrap_or_default();
        let ctx2 = source2
            .get(code)
            .map(|e| context_map(e, negotiated_type, exclude_expired, as_of))
            .unwrap_or_default();

        let keys: BTreeSet<&(String, Vec<String>)> = ctx1.keys().chain(ctx2.keys()).collect();
        for (class, modifiers) in keys {
            let key = context_key_str(code, class, modifiers);
            match (ctx1.get(&(class.clone(), modifiers.clone())), ctx2.get(&(class.clone(), modifiers.clone()))) {
                (Some(&v1), Some(&v2)) => {
                    report.total_compared += 1;
                    push_bucketed(
                        report,
                        matched_entry(key, v1, class.clone(), v2, class.clone(), true),
                    );
                }
                (Some(&v1), None) => report.only_in_source1.push(OnlyInOneEntry {
                    key,
                    value: v1,
                    billing_class: class.clone(),
                }),
                (None, Some(&v2)) => report.only_in_source2.push(OnlyInOneEntry {
                    key,
                    value: v2,
                    billing_class: class.clone(),
                }),
                (None, None) => unreachable!("context key came from the union of both context sets"),
            }
        }
    }
    Ok(())
}

/// `compare` requires both sources to already be loaded in the
/// `SourceStore`; this helper translates a missing lookup into the
/// user-visible `MissingSource` error.
pub fn require_sources<'a>(
    source1: Option<&'a HashMap<String, CptEntry>>,
    source2: Option<&'a HashMap<String, CptEntry>>,
    source1_name: &str,
    source2_name: &str,
) -> CoreResult<(&'a HashMap<String, CptEntry>, &'a HashMap<String, CptEntry>)> {
    let s1 = source1.ok_or_else(|| CoreError::MissingSource(source1_name.to_string()))?;
    let s2 = source2.ok_or_else(|| CoreError::MissingSource(source2_name.to_string()))?;
    Ok((s1, s2))
}
