//! The rate data model: [`RateRecord`], [`CptEntry`], [`Source`], and the
//! sole filter primitive used against MRF negotiated-rate data.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A single negotiated price line.
///
/// `negotiated_rate` may be non-finite (`NaN`/`inf`) if it was coerced from
/// a malformed or missing source value; reductions must treat non-finite
/// values as "no value" and never let them bias a count or sum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateRecord {
    pub negotiated_rate: f64,
    pub billing_class: String,
    pub billing_code_modifier: Vec<String>,
    pub service_code: Vec<String>,
    pub negotiated_type: String,
    pub expiration_date: Option<NaiveDate>,
}

impl RateRecord {
    /// `negotiated_rate` is usable in a reduction.
    pub fn is_finite(&self) -> bool {
        self.negotiated_rate.is_finite()
    }

    /// Billing class normalized for grouping: empty/missing becomes `"unknown"`.
    pub fn normalized_class(&self) -> &str {
        if self.billing_class.trim().is_empty() {
            "unknown"
        } else {
            self.billing_class.as_str()
        }
    }

    /// Lowercased negotiated type, for case-insensitive matching.
    pub fn negotiated_type_lower(&self) -> String {
        self.negotiated_type.to_lowercase()
    }

    /// Frozen, sorted, deduplicated modifier set, used as half of the
    /// `context` rule's key.
    pub fn modifier_key(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.billing_code_modifier.iter().map(String::as_str).collect();
        set.into_iter().map(str::to_string).collect()
    }
}

/// One CPT code's accumulated state within a [`Source`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CptEntry {
    pub description: String,
    pub rates: Vec<RateRecord>,
}

impl CptEntry {
    /// `true` when `description` is empty or the literal placeholder used
    /// by the CSV/Excel adapters and the original MRF ingester.
    fn description_is_placeholder(desc: &str) -> bool {
        let trimmed = desc.trim();
        trimmed.is_empty() || trimmed == "No description"
    }

    /// Insert-or-merge: the description upgrades once a non-placeholder
    /// value is seen and never regresses; rates append, never dedupe.
    pub fn merge(&mut self, description: &str, new_rates: impl IntoIterator<Item = RateRecord>) {
        if Self::description_is_placeholder(&self.description) && !Self::description_is_placeholder(description) {
            self.description = description.to_string();
        } else if self.description.is_empty() {
            self.description = description.to_string();
        }
        self.rates.extend(new_rates);
    }
}

/// Named mapping `cpt_code -> CptEntry`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub entries: HashMap<String, CptEntry>,
}

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    /// Insert-or-merge a CPT code's description and rates.
    pub fn upsert(&mut self, code: &str, description: &str, rates: impl IntoIterator<Item = RateRecord>) {
        let code = code.trim();
        if code.is_empty() {
            return;
        }
        self.entries
            .entry(code.to_string())
            .or_default()
            .merge(description, rates);
    }
}

/// Filter primitive: the sole place negotiated-type and expiration
/// filtering happen.
pub fn filter_rates<'a>(
    rates: &'a [RateRecord],
    negotiated_type: Option<&str>,
    exclude_expired: bool,
    as_of: NaiveDate,
) -> Vec<&'a RateRecord> {
    rates
        .iter()
        .filter(|r| match negotiated_type {
            Some(nt) if !nt.is_empty() => r.negotiated_type_lower() == nt.to_lowercase(),
            _ => true,
        })
        .filter(|r| {
            if !exclude_expired {
                return true;
            }
            match r.expiration_date {
                Some(exp) => exp >= as_of,
                None => true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(rate: f64, class: &str, ntype: &str, exp: Option<&str>) -> RateRecord {
        RateRecord {
            negotiated_rate: rate,
            billing_class: class.to_string(),
            billing_code_modifier: vec![],
            service_code: vec![],
            negotiated_type: ntype.to_string(),
            expiration_date: exp.map(|s| s.parse().unwrap()),
        }
    }

    #[test]
    fn unknown_class_normalization() {
        let r = rate(1.0, "", "negotiated", None);
        assert_eq!(r.normalized_class(), "unknown");
        let r = rate(1.0, "   ", "negotiated", None);
        assert_eq!(r.normalized_class(), "unknown");
    }

    #[test]
    fn merge_upgrades_description_once() {
        let mut entry = CptEntry::default();
        entry.merge("No description", vec![]);
        assert_eq!(entry.description, "No description");
        entry.merge("Office visit", vec![]);
        assert_eq!(entry.description, "Office visit");
        entry.merge("", vec![]);
        assert_eq!(entry.description, "Office visit");
        entry.merge("No description", vec![]);
        assert_eq!(entry.description, "Office visit");
    }

    #[test]
    fn merge_never_dedupes_rates() {
        let mut entry = CptEntry::default();
        let r = rate(100.0, "professional", "negotiated", None);
        entry.merge("x", vec![r.clone()]);
        entry.merge("x", vec![r]);
        assert_eq!(entry.rates.len(), 2);
    }

    #[test]
    fn filter_by_negotiated_type_is_case_insensitive() {
        let rates = vec![rate(10.0, "p", "Negotiated", None), rate(20.0, "p", "fee schedule", None)];
        let filtered = filter_rates(&rates, Some("negotiated"), false, "2025-01-01".parse().unwrap());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].negotiated_rate, 10.0);
    }

    #[test]
    fn exclude_expired_keeps_missing_and_future_dates() {
        let as_of: NaiveDate = "2025-01-01".parse().unwrap();
        let rates = vec![
            rate(1.0, "p", "n", Some("2024-12-31")),
            rate(2.0, "p", "n", Some("2025-01-01")),
            rate(3.0, "p", "n", None),
        ];
        let filtered = filter_rates(&rates, None, true, as_of);
        let vals: Vec<f64> = filtered.iter().map(|r| r.negotiated_rate).collect();
        assert_eq!(vals, vec![2.0, 3.0]);
    }

    #[test]
    fn source_upsert_trims_and_ignores_empty_codes() {
        let mut s = Source::new("a");
        s.upsert("  99213  ", "visit", vec![]);
        s.upsert("", "ignored", vec![]);
        assert!(s.entries.contains_key("99213"));
        assert_eq!(s.entries.len(), 1);
    }
}
