//! Aggregation Engine: compare rules, the P² streaming median estimator,
//! and the tagged [`RuleSummary`] variant each rule updates.
//!
//! Every rule except `median` is computed identically whether the engine
//! sees all of a code's rates at once (batch) or one rate at a time
//! (incremental): [`RuleSummary::update`] is O(1) and commutative over
//! input order, so [`batch_reduce`] simply feeds a full slice through the
//! same summary the incremental comparator updates per part. `median` is
//! the one rule with two distinct implementations by design — exact in
//! batch, P² in incremental — so the fully-loaded case is always exact.

use crate::error::{CoreError, CoreResult};
use crate::model::RateRecord;
use std::collections::HashMap;

/// Canonical lowercase compare-rule tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareRule {
    Max,
    Min,
    Avg,
    Median,
    MaxAvgByBillingClass,
    AllClasses,
    /// External token is `per_occurrence`; renamed internally to avoid
    /// implying per-item granularity survives into comparison (it does
    /// not — see module docs).
    PerCodeHighestOccurrence,
    /// Batch only; rejected by the incremental comparator with `BadRule`.
    Context,
}

impl CompareRule {
    pub fn parse(token: &str) -> CoreResult<Self> {
        match token {
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "avg" => Ok(Self::Avg),
            "median" => Ok(Self::Median),
            "max_avg_by_billing_class" => Ok(Self::MaxAvgByBillingClass),
            "all_classes" => Ok(Self::AllClasses),
            "per_occurrence" => Ok(Self::PerCodeHighestOccurrence),
            "context" => Ok(Self::Context),
            other => Err(CoreError::BadRule(other.to_string())),
        }
    }

    /// External wire token (inverse of `parse`, except the internal rename
    /// for `per_occurrence`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Min => "min",
            Self::Avg => "avg",
            Self::Median => "median",
            Self::MaxAvgByBillingClass => "max_avg_by_billing_class",
            Self::AllClasses => "all_classes",
            Self::PerCodeHighestOccurrence => "per_occurrence",
            Self::Context => "context",
        }
    }

    /// Rules whose per-code output is a single `(value, class, count)` —
    /// everything except the two multi-valued rules.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::AllClasses | Self::Context)
    }
}

/// Output of a scalar rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarResult {
    pub value: f64,
    pub billing_class: String,
    pub count: u64,
}

impl ScalarResult {
    fn empty() -> Self {
        Self {
            value: 0.0,
            billing_class: "unknown".to_string(),
            count: 0,
        }
    }
}

/// Running per-class aggregate used by `max_avg_by_billing_class`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassAgg {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

impl ClassAgg {
    fn update(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Running per-class max used by `all_classes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassMax {
    pub max: f64,
    pub count: u64,
}

/// Result of `max_avg_by_billing_class`.
#[derive(Debug, Clone)]
pub struct MaxAvgByClassResult {
    pub value: f64,
    pub representative_class: String,
    pub per_class: HashMap<String, ClassAgg>,
}

/// Result of a non-scalar reduction (`all_classes`).
pub type AllClassesResult = HashMap<String, ClassMax>;

/// Output of [`batch_reduce`] / a finalized [`RuleSummary`].
#[derive(Debug, Clone)]
pub enum ReductionOutput {
    Scalar(ScalarResult),
    MaxAvgByClass(MaxAvgByClassResult),
    AllClasses(AllClassesResult),
}

impl ReductionOutput {
    /// Panics if called on a non-scalar output; callers only reach for
    /// this after checking `CompareRule::is_scalar`.
    pub fn as_scalar(&self) -> &ScalarResult {
        match self {
            Self::Scalar(s) => s,
            _ => unreachable!("as_scalar called on a non-scalar reduction output"),
        }
    }
}

/// Rule-specific O(1) running summary, a tagged variant instead of a
/// loosely-typed record. Used directly by the incremental comparator, and
/// internally by [`batch_reduce`] for every rule but `median`.
#[derive(Debug, Clone)]
pub enum RuleSummary {
    Max { value: f64, class: String, count: u64 },
    Min { value: f64, class: String, count: u64 },
    Avg { sum: f64, count: u64 },
    Median { p2: P2Quantile },
    MaxAvgByBillingClass { classes: HashMap<String, ClassAgg> },
    AllClasses { classes: HashMap<String, ClassMax> },
    /// Numerically identical to `Max`: the per-item highest occurrence
    /// folded across items is just a running max over every admitted
    /// rate, since max is associative regardless of which item a value
    /// came from.
    PerOccurrence { value: f64, class: String, count: u64 },
}

impl RuleSummary {
    pub fn new(rule: CompareRule) -> Self {
        match rule {
            CompareRule::Max => Self::Max {
                value: f64::NEG_INFINITY,
                class: "unknown".to_string(),
                count: 0,
            },
            CompareRule::Min => Self::Min {
                value: f64::INFINITY,
                class: "unknown".to_string(),
                count: 0,
            },
            CompareRule::Avg => Self::Avg { sum: 0.0, count: 0 },
            CompareRule::Median => Self::Median { p2: P2Quantile::new() },
            CompareRule::MaxAvgByBillingClass => Self::MaxAvgByBillingClass {
                classes: HashMap::new(),
            },
            CompareRule::AllClasses => Self::AllClasses {
                classes: HashMap::new(),
            },
            CompareRule::PerCodeHighestOccurrence => Self::PerOccurrence {
                value: f64::NEG_INFINITY,
                class: "unknown".to_string(),
                count: 0,
            },
            CompareRule::Context => unreachable!("context has no streaming summary; batch only"),
        }
    }

    /// Admit one rate into the summary. Non-finite rates are ignored
    /// entirely and never change `count`.
    pub fn update(&mut self, rate: &RateRecord) {
        if !rate.is_finite() {
            return;
        }
        let v = rate.negotiated_rate;
        let class = rate.normalized_class();
        match self {
            Self::Max { value, class: c, count } | Self::PerOccurrence { value, class: c, count } => {
                *count += 1;
                if v > *value {
                    *value = v;
                    *c = class.to_string();
                }
            }
            Self::Min { value, class: c, count } => {
                *count += 1;
                if v < *value {
                    *value = v;
                    *c = class.to_string();
                }
            }
            Self::Avg { sum, count } => {
                *sum += v;
                *count += 1;
            }
            Self::Median { p2 } => p2.update(v),
            Self::MaxAvgByBillingClass { classes } => {
                classes.entry(class.to_string()).or_default().update(v);
            }
            Self::AllClasses { classes } => {
                let entry = classes.entry(class.to_string()).or_default();
                entry.count += 1;
                if v > entry.max || entry.count == 1 {
                    entry.max = v;
                }
            }
        }
    }

    /// Collapse the summary into its output. `all_classes` is multi-valued
    /// and has its own accessor; calling `finalize` on it still returns a
    /// `ReductionOutput::AllClasses`, so callers branch on the shape, not
    /// the rule, when they already hold a summary.
    pub fn finalize(&self) -> ReductionOutput {
        match self {
            Self::Max { value, class, count } | Self::PerOccurrence { value, class, count } => {
                if *count == 0 {
                    ReductionOutput::Scalar(ScalarResult::empty())
                } else {
                    ReductionOutput::Scalar(ScalarResult {
                        value: *value,
                        billing_class: class.clone(),
                        count: *count,
                    })
                }
            }
            Self::Min { value, class, count } => {
                if *count == 0 {
                    ReductionOutput::Scalar(ScalarResult::empty())
                } else {
                    ReductionOutput::Scalar(ScalarResult {
                        value: *value,
                        billing_class: class.clone(),
                        count: *count,
                    })
                }
            }
            Self::Avg { sum, count } => {
                let value = if *count == 0 { 0.0 } else { sum / *count as f64 };
                ReductionOutput::Scalar(ScalarResult {
                    value,
                    billing_class: "unknown".to_string(),
                    count: *count,
                })
            }
            Self::Median { p2 } => ReductionOutput::Scalar(ScalarResult {
                value: p2.estimate(),
                billing_class: "unknown".to_string(),
                count: p2.count(),
            }),
            Self::MaxAvgByBillingClass { classes } => {
                ReductionOutput::MaxAvgByClass(finalize_max_avg_by_class(classes))
            }
            Self::AllClasses { classes } => ReductionOutput::AllClasses(classes.clone()),
        }
    }
}

fn finalize_max_avg_by_class(classes: &HashMap<String, ClassAgg>) -> MaxAvgByClassResult {
    let non_unknown = classes
        .iter()
        .filter(|(name, _)| name.as_str() != "unknown")
        .max_by(|(_, a), (_, b)| a.avg().total_cmp(&b.avg()));

    let (representative_class, value) = match non_unknown {
        Some((name, agg)) => (name.clone(), agg.avg()),
        None => match classes.get("unknown") {
            Some(agg) => ("unknown".to_string(), agg.avg()),
            None => ("unknown".to_string(), 0.0),
        },
    };

    MaxAvgByClassResult {
        value,
        representative_class,
        per_class: classes.clone(),
    }
}

/// Reduce a full, already-filtered slice of rates under `rule`, exact in
/// every case (median uses an exact sort-based computation here, not the
/// P² estimator — see module docs).
pub fn batch_reduce(rule: CompareRule, rates: &[&RateRecord]) -> CoreResult<ReductionOutput> {
    match rule {
        CompareRule::Context => Err(CoreError::BadRule(
            "context has no scalar/all-classes reduction; use context_reduce".to_string(),
        )),
        CompareRule::Median => Ok(ReductionOutput::Scalar(exact_median(rates))),
        other => {
            let mut summary = RuleSummary::new(other);
            for r in rates {
                summary.update(r);
            }
            Ok(summary.finalize())
        }
    }
}

fn exact_median(rates: &[&RateRecord]) -> ScalarResult {
    let mut values: Vec<f64> = rates.iter().filter(|r| r.is_finite()).map(|r| r.negotiated_rate).collect();
    if values.is_empty() {
        return ScalarResult::empty();
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    let median = if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    };
    ScalarResult {
        value: median,
        billing_class: "unknown".to_string(),
        count: n as u64,
    }
}

/// `context` rule (batch only): key is `(billing_class, sorted modifier
/// set)`, value is the max rate observed for that key.
pub fn context_reduce(rates: &[&RateRecord]) -> HashMap<(String, Vec<String>), f64> {
    let mut out: HashMap<(String, Vec<String>), f64> = HashMap::new();
    for r in rates {
        if !r.is_finite() {
            continue;
        }
        let key = (r.normalized_class().to_string(), r.modifier_key());
        out.entry(key)
            .and_modify(|m| *m = m.max(r.negotiated_rate))
            .or_insert(r.negotiated_rate);
    }
    out
}

/// P² (piecewise-parabolic) streaming quantile estimator, hardcoded for
/// the median (q = 0.5). O(1) memory: five markers regardless of stream
/// length.
#[derive(Debug, Clone)]
pub struct P2Quantile {
    initial: Vec<f64>,
    initialized: bool,
    q: [f64; 5],
    n: [i64; 5],
    n_hat: [f64; 5],
    dn: [f64; 5],
    count: u64,
}

impl P2Quantile {
    pub fn new() -> Self {
        Self {
            initial: Vec::with_capacity(5),
            initialized: false,
            q: [0.0; 5],
            n: [1, 2, 3, 4, 5],
            n_hat: [1.0, 2.0, 3.0, 4.0, 5.0],
            dn: [0.0, 0.25, 0.5, 0.75, 1.0],
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn update(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        self.count += 1;

        if !self.initialized {
            self.initial.push(x);
            if self.initial.len() == 5 {
                self.initial.sort_by(|a, b| a.total_cmp(b));
                for i in 0..5 {
                    self.q[i] = self.initial[i];
                }
                self.initialized = true;
            }
            return;
        }

        // 1. Find cell k (0-based index of the marker immediately left of
        // x) and bump the position of every marker to its right.
        let k = if x < self.q[0] {
            self.q[0] = x;
            0
        } else if x >= self.q[4] {
            self.q[4] = x;
            3
        } else {
            let mut k = 0;
            for i in 0..4 {
                if self.q[i] <= x && x < self.q[i + 1] {
                    k = i;
                    break;
                }
            }
            k
        };
        for i in (k + 1)..5 {
            self.n[i] += 1;
        }

        // 2. Desired positions advance by their fixed increments.
        for i in 0..5 {
            self.n_hat[i] += self.dn[i];
        }

        // 3. Adjust interior markers (indices 1..=3).
        for i in 1..4 {
            let d = self.n_hat[i] - self.n[i] as f64;
            let right_gap = self.n[i + 1] - self.n[i];
            let left_gap = self.n[i - 1] - self.n[i];
            if (d >= 1.0 && right_gap > 1) || (d <= -1.0 && left_gap < -1) {
                let d_sign: i64 = if d >= 0.0 { 1 } else { -1 };
                let parabolic = self.parabolic(i, d_sign);
                let new_q = if parabolic.is_finite() && self.q[i - 1] < parabolic && parabolic < self.q[i + 1] {
                    parabolic
                } else {
                    self.linear(i, d_sign)
                };
                self.q[i] = new_q;
                self.n[i] += d_sign;
            }
        }
    }

    fn parabolic(&self, i: usize, d: i64) -> f64 {
        let d = d as f64;
        let n_im1 = self.n[i - 1] as f64;
        let n_i = self.n[i] as f64;
        let n_ip1 = self.n[i + 1] as f64;
        let q_im1 = self.q[i - 1];
        let q_i = self.q[i];
        let q_ip1 = self.q[i + 1];

        q_i + d / (n_ip1 - n_im1)
            * ((n_i - n_im1 + d) * (q_ip1 - q_i) / (n_ip1 - n_i)
                + (n_ip1 - n_i - d) * (q_i - q_im1) / (n_i - n_im1))
    }

    fn linear(&self, i: usize, d: i64) -> f64 {
        let j = (i as i64 + d) as usize;
        let q_i = self.q[i];
        let q_j = self.q[j];
        let n_i = self.n[i] as f64;
        let n_j = self.n[j] as f64;
        q_i + (d as f64) * (q_j - q_i) / (n_j - n_i)
    }

    /// Current median estimate. Before five observations have arrived,
    /// this is the exact median of whatever has been seen so far.
    pub fn estimate(&self) -> f64 {
        if self.initialized {
            self.q[2]
        } else if self.initial.is_empty() {
            0.0
        } else {
            let mut sorted = self.initial.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let n = sorted.len();
            if n % 2 == 1 {
                sorted[n / 2]
            } else {
                (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
            }
        }
    }
}

impl Default for P2Quantile {
    fn default() -> Self {
        Self::new()
    }
}
