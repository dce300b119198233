//! Measurements: named, timestamped, tagged values produced by agents.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The value carried by a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    /// A signed integer reading (counters, deltas).
    Int(i64),
    /// A floating point reading (gauges, rates).
    Float(f64),
    /// An opaque payload whose encoding the pipeline does not interpret.
    Bytes(Vec<u8>),
}

/// How two pending values for the same key are merged before a flush.
///
/// The merge operation is a pluggable contract carried by the measurement
/// itself rather than hard-coded into the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Keep the most recently submitted value.
    Replace,
    /// Add the newer numeric value to the older one.
    Sum,
    /// Keep the smaller numeric value.
    Min,
    /// Keep the larger numeric value.
    Max,
}

impl MergePolicy {
    /// Merge `newer` with `older`, newer value having been submitted last.
    ///
    /// Numeric policies on mismatched or opaque values fall back to keeping
    /// the newer value rather than failing the submission.
    pub fn merge(&self, newer: MetricValue, older: MetricValue) -> MetricValue {
        use MetricValue::*;
        match self {
            MergePolicy::Replace => newer,
            MergePolicy::Sum => match (newer, older) {
                (Int(a), Int(b)) => Int(a.saturating_add(b)),
                (Float(a), Float(b)) => Float(a + b),
                (n, _) => n,
            },
            MergePolicy::Min => match (newer, older) {
                (Int(a), Int(b)) => Int(a.min(b)),
                (Float(a), Float(b)) => Float(a.min(b)),
                (n, _) => n,
            },
            MergePolicy::Max => match (newer, older) {
                (Int(a), Int(b)) => Int(a.max(b)),
                (Float(a), Float(b)) => Float(a.max(b)),
                (n, _) => n,
            },
        }
    }
}

/// A single named, timestamped, tagged reading.
///
/// The key is derived from the name and the full tag set, so two readings
/// with the same name but different tags never conflate with each other.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    key: String,
    name: String,
    value: MetricValue,
    timestamp_ms: i64,
    tags: BTreeMap<String, String>,
    merge_policy: MergePolicy,
}

impl Measurement {
    /// Start building a measurement with the given name and value.
    pub fn builder(name: impl Into<String>, value: MetricValue) -> MeasurementBuilder {
        MeasurementBuilder {
            name: name.into(),
            value,
            timestamp_ms: None,
            tags: BTreeMap::new(),
            merge_policy: MergePolicy::Replace,
        }
    }

    /// The identity key: name plus full tag set.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The metric name without tags.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The carried value.
    pub fn value(&self) -> &MetricValue {
        &self.value
    }

    /// Epoch millisecond timestamp of the reading.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// The tag set.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// The merge policy applied when this measurement conflates.
    pub fn merge_policy(&self) -> MergePolicy {
        self.merge_policy
    }

    /// Merge this (newer) measurement with a previously buffered one for the
    /// same key. The merged value follows this measurement's policy; the
    /// timestamp is the latest of the two.
    pub fn conflate_with(self, older: Measurement) -> Measurement {
        let timestamp_ms = self.timestamp_ms.max(older.timestamp_ms);
        let value = self.merge_policy.merge(self.value, older.value);
        Measurement {
            key: self.key,
            name: self.name,
            value,
            timestamp_ms,
            tags: self.tags,
            merge_policy: self.merge_policy,
        }
    }
}

/// Per-call builder for measurements.
///
/// Returned fresh per call so no shared mutable scratch state is needed.
#[derive(Debug)]
pub struct MeasurementBuilder {
    name: String,
    value: MetricValue,
    timestamp_ms: Option<i64>,
    tags: BTreeMap<String, String>,
    merge_policy: MergePolicy,
}

impl MeasurementBuilder {
    /// Attach a tag. Tags participate in the identity key.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp (epoch ms). Defaults to now.
    pub fn timestamp_ms(mut self, ts: i64) -> Self {
        self.timestamp_ms = Some(ts);
        self
    }

    /// Set the merge policy used during conflation. Defaults to Replace.
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Build the immutable measurement, deriving its identity key.
    pub fn build(self) -> Measurement {
        let key = derive_key(&self.name, &self.tags);
        let timestamp_ms = self.timestamp_ms.unwrap_or_else(now_ms);
        Measurement {
            key,
            name: self.name,
            value: self.value,
            timestamp_ms,
            tags: self.tags,
            merge_policy: self.merge_policy,
        }
    }
}

/// Derive the fully qualified key from a name and its tag set.
///
/// Tags are sorted (BTreeMap iteration order), so the same logical identity
/// always derives the same key.
fn derive_key(name: &str, tags: &BTreeMap<String, String>) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut key = String::with_capacity(name.len() + 16 * tags.len());
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in tags.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key.push('}');
    key
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
