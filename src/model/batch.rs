//! Batches: the unit handed to a downstream sink.

use serde::{Deserialize, Serialize};

use super::measurement::Measurement;

/// A set of measurements collected between two flush events.
///
/// A batch is owned exclusively by the flush cycle that produced it and is
/// never mutated after being handed to the sink. Ordering across keys is not
/// meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    measurements: Vec<Measurement>,
    created_at_ms: i64,
}

impl Batch {
    /// Wrap a set of flushed measurements into a batch.
    pub fn new(measurements: Vec<Measurement>) -> Self {
        Self {
            measurements,
            created_at_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    /// Number of measurements in the batch.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Whether the batch carries no measurements.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Epoch millisecond timestamp of the flush that produced this batch.
    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    /// Iterate over the contained measurements.
    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.measurements.iter()
    }

    /// Consume the batch, yielding its measurements.
    pub fn into_measurements(self) -> Vec<Measurement> {
        self.measurements
    }
}

impl IntoIterator for Batch {
    type Item = Measurement;
    type IntoIter = std::vec::IntoIter<Measurement>;

    fn into_iter(self) -> Self::IntoIter {
        self.measurements.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::measurement::MetricValue;

    #[test]
    fn test_batch_wraps_measurements() {
        let batch = Batch::new(vec![
            Measurement::builder("a", MetricValue::Int(1)).build(),
            Measurement::builder("b", MetricValue::Int(2)).build(),
        ]);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert!(batch.created_at_ms() > 0);
    }

    #[test]
    fn test_into_measurements() {
        let batch = Batch::new(vec![Measurement::builder("a", MetricValue::Int(1)).build()]);
        let ms = batch.into_measurements();
        assert_eq!(ms.len(), 1);
        assert_eq!(ms[0].key(), "a");
    }
}
