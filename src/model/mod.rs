//! Data model: measurements, merge policies and batches.

pub mod batch;
pub mod measurement;

pub use batch::Batch;
pub use measurement::{Measurement, MeasurementBuilder, MergePolicy, MetricValue};
