//! Accumulation stage: dual-trigger flushing with optional per-key conflation.
//!
//! Two buffering strategies share the same size/time trigger semantics:
//! [`FlushQueue`] keeps every added item, [`ConflatingAccumulator`] keeps at
//! most one pending value per key, merging repeated updates before they are
//! ever sent.

pub mod conflating;
pub mod flush_queue;

pub use conflating::{AccumulatorStats, Conflate, ConflatingAccumulator};
pub use flush_queue::{FlushQueue, FlushQueueStats, FlushReceiver};
