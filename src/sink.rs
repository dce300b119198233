//! Downstream sink contract.
//!
//! The pipeline does not define a wire format; it hands finished writes to a
//! sink (network transport, storage client) and reacts to the overload signal
//! the sink reports back.

use async_trait::async_trait;
use thiserror::Error;

/// Failure modes of a downstream send.
#[derive(Debug, Error)]
pub enum SinkError<W> {
    /// The downstream cannot keep up. The rejected write is handed back so
    /// the admission gate can queue it for bounded replay. This is the only
    /// signal that opens the throttle gate.
    #[error("downstream congested")]
    Congested { rejected: W },

    /// Any other downstream failure. Counted and logged, never throttles.
    #[error("sink failure: {0}")]
    Failed(String),
}

/// A destination that accepts writes and may signal overload.
#[async_trait]
pub trait Sink<W>: Send + Sync + 'static {
    /// Deliver one write downstream.
    async fn send(&self, write: W) -> Result<(), SinkError<W>>;
}
