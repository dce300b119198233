//! Correlated message transport contract.

use async_trait::async_trait;

use crate::error::RelayError;

/// An asynchronous transport carrying correlated request/response messages.
///
/// Outbound messages are tagged with a caller-chosen correlation key; the
/// host environment drives inbound responses into
/// [`CorrelationTable::resolve`](crate::correlation::CorrelationTable::resolve)
/// with the same key.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a payload tagged with the given correlation key.
    async fn send_correlated(&self, key: &str, payload: &[u8]) -> Result<(), RelayError>;
}
