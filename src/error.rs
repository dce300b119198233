use thiserror::Error;

/// Errors surfaced by the relay pipeline.
///
/// Everything here is local and recoverable: capacity problems are reported
/// through counters, timeouts are typed results, and nothing in this crate
/// terminates the process.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("operation timed out")]
    Timeout,

    #[error("internal channel closed")]
    ChannelClosed,

    #[error("component has been shut down")]
    Shutdown,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("downstream sink failure: {0}")]
    Sink(String),
}
