//! Admission gate state machine.

/// Admission state of the throttle gate.
///
/// The gate moves to `Throttled` only on an explicit congestion signal from
/// the downstream sink, and back to `Open` only once the reprocessing
/// backlog has drained for a full poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Admitting: writes are forwarded to the sink immediately.
    Open,
    /// Blocking new admissions up to the drop timeout; writes that outwait
    /// the timeout are counted drops.
    Throttled,
}

impl GateState {
    /// Human-readable state name for logging/metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Throttled => "throttled",
        }
    }
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admitted {
    /// Forwarded to the sink.
    Sent,
    /// The sink signalled congestion; the write entered the reprocessing
    /// queue for bounded replay.
    Queued,
    /// The write was dropped and counted (timeout, full replay queue,
    /// shutdown, or a non-congestion sink failure).
    Dropped,
}
