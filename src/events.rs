//! Typed pipeline events for observability collaborators.
//!
//! Throttle and connectivity transitions are broadcast on a channel that any
//! subscriber (metrics exporter, structured logs, pub/sub bridge) can listen
//! on. Each transition is emitted exactly once.

use tokio::sync::broadcast;

/// Default capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A state transition observable from outside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// The admission gate moved from Open to Throttled.
    ThrottlingStarted,
    /// The admission gate moved from Throttled back to Open.
    ThrottlingEnded,
    /// The heartbeat monitor confirmed connectivity after being disconnected.
    Connected,
    /// The heartbeat monitor gave up after consecutive probe timeouts.
    Disconnected,
}

/// Create the event channel shared by the gate and the heartbeat monitor.
pub fn channel() -> (broadcast::Sender<RelayEvent>, broadcast::Receiver<RelayEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
