//! Request/response correlation over an asynchronous transport, and the
//! heartbeat liveness monitor built on top of it.

pub mod heartbeat;
pub mod table;

pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatStats};
pub use table::{CorrelationTable, PendingOp};
