pub mod accumulator;
pub mod config;
pub mod correlation;
mod error;
pub mod events;
pub mod gate;
pub mod model;
pub mod pipeline;
pub mod sink;
pub mod transport;

pub use accumulator::{ConflatingAccumulator, FlushQueue, FlushReceiver};
pub use config::{RelayConfig, RelayConfigBuilder};
pub use correlation::{CorrelationTable, HeartbeatConfig, HeartbeatMonitor, PendingOp};
pub use error::RelayError;
pub use events::RelayEvent;
pub use gate::{Admitted, AdmissionGate, GateState, GateStats};
pub use model::{Batch, Measurement, MeasurementBuilder, MergePolicy, MetricValue};
pub use pipeline::{MetricRelay, RelayStats};
pub use sink::{Sink, SinkError};
pub use transport::Transport;
