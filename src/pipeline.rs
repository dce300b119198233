//! The assembled relay: accumulation, admission control and liveness wired
//! together behind one producer-facing handle.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use crate::accumulator::{
    AccumulatorStats, ConflatingAccumulator, FlushQueue, FlushQueueStats, FlushReceiver,
};
use crate::config::RelayConfig;
use crate::correlation::{CorrelationTable, HeartbeatConfig, HeartbeatMonitor, HeartbeatStats};
use crate::error::RelayError;
use crate::events::{self, RelayEvent};
use crate::gate::{AdmissionGate, GateState, GateStats};
use crate::model::{Batch, Measurement};
use crate::sink::Sink;
use crate::transport::Transport;

/// Aggregated counter snapshot across the pipeline.
#[derive(Debug, Default, Clone)]
pub struct RelayStats {
    /// Present when conflation is enabled.
    pub accumulator: Option<AccumulatorStats>,
    /// Present when conflation is disabled (plain flush queue).
    pub flush_queue: Option<FlushQueueStats>,
    pub gate: GateStats,
    /// Present when a transport was supplied.
    pub heartbeat: Option<HeartbeatStats>,
    pub correlation_pending: usize,
    pub correlation_timeouts: u64,
}

/// Hands flushed working sets to the admission gate as immutable batches.
struct GateReceiver {
    gate: Arc<AdmissionGate<Batch>>,
}

#[async_trait]
impl FlushReceiver<Measurement> for GateReceiver {
    async fn flush(&self, items: Vec<Measurement>) -> Result<(), RelayError> {
        // Admission outcomes (sent/queued/dropped) are counted by the gate;
        // the flush itself has done its job either way.
        self.gate.admit(Batch::new(items)).await;
        Ok(())
    }
}

enum Stage {
    Conflating(ConflatingAccumulator<Measurement>),
    Plain(FlushQueue<Measurement>),
}

/// Producer-facing relay handle.
///
/// Measurements submitted here are conflated by key (or plainly buffered
/// when conflation is disabled), released as batches on size or time
/// triggers, and admitted to the sink through the throttle gate. When a
/// transport is supplied, a heartbeat monitor keeps the connectivity flag
/// current. Producers never block on I/O; at worst they wait briefly on a
/// throttled gate inside the flush worker, never in `submit` itself.
pub struct MetricRelay {
    stage: Stage,
    gate: Arc<AdmissionGate<Batch>>,
    table: CorrelationTable,
    heartbeat: Option<HeartbeatMonitor>,
    events: broadcast::Sender<RelayEvent>,
}

impl MetricRelay {
    /// Build a relay without liveness monitoring.
    pub fn new(config: RelayConfig, sink: Arc<dyn Sink<Batch>>) -> Self {
        Self::with_transport(config, sink, None)
    }

    /// Build a relay; with a transport, the heartbeat monitor starts too.
    /// Must be called within a tokio runtime.
    pub fn with_transport(
        config: RelayConfig,
        sink: Arc<dyn Sink<Batch>>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        let (events, _) = events::channel();
        let gate = Arc::new(AdmissionGate::new(
            sink,
            config.drop_timeout_ms,
            config.reprocess_capacity,
            config.reprocess_poll_ms,
            events.clone(),
        ));
        let receiver: Arc<dyn FlushReceiver<Measurement>> = Arc::new(GateReceiver {
            gate: Arc::clone(&gate),
        });
        let stage = if config.conflation_enabled {
            Stage::Conflating(ConflatingAccumulator::new(
                "relay",
                config.size_trigger,
                config.time_trigger_ms,
                receiver,
            ))
        } else {
            Stage::Plain(FlushQueue::new(
                "relay",
                config.size_trigger,
                config.time_trigger_ms,
                receiver,
            ))
        };
        let table = CorrelationTable::with_sweep_interval(config.sweep_interval_ms);
        let heartbeat = transport.map(|transport| {
            HeartbeatMonitor::start(
                HeartbeatConfig {
                    period_ms: config.heartbeat_period_ms,
                    timeout_ms: config.heartbeat_timeout_ms,
                    disconnect_trigger: config.heartbeat_disconnect_trigger,
                    host: config.host.clone(),
                    agent: config.agent.clone(),
                },
                transport,
                table.clone(),
                events.clone(),
            )
        });
        info!(
            conflation = config.conflation_enabled,
            size_trigger = config.size_trigger,
            time_trigger_ms = config.time_trigger_ms,
            "metric relay started"
        );
        Self {
            stage,
            gate,
            table,
            heartbeat,
            events,
        }
    }

    /// Submit one measurement into the pipeline. Returns false if the
    /// buffering stage rejected it (shutdown or counted overflow).
    pub fn submit(&self, measurement: Measurement) -> bool {
        match &self.stage {
            Stage::Conflating(acc) => acc.submit(measurement),
            Stage::Plain(queue) => queue.add(measurement),
        }
    }

    /// Force a flush of whatever has accumulated.
    pub async fn flush_now(&self) {
        match &self.stage {
            Stage::Conflating(acc) => acc.flush_now().await,
            Stage::Plain(queue) => queue.flush_now().await,
        }
    }

    /// Subscribe to throttle and connectivity transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Drive an inbound correlated response into the table. The host's
    /// transport reader calls this for every received message.
    pub fn resolve(&self, key: &str, payload: Vec<u8>) -> bool {
        self.table.resolve(key, payload)
    }

    /// The correlation table, for callers doing their own
    /// register-send-await round trips over the transport.
    pub fn correlation(&self) -> &CorrelationTable {
        &self.table
    }

    /// Current admission gate state.
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// Connectivity flag; true when no heartbeat monitor is running.
    pub fn is_connected(&self) -> bool {
        self.heartbeat.as_ref().map_or(true, |hb| hb.is_connected())
    }

    /// Aggregated counter snapshot.
    pub fn stats(&self) -> RelayStats {
        let (accumulator, flush_queue) = match &self.stage {
            Stage::Conflating(acc) => (Some(acc.stats()), None),
            Stage::Plain(queue) => (None, Some(queue.stats())),
        };
        RelayStats {
            accumulator,
            flush_queue,
            gate: self.gate.stats(),
            heartbeat: self.heartbeat.as_ref().map(|hb| hb.stats()),
            correlation_pending: self.table.pending(),
            correlation_timeouts: self.table.timeout_count(),
        }
    }

    /// Tear down every periodic task. Buffered measurements are discarded
    /// and blocked admitters wake with a dropped result.
    pub fn shutdown(&self) {
        match &self.stage {
            Stage::Conflating(acc) => acc.shutdown(),
            Stage::Plain(queue) => queue.shutdown(),
        }
        self.gate.shutdown();
        if let Some(hb) = &self.heartbeat {
            hb.shutdown();
        }
        self.table.shutdown();
        info!("metric relay shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MergePolicy, MetricValue};
    use crate::sink::SinkError;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct CollectingSink {
        tx: mpsc::UnboundedSender<Batch>,
    }

    #[async_trait]
    impl Sink<Batch> for CollectingSink {
        async fn send(&self, batch: Batch) -> Result<(), SinkError<Batch>> {
            self.tx
                .send(batch)
                .map_err(|e| SinkError::Failed(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_submit_conflate_flush_to_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RelayConfig::builder()
            .size_trigger(2)
            .time_trigger_ms(60_000)
            .build();
        let relay = MetricRelay::new(config, Arc::new(CollectingSink { tx }));

        relay.submit(
            Measurement::builder("hits", MetricValue::Int(1))
                .merge_policy(MergePolicy::Sum)
                .build(),
        );
        relay.submit(
            Measurement::builder("hits", MetricValue::Int(2))
                .merge_policy(MergePolicy::Sum)
                .build(),
        );
        // Still one key; no flush yet.
        relay.submit(Measurement::builder("misses", MetricValue::Int(1)).build());

        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("batch never arrived")
            .unwrap();
        assert_eq!(batch.len(), 2);
        let hits = batch.iter().find(|m| m.key() == "hits").unwrap();
        assert_eq!(*hits.value(), MetricValue::Int(3));
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_plain_stage_keeps_every_measurement() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RelayConfig::builder()
            .size_trigger(3)
            .time_trigger_ms(60_000)
            .conflation_enabled(false)
            .build();
        let relay = MetricRelay::new(config, Arc::new(CollectingSink { tx }));

        for _ in 0..3 {
            relay.submit(Measurement::builder("hits", MetricValue::Int(1)).build());
        }
        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("batch never arrived")
            .unwrap();
        // Same key three times: no conflation on the plain path.
        assert_eq!(batch.len(), 3);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_stats_shape_follows_configuration() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = MetricRelay::new(RelayConfig::default(), Arc::new(CollectingSink { tx }));
        let stats = relay.stats();
        assert!(stats.accumulator.is_some());
        assert!(stats.flush_queue.is_none());
        assert!(stats.heartbeat.is_none());
        assert!(relay.is_connected());
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_inbound_resolution_through_relay() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = MetricRelay::new(RelayConfig::default(), Arc::new(CollectingSink { tx }));

        let op = relay
            .correlation()
            .register("req-9", Duration::from_secs(1));
        assert!(relay.resolve("req-9", b"ack".to_vec()));
        assert_eq!(op.wait(Duration::from_millis(100)).await.unwrap(), b"ack");
        relay.shutdown();
    }

    /// Rejects the first batch as congestion, accepts everything after.
    struct RecoveringSink {
        rejected_once: std::sync::atomic::AtomicBool,
        tx: mpsc::UnboundedSender<Batch>,
    }

    #[async_trait]
    impl Sink<Batch> for RecoveringSink {
        async fn send(&self, batch: Batch) -> Result<(), SinkError<Batch>> {
            use std::sync::atomic::Ordering;
            if !self.rejected_once.swap(true, Ordering::SeqCst) {
                return Err(SinkError::Congested { rejected: batch });
            }
            self.tx
                .send(batch)
                .map_err(|e| SinkError::Failed(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_congestion_throttles_replays_and_recovers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RecoveringSink {
            rejected_once: std::sync::atomic::AtomicBool::new(false),
            tx,
        });
        let config = RelayConfig::builder()
            .size_trigger(3)
            .time_trigger_ms(60_000)
            .reprocess_poll_ms(50)
            .build();
        let relay = MetricRelay::new(config, sink);
        let mut events = relay.subscribe();

        relay.submit(
            Measurement::builder("a", MetricValue::Int(1))
                .merge_policy(MergePolicy::Sum)
                .build(),
        );
        relay.submit(Measurement::builder("b", MetricValue::Int(7)).build());
        relay.submit(
            Measurement::builder("a", MetricValue::Int(2))
                .merge_policy(MergePolicy::Sum)
                .build(),
        );
        // Third distinct key fires the size trigger.
        relay.submit(Measurement::builder("c", MetricValue::Int(9)).build());

        assert_eq!(
            timeout(Duration::from_secs(1), events.recv()).await.unwrap(),
            Ok(RelayEvent::ThrottlingStarted)
        );

        // The rejected batch is replayed by the reprocess worker, intact.
        let batch = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("replayed batch never arrived")
            .unwrap();
        assert_eq!(batch.len(), 3);
        let a = batch.iter().find(|m| m.key() == "a").unwrap();
        assert_eq!(*a.value(), MetricValue::Int(3));

        // The next empty poll reopens the gate.
        assert_eq!(
            timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
            Ok(RelayEvent::ThrottlingEnded)
        );
        assert_eq!(relay.gate_state(), GateState::Open);

        let stats = relay.stats();
        assert_eq!(stats.gate.queued, 1);
        assert_eq!(stats.gate.reprocessed, 1);
        assert_eq!(stats.gate.throttle_incidents, 1);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = MetricRelay::new(RelayConfig::default(), Arc::new(CollectingSink { tx }));
        relay.shutdown();
        assert!(!relay.submit(Measurement::builder("late", MetricValue::Int(1)).build()));
    }

    #[test]
    fn test_relay_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MetricRelay>();
    }
}
