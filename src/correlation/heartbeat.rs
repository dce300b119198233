//! Periodic correlated liveness probes with hysteresis on failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use super::table::CorrelationTable;
use crate::events::RelayEvent;
use crate::transport::Transport;

/// Probe payload sent on every heartbeat.
const PROBE_PAYLOAD: &[u8] = b"ping";

/// Size of the sliding window of probe round-trip times.
const RTT_WINDOW: usize = 64;

/// Heartbeat monitor configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Period between probes in ms.
    pub period_ms: u64,
    /// Timeout of a single probe in ms.
    pub timeout_ms: u64,
    /// Consecutive probe timeouts that flip connected -> disconnected.
    pub disconnect_trigger: u64,
    /// Host component of the correlation key.
    pub host: String,
    /// Agent component of the correlation key.
    pub agent: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period_ms: 15_000,
            timeout_ms: 1_000,
            disconnect_trigger: 2,
            host: "localhost".to_string(),
            agent: "metric-relay".to_string(),
        }
    }
}

/// Counter snapshot for the heartbeat monitor.
#[derive(Debug, Default, Clone)]
pub struct HeartbeatStats {
    pub connected: bool,
    pub consecutive_timeouts: u64,
    pub probe_timeouts: u64,
    pub probes_sent: u64,
    pub average_rtt_us: u64,
}

/// Issues a correlated liveness probe on a fixed period.
///
/// A successful probe resets the consecutive-timeout counter and flips the
/// connectivity flag back to connected. Reaching the configured trigger of
/// consecutive timeouts flips it to disconnected exactly once; the
/// hysteresis prevents flapping on a single lost probe.
pub struct HeartbeatMonitor {
    shared: Arc<HeartbeatShared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

struct HeartbeatShared {
    transport: Arc<dyn Transport>,
    table: CorrelationTable,
    config: HeartbeatConfig,
    connected: AtomicBool,
    consecutive_timeouts: AtomicU64,
    probe_timeouts: AtomicU64,
    probes_sent: AtomicU64,
    rtt_window_us: Mutex<VecDeque<u64>>,
    events: broadcast::Sender<RelayEvent>,
}

impl HeartbeatMonitor {
    /// Create the monitor and start probing. Must be called within a tokio
    /// runtime. The monitor starts in the connected state.
    pub fn start(
        config: HeartbeatConfig,
        transport: Arc<dyn Transport>,
        table: CorrelationTable,
        events: broadcast::Sender<RelayEvent>,
    ) -> Self {
        let shared = Arc::new(HeartbeatShared {
            transport,
            table,
            config: config.clone(),
            connected: AtomicBool::new(true),
            consecutive_timeouts: AtomicU64::new(0),
            probe_timeouts: AtomicU64::new(0),
            probes_sent: AtomicU64::new(0),
            rtt_window_us: Mutex::new(VecDeque::with_capacity(RTT_WINDOW)),
            events,
        });
        let timer = {
            let shared = Arc::clone(&shared);
            let period = Duration::from_millis(config.period_ms.max(1));
            tokio::spawn(async move {
                loop {
                    sleep(period).await;
                    shared.probe().await;
                }
            })
        };
        debug!(
            period_ms = config.period_ms,
            timeout_ms = config.timeout_ms,
            trigger = config.disconnect_trigger,
            "heartbeat monitor started"
        );
        Self {
            shared,
            timer: Mutex::new(Some(timer)),
        }
    }

    /// Issue one probe immediately, outside the schedule. Returns true if it
    /// was confirmed within the timeout.
    pub async fn probe(&self) -> bool {
        self.shared.probe().await
    }

    /// Current connectivity flag.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> HeartbeatStats {
        let window = self
            .shared
            .rtt_window_us
            .lock()
            .expect("rtt window poisoned");
        let average_rtt_us = if window.is_empty() {
            0
        } else {
            window.iter().sum::<u64>() / window.len() as u64
        };
        HeartbeatStats {
            connected: self.is_connected(),
            consecutive_timeouts: self.shared.consecutive_timeouts.load(Ordering::Relaxed),
            probe_timeouts: self.shared.probe_timeouts.load(Ordering::Relaxed),
            probes_sent: self.shared.probes_sent.load(Ordering::Relaxed),
            average_rtt_us,
        }
    }

    /// Stop the probe schedule.
    pub fn shutdown(&self) {
        if let Some(handle) = self.timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }
        debug!("heartbeat monitor shut down");
    }
}

impl HeartbeatShared {
    /// Build a unique correlation key, register it, send the probe and await
    /// the correlated response.
    async fn probe(&self) -> bool {
        let key = self.next_key();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let op = self.table.register(&key, timeout);
        self.probes_sent.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        if let Err(e) = self.transport.send_correlated(&key, PROBE_PAYLOAD).await {
            warn!(key = %key, error = %e, "heartbeat send failed");
            self.table.cancel(&key);
            self.record_timeout();
            return false;
        }
        match op.wait(timeout).await {
            Ok(_) => {
                trace!(key = %key, "heartbeat confirmed");
                self.record_rtt(start.elapsed());
                self.record_success();
                true
            }
            Err(_) => {
                trace!(key = %key, "heartbeat timed out");
                self.record_timeout();
                false
            }
        }
    }

    fn next_key(&self) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{}-{}-{}", self.config.host, self.config.agent, nanos)
    }

    fn record_rtt(&self, rtt: Duration) {
        let mut window = self.rtt_window_us.lock().expect("rtt window poisoned");
        if window.len() == RTT_WINDOW {
            window.pop_front();
        }
        window.push_back(rtt.as_micros() as u64);
    }

    /// A single success resets the counter and reconnects.
    fn record_success(&self) {
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
        if self
            .connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("heartbeat restored, marking connected");
            self.events.send(RelayEvent::Connected).ok();
        }
    }

    fn record_timeout(&self) {
        self.probe_timeouts.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= self.config.disconnect_trigger
            && self
                .connected
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            warn!(consecutive, "heartbeat lost, marking disconnected");
            self.events.send(RelayEvent::Disconnected).ok();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().ok().and_then(|mut t| t.take()) {
            handle.abort();
        }
    }
}
