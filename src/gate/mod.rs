//! Admission throttle gate: overload detection, paused admissions, and
//! bounded replay of congestion-rejected writes.
//!
//! A breaker tuned for at-least-once-attempted delivery under backpressure.
//! Producers are slowed rather than unboundedly queued, and a small number
//! of pending writes are replayed once capacity returns, bounding both
//! memory and latency.

pub mod state;

pub use state::{Admitted, GateState};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::events::RelayEvent;
use crate::sink::{Sink, SinkError};

/// Counter snapshot for an admission gate.
#[derive(Debug, Default, Clone)]
pub struct GateStats {
    pub sent: u64,
    pub queued: u64,
    pub dropped: u64,
    pub failed: u64,
    pub reprocessed: u64,
    pub congestion_signals: u64,
    pub throttle_incidents: u64,
    pub throttle_time_ms: u64,
}

/// The admission gate in front of a downstream sink.
///
/// In `Open` state, [`admit`](AdmissionGate::admit) forwards immediately.
/// A congestion signal from the sink flips the gate to `Throttled`, queues
/// the rejected write for replay, and makes subsequent admitters block on
/// the gate release up to the drop timeout. A dedicated worker replays the
/// queue and reopens the gate once it has stayed empty for one full poll
/// interval.
pub struct AdmissionGate<W: Send + 'static> {
    shared: Arc<GateShared<W>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct GateShared<W> {
    sink: Arc<dyn Sink<W>>,
    state: watch::Sender<GateState>,
    reprocess_tx: mpsc::Sender<W>,
    events: broadcast::Sender<RelayEvent>,
    drop_timeout: Duration,
    throttle_started: Mutex<Option<Instant>>,
    sent: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    reprocessed: AtomicU64,
    congestion_signals: AtomicU64,
    throttle_incidents: AtomicU64,
    throttle_time_ms: AtomicU64,
    shutdown: AtomicBool,
}

impl<W: Send + 'static> AdmissionGate<W> {
    /// Create a gate and start its reprocessing worker.
    ///
    /// Must be called within a tokio runtime. `reprocess_capacity` bounds
    /// the replay queue; overflow there is a counted drop, never a blocking
    /// wait.
    pub fn new(
        sink: Arc<dyn Sink<W>>,
        drop_timeout_ms: u64,
        reprocess_capacity: usize,
        reprocess_poll_ms: u64,
        events: broadcast::Sender<RelayEvent>,
    ) -> Self {
        let (reprocess_tx, reprocess_rx) = mpsc::channel(reprocess_capacity.max(1));
        let (state, _) = watch::channel(GateState::Open);
        let shared = Arc::new(GateShared {
            sink,
            state,
            reprocess_tx,
            events,
            drop_timeout: Duration::from_millis(drop_timeout_ms),
            throttle_started: Mutex::new(None),
            sent: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            reprocessed: AtomicU64::new(0),
            congestion_signals: AtomicU64::new(0),
            throttle_incidents: AtomicU64::new(0),
            throttle_time_ms: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let poll = Duration::from_millis(reprocess_poll_ms.max(1));
            tokio::spawn(async move {
                shared.reprocess_loop(reprocess_rx, poll).await;
            })
        };

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Admit one write.
    ///
    /// Open: forwards immediately. Throttled: blocks on the gate release up
    /// to the drop timeout, then retries once if the gate reopened in time;
    /// otherwise the write is a counted drop.
    pub async fn admit(&self, write: W) -> Admitted {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return Admitted::Dropped;
        }
        if *self.shared.state.borrow() == GateState::Throttled
            && !self.shared.wait_for_open().await
        {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return Admitted::Dropped;
        }
        match self.shared.sink.send(write).await {
            Ok(()) => {
                self.shared.sent.fetch_add(1, Ordering::Relaxed);
                Admitted::Sent
            }
            Err(SinkError::Congested { rejected }) => {
                if self.shared.on_congestion(rejected) {
                    Admitted::Queued
                } else {
                    Admitted::Dropped
                }
            }
            Err(SinkError::Failed(msg)) => {
                // Non-congestion failures never open the gate.
                self.shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %msg, "sink send failed");
                Admitted::Dropped
            }
        }
    }

    /// Report a congestion signal observed outside `admit` (e.g. from an
    /// asynchronous sink callback). Returns true if the rejected write was
    /// queued for replay, false if the replay queue was full.
    pub fn on_congestion(&self, rejected: W) -> bool {
        self.shared.on_congestion(rejected)
    }

    /// Current gate state.
    pub fn state(&self) -> GateState {
        *self.shared.state.borrow()
    }

    /// Whether the gate is currently throttling admissions.
    pub fn is_throttling(&self) -> bool {
        self.state() == GateState::Throttled
    }

    /// Counter snapshot.
    pub fn stats(&self) -> GateStats {
        let s = &self.shared;
        GateStats {
            sent: s.sent.load(Ordering::Relaxed),
            queued: s.queued.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            reprocessed: s.reprocessed.load(Ordering::Relaxed),
            congestion_signals: s.congestion_signals.load(Ordering::Relaxed),
            throttle_incidents: s.throttle_incidents.load(Ordering::Relaxed),
            throttle_time_ms: s.throttle_time_ms.load(Ordering::Relaxed),
        }
    }

    /// Stop the reprocessing worker and wake any blocked admitters; they
    /// return `Dropped` rather than hang.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        // Wakes blocked admitters; they observe the shutdown flag.
        self.shared.state.send_modify(|_| {});
        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            handle.abort();
        }
        debug!("admission gate shut down");
    }
}

impl<W: Send + 'static> GateShared<W> {
    fn on_congestion(&self, rejected: W) -> bool {
        self.congestion_signals.fetch_add(1, Ordering::Relaxed);
        let queued = match self.reprocess_tx.try_send(rejected) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                // Full replay queue: counted drop, never block the
                // signalling thread.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        };
        let transitioned = self.state.send_if_modified(|s| {
            if *s == GateState::Open {
                *s = GateState::Throttled;
                true
            } else {
                false
            }
        });
        if transitioned {
            *self.throttle_started.lock().expect("throttle lock poisoned") = Some(Instant::now());
            self.throttle_incidents.fetch_add(1, Ordering::Relaxed);
            warn!("downstream congested, throttling started");
            self.events.send(RelayEvent::ThrottlingStarted).ok();
        }
        queued
    }

    /// Block until the gate reopens or the drop timeout elapses.
    async fn wait_for_open(&self) -> bool {
        let mut rx = self.state.subscribe();
        let deadline = Instant::now() + self.drop_timeout;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            if *rx.borrow_and_update() == GateState::Open {
                return true;
            }
            match timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return false,
                Err(_) => return false,
            }
        }
    }

    /// Replays rejected writes one at a time. When the queue stays empty for
    /// a full poll interval while throttled, the gate reopens.
    async fn reprocess_loop(self: Arc<Self>, mut rx: mpsc::Receiver<W>, poll: Duration) {
        loop {
            match timeout(poll, rx.recv()).await {
                Ok(Some(item)) => match self.sink.send(item).await {
                    Ok(()) => {
                        self.reprocessed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        // Drop and count; re-enqueueing indefinitely would
                        // unbound memory.
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    let reopened = self.state.send_if_modified(|s| {
                        if *s == GateState::Throttled {
                            *s = GateState::Open;
                            true
                        } else {
                            false
                        }
                    });
                    if reopened {
                        let elapsed = self
                            .throttle_started
                            .lock()
                            .expect("throttle lock poisoned")
                            .take()
                            .map(|t| t.elapsed().as_millis() as u64)
                            .unwrap_or(0);
                        self.throttle_time_ms.fetch_add(elapsed, Ordering::Relaxed);
                        info!(throttled_ms = elapsed, "backlog drained, throttling ended");
                        self.events.send(RelayEvent::ThrottlingEnded).ok();
                    }
                }
            }
        }
    }
}

impl<W: Send + 'static> Drop for AdmissionGate<W> {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().ok().and_then(|mut w| w.take()) {
            handle.abort();
        }
    }
}
