//! Accumulates and conflates keyed items ahead of a size or time based flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use super::flush_queue::FlushReceiver;
use crate::model::Measurement;

/// An item that can be merged with an earlier unflushed value for its key.
pub trait Conflate: Send + 'static {
    /// The stable key this item conflates under.
    fn conflation_key(&self) -> &str;

    /// Merge this (newer) item with a previously buffered one, producing the
    /// value that stays in the buffer.
    fn conflate(self, older: Self) -> Self
    where
        Self: Sized;
}

impl Conflate for Measurement {
    fn conflation_key(&self) -> &str {
        self.key()
    }

    fn conflate(self, older: Self) -> Self {
        self.conflate_with(older)
    }
}

/// Counter snapshot for a conflating accumulator.
#[derive(Debug, Default, Clone)]
pub struct AccumulatorStats {
    pub submitted: u64,
    pub conflated: u64,
    pub flush_count: u64,
    pub flush_errors: u64,
    pub last_flush_elapsed_ms: u64,
    pub pending_keys: usize,
}

/// Holds at most one pending value per key, merging repeated submissions via
/// [`Conflate::conflate`] until a flush releases the whole working set.
///
/// The size trigger counts distinct keys, not raw submissions. One coarse
/// lock guards both check-merge-or-insert and copy-and-clear; it is never
/// held across the downstream send. At most one flush runs at a time; a
/// trigger that finds one in progress is a no-op.
pub struct ConflatingAccumulator<T: Conflate> {
    shared: Arc<AccumulatorShared<T>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

struct AccumulatorShared<T> {
    name: String,
    size_trigger: usize,
    buffer: Mutex<HashMap<String, T>>,
    flush_in_progress: AtomicBool,
    receiver: Arc<dyn FlushReceiver<T>>,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last completed flush.
    last_flush_ms: AtomicU64,
    submitted: AtomicU64,
    conflated: AtomicU64,
    flush_count: AtomicU64,
    flush_errors: AtomicU64,
    last_flush_elapsed_ms: AtomicU64,
    shutdown: AtomicBool,
}

impl<T: Conflate> ConflatingAccumulator<T> {
    /// Create a new accumulator and arm its timed-flush task.
    ///
    /// Must be called within a tokio runtime. The timer fires on a fixed
    /// period and flushes only when the elapsed time since the last flush
    /// has reached the time trigger.
    pub fn new(
        name: impl Into<String>,
        size_trigger: usize,
        time_trigger_ms: u64,
        receiver: Arc<dyn FlushReceiver<T>>,
    ) -> Self {
        let name = name.into();
        let shared = Arc::new(AccumulatorShared {
            name: name.clone(),
            size_trigger,
            buffer: Mutex::new(HashMap::new()),
            flush_in_progress: AtomicBool::new(false),
            receiver,
            epoch: Instant::now(),
            last_flush_ms: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            conflated: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
            last_flush_elapsed_ms: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let timer = if time_trigger_ms > 0 {
            let shared = Arc::clone(&shared);
            let period = Duration::from_millis(time_trigger_ms);
            Some(tokio::spawn(async move {
                loop {
                    sleep(period).await;
                    if shared.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if shared.elapsed_since_flush() >= period {
                        trace!(accumulator = %shared.name, "time triggered flush");
                        shared.flush().await;
                    }
                }
            }))
        } else {
            None
        };

        debug!(accumulator = %name, size_trigger, time_trigger_ms, "created accumulator");
        Self {
            shared,
            timer: Mutex::new(timer),
        }
    }

    /// Submit an item: insert under its key, or merge with the resident
    /// unflushed value for that key. Returns false after shutdown.
    pub fn submit(&self, item: T) -> bool {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return false;
        }
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        let pending_keys = {
            let mut buffer = self.shared.buffer.lock().expect("accumulator buffer poisoned");
            let key = item.conflation_key().to_string();
            match buffer.remove(&key) {
                Some(older) => {
                    buffer.insert(key, item.conflate(older));
                    self.shared.conflated.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    buffer.insert(key, item);
                }
            }
            buffer.len()
        };
        if pending_keys >= self.shared.size_trigger {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.flush().await;
            });
        }
        true
    }

    /// Number of distinct keys awaiting a flush.
    pub fn pending_keys(&self) -> usize {
        self.shared.buffer.lock().expect("accumulator buffer poisoned").len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AccumulatorStats {
        AccumulatorStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            conflated: self.shared.conflated.load(Ordering::Relaxed),
            flush_count: self.shared.flush_count.load(Ordering::Relaxed),
            flush_errors: self.shared.flush_errors.load(Ordering::Relaxed),
            last_flush_elapsed_ms: self.shared.last_flush_elapsed_ms.load(Ordering::Relaxed),
            pending_keys: self.pending_keys(),
        }
    }

    /// Force a flush attempt regardless of triggers.
    pub async fn flush_now(&self) {
        self.shared.flush().await;
    }

    /// Stop the timer and discard any buffered values.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }
        let discarded = {
            let mut buffer = self.shared.buffer.lock().expect("accumulator buffer poisoned");
            std::mem::take(&mut *buffer).len()
        };
        debug!(accumulator = %self.shared.name, discarded, "accumulator shut down");
    }
}

impl<T: Conflate> AccumulatorShared<T> {
    fn elapsed_since_flush(&self) -> Duration {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(elapsed.saturating_sub(self.last_flush_ms.load(Ordering::Relaxed)))
    }

    /// Copy-and-clear the buffer, then hand the working set to the receiver
    /// outside the buffer lock. A compare-and-set keeps a second trigger
    /// from starting a concurrent flush.
    async fn flush(&self) {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(accumulator = %self.name, "flush already in flight");
            return;
        }
        let drained: Vec<T> = {
            let mut buffer = self.buffer.lock().expect("accumulator buffer poisoned");
            std::mem::take(&mut *buffer).into_values().collect()
        };
        self.last_flush_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        if !drained.is_empty() {
            let count = drained.len();
            let start = Instant::now();
            match self.receiver.flush(drained).await {
                Ok(()) => {
                    trace!(accumulator = %self.name, count, "flushed");
                }
                Err(e) => {
                    self.flush_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(accumulator = %self.name, count, error = %e, "flush failed");
                }
            }
            self.last_flush_elapsed_ms
                .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
            self.flush_count.fetch_add(1, Ordering::Relaxed);
        }
        self.flush_in_progress.store(false, Ordering::Release);
    }
}

impl<T: Conflate> Drop for ConflatingAccumulator<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().ok().and_then(|mut t| t.take()) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::model::{MergePolicy, MetricValue};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct CaptureReceiver {
        tx: mpsc::UnboundedSender<Vec<Measurement>>,
    }

    #[async_trait]
    impl FlushReceiver<Measurement> for CaptureReceiver {
        async fn flush(&self, items: Vec<Measurement>) -> Result<(), RelayError> {
            self.tx.send(items).map_err(|_| RelayError::ChannelClosed)
        }
    }

    fn capture() -> (
        Arc<CaptureReceiver>,
        mpsc::UnboundedReceiver<Vec<Measurement>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CaptureReceiver { tx }), rx)
    }

    fn counter(name: &str, v: i64) -> Measurement {
        Measurement::builder(name, MetricValue::Int(v))
            .merge_policy(MergePolicy::Sum)
            .build()
    }

    #[tokio::test]
    async fn test_size_trigger_counts_distinct_keys() {
        let (receiver, mut rx) = capture();
        let acc = ConflatingAccumulator::new("acc", 3, 10_000, receiver);

        acc.submit(counter("a", 1));
        acc.submit(counter("b", 1));
        acc.submit(counter("a", 2)); // conflates, still 2 keys
        assert!(rx.try_recv().is_err());
        assert_eq!(acc.pending_keys(), 2);

        acc.submit(counter("c", 1)); // 3 distinct keys, flush fires

        let mut flushed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("flush never arrived")
            .unwrap();
        flushed.sort_by(|x, y| x.key().cmp(y.key()));
        assert_eq!(flushed.len(), 3);
        assert_eq!(*flushed[0].value(), MetricValue::Int(3)); // a: 1+2
        assert_eq!(*flushed[1].value(), MetricValue::Int(1));
        assert_eq!(*flushed[2].value(), MetricValue::Int(1));
        assert_eq!(acc.stats().conflated, 1);
        acc.shutdown();
    }

    #[tokio::test]
    async fn test_conflation_is_left_fold_in_submission_order() {
        let (receiver, mut rx) = capture();
        let acc = ConflatingAccumulator::new("fold", 100, 10_000, receiver);

        // Replace policy: the flushed value must be the last submitted.
        for v in [1, 5, 9] {
            acc.submit(
                Measurement::builder("gauge", MetricValue::Int(v))
                    .merge_policy(MergePolicy::Replace)
                    .build(),
            );
        }
        acc.flush_now().await;
        let flushed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("flush never arrived")
            .unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(*flushed[0].value(), MetricValue::Int(9));
        acc.shutdown();
    }

    #[tokio::test]
    async fn test_time_triggered_flush() {
        let (receiver, mut rx) = capture();
        let acc = ConflatingAccumulator::new("timed", 100, 30, receiver);

        acc.submit(counter("a", 1));
        let flushed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed flush never arrived")
            .unwrap();
        assert_eq!(flushed.len(), 1);
        acc.shutdown();
    }

    #[tokio::test]
    async fn test_empty_buffer_timer_is_noop() {
        let (receiver, mut rx) = capture();
        let acc = ConflatingAccumulator::new("idle", 100, 20, receiver);
        sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(acc.stats().flush_count, 0);
        acc.shutdown();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let (receiver, _rx) = capture();
        let acc = ConflatingAccumulator::new("down", 10, 1000, receiver);
        acc.shutdown();
        assert!(!acc.submit(counter("a", 1)));
    }
}
