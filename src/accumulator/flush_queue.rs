//! A queue flushed by a size threshold and/or elapsed time between flushes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as FlushLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::error::RelayError;

/// Receives the drained contents of a flush queue.
#[async_trait]
pub trait FlushReceiver<T>: Send + Sync + 'static {
    /// Process one flushed working set. Errors are counted by the queue and
    /// do not stop the timer from rescheduling.
    async fn flush(&self, items: Vec<T>) -> Result<(), RelayError>;
}

/// Counter snapshot for a flush queue.
#[derive(Debug, Default, Clone)]
pub struct FlushQueueStats {
    pub flush_count: u64,
    pub flush_errors: u64,
    pub last_flush_elapsed_ms: u64,
    pub overflow_drops: u64,
    pub pending: usize,
}

/// A bounded queue that flushes to a receiver when either a size threshold
/// or an elapsed-time threshold is reached.
///
/// Producers only touch the buffer lock; the flush itself runs on a spawned
/// task behind a non-reentrant flush lock, so at most one flush is in flight
/// per queue and a trigger that finds a flush running is a no-op (the next
/// trigger picks up whatever accumulated since).
///
/// With a size trigger below 2 and a time trigger below 1ms the queue
/// degrades to pass-through: every add is handed to the receiver directly
/// via a worker task. This is a deliberate bypass mode, not an error.
pub struct FlushQueue<T: Send + 'static> {
    shared: Arc<FlushShared<T>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

struct FlushShared<T> {
    name: String,
    size_trigger: usize,
    capacity: usize,
    bypass: bool,
    buffer: Mutex<Vec<T>>,
    flush_lock: FlushLock<()>,
    receiver: Arc<dyn FlushReceiver<T>>,
    flush_count: AtomicU64,
    flush_errors: AtomicU64,
    last_flush_elapsed_ms: AtomicU64,
    overflow_drops: AtomicU64,
    shutdown: AtomicBool,
}

impl<T: Send + 'static> FlushQueue<T> {
    /// Create a new flush queue and arm its timer.
    ///
    /// Must be called within a tokio runtime. The buffer bound is two above
    /// the size trigger; adds beyond it are counted drops.
    pub fn new(
        name: impl Into<String>,
        size_trigger: usize,
        time_trigger_ms: u64,
        receiver: Arc<dyn FlushReceiver<T>>,
    ) -> Self {
        let name = name.into();
        let bypass = size_trigger < 2 && time_trigger_ms < 1;
        let shared = Arc::new(FlushShared {
            name: name.clone(),
            size_trigger,
            capacity: size_trigger.saturating_add(2),
            bypass,
            buffer: Mutex::new(Vec::new()),
            flush_lock: FlushLock::new(()),
            receiver,
            flush_count: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
            last_flush_elapsed_ms: AtomicU64::new(0),
            overflow_drops: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        // The timer re-arms after every flush attempt, including no-ops.
        let timer = if !bypass && time_trigger_ms > 0 {
            let shared = Arc::clone(&shared);
            let period = Duration::from_millis(time_trigger_ms);
            Some(tokio::spawn(async move {
                loop {
                    sleep(period).await;
                    if shared.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    trace!(queue = %shared.name, "time triggered flush");
                    FlushShared::try_flush(&shared).await;
                }
            }))
        } else {
            None
        };

        debug!(queue = %name, size_trigger, time_trigger_ms, bypass, "created flush queue");
        Self {
            shared,
            timer: Mutex::new(timer),
        }
    }

    /// Add an item. Returns false if the queue is shut down or the buffer is
    /// full; a full buffer is a counted drop and callers decide whether that
    /// is fatal.
    pub fn add(&self, item: T) -> bool {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return false;
        }
        if self.shared.bypass {
            self.direct_run(vec![item]);
            return true;
        }
        let pending = {
            let mut buffer = self.shared.buffer.lock().expect("flush buffer poisoned");
            if buffer.len() >= self.shared.capacity {
                self.shared.overflow_drops.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            buffer.push(item);
            buffer.len()
        };
        if pending >= self.shared.size_trigger {
            self.spawn_flush();
        }
        true
    }

    /// Add a collection of items, returning how many were accepted. Items
    /// beyond the buffer bound are counted drops.
    pub fn add_all(&self, items: Vec<T>) -> usize {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return 0;
        }
        if self.shared.bypass {
            let count = items.len();
            if count > 0 {
                self.direct_run(items);
            }
            return count;
        }
        let total = items.len();
        let (accepted, pending) = {
            let mut buffer = self.shared.buffer.lock().expect("flush buffer poisoned");
            let room = self.shared.capacity.saturating_sub(buffer.len());
            let accepted = room.min(total);
            buffer.extend(items.into_iter().take(accepted));
            (accepted, buffer.len())
        };
        let dropped = total - accepted;
        if dropped > 0 {
            self.shared
                .overflow_drops
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        if pending >= self.shared.size_trigger {
            self.spawn_flush();
        }
        accepted
    }

    /// Number of buffered items awaiting a flush.
    pub fn len(&self) -> usize {
        self.shared.buffer.lock().expect("flush buffer poisoned").len()
    }

    /// Whether the buffer is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn stats(&self) -> FlushQueueStats {
        FlushQueueStats {
            flush_count: self.shared.flush_count.load(Ordering::Relaxed),
            flush_errors: self.shared.flush_errors.load(Ordering::Relaxed),
            last_flush_elapsed_ms: self.shared.last_flush_elapsed_ms.load(Ordering::Relaxed),
            overflow_drops: self.shared.overflow_drops.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }

    /// Force a flush attempt regardless of triggers.
    pub async fn flush_now(&self) {
        FlushShared::try_flush(&self.shared).await;
    }

    /// Stop the timer and discard any buffered items.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }
        let discarded = {
            let mut buffer = self.shared.buffer.lock().expect("flush buffer poisoned");
            std::mem::take(&mut *buffer).len()
        };
        debug!(queue = %self.shared.name, discarded, "flush queue shut down");
    }

    fn spawn_flush(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            FlushShared::try_flush(&shared).await;
        });
    }

    fn direct_run(&self, items: Vec<T>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.run_flush(items).await;
        });
    }
}

impl<T: Send + 'static> FlushShared<T> {
    /// Attempt a flush: acquire the non-reentrant flush lock, drain the
    /// buffer into a private working set, and process it while new items
    /// keep flowing into the buffer. A contended lock means a flush is
    /// already running and this attempt returns immediately.
    async fn try_flush(shared: &Arc<Self>) {
        let guard = match shared.flush_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                trace!(queue = %shared.name, "flush already in flight");
                return;
            }
        };
        let drained = {
            let mut buffer = shared.buffer.lock().expect("flush buffer poisoned");
            std::mem::take(&mut *buffer)
        };
        if !drained.is_empty() {
            shared.run_flush(drained).await;
        }
        drop(guard);
    }

    async fn run_flush(&self, items: Vec<T>) {
        let count = items.len();
        let start = Instant::now();
        match self.receiver.flush(items).await {
            Ok(()) => {
                trace!(queue = %self.name, count, "flushed");
            }
            Err(e) => {
                self.flush_errors.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %self.name, count, error = %e, "flush failed");
            }
        }
        self.last_flush_elapsed_ms
            .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T: Send + 'static> Drop for FlushQueue<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().ok().and_then(|mut t| t.take()) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::timeout;

    struct CaptureReceiver {
        tx: mpsc::UnboundedSender<Vec<u32>>,
    }

    #[async_trait]
    impl FlushReceiver<u32> for CaptureReceiver {
        async fn flush(&self, items: Vec<u32>) -> Result<(), RelayError> {
            self.tx.send(items).map_err(|_| RelayError::ChannelClosed)
        }
    }

    fn capture() -> (Arc<CaptureReceiver>, mpsc::UnboundedReceiver<Vec<u32>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CaptureReceiver { tx }), rx)
    }

    #[tokio::test]
    async fn test_size_triggered_flush() {
        let (receiver, mut rx) = capture();
        let queue = FlushQueue::new("size", 3, 60_000, receiver);

        assert!(queue.add(1));
        assert!(queue.add(2));
        assert!(rx.try_recv().is_err());
        assert!(queue.add(3));

        let flushed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("flush never arrived")
            .unwrap();
        assert_eq!(flushed, vec![1, 2, 3]);
        assert_eq!(queue.stats().flush_count, 1);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_time_triggered_flush() {
        let (receiver, mut rx) = capture();
        let queue = FlushQueue::new("time", 100, 30, receiver);

        queue.add(7);
        queue.add(8);

        let flushed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timer flush never arrived")
            .unwrap();
        assert_eq!(flushed, vec![7, 8]);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_bypass_mode_invokes_receiver_per_add() {
        let (receiver, mut rx) = capture();
        let queue = FlushQueue::new("bypass", 1, 0, receiver);

        for i in 0..3 {
            assert!(queue.add(i));
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let items = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("bypass flush never arrived")
                .unwrap();
            assert_eq!(items.len(), 1);
            seen.extend(items);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        queue.shutdown();
    }

    struct BlockingReceiver {
        started: mpsc::UnboundedSender<usize>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl FlushReceiver<u32> for BlockingReceiver {
        async fn flush(&self, items: Vec<u32>) -> Result<(), RelayError> {
            self.started.send(items.len()).ok();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overflow_is_counted_drop() {
        let release = Arc::new(Notify::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(BlockingReceiver {
            started: started_tx,
            release: Arc::clone(&release),
        });
        let queue = FlushQueue::new("overflow", 5, 600_000, receiver);

        for i in 0..5 {
            assert!(queue.add(i));
        }
        // Wait until the size-triggered flush drained the buffer and is now
        // parked inside the receiver, holding the flush lock.
        let drained = timeout(Duration::from_secs(1), started_rx.recv())
            .await
            .expect("flush never started")
            .unwrap();
        assert_eq!(drained, 5);

        // Capacity is size_trigger + 2 = 7; the 8th pending item drops.
        for i in 0..7 {
            assert!(queue.add(100 + i), "item {i} should fit");
        }
        assert!(!queue.add(999));
        assert_eq!(queue.stats().overflow_drops, 1);

        release.notify_waiters();
        queue.shutdown();
    }

    struct ConcurrencyProbe {
        current: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl FlushReceiver<u32> for ConcurrencyProbe {
        async fn flush(&self, _items: Vec<u32>) -> Result<(), RelayError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_at_most_one_flush_in_flight() {
        let probe = Arc::new(ConcurrencyProbe {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let queue = FlushQueue::new("concurrent", 3, 5, Arc::clone(&probe) as Arc<dyn FlushReceiver<u32>>);

        // Size and time triggers race against each other for ~200ms.
        for i in 0..200 {
            queue.add(i);
            if i % 10 == 0 {
                sleep(Duration::from_millis(1)).await;
            }
        }
        sleep(Duration::from_millis(100)).await;
        queue.shutdown();

        assert!(probe.max_seen.load(Ordering::SeqCst) <= 1);
    }

    struct FailingReceiver;

    #[async_trait]
    impl FlushReceiver<u32> for FailingReceiver {
        async fn flush(&self, _items: Vec<u32>) -> Result<(), RelayError> {
            Err(RelayError::Sink("boom".into()))
        }
    }

    #[tokio::test]
    async fn test_flush_errors_counted_and_timer_survives() {
        let queue = FlushQueue::new("failing", 2, 20, Arc::new(FailingReceiver));
        queue.add(1);
        queue.add(2);
        sleep(Duration::from_millis(100)).await;
        let stats = queue.stats();
        assert!(stats.flush_errors >= 1);

        // Timer keeps rescheduling after an error.
        queue.add(3);
        sleep(Duration::from_millis(100)).await;
        assert!(queue.stats().flush_count > stats.flush_count);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_add_after_shutdown_rejected() {
        let (receiver, _rx) = capture();
        let queue = FlushQueue::new("down", 3, 1000, receiver);
        queue.shutdown();
        assert!(!queue.add(1));
        assert_eq!(queue.add_all(vec![1, 2, 3]), 0);
    }
}
