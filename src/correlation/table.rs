//! Keyed registry pairing outbound requests with their eventual (or
//! timed-out) responses across an asynchronous transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use crate::error::RelayError;

/// Default sweep interval for unresolved entries.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 500;

struct PendingEntry {
    tx: oneshot::Sender<Vec<u8>>,
    deadline: Instant,
}

/// Wait handle for one registered correlation key.
///
/// Dropping the handle without waiting leaves the entry to be cleaned up by
/// the sweep or a late resolution.
pub struct PendingOp {
    rx: oneshot::Receiver<Vec<u8>>,
}

impl PendingOp {
    /// Await the correlated response up to `wait`. Expiry, cancellation and
    /// displacement all surface as [`RelayError::Timeout`].
    pub async fn wait(self, wait: Duration) -> Result<Vec<u8>, RelayError> {
        match timeout(wait, self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) | Err(_) => Err(RelayError::Timeout),
        }
    }
}

/// A time-bounded request/response table.
///
/// `register` records a caller-chosen key with a deadline; `resolve` pairs an
/// inbound response with the waiting caller. Entries are destroyed on
/// resolution, cancellation, or deadline expiry, whichever comes first, and
/// no entry resolves twice. A background sweep purges expired entries within
/// one sweep interval, waking their waiters with a timeout result.
///
/// Registering a key that is already outstanding displaces the earlier
/// entry: its waiter observes a timeout and the new registration takes over
/// the key.
#[derive(Clone)]
pub struct CorrelationTable {
    shared: Arc<TableShared>,
}

struct TableShared {
    entries: Mutex<HashMap<String, PendingEntry>>,
    timeout_count: AtomicU64,
    resolved_count: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CorrelationTable {
    /// Create a table sweeping at the default interval.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL_MS)
    }

    /// Create a table sweeping at the given interval. Must be called within
    /// a tokio runtime.
    pub fn with_sweep_interval(sweep_interval_ms: u64) -> Self {
        let shared = Arc::new(TableShared {
            entries: Mutex::new(HashMap::new()),
            timeout_count: AtomicU64::new(0),
            resolved_count: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        });
        let sweeper = {
            let shared = Arc::clone(&shared);
            let period = Duration::from_millis(sweep_interval_ms.max(1));
            tokio::spawn(async move {
                loop {
                    sleep(period).await;
                    shared.sweep();
                }
            })
        };
        *shared.sweeper.lock().expect("sweeper lock poisoned") = Some(sweeper);
        Self { shared }
    }

    /// Register a key with a time-to-live, returning the wait handle.
    pub fn register(&self, key: impl Into<String>, ttl: Duration) -> PendingOp {
        let key = key.into();
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            tx,
            deadline: Instant::now() + ttl,
        };
        let displaced = {
            let mut entries = self.shared.entries.lock().expect("entries lock poisoned");
            entries.insert(key.clone(), entry)
        };
        if displaced.is_some() {
            // The displaced waiter's sender drops here; it wakes with a
            // timeout result.
            self.shared.timeout_count.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "displaced outstanding correlation entry");
        }
        trace!(key = %key, "registered correlation key");
        PendingOp { rx }
    }

    /// Pair an inbound response with the pending entry for `key`.
    ///
    /// Returns false when no matching entry exists: late, duplicate, or
    /// never-registered responses are a no-op, never an error.
    pub fn resolve(&self, key: &str, payload: Vec<u8>) -> bool {
        let entry = {
            let mut entries = self.shared.entries.lock().expect("entries lock poisoned");
            entries.remove(key)
        };
        match entry {
            Some(entry) => {
                self.shared.resolved_count.fetch_add(1, Ordering::Relaxed);
                // The waiter may have given up already; the entry is still
                // considered resolved.
                entry.tx.send(payload).ok();
                trace!(key = %key, "resolved correlation key");
                true
            }
            None => {
                trace!(key = %key, "no pending entry for response");
                false
            }
        }
    }

    /// Cancel a pending entry by key. The waiter wakes with a timeout
    /// result. Returns false if no entry was outstanding.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = {
            let mut entries = self.shared.entries.lock().expect("entries lock poisoned");
            entries.remove(key).is_some()
        };
        if removed {
            trace!(key = %key, "cancelled correlation key");
        }
        removed
    }

    /// Number of outstanding entries.
    pub fn pending(&self) -> usize {
        self.shared.entries.lock().expect("entries lock poisoned").len()
    }

    /// Number of entries that expired unresolved.
    pub fn timeout_count(&self) -> u64 {
        self.shared.timeout_count.load(Ordering::Relaxed)
    }

    /// Number of entries successfully resolved.
    pub fn resolved_count(&self) -> u64 {
        self.shared.resolved_count.load(Ordering::Relaxed)
    }

    /// Stop the sweeper and drop all outstanding entries, waking their
    /// waiters with a timeout result.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .shared
            .sweeper
            .lock()
            .expect("sweeper lock poisoned")
            .take()
        {
            handle.abort();
        }
        let mut entries = self.shared.entries.lock().expect("entries lock poisoned");
        entries.clear();
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TableShared {
    /// Purge entries whose deadline has passed. Dropping the sender wakes
    /// the waiter with a timeout result.
    fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("entries lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.deadline > now);
        let expired = before - entries.len();
        if expired > 0 {
            self.timeout_count.fetch_add(expired as u64, Ordering::Relaxed);
            trace!(expired, "swept expired correlation entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_resolve() {
        let table = CorrelationTable::with_sweep_interval(50);
        let op = table.register("req-1", Duration::from_secs(5));

        assert!(table.resolve("req-1", b"pong".to_vec()));
        let payload = op.wait(Duration::from_millis(200)).await.unwrap();
        assert_eq!(payload, b"pong");
        assert_eq!(table.pending(), 0);
        table.shutdown();
    }

    #[tokio::test]
    async fn test_resolution_before_wait_is_fine() {
        // Out-of-order: the response lands before the caller awaits.
        let table = CorrelationTable::with_sweep_interval(50);
        let op = table.register("early", Duration::from_secs(5));
        assert!(table.resolve("early", vec![1]));
        assert_eq!(op.wait(Duration::from_millis(100)).await.unwrap(), vec![1]);
        table.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_resolution_are_noops() {
        let table = CorrelationTable::with_sweep_interval(50);
        assert!(!table.resolve("never-registered", vec![]));

        let _op = table.register("once", Duration::from_secs(5));
        assert!(table.resolve("once", vec![]));
        assert!(!table.resolve("once", vec![]));
        assert_eq!(table.resolved_count(), 1);
        table.shutdown();
    }

    #[tokio::test]
    async fn test_expired_entry_is_swept_and_waiter_times_out() {
        let table = CorrelationTable::with_sweep_interval(20);
        let op = table.register("stale", Duration::from_millis(30));

        let result = op.wait(Duration::from_millis(500)).await;
        assert!(matches!(result, Err(RelayError::Timeout)));

        // The sweep removed the entry; a late response finds nothing.
        sleep(Duration::from_millis(100)).await;
        assert!(!table.resolve("stale", vec![]));
        assert_eq!(table.timeout_count(), 1);
        assert_eq!(table.pending(), 0);
        table.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_register_displaces() {
        let table = CorrelationTable::with_sweep_interval(50);
        let first = table.register("dup", Duration::from_secs(5));
        let second = table.register("dup", Duration::from_secs(5));

        // The displaced waiter times out; the new one resolves.
        assert!(matches!(
            first.wait(Duration::from_millis(100)).await,
            Err(RelayError::Timeout)
        ));
        assert!(table.resolve("dup", b"ok".to_vec()));
        assert_eq!(second.wait(Duration::from_millis(100)).await.unwrap(), b"ok");
        table.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let table = CorrelationTable::with_sweep_interval(50);
        let op = table.register("gone", Duration::from_secs(5));
        assert!(table.cancel("gone"));
        assert!(!table.cancel("gone"));
        assert!(matches!(
            op.wait(Duration::from_millis(100)).await,
            Err(RelayError::Timeout)
        ));
        table.shutdown();
    }
}
