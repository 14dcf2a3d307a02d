//! Call deduplication: collapses concurrent identical-key operations.
//!
//! The first caller for a key becomes the leader and runs the operation on
//! its own task; every caller that arrives while the call is in flight
//! waits for the leader and receives the identical outcome. Distinct keys
//! never block each other.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared outcome of one in-flight call. Errors are reference-counted so
/// every waiter observes the same error value.
type Outcome<T> = std::result::Result<T, Arc<Error>>;

/// A group of in-flight calls, keyed by string.
pub struct FlightGroup<T> {
    inflight: Mutex<HashMap<String, broadcast::Sender<Outcome<T>>>>,
    suppressed: AtomicU64,
}

impl<T> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Number of callers that were collapsed into another caller's flight.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn is_inflight(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }
}

impl<T: Clone + Send + 'static> FlightGroup<T> {
    /// Run `op` for `key`, deduplicated against concurrent calls.
    ///
    /// If no call is in flight for `key`, executes `op` on the calling task
    /// and publishes the outcome to every waiter that attached meanwhile.
    /// Otherwise suspends until the in-flight call completes and returns
    /// its outcome. For N concurrent callers the operation runs exactly
    /// once; a later call (after the in-flight entry clears) runs afresh.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let waiter = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_owned(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return match rx.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(shared)) => Err(Error::Shared(shared)),
                // The leader was cancelled before publishing.
                Err(_) => Err(Error::Internal(format!(
                    "in-flight call for {:?} was abandoned",
                    key
                ))),
            };
        }

        // Leader path. The guard keeps the entry consistent if this future
        // is dropped mid-operation: waiters see a closed channel instead of
        // hanging on an orphaned flight.
        let guard = FlightGuard { group: self, key };
        let outcome: Outcome<T> = match op().await {
            Ok(value) => Ok(value),
            Err(e) => Err(Arc::new(e)),
        };

        // Clear the in-flight entry before publishing: waiters already
        // attached to this flight still receive the buffered outcome, while
        // callers arriving from here on start a fresh flight.
        let tx = guard.disarm();
        if let Some(tx) = tx {
            let _ = tx.send(outcome.clone());
        }

        outcome.map_err(Error::Shared)
    }
}

struct FlightGuard<'a, T> {
    group: &'a FlightGroup<T>,
    key: &'a str,
}

impl<'a, T> FlightGuard<'a, T> {
    /// Remove the in-flight entry and hand back its sender for publishing.
    fn disarm(self) -> Option<broadcast::Sender<Outcome<T>>> {
        let tx = self.group.inflight.lock().remove(self.key);
        std::mem::forget(self);
        tx
    }
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        // Dropping the sender closes the channel; waiters observe the
        // abandonment instead of blocking forever.
        self.group.inflight.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_share_one_execution() {
        let flights = Arc::new(FlightGroup::<u64>::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        // Leader: blocks inside the operation until released.
        let leader = {
            let flights = flights.clone();
            let executions = executions.clone();
            let release = release.clone();
            tokio::spawn(async move {
                flights
                    .run("tom", || async {
                        release.notified().await;
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok(42)
                    })
                    .await
            })
        };

        // Wait until the leader's flight is registered.
        while !flights.is_inflight("tom") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let mut waiters = Vec::new();
        for _ in 0..16 {
            let flights = flights.clone();
            let executions = executions.clone();
            waiters.push(tokio::spawn(async move {
                flights
                    .run("tom", || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok(42)
                    })
                    .await
            }));
        }

        // Give the waiters time to attach before the leader completes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        assert_eq!(leader.await.unwrap().unwrap(), 42);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(flights.suppressed(), 16);
        assert!(!flights.is_inflight("tom"));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let flights = Arc::new(FlightGroup::<&'static str>::new());

        // A flight for "slow" that never completes on its own.
        let slow = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("slow", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok("slow")
                    })
                    .await
            })
        };

        while !flights.is_inflight("slow") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // A different key completes immediately.
        let value = flights.run("fast", || async { Ok("fast") }).await.unwrap();
        assert_eq!(value, "fast");

        slow.abort();
    }

    #[tokio::test]
    async fn errors_propagate_to_every_waiter() {
        let flights = Arc::new(FlightGroup::<u64>::new());
        let release = Arc::new(Notify::new());

        let leader = {
            let flights = flights.clone();
            let release = release.clone();
            tokio::spawn(async move {
                flights
                    .run("missing", || async {
                        release.notified().await;
                        Err(Error::KeyNotFound("missing".into()))
                    })
                    .await
            })
        };

        while !flights.is_inflight("missing") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let waiter = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("missing", || async { Ok(0) })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();

        assert!(leader.await.unwrap().unwrap_err().is_not_found());
        assert!(waiter.await.unwrap().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn completed_flights_allow_retry() {
        let flights = FlightGroup::<u64>::new();
        let executions = AtomicUsize::new(0);

        for _ in 0..2 {
            let _ = flights
                .run("retry", || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Internal("transient".into()))
                })
                .await;
        }

        // Sequential calls each execute: the in-flight entry cleared.
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
