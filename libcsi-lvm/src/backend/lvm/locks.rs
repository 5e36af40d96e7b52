//! Per-key async mutexes.
//!
//! Controller mutations serialize on the volume group (and creates also on
//! the idempotency key), node mutations on the target path.  Waiting is
//! bounded: a caller that cannot get the lock in time gets
//! [`CsiError::Aborted`] and is expected to retry.
//!
//! An entry lives only while someone holds or waits for its key, so keys
//! that are used once (per-pod target paths) do not accumulate.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::CsiError;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Default)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

/// Holds the lock on one key; dropping it releases the key.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    locks: Arc<LockMap>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // The map and this guard hold the only references: nobody waits.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `key`, waiting at most `timeout`.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<KeyGuard, CsiError> {
        let lock = self
            .locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(KeyGuard {
                key: key.to_owned(),
                locks: Arc::clone(&self.locks),
                _guard: guard,
            }),
            Err(_) => {
                // Our clone went away with the timed-out future.
                self.locks
                    .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
                debug!(key, ?timeout, "lock wait timed out");
                Err(CsiError::Aborted(format!(
                    "operation on {key} still in progress"
                )))
            }
        }
    }

    /// Keys currently held or waited for.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out() {
        let locks = KeyedLocks::new();
        let _held = locks.acquire("vg0", Duration::from_secs(1)).await.unwrap();

        let err = locks
            .acquire("vg0", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(locks.len(), 1);

        // Other keys are independent.
        locks.acquire("vg1", Duration::from_millis(20)).await.unwrap();
    }

    #[tokio::test]
    async fn released_keys_leave_the_map() {
        let locks = KeyedLocks::new();
        for i in 0..100 {
            let guard = locks
                .acquire(&format!("/target/{i}"), Duration::from_secs(1))
                .await
                .unwrap();
            drop(guard);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn entry_stays_while_a_waiter_queues() {
        let locks = Arc::new(KeyedLocks::new());
        let held = locks.acquire("a", Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("a", Duration::from_secs(5)).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(locks.len(), 1, "the waiter still needs the entry");

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
