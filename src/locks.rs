// Keyed mutual exclusion around read-modify-write sequences on one booking

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    #[error("Timed out waiting for lock on {0}")]
    Timeout(String),
}

/// Held for the duration of a critical section; releases on drop.
pub struct LockLease {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    registry: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.guard.take();
        // Drop the map entry once nobody else holds or awaits it
        self.registry
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[async_trait]
pub trait KeyedLock: Send + Sync + 'static {
    async fn acquire(&self, key: &str) -> Result<LockLease, LockError>;
}

/// Per-process lock table. A multi-node deployment swaps in a distributed lock.
pub struct InProcessLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    wait_timeout: Duration,
}

impl InProcessLocks {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            wait_timeout,
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for InProcessLocks {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl KeyedLock for InProcessLocks {
    async fn acquire(&self, key: &str) -> Result<LockLease, LockError> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = match tokio::time::timeout(self.wait_timeout, mutex.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(key, "Lock wait timed out");
                return Err(LockError::Timeout(key.to_string()));
            }
        };

        Ok(LockLease {
            key: key.to_string(),
            guard: Some(guard),
            registry: Arc::clone(&self.locks),
        })
    }
}
