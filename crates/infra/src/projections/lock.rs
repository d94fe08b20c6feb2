//! Advisory locks guarding projection state during rebuilds.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::sql::SqlError;

/// 64-bit advisory lock key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Stable key for one projection version in one partition (FNV-1a over
    /// `name:partition:version`), identical across processes and releases.
    pub fn for_projection(name: &str, partition: &str, version: u32) -> Self {
        Self::hashed(&format!("{name}:{partition}:{version}"))
    }

    /// Key serializing appends to one partition.
    pub fn for_appends(partition: &str) -> Self {
        Self::hashed(&format!("appends:{partition}"))
    }

    fn hashed(text: &str) -> Self {
        const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET_BASIS;
        for byte in text.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
        Self(hash as i64)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

/// A held lock.
#[async_trait]
pub trait LockGuard: Send {
    fn key(&self) -> LockKey;

    async fn release(self: Box<Self>) -> Result<(), SqlError>;
}

/// Non-blocking advisory lock.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// `Ok(None)` when another holder owns the key.
    async fn try_acquire(&self, key: LockKey) -> Result<Option<Box<dyn LockGuard>>, SqlError>;
}

/// Process-local lock table, for embedded SQLite deployments where every writer
/// lives in one process.
#[derive(Debug, Clone, Default)]
pub struct InProcessAdvisoryLock {
    held: Arc<Mutex<HashSet<LockKey>>>,
}

impl InProcessAdvisoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: LockKey) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl AdvisoryLock for InProcessAdvisoryLock {
    async fn try_acquire(&self, key: LockKey) -> Result<Option<Box<dyn LockGuard>>, SqlError> {
        let mut held = self.held.lock().map_err(|_| SqlError::Other {
            operation: "in_process_lock".to_string(),
            message: "lock table poisoned".to_string(),
        })?;

        if !held.insert(key) {
            return Ok(None);
        }

        Ok(Some(Box::new(InProcessLockGuard {
            held: self.held.clone(),
            key,
            released: false,
        })))
    }
}

struct InProcessLockGuard {
    held: Arc<Mutex<HashSet<LockKey>>>,
    key: LockKey,
    released: bool,
}

impl InProcessLockGuard {
    fn unlock(&mut self) {
        if self.released {
            return;
        }
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
        self.released = true;
    }
}

impl Drop for InProcessLockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[async_trait]
impl LockGuard for InProcessLockGuard {
    fn key(&self) -> LockKey {
        self.key
    }

    async fn release(mut self: Box<Self>) -> Result<(), SqlError> {
        self.unlock();
        Ok(())
    }
}

/// Outcome of a retried acquisition.
pub enum Acquisition {
    Acquired(Box<dyn LockGuard>),
    Exhausted { attempts: u32 },
}

/// Try to take `key`, sleeping between attempts according to `policy`.
pub async fn acquire_with_retry(
    lock: &dyn AdvisoryLock,
    key: LockKey,
    policy: &RetryPolicy,
) -> Result<Acquisition, SqlError> {
    let mut retries = 0u32;
    loop {
        if let Some(guard) = lock.try_acquire(key).await? {
            debug!(lock_key = key.value(), retries, "lock acquired");
            return Ok(Acquisition::Acquired(guard));
        }

        if !policy.should_retry(retries) {
            warn!(lock_key = key.value(), attempts = retries + 1, "lock acquisition exhausted");
            return Ok(Acquisition::Exhausted {
                attempts: retries + 1,
            });
        }

        retries += 1;
        tokio::time::sleep(policy.delay_for_attempt(retries)).await;
    }
}
