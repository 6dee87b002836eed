//! Exclusive row locks for the in-memory stores.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::StoreError;

/// Table of per-key async mutexes.
///
/// A guard is held by the owning transaction until it commits or is
/// dropped, which gives `SELECT ... FOR UPDATE` semantics to the in-memory
/// stores. Acquisition waits at most `timeout`.
#[derive(Debug)]
pub struct RowLocks<K> {
    rows: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl<K> RowLocks<K>
where
    K: Eq + Hash + Clone + core::fmt::Debug,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub async fn acquire(&self, key: &K) -> Result<OwnedMutexGuard<()>, StoreError> {
        let row = {
            let mut rows = self
                .rows
                .lock()
                .map_err(|_| StoreError::Backend("row lock table poisoned".to_string()))?;
            rows.entry(key.clone()).or_default().clone()
        };
        tokio::time::timeout(self.timeout, row.lock_owned())
            .await
            .map_err(|_| {
                StoreError::LockTimeout(format!(
                    "{key:?} not acquired within {}ms",
                    self.timeout.as_millis()
                ))
            })
    }
}

/// Guards held by one transaction, keyed so re-locking a row it already
/// holds is a no-op.
#[derive(Debug)]
pub struct HeldLocks<K> {
    held: HashMap<K, OwnedMutexGuard<()>>,
}

impl<K> Default for HeldLocks<K> {
    fn default() -> Self {
        Self {
            held: HashMap::new(),
        }
    }
}

impl<K> HeldLocks<K>
where
    K: Eq + Hash + Clone + core::fmt::Debug,
{
    pub async fn lock(&mut self, table: &RowLocks<K>, key: &K) -> Result<(), StoreError> {
        if self.held.contains_key(key) {
            return Ok(());
        }
        let guard = table.acquire(key).await?;
        self.held.insert(key.clone(), guard);
        Ok(())
    }

    pub fn holds(&self, key: &K) -> bool {
        self.held.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out() {
        let table = RowLocks::new(Duration::from_millis(20));
        let mut first = HeldLocks::default();
        first.lock(&table, &"row-1").await.unwrap();

        let mut second = HeldLocks::default();
        let err = second.lock(&table, &"row-1").await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        second.lock(&table, &"row-2").await.unwrap();
        assert!(second.holds(&"row-2"));
    }

    #[tokio::test]
    async fn dropping_the_holder_releases_the_row() {
        let table = RowLocks::new(Duration::from_millis(50));
        {
            let mut first = HeldLocks::default();
            first.lock(&table, &7u32).await.unwrap();
            first.lock(&table, &7u32).await.unwrap();
        }
        let mut second = HeldLocks::default();
        second.lock(&table, &7u32).await.unwrap();
    }
}
