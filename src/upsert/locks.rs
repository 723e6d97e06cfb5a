use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::Result;

/// Short-lived locks scoped by name (e.g. one per client identity).
///
/// Entries are dropped as soon as the last guard for a name is released.
#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> Result<OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks = self.locks.lock()?;
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(name).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(AsyncMutex::new(()));
                    locks.insert(name.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        Ok(mutex.lock_owned().await)
    }

    /// Number of names currently locked or awaited.
    pub fn active(&self) -> Result<usize> {
        let locks = self.locks.lock()?;
        Ok(locks.values().filter(|weak| weak.strong_count() > 0).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_name_is_exclusive() {
        let locks = Arc::new(NamedLocks::new());
        let guard = locks.lock("client:1").await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.lock("client:1").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_different_names_do_not_block() {
        let locks = NamedLocks::new();
        let _a = locks.lock("client:1").await.unwrap();
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock("client:2"))
            .await
            .expect("second name must not block")
            .unwrap();
        assert_eq!(locks.active().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_entries_released_with_guards() {
        let locks = NamedLocks::new();
        drop(locks.lock("client:1").await.unwrap());
        assert_eq!(locks.active().unwrap(), 0);
    }
}
