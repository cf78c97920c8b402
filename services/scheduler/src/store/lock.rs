//! Advisory locks.
//!
//! Every mutation of an application's state happens under its lock. In-place
//! resource updates additionally take the node lock; the order is always
//! application before node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A set of named async mutexes created on first use.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on are dropped here.
            locks.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.try_lock_owned().ok()
    }
}

/// Lock namespaces used by the scheduler.
#[derive(Debug, Default)]
pub struct LockManager {
    apps: KeyedLocks,
    nodes: KeyedLocks,
    deployments: KeyedLocks,
    commands: KeyedLocks,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_app(&self, namespace: &str, name: &str) -> OwnedMutexGuard<()> {
        self.apps.lock(&format!("{namespace}.{name}")).await
    }

    pub async fn lock_node(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        self.nodes.lock(agent_id).await
    }

    pub async fn lock_deployment(&self, namespace: &str, name: &str) -> OwnedMutexGuard<()> {
        self.deployments.lock(&format!("{namespace}.{name}")).await
    }

    pub async fn lock_command(&self, id: &str) -> OwnedMutexGuard<()> {
        self.commands.lock(id).await
    }

    /// Non-blocking variant for loops that would rather skip a busy app.
    pub fn try_lock_app(&self, namespace: &str, name: &str) -> Option<OwnedMutexGuard<()>> {
        self.apps.try_lock(&format!("{namespace}.{name}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = LockManager::new();
        let guard = locks.lock_app("prod", "web").await;
        assert!(locks.try_lock_app("prod", "web").is_none());
        assert!(locks.try_lock_app("prod", "api").is_some());
        drop(guard);
        assert!(locks.try_lock_app("prod", "web").is_some());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let locks = Arc::new(LockManager::new());
        let guard = locks.lock_node("agent-1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock_node("agent-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
