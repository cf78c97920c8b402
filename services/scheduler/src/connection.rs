//! Connection to the resource manager and the leadership it implies.
//!
//! The scheduler leads while it holds a live subscription. Components that
//! must quiesce when that ends (transaction loops, the deployment controller)
//! register as [`RoleObserver`]s.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::clock::{elapsed, SharedClock};
use crate::config::HeartbeatConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// Notified on every leadership change.
#[async_trait]
pub trait RoleObserver: Send + Sync {
    async fn on_role_change(&self, role: Role);
}

#[derive(Debug)]
struct State {
    role: Role,
    framework_id: Option<String>,
    endpoint: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    heartbeat_interval: Duration,
}

/// Shared view of the subscription.
pub struct ClusterConnection {
    state: RwLock<State>,
    observers: RwLock<Vec<Arc<dyn RoleObserver>>>,
    clock: SharedClock,
    healthy_multiple: u32,
}

impl ClusterConnection {
    pub fn new(config: &HeartbeatConfig, clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(State {
                role: Role::Follower,
                framework_id: None,
                endpoint: None,
                last_heartbeat: None,
                heartbeat_interval: config.interval,
            }),
            observers: RwLock::new(Vec::new()),
            clock,
            healthy_multiple: config.healthy_multiple.max(1),
        }
    }

    pub fn observe(&self, observer: Arc<dyn RoleObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn role(&self) -> Role {
        self.state.read().unwrap_or_else(PoisonError::into_inner).role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn framework_id(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .framework_id
            .clone()
    }

    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).endpoint = Some(endpoint.into());
    }

    pub fn endpoint(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .endpoint
            .clone()
    }

    async fn transition(&self, role: Role) {
        let changed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let changed = state.role != role;
            state.role = role;
            changed
        };
        if !changed {
            return;
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_role_change(role).await;
        }
    }

    /// Records a SUBSCRIBED event and takes leadership.
    pub async fn on_subscribed(&self, framework_id: &str, heartbeat_interval: Option<Duration>) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.framework_id = Some(framework_id.to_string());
            state.last_heartbeat = Some(self.clock.now());
            if let Some(interval) = heartbeat_interval {
                state.heartbeat_interval = interval;
            }
        }
        info!(framework_id = %framework_id, "Subscribed, taking leadership");
        self.transition(Role::Leader).await;
    }

    /// Drops leadership after the subscription ended or errored.
    pub async fn on_disconnected(&self, reason: &str) {
        if self.is_leader() {
            warn!(reason = %reason, "Subscription lost, giving up leadership");
        }
        self.transition(Role::Follower).await;
    }

    pub fn record_heartbeat(&self) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).last_heartbeat = Some(self.clock.now());
    }

    /// Whether heartbeats arrive within `interval * healthy_multiple`.
    pub fn is_healthy(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(last) = state.last_heartbeat else {
            return false;
        };
        elapsed(last, self.clock.now()) <= state.heartbeat_interval * self.healthy_multiple
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Role>>);

    #[async_trait]
    impl RoleObserver for Recorder {
        async fn on_role_change(&self, role: Role) {
            self.0.lock().unwrap().push(role);
        }
    }

    #[tokio::test]
    async fn test_observers_see_each_change_once() {
        let clock = Arc::new(ManualClock::at_epoch());
        let conn = ClusterConnection::new(&HeartbeatConfig::default(), clock);
        let recorder = Arc::new(Recorder::default());
        conn.observe(recorder.clone());

        conn.on_subscribed("fw-1", None).await;
        conn.on_subscribed("fw-1", None).await;
        conn.on_disconnected("stream closed").await;
        conn.on_disconnected("stream closed").await;

        assert_eq!(*recorder.0.lock().unwrap(), vec![Role::Leader, Role::Follower]);
        assert_eq!(conn.framework_id().as_deref(), Some("fw-1"));
    }

    #[tokio::test]
    async fn test_heartbeat_health() {
        let clock = Arc::new(ManualClock::at_epoch());
        let conn = ClusterConnection::new(&HeartbeatConfig::default(), clock.clone());
        assert!(!conn.is_healthy());

        conn.on_subscribed("fw-1", Some(Duration::from_secs(10))).await;
        clock.advance(Duration::from_secs(25));
        assert!(conn.is_healthy());
        clock.advance(Duration::from_secs(10));
        assert!(!conn.is_healthy());

        conn.record_heartbeat();
        assert!(conn.is_healthy());
    }
}
