//! In-process driver for tests and local runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ClusterDriver, DriverError, DriverResult, EventStream, ExecutorMessage, FrameworkInfo, SchedulerEvent};
use crate::builder::LaunchGroup;

/// A call received by [`MockDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Subscribe { framework_id: Option<String> },
    Launch(LaunchGroup),
    Decline { offer_ids: Vec<String>, refuse: Duration },
    Shutdown { agent_id: String, executor_id: String },
    Acknowledge { agent_id: String, task_id: String, uuid: String },
    Message { agent_id: String, executor_id: String, message: ExecutorMessage },
    Reconcile { tasks: Vec<(String, String)> },
}

/// Driver that records every call and replays injected events.
#[derive(Default)]
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    events: Mutex<Option<mpsc::UnboundedSender<SchedulerEvent>>>,
    fail_launch: AtomicBool,
    fail_message: AtomicBool,
    fail_shutdown: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls_lock(&self) -> MutexGuard<'_, Vec<DriverCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: DriverCall) {
        debug!(?call, "[MOCK] Driver call");
        self.calls_lock().push(call);
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_message(&self, fail: bool) {
        self.fail_message.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_shutdown(&self, fail: bool) {
        self.fail_shutdown.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls_lock().clone()
    }

    pub fn clear(&self) {
        self.calls_lock().clear();
    }

    pub fn launches(&self) -> Vec<LaunchGroup> {
        self.calls_lock()
            .iter()
            .filter_map(|c| match c {
                DriverCall::Launch(group) => Some(group.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn declined(&self) -> Vec<String> {
        self.calls_lock()
            .iter()
            .filter_map(|c| match c {
                DriverCall::Decline { offer_ids, .. } => Some(offer_ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.calls_lock()
            .iter()
            .filter_map(|c| match c {
                DriverCall::Shutdown { executor_id, .. } => Some(executor_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<ExecutorMessage> {
        self.calls_lock()
            .iter()
            .filter_map(|c| match c {
                DriverCall::Message { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Delivers an event on the current subscription. Returns false when nobody subscribed.
    pub fn push_event(&self, event: SchedulerEvent) -> bool {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.as_ref().is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Ends the current subscription stream.
    pub fn disconnect(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[async_trait]
impl ClusterDriver for MockDriver {
    async fn subscribe(&self, framework: &FrameworkInfo) -> DriverResult<EventStream> {
        self.record(DriverCall::Subscribe {
            framework_id: framework.id.clone(),
        });
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(DriverError::Rejected("mock subscribe failure".into()));
        }

        info!(framework = %framework.name, "[MOCK] Subscribed");
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let events = stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((Ok(event), rx))
        });
        Ok(events.boxed())
    }

    async fn launch(&self, group: &LaunchGroup) -> DriverResult<()> {
        self.record(DriverCall::Launch(group.clone()));
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(DriverError::Rejected("mock launch failure".into()));
        }
        Ok(())
    }

    async fn decline(&self, offer_ids: &[String], refuse: Duration) -> DriverResult<()> {
        if !offer_ids.is_empty() {
            self.record(DriverCall::Decline {
                offer_ids: offer_ids.to_vec(),
                refuse,
            });
        }
        Ok(())
    }

    async fn shutdown(&self, agent_id: &str, executor_id: &str) -> DriverResult<()> {
        self.record(DriverCall::Shutdown {
            agent_id: agent_id.to_string(),
            executor_id: executor_id.to_string(),
        });
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(DriverError::Rejected("mock shutdown failure".into()));
        }
        Ok(())
    }

    async fn acknowledge(&self, agent_id: &str, task_id: &str, uuid: &str) -> DriverResult<()> {
        self.record(DriverCall::Acknowledge {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            uuid: uuid.to_string(),
        });
        Ok(())
    }

    async fn message(&self, agent_id: &str, executor_id: &str, message: &ExecutorMessage) -> DriverResult<()> {
        self.record(DriverCall::Message {
            agent_id: agent_id.to_string(),
            executor_id: executor_id.to_string(),
            message: message.clone(),
        });
        if self.fail_message.load(Ordering::SeqCst) {
            return Err(DriverError::Rejected("mock message failure".into()));
        }
        Ok(())
    }

    async fn reconcile(&self, tasks: &[(String, String)]) -> DriverResult<()> {
        self.record(DriverCall::Reconcile {
            tasks: tasks.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    #[tokio::test]
    async fn test_injected_events_reach_the_stream() {
        let driver = MockDriver::new();
        assert!(!driver.push_event(SchedulerEvent::Heartbeat));

        let framework = FrameworkInfo::from_config(&ClusterConfig::default(), None);
        let mut events = driver.subscribe(&framework).await.unwrap();
        assert!(driver.push_event(SchedulerEvent::Heartbeat));
        assert_eq!(events.next().await.unwrap().unwrap(), SchedulerEvent::Heartbeat);

        driver.disconnect();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_launch_is_still_recorded() {
        let driver = MockDriver::new();
        driver.set_fail_launch(true);
        let group = LaunchGroup {
            offer_id: "o1".into(),
            agent_id: "a1".into(),
            executor: crate::builder::ExecutorInfo {
                executor_id: "exec".into(),
                resources: crate::builder::EXECUTOR_RESOURCES,
            },
            tasks: vec![],
        };
        assert!(driver.launch(&group).await.is_err());
        assert_eq!(driver.launches().len(), 1);
    }
}
