//! Turns raw status reports into pod and application state.

use std::sync::{Arc, Mutex, PoisonError};

use drover_events::{AlertKind, AlertPayload, EndpointChange};
use drover_id::{TaskGroupId, TaskId};
use drover_reconcile::RetryTracker;
use tracing::{debug, info, instrument, warn};

use super::policy::{Decision, ReschedulePolicy};
use crate::clock::elapsed;
use crate::context::Context;
use crate::driver::StatusUpdate;
use crate::error::SchedulerResult;
use crate::model::{RestartPolicy, TaskGroup, TaskGroupStatus, TaskStatus};
use crate::transaction::TransactionService;

/// Applies status and health reports under the owning application's lock.
pub struct StatusPipeline {
    ctx: Context,
    transactions: Arc<TransactionService>,
    policy: ReschedulePolicy,
    orphans: Mutex<RetryTracker>,
}

impl StatusPipeline {
    pub fn new(ctx: Context, transactions: Arc<TransactionService>) -> Self {
        let config = &ctx.config.reschedule;
        let orphans = RetryTracker::new(config.orphan_kill_retries, config.orphan_kill_window);
        let policy = ReschedulePolicy::new(config.clone());
        Self {
            ctx,
            transactions,
            policy,
            orphans: Mutex::new(orphans),
        }
    }

    /// Applies one UPDATE event and acknowledges it.
    ///
    /// The acknowledgement is withheld when applying failed, so the resource
    /// manager redelivers the update.
    #[instrument(skip(self, update), fields(task_id = %update.task_id, state = ?update.state))]
    pub async fn handle_update(&self, update: &StatusUpdate) -> SchedulerResult<()> {
        self.apply(update).await?;

        if let (Some(uuid), Some(agent_id)) = (&update.uuid, &update.agent_id) {
            if let Err(e) = self.ctx.driver.acknowledge(agent_id, &update.task_id, uuid).await {
                warn!(error = %e, "Acknowledge failed");
            }
        }
        Ok(())
    }

    async fn apply(&self, update: &StatusUpdate) -> SchedulerResult<()> {
        let task_id = match TaskId::parse(&update.task_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Status update for a task we did not launch");
                return Ok(());
            }
        };
        let group_id = task_id.task_group_id().clone();
        let _guard = self.ctx.locks.lock_app(group_id.namespace(), group_id.app()).await;

        let Some(mut group) = self.ctx.store.get_task_group(&group_id).await? else {
            self.kill_orphan(&group_id, update).await;
            return Ok(());
        };
        let prev = group.status;

        let Some(task) = group.task_mut(&task_id) else {
            self.kill_orphan(&group_id, update).await;
            return Ok(());
        };
        if task.updated_at.is_some_and(|at| update.timestamp < at) {
            debug!("Ignoring out-of-order update");
            return Ok(());
        }
        if task.status.is_terminal() && task.status != update.state {
            debug!(current = ?task.status, "Ignoring update after terminal status");
            return Ok(());
        }

        task.status = update.state;
        task.updated_at = Some(update.timestamp);
        task.message = update.message.clone().or_else(|| update.reason.clone());
        task.raw_status = Some(update.raw.clone());
        if let Some(healthy) = update.healthy {
            task.healthy = Some(healthy);
        }

        self.settle(group, prev).await
    }

    /// Marks every live task of a pod LOST, as the consistency sweep or an
    /// agent failure reports it.
    pub async fn mark_lost(&self, id: &TaskGroupId, reason: &str) -> SchedulerResult<()> {
        let _guard = self.ctx.locks.lock_app(id.namespace(), id.app()).await;
        let Some(mut group) = self.ctx.store.get_task_group(id).await? else {
            return Ok(());
        };
        let prev = group.status;
        let now = self.ctx.now();
        for task in group.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            task.status = TaskStatus::Lost;
            task.updated_at = Some(now);
            task.message = Some(reason.to_string());
        }
        self.settle(group, prev).await
    }

    /// Marks LOST every pod placed on an agent that went away.
    pub async fn agent_lost(&self, agent_id: &str) -> SchedulerResult<usize> {
        let mut lost = 0;
        for app in self.ctx.store.list_applications().await? {
            for id in app.task_groups.values() {
                let on_agent = self
                    .ctx
                    .store
                    .get_task_group(id)
                    .await?
                    .is_some_and(|g| g.agent_id == agent_id && !g.status.is_end());
                if on_agent {
                    self.mark_lost(id, &format!("agent {agent_id} lost")).await?;
                    lost += 1;
                }
            }
        }
        Ok(lost)
    }

    /// Executor health report for one task.
    pub async fn handle_health(&self, task_id: &str, healthy: bool) -> SchedulerResult<()> {
        let task_id = TaskId::parse(task_id)?;
        let group_id = task_id.task_group_id().clone();
        let _guard = self.ctx.locks.lock_app(group_id.namespace(), group_id.app()).await;

        let Some(mut group) = self.ctx.store.get_task_group(&group_id).await? else {
            return Ok(());
        };
        let Some(task) = group.task_mut(&task_id) else {
            return Ok(());
        };
        let was = task.healthy.replace(healthy);
        if was == Some(healthy) {
            return Ok(());
        }

        group.updated_at = self.ctx.now();
        self.ctx.store.put_task_group(&group).await?;
        self.ctx.notifier.endpoint(EndpointChange::Updated, &group).await;

        if !healthy && was != Some(false) {
            warn!(task_id = %task_id, "Task became unhealthy");
            self.ctx
                .notifier
                .alert(
                    AlertPayload::new(
                        AlertKind::TaskGroupUnhealthy,
                        group_id.namespace(),
                        group_id.app(),
                        format!("task {task_id} failed its health check"),
                    )
                    .with_label("hostname", group.hostname.clone()),
                    &group_id.to_string(),
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Everything after a task changed: pod status, counters, persistence,
    /// application status, notifications, reschedule.
    async fn settle(&self, mut group: TaskGroup, prev: TaskGroupStatus) -> SchedulerResult<()> {
        let now = self.ctx.now();
        let next = super::refresh_task_group(&mut group);

        if next == TaskGroupStatus::Running {
            group.running_since.get_or_insert(now);
        } else if let Some(since) = group.running_since.take() {
            if elapsed(since, now) > self.ctx.config.reschedule.reset_interval && group.resched_times > 0 {
                info!(task_group_id = %group.id, "Stable long enough, reschedule counter reset");
                group.resched_times = 0;
                group.last_resched_time = None;
            }
        }
        group.updated_at = now;
        self.ctx.store.put_task_group(&group).await?;

        let (namespace, name) = (group.id.namespace().to_string(), group.id.app().to_string());
        let Some(mut app) = self.ctx.store.get_application(&namespace, &name).await? else {
            return Ok(());
        };
        let attached = app.task_groups.get(&group.index()) == Some(&group.id);

        let groups: Vec<TaskGroup> = self
            .ctx
            .store
            .list_task_groups(&namespace, &name)
            .await?
            .into_iter()
            .filter(|g| app.task_groups.get(&g.index()) == Some(&g.id))
            .collect();
        app.running_instances = super::running_count(&groups);
        if !app.status.is_frozen() {
            let status = super::application_status(app.instances, &groups);
            if app.set_status(status, now) {
                info!(app = %app.key(), status = %status, "Application status changed");
            }
        }
        app.updated_at = now;
        self.ctx.store.update_application(&app).await?;

        if next == prev {
            return Ok(());
        }
        debug!(task_group_id = %group.id, from = %prev, to = %next, "Pod status changed");
        self.ctx.notifier.endpoint(EndpointChange::Updated, &group).await;

        if next == TaskGroupStatus::Lost {
            self.ctx
                .notifier
                .alert(
                    AlertPayload::new(
                        AlertKind::TaskGroupLost,
                        &namespace,
                        &name,
                        format!("pod {} on {} is lost", group.id, group.hostname),
                    )
                    .with_label("hostname", group.hostname.clone()),
                    &group.id.to_string(),
                    None,
                )
                .await;
        }

        // Pods being stopped on purpose are not rescheduled.
        if next.triggers_reschedule() && attached && group.kill_requested_at.is_none() {
            self.reschedule(&group, next).await?;
        }
        Ok(())
    }

    async fn reschedule(&self, group: &TaskGroup, status: TaskGroupStatus) -> SchedulerResult<()> {
        if self.transactions.has_live_reschedule(&group.id).await? {
            debug!(task_group_id = %group.id, "Reschedule already pending");
            return Ok(());
        }

        let (namespace, name) = (group.id.namespace(), group.id.app());
        let restart = self
            .ctx
            .store
            .get_version(namespace, name, &group.version_id)
            .await?
            .map(|v| v.restart_policy)
            .unwrap_or_else(RestartPolicy::default);

        match self.policy.decide(group, status, &restart) {
            Decision::Skip => {
                debug!(task_group_id = %group.id, status = %status, "Restart policy skips pod");
            }
            Decision::Exhausted { resched_times } => {
                warn!(task_group_id = %group.id, resched_times, "Reschedule limit reached");
                self.ctx
                    .notifier
                    .alert(
                        AlertPayload::new(
                            AlertKind::RescheduleExhausted,
                            namespace,
                            name,
                            format!("pod {} stays {status} after {resched_times} reschedules", group.id),
                        ),
                        &group.id.to_string(),
                        None,
                    )
                    .await;
            }
            Decision::Reschedule { op, delay } => {
                info!(
                    task_group_id = %group.id,
                    resched_times = op.resched_times,
                    delay_secs = delay.as_secs(),
                    "Scheduling reschedule"
                );
                self.transactions
                    .submit_inner_reschedule(namespace, name, op, delay)
                    .await?;
            }
        }
        Ok(())
    }

    /// Asks the resource manager to stop a task we no longer track.
    async fn kill_orphan(&self, group_id: &TaskGroupId, update: &StatusUpdate) {
        if !update.state.is_live() {
            return;
        }
        let Some(agent_id) = &update.agent_id else {
            return;
        };
        let key = group_id.to_string();
        let (exhausted, tracked) = {
            let mut orphans = self.orphans.lock().unwrap_or_else(PoisonError::into_inner);
            orphans.prune();
            (orphans.record_failure(&key), orphans.len())
        };
        if exhausted {
            debug!(task_group_id = %key, "Orphan shutdown rate limited");
            return;
        }
        warn!(task_group_id = %key, agent_id = %agent_id, tracked, "Shutting down unknown pod");
        if let Err(e) = self.ctx.driver.shutdown(agent_id, &group_id.executor_id()).await {
            warn!(task_group_id = %key, error = %e, "Orphan shutdown failed");
        }
    }
}
