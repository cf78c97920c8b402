//! Entry points that turn requests into transactions.

use std::sync::Arc;
use std::time::Duration;

use drover_id::{TaskGroupId, TransactionId};
use tracing::info;

use super::TransactionRunner;
use crate::context::Context;
use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{
    AppStatus, Application, DeleteOp, LaunchOp, Operation, RescheduleOp, Resource, ScaleOp, Transaction,
    UpdateOp, UpdateResourceOp, Version,
};
use crate::placement;

/// Validates requests against current application state and submits the
/// matching transaction.
///
/// User-facing operations take ownership of the application (status
/// OPERATING) until their transaction ends; inner ones do not.
pub struct TransactionService {
    ctx: Context,
    runner: Arc<TransactionRunner>,
}

impl TransactionService {
    pub fn new(ctx: Context, runner: Arc<TransactionRunner>) -> Self {
        Self { ctx, runner }
    }

    pub fn runner(&self) -> &Arc<TransactionRunner> {
        &self.runner
    }

    fn life_period(&self) -> Duration {
        self.ctx.config.transactions.default_life_period
    }

    pub(crate) fn validate(&self, version: &Version) -> SchedulerResult<()> {
        if version.containers.is_empty() {
            return Err(SchedulerError::InvalidRequest(format!(
                "{}.{} declares no containers",
                version.namespace, version.name
            )));
        }
        placement::validate_constraints(&version.effective_constraints()).map_err(SchedulerError::InvalidRequest)?;
        // Rejects names that could not form pod ids.
        TaskGroupId::new(0, &version.name, &version.namespace, self.ctx.cluster_id(), 1)?;
        Ok(())
    }

    async fn load_idle(&self, namespace: &str, name: &str, action: &'static str) -> SchedulerResult<Application> {
        let app = self
            .ctx
            .store
            .get_application(namespace, name)
            .await?
            .ok_or_else(|| SchedulerError::AppNotFound(format!("{namespace}.{name}")))?;
        if app.status.is_frozen() || app.operation.is_some() {
            return Err(SchedulerError::invalid_state(app.key(), app.status, action));
        }
        Ok(app)
    }

    async fn take(&self, app: &mut Application, txn: &Transaction) -> SchedulerResult<()> {
        let now = self.ctx.now();
        app.operation = Some(txn.id);
        app.set_status(AppStatus::Operating, now);
        app.updated_at = now;
        self.ctx.store.update_application(app).await?;
        Ok(())
    }

    /// Stores the first version of a new application and launches it.
    pub async fn create_application(&self, version: Version) -> SchedulerResult<TransactionId> {
        self.validate(&version)?;
        let _guard = self.ctx.locks.lock_app(&version.namespace, &version.name).await;

        let now = self.ctx.now();
        let mut app = Application::new(
            &version.namespace,
            &version.name,
            self.ctx.cluster_id(),
            version.kind,
            version.instances,
            &version.id,
            now,
        );
        let txn = Transaction::new(
            &version.namespace,
            &version.name,
            Operation::Launch(LaunchOp {
                version_id: version.id.clone(),
                instances: version.instances,
                launched: 0,
            }),
            now,
            self.life_period(),
        );
        app.operation = Some(txn.id);

        self.ctx.store.create_application(&app).await?;
        self.ctx.store.put_version(&version).await?;
        info!(app = %app.key(), version = %version.id, instances = version.instances, "Application created");
        self.runner.submit(txn).await
    }

    pub async fn scale(&self, namespace: &str, name: &str, instances: u32) -> SchedulerResult<TransactionId> {
        let _guard = self.ctx.locks.lock_app(namespace, name).await;
        let mut app = self.load_idle(namespace, name, "scale").await?;
        let txn = Transaction::new(
            namespace,
            name,
            Operation::Scale(ScaleOp {
                version_id: app.current_version.clone(),
                target: instances,
                launched: 0,
            }),
            self.ctx.now(),
            self.life_period(),
        );
        self.take(&mut app, &txn).await?;
        self.runner.submit(txn).await
    }

    /// Replaces every pod with one built from `version`.
    pub async fn update(&self, version: Version) -> SchedulerResult<TransactionId> {
        self.validate(&version)?;
        let _guard = self.ctx.locks.lock_app(&version.namespace, &version.name).await;
        let mut app = self.load_idle(&version.namespace, &version.name, "update").await?;

        self.ctx.store.put_version(&version).await?;
        app.current_version = version.id.clone();
        let txn = Transaction::new(
            &version.namespace,
            &version.name,
            Operation::Update(UpdateOp {
                version_id: version.id.clone(),
                indices: app.task_groups.keys().copied().collect(),
                cursor: 0,
                phase: Default::default(),
            }),
            self.ctx.now(),
            self.life_period(),
        );
        self.take(&mut app, &txn).await?;
        self.runner.submit(txn).await
    }

    /// Operator-requested rebuild of one pod. Does not take the application.
    pub async fn reschedule(&self, id: &TaskGroupId, force: bool) -> SchedulerResult<TransactionId> {
        let (namespace, name) = (id.namespace(), id.app());
        let _guard = self.ctx.locks.lock_app(namespace, name).await;
        let app = self.load_idle(namespace, name, "reschedule").await?;
        let group = self
            .ctx
            .store
            .get_task_group(id)
            .await?
            .ok_or_else(|| SchedulerError::TaskGroupNotFound(id.to_string()))?;
        if self.has_live_reschedule(id).await? {
            return Err(SchedulerError::invalid_state(id.to_string(), "rescheduling", "reschedule"));
        }

        let version = self.ctx.store.get_version(namespace, name, &group.version_id).await?;
        let retention = version
            .and_then(|v| v.restart_policy.retention_secs)
            .unwrap_or(self.ctx.config.reschedule.default_host_retention.as_secs());
        let op = RescheduleOp {
            task_group_id: id.clone(),
            force,
            phase: Default::default(),
            resched_times: group.resched_times,
            retain_host: (retention > 0).then(|| group.hostname.clone()),
            retention_secs: retention,
            retain_until: None,
        };
        let txn = Transaction::new(
            &app.namespace,
            &app.name,
            Operation::Reschedule(op),
            self.ctx.now(),
            self.ctx.config.reschedule.max_life_period,
        );
        self.runner.submit(txn).await
    }

    /// Removes an application in any status. Supersedes a running operation.
    pub async fn delete(&self, namespace: &str, name: &str, enforce: bool) -> SchedulerResult<TransactionId> {
        let _guard = self.ctx.locks.lock_app(namespace, name).await;
        let mut app = self
            .ctx
            .store
            .get_application(namespace, name)
            .await?
            .ok_or_else(|| SchedulerError::AppNotFound(format!("{namespace}.{name}")))?;
        let txn = Transaction::new(
            namespace,
            name,
            Operation::Delete(DeleteOp { enforce }),
            self.ctx.now(),
            self.life_period(),
        );
        self.take(&mut app, &txn).await?;
        self.runner.submit(txn).await
    }

    /// Grows every pod's reservation by `delta` without replacing it.
    pub async fn update_resources(&self, namespace: &str, name: &str, delta: Resource) -> SchedulerResult<TransactionId> {
        if delta.is_zero() {
            return Err(SchedulerError::InvalidRequest("empty resource delta".to_string()));
        }
        let _guard = self.ctx.locks.lock_app(namespace, name).await;
        let mut app = self.load_idle(namespace, name, "update resources").await?;
        let txn = Transaction::new(
            namespace,
            name,
            Operation::UpdateResource(UpdateResourceOp {
                delta,
                indices: app.task_groups.keys().copied().collect(),
                cursor: 0,
                attempts: 0,
                next_attempt_at: None,
            }),
            self.ctx.now(),
            self.life_period(),
        );
        self.take(&mut app, &txn).await?;
        self.runner.submit(txn).await
    }

    // =========================================================================
    // Inner transactions
    // =========================================================================

    /// Scale issued by the deployment controller. Leaves the application
    /// status and ownership alone.
    pub async fn submit_inner_scale(&self, namespace: &str, name: &str, target: u32) -> SchedulerResult<TransactionId> {
        let version_id = {
            let _guard = self.ctx.locks.lock_app(namespace, name).await;
            self.ctx
                .store
                .get_application(namespace, name)
                .await?
                .ok_or_else(|| SchedulerError::AppNotFound(format!("{namespace}.{name}")))?
                .current_version
        };
        let txn = Transaction::new(
            namespace,
            name,
            Operation::InnerScale(ScaleOp {
                version_id,
                target,
                launched: 0,
            }),
            self.ctx.now(),
            self.life_period(),
        )
        .inner();
        self.runner.submit(txn).await
    }

    /// Reschedule issued by the status pipeline. The caller may hold the
    /// application lock.
    pub async fn submit_inner_reschedule(
        &self,
        namespace: &str,
        name: &str,
        op: RescheduleOp,
        delay: Duration,
    ) -> SchedulerResult<TransactionId> {
        let txn = Transaction::new(
            namespace,
            name,
            Operation::Reschedule(op),
            self.ctx.now(),
            self.ctx.config.reschedule.max_life_period,
        )
        .with_delay(delay)
        .inner();
        self.runner.submit(txn).await
    }

    /// Whether a non-terminal reschedule already targets this pod.
    pub async fn has_live_reschedule(&self, id: &TaskGroupId) -> SchedulerResult<bool> {
        Ok(self.ctx.store.list_transactions().await?.iter().any(|t| {
            !t.is_terminal() && matches!(&t.operation, Operation::Reschedule(op) if &op.task_group_id == id)
        }))
    }
}
