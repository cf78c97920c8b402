//! Operator entry points for deployments.

use std::sync::Arc;

use tracing::info;

use super::release_app;
use crate::context::Context;
use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{
    AppStatus, Application, Deployment, DeploymentStatus, DeploymentStrategy, RollingState, Version,
};
use crate::transaction::TransactionService;

pub struct DeploymentService {
    ctx: Context,
    transactions: Arc<TransactionService>,
}

impl DeploymentService {
    pub fn new(ctx: Context, transactions: Arc<TransactionService>) -> Self {
        Self { ctx, transactions }
    }

    /// Starts rolling `old_app` over to a new application built from `version`.
    ///
    /// The new application is created empty; the controller grows it step by
    /// step. Both applications stay ROLLING_UPDATE until the deployment ends.
    pub async fn start_update(
        &self,
        name: &str,
        old_app: &str,
        version: Version,
        strategy: DeploymentStrategy,
    ) -> SchedulerResult<Deployment> {
        self.transactions.validate(&version)?;
        let namespace = version.namespace.clone();
        if version.name == old_app {
            return Err(SchedulerError::InvalidRequest(format!(
                "deployment {name} must roll to a differently named application"
            )));
        }

        let _guard = self.ctx.locks.lock_deployment(&namespace, name).await;
        if let Some(existing) = self.ctx.store.get_deployment(&namespace, name).await? {
            if matches!(
                existing.status,
                DeploymentStatus::Running | DeploymentStatus::Paused | DeploymentStatus::Suspended
            ) {
                return Err(SchedulerError::invalid_state(
                    existing.key(),
                    format!("{:?}", existing.status),
                    "start a deployment",
                ));
            }
        }

        let now = self.ctx.now();
        let instances = {
            let _app = self.ctx.locks.lock_app(&namespace, old_app).await;
            let mut old = self
                .ctx
                .store
                .get_application(&namespace, old_app)
                .await?
                .ok_or_else(|| SchedulerError::AppNotFound(format!("{namespace}.{old_app}")))?;
            if old.status.is_frozen() || old.operation.is_some() {
                return Err(SchedulerError::invalid_state(old.key(), old.status, "roll"));
            }
            old.set_status(AppStatus::RollingUpdate, now);
            self.ctx.store.update_application(&old).await?;
            old.instances
        };

        {
            let _app = self.ctx.locks.lock_app(&namespace, &version.name).await;
            let mut new = Application::new(
                &namespace,
                &version.name,
                self.ctx.cluster_id(),
                version.kind,
                0,
                &version.id,
                now,
            );
            new.set_status(AppStatus::RollingUpdate, now);
            self.ctx.store.create_application(&new).await?;
            self.ctx.store.put_version(&version).await?;
        }

        let deployment = Deployment {
            namespace: namespace.clone(),
            name: name.to_string(),
            old_app: Some(old_app.to_string()),
            new_app: version.name.clone(),
            instances,
            strategy,
            status: DeploymentStatus::Running,
            rolling: RollingState::Idle,
            last_step_at: None,
            steps_completed: 0,
            message: None,
            created_at: now,
            updated_at: now,
        };
        self.ctx.store.put_deployment(&deployment).await?;
        info!(
            deployment = %deployment.key(),
            old_app,
            new_app = %deployment.new_app,
            instances,
            "Deployment started"
        );
        Ok(deployment)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> SchedulerResult<Deployment> {
        self.ctx
            .store
            .get_deployment(namespace, name)
            .await?
            .ok_or_else(|| SchedulerError::DeploymentNotFound(format!("{namespace}.{name}")))
    }

    pub async fn pause(&self, namespace: &str, name: &str) -> SchedulerResult<Deployment> {
        self.transition(namespace, name, "pause", |d| {
            (d.status == DeploymentStatus::Running).then(|| d.status = DeploymentStatus::Paused)
        })
        .await
    }

    /// Resumes a paused or suspended deployment. A step in flight gets a
    /// fresh time budget.
    pub async fn resume(&self, namespace: &str, name: &str) -> SchedulerResult<Deployment> {
        let now = self.ctx.now();
        self.transition(namespace, name, "resume", |d| {
            matches!(d.status, DeploymentStatus::Paused | DeploymentStatus::Suspended).then(|| {
                d.status = DeploymentStatus::Running;
                d.message = None;
                if let RollingState::Rolling(state) = &mut d.rolling {
                    state.started_at = now;
                }
            })
        })
        .await
    }

    /// Abandons the rollout: the old application goes back to its full
    /// replica count and the new one is deleted.
    pub async fn cancel(&self, namespace: &str, name: &str) -> SchedulerResult<Deployment> {
        let deployment = self
            .transition(namespace, name, "cancel", |d| {
                matches!(
                    d.status,
                    DeploymentStatus::Running | DeploymentStatus::Paused | DeploymentStatus::Suspended
                )
                .then(|| {
                    d.status = DeploymentStatus::Cancelled;
                    d.rolling = RollingState::Idle;
                })
            })
            .await?;

        if let Some(old) = &deployment.old_app {
            release_app(&self.ctx, namespace, old).await?;
            self.transactions
                .submit_inner_scale(namespace, old, deployment.instances)
                .await?;
        }
        match self.transactions.delete(namespace, &deployment.new_app, false).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!(deployment = %deployment.key(), "Deployment cancelled");
        Ok(deployment)
    }

    async fn transition(
        &self,
        namespace: &str,
        name: &str,
        action: &'static str,
        apply: impl FnOnce(&mut Deployment) -> Option<()>,
    ) -> SchedulerResult<Deployment> {
        let _guard = self.ctx.locks.lock_deployment(namespace, name).await;
        let mut deployment = self.get(namespace, name).await?;
        let status = deployment.status;
        if apply(&mut deployment).is_none() {
            return Err(SchedulerError::invalid_state(deployment.key(), format!("{status:?}"), action));
        }
        deployment.updated_at = self.ctx.now();
        self.ctx.store.put_deployment(&deployment).await?;
        info!(deployment = %deployment.key(), action, status = ?deployment.status, "Deployment updated");
        Ok(deployment)
    }
}
