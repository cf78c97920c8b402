//! Rolling deployment controller.
//!
//! A deployment moves replicas from an old application to a new one in
//! bounded steps:
//!
//! ```text
//! Idle --(step interval elapsed)--> Rolling(step) --(step done)--> Idle ... --> Finished
//!                                        |
//!                                        +--(step period exceeded)--> Suspended
//! ```
//!
//! A step issues inner scale transactions and then polls the store. With
//! create-first ordering it grows the new application, waits until the
//! step's target count is ready (checked and healthy where a health check is
//! declared), and only then shrinks the old one. Delete-first is the mirror
//! image.

mod service;

use std::sync::Arc;

use async_trait::async_trait;
use drover_events::{AlertKind, AlertPayload};
use drover_id::TransactionId;
use drover_reconcile::{RollingOrder, RollingStep};
use tracing::{debug, info, instrument, warn};

use crate::clock::elapsed;
use crate::context::Context;
use crate::control::{spawn_loop, ControlLoop, LoopError, LoopHandle, LoopOptions, LoopStatus};
use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{AppStatus, Application, Deployment, DeploymentStatus, RollingState, StepPhase, StepState, TaskGroup};
use crate::status;
use crate::transaction::TransactionService;

pub use service::DeploymentService;

/// Advances every running deployment by at most one phase per tick.
pub struct DeploymentController {
    ctx: Context,
    transactions: Arc<TransactionService>,
}

impl DeploymentController {
    pub fn new(ctx: Context, transactions: Arc<TransactionService>) -> Self {
        Self { ctx, transactions }
    }

    /// Starts the controller loop; it stays closed until opened.
    pub fn spawn(self: Arc<Self>) -> LoopHandle {
        let interval = self.ctx.config.deployments.tick_interval;
        spawn_loop(DeploymentLoop { controller: self }, LoopOptions::new(interval).closed())
    }

    /// One pass over all deployments.
    pub async fn tick(&self) -> SchedulerResult<()> {
        for deployment in self.ctx.store.list_deployments().await? {
            if !deployment.status.is_active() {
                continue;
            }
            let _guard = self
                .ctx
                .locks
                .lock_deployment(&deployment.namespace, &deployment.name)
                .await;
            // Re-read under the lock; an operator may have paused it meanwhile.
            let Some(mut deployment) = self
                .ctx
                .store
                .get_deployment(&deployment.namespace, &deployment.name)
                .await?
            else {
                continue;
            };
            if !deployment.status.is_active() {
                continue;
            }
            if let Err(e) = self.advance(&mut deployment).await {
                warn!(deployment = %deployment.key(), error = %e, "Deployment step failed");
                deployment.message = Some(e.to_string());
            }
            deployment.updated_at = self.ctx.now();
            self.ctx.store.put_deployment(&deployment).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, deployment), fields(deployment = %deployment.key()))]
    async fn advance(&self, deployment: &mut Deployment) -> SchedulerResult<()> {
        let now = self.ctx.now();
        match deployment.rolling.clone() {
            RollingState::Idle => {
                if deployment
                    .last_step_at
                    .is_some_and(|at| elapsed(at, now) < deployment.strategy.step_interval)
                {
                    return Ok(());
                }

                let old = match &deployment.old_app {
                    Some(name) => self.load_app(&deployment.namespace, name).await?,
                    None => None,
                };
                let new = self
                    .load_app(&deployment.namespace, &deployment.new_app)
                    .await?
                    .ok_or_else(|| {
                        SchedulerError::AppNotFound(format!("{}.{}", deployment.namespace, deployment.new_app))
                    })?;

                let old_current = old.as_ref().map_or(0, |a| a.instances);
                let Some(step) = deployment
                    .strategy
                    .rolling
                    .next_step(deployment.instances, old_current, new.instances)
                else {
                    return self.finish(deployment, old, new).await;
                };

                let phase = match deployment.strategy.rolling.order {
                    RollingOrder::CreateFirst => StepPhase::Grow,
                    RollingOrder::DeleteFirst => StepPhase::Shrink,
                };
                let txn_id = self.issue(deployment, phase, &step).await?;
                info!(
                    new_target = step.new_target,
                    old_target = step.old_target,
                    ?phase,
                    "Rolling step started"
                );
                deployment.rolling = RollingState::Rolling(StepState {
                    step,
                    phase,
                    txn_id,
                    started_at: now,
                });
                deployment.message = None;
                Ok(())
            }
            RollingState::Rolling(mut state) => {
                if elapsed(state.started_at, now) > deployment.strategy.step_period {
                    return self.suspend(deployment, &state).await;
                }
                if !self.phase_done(deployment, &state).await? {
                    return Ok(());
                }

                let next_phase = match (deployment.strategy.rolling.order, state.phase) {
                    (RollingOrder::CreateFirst, StepPhase::Grow) => Some(StepPhase::Shrink),
                    (RollingOrder::DeleteFirst, StepPhase::Shrink) => Some(StepPhase::Grow),
                    _ => None,
                };
                match next_phase {
                    Some(phase) => {
                        state.txn_id = self.issue(deployment, phase, &state.step).await?;
                        state.phase = phase;
                        debug!(?phase, "Rolling step entered second phase");
                        deployment.rolling = RollingState::Rolling(state);
                    }
                    None => {
                        deployment.rolling = RollingState::Idle;
                        deployment.last_step_at = Some(now);
                        deployment.steps_completed += 1;
                        info!(steps = deployment.steps_completed, "Rolling step completed");
                        if deployment.strategy.manual {
                            deployment.status = DeploymentStatus::Paused;
                            info!("Paused after step, waiting for resume");
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Submits the scale for one phase. Nothing to do yields `None`.
    async fn issue(
        &self,
        deployment: &Deployment,
        phase: StepPhase,
        step: &RollingStep,
    ) -> SchedulerResult<Option<TransactionId>> {
        let (app, target) = match phase {
            StepPhase::Grow => (Some(&deployment.new_app), step.new_target),
            StepPhase::Shrink => (deployment.old_app.as_ref(), step.old_target),
        };
        let Some(app) = app else {
            return Ok(None);
        };
        let id = self
            .transactions
            .submit_inner_scale(&deployment.namespace, app, target)
            .await?;
        Ok(Some(id))
    }

    async fn phase_done(&self, deployment: &Deployment, state: &StepState) -> SchedulerResult<bool> {
        if let Some(txn_id) = &state.txn_id {
            if self.ctx.store.get_transaction(txn_id).await?.is_some() {
                return Ok(false);
            }
        }
        match state.phase {
            StepPhase::Grow => {
                let groups = self.attached(&deployment.namespace, &deployment.new_app).await?;
                let ready = groups.iter().filter(|g| g.is_ready()).count() as u32;
                Ok(ready >= state.step.new_target)
            }
            StepPhase::Shrink => {
                let Some(old) = &deployment.old_app else {
                    return Ok(true);
                };
                let groups = self.attached(&deployment.namespace, old).await?;
                Ok(groups.len() as u32 <= state.step.old_target)
            }
        }
    }

    async fn suspend(&self, deployment: &mut Deployment, state: &StepState) -> SchedulerResult<()> {
        let message = format!(
            "step to new={} old={} did not complete within {}s",
            state.step.new_target,
            state.step.old_target,
            deployment.strategy.step_period.as_secs()
        );
        warn!(deployment = %deployment.key(), %message, "Deployment suspended");
        deployment.status = DeploymentStatus::Suspended;
        deployment.message = Some(message.clone());
        self.ctx
            .notifier
            .alert(
                AlertPayload::new(AlertKind::DeploymentSuspended, &deployment.namespace, &deployment.name, message)
                    .with_label("new_app", deployment.new_app.clone()),
                &deployment.key(),
                None,
            )
            .await;
        Ok(())
    }

    async fn finish(&self, deployment: &mut Deployment, old: Option<Application>, new: Application) -> SchedulerResult<()> {
        if let Some(old) = old {
            self.transactions.delete(&old.namespace, &old.name, false).await?;
        }
        release_app(&self.ctx, &new.namespace, &new.name).await?;

        deployment.old_app = None;
        deployment.rolling = RollingState::Idle;
        deployment.status = DeploymentStatus::Finished;
        deployment.message = None;
        info!(deployment = %deployment.key(), app = %new.key(), "Deployment finished");
        Ok(())
    }

    async fn load_app(&self, namespace: &str, name: &str) -> SchedulerResult<Option<Application>> {
        Ok(self.ctx.store.get_application(namespace, name).await?)
    }

    async fn attached(&self, namespace: &str, name: &str) -> SchedulerResult<Vec<TaskGroup>> {
        let Some(app) = self.load_app(namespace, name).await? else {
            return Ok(Vec::new());
        };
        Ok(self
            .ctx
            .store
            .list_task_groups(namespace, name)
            .await?
            .into_iter()
            .filter(|g| app.task_groups.get(&g.index()) == Some(&g.id))
            .collect())
    }
}

/// Leaves ROLLING_UPDATE and recomputes the application's status.
pub(crate) async fn release_app(ctx: &Context, namespace: &str, name: &str) -> SchedulerResult<()> {
    let _guard = ctx.locks.lock_app(namespace, name).await;
    let Some(mut app) = ctx.store.get_application(namespace, name).await? else {
        return Ok(());
    };
    if app.status != AppStatus::RollingUpdate {
        return Ok(());
    }
    let groups = ctx.store.list_task_groups(namespace, name).await?;
    let next = status::application_status(app.instances, &groups);
    app.set_status(next, ctx.now());
    app.running_instances = status::running_count(&groups);
    ctx.store.update_application(&app).await?;
    Ok(())
}

struct DeploymentLoop {
    controller: Arc<DeploymentController>,
}

#[async_trait]
impl ControlLoop for DeploymentLoop {
    fn name(&self) -> &str {
        "deployment-controller"
    }

    async fn tick(&mut self) -> Result<LoopStatus, LoopError> {
        self.controller
            .tick()
            .await
            .map(|()| LoopStatus::Continue)
            .map_err(|e| LoopError::Transient(e.to_string()))
    }
}
