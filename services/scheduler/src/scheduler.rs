//! Scheduler facade: subscription, event dispatch and the offer tick.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::command::CommandService;
use crate::connection::{Role, RoleObserver};
use crate::context::Context;
use crate::control::{retry_with_backoff, BackoffPolicy, LoopError, LoopHandle};
use crate::deployment::{DeploymentController, DeploymentService};
use crate::driver::{ExecutorReport, FrameworkInfo, SchedulerEvent};
use crate::error::SchedulerResult;
use crate::status::StatusPipeline;
use crate::transaction::{TransactionEngine, TransactionRunner, TransactionService};

/// Opens a loop while leading, closes it otherwise.
#[derive(Default)]
struct LoopGate {
    handle: Mutex<Option<LoopHandle>>,
}

impl LoopGate {
    fn set(&self, handle: LoopHandle, open: bool) {
        if open {
            if let Err(e) = handle.open() {
                warn!(loop_name = handle.name(), error = %e, "Could not open loop");
            }
        }
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn take(&self) -> Option<LoopHandle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl RoleObserver for LoopGate {
    async fn on_role_change(&self, role: Role) {
        let guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = guard.as_ref() else {
            return;
        };
        let result = match role {
            Role::Leader => handle.open(),
            Role::Follower => handle.close(),
        };
        if let Err(e) = result {
            warn!(loop_name = handle.name(), error = %e, "Control signal dropped");
        }
    }
}

/// Owns every scheduler component and feeds them the resource manager's events.
pub struct Scheduler {
    ctx: Context,
    runner: Arc<TransactionRunner>,
    transactions: Arc<TransactionService>,
    pipeline: StatusPipeline,
    controller: Arc<DeploymentController>,
    deployments: DeploymentService,
    commands: CommandService,
    deployment_gate: Arc<LoopGate>,
}

impl Scheduler {
    pub fn new(ctx: Context) -> Arc<Self> {
        let engine = Arc::new(TransactionEngine::new(ctx.clone()));
        let runner = TransactionRunner::new(engine);
        let transactions = Arc::new(TransactionService::new(ctx.clone(), Arc::clone(&runner)));
        let deployment_gate = Arc::new(LoopGate::default());

        ctx.connection.observe(runner.clone());
        ctx.connection.observe(deployment_gate.clone());

        Arc::new(Self {
            pipeline: StatusPipeline::new(ctx.clone(), Arc::clone(&transactions)),
            controller: Arc::new(DeploymentController::new(ctx.clone(), Arc::clone(&transactions))),
            deployments: DeploymentService::new(ctx.clone(), Arc::clone(&transactions)),
            commands: CommandService::new(ctx.clone()),
            ctx,
            runner,
            transactions,
            deployment_gate,
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn transactions(&self) -> &Arc<TransactionService> {
        &self.transactions
    }

    pub fn runner(&self) -> &Arc<TransactionRunner> {
        &self.runner
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        self.runner.engine()
    }

    pub fn pipeline(&self) -> &StatusPipeline {
        &self.pipeline
    }

    pub fn deployments(&self) -> &DeploymentService {
        &self.deployments
    }

    pub fn controller(&self) -> &Arc<DeploymentController> {
        &self.controller
    }

    pub fn commands(&self) -> &CommandService {
        &self.commands
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Dispatches one event from the subscription stream.
    #[instrument(skip(self, event), fields(event = event.kind()))]
    pub async fn handle_event(&self, event: SchedulerEvent) -> SchedulerResult<()> {
        match event {
            SchedulerEvent::Subscribed {
                framework_id,
                heartbeat_interval,
            } => {
                self.ctx.store.save_framework_id(&framework_id).await?;
                self.ctx
                    .connection
                    .on_subscribed(&framework_id, heartbeat_interval)
                    .await;
                if let Err(e) = self.reconcile_tasks().await {
                    warn!(error = %e, "Task reconciliation request failed");
                }
            }
            SchedulerEvent::Offers(offers) => {
                let count = offers.len();
                self.ctx.offers.add_offers(offers);
                debug!(count, held = self.ctx.offers.len(), "Offers received");
            }
            SchedulerEvent::Rescind { offer_id } => {
                if self.ctx.offers.rescind(&offer_id) {
                    debug!(offer_id = %offer_id, "Offer rescinded");
                }
            }
            SchedulerEvent::Update(update) => self.pipeline.handle_update(&update).await?,
            SchedulerEvent::Message {
                agent_id,
                executor_id,
                report,
            } => self.handle_report(&agent_id, &executor_id, report).await?,
            SchedulerEvent::Failure {
                agent_id,
                executor_id: None,
                ..
            } => {
                warn!(agent_id = %agent_id, "Agent lost");
                let now = self.ctx.now();
                let dropped = self
                    .ctx
                    .offers
                    .mark_lost(&agent_id, now, self.ctx.config.offers.lost_node_ttl);
                self.decline(dropped.into_iter().map(|o| o.id).collect()).await;
                let pods = self.pipeline.agent_lost(&agent_id).await?;
                info!(agent_id = %agent_id, pods, "Pods on lost agent marked LOST");
            }
            SchedulerEvent::Failure {
                agent_id,
                executor_id: Some(executor_id),
                status,
            } => {
                debug!(agent_id = %agent_id, executor_id = %executor_id, ?status, "Executor exited");
            }
            SchedulerEvent::Error { message } => {
                error!(message = %message, "Resource manager reported an error");
                self.ctx.connection.on_disconnected(&message).await;
            }
            SchedulerEvent::Heartbeat => self.ctx.connection.record_heartbeat(),
        }
        Ok(())
    }

    async fn handle_report(&self, agent_id: &str, executor_id: &str, report: ExecutorReport) -> SchedulerResult<()> {
        match report {
            ExecutorReport::Health { task_id, healthy } => self.pipeline.handle_health(&task_id, healthy).await,
            ExecutorReport::CommandResult {
                command_id,
                task_id,
                exit_code,
                output,
            } => {
                self.commands
                    .handle_result(&command_id, &task_id, exit_code, output)
                    .await
            }
            ExecutorReport::ResourcesUpdated {
                task_group_id,
                resources,
            } => {
                debug!(
                    agent_id,
                    executor_id,
                    task_group_id = %task_group_id,
                    cpus = resources.cpus,
                    mem = resources.mem,
                    "Executor confirmed resource update"
                );
                Ok(())
            }
        }
    }

    /// Asks the resource manager for the status of every task we track.
    pub async fn reconcile_tasks(&self) -> SchedulerResult<usize> {
        let mut tasks = Vec::new();
        for app in self.ctx.store.list_applications().await? {
            for id in app.task_groups.values() {
                if let Some(group) = self.ctx.store.get_task_group(id).await? {
                    tasks.extend(
                        group
                            .tasks
                            .iter()
                            .map(|t| (t.id.to_string(), group.agent_id.clone())),
                    );
                }
            }
        }
        if !tasks.is_empty() {
            self.ctx.driver.reconcile(&tasks).await?;
        }
        info!(tasks = tasks.len(), "Requested task reconciliation");
        Ok(tasks.len())
    }

    // =========================================================================
    // Offers
    // =========================================================================

    /// Declines expired offers, and every held offer when nothing needs them.
    pub async fn offer_tick(&self) -> SchedulerResult<usize> {
        let now = self.ctx.now();
        let mut released = self.ctx.offers.expire(now, self.ctx.config.offers.offer_ttl);
        if !self.runner.has_offer_demand().await? {
            released.extend(self.ctx.offers.drain());
        }
        let count = released.len();
        self.decline(released.into_iter().map(|o| o.id).collect()).await;
        Ok(count)
    }

    async fn decline(&self, offer_ids: Vec<String>) {
        if offer_ids.is_empty() {
            return;
        }
        let refuse = self.ctx.config.offers.decline_refuse;
        match self.ctx.driver.decline(&offer_ids, refuse).await {
            Ok(()) => debug!(count = offer_ids.len(), "Offers declined"),
            Err(e) => warn!(count = offer_ids.len(), error = %e, "Decline failed"),
        }
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    /// Subscribes, processes events, and resubscribes with backoff until
    /// `shutdown` flips to true.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        self.deployment_gate
            .set(Arc::clone(&self.controller).spawn(), self.ctx.connection.is_leader());

        let offers = tokio::spawn({
            let scheduler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            async move { scheduler.offer_loop(shutdown).await }
        });

        let backoff = BackoffPolicy::default();
        loop {
            let framework_id = self.ctx.store.framework_id().await?;
            let framework = FrameworkInfo::from_config(&self.ctx.config.cluster, framework_id);
            let driver = Arc::clone(&self.ctx.driver);

            let subscribed = retry_with_backoff("subscribe", &backoff, &mut shutdown, |_| {
                let driver = Arc::clone(&driver);
                let framework = framework.clone();
                async move { driver.subscribe(&framework).await }
            })
            .await;
            let mut events = match subscribed {
                Ok(events) => events,
                Err(LoopError::Stopped) => break,
                Err(e) => return Err(e.into()),
            };

            let mut heartbeat = tokio::time::interval(self.ctx.config.heartbeat.interval);
            heartbeat.tick().await;
            let reason = loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break None;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if self.ctx.connection.is_leader() && !self.ctx.connection.is_healthy() {
                            break Some("heartbeats missed".to_string());
                        }
                    }
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            if let Err(e) = self.handle_event(event).await {
                                warn!(error = %e, "Event handling failed");
                            }
                        }
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break Some("event stream closed".to_string()),
                    },
                }
            };

            match reason {
                Some(reason) => self.ctx.connection.on_disconnected(&reason).await,
                None => break,
            }
        }

        info!("Scheduler shutting down");
        self.ctx.connection.on_disconnected("shutting down").await;
        if let Some(handle) = self.deployment_gate.take() {
            let _ = handle.stop();
            handle.join().await;
        }
        if let Err(e) = offers.await {
            warn!(error = %e, "Offer loop ended abnormally");
        }
        Ok(())
    }

    #[instrument(skip(self, shutdown))]
    async fn offer_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.ctx.config.offers.tick_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.offer_tick().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Released offers"),
                        Err(e) => error!(error = %e, "Offer tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Offer loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
