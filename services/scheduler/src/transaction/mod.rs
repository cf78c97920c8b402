//! Transaction engine.
//!
//! A transaction is one requested change to an application or pod. Each one
//! runs in its own control loop ([`TransactionRunner`]) which calls
//! [`TransactionEngine::run_once`] on every tick:
//!
//! ```text
//! INIT --(delay elapsed)--> step ... step --> FINISH | FAIL | TIMEOUT
//!                                                  |
//!                                   finalize (status fix-up, alert, delete)
//! ```
//!
//! Every step runs under the application's lock, so at most one structural
//! mutation per application is in flight no matter how many transactions
//! target it.

mod delete;
mod launch;
mod reschedule;
mod runner;
mod scale;
mod service;
mod update;
mod update_resource;

use std::collections::BTreeSet;

use drover_events::{AlertKind, AlertPayload, EndpointChange};
use drover_id::{TaskGroupId, TransactionId};
use tracing::{debug, info, instrument, warn};

use crate::builder::{self, BuildRequest};
use crate::clock::elapsed;
use crate::context::Context;
use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{
    AppStatus, Application, Offer, Operation, TaskGroup, TaskGroupStatus, Transaction, TransactionStatus, Version,
};
use crate::placement::{self, PlacementRequest};
use crate::status;

pub use runner::TransactionRunner;
pub use service::TransactionService;

/// Result of one step of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Waiting on something outside the scheduler (a kill, a pod settling).
    Pending,
    /// Made progress; resets the no-fit counter.
    Progressed,
    /// Needed an offer and none fit.
    NoFit,
    Finished,
    Failed(String),
}

/// Drives transactions one step at a time.
pub struct TransactionEngine {
    ctx: Context,
}

impl TransactionEngine {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Loads, steps and (if it ended) finalizes one transaction.
    ///
    /// Returns the transaction as it stands after the step, or `None` if it
    /// no longer exists. Terminal transactions are finalized and deleted.
    #[instrument(skip(self), fields(txn_id = %id))]
    pub async fn run_once(&self, id: &TransactionId) -> SchedulerResult<Option<Transaction>> {
        let Some(mut txn) = self.ctx.store.get_transaction(id).await? else {
            return Ok(None);
        };
        self.step(&mut txn).await?;
        if txn.is_terminal() {
            self.finalize(&txn).await?;
        }
        Ok(Some(txn))
    }

    /// Advances a transaction by one step and persists it.
    pub async fn step(&self, txn: &mut Transaction) -> SchedulerResult<()> {
        if txn.is_terminal() {
            return Ok(());
        }

        let now = self.ctx.now();
        if now < txn.start_at() {
            return Ok(());
        }
        if now >= txn.deadline() {
            warn!(
                txn_id = %txn.id,
                op = txn.operation.name(),
                app = %txn.app_key(),
                "Transaction life period elapsed"
            );
            txn.timeout("life period elapsed", now);
            self.ctx.store.put_transaction(txn).await?;
            return Ok(());
        }

        let outcome = {
            let _guard = self.ctx.locks.lock_app(&txn.namespace, &txn.name).await;
            let mut op = txn.operation.clone();
            let result = match &mut op {
                Operation::Launch(launch) => launch::step(self, txn, launch).await,
                Operation::Scale(scale) | Operation::InnerScale(scale) => scale::step(self, txn, scale).await,
                Operation::Update(update) => update::step(self, txn, update).await,
                Operation::Reschedule(resched) => reschedule::step(self, txn, resched).await,
                Operation::Delete(delete) => delete::step(self, txn, delete).await,
                Operation::UpdateResource(update) => update_resource::step(self, txn, update).await,
            };
            txn.operation = op;
            result.unwrap_or_else(|e| {
                warn!(txn_id = %txn.id, op = txn.operation.name(), error = %e, "Transaction step failed");
                Outcome::Failed(e.to_string())
            })
        };

        let now = self.ctx.now();
        match outcome {
            Outcome::Pending => {}
            Outcome::Progressed => txn.schedule_attempts = 0,
            Outcome::NoFit => {
                txn.schedule_attempts += 1;
                debug!(
                    txn_id = %txn.id,
                    attempts = txn.schedule_attempts,
                    "No offer fits"
                );
                if txn.schedule_attempts >= self.ctx.config.transactions.max_schedule_attempts {
                    warn!(txn_id = %txn.id, app = %txn.app_key(), "Resources insufficient");
                    txn.timeout(
                        format!(
                            "resources insufficient after {} scheduling attempts",
                            txn.schedule_attempts
                        ),
                        now,
                    );
                }
            }
            Outcome::Finished => txn.finish(now),
            Outcome::Failed(message) => txn.fail(message, now),
        }
        txn.updated_at = now;
        self.ctx.store.put_transaction(txn).await?;
        Ok(())
    }

    /// Post-processing of a terminal transaction: application status fix-up,
    /// timeout alert, removal.
    pub async fn finalize(&self, txn: &Transaction) -> SchedulerResult<()> {
        {
            let _guard = self.ctx.locks.lock_app(&txn.namespace, &txn.name).await;
            if let Some(mut app) = self.ctx.store.get_application(&txn.namespace, &txn.name).await? {
                if app.operation == Some(txn.id) {
                    app.operation = None;
                }
                let groups = self.ctx.store.list_task_groups(&txn.namespace, &txn.name).await?;
                app.running_instances = status::running_count(&groups);

                // A rolling update owns the status until the deployment ends.
                if app.status != AppStatus::RollingUpdate && app.operation.is_none() {
                    let next = status::application_status(app.instances, &groups);
                    if app.set_status(next, self.ctx.now()) {
                        info!(app = %app.key(), status = %next, "Application status settled");
                    }
                }
                app.updated_at = self.ctx.now();
                self.ctx.store.update_application(&app).await?;
            }
        }

        if txn.status == TransactionStatus::Timeout {
            let message = txn.message.clone().unwrap_or_else(|| "timed out".to_string());
            self.ctx
                .notifier
                .alert(
                    AlertPayload::new(AlertKind::TransactionTimeout, &txn.namespace, &txn.name, message)
                        .with_label("operation", txn.operation.name()),
                    &txn.app_key(),
                    Some(txn.id.to_string()),
                )
                .await;
        }

        info!(
            txn_id = %txn.id,
            op = txn.operation.name(),
            app = %txn.app_key(),
            status = %txn.status,
            message = txn.message.as_deref().unwrap_or(""),
            "Transaction ended"
        );
        self.ctx.store.delete_transaction(&txn.id).await?;
        Ok(())
    }

    // =========================================================================
    // Helpers shared by the operations
    // =========================================================================

    pub(crate) async fn load_app(&self, txn: &Transaction) -> SchedulerResult<Application> {
        self.ctx
            .store
            .get_application(&txn.namespace, &txn.name)
            .await?
            .ok_or_else(|| SchedulerError::AppNotFound(txn.app_key()))
    }

    /// Fails unless the application is still owned by this transaction.
    pub(crate) fn check_owner(&self, app: &Application, txn: &Transaction) -> Result<(), Outcome> {
        if app.operation == Some(txn.id) {
            Ok(())
        } else {
            Err(Outcome::Failed(format!(
                "{} is no longer owned by this transaction",
                app.key()
            )))
        }
    }

    pub(crate) async fn load_version(&self, namespace: &str, name: &str, id: &str) -> SchedulerResult<Version> {
        self.ctx
            .store
            .get_version(namespace, name, id)
            .await?
            .ok_or_else(|| SchedulerError::VersionNotFound(format!("{namespace}.{name}@{id}")))
    }

    /// Pods attached to the application, by index.
    pub(crate) async fn attached_groups(&self, app: &Application) -> SchedulerResult<Vec<TaskGroup>> {
        let mut groups = Vec::with_capacity(app.task_groups.len());
        for id in app.task_groups.values() {
            if let Some(group) = self.ctx.store.get_task_group(id).await? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// First offer that fits one pod of `version`, consumed from the pool.
    pub(crate) fn find_offer(&self, version: &Version, peers: &[TaskGroup], retain_host: Option<&str>) -> Option<Offer> {
        let constraints = version.effective_constraints();
        let live: Vec<TaskGroup> = peers.iter().filter(|p| !p.status.is_end()).cloned().collect();
        let request = PlacementRequest {
            resources: builder::pod_need(version),
            ports: version.ports_needed(),
            constraints: &constraints,
            peers: &live,
            retain_host,
        };

        for offer in self.ctx.offers.snapshot(self.ctx.now()) {
            if let Err(rejection) = placement::check(&request, &offer) {
                debug!(offer_id = %offer.id, ?rejection, "Offer rejected");
                continue;
            }
            // Losing the race to a concurrent transaction is not an error.
            if let Some(taken) = self.ctx.offers.use_offer(offer.pool_id) {
                return Some(taken);
            }
        }
        None
    }

    /// Builds, persists, attaches and launches one pod on a consumed offer.
    ///
    /// On any failure the pod is rolled back and the offer declined.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn launch_pod(
        &self,
        app: &mut Application,
        version: &Version,
        index: u32,
        offer: Offer,
        replaces: Option<&TaskGroupId>,
        resched_times: u32,
        last_resched_time: Option<chrono::DateTime<chrono::Utc>>,
    ) -> SchedulerResult<TaskGroup> {
        let request = BuildRequest {
            version,
            cluster: &app.cluster,
            index,
            offer: &offer,
            now: self.ctx.now(),
            replaces,
            resched_times,
            last_resched_time,
        };
        let (group, launch) = match builder::build(&request) {
            Ok(built) => built,
            Err(e) => {
                self.decline(&offer).await;
                return Err(e.into());
            }
        };

        let previous = app.task_groups.get(&index).cloned();
        self.ctx.store.put_task_group(&group).await?;
        app.attach(&group.id);
        self.ctx.store.update_application(app).await?;

        if let Err(e) = self.ctx.driver.launch(&launch).await {
            warn!(task_group_id = %group.id, error = %e, "Launch rejected");
            match self.ctx.store.delete_task_group(&group.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(task_group_id = %group.id, error = %e, "Rollback of rejected pod failed"),
            }
            app.detach(&group.id);
            if let Some(previous) = previous {
                app.attach(&previous);
            }
            self.ctx.store.update_application(app).await?;
            self.decline(&offer).await;
            return Err(e.into());
        }

        info!(
            task_group_id = %group.id,
            hostname = %group.hostname,
            offer_id = %offer.id,
            "Pod launched"
        );
        self.ctx.notifier.endpoint(EndpointChange::Added, &group).await;
        Ok(group)
    }

    pub(crate) async fn decline(&self, offer: &Offer) {
        let refuse = self.ctx.config.offers.decline_refuse;
        if let Err(e) = self.ctx.driver.decline(std::slice::from_ref(&offer.id), refuse).await {
            warn!(offer_id = %offer.id, error = %e, "Decline failed");
        }
    }

    /// Asks the resource manager to stop a pod and records when.
    pub(crate) async fn kill_pod(&self, group: &mut TaskGroup) -> SchedulerResult<()> {
        self.ctx
            .driver
            .shutdown(&group.agent_id, &group.id.executor_id())
            .await?;
        let now = self.ctx.now();
        group.kill_requested_at = Some(now);
        group.updated_at = now;
        self.ctx.store.put_task_group(group).await?;
        info!(task_group_id = %group.id, "Pod kill requested");
        Ok(())
    }

    /// Moves a pod toward removal: kill it, wait for it to drain, force it
    /// out after the grace period. Returns true once it can be removed.
    pub(crate) async fn drain_pod(&self, group: &mut TaskGroup) -> SchedulerResult<bool> {
        if group.is_drained() {
            return Ok(true);
        }
        match group.kill_requested_at {
            None => {
                self.kill_pod(group).await?;
                Ok(false)
            }
            Some(at) => {
                let grace = self.ctx.config.transactions.kill_grace_period;
                if elapsed(at, self.ctx.now()) >= grace {
                    warn!(task_group_id = %group.id, "Pod did not stop within grace period, removing");
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Deletes a pod, detaches it and releases its in-place grants.
    pub(crate) async fn remove_pod(&self, app: &mut Application, group: &TaskGroup) -> SchedulerResult<()> {
        match self.ctx.store.delete_task_group(&group.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        app.detach(&group.id);

        {
            let _node = self.ctx.locks.lock_node(&group.agent_id).await;
            if let Some(mut ledger) = self.ctx.store.get_ledger(&group.agent_id).await? {
                if ledger.release(&group.id.to_string()).is_some() {
                    self.ctx.store.put_ledger(&ledger).await?;
                    self.ctx.offers.set_agent_delta(&group.agent_id, ledger.total());
                }
            }
        }

        debug!(task_group_id = %group.id, "Pod removed");
        self.ctx.notifier.endpoint(EndpointChange::Deleted, group).await;
        Ok(())
    }

    /// Launches pods for `indices` while offers fit. Returns how many launched.
    pub(crate) async fn fill_indices(
        &self,
        app: &mut Application,
        version: &Version,
        indices: &BTreeSet<u32>,
    ) -> SchedulerResult<u32> {
        let mut peers = self
            .ctx
            .store
            .list_task_groups(&app.namespace, &app.name)
            .await?;
        let mut launched = 0;
        for &index in indices {
            let Some(offer) = self.find_offer(version, &peers, None) else {
                break;
            };
            let group = self.launch_pod(app, version, index, offer, None, 0, None).await?;
            peers.push(group);
            launched += 1;
        }
        Ok(launched)
    }
}

/// Whether every attached pod left STAGING/STARTING.
pub(crate) fn all_settled(groups: &[TaskGroup]) -> bool {
    groups.iter().all(|g| {
        !matches!(
            g.status,
            TaskGroupStatus::Unknown | TaskGroupStatus::Staging | TaskGroupStatus::Starting
        )
    })
}
