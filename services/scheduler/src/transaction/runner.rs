//! One control loop per in-flight transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use drover_id::TransactionId;
use tracing::{debug, info, warn};

use super::TransactionEngine;
use crate::connection::{Role, RoleObserver};
use crate::control::{spawn_loop, ControlLoop, LoopError, LoopHandle, LoopOptions, LoopStatus};
use crate::error::SchedulerResult;
use crate::model::Transaction;

struct TransactionLoop {
    engine: Arc<TransactionEngine>,
    id: TransactionId,
    name: String,
}

#[async_trait]
impl ControlLoop for TransactionLoop {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tick(&mut self) -> Result<LoopStatus, LoopError> {
        match self.engine.run_once(&self.id).await {
            Ok(Some(txn)) if !txn.is_terminal() => Ok(LoopStatus::Continue),
            Ok(_) => Ok(LoopStatus::Done),
            Err(e) => Err(LoopError::Transient(e.to_string())),
        }
    }
}

/// Owns the loops of every transaction this process drives.
///
/// Loops only tick while this process leads the framework.
pub struct TransactionRunner {
    engine: Arc<TransactionEngine>,
    loops: Mutex<HashMap<TransactionId, LoopHandle>>,
}

impl TransactionRunner {
    pub fn new(engine: Arc<TransactionEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            loops: Mutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    /// Persists a transaction and starts its loop.
    pub async fn submit(&self, txn: Transaction) -> SchedulerResult<TransactionId> {
        let ctx = self.engine.context();
        ctx.store.put_transaction(&txn).await?;
        info!(
            txn_id = %txn.id,
            op = txn.operation.name(),
            app = %txn.app_key(),
            inner = txn.is_inner,
            delay_ms = txn.delay.as_millis() as u64,
            "Transaction submitted"
        );
        self.spawn(&txn);
        Ok(txn.id)
    }

    fn spawn(&self, txn: &Transaction) {
        let ctx = self.engine.context();
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        loops.retain(|_, handle| !handle.is_finished());
        if loops.contains_key(&txn.id) {
            return;
        }

        let config = &ctx.config.transactions;
        let mut options = LoopOptions::new(config.check_interval).queue_depth(config.control_queue_depth);
        if !ctx.connection.is_leader() {
            options = options.closed();
        }
        let control = TransactionLoop {
            engine: Arc::clone(&self.engine),
            id: txn.id,
            name: format!("txn-{}-{}", txn.operation.name(), txn.id),
        };
        loops.insert(txn.id, spawn_loop(control, options));
    }

    /// Restarts loops for every stored transaction, finalizing ones that
    /// ended without being cleaned up.
    pub async fn recover(&self) -> SchedulerResult<usize> {
        let ctx = self.engine.context();
        let mut resumed = 0;
        for txn in ctx.store.list_transactions().await? {
            if txn.is_terminal() {
                self.engine.finalize(&txn).await?;
                continue;
            }
            self.spawn(&txn);
            resumed += 1;
        }
        info!(resumed, "Transactions recovered");
        Ok(resumed)
    }

    pub fn open_all(&self) {
        self.signal_all(LoopHandle::open);
    }

    /// Stops new cycles; steps already running complete.
    pub fn close_all(&self) {
        self.signal_all(LoopHandle::close);
    }

    fn signal_all(&self, signal: fn(&LoopHandle) -> Result<(), LoopError>) {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        loops.retain(|_, handle| !handle.is_finished());
        for handle in loops.values() {
            if let Err(e) = signal(handle) {
                warn!(loop_name = handle.name(), error = %e, "Control signal dropped");
            }
        }
    }

    /// Number of loops still running.
    pub fn active(&self) -> usize {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        loops.retain(|_, handle| !handle.is_finished());
        loops.len()
    }

    /// Whether any started transaction may still need offers.
    pub async fn has_offer_demand(&self) -> SchedulerResult<bool> {
        let ctx = self.engine.context();
        let now = ctx.now();
        Ok(ctx
            .store
            .list_transactions()
            .await?
            .iter()
            .any(|t| t.wants_offers(now)))
    }
}

#[async_trait]
impl RoleObserver for TransactionRunner {
    async fn on_role_change(&self, role: Role) {
        match role {
            Role::Leader => {
                if let Err(e) = self.recover().await {
                    warn!(error = %e, "Transaction recovery failed");
                }
                self.open_all();
            }
            Role::Follower => {
                debug!("Closing transaction loops");
                self.close_all();
            }
        }
    }
}
