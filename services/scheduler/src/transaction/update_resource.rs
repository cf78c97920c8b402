//! In-place growth of every pod's reservation.

use tracing::{info, warn};

use super::{Outcome, TransactionEngine};
use crate::clock::after;
use crate::driver::ExecutorMessage;
use crate::error::SchedulerResult;
use crate::model::{AgentLedger, Transaction, UpdateResourceOp};

pub(super) async fn step(
    engine: &TransactionEngine,
    txn: &Transaction,
    op: &mut UpdateResourceOp,
) -> SchedulerResult<Outcome> {
    let app = engine.load_app(txn).await?;
    if let Err(outcome) = engine.check_owner(&app, txn) {
        return Ok(outcome);
    }

    let now = engine.ctx.now();
    if op.next_attempt_at.is_some_and(|at| now < at) {
        return Ok(Outcome::Pending);
    }

    let Some(&index) = op.indices.get(op.cursor) else {
        return Ok(Outcome::Finished);
    };
    let group = match app.task_groups.get(&index) {
        Some(id) => engine.ctx.store.get_task_group(id).await?,
        None => None,
    };
    let Some(mut group) = group.filter(|g| !g.status.is_end()) else {
        advance(op);
        return Ok(Outcome::Progressed);
    };

    let agent = group.agent_id.clone();
    let _node = engine.ctx.locks.lock_node(&agent).await;

    let headroom = engine.ctx.offers.agent_headroom(&agent);
    if !op.delta.fits_in(&headroom) {
        return Ok(retry(engine, op, format!("insufficient headroom on agent {agent}")));
    }

    let target = group.current_resources + op.delta;
    let message = ExecutorMessage::UpdateResources {
        task_group_id: group.id.to_string(),
        resources: target,
    };
    if let Err(e) = engine
        .ctx
        .driver
        .message(&agent, &group.id.executor_id(), &message)
        .await
    {
        return Ok(retry(engine, op, format!("resource update for {} rejected: {e}", group.id)));
    }

    let mut ledger = engine
        .ctx
        .store
        .get_ledger(&agent)
        .await?
        .unwrap_or_else(|| AgentLedger::new(agent.clone()));
    ledger.commit(&group.id.to_string(), op.delta);
    engine.ctx.store.put_ledger(&ledger).await?;
    engine.ctx.offers.set_agent_delta(&agent, ledger.total());

    group.current_resources = target;
    group.updated_at = now;
    engine.ctx.store.put_task_group(&group).await?;
    info!(task_group_id = %group.id, cpus = target.cpus, mem = target.mem, "Pod resources updated");

    advance(op);
    Ok(if op.cursor >= op.indices.len() {
        Outcome::Finished
    } else {
        Outcome::Progressed
    })
}

fn advance(op: &mut UpdateResourceOp) {
    op.cursor += 1;
    op.attempts = 0;
    op.next_attempt_at = None;
}

fn retry(engine: &TransactionEngine, op: &mut UpdateResourceOp, reason: String) -> Outcome {
    op.attempts += 1;
    let limit = engine.ctx.config.transactions.update_resource_retries;
    if op.attempts >= limit {
        return Outcome::Failed(format!("{reason} after {} attempts", op.attempts));
    }
    let backoff = engine.ctx.config.transactions.update_resource_backoff;
    op.next_attempt_at = Some(after(engine.ctx.now(), backoff));
    warn!(attempt = op.attempts, reason = %reason, "Resource update will be retried");
    Outcome::Pending
}
