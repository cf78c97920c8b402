//! Application removal.

use tracing::{info, warn};

use super::{Outcome, TransactionEngine};
use crate::error::SchedulerResult;
use crate::model::{DeleteOp, Transaction};

pub(super) async fn step(engine: &TransactionEngine, txn: &Transaction, op: &mut DeleteOp) -> SchedulerResult<Outcome> {
    let Some(mut app) = engine.ctx.store.get_application(&txn.namespace, &txn.name).await? else {
        return Ok(Outcome::Finished);
    };
    if let Err(outcome) = engine.check_owner(&app, txn) {
        return Ok(outcome);
    }

    let groups = engine.ctx.store.list_task_groups(&txn.namespace, &txn.name).await?;
    let mut remaining = 0;
    for mut group in groups {
        let removable = if op.enforce {
            if !group.is_drained() && group.kill_requested_at.is_none() {
                if let Err(e) = engine.kill_pod(&mut group).await {
                    warn!(task_group_id = %group.id, error = %e, "Best-effort kill failed");
                }
            }
            true
        } else {
            match engine.drain_pod(&mut group).await {
                Ok(drained) => drained,
                Err(e) => {
                    warn!(task_group_id = %group.id, error = %e, "Best-effort kill failed, retrying");
                    false
                }
            }
        };

        if removable {
            engine.remove_pod(&mut app, &group).await?;
        } else {
            remaining += 1;
        }
    }

    if remaining > 0 {
        engine.ctx.store.update_application(&app).await?;
        return Ok(Outcome::Pending);
    }

    engine.ctx.store.delete_versions(&txn.namespace, &txn.name).await?;
    engine.ctx.store.delete_application(&txn.namespace, &txn.name).await?;
    info!(app = %txn.app_key(), enforce = op.enforce, "Application deleted");
    Ok(Outcome::Finished)
}
