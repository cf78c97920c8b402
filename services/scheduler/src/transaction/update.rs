//! Rolling replacement of every pod with the application's new version.
//!
//! One index at a time: kill the old pod, wait until it drained (or the grace
//! period passed), then launch its replacement.

use tracing::debug;

use super::{Outcome, TransactionEngine};
use crate::error::SchedulerResult;
use crate::model::{KillPhase, Transaction, UpdateOp};

pub(super) async fn step(engine: &TransactionEngine, txn: &Transaction, op: &mut UpdateOp) -> SchedulerResult<Outcome> {
    let mut app = engine.load_app(txn).await?;
    if let Err(outcome) = engine.check_owner(&app, txn) {
        return Ok(outcome);
    }
    let version = engine.load_version(&txn.namespace, &txn.name, &op.version_id).await?;
    let hash = version.spec_hash();

    while let Some(&index) = op.indices.get(op.cursor) {
        let current = match app.task_groups.get(&index) {
            Some(id) => engine.ctx.store.get_task_group(id).await?,
            None => None,
        };

        match op.phase {
            KillPhase::Kill => {
                let Some(mut group) = current else {
                    // Slot already empty: go straight to placing the new pod.
                    op.phase = KillPhase::Launch;
                    continue;
                };
                if group.version_hash == hash {
                    debug!(task_group_id = %group.id, "Pod already on target version");
                    op.cursor += 1;
                    continue;
                }
                if !engine.drain_pod(&mut group).await? {
                    return Ok(Outcome::Pending);
                }
                op.phase = KillPhase::Launch;
            }
            KillPhase::Launch => {
                let peers = engine.ctx.store.list_task_groups(&txn.namespace, &txn.name).await?;
                let others: Vec<_> = peers.into_iter().filter(|p| p.index() != index).collect();
                let Some(offer) = engine.find_offer(&version, &others, None) else {
                    return Ok(Outcome::NoFit);
                };
                let replaces = current.as_ref().map(|g| g.id.clone());
                engine
                    .launch_pod(&mut app, &version, index, offer, replaces.as_ref(), 0, None)
                    .await?;
                if let Some(old) = current {
                    engine.remove_pod(&mut app, &old).await?;
                }
                engine.ctx.store.update_application(&app).await?;
                op.cursor += 1;
                op.phase = KillPhase::Kill;
                return Ok(Outcome::Progressed);
            }
        }
    }

    Ok(Outcome::Finished)
}
