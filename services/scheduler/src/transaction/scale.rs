//! Scale and inner scale.
//!
//! Scaling down removes the highest indices first; scaling up fills the
//! lowest free indices below the target.

use std::collections::BTreeSet;

use tracing::info;

use super::{all_settled, Outcome, TransactionEngine};
use crate::error::SchedulerResult;
use crate::model::{Operation, ScaleOp, Transaction};

pub(super) async fn step(engine: &TransactionEngine, txn: &Transaction, op: &mut ScaleOp) -> SchedulerResult<Outcome> {
    let mut app = engine.load_app(txn).await?;
    let inner = matches!(txn.operation, Operation::InnerScale(_));
    if !inner {
        if let Err(outcome) = engine.check_owner(&app, txn) {
            return Ok(outcome);
        }
    } else if let Some(owner) = app.operation {
        return Ok(Outcome::Failed(format!("{} was taken over by {owner}", app.key())));
    }

    // Shrink: every index at or above the target goes.
    let surplus: Vec<u32> = app
        .task_groups
        .keys()
        .copied()
        .filter(|i| *i >= op.target)
        .rev()
        .collect();
    if !surplus.is_empty() {
        let mut progressed = false;
        for index in surplus {
            let Some(id) = app.task_groups.get(&index).cloned() else {
                continue;
            };
            let Some(mut group) = engine.ctx.store.get_task_group(&id).await? else {
                app.detach(&id);
                progressed = true;
                continue;
            };
            if engine.drain_pod(&mut group).await? {
                engine.remove_pod(&mut app, &group).await?;
                progressed = true;
            }
        }
        if progressed {
            engine.ctx.store.update_application(&app).await?;
        }
        return Ok(if progressed { Outcome::Progressed } else { Outcome::Pending });
    }

    // Grow.
    let missing: BTreeSet<u32> = (0..op.target)
        .filter(|i| !app.task_groups.contains_key(i))
        .collect();
    if !missing.is_empty() {
        let version = engine.load_version(&txn.namespace, &txn.name, &op.version_id).await?;
        let launched = engine.fill_indices(&mut app, &version, &missing).await?;
        op.launched += launched;
        return Ok(if launched > 0 { Outcome::Progressed } else { Outcome::NoFit });
    }

    let groups = engine.attached_groups(&app).await?;
    if !all_settled(&groups) {
        return Ok(Outcome::Pending);
    }

    if app.instances != op.target {
        info!(app = %app.key(), from = app.instances, to = op.target, "Instances changed");
        app.instances = op.target;
        app.updated_at = engine.ctx.now();
        engine.ctx.store.update_application(&app).await?;
    }
    Ok(Outcome::Finished)
}
