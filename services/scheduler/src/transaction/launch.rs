//! Initial launch of an application's full replica set.

use std::collections::BTreeSet;

use super::{all_settled, Outcome, TransactionEngine};
use crate::error::SchedulerResult;
use crate::model::{LaunchOp, Transaction};

pub(super) async fn step(engine: &TransactionEngine, txn: &Transaction, op: &mut LaunchOp) -> SchedulerResult<Outcome> {
    let mut app = engine.load_app(txn).await?;
    if let Err(outcome) = engine.check_owner(&app, txn) {
        return Ok(outcome);
    }
    if app.current_version != op.version_id {
        return Ok(Outcome::Failed(format!(
            "version {} was superseded by {}",
            op.version_id, app.current_version
        )));
    }

    let missing: BTreeSet<u32> = (0..op.instances)
        .filter(|i| !app.task_groups.contains_key(i))
        .collect();
    op.launched = op.instances - missing.len() as u32;

    if missing.is_empty() {
        let groups = engine.attached_groups(&app).await?;
        return Ok(if all_settled(&groups) {
            Outcome::Finished
        } else {
            Outcome::Pending
        });
    }

    let version = engine.load_version(&txn.namespace, &txn.name, &op.version_id).await?;
    let launched = engine.fill_indices(&mut app, &version, &missing).await?;
    op.launched += launched;
    Ok(if launched > 0 { Outcome::Progressed } else { Outcome::NoFit })
}
