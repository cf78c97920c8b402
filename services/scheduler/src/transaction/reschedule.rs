//! Rebuild one pod under a fresh identity on the same index.

use std::time::Duration;

use drover_events::{AlertKind, AlertPayload};
use tracing::{debug, info};

use super::{Outcome, TransactionEngine};
use crate::clock::after;
use crate::error::SchedulerResult;
use crate::model::{KillPhase, RescheduleOp, TaskGroupStatus, Transaction};

pub(super) async fn step(
    engine: &TransactionEngine,
    txn: &Transaction,
    op: &mut RescheduleOp,
) -> SchedulerResult<Outcome> {
    let mut app = engine.load_app(txn).await?;
    let index = op.task_group_id.index();
    // The slot is wanted while it points at this pod; `app.instances` lags
    // behind a scale in progress.
    match app.task_groups.get(&index) {
        Some(attached) if attached == &op.task_group_id => {}
        Some(attached) => {
            debug!(task_group_id = %op.task_group_id, current = %attached, "Pod already replaced");
            return Ok(Outcome::Finished);
        }
        None => {
            debug!(task_group_id = %op.task_group_id, "Pod no longer attached");
            return Ok(Outcome::Finished);
        }
    }

    let old = engine.ctx.store.get_task_group(&op.task_group_id).await?;
    let now = engine.ctx.now();

    if op.phase == KillPhase::Kill {
        if let Some(mut group) = old.clone() {
            if !op.force && group.status == TaskGroupStatus::Running {
                info!(task_group_id = %group.id, "Pod recovered before reschedule");
                return Ok(Outcome::Finished);
            }
            if !engine.drain_pod(&mut group).await? {
                return Ok(Outcome::Pending);
            }
        }
        op.phase = KillPhase::Launch;
        if op.retain_host.is_some() && op.retention_secs > 0 {
            op.retain_until = Some(after(now, Duration::from_secs(op.retention_secs)));
        }
    }

    let retain = match (&op.retain_host, op.retain_until) {
        (Some(host), Some(until)) if until > now => Some(host.as_str()),
        _ => None,
    };

    let version_id = old
        .as_ref()
        .map(|g| g.version_id.clone())
        .unwrap_or_else(|| app.current_version.clone());
    let version = engine.load_version(&txn.namespace, &txn.name, &version_id).await?;

    let peers: Vec<_> = engine
        .ctx
        .store
        .list_task_groups(&txn.namespace, &txn.name)
        .await?
        .into_iter()
        .filter(|g| g.index() != index)
        .collect();
    let Some(offer) = engine.find_offer(&version, &peers, retain) else {
        // Waiting out a retention window is not a placement failure.
        return Ok(if retain.is_some() { Outcome::Pending } else { Outcome::NoFit });
    };

    let group = engine
        .launch_pod(
            &mut app,
            &version,
            index,
            offer,
            Some(&op.task_group_id),
            op.resched_times,
            Some(now),
        )
        .await?;
    if let Some(old) = &old {
        engine.remove_pod(&mut app, old).await?;
    }
    engine.ctx.store.update_application(&app).await?;

    engine
        .ctx
        .notifier
        .alert(
            AlertPayload::new(
                AlertKind::TaskGroupRescheduled,
                &txn.namespace,
                &txn.name,
                format!("{} replaced by {}", op.task_group_id, group.id),
            )
            .with_label("resched_times", op.resched_times.to_string())
            .with_label("hostname", group.hostname.clone()),
            &op.task_group_id.to_string(),
            Some(txn.id.to_string()),
        )
        .await;
    Ok(Outcome::Finished)
}
