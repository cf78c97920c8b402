//! Reschedule decisions for pods that reached an end status.

use std::time::Duration;

use drover_reconcile::reschedule_delay;

use crate::config::RescheduleConfig;
use crate::model::{KillPhase, RescheduleOp, RestartKind, RestartPolicy, TaskGroup, TaskGroupStatus};

/// What to do about a pod that just failed, finished or got lost.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Restart policy does not cover this status.
    Skip,
    /// `max_times` reached; the pod stays where it is.
    Exhausted { resched_times: u32 },
    Reschedule { op: RescheduleOp, delay: Duration },
}

#[derive(Debug, Clone)]
pub struct ReschedulePolicy {
    config: RescheduleConfig,
}

impl ReschedulePolicy {
    pub fn new(config: RescheduleConfig) -> Self {
        Self { config }
    }

    /// Decides for a pod that transitioned into `status`.
    ///
    /// `group.resched_times` must already reflect any reset earned by a long
    /// RUNNING period.
    pub fn decide(&self, group: &TaskGroup, status: TaskGroupStatus, restart: &RestartPolicy) -> Decision {
        let count = group.resched_times;

        // An unreachable agent is urgent: no delay, no counters.
        if status == TaskGroupStatus::Lost {
            return Decision::Reschedule {
                op: self.op(group, count + 1, None),
                delay: Duration::ZERO,
            };
        }

        match restart.kind {
            RestartKind::Never => return Decision::Skip,
            RestartKind::OnFailure if status != TaskGroupStatus::Fail => return Decision::Skip,
            _ => {}
        }

        if restart.max_times > 0 && count >= restart.max_times {
            return Decision::Exhausted { resched_times: count };
        }

        let delay = reschedule_delay(
            restart.interval(),
            restart.backoff(),
            count,
            self.config.max_life_period,
        );
        let retention = restart
            .retention_secs
            .unwrap_or(self.config.default_host_retention.as_secs());
        Decision::Reschedule {
            op: self.op(group, count + 1, (retention > 0).then_some(retention)),
            delay,
        }
    }

    fn op(&self, group: &TaskGroup, resched_times: u32, retention: Option<u64>) -> RescheduleOp {
        RescheduleOp {
            task_group_id: group.id.clone(),
            force: false,
            phase: KillPhase::Kill,
            resched_times,
            retain_host: retention.map(|_| group.hostname.clone()),
            retention_secs: retention.unwrap_or_default(),
            retain_until: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use drover_id::TaskGroupId;
    use drover_reconcile::SpecHash;
    use rstest::rstest;

    use super::*;
    use crate::model::Resource;

    fn group(resched_times: u32) -> TaskGroup {
        let now = Utc::now();
        TaskGroup {
            id: TaskGroupId::new(0, "web", "prod", "c1", 1).unwrap(),
            version_id: "v1".into(),
            version_hash: SpecHash::from_json(&serde_json::json!({})),
            status: TaskGroupStatus::Fail,
            tasks: vec![],
            agent_id: "agent-1".into(),
            hostname: "h1".into(),
            agent_ip: None,
            attributes: BTreeMap::new(),
            offer_id: "o1".into(),
            ports: vec![],
            resources: Resource::default(),
            current_resources: Resource::default(),
            resched_times,
            last_resched_time: None,
            running_since: None,
            kill_requested_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn restart(kind: RestartKind, max_times: u32) -> RestartPolicy {
        RestartPolicy {
            kind,
            interval_secs: 5,
            backoff_secs: 10,
            max_times,
            retention_secs: None,
        }
    }

    fn policy() -> ReschedulePolicy {
        ReschedulePolicy::new(RescheduleConfig::default())
    }

    #[rstest]
    #[case::never_fail(RestartKind::Never, TaskGroupStatus::Fail)]
    #[case::never_finish(RestartKind::Never, TaskGroupStatus::Finish)]
    #[case::on_failure_finish(RestartKind::OnFailure, TaskGroupStatus::Finish)]
    fn test_policy_skips(#[case] kind: RestartKind, #[case] status: TaskGroupStatus) {
        assert_eq!(policy().decide(&group(0), status, &restart(kind, 0)), Decision::Skip);
    }

    #[rstest]
    #[case::on_failure_fail(RestartKind::OnFailure, TaskGroupStatus::Fail)]
    #[case::always_finish(RestartKind::Always, TaskGroupStatus::Finish)]
    #[case::always_fail(RestartKind::Always, TaskGroupStatus::Fail)]
    fn test_policy_reschedules(#[case] kind: RestartKind, #[case] status: TaskGroupStatus) {
        let decision = policy().decide(&group(0), status, &restart(kind, 0));
        assert!(matches!(decision, Decision::Reschedule { .. }));
    }

    #[test]
    fn test_delay_backs_off_with_count() {
        let Decision::Reschedule { op, delay } =
            policy().decide(&group(2), TaskGroupStatus::Fail, &restart(RestartKind::OnFailure, 0))
        else {
            panic!("expected reschedule");
        };
        assert_eq!(delay, Duration::from_secs(25));
        assert_eq!(op.resched_times, 3);
        assert!(!op.force);
        assert_eq!(op.retain_host, None);
    }

    #[test]
    fn test_delay_clamped_to_max_life_period() {
        let decision = policy().decide(&group(1000), TaskGroupStatus::Fail, &restart(RestartKind::Always, 0));
        let Decision::Reschedule { delay, .. } = decision else {
            panic!("expected reschedule");
        };
        assert_eq!(delay, RescheduleConfig::default().max_life_period);
    }

    #[test]
    fn test_max_times_exhausts() {
        let decision = policy().decide(&group(3), TaskGroupStatus::Fail, &restart(RestartKind::OnFailure, 3));
        assert_eq!(decision, Decision::Exhausted { resched_times: 3 });
    }

    #[test]
    fn test_lost_ignores_policy_and_counters() {
        let decision = policy().decide(&group(3), TaskGroupStatus::Lost, &restart(RestartKind::Never, 3));
        let Decision::Reschedule { op, delay } = decision else {
            panic!("expected reschedule");
        };
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(op.resched_times, 4);
    }

    #[test]
    fn test_retention_pins_previous_host() {
        let mut restart = restart(RestartKind::OnFailure, 0);
        restart.retention_secs = Some(60);
        let Decision::Reschedule { op, .. } = policy().decide(&group(0), TaskGroupStatus::Fail, &restart) else {
            panic!("expected reschedule");
        };
        assert_eq!(op.retain_host.as_deref(), Some("h1"));
        assert_eq!(op.retention_secs, 60);
    }
}
