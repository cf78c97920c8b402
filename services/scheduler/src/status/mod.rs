//! Status aggregation.
//!
//! Pod status is a pure function of its tasks' statuses and application
//! status a pure function of its pods' statuses. Both are evaluated with a
//! fixed precedence, so the result never depends on iteration order.

mod pipeline;
mod policy;

use tracing::warn;

use crate::model::{AppStatus, TaskGroup, TaskGroupStatus, TaskStatus};

pub use pipeline::StatusPipeline;
pub use policy::{Decision, ReschedulePolicy};

/// Pod status from its tasks, first match wins:
/// FAIL, KILLING, ERROR, all FINISH, all KILLED, LOST, all STAGING,
/// STARTING, RESTARTING, RUNNING, otherwise UNKNOWN.
pub fn aggregate_task_group(statuses: &[TaskStatus]) -> TaskGroupStatus {
    if statuses.is_empty() {
        return TaskGroupStatus::Unknown;
    }
    let any = |s: TaskStatus| statuses.contains(&s);
    let all = |s: TaskStatus| statuses.iter().all(|t| *t == s);

    if any(TaskStatus::Fail) {
        TaskGroupStatus::Fail
    } else if any(TaskStatus::Killing) {
        TaskGroupStatus::Killing
    } else if any(TaskStatus::Error) {
        TaskGroupStatus::Error
    } else if all(TaskStatus::Finish) {
        TaskGroupStatus::Finish
    } else if all(TaskStatus::Killed) {
        TaskGroupStatus::Killed
    } else if any(TaskStatus::Lost) {
        TaskGroupStatus::Lost
    } else if all(TaskStatus::Staging) {
        TaskGroupStatus::Staging
    } else if any(TaskStatus::Starting) {
        TaskGroupStatus::Starting
    } else if any(TaskStatus::Restarting) {
        TaskGroupStatus::Restarting
    } else if any(TaskStatus::Running) {
        TaskGroupStatus::Running
    } else {
        warn!(?statuses, "Task statuses match no pod status");
        TaskGroupStatus::Unknown
    }
}

/// Recomputes a pod's status from its tasks.
pub fn refresh_task_group(group: &mut TaskGroup) -> TaskGroupStatus {
    let statuses: Vec<TaskStatus> = group.tasks.iter().map(|t| t.status).collect();
    group.status = aggregate_task_group(&statuses);
    group.status
}

/// Application status from its pods' statuses.
pub fn aggregate_application(instances: u32, statuses: &[TaskGroupStatus]) -> AppStatus {
    let count = |s: TaskGroupStatus| statuses.iter().filter(|g| **g == s).count();

    if count(TaskGroupStatus::Error) > 0 {
        return AppStatus::Error;
    }
    if count(TaskGroupStatus::Fail) > 0
        || count(TaskGroupStatus::Lost) > 0
        || statuses.len() < instances as usize
    {
        return AppStatus::Abnormal;
    }
    if !statuses.is_empty() && count(TaskGroupStatus::Finish) == statuses.len() {
        return AppStatus::Finish;
    }
    if count(TaskGroupStatus::Staging) > 0 || count(TaskGroupStatus::Starting) > 0 {
        return AppStatus::Deploying;
    }
    if count(TaskGroupStatus::Running) == instances as usize {
        return AppStatus::Running;
    }
    AppStatus::Abnormal
}

/// Number of pods currently RUNNING.
pub fn running_count(groups: &[TaskGroup]) -> u32 {
    groups
        .iter()
        .filter(|g| g.status == TaskGroupStatus::Running)
        .count() as u32
}

/// Application status over a set of pods.
pub fn application_status(instances: u32, groups: &[TaskGroup]) -> AppStatus {
    let statuses: Vec<TaskGroupStatus> = groups.iter().map(|g| g.status).collect();
    aggregate_application(instances, &statuses)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use TaskStatus::*;

    #[rstest]
    #[case::fail_beats_killing(&[Killing, Fail, Running], TaskGroupStatus::Fail)]
    #[case::killing_beats_error(&[Error, Killing], TaskGroupStatus::Killing)]
    #[case::error(&[Running, Error], TaskGroupStatus::Error)]
    #[case::all_finish(&[Finish, Finish], TaskGroupStatus::Finish)]
    #[case::finish_and_killed(&[Finish, Killed], TaskGroupStatus::Unknown)]
    #[case::all_killed(&[Killed], TaskGroupStatus::Killed)]
    #[case::lost(&[Running, Lost], TaskGroupStatus::Lost)]
    #[case::all_staging(&[Staging, Staging], TaskGroupStatus::Staging)]
    #[case::starting(&[Staging, Starting, Running], TaskGroupStatus::Starting)]
    #[case::restarting(&[Running, Restarting], TaskGroupStatus::Restarting)]
    #[case::running(&[Running, Finish], TaskGroupStatus::Running)]
    #[case::staging_and_running(&[Staging, Running], TaskGroupStatus::Running)]
    #[case::empty(&[], TaskGroupStatus::Unknown)]
    fn test_task_group_precedence(#[case] tasks: &[TaskStatus], #[case] expected: TaskGroupStatus) {
        assert_eq!(aggregate_task_group(tasks), expected);
    }

    #[rstest]
    #[case::error_wins(3, &[TaskGroupStatus::Running, TaskGroupStatus::Error, TaskGroupStatus::Fail], AppStatus::Error)]
    #[case::lost_is_abnormal(2, &[TaskGroupStatus::Running, TaskGroupStatus::Lost], AppStatus::Abnormal)]
    #[case::under_provisioned(3, &[TaskGroupStatus::Running, TaskGroupStatus::Running], AppStatus::Abnormal)]
    #[case::all_finished(2, &[TaskGroupStatus::Finish, TaskGroupStatus::Finish], AppStatus::Finish)]
    #[case::deploying(2, &[TaskGroupStatus::Running, TaskGroupStatus::Staging], AppStatus::Deploying)]
    #[case::running(2, &[TaskGroupStatus::Running, TaskGroupStatus::Running], AppStatus::Running)]
    #[case::killed_pod(2, &[TaskGroupStatus::Running, TaskGroupStatus::Killed], AppStatus::Abnormal)]
    #[case::zero_instances(0, &[], AppStatus::Running)]
    fn test_application_precedence(
        #[case] instances: u32,
        #[case] pods: &[TaskGroupStatus],
        #[case] expected: AppStatus,
    ) {
        assert_eq!(aggregate_application(instances, pods), expected);
    }

    fn task_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(Staging),
            Just(Starting),
            Just(Running),
            Just(Finish),
            Just(Error),
            Just(Fail),
            Just(Killing),
            Just(Killed),
            Just(Lost),
            Just(Restarting),
        ]
    }

    proptest! {
        #[test]
        fn test_task_group_status_ignores_order(
            statuses in prop::collection::vec(task_status(), 1..8),
            rotate in 0usize..8,
        ) {
            let expected = aggregate_task_group(&statuses);

            let mut reversed = statuses.clone();
            reversed.reverse();
            prop_assert_eq!(aggregate_task_group(&reversed), expected);

            let mut rotated = statuses.clone();
            let by = rotate % rotated.len();
            rotated.rotate_left(by);
            prop_assert_eq!(aggregate_task_group(&rotated), expected);

            let mut sorted = statuses;
            sorted.sort();
            prop_assert_eq!(aggregate_task_group(&sorted), expected);
        }
    }
}
