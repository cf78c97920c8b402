//! Dotted workload identifiers handed to the cluster manager.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

const TASK_GROUP_SEGMENTS: usize = 5;
const TASK_SEGMENTS: usize = 6;

fn check_name(name: &str) -> Result<(), IdError> {
    if name.is_empty() || name.contains('.') {
        return Err(IdError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Identity of one pod (task group).
///
/// Two pods with the same index of the same application differ only by
/// `stamp`, which the builder derives from the launch time. A reschedule
/// therefore produces a fresh identity while keeping the replica index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskGroupId {
    index: u32,
    app: String,
    namespace: String,
    cluster: String,
    stamp: u64,
}

impl TaskGroupId {
    /// Builds a task group id, validating that no name contains a dot.
    pub fn new(
        index: u32,
        app: impl Into<String>,
        namespace: impl Into<String>,
        cluster: impl Into<String>,
        stamp: u64,
    ) -> Result<Self, IdError> {
        let app = app.into();
        let namespace = namespace.into();
        let cluster = cluster.into();
        check_name(&app)?;
        check_name(&namespace)?;
        check_name(&cluster)?;

        Ok(Self {
            index,
            app,
            namespace,
            cluster,
            stamp,
        })
    }

    /// Replica index within the application.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Owning application name.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Owning namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Cluster the pod was scheduled into.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Launch stamp distinguishing successive incarnations of one index.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// `namespace.app`, the key of the owning application.
    pub fn app_key(&self) -> String {
        format!("{}.{}", self.namespace, self.app)
    }

    /// Id of the `container`-th task of this pod.
    pub fn task(&self, container: u32) -> TaskId {
        TaskId {
            task_group: self.clone(),
            container,
        }
    }

    /// Executor id used for the whole pod.
    pub fn executor_id(&self) -> String {
        format!("exec.{self}")
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != TASK_GROUP_SEGMENTS {
            return Err(IdError::SegmentCount {
                id: s.to_string(),
                expected: TASK_GROUP_SEGMENTS,
                actual: parts.len(),
            });
        }
        Self::from_segments(s, &parts)
    }

    fn from_segments(raw: &str, parts: &[&str]) -> Result<Self, IdError> {
        let index = parts[0].parse().map_err(|_| IdError::InvalidSegment {
            id: raw.to_string(),
            field: "index",
        })?;
        let stamp = parts[4].parse().map_err(|_| IdError::InvalidSegment {
            id: raw.to_string(),
            field: "stamp",
        })?;
        Self::new(index, parts[1], parts[2], parts[3], stamp)
    }
}

impl fmt::Display for TaskGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.index, self.app, self.namespace, self.cluster, self.stamp
        )
    }
}

impl FromStr for TaskGroupId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity of one task inside a pod.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    task_group: TaskGroupId,
    container: u32,
}

impl TaskId {
    /// The pod that owns this task.
    pub fn task_group_id(&self) -> &TaskGroupId {
        &self.task_group
    }

    /// Position of the container inside the pod definition.
    pub fn container(&self) -> u32 {
        self.container
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != TASK_SEGMENTS {
            return Err(IdError::SegmentCount {
                id: s.to_string(),
                expected: TASK_SEGMENTS,
                actual: parts.len(),
            });
        }
        let task_group = TaskGroupId::from_segments(s, &parts[..TASK_GROUP_SEGMENTS])?;
        let container = parts[5].parse().map_err(|_| IdError::InvalidSegment {
            id: s.to_string(),
            field: "container",
        })?;
        Ok(Self {
            task_group,
            container,
        })
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.task_group, self.container)
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

macro_rules! string_serde {
    ($name:ident) => {
        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(TaskGroupId);
string_serde!(TaskId);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_task_group_id_format() {
        let id = TaskGroupId::new(2, "web", "prod", "cls-a", 1_700_000_000).unwrap();
        assert_eq!(id.to_string(), "2.web.prod.cls-a.1700000000");
        assert_eq!(id.executor_id(), "exec.2.web.prod.cls-a.1700000000");
        assert_eq!(id.app_key(), "prod.web");
    }

    #[test]
    fn test_task_id_recovers_task_group() {
        let tg = TaskGroupId::new(0, "api", "ns1", "c1", 42).unwrap();
        let task: TaskId = "0.api.ns1.c1.42.3".parse().unwrap();
        assert_eq!(task.task_group_id(), &tg);
        assert_eq!(task.container(), 3);
        assert_eq!(tg.task(3), task);
    }

    #[test]
    fn test_names_with_dots_rejected() {
        let err = TaskGroupId::new(0, "a.b", "ns", "c", 1).unwrap_err();
        assert!(matches!(err, IdError::InvalidName(_)));
        assert!(err.is_workload_error());
    }

    #[test]
    fn test_segment_errors() {
        let err = TaskGroupId::parse("0.web.prod").unwrap_err();
        assert!(matches!(err, IdError::SegmentCount { actual: 3, .. }));

        let err = TaskGroupId::parse("x.web.prod.c.1").unwrap_err();
        assert!(matches!(err, IdError::InvalidSegment { field: "index", .. }));

        let err = TaskId::parse("0.web.prod.c.1.z").unwrap_err();
        assert!(matches!(err, IdError::InvalidSegment { field: "container", .. }));
    }

    #[test]
    fn test_serde_as_string() {
        let id = TaskGroupId::new(1, "web", "prod", "c", 9).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"1.web.prod.c.9\"");
        let back: TaskGroupId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn prop_task_id_always_points_at_its_pod(
            index in 0u32..10_000,
            app in "[a-z][a-z0-9-]{0,12}",
            ns in "[a-z][a-z0-9-]{0,12}",
            stamp in any::<u64>(),
            container in 0u32..16,
        ) {
            let tg = TaskGroupId::new(index, app, ns, "cluster", stamp).unwrap();
            let task = TaskId::parse(&tg.task(container).to_string()).unwrap();
            prop_assert_eq!(task.task_group_id(), &tg);
        }
    }
}
