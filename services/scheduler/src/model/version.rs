//! Immutable workload definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use drover_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use super::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    #[default]
    Application,
    /// One replica per agent; carries an implicit `UNIQUE hostname` constraint.
    Daemonset,
}

/// A versioned workload specification. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    /// Assigned on submission; unique within the application.
    pub id: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub kind: WorkloadKind,
    pub instances: u32,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub kill_policy: KillPolicy,
    /// Environment shared by every container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Version {
    /// Total resources of one pod.
    pub fn pod_resources(&self) -> Resource {
        self.containers.iter().map(|c| c.resources).sum()
    }

    /// Host ports one pod needs from an offer.
    pub fn ports_needed(&self) -> usize {
        self.containers.iter().map(|c| c.ports.len()).sum()
    }

    /// Declared constraints plus the ones implied by the workload kind.
    pub fn effective_constraints(&self) -> Vec<Constraint> {
        let mut constraints = self.constraints.clone();
        if self.kind == WorkloadKind::Daemonset
            && !constraints
                .iter()
                .any(|c| c.op == ConstraintOp::Unique && c.attribute == "hostname")
        {
            constraints.push(Constraint::unique("hostname"));
        }
        constraints
    }

    /// Fingerprint of everything that shapes a pod. Ids, timestamps and the
    /// replica count are excluded so a pure scale never looks like an update.
    pub fn spec_hash(&self) -> SpecHash {
        let json = serde_json::json!({
            "kind": self.kind,
            "containers": self.containers,
            "constraints": self.constraints,
            "restart_policy": self.restart_policy,
            "kill_policy": self.kill_policy,
            "env": self.env,
            "labels": self.labels,
        });
        SpecHash::from_json(&json)
    }

    pub fn has_health_checks(&self) -> bool {
        self.containers.iter().any(|c| c.health_check.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub resources: Resource,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub config_maps: Vec<ConfigMapItem>,
    #[serde(default)]
    pub secrets: Vec<SecretItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub name: String,
    pub container_port: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Fixed host port; taken from the offer's ranges when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u32>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthProtocol {
    Http,
    Tcp,
    Cmd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: HealthProtocol,
    /// Name of the container port to probe (HTTP/TCP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    #[serde(default)]
    pub grace_period_secs: u64,
    pub consecutive_failures: u32,
}

/// A file rendered into the container before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapItem {
    pub path: String,
    pub content: String,
}

/// A resolved secret exposed to the container as an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretItem {
    pub env_name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConstraintOp {
    /// No two pods share the attribute value.
    Unique,
    /// Every pod lands on the given value (or on the value of the first pod).
    Cluster,
    /// Attribute matches the regex.
    Like,
    /// Attribute does not match the regex.
    Unlike,
    /// At most N pods per attribute value.
    Maxper,
    /// Attribute is none of the comma-separated values.
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub attribute: String,
    pub op: ConstraintOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Constraint {
    pub fn new(attribute: impl Into<String>, op: ConstraintOp, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            op,
            value: Some(value.into()),
        }
    }

    pub fn unique(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            op: ConstraintOp::Unique,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartKind {
    Never,
    #[default]
    OnFailure,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub kind: RestartKind,
    /// Base delay before a reschedule.
    pub interval_secs: u64,
    /// Added once per previous reschedule.
    pub backoff_secs: u64,
    /// Zero means unbounded.
    pub max_times: u32,
    /// How long a rescheduled pod prefers its previous host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            kind: RestartKind::OnFailure,
            interval_secs: 1,
            backoff_secs: 10,
            max_times: 0,
            retention_secs: None,
        }
    }
}

impl RestartPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillPolicy {
    pub grace_period_secs: u64,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(cpus: f64) -> Container {
        Container {
            name: "main".into(),
            image: "web:1".into(),
            command: None,
            args: vec![],
            resources: Resource::new(cpus, 128.0, 0.0),
            env: BTreeMap::new(),
            ports: vec![PortMapping {
                name: "http".into(),
                container_port: 80,
                protocol: "tcp".into(),
                host_port: None,
            }],
            health_check: None,
            config_maps: vec![],
            secrets: vec![],
        }
    }

    fn version(instances: u32) -> Version {
        Version {
            id: "v1".into(),
            namespace: "prod".into(),
            name: "web".into(),
            kind: WorkloadKind::Application,
            instances,
            containers: vec![container(0.5), container(0.25)],
            constraints: vec![],
            restart_policy: RestartPolicy::default(),
            kill_policy: KillPolicy::default(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_pod_resources_and_ports() {
        let v = version(2);
        assert_eq!(v.pod_resources(), Resource::new(0.75, 256.0, 0.0));
        assert_eq!(v.ports_needed(), 2);
    }

    #[test]
    fn test_spec_hash_ignores_instances_and_id() {
        let a = version(2);
        let mut b = version(5);
        b.id = "v2".into();
        assert_eq!(a.spec_hash(), b.spec_hash());

        b.containers[0].image = "web:2".into();
        assert_ne!(a.spec_hash(), b.spec_hash());
    }

    #[test]
    fn test_daemonset_implies_unique_hostname() {
        let mut v = version(1);
        v.kind = WorkloadKind::Daemonset;
        let constraints = v.effective_constraints();
        assert_eq!(constraints, vec![Constraint::unique("hostname")]);
    }

    #[test]
    fn test_constraint_op_serialization() {
        let c = Constraint::new("rack", ConstraintOp::Maxper, "2");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["op"], "MAXPER");
    }
}
