//! Workload builder.
//!
//! Turns a version and a consumed offer into a pod record plus the launch group
//! handed to the resource manager. Pure: no I/O, no clock reads.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use drover_id::{IdError, TaskGroupId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    AllocatedPort, ConfigMapItem, Container, HealthCheck, HealthProtocol, Offer, PortRange, Resource, Task,
    TaskGroup, TaskGroupStatus, TaskStatus, Version,
};

/// Resources reserved for the pod executor itself.
pub const EXECUTOR_RESOURCES: Resource = Resource {
    cpus: 0.1,
    mem: 32.0,
    disk: 0.0,
    gpus: 0.0,
};

#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("version has no containers")]
    NoContainers,

    #[error("host port {0} is not in the offer")]
    PortUnavailable(u32),

    #[error("offer has {available} ports, pod needs {needed}")]
    InsufficientPorts { needed: usize, available: usize },

    #[error("health check of {container} probes unknown port {port_name}")]
    HealthCheckPort { container: String, port_name: String },

    #[error("invalid pod id: {0}")]
    Id(#[from] IdError),
}

/// Everything needed to build one pod.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub version: &'a Version,
    pub cluster: &'a str,
    pub index: u32,
    pub offer: &'a Offer,
    pub now: DateTime<Utc>,
    /// Pod this one replaces; its stamp is never reused.
    pub replaces: Option<&'a TaskGroupId>,
    pub resched_times: u32,
    pub last_resched_time: Option<DateTime<Utc>>,
}

/// Launch description handed to the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchGroup {
    pub offer_id: String,
    pub agent_id: String,
    pub executor: ExecutorInfo,
    pub tasks: Vec<TaskInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    pub resources: Resource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub resources: Resource,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<AllocatedPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckInfo>,
    #[serde(default)]
    pub files: Vec<ConfigMapItem>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Health check with its port resolved to the bound host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckInfo {
    pub protocol: HealthProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub grace_period_secs: u64,
    pub consecutive_failures: u32,
}

/// Resources one pod of `version` takes from an offer.
pub fn pod_need(version: &Version) -> Resource {
    version.pod_resources() + EXECUTOR_RESOURCES
}

/// Builds a pod and its launch group.
pub fn build(req: &BuildRequest<'_>) -> Result<(TaskGroup, LaunchGroup), BuildError> {
    let version = req.version;
    if version.containers.is_empty() {
        return Err(BuildError::NoContainers);
    }

    let mut stamp = req.now.timestamp_millis().max(0) as u64;
    if let Some(prev) = req.replaces {
        if prev.stamp() >= stamp {
            stamp = prev.stamp() + 1;
        }
    }
    let id = TaskGroupId::new(req.index, &version.name, &version.namespace, req.cluster, stamp)?;

    let mut ports = PortAllocator::new(req.offer, version);
    let mut tasks = Vec::with_capacity(version.containers.len());
    let mut infos = Vec::with_capacity(version.containers.len());
    let mut all_ports = Vec::new();

    for (position, container) in version.containers.iter().enumerate() {
        let task_id = id.task(position as u32);
        let bound = ports.bind(container)?;
        let health_check = container
            .health_check
            .as_ref()
            .map(|hc| resolve_health_check(container, hc, &bound))
            .transpose()?;

        let env = task_env(req, &id, &task_id, container, &bound);

        tasks.push(Task {
            id: task_id.clone(),
            name: container.name.clone(),
            status: TaskStatus::Staging,
            has_health_check: health_check.is_some(),
            healthy: None,
            updated_at: None,
            message: None,
            raw_status: None,
        });

        infos.push(TaskInfo {
            task_id,
            name: container.name.clone(),
            resources: container.resources,
            image: container.image.clone(),
            command: container.command.clone(),
            args: container.args.clone(),
            env,
            ports: bound.clone(),
            health_check,
            files: container.config_maps.clone(),
            labels: version.labels.clone(),
        });

        all_ports.extend(bound);
    }

    let need = pod_need(version);
    let group = TaskGroup {
        id: id.clone(),
        version_id: version.id.clone(),
        version_hash: version.spec_hash(),
        status: TaskGroupStatus::Staging,
        tasks,
        agent_id: req.offer.agent_id.clone(),
        hostname: req.offer.hostname.clone(),
        agent_ip: req.offer.agent_ip.clone(),
        attributes: req.offer.attributes.clone(),
        offer_id: req.offer.id.clone(),
        ports: all_ports,
        resources: need,
        current_resources: need,
        resched_times: req.resched_times,
        last_resched_time: req.last_resched_time,
        running_since: None,
        kill_requested_at: None,
        created_at: req.now,
        updated_at: req.now,
    };

    let launch = LaunchGroup {
        offer_id: req.offer.id.clone(),
        agent_id: req.offer.agent_id.clone(),
        executor: ExecutorInfo {
            executor_id: id.executor_id(),
            resources: EXECUTOR_RESOURCES,
        },
        tasks: infos,
    };

    Ok((group, launch))
}

/// Hands out host ports from an offer's ranges, fixed ports first.
struct PortAllocator {
    ranges: Vec<PortRange>,
    free: Vec<u32>,
    next: usize,
    needed: usize,
}

impl PortAllocator {
    fn new(offer: &Offer, version: &Version) -> Self {
        let reserved: BTreeSet<u32> = version
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().filter_map(|p| p.host_port))
            .collect();
        let free = offer
            .ports
            .iter()
            .flat_map(|r| r.begin..=r.end)
            .filter(|p| !reserved.contains(p))
            .take(version.ports_needed())
            .collect();
        Self {
            ranges: offer.ports.clone(),
            free,
            next: 0,
            needed: version.ports_needed(),
        }
    }

    fn bind(&mut self, container: &Container) -> Result<Vec<AllocatedPort>, BuildError> {
        container
            .ports
            .iter()
            .map(|mapping| {
                let host_port = match mapping.host_port {
                    Some(fixed) if self.ranges.iter().any(|r| r.contains(fixed)) => fixed,
                    Some(fixed) => return Err(BuildError::PortUnavailable(fixed)),
                    None => {
                        let port = self.free.get(self.next).copied().ok_or(
                            BuildError::InsufficientPorts {
                                needed: self.needed,
                                available: self.ranges.iter().map(PortRange::len).sum(),
                            },
                        )?;
                        self.next += 1;
                        port
                    }
                };
                Ok(AllocatedPort {
                    name: mapping.name.clone(),
                    container_port: mapping.container_port,
                    host_port,
                    protocol: mapping.protocol.clone(),
                })
            })
            .collect()
    }
}

fn resolve_health_check(
    container: &Container,
    hc: &HealthCheck,
    bound: &[AllocatedPort],
) -> Result<HealthCheckInfo, BuildError> {
    let port = match &hc.port_name {
        Some(name) => Some(
            bound
                .iter()
                .find(|p| &p.name == name)
                .map(|p| p.host_port)
                .ok_or_else(|| BuildError::HealthCheckPort {
                    container: container.name.clone(),
                    port_name: name.clone(),
                })?,
        ),
        None => None,
    };

    Ok(HealthCheckInfo {
        protocol: hc.protocol,
        port,
        path: hc.path.clone(),
        command: hc.command.clone(),
        interval_secs: hc.interval_secs,
        timeout_secs: hc.timeout_secs,
        grace_period_secs: hc.grace_period_secs,
        consecutive_failures: hc.consecutive_failures,
    })
}

fn task_env(
    req: &BuildRequest<'_>,
    id: &TaskGroupId,
    task_id: &TaskId,
    container: &Container,
    bound: &[AllocatedPort],
) -> BTreeMap<String, String> {
    let version = req.version;
    let mut env = version.env.clone();
    env.extend(container.env.clone());

    env.insert("DROVER_CLUSTER".into(), req.cluster.to_string());
    env.insert("DROVER_NAMESPACE".into(), version.namespace.clone());
    env.insert("DROVER_APP".into(), version.name.clone());
    env.insert("DROVER_VERSION".into(), version.id.clone());
    env.insert("DROVER_INDEX".into(), req.index.to_string());
    env.insert("DROVER_TASK_GROUP_ID".into(), id.to_string());
    env.insert("DROVER_TASK_ID".into(), task_id.to_string());
    env.insert("DROVER_HOST".into(), req.offer.hostname.clone());
    if let Some(ip) = &req.offer.agent_ip {
        env.insert("DROVER_HOST_IP".into(), ip.clone());
    }

    for (i, port) in bound.iter().enumerate() {
        env.insert(format!("PORT{i}"), port.host_port.to_string());
        let name = port.name.to_uppercase().replace('-', "_");
        env.insert(format!("PORT_{name}"), port.host_port.to_string());
    }

    for secret in &container.secrets {
        env.insert(secret.env_name.clone(), secret.value.clone());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KillPolicy, PortMapping, RestartPolicy, SecretItem, WorkloadKind};

    fn version() -> Version {
        Version {
            id: "v1".into(),
            namespace: "prod".into(),
            name: "web".into(),
            kind: WorkloadKind::Application,
            instances: 2,
            containers: vec![Container {
                name: "main".into(),
                image: "web:1".into(),
                command: None,
                args: vec![],
                resources: Resource::new(0.5, 256.0, 0.0),
                env: BTreeMap::from([("MODE".to_string(), "container".to_string())]),
                ports: vec![
                    PortMapping {
                        name: "http".into(),
                        container_port: 80,
                        protocol: "tcp".into(),
                        host_port: None,
                    },
                    PortMapping {
                        name: "admin-api".into(),
                        container_port: 9000,
                        protocol: "tcp".into(),
                        host_port: Some(31000),
                    },
                ],
                health_check: Some(HealthCheck {
                    protocol: HealthProtocol::Http,
                    port_name: Some("http".into()),
                    path: Some("/health".into()),
                    command: None,
                    interval_secs: 5,
                    timeout_secs: 2,
                    grace_period_secs: 10,
                    consecutive_failures: 3,
                }),
                config_maps: vec![ConfigMapItem {
                    path: "/etc/web.conf".into(),
                    content: "x=1".into(),
                }],
                secrets: vec![SecretItem {
                    env_name: "DB_PASSWORD".into(),
                    value: "hunter2".into(),
                }],
            }],
            constraints: vec![],
            restart_policy: RestartPolicy::default(),
            kill_policy: KillPolicy::default(),
            env: BTreeMap::from([("MODE".to_string(), "shared".to_string())]),
            labels: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    fn offer() -> Offer {
        Offer {
            id: "offer-1".into(),
            pool_id: 1,
            agent_id: "agent-1".into(),
            hostname: "node-1".into(),
            agent_ip: Some("10.0.0.1".into()),
            attributes: BTreeMap::new(),
            resources: Resource::new(4.0, 4096.0, 100.0),
            ports: vec![PortRange::new(31000, 31010)],
            received_at: Utc::now(),
            delta: Resource::default(),
        }
    }

    fn request<'a>(version: &'a Version, offer: &'a Offer, now: DateTime<Utc>) -> BuildRequest<'a> {
        BuildRequest {
            version,
            cluster: "c1",
            index: 1,
            offer,
            now,
            replaces: None,
            resched_times: 0,
            last_resched_time: None,
        }
    }

    #[test]
    fn test_build_wires_ports_env_and_health() {
        let v = version();
        let o = offer();
        let now = Utc::now();
        let (group, launch) = build(&request(&v, &o, now)).unwrap();

        assert_eq!(group.index(), 1);
        assert_eq!(group.status, TaskGroupStatus::Staging);
        assert_eq!(group.hostname, "node-1");
        assert!((group.resources.cpus - 0.6).abs() < 1e-9);
        assert_eq!(group.resources.mem, 288.0);
        assert!(group.tasks[0].has_health_check);

        let task = &launch.tasks[0];
        // The fixed port is reserved, so the dynamic one skips it.
        assert_eq!(task.ports[0].host_port, 31001);
        assert_eq!(task.ports[1].host_port, 31000);
        assert_eq!(task.health_check.as_ref().unwrap().port, Some(31001));
        assert_eq!(task.env["PORT_HTTP"], "31001");
        assert_eq!(task.env["PORT_ADMIN_API"], "31000");
        assert_eq!(task.env["MODE"], "container");
        assert_eq!(task.env["DB_PASSWORD"], "hunter2");
        assert_eq!(task.env["DROVER_TASK_GROUP_ID"], group.id.to_string());
        assert_eq!(task.files.len(), 1);
        assert_eq!(launch.executor.executor_id, group.id.executor_id());
    }

    #[test]
    fn test_replacement_never_reuses_stamp() {
        let v = version();
        let o = offer();
        let now = Utc::now();
        let (first, _) = build(&request(&v, &o, now)).unwrap();

        let mut req = request(&v, &o, now);
        req.replaces = Some(&first.id);
        let (second, _) = build(&req).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn test_insufficient_ports() {
        let v = version();
        let mut o = offer();
        o.ports = vec![PortRange::new(31000, 31000)];
        let err = build(&request(&v, &o, Utc::now())).unwrap_err();
        assert!(matches!(err, BuildError::InsufficientPorts { .. }));
    }

    #[test]
    fn test_fixed_port_outside_offer() {
        let mut v = version();
        v.containers[0].ports[1].host_port = Some(8080);
        let err = build(&request(&v, &offer(), Utc::now())).unwrap_err();
        assert_eq!(err, BuildError::PortUnavailable(8080));
    }

    #[test]
    fn test_unknown_health_check_port() {
        let mut v = version();
        if let Some(hc) = v.containers[0].health_check.as_mut() {
            hc.port_name = Some("grpc".into());
        }
        let err = build(&request(&v, &offer(), Utc::now())).unwrap_err();
        assert!(matches!(err, BuildError::HealthCheckPort { .. }));
    }
}
