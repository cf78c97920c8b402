//! JSON shapes of the resource manager's scheduler API.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{DriverError, DriverResult, ExecutorMessage, ExecutorReport, FrameworkInfo, SchedulerEvent, StatusUpdate};
use crate::builder::{HealthCheckInfo, LaunchGroup, TaskInfo};
use crate::model::{HealthProtocol, Offer, PortRange, Resource, TaskStatus};

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Deserialize)]
struct IdValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    subscribed: Option<Subscribed>,
    offers: Option<OffersEvent>,
    rescind: Option<RescindEvent>,
    update: Option<UpdateEvent>,
    message: Option<MessageEvent>,
    failure: Option<FailureEvent>,
    error: Option<ErrorEvent>,
}

#[derive(Debug, Deserialize)]
struct Subscribed {
    framework_id: IdValue,
    heartbeat_interval_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OffersEvent {
    #[serde(default)]
    offers: Vec<WireOffer>,
}

#[derive(Debug, Deserialize)]
struct WireOffer {
    id: IdValue,
    agent_id: IdValue,
    hostname: String,
    url: Option<WireUrl>,
    #[serde(default)]
    resources: Vec<WireResource>,
    #[serde(default)]
    attributes: Vec<WireAttribute>,
}

#[derive(Debug, Deserialize)]
struct WireUrl {
    address: WireAddress,
}

#[derive(Debug, Deserialize)]
struct WireAddress {
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResource {
    name: String,
    scalar: Option<Scalar>,
    ranges: Option<Ranges>,
}

#[derive(Debug, Deserialize)]
struct Scalar {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct Ranges {
    #[serde(default)]
    range: Vec<WireRange>,
}

#[derive(Debug, Deserialize)]
struct WireRange {
    begin: u64,
    end: u64,
}

#[derive(Debug, Deserialize)]
struct WireAttribute {
    name: String,
    text: Option<IdValue>,
    scalar: Option<Scalar>,
}

#[derive(Debug, Deserialize)]
struct RescindEvent {
    offer_id: IdValue,
}

#[derive(Debug, Deserialize)]
struct UpdateEvent {
    status: Value,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    task_id: IdValue,
    state: String,
    agent_id: Option<IdValue>,
    healthy: Option<bool>,
    message: Option<String>,
    reason: Option<String>,
    uuid: Option<String>,
    timestamp: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    agent_id: IdValue,
    executor_id: IdValue,
    data: String,
}

#[derive(Debug, Deserialize)]
struct FailureEvent {
    agent_id: Option<IdValue>,
    executor_id: Option<IdValue>,
    status: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    message: String,
}

fn missing(kind: &str) -> DriverError {
    DriverError::Decode(format!("{kind} event without body"))
}

/// Maps a task state name onto [`TaskStatus`].
///
/// Every state meaning "the agent no longer knows the task" collapses to LOST.
pub fn task_state(state: &str) -> Option<TaskStatus> {
    let status = match state {
        "TASK_STAGING" => TaskStatus::Staging,
        "TASK_STARTING" => TaskStatus::Starting,
        "TASK_RUNNING" => TaskStatus::Running,
        "TASK_FINISHED" => TaskStatus::Finish,
        "TASK_FAILED" => TaskStatus::Fail,
        "TASK_KILLING" => TaskStatus::Killing,
        "TASK_KILLED" => TaskStatus::Killed,
        "TASK_ERROR" => TaskStatus::Error,
        "TASK_RESTARTING" => TaskStatus::Restarting,
        "TASK_LOST" | "TASK_DROPPED" | "TASK_UNREACHABLE" | "TASK_GONE" | "TASK_GONE_BY_OPERATOR"
        | "TASK_UNKNOWN" => TaskStatus::Lost,
        _ => return None,
    };
    Some(status)
}

/// Decodes one record. Event types the scheduler does not consume yield `None`.
pub fn decode_event(record: &[u8], now: DateTime<Utc>) -> DriverResult<Option<SchedulerEvent>> {
    let event: WireEvent = serde_json::from_slice(record)?;
    let decoded = match event.kind.as_str() {
        "SUBSCRIBED" => {
            let body = event.subscribed.ok_or_else(|| missing("SUBSCRIBED"))?;
            SchedulerEvent::Subscribed {
                framework_id: body.framework_id.value,
                heartbeat_interval: body
                    .heartbeat_interval_seconds
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .map(Duration::from_secs_f64),
            }
        }
        "OFFERS" => {
            let body = event.offers.ok_or_else(|| missing("OFFERS"))?;
            SchedulerEvent::Offers(body.offers.into_iter().map(|o| offer(o, now)).collect())
        }
        "RESCIND" => {
            let body = event.rescind.ok_or_else(|| missing("RESCIND"))?;
            SchedulerEvent::Rescind {
                offer_id: body.offer_id.value,
            }
        }
        "UPDATE" => {
            let body = event.update.ok_or_else(|| missing("UPDATE"))?;
            SchedulerEvent::Update(status_update(body.status, now)?)
        }
        "MESSAGE" => {
            let body = event.message.ok_or_else(|| missing("MESSAGE"))?;
            let data = STANDARD
                .decode(body.data.as_bytes())
                .map_err(|e| DriverError::Decode(format!("message data: {e}")))?;
            SchedulerEvent::Message {
                agent_id: body.agent_id.value,
                executor_id: body.executor_id.value,
                report: serde_json::from_slice::<ExecutorReport>(&data)?,
            }
        }
        "FAILURE" => {
            let body = event.failure.ok_or_else(|| missing("FAILURE"))?;
            let Some(agent_id) = body.agent_id else {
                return Ok(None);
            };
            SchedulerEvent::Failure {
                agent_id: agent_id.value,
                executor_id: body.executor_id.map(|e| e.value),
                status: body.status,
            }
        }
        "ERROR" => SchedulerEvent::Error {
            message: event.error.map(|e| e.message).unwrap_or_default(),
        },
        "HEARTBEAT" => SchedulerEvent::Heartbeat,
        _ => return Ok(None),
    };
    Ok(Some(decoded))
}

fn offer(wire: WireOffer, now: DateTime<Utc>) -> Offer {
    let mut resources = Resource::default();
    let mut ports = Vec::new();
    for r in wire.resources {
        let scalar = r.scalar.map(|s| s.value).unwrap_or_default();
        match r.name.as_str() {
            "cpus" => resources.cpus += scalar,
            "mem" => resources.mem += scalar,
            "disk" => resources.disk += scalar,
            "gpus" => resources.gpus += scalar,
            "ports" => {
                for range in r.ranges.map(|r| r.range).unwrap_or_default() {
                    if let (Ok(begin), Ok(end)) = (u32::try_from(range.begin), u32::try_from(range.end)) {
                        ports.push(PortRange::new(begin, end));
                    }
                }
            }
            _ => {}
        }
    }

    let attributes: BTreeMap<String, String> = wire
        .attributes
        .into_iter()
        .filter_map(|a| {
            let value = match (a.text, a.scalar) {
                (Some(text), _) => text.value,
                (None, Some(scalar)) => scalar.value.to_string(),
                (None, None) => return None,
            };
            Some((a.name, value))
        })
        .collect();

    Offer {
        id: wire.id.value,
        pool_id: 0,
        agent_id: wire.agent_id.value,
        hostname: wire.hostname,
        agent_ip: wire.url.and_then(|u| u.address.ip),
        attributes,
        resources,
        ports,
        received_at: now,
        delta: Resource::default(),
    }
}

fn status_update(raw: Value, now: DateTime<Utc>) -> DriverResult<StatusUpdate> {
    let status: WireStatus = serde_json::from_value(raw.clone())?;
    let state = task_state(&status.state)
        .ok_or_else(|| DriverError::Decode(format!("unknown task state {}", status.state)))?;
    let timestamp = status
        .timestamp
        .and_then(|ts| DateTime::from_timestamp_micros((ts * 1_000_000.0) as i64))
        .unwrap_or(now);
    Ok(StatusUpdate {
        task_id: status.task_id.value,
        state,
        agent_id: status.agent_id.map(|a| a.value),
        healthy: status.healthy,
        message: status.message,
        reason: status.reason,
        uuid: status.uuid,
        timestamp,
        raw,
    })
}

// =============================================================================
// Calls
// =============================================================================

fn id(value: &str) -> Value {
    json!({ "value": value })
}

fn scalar(name: &str, value: f64) -> Value {
    json!({ "name": name, "type": "SCALAR", "scalar": { "value": value } })
}

fn resources(r: &Resource) -> Vec<Value> {
    let mut out = vec![scalar("cpus", r.cpus), scalar("mem", r.mem)];
    if r.disk > 0.0 {
        out.push(scalar("disk", r.disk));
    }
    if r.gpus > 0.0 {
        out.push(scalar("gpus", r.gpus));
    }
    out
}

pub fn subscribe_call(framework: &FrameworkInfo) -> Value {
    let mut info = json!({
        "name": framework.name,
        "user": framework.user,
        "roles": [framework.role],
        "failover_timeout": framework.failover_timeout.as_secs_f64(),
        "checkpoint": true,
        "capabilities": [
            { "type": "MULTI_ROLE" },
            { "type": "PARTITION_AWARE" },
            { "type": "TASK_KILLING_STATE" }
        ],
    });
    let mut call = json!({ "type": "SUBSCRIBE" });
    if let Some(fid) = &framework.id {
        info["id"] = id(fid);
        call["framework_id"] = id(fid);
    }
    call["subscribe"] = json!({ "framework_info": info });
    call
}

fn health_check(hc: &HealthCheckInfo) -> Value {
    let mut check = json!({
        "delay_seconds": hc.grace_period_secs,
        "interval_seconds": hc.interval_secs,
        "timeout_seconds": hc.timeout_secs,
        "consecutive_failures": hc.consecutive_failures,
        "grace_period_seconds": hc.grace_period_secs,
    });
    match hc.protocol {
        HealthProtocol::Http => {
            check["type"] = json!("HTTP");
            check["http"] = json!({ "port": hc.port, "path": hc.path.as_deref().unwrap_or("/") });
        }
        HealthProtocol::Tcp => {
            check["type"] = json!("TCP");
            check["tcp"] = json!({ "port": hc.port });
        }
        HealthProtocol::Cmd => {
            check["type"] = json!("COMMAND");
            check["command"] = json!({ "shell": true, "value": hc.command });
        }
    }
    check
}

fn task(task: &TaskInfo, agent_id: &str) -> DriverResult<Value> {
    let mut res = resources(&task.resources);
    if !task.ports.is_empty() {
        let ranges: Vec<Value> = task
            .ports
            .iter()
            .map(|p| json!({ "begin": p.host_port, "end": p.host_port }))
            .collect();
        res.push(json!({ "name": "ports", "type": "RANGES", "ranges": { "range": ranges } }));
    }

    let variables: Vec<Value> = task
        .env
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v }))
        .collect();
    let mut command = json!({
        "shell": task.command.is_some(),
        "arguments": task.args,
        "environment": { "variables": variables },
    });
    if let Some(value) = &task.command {
        command["value"] = json!(value);
    }

    let labels: Vec<Value> = task
        .labels
        .iter()
        .map(|(k, v)| json!({ "key": k, "value": v }))
        .collect();

    let mut info = json!({
        "name": task.name,
        "task_id": id(&task.task_id.to_string()),
        "agent_id": id(agent_id),
        "resources": res,
        "container": {
            "type": "MESOS",
            "mesos": { "image": { "type": "DOCKER", "docker": { "name": task.image } } }
        },
        "command": command,
        "labels": { "labels": labels },
    });
    if let Some(hc) = &task.health_check {
        info["health_check"] = health_check(hc);
    }
    if !task.files.is_empty() {
        info["data"] = json!(STANDARD.encode(serde_json::to_vec(&task.files)?));
    }
    Ok(info)
}

pub fn accept_call(framework_id: &str, group: &LaunchGroup) -> DriverResult<Value> {
    let tasks = group
        .tasks
        .iter()
        .map(|t| task(t, &group.agent_id))
        .collect::<DriverResult<Vec<_>>>()?;
    Ok(json!({
        "type": "ACCEPT",
        "framework_id": id(framework_id),
        "accept": {
            "offer_ids": [id(&group.offer_id)],
            "operations": [{
                "type": "LAUNCH_GROUP",
                "launch_group": {
                    "executor": {
                        "type": "DEFAULT",
                        "executor_id": id(&group.executor.executor_id),
                        "framework_id": id(framework_id),
                        "resources": resources(&group.executor.resources),
                    },
                    "task_group": { "tasks": tasks },
                }
            }],
        }
    }))
}

pub fn decline_call(framework_id: &str, offer_ids: &[String], refuse: Duration) -> Value {
    let ids: Vec<Value> = offer_ids.iter().map(|o| id(o)).collect();
    json!({
        "type": "DECLINE",
        "framework_id": id(framework_id),
        "decline": {
            "offer_ids": ids,
            "filters": { "refuse_seconds": refuse.as_secs_f64() },
        }
    })
}

pub fn shutdown_call(framework_id: &str, agent_id: &str, executor_id: &str) -> Value {
    json!({
        "type": "SHUTDOWN",
        "framework_id": id(framework_id),
        "shutdown": { "executor_id": id(executor_id), "agent_id": id(agent_id) },
    })
}

pub fn acknowledge_call(framework_id: &str, agent_id: &str, task_id: &str, uuid: &str) -> Value {
    json!({
        "type": "ACKNOWLEDGE",
        "framework_id": id(framework_id),
        "acknowledge": { "agent_id": id(agent_id), "task_id": id(task_id), "uuid": uuid },
    })
}

pub fn message_call(
    framework_id: &str,
    agent_id: &str,
    executor_id: &str,
    message: &ExecutorMessage,
) -> DriverResult<Value> {
    let data = STANDARD.encode(serde_json::to_vec(message)?);
    Ok(json!({
        "type": "MESSAGE",
        "framework_id": id(framework_id),
        "message": { "agent_id": id(agent_id), "executor_id": id(executor_id), "data": data },
    }))
}

pub fn reconcile_call(framework_id: &str, tasks: &[(String, String)]) -> Value {
    let tasks: Vec<Value> = tasks
        .iter()
        .map(|(task_id, agent_id)| json!({ "task_id": id(task_id), "agent_id": id(agent_id) }))
        .collect();
    json!({
        "type": "RECONCILE",
        "framework_id": id(framework_id),
        "reconcile": { "tasks": tasks },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_decode_offers() {
        let record = json!({
            "type": "OFFERS",
            "offers": { "offers": [{
                "id": { "value": "o1" },
                "framework_id": { "value": "fw" },
                "agent_id": { "value": "a1" },
                "hostname": "node-1",
                "url": { "scheme": "http", "address": { "ip": "10.0.0.1", "port": 5051 } },
                "resources": [
                    { "name": "cpus", "type": "SCALAR", "scalar": { "value": 4.0 } },
                    { "name": "mem", "type": "SCALAR", "scalar": { "value": 8192.0 } },
                    { "name": "ports", "type": "RANGES", "ranges": { "range": [{ "begin": 31000, "end": 31009 }] } }
                ],
                "attributes": [{ "name": "rack", "type": "TEXT", "text": { "value": "r1" } }]
            }]}
        });
        let event = decode_event(record.to_string().as_bytes(), now()).unwrap().unwrap();
        let SchedulerEvent::Offers(offers) = event else {
            panic!("expected offers");
        };
        assert_eq!(offers.len(), 1);
        let o = &offers[0];
        assert_eq!(o.agent_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(o.resources.cpus, 4.0);
        assert_eq!(o.port_count(), 10);
        assert_eq!(o.attribute("rack"), Some("r1"));
        assert_eq!(o.received_at, now());
    }

    #[test]
    fn test_decode_update_maps_unreachable_to_lost() {
        let record = json!({
            "type": "UPDATE",
            "update": { "status": {
                "task_id": { "value": "0.web.prod.c1.1.0" },
                "state": "TASK_UNREACHABLE",
                "agent_id": { "value": "a1" },
                "uuid": "AAEC",
                "timestamp": 1700000100.5
            }}
        });
        let event = decode_event(record.to_string().as_bytes(), now()).unwrap().unwrap();
        let SchedulerEvent::Update(update) = event else {
            panic!("expected update");
        };
        assert_eq!(update.state, TaskStatus::Lost);
        assert_eq!(update.uuid.as_deref(), Some("AAEC"));
        assert_eq!(update.timestamp.timestamp(), 1_700_000_100);
        assert_eq!(update.raw["state"], "TASK_UNREACHABLE");
    }

    #[test]
    fn test_decode_executor_message() {
        let report = ExecutorReport::Health {
            task_id: "0.web.prod.c1.1.0".into(),
            healthy: false,
        };
        let data = STANDARD.encode(serde_json::to_vec(&report).unwrap());
        let record = json!({
            "type": "MESSAGE",
            "message": { "agent_id": { "value": "a1" }, "executor_id": { "value": "exec" }, "data": data }
        });
        let event = decode_event(record.to_string().as_bytes(), now()).unwrap().unwrap();
        assert_eq!(
            event,
            SchedulerEvent::Message {
                agent_id: "a1".into(),
                executor_id: "exec".into(),
                report,
            }
        );
    }

    #[test]
    fn test_unconsumed_events_are_skipped() {
        let record = br#"{"type":"INVERSE_OFFERS","inverse_offers":{}}"#;
        assert!(decode_event(record, now()).unwrap().is_none());
    }

    #[test]
    fn test_decline_call_shape() {
        let call = decline_call("fw", &["o1".to_string()], Duration::from_secs(5));
        assert_eq!(call["decline"]["offer_ids"][0]["value"], "o1");
        assert_eq!(call["decline"]["filters"]["refuse_seconds"], 5.0);
    }
}
