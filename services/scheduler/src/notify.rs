//! Outbound notifications: alerts and service-endpoint changes.
//!
//! Both sinks are fire-and-forget. A failed delivery is logged and never
//! retried, and never fails the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use drover_events::{
    AlertKind, AlertLevel, AlertPayload, EndpointChange, EndpointPayload, EventEnvelope, PortBinding,
};
use drover_id::EventId;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::model::TaskGroup;

pub type AlertEvent = EventEnvelope<AlertPayload>;
pub type EndpointEvent = EventEnvelope<EndpointPayload>;

/// Receives alerts.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, event: &AlertEvent);
}

/// Receives pod endpoint changes for service discovery.
#[async_trait]
pub trait EndpointNotifier: Send + Sync {
    async fn publish(&self, event: &EndpointEvent);
}

/// Builds envelopes and hands them to the configured sinks.
pub struct Notifier {
    alerter: Arc<dyn Alerter>,
    endpoints: Arc<dyn EndpointNotifier>,
    seq: AtomicU64,
    clock: SharedClock,
}

impl Notifier {
    pub fn new(alerter: Arc<dyn Alerter>, endpoints: Arc<dyn EndpointNotifier>, clock: SharedClock) -> Self {
        Self {
            alerter,
            endpoints,
            seq: AtomicU64::new(0),
            clock,
        }
    }

    /// Notifier that only logs.
    pub fn logging(clock: SharedClock) -> Self {
        Self::new(Arc::new(LogAlerter), Arc::new(LogEndpoints), clock)
    }

    fn next_id(&self) -> EventId {
        EventId::new(self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub async fn alert(&self, payload: AlertPayload, aggregate_id: &str, correlation_id: Option<String>) {
        let mut builder = EventEnvelope::builder()
            .event_id(self.next_id())
            .occurred_at(self.clock.now())
            .aggregate(payload.kind.aggregate_type(), aggregate_id)
            .event_type(payload.kind.event_type())
            .payload(payload);
        if let Some(id) = correlation_id {
            builder = builder.correlation_id(id);
        }
        match builder.build() {
            Ok(event) => self.alerter.alert(&event).await,
            Err(e) => error!(error = %e, "Failed to build alert"),
        }
    }

    pub async fn endpoint(&self, change: EndpointChange, group: &TaskGroup) {
        let payload = EndpointPayload {
            change,
            namespace: group.id.namespace().to_string(),
            app: group.id.app().to_string(),
            task_group_id: group.id.clone(),
            hostname: Some(group.hostname.clone()),
            agent_ip: group.agent_ip.clone(),
            ports: group
                .ports
                .iter()
                .map(|p| PortBinding {
                    name: p.name.clone(),
                    container_port: p.container_port,
                    host_port: p.host_port,
                    protocol: p.protocol.clone(),
                })
                .collect(),
            status: group.status.to_string(),
            healthy: group.is_ready(),
        };
        let event = EventEnvelope::builder()
            .event_id(self.next_id())
            .occurred_at(self.clock.now())
            .aggregate(drover_events::AggregateType::TaskGroup, group.id.to_string())
            .event_type(change.event_type())
            .payload(payload)
            .build();
        match event {
            Ok(event) => self.endpoints.publish(&event).await,
            Err(e) => error!(error = %e, "Failed to build endpoint event"),
        }
    }
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, event: &AlertEvent) {
        let p = &event.payload;
        match p.level {
            AlertLevel::Info => info!(
                event_type = %event.event_type,
                namespace = %p.namespace,
                name = %p.name,
                message = %p.message,
                "Alert"
            ),
            AlertLevel::Warning | AlertLevel::Critical => warn!(
                event_type = %event.event_type,
                level = ?p.level,
                namespace = %p.namespace,
                name = %p.name,
                message = %p.message,
                "Alert"
            ),
        }
    }
}

/// Writes endpoint changes to the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEndpoints;

#[async_trait]
impl EndpointNotifier for LogEndpoints {
    async fn publish(&self, event: &EndpointEvent) {
        debug!(
            event_type = %event.event_type,
            task_group_id = %event.payload.task_group_id,
            status = %event.payload.status,
            "Endpoint change"
        );
    }
}

/// POSTs alerts as JSON to a webhook.
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, event: &AlertEvent) {
        let request = self.client.post(&self.url).json(event);
        let event_type = event.event_type.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(event_type = %event_type, "Alert delivered");
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    warn!(event_type = %event_type, status = %status, body = %body, "Alert webhook rejected alert");
                }
                Err(e) => warn!(event_type = %event_type, error = %e, "Alert webhook unreachable"),
            }
        });
    }
}

/// Sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<AlertEvent>>,
    endpoints: Mutex<Vec<EndpointEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn alert_kinds(&self) -> Vec<AlertKind> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.payload.kind)
            .collect()
    }

    pub fn endpoints(&self) -> Vec<EndpointEvent> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn endpoint_changes(&self) -> Vec<(EndpointChange, String)> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| (e.payload.change, e.payload.task_group_id.to_string()))
            .collect()
    }
}

#[async_trait]
impl Alerter for RecordingSink {
    async fn alert(&self, event: &AlertEvent) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[async_trait]
impl EndpointNotifier for RecordingSink {
    async fn publish(&self, event: &EndpointEvent) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_alerts_get_increasing_ids() {
        let sink = Arc::new(RecordingSink::new());
        let notifier = Notifier::new(sink.clone(), sink.clone(), Arc::new(ManualClock::at_epoch()));

        for _ in 0..2 {
            notifier
                .alert(
                    AlertPayload::new(AlertKind::TaskGroupLost, "prod", "web", "agent gone"),
                    "0.web.prod.c1.1",
                    Some("txn_x".into()),
                )
                .await;
        }

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].event_id < alerts[1].event_id);
        assert_eq!(alerts[0].event_type, "task_group.lost");
        assert_eq!(alerts[0].correlation_id.as_deref(), Some("txn_x"));
    }

    #[tokio::test]
    async fn test_webhook_alerter_posts_json() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let alerter = WebhookAlerter::new(format!("{}/alerts", server.uri())).unwrap();
        let notifier = Notifier::new(
            Arc::new(alerter),
            Arc::new(LogEndpoints),
            Arc::new(ManualClock::at_epoch()),
        );
        notifier
            .alert(
                AlertPayload::new(AlertKind::TransactionTimeout, "prod", "web", "timed out"),
                "prod.web",
                None,
            )
            .await;

        // Delivery runs on a spawned task.
        for _ in 0..50 {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["payload"]["kind"], "transaction_timeout");
    }
}
