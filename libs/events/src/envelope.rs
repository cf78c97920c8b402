//! Event envelope - the common wrapper for all notifications.

use chrono::{DateTime, Utc};
use drover_id::EventId;
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Application,
    TaskGroup,
    Transaction,
    Deployment,
    Node,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Application => "application",
            AggregateType::TaskGroup => "task_group",
            AggregateType::Transaction => "transaction",
            AggregateType::Deployment => "deployment",
            AggregateType::Node => "node",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Process-local, increasing identifier.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// Key of the aggregate, e.g. `ns.app` or a task group id.
    pub aggregate_id: String,

    /// The event type (e.g., "task_group.lost").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// Grouping ID for related events, typically the transaction id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }

    /// Converts the payload while keeping the envelope metadata.
    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> EventEnvelope<Q> {
        EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            event_version: self.event_version,
            correlation_id: self.correlation_id,
            payload: f(self.payload),
        }
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    aggregate_type: Option<AggregateType>,
    aggregate_id: Option<String>,
    event_type: Option<String>,
    event_version: i32,
    correlation_id: Option<String>,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            aggregate_type: None,
            aggregate_id: None,
            event_type: None,
            event_version: 1,
            correlation_id: None,
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn aggregate(mut self, agg_type: AggregateType, agg_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(agg_type);
        self.aggregate_id = Some(agg_id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event_version(mut self, version: i32) -> Self {
        self.event_version = version;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope.
    ///
    /// `occurred_at` defaults to the current time; every other field except
    /// `correlation_id` is required.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            aggregate_type: self
                .aggregate_type
                .ok_or(EventError::MissingField("aggregate_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventError::MissingField("aggregate_id"))?,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            event_version: self.event_version,
            correlation_id: self.correlation_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_type_display() {
        assert_eq!(AggregateType::TaskGroup.to_string(), "task_group");
        assert_eq!(
            serde_json::to_string(&AggregateType::Application).unwrap(),
            "\"application\""
        );
    }

    #[test]
    fn test_event_envelope_builder() {
        let envelope = EventEnvelope::<serde_json::Value>::builder()
            .event_id(EventId::new(7))
            .aggregate(AggregateType::TaskGroup, "0.web.prod.c1.42")
            .event_type("task_group.lost")
            .payload(serde_json::json!({"reason": "agent gone"}))
            .build()
            .unwrap();

        assert_eq!(envelope.event_type, "task_group.lost");
        assert_eq!(envelope.event_version, 1);
        assert_eq!(envelope.aggregate_type, AggregateType::TaskGroup);
        assert!(envelope.correlation_id.is_none());
    }

    #[test]
    fn test_builder_reports_missing_field() {
        let err = EventEnvelope::<u32>::builder()
            .event_id(EventId::new(1))
            .aggregate(AggregateType::Node, "host-1")
            .payload(3)
            .build()
            .unwrap_err();
        assert!(matches!(err, EventError::MissingField("event_type")));
    }
}
