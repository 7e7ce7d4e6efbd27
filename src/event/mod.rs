// src/event/mod.rs

//! Event model and the asynchronous event bus
//!
//! This module provides:
//! - A typed event envelope (`Event`) carrying one `EventPayload` variant per
//!   event kind, plus priority and correlation metadata
//! - Named handlers with failure isolation and statistics (`handler`)
//! - Declarative and predicate based subscription filters (`filter`)
//! - The priority-ordered, concurrency-bounded dispatcher (`bus`)

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::{CorrelationId, Id, Metadata};

pub mod bus;
pub mod filter;
pub mod handler;

pub use bus::{DispatchOutcome, DispatchReport, EventBus, EventBusMetrics, EventSubscription};
pub use filter::EventFilter;
pub use handler::{
    BatchHandler, ConditionalHandler, EventHandler, FnHandler, Handler, HandlerStatistics,
    RetryHandler, SyncFnHandler,
};

/// Event priority levels
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EventPriority {
    /// Background work such as periodic metrics
    Low = 0,
    /// Normal priority events
    #[default]
    Normal = 50,
    /// High priority events (user actions, errors)
    High = 100,
    /// Critical priority events; escalated by the coordinator
    Critical = 200,
}

impl EventPriority {
    pub fn is_high(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Normal => write!(f, "NORMAL"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Discriminant used for subscription matching
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    AudioStreamStarted,
    AudioStreamStopped,
    AudioDataReceived,
    RecognitionCompleted,
    RecognitionPartial,
    TtsStarted,
    TtsCompleted,
    ComponentStateChanged,
    SystemStarted,
    SystemShutdown,
    Error,
    Metric,
    ConfigChanged,
    /// Application defined event, matched by name
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AudioStreamStarted => "audio.stream_started",
            Self::AudioStreamStopped => "audio.stream_stopped",
            Self::AudioDataReceived => "audio.data_received",
            Self::RecognitionCompleted => "recognition.completed",
            Self::RecognitionPartial => "recognition.partial",
            Self::TtsStarted => "tts.started",
            Self::TtsCompleted => "tts.completed",
            Self::ComponentStateChanged => "component.state_changed",
            Self::SystemStarted => "system.started",
            Self::SystemShutdown => "system.shutdown",
            Self::Error => "system.error",
            Self::Metric => "system.metric",
            Self::ConfigChanged => "config.changed",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload, one variant per event kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    AudioStreamStarted {
        stream_id: String,
        sample_rate: u32,
        channels: u16,
    },
    AudioStreamStopped {
        stream_id: String,
        reason: Option<String>,
    },
    AudioDataReceived {
        stream_id: String,
        frames: usize,
        duration_ms: u64,
    },
    RecognitionCompleted {
        engine: String,
        text: String,
        confidence: f32,
        duration_ms: u64,
    },
    RecognitionPartial {
        engine: String,
        text: String,
    },
    TtsStarted {
        engine: String,
        text: String,
    },
    TtsCompleted {
        engine: String,
        duration_ms: u64,
    },
    ComponentStateChanged {
        component: String,
        old_state: Option<String>,
        new_state: String,
        metadata: Metadata,
    },
    SystemStarted {
        components: usize,
    },
    SystemShutdown {
        reason: String,
    },
    Error {
        message: String,
        component: Option<String>,
        error_kind: String,
        details: Option<Value>,
    },
    Metric {
        name: String,
        value: f64,
        unit: Option<String>,
        tags: HashMap<String, String>,
    },
    ConfigChanged {
        key: String,
        old_value: Option<Value>,
        new_value: Value,
    },
    Custom {
        name: String,
        data: Value,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AudioStreamStarted { .. } => EventType::AudioStreamStarted,
            Self::AudioStreamStopped { .. } => EventType::AudioStreamStopped,
            Self::AudioDataReceived { .. } => EventType::AudioDataReceived,
            Self::RecognitionCompleted { .. } => EventType::RecognitionCompleted,
            Self::RecognitionPartial { .. } => EventType::RecognitionPartial,
            Self::TtsStarted { .. } => EventType::TtsStarted,
            Self::TtsCompleted { .. } => EventType::TtsCompleted,
            Self::ComponentStateChanged { .. } => EventType::ComponentStateChanged,
            Self::SystemStarted { .. } => EventType::SystemStarted,
            Self::SystemShutdown { .. } => EventType::SystemShutdown,
            Self::Error { .. } => EventType::Error,
            Self::Metric { .. } => EventType::Metric,
            Self::ConfigChanged { .. } => EventType::ConfigChanged,
            Self::Custom { name, .. } => EventType::Custom(name.clone()),
        }
    }
}

/// Correlation metadata used to trace chains of causally related events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<Id>,
    pub tags: Vec<String>,
    pub properties: Metadata,
}

/// An immutable record of something that happened
///
/// `id`, `timestamp` and the payload (and with it the event type) are fixed
/// at construction. Priority, source and metadata can be adjusted through the
/// consuming `with_*` builders until the event is handed to the bus, which
/// shares it behind an `Arc` from then on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: Id,
    timestamp: DateTime<Utc>,
    source: String,
    priority: EventPriority,
    payload: EventPayload,
    metadata: EventMetadata,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            priority: EventPriority::Normal,
            payload,
            metadata: EventMetadata::default(),
        }
    }

    /// Error event; high priority unless raised to critical by the producer
    pub fn error(
        source: impl Into<String>,
        message: impl Into<String>,
        component: Option<String>,
        error_kind: impl Into<String>,
    ) -> Self {
        Self::new(
            source,
            EventPayload::Error {
                message: message.into(),
                component,
                error_kind: error_kind.into(),
                details: None,
            },
        )
        .with_priority(EventPriority::High)
    }

    pub fn metric(source: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self::new(
            source,
            EventPayload::Metric {
                name: name.into(),
                value,
                unit: None,
                tags: HashMap::new(),
            },
        )
        .with_priority(EventPriority::Low)
    }

    pub fn custom(source: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self::new(
            source,
            EventPayload::Custom {
                name: name.into(),
                data,
            },
        )
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn priority(&self) -> EventPriority {
        self.priority
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority.is_high()
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.metadata.correlation_id
    }

    /// Payload fields as an open map, for handlers that inspect events generically
    pub fn data(&self) -> Map<String, Value> {
        match serde_json::to_value(&self.payload) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.properties.insert(key.into(), value);
        self
    }

    /// Marks this event as caused by `parent`, inheriting its correlation chain
    pub fn caused_by(mut self, parent: &Event) -> Self {
        self.metadata.correlation_id = Some(parent.correlation_id().unwrap_or(parent.id));
        self.metadata.causation_id = Some(parent.id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognition() -> Event {
        Event::new(
            "asr_engine",
            EventPayload::RecognitionCompleted {
                engine: "vosk".to_string(),
                text: "hello world".to_string(),
                confidence: 0.92,
                duration_ms: 840,
            },
        )
    }

    #[test]
    fn test_event_priority() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
        assert!(EventPriority::Critical.is_high());
        assert!(!EventPriority::Normal.is_high());
    }

    #[test]
    fn test_event_type_follows_payload() {
        let event = recognition();
        assert_eq!(event.event_type(), EventType::RecognitionCompleted);
        assert_eq!(event.event_type().as_str(), "recognition.completed");

        let custom = Event::custom("gui", "export.requested", serde_json::json!({"rows": 3}));
        assert_eq!(
            custom.event_type(),
            EventType::Custom("export.requested".to_string())
        );
    }

    #[test]
    fn test_data_exposes_payload_fields() {
        let data = recognition().data();
        assert_eq!(data.get("kind"), Some(&Value::from("recognition_completed")));
        assert_eq!(data.get("text"), Some(&Value::from("hello world")));
        assert_eq!(data.get("duration_ms"), Some(&Value::from(840)));
    }

    #[test]
    fn test_builders_keep_identity() {
        let event = recognition();
        let id = event.id();
        let timestamp = event.timestamp();

        let event = event
            .with_priority(EventPriority::High)
            .with_tag("dictation")
            .with_property("session", Value::from("s-1"));

        assert_eq!(event.id(), id);
        assert_eq!(event.timestamp(), timestamp);
        assert!(event.is_high_priority());
        assert_eq!(event.metadata().tags, vec!["dictation".to_string()]);
    }

    #[test]
    fn test_causation_chain() {
        let root = recognition();
        let child = Event::metric("asr_engine", "latency_ms", 840.0).caused_by(&root);
        let grandchild = Event::metric("exporter", "rows", 1.0).caused_by(&child);

        assert_eq!(child.correlation_id(), Some(root.id()));
        assert_eq!(child.metadata().causation_id, Some(root.id()));
        assert_eq!(grandchild.correlation_id(), Some(root.id()));
        assert_eq!(grandchild.metadata().causation_id, Some(child.id()));
    }

    #[test]
    fn test_error_event_defaults_high() {
        let event = Event::error("tts_engine", "device lost", None, "io");
        assert_eq!(event.priority(), EventPriority::High);
        assert_eq!(event.event_type(), EventType::Error);
    }
}
