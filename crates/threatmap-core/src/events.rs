//! Change feed emitted by the consolidation engine.
//!
//! Every effective mutation of the graph produces one [`GraphEvent`].
//! Re-ingesting data that is already present produces none, so consumers can
//! treat the feed as a log of real changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EdgeId, NodeId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// A change to the consolidated graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    /// The producer whose batch caused the change.
    pub source: String,
    pub payload: EventPayload,
}

impl GraphEvent {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    // ── Node events ───────────────────────────────────────────
    NodeCreated {
        node_id: NodeId,
        node_type: String,
    },
    NodeUpdated {
        node_id: NodeId,
        node_type: String,
        changed_fields: Vec<String>,
    },

    // ── Edge events ───────────────────────────────────────────
    EdgeCreated {
        edge_id: EdgeId,
        source_id: NodeId,
        target_id: NodeId,
        label: String,
    },
    EdgeUpdated {
        edge_id: EdgeId,
        label: String,
        changed_fields: Vec<String>,
    },
    /// An observation arrived with an older monotonic index value and was
    /// not applied.
    EdgeStale {
        edge_id: EdgeId,
        label: String,
        index_property: String,
        stored: serde_json::Value,
        observed: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_roundtrip() {
        let event = GraphEvent::new(
            "nmap-agent",
            EventPayload::NodeCreated {
                node_id: NodeId::new(),
                node_type: "Host".to_string(),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: GraphEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, deserialized.id);
        assert_eq!(event.payload, deserialized.payload);
    }

    #[test]
    fn event_payload_tags() {
        let payload = EventPayload::EdgeStale {
            edge_id: EdgeId(Uuid::nil()),
            label: "RESOLVES_TO".to_string(),
            index_property: "last_seen".to_string(),
            stored: serde_json::json!(100),
            observed: serde_json::json!(50),
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"event_type\":\"EdgeStale\""));
    }
}
