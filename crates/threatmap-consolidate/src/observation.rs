//! Observation intake format.
//!
//! One [`ObservationBatch`] is one producer's scan result: typed entity
//! observations plus relationship observations between them.
//!
//! ```json
//! {
//!   "source": "dns-agent",
//!   "entities": [
//!     { "ref": "h", "type": "Host", "properties": { "name": "api.example.com" } },
//!     { "ref": "ip", "type": "IPAddress", "properties": { "address": "10.0.0.5" } }
//!   ],
//!   "relationships": [
//!     { "label": "RESOLVES_TO", "source": { "ref": "h" }, "target": { "ref": "ip" },
//!       "properties": { "last_seen": "2024-05-01T10:00:00Z" } }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use threatmap_core::types::PropertyMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationBatch {
    /// Correlates log lines and results for one batch.
    #[serde(default = "Uuid::new_v4")]
    pub batch_id: Uuid,

    /// The producing agent or tool.
    #[serde(default = "default_source")]
    pub source: String,

    #[serde(default)]
    pub entities: Vec<EntityObservation>,

    #[serde(default)]
    pub relationships: Vec<RelationshipObservation>,
}

fn default_source() -> String {
    "unknown".to_string()
}

impl ObservationBatch {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            source: source.into(),
            entities: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Add an entity observation, referable from relationships as `alias`.
    pub fn entity(mut self, alias: impl Into<String>, node_type: impl Into<String>, properties: PropertyMap) -> Self {
        self.entities.push(EntityObservation {
            alias: Some(alias.into()),
            node_type: node_type.into(),
            properties,
        });
        self
    }

    /// Add an entity observation that no relationship refers to.
    pub fn anonymous_entity(mut self, node_type: impl Into<String>, properties: PropertyMap) -> Self {
        self.entities.push(EntityObservation {
            alias: None,
            node_type: node_type.into(),
            properties,
        });
        self
    }

    pub fn relationship(
        mut self,
        label: impl Into<String>,
        source: EntityRef,
        target: EntityRef,
        properties: PropertyMap,
    ) -> Self {
        self.relationships.push(RelationshipObservation {
            label: label.into(),
            source,
            target,
            properties,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An observed entity of a schema node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityObservation {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default)]
    pub properties: PropertyMap,
}

/// An observed relationship between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipObservation {
    pub label: String,
    pub source: EntityRef,
    pub target: EntityRef,
    #[serde(default)]
    pub properties: PropertyMap,
}

/// How a relationship names one of its endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EntityRef {
    /// An entity observed earlier in the same batch.
    Alias {
        #[serde(rename = "ref")]
        alias: String,
    },
    /// A keyed entity by natural key. Created if the graph has no such node.
    Key {
        #[serde(rename = "type")]
        node_type: String,
        key: PropertyMap,
    },
}

impl EntityRef {
    pub fn alias(alias: impl Into<String>) -> Self {
        Self::Alias { alias: alias.into() }
    }

    pub fn key(node_type: impl Into<String>, key: PropertyMap) -> Self {
        Self::Key {
            node_type: node_type.into(),
            key,
        }
    }
}
