//! Core graph types for the ThreatMap knowledge graph.
//!
//! Node and relationship types are runtime data described by the schema, so
//! records here carry their type as a string and their properties as a JSON
//! map rather than as one Rust struct per entity kind.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace UUID for deterministic node and edge identities.
const THREATMAP_NS: Uuid = Uuid::from_bytes([
    0x3f, 0x1c, 0x9e, 0x52, 0x7a, 0x04, 0x4b, 0x8e, 0x91, 0x2d, 0x5c, 0xe0, 0x6a, 0x71, 0xb3, 0x08,
]);

/// Separator between the encoded constraint values of a composite key.
const KEY_SEPARATOR: char = '\u{1f}';

/// Property name → value mapping carried by nodes, edges, and observations.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

// ── Identities ────────────────────────────────────────────────────

/// Unique identifier for any node in the knowledge graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// A fresh identity, used for node types without constraint fields.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The identity of a keyed node. Every process derives the same id for
    /// the same `(node_type, key)` pair.
    pub fn for_key(node_type: &str, key: &NodeKey) -> Self {
        let name = format!("node:{node_type}{KEY_SEPARATOR}{}", key.as_str());
        Self(Uuid::new_v5(&THREATMAP_NS, name.as_bytes()))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an edge in the knowledge graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    /// The identity of the edge for a `(source, target, label)` triple.
    pub fn for_key(key: &EdgeKey) -> Self {
        let name = format!(
            "edge:{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            key.source_id, key.target_id, key.label
        );
        Self(Uuid::new_v5(&THREATMAP_NS, name.as_bytes()))
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The natural key of a node: its ordered, normalized constraint values.
///
/// Each value is encoded as canonical JSON, so string `"80"` and number `80`
/// never collide, and the values are joined with U+001F.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    /// Build a key from already-normalized constraint values.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a serde_json::Value>) -> Self {
        let encoded: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
        Self(encoded.join(&KEY_SEPARATOR.to_string()))
    }

    /// Rebuild a key from its encoded form, as persisted by a store.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.replace(KEY_SEPARATOR, "|"))
    }
}

/// Identity of an edge: exactly one current edge exists per triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub label: String,
}

impl EdgeKey {
    pub fn new(source_id: NodeId, target_id: NodeId, label: impl Into<String>) -> Self {
        Self {
            source_id,
            target_id,
            label: label.into(),
        }
    }

    pub fn edge_id(&self) -> EdgeId {
        EdgeId::for_key(self)
    }
}

// ── Records ───────────────────────────────────────────────────────

/// A canonical node as held by the graph store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub node_type: String,
    /// Natural key, absent for constraint-free types.
    pub key: Option<NodeKey>,
    pub properties: PropertyMap,
    /// Number of effective writes applied to this node (1 on creation).
    pub revision: u64,
}

/// A canonical edge as held by the graph store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeRecord {
    pub id: EdgeId,
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub label: String,
    /// The property that decides whether a new observation updates this edge.
    pub index_property: String,
    pub properties: PropertyMap,
    /// Number of effective writes applied to this edge (1 on creation).
    pub revision: u64,
}

impl EdgeRecord {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.source_id, self.target_id, self.label.clone())
    }

    /// Current value of the index property, if set.
    pub fn index_value(&self) -> Option<&serde_json::Value> {
        self.properties.get(&self.index_property)
    }
}

/// Which side of a node to traverse when listing edges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// A whole-graph export for offline consumers.
///
/// Nodes are ordered by id and edges by (source, target, label), so two
/// exports of the same graph state serialize identically.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

impl GraphSnapshot {
    pub fn new(mut nodes: Vec<NodeRecord>, mut edges: Vec<EdgeRecord>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        edges.sort_by(|a, b| a.key().cmp(&b.key()));
        Self { nodes, edges }
    }

    pub fn nodes_of_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a NodeRecord> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }

    pub fn edges_with_label<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a EdgeRecord> {
        self.edges.iter().filter(move |e| e.label == label)
    }
}
