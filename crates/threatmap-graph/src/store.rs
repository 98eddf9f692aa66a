//! The graph store contract.
//!
//! A store is the sole owner of canonical node and edge records. Callers hold
//! identifiers only and re-read through the store. Both upserts are atomic
//! per identity: concurrent upserts of the same node key or edge triple see
//! exactly one winner, and every loser observes the winner's record.

use async_trait::async_trait;
use serde::Serialize;

use threatmap_core::types::{
    Direction, EdgeId, EdgeKey, EdgeRecord, GraphSnapshot, NodeId, NodeKey, NodeRecord, PropertyMap,
};
use threatmap_core::IndexPolicy;

use crate::client::GraphError;

/// A node write: create the node, or merge into the node with the same key.
#[derive(Debug, Clone)]
pub struct NodeUpsert {
    pub node_type: String,
    /// `None` for constraint-free types: always creates a new node.
    pub key: Option<NodeKey>,
    /// Normalized observed properties.
    pub properties: PropertyMap,
}

/// What a node upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpsertOutcome {
    pub id: NodeId,
    pub created: bool,
    /// Properties whose value changed. Empty on creation and on no-op merges.
    pub changed_fields: Vec<String>,
}

/// An edge write for a declared relationship.
#[derive(Debug, Clone)]
pub struct EdgeUpsert {
    pub key: EdgeKey,
    pub source_type: String,
    pub target_type: String,
    pub index_property: String,
    pub policy: IndexPolicy,
    /// Properties a new edge is created with (defaults plus observation).
    pub seed: PropertyMap,
    /// Properties overlaid on an existing edge (observation plus the
    /// effective index value).
    pub observed: PropertyMap,
}

/// How an edge upsert changed the stored edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum EdgeChange {
    Created,
    Updated { changed_fields: Vec<String> },
    Unchanged,
    /// The stored edge has a newer monotonic index value and was kept.
    Stale {
        stored: serde_json::Value,
        observed: serde_json::Value,
    },
}

/// What an edge upsert did.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeUpsertOutcome {
    pub id: EdgeId,
    pub change: EdgeChange,
}

/// Indexed backing storage for the consolidated graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Fetch a keyed node by type and natural key.
    async fn get_node(&self, node_type: &str, key: &NodeKey) -> Result<Option<NodeRecord>, GraphError>;

    async fn get_node_by_id(&self, id: NodeId) -> Result<Option<NodeRecord>, GraphError>;

    /// Atomic check-and-create or merge.
    async fn upsert_node(&self, upsert: NodeUpsert) -> Result<NodeUpsertOutcome, GraphError>;

    async fn get_edge(&self, key: &EdgeKey) -> Result<Option<EdgeRecord>, GraphError>;

    /// Atomic create or policy-checked merge. Both endpoints must exist.
    async fn upsert_edge(&self, upsert: EdgeUpsert) -> Result<EdgeUpsertOutcome, GraphError>;

    /// Edges touching `node`, optionally restricted to one label.
    async fn edges_of(
        &self,
        node: NodeId,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Vec<EdgeRecord>, GraphError>;

    /// The whole graph, in deterministic order.
    async fn export(&self) -> Result<GraphSnapshot, GraphError>;
}
