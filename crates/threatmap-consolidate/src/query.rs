//! Read-only query boundary for downstream consumers.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use threatmap_core::types::{Direction, EdgeRecord, GraphSnapshot, NodeId, NodeRecord, PropertyMap};
use threatmap_graph::GraphStore;

use crate::engine::ConsolidationEngine;
use crate::error::Result;
use crate::resolver::EntityResolver;

#[derive(Clone)]
pub struct GraphQuery {
    resolver: EntityResolver,
    store: Arc<dyn GraphStore>,
}

impl GraphQuery {
    pub fn new(engine: &ConsolidationEngine) -> Self {
        Self {
            resolver: engine.resolver().clone(),
            store: Arc::clone(engine.store()),
        }
    }

    /// Fetch a node by type and natural key. The key map must carry every
    /// constraint field of the type.
    pub async fn node(&self, node_type: &str, key: PropertyMap) -> Result<Option<NodeRecord>> {
        self.resolver.lookup(node_type, key).await
    }

    pub async fn node_by_id(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        Ok(self.store.get_node_by_id(id).await?)
    }

    pub async fn edges(&self, node: NodeId, direction: Direction, label: Option<&str>) -> Result<Vec<EdgeRecord>> {
        Ok(self.store.edges_of(node, direction, label).await?)
    }

    /// A node with its edges and the nodes on their far side.
    pub async fn neighborhood(
        &self,
        node_type: &str,
        key: PropertyMap,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Option<Neighborhood>> {
        let Some(node) = self.node(node_type, key).await? else {
            return Ok(None);
        };

        let edges = self.edges(node.id, direction, label).await?;
        let mut neighbors = Vec::with_capacity(edges.len());
        for edge in edges {
            let other = if edge.source_id == node.id {
                edge.target_id
            } else {
                edge.source_id
            };
            if let Some(neighbor) = self.store.get_node_by_id(other).await? {
                neighbors.push(Neighbor { edge, node: neighbor });
            }
        }
        Ok(Some(Neighborhood { node, neighbors }))
    }

    pub async fn export(&self) -> Result<GraphSnapshot> {
        Ok(self.store.export().await?)
    }

    pub async fn summary(&self) -> Result<GraphSummary> {
        Ok(GraphSummary::from_snapshot(&self.export().await?))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Neighbor {
    pub edge: EdgeRecord,
    pub node: NodeRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct Neighborhood {
    pub node: NodeRecord,
    pub neighbors: Vec<Neighbor>,
}

/// Node counts per type and edge counts per label.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct GraphSummary {
    pub nodes: usize,
    pub edges: usize,
    pub nodes_by_type: BTreeMap<String, usize>,
    pub edges_by_label: BTreeMap<String, usize>,
}

impl GraphSummary {
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let mut summary = Self {
            nodes: snapshot.nodes.len(),
            edges: snapshot.edges.len(),
            ..Default::default()
        };
        for node in &snapshot.nodes {
            *summary.nodes_by_type.entry(node.node_type.clone()).or_default() += 1;
        }
        for edge in &snapshot.edges {
            *summary.edges_by_label.entry(edge.label.clone()).or_default() += 1;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use threatmap_core::SchemaRegistry;
    use threatmap_graph::MemoryGraphStore;

    use super::*;
    use crate::observation::{EntityRef, ObservationBatch};

    fn props(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    fn engine() -> ConsolidationEngine {
        let schema = SchemaRegistry::load_value(json!({
            "schema_mapping": {
                "Host": {
                    "constraints": "name",
                    "relationships": { "IPAddress": { "type": "RESOLVES_TO", "index_prop": "last_seen" } }
                },
                "IPAddress": { "constraints": "address" }
            }
        }))
        .unwrap();
        ConsolidationEngine::new(schema, Arc::new(MemoryGraphStore::new()))
    }

    #[tokio::test]
    async fn neighborhood_and_summary() {
        let engine = engine();
        let batch = ObservationBatch::new("dns")
            .entity("h", "Host", props(json!({ "name": "x" })))
            .entity("a", "IPAddress", props(json!({ "address": "10.0.0.1" })))
            .entity("b", "IPAddress", props(json!({ "address": "10.0.0.2" })))
            .relationship("RESOLVES_TO", EntityRef::alias("h"), EntityRef::alias("a"), props(json!({ "last_seen": 1 })))
            .relationship("RESOLVES_TO", EntityRef::alias("h"), EntityRef::alias("b"), props(json!({ "last_seen": 1 })));
        engine.ingest(batch).await;

        let query = GraphQuery::new(&engine);
        let hood = query
            .neighborhood("Host", props(json!({ "name": "x" })), Direction::Outgoing, Some("RESOLVES_TO"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hood.neighbors.len(), 2);
        assert!(hood.neighbors.iter().all(|n| n.node.node_type == "IPAddress"));

        assert!(query
            .neighborhood("Host", props(json!({ "name": "y" })), Direction::Both, None)
            .await
            .unwrap()
            .is_none());

        let summary = query.summary().await.unwrap();
        assert_eq!(summary.nodes, 3);
        assert_eq!(summary.nodes_by_type.get("IPAddress"), Some(&2));
        assert_eq!(summary.edges_by_label.get("RESOLVES_TO"), Some(&2));
    }

    #[tokio::test]
    async fn node_lookup_validates_the_key() {
        let query = GraphQuery::new(&engine());
        assert!(query.node("Host", props(json!({ "os": "linux" }))).await.is_err());
        assert!(query.node("Domain", props(json!({ "name": "x" }))).await.is_err());
    }
}
