//! Process-local graph store.
//!
//! Keyed nodes have deterministic ids, so a `DashMap` entry lock on the id is
//! the whole check-and-create: the first writer inserts, every later writer
//! lands in the occupied branch and merges. Edges are keyed by their
//! (source, target, label) triple the same way.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use threatmap_core::merge::{self, EdgeMerge};
use threatmap_core::types::{
    Direction, EdgeKey, EdgeRecord, GraphSnapshot, NodeId, NodeKey, NodeRecord,
};

use crate::client::GraphError;
use crate::store::{EdgeChange, EdgeUpsert, EdgeUpsertOutcome, GraphStore, NodeUpsert, NodeUpsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    nodes: DashMap<NodeId, NodeRecord>,
    edges: DashMap<EdgeKey, EdgeRecord>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from a previous export.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let store = Self::new();
        for node in snapshot.nodes {
            store.nodes.insert(node.id, node);
        }
        for edge in snapshot.edges {
            store.edges.insert(edge.key(), edge);
        }
        store
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get_node(&self, node_type: &str, key: &NodeKey) -> Result<Option<NodeRecord>, GraphError> {
        let id = NodeId::for_key(node_type, key);
        Ok(self.nodes.get(&id).map(|r| r.clone()))
    }

    async fn get_node_by_id(&self, id: NodeId) -> Result<Option<NodeRecord>, GraphError> {
        Ok(self.nodes.get(&id).map(|r| r.clone()))
    }

    async fn upsert_node(&self, upsert: NodeUpsert) -> Result<NodeUpsertOutcome, GraphError> {
        let NodeUpsert {
            node_type,
            key,
            properties,
        } = upsert;

        let id = match &key {
            Some(key) => NodeId::for_key(&node_type, key),
            None => NodeId::new(),
        };

        match self.nodes.entry(id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let changed_fields = merge::merge_node_properties(&mut record.properties, &properties);
                if !changed_fields.is_empty() {
                    record.revision += 1;
                }
                Ok(NodeUpsertOutcome {
                    id,
                    created: false,
                    changed_fields,
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(NodeRecord {
                    id,
                    node_type,
                    key,
                    properties,
                    revision: 1,
                });
                Ok(NodeUpsertOutcome {
                    id,
                    created: true,
                    changed_fields: Vec::new(),
                })
            }
        }
    }

    async fn get_edge(&self, key: &EdgeKey) -> Result<Option<EdgeRecord>, GraphError> {
        Ok(self.edges.get(key).map(|r| r.clone()))
    }

    async fn upsert_edge(&self, upsert: EdgeUpsert) -> Result<EdgeUpsertOutcome, GraphError> {
        let endpoints = [
            (upsert.key.source_id, &upsert.source_type),
            (upsert.key.target_id, &upsert.target_type),
        ];
        for (endpoint, expected) in endpoints {
            let Some(node) = self.nodes.get(&endpoint) else {
                return Err(GraphError::NotFound {
                    kind: "Node",
                    id: endpoint.to_string(),
                });
            };
            if &node.node_type != expected {
                return Err(GraphError::EndpointType {
                    id: endpoint.to_string(),
                    expected: expected.clone(),
                    found: node.node_type.clone(),
                });
            }
        }

        let id = upsert.key.edge_id();
        match self.edges.entry(upsert.key.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let change = match merge::merge_edge_properties(
                    &record.properties,
                    &record.index_property,
                    upsert.policy,
                    &upsert.observed,
                ) {
                    EdgeMerge::Unchanged => EdgeChange::Unchanged,
                    EdgeMerge::Updated {
                        properties,
                        changed_fields,
                    } => {
                        record.properties = properties;
                        record.revision += 1;
                        EdgeChange::Updated { changed_fields }
                    }
                    EdgeMerge::Stale { stored, observed } => EdgeChange::Stale { stored, observed },
                };
                Ok(EdgeUpsertOutcome { id, change })
            }
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(EdgeRecord {
                    id,
                    source_id: key.source_id,
                    target_id: key.target_id,
                    label: key.label,
                    index_property: upsert.index_property,
                    properties: upsert.seed,
                    revision: 1,
                });
                Ok(EdgeUpsertOutcome {
                    id,
                    change: EdgeChange::Created,
                })
            }
        }
    }

    async fn edges_of(
        &self,
        node: NodeId,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Vec<EdgeRecord>, GraphError> {
        let mut edges: Vec<EdgeRecord> = self
            .edges
            .iter()
            .filter(|e| {
                let touches = match direction {
                    Direction::Outgoing => e.source_id == node,
                    Direction::Incoming => e.target_id == node,
                    Direction::Both => e.source_id == node || e.target_id == node,
                };
                touches && label.map_or(true, |l| e.label == l)
            })
            .map(|e| e.clone())
            .collect();
        edges.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(edges)
    }

    async fn export(&self) -> Result<GraphSnapshot, GraphError> {
        let nodes = self.nodes.iter().map(|r| r.clone()).collect();
        let edges = self.edges.iter().map(|r| r.clone()).collect();
        Ok(GraphSnapshot::new(nodes, edges))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use threatmap_core::types::PropertyMap;
    use threatmap_core::IndexPolicy;

    use super::*;

    fn props(value: serde_json::Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    fn host(name: &str) -> NodeUpsert {
        NodeUpsert {
            node_type: "Host".to_string(),
            key: Some(NodeKey::from_values(&[json!(name)])),
            properties: props(json!({ "name": name })),
        }
    }

    fn ip(address: &str) -> NodeUpsert {
        NodeUpsert {
            node_type: "IPAddress".to_string(),
            key: Some(NodeKey::from_values(&[json!(address)])),
            properties: props(json!({ "address": address })),
        }
    }

    fn resolves_to(key: EdgeKey, last_seen: i64) -> EdgeUpsert {
        EdgeUpsert {
            key,
            source_type: "Host".to_string(),
            target_type: "IPAddress".to_string(),
            index_property: "last_seen".to_string(),
            policy: IndexPolicy::Monotonic,
            seed: props(json!({ "source": "dns", "last_seen": last_seen })),
            observed: props(json!({ "last_seen": last_seen })),
        }
    }

    #[tokio::test]
    async fn keyed_upsert_creates_then_merges() {
        let store = MemoryGraphStore::new();

        let first = store.upsert_node(host("x")).await.unwrap();
        assert!(first.created);

        let mut update = host("x");
        update.properties.insert("os".to_string(), json!("linux"));
        let second = store.upsert_node(update).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.changed_fields, vec!["os"]);

        let third = store.upsert_node(host("x")).await.unwrap();
        assert!(third.changed_fields.is_empty());

        let record = store.get_node_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(record.revision, 2);
        assert_eq!(record.properties.get("os"), Some(&json!("linux")));
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn unkeyed_upserts_always_create() {
        let store = MemoryGraphStore::new();
        let port = || NodeUpsert {
            node_type: "Port".to_string(),
            key: None,
            properties: props(json!({ "number": 8080 })),
        };
        let a = store.upsert_node(port()).await.unwrap();
        let b = store.upsert_node(port()).await.unwrap();
        assert!(a.created && b.created);
        assert_ne!(a.id, b.id);
        assert_eq!(store.node_count(), 2);
    }

    #[tokio::test]
    async fn get_node_by_key() {
        let store = MemoryGraphStore::new();
        let created = store.upsert_node(host("x")).await.unwrap();

        let key = NodeKey::from_values(&[json!("x")]);
        let found = store.get_node("Host", &key).await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert!(store.get_node("IPAddress", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edge_upsert_requires_endpoints() {
        let store = MemoryGraphStore::new();
        let h = store.upsert_node(host("x")).await.unwrap();
        let key = EdgeKey::new(h.id, NodeId::new(), "RESOLVES_TO");

        let err = store.upsert_edge(resolves_to(key, 100)).await.unwrap_err();
        assert!(matches!(err, GraphError::NotFound { kind: "Node", .. }));
        assert_eq!(store.edge_count(), 0);
    }

    #[tokio::test]
    async fn edge_upsert_checks_endpoint_types() {
        let store = MemoryGraphStore::new();
        let a = store.upsert_node(ip("10.0.0.1")).await.unwrap();
        let b = store.upsert_node(ip("10.0.0.2")).await.unwrap();
        let key = EdgeKey::new(a.id, b.id, "RESOLVES_TO");

        let err = store.upsert_edge(resolves_to(key, 100)).await.unwrap_err();
        match err {
            GraphError::EndpointType { expected, found, .. } => {
                assert_eq!(expected, "Host");
                assert_eq!(found, "IPAddress");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.edge_count(), 0);
    }

    #[tokio::test]
    async fn monotonic_edge_keeps_newest_value() {
        let store = MemoryGraphStore::new();
        let h = store.upsert_node(host("x")).await.unwrap();
        let i = store.upsert_node(ip("10.0.0.1")).await.unwrap();
        let key = EdgeKey::new(h.id, i.id, "RESOLVES_TO");

        let created = store.upsert_edge(resolves_to(key.clone(), 100)).await.unwrap();
        assert_eq!(created.change, EdgeChange::Created);

        let stale = store.upsert_edge(resolves_to(key.clone(), 50)).await.unwrap();
        assert_eq!(stale.id, created.id);
        assert_eq!(
            stale.change,
            EdgeChange::Stale {
                stored: json!(100),
                observed: json!(50)
            }
        );

        let edge = store.get_edge(&key).await.unwrap().unwrap();
        assert_eq!(edge.index_value(), Some(&json!(100)));
        assert_eq!(edge.properties.get("source"), Some(&json!("dns")));
        assert_eq!(edge.revision, 1);

        let newer = store.upsert_edge(resolves_to(key.clone(), 150)).await.unwrap();
        assert!(matches!(newer.change, EdgeChange::Updated { .. }));
        assert_eq!(store.edge_count(), 1);
    }

    #[tokio::test]
    async fn edges_of_filters_by_direction_and_label() {
        let store = MemoryGraphStore::new();
        let h = store.upsert_node(host("x")).await.unwrap();
        let i = store.upsert_node(ip("10.0.0.1")).await.unwrap();
        store
            .upsert_edge(resolves_to(EdgeKey::new(h.id, i.id, "RESOLVES_TO"), 1))
            .await
            .unwrap();

        let out = store.edges_of(h.id, Direction::Outgoing, None).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(store.edges_of(h.id, Direction::Incoming, None).await.unwrap().is_empty());
        assert_eq!(store.edges_of(i.id, Direction::Both, Some("RESOLVES_TO")).await.unwrap().len(), 1);
        assert!(store.edges_of(i.id, Direction::Both, Some("HOSTS")).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_of_one_key_yield_one_node() {
        let store = Arc::new(MemoryGraphStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.upsert_node(host("x")).await.unwrap() }));
        }

        let mut created = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.created {
                created += 1;
            }
            ids.push(outcome.id);
        }

        assert_eq!(created, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_from_snapshot() {
        let store = MemoryGraphStore::new();
        let h = store.upsert_node(host("x")).await.unwrap();
        let i = store.upsert_node(ip("10.0.0.1")).await.unwrap();
        store
            .upsert_edge(resolves_to(EdgeKey::new(h.id, i.id, "RESOLVES_TO"), 1))
            .await
            .unwrap();

        let snapshot = store.export().await.unwrap();
        let restored = MemoryGraphStore::from_snapshot(snapshot.clone());
        assert_eq!(restored.export().await.unwrap(), snapshot);
    }
}
