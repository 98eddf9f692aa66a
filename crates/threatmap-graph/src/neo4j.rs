//! Neo4j-backed graph store.
//!
//! Every node carries the shared `ThreatMapNode` label plus its schema type,
//! and is identified by `id` under a uniqueness constraint. The full property
//! map is kept as canonical JSON in `_props` (the round-trip source of truth);
//! scalar properties are also set directly on the node so they can be
//! queried and indexed from Cypher.
//!
//! Creation goes through `MERGE`, which the uniqueness constraint makes
//! atomic. Merges into an existing record are compare-and-swap on
//! `_revision`, retried a bounded number of times.

use async_trait::async_trait;
use neo4rs::query;
use uuid::Uuid;

use threatmap_core::merge::{self, EdgeMerge};
use threatmap_core::types::{
    Direction, EdgeId, EdgeKey, EdgeRecord, GraphSnapshot, NodeId, NodeKey, NodeRecord, PropertyMap,
};
use threatmap_core::Schema;

use crate::client::{GraphClient, GraphError};
use crate::store::{EdgeChange, EdgeUpsert, EdgeUpsertOutcome, GraphStore, NodeUpsert, NodeUpsertOutcome};

/// Label shared by every node the store writes.
pub const NODE_LABEL: &str = "ThreatMapNode";

const CAS_ATTEMPTS: u32 = 8;

pub struct Neo4jGraphStore {
    client: GraphClient,
}

impl Neo4jGraphStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    /// Create the constraints and indexes the schema needs. Idempotent.
    pub async fn ensure_schema(&self, schema: &Schema) -> Result<(), GraphError> {
        let statements = schema_statements(schema);
        for statement in &statements {
            tracing::debug!(cypher = %statement, "Applying schema statement");
            self.client.run(query(statement)).await?;
        }
        tracing::info!(statements = statements.len(), "Neo4j schema ensured");
        Ok(())
    }

    async fn compare_and_set_node(
        &self,
        node: &NodeRecord,
        properties: &PropertyMap,
    ) -> Result<bool, GraphError> {
        let cypher = format!(
            "MATCH (n:{NODE_LABEL} {{id: $id}})
             CALL apoc.lock.nodes([n])
             WITH n WHERE n._revision = $revision
             SET n += apoc.convert.fromJsonMap($flat),
                 n._props = $props,
                 n._revision = $revision + 1
             RETURN n._revision AS revision"
        );
        let q = query(&cypher)
            .param("id", node.id.to_string())
            .param("revision", revision_param(node.revision))
            .param("flat", flat_json(properties)?)
            .param("props", serde_json::to_string(properties)?);

        Ok(self.client.query_one(q).await?.is_some())
    }

    async fn compare_and_set_edge(
        &self,
        edge: &EdgeRecord,
        properties: &PropertyMap,
    ) -> Result<bool, GraphError> {
        let cypher = format!(
            "MATCH ()-[r:{} {{id: $id}}]->()
             CALL apoc.lock.rels([r])
             WITH r WHERE r._revision = $revision
             SET r += apoc.convert.fromJsonMap($flat),
                 r._props = $props,
                 r._revision = $revision + 1
             RETURN r._revision AS revision",
            escape_identifier(&edge.label)
        );
        let q = query(&cypher)
            .param("id", edge.id.to_string())
            .param("revision", revision_param(edge.revision))
            .param("flat", flat_json(properties)?)
            .param("props", serde_json::to_string(properties)?);

        Ok(self.client.query_one(q).await?.is_some())
    }

    async fn edge_rows(&self, cypher: &str, q: neo4rs::Query) -> Result<Vec<EdgeRecord>, GraphError> {
        let rows = self.client.query_rows(q).await?;
        let mut edges = Vec::with_capacity(rows.len());
        for row in rows {
            edges.push(row_to_edge(&row).map_err(|e| {
                GraphError::Serialization(format!("Failed to read edge from `{}`: {e}", first_line(cypher)))
            })?);
        }
        Ok(edges)
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn get_node(&self, node_type: &str, key: &NodeKey) -> Result<Option<NodeRecord>, GraphError> {
        let record = self.get_node_by_id(NodeId::for_key(node_type, key)).await?;
        Ok(record.filter(|n| n.node_type == node_type))
    }

    async fn get_node_by_id(&self, id: NodeId) -> Result<Option<NodeRecord>, GraphError> {
        let cypher = format!("MATCH (n:{NODE_LABEL} {{id: $id}}) RETURN n");
        let q = query(&cypher).param("id", id.to_string());

        match self.client.query_one(q).await? {
            Some(row) => {
                let node: neo4rs::Node = row.get("n").map_err(|e| {
                    GraphError::Serialization(format!("Failed to deserialize node: {e}"))
                })?;
                Ok(Some(neo4j_node_to_record(&node)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_node(&self, upsert: NodeUpsert) -> Result<NodeUpsertOutcome, GraphError> {
        let id = match &upsert.key {
            Some(key) => NodeId::for_key(&upsert.node_type, key),
            None => NodeId::new(),
        };

        let cypher = format!(
            "MERGE (n:{NODE_LABEL} {{id: $id}})
             ON CREATE SET n:{label},
               n += apoc.convert.fromJsonMap($flat),
               n._type = $node_type,
               n._key = $key,
               n._props = $props,
               n._revision = 1,
               n._new = true
             WITH n, coalesce(n._new, false) AS created
             REMOVE n._new
             RETURN n, created",
            label = escape_identifier(&upsert.node_type)
        );
        let q = query(&cypher)
            .param("id", id.to_string())
            .param("flat", flat_json(&upsert.properties)?)
            .param("node_type", upsert.node_type.clone())
            .param("key", upsert.key.as_ref().map(|k| k.as_str().to_string()).unwrap_or_default())
            .param("props", serde_json::to_string(&upsert.properties)?);

        let row = self.client.query_one(q).await?.ok_or_else(|| GraphError::NotFound {
            kind: "Node",
            id: id.to_string(),
        })?;
        let created: bool = row.get("created").unwrap_or(false);
        if created {
            tracing::debug!(node_id = %id, node_type = %upsert.node_type, "Node created");
            return Ok(NodeUpsertOutcome {
                id,
                created: true,
                changed_fields: Vec::new(),
            });
        }

        let node: neo4rs::Node = row
            .get("n")
            .map_err(|e| GraphError::Serialization(format!("Failed to deserialize node: {e}")))?;
        let mut current = neo4j_node_to_record(&node)?;

        for attempt in 1..=CAS_ATTEMPTS {
            let mut properties = current.properties.clone();
            let changed_fields = merge::merge_node_properties(&mut properties, &upsert.properties);
            if changed_fields.is_empty() {
                return Ok(NodeUpsertOutcome {
                    id,
                    created: false,
                    changed_fields,
                });
            }
            if self.compare_and_set_node(&current, &properties).await? {
                return Ok(NodeUpsertOutcome {
                    id,
                    created: false,
                    changed_fields,
                });
            }

            tracing::debug!(node_id = %id, attempt, "Node revision moved, retrying merge");
            current = self
                .get_node_by_id(id)
                .await?
                .ok_or_else(|| GraphError::NotFound {
                    kind: "Node",
                    id: id.to_string(),
                })?;
        }

        Err(GraphError::Contention {
            id: id.to_string(),
            attempts: CAS_ATTEMPTS,
        })
    }

    async fn get_edge(&self, key: &EdgeKey) -> Result<Option<EdgeRecord>, GraphError> {
        let cypher = format!(
            "MATCH (a:{NODE_LABEL} {{id: $source_id}})-[r:{} {{id: $id}}]->(b:{NODE_LABEL} {{id: $target_id}})
             RETURN r, a.id AS source_id, b.id AS target_id, type(r) AS label",
            escape_identifier(&key.label)
        );
        let q = query(&cypher)
            .param("id", key.edge_id().to_string())
            .param("source_id", key.source_id.to_string())
            .param("target_id", key.target_id.to_string());

        Ok(self.edge_rows(&cypher, q).await?.into_iter().next())
    }

    async fn upsert_edge(&self, upsert: EdgeUpsert) -> Result<EdgeUpsertOutcome, GraphError> {
        let id = upsert.key.edge_id();
        let cypher = format!(
            "MATCH (a:{NODE_LABEL}:{source_label} {{id: $source_id}})
             MATCH (b:{NODE_LABEL}:{target_label} {{id: $target_id}})
             MERGE (a)-[r:{label} {{id: $id}}]->(b)
             ON CREATE SET
               r += apoc.convert.fromJsonMap($flat),
               r._index_property = $index_property,
               r._props = $props,
               r._revision = 1,
               r._new = true
             WITH a, b, r, coalesce(r._new, false) AS created
             REMOVE r._new
             RETURN r, a.id AS source_id, b.id AS target_id, type(r) AS label, created",
            label = escape_identifier(&upsert.key.label),
            source_label = escape_identifier(&upsert.source_type),
            target_label = escape_identifier(&upsert.target_type),
        );
        let q = query(&cypher)
            .param("id", id.to_string())
            .param("source_id", upsert.key.source_id.to_string())
            .param("target_id", upsert.key.target_id.to_string())
            .param("flat", flat_json(&upsert.seed)?)
            .param("index_property", upsert.index_property.clone())
            .param("props", serde_json::to_string(&upsert.seed)?);

        let Some(row) = self.client.query_one(q).await? else {
            // One of the MATCH clauses found nothing: an endpoint is missing
            // or carries another type label.
            return Err(GraphError::NotFound {
                kind: "Endpoint",
                id: format!(
                    "{}:{} -> {}:{}",
                    upsert.source_type, upsert.key.source_id, upsert.target_type, upsert.key.target_id
                ),
            });
        };
        if row.get::<bool>("created").unwrap_or(false) {
            tracing::debug!(edge_id = %id, label = %upsert.key.label, "Edge created");
            return Ok(EdgeUpsertOutcome {
                id,
                change: EdgeChange::Created,
            });
        }

        let mut current = row_to_edge(&row)?;
        for attempt in 1..=CAS_ATTEMPTS {
            let change = match merge::merge_edge_properties(
                &current.properties,
                &current.index_property,
                upsert.policy,
                &upsert.observed,
            ) {
                EdgeMerge::Unchanged => EdgeChange::Unchanged,
                EdgeMerge::Stale { stored, observed } => EdgeChange::Stale { stored, observed },
                EdgeMerge::Updated {
                    properties,
                    changed_fields,
                } => {
                    if !self.compare_and_set_edge(&current, &properties).await? {
                        tracing::debug!(edge_id = %id, attempt, "Edge revision moved, retrying merge");
                        current = self.get_edge(&upsert.key).await?.ok_or_else(|| GraphError::NotFound {
                            kind: "Edge",
                            id: id.to_string(),
                        })?;
                        continue;
                    }
                    EdgeChange::Updated { changed_fields }
                }
            };
            return Ok(EdgeUpsertOutcome { id, change });
        }

        Err(GraphError::Contention {
            id: id.to_string(),
            attempts: CAS_ATTEMPTS,
        })
    }

    async fn edges_of(
        &self,
        node: NodeId,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Vec<EdgeRecord>, GraphError> {
        let pattern = match direction {
            Direction::Outgoing => "(n)-[r]->(m)",
            Direction::Incoming => "(n)<-[r]-(m)",
            Direction::Both => "(n)-[r]-(m)",
        };
        let cypher = format!(
            "MATCH (n:{NODE_LABEL} {{id: $id}})
             MATCH {pattern}
             WHERE m:{NODE_LABEL} AND ($label IS NULL OR type(r) = $label)
             RETURN r, startNode(r).id AS source_id, endNode(r).id AS target_id, type(r) AS label"
        );
        let q = query(&cypher)
            .param("id", node.to_string())
            .param("label", label.map(str::to_string));

        let mut edges = self.edge_rows(&cypher, q).await?;
        edges.sort_by(|a, b| a.key().cmp(&b.key()));
        edges.dedup_by(|a, b| a.id == b.id);
        Ok(edges)
    }

    async fn export(&self) -> Result<GraphSnapshot, GraphError> {
        let node_cypher = format!("MATCH (n:{NODE_LABEL}) RETURN n");
        let rows = self.client.query_rows(query(&node_cypher)).await?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let node: neo4rs::Node = row
                .get("n")
                .map_err(|e| GraphError::Serialization(format!("Failed to deserialize node: {e}")))?;
            nodes.push(neo4j_node_to_record(&node)?);
        }

        let edge_cypher = format!(
            "MATCH (a:{NODE_LABEL})-[r]->(b:{NODE_LABEL})
             RETURN r, a.id AS source_id, b.id AS target_id, type(r) AS label"
        );
        let edges = self.edge_rows(&edge_cypher, query(&edge_cypher)).await?;

        tracing::debug!(nodes = nodes.len(), edges = edges.len(), "Graph exported");
        Ok(GraphSnapshot::new(nodes, edges))
    }
}

// ── Schema DDL ───────────────────────────────────────────────────

/// Cypher statements creating the constraints and indexes for `schema`.
///
/// - uniqueness of `id` across all ThreatMap nodes
/// - uniqueness of each keyed type's constraint fields
/// - uniqueness of `id` per relationship label
/// - an index on each relationship's index property
pub fn schema_statements(schema: &Schema) -> Vec<String> {
    let mut statements = vec![format!(
        "CREATE CONSTRAINT threatmap_node_id IF NOT EXISTS FOR (n:{NODE_LABEL}) REQUIRE n.id IS UNIQUE"
    )];

    for node_type in schema.node_types() {
        if !node_type.is_keyed() {
            continue;
        }
        let fields: Vec<String> = node_type
            .constraints
            .iter()
            .map(|f| format!("n.{}", escape_identifier(f)))
            .collect();
        statements.push(format!(
            "CREATE CONSTRAINT {} IF NOT EXISTS FOR (n:{}) REQUIRE ({}) IS UNIQUE",
            constraint_name(&["threatmap_key", &node_type.name]),
            escape_identifier(&node_type.name),
            fields.join(", ")
        ));
    }

    let mut labels_seen = std::collections::BTreeSet::new();
    for rel in schema.relationships() {
        if labels_seen.insert(rel.label.clone()) {
            statements.push(format!(
                "CREATE CONSTRAINT {} IF NOT EXISTS FOR ()-[r:{}]-() REQUIRE r.id IS UNIQUE",
                constraint_name(&["threatmap_rel_id", &rel.label]),
                escape_identifier(&rel.label)
            ));
        }
    }

    let mut indexes_seen = std::collections::BTreeSet::new();
    for rel in schema.relationships() {
        if indexes_seen.insert((rel.label.clone(), rel.index_property.clone())) {
            statements.push(format!(
                "CREATE INDEX {} IF NOT EXISTS FOR ()-[r:{}]-() ON (r.{})",
                constraint_name(&["threatmap_rel_idx", &rel.label, &rel.index_property]),
                escape_identifier(&rel.label),
                escape_identifier(&rel.index_property)
            ));
        }
    }

    statements
}

// ── Helpers ──────────────────────────────────────────────────────

/// Quote a label, relationship type, or property name for Cypher.
fn escape_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn constraint_name(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| {
            p.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// JSON of the properties Neo4j can hold directly: scalars and arrays of
/// scalars. Names starting with `_` are reserved for the store.
fn flat_json(properties: &PropertyMap) -> Result<String, GraphError> {
    let flat: PropertyMap = properties
        .iter()
        .filter(|(name, _)| !name.starts_with('_') && name.as_str() != "id")
        .filter(|(_, value)| match value {
            serde_json::Value::Array(items) => items.iter().all(|i| !i.is_object() && !i.is_array()),
            serde_json::Value::Object(_) | serde_json::Value::Null => false,
            _ => true,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(serde_json::to_string(&flat)?)
}

fn revision_param(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

fn parse_uuid(raw: &str) -> Result<Uuid, GraphError> {
    Uuid::parse_str(raw).map_err(|e| GraphError::Serialization(format!("Invalid id {raw}: {e}")))
}

fn parse_props(raw: &str) -> Result<PropertyMap, GraphError> {
    if raw.is_empty() {
        return Ok(PropertyMap::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Convert a neo4rs::Node written by this store into a NodeRecord.
fn neo4j_node_to_record(node: &neo4rs::Node) -> Result<NodeRecord, GraphError> {
    let id: String = node
        .get("id")
        .map_err(|e| GraphError::Serialization(format!("Node without id: {e}")))?;
    let node_type: String = node.get("_type").unwrap_or_default();
    let key: String = node.get("_key").unwrap_or_default();
    let props: String = node.get("_props").unwrap_or_default();
    let revision: i64 = node.get("_revision").unwrap_or(1);

    Ok(NodeRecord {
        id: NodeId(parse_uuid(&id)?),
        node_type,
        key: (!key.is_empty()).then(|| NodeKey::from_encoded(key)),
        properties: parse_props(&props)?,
        revision: u64::try_from(revision).unwrap_or(1),
    })
}

/// Convert a row of `r, source_id, target_id, label` into an EdgeRecord.
fn row_to_edge(row: &neo4rs::Row) -> Result<EdgeRecord, GraphError> {
    let rel: neo4rs::Relation = row
        .get("r")
        .map_err(|e| GraphError::Serialization(format!("Failed to get relation: {e}")))?;
    let source_id: String = row
        .get("source_id")
        .map_err(|e| GraphError::Serialization(format!("Edge without source: {e}")))?;
    let target_id: String = row
        .get("target_id")
        .map_err(|e| GraphError::Serialization(format!("Edge without target: {e}")))?;
    let label: String = row.get("label").unwrap_or_default();

    let id: String = rel
        .get("id")
        .map_err(|e| GraphError::Serialization(format!("Edge without id: {e}")))?;
    let index_property: String = rel.get("_index_property").unwrap_or_default();
    let props: String = rel.get("_props").unwrap_or_default();
    let revision: i64 = rel.get("_revision").unwrap_or(1);

    Ok(EdgeRecord {
        id: EdgeId(parse_uuid(&id)?),
        source_id: NodeId(parse_uuid(&source_id)?),
        target_id: NodeId(parse_uuid(&target_id)?),
        label,
        index_property,
        properties: parse_props(&props)?,
        revision: u64::try_from(revision).unwrap_or(1),
    })
}

fn first_line(cypher: &str) -> &str {
    cypher.lines().next().unwrap_or(cypher).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use threatmap_core::SchemaRegistry;

    #[test]
    fn escapes_backticks_in_identifiers() {
        assert_eq!(escape_identifier("Host"), "`Host`");
        assert_eq!(escape_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn flat_json_keeps_only_neo4j_storable_values() {
        let props = json!({
            "name": "x",
            "ports": [80, 443],
            "banner": { "raw": "ssh" },
            "_internal": 1,
            "id": "spoofed"
        });
        let flat: serde_json::Value =
            serde_json::from_str(&flat_json(props.as_object().unwrap()).unwrap()).unwrap();
        assert_eq!(flat, json!({ "name": "x", "ports": [80, 443] }));
    }

    #[test]
    fn schema_statements_cover_keys_and_relationship_indexes() {
        let schema = SchemaRegistry::load_value(json!({
            "schema_mapping": {
                "Host": {
                    "constraints": "name",
                    "relationships": {
                        "IPAddress": { "type": "RESOLVES_TO", "index_prop": "last_seen" }
                    }
                },
                "IPAddress": { "constraints": ["address"] },
                "Port": { "constraints": ["number", "ip_address"] },
                "Banner": {}
            }
        }))
        .unwrap();

        let statements = schema_statements(&schema);
        assert!(statements[0].contains("threatmap_node_id"));
        assert!(statements
            .iter()
            .any(|s| s.contains("FOR (n:`Host`) REQUIRE (n.`name`) IS UNIQUE")));
        assert!(statements
            .iter()
            .any(|s| s.contains("REQUIRE (n.`number`, n.`ip_address`) IS UNIQUE")));
        assert!(!statements.iter().any(|s| s.contains("`Banner`")));
        assert!(statements
            .iter()
            .any(|s| s.contains("threatmap_rel_idx_resolves_to_last_seen") && s.contains("ON (r.`last_seen`)")));
        assert_eq!(statements.len(), 6);
    }
}
