//! Relationship linking: create or merge the edge between two resolved
//! nodes for a declared relationship type.

use std::sync::Arc;

use threatmap_core::merge;
use threatmap_core::types::{EdgeKey, NodeId, PropertyMap};
use threatmap_core::{RelationshipType, SchemaRegistry, ValidationError};
use threatmap_graph::{EdgeUpsert, EdgeUpsertOutcome, GraphError, GraphStore};

/// A resolved endpoint of a relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: NodeId,
    pub node_type: String,
}

impl Endpoint {
    pub fn new(id: NodeId, node_type: impl Into<String>) -> Self {
        Self {
            id,
            node_type: node_type.into(),
        }
    }
}

#[derive(Clone)]
pub struct RelationshipLinker {
    schema: SchemaRegistry,
    store: Arc<dyn GraphStore>,
}

impl RelationshipLinker {
    pub fn new(schema: SchemaRegistry, store: Arc<dyn GraphStore>) -> Self {
        Self { schema, store }
    }

    /// The declaration for `label` between the two endpoint types.
    pub fn relationship(
        &self,
        label: &str,
        source_type: &str,
        target_type: &str,
    ) -> Result<&RelationshipType, ValidationError> {
        self.schema
            .relationship(label, source_type, target_type)
            .ok_or_else(|| ValidationError::TypeMismatch {
                label: label.to_string(),
                source_type: source_type.to_string(),
                target_type: target_type.to_string(),
            })
    }

    /// Build the edge write for an observation between resolved endpoints.
    pub fn plan(
        &self,
        label: &str,
        source: &Endpoint,
        target: &Endpoint,
        properties: PropertyMap,
    ) -> Result<EdgeUpsert, ValidationError> {
        let rel = self.relationship(label, &source.node_type, &target.node_type)?;

        let mut observed = merge::normalize_properties(properties);
        let seed = merge::seed_edge_properties(&rel.default_properties, &observed);
        // The index value always takes part in the merge, even when it only
        // comes from the defaults.
        if let Some(index_value) = seed.get(&rel.index_property) {
            observed
                .entry(rel.index_property.clone())
                .or_insert_with(|| index_value.clone());
        }

        Ok(EdgeUpsert {
            key: EdgeKey::new(source.id, target.id, rel.label.clone()),
            source_type: source.node_type.clone(),
            target_type: target.node_type.clone(),
            index_property: rel.index_property.clone(),
            policy: rel.index_policy,
            seed,
            observed,
        })
    }

    /// Apply a planned edge write.
    pub async fn commit(&self, upsert: EdgeUpsert) -> Result<EdgeUpsertOutcome, GraphError> {
        let label = upsert.key.label.clone();
        let outcome = self.store.upsert_edge(upsert).await?;
        tracing::debug!(edge_id = %outcome.id, label = %label, change = ?outcome.change, "Edge linked");
        Ok(outcome)
    }

    /// Plan and commit in one step.
    pub async fn link(
        &self,
        label: &str,
        source: &Endpoint,
        target: &Endpoint,
        properties: PropertyMap,
    ) -> crate::error::Result<EdgeUpsertOutcome> {
        let upsert = self.plan(label, source, target, properties)?;
        Ok(self.commit(upsert).await?)
    }
}
