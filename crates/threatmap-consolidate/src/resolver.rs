//! Entity resolution: map an observation to its canonical node.
//!
//! Validation derives the natural key from the schema's ordered constraint
//! fields. The store's atomic upsert then resolves the key to the existing
//! node or creates it.

use std::sync::Arc;

use serde_json::Value;

use threatmap_core::merge;
use threatmap_core::types::{NodeId, NodeKey, NodeRecord, PropertyMap};
use threatmap_core::{NodeType, SchemaRegistry, ValidationError};
use threatmap_graph::{GraphError, GraphStore, NodeUpsert};

/// An entity observation that passed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEntity {
    pub node_type: String,
    /// `None` for constraint-free types.
    pub key: Option<NodeKey>,
    /// Normalized observed properties.
    pub properties: PropertyMap,
}

/// An entity bound to its canonical node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub id: NodeId,
    pub node_type: String,
    pub created: bool,
    pub changed_fields: Vec<String>,
}

#[derive(Clone)]
pub struct EntityResolver {
    schema: SchemaRegistry,
    store: Arc<dyn GraphStore>,
}

impl EntityResolver {
    pub fn new(schema: SchemaRegistry, store: Arc<dyn GraphStore>) -> Self {
        Self { schema, store }
    }

    /// Validate an observation against its node type and compute its key.
    pub fn validate(&self, node_type: &str, properties: PropertyMap) -> Result<ValidatedEntity, ValidationError> {
        let declared = self.declared(node_type)?;
        check_constraint_fields(declared, &properties)?;

        let properties = merge::normalize_properties(properties);
        let key = natural_key(declared, &properties)?;
        Ok(ValidatedEntity {
            node_type: node_type.to_string(),
            key,
            properties,
        })
    }

    /// Validate a natural-key reference. Constraint-free types cannot be
    /// referenced this way.
    pub fn validate_reference(&self, node_type: &str, key: PropertyMap) -> Result<ValidatedEntity, ValidationError> {
        let declared = self.declared(node_type)?;
        if !declared.is_keyed() {
            return Err(ValidationError::UnkeyedReference {
                node_type: node_type.to_string(),
            });
        }
        self.validate(node_type, key)
    }

    /// Resolve a validated entity: merge into the node with the same key, or
    /// create it.
    pub async fn upsert(&self, entity: ValidatedEntity) -> Result<ResolvedEntity, GraphError> {
        let node_type = entity.node_type.clone();
        let outcome = self
            .store
            .upsert_node(NodeUpsert {
                node_type: entity.node_type,
                key: entity.key,
                properties: entity.properties,
            })
            .await?;

        tracing::debug!(
            node_id = %outcome.id,
            node_type = %node_type,
            created = outcome.created,
            changed = outcome.changed_fields.len(),
            "Entity resolved"
        );
        Ok(ResolvedEntity {
            id: outcome.id,
            node_type,
            created: outcome.created,
            changed_fields: outcome.changed_fields,
        })
    }

    /// Validate and upsert in one step.
    pub async fn resolve(&self, node_type: &str, properties: PropertyMap) -> crate::error::Result<ResolvedEntity> {
        let entity = self.validate(node_type, properties)?;
        Ok(self.upsert(entity).await?)
    }

    /// Read a keyed node by natural key without creating it.
    pub async fn lookup(&self, node_type: &str, key: PropertyMap) -> crate::error::Result<Option<NodeRecord>> {
        let entity = self.validate_reference(node_type, key)?;
        match entity.key {
            Some(key) => Ok(self.store.get_node(node_type, &key).await?),
            None => Ok(None),
        }
    }

    fn declared(&self, node_type: &str) -> Result<&NodeType, ValidationError> {
        self.schema.node_type(node_type).ok_or_else(|| ValidationError::UnknownType {
            node_type: node_type.to_string(),
        })
    }
}

/// Presence checks on the raw observation, before nulls are dropped.
fn check_constraint_fields(declared: &NodeType, properties: &PropertyMap) -> Result<(), ValidationError> {
    for field in &declared.constraints {
        match properties.get(field) {
            None => {
                return Err(ValidationError::MissingConstraintField {
                    node_type: declared.name.clone(),
                    field: field.clone(),
                })
            }
            Some(Value::Null) => {
                return Err(ValidationError::EmptyConstraintValue {
                    node_type: declared.name.clone(),
                    field: field.clone(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// The ordered, normalized constraint values of an observation.
fn natural_key(declared: &NodeType, properties: &PropertyMap) -> Result<Option<NodeKey>, ValidationError> {
    if !declared.is_keyed() {
        return Ok(None);
    }

    let mut values = Vec::with_capacity(declared.constraints.len());
    for field in &declared.constraints {
        let value = properties.get(field).ok_or_else(|| ValidationError::EmptyConstraintValue {
            node_type: declared.name.clone(),
            field: field.clone(),
        })?;
        match value {
            Value::String(s) if s.is_empty() => {
                return Err(ValidationError::EmptyConstraintValue {
                    node_type: declared.name.clone(),
                    field: field.clone(),
                })
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(ValidationError::NonScalarConstraintValue {
                    node_type: declared.name.clone(),
                    field: field.clone(),
                })
            }
            _ => values.push(value),
        }
    }
    Ok(Some(NodeKey::from_values(values)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use threatmap_graph::MemoryGraphStore;

    use super::*;

    fn props(value: Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    fn resolver() -> EntityResolver {
        let schema = SchemaRegistry::load_value(json!({
            "schema_mapping": {
                "Host": { "constraints": "name" },
                "Port": { "constraints": ["ip_address", "number"] },
                "Banner": { "constraints": "" }
            }
        }))
        .unwrap();
        EntityResolver::new(schema, Arc::new(MemoryGraphStore::new()))
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = resolver().validate("Domain", props(json!({ "name": "x" }))).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownType {
                node_type: "Domain".to_string()
            }
        );
    }

    #[test]
    fn missing_constraint_field_is_rejected() {
        let err = resolver().validate("Port", props(json!({ "number": 22 }))).unwrap_err();
        assert!(matches!(err, ValidationError::MissingConstraintField { ref field, .. } if field == "ip_address"));
    }

    #[test]
    fn empty_and_null_constraint_values_are_rejected() {
        let r = resolver();
        assert!(matches!(
            r.validate("Host", props(json!({ "name": "   " }))),
            Err(ValidationError::EmptyConstraintValue { .. })
        ));
        assert!(matches!(
            r.validate("Host", props(json!({ "name": null }))),
            Err(ValidationError::EmptyConstraintValue { .. })
        ));
    }

    #[test]
    fn non_scalar_constraint_value_is_rejected() {
        assert!(matches!(
            resolver().validate("Host", props(json!({ "name": ["a", "b"] }))),
            Err(ValidationError::NonScalarConstraintValue { .. })
        ));
    }

    #[test]
    fn key_uses_normalized_values_in_declared_order() {
        let r = resolver();
        let a = r
            .validate("Port", props(json!({ "number": 8080.0, "ip_address": " 10.0.0.1 " })))
            .unwrap();
        let b = r
            .validate("Port", props(json!({ "ip_address": "10.0.0.1", "number": 8080 })))
            .unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.properties.get("ip_address"), Some(&json!("10.0.0.1")));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let r = resolver();
        let lower = r.validate("Host", props(json!({ "name": "web" }))).unwrap();
        let upper = r.validate("Host", props(json!({ "name": "WEB" }))).unwrap();
        assert_ne!(lower.key, upper.key);
    }

    #[test]
    fn constraint_free_types_have_no_key() {
        let entity = resolver().validate("Banner", props(json!({ "text": "ssh" }))).unwrap();
        assert!(entity.key.is_none());
    }

    #[test]
    fn constraint_free_types_cannot_be_referenced_by_key() {
        assert!(matches!(
            resolver().validate_reference("Banner", props(json!({ "text": "ssh" }))),
            Err(ValidationError::UnkeyedReference { .. })
        ));
    }

    #[tokio::test]
    async fn resolve_creates_then_finds() {
        let r = resolver();
        let first = r.resolve("Host", props(json!({ "name": "x" }))).await.unwrap();
        let second = r.resolve("Host", props(json!({ "name": " x", "os": "linux" }))).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.changed_fields, vec!["os"]);

        let found = r.lookup("Host", props(json!({ "name": "x" }))).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(r.lookup("Host", props(json!({ "name": "y" }))).await.unwrap().is_none());
    }
}
