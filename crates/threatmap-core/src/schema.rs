//! Declarative schema: node types with their natural keys and the
//! relationships allowed between them.
//!
//! The schema is an external JSON document, loaded and validated once at
//! startup. After loading it is immutable and shared read-only through
//! [`SchemaRegistry`], which is a cheap `Arc` clone.
//!
//! ```json
//! { "schema_mapping": {
//!     "Host": {
//!       "constraints": "name",
//!       "relationships": {
//!         "IPAddress": { "type": "RESOLVES_TO", "index_prop": "last_seen", "default_props": {} }
//!       }
//!     },
//!     "IPAddress": { "constraints": ["address"], "relationships": {} }
//! } }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::types::PropertyMap;

// ── Document ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    schema_mapping: BTreeMap<String, NodeTypeSpec>,
}

#[derive(Debug, Deserialize)]
struct NodeTypeSpec {
    #[serde(default)]
    constraints: Option<ConstraintSpec>,
    #[serde(default)]
    relationships: BTreeMap<String, RelationshipSpec>,
}

/// `"name"`, `["number", "ip_address"]`, `""` or `[]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConstraintSpec {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RelationshipSpec {
    #[serde(rename = "type")]
    label: String,
    index_prop: String,
    #[serde(default)]
    default_props: PropertyMap,
    #[serde(default)]
    index_policy: Option<IndexPolicy>,
}

// ── Loaded schema ─────────────────────────────────────────────────

/// How an edge's index property arbitrates between stored and incoming values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexPolicy {
    /// Temporal value: an update applies only if it is not older than the
    /// stored value.
    Monotonic,
    /// Categorical value: last writer wins.
    Overwrite,
}

impl IndexPolicy {
    /// Infer the policy from the property name when the schema does not
    /// declare one. Recency-named properties are monotonic.
    pub fn infer(property: &str) -> Self {
        let name = property.to_ascii_lowercase();
        let temporal = matches!(name.as_str(), "time" | "timestamp" | "seen")
            || name.ends_with("_seen")
            || name.ends_with("_at")
            || name.ends_with("_time")
            || name.ends_with("_ts")
            || name.ends_with("timestamp");
        if temporal {
            Self::Monotonic
        } else {
            Self::Overwrite
        }
    }
}

/// A declared node type.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeType {
    pub name: String,
    /// Ordered natural-key fields. Empty means every observation is a
    /// distinct node.
    pub constraints: Vec<String>,
}

impl NodeType {
    pub fn is_keyed(&self) -> bool {
        !self.constraints.is_empty()
    }
}

/// A declared relationship between two node types.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RelationshipType {
    pub label: String,
    pub source_type: String,
    pub target_type: String,
    pub index_property: String,
    pub default_properties: PropertyMap,
    pub index_policy: IndexPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RelationshipSelector {
    label: String,
    source_type: String,
    target_type: String,
}

/// The validated, immutable schema.
#[derive(Debug)]
pub struct Schema {
    node_types: HashMap<String, NodeType>,
    relationships: HashMap<RelationshipSelector, RelationshipType>,
}

impl Schema {
    pub fn node_type(&self, name: &str) -> Option<&NodeType> {
        self.node_types.get(name)
    }

    /// The relationship declared for `label` between the two endpoint types.
    pub fn relationship(
        &self,
        label: &str,
        source_type: &str,
        target_type: &str,
    ) -> Option<&RelationshipType> {
        self.relationships.get(&RelationshipSelector {
            label: label.to_string(),
            source_type: source_type.to_string(),
            target_type: target_type.to_string(),
        })
    }

    /// All node types, ordered by name.
    pub fn node_types(&self) -> Vec<&NodeType> {
        let mut types: Vec<&NodeType> = self.node_types.values().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    /// All relationships, ordered by (source, target, label).
    pub fn relationships(&self) -> Vec<&RelationshipType> {
        let mut rels: Vec<&RelationshipType> = self.relationships.values().collect();
        rels.sort_by(|a, b| {
            (&a.source_type, &a.target_type, &a.label).cmp(&(&b.source_type, &b.target_type, &b.label))
        });
        rels
    }

    fn from_document(doc: SchemaDocument) -> Result<Self, SchemaError> {
        let mut node_types = HashMap::with_capacity(doc.schema_mapping.len());

        for (name, spec) in &doc.schema_mapping {
            if name.trim().is_empty() {
                return Err(SchemaError::EmptyNodeTypeName);
            }
            let constraints = match &spec.constraints {
                None => Vec::new(),
                // A bare empty string means "no constraint".
                Some(ConstraintSpec::Single(field)) if field.is_empty() => Vec::new(),
                Some(ConstraintSpec::Single(field)) => vec![field.clone()],
                Some(ConstraintSpec::Many(fields)) => fields.clone(),
            };

            let mut seen = HashSet::new();
            for field in &constraints {
                if field.trim().is_empty() {
                    return Err(SchemaError::EmptyConstraintField {
                        node_type: name.clone(),
                    });
                }
                if !seen.insert(field.as_str()) {
                    return Err(SchemaError::DuplicateConstraintField {
                        node_type: name.clone(),
                        field: field.clone(),
                    });
                }
            }

            node_types.insert(
                name.clone(),
                NodeType {
                    name: name.clone(),
                    constraints,
                },
            );
        }

        let mut relationships = HashMap::new();
        for (source_type, spec) in &doc.schema_mapping {
            for (target_type, rel) in &spec.relationships {
                if !node_types.contains_key(target_type) {
                    return Err(SchemaError::UnknownNodeType {
                        source_type: source_type.clone(),
                        target_type: target_type.clone(),
                    });
                }
                if rel.label.trim().is_empty() {
                    return Err(SchemaError::EmptyRelationshipLabel {
                        source_type: source_type.clone(),
                        target_type: target_type.clone(),
                    });
                }
                if rel.index_prop.trim().is_empty() {
                    return Err(SchemaError::EmptyIndexProperty {
                        label: rel.label.clone(),
                        source_type: source_type.clone(),
                        target_type: target_type.clone(),
                    });
                }
                for (property, value) in &rel.default_props {
                    if !is_scalar(value) {
                        return Err(SchemaError::NonScalarDefault {
                            label: rel.label.clone(),
                            property: property.clone(),
                        });
                    }
                }

                let relationship = RelationshipType {
                    label: rel.label.clone(),
                    source_type: source_type.clone(),
                    target_type: target_type.clone(),
                    index_property: rel.index_prop.clone(),
                    default_properties: rel.default_props.clone(),
                    index_policy: rel
                        .index_policy
                        .unwrap_or_else(|| IndexPolicy::infer(&rel.index_prop)),
                };
                relationships.insert(
                    RelationshipSelector {
                        label: relationship.label.clone(),
                        source_type: source_type.clone(),
                        target_type: target_type.clone(),
                    },
                    relationship,
                );
            }
        }

        Ok(Self {
            node_types,
            relationships,
        })
    }
}

fn is_scalar(value: &serde_json::Value) -> bool {
    matches!(
        value,
        serde_json::Value::String(_) | serde_json::Value::Number(_) | serde_json::Value::Bool(_)
    )
}

// ── Registry ──────────────────────────────────────────────────────

/// Shared handle to the loaded schema. Clone is cheap (inner Arc).
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schema: Arc<Schema>,
}

impl SchemaRegistry {
    /// Load and validate a schema from a JSON string.
    pub fn load_str(source: &str) -> Result<Self, SchemaError> {
        let doc: SchemaDocument = serde_json::from_str(source)?;
        Self::from_document(doc)
    }

    /// Load and validate a schema from an already-parsed JSON value.
    pub fn load_value(source: serde_json::Value) -> Result<Self, SchemaError> {
        let doc: SchemaDocument = serde_json::from_value(source)?;
        Self::from_document(doc)
    }

    /// Load and validate a schema from a JSON file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_str(&source)
    }

    fn from_document(doc: SchemaDocument) -> Result<Self, SchemaError> {
        let schema = Schema::from_document(doc)?;
        tracing::info!(
            node_types = schema.node_types.len(),
            relationships = schema.relationships.len(),
            "Schema loaded"
        );
        Ok(Self {
            schema: Arc::new(schema),
        })
    }
}

impl Deref for SchemaRegistry {
    type Target = Schema;

    fn deref(&self) -> &Schema {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recon_schema() -> serde_json::Value {
        json!({
            "schema_mapping": {
                "Host": {
                    "constraints": "name",
                    "relationships": {
                        "IPAddress": {
                            "type": "RESOLVES_TO",
                            "index_prop": "last_seen",
                            "default_props": { "source": "dns" }
                        }
                    }
                },
                "IPAddress": {
                    "constraints": ["address"],
                    "relationships": {
                        "Port": { "type": "HOSTS", "index_prop": "status", "default_props": { "status": "open" } }
                    }
                },
                "Port": { "constraints": "", "relationships": {} }
            }
        })
    }

    #[test]
    fn loads_node_types_and_relationships() {
        let schema = SchemaRegistry::load_value(recon_schema()).unwrap();

        assert_eq!(schema.node_type("Host").unwrap().constraints, vec!["name"]);
        assert!(!schema.node_type("Port").unwrap().is_keyed());
        assert!(schema.node_type("Service").is_none());

        let rel = schema.relationship("RESOLVES_TO", "Host", "IPAddress").unwrap();
        assert_eq!(rel.index_property, "last_seen");
        assert_eq!(rel.index_policy, IndexPolicy::Monotonic);
        assert_eq!(rel.default_properties.get("source"), Some(&json!("dns")));

        let hosts = schema.relationship("HOSTS", "IPAddress", "Port").unwrap();
        assert_eq!(hosts.index_policy, IndexPolicy::Overwrite);

        assert!(schema.relationship("RESOLVES_TO", "IPAddress", "Host").is_none());
        assert_eq!(schema.relationships().len(), 2);
        assert_eq!(schema.node_types().len(), 3);
    }

    #[test]
    fn rejects_unknown_target_type() {
        let doc = json!({
            "schema_mapping": {
                "Host": {
                    "constraints": "name",
                    "relationships": { "Domain": { "type": "PART_OF", "index_prop": "status" } }
                }
            }
        });
        let err = SchemaRegistry::load_value(doc).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownNodeType { ref target_type, .. } if target_type == "Domain"));
    }

    #[test]
    fn rejects_duplicate_constraint_fields() {
        let doc = json!({
            "schema_mapping": { "Port": { "constraints": ["number", "number"] } }
        });
        let err = SchemaRegistry::load_value(doc).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateConstraintField { ref field, .. } if field == "number"));
    }

    #[test]
    fn rejects_empty_constraint_field_in_list() {
        let doc = json!({ "schema_mapping": { "Port": { "constraints": ["number", ""] } } });
        assert!(matches!(
            SchemaRegistry::load_value(doc),
            Err(SchemaError::EmptyConstraintField { .. })
        ));
    }

    #[test]
    fn rejects_non_scalar_defaults() {
        let doc = json!({
            "schema_mapping": {
                "Host": {
                    "constraints": "name",
                    "relationships": {
                        "Host": { "type": "TRUSTS", "index_prop": "status", "default_props": { "tags": ["a"] } }
                    }
                }
            }
        });
        assert!(matches!(
            SchemaRegistry::load_value(doc),
            Err(SchemaError::NonScalarDefault { ref property, .. }) if property == "tags"
        ));
    }

    #[test]
    fn rejects_null_default() {
        let doc = json!({
            "schema_mapping": {
                "Host": {
                    "relationships": {
                        "Host": { "type": "TRUSTS", "index_prop": "status", "default_props": { "note": null } }
                    }
                }
            }
        });
        assert!(SchemaRegistry::load_value(doc).is_err());
    }

    #[test]
    fn rejects_empty_index_property() {
        let doc = json!({
            "schema_mapping": {
                "Host": { "relationships": { "Host": { "type": "TRUSTS", "index_prop": " " } } }
            }
        });
        assert!(matches!(
            SchemaRegistry::load_value(doc),
            Err(SchemaError::EmptyIndexProperty { .. })
        ));
    }

    #[test]
    fn explicit_policy_overrides_name_heuristic() {
        let doc = json!({
            "schema_mapping": {
                "Host": {
                    "relationships": {
                        "Host": { "type": "TRUSTS", "index_prop": "last_seen", "index_policy": "overwrite" }
                    }
                }
            }
        });
        let schema = SchemaRegistry::load_value(doc).unwrap();
        let rel = schema.relationship("TRUSTS", "Host", "Host").unwrap();
        assert_eq!(rel.index_policy, IndexPolicy::Overwrite);
    }

    #[test]
    fn infers_policy_from_property_name() {
        assert_eq!(IndexPolicy::infer("last_seen"), IndexPolicy::Monotonic);
        assert_eq!(IndexPolicy::infer("observed_at"), IndexPolicy::Monotonic);
        assert_eq!(IndexPolicy::infer("Timestamp"), IndexPolicy::Monotonic);
        assert_eq!(IndexPolicy::infer("scan_time"), IndexPolicy::Monotonic);
        assert_eq!(IndexPolicy::infer("status"), IndexPolicy::Overwrite);
        assert_eq!(IndexPolicy::infer("state"), IndexPolicy::Overwrite);
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        assert!(matches!(
            SchemaRegistry::load_str("{ not json"),
            Err(SchemaError::Parse(_))
        ));
        assert!(matches!(
            SchemaRegistry::load_str(r#"{"nodes": {}}"#),
            Err(SchemaError::Parse(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threat_map.json");
        std::fs::write(&path, recon_schema().to_string()).unwrap();

        let schema = SchemaRegistry::load_file(&path).unwrap();
        assert!(schema.node_type("IPAddress").is_some());

        let missing = SchemaRegistry::load_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(SchemaError::Io { .. })));
    }
}
