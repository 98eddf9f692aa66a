use serde::Serialize;
use thiserror::Error;

/// Top-level error type for ThreatMap startup and configuration.
#[derive(Error, Debug)]
pub enum ThreatMapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ThreatMapError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// A malformed or internally inconsistent schema document.
///
/// Always fatal: the schema is loaded once at startup and no partial schema
/// is ever put into service.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse schema document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Node type name must be a non-empty string")]
    EmptyNodeTypeName,

    #[error("Node type {node_type} declares an empty constraint field name")]
    EmptyConstraintField { node_type: String },

    #[error("Node type {node_type} declares constraint field {field} more than once")]
    DuplicateConstraintField { node_type: String, field: String },

    #[error("Relationship from {source_type} references unknown node type {target_type}")]
    UnknownNodeType {
        source_type: String,
        target_type: String,
    },

    #[error("Relationship {source_type} -> {target_type} has an empty type label")]
    EmptyRelationshipLabel {
        source_type: String,
        target_type: String,
    },

    #[error("Relationship {label} ({source_type} -> {target_type}) has an empty index property")]
    EmptyIndexProperty {
        label: String,
        source_type: String,
        target_type: String,
    },

    #[error("Relationship {label} default property {property} must be a string, number, or boolean")]
    NonScalarDefault { label: String, property: String },
}

/// A per-observation failure. Recoverable: only the offending observation is
/// rejected, the rest of its batch proceeds.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Unknown node type: {node_type}")]
    UnknownType { node_type: String },

    #[error("Observation of {node_type} is missing constraint field {field}")]
    MissingConstraintField { node_type: String, field: String },

    #[error("Observation of {node_type} has an empty value for constraint field {field}")]
    EmptyConstraintValue { node_type: String, field: String },

    #[error("Observation of {node_type} has a non-scalar value for constraint field {field}")]
    NonScalarConstraintValue { node_type: String, field: String },

    #[error("Node type {node_type} has no constraint fields and cannot be referenced by natural key")]
    UnkeyedReference { node_type: String },

    #[error("Relationship {label} is not declared from {source_type} to {target_type}")]
    TypeMismatch {
        label: String,
        source_type: String,
        target_type: String,
    },
}
