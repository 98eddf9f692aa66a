//! Error types for the threatmap-consolidate crate.

use thiserror::Error;

use threatmap_core::{SchemaError, ValidationError};
use threatmap_graph::GraphError;

#[derive(Error, Debug)]
pub enum ConsolidationError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] GraphError),

    #[error("Failed to parse observation input: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConsolidationError>;
