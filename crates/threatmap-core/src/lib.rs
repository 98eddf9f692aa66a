//! threatmap-core: Shared types, schema, merge policy, and configuration for
//! the ThreatMap consolidation engine.
//!
//! This crate provides the foundations used across all ThreatMap components:
//! - Node/edge records and their deterministic identities
//! - The declarative schema registry
//! - Property normalization and merge policy shared by every graph store
//! - Change-feed event types
//! - Configuration management
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod merge;
pub mod schema;
pub mod types;

pub use error::{SchemaError, ThreatMapError, ValidationError};
pub use schema::{IndexPolicy, NodeType, RelationshipType, Schema, SchemaRegistry};
