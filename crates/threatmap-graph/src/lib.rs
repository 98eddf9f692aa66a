//! ThreatMap Graph: storage for the consolidated knowledge graph.
//!
//! This crate defines the [`GraphStore`] contract the consolidation engine
//! writes through, and its two backends: a process-local
//! [`MemoryGraphStore`] and a [`Neo4jGraphStore`].

pub mod client;
pub mod memory;
pub mod neo4j;
pub mod store;

pub use client::{GraphClient, GraphError};
pub use memory::MemoryGraphStore;
pub use neo4j::Neo4jGraphStore;
pub use store::{EdgeChange, EdgeUpsert, EdgeUpsertOutcome, GraphStore, NodeUpsert, NodeUpsertOutcome};
