//! threatmap-consolidate: Schema-driven consolidation of recon observations
//! into the ThreatMap knowledge graph.
//!
//! Independent producers submit observation batches; the engine resolves
//! each entity to its canonical node by natural key, links declared
//! relationships under their merge policy, and reports a per-observation
//! outcome for every batch.

pub mod engine;
pub mod error;
pub mod linker;
pub mod observation;
pub mod query;
pub mod resolver;
pub mod result;
pub mod scan;

pub use engine::ConsolidationEngine;
pub use error::ConsolidationError;
pub use observation::{EntityRef, ObservationBatch};
pub use query::{GraphQuery, GraphSummary};
pub use result::{IngestResult, Outcome, RejectReason};
