//! Per-observation outcomes of an ingest.

use serde::Serialize;
use uuid::Uuid;

use threatmap_core::events::GraphEvent;
use threatmap_core::types::{EdgeId, NodeId};
use threatmap_core::ValidationError;

/// Where an observation is in the consolidation pipeline.
///
/// `Pending → Validated → Resolved → Linked → Committed`, or `Rejected`
/// from any non-terminal state. Entity observations skip `Linked`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObservationState {
    Pending,
    Validated,
    Resolved,
    Linked,
    Committed,
    Rejected,
}

impl ObservationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Rejected)
    }

    pub(crate) fn can_advance_to(self, next: Self, kind: ObservationKind) -> bool {
        use ObservationState::*;
        match (self, next) {
            (s, Rejected) => !s.is_terminal(),
            (Pending, Validated) | (Validated, Resolved) => true,
            (Resolved, Linked) | (Linked, Committed) => kind == ObservationKind::Relationship,
            (Resolved, Committed) => kind == ObservationKind::Entity,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Entity,
    Relationship,
}

/// Which pipeline step rejected an observation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Resolution,
    Linking,
    Commit,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSide {
    Source,
    Target,
}

/// Why an observation was rejected.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    Validation { error: ValidationError },
    /// A relationship names an alias no entity in the batch declares.
    UnknownAlias { alias: String },
    /// Two entities in one batch declare the same alias.
    DuplicateAlias { alias: String },
    /// An endpoint of a relationship could not be resolved; the edge was
    /// never attempted.
    EndpointUnresolved {
        endpoint: EndpointSide,
        detail: String,
        storage: bool,
    },
    Storage { message: String },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::UnknownAlias { .. } => "unknown_alias",
            Self::DuplicateAlias { .. } => "duplicate_alias",
            Self::EndpointUnresolved { .. } => "endpoint_unresolved",
            Self::Storage { .. } => "storage",
        }
    }

    /// Whether the failure came from the store and may succeed on retry.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::EndpointUnresolved { storage: true, .. }
        )
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { error } => write!(f, "{error}"),
            Self::UnknownAlias { alias } => write!(f, "unknown alias {alias}"),
            Self::DuplicateAlias { alias } => write!(f, "duplicate alias {alias}"),
            Self::EndpointUnresolved { endpoint, detail, .. } => {
                write!(f, "{endpoint:?} endpoint unresolved: {detail}")
            }
            Self::Storage { message } => write!(f, "storage failure: {message}"),
        }
    }
}

/// A monotonic merge that kept the stored edge. Informational, not a failure.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConflictStale {
    pub edge_id: EdgeId,
    pub label: String,
    pub index_property: String,
    pub stored: serde_json::Value,
    pub observed: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated { changed_fields: Vec<String> },
    Unchanged,
    Stale(ConflictStale),
    Rejected { stage: Stage, reason: RejectReason },
}

/// The identity an observation resolved to.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Identity {
    Node(NodeId),
    Edge(EdgeId),
}

/// Outcome of one observation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ObservationReport {
    pub kind: ObservationKind,
    /// Position within its list (entities or relationships) in the batch.
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Node type for entities, edge label for relationships.
    pub type_name: String,
    pub state: ObservationState,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// Resolved endpoints, for relationships that got that far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<(NodeId, NodeId)>,
    /// Whether the relationship's edge exists in the store. Always false for
    /// entities.
    pub linked: bool,
}

impl ObservationReport {
    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, Outcome::Rejected { .. })
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match &self.outcome {
            Outcome::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        match self.identity {
            Some(Identity::Node(id)) => Some(id),
            _ => None,
        }
    }

    pub fn edge_id(&self) -> Option<EdgeId> {
        match self.identity {
            Some(Identity::Edge(id)) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub stale: u32,
    pub rejected: u32,
    pub storage_failures: u32,
}

impl IngestSummary {
    fn from_reports(reports: &[ObservationReport]) -> Self {
        let mut summary = Self::default();
        for report in reports {
            match &report.outcome {
                Outcome::Created => summary.created += 1,
                Outcome::Updated { .. } => summary.updated += 1,
                Outcome::Unchanged => summary.unchanged += 1,
                Outcome::Stale(_) => summary.stale += 1,
                Outcome::Rejected { reason, .. } => {
                    summary.rejected += 1;
                    if reason.is_storage() {
                        summary.storage_failures += 1;
                    }
                }
            }
        }
        summary
    }
}

/// Result of ingesting one batch.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub batch_id: Uuid,
    pub source: String,
    /// Entities in batch order, then relationships in batch order.
    pub reports: Vec<ObservationReport>,
    pub summary: IngestSummary,
    /// Every effective graph change made by this batch.
    pub events: Vec<GraphEvent>,
}

impl IngestResult {
    pub(crate) fn new(batch_id: Uuid, source: String, reports: Vec<ObservationReport>, events: Vec<GraphEvent>) -> Self {
        let summary = IngestSummary::from_reports(&reports);
        Self {
            batch_id,
            source,
            reports,
            summary,
            events,
        }
    }

    /// True if any observation failed on a store error and may succeed when
    /// the batch is re-submitted.
    pub fn has_storage_failures(&self) -> bool {
        self.summary.storage_failures > 0
    }

    pub fn entities(&self) -> impl Iterator<Item = &ObservationReport> {
        self.reports.iter().filter(|r| r.kind == ObservationKind::Entity)
    }

    pub fn relationships(&self) -> impl Iterator<Item = &ObservationReport> {
        self.reports.iter().filter(|r| r.kind == ObservationKind::Relationship)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &ObservationReport> {
        self.reports.iter().filter(|r| r.is_rejected())
    }

    pub fn stale(&self) -> impl Iterator<Item = &ConflictStale> {
        self.reports.iter().filter_map(|r| match &r.outcome {
            Outcome::Stale(stale) => Some(stale),
            _ => None,
        })
    }
}
