//! The consolidation engine: validates, resolves, links, and commits each
//! observation of a batch.
//!
//! Items within a batch run sequentially (entities first, then
//! relationships). Batches from different producers interleave freely: the
//! engine holds no lock of its own, and all coordination happens per node or
//! edge identity inside the store's atomic upserts.

use std::collections::HashMap;
use std::sync::Arc;

use threatmap_core::events::{EventPayload, GraphEvent};
use threatmap_core::types::{EdgeKey, NodeId};
use threatmap_core::SchemaRegistry;
use threatmap_graph::{EdgeChange, EdgeUpsertOutcome, GraphError, GraphStore};

use crate::linker::{Endpoint, RelationshipLinker};
use crate::observation::{EntityObservation, EntityRef, ObservationBatch, RelationshipObservation};
use crate::resolver::{EntityResolver, ResolvedEntity, ValidatedEntity};
use crate::result::{
    ConflictStale, EndpointSide, Identity, IngestResult, ObservationKind, ObservationReport, ObservationState,
    Outcome, RejectReason, Stage,
};

/// Shared consolidation engine. Clone is cheap (inner Arcs).
#[derive(Clone)]
pub struct ConsolidationEngine {
    schema: SchemaRegistry,
    store: Arc<dyn GraphStore>,
    resolver: EntityResolver,
    linker: RelationshipLinker,
}

impl ConsolidationEngine {
    pub fn new(schema: SchemaRegistry, store: Arc<dyn GraphStore>) -> Self {
        Self {
            resolver: EntityResolver::new(schema.clone(), Arc::clone(&store)),
            linker: RelationshipLinker::new(schema.clone(), Arc::clone(&store)),
            schema,
            store,
        }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub fn linker(&self) -> &RelationshipLinker {
        &self.linker
    }

    /// Ingest one batch. Never fails as a whole: every observation gets its
    /// own outcome in the result.
    pub async fn ingest(&self, batch: ObservationBatch) -> IngestResult {
        self.ingest_with_retry(batch, 1).await
    }

    /// Ingest a batch, making up to `attempts` passes over it while
    /// observations keep failing on store errors.
    ///
    /// Later passes only revisit observations whose last outcome was a
    /// storage failure. Committed entities keep their alias binding, so a
    /// constraint-free node is never minted twice and relationships retried
    /// against it reuse its id.
    pub async fn ingest_with_retry(&self, batch: ObservationBatch, attempts: u32) -> IngestResult {
        let mut run = BatchRun::new(&batch);

        for attempt in 1..=attempts.max(1) {
            if attempt > 1 {
                if !run.has_storage_failures() {
                    break;
                }
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    attempt,
                    pending = run.storage_failures(),
                    "Retrying observations after storage failures"
                );
            }
            self.pass(&mut run, &batch).await;
        }

        let result = run.finish(&batch);
        let s = &result.summary;
        if s.rejected > 0 {
            tracing::warn!(
                batch_id = %result.batch_id,
                source = %result.source,
                created = s.created,
                updated = s.updated,
                unchanged = s.unchanged,
                stale = s.stale,
                rejected = s.rejected,
                storage_failures = s.storage_failures,
                "Batch ingested with rejections"
            );
        } else {
            tracing::info!(
                batch_id = %result.batch_id,
                source = %result.source,
                created = s.created,
                updated = s.updated,
                unchanged = s.unchanged,
                stale = s.stale,
                "Batch ingested"
            );
        }
        result
    }

    /// One pass over every observation still without a final outcome.
    async fn pass(&self, run: &mut BatchRun, batch: &ObservationBatch) {
        for (index, observation) in batch.entities.iter().enumerate() {
            if !needs_attempt(&run.entities[index]) {
                continue;
            }
            if run.entities[index].is_some() {
                if let Some(alias) = &observation.alias {
                    run.release_failed_alias(alias);
                }
            }
            let report = self.ingest_entity(run, index, observation.clone()).await;
            run.entities[index] = Some(report);
        }
        for (index, observation) in batch.relationships.iter().enumerate() {
            if !needs_attempt(&run.relationships[index]) {
                continue;
            }
            let report = self.ingest_relationship(run, index, observation.clone()).await;
            run.relationships[index] = Some(report);
        }
    }

    async fn ingest_entity(&self, run: &mut BatchRun, index: usize, observation: EntityObservation) -> ObservationReport {
        let EntityObservation {
            alias,
            node_type,
            properties,
        } = observation;
        let mut progress = Progress::new(ObservationKind::Entity);

        let report = |progress: &Progress, outcome: Outcome, identity: Option<Identity>| ObservationReport {
            kind: ObservationKind::Entity,
            index,
            alias: alias.clone(),
            type_name: node_type.clone(),
            state: progress.state,
            outcome,
            identity,
            endpoints: None,
            linked: false,
        };

        // Validate
        if let Some(a) = &alias {
            if run.aliases.contains_key(a) {
                let outcome = progress.reject(Stage::Validation, RejectReason::DuplicateAlias { alias: a.clone() });
                return report(&progress, outcome, None);
            }
        }
        let entity = match self.resolver.validate(&node_type, properties) {
            Ok(entity) => entity,
            Err(error) => {
                if let Some(a) = &alias {
                    run.aliases.insert(a.clone(), AliasBinding::rejected(&node_type));
                }
                let outcome = progress.reject(Stage::Validation, RejectReason::Validation { error });
                return report(&progress, outcome, None);
            }
        };
        progress.advance(ObservationState::Validated);

        // Resolve + commit: the store's upsert is the atomic check-and-create.
        progress.advance(ObservationState::Resolved);
        match self.resolver.upsert(entity).await {
            Ok(resolved) => {
                progress.advance(ObservationState::Committed);
                if let Some(a) = &alias {
                    run.aliases.insert(a.clone(), AliasBinding::resolved(&resolved));
                }
                let outcome = run.record_node(&resolved);
                report(&progress, outcome, Some(Identity::Node(resolved.id)))
            }
            Err(e) => {
                tracing::warn!(node_type = %node_type, error = %e, "Entity commit failed");
                if let Some(a) = &alias {
                    run.aliases.insert(a.clone(), AliasBinding::failed(&node_type, &e));
                }
                let outcome = progress.reject(Stage::Commit, RejectReason::Storage { message: e.to_string() });
                report(&progress, outcome, None)
            }
        }
    }

    async fn ingest_relationship(
        &self,
        run: &mut BatchRun,
        index: usize,
        observation: RelationshipObservation,
    ) -> ObservationReport {
        let RelationshipObservation {
            label,
            source,
            target,
            properties,
        } = observation;
        let mut progress = Progress::new(ObservationKind::Relationship);

        let report = |progress: &Progress,
                      outcome: Outcome,
                      identity: Option<Identity>,
                      endpoints: Option<(NodeId, NodeId)>,
                      linked: bool| ObservationReport {
            kind: ObservationKind::Relationship,
            index,
            alias: None,
            type_name: label.clone(),
            state: progress.state,
            outcome,
            identity,
            endpoints,
            linked,
        };

        // Validate: both endpoint types known, relationship declared, key
        // references well-formed. Nothing is written before this passes.
        let planned_source = match self.plan_endpoint(run, &source) {
            Ok(p) => p,
            Err(reason) => {
                let outcome = progress.reject(Stage::Validation, reason);
                return report(&progress, outcome, None, None, false);
            }
        };
        let planned_target = match self.plan_endpoint(run, &target) {
            Ok(p) => p,
            Err(reason) => {
                let outcome = progress.reject(Stage::Validation, reason);
                return report(&progress, outcome, None, None, false);
            }
        };
        if let Err(error) =
            self.linker
                .relationship(&label, planned_source.node_type(), planned_target.node_type())
        {
            let outcome = progress.reject(Stage::Validation, RejectReason::Validation { error });
            return report(&progress, outcome, None, None, false);
        }
        progress.advance(ObservationState::Validated);

        // Resolve endpoints.
        let source_endpoint = match self.resolve_endpoint(run, planned_source, EndpointSide::Source).await {
            Ok(endpoint) => endpoint,
            Err(reason) => {
                let outcome = progress.reject(Stage::Resolution, reason);
                return report(&progress, outcome, None, None, false);
            }
        };
        let target_endpoint = match self.resolve_endpoint(run, planned_target, EndpointSide::Target).await {
            Ok(endpoint) => endpoint,
            Err(reason) => {
                let outcome = progress.reject(Stage::Resolution, reason);
                return report(&progress, outcome, None, None, false);
            }
        };
        progress.advance(ObservationState::Resolved);
        let endpoints = Some((source_endpoint.id, target_endpoint.id));

        // Link
        let upsert = match self.linker.plan(&label, &source_endpoint, &target_endpoint, properties) {
            Ok(upsert) => upsert,
            Err(error) => {
                let outcome = progress.reject(Stage::Linking, RejectReason::Validation { error });
                return report(&progress, outcome, None, endpoints, false);
            }
        };
        let key = upsert.key.clone();
        let index_property = upsert.index_property.clone();
        progress.advance(ObservationState::Linked);

        // Commit. `linked` reports this observation's write only; an edge
        // left by an earlier batch does not count.
        match self.linker.commit(upsert).await {
            Ok(outcome) => {
                progress.advance(ObservationState::Committed);
                let edge_id = outcome.id;
                let outcome = run.record_edge(&key, &index_property, outcome);
                report(&progress, outcome, Some(Identity::Edge(edge_id)), endpoints, true)
            }
            Err(e) => {
                tracing::warn!(label = %label, error = %e, "Edge commit failed");
                let outcome = progress.reject(Stage::Commit, RejectReason::Storage { message: e.to_string() });
                report(&progress, outcome, None, endpoints, false)
            }
        }
    }

    /// Validation half of endpoint handling: no store access.
    fn plan_endpoint(&self, run: &BatchRun, endpoint: &EntityRef) -> Result<PlannedEndpoint, RejectReason> {
        match endpoint {
            EntityRef::Alias { alias } => match run.aliases.get(alias) {
                Some(binding) => Ok(PlannedEndpoint::Alias {
                    alias: alias.clone(),
                    binding: binding.clone(),
                }),
                None => Err(RejectReason::UnknownAlias { alias: alias.clone() }),
            },
            EntityRef::Key { node_type, key } => self
                .resolver
                .validate_reference(node_type, key.clone())
                .map(PlannedEndpoint::Key)
                .map_err(|error| RejectReason::Validation { error }),
        }
    }

    /// Resolution half: bind an alias to its entity's node, or read-through-
    /// or-create a natural-key reference.
    async fn resolve_endpoint(
        &self,
        run: &mut BatchRun,
        planned: PlannedEndpoint,
        side: EndpointSide,
    ) -> Result<Endpoint, RejectReason> {
        match planned {
            PlannedEndpoint::Alias { alias, binding } => match binding.resolution {
                AliasResolution::Node(id) => Ok(Endpoint::new(id, binding.node_type)),
                AliasResolution::Rejected => Err(RejectReason::EndpointUnresolved {
                    endpoint: side,
                    detail: format!("entity {alias} was rejected"),
                    storage: false,
                }),
                AliasResolution::StorageFailed(message) => Err(RejectReason::EndpointUnresolved {
                    endpoint: side,
                    detail: format!("entity {alias} failed to commit: {message}"),
                    storage: true,
                }),
            },
            PlannedEndpoint::Key(entity) => {
                let node_type = entity.node_type.clone();
                match self.resolver.upsert(entity).await {
                    Ok(resolved) => {
                        run.record_node(&resolved);
                        Ok(Endpoint::new(resolved.id, node_type))
                    }
                    Err(e) => Err(RejectReason::EndpointUnresolved {
                        endpoint: side,
                        detail: e.to_string(),
                        storage: true,
                    }),
                }
            }
        }
    }
}

// ── Per-batch bookkeeping ────────────────────────────────────────

#[derive(Debug, Clone)]
enum AliasResolution {
    Node(NodeId),
    Rejected,
    StorageFailed(String),
}

#[derive(Debug, Clone)]
struct AliasBinding {
    node_type: String,
    resolution: AliasResolution,
}

impl AliasBinding {
    fn resolved(entity: &ResolvedEntity) -> Self {
        Self {
            node_type: entity.node_type.clone(),
            resolution: AliasResolution::Node(entity.id),
        }
    }

    fn rejected(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            resolution: AliasResolution::Rejected,
        }
    }

    fn failed(node_type: &str, error: &GraphError) -> Self {
        Self {
            node_type: node_type.to_string(),
            resolution: AliasResolution::StorageFailed(error.to_string()),
        }
    }
}

enum PlannedEndpoint {
    Alias { alias: String, binding: AliasBinding },
    Key(ValidatedEntity),
}

impl PlannedEndpoint {
    fn node_type(&self) -> &str {
        match self {
            Self::Alias { binding, .. } => &binding.node_type,
            Self::Key(entity) => &entity.node_type,
        }
    }
}

/// Whether an observation still needs a pass: never attempted, or last
/// failed on a store error.
fn needs_attempt(slot: &Option<ObservationReport>) -> bool {
    slot.as_ref()
        .map_or(true, |report| report.reject_reason().is_some_and(RejectReason::is_storage))
}

/// State of one batch across all of its passes.
struct BatchRun {
    source: String,
    aliases: HashMap<String, AliasBinding>,
    /// Latest report per entity, by batch position.
    entities: Vec<Option<ObservationReport>>,
    /// Latest report per relationship, by batch position.
    relationships: Vec<Option<ObservationReport>>,
    events: Vec<GraphEvent>,
}

impl BatchRun {
    fn new(batch: &ObservationBatch) -> Self {
        Self {
            source: batch.source.clone(),
            aliases: HashMap::new(),
            entities: vec![None; batch.entities.len()],
            relationships: vec![None; batch.relationships.len()],
            events: Vec::new(),
        }
    }

    fn storage_failures(&self) -> usize {
        self.entities
            .iter()
            .chain(&self.relationships)
            .filter(|slot| slot.is_some() && needs_attempt(slot))
            .count()
    }

    fn has_storage_failures(&self) -> bool {
        self.storage_failures() > 0
    }

    /// Drop an alias bound to an entity whose commit failed, so the retried
    /// entity can bind it again.
    fn release_failed_alias(&mut self, alias: &str) {
        if matches!(
            self.aliases.get(alias).map(|b| &b.resolution),
            Some(AliasResolution::StorageFailed(_))
        ) {
            self.aliases.remove(alias);
        }
    }

    fn finish(self, batch: &ObservationBatch) -> IngestResult {
        let reports = self.entities.into_iter().chain(self.relationships).flatten().collect();
        IngestResult::new(batch.batch_id, batch.source.clone(), reports, self.events)
    }

    fn record_node(&mut self, resolved: &ResolvedEntity) -> Outcome {
        if resolved.created {
            self.events.push(GraphEvent::new(
                &self.source,
                EventPayload::NodeCreated {
                    node_id: resolved.id,
                    node_type: resolved.node_type.clone(),
                },
            ));
            Outcome::Created
        } else if !resolved.changed_fields.is_empty() {
            self.events.push(GraphEvent::new(
                &self.source,
                EventPayload::NodeUpdated {
                    node_id: resolved.id,
                    node_type: resolved.node_type.clone(),
                    changed_fields: resolved.changed_fields.clone(),
                },
            ));
            Outcome::Updated {
                changed_fields: resolved.changed_fields.clone(),
            }
        } else {
            Outcome::Unchanged
        }
    }

    fn record_edge(&mut self, key: &EdgeKey, index_property: &str, outcome: EdgeUpsertOutcome) -> Outcome {
        let edge_id = outcome.id;
        match outcome.change {
            EdgeChange::Created => {
                self.events.push(GraphEvent::new(
                    &self.source,
                    EventPayload::EdgeCreated {
                        edge_id,
                        source_id: key.source_id,
                        target_id: key.target_id,
                        label: key.label.clone(),
                    },
                ));
                Outcome::Created
            }
            EdgeChange::Updated { changed_fields } => {
                self.events.push(GraphEvent::new(
                    &self.source,
                    EventPayload::EdgeUpdated {
                        edge_id,
                        label: key.label.clone(),
                        changed_fields: changed_fields.clone(),
                    },
                ));
                Outcome::Updated { changed_fields }
            }
            EdgeChange::Unchanged => Outcome::Unchanged,
            EdgeChange::Stale { stored, observed } => {
                tracing::warn!(
                    edge_id = %edge_id,
                    label = %key.label,
                    index_property,
                    stored = %stored,
                    observed = %observed,
                    "Stale observation, stored edge kept"
                );
                self.events.push(GraphEvent::new(
                    &self.source,
                    EventPayload::EdgeStale {
                        edge_id,
                        label: key.label.clone(),
                        index_property: index_property.to_string(),
                        stored: stored.clone(),
                        observed: observed.clone(),
                    },
                ));
                Outcome::Stale(ConflictStale {
                    edge_id,
                    label: key.label.clone(),
                    index_property: index_property.to_string(),
                    stored,
                    observed,
                })
            }
        }
    }
}

/// The state machine of one observation.
struct Progress {
    kind: ObservationKind,
    state: ObservationState,
}

impl Progress {
    fn new(kind: ObservationKind) -> Self {
        Self {
            kind,
            state: ObservationState::Pending,
        }
    }

    fn advance(&mut self, next: ObservationState) {
        debug_assert!(
            self.state.can_advance_to(next, self.kind),
            "illegal transition {:?} -> {:?} for {:?}",
            self.state,
            next,
            self.kind
        );
        self.state = next;
    }

    fn reject(&mut self, stage: Stage, reason: RejectReason) -> Outcome {
        tracing::debug!(stage = ?stage, code = reason.code(), reason = %reason, "Observation rejected");
        self.advance(ObservationState::Rejected);
        Outcome::Rejected { stage, reason }
    }
}
