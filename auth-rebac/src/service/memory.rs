//! In-memory permission service for development and tests.
//!
//! Relationships live in one revision-counted map guarded by a single lock, so
//! every batch is applied atomically. Checks are evaluated against a
//! [`Schema`] with support for:
//! - Direct relations and userset subjects (`org_role:admin#has_role`)
//! - Arrows over a relation (`organization->workspace_read`)
//! - Unions and intersections
//! - Caveated relationships, reported as conditional permission

use crate::debug::{
    CheckDebugTrace, DebugInformation, PermissionType, CACHED_OPERATIONS_COUNT, DEBUG_INFORMATION,
    DISPATCHED_OPERATIONS_COUNT,
};
use crate::error::AuthzError;
use crate::models::*;
use crate::schema::{Rewrite, Schema};
use crate::service::{CallMeta, PermissionService, RelationshipStream, Traced};
use async_trait::async_trait;
use futures::channel::oneshot;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::task::Poll;
use tonic::metadata::{Ascii, MetadataMap, MetadataValue};
use tonic::Status;
use tracing::{debug, warn};

const MAX_DEPTH: u32 = 50;

#[derive(Debug, Default)]
struct StoreState {
    /// Keyed by the text form without caveat, so a touch replaces the caveat.
    tuples: BTreeMap<String, RelationshipTuple>,
    revision: u64,
}

fn tuple_key(tuple: &RelationshipTuple) -> String {
    format!("{}#{}@{}", tuple.resource, tuple.relation, tuple.subject)
}

impl StoreState {
    fn token(&self) -> ConsistencyToken {
        ConsistencyToken::new(self.revision.to_string())
    }

    fn advance(&mut self) -> ConsistencyToken {
        self.revision += 1;
        self.token()
    }

    /// Relationships on `resource` through `relation`, in key order.
    fn related<'a>(&'a self, resource: &ObjectRef, relation: &str) -> impl Iterator<Item = &'a RelationshipTuple> + 'a {
        let prefix = format!("{resource}#{relation}@");
        self.tuples
            .range(prefix.clone()..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .map(|(_, tuple)| tuple)
    }

    fn check_preconditions(&self, preconditions: &[Precondition]) -> Result<(), Status> {
        for precondition in preconditions {
            let matched = self.tuples.values().any(|t| precondition.filter.matches(t));
            let satisfied = match precondition.operation {
                PreconditionOperation::MustMatch => matched,
                PreconditionOperation::MustNotMatch => !matched,
            };
            if !satisfied {
                return Err(Status::failed_precondition(format!(
                    "precondition {:?} failed for filter on '{}'",
                    precondition.operation, precondition.filter.resource_type
                )));
            }
        }
        Ok(())
    }
}

/// Permissionship of a union of branches
fn union(a: Permissionship, b: Permissionship) -> Permissionship {
    use Permissionship::*;
    match (a, b) {
        (HasPermission, _) | (_, HasPermission) => HasPermission,
        (ConditionalPermission, _) | (_, ConditionalPermission) => ConditionalPermission,
        _ => NoPermission,
    }
}

/// Permissionship of an intersection of branches
fn intersection(a: Permissionship, b: Permissionship) -> Permissionship {
    use Permissionship::*;
    match (a, b) {
        (NoPermission | Unspecified, _) | (_, NoPermission | Unspecified) => NoPermission,
        (ConditionalPermission, _) | (_, ConditionalPermission) => ConditionalPermission,
        _ => HasPermission,
    }
}

/// A caveat on the traversed edge downgrades a positive result.
fn through_caveat(result: Permissionship, caveat: Option<&String>) -> Permissionship {
    match (result, caveat) {
        (Permissionship::HasPermission, Some(_)) => Permissionship::ConditionalPermission,
        (result, _) => result,
    }
}

struct Evaluator<'a> {
    schema: &'a Schema,
    state: &'a StoreState,
    subject: &'a SubjectRef,
    dispatched: u64,
}

impl Evaluator<'_> {
    fn evaluate(&mut self, resource: &ObjectRef, name: &str, depth: u32) -> Result<CheckDebugTrace, Status> {
        if depth > MAX_DEPTH {
            return Err(Status::resource_exhausted("maximum check depth exceeded"));
        }
        self.dispatched += 1;

        let mut trace = CheckDebugTrace {
            resource: resource.to_string(),
            permission: name.to_string(),
            permission_type: PermissionType::Relation,
            subject: self.subject.to_string(),
            result: Permissionship::NoPermission,
            was_cached_result: false,
            sub_problems: Vec::new(),
        };

        if &self.subject.object == resource && self.subject.relation.as_deref() == Some(name) {
            trace.result = Permissionship::HasPermission;
            return Ok(trace);
        }

        let schema = self.schema;
        let definition = schema
            .get_definition(&resource.object_type)
            .ok_or_else(|| Status::failed_precondition(format!("unknown object type '{}'", resource.object_type)))?;

        if let Some(permission) = definition.get_permission(name) {
            trace.permission_type = PermissionType::Permission;
            trace.result = self.rewrite(resource, &permission.rewrite, depth, &mut trace.sub_problems)?;
        } else if definition.get_relation(name).is_some() {
            trace.result = self.direct(resource, name, depth, &mut trace.sub_problems)?;
        } else {
            return Err(Status::failed_precondition(format!(
                "unknown relation or permission '{}' on '{}'",
                name, resource.object_type
            )));
        }

        Ok(trace)
    }

    fn direct(
        &mut self,
        resource: &ObjectRef,
        relation: &str,
        depth: u32,
        traces: &mut Vec<CheckDebugTrace>,
    ) -> Result<Permissionship, Status> {
        let state = self.state;
        let mut result = Permissionship::NoPermission;
        for tuple in state.related(resource, relation) {
            let edge = if tuple.subject == *self.subject {
                Permissionship::HasPermission
            } else if let Some(ref subject_relation) = tuple.subject.relation {
                let nested = self.evaluate(&tuple.subject.object, subject_relation, depth + 1)?;
                let edge = nested.result;
                traces.push(nested);
                edge
            } else {
                continue;
            };
            result = union(result, through_caveat(edge, tuple.caveat.as_ref()));
            if result == Permissionship::HasPermission {
                break;
            }
        }
        Ok(result)
    }

    fn rewrite(
        &mut self,
        resource: &ObjectRef,
        rewrite: &Rewrite,
        depth: u32,
        traces: &mut Vec<CheckDebugTrace>,
    ) -> Result<Permissionship, Status> {
        match rewrite {
            Rewrite::Computed(name) => {
                let nested = self.evaluate(resource, name, depth + 1)?;
                let result = nested.result;
                traces.push(nested);
                Ok(result)
            }
            Rewrite::Arrow { tupleset, computed } => {
                let state = self.state;
                let mut result = Permissionship::NoPermission;
                for tuple in state.related(resource, tupleset) {
                    let target = &tuple.subject.object;
                    let declared = self.schema.get_definition(&target.object_type).is_some_and(|d| {
                        d.get_relation(computed).is_some() || d.get_permission(computed).is_some()
                    });
                    if !declared {
                        continue;
                    }
                    let nested = self.evaluate(target, computed, depth + 1)?;
                    result = union(result, through_caveat(nested.result, tuple.caveat.as_ref()));
                    traces.push(nested);
                    if result == Permissionship::HasPermission {
                        break;
                    }
                }
                Ok(result)
            }
            Rewrite::Union(children) => {
                let mut result = Permissionship::NoPermission;
                for child in children {
                    result = union(result, self.rewrite(resource, child, depth, traces)?);
                    if result == Permissionship::HasPermission {
                        break;
                    }
                }
                Ok(result)
            }
            Rewrite::Intersection(children) => {
                let mut result = Permissionship::HasPermission;
                if children.is_empty() {
                    return Ok(Permissionship::NoPermission);
                }
                for child in children {
                    result = intersection(result, self.rewrite(resource, child, depth, traces)?);
                    if result == Permissionship::NoPermission {
                        break;
                    }
                }
                Ok(result)
            }
        }
    }
}

/// Permission service that keeps the relationship graph in process memory
pub struct InMemoryPermissionService {
    schema: Schema,
    state: RwLock<StoreState>,
    schema_text: Mutex<Option<String>>,
    last_consistency: Mutex<Option<Consistency>>,
}

impl InMemoryPermissionService {
    /// Service evaluating `schema`, which must be well-formed.
    pub fn new(schema: Schema) -> crate::error::Result<Self> {
        schema.validate().map_err(AuthzError::InvalidSchema)?;
        Ok(Self::with_schema(schema))
    }

    fn with_schema(schema: Schema) -> Self {
        Self {
            schema,
            state: RwLock::new(StoreState::default()),
            schema_text: Mutex::new(None),
            last_consistency: Mutex::new(None),
        }
    }

    /// Service evaluating the platform policy
    pub fn platform() -> Self {
        Self::with_schema(Schema::platform())
    }

    /// Snapshot of every stored relationship, in key order.
    pub fn relationships(&self) -> Vec<RelationshipTuple> {
        self.state.read().tuples.values().cloned().collect()
    }

    pub fn contains(&self, tuple: &RelationshipTuple) -> bool {
        self.state.read().tuples.contains_key(&tuple_key(tuple))
    }

    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    /// Last schema text pushed through `write_schema`.
    pub fn schema_text(&self) -> Option<String> {
        self.schema_text.lock().clone()
    }

    /// Consistency requested by the most recent read or check.
    pub fn last_consistency(&self) -> Option<Consistency> {
        self.last_consistency.lock().clone()
    }

    fn ensure_fresh(&self, consistency: &Consistency, state: &StoreState) -> Result<(), Status> {
        *self.last_consistency.lock() = Some(consistency.clone());
        if let Consistency::AtLeastAsFresh(token) = consistency {
            let requested: u64 = token
                .token
                .parse()
                .map_err(|_| Status::invalid_argument(format!("malformed consistency token '{token}'")))?;
            if requested > state.revision {
                return Err(Status::failed_precondition(format!(
                    "consistency token {requested} is ahead of revision {}",
                    state.revision
                )));
            }
        }
        Ok(())
    }

    fn trailers(meta: CallMeta, dispatched: u64, info: Option<&DebugInformation>) -> MetadataMap {
        let mut trailers = MetadataMap::new();
        if !meta.debug {
            return trailers;
        }
        trailers.insert(CACHED_OPERATIONS_COUNT, MetadataValue::from(0u64));
        trailers.insert(DISPATCHED_OPERATIONS_COUNT, MetadataValue::from(dispatched));
        if let Some(info) = info {
            match serde_json::to_string(info).map(|json| json.parse::<MetadataValue<Ascii>>()) {
                Ok(Ok(value)) => {
                    trailers.insert(DEBUG_INFORMATION, value);
                }
                _ => warn!("unable to encode debug information trailer"),
            }
        }
        trailers
    }
}

impl Default for InMemoryPermissionService {
    fn default() -> Self {
        Self::platform()
    }
}

#[async_trait]
impl PermissionService for InMemoryPermissionService {
    async fn read_relationships(
        &self,
        request: ReadRelationshipsRequest,
        meta: CallMeta,
    ) -> Result<RelationshipStream, Status> {
        if request.filter.resource_type.is_empty() {
            return Err(Status::invalid_argument("resource type is required"));
        }

        let matched: Vec<RelationshipTuple> = {
            let state = self.state.read();
            self.ensure_fresh(&request.consistency, &state)?;
            state
                .tuples
                .values()
                .filter(|t| request.filter.matches(t))
                .cloned()
                .collect()
        };
        debug!(count = matched.len(), "read relationships");

        // Trailers are released only once the last relationship was taken.
        let (sender, receiver) = oneshot::channel();
        let mut pending = Some((sender, Self::trailers(meta, 1, None)));
        let end = stream::poll_fn(move |_| -> Poll<Option<Result<RelationshipTuple, Status>>> {
            if let Some((sender, trailers)) = pending.take() {
                let _ = sender.send(trailers);
            }
            Poll::Ready(None)
        });
        let relationships = stream::iter(matched.into_iter().map(Ok)).chain(end).boxed();
        Ok(RelationshipStream::new(relationships, receiver))
    }

    async fn write_relationships(
        &self,
        request: WriteRelationshipsRequest,
        meta: CallMeta,
    ) -> Result<Traced<WriteRelationshipsResponse>, Status> {
        for update in &request.updates {
            if update.operation == UpdateOperation::Touch {
                self.schema
                    .validate_tuple(&update.relationship)
                    .map_err(Status::invalid_argument)?;
            }
        }

        let written_at = {
            let mut state = self.state.write();
            state.check_preconditions(&request.preconditions)?;
            for update in request.updates {
                let key = tuple_key(&update.relationship);
                match update.operation {
                    UpdateOperation::Touch => {
                        state.tuples.insert(key, update.relationship);
                    }
                    UpdateOperation::Delete => {
                        state.tuples.remove(&key);
                    }
                }
            }
            state.advance()
        };

        Ok(Traced::with_trailers(
            WriteRelationshipsResponse { written_at },
            Self::trailers(meta, 0, None),
        ))
    }

    async fn delete_relationships(
        &self,
        request: DeleteRelationshipsRequest,
        meta: CallMeta,
    ) -> Result<Traced<DeleteRelationshipsResponse>, Status> {
        if request.filter.resource_type.is_empty() {
            return Err(Status::invalid_argument("resource type is required"));
        }

        let (deleted_at, deleted_count) = {
            let mut state = self.state.write();
            state.check_preconditions(&request.preconditions)?;
            let before = state.tuples.len();
            state.tuples.retain(|_, t| !request.filter.matches(t));
            let deleted = before - state.tuples.len();
            (state.advance(), deleted as u64)
        };

        Ok(Traced::with_trailers(
            DeleteRelationshipsResponse {
                deleted_at,
                deleted_count,
            },
            Self::trailers(meta, 0, None),
        ))
    }

    async fn check_permission(
        &self,
        request: CheckPermissionRequest,
        meta: CallMeta,
    ) -> Result<Traced<CheckPermissionResponse>, Status> {
        let state = self.state.read();
        self.ensure_fresh(&request.consistency, &state)?;

        let mut evaluator = Evaluator {
            schema: &self.schema,
            state: &state,
            subject: &request.subject,
            dispatched: 0,
        };
        let trace = evaluator.evaluate(&request.resource, &request.permission, 0)?;
        let dispatched = evaluator.dispatched;
        let response = CheckPermissionResponse {
            permissionship: trace.result,
            checked_at: state.token(),
        };
        drop(state);

        let info = DebugInformation { check: Some(trace) };
        Ok(Traced::with_trailers(
            response,
            Self::trailers(meta, dispatched, Some(&info)),
        ))
    }

    async fn write_schema(&self, schema: String, _meta: CallMeta) -> Result<Traced<ConsistencyToken>, Status> {
        if schema.trim().is_empty() {
            return Err(Status::invalid_argument("schema is empty"));
        }
        *self.schema_text.lock() = Some(schema);
        let token = self.state.write().advance();
        Ok(Traced::new(token))
    }
}
