use crate::consistency::ConsistencyTracker;
use crate::context::AuthzContext;
use crate::debug::DebugTracer;
use crate::error::{AuthzError, Result};
use crate::models::*;
use crate::service::PermissionService;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Writes relationship batches and hands back their compensating deletes
pub struct RelationshipWriter {
    service: Arc<dyn PermissionService>,
    tracker: Arc<ConsistencyTracker>,
    tracer: Arc<DebugTracer>,
}

impl RelationshipWriter {
    pub fn new(
        service: Arc<dyn PermissionService>,
        tracker: Arc<ConsistencyTracker>,
        tracer: Arc<DebugTracer>,
    ) -> Self {
        Self {
            service,
            tracker,
            tracer,
        }
    }

    /// Touches every relationship in one atomic batch.
    ///
    /// The returned action deletes the same relationships again. When a
    /// `scope` is given the action is registered there instead and the
    /// returned action is a no-op, so it cannot run twice.
    pub async fn write(
        self: &Arc<Self>,
        ctx: &AuthzContext,
        relationships: Vec<RelationshipTuple>,
        scope: Option<&RevertScope>,
    ) -> Result<RevertAction> {
        if relationships.is_empty() {
            return Ok(RevertAction::noop());
        }

        self.apply(ctx, "write relationships", UpdateOperation::Touch, &relationships)
            .await?;

        let revert = RevertAction {
            pending: Some(PendingRevert {
                writer: Arc::clone(self),
                ctx: ctx.without_deadline(),
                relationships,
            }),
        };

        match scope {
            Some(scope) => {
                scope.register(revert);
                Ok(RevertAction::noop())
            }
            None => Ok(revert),
        }
    }

    /// Writes `relationships`, runs `operation`, and reverts the write if the
    /// operation fails.
    pub async fn with_relationships<T, E, F, Fut>(
        self: &Arc<Self>,
        ctx: &AuthzContext,
        relationships: Vec<RelationshipTuple>,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        E: From<AuthzError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let revert = self.write(ctx, relationships, None).await?;
        match operation().await {
            Ok(value) => Ok(value),
            Err(e) => {
                revert.revert().await;
                Err(e)
            }
        }
    }

    /// Deletes everything matching `filter` in one call and records the
    /// resulting token.
    pub async fn delete_matching(&self, ctx: &AuthzContext, filter: RelationshipFilter) -> Result<u64> {
        const OPERATION: &str = "delete relationships";
        let meta = self.tracer.call_meta(ctx);
        let request = DeleteRelationshipsRequest {
            filter,
            preconditions: Vec::new(),
        };

        let response = ctx
            .bounded(OPERATION, self.service.delete_relationships(request, meta))
            .await?
            .map_err(|e| AuthzError::remote(OPERATION, e))?;
        self.tracer.observe(meta, OPERATION, &response.trailers);
        self.tracker.store(response.value.deleted_at);

        debug!(deleted = response.value.deleted_count, "deleted relationships");
        Ok(response.value.deleted_count)
    }

    async fn apply(
        &self,
        ctx: &AuthzContext,
        operation: &'static str,
        kind: UpdateOperation,
        relationships: &[RelationshipTuple],
    ) -> Result<()> {
        let meta = self.tracer.call_meta(ctx);
        if meta.debug {
            debug!(operation, relationships = ?text_forms(relationships), "debug rpc request");
        }

        let request = WriteRelationshipsRequest {
            updates: relationships
                .iter()
                .map(|relationship| RelationshipUpdate {
                    operation: kind,
                    relationship: relationship.clone(),
                })
                .collect(),
            preconditions: Vec::new(),
        };

        let response = ctx
            .bounded(operation, self.service.write_relationships(request, meta))
            .await?
            .map_err(|e| AuthzError::remote(operation, e))?;
        self.tracer.observe(meta, operation, &response.trailers);
        self.tracker.store(response.value.written_at);

        debug!(operation, count = relationships.len(), "applied relationship batch");
        Ok(())
    }
}

fn text_forms(relationships: &[RelationshipTuple]) -> Vec<String> {
    relationships.iter().map(ToString::to_string).collect()
}

struct PendingRevert {
    writer: Arc<RelationshipWriter>,
    ctx: AuthzContext,
    relationships: Vec<RelationshipTuple>,
}

/// Compensating delete for one relationship write.
///
/// Running it deletes exactly the written relationships in one atomic batch.
/// Failures are logged with the full relationship list and never returned:
/// the failure that triggered the revert is the one the caller reports.
/// Relationships left behind must be reconciled out of band.
#[must_use = "dropping a revert action discards the compensating delete"]
pub struct RevertAction {
    pending: Option<PendingRevert>,
}

impl RevertAction {
    pub fn noop() -> Self {
        Self { pending: None }
    }

    pub fn is_noop(&self) -> bool {
        self.pending.is_none()
    }

    /// Relationships this action would delete.
    pub fn relationships(&self) -> &[RelationshipTuple] {
        match self.pending {
            Some(ref pending) => &pending.relationships,
            None => &[],
        }
    }

    pub async fn revert(self) {
        let Some(pending) = self.pending else {
            return;
        };
        let result = pending
            .writer
            .apply(
                &pending.ctx,
                "revert relationships",
                UpdateOperation::Delete,
                &pending.relationships,
            )
            .await;
        if let Err(e) = result {
            error!(
                error = %e,
                quantity = pending.relationships.len(),
                relationships = ?text_forms(&pending.relationships),
                "revert relationships"
            );
        }
    }
}

impl std::fmt::Debug for RevertAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevertAction")
            .field("relationships", &text_forms(self.relationships()))
            .finish()
    }
}

/// Collects the reverts of every write made during one host operation.
///
/// `abort` runs all of them, newest first; `commit` discards them. Writers
/// running concurrently inside the same operation can share the scope.
#[derive(Debug, Default)]
pub struct RevertScope {
    reverts: Mutex<Vec<RevertAction>>,
}

impl RevertScope {
    pub fn begin() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, revert: RevertAction) {
        if !revert.is_noop() {
            self.reverts.lock().push(revert);
        }
    }

    pub fn pending(&self) -> usize {
        self.reverts.lock().len()
    }

    /// The host operation succeeded: keep every write.
    pub fn commit(&self) {
        let discarded = std::mem::take(&mut *self.reverts.lock());
        debug!(count = discarded.len(), "revert scope committed");
    }

    /// The host operation failed: undo every write. Returns how many reverts ran.
    pub async fn abort(&self) -> usize {
        let reverts = std::mem::take(&mut *self.reverts.lock());
        let count = reverts.len();
        for revert in reverts.into_iter().rev() {
            revert.revert().await;
        }
        debug!(count, "revert scope aborted");
        count
    }

    /// Runs `operation` inside a fresh scope, committing on `Ok` and aborting
    /// on `Err`.
    pub async fn run<T, E, F, Fut>(operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<RevertScope>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let scope = Arc::new(Self::begin());
        match operation(Arc::clone(&scope)).await {
            Ok(value) => {
                scope.commit();
                Ok(value)
            }
            Err(e) => {
                scope.abort().await;
                Err(e)
            }
        }
    }
}

impl Drop for RevertScope {
    fn drop(&mut self) {
        let pending = self.reverts.get_mut().len();
        if pending > 0 {
            warn!(pending, "revert scope dropped without commit or abort; writes are kept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy;
    use crate::service::{MockPermissionService, Traced};
    use tonic::Status;
    use uuid::Uuid;

    fn writer(service: MockPermissionService) -> (Arc<RelationshipWriter>, Arc<ConsistencyTracker>) {
        let tracker = Arc::new(ConsistencyTracker::new());
        let writer = Arc::new(RelationshipWriter::new(
            Arc::new(service),
            tracker.clone(),
            Arc::new(DebugTracer::default()),
        ));
        (writer, tracker)
    }

    fn written(token: &str) -> std::result::Result<Traced<WriteRelationshipsResponse>, Status> {
        Ok(Traced::new(WriteRelationshipsResponse {
            written_at: ConsistencyToken::new(token),
        }))
    }

    #[tokio::test]
    async fn write_failure_is_remote_error_and_keeps_tracker() {
        let mut service = MockPermissionService::new();
        service
            .expect_write_relationships()
            .times(1)
            .returning(|_, _| Err(Status::unavailable("connection refused")));
        let (writer, tracker) = writer(service);

        let err = writer
            .write(&AuthzContext::new(), vec![policy::role_member("admin", Uuid::new_v4())], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Remote { operation: "write relationships", .. }));
        assert_eq!(tracker.load(), None);
    }

    #[tokio::test]
    async fn revert_deletes_same_batch_and_updates_tracker() {
        let tuples = vec![
            policy::role_member("admin", Uuid::new_v4()),
            policy::role_member("admin", Uuid::new_v4()),
        ];
        let expected = tuples.clone();

        let mut service = MockPermissionService::new();
        let mut sequence = mockall::Sequence::new();
        service
            .expect_write_relationships()
            .times(1)
            .in_sequence(&mut sequence)
            .withf(|req, _| req.updates.iter().all(|u| u.operation == UpdateOperation::Touch))
            .returning(|_, _| written("1"));
        service
            .expect_write_relationships()
            .times(1)
            .in_sequence(&mut sequence)
            .withf(move |req, _| {
                req.updates.iter().all(|u| u.operation == UpdateOperation::Delete)
                    && req.updates.iter().map(|u| &u.relationship).eq(expected.iter())
            })
            .returning(|_, _| written("2"));
        let (writer, tracker) = writer(service);

        let revert = writer.write(&AuthzContext::new(), tuples, None).await.unwrap();
        assert_eq!(tracker.load(), Some(ConsistencyToken::new("1")));
        assert_eq!(revert.relationships().len(), 2);

        revert.revert().await;
        assert_eq!(tracker.load(), Some(ConsistencyToken::new("2")));
    }

    #[tokio::test]
    async fn failed_revert_is_swallowed() {
        let mut service = MockPermissionService::new();
        let mut sequence = mockall::Sequence::new();
        service
            .expect_write_relationships()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| written("1"));
        service
            .expect_write_relationships()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Err(Status::internal("datastore unavailable")));
        let (writer, tracker) = writer(service);

        let revert = writer
            .write(&AuthzContext::new(), vec![policy::role_member("admin", Uuid::new_v4())], None)
            .await
            .unwrap();
        revert.revert().await;
        assert_eq!(tracker.load(), Some(ConsistencyToken::new("1")));
    }

    #[tokio::test]
    async fn empty_write_makes_no_call() {
        let (writer, tracker) = writer(MockPermissionService::new());
        let revert = writer.write(&AuthzContext::new(), Vec::new(), None).await.unwrap();
        assert!(revert.is_noop());
        revert.revert().await;
        assert_eq!(tracker.load(), None);
    }

    #[tokio::test]
    async fn scoped_writes_return_noop() {
        let mut service = MockPermissionService::new();
        service.expect_write_relationships().times(2).returning(|_, _| written("1"));
        let (writer, _) = writer(service);
        let scope = RevertScope::begin();

        for _ in 0..2 {
            let revert = writer
                .write(&AuthzContext::new(), vec![policy::role_member("admin", Uuid::new_v4())], Some(&scope))
                .await
                .unwrap();
            assert!(revert.is_noop());
        }
        assert_eq!(scope.pending(), 2);

        // Committing discards without touching the service again.
        scope.commit();
        assert_eq!(scope.pending(), 0);
    }

    #[tokio::test]
    async fn with_relationships_reverts_on_failure() {
        let mut service = MockPermissionService::new();
        let mut sequence = mockall::Sequence::new();
        service
            .expect_write_relationships()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| written("1"));
        service
            .expect_write_relationships()
            .times(1)
            .in_sequence(&mut sequence)
            .withf(|req, _| req.updates.iter().all(|u| u.operation == UpdateOperation::Delete))
            .returning(|_, _| written("2"));
        let (writer, _) = writer(service);

        let result: std::result::Result<(), AuthzError> = writer
            .with_relationships(
                &AuthzContext::new(),
                vec![policy::role_member("admin", Uuid::new_v4())],
                || async { Err(AuthzError::InvalidRelationship("host insert failed".to_string())) },
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_matching_stores_deleted_at() {
        let mut service = MockPermissionService::new();
        service.expect_delete_relationships().times(1).returning(|_, _| {
            Ok(Traced::new(DeleteRelationshipsResponse {
                deleted_at: ConsistencyToken::new("7"),
                deleted_count: 3,
            }))
        });
        let (writer, tracker) = writer(service);

        let deleted = writer
            .delete_matching(&AuthzContext::new(), policy::role_permissions_filter("admin", Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(tracker.load(), Some(ConsistencyToken::new("7")));
    }
}
