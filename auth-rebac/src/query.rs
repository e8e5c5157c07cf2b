use crate::consistency::ConsistencyTracker;
use crate::context::AuthzContext;
use crate::debug::DebugTracer;
use crate::error::{AuthzError, Result};
use crate::models::*;
use crate::policy;
use crate::service::{PermissionService, RelationshipStream};
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Reads relationships back from the service, at least as fresh as the newest
/// write this process has seen.
pub struct RelationshipQuery {
    service: Arc<dyn PermissionService>,
    tracker: Arc<ConsistencyTracker>,
    tracer: Arc<DebugTracer>,
}

impl RelationshipQuery {
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

    /// Drains the stream of relationships matching `filter`.
    ///
    /// A failure before the first item is [`AuthzError::Remote`]; one while
    /// receiving is [`AuthzError::Stream`]. Items already received are dropped
    /// in both cases.
    pub async fn read_relationships(
        &self,
        ctx: &AuthzContext,
        filter: RelationshipFilter,
    ) -> Result<Vec<RelationshipTuple>> {
        const OPERATION: &str = "read relationships";
        let meta = self.tracer.call_meta(ctx);
        let request = ReadRelationshipsRequest {
            consistency: self.tracker.requirement(),
            filter,
        };

        let mut stream = ctx
            .bounded(OPERATION, self.service.read_relationships(request, meta))
            .await?
            .map_err(|e| AuthzError::remote(OPERATION, e))?;

        let drained = Self::drain(ctx, &mut stream).await;
        // Trailers are only complete once the stream has ended.
        self.tracer.observe(meta, OPERATION, &stream.trailers());

        let relationships = drained?;
        debug!(count = relationships.len(), "read relationships");
        Ok(relationships)
    }

    async fn drain(ctx: &AuthzContext, stream: &mut RelationshipStream) -> Result<Vec<RelationshipTuple>> {
        const OPERATION: &str = "read relationships";
        let mut relationships = Vec::new();
        while let Some(item) = ctx.bounded(OPERATION, stream.relationships.next()).await? {
            let relationship = item.map_err(|source| AuthzError::Stream {
                operation: OPERATION,
                source,
            })?;
            relationships.push(relationship);
        }
        Ok(relationships)
    }

    /// Ids of every actor holding `role`, in any organization.
    pub async fn list_role_members(&self, ctx: &AuthzContext, role: &str) -> Result<Vec<String>> {
        let relationships = self.read_relationships(ctx, policy::role_members_filter(role)).await?;
        Ok(relationships
            .into_iter()
            .map(|relationship| relationship.subject.object.object_id)
            .collect())
    }

    /// Permission names `role` grants in `org_id`.
    pub async fn list_role_permissions(&self, ctx: &AuthzContext, role: &str, org_id: Uuid) -> Result<Vec<String>> {
        let relationships = self
            .read_relationships(ctx, policy::role_permissions_filter(role, org_id))
            .await?;
        Ok(relationships
            .into_iter()
            .map(|relationship| relationship.relation)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::DISPATCHED_OPERATIONS_COUNT;
    use crate::policy::grant;
    use crate::service::MockPermissionService;
    use futures::channel::oneshot;
    use futures::stream;
    use std::task::Poll;
    use std::time::Duration;
    use tonic::metadata::{MetadataMap, MetadataValue};
    use tonic::Status;

    fn query(service: MockPermissionService, tracker: Arc<ConsistencyTracker>) -> RelationshipQuery {
        RelationshipQuery::new(Arc::new(service), tracker, Arc::new(DebugTracer::default()))
    }

    fn streamed(items: Vec<std::result::Result<RelationshipTuple, Status>>) -> RelationshipStream {
        RelationshipStream::with_trailers(stream::iter(items).boxed(), MetadataMap::new())
    }

    /// Stream that hands over `dispatched` in its trailers only after the
    /// last item has been taken, the way a gRPC transport does.
    fn streamed_with_late_trailers(
        items: Vec<std::result::Result<RelationshipTuple, Status>>,
        dispatched: u64,
    ) -> RelationshipStream {
        let (sender, receiver) = oneshot::channel();
        let mut trailers = MetadataMap::new();
        trailers.insert(DISPATCHED_OPERATIONS_COUNT, MetadataValue::from(dispatched));
        let mut pending = Some((sender, trailers));
        let end = stream::poll_fn(move |_| -> Poll<Option<std::result::Result<RelationshipTuple, Status>>> {
            if let Some((sender, trailers)) = pending.take() {
                let _ = sender.send(trailers);
            }
            Poll::Ready(None)
        });
        RelationshipStream::new(stream::iter(items).chain(end).boxed(), receiver)
    }

    #[tokio::test]
    async fn collects_permission_names() {
        let org = Uuid::new_v4();
        let mut service = MockPermissionService::new();
        service
            .expect_read_relationships()
            .times(1)
            .withf(move |req, _| req.filter == policy::role_permissions_filter("admin", org))
            .returning(move |_, _| {
                Ok(streamed(vec![
                    Ok(policy::role_grant(org, grant::WORKSPACE_READ, "admin")),
                    Ok(policy::role_grant(org, grant::TEMPLATE_UPDATE, "admin")),
                ]))
            });

        let permissions = query(service, Arc::new(ConsistencyTracker::new()))
            .list_role_permissions(&AuthzContext::new(), "admin", org)
            .await
            .unwrap();
        assert_eq!(permissions, vec![grant::WORKSPACE_READ, grant::TEMPLATE_UPDATE]);
    }

    #[tokio::test]
    async fn reads_use_tracked_token() {
        let tracker = Arc::new(ConsistencyTracker::new());
        tracker.store(ConsistencyToken::new("9"));
        let mut service = MockPermissionService::new();
        service
            .expect_read_relationships()
            .times(1)
            .withf(|req, _| req.consistency == Consistency::AtLeastAsFresh(ConsistencyToken::new("9")))
            .returning(|_, _| Ok(streamed(Vec::new())));

        let members = query(service, tracker)
            .list_role_members(&AuthzContext::new(), "admin")
            .await
            .unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn mid_stream_failure_discards_partial_results() {
        let user = Uuid::new_v4();
        let mut service = MockPermissionService::new();
        service.expect_read_relationships().returning(move |_, _| {
            Ok(streamed(vec![
                Ok(policy::role_member("admin", user)),
                Err(Status::aborted("stream reset")),
            ]))
        });

        let err = query(service, Arc::new(ConsistencyTracker::new()))
            .list_role_members(&AuthzContext::new(), "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Stream { operation: "read relationships", .. }));
    }

    #[tokio::test]
    async fn open_failure_is_remote() {
        let mut service = MockPermissionService::new();
        service
            .expect_read_relationships()
            .returning(|_, _| Err(Status::unavailable("dial failed")));

        let err = query(service, Arc::new(ConsistencyTracker::new()))
            .list_role_members(&AuthzContext::new(), "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Remote { .. }));
    }

    #[tokio::test]
    async fn debug_trailers_are_read_after_stream_ends() {
        let mut service = MockPermissionService::new();
        service.expect_read_relationships().times(1).returning(|_, _| {
            Ok(streamed_with_late_trailers(
                vec![Ok(policy::role_member("admin", Uuid::new_v4()))],
                4,
            ))
        });
        let tracer = Arc::new(DebugTracer::new(false));
        let query = RelationshipQuery::new(Arc::new(service), Arc::new(ConsistencyTracker::new()), tracer.clone());

        let members = query
            .list_role_members(&AuthzContext::new().with_debug(true), "admin")
            .await
            .unwrap();
        assert_eq!(members.len(), 1);
        let summary = tracer.last_summary().unwrap();
        assert_eq!(summary.dispatched_operations, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_item_hits_deadline() {
        let mut service = MockPermissionService::new();
        service.expect_read_relationships().returning(|_, _| {
            let items = stream::iter(vec![Ok::<_, Status>(policy::role_member("admin", Uuid::new_v4()))]).chain(stream::pending());
            Ok(RelationshipStream::with_trailers(items.boxed(), MetadataMap::new()))
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let err = query(service, Arc::new(ConsistencyTracker::new()))
            .list_role_members(&AuthzContext::new().with_deadline(deadline), "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::DeadlineExceeded { operation: "read relationships" }));
    }
}
