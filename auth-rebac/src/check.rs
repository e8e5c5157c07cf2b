use crate::{
    consistency::ConsistencyTracker,
    context::AuthzContext,
    debug::DebugTracer,
    error::{AuthzError, Result},
    models::*,
    service::PermissionService,
};
use std::sync::Arc;
use tracing::debug;

/// Answers "may the bound actor do `permission` on `resource`?".
///
/// Every check goes to the service with the freshest consistency token this
/// process has observed, so a write made just before the check is visible to it.
/// - No actor bound: [`AuthzError::NoActor`], surfaced as "not found"
/// - Bootstrap actor: allowed without a remote call
/// - Conditional permission: denied, since no caveat context is supplied
pub struct PermissionChecker {
    service: Arc<dyn PermissionService>,
    tracker: Arc<ConsistencyTracker>,
    tracer: Arc<DebugTracer>,
}

impl PermissionChecker {
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

    pub async fn check(&self, ctx: &AuthzContext, permission: &str, resource: &ObjectRef) -> Result<()> {
        const OPERATION: &str = "check permission";

        let actor = ctx.actor().ok_or(AuthzError::NoActor)?;
        let Some(subject) = actor.subject() else {
            debug!(%resource, permission, "bootstrap actor bypasses check");
            return Ok(());
        };

        let meta = self.tracer.call_meta(ctx);
        let request = CheckPermissionRequest {
            consistency: self.tracker.requirement(),
            resource: resource.clone(),
            permission: permission.to_string(),
            subject,
            context: None,
        };

        let response = ctx
            .bounded(OPERATION, self.service.check_permission(request, meta))
            .await?
            .map_err(|e| AuthzError::remote(OPERATION, e))?;
        self.tracer.observe(meta, OPERATION, &response.trailers);

        let permissionship = response.value.permissionship;
        debug!(%resource, permission, ?permissionship, "checked permission");

        match permissionship {
            Permissionship::HasPermission => Ok(()),
            Permissionship::ConditionalPermission => Err(AuthzError::ConditionalDenied {
                permission: permission.to_string(),
                resource: resource.clone(),
            }),
            Permissionship::NoPermission | Permissionship::Unspecified => Err(AuthzError::Denied {
                permission: permission.to_string(),
                resource: resource.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BootstrapGrant;
    use crate::policy;
    use crate::service::{MockPermissionService, Traced};
    use tonic::Status;
    use uuid::Uuid;

    fn checker(service: MockPermissionService, tracker: Arc<ConsistencyTracker>) -> PermissionChecker {
        PermissionChecker::new(Arc::new(service), tracker, Arc::new(DebugTracer::default()))
    }

    fn answer(permissionship: Permissionship) -> std::result::Result<Traced<CheckPermissionResponse>, Status> {
        Ok(Traced::new(CheckPermissionResponse {
            permissionship,
            checked_at: ConsistencyToken::new("1"),
        }))
    }

    #[tokio::test]
    async fn missing_actor_never_calls_service() {
        let checker = checker(MockPermissionService::new(), Arc::new(ConsistencyTracker::new()));
        let err = checker
            .check(&AuthzContext::new(), "read", &policy::workspace(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::NoActor));
    }

    #[tokio::test]
    async fn bootstrap_never_calls_service() {
        let checker = checker(MockPermissionService::new(), Arc::new(ConsistencyTracker::new()));
        let grant = BootstrapGrant::new();
        checker
            .check(&AuthzContext::new().as_bootstrap(&grant), "delete", &policy::workspace(Uuid::new_v4()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn check_carries_latest_token_and_user() {
        let user = Uuid::new_v4();
        let tracker = Arc::new(ConsistencyTracker::new());
        tracker.store(ConsistencyToken::new("42"));

        let mut service = MockPermissionService::new();
        service
            .expect_check_permission()
            .times(1)
            .withf(move |req, _| {
                req.consistency == Consistency::AtLeastAsFresh(ConsistencyToken::new("42"))
                    && req.subject == policy::user(user)
                    && req.permission == "read"
                    && req.context.is_none()
            })
            .returning(|_, _| answer(Permissionship::HasPermission));

        checker(service, tracker)
            .check(&AuthzContext::new().as_user(user), "read", &policy::workspace(Uuid::new_v4()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn maps_each_outcome() {
        let cases = [
            (Permissionship::NoPermission, "denied"),
            (Permissionship::Unspecified, "denied"),
            (Permissionship::ConditionalPermission, "conditional"),
        ];
        for (permissionship, expected) in cases {
            let mut service = MockPermissionService::new();
            service
                .expect_check_permission()
                .returning(move |_, _| answer(permissionship));
            let err = checker(service, Arc::new(ConsistencyTracker::new()))
                .check(&AuthzContext::new().as_user(Uuid::new_v4()), "update", &policy::template(Uuid::new_v4()))
                .await
                .unwrap_err();
            match expected {
                "denied" => assert!(matches!(err, AuthzError::Denied { .. }), "{permissionship:?}"),
                _ => assert!(matches!(err, AuthzError::ConditionalDenied { .. })),
            }
        }
    }

    #[tokio::test]
    async fn remote_failure_is_not_a_denial() {
        let mut service = MockPermissionService::new();
        service
            .expect_check_permission()
            .returning(|_, _| Err(Status::unavailable("dial failed")));
        let err = checker(service, Arc::new(ConsistencyTracker::new()))
            .check(&AuthzContext::new().as_user(Uuid::new_v4()), "read", &policy::workspace(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Remote { operation: "check permission", .. }));
        assert!(!err.is_unauthorized());
    }
}
