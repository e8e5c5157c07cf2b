use crate::check::PermissionChecker;
use crate::consistency::ConsistencyTracker;
use crate::context::{AuthzContext, BootstrapGrant};
use crate::debug::DebugTracer;
use crate::error::{AuthzError, Result};
use crate::models::*;
use crate::policy::RoleGrants;
use crate::query::RelationshipQuery;
use crate::roles::RoleManager;
use crate::service::PermissionService;
use crate::settings::AuthzSettings;
use crate::writer::{RelationshipWriter, RevertAction, RevertScope};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Authorization client: one per process, shared by every request.
///
/// Owns the consistency tracker, so everything issued through one client sees
/// its own writes.
pub struct AuthorizationClient {
    tracker: Arc<ConsistencyTracker>,
    tracer: Arc<DebugTracer>,
    writer: Arc<RelationshipWriter>,
    roles: RoleManager,
    checker: PermissionChecker,
    query: RelationshipQuery,
}

impl AuthorizationClient {
    /// Pushes the schema and returns the client together with the bootstrap
    /// capability for process initialization.
    pub async fn initialize(
        service: Arc<dyn PermissionService>,
        settings: &AuthzSettings,
    ) -> Result<(Self, BootstrapGrant)> {
        let tracker = Arc::new(ConsistencyTracker::new());
        let tracer = Arc::new(DebugTracer::new(settings.debug));

        let schema = settings.schema_text()?;
        let meta = tracer.call_meta(&AuthzContext::new());
        let response = service
            .write_schema(schema, meta)
            .await
            .map_err(|e| AuthzError::remote("write schema", e))?;
        tracer.observe(meta, "write schema", &response.trailers);
        info!(
            written_at = %response.value,
            endpoint = settings.endpoint.as_deref().unwrap_or("in-process"),
            debug = settings.debug,
            "authorization schema written"
        );
        tracker.store(response.value);

        let writer = Arc::new(RelationshipWriter::new(service.clone(), tracker.clone(), tracer.clone()));
        let client = Self {
            roles: RoleManager::new(writer.clone()),
            checker: PermissionChecker::new(service.clone(), tracker.clone(), tracer.clone()),
            query: RelationshipQuery::new(service, tracker.clone(), tracer.clone()),
            writer,
            tracker,
            tracer,
        };
        Ok((client, BootstrapGrant::new()))
    }

    pub fn writer(&self) -> &Arc<RelationshipWriter> {
        &self.writer
    }

    pub fn roles(&self) -> &RoleManager {
        &self.roles
    }

    pub fn checker(&self) -> &PermissionChecker {
        &self.checker
    }

    pub fn query(&self) -> &RelationshipQuery {
        &self.query
    }

    /// Newest token observed by this client.
    pub fn consistency(&self) -> Option<ConsistencyToken> {
        self.tracker.load()
    }

    /// Toggles debug information for every call, in addition to contexts
    /// that ask for it.
    pub fn set_debugging(&self, enabled: bool) {
        self.tracer.set_enabled(enabled);
    }

    pub async fn write(
        &self,
        ctx: &AuthzContext,
        relationships: Vec<RelationshipTuple>,
        scope: Option<&RevertScope>,
    ) -> Result<RevertAction> {
        self.writer.write(ctx, relationships, scope).await
    }

    pub async fn check(&self, ctx: &AuthzContext, permission: &str, resource: &ObjectRef) -> Result<()> {
        self.checker.check(ctx, permission, resource).await
    }

    pub async fn upsert_role<F>(&self, ctx: &AuthzContext, role_name: &str, org_id: Uuid, assign: F) -> Result<()>
    where
        F: FnOnce(&mut RoleGrants),
    {
        self.roles.upsert_role(ctx, role_name, org_id, assign).await
    }

    pub async fn list_role_members(&self, ctx: &AuthzContext, role_name: &str) -> Result<Vec<String>> {
        self.query.list_role_members(ctx, role_name).await
    }

    pub async fn list_role_permissions(&self, ctx: &AuthzContext, role_name: &str, org_id: Uuid) -> Result<Vec<String>> {
        self.query.list_role_permissions(ctx, role_name, org_id).await
    }

    pub async fn read_relationships(
        &self,
        ctx: &AuthzContext,
        filter: RelationshipFilter,
    ) -> Result<Vec<RelationshipTuple>> {
        self.query.read_relationships(ctx, filter).await
    }
}
