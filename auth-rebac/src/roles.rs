use crate::context::AuthzContext;
use crate::error::Result;
use crate::policy::{self, RoleGrants};
use crate::writer::RelationshipWriter;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Custom organization roles
pub struct RoleManager {
    writer: Arc<RelationshipWriter>,
}

impl RoleManager {
    pub fn new(writer: Arc<RelationshipWriter>) -> Self {
        Self { writer }
    }

    /// Replaces every permission `role_name` grants in `org_id` with the ones
    /// `assign` adds.
    ///
    /// Runs as two remote calls: delete all of the role's permission
    /// relationships in the organization, then write the membership tuple plus
    /// the new grants as one batch. Actor memberships of the role are kept.
    /// If the delete fails nothing is written. If the write fails the role is
    /// left with no permissions and the error is returned.
    pub async fn upsert_role<F>(&self, ctx: &AuthzContext, role_name: &str, org_id: Uuid, assign: F) -> Result<()>
    where
        F: FnOnce(&mut RoleGrants),
    {
        let mut grants = RoleGrants::new(role_name, org_id);
        assign(&mut grants);
        let granted = grants.len();

        let removed = self
            .writer
            .delete_matching(ctx, policy::role_permissions_filter(role_name, org_id))
            .await?;

        // Upserts are not compensated.
        let _ = self.writer.write(ctx, grants.into_relationships(), None).await?;

        info!(role = role_name, %org_id, removed, granted, "upserted role");
        Ok(())
    }
}
