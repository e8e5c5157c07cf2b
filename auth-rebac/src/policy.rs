//! Object types, relation names and tuple constructors for the platform policy.
//!
//! Every constructor is a pure function returning an immutable tuple; the
//! policy schema itself is an opaque artifact pushed to the permission service
//! at startup ([`SCHEMA`]).

use crate::models::{ObjectRef, RelationshipFilter, RelationshipTuple, SubjectFilter, SubjectRef};
use uuid::Uuid;

pub const USER: &str = "user";
pub const ORGANIZATION: &str = "organization";
pub const ORG_ROLE: &str = "org_role";
pub const WORKSPACE: &str = "workspace";
pub const TEMPLATE: &str = "template";

/// Relation names
pub mod relation {
    pub const MEMBER: &str = "member";
    pub const ORGANIZATION: &str = "organization";
    pub const OWNER: &str = "owner";
    /// Computed on `org_role` from its members; the subject relation of every
    /// permission granted by a role.
    pub const HAS_ROLE: &str = "has_role";
}

/// Organization relations a role may grant
pub mod grant {
    pub const WORKSPACE_READ: &str = "workspace_read";
    pub const WORKSPACE_UPDATE: &str = "workspace_update";
    pub const WORKSPACE_DELETE: &str = "workspace_delete";
    pub const TEMPLATE_READ: &str = "template_read";
    pub const TEMPLATE_UPDATE: &str = "template_update";

    pub const ALL: [&str; 5] = [
        WORKSPACE_READ,
        WORKSPACE_UPDATE,
        WORKSPACE_DELETE,
        TEMPLATE_READ,
        TEMPLATE_UPDATE,
    ];
}

/// Schema pushed to the permission service when the client starts.
pub const SCHEMA: &str = r"definition user {}

definition organization {
    relation member: user
    relation workspace_read: org_role#has_role
    relation workspace_update: org_role#has_role
    relation workspace_delete: org_role#has_role
    relation template_read: org_role#has_role
    relation template_update: org_role#has_role
}

definition org_role {
    relation organization: organization
    relation member: user
    permission has_role = member
}

definition workspace {
    relation organization: organization
    relation owner: user
    permission read = owner + organization->workspace_read
    permission update = owner + organization->workspace_update
    permission delete = organization->workspace_delete
}

definition template {
    relation organization: organization
    permission read = organization->template_read
    permission update = organization->template_update
}
";

pub fn user(id: Uuid) -> SubjectRef {
    SubjectRef::new(ObjectRef::new(USER, &id.to_string()))
}

pub fn organization(id: Uuid) -> ObjectRef {
    ObjectRef::new(ORGANIZATION, &id.to_string())
}

/// Role names are not scoped by organization: two organizations using the
/// same name share one `org_role` object.
pub fn org_role(name: &str) -> ObjectRef {
    ObjectRef::new(ORG_ROLE, name)
}

pub fn workspace(id: Uuid) -> ObjectRef {
    ObjectRef::new(WORKSPACE, &id.to_string())
}

pub fn template(id: Uuid) -> ObjectRef {
    ObjectRef::new(TEMPLATE, &id.to_string())
}

/// `org_role:<role>#organization@organization:<org>`
pub fn role_organization(role: &str, org_id: Uuid) -> RelationshipTuple {
    RelationshipTuple::new(
        org_role(role),
        relation::ORGANIZATION,
        SubjectRef::new(organization(org_id)),
    )
}

/// `org_role:<role>#member@user:<user>`
pub fn role_member(role: &str, user_id: Uuid) -> RelationshipTuple {
    RelationshipTuple::new(org_role(role), relation::MEMBER, user(user_id))
}

/// `organization:<org>#<permission>@org_role:<role>#has_role`
pub fn role_grant(org_id: Uuid, permission: &str, role: &str) -> RelationshipTuple {
    RelationshipTuple::new(
        organization(org_id),
        permission,
        SubjectRef::userset(org_role(role), relation::HAS_ROLE),
    )
}

/// `workspace:<ws>#organization@organization:<org>`
pub fn workspace_organization(workspace_id: Uuid, org_id: Uuid) -> RelationshipTuple {
    RelationshipTuple::new(
        workspace(workspace_id),
        relation::ORGANIZATION,
        SubjectRef::new(organization(org_id)),
    )
}

/// `workspace:<ws>#owner@user:<user>`
pub fn workspace_owner(workspace_id: Uuid, user_id: Uuid) -> RelationshipTuple {
    RelationshipTuple::new(workspace(workspace_id), relation::OWNER, user(user_id))
}

/// `template:<tpl>#organization@organization:<org>`
pub fn template_organization(template_id: Uuid, org_id: Uuid) -> RelationshipTuple {
    RelationshipTuple::new(
        template(template_id),
        relation::ORGANIZATION,
        SubjectRef::new(organization(org_id)),
    )
}

/// Every permission relation from `role` to `org`, whatever the relation name.
/// Actor membership lives on the role object and is never selected.
pub fn role_permissions_filter(role: &str, org_id: Uuid) -> RelationshipFilter {
    RelationshipFilter {
        resource_type: ORGANIZATION.to_string(),
        resource_id: Some(org_id.to_string()),
        resource_id_prefix: None,
        relation: None,
        subject_filter: Some(SubjectFilter {
            subject_type: ORG_ROLE.to_string(),
            subject_id: Some(role.to_string()),
            relation: Some(relation::HAS_ROLE.to_string()),
        }),
    }
}

pub fn role_members_filter(role: &str) -> RelationshipFilter {
    RelationshipFilter {
        resource_id: Some(role.to_string()),
        relation: Some(relation::MEMBER.to_string()),
        ..RelationshipFilter::for_resource_type(ORG_ROLE)
    }
}

/// Collects the permissions a role grants inside one organization.
///
/// Handed to the `assign` step of a role upsert; every call to [`grant`]
/// produces one `organization#<permission>@org_role#has_role` tuple.
///
/// [`grant`]: RoleGrants::grant
#[derive(Debug)]
pub struct RoleGrants {
    role: String,
    org_id: Uuid,
    tuples: Vec<RelationshipTuple>,
}

impl RoleGrants {
    pub fn new(role: &str, org_id: Uuid) -> Self {
        Self {
            role: role.to_string(),
            org_id,
            tuples: Vec::new(),
        }
    }

    pub fn role(&self) -> ObjectRef {
        org_role(&self.role)
    }

    pub fn organization(&self) -> ObjectRef {
        organization(self.org_id)
    }

    /// Adds `permission` once; granting it again has no effect.
    pub fn grant(&mut self, permission: &str) -> &mut Self {
        if !self.tuples.iter().any(|tuple| tuple.relation == permission) {
            self.tuples.push(role_grant(self.org_id, permission, &self.role));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Membership tuple binding the role to its organization, followed by
    /// every granted permission.
    pub fn into_relationships(self) -> Vec<RelationshipTuple> {
        let mut relationships = Vec::with_capacity(self.tuples.len() + 1);
        relationships.push(role_organization(&self.role, self.org_id));
        relationships.extend(self.tuples);
        relationships
    }
}
