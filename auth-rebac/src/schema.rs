//! Structured schema evaluated by the in-memory permission service.
//!
//! Mirrors [`crate::policy::SCHEMA`]: object definitions with direct relations
//! (and the subject types each accepts) plus computed permissions.

use crate::models::RelationshipTuple;
use crate::policy::{self, grant, relation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Computation rule of a permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rewrite {
    /// Relation or permission of the same name on the same object.
    Computed(String),
    /// Follow `tupleset` to each related object and evaluate `computed` there.
    Arrow { tupleset: String, computed: String },
    Union(Vec<Rewrite>),
    Intersection(Vec<Rewrite>),
}

impl Rewrite {
    pub fn computed(name: &str) -> Self {
        Self::Computed(name.to_string())
    }

    pub fn arrow(tupleset: &str, computed: &str) -> Self {
        Self::Arrow {
            tupleset: tupleset.to_string(),
            computed: computed.to_string(),
        }
    }
}

/// Definition of a relation within an object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    /// Accepted subjects: `type` or `type#relation`.
    pub allowed_subjects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub name: String,
    pub rewrite: Rewrite,
}

/// Definition of an object type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDefinition {
    pub name: String,
    pub relations: Vec<RelationDefinition>,
    pub permissions: Vec<PermissionDefinition>,
}

impl ObjectDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn relation(mut self, name: &str, allowed_subjects: &[&str]) -> Self {
        self.relations.push(RelationDefinition {
            name: name.to_string(),
            allowed_subjects: allowed_subjects.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn permission(mut self, name: &str, rewrite: Rewrite) -> Self {
        self.permissions.push(PermissionDefinition {
            name: name.to_string(),
            rewrite,
        });
        self
    }

    pub fn get_relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn get_permission(&self, name: &str) -> Option<&PermissionDefinition> {
        self.permissions.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub definitions: HashMap<String, ObjectDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(mut self, definition: ObjectDefinition) -> Self {
        self.definitions.insert(definition.name.clone(), definition);
        self
    }

    /// The platform policy: organizations, roles, workspaces and templates.
    pub fn platform() -> Self {
        let role_subject = format!("{}#{}", policy::ORG_ROLE, relation::HAS_ROLE);
        let mut organization =
            ObjectDefinition::new(policy::ORGANIZATION).relation(relation::MEMBER, &[policy::USER]);
        for permission in grant::ALL {
            organization = organization.relation(permission, &[role_subject.as_str()]);
        }

        Self::new()
            .with_definition(ObjectDefinition::new(policy::USER))
            .with_definition(organization)
            .with_definition(
                ObjectDefinition::new(policy::ORG_ROLE)
                    .relation(relation::ORGANIZATION, &[policy::ORGANIZATION])
                    .relation(relation::MEMBER, &[policy::USER])
                    .permission(relation::HAS_ROLE, Rewrite::computed(relation::MEMBER)),
            )
            .with_definition(
                ObjectDefinition::new(policy::WORKSPACE)
                    .relation(relation::ORGANIZATION, &[policy::ORGANIZATION])
                    .relation(relation::OWNER, &[policy::USER])
                    .permission(
                        "read",
                        Rewrite::Union(vec![
                            Rewrite::computed(relation::OWNER),
                            Rewrite::arrow(relation::ORGANIZATION, grant::WORKSPACE_READ),
                        ]),
                    )
                    .permission(
                        "update",
                        Rewrite::Union(vec![
                            Rewrite::computed(relation::OWNER),
                            Rewrite::arrow(relation::ORGANIZATION, grant::WORKSPACE_UPDATE),
                        ]),
                    )
                    .permission(
                        "delete",
                        Rewrite::arrow(relation::ORGANIZATION, grant::WORKSPACE_DELETE),
                    ),
            )
            .with_definition(
                ObjectDefinition::new(policy::TEMPLATE)
                    .relation(relation::ORGANIZATION, &[policy::ORGANIZATION])
                    .permission("read", Rewrite::arrow(relation::ORGANIZATION, grant::TEMPLATE_READ))
                    .permission(
                        "update",
                        Rewrite::arrow(relation::ORGANIZATION, grant::TEMPLATE_UPDATE),
                    ),
            )
    }

    pub fn get_definition(&self, object_type: &str) -> Option<&ObjectDefinition> {
        self.definitions.get(object_type)
    }

    /// Validate that a tuple writes a declared relation with an accepted subject
    pub fn validate_tuple(&self, tuple: &RelationshipTuple) -> Result<(), String> {
        let definition = self
            .get_definition(&tuple.resource.object_type)
            .ok_or_else(|| format!("unknown object type '{}'", tuple.resource.object_type))?;

        let relation = definition.get_relation(&tuple.relation).ok_or_else(|| {
            format!(
                "unknown relation '{}' for object type '{}'",
                tuple.relation, tuple.resource.object_type
            )
        })?;

        let subject_kind = match tuple.subject.relation {
            Some(ref subject_relation) => format!("{}#{}", tuple.subject.object.object_type, subject_relation),
            None => tuple.subject.object.object_type.clone(),
        };
        if !relation.allowed_subjects.iter().any(|s| *s == subject_kind) {
            return Err(format!(
                "subject '{}' is not allowed on {}#{}",
                subject_kind, tuple.resource.object_type, tuple.relation
            ));
        }

        Ok(())
    }

    /// Validate the entire schema is well-formed
    pub fn validate(&self) -> Result<(), String> {
        for (name, definition) in &self.definitions {
            if name != &definition.name {
                return Err(format!(
                    "definition key '{}' doesn't match name '{}'",
                    name, definition.name
                ));
            }
            for permission in &definition.permissions {
                self.validate_rewrite(definition, &permission.rewrite)
                    .map_err(|e| format!("{}#{}: {}", definition.name, permission.name, e))?;
            }
        }
        Ok(())
    }

    fn validate_rewrite(&self, definition: &ObjectDefinition, rewrite: &Rewrite) -> Result<(), String> {
        match rewrite {
            Rewrite::Computed(name) => {
                if definition.get_relation(name).is_none() && definition.get_permission(name).is_none() {
                    return Err(format!("unknown relation or permission '{name}'"));
                }
                Ok(())
            }
            Rewrite::Arrow { tupleset, .. } => {
                if definition.get_relation(tupleset).is_none() {
                    return Err(format!("arrow over unknown relation '{tupleset}'"));
                }
                Ok(())
            }
            Rewrite::Union(children) | Rewrite::Intersection(children) => children
                .iter()
                .try_for_each(|child| self.validate_rewrite(definition, child)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn platform_schema_is_valid() {
        let schema = Schema::platform();
        assert!(schema.validate().is_ok());
        for object_type in [policy::USER, policy::ORGANIZATION, policy::ORG_ROLE, policy::WORKSPACE] {
            assert!(schema.get_definition(object_type).is_some(), "missing {object_type}");
        }
    }

    #[test]
    fn validates_relation_and_subject_kind() {
        let schema = Schema::platform();
        let org = Uuid::new_v4();

        assert!(schema.validate_tuple(&policy::role_grant(org, grant::WORKSPACE_READ, "admin")).is_ok());
        assert!(schema.validate_tuple(&policy::role_member("admin", Uuid::new_v4())).is_ok());

        let unknown_relation = policy::role_grant(org, "launch_missiles", "admin");
        assert!(schema.validate_tuple(&unknown_relation).is_err());

        let wrong_subject: RelationshipTuple =
            format!("organization:{org}#workspace_read@user:{}", Uuid::new_v4()).parse().unwrap();
        assert!(schema.validate_tuple(&wrong_subject).is_err());

        let unknown_type: RelationshipTuple = "folder:f1#viewer@user:u1".parse().unwrap();
        assert!(schema.validate_tuple(&unknown_type).is_err());
    }

    #[test]
    fn rejects_dangling_rewrites() {
        let schema = Schema::new().with_definition(
            ObjectDefinition::new("document")
                .relation("owner", &["user"])
                .permission("view", Rewrite::arrow("parent", "view")),
        );
        assert!(schema.validate().is_err());

        let schema = Schema::new().with_definition(
            ObjectDefinition::new("document")
                .relation("owner", &["user"])
                .permission(
                    "view",
                    Rewrite::Intersection(vec![Rewrite::computed("owner"), Rewrite::computed("editor")]),
                ),
        );
        assert!(schema.validate().is_err());
    }
}
