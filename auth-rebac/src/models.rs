use crate::error::AuthzError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A resource in the relationship graph, e.g. `workspace:dogfood`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: &str, object_id: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// The subject side of a relationship. With `relation` set it names a userset,
/// e.g. `org_role:admin#has_role`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub object: ObjectRef,
    pub relation: Option<String>,
}

impl SubjectRef {
    pub fn new(object: ObjectRef) -> Self {
        Self {
            object,
            relation: None,
        }
    }

    pub fn userset(object: ObjectRef, relation: &str) -> Self {
        Self {
            object,
            relation: Some(relation.to_string()),
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => write!(f, "{}#{}", self.object, relation),
            None => write!(f, "{}", self.object),
        }
    }
}

/// A directed edge: `subject` holds `relation` on `resource`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipTuple {
    pub resource: ObjectRef,
    pub relation: String,
    pub subject: SubjectRef,
    /// Name of a caveat that must hold for the edge to apply.
    pub caveat: Option<String>,
}

impl RelationshipTuple {
    pub fn new(resource: ObjectRef, relation: &str, subject: SubjectRef) -> Self {
        Self {
            resource,
            relation: relation.to_string(),
            subject,
            caveat: None,
        }
    }

    pub fn with_caveat(mut self, caveat: &str) -> Self {
        self.caveat = Some(caveat.to_string());
        self
    }
}

impl fmt::Display for RelationshipTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.resource, self.relation, self.subject)?;
        if let Some(ref caveat) = self.caveat {
            write!(f, "[{caveat}]")?;
        }
        Ok(())
    }
}

fn parse_object(text: &str, whole: &str) -> Result<ObjectRef, AuthzError> {
    match text.split_once(':') {
        Some((object_type, object_id)) if !object_type.is_empty() && !object_id.is_empty() => {
            Ok(ObjectRef::new(object_type, object_id))
        }
        _ => Err(AuthzError::InvalidRelationship(format!(
            "expected type:id in '{whole}', found '{text}'"
        ))),
    }
}

/// Parses `type:id#relation@type:id[#relation][[caveat]]`
impl FromStr for RelationshipTuple {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| AuthzError::InvalidRelationship(format!("{reason} in '{s}'"));

        let (body, caveat) = match s.strip_suffix(']') {
            Some(rest) => {
                let (body, caveat) = rest.split_once('[').ok_or_else(|| invalid("unbalanced caveat"))?;
                if caveat.is_empty() {
                    return Err(invalid("empty caveat"));
                }
                (body, Some(caveat.to_string()))
            }
            None => (s, None),
        };

        let (resource_part, subject_part) = body.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
        let (resource, relation) = resource_part
            .split_once('#')
            .ok_or_else(|| invalid("missing resource relation"))?;
        if relation.is_empty() {
            return Err(invalid("empty relation"));
        }

        let subject = match subject_part.split_once('#') {
            Some((object, subject_relation)) if !subject_relation.is_empty() => {
                SubjectRef::userset(parse_object(object, s)?, subject_relation)
            }
            Some(_) => return Err(invalid("empty subject relation")),
            None => SubjectRef::new(parse_object(subject_part, s)?),
        };

        Ok(Self {
            resource: parse_object(resource, s)?,
            relation: relation.to_string(),
            subject,
            caveat,
        })
    }
}

/// Opaque freshness marker returned by every successful write. Never ordered
/// locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsistencyToken {
    pub token: String,
}

impl ConsistencyToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl fmt::Display for ConsistencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// Freshness requirement attached to reads and checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// No floor: used before any write has been observed.
    MinimizeLatency,
    AtLeastAsFresh(ConsistencyToken),
}

impl From<Option<ConsistencyToken>> for Consistency {
    fn from(token: Option<ConsistencyToken>) -> Self {
        token.map_or(Self::MinimizeLatency, Self::AtLeastAsFresh)
    }
}

/// Matches the subject side of a relationship
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubjectFilter {
    pub subject_type: String,
    pub subject_id: Option<String>,
    /// When set, the subject relation must equal this value.
    pub relation: Option<String>,
}

impl SubjectFilter {
    pub fn matches(&self, subject: &SubjectRef) -> bool {
        if subject.object.object_type != self.subject_type {
            return false;
        }
        if let Some(ref id) = self.subject_id {
            if &subject.object.object_id != id {
                return false;
            }
        }
        match self.relation {
            Some(ref relation) => subject.relation.as_ref() == Some(relation),
            None => true,
        }
    }
}

/// Selects relationships by resource, relation and subject. `None` fields act
/// as wildcards; `resource_type` is always required.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelationshipFilter {
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub resource_id_prefix: Option<String>,
    pub relation: Option<String>,
    pub subject_filter: Option<SubjectFilter>,
}

impl RelationshipFilter {
    pub fn for_resource_type(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            ..Default::default()
        }
    }

    pub fn matches(&self, tuple: &RelationshipTuple) -> bool {
        if tuple.resource.object_type != self.resource_type {
            return false;
        }
        if let Some(ref id) = self.resource_id {
            if &tuple.resource.object_id != id {
                return false;
            }
        }
        if let Some(ref prefix) = self.resource_id_prefix {
            if !tuple.resource.object_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(ref relation) = self.relation {
            if &tuple.relation != relation {
                return false;
            }
        }
        self.subject_filter
            .as_ref()
            .map_or(true, |filter| filter.matches(&tuple.subject))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOperation {
    /// Create or overwrite; never fails on duplicates.
    Touch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub operation: UpdateOperation,
    pub relationship: RelationshipTuple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreconditionOperation {
    MustMatch,
    MustNotMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    pub operation: PreconditionOperation,
    pub filter: RelationshipFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteRelationshipsRequest {
    pub updates: Vec<RelationshipUpdate>,
    pub preconditions: Vec<Precondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRelationshipsResponse {
    pub written_at: ConsistencyToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRelationshipsRequest {
    pub filter: RelationshipFilter,
    pub preconditions: Vec<Precondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRelationshipsResponse {
    pub deleted_at: ConsistencyToken,
    pub deleted_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRelationshipsRequest {
    pub consistency: Consistency,
    pub filter: RelationshipFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPermissionRequest {
    pub consistency: Consistency,
    pub resource: ObjectRef,
    pub permission: String,
    pub subject: SubjectRef,
    /// Caveat context; the client never supplies one.
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permissionship {
    Unspecified,
    NoPermission,
    HasPermission,
    /// Decision depends on caveat context that was not supplied.
    ConditionalPermission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPermissionResponse {
    pub permissionship: Permissionship,
    pub checked_at: ConsistencyToken,
}
