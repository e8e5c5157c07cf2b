use crate::models::ObjectRef;
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum AuthzError {
    /// No actor bound to the context. Reported to API callers as "not found" so
    /// unauthenticated callers cannot learn whether a resource exists.
    #[error("no authorization actor in context")]
    NoActor,

    #[error("not authorized: {permission} on {resource}")]
    Denied {
        permission: String,
        resource: ObjectRef,
    },

    #[error("not authorized: conditional permission {permission} on {resource}")]
    ConditionalDenied {
        permission: String,
        resource: ObjectRef,
    },

    #[error("{operation}: {source}")]
    Remote {
        operation: &'static str,
        #[source]
        source: Status,
    },

    #[error("{operation}: stream interrupted: {source}")]
    Stream {
        operation: &'static str,
        #[source]
        source: Status,
    },

    #[error("{operation}: deadline exceeded")]
    DeadlineExceeded { operation: &'static str },

    #[error("Invalid relationship: {0}")]
    InvalidRelationship(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Schema error: {0}")]
    Schema(#[source] std::io::Error),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
}

impl AuthzError {
    pub(crate) fn remote(operation: &'static str, source: Status) -> Self {
        Self::Remote { operation, source }
    }

    /// True when the error must look like a missing resource at the API boundary.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoActor)
    }

    /// True for plain and conditional denials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Denied { .. } | Self::ConditionalDenied { .. })
    }
}

impl From<AuthzError> for Status {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::NoActor => Status::not_found("resource not found"),
            AuthzError::Denied { .. } | AuthzError::ConditionalDenied { .. } => {
                Status::permission_denied(err.to_string())
            }
            AuthzError::Remote { operation, source } | AuthzError::Stream { operation, source } => {
                Status::new(source.code(), format!("{operation}: {}", source.message()))
            }
            AuthzError::DeadlineExceeded { .. } => Status::deadline_exceeded(err.to_string()),
            AuthzError::InvalidRelationship(_) | AuthzError::InvalidSchema(_) => {
                Status::invalid_argument(err.to_string())
            }
            AuthzError::Config(_) | AuthzError::Schema(_) => Status::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthzError>;
