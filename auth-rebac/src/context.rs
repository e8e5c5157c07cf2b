use crate::error::{AuthzError, Result};
use crate::models::SubjectRef;
use crate::policy;
use std::future::Future;
use tokio::time::Instant;
use uuid::Uuid;

/// The subject a permission check runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Privileged sentinel that bypasses every check. Only reachable through a
    /// [`BootstrapGrant`].
    Bootstrap,
    User(Uuid),
}

impl Actor {
    /// Subject reference sent to the permission service. The bootstrap actor
    /// never reaches the service, so it has none.
    pub fn subject(&self) -> Option<SubjectRef> {
        match self {
            Self::Bootstrap => None,
            Self::User(id) => Some(policy::user(*id)),
        }
    }
}

/// Capability to act as the bootstrap actor.
///
/// Produced only by [`crate::AuthorizationClient::initialize`] so that
/// process-initialization code (seeding the first user, creating the first
/// protected resources) can run before any policy exists. It cannot be built
/// from request input.
#[derive(Debug)]
pub struct BootstrapGrant {
    _private: (),
}

impl BootstrapGrant {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Per-operation authorization context: the bound actor, whether debug traces
/// are requested, and an optional deadline for every remote call.
#[derive(Debug, Clone, Default)]
pub struct AuthzContext {
    actor: Option<Actor>,
    debug: bool,
    deadline: Option<Instant>,
}

impl AuthzContext {
    /// Context with no actor bound.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_user(mut self, user_id: Uuid) -> Self {
        self.actor = Some(Actor::User(user_id));
        self
    }

    pub fn as_bootstrap(mut self, _grant: &BootstrapGrant) -> Self {
        self.actor = Some(Actor::Bootstrap);
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Same context without the deadline. Compensating deletes run this way so
    /// an expired host deadline does not also cancel the cleanup.
    pub(crate) fn without_deadline(&self) -> Self {
        Self {
            deadline: None,
            ..self.clone()
        }
    }

    /// Runs `fut` bounded by the context deadline, if any.
    pub(crate) async fn bounded<T>(&self, operation: &'static str, fut: impl Future<Output = T>) -> Result<T> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| AuthzError::DeadlineExceeded { operation }),
            None => Ok(fut.await),
        }
    }
}
