//! Relationship-based authorization client for a Zanzibar-style permission
//! service.
//!
//! Provides:
//! - Relationship writes that hand back exact compensating deletes, optionally
//!   collected in a [`RevertScope`] for one host operation
//! - Read-your-writes consistency through a shared [`ConsistencyTracker`]
//! - Full-replace upserts of custom organization roles
//! - Permission checks with a bootstrap bypass for process initialization
//! - Streamed relationship reads and per-call debug traces
//!
//! # Core Concepts
//!
//! - **Relationship**: `resource#relation@subject`, e.g.
//!   `org_role:admin#member@user:<id>`
//! - **Consistency token**: opaque revision returned by every write; later
//!   reads and checks ask to be at least that fresh
//! - **Actor**: the subject checks run as, bound on an [`AuthzContext`]
//!
//! # Example
//!
//! ```rust,no_run
//! use auth_rebac::{policy, AuthorizationClient, AuthzContext, AuthzSettings, InMemoryPermissionService};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Arc::new(InMemoryPermissionService::platform());
//!     let (client, bootstrap) = AuthorizationClient::initialize(service, &AuthzSettings::default()).await?;
//!     let setup = AuthzContext::new().as_bootstrap(&bootstrap);
//!
//!     let (org, workspace, alice) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
//!     client
//!         .upsert_role(&setup, "admin", org, |grants| {
//!             grants.grant(policy::grant::WORKSPACE_READ);
//!         })
//!         .await?;
//!     let _ = client
//!         .write(
//!             &setup,
//!             vec![policy::role_member("admin", alice), policy::workspace_organization(workspace, org)],
//!             None,
//!         )
//!         .await?;
//!
//!     let request = AuthzContext::new().as_user(alice);
//!     client.check(&request, "read", &policy::workspace(workspace)).await?;
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod client;
pub mod consistency;
pub mod context;
pub mod debug;
pub mod error;
pub mod models;
pub mod policy;
pub mod query;
pub mod roles;
pub mod schema;
pub mod service;
pub mod settings;
pub mod writer;

pub use check::PermissionChecker;
pub use client::AuthorizationClient;
pub use consistency::ConsistencyTracker;
pub use context::{Actor, AuthzContext, BootstrapGrant};
pub use debug::DebugTracer;
pub use error::{AuthzError, Result};
pub use models::*;
pub use query::RelationshipQuery;
pub use roles::RoleManager;
pub use service::memory::InMemoryPermissionService;
pub use service::{CallMeta, PermissionService, RelationshipStream, Traced};
pub use settings::AuthzSettings;
pub use writer::{RelationshipWriter, RevertAction, RevertScope};
