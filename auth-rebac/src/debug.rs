//! Diagnostic tracing of calls to the permission service.
//!
//! When debugging is on for a call, the request asks the service for debug
//! information and the response trailers are parsed into operation counters
//! and an optional check trace, which is rendered as a tree and logged. All of
//! it is observational: parse problems are logged at DEBUG and never change the
//! outcome of the call.

use crate::context::AuthzContext;
use crate::models::Permissionship;
use crate::service::CallMeta;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tonic::metadata::MetadataMap;
use tracing::debug;

/// Request header asking the service to attach debug trailers.
pub const REQUEST_DEBUG_INFORMATION: &str = "io.spicedb.requestdebuginfo";
pub const CACHED_OPERATIONS_COUNT: &str = "io.spicedb.respmeta.cachedoperationscount";
pub const DISPATCHED_OPERATIONS_COUNT: &str = "io.spicedb.respmeta.dispatchedoperationscount";
/// JSON encoded [`DebugInformation`]; only present on permission checks.
pub const DEBUG_INFORMATION: &str = "io.spicedb.respmeta.debuginformation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInformation {
    #[serde(default)]
    pub check: Option<CheckDebugTrace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionType {
    Relation,
    Permission,
}

/// One step of a permission check as evaluated by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDebugTrace {
    pub resource: String,
    pub permission: String,
    pub permission_type: PermissionType,
    pub subject: String,
    pub result: Permissionship,
    #[serde(default)]
    pub was_cached_result: bool,
    #[serde(default)]
    pub sub_problems: Vec<CheckDebugTrace>,
}

#[derive(Error, Debug)]
pub enum DebugParseError {
    #[error("unable to decode debug information: {0}")]
    Malformed(String),

    #[error("no trace found for the check")]
    MissingCheck,
}

/// Indented tree rendering used for check traces
#[derive(Debug, Default)]
pub struct TreePrinter {
    text: Option<String>,
    children: Vec<TreePrinter>,
}

impl TreePrinter {
    /// Root without text of its own.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            children: Vec::new(),
        }
    }

    pub fn push(&mut self, child: TreePrinter) -> &mut Self {
        self.children.push(child);
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(ref text) = self.text {
            out.push_str(text);
            out.push('\n');
        }
        Self::render_children(&self.children, "", &mut out);
        out
    }

    fn render_children(children: &[TreePrinter], prefix: &str, out: &mut String) {
        let count = children.len();
        for (index, child) in children.iter().enumerate() {
            let last = index + 1 == count;
            out.push_str(prefix);
            out.push_str(if last { "└── " } else { "├── " });
            out.push_str(child.text.as_deref().unwrap_or_default());
            out.push('\n');
            let nested = format!("{prefix}{}", if last { "    " } else { "│   " });
            Self::render_children(&child.children, &nested, out);
        }
    }
}

/// Tree node for `trace` and, recursively, its sub-problems.
pub fn check_trace_node(trace: &CheckDebugTrace) -> TreePrinter {
    let icon = match trace.result {
        Permissionship::HasPermission => "✓",
        Permissionship::ConditionalPermission => "?",
        Permissionship::NoPermission | Permissionship::Unspecified => "⨉",
    };
    let kind = match trace.permission_type {
        PermissionType::Relation => "relation",
        PermissionType::Permission => "permission",
    };
    let cached = if trace.was_cached_result { " (cached)" } else { "" };
    let mut node = TreePrinter::node(format!(
        "{icon} {} {} ({kind}) for {}{cached}",
        trace.resource, trace.permission, trace.subject
    ));
    for sub in &trace.sub_problems {
        node.push(check_trace_node(sub));
    }
    node
}

/// Parsed response trailers of one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugSummary {
    pub cached_operations: Option<u64>,
    pub dispatched_operations: Option<u64>,
    /// Rendered check trace, present for permission checks.
    pub trace: Option<String>,
}

impl DebugSummary {
    /// `Ok(None)` when the service sent no trailers at all.
    pub fn from_trailers(trailers: &MetadataMap) -> Result<Option<Self>, DebugParseError> {
        if trailers.is_empty() {
            return Ok(None);
        }

        let mut summary = Self {
            cached_operations: trailer_count(trailers, CACHED_OPERATIONS_COUNT),
            dispatched_operations: trailer_count(trailers, DISPATCHED_OPERATIONS_COUNT),
            trace: None,
        };

        if let Some(value) = trailers.get(DEBUG_INFORMATION) {
            let raw = value
                .to_str()
                .map_err(|e| DebugParseError::Malformed(e.to_string()))?;
            let info: DebugInformation =
                serde_json::from_str(raw).map_err(|e| DebugParseError::Malformed(e.to_string()))?;
            let check = info.check.ok_or(DebugParseError::MissingCheck)?;
            let mut printer = TreePrinter::new();
            printer.push(check_trace_node(&check));
            summary.trace = Some(printer.render());
        }

        Ok(Some(summary))
    }
}

fn trailer_count(trailers: &MetadataMap, key: &str) -> Option<u64> {
    trailers.get(key)?.to_str().ok()?.parse().ok()
}

/// Decides which calls carry debug requests and logs what comes back.
#[derive(Debug, Default)]
pub struct DebugTracer {
    enabled: AtomicBool,
    last: Mutex<Option<DebugSummary>>,
}

impl DebugTracer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            last: Mutex::new(None),
        }
    }

    /// Summary of the most recent call that returned debug trailers.
    pub fn last_summary(&self) -> Option<DebugSummary> {
        self.last.lock().clone()
    }

    /// Client-wide toggle; a context can still opt in on its own.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn call_meta(&self, ctx: &AuthzContext) -> CallMeta {
        CallMeta {
            debug: ctx.debug() || self.is_enabled(),
        }
    }

    /// Logs the debug trailers of a finished call. Never fails.
    pub fn observe(&self, meta: CallMeta, operation: &'static str, trailers: &MetadataMap) {
        if !meta.debug {
            return;
        }
        match DebugSummary::from_trailers(trailers) {
            Ok(Some(summary)) => {
                let message = summary.trace.as_deref().unwrap_or("debug rpc");
                debug!(
                    operation,
                    cached_operations_count = summary.cached_operations,
                    dispatched_operations_count = summary.dispatched_operations,
                    "{message}"
                );
                *self.last.lock() = Some(summary);
            }
            Ok(None) => {}
            Err(e) => debug!(operation, error = %e, "debug rpc failed"),
        }
    }
}
