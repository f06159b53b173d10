//! Authorization engine for graph reads and mutations
//!
//! Evaluates a [`RequestContext`] against the fixed permission vocabulary to
//! produce an effective permission set for reads, and an allow/deny decision
//! with a reason for mutations. The permission set doubles as the policy
//! fingerprint input for export cache tokens, so it is kept as an ordered
//! set (see [`crate::export`]).
//!
//! Resolution is purely a function of the context plus the legacy
//! passthrough flag; nothing here touches the database.

use crate::types::{AuthType, RequestContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Graph permission vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// See graph topology (nodes and links)
    GraphView,
    /// See non-sensitive observation content
    ObservationsView,
    /// See agent-internal ("sensitive") observation content
    SensitiveView,
}

impl Permission {
    /// Wire/scope spelling of the permission
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::GraphView => "graph:view",
            Permission::ObservationsView => "graph:observations:view",
            Permission::SensitiveView => "graph:sensitive:view",
        }
    }
}

/// Effective read permissions for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAuthorization {
    pub authorized: bool,
    pub permissions: BTreeSet<Permission>,
}

impl ReadAuthorization {
    fn denied() -> Self {
        Self {
            authorized: false,
            permissions: BTreeSet::new(),
        }
    }

    fn granted(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            authorized: true,
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Check membership in the effective set
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Allow/deny decision for a mutation, with the reason callers see on deny
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationDecision {
    pub authorized: bool,
    pub reason: String,
}

fn all_permissions() -> [Permission; 3] {
    [
        Permission::GraphView,
        Permission::ObservationsView,
        Permission::SensitiveView,
    ]
}

/// Resolve the effective read permission set for a request context
///
/// `legacy_passthrough` enables the backward-compatibility escape hatch for
/// API keys with an empty scope list; every use is logged.
pub fn authorize_read(context: &RequestContext, legacy_passthrough: bool) -> ReadAuthorization {
    match context.auth_type {
        AuthType::Dev => ReadAuthorization::granted(all_permissions()),

        AuthType::Jwt => {
            let has_role = |r: &str| context.roles.iter().any(|role| role == r);
            if has_role("admin") || has_role("owner") {
                ReadAuthorization::granted(all_permissions())
            } else if has_role("member") {
                ReadAuthorization::granted([Permission::GraphView, Permission::ObservationsView])
            } else if has_role("viewer") {
                ReadAuthorization::granted([Permission::GraphView])
            } else {
                ReadAuthorization::denied()
            }
        }

        AuthType::ApiKey => {
            let has_scope = |s: &str| context.scopes.iter().any(|scope| scope == s);
            if has_scope("*") || has_scope("graph:write") {
                ReadAuthorization::granted(all_permissions())
            } else if has_scope("graph:read") {
                ReadAuthorization::granted([Permission::GraphView, Permission::ObservationsView])
            } else if has_scope("graph:view") {
                ReadAuthorization::granted([Permission::GraphView])
            } else if context.scopes.is_empty() && legacy_passthrough {
                warn!(
                    api_key_id = context.api_key_id.as_deref().unwrap_or("unknown"),
                    tenant_id = %context.tenant_id,
                    "legacy passthrough granted full read permissions to unscoped API key"
                );
                ReadAuthorization::granted(all_permissions())
            } else {
                ReadAuthorization::denied()
            }
        }
    }
}

/// Decide whether this context may mutate the graph
///
/// Stricter than reads: only the dev bypass, write-scoped API keys (or the
/// logged legacy passthrough), and admin/owner JWTs may mutate.
pub fn authorize_mutation(
    action: &str,
    context: &RequestContext,
    legacy_passthrough: bool,
) -> MutationDecision {
    let allow = MutationDecision {
        authorized: true,
        reason: String::new(),
    };

    match context.auth_type {
        AuthType::Dev => allow,

        AuthType::ApiKey => {
            let has_scope = |s: &str| context.scopes.iter().any(|scope| scope == s);
            if has_scope("*") || has_scope("graph:write") {
                allow
            } else if context.scopes.is_empty() && legacy_passthrough {
                warn!(
                    api_key_id = context.api_key_id.as_deref().unwrap_or("unknown"),
                    tenant_id = %context.tenant_id,
                    action,
                    "legacy passthrough granted mutation to unscoped API key"
                );
                allow
            } else {
                MutationDecision {
                    authorized: false,
                    reason: format!("API key lacks graph:write scope for '{}'", action),
                }
            }
        }

        AuthType::Jwt => {
            let has_role = |r: &str| context.roles.iter().any(|role| role == r);
            if has_role("admin") || has_role("owner") {
                allow
            } else {
                MutationDecision {
                    authorized: false,
                    reason: format!("role does not permit mutation '{}'", action),
                }
            }
        }
    }
}
