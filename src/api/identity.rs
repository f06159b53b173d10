//! Request identity extraction
//!
//! The engine never verifies credentials itself: the external auth
//! collaborator terminates authentication and forwards the verified identity
//! in trusted `x-mnemo-*` headers. This module rebuilds the
//! [`RequestContext`] from those headers, fresh on every call. Caller-
//! supplied body or query fields are never consulted for identity.

use crate::config::AuthConfig;
use crate::error::{MnemographError, Result};
use crate::types::{AuthType, RequestContext};
use axum::http::HeaderMap;

/// Extractor wrapper for the verified request context; the
/// `FromRequestParts` impl lives next to the app state in the server module
pub struct Identity(pub RequestContext);

pub const TENANT_HEADER: &str = "x-mnemo-tenant";
pub const USER_HEADER: &str = "x-mnemo-user";
pub const AUTH_TYPE_HEADER: &str = "x-mnemo-auth-type";
pub const API_KEY_ID_HEADER: &str = "x-mnemo-api-key-id";
pub const ROLES_HEADER: &str = "x-mnemo-roles";
pub const SCOPES_HEADER: &str = "x-mnemo-scopes";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn csv_header(headers: &HeaderMap, name: &str) -> Vec<String> {
    header(headers, name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Build the per-request identity from upstream headers.
///
/// Missing identity is Unauthorized unless dev mode is enabled, in which
/// case a local dev context is synthesized.
pub fn context_from_headers(headers: &HeaderMap, auth: &AuthConfig) -> Result<RequestContext> {
    let (tenant_id, user_id, auth_type) = match (
        header(headers, TENANT_HEADER),
        header(headers, USER_HEADER),
        header(headers, AUTH_TYPE_HEADER),
    ) {
        (Some(tenant), Some(user), Some(auth_type)) => (tenant, user, auth_type),
        _ => {
            if auth.dev_mode {
                return Ok(RequestContext::dev(&auth.dev_tenant, &auth.dev_user));
            }
            return Err(MnemographError::Unauthorized(
                "missing identity headers".to_string(),
            ));
        }
    };

    let auth_type = match auth_type {
        "dev" => AuthType::Dev,
        "api_key" => AuthType::ApiKey,
        "jwt" => AuthType::Jwt,
        other => {
            return Err(MnemographError::Unauthorized(format!(
                "unknown auth type '{}'",
                other
            )))
        }
    };

    Ok(RequestContext {
        tenant_id: tenant_id.to_string(),
        user_id: user_id.to_string(),
        auth_type,
        api_key_id: header(headers, API_KEY_ID_HEADER).map(String::from),
        roles: csv_header(headers, ROLES_HEADER),
        scopes: csv_header(headers, SCOPES_HEADER),
    })
}
