//! HTTP API server
//!
//! Thin transport over the engines: handlers extract the verified identity,
//! delegate to the export/context/mutation engines, and map engine errors to
//! HTTP statuses. Dependency degradation never surfaces as a status code;
//! it is visible only in response counters.

use super::identity::{self, Identity};
use crate::config::AuthConfig;
use crate::context::{ContextAssembler, SessionContextRequest};
use crate::error::MnemographError;
use crate::export::{ExportEngine, ExportQuery};
use crate::mutation::{
    AddObservationsRequest, CloseSessionRequest, CreateEntitiesRequest, CreateRelationsRequest,
    DeleteEntityRequest, MutationEngine, RemoveObservationsRequest, SendMessageRequest,
    UpdateObservationRequest,
};
use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 7690).into(),
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub export: Arc<ExportEngine>,
    pub assembler: Arc<ContextAssembler>,
    pub mutations: Arc<MutationEngine>,
    pub auth: AuthConfig,
}

/// Engine error mapped to an HTTP response
pub struct ApiError(MnemographError);

impl From<MnemographError> for ApiError {
    fn from(err: MnemographError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MnemographError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            MnemographError::Forbidden(_) => StatusCode::FORBIDDEN,
            MnemographError::NotFound(_) => StatusCode::NOT_FOUND,
            MnemographError::Validation(_) | MnemographError::InvalidRecordId(_) => {
                StatusCode::BAD_REQUEST
            }
            MnemographError::ContentRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        identity::context_from_headers(&parts.headers, &state.auth)
            .map(Identity)
            .map_err(ApiError::from)
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            // Reads
            .route("/graph-export", get(graph_export_handler))
            // Graph mutations
            .route("/entities", post(create_entities_handler))
            .route("/observations", post(add_observations_handler))
            .route("/relations", post(create_relations_handler))
            .route("/entities/delete", post(delete_entity_handler))
            .route("/observations/remove", post(remove_observations_handler))
            .route("/observations/update", post(update_observation_handler))
            // Messaging and session lifecycle
            .route("/messages", post(send_message_handler))
            .route("/session/open", post(open_session_handler))
            .route("/session/close", post(close_session_handler))
            // Health check
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let router = Self::build_router(self.state);

        let listener = tokio::net::TcpListener::bind(self.config.addr).await?;
        info!("API server listening on http://{}", self.config.addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

const CACHE_CONTROL_VALUE: &str = "private, max-age=30";

/// Does an If-None-Match header value match this (unquoted) token?
fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_matches('"') == etag)
}

fn with_cache_headers(mut response: Response, etag: &str) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_VALUE),
    );
    response
}

/// Graph export with conditional-request support. The ETag is the
/// policy-fingerprinted cache token, so it differs between callers with
/// different effective permissions even over identical data.
async fn graph_export_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Query(query): Query<ExportQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let outcome = state.export.export(&context, &query).await?;

    if let Some(if_none_match) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    {
        if etag_matches(if_none_match, &outcome.etag) {
            let response = StatusCode::NOT_MODIFIED.into_response();
            return Ok(with_cache_headers(response, &outcome.etag));
        }
    }

    let response = (StatusCode::OK, Json(outcome.body)).into_response();
    Ok(with_cache_headers(response, &outcome.etag))
}

async fn create_entities_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<CreateEntitiesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.mutations.create_entities(&context, &request).await?;
    Ok(Json(response))
}

async fn add_observations_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<AddObservationsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.mutations.add_observations(&context, &request).await?;
    Ok(Json(response))
}

async fn create_relations_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<CreateRelationsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.mutations.create_relations(&context, &request).await?;
    Ok(Json(response))
}

async fn delete_entity_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<DeleteEntityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.mutations.delete_entity(&context, &request).await?;
    Ok(Json(response))
}

async fn remove_observations_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<RemoveObservationsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .mutations
        .remove_observations(&context, &request)
        .await?;
    Ok(Json(response))
}

async fn update_observation_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<UpdateObservationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .mutations
        .update_observation(&context, &request)
        .await?;
    Ok(Json(response))
}

async fn send_message_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.mutations.send_message(&context, &request).await?;
    Ok(Json(response))
}

/// Session open assembles context and consumes the pending hand-off, so it
/// is a POST despite being read-heavy
async fn open_session_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<SessionContextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state.assembler.assemble(&context, &request).await?;
    Ok(Json(bundle))
}

async fn close_session_handler(
    State(state): State<AppState>,
    Identity(context): Identity,
    Json(request): Json<CloseSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.mutations.close_session(&context, &request).await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_matching() {
        assert!(etag_matches("\"abc\"", "abc"));
        assert!(etag_matches("abc", "abc"));
        assert!(etag_matches("\"xyz\", \"abc\"", "abc"));
        assert!(etag_matches("*", "abc"));
        assert!(!etag_matches("\"abcd\"", "abc"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = health_handler().await;
        assert_eq!(response.0.status, "ok");
        assert!(!response.0.version.is_empty());
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                MnemographError::Unauthorized("x".into()),
                StatusCode::UNAUTHORIZED,
            ),
            (
                MnemographError::Forbidden("x".into()),
                StatusCode::FORBIDDEN,
            ),
            (MnemographError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                MnemographError::Validation("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                MnemographError::ContentRejected("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                MnemographError::Database("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
