//! Graph export engine
//!
//! Produces paginated, permission-filtered graph snapshots and the
//! policy-fingerprinted cache token served as the HTTP ETag. Topology shape
//! never varies with permissions; permissions only decide which observations
//! are visible. Full-mode and entity-scoped responses are distinct shapes, a
//! closed set modeled by [`ExportBody`].

use crate::auth::{authorize_read, Permission, ReadAuthorization};
use crate::error::{MnemographError, Result};
use crate::sensitivity;
use crate::storage::{MemoryStore, PageCursor};
use crate::types::{MemoryRecord, RecordId, RecordKind, RecordPayload, RequestContext};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Page size when the caller does not specify one
pub const DEFAULT_EXPORT_LIMIT: u32 = 200;
/// Hard page-size ceiling; larger requests are validation errors
pub const MAX_EXPORT_LIMIT: u32 = 1000;

/// Export request parameters
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportQuery {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    pub include_observations: bool,
    pub entity_name: Option<String>,
}

/// Node in the public export shape: entity names are the contract boundary,
/// internal ids ride along for reference only
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExport {
    pub name: String,
    pub entity_type: String,
    pub observation_count: u64,
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
}

/// Link in the public export shape, endpoints by entity name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkExport {
    pub source: String,
    pub target: String,
    pub relation_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationExport {
    pub id: RecordId,
    pub entity_name: String,
    pub contents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullTotals {
    pub nodes: u64,
    pub links: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationTotals {
    pub observations: u64,
}

/// Full-mode response: one page of nodes, their outgoing links, and (when
/// requested and permitted) their visible observations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullExport {
    pub nodes: Vec<NodeExport>,
    pub links: Vec<LinkExport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observations: Option<Vec<ObservationExport>>,
    pub totals: FullTotals,
    pub next_cursor: Option<String>,
}

/// Entity-scoped response: observations only, a distinct shape rather than a
/// full-mode response with empty arrays
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityScopedExport {
    pub observations: Vec<ObservationExport>,
    pub totals: ObservationTotals,
}

/// The two export response shapes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExportBody {
    Full(FullExport),
    EntityScoped(EntityScopedExport),
}

/// Export result plus its cache token
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub body: ExportBody,
    /// Policy-fingerprinted content hash; same data under different
    /// effective permissions yields a different token
    pub etag: String,
}

/// Encode a pagination cursor for the record that ended the page
fn encode_cursor(record: &MemoryRecord) -> String {
    format!(
        "{}~{}",
        record
            .created_at
            .to_rfc3339_opts(SecondsFormat::Micros, false),
        record.id
    )
}

/// Decode a caller-supplied cursor; malformed input is a validation error
fn decode_cursor(cursor: &str) -> Result<PageCursor> {
    let (created_at, id) = cursor
        .split_once('~')
        .ok_or_else(|| MnemographError::Validation(format!("malformed cursor '{}'", cursor)))?;

    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|_| MnemographError::Validation(format!("malformed cursor '{}'", cursor)))?
        .with_timezone(&Utc);
    let id = RecordId::from_string(id)
        .map_err(|_| MnemographError::Validation(format!("malformed cursor '{}'", cursor)))?;

    Ok(PageCursor { created_at, id })
}

/// Hash the canonical response body together with the sorted, deduplicated
/// permission set. Two callers with identical data but different effective
/// permissions get different tokens, so a cache entry can never leak across
/// roles in either direction.
pub fn policy_fingerprint(body_json: &str, permissions: &BTreeSet<Permission>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body_json.as_bytes());
    hasher.update(b"|");
    for permission in permissions {
        hasher.update(permission.as_str().as_bytes());
        hasher.update(b",");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Visibility rule: requires the observations permission, and sensitive
/// content additionally requires the elevated permission
fn observation_visible(auth: &ReadAuthorization, payload: &RecordPayload) -> bool {
    if !auth.has(Permission::ObservationsView) {
        return false;
    }
    !sensitivity::classify(payload) || auth.has(Permission::SensitiveView)
}

fn to_observation_export(record: &MemoryRecord) -> Option<ObservationExport> {
    match &record.payload {
        RecordPayload::Observation {
            entity_name,
            contents,
            message_type,
            ..
        } => Some(ObservationExport {
            id: record.id,
            entity_name: entity_name.clone(),
            contents: contents.clone(),
            message_type: message_type.clone(),
            created_at: record.created_at,
        }),
        _ => None,
    }
}

/// Graph export engine
pub struct ExportEngine {
    store: Arc<dyn MemoryStore>,
    legacy_passthrough: bool,
}

impl ExportEngine {
    pub fn new(store: Arc<dyn MemoryStore>, legacy_passthrough: bool) -> Self {
        Self {
            store,
            legacy_passthrough,
        }
    }

    /// Run an export for this caller.
    ///
    /// Permission shortfalls surface as Forbidden; in particular requesting
    /// observations without `graph:observations:view` is an error, never an
    /// empty field.
    pub async fn export(
        &self,
        context: &RequestContext,
        query: &ExportQuery,
    ) -> Result<ExportOutcome> {
        let auth = authorize_read(context, self.legacy_passthrough);
        if !auth.authorized || !auth.has(Permission::GraphView) {
            return Err(MnemographError::Forbidden(
                "graph:view permission required".to_string(),
            ));
        }
        if query.include_observations && !auth.has(Permission::ObservationsView) {
            return Err(MnemographError::Forbidden(
                "graph:observations:view permission required for includeObservations".to_string(),
            ));
        }

        let limit = query.limit.unwrap_or(DEFAULT_EXPORT_LIMIT);
        if limit == 0 || limit > MAX_EXPORT_LIMIT {
            return Err(MnemographError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_EXPORT_LIMIT
            )));
        }

        let body = match &query.entity_name {
            Some(entity_name) => self.export_entity(context, &auth, entity_name).await?,
            None => self.export_full(context, &auth, query, limit).await?,
        };

        let canonical = serde_json::to_string(&body)?;
        let etag = policy_fingerprint(&canonical, &auth.permissions);

        Ok(ExportOutcome { body, etag })
    }

    async fn export_full(
        &self,
        context: &RequestContext,
        auth: &ReadAuthorization,
        query: &ExportQuery,
        limit: u32,
    ) -> Result<ExportBody> {
        let tenant_id = &context.tenant_id;
        let cursor = query.cursor.as_deref().map(decode_cursor).transpose()?;

        // Fetch one row past the page to learn whether a next page exists
        let mut page = self
            .store
            .list_page(tenant_id, RecordKind::Entity, cursor, limit + 1)
            .await?;
        let has_more = page.len() as u32 > limit;
        page.truncate(limit as usize);

        let next_cursor = if has_more {
            page.last().map(encode_cursor)
        } else {
            None
        };

        let names: Vec<String> = page
            .iter()
            .filter_map(|record| match &record.payload {
                RecordPayload::Entity { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();

        let counts = self.store.observation_counts(tenant_id).await?;
        let nodes: Vec<NodeExport> = page
            .iter()
            .filter_map(|record| match &record.payload {
                RecordPayload::Entity { name, entity_type } => Some(NodeExport {
                    name: name.clone(),
                    entity_type: entity_type.clone(),
                    observation_count: counts.get(name).copied().unwrap_or(0),
                    id: record.id,
                    created_at: record.created_at,
                }),
                _ => None,
            })
            .collect();

        // Links ride with their source node's page so each relation appears
        // on exactly one page
        let links: Vec<LinkExport> = self
            .store
            .relations_from_entities(tenant_id, &names)
            .await?
            .iter()
            .filter_map(|record| match &record.payload {
                RecordPayload::Relation {
                    from,
                    to,
                    relation_type,
                } => Some(LinkExport {
                    source: from.clone(),
                    target: to.clone(),
                    relation_type: relation_type.clone(),
                }),
                _ => None,
            })
            .collect();

        let observations = if query.include_observations {
            let visible = self
                .store
                .observations_for_entities(tenant_id, &names)
                .await?
                .iter()
                .filter(|record| observation_visible(auth, &record.payload))
                .filter_map(to_observation_export)
                .collect();
            Some(visible)
        } else {
            None
        };

        let totals = FullTotals {
            nodes: self.store.count_records(tenant_id, RecordKind::Entity).await?,
            links: self
                .store
                .count_records(tenant_id, RecordKind::Relation)
                .await?,
        };

        debug!(
            tenant_id = %tenant_id,
            page = nodes.len(),
            has_more,
            "assembled full graph export"
        );

        Ok(ExportBody::Full(FullExport {
            nodes,
            links,
            observations,
            totals,
            next_cursor,
        }))
    }

    async fn export_entity(
        &self,
        context: &RequestContext,
        auth: &ReadAuthorization,
        entity_name: &str,
    ) -> Result<ExportBody> {
        // Entity-scoped mode is observations-only, so the observation
        // permission is required outright
        if !auth.has(Permission::ObservationsView) {
            return Err(MnemographError::Forbidden(
                "graph:observations:view permission required for entity-scoped export".to_string(),
            ));
        }

        let tenant_id = &context.tenant_id;
        if self.store.find_entity(tenant_id, entity_name).await?.is_none() {
            return Err(MnemographError::NotFound(format!(
                "entity '{}'",
                entity_name
            )));
        }

        let observations: Vec<ObservationExport> = self
            .store
            .observations_for_entity(tenant_id, entity_name, None, None)
            .await?
            .iter()
            .filter(|record| observation_visible(auth, &record.payload))
            .filter_map(to_observation_export)
            .collect();

        let totals = ObservationTotals {
            observations: observations.len() as u64,
        };

        Ok(ExportBody::EntityScoped(EntityScopedExport {
            observations,
            totals,
        }))
    }
}
