//! Mutation engine
//!
//! Every graph write follows the same pipeline: authorize, screen content,
//! run the relational transaction, append an audit row, then mirror the
//! change to the external vector index. The relational half is atomic; the
//! vector half is best-effort with a bounded timeout, degrading to
//! tombstone-and-continue. Callers always succeed or fail on the relational
//! outcome and can detect index degradation from the response counters.
//!
//! Audit writes are fire-and-forget: a failed audit insert is logged and
//! never rolls back or fails the data write. A caller-supplied `reason`
//! lands in the audit row's reason column.

use crate::auth::authorize_mutation;
use crate::error::{MnemographError, Result};
use crate::notify::AlertNotifier;
use crate::sanitize;
use crate::storage::{AuditEvent, MemoryStore};
use crate::types::{
    Handoff, MemoryRecord, Message, RecordId, RecordPayload, RequestContext,
};
use crate::vector::{VectorIndex, VectorRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// One entity in a create request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySpec {
    pub name: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntitiesRequest {
    pub entities: Vec<EntitySpec>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntitiesResponse {
    pub status: String,
    /// Entities newly created
    pub created: u64,
    /// Names that already existed (upsert: no duplicate node)
    pub existing: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationSpec {
    pub entity_name: String,
    pub contents: Vec<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub sensitive: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddObservationsRequest {
    pub observations: Vec<ObservationSpec>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddObservationsResponse {
    pub status: String,
    pub added: u64,
    pub weaviate_failures: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationSpec {
    pub from: String,
    pub to: String,
    pub relation_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRelationsRequest {
    pub relations: Vec<RelationSpec>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRelationsResponse {
    pub status: String,
    pub created: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEntityRequest {
    pub entity_name: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Exact cascade counts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedCounts {
    pub entities: u64,
    pub observations: u64,
    pub relations: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEntityResponse {
    pub status: String,
    pub deleted: DeletedCounts,
    pub weaviate_cleanup: u64,
    pub weaviate_failures: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveObservationsRequest {
    pub entity_name: String,
    pub observation_ids: Vec<RecordId>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveObservationsResponse {
    pub status: String,
    pub removed: u64,
    pub weaviate_cleanup: u64,
    pub weaviate_failures: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateObservationRequest {
    pub observation_id: RecordId,
    pub contents: Vec<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateObservationResponse {
    pub status: String,
    pub updated: u64,
    pub weaviate_cleanup: u64,
    pub weaviate_failures: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionRequest {
    pub project_id: String,
    pub summary: String,
    #[serde(default)]
    pub open_items: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionResponse {
    pub status: String,
    pub handoff_id: RecordId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub to_agent: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub status: String,
    pub message_id: RecordId,
}

const STATUS_OK: &str = "ok";
const STATUS_DRY_RUN: &str = "dry_run";

/// Mutation engine
pub struct MutationEngine {
    store: Arc<dyn MemoryStore>,
    vector: Arc<dyn VectorIndex>,
    notifier: Arc<dyn AlertNotifier>,
    legacy_passthrough: bool,
    vector_timeout: Duration,
}

impl MutationEngine {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        vector: Arc<dyn VectorIndex>,
        notifier: Arc<dyn AlertNotifier>,
        legacy_passthrough: bool,
        vector_timeout: Duration,
    ) -> Self {
        Self {
            store,
            vector,
            notifier,
            legacy_passthrough,
            vector_timeout,
        }
    }

    /// Authorize, then screen the request's free text. On a sanitizer match
    /// the write is rejected outright, audited as flagged, and a best-effort
    /// notification goes out. Returns the content hash for the success
    /// audit row.
    async fn gate(
        &self,
        context: &RequestContext,
        operation: &str,
        contents: &[&str],
    ) -> Result<String> {
        let decision = authorize_mutation(operation, context, self.legacy_passthrough);
        if !decision.authorized {
            return Err(MnemographError::Forbidden(decision.reason));
        }

        if let Some(flag_reason) = sanitize::screen(contents) {
            self.audit(AuditEvent {
                operation: operation.to_string(),
                tenant_id: context.tenant_id.clone(),
                actor_id: context.user_id.clone(),
                content_hash: sanitize::content_hash(contents),
                flagged: true,
                flag_reason: Some(flag_reason.clone()),
                target_count: 0,
            })
            .await;

            // Notification failure never changes the rejection outcome
            if let Err(e) = self
                .notifier
                .notify_flagged(&context.tenant_id, &context.user_id, operation, &flag_reason)
                .await
            {
                warn!(operation, error = %e, "flagged-write notification failed");
            }

            return Err(MnemographError::ContentRejected(flag_reason));
        }

        Ok(sanitize::content_hash(contents))
    }

    /// Fire-and-forget audit append
    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.store.append_audit(&event).await {
            warn!(operation = %event.operation, error = %e, "audit append failed");
        }
    }

    async fn audit_success(
        &self,
        context: &RequestContext,
        operation: &str,
        content_hash: String,
        reason: Option<String>,
        target_count: u64,
    ) {
        self.audit(AuditEvent {
            operation: operation.to_string(),
            tenant_id: context.tenant_id.clone(),
            actor_id: context.user_id.clone(),
            content_hash,
            flagged: false,
            flag_reason: reason,
            target_count,
        })
        .await;
    }

    /// Delete ids from the vector index; per-id failures become tombstones.
    /// Returns (cleaned, failed).
    async fn mirror_deletes(&self, tenant_id: &str, ids: &[RecordId]) -> (u64, u64) {
        let mut cleaned = 0;
        let mut failed = 0;

        for id in ids {
            let external_id = id.to_string();
            let outcome = match timeout(self.vector_timeout, self.vector.delete(&external_id)).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("vector index call timed out".to_string()),
            };

            match outcome {
                Ok(()) => cleaned += 1,
                Err(error) => {
                    failed += 1;
                    if let Err(e) = self
                        .store
                        .insert_tombstone(&external_id, tenant_id, &error)
                        .await
                    {
                        warn!(external_id = %external_id, error = %e, "tombstone insert failed");
                    }
                }
            }
        }

        (cleaned, failed)
    }

    /// Store one observation in the vector index, best-effort
    async fn mirror_store(&self, record: &VectorRecord) -> bool {
        match timeout(self.vector_timeout, self.vector.store(record)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(external_id = %record.external_id, error = %e, "vector store failed");
                false
            }
            Err(_) => {
                warn!(external_id = %record.external_id, "vector store timed out");
                false
            }
        }
    }

    /// Create entities, upserting by per-tenant name so a duplicate create
    /// never yields a second node
    pub async fn create_entities(
        &self,
        context: &RequestContext,
        request: &CreateEntitiesRequest,
    ) -> Result<CreateEntitiesResponse> {
        let contents: Vec<&str> = request
            .entities
            .iter()
            .flat_map(|e| [e.name.as_str(), e.entity_type.as_str()])
            .collect();
        let hash = self.gate(context, "create_entities", &contents).await?;

        let mut created = 0;
        let mut existing = 0;
        for spec in &request.entities {
            if self
                .store
                .find_entity(&context.tenant_id, &spec.name)
                .await?
                .is_some()
            {
                existing += 1;
                continue;
            }
            let record = MemoryRecord::new(
                &context.tenant_id,
                &context.user_id,
                RecordPayload::Entity {
                    name: spec.name.clone(),
                    entity_type: spec.entity_type.clone(),
                },
            );
            self.store.insert_record(&record).await?;
            created += 1;
        }

        self.audit_success(context, "create_entities", hash, None, created)
            .await;

        Ok(CreateEntitiesResponse {
            status: STATUS_OK.to_string(),
            created,
            existing,
        })
    }

    /// Append observations to existing entities and mirror them to the
    /// vector index
    pub async fn add_observations(
        &self,
        context: &RequestContext,
        request: &AddObservationsRequest,
    ) -> Result<AddObservationsResponse> {
        let contents: Vec<&str> = request
            .observations
            .iter()
            .flat_map(|o| o.contents.iter().map(String::as_str))
            .collect();
        let hash = self.gate(context, "add_observations", &contents).await?;

        // Validate every target entity before writing anything
        for spec in &request.observations {
            if self
                .store
                .find_entity(&context.tenant_id, &spec.entity_name)
                .await?
                .is_none()
            {
                return Err(MnemographError::NotFound(format!(
                    "entity '{}'",
                    spec.entity_name
                )));
            }
        }

        let mut added = 0;
        let mut weaviate_failures = 0;
        for spec in &request.observations {
            let record = MemoryRecord::new(
                &context.tenant_id,
                &context.user_id,
                RecordPayload::Observation {
                    entity_name: spec.entity_name.clone(),
                    contents: spec.contents.clone(),
                    message_type: spec.message_type.clone(),
                    sensitive: spec.sensitive,
                },
            );
            self.store.insert_record(&record).await?;
            added += 1;

            let mirrored = self
                .mirror_store(&VectorRecord {
                    external_id: record.id.to_string(),
                    tenant_id: context.tenant_id.clone(),
                    entity_name: spec.entity_name.clone(),
                    content: spec.contents.join("\n"),
                })
                .await;
            if !mirrored {
                weaviate_failures += 1;
            }
        }

        self.audit_success(context, "add_observations", hash, None, added)
            .await;

        Ok(AddObservationsResponse {
            status: STATUS_OK.to_string(),
            added,
            weaviate_failures,
        })
    }

    /// Create directed relations between existing entities
    pub async fn create_relations(
        &self,
        context: &RequestContext,
        request: &CreateRelationsRequest,
    ) -> Result<CreateRelationsResponse> {
        let contents: Vec<&str> = request
            .relations
            .iter()
            .flat_map(|r| [r.from.as_str(), r.to.as_str(), r.relation_type.as_str()])
            .collect();
        let hash = self.gate(context, "create_relations", &contents).await?;

        for spec in &request.relations {
            for endpoint in [&spec.from, &spec.to] {
                if self
                    .store
                    .find_entity(&context.tenant_id, endpoint)
                    .await?
                    .is_none()
                {
                    return Err(MnemographError::NotFound(format!("entity '{}'", endpoint)));
                }
            }
        }

        let mut created = 0;
        for spec in &request.relations {
            let record = MemoryRecord::new(
                &context.tenant_id,
                &context.user_id,
                RecordPayload::Relation {
                    from: spec.from.clone(),
                    to: spec.to.clone(),
                    relation_type: spec.relation_type.clone(),
                },
            );
            self.store.insert_record(&record).await?;
            created += 1;
        }

        self.audit_success(context, "create_relations", hash, None, created)
            .await;

        Ok(CreateRelationsResponse {
            status: STATUS_OK.to_string(),
            created,
        })
    }

    /// Cascading delete of an entity, its observations, and its relations
    pub async fn delete_entity(
        &self,
        context: &RequestContext,
        request: &DeleteEntityRequest,
    ) -> Result<DeleteEntityResponse> {
        let hash = self
            .gate(context, "delete_entity", &[request.entity_name.as_str()])
            .await?;

        if self
            .store
            .find_entity(&context.tenant_id, &request.entity_name)
            .await?
            .is_none()
        {
            return Err(MnemographError::NotFound(format!(
                "entity '{}'",
                request.entity_name
            )));
        }

        if request.dry_run {
            let plan = self
                .store
                .plan_entity_cascade(&context.tenant_id, &request.entity_name)
                .await?;
            return Ok(DeleteEntityResponse {
                status: STATUS_DRY_RUN.to_string(),
                deleted: DeletedCounts {
                    entities: plan.entities,
                    observations: plan.observations,
                    relations: plan.relations,
                },
                weaviate_cleanup: 0,
                weaviate_failures: 0,
            });
        }

        let outcome = self
            .store
            .delete_entity_cascade(&context.tenant_id, &request.entity_name)
            .await?;

        let total = outcome.entities + outcome.observations + outcome.relations;
        self.audit_success(
            context,
            "delete_entity",
            hash,
            request.reason.clone(),
            total,
        )
        .await;

        // Relational delete is committed; index cleanup is best-effort from
        // here on
        let (weaviate_cleanup, weaviate_failures) = self
            .mirror_deletes(&context.tenant_id, &outcome.observation_ids)
            .await;

        debug!(
            entity_name = %request.entity_name,
            observations = outcome.observations,
            weaviate_failures,
            "entity deleted"
        );

        Ok(DeleteEntityResponse {
            status: STATUS_OK.to_string(),
            deleted: DeletedCounts {
                entities: outcome.entities,
                observations: outcome.observations,
                relations: outcome.relations,
            },
            weaviate_cleanup,
            weaviate_failures,
        })
    }

    /// Selectively delete observations by id within one entity
    pub async fn remove_observations(
        &self,
        context: &RequestContext,
        request: &RemoveObservationsRequest,
    ) -> Result<RemoveObservationsResponse> {
        let hash = self
            .gate(
                context,
                "remove_observations",
                &[request.entity_name.as_str()],
            )
            .await?;

        if self
            .store
            .find_entity(&context.tenant_id, &request.entity_name)
            .await?
            .is_none()
        {
            return Err(MnemographError::NotFound(format!(
                "entity '{}'",
                request.entity_name
            )));
        }

        if request.dry_run {
            let plan = self
                .store
                .plan_delete_observations(
                    &context.tenant_id,
                    &request.entity_name,
                    &request.observation_ids,
                )
                .await?;
            return Ok(RemoveObservationsResponse {
                status: STATUS_DRY_RUN.to_string(),
                removed: plan.len() as u64,
                weaviate_cleanup: 0,
                weaviate_failures: 0,
            });
        }

        let removed_ids = self
            .store
            .delete_observations(
                &context.tenant_id,
                &request.entity_name,
                &request.observation_ids,
            )
            .await?;

        self.audit_success(
            context,
            "remove_observations",
            hash,
            request.reason.clone(),
            removed_ids.len() as u64,
        )
        .await;

        let (weaviate_cleanup, weaviate_failures) = self
            .mirror_deletes(&context.tenant_id, &removed_ids)
            .await;

        Ok(RemoveObservationsResponse {
            status: STATUS_OK.to_string(),
            removed: removed_ids.len() as u64,
            weaviate_cleanup,
            weaviate_failures,
        })
    }

    /// Replace an observation's contents; the stale vector entry is
    /// re-stored, or tombstoned when the re-store fails
    pub async fn update_observation(
        &self,
        context: &RequestContext,
        request: &UpdateObservationRequest,
    ) -> Result<UpdateObservationResponse> {
        let contents: Vec<&str> = request.contents.iter().map(String::as_str).collect();
        let hash = self.gate(context, "update_observation", &contents).await?;

        // Existence check doubles as the dry-run answer
        let current = self
            .store
            .get_record(&context.tenant_id, request.observation_id)
            .await?;
        let entity_name = match &current.payload {
            RecordPayload::Observation { entity_name, .. } => entity_name.clone(),
            _ => {
                return Err(MnemographError::Validation(format!(
                    "record {} is not an observation",
                    request.observation_id
                )))
            }
        };

        if request.dry_run {
            return Ok(UpdateObservationResponse {
                status: STATUS_DRY_RUN.to_string(),
                updated: 1,
                weaviate_cleanup: 0,
                weaviate_failures: 0,
            });
        }

        let updated = self
            .store
            .replace_observation(
                &context.tenant_id,
                request.observation_id,
                &request.contents,
                request.message_type.as_deref(),
            )
            .await?;

        self.audit_success(
            context,
            "update_observation",
            hash,
            request.reason.clone(),
            1,
        )
        .await;

        let mirrored = self
            .mirror_store(&VectorRecord {
                external_id: updated.id.to_string(),
                tenant_id: context.tenant_id.clone(),
                entity_name,
                content: request.contents.join("\n"),
            })
            .await;

        let (weaviate_cleanup, weaviate_failures) = if mirrored {
            (1, 0)
        } else {
            // The index still holds stale content for this id; queue its
            // removal so readers cannot keep retrieving the old text
            if let Err(e) = self
                .store
                .insert_tombstone(
                    &updated.id.to_string(),
                    &context.tenant_id,
                    "re-store after update failed",
                )
                .await
            {
                warn!(id = %updated.id, error = %e, "tombstone insert failed");
            }
            (0, 1)
        };

        Ok(UpdateObservationResponse {
            status: STATUS_OK.to_string(),
            updated: 1,
            weaviate_cleanup,
            weaviate_failures,
        })
    }

    /// Close a session: write the hand-off for the project, deactivating any
    /// prior active one in the same transaction
    pub async fn close_session(
        &self,
        context: &RequestContext,
        request: &CloseSessionRequest,
    ) -> Result<CloseSessionResponse> {
        let mut contents: Vec<&str> = vec![request.summary.as_str()];
        contents.extend(request.open_items.iter().map(String::as_str));
        let hash = self.gate(context, "close_session", &contents).await?;

        let handoff = Handoff {
            id: RecordId::new(),
            tenant_id: context.tenant_id.clone(),
            project_id: request.project_id.clone(),
            from_agent: context.user_id.clone(),
            summary: request.summary.clone(),
            open_items: request.open_items.clone(),
            created_at: Utc::now(),
            consumed_at: None,
            active: true,
        };
        self.store.replace_handoff(&handoff).await?;

        self.audit_success(context, "close_session", hash, request.reason.clone(), 1)
            .await;

        Ok(CloseSessionResponse {
            status: STATUS_OK.to_string(),
            handoff_id: handoff.id,
        })
    }

    /// Send a message to another agent; only its unread count surfaces in
    /// session context
    pub async fn send_message(
        &self,
        context: &RequestContext,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse> {
        let hash = self
            .gate(context, "send_message", &[request.body.as_str()])
            .await?;

        let message = Message {
            id: RecordId::new(),
            tenant_id: context.tenant_id.clone(),
            to_agent: request.to_agent.clone(),
            from_agent: context.user_id.clone(),
            body: request.body.clone(),
            read_at: None,
            created_at: Utc::now(),
        };
        self.store.insert_message(&message).await?;

        self.audit_success(context, "send_message", hash, None, 1)
            .await;

        Ok(SendMessageResponse {
            status: STATUS_OK.to_string(),
            message_id: message.id,
        })
    }
}
