//! Storage layer for the mnemograph memory engine
//!
//! Provides the `MemoryStore` abstraction over the relational store plus its
//! libSQL implementation. Every operation is tenant-scoped: the trait takes
//! `tenant_id` explicitly and implementations must never run a query without
//! a tenant predicate on multi-tenant tables.

pub mod libsql;

use crate::error::Result;
use crate::types::{
    AuditLogEntry, Handoff, MemoryRecord, Message, RecordId, RecordKind, TombstoneEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Keyset pagination position: strictly after `(created_at, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: RecordId,
}

/// Result of (or plan for) a cascading entity delete
#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    pub entities: u64,
    pub observations: u64,
    pub relations: u64,
    /// Observation record ids needing vector-index cleanup
    pub observation_ids: Vec<RecordId>,
}

/// Audit row input; the store assigns id and timestamp
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub operation: String,
    pub tenant_id: String,
    pub actor_id: String,
    pub content_hash: String,
    pub flagged: bool,
    pub flag_reason: Option<String>,
    pub target_count: u64,
}

/// Relational store interface
///
/// Compound write operations (cascading delete, handoff replacement) are
/// atomic on the relational side; mirroring to the vector index happens
/// above this trait, after commit.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    // --- tenancy bootstrap ---

    async fn ensure_tenant(&self, id: &str, name: &str) -> Result<()>;

    async fn ensure_user(&self, id: &str, tenant_id: &str, display_name: &str) -> Result<()>;

    // --- graph records ---

    async fn insert_record(&self, record: &MemoryRecord) -> Result<()>;

    /// Fetch one record; NotFound if absent in this tenant
    async fn get_record(&self, tenant_id: &str, id: RecordId) -> Result<MemoryRecord>;

    /// Look up an entity record by its per-tenant-unique name
    async fn find_entity(&self, tenant_id: &str, name: &str) -> Result<Option<MemoryRecord>>;

    /// One page of records in `(created_at, id)` order, strictly after the
    /// cursor position when one is given
    async fn list_page(
        &self,
        tenant_id: &str,
        kind: RecordKind,
        cursor: Option<PageCursor>,
        limit: u32,
    ) -> Result<Vec<MemoryRecord>>;

    async fn count_records(&self, tenant_id: &str, kind: RecordKind) -> Result<u64>;

    /// Entities of a given entity_type (guardrails lookup)
    async fn list_entities_by_type(
        &self,
        tenant_id: &str,
        entity_type: &str,
    ) -> Result<Vec<MemoryRecord>>;

    /// Observations attached to one entity, newest first, optionally bounded
    /// by a recency window and row limit
    async fn observations_for_entity(
        &self,
        tenant_id: &str,
        entity_name: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<MemoryRecord>>;

    /// Observations attached to any of the named entities, in creation order
    async fn observations_for_entities(
        &self,
        tenant_id: &str,
        entity_names: &[String],
    ) -> Result<Vec<MemoryRecord>>;

    /// Relations whose source is one of the named entities, in creation
    /// order. Scoping by source keeps each relation on exactly one export
    /// page.
    async fn relations_from_entities(
        &self,
        tenant_id: &str,
        entity_names: &[String],
    ) -> Result<Vec<MemoryRecord>>;

    /// Observation count per entity name for one tenant
    async fn observation_counts(&self, tenant_id: &str) -> Result<HashMap<String, u64>>;

    /// Overwrite an observation's contents/message_type, preserving the rest
    /// of its payload; returns the updated record
    async fn replace_observation(
        &self,
        tenant_id: &str,
        id: RecordId,
        contents: &[String],
        message_type: Option<&str>,
    ) -> Result<MemoryRecord>;

    /// Compute cascade counts without mutating anything (dry run)
    async fn plan_entity_cascade(
        &self,
        tenant_id: &str,
        entity_name: &str,
    ) -> Result<CascadeOutcome>;

    /// Delete an entity plus its observations and relations in one
    /// transaction, returning exact counts
    async fn delete_entity_cascade(
        &self,
        tenant_id: &str,
        entity_name: &str,
    ) -> Result<CascadeOutcome>;

    /// Ids from `ids` that are observations of the named entity (dry run for
    /// selective removal)
    async fn plan_delete_observations(
        &self,
        tenant_id: &str,
        entity_name: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>>;

    /// Selectively delete observations by id within one entity; returns the
    /// ids actually removed
    async fn delete_observations(
        &self,
        tenant_id: &str,
        entity_name: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>>;

    // --- messages ---

    async fn insert_message(&self, message: &Message) -> Result<()>;

    async fn count_unread_messages(&self, tenant_id: &str, agent: &str) -> Result<u64>;

    // --- handoffs ---

    /// Deactivate any prior active handoff for `(tenant, project)` and
    /// insert the new one, atomically
    async fn replace_handoff(&self, handoff: &Handoff) -> Result<()>;

    /// Return and mark consumed the single active, unconsumed handoff for
    /// `(tenant, project)`, if any. Subsequent calls return None until a new
    /// handoff is written.
    async fn consume_handoff(&self, tenant_id: &str, project_id: &str) -> Result<Option<Handoff>>;

    // --- audit ---

    async fn append_audit(&self, event: &AuditEvent) -> Result<()>;

    async fn list_audit(&self, tenant_id: &str, limit: u32) -> Result<Vec<AuditLogEntry>>;

    // --- tombstones ---

    /// Insert-or-ignore: re-inserting an existing external id is a no-op
    async fn insert_tombstone(&self, external_id: &str, tenant_id: &str, error: &str)
        -> Result<()>;

    async fn oldest_tombstones(&self, limit: u32) -> Result<Vec<TombstoneEntry>>;

    async fn remove_tombstone(&self, external_id: &str) -> Result<()>;

    async fn record_tombstone_failure(&self, external_id: &str, error: &str) -> Result<()>;

    async fn count_tombstones(&self) -> Result<u64>;
}
