//! Core data types for the mnemograph memory engine
//!
//! This module defines the fundamental data structures used throughout the
//! engine: tenant-scoped graph records (entities, observations, relations),
//! the per-request identity context, and the durable side records (audit
//! entries, vector tombstones, handoffs, messages).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for graph records
///
/// Wraps a UUID to provide type safety and prevent mixing record IDs with
/// other UUID-based identifiers in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Create a new random record ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a record ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminator for the shared graph-record table
///
/// Entities, observations, and relations live in one physical table keyed by
/// `(tenant_id, memory_type)`; this enum is the closed set of kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Entity,
    Observation,
    Relation,
}

impl RecordKind {
    /// Column value for the memory_type discriminator
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Entity => "entity",
            RecordKind::Observation => "observation",
            RecordKind::Relation => "relation",
        }
    }

    /// Parse the memory_type column value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entity" => Some(RecordKind::Entity),
            "observation" => Some(RecordKind::Observation),
            "relation" => Some(RecordKind::Relation),
            _ => None,
        }
    }
}

/// Typed payload of a graph record
///
/// The closed set of payload shapes stored in the tagged-record table.
/// Deserialization goes through this enum, so an unknown discriminator or a
/// malformed shape is an error at the boundary rather than a silent
/// divergence discovered at read time.
///
/// References between records are soft, by entity *name*: observations name
/// their owning entity and relations name both endpoints. Names are the
/// stable external identifier; per-tenant uniqueness is enforced by the
/// upsert path in the mutation engine, not by the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RecordPayload {
    /// A named node in the knowledge graph
    Entity {
        name: String,
        entity_type: String,
    },

    /// Free-text notes attached to an entity by name.
    ///
    /// `contents` is an ordered list; sensitivity classification evaluates
    /// every entry (see [`crate::sensitivity`]).
    Observation {
        entity_name: String,
        contents: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sensitive: Option<bool>,
    },

    /// Directed, typed edge between two entities by name
    Relation {
        from: String,
        to: String,
        relation_type: String,
    },
}

impl RecordPayload {
    /// Discriminator for this payload
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::Entity { .. } => RecordKind::Entity,
            RecordPayload::Observation { .. } => RecordKind::Observation,
            RecordPayload::Relation { .. } => RecordKind::Relation,
        }
    }
}

/// A tenant-scoped row in the shared graph-record table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier
    pub id: RecordId,

    /// Owning tenant; every query filters on this
    pub tenant_id: String,

    /// Actor that created the record
    pub created_by: String,

    /// Creation timestamp (export sort key, tie-broken by id)
    pub created_at: DateTime<Utc>,

    /// Typed payload
    pub payload: RecordPayload,
}

impl MemoryRecord {
    /// Build a fresh record for a payload
    pub fn new(tenant_id: &str, created_by: &str, payload: RecordPayload) -> Self {
        Self {
            id: RecordId::new(),
            tenant_id: tenant_id.to_string(),
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            payload,
        }
    }
}

/// How the caller authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Trusted local/test bypass
    Dev,
    /// API key verified by the auth collaborator
    ApiKey,
    /// JWT verified by the auth collaborator
    Jwt,
}

/// Immutable, trusted identity record for one inbound call
///
/// Built exclusively by the transport layer from identity the external auth
/// collaborator has already verified. Never persisted, never derived from
/// caller-supplied body or query fields: this is the only trusted source of
/// tenant/user identity for every data-touching operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: String,
    pub user_id: String,
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl RequestContext {
    /// Convenience constructor for the dev bypass
    pub fn dev(tenant_id: &str, user_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            auth_type: AuthType::Dev,
            api_key_id: None,
            roles: Vec::new(),
            scopes: Vec::new(),
        }
    }
}

/// Append-only audit trail row; one per write attempt regardless of outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub operation: String,
    pub tenant_id: String,
    pub actor_id: String,
    pub content_hash: String,
    pub flagged: bool,
    pub flag_reason: Option<String>,
    pub target_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Durable record of a failed vector-index mutation
///
/// Created when mirroring to the external index fails; deleted on successful
/// retry. The external id is the primary key, so re-insertion is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TombstoneEntry {
    pub external_id: String,
    pub tenant_id: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Hand-off note from the agent that last closed a session on a project
///
/// At most one row is active per `(tenant_id, project_id)`; the next
/// session-open consumes it exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub id: RecordId,
    pub tenant_id: String,
    pub project_id: String,
    pub from_agent: String,
    pub summary: String,
    pub open_items: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Inter-agent message; only the unread *count* enters session context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: RecordId,
    pub tenant_id: String,
    pub to_agent: String,
    pub from_agent: String,
    pub body: String,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_creation() {
        let id1 = RecordId::new();
        let id2 = RecordId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_record_kind_round_trip() {
        for kind in [RecordKind::Entity, RecordKind::Observation, RecordKind::Relation] {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("widget"), None);
    }

    #[test]
    fn test_payload_tagged_serialization() {
        let payload = RecordPayload::Observation {
            entity_name: "ProjectX".to_string(),
            contents: vec!["note one".to_string()],
            message_type: None,
            sensitive: None,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "observation");
        assert_eq!(json["entity_name"], "ProjectX");
        // Absent options stay out of the stored shape
        assert!(json.get("message_type").is_none());

        let back: RecordPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_unknown_payload_kind_rejected() {
        let bad = serde_json::json!({"kind": "blob", "name": "x"});
        assert!(serde_json::from_value::<RecordPayload>(bad).is_err());
    }
}
