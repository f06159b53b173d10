//! LibSQL storage backend
//!
//! Single embedded database owning durability for graph records, messages,
//! handoffs, the audit log, and the vector tombstone queue. Schema setup
//! runs through numbered migrations embedded at compile time and tracked in
//! an `_migrations_applied` table.
//!
//! Timestamps are stored as fixed-precision RFC 3339 text so that string
//! comparison in SQL matches chronological order; the export cursor relies
//! on this.

use crate::error::{MnemographError, Result};
use crate::storage::{AuditEvent, CascadeOutcome, MemoryStore, PageCursor};
use crate::types::{
    AuditLogEntry, Handoff, MemoryRecord, Message, RecordId, RecordKind, RecordPayload,
    TombstoneEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{params, Builder, Connection, Database, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Embedded migrations, executed in order
const MIGRATIONS: [(&str, &str); 2] = [
    (
        "001_initial_schema.sql",
        include_str!("../../migrations/libsql/001_initial_schema.sql"),
    ),
    (
        "002_add_indexes.sql",
        include_str!("../../migrations/libsql/002_add_indexes.sql"),
    ),
];

/// Split a migration file into statements (comments stripped, `;`-terminated)
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        if trimmed.ends_with(';') {
            statements.push(current.clone());
            current.clear();
        }
    }

    if !current.trim().is_empty() {
        statements.push(current);
    }

    statements
}

/// Format a timestamp for storage. Fixed microsecond precision and a fixed
/// offset suffix keep lexicographic order equal to chronological order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MnemographError::Database(format!("invalid stored timestamp '{}': {}", s, e)))
}

/// Database connection mode
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// Local file-based database
    Local(String),
    /// In-memory database. Note: libSQL gives each connection its own
    /// `:memory:` database, so this mode is only useful for single-shot
    /// tooling; tests use temp files instead.
    InMemory,
}

/// LibSQL storage backend
pub struct LibsqlStore {
    db: Database,
}

impl LibsqlStore {
    /// Open (or create) a database and bring the schema up to date
    pub async fn new(mode: ConnectionMode) -> Result<Self> {
        info!("Connecting to libSQL database: {:?}", mode);

        let db = match &mode {
            ConnectionMode::Local(path) => {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            MnemographError::Database(format!(
                                "failed to create database directory {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }
                Builder::new_local(path).build().await.map_err(|e| {
                    MnemographError::Database(format!("failed to open local database: {}", e))
                })?
            }
            ConnectionMode::InMemory => Builder::new_local(":memory:")
                .build()
                .await
                .map_err(|e| {
                    MnemographError::Database(format!("failed to open in-memory database: {}", e))
                })?,
        };

        let store = Self { db };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Convenience constructor for a local file path
    pub async fn new_local(path: &str) -> Result<Self> {
        Self::new(ConnectionMode::Local(path.to_string())).await
    }

    fn get_conn(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| MnemographError::Database(format!("failed to get connection: {}", e)))
    }

    /// Apply any embedded migrations not yet recorded as applied
    async fn run_migrations(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations_applied (
                migration_name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
            params![],
        )
        .await
        .map_err(|e| MnemographError::Migration(format!("failed to create tracking table: {}", e)))?;

        for (name, sql) in MIGRATIONS {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                    params![name],
                )
                .await?;
            let applied = match rows.next().await? {
                Some(row) => row.get::<i64>(0)? > 0,
                None => false,
            };
            if applied {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            for (i, statement) in split_statements(sql).iter().enumerate() {
                conn.execute(statement.as_str(), params![])
                    .await
                    .map_err(|e| {
                        MnemographError::Migration(format!(
                            "statement #{} in {} failed: {}",
                            i + 1,
                            name,
                            e
                        ))
                    })?;
            }

            conn.execute(
                "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                params![name, Utc::now().timestamp()],
            )
            .await
            .map_err(|e| MnemographError::Migration(format!("failed to record {}: {}", name, e)))?;

            info!("Applied migration: {}", name);
        }

        Ok(())
    }

    /// Parse a `SELECT id, tenant_id, memory_type, payload, created_by,
    /// created_at` row into a record
    fn row_to_record(row: &libsql::Row) -> Result<MemoryRecord> {
        let id_str: String = row.get(0)?;
        let id = RecordId::from_string(&id_str)?;
        let tenant_id: String = row.get(1)?;

        let kind_str: String = row.get(2)?;
        let kind = RecordKind::parse(&kind_str).ok_or_else(|| {
            MnemographError::Database(format!("unknown memory_type '{}'", kind_str))
        })?;

        let payload_json: String = row.get(3)?;
        let payload: RecordPayload = serde_json::from_str(&payload_json)?;
        if payload.kind() != kind {
            return Err(MnemographError::Database(format!(
                "payload kind mismatch for record {}: column says {:?}",
                id, kind
            )));
        }

        let created_by: String = row.get(4)?;
        let created_at_str: String = row.get(5)?;

        Ok(MemoryRecord {
            id,
            tenant_id,
            created_by,
            created_at: parse_ts(&created_at_str)?,
            payload,
        })
    }

    fn row_to_handoff(row: &libsql::Row) -> Result<Handoff> {
        let id_str: String = row.get(0)?;
        let open_items_json: String = row.get(5)?;
        let created_at: String = row.get(6)?;
        let consumed_at: Option<String> = row.get(7)?;
        let active: i64 = row.get(8)?;

        Ok(Handoff {
            id: RecordId::from_string(&id_str)?,
            tenant_id: row.get(1)?,
            project_id: row.get(2)?,
            from_agent: row.get(3)?,
            summary: row.get(4)?,
            open_items: serde_json::from_str(&open_items_json)?,
            created_at: parse_ts(&created_at)?,
            consumed_at: consumed_at.as_deref().map(parse_ts).transpose()?,
            active: active != 0,
        })
    }

    /// Collect cascade targets for an entity: its own row count, its
    /// observation ids, and the count of relations touching it
    async fn cascade_targets(
        conn: &Connection,
        tenant_id: &str,
        entity_name: &str,
    ) -> Result<CascadeOutcome> {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM memory_records
                 WHERE tenant_id = ? AND memory_type = 'entity'
                   AND json_extract(payload, '$.name') = ?",
                params![tenant_id, entity_name],
            )
            .await?;
        let entities = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? as u64,
            None => 0,
        };

        let mut observation_ids = Vec::new();
        let mut rows = conn
            .query(
                "SELECT id FROM memory_records
                 WHERE tenant_id = ? AND memory_type = 'observation'
                   AND json_extract(payload, '$.entity_name') = ?
                 ORDER BY created_at, id",
                params![tenant_id, entity_name],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let id_str: String = row.get(0)?;
            observation_ids.push(RecordId::from_string(&id_str)?);
        }

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM memory_records
                 WHERE tenant_id = ? AND memory_type = 'relation'
                   AND (json_extract(payload, '$.from') = ?
                        OR json_extract(payload, '$.to') = ?)",
                params![tenant_id, entity_name, entity_name],
            )
            .await?;
        let relations = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? as u64,
            None => 0,
        };

        Ok(CascadeOutcome {
            entities,
            observations: observation_ids.len() as u64,
            relations,
            observation_ids,
        })
    }

    /// Of `ids`, which are observation records of this entity in this tenant
    async fn matching_observation_ids(
        conn: &Connection,
        tenant_id: &str,
        entity_name: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id FROM memory_records
             WHERE tenant_id = ? AND memory_type = 'observation'
               AND json_extract(payload, '$.entity_name') = ?
               AND id IN ({})
             ORDER BY created_at, id",
            placeholders
        );

        let mut args: Vec<Value> = Vec::with_capacity(ids.len() + 2);
        args.push(Value::Text(tenant_id.to_string()));
        args.push(Value::Text(entity_name.to_string()));
        for id in ids {
            args.push(Value::Text(id.to_string()));
        }

        let mut rows = conn.query(&sql, libsql::params_from_iter(args)).await?;
        let mut found = Vec::new();
        while let Some(row) = rows.next().await? {
            let id_str: String = row.get(0)?;
            found.push(RecordId::from_string(&id_str)?);
        }
        Ok(found)
    }
}

#[async_trait]
impl MemoryStore for LibsqlStore {
    async fn ensure_tenant(&self, id: &str, name: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO tenants (id, name, created_at) VALUES (?, ?, ?)",
            params![id, name, ts(&Utc::now())],
        )
        .await?;
        Ok(())
    }

    async fn ensure_user(&self, id: &str, tenant_id: &str, display_name: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (id, tenant_id, display_name, created_at)
             VALUES (?, ?, ?, ?)",
            params![id, tenant_id, display_name, ts(&Utc::now())],
        )
        .await?;
        Ok(())
    }

    async fn insert_record(&self, record: &MemoryRecord) -> Result<()> {
        debug!(id = %record.id, kind = record.payload.kind().as_str(), "storing record");

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO memory_records (id, tenant_id, memory_type, payload, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.id.to_string(),
                record.tenant_id.clone(),
                record.payload.kind().as_str(),
                serde_json::to_string(&record.payload)?,
                record.created_by.clone(),
                ts(&record.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_record(&self, tenant_id: &str, id: RecordId) -> Result<MemoryRecord> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT id, tenant_id, memory_type, payload, created_by, created_at
                 FROM memory_records WHERE tenant_id = ? AND id = ?",
                params![tenant_id, id.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Self::row_to_record(&row),
            None => Err(MnemographError::NotFound(format!("record {}", id))),
        }
    }

    async fn find_entity(&self, tenant_id: &str, name: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT id, tenant_id, memory_type, payload, created_by, created_at
                 FROM memory_records
                 WHERE tenant_id = ? AND memory_type = 'entity'
                   AND json_extract(payload, '$.name') = ?
                 ORDER BY created_at, id
                 LIMIT 1",
                params![tenant_id, name],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_page(
        &self,
        tenant_id: &str,
        kind: RecordKind,
        cursor: Option<PageCursor>,
        limit: u32,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.get_conn()?;

        let mut rows = match cursor {
            Some(cursor) => {
                let pos = ts(&cursor.created_at);
                conn.query(
                    "SELECT id, tenant_id, memory_type, payload, created_by, created_at
                     FROM memory_records
                     WHERE tenant_id = ? AND memory_type = ?
                       AND (created_at > ? OR (created_at = ? AND id > ?))
                     ORDER BY created_at, id
                     LIMIT ?",
                    params![
                        tenant_id,
                        kind.as_str(),
                        pos.clone(),
                        pos,
                        cursor.id.to_string(),
                        limit as i64,
                    ],
                )
                .await?
            }
            None => {
                conn.query(
                    "SELECT id, tenant_id, memory_type, payload, created_by, created_at
                     FROM memory_records
                     WHERE tenant_id = ? AND memory_type = ?
                     ORDER BY created_at, id
                     LIMIT ?",
                    params![tenant_id, kind.as_str(), limit as i64],
                )
                .await?
            }
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn count_records(&self, tenant_id: &str, kind: RecordKind) -> Result<u64> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM memory_records WHERE tenant_id = ? AND memory_type = ?",
                params![tenant_id, kind.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    async fn list_entities_by_type(
        &self,
        tenant_id: &str,
        entity_type: &str,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT id, tenant_id, memory_type, payload, created_by, created_at
                 FROM memory_records
                 WHERE tenant_id = ? AND memory_type = 'entity'
                   AND json_extract(payload, '$.entity_type') = ?
                 ORDER BY created_at, id",
                params![tenant_id, entity_type],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn observations_for_entity(
        &self,
        tenant_id: &str,
        entity_name: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.get_conn()?;

        let mut sql = String::from(
            "SELECT id, tenant_id, memory_type, payload, created_by, created_at
             FROM memory_records
             WHERE tenant_id = ? AND memory_type = 'observation'
               AND json_extract(payload, '$.entity_name') = ?",
        );
        let mut args: Vec<Value> = vec![
            Value::Text(tenant_id.to_string()),
            Value::Text(entity_name.to_string()),
        ];

        if let Some(since) = since {
            sql.push_str(" AND created_at >= ?");
            args.push(Value::Text(ts(&since)));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(limit as i64));
        }

        let mut rows = conn.query(&sql, libsql::params_from_iter(args)).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn observations_for_entities(
        &self,
        tenant_id: &str,
        entity_names: &[String],
    ) -> Result<Vec<MemoryRecord>> {
        if entity_names.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;

        let placeholders = vec!["?"; entity_names.len()].join(", ");
        let sql = format!(
            "SELECT id, tenant_id, memory_type, payload, created_by, created_at
             FROM memory_records
             WHERE tenant_id = ? AND memory_type = 'observation'
               AND json_extract(payload, '$.entity_name') IN ({})
             ORDER BY created_at, id",
            placeholders
        );

        let mut args: Vec<Value> = Vec::with_capacity(entity_names.len() + 1);
        args.push(Value::Text(tenant_id.to_string()));
        for name in entity_names {
            args.push(Value::Text(name.clone()));
        }

        let mut rows = conn.query(&sql, libsql::params_from_iter(args)).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn relations_from_entities(
        &self,
        tenant_id: &str,
        entity_names: &[String],
    ) -> Result<Vec<MemoryRecord>> {
        if entity_names.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;

        let placeholders = vec!["?"; entity_names.len()].join(", ");
        let sql = format!(
            "SELECT id, tenant_id, memory_type, payload, created_by, created_at
             FROM memory_records
             WHERE tenant_id = ? AND memory_type = 'relation'
               AND json_extract(payload, '$.from') IN ({})
             ORDER BY created_at, id",
            placeholders
        );

        let mut args: Vec<Value> = Vec::with_capacity(entity_names.len() + 1);
        args.push(Value::Text(tenant_id.to_string()));
        for name in entity_names {
            args.push(Value::Text(name.clone()));
        }

        let mut rows = conn.query(&sql, libsql::params_from_iter(args)).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn observation_counts(&self, tenant_id: &str) -> Result<HashMap<String, u64>> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT json_extract(payload, '$.entity_name') AS entity_name, COUNT(*)
                 FROM memory_records
                 WHERE tenant_id = ? AND memory_type = 'observation'
                 GROUP BY entity_name",
                params![tenant_id],
            )
            .await?;

        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await? {
            let name: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.insert(name, count as u64);
        }
        Ok(counts)
    }

    async fn replace_observation(
        &self,
        tenant_id: &str,
        id: RecordId,
        contents: &[String],
        message_type: Option<&str>,
    ) -> Result<MemoryRecord> {
        let mut record = self.get_record(tenant_id, id).await?;

        let payload = match record.payload {
            RecordPayload::Observation {
                entity_name,
                sensitive,
                ..
            } => RecordPayload::Observation {
                entity_name,
                contents: contents.to_vec(),
                message_type: message_type.map(String::from),
                sensitive,
            },
            _ => {
                return Err(MnemographError::Validation(format!(
                    "record {} is not an observation",
                    id
                )))
            }
        };

        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE memory_records SET payload = ? WHERE tenant_id = ? AND id = ?",
            params![
                serde_json::to_string(&payload)?,
                tenant_id,
                id.to_string()
            ],
        )
        .await?;

        record.payload = payload;
        Ok(record)
    }

    async fn plan_entity_cascade(
        &self,
        tenant_id: &str,
        entity_name: &str,
    ) -> Result<CascadeOutcome> {
        let conn = self.get_conn()?;
        Self::cascade_targets(&conn, tenant_id, entity_name).await
    }

    async fn delete_entity_cascade(
        &self,
        tenant_id: &str,
        entity_name: &str,
    ) -> Result<CascadeOutcome> {
        let conn = self.get_conn()?;
        let tx = conn.transaction().await?;

        let outcome = Self::cascade_targets(&tx, tenant_id, entity_name).await?;

        tx.execute(
            "DELETE FROM memory_records
             WHERE tenant_id = ? AND memory_type = 'observation'
               AND json_extract(payload, '$.entity_name') = ?",
            params![tenant_id, entity_name],
        )
        .await?;

        tx.execute(
            "DELETE FROM memory_records
             WHERE tenant_id = ? AND memory_type = 'relation'
               AND (json_extract(payload, '$.from') = ?
                    OR json_extract(payload, '$.to') = ?)",
            params![tenant_id, entity_name, entity_name],
        )
        .await?;

        tx.execute(
            "DELETE FROM memory_records
             WHERE tenant_id = ? AND memory_type = 'entity'
               AND json_extract(payload, '$.name') = ?",
            params![tenant_id, entity_name],
        )
        .await?;

        tx.commit().await?;

        debug!(
            tenant_id,
            entity_name,
            observations = outcome.observations,
            relations = outcome.relations,
            "entity cascade deleted"
        );
        Ok(outcome)
    }

    async fn plan_delete_observations(
        &self,
        tenant_id: &str,
        entity_name: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>> {
        let conn = self.get_conn()?;
        Self::matching_observation_ids(&conn, tenant_id, entity_name, ids).await
    }

    async fn delete_observations(
        &self,
        tenant_id: &str,
        entity_name: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>> {
        let conn = self.get_conn()?;
        let tx = conn.transaction().await?;

        let found = Self::matching_observation_ids(&tx, tenant_id, entity_name, ids).await?;
        if found.is_empty() {
            tx.commit().await?;
            return Ok(found);
        }

        let placeholders = vec!["?"; found.len()].join(", ");
        let sql = format!(
            "DELETE FROM memory_records WHERE tenant_id = ? AND id IN ({})",
            placeholders
        );
        let mut args: Vec<Value> = Vec::with_capacity(found.len() + 1);
        args.push(Value::Text(tenant_id.to_string()));
        for id in &found {
            args.push(Value::Text(id.to_string()));
        }
        tx.execute(&sql, libsql::params_from_iter(args)).await?;
        tx.commit().await?;

        Ok(found)
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO messages (id, tenant_id, to_agent, from_agent, body, read_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                message.id.to_string(),
                message.tenant_id.clone(),
                message.to_agent.clone(),
                message.from_agent.clone(),
                message.body.clone(),
                message.read_at.as_ref().map(ts),
                ts(&message.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn count_unread_messages(&self, tenant_id: &str, agent: &str) -> Result<u64> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM messages
                 WHERE tenant_id = ? AND to_agent = ? AND read_at IS NULL",
                params![tenant_id, agent],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    async fn replace_handoff(&self, handoff: &Handoff) -> Result<()> {
        let conn = self.get_conn()?;
        let tx = conn.transaction().await?;

        // Deactivate-then-insert inside one transaction: no reader ever
        // observes two active handoffs for the same (tenant, project).
        tx.execute(
            "UPDATE handoffs SET active = 0
             WHERE tenant_id = ? AND project_id = ? AND active = 1",
            params![handoff.tenant_id.clone(), handoff.project_id.clone()],
        )
        .await?;

        tx.execute(
            "INSERT INTO handoffs
                 (id, tenant_id, project_id, from_agent, summary, open_items,
                  created_at, consumed_at, active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)",
            params![
                handoff.id.to_string(),
                handoff.tenant_id.clone(),
                handoff.project_id.clone(),
                handoff.from_agent.clone(),
                handoff.summary.clone(),
                serde_json::to_string(&handoff.open_items)?,
                ts(&handoff.created_at),
                handoff.consumed_at.as_ref().map(ts),
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn consume_handoff(&self, tenant_id: &str, project_id: &str) -> Result<Option<Handoff>> {
        let conn = self.get_conn()?;
        let tx = conn.transaction().await?;

        let mut rows = tx
            .query(
                "SELECT id, tenant_id, project_id, from_agent, summary, open_items,
                        created_at, consumed_at, active
                 FROM handoffs
                 WHERE tenant_id = ? AND project_id = ? AND active = 1
                   AND consumed_at IS NULL
                 LIMIT 1",
                params![tenant_id, project_id],
            )
            .await?;

        let handoff = match rows.next().await? {
            Some(row) => Self::row_to_handoff(&row)?,
            None => {
                tx.commit().await?;
                return Ok(None);
            }
        };

        let consumed_at = Utc::now();
        tx.execute(
            "UPDATE handoffs SET consumed_at = ? WHERE id = ?",
            params![ts(&consumed_at), handoff.id.to_string()],
        )
        .await?;
        tx.commit().await?;

        Ok(Some(Handoff {
            consumed_at: Some(consumed_at),
            ..handoff
        }))
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO audit_log
                 (operation, tenant_id, actor_id, content_hash, flagged, flag_reason,
                  target_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                event.operation.clone(),
                event.tenant_id.clone(),
                event.actor_id.clone(),
                event.content_hash.clone(),
                if event.flagged { 1i64 } else { 0i64 },
                event.flag_reason.clone(),
                event.target_count as i64,
                ts(&Utc::now()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_audit(&self, tenant_id: &str, limit: u32) -> Result<Vec<AuditLogEntry>> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT id, operation, tenant_id, actor_id, content_hash, flagged,
                        flag_reason, target_count, created_at
                 FROM audit_log
                 WHERE tenant_id = ?
                 ORDER BY id DESC
                 LIMIT ?",
                params![tenant_id, limit as i64],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let flagged: i64 = row.get(5)?;
            let created_at: String = row.get(8)?;
            entries.push(AuditLogEntry {
                id: row.get(0)?,
                operation: row.get(1)?,
                tenant_id: row.get(2)?,
                actor_id: row.get(3)?,
                content_hash: row.get(4)?,
                flagged: flagged != 0,
                flag_reason: row.get(6)?,
                target_count: row.get::<i64>(7)? as u64,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(entries)
    }

    async fn insert_tombstone(
        &self,
        external_id: &str,
        tenant_id: &str,
        error: &str,
    ) -> Result<()> {
        warn!(external_id, tenant_id, error, "tombstoning failed vector mutation");

        let conn = self.get_conn()?;
        // INSERT OR IGNORE keeps concurrent writers from racing on the same
        // external id; the first failure's record wins.
        conn.execute(
            "INSERT OR IGNORE INTO vector_tombstones
                 (external_id, tenant_id, failed_at, retry_count, last_error)
             VALUES (?, ?, ?, 0, ?)",
            params![external_id, tenant_id, ts(&Utc::now()), error],
        )
        .await?;
        Ok(())
    }

    async fn oldest_tombstones(&self, limit: u32) -> Result<Vec<TombstoneEntry>> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query(
                "SELECT external_id, tenant_id, failed_at, retry_count, last_error
                 FROM vector_tombstones
                 ORDER BY failed_at, external_id
                 LIMIT ?",
                params![limit as i64],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let failed_at: String = row.get(2)?;
            entries.push(TombstoneEntry {
                external_id: row.get(0)?,
                tenant_id: row.get(1)?,
                failed_at: parse_ts(&failed_at)?,
                retry_count: row.get::<i64>(3)? as u32,
                last_error: row.get(4)?,
            });
        }
        Ok(entries)
    }

    async fn remove_tombstone(&self, external_id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM vector_tombstones WHERE external_id = ?",
            params![external_id],
        )
        .await?;
        Ok(())
    }

    async fn record_tombstone_failure(&self, external_id: &str, error: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE vector_tombstones
             SET retry_count = retry_count + 1, last_error = ?
             WHERE external_id = ?",
            params![error, external_id],
        )
        .await?;
        Ok(())
    }

    async fn count_tombstones(&self) -> Result<u64> {
        let conn = self.get_conn()?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM vector_tombstones", params![])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let sql = "-- comment\nCREATE TABLE a (id TEXT);\n\nCREATE INDEX idx\n    ON a (id);\n";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE"));
        assert!(statements[1].contains("ON a (id)"));
    }

    #[test]
    fn test_timestamp_format_sorts_lexicographically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(ts(&earlier) < ts(&later));
        assert_eq!(parse_ts(&ts(&earlier)).unwrap().timestamp_micros(), earlier.timestamp_micros());
    }
}
