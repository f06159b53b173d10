//! External vector-index collaborator
//!
//! The engine mirrors observation content to a vector-similarity backend it
//! does not own. All three operations (`store`, `search`, `delete`) are
//! best-effort: callers bound them with a timeout and degrade to
//! tombstone-and-continue on failure (see [`crate::mutation`] and
//! [`crate::tombstone`]). The HTTP implementation speaks a Weaviate-style
//! REST/GraphQL surface; the in-memory implementation backs tests and
//! index-less deployments.

use crate::error::{MnemographError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// One mirrored observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Relational record id, reused as the index object id
    pub external_id: String,
    pub tenant_id: String,
    pub entity_name: String,
    /// Joined observation contents
    pub content: String,
}

/// Similarity search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub external_id: String,
    pub score: f32,
}

/// Vector-index collaborator interface
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn store(&self, record: &VectorRecord) -> Result<()>;

    async fn search(&self, query: &str, tenant_id: &str, limit: usize) -> Result<Vec<VectorHit>>;

    /// Delete by object id. Deleting an absent id succeeds (idempotent).
    async fn delete(&self, external_id: &str) -> Result<()>;
}

/// Weaviate-style HTTP vector index client
pub struct HttpVectorIndex {
    client: reqwest::Client,
    base_url: String,
    class: String,
}

impl HttpVectorIndex {
    /// Build a client against `base_url` (e.g. `http://localhost:8080`).
    ///
    /// The request timeout here is the transport-level bound; mutation paths
    /// add their own `tokio::time::timeout` so a hung connection can never
    /// stall a caller past the configured budget.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MnemographError::VectorIndex(format!("client build failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            class: "MemoryObservation".to_string(),
        })
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn store(&self, record: &VectorRecord) -> Result<()> {
        let url = format!("{}/v1/objects", self.base_url);
        let body = serde_json::json!({
            "class": self.class,
            "id": record.external_id,
            "properties": {
                "tenant_id": record.tenant_id,
                "entity_name": record.entity_name,
                "content": record.content,
            },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MnemographError::VectorIndex(format!("store request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(MnemographError::VectorIndex(format!(
                "store returned {}",
                response.status()
            )));
        }

        debug!(external_id = %record.external_id, "vector record stored");
        Ok(())
    }

    async fn search(&self, query: &str, tenant_id: &str, limit: usize) -> Result<Vec<VectorHit>> {
        let url = format!("{}/v1/graphql", self.base_url);
        // JSON-encode the user strings so quoting/escaping inside the
        // GraphQL document is always valid.
        let query_lit = serde_json::to_string(query)?;
        let tenant_lit = serde_json::to_string(tenant_id)?;
        let graphql = format!(
            "{{ Get {{ {class}(limit: {limit}, \
             where: {{path: [\"tenant_id\"], operator: Equal, valueText: {tenant}}}, \
             nearText: {{concepts: [{query}]}}) \
             {{ _additional {{ id certainty }} }} }} }}",
            class = self.class,
            limit = limit,
            tenant = tenant_lit,
            query = query_lit,
        );

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "query": graphql }))
            .send()
            .await
            .map_err(|e| MnemographError::VectorIndex(format!("search request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(MnemographError::VectorIndex(format!(
                "search returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MnemographError::VectorIndex(format!("search decode failed: {}", e)))?;

        let hits = body["data"]["Get"][&self.class]
            .as_array()
            .map(|objects| {
                objects
                    .iter()
                    .filter_map(|obj| {
                        let additional = &obj["_additional"];
                        Some(VectorHit {
                            external_id: additional["id"].as_str()?.to_string(),
                            score: additional["certainty"].as_f64().unwrap_or(0.0) as f32,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(hits)
    }

    async fn delete(&self, external_id: &str) -> Result<()> {
        let url = format!("{}/v1/objects/{}/{}", self.base_url, self.class, external_id);

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| MnemographError::VectorIndex(format!("delete request failed: {}", e)))?;

        // Absent objects are fine: delete is idempotent
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(MnemographError::VectorIndex(format!(
                "delete returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// In-memory vector index for tests and index-less deployments
///
/// Supports per-id and global failure injection so degradation paths
/// (tombstoning, sweep retries) can be exercised deterministically.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: Mutex<HashMap<String, VectorRecord>>,
    failing_ids: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make operations on one id fail until cleared
    pub fn set_failing(&self, external_id: &str) {
        self.failing_ids
            .lock()
            .expect("vector index poisoned")
            .insert(external_id.to_string());
    }

    pub fn clear_failing(&self, external_id: &str) {
        self.failing_ids
            .lock()
            .expect("vector index poisoned")
            .remove(external_id);
    }

    /// Make every operation fail until disabled
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.records
            .lock()
            .expect("vector index poisoned")
            .contains_key(external_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("vector index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_failure(&self, external_id: &str) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst)
            || self
                .failing_ids
                .lock()
                .expect("vector index poisoned")
                .contains(external_id)
        {
            return Err(MnemographError::VectorIndex(format!(
                "injected failure for {}",
                external_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn store(&self, record: &VectorRecord) -> Result<()> {
        self.check_failure(&record.external_id)?;
        self.records
            .lock()
            .expect("vector index poisoned")
            .insert(record.external_id.clone(), record.clone());
        Ok(())
    }

    async fn search(&self, query: &str, tenant_id: &str, limit: usize) -> Result<Vec<VectorHit>> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(MnemographError::VectorIndex("injected failure".to_string()));
        }

        let needle = query.to_lowercase();
        let records = self.records.lock().expect("vector index poisoned");
        let mut hits: Vec<VectorHit> = records
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| r.content.to_lowercase().contains(&needle))
            .map(|r| VectorHit {
                external_id: r.external_id.clone(),
                score: 1.0,
            })
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, external_id: &str) -> Result<()> {
        self.check_failure(external_id)?;
        self.records
            .lock()
            .expect("vector index poisoned")
            .remove(external_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_and_delete() {
        let index = InMemoryVectorIndex::new();
        let record = VectorRecord {
            external_id: "obs-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            entity_name: "ProjectX".to_string(),
            content: "switched to PostgreSQL".to_string(),
        };

        index.store(&record).await.unwrap();
        assert!(index.contains("obs-1"));

        let hits = index.search("postgresql", "tenant-a", 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        // Other tenants never see the record
        let hits = index.search("postgresql", "tenant-b", 10).await.unwrap();
        assert!(hits.is_empty());

        index.delete("obs-1").await.unwrap();
        assert!(!index.contains("obs-1"));

        // Idempotent delete
        index.delete("obs-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let index = InMemoryVectorIndex::new();
        index.set_failing("obs-1");

        let record = VectorRecord {
            external_id: "obs-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            entity_name: "ProjectX".to_string(),
            content: "note".to_string(),
        };
        assert!(index.store(&record).await.is_err());

        index.clear_failing("obs-1");
        assert!(index.store(&record).await.is_ok());
    }
}
