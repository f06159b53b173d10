//! Mnemograph - tenant-isolated knowledge-graph memory for AI agents
//!
//! A memory engine holding entities, observations (free-text notes attached
//! to an entity), and typed relations between entities in one embedded
//! relational store, exposed through policy-filtered read and mutation
//! operations:
//! - Tenant and role-based isolation enforced on every read and write
//! - Deterministic sensitivity classification of observations
//! - Paginated graph exports with permission-aware cache tokens
//! - Tiered, token-budgeted session context for resuming agents
//! - Cascading mutations with tombstone-backed cleanup of an external
//!   vector index
//!
//! # Architecture
//!
//! The system is organized into several layers:
//! - **Types**: Core data structures (records, request context, handoffs)
//! - **Storage**: The libSQL relational store behind the `MemoryStore` trait
//! - **Engines**: Export, session-context assembly, and mutations
//! - **API**: axum HTTP surface consuming identity from the external auth
//!   collaborator
//!
//! # Example
//!
//! ```ignore
//! use mnemograph_core::{
//!     ExportEngine, ExportQuery, LibsqlStore, RequestContext,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(LibsqlStore::new_local("mnemograph.db").await?);
//!     let export = ExportEngine::new(store, false);
//!
//!     let context = RequestContext::dev("tenant-a", "agent-1");
//!     let outcome = export.export(&context, &ExportQuery::default()).await?;
//!     println!("etag: {}", outcome.etag);
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod mutation;
pub mod notify;
pub mod sanitize;
pub mod sensitivity;
pub mod storage;
pub mod tombstone;
pub mod types;
pub mod vector;

// Re-export commonly used types
pub use auth::{authorize_mutation, authorize_read, Permission};
pub use config::MnemographConfig;
pub use context::{
    CharRatioEstimator, ContextAssembler, ContextDepth, SessionContextRequest, TokenEstimator,
};
pub use error::{MnemographError, Result};
pub use export::{ExportBody, ExportEngine, ExportQuery};
pub use mutation::MutationEngine;
pub use notify::{AlertNotifier, LogNotifier, NullNotifier};
pub use storage::{libsql::ConnectionMode, libsql::LibsqlStore, MemoryStore};
pub use tombstone::TombstoneSweeper;
pub use types::{
    AuthType, MemoryRecord, RecordId, RecordKind, RecordPayload, RequestContext,
};
pub use vector::{HttpVectorIndex, InMemoryVectorIndex, VectorIndex};
