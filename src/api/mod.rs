//! HTTP API surface

pub mod identity;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
