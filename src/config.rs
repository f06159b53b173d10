//! Configuration for the mnemograph engine
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! config file, then `MNEMOGRAPH_*` environment variables (sections
//! separated with `__`, e.g. `MNEMOGRAPH_SERVER__PORT=8080`).

use crate::context::ContextConfig;
use crate::error::Result;
use crate::tombstone::SweepConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("mnemograph")
            .join("mnemograph.db");
        Self {
            path: path.to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7690,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Grant full permissions to API keys with an empty scope list.
    /// Backward-compatibility escape hatch; every use is logged.
    pub legacy_api_key_passthrough: bool,
    /// Synthesize a dev identity when no identity headers are present.
    /// Local/test use only.
    pub dev_mode: bool,
    pub dev_tenant: String,
    pub dev_user: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            legacy_api_key_passthrough: false,
            dev_mode: false,
            dev_tenant: "dev".to_string(),
            dev_user: "dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Base URL of the vector-index collaborator; absent means run without
    /// one (an in-memory stand-in is used)
    pub endpoint: Option<String>,
    /// Per-call budget before degrading to tombstone-and-continue
    pub timeout_ms: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MnemographConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub vector: VectorConfig,
    pub context: ContextConfig,
    pub sweep: SweepConfig,
}

impl MnemographConfig {
    /// Load configuration: defaults < optional file < environment
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&MnemographConfig::default())?);

        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MNEMOGRAPH")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn vector_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.vector.timeout_ms)
    }
}
