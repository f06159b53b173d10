//! Mnemograph - tenant-isolated knowledge-graph memory for AI agents
//!
//! Main entry point: initialize the database, run the HTTP server (with the
//! background tombstone sweeper), or run a one-shot sweep pass.

use clap::{Parser, Subcommand};
use mnemograph_core::{
    api::{ApiServer, ApiServerConfig, AppState},
    config::MnemographConfig,
    context::{CharRatioEstimator, ContextAssembler},
    export::ExportEngine,
    mutation::MutationEngine,
    notify::LogNotifier,
    storage::libsql::LibsqlStore,
    storage::MemoryStore,
    tombstone::TombstoneSweeper,
    vector::{HttpVectorIndex, InMemoryVectorIndex, VectorIndex},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mnemograph", version, about = "Tenant-isolated knowledge-graph memory engine")]
struct Cli {
    /// Path to a config file (TOML); defaults and environment apply without it
    #[arg(long, global = true)]
    config: Option<String>,

    /// Database path override
    #[arg(long, global = true, env = "MNEMOGRAPH_DB_PATH")]
    db_path: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and bring the schema up to date
    Init,
    /// Run the HTTP API server with the background tombstone sweeper
    Serve {
        /// Listen address override, e.g. 127.0.0.1:7690
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Run one tombstone sweep pass and exit
    Sweep,
}

fn init_tracing(level: &str) {
    // Engine logs at the requested level; noisy dependencies stay at warn
    let filter = EnvFilter::new(format!("mnemograph={},tower_http=warn,hyper=warn", level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_vector_index(config: &MnemographConfig) -> anyhow::Result<Arc<dyn VectorIndex>> {
    match &config.vector.endpoint {
        Some(endpoint) => {
            info!("Using vector index at {}", endpoint);
            Ok(Arc::new(HttpVectorIndex::new(
                endpoint,
                config.vector_timeout(),
            )?))
        }
        None => {
            warn!("No vector index endpoint configured; using in-memory stand-in");
            Ok(Arc::new(InMemoryVectorIndex::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    debug!("mnemograph v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = MnemographConfig::load(cli.config.as_deref())?;
    if let Some(db_path) = cli.db_path {
        config.database.path = db_path;
    }

    match cli.command {
        Commands::Init => {
            // Opening the store creates the file and applies migrations
            let store = LibsqlStore::new_local(&config.database.path).await?;
            if config.auth.dev_mode {
                store
                    .ensure_tenant(&config.auth.dev_tenant, &config.auth.dev_tenant)
                    .await?;
                store
                    .ensure_user(
                        &config.auth.dev_user,
                        &config.auth.dev_tenant,
                        "development user",
                    )
                    .await?;
            }
            println!("Initialized database at {}", config.database.path);
            Ok(())
        }

        Commands::Serve { addr } => {
            let store = Arc::new(LibsqlStore::new_local(&config.database.path).await?);
            let vector = build_vector_index(&config)?;
            let legacy = config.auth.legacy_api_key_passthrough;

            let state = AppState {
                export: Arc::new(ExportEngine::new(store.clone(), legacy)),
                assembler: Arc::new(ContextAssembler::new(
                    store.clone(),
                    Arc::new(CharRatioEstimator::default()),
                    config.context.clone(),
                    legacy,
                )),
                mutations: Arc::new(MutationEngine::new(
                    store.clone(),
                    vector.clone(),
                    Arc::new(LogNotifier),
                    legacy,
                    config.vector_timeout(),
                )),
                auth: config.auth.clone(),
            };

            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            let sweeper = Arc::new(TombstoneSweeper::new(
                store,
                vector,
                config.sweep.clone(),
                config.vector_timeout(),
            ));
            let sweep_handle = sweeper.spawn(shutdown_rx);

            let server_config = ApiServerConfig {
                addr: addr.unwrap_or_else(|| {
                    format!("{}:{}", config.server.host, config.server.port)
                        .parse()
                        .unwrap_or_else(|_| ApiServerConfig::default().addr)
                }),
            };

            let result = ApiServer::new(server_config, state).serve().await;

            let _ = shutdown_tx.send(());
            sweep_handle.abort();
            result
        }

        Commands::Sweep => {
            let store = Arc::new(LibsqlStore::new_local(&config.database.path).await?);
            let vector = build_vector_index(&config)?;
            let sweeper = TombstoneSweeper::new(
                store,
                vector,
                config.sweep.clone(),
                config.vector_timeout(),
            );

            let stats = sweeper.sweep_once().await?;
            println!(
                "Sweep complete: {} retried, {} cleared, {} failed",
                stats.retried, stats.cleared, stats.failed
            );
            Ok(())
        }
    }
}
