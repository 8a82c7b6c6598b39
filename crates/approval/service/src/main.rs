use approval_engine::EngineConfig;
use approval_service::{build_router, ServiceConfig, ServiceState};
use approval_store::StorageConfig;
use clap::{ArgAction, Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "approvald", version, about = "Threshold approval REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8095
    #[arg(long, default_value = "127.0.0.1:8095", env = "APPROVAL_LISTEN")]
    listen: SocketAddr,
    /// Request persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "APPROVAL_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for requests and confirmations.
    #[arg(long, env = "APPROVAL_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "APPROVAL_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Dispatch as soon as a confirmation crosses the threshold.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "APPROVAL_AUTO_DISPATCH")]
    auto_dispatch: bool,
    /// Automatic dispatch attempts per request before waiting for an explicit dispatch.
    #[arg(long, default_value_t = 3, env = "APPROVAL_MAX_DISPATCH_ATTEMPTS")]
    max_dispatch_attempts: u32,
    /// Seconds to wait for a final ledger receipt before the outcome is ambiguous.
    #[arg(long, default_value_t = 60, env = "APPROVAL_RECEIPT_TIMEOUT_SECS")]
    receipt_timeout_secs: u64,
    /// Seconds before an executing request with no recorded outcome may be settled manually.
    #[arg(long, default_value_t = 600, env = "APPROVAL_EXECUTION_LEASE_SECS")]
    execution_lease_secs: u64,
    /// Chains served by the local ledger network (repeatable).
    #[arg(long = "ledger-chain", default_value = "devnet")]
    ledger_chains: Vec<String>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn engine_config(cli: &Cli) -> EngineConfig {
    let defaults = EngineConfig::default();
    EngineConfig {
        auto_dispatch: cli.auto_dispatch,
        max_dispatch_attempts: cli.max_dispatch_attempts.max(1),
        receipt_timeout: Duration::from_secs(cli.receipt_timeout_secs),
        execution_lease: Duration::from_secs(cli.execution_lease_secs),
        ..defaults
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("approval_service=info,approval_engine=info,info")
        }))
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    info!(backend = storage.label(), "Opening approval storage");

    let config = ServiceConfig {
        storage,
        engine: engine_config(&cli),
        ledger_chains: cli.ledger_chains.clone(),
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("approval-service REST listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await?;

    Ok(())
}
