//! `fsdd` binary entry point: load configuration, wire up the credential
//! store and METAR manager, and run the server until a shutdown signal
//! arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fsdd::auth::{Authenticator, CredentialChecker};
use fsdd::config::{config_path, Config};
use fsdd::log_format::TargetFirstFormat;
use fsdd::plugin::PluginManager;
use fsdd::weather::manager::MetarManager;

#[derive(Parser, Debug)]
#[command(name = "fsdd", about = "Flight simulator ATC/pilot network daemon")]
struct Args {
    /// Path to the TOML config file. Overrides FSDD_CONFIG/FSDD_ENV resolution.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .event_format(TargetFirstFormat)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let path = args.config.unwrap_or_else(config_path);
    let config = Config::load(&path).with_context(|| format!("loading config from {:?}", path))?;
    info!("loaded config from {:?}", path);

    let manager = ConnectionManager::<PgConnection>::new(&config.database().url);
    let pool = Pool::builder()
        .build(manager)
        .map_err(|e| anyhow::anyhow!("failed to build the database connection pool: {}", e))?;
    let credentials: Arc<dyn Authenticator> = Arc::new(CredentialChecker::new(pool));

    let metar = Arc::new(MetarManager::from_config(config.metar()));
    if metar.is_cron() {
        metar.start_cron();
    }

    let plugins = Arc::new(PluginManager::new());
    let shared = fsdd::server::build_shared(credentials, metar, plugins, Arc::new(config.server().clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    fsdd::server::run(shared, shutdown_rx).await
}
