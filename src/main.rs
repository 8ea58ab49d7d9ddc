mod api;
mod auth;
mod config;
mod ingest;
mod ingress;
mod manager;
mod metrics;
mod model;
mod mqtt;
mod publish;
mod query;
mod registry;
mod retry;
mod store;
mod tcp;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::ingress::IngressDeps;
use crate::manager::SubscriptionManager;
use crate::mqtt::MqttPool;
use crate::registry::SubscriberRegistry;
use crate::retry::RetryPolicy;
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(name = "metermon")]
#[command(about = "Power-meter telemetry ingestion and query service")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "metermon.toml")]
    config: PathBuf,

    /// Bind address for the HTTP API (overrides config file)
    #[arg(long)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingestion and API service (the default)
    Serve,
    /// Create a dashboard account
    CreateUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("metermon=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }

    let store = Store::open(&config.database.url)
        .await
        .context("database bootstrap failed")?;

    if let Some(Command::CreateUser { username, password }) = &args.command {
        let hash = auth::hash_password(password)?;
        let user = store.create_user(username, &hash).await?;
        println!("created user {} ({})", user.username, user.id);
        return Ok(());
    }

    if config.auth.jwt_secret == "change-me" {
        warn!("auth.jwt_secret is the default value; set a real secret in production");
    }

    let policy = RetryPolicy::default();
    let registry = Arc::new(SubscriberRegistry::new());
    let pool = Arc::new(
        MqttPool::new(Arc::clone(&registry), store.clone(), policy)
            .with_queue_capacity(config.ingest.queue_capacity),
    );
    let deps = IngressDeps {
        pool: Arc::clone(&pool),
        registry: Arc::clone(&registry),
        store: store.clone(),
        policy,
    };
    let manager = Arc::new(SubscriptionManager::new(deps));
    manager
        .startup()
        .await
        .context("failed to start collection workers")?;

    let state = AppState {
        store,
        registry,
        manager: Arc::clone(&manager),
        pool: Arc::clone(&pool),
        jwt_secret: Arc::from(config.auth.jwt_secret.as_str()),
    };
    let router = api::router(state);

    let listener = TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;
    info!(bind = %config.http.bind, "api server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("api server failed")?;

    manager.shutdown().await;
    pool.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
