use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adpilot::config::Config;
use adpilot::crypto::TokenCipher;
use adpilot::facebook::GraphClient;
use adpilot::ratelimit::SystemUserManager;
use adpilot::AppState;

#[derive(Parser, Debug)]
#[command(name = "adpilot")]
#[command(author, version, about = "Facebook campaign backend with rate-limit aware dispatch", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "adpilot.toml", env = "ADPILOT_CONFIG")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a bearer token signed with the configured JWT secret
    Token {
        /// User id placed in the `sub` claim
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 86400)]
        ttl_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(Command::Token { user, ttl_secs }) = cli.command {
        if config.auth.jwt_secret_generated {
            anyhow::bail!(
                "auth.jwt_secret is not set in {}; a token signed with a generated secret would never verify",
                cli.config.display()
            );
        }
        let token = adpilot::api::auth::issue_token(&config.auth.jwt_secret, &user, ttl_secs)?;
        println!("{}", token);
        return Ok(());
    }

    tracing::info!("Starting adpilot v{}", env!("CARGO_PKG_VERSION"));
    if config.auth.jwt_secret_generated {
        tracing::warn!("auth.jwt_secret is not configured; using a random secret, no issued token will verify");
    }

    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.server.data_dir.display()
        )
    })?;

    // Initialize database
    let db = adpilot::db::init(&config.server.data_dir).await?;

    let cipher = TokenCipher::from_secret(&config.auth.encryption_key);
    adpilot::db::seed_backup_apps(&db, &config.backup_apps, &cipher).await?;

    let system_users = Arc::new(SystemUserManager::from_config(&config.system_users, &cipher)?);

    let graph = Arc::new(GraphClient::new(&config.facebook)?);

    let mut state = AppState::new(config.clone(), db.clone(), cipher, graph, system_users);
    match adpilot::api::metrics::init_metrics() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(e) => tracing::warn!("Metrics disabled: {}", e),
    }
    let state = Arc::new(state);

    // Background tasks
    adpilot::engine::spawn_queue_processor_task(
        db.clone(),
        state.campaigns.clone(),
        config.rate_limit.clone(),
    );
    adpilot::engine::spawn_snapshot_collector_task(
        state.intelligence.snapshots.clone(),
        state.intelligence.patterns.clone(),
        config.intelligence.collect_interval_secs,
    );
    adpilot::engine::spawn_automation_evaluator_task(
        state.intelligence.automation.clone(),
        config.intelligence.automation_interval_secs,
    );
    adpilot::engine::spawn_cleanup_task(db.clone());

    match state.intelligence.backfill.resume_interrupted().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(jobs = n, "Resumed interrupted backfill jobs"),
        Err(e) => tracing::error!(error = %e, "Failed to resume backfill jobs"),
    }

    let app = adpilot::api::create_router(state.clone());

    let api_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind {}", api_addr))?;

    tracing::info!("API server listening on http://{}", api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
