//! # Scanhub Server
//!
//! Ingests (platform, product) scan events from unattended scanning
//! stations over REST, persists them to an append-only SQLite log, and fans
//! them out in real time to WebSocket observers while tracking scanner
//! liveness via heartbeats.

use anyhow::Context;
use axum::http::{HeaderValue, Method, header};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scanhub::{
    auth::StaticTokenVerifier,
    infra::{
        app_state::AppState,
        config::Config,
        websocket::{ConnectionManager, run_status_loop},
    },
    routes,
    store::ScanStore,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "scanhub")]
#[command(about = "Scan-event backend with real-time WebSocket fan-out")]
struct Cli {
    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Path to the SQLite scan database (overrides config)
    #[arg(long, env = "DATABASE_PATH")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = ScanStore::connect(&config.database_path)
        .await
        .context("failed to open scan database")?;
    store.init().await.context("failed to initialize schema")?;

    let (manager, status_events) = ConnectionManager::new();
    tokio::spawn(run_status_loop(manager.clone(), status_events));

    let state = AppState {
        store: Arc::new(store),
        manager: manager.clone(),
        token_verifier: Arc::new(StaticTokenVerifier::from_config(&config)),
        config: Arc::new(config.clone()),
    };

    let app = routes::create_router(state)
        .layer(cors_layer(&config)?)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid server address")?;
    info!(%addr, "scanhub listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down, closing connections");
    manager.close_all().await;
    info!("shutdown complete");
    Ok(())
}

fn cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let origins = config
        .cors_allowed_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid CORS origin")?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
