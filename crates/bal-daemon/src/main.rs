//! bal-daemon entry point.
//!
//! Thin by design: load config, resolve secrets, bootstrap the runtime,
//! start the HTTP server, and own the process's exit-code discipline.
//! All route handlers live in `routes.rs`; all shared state lives in
//! `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use bal_daemon::{routes, state};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

/// Distinguishes a startup failure (exit 1: bad config, schema mismatch,
/// transport unreachable before anything started) from an unrecoverable
/// loss of a critical resource once the process was already serving
/// (exit 2).
enum DaemonError {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

fn main() -> std::process::ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    match rt.block_on(run()) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(DaemonError::Startup(e)) => {
            error!("startup failed: {e:#}");
            std::process::ExitCode::from(1)
        }
        Err(DaemonError::Runtime(e)) => {
            error!("unrecoverable runtime failure: {e:#}");
            std::process::ExitCode::from(2)
        }
    }
}

async fn run() -> Result<(), DaemonError> {
    let loaded = load_config().map_err(DaemonError::Startup)?;
    let engine_config = loaded.engine_config().map_err(DaemonError::Startup)?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    let secrets = bal_config::secrets::resolve_secrets().map_err(DaemonError::Startup)?;

    let partitions = partitions_from_env();
    let consumer_group = std::env::var("BAL_CONSUMER_GROUP").unwrap_or_else(|_| "bal-daemon".to_string());

    let runtime = bal_runtime::RootRuntime::bootstrap(&engine_config, &secrets, partitions, consumer_group)
        .await
        .map_err(DaemonError::Startup)?;

    let balance_store = runtime.balance_store.clone();
    let shared = Arc::new(state::AppState::new(balance_store));

    let app = routes::build_router(shared).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DaemonError::Startup(e.into()))?;
    info!("bal-daemon listening on http://{addr}");

    let (shutdown_tx, shutdown_rx_runtime) = tokio::sync::watch::channel(false);
    let mut shutdown_rx_server = shutdown_rx_runtime.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining partitions");
        let _ = shutdown_tx.send(true);
    });

    let runtime_handle = tokio::spawn(runtime.run(shutdown_rx_runtime));

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx_server.changed().await;
    });

    let server_result = server.await.map_err(|e| DaemonError::Runtime(e.into()));
    let runtime_result = runtime_handle.await;

    server_result?;
    match runtime_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DaemonError::Runtime(e)),
        Err(join_err) => Err(DaemonError::Runtime(anyhow::anyhow!("runtime task panicked: {join_err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("BAL_DAEMON_ADDR").ok()?.parse().ok()
}

fn load_config() -> anyhow::Result<bal_config::LoadedConfig> {
    match std::env::var("BAL_CONFIG_PATHS") {
        Ok(paths) if !paths.trim().is_empty() => {
            let list: Vec<&str> = paths.split(',').map(str::trim).collect();
            bal_config::load_layered_yaml(&list)
        }
        _ => bal_config::load_layered_yaml_from_strings(&["{}"]),
    }
}

fn partitions_from_env() -> Vec<i32> {
    std::env::var("BAL_PARTITIONS")
        .ok()
        .map(|s| s.split(',').filter_map(|p| p.trim().parse::<i32>().ok()).collect::<Vec<_>>())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![0])
}
