//! Voice bridge server entry point
//!
//! Serves the health and metrics surface. Sessions are created by the
//! media transport integration and registered on the shared registry;
//! this binary owns the registry, the exporter, and the HTTP listener.

use std::net::SocketAddr;
use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voicebridge_config::{load_settings, Settings};
use voicebridge_server::{create_router, init_metrics, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Priority: env vars > config file > defaults
    let config_path = std::env::var("VOICEBRIDGE_CONFIG").ok();
    let settings = match load_settings(config_path.as_deref().map(Path::new)) {
        Ok(settings) => settings,
        Err(err) => {
            // tracing not yet initialized
            eprintln!("warning: failed to load config: {err}; using defaults");
            Settings::default()
        }
    };

    init_tracing(&settings);
    tracing::info!("starting voicebridge v{}", env!("CARGO_PKG_VERSION"));

    let _metrics_handle = init_metrics()?;
    tracing::info!("prometheus metrics at /metrics/prometheus");

    let state = AppState::new(settings.clone());
    let cleanup_shutdown = state.registry.start_cleanup_task();

    let app = create_router(state);
    let addr: SocketAddr =
        format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    tracing::info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = cleanup_shutdown.send(true);
    tracing::info!("server shutdown complete");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "voicebridge={},tower_http=info",
            settings.observability.log_level
        )
        .into()
    });

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
