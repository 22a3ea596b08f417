#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use potassium::Dispatcher;
use server::config::{CliArgs, ServerConfig};
use server::telemetry::{init_telemetry, register_status_gauges};
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let app = server::app::build()?;
    for (route, kind) in app.routes() {
        tracing::debug!(route, %kind, "Registered endpoint");
    }
    let dispatcher = app.start(config.serve.clone()).await?;
    register_status_gauges(dispatcher.tracker());

    let router = potassium::server::router(dispatcher.clone()).layer(
        ServiceBuilder::new().layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        ),
    );

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config.server_addr, &config, &dispatcher);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // 1. Stop the workers once in-flight connections have drained
    tracing::info!("=== Phase 1: Stopping workers ===");
    if let Err(e) = dispatcher.shutdown().await {
        tracing::error!("Error during worker shutdown: {:?}", e);
    }

    // 2. Flush exporters
    tracing::info!("=== Phase 2: Flushing telemetry ===");
    providers.shutdown();

    served?;
    Ok(())
}

fn log_startup_info(addr: &str, config: &ServerConfig, dispatcher: &Dispatcher) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting {} on {} with full config: {:#?}",
            dispatcher.name(),
            addr,
            config
        );
    } else {
        tracing::info!(
            "Starting {} on {} with {} workers",
            dispatcher.name(),
            addr,
            config.serve.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
