//! VLM Server - HTTP and SSE API for multimodal chat generation

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use state::AppState;
use vlm_core::backends::Gemma3Loader;
use vlm_core::{EngineConfig, ServerConfig, VlmService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vlm_server=debug,vlm_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting VLM Server");

    let server_config = ServerConfig::default();
    let config = match std::env::var("VLM_CONFIG") {
        Ok(path) => {
            info!("Loading engine configuration from {path}");
            EngineConfig::from_file(std::path::Path::new(&path))?
        }
        Err(_) => EngineConfig::default(),
    };
    info!("Model: {} (cache {:?})", config.model_id, config.models_dir);

    let loader = Arc::new(Gemma3Loader::new(
        config.models_dir.clone(),
        config.use_metal,
    ));
    let service = Arc::new(VlmService::new(config, loader));
    let state = AppState::new(Arc::clone(&service), &server_config);

    // Warm the model in the background; requests trigger their own load attempts.
    {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if service.ensure_ready().await {
                info!("Model loaded and ready");
            } else {
                let status = service.load_status().await;
                warn!(
                    "Starting in degraded mode: {}",
                    status.last_error.as_deref().unwrap_or("model not loaded")
                );
            }
        });
    }

    let app = api::create_router(state.clone(), &server_config);

    let addr = format!("{}:{}", server_config.host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(state));

    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    service.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
    // No new permits once the listener stops accepting.
    state.request_semaphore.close();
}
