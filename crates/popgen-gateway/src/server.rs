//! HTTP server wiring: state construction, routes and the listener

use crate::api::{self, AppState};
use crate::auth::{IdentityProvider, TokenIdentityProvider};
use axum::{
    routing::{delete, get, post},
    Router,
};
use popgen_core::{AuthMode, PopgenConfig};
use popgen_runner::{JsonRunRegistry, RunManager, RunRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Open the configured registry and build the run manager over it.
pub fn build_manager(config: &PopgenConfig) -> anyhow::Result<Arc<RunManager>> {
    let registry: Arc<dyn RunRegistry> = match &config.registry.path {
        Some(path) => Arc::new(JsonRunRegistry::open(path)?),
        None => {
            warn!("No registry path configured - runs are kept in memory only");
            Arc::new(JsonRunRegistry::in_memory())
        }
    };
    Ok(Arc::new(RunManager::new(&config.generator, registry)))
}

pub fn build_state(config: &PopgenConfig) -> anyhow::Result<Arc<AppState>> {
    let identity: Arc<dyn IdentityProvider> =
        Arc::new(TokenIdentityProvider::from_config(&config.auth));
    Ok(Arc::new(AppState {
        manager: build_manager(config)?,
        identity,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/synthea/generate", post(api::generate))
        .route("/api/synthea/download", get(api::download))
        .route("/api/runs", get(api::list_runs))
        .route("/api/runs/admin", get(api::list_all_runs))
        .route("/api/runs/delete/:run_id", delete(api::delete_run))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn start_gateway(config: PopgenConfig) -> anyhow::Result<()> {
    let state = build_state(&config)?;
    let app = router(state);

    let bind_addr: SocketAddr =
        format!("{}:{}", config.server.bind.to_addr(), config.server.port).parse()?;

    info!("popgen v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  Generator:    {}", config.generator.root.display());
    info!("  Output:       {}", config.generator.output_root().display());
    info!("  Auth mode:    {:?}", config.auth.mode);
    if config.auth.mode == AuthMode::Token && config.auth.users.is_empty() {
        warn!("Token auth with no users configured - every request will be rejected");
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("popgen stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
