mod configuration;
mod error;
mod routes;
mod state;

use chorus::orchestrator::Orchestrator;
use configuration::Settings;
use dotenv::dotenv;
use state::AppState;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    dotenv().ok();

    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let settings = Settings::new()?;
    let specs = settings.backend_specs()?;
    let capability = settings.capability_provider();

    let orchestrator = Orchestrator::from_configs(specs, &settings.system_prompt, capability);
    info!("Configured backends: {:?}", orchestrator.backend_ids());
    let state = AppState::new(orchestrator);

    // Create router with CORS support
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state.clone()).layer(cors);

    // Run the server
    let listener = tokio::net::TcpListener::bind(settings.server.socket_addr()?).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
