//! Gyeot - a conversational companion for elderly users
//!
//! A Rust backend that relays messages to a language model, keeps the
//! conversation log, and escalates to caregivers when risk is detected.

mod api;
mod config;
mod db;
mod interpreter;
mod llm;
mod medication;
mod notify;
mod report;
mod runtime;
mod state_machine;
mod system_prompt;

use api::{create_router, AppState};
use config::CareConfig;
use db::Database;
use interpreter::{LlmTurnInterpreter, TurnInterpreter};
use llm::{LlmConfig, ModelRegistry};
use notify::{gateway_from_config, outbox, NotificationDispatcher};
use runtime::{recover_follow_ups, CareRuntime, DatabaseStorage, FollowUpSweeper};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gyeot=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = CareConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let storage = DatabaseStorage::new(Database::open(&config.db_path)?);

    // Follow-ups a crash left in flight
    let recovered = recover_follow_ups(&storage).await?;
    if !recovered.is_empty() {
        tracing::info!(count = recovered.len(), "Recovered interrupted follow-ups");
    }

    // Initialize LLM registry
    let llm_registry = ModelRegistry::new(&LlmConfig::from_env());
    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("No LLM API keys configured. Set GROQ_API_KEY, OPENAI_API_KEY or LLM_GATEWAY.");
    }
    let interpreter: Arc<dyn TurnInterpreter> =
        Arc::new(LlmTurnInterpreter::from_registry(&llm_registry));

    // Background workers
    let cancel = CancellationToken::new();
    let gateway = gateway_from_config(&config.notify)?;
    let (outbox_tx, outbox_rx) = outbox();
    let dispatcher =
        tokio::spawn(NotificationDispatcher::new(gateway, outbox_rx).run(cancel.clone()));

    let runtime = CareRuntime::new(storage, interpreter, outbox_tx, &config);
    let sweeper =
        tokio::spawn(FollowUpSweeper::new(runtime.engine().clone()).run(cancel.clone()));

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new().gzip(true).br(true);

    let app = create_router(AppState::new(runtime))
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Gyeot server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    let _ = tokio::join!(dispatcher, sweeper);
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    cancel.cancel();
}
