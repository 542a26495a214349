//! Foresight Backend Server
//! Mission: Wire the orchestration engine together and serve the API

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use foresight_backend::api::{create_router, AppState};
use foresight_backend::auth::JwtHandler;
use foresight_backend::credits::CreditLedger;
use foresight_backend::models::Config;
use foresight_backend::provider::OpenRouterProvider;
use foresight_backend::registry::ModelRegistry;
use foresight_backend::session::{
    AdmissionController, DispatchQueue, Dispatcher, RecoveryMonitor, SessionStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "foresight_backend=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Foresight backend...");

    let config = Config::from_env()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let ledger = Arc::new(CreditLedger::new(
        &config.credits_db_path,
        config.starting_credits,
    )?);
    info!("💳 Credit ledger ready: {}", config.credits_db_path);

    let store = Arc::new(SessionStore::new(&config.sessions_db_path)?);
    info!("🗂️  Session store ready: {}", config.sessions_db_path);

    let registry = Arc::new(ModelRegistry::from_env());
    info!("⚙️  Model registry: {} models", registry.available().len());

    let provider = Arc::new(OpenRouterProvider::from_env(
        http,
        Duration::from_secs(config.provider_timeout_secs),
    )?);

    let (queue, dispatch_rx) = DispatchQueue::new();
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        provider,
        config.provider_concurrency,
        Duration::from_secs(config.provider_timeout_secs),
    ));
    dispatcher.spawn_workers(config.dispatch_workers, dispatch_rx);

    let admission = AdmissionController::new(
        ledger.clone(),
        registry.clone(),
        store.clone(),
        queue.clone(),
    );

    let recovery = Arc::new(RecoveryMonitor::new(
        store.clone(),
        queue,
        config.stuck_threshold_secs,
        Duration::from_secs(config.recovery_poll_secs),
    ));
    recovery.clone().spawn();

    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));

    let state = AppState {
        store,
        ledger,
        registry,
        admission,
        recovery,
        sse_poll: Duration::from_millis(config.sse_poll_ms),
    };

    let app = create_router(state, jwt_handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("✅ Foresight backend listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
