use std::env;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paylance_relayer::handlers;
use paylance_relayer::jobs::transfer_recovery::start_transfer_recovery_job;
use paylance_relayer::services::attestation::AttestationService;
use paylance_relayer::services::event_watcher::EventWatcher;
use paylance_relayer::services::executor::ReceiveExecutor;
use paylance_relayer::services::ledger::SqlTransferStore;
use paylance_relayer::services::relay::{RelayConfig, RelayService};
use paylance_relayer::AppState;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,paylance_relayer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let private_key = env::var("RELAYER_PRIVATE_KEY").expect("RELAYER_PRIVATE_KEY must be set");
    let attestation_api_url =
        env::var("ATTESTATION_API_URL").expect("ATTESTATION_API_URL must be set");

    tracing::info!("Connecting to database...");
    let db = Database::connect(&database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    let config = RelayConfig::from_env().expect("Invalid relay destination configuration");
    tracing::info!(
        destination = config.destination.name,
        "Relay destination configured"
    );

    let store = Arc::new(SqlTransferStore::new(db.clone()));
    let executor =
        ReceiveExecutor::new(&private_key).expect("Invalid RELAYER_PRIVATE_KEY");
    let relay = RelayService::new(
        store.clone(),
        Arc::new(EventWatcher::new()),
        Arc::new(AttestationService::new(attestation_api_url)),
        Arc::new(executor),
        config,
    );

    start_transfer_recovery_job(store, relay.clone());

    let state = AppState { db, relay };

    let app = Router::new()
        .route("/health", get(handlers::relay::health))
        .route("/relay/job-start", post(handlers::relay::relay_job_start))
        .route(
            "/relay/payment-release",
            post(handlers::relay::relay_payment_release),
        )
        .route(
            "/relay/milestone-lock",
            post(handlers::relay::relay_milestone_lock),
        )
        .route(
            "/relay/dispute-settle",
            post(handlers::relay::relay_dispute_settle),
        )
        .route(
            "/relay/status/tx/{source_tx_hash}",
            get(handlers::relay::transfer_status_by_tx),
        )
        .route(
            "/relay/status/{operation}/{job_reference}",
            get(handlers::relay::transfer_status),
        )
        .route(
            "/relay/retry/tx/{source_tx_hash}",
            post(handlers::relay::retry_transfer_by_tx),
        )
        .route(
            "/relay/retry/{operation}/{job_reference}",
            post(handlers::relay::retry_transfer),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind listener");

    tracing::info!("Server listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
