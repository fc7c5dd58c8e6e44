use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use commissions_rs::config::{Config, PayoutProviderKind, StoreType};
use commissions_rs::providers::{HttpPayoutProvider, MockPayoutProvider, PayoutProvider, ProviderRegistry};
use commissions_rs::repos::{InMemoryStore, PgStore, Store};
use commissions_rs::services::dispatcher::spawn_dispatch_worker;
use commissions_rs::services::reconciliation::spawn_reconciliation_task;
use commissions_rs::{db, routes, AppState, ServiceSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,commissions_rs=debug".into());
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize store based on STORE_TYPE environment variable
    let store: Arc<dyn Store> = match config.store_type {
        StoreType::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set when STORE_TYPE=postgres")?;
            let pool = db::init_pool(database_url)
                .await
                .context("Failed to connect to Postgres")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied successfully");
            Arc::new(PgStore::new(pool))
        }
        StoreType::InMemory => {
            tracing::warn!("Using in-memory store; state is lost on restart");
            Arc::new(InMemoryStore::new())
        }
    };

    let provider: Arc<dyn PayoutProvider> = match config.payout_provider {
        PayoutProviderKind::Http => {
            let base_url = config
                .payout_api_url
                .clone()
                .context("PAYOUT_API_URL must be set when PAYOUT_PROVIDER=http")?;
            let api_key = config
                .payout_api_key
                .clone()
                .context("PAYOUT_API_KEY must be set when PAYOUT_PROVIDER=http")?;
            tracing::info!(base_url = %base_url, "Using HTTP payout provider");
            Arc::new(HttpPayoutProvider::new(
                base_url,
                api_key,
                Duration::from_secs(config.payout_provider_timeout_secs),
            )?)
        }
        PayoutProviderKind::Mock => {
            tracing::info!("Using mock payout provider");
            Arc::new(MockPayoutProvider::new())
        }
    };

    let (state, receiver) = AppState::build(
        store,
        ProviderRegistry::uniform(provider),
        ServiceSettings::from(&config),
    );

    spawn_dispatch_worker(state.dispatcher.clone(), receiver);
    tracing::info!("Payout dispatch worker started");

    if config.reconcile_interval_secs > 0 {
        spawn_reconciliation_task(
            state.reconciler.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
        );
    }

    let app = routes::router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid HOST:PORT")?;

    tracing::info!("Commissions service listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind address")?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
