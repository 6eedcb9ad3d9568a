//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use checkout::{CatalogSeed, InMemoryCatalog};
use checkout_store::{CheckoutStore, InMemoryCheckoutStore, PostgresCheckoutStore};
use common::{Clock, SystemClock};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn load_catalog(path: Option<&str>) -> InMemoryCatalog {
    let Some(path) = path else {
        tracing::warn!("CATALOG_FILE not set, starting with an empty catalog");
        return InMemoryCatalog::new();
    };
    let raw = std::fs::read_to_string(path).expect("failed to read catalog file");
    let seed: CatalogSeed = serde_json::from_str(&raw).expect("failed to parse catalog file");
    tracing::info!(
        path,
        offers = seed.offers.len(),
        variants = seed.stock.len(),
        "catalog loaded"
    );
    InMemoryCatalog::from_seed(seed)
}

/// Runs the reaper and the HTTP server over one store until shutdown.
async fn serve<S: CheckoutStore + Clone + 'static>(
    store: S,
    backend: &'static str,
    config: &Config,
    catalog: InMemoryCatalog,
    metrics_handle: PrometheusHandle,
) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let reaper = api::create_reaper(
        store.clone(),
        catalog.clone(),
        clock.clone(),
        config.reaper(),
    );
    let shutdown = CancellationToken::new();
    let reaper_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reaper.run(shutdown).await })
    };

    let state = api::create_default_state(store, catalog, clock, config.checkout(), backend);
    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, backend, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    shutdown.cancel();
    if let Err(e) = reaper_handle.await {
        tracing::error!(error = %e, "reaper task failed");
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("invalid configuration");

    // 1. Initialize tracing
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    api::routes::metrics::describe();

    // 3. Load the catalog snapshot
    let catalog = load_catalog(config.catalog_file.as_deref());

    // 4. Pick the store and serve
    match config.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresCheckoutStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            serve(store, "postgres", &config, catalog, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            serve(
                InMemoryCheckoutStore::new(),
                "memory",
                &config,
                catalog,
                metrics_handle,
            )
            .await;
        }
    }

    tracing::info!("server shut down gracefully");
}
