//! HTTP API server with observability for the checkout engine.
//!
//! Exposes short links, click resolution and the checkout session lifecycle
//! over REST, with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use checkout::{
    CheckoutConfig, CheckoutSessionStateMachine, InMemoryCatalog, InventoryReservationManager,
    ReaperConfig, ReservationReaper, ShortLinkService,
};
use checkout_store::CheckoutStore;
use common::Clock;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<S: CheckoutStore> {
    pub checkout: CheckoutSessionStateMachine<S, InMemoryCatalog>,
    pub links: ShortLinkService<S, InMemoryCatalog>,
    pub catalog: InMemoryCatalog,
    pub clock: Arc<dyn Clock>,
    /// Store backend name reported by `/health`.
    pub backend: &'static str,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: CheckoutStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/links", post(routes::links::create::<S>))
        .route(
            "/links/{code}",
            get(routes::links::get::<S>).delete(routes::links::revoke::<S>),
        )
        .route("/l/{code}", get(routes::links::resolve::<S>))
        .route("/checkouts", post(routes::checkouts::start::<S>))
        .route("/checkouts/{id}", get(routes::checkouts::get::<S>))
        .route(
            "/checkouts/{id}/confirm",
            post(routes::checkouts::confirm::<S>),
        )
        .route("/checkouts/{id}/cancel", post(routes::checkouts::cancel::<S>))
        .route(
            "/variants/{id}/availability",
            get(routes::variants::availability::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state over a store and catalog.
pub fn create_default_state<S: CheckoutStore + Clone + 'static>(
    store: S,
    catalog: InMemoryCatalog,
    clock: Arc<dyn Clock>,
    config: CheckoutConfig,
    backend: &'static str,
) -> Arc<AppState<S>> {
    let checkout =
        CheckoutSessionStateMachine::new(store.clone(), catalog.clone(), clock.clone(), config);
    let links = ShortLinkService::new(store, catalog.clone(), clock.clone());

    Arc::new(AppState {
        checkout,
        links,
        catalog,
        clock,
        backend,
    })
}

/// Creates the reaper that runs next to the server.
pub fn create_reaper<S: CheckoutStore + Clone + 'static>(
    store: S,
    catalog: InMemoryCatalog,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
) -> ReservationReaper<S, InMemoryCatalog> {
    let inventory = InventoryReservationManager::new(store.clone(), catalog, clock.clone());
    ReservationReaper::new(inventory, store, clock, config)
}
