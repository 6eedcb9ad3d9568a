//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers help text for the engine's metrics.
pub fn describe() {
    metrics::describe_counter!("checkout_started_total", "Checkout sessions created");
    metrics::describe_counter!(
        "checkout_deduplicated_total",
        "Start requests answered from an existing session"
    );
    metrics::describe_counter!("checkout_confirmed_total", "Checkout sessions confirmed");
    metrics::describe_counter!("checkout_cancelled_total", "Checkout sessions cancelled");
    metrics::describe_counter!(
        "checkout_confirm_conflicts_total",
        "Confirms refused because a reservation could not be confirmed"
    );
    metrics::describe_counter!("reservations_created_total", "Inventory reservations taken");
    metrics::describe_counter!(
        "reservations_released_total",
        "Inventory reservations released, by reason"
    );
    metrics::describe_counter!("short_links_created_total", "Short links issued");
    metrics::describe_counter!("short_link_clicks_total", "Short link clicks that resolved");
    metrics::describe_counter!(
        "short_link_rejections_total",
        "Short link clicks refused, by reason"
    );
    metrics::describe_counter!(
        "reservations_confirmed_total",
        "Inventory reservations confirmed"
    );
    metrics::describe_counter!(
        "reservations_rejected_total",
        "Reservation attempts refused for lack of stock"
    );
    metrics::describe_counter!(
        "reaper_reservations_expired_total",
        "Reservations expired by the reaper"
    );
    metrics::describe_counter!("reaper_sessions_expired_total", "Sessions expired by the reaper");
    metrics::describe_counter!("reaper_failures_total", "Reaper steps that failed");
    metrics::describe_histogram!(
        "reaper_sweep_duration_seconds",
        metrics::Unit::Seconds,
        "Time spent in one reaper sweep"
    );
}

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
