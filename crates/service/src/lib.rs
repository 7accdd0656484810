//! Saga relay service.
//!
//! Consumes a saga's events from the bus, coordinates them in PostgreSQL and
//! publishes a completion event once per saga, with structured logging
//! (tracing), Prometheus metrics and a health endpoint that reports the broker
//! connection.

pub mod config;
pub mod error;
pub mod relay;
pub mod routes;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

pub use routes::health::HealthState;

/// Creates the Axum application router.
pub fn create_app(health: HealthState, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .with_state(health)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}
