//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics — renders the recorder in Prometheus text format.
pub async fn render(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.run_upkeep();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}

/// Registers help text for every metric the service emits. Call once after
/// installing the recorder.
pub fn describe() {
    describe_counter!("saga_events_total", "Events accepted by a saga coordinator");
    describe_counter!("saga_completed_total", "Sagas whose completion callback succeeded");
    describe_counter!(
        "saga_already_completed_total",
        "Events received after their saga had completed"
    );
    describe_counter!(
        "saga_commit_conflicts_total",
        "Serializable commits that lost a race with a concurrent writer"
    );
    describe_counter!(
        "saga_completion_rollbacks_total",
        "Completions reverted after the completion callback failed"
    );
    describe_histogram!(
        "saga_add_event_duration_seconds",
        Unit::Seconds,
        "Time to record one saga event, including the completion callback"
    );
    describe_counter!("messages_published_total", "Messages published to a topic");
    describe_counter!("messages_acked_total", "Deliveries acknowledged after handling");
    describe_counter!("messages_requeued_total", "Failed deliveries requeued for a retry");
    describe_counter!(
        "messages_dead_lettered_total",
        "Deliveries that failed twice and went to the dead-letter queue"
    );
    describe_counter!("broker_reconnects_total", "Successful broker reconnects");
    describe_gauge!("broker_connected", "1 while the broker connection is up");
}
