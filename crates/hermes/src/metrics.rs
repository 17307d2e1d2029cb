//! Prometheus exporter and liveness and readiness endpoints on a side listener.

use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether the relay is accepting traffic.
///
/// Starts unset; `main` flips it once the descriptor is loaded and the
/// listener is bound, and clears it again on the way out.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Create an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear the flag.
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Relaxed);
    }

    /// Current value of the flag.
    #[must_use]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Install the Prometheus recorder and serve `/metrics`, `/health` and
/// `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or `addr` cannot be
/// bound.
pub async fn start_metrics_server(addr: SocketAddr, readiness: Readiness) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { Json(json!({ "status": "healthy" })) }))
        .route("/ready", get(move || readiness_report(readiness.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn readiness_report(readiness: Readiness) -> (StatusCode, Json<Value>) {
    let ready = readiness.get();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let label = if ready { "ready" } else { "not ready" };
    (status, Json(json!({ "status": label, "ready": ready })))
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the bound communicators gauge.
    pub fn inc_communicators_connected() {
        metrics::gauge!("hermes_communicators_connected").increment(1.0);
    }

    /// Decrement the bound communicators gauge.
    pub fn dec_communicators_connected() {
        metrics::gauge!("hermes_communicators_connected").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record an authentication attempt for `role` with the given outcome.
    pub fn auth_total(role: &'static str, outcome: &'static str) {
        metrics::counter!("hermes_auth_total", "role" => role, "outcome" => outcome).increment(1);
    }

    /// Increment the accepted publishes counter.
    pub fn messages_published_total() {
        metrics::counter!("hermes_messages_published_total").increment(1);
    }

    /// Record one per-communicator dispatch with its outcome label.
    pub fn envelopes_total(outcome: &'static str) {
        metrics::counter!("hermes_envelopes_total", "outcome" => outcome).increment(1);
    }

    /// Record one configuration reload attempt with its outcome label.
    pub fn config_reloads_total(outcome: &'static str) {
        metrics::counter!("hermes_config_reloads_total", "outcome" => outcome).increment(1);
    }

    /// Record a communicator displaced by a newer connection.
    pub fn takeovers_total() {
        metrics::counter!("hermes_takeovers_total").increment(1);
    }

    /// Record a live connection closed because a reload revoked its name.
    pub fn revocations_total() {
        metrics::counter!("hermes_revocations_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_starts_unset() {
        let readiness = Readiness::new();
        assert!(!readiness.get());
        readiness.set(true);
        assert!(readiness.clone().get());
    }

    #[tokio::test]
    async fn ready_endpoint_follows_flag() {
        let readiness = Readiness::new();
        let (status, Json(body)) = readiness_report(readiness.clone()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);

        readiness.set(true);
        let (status, Json(body)) = readiness_report(readiness).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[test]
    fn counters_without_recorder_are_noops() {
        counters::messages_published_total();
        counters::envelopes_total("delivered");
        gauges::inc_communicators_connected();
        gauges::dec_communicators_connected();
    }
}
