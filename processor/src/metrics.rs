// =============================================================================
// GEOPULSE — Observability (counters + ops endpoints)
// =============================================================================
// Operators watch these; there is no end user. /metrics returns a structured
// JSON snapshot of every counter plus the tracked-zone breakdown.
// =============================================================================

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::event::{ZoneHealth, ZoneStatus};

pub struct Metrics {
    pub events_processed: AtomicU64,
    pub events_malformed: AtomicU64,
    pub events_invalid: AtomicU64,
    pub normal_to_stressed: AtomicU64,
    pub stressed_to_critical: AtomicU64,
    pub critical_to_stressed: AtomicU64,
    pub stressed_to_normal: AtomicU64,
    pub alerts_published: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub alert_publish_failures: AtomicU64,
    pub alert_publish_latency_us: AtomicU64,
    pub state_write_failures: AtomicU64,
    pub offsets_stored: AtomicU64,
    pub ingress_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_processed: AtomicU64::new(0),
            events_malformed: AtomicU64::new(0),
            events_invalid: AtomicU64::new(0),
            normal_to_stressed: AtomicU64::new(0),
            stressed_to_critical: AtomicU64::new(0),
            critical_to_stressed: AtomicU64::new(0),
            stressed_to_normal: AtomicU64::new(0),
            alerts_published: AtomicU64::new(0),
            alerts_suppressed: AtomicU64::new(0),
            alert_publish_failures: AtomicU64::new(0),
            alert_publish_latency_us: AtomicU64::new(0),
            state_write_failures: AtomicU64::new(0),
            offsets_stored: AtomicU64::new(0),
            ingress_errors: AtomicU64::new(0),
        }
    }

    pub fn transition(&self, previous: ZoneHealth, current: ZoneHealth) {
        let counter = match (previous, current) {
            (ZoneHealth::Normal, ZoneHealth::Stressed) => &self.normal_to_stressed,
            (ZoneHealth::Stressed, ZoneHealth::Critical) => &self.stressed_to_critical,
            (ZoneHealth::Critical, ZoneHealth::Stressed) => &self.critical_to_stressed,
            (ZoneHealth::Stressed, ZoneHealth::Normal) => &self.stressed_to_normal,
            // Unreachable by construction of the state machine; counting it
            // here would hide the bug. §7: fail fast.
            (p, c) => panic!("illegal transition {} -> {}", p.as_str(), c.as_str()),
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct OpsState {
    pub metrics: Arc<Metrics>,
    pub zones: Arc<DashMap<String, ZoneStatus>>,
    pub ready: Arc<AtomicBool>,
}

#[derive(Serialize)]
struct MetricsResponse {
    // Ingress
    events_processed: u64,
    events_malformed: u64,
    events_invalid: u64,
    ingress_errors: u64,
    offsets_stored: u64,
    // Transitions
    normal_to_stressed: u64,
    stressed_to_critical: u64,
    critical_to_stressed: u64,
    stressed_to_normal: u64,
    // Egress
    alerts_published: u64,
    alerts_suppressed: u64,
    alert_publish_failures: u64,
    alert_publish_latency_avg_us: u64,
    state_write_failures: u64,
    // Zone snapshot
    zones_tracked: usize,
    zones_normal: usize,
    zones_stressed: usize,
    zones_critical: usize,
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(s): State<OpsState>) -> StatusCode {
    if s.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(s): State<OpsState>) -> Json<MetricsResponse> {
    let m = &s.metrics;
    let published = m.alerts_published.load(Ordering::Relaxed);
    let latency_sum = m.alert_publish_latency_us.load(Ordering::Relaxed);

    let (mut normal, mut stressed, mut critical) = (0, 0, 0);
    for entry in s.zones.iter() {
        match entry.value().state {
            ZoneHealth::Normal => normal += 1,
            ZoneHealth::Stressed => stressed += 1,
            ZoneHealth::Critical => critical += 1,
        }
    }

    Json(MetricsResponse {
        events_processed: m.events_processed.load(Ordering::Relaxed),
        events_malformed: m.events_malformed.load(Ordering::Relaxed),
        events_invalid: m.events_invalid.load(Ordering::Relaxed),
        ingress_errors: m.ingress_errors.load(Ordering::Relaxed),
        offsets_stored: m.offsets_stored.load(Ordering::Relaxed),
        normal_to_stressed: m.normal_to_stressed.load(Ordering::Relaxed),
        stressed_to_critical: m.stressed_to_critical.load(Ordering::Relaxed),
        critical_to_stressed: m.critical_to_stressed.load(Ordering::Relaxed),
        stressed_to_normal: m.stressed_to_normal.load(Ordering::Relaxed),
        alerts_published: published,
        alerts_suppressed: m.alerts_suppressed.load(Ordering::Relaxed),
        alert_publish_failures: m.alert_publish_failures.load(Ordering::Relaxed),
        alert_publish_latency_avg_us: if published == 0 { 0 } else { latency_sum / published },
        state_write_failures: m.state_write_failures.load(Ordering::Relaxed),
        zones_tracked: s.zones.len(),
        zones_normal: normal,
        zones_stressed: stressed,
        zones_critical: critical,
    })
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: OpsState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "metrics_listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_counters_by_pair() {
        let m = Metrics::new();
        m.transition(ZoneHealth::Normal, ZoneHealth::Stressed);
        m.transition(ZoneHealth::Stressed, ZoneHealth::Critical);
        m.transition(ZoneHealth::Stressed, ZoneHealth::Critical);
        assert_eq!(m.normal_to_stressed.load(Ordering::Relaxed), 1);
        assert_eq!(m.stressed_to_critical.load(Ordering::Relaxed), 2);
        assert_eq!(m.critical_to_stressed.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn test_illegal_transition_pair_panics() {
        Metrics::new().transition(ZoneHealth::Normal, ZoneHealth::Critical);
    }
}
