// =============================================================================
// GEOPULSE — Zone-State Stream Processor (Rust/Tokio/Kafka/Redis)
// =============================================================================
// Consumes raw per-zone load samples from Kafka, maintains event-time sliding
// averages and a hysteretic state machine per zone, publishes state-transition
// alerts, and upserts the materialized zone state into Redis.
//
// Delivery model: at-least-once. Offsets advance only after a zone's worker
// has finished every side effect for the event; downstream consumers dedupe
// by (zoneId, timestamp, currentState).
// =============================================================================

mod config;
mod dispatcher;
mod event;
mod ingress;
mod kafka;
mod metrics;
mod sink;
mod store;
mod window;
mod zone;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;
use crate::ingress::Ingress;
use crate::kafka::KafkaAlertSink;
use crate::metrics::{Metrics, OpsState};
use crate::sink::{AlertSink, StateStore};
use crate::store::RedisStateStore;

// Workers must reach a quiescent point within this window on shutdown;
// anything still in flight re-delivers on the next start.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "geopulse_processor=info".into()),
        )
        .json()
        .init();

    let cfg = Config::from_env();
    info!(
        brokers = %cfg.brokers,
        ingress = %cfg.ingress_topic,
        egress = %cfg.egress_topic,
        group = %cfg.consumer_group,
        store = %cfg.redis_addr,
        workers = cfg.worker_count,
        "GeoPulse zone-state processor starting"
    );

    let shared_metrics = Arc::new(Metrics::new());
    let snapshot = Arc::new(DashMap::new());
    let ready = Arc::new(AtomicBool::new(false));

    let alerts: Arc<dyn AlertSink> = Arc::new(KafkaAlertSink::new(&cfg)?);
    let state_store: Arc<dyn StateStore> = Arc::new(
        RedisStateStore::connect(&cfg.redis_addr)
            .await
            .context("materialized store connection")?,
    );
    let consumer = kafka::consumer(&cfg)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = JoinSet::new();
    let (zone_dispatcher, completions) = dispatcher::spawn_workers(
        cfg.worker_count,
        alerts,
        state_store,
        snapshot.clone(),
        shared_metrics.clone(),
        &mut workers,
    );
    let ingress = Ingress::new(
        consumer,
        cfg.ingress_topic.clone(),
        zone_dispatcher,
        completions,
        shared_metrics.clone(),
    );
    let mut ingress_task = tokio::spawn(ingress.run(shutdown_rx.clone()));

    let listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], cfg.metrics_port)))
            .await
            .context("binding metrics port")?;
    let ops = OpsState {
        metrics: shared_metrics.clone(),
        zones: snapshot.clone(),
        ready: ready.clone(),
    };
    let metrics_task = tokio::spawn(metrics::serve(listener, ops, shutdown_rx.clone()));
    ready.store(true, Ordering::Relaxed);

    // A worker or ingress exit before the shutdown signal means a corrupted
    // zone slot or a dead pipeline: terminate, let the supervisor restart us.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown_signal"),
        joined = workers.join_next() => {
            match joined {
                Some(Err(err)) => error!(error = %err, "worker_panicked"),
                _ => error!("worker_exited_early"),
            }
            std::process::exit(1);
        }
        finished = &mut ingress_task => {
            match finished {
                Ok(Err(err)) => error!(error = %err, "ingress_failed"),
                Ok(Ok(())) => error!("ingress_exited_early"),
                Err(err) => error!(error = %err, "ingress_panicked"),
            }
            std::process::exit(1);
        }
    }

    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        // Ingress drains and commits first; dropping its dispatcher closes
        // the worker queues, so the pool winds down behind it.
        let _ = ingress_task.await;
        while workers.join_next().await.is_some() {}
        let _ = metrics_task.await;
    })
    .await;
    if drained.is_err() {
        error!("shutdown_deadline_exceeded");
    }
    info!("stopped");
    Ok(())
}
