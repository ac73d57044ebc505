// =============================================================================
// GEOPULSE — Zone Dispatcher & Worker Pool
// =============================================================================
// Zone ids hash onto N worker tasks; each worker owns its zones outright and
// processes their events strictly one at a time, so per-zone FIFO order from
// the ingress partition is preserved end to end. Workers acknowledge each
// finished event back to the ingress loop, which advances offsets.
//
// Emitter ordering per fired transition (all under the owning worker):
//   1. publish the alert (best effort, no in-core retry)
//   2. update the shared in-memory snapshot
//   3. upsert the materialized record + geo index (best effort)
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::event::{Alert, SampleEvent, ZoneStatus};
use crate::metrics::Metrics;
use crate::sink::{AlertSink, StateStore};
use crate::zone::ZoneState;

// Bounded so a stalled worker backpressures the ingress loop instead of
// buffering the topic into memory.
const WORKER_QUEUE_DEPTH: usize = 1_024;

pub struct Job {
    pub event: SampleEvent,
    pub partition: i32,
    pub offset: i64,
}

fn shard_of(zone_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    zone_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

pub struct Dispatcher {
    senders: Vec<mpsc::Sender<Job>>,
}

impl Dispatcher {
    /// Routes a job to the worker owning its zone. Returns false if that
    /// worker is gone, which is fatal for the process.
    pub async fn dispatch(&self, job: Job) -> bool {
        let idx = shard_of(&job.event.zone_id, self.senders.len());
        self.senders[idx].send(job).await.is_ok()
    }
}

struct Worker {
    id: usize,
    rx: mpsc::Receiver<Job>,
    zones: HashMap<String, ZoneState>,
    alerts: Arc<dyn AlertSink>,
    store: Arc<dyn StateStore>,
    snapshot: Arc<DashMap<String, ZoneStatus>>,
    metrics: Arc<Metrics>,
    done: mpsc::UnboundedSender<(i32, i64)>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            self.process(&job.event).await;
            // Receiver may already be gone during shutdown drain.
            let _ = self.done.send((job.partition, job.offset));
        }
        info!(worker = self.id, zones = self.zones.len(), "worker_drained");
    }

    async fn process(&mut self, ev: &SampleEvent) {
        let (fired, coord) = {
            let zone = self
                .zones
                .entry(ev.zone_id.clone())
                .or_insert_with(ZoneState::new);
            (zone.apply(ev), zone.last_coord)
        };
        self.metrics.events_processed.fetch_add(1, Ordering::Relaxed);

        let (Some(tr), Some((latitude, longitude))) = (fired, coord) else {
            return;
        };

        self.metrics.transition(tr.previous, tr.current);
        info!(
            zone = %ev.zone_id,
            from = tr.previous.as_str(),
            to = tr.current.as_str(),
            at = tr.timestamp,
            avg_1m = tr.avg_1m,
            avg_5m = tr.avg_5m,
            "state_transition"
        );

        if tr.emit {
            let alert = Alert {
                zone_id: ev.zone_id.clone(),
                previous_state: tr.previous,
                current_state: tr.current,
                avg_1m: tr.avg_1m,
                avg_5m: tr.avg_5m,
                timestamp: tr.timestamp,
            };
            match serde_json::to_vec(&alert) {
                Ok(body) => {
                    let started = Instant::now();
                    match self.alerts.publish(&ev.zone_id, &body).await {
                        Ok(()) => {
                            self.metrics.alerts_published.fetch_add(1, Ordering::Relaxed);
                            self.metrics.alert_publish_latency_us.fetch_add(
                                started.elapsed().as_micros() as u64,
                                Ordering::Relaxed,
                            );
                        }
                        Err(err) => {
                            self.metrics.alert_publish_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(zone = %ev.zone_id, error = %err, "alert_publish_failed");
                        }
                    }
                }
                Err(err) => {
                    self.metrics.alert_publish_failures.fetch_add(1, Ordering::Relaxed);
                    error!(zone = %ev.zone_id, error = %err, "alert_encode_failed");
                }
            }
        } else {
            self.metrics.alerts_suppressed.fetch_add(1, Ordering::Relaxed);
        }

        // Snapshot first: concurrent readers must observe the new state
        // before the materialized write lands.
        let status = ZoneStatus {
            zone_id: ev.zone_id.clone(),
            state: tr.current,
            avg_1m: tr.avg_1m,
            avg_5m: tr.avg_5m,
            latitude,
            longitude,
            last_updated: chrono::Utc::now().timestamp_millis(),
        };
        self.snapshot.insert(ev.zone_id.clone(), status.clone());

        if let Err(err) = self.store.upsert(&status).await {
            self.metrics.state_write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(zone = %ev.zone_id, error = %err, "state_write_failed");
        }
    }
}

/// Spawns the worker pool onto `tasks` and returns the dispatcher plus the
/// per-event acknowledgement stream consumed by the ingress loop.
pub fn spawn_workers(
    count: usize,
    alerts: Arc<dyn AlertSink>,
    store: Arc<dyn StateStore>,
    snapshot: Arc<DashMap<String, ZoneStatus>>,
    metrics: Arc<Metrics>,
    tasks: &mut JoinSet<()>,
) -> (Dispatcher, mpsc::UnboundedReceiver<(i32, i64)>) {
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let mut senders = Vec::with_capacity(count);
    for id in 0..count {
        let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        senders.push(tx);
        tasks.spawn(
            Worker {
                id,
                rx,
                zones: HashMap::new(),
                alerts: alerts.clone(),
                store: store.clone(),
                snapshot: snapshot.clone(),
                metrics: metrics.clone(),
                done: done_tx.clone(),
            }
            .run(),
        );
    }
    (Dispatcher { senders }, done_rx)
}
