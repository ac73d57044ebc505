// =============================================================================
// GEOPULSE — Ingress Loop (consume → decode → dispatch → advance offsets)
// =============================================================================
// At-least-once: an offset is stored only once every earlier offset of its
// partition has been fully processed by the workers. Malformed payloads are
// counted and skipped without holding the watermark back. Transport errors
// back off exponentially and resume from the last committed offset.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Message;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::dispatcher::{Dispatcher, Job};
use crate::event::{DecodeError, SampleEvent};
use crate::metrics::Metrics;

const RECEIVE_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const RECEIVE_BACKOFF_MAX: Duration = Duration::from_secs(5);
const ACK_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Per-partition bookkeeping of which received offsets finished processing.
/// The watermark only advances over a contiguous prefix of finished offsets,
/// so storing it can never skip an unprocessed event.
#[derive(Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, Ledger>,
}

#[derive(Default)]
struct Ledger {
    pending: BTreeSet<i64>,
    done: BTreeSet<i64>,
}

impl OffsetTracker {
    pub fn begin(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .pending
            .insert(offset);
    }

    /// Marks an offset finished. Returns the partition's new watermark (the
    /// highest offset safe to store) when it advanced.
    pub fn complete(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let ledger = self.partitions.entry(partition).or_default();
        ledger.pending.remove(&offset);
        ledger.done.insert(offset);

        let mut watermark = None;
        while let Some(&lowest) = ledger.done.first() {
            if ledger.pending.first().is_some_and(|&p| p < lowest) {
                break;
            }
            ledger.done.pop_first();
            watermark = Some(lowest);
        }
        watermark
    }

    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|l| l.pending.len()).sum()
    }
}

pub struct Ingress {
    consumer: StreamConsumer,
    topic: String,
    dispatcher: Dispatcher,
    completions: mpsc::UnboundedReceiver<(i32, i64)>,
    tracker: OffsetTracker,
    metrics: Arc<Metrics>,
}

impl Ingress {
    pub fn new(
        consumer: StreamConsumer,
        topic: String,
        dispatcher: Dispatcher,
        completions: mpsc::UnboundedReceiver<(i32, i64)>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            consumer,
            topic,
            dispatcher,
            completions,
            tracker: OffsetTracker::default(),
            metrics,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let Ingress {
            consumer,
            topic,
            dispatcher,
            mut completions,
            mut tracker,
            metrics,
        } = self;

        let mut backoff = RECEIVE_BACKOFF_INITIAL;
        let mut flush = tokio::time::interval(ACK_FLUSH_INTERVAL);
        let mut fatal = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("ingress_stopping");
                    break;
                }
                _ = flush.tick() => {}
                received = consumer.recv() => match received {
                    Ok(msg) => {
                        backoff = RECEIVE_BACKOFF_INITIAL;
                        let partition = msg.partition();
                        let offset = msg.offset();
                        match SampleEvent::decode(msg.payload().unwrap_or_default()) {
                            Ok(event) => {
                                tracker.begin(partition, offset);
                                let job = Job { event, partition, offset };
                                if !dispatcher.dispatch(job).await {
                                    error!(partition, offset, "worker_channel_closed");
                                    fatal = true;
                                    break;
                                }
                            }
                            Err(DecodeError::Malformed(err)) => {
                                metrics.events_malformed.fetch_add(1, Ordering::Relaxed);
                                warn!(partition, offset, error = %err, "malformed_event");
                                skip(&consumer, &metrics, &topic, &mut tracker, partition, offset);
                            }
                            Err(DecodeError::Invalid(reason)) => {
                                metrics.events_invalid.fetch_add(1, Ordering::Relaxed);
                                warn!(partition, offset, reason, "invalid_event");
                                skip(&consumer, &metrics, &topic, &mut tracker, partition, offset);
                            }
                        }
                    }
                    Err(err) => {
                        metrics.ingress_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "ingress_receive_error");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECEIVE_BACKOFF_MAX);
                    }
                }
            }

            while let Ok((partition, offset)) = completions.try_recv() {
                if let Some(watermark) = tracker.complete(partition, offset) {
                    store(&consumer, &metrics, &topic, partition, watermark);
                }
            }
        }

        // Drain in-flight events to a quiescent point, bounded by the hard
        // shutdown deadline; anything left re-delivers on the next start.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while tracker.in_flight() > 0 {
            match tokio::time::timeout_at(deadline, completions.recv()).await {
                Ok(Some((partition, offset))) => {
                    if let Some(watermark) = tracker.complete(partition, offset) {
                        store(&consumer, &metrics, &topic, partition, watermark);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(in_flight = tracker.in_flight(), "shutdown_drain_deadline");
                    break;
                }
            }
        }

        match consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(err) => warn!(error = %err, "final_offset_commit_failed"),
        }

        if fatal {
            bail!("worker pool unavailable");
        }
        Ok(())
    }
}

/// Marks an event as handled without dispatching it (decode failures must not
/// block offset progress).
fn skip(
    consumer: &StreamConsumer,
    metrics: &Metrics,
    topic: &str,
    tracker: &mut OffsetTracker,
    partition: i32,
    offset: i64,
) {
    tracker.begin(partition, offset);
    if let Some(watermark) = tracker.complete(partition, offset) {
        store(consumer, metrics, topic, partition, watermark);
    }
}

fn store(consumer: &StreamConsumer, metrics: &Metrics, topic: &str, partition: i32, offset: i64) {
    if let Err(err) = consumer.store_offset(topic, partition, offset) {
        warn!(partition, offset, error = %err, "offset_store_failed");
    } else {
        metrics.offsets_stored.fetch_add(1, Ordering::Relaxed);
    }
}
