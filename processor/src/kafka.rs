// =============================================================================
// GEOPULSE — Kafka Adapters
// =============================================================================
// Consumer: earliest-uncommitted subscription, auto-commit of explicitly
// stored offsets only (enable.auto.offset.store=false), so the ingress loop
// controls exactly how far the group offset may advance.
// Producer: keyed by zoneId; the default partitioner is deterministic by key,
// which preserves per-zone order on the egress side.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::config::Config;
use crate::sink::AlertSink;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub fn consumer(cfg: &Config) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.brokers)
        .set("group.id", &cfg.consumer_group)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "1000")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .create()
        .context("building ingress consumer")?;
    consumer
        .subscribe(&[cfg.ingress_topic.as_str()])
        .context("subscribing to ingress topic")?;
    Ok(consumer)
}

pub struct KafkaAlertSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaAlertSink {
    pub fn new(cfg: &Config) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &cfg.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("building egress producer")?;
        Ok(Self {
            producer,
            topic: cfg.egress_topic.clone(),
        })
    }
}

#[async_trait]
impl AlertSink for KafkaAlertSink {
    async fn publish(&self, zone_id: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(&self.topic).key(zone_id).payload(payload);
        self.producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(err, _msg)| err)
            .context("publishing alert")
    }
}
