// =============================================================================
// GEOPULSE — Environment Configuration
// =============================================================================

use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    pub brokers: String,
    pub ingress_topic: String,
    pub egress_topic: String,
    pub consumer_group: String,
    pub redis_addr: String,
    pub worker_count: usize,
    pub metrics_port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            brokers: env_or("KAFKA_BROKERS", "localhost:9092"),
            ingress_topic: env_or("INGRESS_TOPIC", "raw.zone.events"),
            egress_topic: env_or("EGRESS_TOPIC", "zone.alerts"),
            consumer_group: env_or("CONSUMER_GROUP", "zone-stream-processor"),
            redis_addr: env_or("REDIS_ADDR", "redis://localhost:6380"),
            worker_count: env_parse("WORKER_COUNT", 8).max(1),
            metrics_port: env_parse("METRICS_PORT", 9090),
        }
    }
}
