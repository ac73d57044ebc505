// =============================================================================
// GEOPULSE — Egress Capability Traits
// =============================================================================
// The core only knows these capability sets; the Kafka and Redis adapters
// implement them, and tests substitute recording fakes.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;

use crate::event::ZoneStatus;

/// Publishes one alert payload to the egress topic, keyed by zone so per-zone
/// ordering survives partitioning. Best effort: the caller logs and moves on.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish(&self, zone_id: &str, payload: &[u8]) -> Result<()>;
}

/// Upserts the materialized current-state record and the geo-index entry for
/// a zone in one write, so neither can land without the other. Best effort:
/// a failed write is repaired by the next transition.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert(&self, status: &ZoneStatus) -> Result<()>;
}
