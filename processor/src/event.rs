// =============================================================================
// GEOPULSE — Wire Types (ingress samples, egress alerts, zone snapshots)
// =============================================================================
// Both topics carry JSON. Decode failures and invariant violations are counted
// and skipped by the ingress loop; they never block offset progress.
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Producer clocks can run slightly ahead of the sensor clock; anything beyond
// this is a broken payload, not skew.
pub const MAX_EVENT_SKEW_MS: i64 = 5_000;

/// Operational state of a zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneHealth {
    Normal,
    Stressed,
    Critical,
}

impl ZoneHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneHealth::Normal => "NORMAL",
            ZoneHealth::Stressed => "STRESSED",
            ZoneHealth::Critical => "CRITICAL",
        }
    }
}

/// One raw load sample as carried on the ingress topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleEvent {
    pub event_id: String,
    pub zone_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub load: f64,
    /// Sensor observation time, ms since epoch.
    pub event_timestamp: i64,
    /// Producer publish time, ms since epoch.
    pub produced_at: i64,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid event: {0}")]
    Invalid(&'static str),
}

impl SampleEvent {
    /// Decodes and validates one ingress payload.
    pub fn decode(payload: &[u8]) -> Result<SampleEvent, DecodeError> {
        let ev: SampleEvent = serde_json::from_slice(payload)?;
        ev.validate()?;
        Ok(ev)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.zone_id.is_empty() {
            return Err(DecodeError::Invalid("empty zoneId"));
        }
        if !self.load.is_finite() || self.load < 0.0 || self.load > 1.0 {
            return Err(DecodeError::Invalid("load outside [0, 1]"));
        }
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(DecodeError::Invalid("non-finite coordinates"));
        }
        if self.event_timestamp <= 0 {
            return Err(DecodeError::Invalid("non-positive eventTimestamp"));
        }
        if self.event_timestamp > self.produced_at + MAX_EVENT_SKEW_MS {
            return Err(DecodeError::Invalid("eventTimestamp ahead of producedAt"));
        }
        Ok(())
    }
}

/// State-transition alert as published on the egress topic, keyed by zone.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub zone_id: String,
    pub previous_state: ZoneHealth,
    pub current_state: ZoneHealth,
    pub avg_1m: f64,
    pub avg_5m: f64,
    /// eventTimestamp of the triggering sample.
    pub timestamp: i64,
}

/// Current-state snapshot of one zone: kept in memory for concurrent readers
/// and upserted into the materialized store on every transition.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStatus {
    pub zone_id: String,
    pub state: ZoneHealth,
    pub avg_1m: f64,
    pub avg_5m: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Wall-clock write time, ms since epoch.
    pub last_updated: i64,
}
