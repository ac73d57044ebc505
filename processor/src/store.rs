// =============================================================================
// GEOPULSE — Materialized-State Store (Redis)
// =============================================================================
// One hash per zone plus a single geo set. ConnectionManager reconnects with
// back-off on its own; a failed write here is logged by the caller and
// repaired by the next transition.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::event::ZoneStatus;
use crate::sink::StateStore;

const GEO_KEY: &str = "zone:geo";

fn state_key(zone_id: &str) -> String {
    format!("zone:state:{zone_id}")
}

pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl RedisStateStore {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(addr).context("parsing redis address")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to materialized store")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn upsert(&self, status: &ZoneStatus) -> Result<()> {
        let mut conn = self.conn.clone();
        // One pipeline, so the record and its geo entry land together.
        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(state_key(&status.zone_id))
            .arg("zoneId")
            .arg(&status.zone_id)
            .arg("state")
            .arg(status.state.as_str())
            .arg("avg1m")
            .arg(status.avg_1m)
            .arg("avg5m")
            .arg(status.avg_5m)
            .arg("latitude")
            .arg(status.latitude)
            .arg("longitude")
            .arg(status.longitude)
            .arg("lastUpdated")
            .arg(status.last_updated)
            .ignore()
            .cmd("GEOADD")
            .arg(GEO_KEY)
            .arg(status.longitude)
            .arg(status.latitude)
            .arg(&status.zone_id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .context("upserting zone state and geo index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_key_namespacing() {
        assert_eq!(state_key("Z-1"), "zone:state:Z-1");
    }
}
