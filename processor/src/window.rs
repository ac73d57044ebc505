// =============================================================================
// GEOPULSE — Event-Time Sliding Window
// =============================================================================
// Per-second buckets keyed by floor(eventTimestamp / 1000). Eviction is
// anchored on the INCOMING event's second, never wall time, so replaying the
// same stream reproduces the same averages. A late event whose second is
// already outside the window relative to the newest bucket is still inserted
// into a freshly created past-bucket; the next in-window event sweeps it out.
// =============================================================================

use std::collections::BTreeMap;

// Rebuild totals from bucket contents periodically to bound float drift on
// very long streams.
const REBUILD_EVERY: u64 = 1 << 20;

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    sum: f64,
    count: u64,
}

#[derive(Debug)]
pub struct SlidingWindow {
    size_secs: i64,
    buckets: BTreeMap<i64, Bucket>,
    total_sum: f64,
    total_count: u64,
    inserts: u64,
}

impl SlidingWindow {
    pub fn new(size_secs: i64) -> Self {
        Self {
            size_secs,
            buckets: BTreeMap::new(),
            total_sum: 0.0,
            total_count: 0,
            inserts: 0,
        }
    }

    /// Inserts one sample at its event time, evicting every bucket that falls
    /// out of the window anchored at the incoming second.
    pub fn add(&mut self, event_timestamp_ms: i64, load: f64) {
        let k = event_timestamp_ms.div_euclid(1000);

        while let Some(entry) = self.buckets.first_entry() {
            if k - *entry.key() >= self.size_secs {
                let evicted = entry.remove();
                self.total_sum -= evicted.sum;
                self.total_count = self
                    .total_count
                    .checked_sub(evicted.count)
                    .expect("window count underflow");
            } else {
                break;
            }
        }
        if self.buckets.is_empty() {
            // An emptied window carries no float residue forward.
            self.total_sum = 0.0;
            self.total_count = 0;
        }

        let bucket = self.buckets.entry(k).or_default();
        bucket.sum += load;
        bucket.count += 1;
        self.total_sum += load;
        self.total_count += 1;

        self.inserts += 1;
        if self.inserts % REBUILD_EVERY == 0 {
            self.rebuild();
        }
    }

    /// Mean load over the window; an empty window averages to 0, not NaN.
    pub fn average(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.total_sum / self.total_count as f64
        }
    }

    #[cfg(test)]
    fn sample_count(&self) -> u64 {
        self.total_count
    }

    fn rebuild(&mut self) {
        self.total_sum = self.buckets.values().map(|b| b.sum).sum();
        self.total_count = self.buckets.values().map(|b| b.count).sum();
    }

    #[cfg(test)]
    fn has_bucket(&self, second: i64) -> bool {
        self.buckets.contains_key(&second)
    }

    #[cfg(test)]
    fn bucket_keys(&self) -> Vec<i64> {
        self.buckets.keys().copied().collect()
    }
}
