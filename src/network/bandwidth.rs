//! Bandwidth Regulation
//!
//! Per-client token buckets that cap outbound bytes per second. The bridge
//! asks before every frame; a refused frame is held and retried on the next
//! tick, so pacing never skips a sequence.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// 48 kbps.
pub const DEFAULT_BANDWIDTH_BYTES_PER_SEC: u64 = 48_000 / 8;

/// Time source for bucket refills.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Throttling state of one client.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthUsage {
    /// Tokens left in the bucket, never negative
    pub available_bytes: f64,
    /// Sustained rate since the bucket was created
    pub bytes_per_second: f64,
    /// Length of the observation window
    pub observed: Duration,
    /// Frames refused so far
    pub denied: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
    created: Instant,
    sent: u64,
    denied: u64,
}

/// Token-bucket byte budget per client.
pub struct BandwidthRegulator {
    buckets: Mutex<BTreeMap<String, Bucket>>,
    capacity: f64,
    refill: f64,
    clock: Clock,
}

impl std::fmt::Debug for BandwidthRegulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthRegulator")
            .field("capacity", &self.capacity)
            .field("clients", &self.buckets.lock().len())
            .finish()
    }
}

impl BandwidthRegulator {
    /// Regulator allowing `bytes_per_sec` per client, with one second of burst.
    /// Zero falls back to [`DEFAULT_BANDWIDTH_BYTES_PER_SEC`].
    pub fn new(bytes_per_sec: u64) -> Self {
        Self::with_clock(bytes_per_sec, Arc::new(Instant::now))
    }

    /// Regulator reading time from `clock`.
    pub fn with_clock(bytes_per_sec: u64, clock: Clock) -> Self {
        let rate = if bytes_per_sec == 0 {
            DEFAULT_BANDWIDTH_BYTES_PER_SEC
        } else {
            bytes_per_sec
        } as f64;
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            capacity: rate,
            refill: rate,
            clock,
        }
    }

    /// Bucket size in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    /// Charge `bytes` against `client_id`'s budget.
    ///
    /// New clients start with a full bucket. A frame larger than the whole
    /// bucket is let through once the bucket is full and leaves it in debt,
    /// so oversized frames are slowed down rather than starved.
    pub fn allow(&self, client_id: &str, bytes: usize) -> bool {
        if client_id.is_empty() || bytes == 0 {
            return true;
        }

        let now = (self.clock)();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(client_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last: now,
            created: now,
            sent: 0,
            denied: 0,
        });
        self.replenish(bucket, now);

        let request = bytes as f64;
        let full = bucket.tokens >= self.capacity;
        if request > bucket.tokens && !(full && request > self.capacity) {
            bucket.denied += 1;
            return false;
        }

        bucket.tokens -= request;
        bucket.sent += bytes as u64;
        true
    }

    /// Drop the bucket of a disconnected client.
    pub fn forget(&self, client_id: &str) {
        self.buckets.lock().remove(client_id);
    }

    /// Refreshed usage of every tracked client, ascending by id.
    pub fn snapshot_usage(&self) -> BTreeMap<String, BandwidthUsage> {
        let now = (self.clock)();
        let mut buckets = self.buckets.lock();
        buckets
            .iter_mut()
            .map(|(client_id, bucket)| {
                self.replenish(bucket, now);
                let observed = now.saturating_duration_since(bucket.created);
                let bytes_per_second = if observed.is_zero() {
                    0.0
                } else {
                    bucket.sent as f64 / observed.as_secs_f64()
                };
                let usage = BandwidthUsage {
                    available_bytes: bucket.tokens.max(0.0),
                    bytes_per_second,
                    observed,
                    denied: bucket.denied,
                };
                (client_id.clone(), usage)
            })
            .collect()
    }

    fn replenish(&self, bucket: &mut Bucket, now: Instant) {
        // A clock that runs backwards adds nothing
        if now <= bucket.last {
            return;
        }
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill).min(self.capacity);
        bucket.last = now;
    }
}

// =============================================================================
// TESTS
// =============================================================================
