//! Cache metrics.
//!
//! Every cache tracks its request counters under a mutex and derives a
//! load score from them. The score travels inside the advertised
//! descriptor so peers can prefer lightly loaded caches.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Weight of the average response time in the load score.
pub const AVG_RESPONSE_TIME_WEIGHT: f64 = 0.4;

/// Weight of the miss ratio in the load score.
pub const HIT_RATIO_WEIGHT: f64 = 0.3;

/// Weight of the decayed request rate in the load score.
pub const REQUEST_RATE_WEIGHT: f64 = 0.3;

/// Window over which the request rate decays, in seconds.
const RECENCY_WINDOW: f64 = 60.0;

/// Per-cache request counters.
#[derive(Debug)]
pub struct CacheMetrics {
    inner: Mutex<Counters>,
}

#[derive(Debug, Clone)]
struct Counters {
    request_count: u64,
    hit_count: u64,
    miss_count: u64,
    total_response_time: f64,
    last_update_time: f64,
}

/// A serializable snapshot, embedded in the advertised descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub total_response_time: f64,
    pub last_update_time: f64,
    pub load_score: f64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Counters {
                request_count: 0,
                hit_count: 0,
                miss_count: 0,
                total_response_time: 0.0,
                last_update_time: now(),
            }),
        }
    }

    /// Records one served request.
    pub fn record_request(&self, is_hit: bool, response_time: Duration) {
        let mut counters = self.inner.lock().unwrap();

        counters.request_count += 1;
        if is_hit {
            counters.hit_count += 1;
        } else {
            counters.miss_count += 1;
        }
        counters.total_response_time += response_time.as_secs_f64();
        counters.last_update_time = now();
    }

    /// Calculates the normalized load score. Lower is better.
    pub fn load_score(&self) -> f64 {
        self.inner.lock().unwrap().load_score(now())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.inner.lock().unwrap();

        MetricsSnapshot {
            request_count: counters.request_count,
            hit_count: counters.hit_count,
            miss_count: counters.miss_count,
            total_response_time: counters.total_response_time,
            last_update_time: counters.last_update_time,
            load_score: counters.load_score(now()),
        }
    }
}

impl Counters {
    fn load_score(&self, now: f64) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }

        let avg_response_time = self.total_response_time / self.request_count as f64;
        let hit_ratio = self.hit_count as f64 / self.request_count as f64;

        let recency_factor = ((now - self.last_update_time) / RECENCY_WINDOW).min(1.0);
        let request_rate = self.request_count as f64 * (1.0 - recency_factor);

        avg_response_time * AVG_RESPONSE_TIME_WEIGHT
            + (1.0 - hit_ratio) * HIT_RATIO_WEIGHT
            + request_rate * REQUEST_RATE_WEIGHT
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
