//! Cross-worker live statistics, sampled by the progress monitor while the
//! workers are in their hot loops.
//!
//! Workers update plain atomics (fetch-add for counts, compare-and-swap
//! loops over f64 bit patterns for min/max) so recording never takes a lock
//! and never perturbs the latency being measured. A snapshot is consistent
//! per field, not across fields.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug)]
pub struct LiveStatsHandle {
    total: AtomicI64,
    success: AtomicI64,
    errors: AtomicI64,
    // Latency aggregates in milliseconds, stored as f64 bit patterns.
    lat_sum_ms: AtomicU64,
    lat_min_ms: AtomicU64,
    lat_max_ms: AtomicU64,
}

/// Point-in-time view of a run's wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub total: i64,
    pub success: i64,
    pub errors: i64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl LiveStatsHandle {
    pub fn new() -> LiveStatsHandle {
        LiveStatsHandle {
            total: AtomicI64::new(0),
            success: AtomicI64::new(0),
            errors: AtomicI64::new(0),
            lat_sum_ms: AtomicU64::new(0f64.to_bits()),
            lat_min_ms: AtomicU64::new(f64::INFINITY.to_bits()),
            lat_max_ms: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
        }
    }

    /// Records one completed call.
    pub fn record(&self, ok: bool, latency_ms: f64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        fetch_update_f64(&self.lat_sum_ms, |cur| Some(cur + latency_ms));
        fetch_update_f64(&self.lat_min_ms, |cur| {
            (latency_ms < cur).then_some(latency_ms)
        });
        fetch_update_f64(&self.lat_max_ms, |cur| {
            (latency_ms > cur).then_some(latency_ms)
        });
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let sum = f64::from_bits(self.lat_sum_ms.load(Ordering::Relaxed));
        let min = f64::from_bits(self.lat_min_ms.load(Ordering::Relaxed));
        let max = f64::from_bits(self.lat_max_ms.load(Ordering::Relaxed));
        LiveSnapshot {
            total,
            success,
            errors,
            avg_ms: if total > 0 { sum / total as f64 } else { 0. },
            min_ms: if min.is_finite() { min } else { 0. },
            max_ms: if max.is_finite() { max } else { 0. },
        }
    }
}

impl Default for LiveStatsHandle {
    fn default() -> LiveStatsHandle {
        LiveStatsHandle::new()
    }
}

fn fetch_update_f64(cell: &AtomicU64, f: impl Fn(f64) -> Option<f64>) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
        f(f64::from_bits(bits)).map(f64::to_bits)
    });
}
