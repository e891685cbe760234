// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Pipeline statistics and monitoring
//!
//! Per-device counters over the batch path: appends, pushes, completions,
//! and push-to-completion latency. Everything is lock-free atomics so the
//! hot path never serializes on bookkeeping.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Per-device pipeline statistics collector.
pub struct DeviceStats {
    instrs_appended: AtomicU64,
    bytes_appended: AtomicU64,

    batches_pushed: AtomicU64,
    descriptors_pushed: AtomicU64,
    /// Pushes refused for lack of ring space
    push_retries: AtomicU64,

    batches_completed: AtomicU64,
    batch_errors: AtomicU64,
    notifications_delivered: AtomicU64,

    total_latency_ns: AtomicU64,
    min_latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,

    current_in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

/// Point-in-time statistics report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    pub instrs_appended: u64,
    pub bytes_appended: u64,
    pub batches_pushed: u64,
    pub descriptors_pushed: u64,
    pub push_retries: u64,
    pub batches_completed: u64,
    pub batch_errors: u64,
    pub notifications_delivered: u64,
    pub avg_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub current_in_flight: u32,
    pub max_in_flight: u32,
}

impl DeviceStats {
    pub const fn new() -> Self {
        Self {
            instrs_appended: AtomicU64::new(0),
            bytes_appended: AtomicU64::new(0),
            batches_pushed: AtomicU64::new(0),
            descriptors_pushed: AtomicU64::new(0),
            push_retries: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
            batch_errors: AtomicU64::new(0),
            notifications_delivered: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            min_latency_ns: AtomicU64::new(u64::MAX),
            max_latency_ns: AtomicU64::new(0),
            current_in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        }
    }

    pub(crate) fn record_append(&self, bytes: usize) {
        self.instrs_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_push(&self, descriptors: usize) {
        self.batches_pushed.fetch_add(1, Ordering::Relaxed);
        self.descriptors_pushed
            .fetch_add(descriptors as u64, Ordering::Relaxed);

        let depth = self.current_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        let mut current_max = self.max_in_flight.load(Ordering::Relaxed);
        while depth > current_max {
            match self.max_in_flight.compare_exchange_weak(
                current_max,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current_max = observed,
            }
        }
    }

    pub(crate) fn record_push_retry(&self) {
        self.push_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self, ok: bool, latency: Duration) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.batch_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.current_in_flight.fetch_sub(1, Ordering::Relaxed);

        let ns = latency.as_nanos() as u64;
        self.total_latency_ns.fetch_add(ns, Ordering::Relaxed);
        self.min_latency_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub(crate) fn record_notification(&self) {
        self.notifications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter.
    pub fn report(&self) -> StatsReport {
        let completed = self.batches_completed.load(Ordering::Relaxed);
        let total_ns = self.total_latency_ns.load(Ordering::Relaxed);
        let min_ns = self.min_latency_ns.load(Ordering::Relaxed);

        StatsReport {
            instrs_appended: self.instrs_appended.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            batches_pushed: self.batches_pushed.load(Ordering::Relaxed),
            descriptors_pushed: self.descriptors_pushed.load(Ordering::Relaxed),
            push_retries: self.push_retries.load(Ordering::Relaxed),
            batches_completed: completed,
            batch_errors: self.batch_errors.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            avg_latency: if completed == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(total_ns / completed)
            },
            min_latency: if min_ns == u64::MAX {
                Duration::ZERO
            } else {
                Duration::from_nanos(min_ns)
            },
            max_latency: Duration::from_nanos(self.max_latency_ns.load(Ordering::Relaxed)),
            current_in_flight: self.current_in_flight.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
        }
    }
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_bounds_track() {
        let stats = DeviceStats::new();
        stats.record_push(1);
        stats.record_push(2);
        stats.record_completion(true, Duration::from_micros(10));
        stats.record_completion(false, Duration::from_micros(30));

        let report = stats.report();
        assert_eq!(report.batches_pushed, 2);
        assert_eq!(report.descriptors_pushed, 3);
        assert_eq!(report.batches_completed, 2);
        assert_eq!(report.batch_errors, 1);
        assert_eq!(report.min_latency, Duration::from_micros(10));
        assert_eq!(report.max_latency, Duration::from_micros(30));
        assert_eq!(report.avg_latency, Duration::from_micros(20));
        assert_eq!(report.current_in_flight, 0);
        assert_eq!(report.max_in_flight, 2);
    }

    #[test]
    fn empty_report_has_zero_latency() {
        let report = DeviceStats::new().report();
        assert_eq!(report.avg_latency, Duration::ZERO);
        assert_eq!(report.min_latency, Duration::ZERO);
    }
}
