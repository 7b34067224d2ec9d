//! Agent health counters.
//!
//! Cheap atomic counters shared by the stream readers, the supervisor and the
//! sink, plus a running statistic of batch write latency. A snapshot is logged
//! periodically by the binary.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Running statistics for a single metric.
#[derive(Clone, Copy, Default, Debug, Serialize)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
            self.last = value;
            self.sum = value;
            self.count = 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / (self.count as f64)
        }
    }
}

/// Thread-safe wrapper for running statistics.
#[derive(Default)]
pub struct Stat {
    inner: Mutex<RunningStat>,
}

impl Stat {
    pub fn add_sample(&self, value: f64) {
        if let Ok(mut s) = self.inner.lock() {
            s.add(value);
        }
    }

    /// (last, avg, max, min, count)
    pub fn snapshot(&self) -> (f64, f64, f64, f64, u64) {
        if let Ok(s) = self.inner.lock() {
            (s.last, s.avg(), s.max, s.min, s.count)
        } else {
            (0.0, 0.0, 0.0, 0.0, 0)
        }
    }
}

/// Counters describing what the agent has done since startup.
pub struct AgentStats {
    // Stream parsing
    pub samples_parsed: AtomicU64,
    pub summaries_parsed: AtomicU64,
    pub lines_ignored: AtomicU64,
    pub unknown_targets: AtomicU64,

    // Supervision
    pub high_loss_readings: AtomicU64,
    pub restarts: AtomicU64,
    pub restart_failures: AtomicU64,
    pub unexpected_exits: AtomicU64,

    // Sink
    pub points_queued: AtomicU64,
    pub points_dropped: AtomicU64,
    pub points_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub write_duration_ms: Stat,

    pub start_time: Instant,
}

impl Default for AgentStats {
    fn default() -> Self {
        Self {
            samples_parsed: AtomicU64::new(0),
            summaries_parsed: AtomicU64::new(0),
            lines_ignored: AtomicU64::new(0),
            unknown_targets: AtomicU64::new(0),
            high_loss_readings: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            restart_failures: AtomicU64::new(0),
            unexpected_exits: AtomicU64::new(0),
            points_queued: AtomicU64::new(0),
            points_dropped: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            write_duration_ms: Stat::default(),
            start_time: Instant::now(),
        }
    }
}

/// Point-in-time copy of [`AgentStats`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatsSnapshot {
    pub uptime_seconds: u64,
    pub samples_parsed: u64,
    pub summaries_parsed: u64,
    pub lines_ignored: u64,
    pub unknown_targets: u64,
    pub high_loss_readings: u64,
    pub restarts: u64,
    pub restart_failures: u64,
    pub unexpected_exits: u64,
    pub points_queued: u64,
    pub points_dropped: u64,
    pub points_written: u64,
    pub write_failures: u64,
    pub write_duration_ms_avg: f64,
    pub write_duration_ms_max: f64,
}

impl AgentStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AgentStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let (_, write_avg, write_max, _, _) = self.write_duration_ms.snapshot();

        AgentStatsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            samples_parsed: load(&self.samples_parsed),
            summaries_parsed: load(&self.summaries_parsed),
            lines_ignored: load(&self.lines_ignored),
            unknown_targets: load(&self.unknown_targets),
            high_loss_readings: load(&self.high_loss_readings),
            restarts: load(&self.restarts),
            restart_failures: load(&self.restart_failures),
            unexpected_exits: load(&self.unexpected_exits),
            points_queued: load(&self.points_queued),
            points_dropped: load(&self.points_dropped),
            points_written: load(&self.points_written),
            write_failures: load(&self.write_failures),
            write_duration_ms_avg: write_avg,
            write_duration_ms_max: write_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_stat() {
        let mut s = RunningStat::default();
        assert_eq!(s.avg(), 0.0);
        s.add(2.0);
        s.add(4.0);
        s.add(1.0);
        assert_eq!(s.avg(), 7.0 / 3.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        assert_eq!(s.last, 1.0);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = AgentStats::new();
        AgentStats::incr(&stats.samples_parsed);
        AgentStats::incr(&stats.samples_parsed);
        AgentStats::add(&stats.points_written, 20);
        stats.write_duration_ms.add_sample(12.0);

        let snap = stats.snapshot();
        assert_eq!(snap.samples_parsed, 2);
        assert_eq!(snap.points_written, 20);
        assert_eq!(snap.restarts, 0);
        assert_eq!(snap.write_duration_ms_max, 12.0);
    }
}
