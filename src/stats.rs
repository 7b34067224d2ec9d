//! Rolling latency statistics per target.
//!
//! A `RollingStatsTracker` keeps every measurement inside the largest configured
//! window and answers min/max/avg queries for any window by scanning the stored
//! samples. `TargetStats` pairs a tracker with the lifetime extremes of a target.

use ahash::AHashMap as HashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Returned by statistics queries when no sample is available.
pub const NO_DATA: f64 = -1.0;

/// Kind of reduction applied to the samples of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatKind {
    Min,
    Max,
    Avg,
}

impl StatKind {
    pub const ALL: [StatKind; 3] = [StatKind::Min, StatKind::Max, StatKind::Avg];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatKind::Min => "min",
            StatKind::Max => "max",
            StatKind::Avg => "avg",
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single latency sample in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub value: f64,
    pub timestamp: Instant,
}

/// Time-pruned sample store with a fixed, ascending set of windows.
///
/// Samples are appended in timestamp order, so pruning only ever pops from the
/// front. With no windows configured nothing is pruned.
pub struct RollingStatsTracker {
    measurements: RwLock<VecDeque<Measurement>>,
    windows: Vec<Duration>,
}

impl RollingStatsTracker {
    /// Creates a tracker; the windows are sorted and de-duplicated.
    pub fn new(windows: &[Duration]) -> Self {
        let mut windows = windows.to_vec();
        windows.sort();
        windows.dedup();

        Self {
            measurements: RwLock::new(VecDeque::new()),
            windows,
        }
    }

    /// Configured windows in ascending order.
    pub fn windows(&self) -> &[Duration] {
        &self.windows
    }

    /// Largest window, which bounds retention.
    pub fn retention(&self) -> Option<Duration> {
        self.windows.last().copied()
    }

    /// Records a sample taken now.
    pub fn add(&self, value: f64) {
        self.add_at(value, Instant::now());
    }

    /// Records a sample taken at `now` and prunes everything outside the
    /// largest window.
    ///
    /// Callers must supply non-decreasing instants per tracker.
    pub fn add_at(&self, value: f64, now: Instant) {
        let Ok(mut measurements) = self.measurements.write() else {
            return;
        };

        measurements.push_back(Measurement {
            value,
            timestamp: now,
        });

        if let Some(retention) = self.retention() {
            // An instant earlier than the clock origin cannot be represented;
            // then nothing is old enough to drop yet.
            if let Some(cutoff) = now.checked_sub(retention) {
                while measurements
                    .front()
                    .is_some_and(|m| m.timestamp <= cutoff)
                {
                    measurements.pop_front();
                }
            }
        }
    }

    /// Reduces the samples inside `window` as of now.
    pub fn get_stat(&self, kind: StatKind, window: Duration) -> f64 {
        self.get_stat_at(kind, window, Instant::now())
    }

    /// Reduces the samples whose timestamp is strictly after `now - window`.
    /// Returns [`NO_DATA`] when none qualify.
    pub fn get_stat_at(&self, kind: StatKind, window: Duration, now: Instant) -> f64 {
        let Ok(measurements) = self.measurements.read() else {
            return NO_DATA;
        };

        let cutoff = now.checked_sub(window);
        let in_window = measurements
            .iter()
            .filter(|m| cutoff.map_or(true, |c| m.timestamp > c))
            .map(|m| m.value);

        match kind {
            StatKind::Min => in_window.reduce(f64::min).unwrap_or(NO_DATA),
            StatKind::Max => in_window.reduce(f64::max).unwrap_or(NO_DATA),
            StatKind::Avg => {
                let (sum, count) = in_window.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                if count == 0 {
                    NO_DATA
                } else {
                    sum / count as f64
                }
            }
        }
    }

    /// Number of samples currently retained.
    pub fn len(&self) -> usize {
        self.measurements.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifetime extremes of a target; both start unset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Extremes {
    pub min: f64,
    pub max: f64,
}

impl Default for Extremes {
    fn default() -> Self {
        Self {
            min: NO_DATA,
            max: NO_DATA,
        }
    }
}

impl Extremes {
    fn update(&mut self, value: f64) {
        if self.min < 0.0 || value < self.min {
            self.min = value;
        }
        if self.max < 0.0 || value > self.max {
            self.max = value;
        }
    }
}

/// Per-target state: rolling windows plus lifetime extremes.
pub struct TargetStats {
    tracker: RollingStatsTracker,
    extremes: Mutex<Extremes>,
}

/// Values of one window at the time of a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub window: Duration,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl TargetStats {
    pub fn new(windows: &[Duration]) -> Self {
        Self {
            tracker: RollingStatsTracker::new(windows),
            extremes: Mutex::new(Extremes::default()),
        }
    }

    /// Adds a sample to the tracker and folds it into the lifetime extremes.
    pub fn record(&self, value: f64) -> Extremes {
        self.record_at(value, Instant::now())
    }

    pub fn record_at(&self, value: f64, now: Instant) -> Extremes {
        self.tracker.add_at(value, now);
        match self.extremes.lock() {
            Ok(mut extremes) => {
                extremes.update(value);
                *extremes
            }
            Err(_) => Extremes::default(),
        }
    }

    pub fn extremes(&self) -> Extremes {
        self.extremes.lock().map(|e| *e).unwrap_or_default()
    }

    pub fn tracker(&self) -> &RollingStatsTracker {
        &self.tracker
    }

    /// Min/avg/max for every configured window, ascending.
    pub fn windows_snapshot(&self) -> Vec<WindowSnapshot> {
        self.windows_snapshot_at(Instant::now())
    }

    pub fn windows_snapshot_at(&self, now: Instant) -> Vec<WindowSnapshot> {
        self.tracker
            .windows()
            .iter()
            .map(|&window| WindowSnapshot {
                window,
                min: self.tracker.get_stat_at(StatKind::Min, window, now),
                avg: self.tracker.get_stat_at(StatKind::Avg, window, now),
                max: self.tracker.get_stat_at(StatKind::Max, window, now),
            })
            .collect()
    }
}

/// Fixed map of target name to its statistics.
///
/// The key set is frozen at construction, so lookups need no lock.
pub struct TargetRegistry {
    targets: HashMap<String, TargetStats>,
    order: Vec<String>,
    windows: Vec<Duration>,
}

impl TargetRegistry {
    pub fn new<I, S>(targets: I, windows: &[Duration]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut windows = windows.to_vec();
        windows.sort();
        windows.dedup();

        let mut map = HashMap::new();
        let mut order = Vec::new();
        for name in targets {
            let name = name.into();
            if !map.contains_key(&name) {
                map.insert(name.clone(), TargetStats::new(&windows));
                order.push(name);
            }
        }

        Self {
            targets: map,
            order,
            windows,
        }
    }

    pub fn get(&self, target: &str) -> Option<&TargetStats> {
        self.targets.get(target)
    }

    /// Target names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn windows(&self) -> &[Duration] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
