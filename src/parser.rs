//! Line grammars for fping output.
//!
//! fping in loop mode (`-l -D -e`) prints one data line per reply on stdout and
//! a per-target summary on stderr. Both parsers are pure: the same line always
//! yields the same result, and anything that does not match is `None`.
//!
//! Numeric sub-fields that match the grammar but do not parse as numbers are
//! taken as zero instead of rejecting the line.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static SAMPLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[(\d+\.\d+)\] (\S+)\s+: \[\d+\], \d+ bytes, ([0-9.]+) ms \(([0-9.]+) avg, (\d+)% loss\)",
    )
    .expect("sample pattern is valid")
});

static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(\S+)\s+: xmt/rcv/%loss = (\d+)/(\d+)/(\d+)%, min/avg/max = ([0-9.]+)/([0-9.]+)/([0-9.]+)",
    )
    .expect("summary pattern is valid")
});

/// One reply reported on the data stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingSample {
    /// Unix time in seconds with fraction, as printed by `-D`.
    pub timestamp: f64,
    pub target: String,
    pub rtt_ms: f64,
    /// fping's own running average.
    pub avg_ms: f64,
    pub loss_pct: u32,
}

impl PingSample {
    /// Converts the printed timestamp; falls back to `received` when it is not
    /// a representable point in time.
    pub fn time(&self, received: SystemTime) -> SystemTime {
        Duration::try_from_secs_f64(self.timestamp)
            .ok()
            .and_then(|d| UNIX_EPOCH.checked_add(d))
            .unwrap_or(received)
    }
}

/// Per-target totals reported on the summary stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub target: String,
    pub sent: u64,
    pub received: u64,
    pub loss_pct: u32,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

/// A recognized line from either stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeEvent {
    Sample(PingSample),
    Summary(RunSummary),
}

fn float(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

fn int<T: std::str::FromStr + Default>(s: &str) -> T {
    s.parse().unwrap_or_default()
}

/// Parses a stdout data line.
pub fn parse_sample(line: &str) -> Option<PingSample> {
    let caps = SAMPLE_RE.captures(line)?;
    Some(PingSample {
        timestamp: float(&caps[1]),
        target: caps[2].to_string(),
        rtt_ms: float(&caps[3]),
        avg_ms: float(&caps[4]),
        loss_pct: int(&caps[5]),
    })
}

/// Parses a stderr summary line.
pub fn parse_summary(line: &str) -> Option<RunSummary> {
    let caps = SUMMARY_RE.captures(line)?;
    Some(RunSummary {
        target: caps[1].to_string(),
        sent: int(&caps[2]),
        received: int(&caps[3]),
        loss_pct: int(&caps[4]),
        min_ms: float(&caps[5]),
        avg_ms: float(&caps[6]),
        max_ms: float(&caps[7]),
    })
}

/// Tries both grammars; used where the stream of origin is unknown.
pub fn parse_any(line: &str) -> Option<ProbeEvent> {
    parse_sample(line)
        .map(ProbeEvent::Sample)
        .or_else(|| parse_summary(line).map(ProbeEvent::Summary))
}
