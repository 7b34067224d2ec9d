//! Parse command implementation.
//!
//! Replays captured fping output through the parsers, the statistics engine and
//! record assembly, and prints what the monitor would write.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use herakles_latency_monitor::config::Config;
use herakles_latency_monitor::parser::{parse_any, ProbeEvent};
use herakles_latency_monitor::sink::StdoutSink;
use herakles_latency_monitor::stats::TargetRegistry;
use herakles_latency_monitor::MetricEmitter;

/// Counts reported after a replay.
#[derive(Debug, Default, PartialEq)]
pub struct ParseReport {
    pub samples: usize,
    pub summaries: usize,
    pub ignored: usize,
    pub first: Option<SystemTime>,
    pub last: Option<SystemTime>,
}

/// Parses a capture file (or stdin) and prints records or JSON events.
pub fn command_parse(
    input: Option<PathBuf>,
    json: bool,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let reader: Box<dyn BufRead> = match &input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let report = replay(reader, json, config, &mut out)?;

    eprintln!("📊 Parse results:");
    eprintln!("   ├─ Samples:   {}", report.samples);
    eprintln!("   ├─ Summaries: {}", report.summaries);
    eprintln!("   └─ Ignored:   {}", report.ignored);
    if let (Some(first), Some(last)) = (report.first, report.last) {
        eprintln!(
            "   ⏱️  {} → {}",
            DateTime::<Utc>::from(first).to_rfc3339(),
            DateTime::<Utc>::from(last).to_rfc3339()
        );
    }
    Ok(())
}

/// Runs every line through both grammars.
///
/// Samples feed a registry whose clock follows the capture's own timestamps,
/// so window values match what a live run would have produced.
pub fn replay<R: BufRead, W: Write>(
    reader: R,
    json: bool,
    config: &Config,
    out: &mut W,
) -> Result<ParseReport, Box<dyn std::error::Error>> {
    let events: Vec<Option<ProbeEvent>> = reader
        .lines()
        .map(|line| line.map(|l| parse_any(&l)))
        .collect::<Result<_, _>>()?;

    let windows = config.windows()?;
    let registry = TargetRegistry::new(
        events.iter().flatten().filter_map(|e| match e {
            ProbeEvent::Sample(s) => Some(s.target.clone()),
            ProbeEvent::Summary(_) => None,
        }),
        &windows,
    );
    let emitter = MetricEmitter::new(
        Arc::new(StdoutSink),
        config.influxdb.measurement.as_str(),
        config.source_host(),
    );

    let base = Instant::now();
    let mut first_ts: Option<f64> = None;
    let mut clock = base;
    let mut report = ParseReport::default();

    for event in events {
        let Some(event) = event else {
            report.ignored += 1;
            continue;
        };

        let (point, time) = match &event {
            ProbeEvent::Sample(sample) => {
                report.samples += 1;
                let start = *first_ts.get_or_insert(sample.timestamp);
                let offset = Duration::try_from_secs_f64(sample.timestamp - start).unwrap_or_default();
                // Captures can step backwards; the trackers only prune from the front.
                let now = clock.max(base + offset);
                clock = now;

                let Some(target) = registry.get(&sample.target) else {
                    continue;
                };
                let extremes = target.record_at(sample.rtt_ms, now);
                let snapshot = target.windows_snapshot_at(now);
                let time = sample.time(SystemTime::now());
                (emitter.sample_point(sample, extremes, &snapshot), time)
            }
            ProbeEvent::Summary(summary) => {
                report.summaries += 1;
                let time = SystemTime::now();
                (emitter.summary_point(summary, time), time)
            }
        };

        report.first.get_or_insert(time);
        report.last = Some(time);

        if json {
            let value = serde_json::json!({
                "time": DateTime::<Utc>::from(time).to_rfc3339(),
                "event": event,
            });
            writeln!(out, "{}", value)?;
        } else if let Some(line) = point.to_line_protocol() {
            writeln!(out, "{}", line)?;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE: &str = "\
[1700000000.000] 10.0.0.1 : [0], 64 bytes, 2.00 ms (2.00 avg, 0% loss)
[1700000001.000] 10.0.0.1 : [1], 64 bytes, 4.00 ms (3.00 avg, 0% loss)
10.0.0.1 : [2], timed out (3.00 avg, 33% loss)
10.0.0.1 : xmt/rcv/%loss = 3/2/33%, min/avg/max = 2.00/3.00/4.00
";

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.monitor.source_host = Some("probe-1".into());
        cfg.monitor.window_sizes = vec!["60s".into()];
        cfg
    }

    #[test]
    fn test_replay_line_protocol() {
        let mut out = Vec::new();
        let report = replay(CAPTURE.as_bytes(), false, &config(), &mut out).unwrap();

        assert_eq!(report.samples, 2);
        assert_eq!(report.summaries, 1);
        assert_eq!(report.ignored, 1);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("latency,source=probe-1,target=10.0.0.1 "));
        assert!(lines[1].contains("avg_60_ms=3"));
        assert!(lines[1].contains("absolute_min_ms=2"));
        assert!(lines[1].ends_with(" 1700000001000000000"));
        assert!(lines[2].starts_with("latency_summary,source=probe-1,target=10.0.0.1 "));
        assert!(lines[2].contains("xmt=3i"));
    }

    #[test]
    fn test_replay_json() {
        let mut out = Vec::new();
        replay(CAPTURE.as_bytes(), true, &config(), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["event"]["kind"], "sample");
        assert_eq!(first["event"]["target"], "10.0.0.1");
        assert_eq!(first["time"], "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn test_replay_clock_never_runs_backwards() {
        let capture = "\
[1700000100.000] 10.0.0.1 : [0], 64 bytes, 8.00 ms (8.00 avg, 0% loss)
[1700000200.000] 10.0.0.1 : [1], 64 bytes, 6.00 ms (7.00 avg, 0% loss)
[1700000150.000] 10.0.0.1 : [2], 64 bytes, 2.00 ms (5.33 avg, 0% loss)
[1700000230.000] 10.0.0.1 : [3], 64 bytes, 4.00 ms (5.00 avg, 0% loss)
";
        let mut out = Vec::new();
        let report = replay(capture.as_bytes(), false, &config(), &mut out).unwrap();
        assert_eq!(report.samples, 4);

        // The out-of-order sample is held at the previous instant, so it is
        // still inside the 60s window of the last one.
        let text = String::from_utf8(out).unwrap();
        let last = text.lines().last().unwrap();
        assert!(last.contains("min_60_ms=2"));
        assert!(last.contains("max_60_ms=6"));
        assert!(last.contains("avg_60_ms=4"));
    }
}
