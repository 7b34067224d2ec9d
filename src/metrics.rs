//! Record assembly.
//!
//! Turns parsed probe events plus the current target statistics into points
//! for the sink. Window fields are named by the window length in whole seconds,
//! e.g. `min_60_ms`, `avg_3600_ms`.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::parser::{PingSample, RunSummary};
use crate::sink::{MetricSink, Point};
use crate::stats::{Extremes, WindowSnapshot};

/// Measurement name suffix for per-run summary records.
pub const SUMMARY_SUFFIX: &str = "_summary";

pub fn window_field(kind: &str, window: Duration) -> String {
    format!("{}_{}_ms", kind, window.as_secs())
}

/// Builds and emits records tagged with the source host.
#[derive(Clone)]
pub struct MetricEmitter {
    sink: Arc<dyn MetricSink>,
    measurement: String,
    source: String,
}

impl MetricEmitter {
    pub fn new(
        sink: Arc<dyn MetricSink>,
        measurement: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            measurement: measurement.into(),
            source: source.into(),
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn summary_measurement(&self) -> String {
        format!("{}{}", self.measurement, SUMMARY_SUFFIX)
    }

    /// Per-sample record, timestamped by the probe's own clock.
    pub fn sample_point(
        &self,
        sample: &PingSample,
        extremes: Extremes,
        windows: &[WindowSnapshot],
    ) -> Point {
        let mut point = Point::new(self.measurement.as_str(), sample.time(SystemTime::now()))
            .tag("source", self.source.as_str())
            .tag("target", sample.target.as_str())
            .field("current_ms", sample.rtt_ms)
            .field("fping_avg_ms", sample.avg_ms)
            .field("absolute_min_ms", extremes.min)
            .field("absolute_max_ms", extremes.max)
            .field("loss_pct", sample.loss_pct);

        for w in windows {
            point = point
                .field(window_field("min", w.window), w.min)
                .field(window_field("max", w.window), w.max)
                .field(window_field("avg", w.window), w.avg);
        }
        point
    }

    /// Per-run summary record, timestamped at receipt since the line carries no time.
    pub fn summary_point(&self, summary: &RunSummary, received: SystemTime) -> Point {
        Point::new(self.summary_measurement(), received)
            .tag("source", self.source.as_str())
            .tag("target", summary.target.as_str())
            .field("fping_min_ms", summary.min_ms)
            .field("fping_avg_ms", summary.avg_ms)
            .field("fping_max_ms", summary.max_ms)
            .field("xmt", summary.sent)
            .field("rcv", summary.received)
            .field("loss_pct", summary.loss_pct)
    }

    pub fn emit(&self, point: Point) {
        self.sink.write_point(point);
    }

    pub fn flush(&self) {
        self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_sample, parse_summary};
    use std::sync::Mutex;
    use std::time::UNIX_EPOCH;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Point>>);

    impl MetricSink for Capture {
        fn write_point(&self, point: Point) {
            self.0.lock().unwrap().push(point);
        }
        fn flush(&self) {}
    }

    #[test]
    fn test_window_field_names() {
        assert_eq!(window_field("min", Duration::from_secs(60)), "min_60_ms");
        assert_eq!(window_field("avg", Duration::from_secs(3600)), "avg_3600_ms");
    }

    #[test]
    fn test_sample_point_fields() {
        let sink = Arc::new(Capture::default());
        let emitter = MetricEmitter::new(sink.clone(), "latency", "probe-1");
        let sample = parse_sample(
            "[1700000000.500] 10.0.0.1 : [12], 64 bytes, 1.23 ms (1.50 avg, 0% loss)",
        )
        .unwrap();
        let windows = [WindowSnapshot {
            window: Duration::from_secs(60),
            min: 1.0,
            avg: 1.2,
            max: 1.4,
        }];
        let extremes = Extremes { min: 0.9, max: 3.0 };

        emitter.emit(emitter.sample_point(&sample, extremes, &windows));

        let points = sink.0.lock().unwrap();
        let p = &points[0];
        assert_eq!(p.measurement, "latency");
        assert_eq!(p.tags["source"], "probe-1");
        assert_eq!(p.tags["target"], "10.0.0.1");
        assert_eq!(p.float("current_ms"), Some(1.23));
        assert_eq!(p.float("fping_avg_ms"), Some(1.50));
        assert_eq!(p.float("absolute_min_ms"), Some(0.9));
        assert_eq!(p.float("absolute_max_ms"), Some(3.0));
        assert_eq!(p.integer("loss_pct"), Some(0));
        assert_eq!(p.float("min_60_ms"), Some(1.0));
        assert_eq!(p.float("avg_60_ms"), Some(1.2));
        assert_eq!(p.float("max_60_ms"), Some(1.4));
        assert_eq!(p.timestamp_nanos(), 1_700_000_000_500_000_000);
    }

    #[test]
    fn test_summary_point_fields() {
        let sink = Arc::new(Capture::default());
        let emitter = MetricEmitter::new(sink, "latency", "probe-1");
        let summary =
            parse_summary("10.0.0.1 : xmt/rcv/%loss = 10/9/10%, min/avg/max = 1.00/1.50/2.00")
                .unwrap();
        let received = UNIX_EPOCH + Duration::from_secs(42);

        let p = emitter.summary_point(&summary, received);
        assert_eq!(p.measurement, "latency_summary");
        assert_eq!(p.tags["target"], "10.0.0.1");
        assert_eq!(p.float("fping_min_ms"), Some(1.0));
        assert_eq!(p.float("fping_avg_ms"), Some(1.5));
        assert_eq!(p.float("fping_max_ms"), Some(2.0));
        assert_eq!(p.integer("xmt"), Some(10));
        assert_eq!(p.integer("rcv"), Some(9));
        assert_eq!(p.integer("loss_pct"), Some(10));
        assert_eq!(p.timestamp, received);
    }
}
