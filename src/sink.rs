//! Metric sinks.
//!
//! Records are handed to a [`MetricSink`] as [`Point`]s. The InfluxDB writer
//! queues points and ships them in batches from a background task, so
//! `write_point` never blocks the stream readers.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::InfluxDbConfig;
use crate::health_stats::AgentStats;

/// Scalar field value of a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Integer(i64::from(v))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

/// A timestamped, tagged, multi-field record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(skip)]
    pub timestamp: SystemTime,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: SystemTime) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(_) => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Float(_) => None,
        }
    }

    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    /// Encodes the point as one line of InfluxDB line protocol.
    ///
    /// Non-finite floats are not representable and are left out; a point
    /// without any remaining field yields `None`.
    pub fn to_line_protocol(&self) -> Option<String> {
        let mut line = String::with_capacity(128);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (k, v) in &self.tags {
            if v.is_empty() {
                continue;
            }
            line.push(',');
            escape_into(&mut line, k, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, v, &[',', '=', ' ']);
        }

        let mut first = true;
        for (k, v) in &self.fields {
            let rendered = match v {
                FieldValue::Float(f) if !f.is_finite() => continue,
                FieldValue::Float(f) => format!("{f}"),
                FieldValue::Integer(i) => format!("{i}i"),
            };
            line.push(if first { ' ' } else { ',' });
            first = false;
            escape_into(&mut line, k, &[',', '=', ' ']);
            line.push('=');
            line.push_str(&rendered);
        }

        if first {
            return None;
        }

        let _ = write!(line, " {}", self.timestamp_nanos());
        Some(line)
    }
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Destination for assembled records. Must tolerate concurrent callers.
pub trait MetricSink: Send + Sync {
    fn write_point(&self, point: Point);

    /// Requests delivery of anything buffered. Does not wait for it.
    fn flush(&self);
}

/// Prints line protocol to stdout (dry-run mode).
#[derive(Default)]
pub struct StdoutSink;

impl MetricSink for StdoutSink {
    fn write_point(&self, point: Point) {
        if let Some(line) = point.to_line_protocol() {
            println!("{line}");
        }
    }

    fn flush(&self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("InfluxDB rejected write with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("sink queue closed")]
    Closed,
}

enum Command {
    Point(Point),
    Flush(Option<oneshot::Sender<()>>),
}

/// Batching writer for the InfluxDB v2 HTTP API.
pub struct InfluxWriter {
    tx: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<AgentStats>,
}

impl InfluxWriter {
    /// Builds the HTTP client and spawns the background batcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(cfg: &InfluxDbConfig, stats: Arc<AgentStats>) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let url = format!("{}://{}:{}/api/v2/write", cfg.scheme, cfg.host, cfg.port);
        info!(
            url = %url,
            org = %cfg.org,
            bucket = %cfg.bucket,
            batch_size = cfg.batch_size,
            "InfluxDB writer configured"
        );

        let batcher = Batcher {
            client,
            url,
            token: cfg.token.clone(),
            org: cfg.org.clone(),
            bucket: cfg.bucket.clone(),
            batch_size: cfg.batch_size.max(1),
            retry_interval: Duration::from_millis(cfg.retry_interval_ms),
            max_retries: cfg.max_retries,
            stats: Arc::clone(&stats),
        };

        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let flush_interval = Duration::from_millis(cfg.flush_interval_ms.max(1));
        let task = tokio::spawn(batcher.run(rx, flush_interval));

        Ok(Self {
            tx,
            task: Mutex::new(Some(task)),
            stats,
        })
    }

    /// Flushes everything queued so far and waits for it, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), SinkError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(Some(ack_tx)))
            .await
            .map_err(|_| SinkError::Closed)?;

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => {
                info!("InfluxDB writer flushed");
                Ok(())
            }
            Ok(Err(_)) => Err(SinkError::Closed),
            Err(_) => {
                warn!(?timeout, "Timed out waiting for final InfluxDB flush");
                if let Ok(mut task) = self.task.lock() {
                    if let Some(task) = task.take() {
                        task.abort();
                    }
                }
                Ok(())
            }
        }
    }
}

impl MetricSink for InfluxWriter {
    fn write_point(&self, point: Point) {
        match self.tx.try_send(Command::Point(point)) {
            Ok(()) => AgentStats::incr(&self.stats.points_queued),
            Err(mpsc::error::TrySendError::Full(_)) => {
                AgentStats::incr(&self.stats.points_dropped);
                warn!("InfluxDB queue full, dropping point");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                AgentStats::incr(&self.stats.points_dropped);
                debug!("InfluxDB writer closed, dropping point");
            }
        }
    }

    fn flush(&self) {
        if self.tx.try_send(Command::Flush(None)).is_err() {
            debug!("Flush request not queued");
        }
    }
}

struct Batcher {
    client: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
    batch_size: usize,
    retry_interval: Duration,
    max_retries: u32,
    stats: Arc<AgentStats>,
}

impl Batcher {
    async fn run(self, mut rx: mpsc::Receiver<Command>, flush_interval: Duration) {
        let mut buffer: Vec<Point> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Point(point)) => {
                        buffer.push(point);
                        if buffer.len() >= self.batch_size {
                            self.write_batch(&mut buffer).await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.write_batch(&mut buffer).await;
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    None => {
                        self.write_batch(&mut buffer).await;
                        debug!("InfluxDB writer queue closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.write_batch(&mut buffer).await;
                }
            }
        }
    }

    async fn write_batch(&self, buffer: &mut Vec<Point>) {
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len() as u64;
        let body = buffer
            .drain(..)
            .filter_map(|p| p.to_line_protocol())
            .collect::<Vec<_>>()
            .join("\n");

        let mut attempt = 0;
        loop {
            let start = Instant::now();
            match self.send(body.clone()).await {
                Ok(()) => {
                    self.stats
                        .write_duration_ms
                        .add_sample(start.elapsed().as_secs_f64() * 1000.0);
                    self.stats.points_written.fetch_add(count, Ordering::Relaxed);
                    debug!(points = count, "Batch written to InfluxDB");
                    return;
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        "InfluxDB write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => {
                    AgentStats::incr(&self.stats.write_failures);
                    AgentStats::add(&self.stats.points_dropped, count);
                    error!(error = %e, points = count, "InfluxDB write failed, batch dropped");
                    return;
                }
            }
        }
    }

    async fn send(&self, body: String) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
