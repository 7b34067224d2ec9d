//! Herakles Latency Monitor Library
//!
//! This library drives `fping` in loop mode, keeps rolling latency statistics
//! per target and turns every probe result into a metric record. It is split
//! so the supervisor, the parser and the statistics engine can be embedded or
//! tested without the binary.
//!
//! # Features
//!
//! - **Probe supervision**: Spawns fping, reads its output streams and restarts it
//!   after sustained high packet loss
//! - **Line parsing**: Per-sample data lines and per-run summary lines
//! - **Rolling statistics**: Min/max/avg over any number of time windows per target
//! - **Metric sinks**: Batched InfluxDB v2 writer or line protocol on stdout
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use herakles_latency_monitor::{
//!     AgentStats, MetricEmitter, ProbeSettings, ProbeSupervisor, StdoutSink, TargetRegistry,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let windows = [Duration::from_secs(60), Duration::from_secs(3600)];
//! let targets = Arc::new(TargetRegistry::new(["10.0.0.1", "10.0.0.2"], &windows));
//! let emitter = MetricEmitter::new(Arc::new(StdoutSink), "latency", "probe-1");
//!
//! let supervisor = ProbeSupervisor::new(
//!     ProbeSettings::default(),
//!     targets,
//!     emitter,
//!     Arc::new(AgentStats::new()),
//! );
//! supervisor.start()?;
//!
//! tokio::signal::ctrl_c().await?;
//! supervisor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod health_stats;
pub mod metrics;
pub mod parser;
pub mod sink;
pub mod startup_checks;
pub mod stats;
pub mod supervisor;
pub mod targets;

// Re-export main types for convenience
pub use health_stats::{AgentStats, AgentStatsSnapshot};
pub use metrics::MetricEmitter;
pub use parser::{parse_sample, parse_summary, PingSample, ProbeEvent, RunSummary};
pub use sink::{FieldValue, InfluxWriter, MetricSink, Point, SinkError, StdoutSink};
pub use stats::{RollingStatsTracker, StatKind, TargetRegistry, TargetStats, NO_DATA};
pub use supervisor::{
    LineOutcome, LossPolicy, LossVerdict, ProbeSettings, ProbeSupervisor, SupervisorError,
    SupervisorState,
};
