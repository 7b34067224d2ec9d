//! Integration tests for the fping supervisor.
//!
//! A `/bin/sh -c` script stands in for fping; the target list is appended to
//! the command line, so the first target is available to the script as `$1`.

#![cfg(unix)]

use herakles_latency_monitor::health_stats::AgentStats;
use herakles_latency_monitor::sink::{MetricSink, Point};
use herakles_latency_monitor::{
    MetricEmitter, ProbeSettings, ProbeSupervisor, SupervisorError, SupervisorState,
    TargetRegistry,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CaptureSink {
    points: Mutex<Vec<Point>>,
    flushes: AtomicUsize,
}

impl CaptureSink {
    fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }

    fn count(&self, measurement: &str) -> usize {
        self.points
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.measurement == measurement)
            .count()
    }
}

impl MetricSink for CaptureSink {
    fn write_point(&self, point: Point) {
        self.points.lock().unwrap().push(point);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    supervisor: ProbeSupervisor,
    sink: Arc<CaptureSink>,
    stats: Arc<AgentStats>,
}

fn harness(program: &str, script: &str) -> Harness {
    harness_with_grace(program, script, Duration::from_millis(50))
}

fn harness_with_grace(program: &str, script: &str, restart_grace: Duration) -> Harness {
    let settings = ProbeSettings {
        program: PathBuf::from(program),
        args: vec!["-c".into(), script.into(), "fping".into()],
        working_dir: None,
        restart_threshold: 30,
        consecutive_threshold: 3,
        restart_grace,
        verbose: true,
    };
    let sink = Arc::new(CaptureSink::default());
    let stats = Arc::new(AgentStats::new());
    let targets = Arc::new(TargetRegistry::new(
        ["10.0.0.1"],
        &[Duration::from_secs(60), Duration::from_secs(3600)],
    ));
    let emitter = MetricEmitter::new(sink.clone(), "latency", "test-host");
    let supervisor = ProbeSupervisor::new(settings, targets, emitter, Arc::clone(&stats));
    Harness {
        supervisor,
        sink,
        stats,
    }
}

fn sample(rtt: &str, loss: u32) -> String {
    format!(
        "echo \"[1700000000.000] $1 : [0], 64 bytes, {rtt} ms ({rtt} avg, {loss}% loss)\""
    )
}

/// Polls `cond` until it holds or five seconds pass.
async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    wait_up_to(Duration::from_secs(5), cond).await
}

async fn wait_up_to<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let rounds = limit.as_millis() / 20;
    for _ in 0..rounds {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test]
async fn test_samples_and_summaries_flow_to_sink() {
    let script = format!(
        "{}\n{}\necho \"$1 : xmt/rcv/%loss = 2/2/0%, min/avg/max = 1.00/1.50/2.00\" >&2\nexec sleep 30",
        sample("1.00", 0),
        sample("2.00", 0)
    );
    let h = harness("/bin/sh", &script);

    h.supervisor.start().unwrap();
    assert_eq!(h.supervisor.state(), SupervisorState::Running);

    assert!(wait_for(|| h.sink.count("latency") == 2 && h.sink.count("latency_summary") == 1).await);
    assert!(h.sink.flushes.load(Ordering::SeqCst) >= 1);

    let points = h.sink.points();
    let last_sample = points
        .iter()
        .filter(|p| p.measurement == "latency")
        .last()
        .unwrap();
    assert_eq!(last_sample.tags["target"], "10.0.0.1");
    assert_eq!(last_sample.tags["source"], "test-host");
    assert_eq!(last_sample.float("absolute_min_ms"), Some(1.0));
    assert_eq!(last_sample.float("absolute_max_ms"), Some(2.0));
    assert_eq!(last_sample.float("avg_60_ms"), Some(1.5));
    assert_eq!(last_sample.float("max_3600_ms"), Some(2.0));

    let summary = points
        .iter()
        .find(|p| p.measurement == "latency_summary")
        .unwrap();
    assert_eq!(summary.float("fping_avg_ms"), Some(1.5));
    assert_eq!(summary.integer("xmt"), Some(2));

    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
    assert_eq!(h.stats.unexpected_exits.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_high_loss_restart_keeps_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started");
    let script = format!(
        "if [ -f '{marker}' ]; then\n{second}\nelse\ntouch '{marker}'\n{good}\n{bad}\n{bad}\n{bad}\nfi\nexec sleep 30",
        marker = marker.display(),
        second = sample("5.00", 0),
        good = sample("9.00", 0),
        bad = sample("1.00", 50),
    );
    let h = harness("/bin/sh", &script);

    h.supervisor.start().unwrap();
    let first_generation = h.supervisor.generation();

    assert!(wait_for(|| h.stats.restarts.load(Ordering::Relaxed) == 1).await);
    assert!(wait_for(|| h.sink.count("latency") == 4).await);

    // Samples before and after the restart land in the same statistics.
    let target = h.supervisor.targets().get("10.0.0.1").unwrap();
    let extremes = target.extremes();
    assert_eq!(extremes.min, 1.0);
    assert_eq!(extremes.max, 9.0);
    assert_eq!(target.tracker().len(), 4);

    assert_eq!(h.supervisor.high_loss_count(), 0);
    assert_ne!(h.supervisor.generation(), first_generation);
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    assert_eq!(h.stats.high_loss_readings.load(Ordering::Relaxed), 3);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_start_refused_while_restarting() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started");
    let script = format!(
        "if [ -f '{marker}' ]; then\n{second}\nelse\ntouch '{marker}'\n{bad}\n{bad}\n{bad}\nfi\nexec sleep 30",
        marker = marker.display(),
        second = sample("4.00", 50),
        bad = sample("1.00", 50),
    );
    let h = harness_with_grace("/bin/sh", &script, Duration::from_millis(600));

    h.supervisor.start().unwrap();
    assert!(wait_for(|| h.supervisor.state() == SupervisorState::Restarting).await);
    assert!(matches!(
        h.supervisor.start(),
        Err(SupervisorError::Restarting)
    ));

    assert!(wait_for(|| h.stats.restarts.load(Ordering::Relaxed) == 1).await);
    assert!(wait_for(|| h.sink.count("latency") == 3).await);
    let generation = h.supervisor.generation();
    assert!(generation.is_some());

    // One bad reading in the new generation is only the start of a new run.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.supervisor.high_loss_count(), 1);
    assert_eq!(h.supervisor.generation(), generation);
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    assert_eq!(h.stats.restarts.load(Ordering::Relaxed), 1);
    assert_eq!(h.stats.unexpected_exits.load(Ordering::Relaxed), 0);
    assert_eq!(h.stats.high_loss_readings.load(Ordering::Relaxed), 4);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_old_stderr_drains_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started");
    // The first generation reports its summary only once it is terminated.
    let script = format!(
        "host=$1\nif [ -f '{marker}' ]; then\n{second}\nexec sleep 30\nfi\ntouch '{marker}'\n\
         trap 'echo \"$host : xmt/rcv/%loss = 4/1/75%, min/avg/max = 1.00/1.00/1.00\" >&2; exit 0' TERM\n\
         {bad}\n{bad}\n{bad}\nsleep 30 &\nwait",
        marker = marker.display(),
        second = sample("5.00", 0),
        bad = sample("1.00", 50),
    );
    let h = harness("/bin/sh", &script);

    h.supervisor.start().unwrap();

    assert!(wait_for(|| h.stats.restarts.load(Ordering::Relaxed) == 1).await);
    assert!(wait_for(|| h.sink.count("latency_summary") == 1 && h.sink.count("latency") == 3).await);

    let points = h.sink.points();
    let summary = points
        .iter()
        .find(|p| p.measurement == "latency_summary")
        .unwrap();
    assert_eq!(summary.tags["target"], "10.0.0.1");
    assert_eq!(summary.integer("xmt"), Some(4));
    assert_eq!(summary.integer("rcv"), Some(1));
    assert_eq!(summary.float("fping_avg_ms"), Some(1.0));

    let newest = points
        .iter()
        .filter(|p| p.measurement == "latency")
        .last()
        .unwrap();
    assert_eq!(newest.float("current_ms"), Some(5.0));
    assert_eq!(h.supervisor.targets().get("10.0.0.1").unwrap().extremes().max, 5.0);

    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    assert_eq!(h.stats.unexpected_exits.load(Ordering::Relaxed), 0);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_during_restart_reaps_old_generation() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("child.pid");
    // Ignores SIGTERM so the old group is only gone once it has been killed.
    let script = format!(
        "trap '' TERM\nsleep 30 &\necho $! > '{pidfile}'\n{bad}\n{bad}\n{bad}\nwait",
        pidfile = pidfile.display(),
        bad = sample("1.00", 50),
    );
    let h = harness_with_grace("/bin/sh", &script, Duration::from_secs(10));

    h.supervisor.start().unwrap();
    assert!(wait_for(|| h.supervisor.state() == SupervisorState::Restarting).await);

    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.generation(), None);
    assert_eq!(h.stats.restarts.load(Ordering::Relaxed), 0);

    #[cfg(target_os = "linux")]
    {
        let pid: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // Well before the detached watcher of an unawaited generation would
        // have escalated to SIGKILL.
        assert!(wait_up_to(Duration::from_secs(1), || process_gone(pid)).await);
    }
}

#[tokio::test]
async fn test_unexpected_exit_is_not_restarted() {
    let script = sample("3.00", 0);
    let h = harness("/bin/sh", &script);

    h.supervisor.start().unwrap();
    assert!(wait_for(|| h.stats.unexpected_exits.load(Ordering::Relaxed) == 1).await);
    assert!(wait_for(|| h.supervisor.state() == SupervisorState::Stopped).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.stats.restarts.load(Ordering::Relaxed), 0);
    assert_eq!(h.sink.count("latency"), 1);

    // An explicit start is still accepted.
    h.supervisor.start().unwrap();
    assert!(wait_for(|| h.sink.count("latency") == 2).await);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let h = harness("/nonexistent/fping", "true");

    let err = h.supervisor.start().unwrap_err();
    assert!(matches!(err, SupervisorError::Spawn { .. }));
    assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_final() {
    let h = harness("/bin/sh", "exec sleep 30");

    h.supervisor.start().unwrap();
    assert!(matches!(
        h.supervisor.start(),
        Err(SupervisorError::AlreadyRunning(_))
    ));

    h.supervisor.stop();
    h.supervisor.stop();
    h.supervisor.shutdown().await;

    assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
    assert!(matches!(h.supervisor.start(), Err(SupervisorError::Stopped)));
    assert_eq!(h.stats.unexpected_exits.load(Ordering::Relaxed), 0);
}

/// A reaped or zombie process counts as gone.
#[cfg(target_os = "linux")]
fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_stop_terminates_whole_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("child.pid");
    let script = format!(
        "sleep 30 &\necho $! > '{}'\nwait",
        pidfile.display()
    );
    let h = harness("/bin/sh", &script);

    h.supervisor.start().unwrap();
    assert!(wait_for(|| std::fs::read_to_string(&pidfile).is_ok_and(|s| s.ends_with('\n'))).await);
    let pid: i32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    h.supervisor.shutdown().await;

    let gone = wait_for(|| process_gone(pid)).await;
    assert!(gone, "background child {pid} survived shutdown");
}
