//! fping process supervision.
//!
//! The supervisor owns one fping subprocess at a time. Each launch is a
//! generation with its own cancellation token and three tasks: a stdout reader
//! (samples), a stderr reader (summaries) and a watcher that waits for the
//! process and tears its process group down on cancellation.
//!
//! Restarts are driven only by sustained packet loss: `consecutive_threshold`
//! data lines in a row with loss at or above `restart_threshold`, counted
//! across all targets. An fping exit that nobody asked for is logged and left
//! alone; the agent then has no probe until `start()` or `restart()` is called
//! again. Target statistics live outside the generation and survive restarts.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::health_stats::AgentStats;
use crate::metrics::MetricEmitter;
use crate::parser::{parse_sample, parse_summary};
use crate::stats::TargetRegistry;

/// How long fping gets to exit after SIGTERM before the group is killed.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for draining a generation's tasks on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to attach to fping {0}")]
    StreamAttach(&'static str),

    #[error("fping is already running (generation {0})")]
    AlreadyRunning(u64),

    #[error("supervisor has been stopped")]
    Stopped,

    #[error("fping restart in progress")]
    Restarting,
}

/// Invocation and restart policy of the probe.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub program: PathBuf,
    /// Fixed arguments, placed before the target list.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Loss percentage at or above which a reading counts as high loss.
    pub restart_threshold: u32,
    /// High-loss readings in a row that trigger a restart.
    pub consecutive_threshold: u32,
    /// Pause between stopping the old generation and starting the next.
    pub restart_grace: Duration,
    /// Log every sample and summary at info level.
    pub verbose: bool,
}

impl ProbeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            program: cfg.fping.path.clone(),
            args: cfg.fping.args.clone(),
            working_dir: cfg.monitor.working_dir.clone(),
            restart_threshold: cfg.fping.restart_threshold,
            consecutive_threshold: cfg.fping.consecutive_threshold,
            restart_grace: Duration::from_millis(cfg.fping.restart_grace_ms),
            verbose: cfg.logging.verbose,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Decision for a single loss reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossVerdict {
    Normal,
    HighLoss { consecutive: u32 },
    Restart,
}

/// Consecutive-high-loss counter shared by all targets.
#[derive(Debug)]
pub struct LossPolicy {
    threshold: u32,
    consecutive: u32,
    count: AtomicU32,
}

impl LossPolicy {
    pub fn new(threshold: u32, consecutive: u32) -> Self {
        Self {
            threshold,
            consecutive: consecutive.max(1),
            count: AtomicU32::new(0),
        }
    }

    /// Folds one reading into the run; any reading below the threshold
    /// resets it.
    pub fn observe(&self, loss_pct: u32) -> LossVerdict {
        if loss_pct < self.threshold {
            self.count.store(0, Ordering::SeqCst);
            return LossVerdict::Normal;
        }

        let run = self.count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if run >= self.consecutive {
            LossVerdict::Restart
        } else {
            LossVerdict::HighLoss { consecutive: run }
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

/// What happened to a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Ignored,
    Recorded,
    UnknownTarget,
    RestartRequested,
}

/// Observable supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Running,
    Restarting,
}

struct Generation {
    id: u64,
    token: CancellationToken,
    /// Set by the watcher when fping exits on its own.
    exited: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Generation {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.exited.load(Ordering::SeqCst)
    }
}

struct Inner {
    settings: ProbeSettings,
    targets: Arc<TargetRegistry>,
    emitter: MetricEmitter,
    policy: LossPolicy,
    stats: Arc<AgentStats>,
    current: Mutex<Option<Generation>>,
    /// Cancelled generations whose tasks may still be tearing down.
    retiring: Mutex<Vec<Generation>>,
    generations: AtomicU64,
    stopped: AtomicBool,
    restarting: AtomicBool,
}

/// Cloneable handle to the fping supervisor.
#[derive(Clone)]
pub struct ProbeSupervisor {
    inner: Arc<Inner>,
}

impl ProbeSupervisor {
    pub fn new(
        settings: ProbeSettings,
        targets: Arc<TargetRegistry>,
        emitter: MetricEmitter,
        stats: Arc<AgentStats>,
    ) -> Self {
        let policy = LossPolicy::new(settings.restart_threshold, settings.consecutive_threshold);
        info!(
            targets = targets.len(),
            windows = targets.windows().len(),
            restart_threshold = settings.restart_threshold,
            consecutive_threshold = settings.consecutive_threshold,
            "fping supervisor created"
        );

        Self {
            inner: Arc::new(Inner {
                settings,
                targets,
                emitter,
                policy,
                stats,
                current: Mutex::new(None),
                retiring: Mutex::new(Vec::new()),
                generations: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                restarting: AtomicBool::new(false),
            }),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<Generation>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn retiring(&self) -> MutexGuard<'_, Vec<Generation>> {
        self.inner
            .retiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.inner.targets
    }

    pub fn high_loss_count(&self) -> u32 {
        self.inner.policy.count()
    }

    /// Id of the live generation, if any.
    pub fn generation(&self) -> Option<u64> {
        self.current()
            .as_ref()
            .filter(|g| g.is_live())
            .map(|g| g.id)
    }

    pub fn state(&self) -> SupervisorState {
        if self.inner.restarting.load(Ordering::SeqCst) {
            SupervisorState::Restarting
        } else if self.generation().is_some() {
            SupervisorState::Running
        } else {
            SupervisorState::Stopped
        }
    }

    fn command(&self) -> Command {
        let settings = &self.inner.settings;
        let mut cmd = Command::new(&settings.program);
        cmd.args(&settings.args)
            .args(self.inner.targets.names())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so cancellation reaches fping's children too.
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &settings.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Launches a new fping generation and its reader tasks.
    ///
    /// Refused while a restart is in flight; the restart launches the next
    /// generation itself. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), SupervisorError> {
        if self.inner.restarting.load(Ordering::SeqCst) {
            return Err(SupervisorError::Restarting);
        }
        self.launch()
    }

    fn launch(&self) -> Result<(), SupervisorError> {
        let mut current = self.current();

        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SupervisorError::Stopped);
        }
        if let Some(live) = current.as_ref().filter(|g| g.is_live()) {
            return Err(SupervisorError::AlreadyRunning(live.id));
        }

        let settings = &self.inner.settings;
        let mut cmd = self.command();
        info!(
            program = %settings.program.display(),
            args = ?settings.args,
            targets = self.inner.targets.len(),
            "Starting fping"
        );

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: settings.program.display().to_string(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::StreamAttach("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::StreamAttach("stderr"))?;

        // A new generation starts a fresh high-loss run.
        self.inner.policy.reset();
        let id = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));
        info!(generation = id, pid = ?child.id(), "fping started");

        let tasks = vec![
            tokio::spawn(self.clone().read_samples(stdout, id, token.clone())),
            tokio::spawn(self.clone().read_summaries(stderr, id)),
            tokio::spawn(self.clone().watch(child, id, token.clone(), Arc::clone(&exited))),
        ];

        *current = Some(Generation {
            id,
            token,
            exited,
            tasks,
        });
        Ok(())
    }

    /// Stops fping for good. Idempotent; does not wait for teardown.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(generation) = self.current().as_ref() {
            info!(generation = generation.id, "Stopping fping");
            generation.token.cancel();
        }
    }

    /// Stops fping, waits for the tasks of every generation still tearing
    /// down and flushes the sink.
    pub async fn shutdown(&self) {
        self.stop();
        let mut generations: Vec<Generation> = self.current().take().into_iter().collect();
        generations.append(&mut self.retiring());

        for generation in generations {
            let drain = async {
                for task in generation.tasks {
                    let _ = task.await;
                }
            };
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
                warn!(generation = generation.id, "fping tasks did not finish in time");
            }
        }
        self.inner.emitter.flush();
    }

    /// Replaces the running generation with a fresh one.
    ///
    /// Overlapping requests collapse into the one already in flight.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        if !self.begin_restart() {
            debug!("Restart already in progress");
            return Ok(());
        }
        self.finish_restart().await
    }

    /// Claims the restart slot; false when a restart is already in flight.
    fn begin_restart(&self) -> bool {
        !self.inner.restarting.swap(true, Ordering::SeqCst)
    }

    async fn finish_restart(&self) -> Result<(), SupervisorError> {
        let result = self.restart_generation().await;
        self.inner.restarting.store(false, Ordering::SeqCst);
        result
    }

    async fn restart_generation(&self) -> Result<(), SupervisorError> {
        {
            let mut current = self.current();
            let mut retiring = self.retiring();
            retiring.retain(|g| !g.tasks.iter().all(JoinHandle::is_finished));
            if let Some(old) = current.take() {
                info!(generation = old.id, "Stopping fping for restart");
                old.token.cancel();
                // The stderr reader keeps draining; shutdown() still awaits it.
                retiring.push(old);
            }
        }

        tokio::time::sleep(self.inner.settings.restart_grace).await;

        if self.inner.stopped.load(Ordering::SeqCst) {
            info!("Supervisor stopped during restart, not relaunching fping");
            return Ok(());
        }

        match self.launch() {
            Ok(()) => {
                AgentStats::incr(&self.inner.stats.restarts);
                info!(generation = ?self.generation(), "Successfully restarted fping");
                Ok(())
            }
            Err(e) => {
                AgentStats::incr(&self.inner.stats.restart_failures);
                error!(error = %e, "Error restarting fping");
                Err(e)
            }
        }
    }

    /// Handles one stdout line: loss policy first, then statistics and the
    /// sample record.
    pub fn process_sample_line(&self, line: &str) -> LineOutcome {
        let stats = &self.inner.stats;
        let Some(sample) = parse_sample(line) else {
            AgentStats::incr(&stats.lines_ignored);
            return LineOutcome::Ignored;
        };
        AgentStats::incr(&stats.samples_parsed);

        match self.inner.policy.observe(sample.loss_pct) {
            LossVerdict::Normal => {}
            LossVerdict::HighLoss { consecutive } => {
                AgentStats::incr(&stats.high_loss_readings);
                warn!(
                    loss_pct = sample.loss_pct,
                    host = %sample.target,
                    consecutive,
                    "High packet loss detected"
                );
            }
            LossVerdict::Restart => {
                AgentStats::incr(&stats.high_loss_readings);
                warn!(
                    loss_pct = sample.loss_pct,
                    host = %sample.target,
                    consecutive_threshold = self.inner.settings.consecutive_threshold,
                    "Consecutive high packet loss threshold reached, restarting fping"
                );
                return LineOutcome::RestartRequested;
            }
        }

        let Some(target) = self.inner.targets.get(&sample.target) else {
            AgentStats::incr(&stats.unknown_targets);
            warn!(host = %sample.target, "Received ping for unknown target");
            return LineOutcome::UnknownTarget;
        };

        let extremes = target.record(sample.rtt_ms);
        let windows = target.windows_snapshot();

        if self.inner.settings.verbose {
            info!(
                host = %sample.target,
                current_ms = sample.rtt_ms,
                absolute_min_ms = extremes.min,
                absolute_max_ms = extremes.max,
                "Sample"
            );
            for w in &windows {
                info!(
                    host = %sample.target,
                    window = ?w.window,
                    min_ms = w.min,
                    avg_ms = w.avg,
                    max_ms = w.max,
                    "Window"
                );
            }
        } else {
            debug!(host = %sample.target, current_ms = sample.rtt_ms, loss_pct = sample.loss_pct, "Sample");
        }

        let point = self.inner.emitter.sample_point(&sample, extremes, &windows);
        self.inner.emitter.emit(point);
        LineOutcome::Recorded
    }

    /// Handles one stderr line and flushes the sink after each summary.
    pub fn process_summary_line(&self, line: &str) -> LineOutcome {
        let Some(summary) = parse_summary(line) else {
            AgentStats::incr(&self.inner.stats.lines_ignored);
            return LineOutcome::Ignored;
        };
        AgentStats::incr(&self.inner.stats.summaries_parsed);

        if self.inner.settings.verbose {
            info!(
                host = %summary.target,
                min_ms = summary.min_ms,
                avg_ms = summary.avg_ms,
                max_ms = summary.max_ms,
                loss_pct = summary.loss_pct,
                "Summary"
            );
        } else {
            debug!(host = %summary.target, loss_pct = summary.loss_pct, "Summary");
        }

        let point = self.inner.emitter.summary_point(&summary, SystemTime::now());
        self.inner.emitter.emit(point);
        self.inner.emitter.flush();
        LineOutcome::Recorded
    }

    async fn read_samples(self, stdout: ChildStdout, id: u64, token: CancellationToken) {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::with_capacity(256);

        loop {
            match next_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => {
                    if token.is_cancelled() {
                        debug!(generation = id, "Generation cancelled, abandoning stdout");
                        return;
                    }
                    if self.process_sample_line(&line) == LineOutcome::RestartRequested {
                        if self.begin_restart() {
                            let supervisor = self.clone();
                            tokio::spawn(async move {
                                // Failures are logged and counted inside restart_generation().
                                let _ = supervisor.finish_restart().await;
                            });
                            return;
                        }
                        // Collapsed into a restart that will not cancel this generation.
                        debug!(generation = id, "Restart already in progress, still reading");
                    }
                }
                Ok(None) => {
                    debug!(generation = id, "fping stdout closed");
                    return;
                }
                Err(e) => {
                    warn!(generation = id, error = %e, "Error reading from fping stdout");
                    return;
                }
            }
        }
    }

    async fn read_summaries(self, stderr: ChildStderr, id: u64) {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::with_capacity(256);

        loop {
            match next_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => {
                    self.process_summary_line(&line);
                }
                Ok(None) => {
                    debug!(generation = id, "fping stderr closed");
                    return;
                }
                Err(e) => {
                    warn!(generation = id, error = %e, "Error reading from fping stderr");
                    return;
                }
            }
        }
    }

    async fn watch(
        self,
        mut child: Child,
        id: u64,
        token: CancellationToken,
        exited: Arc<AtomicBool>,
    ) {
        let pid = child.id();

        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            _ = token.cancelled() => None,
        };

        let Some(status) = outcome else {
            terminate(&mut child, pid).await;
            debug!(generation = id, "fping terminated");
            return;
        };

        if token.is_cancelled() {
            debug!(generation = id, "fping exited after cancellation");
            return;
        }
        AgentStats::incr(&self.inner.stats.unexpected_exits);
        match status {
            Ok(status) => warn!(generation = id, %status, "fping exited"),
            Err(e) => error!(generation = id, error = %e, "Failed waiting for fping"),
        }
        // Not restarted automatically. The readers keep draining what fping
        // wrote before exiting; an explicit start() is accepted from here on.
        exited.store(true, Ordering::SeqCst);
    }
}

/// SIGTERM to the process group, then SIGKILL if it lingers.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    signal_group(pid, nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    let _ = (pid, child.start_kill());

    if tokio::time::timeout(TERMINATE_TIMEOUT, child.wait())
        .await
        .is_ok()
    {
        return;
    }

    warn!(pid = ?pid, "fping ignored SIGTERM, killing");
    #[cfg(unix)]
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill after timeout failed");
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid = raw, ?signal, error = %e, "Failed to signal fping process group"),
    }
}

/// Reads one line, lossily decoded and without the line terminator.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}
