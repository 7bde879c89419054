//! Managed external processes: launch, liveness, health, and the
//! graceful stop contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::output::spawn_output_logger;
use super::{SupervisorError, SupervisorResult};
use crate::config::HealthConfig;

/// Identifier for one launched process, unique within a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// Role a supervised process plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Fetches the live source and writes raw bytes to the channel.
    Capture,
    /// Reads the channel and produces a segmented playlist.
    Transcode,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Capture => write!(f, "capture"),
            ProcessRole::Transcode => write!(f, "transcode"),
        }
    }
}

/// Everything needed to launch one supervised process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    pub program: String,
    pub args: Vec<String>,
    /// File the process must keep fresh while healthy (segment playlist).
    /// None for processes whose only output is the channel itself.
    pub artifact: Option<PathBuf>,
    /// Overall runtime bound; the process is stopped once it elapses,
    /// regardless of state.
    pub timeout: Option<Duration>,
}

/// Result of one health evaluation.
#[derive(Debug, Clone)]
pub struct ProcessHealth {
    pub healthy: bool,
    pub reason: String,
}

impl ProcessHealth {
    fn healthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: true,
            reason: reason.into(),
        }
    }

    fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: reason.into(),
        }
    }
}

/// Delivered to the owning session when a supervised process exits.
///
/// Carries the session generation the process belonged to, so a notice
/// from a killed predecessor can be recognized and discarded.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub id: ProcessId,
    pub role: ProcessRole,
    pub generation: u64,
    pub code: Option<i32>,
}

struct Managed {
    role: ProcessRole,
    pid: i32,
    artifact: Option<PathBuf>,
    started_at: Instant,
    last_activity: Arc<Mutex<Instant>>,
    exited: AtomicBool,
    exit_code: Mutex<Option<i32>>,
}

/// Launches and tracks the external processes of one capture session.
///
/// The supervisor records exits and reports health; the decision to
/// restart lives entirely with the session's health policy, which keeps
/// restart behavior testable independent of process plumbing.
pub struct ProcessSupervisor {
    processes: Mutex<HashMap<ProcessId, Arc<Managed>>>,
    next_id: AtomicU64,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    grace_period: Duration,
    startup_grace: Duration,
    stale_output_threshold: Duration,
}

impl ProcessSupervisor {
    /// Creates a supervisor and the receiver its exit notices arrive on.
    pub fn new(health: &HealthConfig) -> (Self, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                processes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                exit_tx,
                grace_period: health.process_grace_period(),
                startup_grace: health.startup_grace(),
                stale_output_threshold: health.stale_output_threshold(),
            },
            exit_rx,
        )
    }

    /// Spawns a process and begins consuming its diagnostic output.
    ///
    /// # Errors
    /// - `SupervisorError::SpawnFailed` - The executable could not be started
    pub fn launch(&self, spec: ProcessSpec, generation: u64) -> SupervisorResult<ProcessId> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SupervisorError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        if let Some(stdout) = child.stdout.take() {
            spawn_output_logger(stdout, spec.role, "stdout", Arc::clone(&last_activity));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_logger(stderr, spec.role, "stderr", Arc::clone(&last_activity));
        }

        let managed = Arc::new(Managed {
            role: spec.role,
            pid,
            artifact: spec.artifact.clone(),
            started_at: Instant::now(),
            last_activity,
            exited: AtomicBool::new(false),
            exit_code: Mutex::new(None),
        });
        self.processes.lock().insert(id, Arc::clone(&managed));

        info!(
            "Launched {} process {id} (pid {pid}): {} {}",
            spec.role,
            spec.program,
            spec.args.join(" ")
        );

        let exit_tx = self.exit_tx.clone();
        let grace_period = self.grace_period;
        let role = spec.role;
        let timeout = spec.timeout;
        tokio::spawn(async move {
            let status = match timeout {
                Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!("{role} {id} hit its {}s runtime bound, stopping", limit.as_secs());
                        signal_pid(managed.pid, libc::SIGTERM);
                        match tokio::time::timeout(grace_period, child.wait()).await {
                            Ok(status) => status,
                            Err(_) => {
                                signal_pid(managed.pid, libc::SIGKILL);
                                child.wait().await
                            }
                        }
                    }
                },
                None => child.wait().await,
            };

            let code = status.ok().and_then(|s| s.code());
            *managed.exit_code.lock() = code;
            managed.exited.store(true, Ordering::Release);
            info!(
                "{role} {id} exited with code {} after {:?}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                managed.started_at.elapsed()
            );
            let _ = exit_tx.send(ExitNotice {
                id,
                role,
                generation,
                code,
            });
        });

        Ok(id)
    }

    /// True while the process has not reported exit.
    pub fn is_alive(&self, id: ProcessId) -> bool {
        self.processes
            .lock()
            .get(&id)
            .is_some_and(|m| !m.exited.load(Ordering::Acquire))
    }

    /// Evaluates liveness plus output activity.
    ///
    /// A process that is technically running but whose registered artifact
    /// has gone stale is unhealthy; that gap between "alive" and "actually
    /// producing output" is the most common real failure mode.
    pub fn check_health(&self, id: ProcessId) -> ProcessHealth {
        let Some(managed) = self.processes.lock().get(&id).cloned() else {
            return ProcessHealth::unhealthy("unknown process");
        };

        if managed.exited.load(Ordering::Acquire) {
            let code = *managed.exit_code.lock();
            return ProcessHealth::unhealthy(format!(
                "{} exited with code {code:?}",
                managed.role
            ));
        }

        if managed.started_at.elapsed() < self.startup_grace {
            return ProcessHealth::healthy("starting");
        }

        if let Some(artifact) = &managed.artifact {
            let metadata = match std::fs::metadata(artifact) {
                Ok(metadata) => metadata,
                Err(_) => {
                    return ProcessHealth::unhealthy(format!(
                        "output artifact missing: {}",
                        artifact.display()
                    ));
                }
            };
            if let Ok(modified) = metadata.modified() {
                let age = modified.elapsed().unwrap_or_default();
                if age > self.stale_output_threshold {
                    return ProcessHealth::unhealthy(format!(
                        "output artifact stale for {}s",
                        age.as_secs()
                    ));
                }
            }
        }

        ProcessHealth::healthy("ok")
    }

    /// Time since the process last wrote a diagnostic line.
    pub fn idle_time(&self, id: ProcessId) -> Option<Duration> {
        self.processes
            .lock()
            .get(&id)
            .map(|m| m.last_activity.lock().elapsed())
    }

    /// Recorded exit code, once the process has terminated.
    pub fn exit_code(&self, id: ProcessId) -> Option<i32> {
        self.processes.lock().get(&id).and_then(|m| *m.exit_code.lock())
    }

    /// Graceful stop: terminate signal, then a kill after the grace
    /// window. Idempotent: unknown or already-exited processes are no-ops.
    pub async fn stop(&self, id: ProcessId) {
        let Some(managed) = self.processes.lock().get(&id).cloned() else {
            return;
        };
        if managed.exited.load(Ordering::Acquire) {
            debug!("{} {id} already exited, stop is a no-op", managed.role);
            return;
        }

        info!("Stopping {} {id} (pid {})", managed.role, managed.pid);
        signal_pid(managed.pid, libc::SIGTERM);

        let deadline = Instant::now() + self.grace_period;
        while !managed.exited.load(Ordering::Acquire) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !managed.exited.load(Ordering::Acquire) {
            warn!(
                "{} {id} ignored terminate signal after {}s, killing",
                managed.role,
                self.grace_period.as_secs()
            );
            signal_pid(managed.pid, libc::SIGKILL);
        }
    }

    /// Stops every tracked process, in launch order.
    pub async fn stop_all(&self) {
        let mut ids: Vec<ProcessId> = self.processes.lock().keys().copied().collect();
        ids.sort_by_key(|id| id.0);
        for id in ids {
            self.stop(id).await;
        }
    }

    /// Drops bookkeeping for a process after the session is done with it.
    pub fn forget(&self, id: ProcessId) {
        self.processes.lock().remove(&id);
    }
}

fn signal_pid(pid: i32, sig: libc::c_int) {
    if pid <= 0 {
        return;
    }
    // SAFETY: plain kill(2). ESRCH for an already-reaped pid is harmless;
    // pids are never reused within a session's lifetime in practice
    // because the waiter marks exit before bookkeeping is dropped.
    unsafe {
        libc::kill(pid, sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;

    fn fast_health() -> HealthConfig {
        HealthConfig {
            process_grace_period_secs: 2,
            startup_grace_secs: 0,
            stale_output_threshold_secs: 30,
            ..HealthConfig::default()
        }
    }

    fn sleep_spec(seconds: &str) -> ProcessSpec {
        ProcessSpec {
            role: ProcessRole::Capture,
            program: "sleep".to_string(),
            args: vec![seconds.to_string()],
            artifact: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn spawn_failure_propagates_synchronously() {
        let (supervisor, _exit_rx) = ProcessSupervisor::new(&fast_health());
        let spec = ProcessSpec {
            role: ProcessRole::Capture,
            program: "/nonexistent/not-a-real-binary".to_string(),
            args: vec![],
            artifact: None,
            timeout: None,
        };

        let result = supervisor.launch(spec, 1);
        assert!(matches!(result, Err(SupervisorError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn stop_terminates_and_notifies_with_generation() {
        let (supervisor, mut exit_rx) = ProcessSupervisor::new(&fast_health());
        let id = supervisor.launch(sleep_spec("30"), 7).unwrap();

        assert!(supervisor.is_alive(id));
        supervisor.stop(id).await;
        // Idempotent: a second stop on a dead process is a no-op.
        supervisor.stop(id).await;

        let notice = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .expect("no exit notice")
            .expect("notice channel closed");
        assert_eq!(notice.id, id);
        assert_eq!(notice.generation, 7);
        // Terminated by signal, so there is no exit code.
        assert_eq!(notice.code, None);
        assert!(!supervisor.is_alive(id));
    }

    #[tokio::test]
    async fn natural_exit_is_recorded_and_reported() {
        let (supervisor, mut exit_rx) = ProcessSupervisor::new(&fast_health());
        let spec = ProcessSpec {
            role: ProcessRole::Transcode,
            program: "true".to_string(),
            args: vec![],
            artifact: None,
            timeout: None,
        };
        let id = supervisor.launch(spec, 1).unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .expect("no exit notice")
            .expect("notice channel closed");
        assert_eq!(notice.code, Some(0));
        assert_eq!(supervisor.exit_code(id), Some(0));

        let health = supervisor.check_health(id);
        assert!(!health.healthy);
        assert!(health.reason.contains("exited"));
    }

    #[tokio::test]
    async fn runtime_bound_stops_the_process() {
        let (supervisor, mut exit_rx) = ProcessSupervisor::new(&fast_health());
        let mut spec = sleep_spec("30");
        spec.timeout = Some(Duration::from_millis(200));
        supervisor.launch(spec, 1).unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(10), exit_rx.recv())
            .await
            .expect("runtime bound never fired")
            .expect("notice channel closed");
        assert_eq!(notice.code, None);
    }

    #[tokio::test]
    async fn artifact_staleness_flips_health() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("stream.m3u8");
        std::fs::write(&artifact, "#EXTM3U\nsegment_000.ts\n").unwrap();

        let (supervisor, _exit_rx) = ProcessSupervisor::new(&fast_health());
        let mut spec = sleep_spec("30");
        spec.artifact = Some(artifact.clone());
        let id = supervisor.launch(spec, 1).unwrap();

        assert!(supervisor.check_health(id).healthy);

        // Backdate the artifact past the staleness threshold.
        let stale = std::time::SystemTime::now() - Duration::from_secs(120);
        std::fs::File::options()
            .write(true)
            .open(&artifact)
            .unwrap()
            .set_modified(stale)
            .unwrap();
        let health = supervisor.check_health(id);
        assert!(!health.healthy);
        assert!(health.reason.contains("stale"));

        std::fs::remove_file(&artifact).unwrap();
        let health = supervisor.check_health(id);
        assert!(!health.healthy);
        assert!(health.reason.contains("missing"));

        supervisor.stop(id).await;
    }

    #[tokio::test]
    async fn unknown_process_is_unhealthy_and_stop_is_a_noop() {
        let (supervisor, _exit_rx) = ProcessSupervisor::new(&fast_health());
        let id = {
            let id = supervisor.launch(sleep_spec("1"), 1).unwrap();
            supervisor.forget(id);
            id
        };

        assert!(!supervisor.is_alive(id));
        assert!(!supervisor.check_health(id).healthy);
        supervisor.stop(id).await;
    }
}
