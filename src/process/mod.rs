//! Supervision of the background share server
//!
//! The server runs detached from the CLI that started it. Its pid file is the
//! only link between the two, so every read of it is verified against the
//! live process table before it is trusted.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::overlay::{CleanupOptions, RouteReconciler};
use crate::state::{StateError, StateStore};

pub mod mock;
pub mod pidfile;
pub mod probe;

pub use pidfile::{PidFileGuard, PidRecord};
pub use probe::{ProcessEntry, ProcessProbe, SystemProbe};

use pidfile::{pid_file_age, read_pid_file, remove_pid_file, write_pid_file};

/// How long `start` waits for the pid file to name a live process
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after spawning before checking for an immediate exit
const STARTUP_GRACE: Duration = Duration::from_millis(300);

/// Errors that can occur while supervising the server
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Server exited during startup ({status}); see {}", log.display())]
    StartFailed { status: ExitStatus, log: PathBuf },

    #[error("Server did not report a pid within {}s", timeout.as_secs())]
    StartTimeout { timeout: Duration },

    #[error("Process {pid} did not exit within {}s of SIGTERM", timeout.as_secs())]
    StopTimeout { pid: u32, timeout: Duration },
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Cooperative wait used when stopping a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Poll liveness until the process is gone or the policy's budget runs out.
///
/// Returns `true` if the process exited.
pub fn wait_for_exit(probe: &dyn ProcessProbe, pid: u32, policy: StopPolicy) -> bool {
    let deadline = Instant::now() + policy.timeout;
    loop {
        if !probe.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(policy.poll_interval);
    }
}

/// Spawn `command` in its own process group with output appended to `log`.
pub(crate) fn spawn_detached(command: &mut Command, log: Option<&Path>) -> io::Result<Child> {
    command.stdin(Stdio::null());

    match log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            command.stdout(file.try_clone()?).stderr(file);
        }
        None => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Keep the child alive when the CLI's terminal goes away
        command.process_group(0);
    }

    command.spawn()
}

/// Wait on `child` from a background thread.
///
/// A child that is never waited on stays in the process table as a zombie
/// after it exits and keeps answering liveness probes.
pub(crate) fn reap_in_background(mut child: Child) {
    thread::spawn(move || {
        let _ = child.wait();
    });
}

/// Command line that runs the server in the foreground
#[derive(Debug, Clone)]
pub struct ServerLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    log_path: Option<PathBuf>,
}

impl ServerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            log_path: None,
        }
    }

    /// Re-invoke the running executable with `args`
    pub fn current_exe(args: impl IntoIterator<Item = impl Into<OsString>>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    /// Append the server's stdout and stderr to `path`
    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    fn launch(&self) -> SupervisorResult<Child> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        spawn_detached(&mut command, self.log_path.as_deref()).map_err(|source| {
            SupervisorError::Spawn {
                program: self.program.display().to_string(),
                source,
            }
        })
    }
}

/// What `status` found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Running {
        pid: u32,
        uptime: Option<Duration>,
        port: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(u32),
    AlreadyRunning(u32),
    /// Autostart is switched off in the configuration
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(u32),
    NotRunning,
}

/// Start, stop and inspect the background server
pub struct ProcessSupervisor {
    pid_path: PathBuf,
    autostart: bool,
    store: StateStore,
    reconciler: RouteReconciler,
    probe: Arc<dyn ProcessProbe>,
    launcher: ServerLauncher,
    policy: StopPolicy,
}

impl ProcessSupervisor {
    pub fn new(
        config: &RuntimeConfig,
        store: StateStore,
        reconciler: RouteReconciler,
        probe: Arc<dyn ProcessProbe>,
        launcher: ServerLauncher,
    ) -> Self {
        Self {
            pid_path: config.pid_path(),
            autostart: config.autostart,
            store,
            reconciler,
            probe,
            launcher,
            policy: StopPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: StopPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Report whether the server is running.
    ///
    /// A pid file that is unreadable as a pid or names a dead process is
    /// removed. If the live server listens on a different port than the
    /// state records, the state is corrected.
    pub fn status(&self) -> SupervisorResult<ServerStatus> {
        let Some(pid) = self.live_pid()? else {
            return Ok(ServerStatus::Stopped);
        };

        let uptime = pid_file_age(&self.pid_path);
        let persisted = self.store.read()?.port;

        let port = match self.probe.listening_port(pid) {
            Some(actual) if actual != persisted => {
                self.correct_port(actual);
                actual
            }
            Some(actual) => actual,
            None => persisted,
        };

        Ok(ServerStatus::Running { pid, uptime, port })
    }

    /// Start the server if autostart is enabled.
    pub fn autostart(&self) -> SupervisorResult<StartOutcome> {
        if !self.autostart {
            debug!("Autostart disabled");
            return Ok(StartOutcome::Disabled);
        }
        self.start()
    }

    /// Start the server detached unless one is already running.
    ///
    /// Returns once the pid file names a live process; gives up after a
    /// bounded wait.
    pub fn start(&self) -> SupervisorResult<StartOutcome> {
        if let Some(pid) = self.live_pid()? {
            debug!(pid, "Server already running");
            return Ok(StartOutcome::AlreadyRunning(pid));
        }

        let mut child = self.launcher.launch()?;
        let pid = child.id();
        write_pid_file(&self.pid_path, pid)?;
        info!(pid, "Server process spawned");

        thread::sleep(STARTUP_GRACE);

        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            if let Some(status) = child.try_wait()? {
                remove_pid_file(&self.pid_path)?;
                return Err(SupervisorError::StartFailed {
                    status,
                    log: self
                        .launcher
                        .log_path
                        .clone()
                        .unwrap_or_else(|| PathBuf::from("the server log")),
                });
            }

            if let Some(PidRecord::Valid(recorded)) = read_pid_file(&self.pid_path)? {
                if self.probe.is_alive(recorded) {
                    reap_in_background(child);
                    return Ok(StartOutcome::Started(recorded));
                }
            }

            if Instant::now() >= deadline {
                reap_in_background(child);
                return Err(SupervisorError::StartTimeout {
                    timeout: START_TIMEOUT,
                });
            }
            thread::sleep(self.policy.poll_interval);
        }
    }

    /// Stop the server.
    ///
    /// Overlay routes are torn down first whether or not a server is running,
    /// so calling this repeatedly is safe.
    pub fn stop(&self) -> SupervisorResult<StopOutcome> {
        self.teardown_routes();

        let Some(pid) = self.live_pid()? else {
            return Ok(StopOutcome::NotRunning);
        };

        match self.probe.terminate(pid) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(pid, "Server exited before it could be signalled");
                remove_pid_file(&self.pid_path)?;
                return Ok(StopOutcome::NotRunning);
            }
            Err(source) => return Err(SupervisorError::Signal { pid, source }),
        }

        if !wait_for_exit(self.probe.as_ref(), pid, self.policy) {
            warn!(pid, "Server ignored SIGTERM");
            return Err(SupervisorError::StopTimeout {
                pid,
                timeout: self.policy.timeout,
            });
        }

        remove_pid_file(&self.pid_path)?;
        info!(pid, "Server stopped");
        Ok(StopOutcome::Stopped(pid))
    }

    /// Pid from the pid file if it names a live process; removes stale files
    fn live_pid(&self) -> SupervisorResult<Option<u32>> {
        match read_pid_file(&self.pid_path)? {
            None => Ok(None),
            Some(PidRecord::Malformed) => {
                warn!(path = %self.pid_path.display(), "Removing malformed pid file");
                remove_pid_file(&self.pid_path)?;
                Ok(None)
            }
            Some(PidRecord::Valid(pid)) if !self.probe.is_alive(pid) => {
                debug!(pid, "Removing stale pid file");
                remove_pid_file(&self.pid_path)?;
                Ok(None)
            }
            Some(PidRecord::Valid(pid)) => Ok(Some(pid)),
        }
    }

    fn correct_port(&self, actual: u16) {
        let result = self.store.update(|state| {
            let previous = state.port;
            state.port = actual;
            previous
        });
        match result {
            Ok(previous) => info!(previous, actual, "Corrected persisted port"),
            Err(e) => warn!(error = %e, "Could not correct persisted port"),
        }
    }

    fn teardown_routes(&self) {
        let state = match self.store.read() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Skipping route teardown, state unreadable");
                return;
            }
        };

        if let Err(e) = self.reconciler.disable_route(&state) {
            warn!(error = %e, "Route teardown failed");
        }

        match self
            .reconciler
            .cleanup_stale_routes(&state, CleanupOptions::default())
        {
            Ok(report) if !report.removed.is_empty() => {
                info!(removed = ?report.removed, "Removed stale routes");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Stale route cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockProbe, TermBehavior};
    use super::*;
    use crate::config::RuntimeMode;
    use crate::overlay::mock::{MockOverlay, OverlayCall};
    use crate::state::State;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        config: RuntimeConfig,
        overlay: MockOverlay,
        probe: MockProbe,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let config = RuntimeConfig::with_data_dir(temp_dir.path());
            Self {
                _temp_dir: temp_dir,
                config,
                overlay: MockOverlay::new(),
                probe: MockProbe::new(),
            }
        }

        fn store(&self) -> StateStore {
            StateStore::new(self.config.state_path())
        }

        fn supervisor(&self) -> ProcessSupervisor {
            let reconciler =
                RouteReconciler::new(Arc::new(self.overlay.clone()), RuntimeMode::Live);
            ProcessSupervisor::new(
                &self.config,
                self.store(),
                reconciler,
                Arc::new(self.probe.clone()),
                ServerLauncher::new("true", Vec::<String>::new()),
            )
            .with_policy(StopPolicy {
                poll_interval: Duration::from_millis(5),
                timeout: Duration::from_millis(100),
            })
        }

        fn write_pid(&self, contents: &str) {
            fs::create_dir_all(&self.config.data_dir).unwrap();
            fs::write(self.config.pid_path(), contents).unwrap();
        }
    }

    #[test]
    fn test_status_without_pid_file() {
        let fixture = Fixture::new();
        assert_eq!(fixture.supervisor().status().unwrap(), ServerStatus::Stopped);
    }

    #[test]
    fn test_status_dead_pid_removes_pid_file() {
        let fixture = Fixture::new();
        fixture.write_pid("4242");

        assert_eq!(fixture.supervisor().status().unwrap(), ServerStatus::Stopped);
        assert!(!fixture.config.pid_path().exists());
    }

    #[test]
    fn test_status_malformed_pid_removes_pid_file() {
        let fixture = Fixture::new();
        fixture.write_pid("not-a-pid");

        assert_eq!(fixture.supervisor().status().unwrap(), ServerStatus::Stopped);
        assert!(!fixture.config.pid_path().exists());
    }

    #[test]
    fn test_status_running_reports_persisted_port() {
        let fixture = Fixture::new();
        fixture.probe.spawn(4242, "tailshare serve");
        fixture.write_pid("4242\n");
        fixture.store().write(&State::with_port(7780)).unwrap();

        match fixture.supervisor().status().unwrap() {
            ServerStatus::Running { pid, port, uptime } => {
                assert_eq!(pid, 4242);
                assert_eq!(port, 7780);
                assert!(uptime.is_some());
            }
            other => panic!("Expected Running, got {:?}", other),
        }
    }

    #[test]
    fn test_status_corrects_drifted_port() {
        let mut fixture = Fixture::new();
        fixture.probe = MockProbe::new()
            .with_process(4242, "tailshare serve")
            .with_listening_port(4242, 7785);
        fixture.write_pid("4242");
        fixture.store().write(&State::with_port(7780)).unwrap();

        let status = fixture.supervisor().status().unwrap();

        assert!(matches!(status, ServerStatus::Running { port: 7785, .. }));
        assert_eq!(fixture.store().read().unwrap().port, 7785);
    }

    #[test]
    fn test_stop_without_server_is_idempotent() {
        let fixture = Fixture::new();
        let supervisor = fixture.supervisor();

        assert_eq!(supervisor.stop().unwrap(), StopOutcome::NotRunning);
        let first = fixture.overlay.calls();
        fixture.overlay.clear_calls();

        assert_eq!(supervisor.stop().unwrap(), StopOutcome::NotRunning);
        let second = fixture.overlay.calls();

        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                OverlayCall::DisableRoute(State::default().ts_port),
                OverlayCall::RouteStatusText
            ]
        );
    }

    #[test]
    fn test_stop_terminates_live_server() {
        let fixture = Fixture::new();
        fixture.probe.spawn(4242, "tailshare serve");
        fixture.write_pid("4242");

        assert_eq!(fixture.supervisor().stop().unwrap(), StopOutcome::Stopped(4242));
        assert_eq!(fixture.probe.terminated(), vec![4242]);
        assert!(!fixture.config.pid_path().exists());
    }

    #[test]
    fn test_stop_waits_for_slow_exit() {
        let mut fixture = Fixture::new();
        fixture.probe = MockProbe::new()
            .with_process(4242, "tailshare serve")
            .with_term_behavior(4242, TermBehavior::ExitAfterChecks(3));
        fixture.write_pid("4242");

        assert_eq!(fixture.supervisor().stop().unwrap(), StopOutcome::Stopped(4242));
        assert!(!fixture.config.pid_path().exists());
    }

    #[test]
    fn test_stop_timeout_is_distinct_and_keeps_pid_file() {
        let mut fixture = Fixture::new();
        fixture.probe = MockProbe::new()
            .with_process(4242, "tailshare serve")
            .with_term_behavior(4242, TermBehavior::Ignore);
        fixture.write_pid("4242");

        let err = fixture.supervisor().stop().unwrap_err();
        assert!(matches!(err, SupervisorError::StopTimeout { pid: 4242, .. }));
        assert!(fixture.config.pid_path().exists());
    }

    #[test]
    fn test_stop_with_dead_pid_removes_file_without_signal() {
        let fixture = Fixture::new();
        fixture.write_pid("4242");

        assert_eq!(fixture.supervisor().stop().unwrap(), StopOutcome::NotRunning);
        assert!(fixture.probe.terminated().is_empty());
        assert!(!fixture.config.pid_path().exists());
    }

    #[test]
    fn test_stop_survives_overlay_failures() {
        let mut fixture = Fixture::new();
        fixture.overlay = MockOverlay::new().unavailable();

        assert_eq!(fixture.supervisor().stop().unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn test_autostart_disabled() {
        let mut fixture = Fixture::new();
        fixture.config.autostart = false;

        assert_eq!(
            fixture.supervisor().autostart().unwrap(),
            StartOutcome::Disabled
        );
        assert!(!fixture.config.pid_path().exists());
    }

    #[test]
    fn test_start_when_already_running() {
        let fixture = Fixture::new();
        fixture.probe.spawn(4242, "tailshare serve");
        fixture.write_pid("4242");

        assert_eq!(
            fixture.supervisor().start().unwrap(),
            StartOutcome::AlreadyRunning(4242)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_start_reports_immediate_exit() {
        let fixture = Fixture::new();
        // `true` exits straight away, like a server whose bootstrap failed
        let err = fixture.supervisor().start().unwrap_err();
        assert!(matches!(err, SupervisorError::StartFailed { .. }));
        assert!(!fixture.config.pid_path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_start_and_stop_real_process() {
        let fixture = Fixture::new();
        let reconciler = RouteReconciler::new(Arc::new(fixture.overlay.clone()), RuntimeMode::Live);
        let supervisor = ProcessSupervisor::new(
            &fixture.config,
            fixture.store(),
            reconciler,
            Arc::new(SystemProbe::new()),
            ServerLauncher::new("sleep", ["30"]).with_log(fixture.config.server_log_path()),
        );

        let pid = match supervisor.start().unwrap() {
            StartOutcome::Started(pid) => pid,
            other => panic!("Expected Started, got {:?}", other),
        };
        assert_eq!(
            read_pid_file(supervisor.pid_path()).unwrap(),
            Some(PidRecord::Valid(pid))
        );
        assert_eq!(supervisor.start().unwrap(), StartOutcome::AlreadyRunning(pid));

        assert_eq!(supervisor.stop().unwrap(), StopOutcome::Stopped(pid));
        assert!(!supervisor.pid_path().exists());
    }
}
