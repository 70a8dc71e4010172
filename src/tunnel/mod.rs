//! Cloudflare tunnels for public sharing
//!
//! A named tunnel is a long-lived `cloudflared` daemon that outlives the CLI
//! invocation which started it. Its pid is cached in the state document but
//! the cache is only a hint: the process table is the source of truth, and a
//! daemon started by an earlier install is adopted by matching its command
//! line. Quick tunnels are throwaway and live only as long as their handle.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::process::{reap_in_background, spawn_detached, wait_for_exit, ProcessProbe, StopPolicy};
use crate::state::{NamedTunnel, State, StateError};

mod cloudflare;
mod ingress;
mod quick;

pub use cloudflare::{
    fallback_credentials_path, parse_credentials_path, parse_tunnel_uuid, CloudflaredCli,
    CreatedTunnel,
};
pub use ingress::generate_config;
pub use quick::{parse_quick_url, QuickTunnel, DEFAULT_QUICK_TIMEOUT};

/// Error types for tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("cloudflared not found: {0}")]
    ToolNotInstalled(String),

    #[error("cloudflared {operation} failed: {output}")]
    OperationFailed { operation: String, output: String },

    #[error("Failed to spawn tunnel process: {0}")]
    SpawnFailed(#[from] io::Error),

    #[error("Unexpected cloudflared output: {0}")]
    MalformedOutput(String),

    #[error("Tunnel process exited unexpectedly")]
    ProcessExited,

    #[error("Timeout waiting for tunnel URL")]
    Timeout,

    #[error("Failed to signal tunnel process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Tunnel process {pid} did not exit within {}s of SIGTERM", timeout.as_secs())]
    StopTimeout { pid: u32, timeout: Duration },

    #[error("No named tunnel configured; run `tailshare tunnel create <name> <hostname>` first")]
    NotConfigured,

    #[error("Failed to write {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStart {
    Started(u32),
    AlreadyRunning(u32),
}

impl TunnelStart {
    pub fn pid(self) -> u32 {
        match self {
            TunnelStart::Started(pid) | TunnelStart::AlreadyRunning(pid) => pid,
        }
    }
}

/// Whether `command` is `cloudflared ... tunnel ... run <name>`
pub fn matches_tunnel_command(command: &str, name: &str) -> bool {
    let mut tokens = command.split_whitespace();
    let Some(program) = tokens.next() else {
        return false;
    };

    let is_cloudflared = Path::new(program)
        .file_name()
        .is_some_and(|file| file == "cloudflared");
    if !is_cloudflared {
        return false;
    }

    let rest: Vec<&str> = tokens.collect();
    let Some(tunnel_at) = rest.iter().position(|token| *token == "tunnel") else {
        return false;
    };

    rest[tunnel_at + 1..]
        .windows(2)
        .any(|pair| pair[0] == "run" && pair[1] == name)
}

/// Lifecycle of the named-tunnel daemon
///
/// Methods take the state document by `&mut` and update the cached pid and
/// descriptor in place; persisting it is the caller's job.
pub struct TunnelSupervisor {
    cli: CloudflaredCli,
    probe: Arc<dyn ProcessProbe>,
    config_path: PathBuf,
    log_path: PathBuf,
    policy: StopPolicy,
}

impl TunnelSupervisor {
    pub fn new(config: &RuntimeConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            cli: CloudflaredCli::with_binary(&config.cloudflared_bin),
            probe,
            config_path: config.tunnel_config_path(),
            log_path: config.tunnel_log_path(),
            policy: StopPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: StopPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cli(&self) -> &CloudflaredCli {
        &self.cli
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Regenerate the ingress config for the current listener port.
    ///
    /// Returns `false` without writing anything when no named tunnel is
    /// configured.
    pub fn write_config(&self, state: &State) -> TunnelResult<bool> {
        let Some(tunnel) = &state.named_tunnel else {
            return Ok(false);
        };

        let config_err = |source| TunnelError::Config {
            path: self.config_path.clone(),
            source,
        };
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).map_err(config_err)?;
        }
        fs::write(&self.config_path, generate_config(tunnel, state.port)).map_err(config_err)?;

        debug!(path = %self.config_path.display(), port = state.port, "Wrote tunnel config");
        Ok(true)
    }

    /// Find the running daemon for the configured tunnel.
    ///
    /// Trusts the cached pid only while that process is alive; otherwise
    /// scans the process table and adopts a matching daemon. Clears the
    /// cache when nothing is found.
    pub fn resolve_pid(&self, state: &mut State) -> Option<u32> {
        if let Some(pid) = state.named_tunnel_pid {
            if self.probe.is_alive(pid) {
                return Some(pid);
            }
            debug!(pid, "Cached tunnel pid is gone");
        }

        let adopted = state.named_tunnel.as_ref().and_then(|tunnel| {
            match self.probe.processes() {
                Ok(processes) => processes
                    .into_iter()
                    .find(|entry| matches_tunnel_command(&entry.command, &tunnel.name))
                    .map(|entry| entry.pid),
                Err(e) => {
                    warn!(error = %e, "Could not scan process table");
                    None
                }
            }
        });

        if let Some(pid) = adopted {
            info!(pid, "Adopted running tunnel daemon");
        }
        state.named_tunnel_pid = adopted;
        adopted
    }

    /// Start the daemon unless one is already running
    pub fn start(&self, state: &mut State) -> TunnelResult<TunnelStart> {
        let name = match &state.named_tunnel {
            Some(tunnel) => tunnel.name.clone(),
            None => return Err(TunnelError::NotConfigured),
        };

        if let Some(pid) = self.resolve_pid(state) {
            return Ok(TunnelStart::AlreadyRunning(pid));
        }

        let mut command = self.cli.run_command(&self.config_path, &name);
        let child = spawn_detached(&mut command, Some(&self.log_path))
            .map_err(|e| self.cli.spawn_error(e))?;
        let pid = child.id();
        reap_in_background(child);

        info!(pid, tunnel = %name, "Tunnel daemon started");
        state.named_tunnel_pid = Some(pid);
        Ok(TunnelStart::Started(pid))
    }

    /// Same as [`TunnelSupervisor::start`], returning the daemon's pid
    pub fn ensure_running(&self, state: &mut State) -> TunnelResult<u32> {
        self.start(state).map(TunnelStart::pid)
    }

    /// SIGTERM `pid` and wait for it to exit
    pub fn stop(&self, state: &mut State, pid: u32) -> TunnelResult<()> {
        match self.probe.terminate(pid) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(pid, "Tunnel daemon already gone");
                state.named_tunnel_pid = None;
                return Ok(());
            }
            Err(source) => return Err(TunnelError::Signal { pid, source }),
        }

        if !wait_for_exit(self.probe.as_ref(), pid, self.policy) {
            return Err(TunnelError::StopTimeout {
                pid,
                timeout: self.policy.timeout,
            });
        }

        info!(pid, "Tunnel daemon stopped");
        state.named_tunnel_pid = None;
        Ok(())
    }

    /// Stop whatever daemon [`TunnelSupervisor::resolve_pid`] finds
    pub fn shutdown(&self, state: &mut State) -> TunnelResult<Option<u32>> {
        match self.resolve_pid(state) {
            Some(pid) => {
                self.stop(state, pid)?;
                Ok(Some(pid))
            }
            None => Ok(None),
        }
    }

    /// Create a named tunnel, record it in `state` and route `hostname` to it.
    ///
    /// The tunnel is recorded as soon as cloudflared has created it, so a
    /// failed DNS route leaves a descriptor that `tunnel route` or
    /// `tunnel delete` can act on.
    pub fn create(&self, state: &mut State, name: &str, hostname: &str) -> TunnelResult<NamedTunnel> {
        let created = self.cli.create(name)?;

        let tunnel = NamedTunnel {
            name: name.to_string(),
            uuid: created.uuid,
            hostname: hostname.to_string(),
            credentials_path: created.credentials_path,
        };
        info!(tunnel = %tunnel.name, uuid = %tunnel.uuid, "Named tunnel created");

        state.named_tunnel = Some(tunnel.clone());
        state.named_tunnel_pid = None;

        self.cli.route_dns(name, hostname)?;
        Ok(tunnel)
    }

    /// Stop and delete the configured tunnel
    pub fn delete(&self, state: &mut State) -> TunnelResult<()> {
        let name = match &state.named_tunnel {
            Some(tunnel) => tunnel.name.clone(),
            None => return Err(TunnelError::NotConfigured),
        };

        self.shutdown(state)?;
        self.cli.delete(&name)?;

        state.named_tunnel = None;
        state.named_tunnel_pid = None;
        if let Err(e) = fs::remove_file(&self.config_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, "Could not remove tunnel config");
            }
        }
        Ok(())
    }

    /// Add a DNS route for the configured tunnel
    pub fn route_dns(&self, state: &State, hostname: &str) -> TunnelResult<()> {
        let tunnel = state.named_tunnel.as_ref().ok_or(TunnelError::NotConfigured)?;
        self.cli.route_dns(&tunnel.name, hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mock::{MockProbe, TermBehavior};
    use tempfile::TempDir;

    fn named_state() -> State {
        let mut state = State::with_port(7780);
        state.named_tunnel = Some(NamedTunnel {
            name: "docs".to_string(),
            uuid: "6ff42ae2-765d-4adf-8112-31c55c1551ef".to_string(),
            hostname: "docs.example.com".to_string(),
            credentials_path: PathBuf::from("/home/me/.cloudflared/6ff42ae2.json"),
        });
        state
    }

    fn supervisor(temp_dir: &TempDir, probe: &MockProbe) -> TunnelSupervisor {
        let config = RuntimeConfig::with_data_dir(temp_dir.path());
        TunnelSupervisor::new(&config, Arc::new(probe.clone())).with_policy(StopPolicy {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(100),
        })
    }

    #[test]
    fn test_matches_tunnel_command() {
        assert!(matches_tunnel_command(
            "/usr/local/bin/cloudflared tunnel --config /data/cloudflared.yml run docs",
            "docs"
        ));
        assert!(matches_tunnel_command("cloudflared tunnel run docs", "docs"));
        assert!(!matches_tunnel_command("cloudflared tunnel run docs-old", "docs"));
        assert!(!matches_tunnel_command("cloudflared tunnel --url http://127.0.0.1:7780", "docs"));
        assert!(!matches_tunnel_command("vim cloudflared tunnel run docs", "docs"));
        assert!(!matches_tunnel_command("", "docs"));
    }

    #[test]
    fn test_write_config_without_tunnel() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = supervisor(&temp_dir, &MockProbe::new());

        assert!(!supervisor.write_config(&State::default()).unwrap());
        assert!(!supervisor.config_path().exists());
    }

    #[test]
    fn test_write_config_uses_bound_port() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = supervisor(&temp_dir, &MockProbe::new());
        let mut state = named_state();
        state.port = 7783;

        assert!(supervisor.write_config(&state).unwrap());
        let written = fs::read_to_string(supervisor.config_path()).unwrap();
        assert!(written.contains("service: http://127.0.0.1:7783"));
        assert!(written.starts_with("tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef\n"));
    }

    #[test]
    fn test_resolve_pid_trusts_live_cache() {
        let temp_dir = TempDir::new().unwrap();
        let probe = MockProbe::new().with_process(500, "cloudflared tunnel run docs");
        let mut state = named_state();
        state.named_tunnel_pid = Some(500);

        assert_eq!(supervisor(&temp_dir, &probe).resolve_pid(&mut state), Some(500));
    }

    #[test]
    fn test_resolve_pid_adopts_running_daemon() {
        let temp_dir = TempDir::new().unwrap();
        let probe = MockProbe::new()
            .with_process(300, "cloudflared tunnel run other")
            .with_process(812, "/opt/cloudflared tunnel --config /x.yml run docs");
        let mut state = named_state();
        state.named_tunnel_pid = Some(99);

        assert_eq!(supervisor(&temp_dir, &probe).resolve_pid(&mut state), Some(812));
        assert_eq!(state.named_tunnel_pid, Some(812));
    }

    #[test]
    fn test_resolve_pid_clears_stale_cache() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = named_state();
        state.named_tunnel_pid = Some(99);

        assert_eq!(supervisor(&temp_dir, &MockProbe::new()).resolve_pid(&mut state), None);
        assert_eq!(state.named_tunnel_pid, None);
    }

    #[test]
    fn test_start_requires_named_tunnel() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = State::default();
        assert!(matches!(
            supervisor(&temp_dir, &MockProbe::new()).start(&mut state),
            Err(TunnelError::NotConfigured)
        ));
    }

    #[test]
    fn test_start_when_already_running() {
        let temp_dir = TempDir::new().unwrap();
        let probe = MockProbe::new().with_process(812, "cloudflared tunnel run docs");
        let mut state = named_state();

        assert_eq!(
            supervisor(&temp_dir, &probe).start(&mut state).unwrap(),
            TunnelStart::AlreadyRunning(812)
        );
    }

    #[test]
    fn test_start_missing_binary() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = RuntimeConfig::with_data_dir(temp_dir.path());
        config.cloudflared_bin = PathBuf::from("definitely_not_a_real_binary_12345");
        let supervisor = TunnelSupervisor::new(&config, Arc::new(MockProbe::new()));
        let mut state = named_state();

        assert!(matches!(
            supervisor.start(&mut state),
            Err(TunnelError::ToolNotInstalled(_))
        ));
        assert_eq!(state.named_tunnel_pid, None);
    }

    #[test]
    fn test_stop_clears_cached_pid() {
        let temp_dir = TempDir::new().unwrap();
        let probe = MockProbe::new().with_process(812, "cloudflared tunnel run docs");
        let mut state = named_state();
        state.named_tunnel_pid = Some(812);

        supervisor(&temp_dir, &probe).stop(&mut state, 812).unwrap();
        assert_eq!(state.named_tunnel_pid, None);
        assert_eq!(probe.terminated(), vec![812]);
    }

    #[test]
    fn test_stop_timeout_keeps_cached_pid() {
        let temp_dir = TempDir::new().unwrap();
        let probe = MockProbe::new()
            .with_process(812, "cloudflared tunnel run docs")
            .with_term_behavior(812, TermBehavior::Ignore);
        let mut state = named_state();
        state.named_tunnel_pid = Some(812);

        let err = supervisor(&temp_dir, &probe).stop(&mut state, 812).unwrap_err();
        assert!(matches!(err, TunnelError::StopTimeout { pid: 812, .. }));
        assert_eq!(state.named_tunnel_pid, Some(812));
    }

    #[test]
    fn test_stop_signal_failure_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let probe = MockProbe::new()
            .with_process(812, "cloudflared tunnel run docs")
            .with_term_behavior(812, TermBehavior::Refuse);
        let mut state = named_state();
        state.named_tunnel_pid = Some(812);

        let err = supervisor(&temp_dir, &probe).stop(&mut state, 812).unwrap_err();

        assert!(matches!(err, TunnelError::Signal { pid: 812, .. }));
        assert!(err.to_string().contains("signal tunnel process 812"));
        assert_eq!(state.named_tunnel_pid, Some(812));
    }

    /// Write an executable shell script standing in for cloudflared
    #[cfg(unix)]
    fn fake_cloudflared(temp_dir: &TempDir, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_dir.path().join("cloudflared");
        fs::write(&path, format!("#!/bin/sh\n{}", script)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_create_records_tunnel_when_dns_route_fails() {
        let temp_dir = TempDir::new().unwrap();
        let bin = fake_cloudflared(
            &temp_dir,
            r#"case "$2" in
  create)
    echo "Tunnel credentials written to /creds/6ff42ae2.json."
    echo "Created tunnel docs with id 6ff42ae2-765d-4adf-8112-31c55c1551ef"
    ;;
  route)
    echo "failed to add route: zone not found" >&2
    exit 1
    ;;
esac
"#,
        );
        let mut config = RuntimeConfig::with_data_dir(temp_dir.path());
        config.cloudflared_bin = bin;
        let supervisor = TunnelSupervisor::new(&config, Arc::new(MockProbe::new()));
        let mut state = State::with_port(7780);

        let err = supervisor
            .create(&mut state, "docs", "docs.example.com")
            .unwrap_err();

        assert!(matches!(err, TunnelError::OperationFailed { ref operation, .. } if operation == "route dns"));
        let tunnel = state.named_tunnel.expect("created tunnel should be recorded");
        assert_eq!(tunnel.name, "docs");
        assert_eq!(tunnel.uuid, "6ff42ae2-765d-4adf-8112-31c55c1551ef");
        assert_eq!(tunnel.credentials_path, PathBuf::from("/creds/6ff42ae2.json"));
    }

    #[cfg(unix)]
    #[test]
    fn test_create_failure_records_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let bin = fake_cloudflared(&temp_dir, "echo \"tunnel already exists\" >&2\nexit 1\n");
        let mut config = RuntimeConfig::with_data_dir(temp_dir.path());
        config.cloudflared_bin = bin;
        let supervisor = TunnelSupervisor::new(&config, Arc::new(MockProbe::new()));
        let mut state = State::with_port(7780);

        assert!(supervisor.create(&mut state, "docs", "docs.example.com").is_err());
        assert!(state.named_tunnel.is_none());
    }

    #[test]
    fn test_shutdown_without_daemon() {
        let temp_dir = TempDir::new().unwrap();
        let probe = MockProbe::new();
        let mut state = named_state();

        assert_eq!(supervisor(&temp_dir, &probe).shutdown(&mut state).unwrap(), None);
        assert!(probe.terminated().is_empty());
    }

    #[test]
    fn test_route_dns_requires_named_tunnel() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            supervisor(&temp_dir, &MockProbe::new()).route_dns(&State::default(), "x.example.com"),
            Err(TunnelError::NotConfigured)
        ));
    }
}
