//! Listener bootstrap
//!
//! Binding runs through three phases. The configured port is tried first. If
//! it is taken, a stale overlay mapping is released and the same port is
//! retried. Only then are the next few ports scanned. Any error other than
//! "address in use" ends the sequence immediately.

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::overlay::RouteReconciler;
use crate::process::pidfile::read_pid_file;
use crate::process::{PidFileGuard, PidRecord, ProcessProbe};
use crate::state::{State, StateError, StateStore};
use crate::tunnel::TunnelSupervisor;

/// Extra attempts on the configured port after releasing a stale mapping
pub const BIND_RETRY_ATTEMPTS: u32 = 1;

/// Ports tried above the configured one before giving up
pub const FALLBACK_PORT_CANDIDATES: u16 = 10;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("tailshare is already running (pid {pid}); stop it with `tailshare stop`")]
    AlreadyRunning { pid: u32 },

    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error(
        "Port {port} and the next {candidates} ports are in use. \
         Stop a running server with `tailshare stop`, or find what holds the port \
         with `lsof -nP -iTCP:{port} -sTCP:LISTEN`"
    )]
    PortsExhausted { port: u16, candidates: u16 },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Pid file I/O failed: {0}")]
    Io(#[from] io::Error),
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Something that can bind a loopback listener
pub trait PortBinder {
    type Listener;

    fn bind(&mut self, port: u16) -> io::Result<Self::Listener>;
}

/// Binds real TCP listeners on 127.0.0.1
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackBinder;

impl PortBinder for LoopbackBinder {
    type Listener = TcpListener;

    fn bind(&mut self, port: u16) -> io::Result<TcpListener> {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port))
    }
}

/// Phase in which the listener was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPhase {
    InitialBind,
    StaleCleanupRetry,
    FallbackScan,
}

#[derive(Debug)]
pub struct Bound<L> {
    pub listener: L,
    pub port: u16,
    pub phase: BindPhase,
}

enum Attempt<L> {
    Bound(L),
    InUse,
}

fn attempt<B: PortBinder>(binder: &mut B, port: u16) -> BootstrapResult<Attempt<B::Listener>> {
    match binder.bind(port) {
        Ok(listener) => Ok(Attempt::Bound(listener)),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(Attempt::InUse),
        Err(source) => Err(BootstrapError::Bind { port, source }),
    }
}

/// Bind `port`, releasing a conflicting mapping and falling back to nearby
/// ports if it is taken.
///
/// `release` is called once with `port` before the retry.
pub fn bind_with_fallback<B: PortBinder>(
    binder: &mut B,
    port: u16,
    release: impl FnOnce(u16),
) -> BootstrapResult<Bound<B::Listener>> {
    let bound = |listener, port, phase| Bound {
        listener,
        port,
        phase,
    };

    if let Attempt::Bound(listener) = attempt(binder, port)? {
        return Ok(bound(listener, port, BindPhase::InitialBind));
    }

    info!(port, "Port in use, releasing stale mapping and retrying");
    release(port);

    for _ in 0..BIND_RETRY_ATTEMPTS {
        if let Attempt::Bound(listener) = attempt(binder, port)? {
            return Ok(bound(listener, port, BindPhase::StaleCleanupRetry));
        }
    }

    for offset in 1..=FALLBACK_PORT_CANDIDATES {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match attempt(binder, candidate)? {
            Attempt::Bound(listener) => {
                warn!(requested = port, bound = candidate, "Bound fallback port");
                return Ok(bound(listener, candidate, BindPhase::FallbackScan));
            }
            Attempt::InUse => debug!(port = candidate, "Fallback port in use"),
        }
    }

    Err(BootstrapError::PortsExhausted {
        port,
        candidates: FALLBACK_PORT_CANDIDATES,
    })
}

/// A bound server ready to accept connections
pub struct Booted<L> {
    pub bound: Bound<L>,
    pub state: State,
    /// Removes the pid file when the server exits
    pub pid_guard: PidFileGuard,
    /// Set when route restoration fell back to local-only access
    pub warning: Option<String>,
}

/// Brings the server from nothing to a bound listener with routes restored
pub struct Bootstrap<'a> {
    config: &'a RuntimeConfig,
    store: &'a StateStore,
    reconciler: &'a RouteReconciler,
    tunnels: &'a TunnelSupervisor,
    probe: Arc<dyn ProcessProbe>,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        config: &'a RuntimeConfig,
        store: &'a StateStore,
        reconciler: &'a RouteReconciler,
        tunnels: &'a TunnelSupervisor,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            config,
            store,
            reconciler,
            tunnels,
            probe,
        }
    }

    pub fn run<B: PortBinder>(&self, binder: &mut B) -> BootstrapResult<Booted<B::Listener>> {
        self.ensure_not_running()?;
        let mut state = self.store.read()?;

        let bound = bind_with_fallback(binder, self.config.default_port, |port| {
            self.reconciler.release_conflicting_port(&state, port);
        })?;

        state.port = bound.port;
        state.ts_port = bound.port;
        self.store.write(&state)?;
        info!(port = bound.port, phase = ?bound.phase, "Listener bound");

        let warning = self.reconciler.ensure_for_restored_routes(&mut state);
        self.restore_tunnel(&mut state);
        self.store.write(&state)?;

        let pid_guard = PidFileGuard::new(self.config.pid_path(), std::process::id())?;

        Ok(Booted {
            bound,
            state,
            pid_guard,
            warning,
        })
    }

    /// Refuse to start while the pid file names another live server.
    ///
    /// The pid written by `start` for this very process is accepted.
    fn ensure_not_running(&self) -> BootstrapResult<()> {
        let own = std::process::id();
        match read_pid_file(&self.config.pid_path())? {
            Some(PidRecord::Valid(pid)) if pid != own && self.probe.is_alive(pid) => {
                Err(BootstrapError::AlreadyRunning { pid })
            }
            Some(PidRecord::Valid(pid)) if pid != own => {
                debug!(pid, "Ignoring pid file of a dead server");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn restore_tunnel(&self, state: &mut State) {
        if state.named_tunnel.is_none() {
            return;
        }

        if let Err(e) = self.tunnels.write_config(state) {
            warn!(error = %e, "Could not write tunnel config");
            return;
        }

        if let Err(e) = self.tunnels.ensure_running(state) {
            warn!(error = %e, "Could not start tunnel daemon");
        }
    }
}
