//! Overlay-network routes for sharing on the tailnet
//!
//! All proxying is delegated to the overlay tool (`tailscale serve` and
//! `tailscale funnel`). This module wraps the tool behind the [`OverlayTool`]
//! capability trait and keeps its route table in line with the local server:
//! enabling the route for the share server and removing mappings whose
//! backends have gone away.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RuntimeMode;
use crate::state::{Protocol, ProtectedPorts, State};

pub mod mock;
mod routes;
mod tailscale;

pub use routes::{
    classify_routes, parse_hostname_from_status, parse_route_status, RouteClass, RouteEntry,
    RoutePartition, DEFAULT_EXPOSED_PORT,
};
pub use tailscale::TailscaleCli;

/// How long the backend liveness probe waits for a connection
const BACKEND_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Error types for overlay tool operations
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Overlay tool not found: {0}")]
    ToolUnavailable(String),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Failed to run overlay tool: {0}")]
    Io(#[from] io::Error),
}

/// Result type for overlay operations
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Operations the overlay tool offers
///
/// The production implementation is [`TailscaleCli`]; tests substitute
/// [`mock::MockOverlay`].
pub trait OverlayTool: Send + Sync {
    /// Machine-readable node status (contains `Self.DNSName`)
    fn status_json(&self) -> OverlayResult<String>;

    /// Human-readable route table
    fn route_status_text(&self) -> OverlayResult<String>;

    /// Whether something is listening on the loopback backend port
    fn is_backend_port_live(&self, port: u16) -> bool {
        loopback_port_live(port)
    }

    /// Expose `backend_port` on the tailnet at `exposed_port`
    fn enable_route(&self, exposed_port: u16, backend_port: u16) -> OverlayResult<()>;

    fn disable_route(&self, exposed_port: u16) -> OverlayResult<()>;

    /// Expose `backend_port` on the public internet at `exposed_port`
    fn enable_funnel(&self, exposed_port: u16, backend_port: u16) -> OverlayResult<()>;

    fn disable_funnel(&self, exposed_port: u16) -> OverlayResult<()>;
}

/// Check whether a TCP connection to 127.0.0.1:`port` succeeds
pub fn loopback_port_live(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, BACKEND_PROBE_TIMEOUT).is_ok()
}

/// Options for [`RouteReconciler::cleanup_stale_routes`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    /// Compute the partition without removing anything
    pub dry_run: bool,
}

/// Outcome of a stale-route cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Stale exposed ports that were (or in dry-run would have been) removed
    pub removed: Vec<u16>,
    pub protected: Vec<u16>,
    pub skipped: Vec<u16>,
    /// Stale exposed ports whose removal the overlay tool rejected
    pub failed: Vec<u16>,
}

/// Keeps the overlay tool's route table in line with the share server
#[derive(Clone)]
pub struct RouteReconciler {
    tool: Arc<dyn OverlayTool>,
    mode: RuntimeMode,
    protected_override: Option<Vec<u16>>,
}

impl RouteReconciler {
    pub fn new(tool: Arc<dyn OverlayTool>, mode: RuntimeMode) -> Self {
        Self {
            tool,
            mode,
            protected_override: None,
        }
    }

    /// Replace the protected backend set instead of merging with state
    pub fn with_protected_ports(mut self, ports: Option<Vec<u16>>) -> Self {
        self.protected_override = ports;
        self
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    /// Expose the share server on the tailnet.
    ///
    /// Never fails: if the overlay tool cannot enable the route, `state` is
    /// degraded to plain local access and a warning for the user is returned.
    pub fn enable_route(&self, state: &mut State) -> Option<String> {
        if self.mode.is_dry_run() {
            debug!(port = state.port, "Dry run: simulating route enable");
            state.ts_protocol = Protocol::Https;
            return None;
        }

        self.refresh_hostname(state);

        match self.tool.enable_route(state.ts_port, state.port) {
            Ok(()) => {
                info!(
                    exposed = state.ts_port,
                    backend = state.port,
                    host = %state.ts_hostname,
                    "Route enabled"
                );
                state.ts_protocol = Protocol::Https;
                None
            }
            Err(e) => Some(self.degrade(state, &e)),
        }
    }

    /// Expose the share server on the public internet through funnel mode.
    ///
    /// Same degrade behaviour as [`RouteReconciler::enable_route`].
    pub fn enable_funnel(&self, state: &mut State) -> Option<String> {
        if self.mode.is_dry_run() {
            debug!(port = state.port, "Dry run: simulating funnel enable");
            state.ts_protocol = Protocol::Https;
            return None;
        }

        self.refresh_hostname(state);

        match self.tool.enable_funnel(state.ts_port, state.port) {
            Ok(()) => {
                info!(exposed = state.ts_port, backend = state.port, "Funnel enabled");
                state.ts_protocol = Protocol::Https;
                None
            }
            Err(e) => Some(self.degrade(state, &e)),
        }
    }

    /// Enable the route only for the very first share.
    pub fn ensure_for_first_share(&self, state: &mut State) -> Option<String> {
        if !state.shares.is_empty() {
            debug!(shares = state.shares.len(), "Route already set up for existing shares");
            return None;
        }
        self.enable_route(state)
    }

    /// Restore routing at boot when there is anything to serve.
    pub fn ensure_for_restored_routes(&self, state: &mut State) -> Option<String> {
        if !state.has_shares_or_projects() {
            debug!("Nothing shared, not restoring route");
            return None;
        }
        self.enable_route(state)
    }

    /// Tear down the configured exposed port.
    pub fn disable_route(&self, state: &State) -> OverlayResult<()> {
        if self.mode.is_dry_run() {
            debug!(exposed = state.ts_port, "Dry run: simulating route disable");
            return Ok(());
        }
        self.tool.disable_route(state.ts_port)?;
        info!(exposed = state.ts_port, "Route disabled");
        Ok(())
    }

    pub fn disable_funnel(&self, state: &State) -> OverlayResult<()> {
        if self.mode.is_dry_run() {
            debug!(exposed = state.ts_port, "Dry run: simulating funnel disable");
            return Ok(());
        }
        self.tool.disable_funnel(state.ts_port)?;
        info!(exposed = state.ts_port, "Funnel disabled");
        Ok(())
    }

    /// Remove exposed ports whose backends are gone and that are not protected.
    pub fn cleanup_stale_routes(
        &self,
        state: &State,
        options: CleanupOptions,
    ) -> OverlayResult<CleanupReport> {
        let text = self.tool.route_status_text()?;
        if text.trim().is_empty() {
            debug!("No overlay routes configured");
            return Ok(CleanupReport::default());
        }

        let entries = parse_route_status(&text);
        let protected = self.protected_ports(state);
        let partition = classify_routes(&entries, &protected, |port| {
            self.tool.is_backend_port_live(port)
        });

        let dry_run = options.dry_run || self.mode.is_dry_run();
        let mut report = CleanupReport {
            removed: Vec::new(),
            protected: partition.protected,
            skipped: partition.skipped,
            failed: Vec::new(),
        };

        for port in partition.stale {
            if dry_run {
                debug!(exposed = port, "Dry run: would remove stale route");
                report.removed.push(port);
                continue;
            }

            match self.tool.disable_route(port) {
                Ok(()) => {
                    info!(exposed = port, "Removed stale route");
                    report.removed.push(port);
                }
                Err(e) => {
                    warn!(exposed = port, error = %e, "Failed to remove stale route");
                    report.failed.push(port);
                }
            }
        }

        Ok(report)
    }

    /// Best-effort release of an exposed mapping that collides with `port`.
    ///
    /// Used by the bind state machine before retrying. The mapping on `port`
    /// is classified like any other route and only torn down when stale.
    /// Returns whether a teardown was issued.
    pub fn release_conflicting_port(&self, state: &State, port: u16) -> bool {
        let protected = self.protected_ports(state);
        if port == DEFAULT_EXPOSED_PORT || protected.contains(port) {
            debug!(port, "Conflicting port is protected, not releasing");
            return false;
        }

        let text = match self.tool.route_status_text() {
            Ok(text) => text,
            Err(e) => {
                debug!(port, error = %e, "Could not read overlay routes");
                return false;
            }
        };

        let entries: Vec<RouteEntry> = parse_route_status(&text)
            .into_iter()
            .filter(|entry| entry.https_port == port)
            .collect();
        if entries.is_empty() {
            debug!(port, "No overlay mapping on conflicting port");
            return false;
        }

        let partition = classify_routes(&entries, &protected, |backend| {
            self.tool.is_backend_port_live(backend)
        });
        if !partition.stale.contains(&port) {
            debug!(port, "Overlay mapping on conflicting port is in use, not releasing");
            return false;
        }

        if self.mode.is_dry_run() {
            debug!(port, "Dry run: would release conflicting mapping");
            return false;
        }

        match self.tool.disable_route(port) {
            Ok(()) => {
                info!(port, "Released overlay mapping on conflicting port");
                true
            }
            Err(e) => {
                warn!(port, error = %e, "Could not release overlay mapping");
                false
            }
        }
    }

    pub fn protected_ports(&self, state: &State) -> ProtectedPorts {
        ProtectedPorts::resolve(state, self.protected_override.as_deref())
    }

    fn refresh_hostname(&self, state: &mut State) {
        match self.tool.status_json() {
            Ok(json) => {
                if let Some(hostname) = parse_hostname_from_status(&json) {
                    state.ts_hostname = hostname;
                }
            }
            Err(e) => debug!(error = %e, "Could not read overlay status"),
        }
    }

    fn degrade(&self, state: &mut State, error: &OverlayError) -> String {
        warn!(error = %error, "Overlay route unavailable, falling back to local access");
        state.ts_hostname = "localhost".to_string();
        state.ts_port = state.port;
        state.ts_protocol = Protocol::Http;

        match error {
            OverlayError::ToolUnavailable(_) => format!(
                "tailscale is not installed; sharing on http://localhost:{} only",
                state.port
            ),
            _ => format!(
                "tailscale serve failed ({}); sharing on http://localhost:{} only",
                error, state.port
            ),
        }
    }
}
