//! Mock overlay tool for testing.
//!
//! Records every call in order and answers from configured canned output, so
//! route logic can be exercised without a tailscale installation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::{OverlayError, OverlayResult, OverlayTool};

/// A call made against [`MockOverlay`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayCall {
    StatusJson,
    RouteStatusText,
    EnableRoute { exposed: u16, backend: u16 },
    DisableRoute(u16),
    EnableFunnel { exposed: u16, backend: u16 },
    DisableFunnel(u16),
}

#[derive(Debug, Default)]
struct Inner {
    status_json: String,
    route_status: String,
    live_ports: HashSet<u16>,
    unavailable: bool,
    fail_enable: bool,
    fail_disable: bool,
    calls: Vec<OverlayCall>,
}

/// Recording overlay tool.
///
/// Clones share the same call log, so a test can keep one clone and hand
/// another to the code under test.
///
/// ```ignore
/// let mock = MockOverlay::new().with_route_status(text).with_live_ports([3000]);
/// let reconciler = RouteReconciler::new(Arc::new(mock.clone()), RuntimeMode::Live);
/// reconciler.cleanup_stale_routes(&state, CleanupOptions::default())?;
/// assert_eq!(mock.disabled_ports(), vec![10443]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockOverlay {
    inner: Arc<Mutex<Inner>>,
}

impl MockOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `hostname` as `Self.DNSName` in status JSON
    pub fn with_hostname(self, hostname: &str) -> Self {
        let json = serde_json::json!({ "Self": { "DNSName": hostname } }).to_string();
        self.with_status_json(&json)
    }

    pub fn with_status_json(self, json: &str) -> Self {
        self.lock().status_json = json.to_string();
        self
    }

    pub fn with_route_status(self, text: &str) -> Self {
        self.lock().route_status = text.to_string();
        self
    }

    /// Backend ports that report as listening
    pub fn with_live_ports(self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.lock().live_ports.extend(ports);
        self
    }

    /// Every call fails as if the executable were missing
    pub fn unavailable(self) -> Self {
        self.lock().unavailable = true;
        self
    }

    /// Enable calls (route and funnel) fail
    pub fn failing_enable(self) -> Self {
        self.lock().fail_enable = true;
        self
    }

    /// Disable calls (route and funnel) fail
    pub fn failing_disable(self) -> Self {
        self.lock().fail_disable = true;
        self
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<OverlayCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Exposed ports passed to `disable_route`, in call order
    pub fn disabled_ports(&self) -> Vec<u16> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                OverlayCall::DisableRoute(port) => Some(*port),
                _ => None,
            })
            .collect()
    }

    pub fn enable_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, OverlayCall::EnableRoute { .. }))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the log from other assertions
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: OverlayCall) -> OverlayResult<()> {
        let mut inner = self.lock();
        inner.calls.push(call);
        if inner.unavailable {
            return Err(OverlayError::ToolUnavailable("mock".to_string()));
        }
        Ok(())
    }

    fn failure(command: &str) -> OverlayError {
        OverlayError::CommandFailed {
            command: command.to_string(),
            message: "simulated failure".to_string(),
        }
    }
}

impl OverlayTool for MockOverlay {
    fn status_json(&self) -> OverlayResult<String> {
        self.record(OverlayCall::StatusJson)?;
        Ok(self.lock().status_json.clone())
    }

    fn route_status_text(&self) -> OverlayResult<String> {
        self.record(OverlayCall::RouteStatusText)?;
        Ok(self.lock().route_status.clone())
    }

    fn is_backend_port_live(&self, port: u16) -> bool {
        self.lock().live_ports.contains(&port)
    }

    fn enable_route(&self, exposed_port: u16, backend_port: u16) -> OverlayResult<()> {
        self.record(OverlayCall::EnableRoute {
            exposed: exposed_port,
            backend: backend_port,
        })?;
        if self.lock().fail_enable {
            return Err(Self::failure("serve"));
        }
        Ok(())
    }

    fn disable_route(&self, exposed_port: u16) -> OverlayResult<()> {
        self.record(OverlayCall::DisableRoute(exposed_port))?;
        if self.lock().fail_disable {
            return Err(Self::failure("serve off"));
        }
        Ok(())
    }

    fn enable_funnel(&self, exposed_port: u16, backend_port: u16) -> OverlayResult<()> {
        self.record(OverlayCall::EnableFunnel {
            exposed: exposed_port,
            backend: backend_port,
        })?;
        if self.lock().fail_enable {
            return Err(Self::failure("funnel"));
        }
        Ok(())
    }

    fn disable_funnel(&self, exposed_port: u16) -> OverlayResult<()> {
        self.record(OverlayCall::DisableFunnel(exposed_port))?;
        if self.lock().fail_disable {
            return Err(Self::failure("funnel off"));
        }
        Ok(())
    }
}
