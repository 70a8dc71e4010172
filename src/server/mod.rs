//! Foreground share server.

pub mod bootstrap;
pub mod routes;

pub use bootstrap::{
    bind_with_fallback, BindPhase, Booted, Bootstrap, BootstrapError, Bound, LoopbackBinder,
    PortBinder, BIND_RETRY_ATTEMPTS, FALLBACK_PORT_CANDIDATES,
};
pub use routes::{build_router, AppState, StatusResponse};

use std::net::TcpListener;
use std::sync::Arc;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::overlay::{RouteReconciler, TailscaleCli};
use crate::process::{ProcessProbe, SystemProbe};
use crate::state::StateStore;
use crate::tunnel::TunnelSupervisor;

/// Bootstrap and run the server until SIGINT or SIGTERM.
///
/// On shutdown the tunnel daemon is stopped before the listener closes.
pub async fn run_foreground(config: RuntimeConfig) -> anyhow::Result<()> {
    let store = StateStore::new(config.state_path()).with_default_port(config.default_port);
    let reconciler = RouteReconciler::new(
        Arc::new(TailscaleCli::with_binary(&config.tailscale_bin)),
        config.mode,
    )
    .with_protected_ports(config.protected_ports.clone());
    let probe: Arc<dyn ProcessProbe> = Arc::new(SystemProbe::new());
    let tunnels = Arc::new(TunnelSupervisor::new(&config, probe.clone()));

    let booted =
        Bootstrap::new(&config, &store, &reconciler, &tunnels, probe).run(&mut LoopbackBinder)?;
    if let Some(warning) = &booted.warning {
        warn!("{}", warning);
    }

    info!(
        port = booted.bound.port,
        url = %booted.state.public_url(),
        dry_run = config.mode.is_dry_run(),
        "Server running"
    );

    let app_state = Arc::new(AppState {
        store: store.clone(),
        mode: config.mode,
        pid: std::process::id(),
        started_at: chrono::Utc::now(),
    });

    let on_shutdown = move || {
        let result = store.read().map_err(anyhow::Error::from).and_then(|mut state| {
            let stopped = tunnels.shutdown(&mut state)?;
            if stopped.is_some() {
                store.write(&state)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "Could not stop tunnel daemon");
        }
    };

    serve(booted.bound.listener, app_state, on_shutdown).await?;

    drop(booted.pid_guard);
    info!("Server stopped");
    Ok(())
}

/// Serve `listener` until a shutdown signal arrives.
///
/// `on_shutdown` runs on a blocking thread after the signal and before the
/// listener is closed.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, on_shutdown: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let listener = TokioTcpListener::from_std(listener)?;
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            if let Err(e) = tokio::task::spawn_blocking(on_shutdown).await {
                warn!(error = %e, "Shutdown hook panicked");
            }
        })
        .await?;

    Ok(())
}

/// Wait for the shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
