use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tailshare::config::{format_config, Config, Overrides, RuntimeConfig};
use tailshare::logging::{init_logging, init_server_logging, LogConfig, Verbosity};
use tailshare::overlay::{CleanupOptions, CleanupReport, RouteReconciler, TailscaleCli};
use tailshare::process::{ProcessSupervisor, ServerLauncher, ServerStatus, SystemProbe};
use tailshare::server::run_foreground;
use tailshare::state::StateStore;
use tailshare::tunnel::{QuickTunnel, TunnelSupervisor, DEFAULT_QUICK_TIMEOUT};

#[derive(Parser)]
#[command(name = "tailshare")]
#[command(version)]
#[command(about = "Share local files, directories and ports over Tailscale or Cloudflare")]
#[command(
    long_about = "Runs a small local server in the background and keeps tailscale serve routes and cloudflared tunnels pointed at it."
)]
struct Cli {
    /// Simulate overlay route changes instead of performing them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Directory for state, pid file and logs
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Port for the local listener
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Path to the tailscale executable
    #[arg(long, global = true, value_name = "PATH")]
    tailscale_bin: Option<PathBuf>,

    /// Path to the cloudflared executable
    #[arg(long, global = true, value_name = "PATH")]
    cloudflared_bin: Option<PathBuf>,

    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Serve,
    /// Start the server in the background
    Start,
    /// Stop the background server and tear down its routes
    Stop,
    /// Show whether the background server is running
    Status,
    /// Manage tailscale serve routes
    Routes {
        #[command(subcommand)]
        action: RoutesAction,
    },
    /// Manage the Cloudflare tunnel
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum RoutesAction {
    /// Expose the server on the tailnet
    Enable,
    /// Remove the server's tailnet route
    Disable,
    /// Remove routes whose backends are no longer listening
    Cleanup {
        /// Report what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Expose the server on the public internet with tailscale funnel
    Funnel {
        /// Turn funnel off instead
        #[arg(long)]
        off: bool,
    },
}

#[derive(Subcommand)]
enum TunnelAction {
    /// Authorise cloudflared against your Cloudflare account
    Login,
    /// Create a named tunnel and route a hostname to it
    Create { name: String, hostname: String },
    /// Stop and delete the named tunnel
    Delete,
    /// Route another hostname to the named tunnel
    Route { hostname: String },
    /// Start the tunnel daemon
    Start,
    /// Stop the tunnel daemon
    Stop,
    /// Open a temporary trycloudflare.com tunnel
    Quick {
        /// Seconds to wait for the public URL
        #[arg(long, default_value_t = DEFAULT_QUICK_TIMEOUT.as_secs())]
        timeout: u64,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            dry_run: self.dry_run,
            port: self.port,
            data_dir: self.data_dir.clone(),
            tailscale_bin: self.tailscale_bin.clone(),
            cloudflared_bin: self.cloudflared_bin.clone(),
        }
    }

    /// Arguments that make a spawned `serve` see the same overrides
    fn serve_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["serve".into()];
        if self.dry_run {
            args.push("--dry-run".into());
        }
        if let Some(dir) = &self.data_dir {
            args.push("--data-dir".into());
            args.push(dir.into());
        }
        if let Some(port) = self.port {
            args.push("--port".into());
            args.push(port.to_string().into());
        }
        if let Some(bin) = &self.tailscale_bin {
            args.push("--tailscale-bin".into());
            args.push(bin.into());
        }
        if let Some(bin) = &self.cloudflared_bin {
            args.push("--cloudflared-bin".into());
            args.push(bin.into());
        }
        args
    }
}

/// Components shared by the one-shot commands
struct App {
    runtime: RuntimeConfig,
    store: StateStore,
    reconciler: RouteReconciler,
}

impl App {
    fn new(runtime: RuntimeConfig) -> Self {
        let store = StateStore::new(runtime.state_path()).with_default_port(runtime.default_port);
        let reconciler = RouteReconciler::new(
            Arc::new(TailscaleCli::with_binary(&runtime.tailscale_bin)),
            runtime.mode,
        )
        .with_protected_ports(runtime.protected_ports.clone());
        Self {
            runtime,
            store,
            reconciler,
        }
    }

    fn supervisor(&self, serve_args: Vec<OsString>) -> Result<ProcessSupervisor> {
        let launcher = ServerLauncher::current_exe(serve_args)
            .context("Could not locate the tailshare executable")?
            .with_log(self.runtime.server_log_path());
        Ok(ProcessSupervisor::new(
            &self.runtime,
            self.store.clone(),
            self.reconciler.clone(),
            Arc::new(SystemProbe::new()),
            launcher,
        ))
    }

    fn tunnels(&self) -> TunnelSupervisor {
        TunnelSupervisor::new(&self.runtime, Arc::new(SystemProbe::new()))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("tailshare: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let runtime = config.resolve(&cli.overrides());

    let _log_guard = match cli.command {
        Commands::Serve => init_server_logging(&runtime.server_log_path()),
        _ => init_logging(&LogConfig {
            verbosity: Verbosity::from_occurrences(cli.verbose),
            log_file: runtime.log_file.clone(),
        }),
    };

    let serve_args = cli.serve_args();
    let app = App::new(runtime);

    match cli.command {
        Commands::Serve => run_foreground(app.runtime).await?,
        Commands::Start => {
            app.supervisor(serve_args)?.start()?;
        }
        Commands::Stop => {
            app.supervisor(serve_args)?.stop()?;
        }
        Commands::Status => match app.supervisor(serve_args)?.status()? {
            ServerStatus::Stopped => println!("stopped"),
            ServerStatus::Running { pid, uptime, port } => {
                let state = app.store.read()?;
                let uptime = uptime
                    .map(format_uptime)
                    .unwrap_or_else(|| "unknown".to_string());
                println!("running (pid {}, port {}, up {})", pid, port, uptime);
                println!("{}", state.public_url());
            }
        },
        Commands::Routes { action } => run_routes(&app, action)?,
        Commands::Tunnel { action } => run_tunnel(&app, action).await?,
        Commands::Config => println!("{}", format_config(&config, &app.runtime)),
    }

    Ok(())
}

fn run_routes(app: &App, action: RoutesAction) -> Result<()> {
    match action {
        RoutesAction::Enable => {
            let (warning, url) = app.store.update(|state| {
                let warning = app.reconciler.enable_route(state);
                (warning, state.public_url())
            })?;
            if let Some(warning) = warning {
                eprintln!("tailshare: {}", warning);
            }
            println!("{}", url);
        }
        RoutesAction::Disable => {
            let state = app.store.read()?;
            app.reconciler.disable_route(&state)?;
        }
        RoutesAction::Cleanup { dry_run } => {
            let state = app.store.read()?;
            let report = app
                .reconciler
                .cleanup_stale_routes(&state, CleanupOptions { dry_run })?;
            print_cleanup_report(&report, dry_run || app.runtime.mode.is_dry_run());
        }
        RoutesAction::Funnel { off: true } => {
            let state = app.store.read()?;
            app.reconciler.disable_funnel(&state)?;
        }
        RoutesAction::Funnel { off: false } => {
            let (warning, url) = app.store.update(|state| {
                let warning = app.reconciler.enable_funnel(state);
                (warning, state.public_url())
            })?;
            if let Some(warning) = warning {
                eprintln!("tailshare: {}", warning);
            }
            println!("{}", url);
        }
    }
    Ok(())
}

async fn run_tunnel(app: &App, action: TunnelAction) -> Result<()> {
    let tunnels = app.tunnels();

    match action {
        TunnelAction::Login => tunnels.cli().login()?,
        TunnelAction::Create { name, hostname } => {
            let tunnel = app.store.update(|state| {
                let tunnel = tunnels.create(state, &name, &hostname)?;
                tunnels.write_config(state)?;
                Ok::<_, tailshare::tunnel::TunnelError>(tunnel)
            })??;
            println!(
                "Created tunnel {} ({}) for https://{}",
                tunnel.name, tunnel.uuid, tunnel.hostname
            );
        }
        TunnelAction::Delete => {
            app.store.update(|state| tunnels.delete(state))??;
        }
        TunnelAction::Route { hostname } => {
            let state = app.store.read()?;
            tunnels.route_dns(&state, &hostname)?;
        }
        TunnelAction::Start => {
            app.store.update(|state| {
                tunnels.write_config(state)?;
                tunnels.start(state)
            })??;
        }
        TunnelAction::Stop => {
            app.store.update(|state| tunnels.shutdown(state))??;
        }
        TunnelAction::Quick { timeout } => {
            let port = app.store.read()?.port;
            let mut tunnel =
                QuickTunnel::start(tunnels.cli(), port, Duration::from_secs(timeout)).await?;
            println!("{}", tunnel.url());

            let exited = tokio::select! {
                _ = tokio::signal::ctrl_c() => None,
                status = tunnel.wait() => Some(status),
            };
            match exited {
                None => tunnel.stop().await?,
                Some(status) => anyhow::bail!("quick tunnel exited ({})", status?),
            }
        }
    }
    Ok(())
}

fn print_cleanup_report(report: &CleanupReport, dry_run: bool) {
    let removed_label = if dry_run { "would remove" } else { "removed" };
    let rows = [
        (removed_label, &report.removed),
        ("protected", &report.protected),
        ("skipped", &report.skipped),
        ("failed", &report.failed),
    ];

    for (label, ports) in rows {
        if ports.is_empty() {
            continue;
        }
        let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
        println!("{}: {}", label, ports.join(", "));
    }
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m{}s", secs / 60, secs % 60),
        _ => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
    }
}
