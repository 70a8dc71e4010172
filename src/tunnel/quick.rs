//! Anonymous quick tunnels
//!
//! `cloudflared tunnel --url` prints the public `trycloudflare.com` address
//! somewhere in its log output, on stdout or stderr depending on version.
//! Both streams are read line by line and the first match wins.

use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{CloudflaredCli, TunnelError, TunnelResult};

/// How long `tailshare tunnel quick` waits for the URL by default
pub const DEFAULT_QUICK_TIMEOUT: Duration = Duration::from_secs(30);

fn quick_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("quick url pattern is valid")
    })
}

/// First quick-tunnel URL in `line`
pub fn parse_quick_url(line: &str) -> Option<&str> {
    quick_url_regex().find(line).map(|m| m.as_str())
}

/// A running quick tunnel
///
/// The child process is killed when this is dropped.
pub struct QuickTunnel {
    child: Child,
    url: String,
}

impl QuickTunnel {
    /// Open a quick tunnel to 127.0.0.1:`port`
    pub async fn start(cli: &CloudflaredCli, port: u16, timeout: Duration) -> TunnelResult<Self> {
        Self::spawn(cli.quick_command(port), timeout)
            .await
            .map_err(|e| match e {
                TunnelError::SpawnFailed(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    TunnelError::ToolNotInstalled(cli.binary().display().to_string())
                }
                other => other,
            })
    }

    /// Spawn `command` and wait until it announces a quick-tunnel URL.
    ///
    /// Fails with `Timeout` if nothing matches in time and with
    /// `ProcessExited` if the process closes its output first.
    pub async fn spawn(mut command: Command, timeout: Duration) -> TunnelResult<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let wait_for_url = async {
            while let Some(line) = rx.recv().await {
                if let Some(url) = parse_quick_url(&line) {
                    return Ok(url.to_string());
                }
            }
            Err(TunnelError::ProcessExited)
        };

        let url = match tokio::time::timeout(timeout, wait_for_url).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(?timeout, "No quick tunnel URL before deadline");
                return Err(TunnelError::Timeout);
            }
        };

        info!(%url, "Quick tunnel ready");
        Ok(Self { child, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for the tunnel process to exit on its own
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub async fn stop(mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Send every line of `stream` into `tx` until EOF
fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // Keep draining after the receiver is gone so the pipe never fills
            let _ = tx.send(line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn test_parse_quick_url() {
        let line = "2024-05-01T10:00:00Z INF |  https://fancy-words-here-1234.trycloudflare.com  |";
        assert_eq!(
            parse_quick_url(line),
            Some("https://fancy-words-here-1234.trycloudflare.com")
        );
        assert_eq!(parse_quick_url("INF Starting tunnel"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quick_tunnel_url_on_stderr() {
        let command = shell(
            "echo 'INF Requesting new quick Tunnel' >&2; \
             echo 'INF |  https://quick-fox-12.trycloudflare.com  |' >&2; \
             exec sleep 30",
        );

        let tunnel = QuickTunnel::spawn(command, Duration::from_secs(5)).await.unwrap();
        assert_eq!(tunnel.url(), "https://quick-fox-12.trycloudflare.com");
        tunnel.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quick_tunnel_url_on_stdout() {
        let command = shell("echo 'https://abc.trycloudflare.com'; exec sleep 30");
        let tunnel = QuickTunnel::spawn(command, Duration::from_secs(5)).await.unwrap();
        assert_eq!(tunnel.url(), "https://abc.trycloudflare.com");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quick_tunnel_timeout() {
        let command = shell("echo 'INF still starting'; exec sleep 30");
        let result = QuickTunnel::spawn(command, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(TunnelError::Timeout)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quick_tunnel_process_exit() {
        let command = shell("echo 'ERR failed to request quick Tunnel' >&2; exit 1");
        let result = QuickTunnel::spawn(command, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TunnelError::ProcessExited)));
    }

    #[tokio::test]
    async fn test_quick_tunnel_missing_binary() {
        let cli = CloudflaredCli::with_binary("definitely_not_a_real_binary_12345");
        let result = QuickTunnel::start(&cli, 7780, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TunnelError::ToolNotInstalled(_))));
    }
}
