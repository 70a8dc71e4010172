//! `tailscale` CLI implementation of [`OverlayTool`]
//!
//! Note: `tailscale serve` only shares within the tailnet. `tailscale funnel`
//! publishes the same mapping on the public internet.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::debug;

use super::{OverlayError, OverlayResult, OverlayTool};

/// Overlay tool backed by the `tailscale` executable
#[derive(Debug, Clone)]
pub struct TailscaleCli {
    bin: PathBuf,
}

impl TailscaleCli {
    /// Use `tailscale` from PATH
    pub fn new() -> Self {
        Self::with_binary("tailscale")
    }

    /// Use an explicit executable path
    pub fn with_binary(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn binary(&self) -> &Path {
        &self.bin
    }

    fn run(&self, args: &[&str]) -> OverlayResult<Output> {
        debug!(bin = %self.bin.display(), ?args, "Running overlay tool");

        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    OverlayError::ToolUnavailable(self.bin.display().to_string())
                }
                _ => OverlayError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };

            if message.contains("Access denied") || message.contains("serve config denied") {
                return Err(OverlayError::CommandFailed {
                    command: self.describe(args),
                    message: "tailscale serve requires operator permissions. \
                              Run 'sudo tailscale set --operator=$USER' once to fix this."
                        .to_string(),
                });
            }

            return Err(OverlayError::CommandFailed {
                command: self.describe(args),
                message,
            });
        }

        Ok(output)
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.bin.display(), args.join(" "))
    }

    fn run_stdout(&self, args: &[&str]) -> OverlayResult<String> {
        let output = self.run(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TailscaleCli {
    fn default() -> Self {
        Self::new()
    }
}

fn https_flag(port: u16) -> String {
    format!("--https={}", port)
}

fn backend_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

impl OverlayTool for TailscaleCli {
    fn status_json(&self) -> OverlayResult<String> {
        self.run_stdout(&["status", "--json"])
    }

    fn route_status_text(&self) -> OverlayResult<String> {
        self.run_stdout(&["serve", "status"])
    }

    fn enable_route(&self, exposed_port: u16, backend_port: u16) -> OverlayResult<()> {
        let https = https_flag(exposed_port);
        let backend = backend_url(backend_port);
        self.run(&["serve", "--bg", &https, &backend])?;
        Ok(())
    }

    fn disable_route(&self, exposed_port: u16) -> OverlayResult<()> {
        let https = https_flag(exposed_port);
        self.run(&["serve", &https, "off"])?;
        Ok(())
    }

    fn enable_funnel(&self, exposed_port: u16, backend_port: u16) -> OverlayResult<()> {
        let https = https_flag(exposed_port);
        let backend = backend_url(backend_port);
        self.run(&["funnel", "--bg", &https, &backend])?;
        Ok(())
    }

    fn disable_funnel(&self, exposed_port: u16) -> OverlayResult<()> {
        let https = https_flag(exposed_port);
        self.run(&["funnel", &https, "off"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tailscale_default_binary() {
        assert_eq!(TailscaleCli::default().binary(), Path::new("tailscale"));
    }

    #[test]
    fn test_tailscale_binary_override() {
        let cli = TailscaleCli::with_binary("/opt/tailscale/bin/tailscale");
        assert_eq!(cli.binary(), Path::new("/opt/tailscale/bin/tailscale"));
    }

    #[test]
    fn test_flags() {
        assert_eq!(https_flag(8443), "--https=8443");
        assert_eq!(backend_url(7780), "http://127.0.0.1:7780");
    }

    #[test]
    fn test_missing_binary_is_tool_unavailable() {
        let cli = TailscaleCli::with_binary("definitely_not_a_real_binary_12345");
        assert!(matches!(
            cli.status_json(),
            Err(OverlayError::ToolUnavailable(_))
        ));
        assert!(matches!(
            cli.disable_route(8443),
            Err(OverlayError::ToolUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_command_failed() {
        // `false` ignores its arguments and exits 1
        let cli = TailscaleCli::with_binary("false");
        assert!(matches!(
            cli.route_status_text(),
            Err(OverlayError::CommandFailed { .. })
        ));
    }
}
