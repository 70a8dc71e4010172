//! `cloudflared` CLI wrapper
//!
//! One-shot management commands run to completion and are judged by their
//! exit status. Identifiers are scraped from the combined output, which is
//! meant for humans, so the patterns are kept loose.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{TunnelError, TunnelResult};

/// Identifiers of a freshly created tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTunnel {
    pub uuid: String,
    pub credentials_path: PathBuf,
}

/// Wrapper around the `cloudflared` executable
#[derive(Debug, Clone)]
pub struct CloudflaredCli {
    bin: PathBuf,
}

impl Default for CloudflaredCli {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudflaredCli {
    /// Use `cloudflared` from PATH
    pub fn new() -> Self {
        Self::with_binary("cloudflared")
    }

    pub fn with_binary(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn binary(&self) -> &Path {
        &self.bin
    }

    /// Authorise this machine against a Cloudflare account.
    ///
    /// Interactive: output goes straight to the terminal.
    pub fn login(&self) -> TunnelResult<()> {
        debug!(bin = %self.bin.display(), "Running tunnel login");
        let status = Command::new(&self.bin)
            .args(["tunnel", "login"])
            .status()
            .map_err(|e| self.spawn_error(e))?;

        if !status.success() {
            return Err(TunnelError::OperationFailed {
                operation: "login".to_string(),
                output: format!("exited with {}", status),
            });
        }
        Ok(())
    }

    /// Create a named tunnel and locate its credentials file
    pub fn create(&self, name: &str) -> TunnelResult<CreatedTunnel> {
        let output = self.run("create", ["tunnel", "create", name])?;

        let uuid = parse_tunnel_uuid(&output).ok_or_else(|| {
            TunnelError::MalformedOutput(format!(
                "no tunnel id in `cloudflared tunnel create` output: {}",
                output.trim()
            ))
        })?;

        let credentials_path = match parse_credentials_path(&output) {
            Some(path) => path,
            None => {
                let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
                fallback_credentials_path(&home, &uuid)
            }
        };

        Ok(CreatedTunnel {
            uuid,
            credentials_path,
        })
    }

    pub fn delete(&self, name: &str) -> TunnelResult<()> {
        self.run("delete", ["tunnel", "delete", "-f", name])?;
        Ok(())
    }

    /// Point `hostname` at the tunnel with a DNS record
    pub fn route_dns(&self, name: &str, hostname: &str) -> TunnelResult<()> {
        self.run("route dns", ["tunnel", "route", "dns", name, hostname])?;
        Ok(())
    }

    /// Command that runs the tunnel daemon in the foreground
    pub fn run_command(&self, config_path: &Path, name: &str) -> Command {
        let mut command = Command::new(&self.bin);
        command
            .arg("tunnel")
            .arg("--config")
            .arg(config_path)
            .arg("run")
            .arg(name);
        command
    }

    /// Command that opens an anonymous quick tunnel to `port`
    pub fn quick_command(&self, port: u16) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.bin);
        command
            .arg("tunnel")
            .arg("--url")
            .arg(format!("http://127.0.0.1:{}", port));
        command
    }

    pub(crate) fn spawn_error(&self, e: io::Error) -> TunnelError {
        match e.kind() {
            io::ErrorKind::NotFound => TunnelError::ToolNotInstalled(self.bin.display().to_string()),
            _ => TunnelError::SpawnFailed(e),
        }
    }

    /// Run to completion and return stdout and stderr concatenated
    fn run<I, S>(&self, operation: &str, args: I) -> TunnelResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        debug!(
            bin = %self.bin.display(),
            args = ?args.iter().map(|a| a.as_ref().to_string_lossy()).collect::<Vec<_>>(),
            "Running cloudflared"
        );

        let output = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(TunnelError::OperationFailed {
                operation: operation.to_string(),
                output: combined.trim().to_string(),
            });
        }

        Ok(combined)
    }
}

fn created_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)with id ([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
            .expect("id pattern is valid")
    })
}

fn any_uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
            .expect("uuid pattern is valid")
    })
}

fn credentials_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"written to (\S+\.json)").expect("credentials pattern is valid"))
}

/// Tunnel id from `tunnel create` output.
///
/// Prefers the `with id <uuid>` phrase and falls back to the first UUID
/// anywhere in the output.
pub fn parse_tunnel_uuid(output: &str) -> Option<String> {
    let candidate = created_id_regex()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .or_else(|| any_uuid_regex().find(output))?;

    let uuid = uuid::Uuid::parse_str(candidate.as_str()).ok()?;
    Some(uuid.hyphenated().to_string())
}

/// Credentials file path announced by `tunnel create`
pub fn parse_credentials_path(output: &str) -> Option<PathBuf> {
    credentials_regex()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| PathBuf::from(m.as_str()))
}

/// Where cloudflared stores credentials when it doesn't say
pub fn fallback_credentials_path(home: &Path, uuid: &str) -> PathBuf {
    home.join(".cloudflared").join(format!("{}.json", uuid))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE_OUTPUT: &str = "\
Tunnel credentials written to /home/me/.cloudflared/6ff42ae2-765d-4adf-8112-31c55c1551ef.json. cloudflared chose this file based on where your origin certificate was found. Keep this file secret.

Created tunnel docs with id 6ff42ae2-765d-4adf-8112-31c55c1551ef
";

    #[test]
    fn test_parse_tunnel_uuid_from_created_line() {
        assert_eq!(
            parse_tunnel_uuid(CREATE_OUTPUT).as_deref(),
            Some("6ff42ae2-765d-4adf-8112-31c55c1551ef")
        );
    }

    #[test]
    fn test_parse_tunnel_uuid_fallback_and_normalisation() {
        let output = "tunnel 6FF42AE2-765D-4ADF-8112-31C55C1551EF ready";
        assert_eq!(
            parse_tunnel_uuid(output).as_deref(),
            Some("6ff42ae2-765d-4adf-8112-31c55c1551ef")
        );
        assert_eq!(parse_tunnel_uuid("Created tunnel docs"), None);
    }

    #[test]
    fn test_parse_credentials_path() {
        assert_eq!(
            parse_credentials_path(CREATE_OUTPUT),
            Some(PathBuf::from(
                "/home/me/.cloudflared/6ff42ae2-765d-4adf-8112-31c55c1551ef.json"
            ))
        );
        assert_eq!(parse_credentials_path("Created tunnel docs"), None);
    }

    #[test]
    fn test_fallback_credentials_path() {
        assert_eq!(
            fallback_credentials_path(Path::new("/home/me"), "abc"),
            PathBuf::from("/home/me/.cloudflared/abc.json")
        );
    }

    #[test]
    fn test_run_command_line() {
        let cli = CloudflaredCli::with_binary("/opt/cf/cloudflared");
        let command = cli.run_command(Path::new("/data/cloudflared.yml"), "docs");
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(command.get_program(), "/opt/cf/cloudflared");
        assert_eq!(args, ["tunnel", "--config", "/data/cloudflared.yml", "run", "docs"]);
    }

    #[test]
    fn test_missing_binary_is_not_installed() {
        let cli = CloudflaredCli::with_binary("definitely_not_a_real_binary_12345");
        assert!(matches!(
            cli.delete("docs"),
            Err(TunnelError::ToolNotInstalled(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_operation_failed() {
        let cli = CloudflaredCli::with_binary("false");
        match cli.route_dns("docs", "docs.example.com") {
            Err(TunnelError::OperationFailed { operation, .. }) => {
                assert_eq!(operation, "route dns")
            }
            other => panic!("Expected OperationFailed, got {:?}", other),
        }
    }
}
