//! OS process probes
//!
//! Liveness, termination, the process table and pid-to-listening-port
//! lookups sit behind [`ProcessProbe`] so supervisors can be tested without
//! real processes.

use std::io;
use std::process::{Command, Stdio};
use tracing::debug;

/// One row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
}

/// Process inspection and signalling
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with this pid exists
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to terminate (SIGTERM).
    ///
    /// A process that no longer exists yields `io::ErrorKind::NotFound`.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// All processes with their full command lines
    fn processes(&self) -> io::Result<Vec<ProcessEntry>>;

    /// TCP port the process is listening on, if one can be determined
    fn listening_port(&self, pid: u32) -> Option<u16>;
}

/// Probe backed by signals, `ps` and `lsof`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // kill(pid, 0) probes without sending anything; EPERM still means
        // the process exists
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(io::Error::new(io::ErrorKind::NotFound, err));
        }
        Err(err)
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process signalling is not supported on this platform",
        ))
    }

    fn processes(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,command="])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ps exited with {}", output.status),
            ));
        }

        Ok(parse_process_table(&String::from_utf8_lossy(&output.stdout)))
    }

    fn listening_port(&self, pid: u32) -> Option<u16> {
        let output = Command::new("lsof")
            .args([
                "-nP",
                "-a",
                "-p",
                &pid.to_string(),
                "-iTCP",
                "-sTCP:LISTEN",
                "-Fn",
            ])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| debug!(error = %e, "lsof unavailable"))
            .ok()?;

        parse_lsof_listen_port(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `ps -axo pid=,command=` output
pub fn parse_process_table(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

/// First listening port in `lsof -Fn` output (`n127.0.0.1:7780`, `n*:7780`)
pub fn parse_lsof_listen_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .find_map(|name| name.rsplit_once(':')?.1.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process_table() {
        let output = "\
    1 /sbin/launchd
  812 /usr/local/bin/cloudflared tunnel --config /home/me/.local/share/tailshare/cloudflared.yml run docs
 9001 -zsh
garbage line
";
        let entries = parse_process_table(output);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].pid, 1);
        assert_eq!(entries[1].pid, 812);
        assert!(entries[1].command.ends_with("run docs"));
        assert_eq!(entries[2].command, "-zsh");
    }

    #[test]
    fn test_parse_lsof_listen_port() {
        let output = "p4242\nf12\nn127.0.0.1:7781\n";
        assert_eq!(parse_lsof_listen_port(output), Some(7781));

        let output = "p4242\nf12\nn*:8080\nf13\nn[::1]:8080\n";
        assert_eq!(parse_lsof_listen_port(output), Some(8080));

        assert_eq!(parse_lsof_listen_port(""), None);
        assert_eq!(parse_lsof_listen_port("p4242\n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_is_alive() {
        assert!(SystemProbe::new().is_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_pid_not_alive() {
        assert!(!SystemProbe::new().is_alive(999_999_999));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_missing_process_is_not_found() {
        let err = SystemProbe::new().terminate(999_999_999).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_child_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let probe = SystemProbe::new();

        assert!(probe.is_alive(child.id()));
        probe.terminate(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
