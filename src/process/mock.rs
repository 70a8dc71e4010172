//! Mock process probe for testing.
//!
//! Simulates a process table in memory. Processes can be configured to exit
//! on SIGTERM, after a number of liveness checks, or never.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use super::probe::{ProcessEntry, ProcessProbe};

/// How a simulated process reacts to SIGTERM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermBehavior {
    /// Gone immediately
    ExitImmediately,
    /// Still alive for this many more liveness checks
    ExitAfterChecks(u32),
    /// Ignores the signal
    Ignore,
    /// Signal delivery fails with "operation not permitted"
    Refuse,
}

#[derive(Debug, Clone)]
struct MockProcess {
    command: String,
    listening_port: Option<u16>,
    behavior: TermBehavior,
    terminating: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    processes: HashMap<u32, MockProcess>,
    terminated: Vec<u32>,
}

/// In-memory process table
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    inner: Arc<Mutex<Inner>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live process that exits as soon as it is signalled
    pub fn with_process(self, pid: u32, command: &str) -> Self {
        self.spawn(pid, command);
        self
    }

    /// Add a live process; usable after the probe has been handed out
    pub fn spawn(&self, pid: u32, command: &str) {
        self.lock().processes.insert(
            pid,
            MockProcess {
                command: command.to_string(),
                listening_port: None,
                behavior: TermBehavior::ExitImmediately,
                terminating: None,
            },
        );
    }

    pub fn with_listening_port(self, pid: u32, port: u16) -> Self {
        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.listening_port = Some(port);
        }
        self
    }

    pub fn with_term_behavior(self, pid: u32, behavior: TermBehavior) -> Self {
        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.behavior = behavior;
        }
        self
    }

    /// Remove a process as if it crashed
    pub fn kill(&self, pid: u32) {
        self.lock().processes.remove(&pid);
    }

    /// Pids that received SIGTERM, in order
    pub fn terminated(&self) -> Vec<u32> {
        self.lock().terminated.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcessProbe for MockProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let mut inner = self.lock();
        let Some(process) = inner.processes.get_mut(&pid) else {
            return false;
        };

        match process.terminating {
            Some(0) => {}
            Some(remaining) => {
                process.terminating = Some(remaining - 1);
                return true;
            }
            None => return true,
        }

        inner.processes.remove(&pid);
        false
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut inner = self.lock();
        inner.terminated.push(pid);

        let Some(process) = inner.processes.get_mut(&pid) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
        };

        match process.behavior {
            TermBehavior::ExitImmediately => {
                inner.processes.remove(&pid);
            }
            TermBehavior::ExitAfterChecks(checks) => {
                process.terminating = Some(checks);
            }
            TermBehavior::Ignore => {}
            TermBehavior::Refuse => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "operation not permitted",
                ));
            }
        }
        Ok(())
    }

    fn processes(&self) -> io::Result<Vec<ProcessEntry>> {
        let mut entries: Vec<ProcessEntry> = self
            .lock()
            .processes
            .iter()
            .map(|(&pid, process)| ProcessEntry {
                pid,
                command: process.command.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.pid);
        Ok(entries)
    }

    fn listening_port(&self, pid: u32) -> Option<u16> {
        self.lock().processes.get(&pid)?.listening_port
    }
}
