//! Persisted state shared by the CLI and the background server
//!
//! The state lives in a single JSON document. Only the fields the lifecycle
//! engine reads or writes are typed; everything else (share records, project
//! records, fields written by newer versions) is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::config::DEFAULT_PORT;

/// Backend port exempt from stale-route removal unless overridden
pub const BASELINE_PROTECTED_PORT: u16 = 18789;

/// Errors that can occur reading or writing state
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("State file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for state operations
pub type StateResult<T> = Result<T, StateError>;

/// Scheme of the externally reachable address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Https,
    #[default]
    Http,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Https => "https",
            Protocol::Http => "http",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Protocol::Https => 443,
            Protocol::Http => 80,
        }
    }
}

/// A persistent Cloudflare tunnel created by `tailshare tunnel create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedTunnel {
    pub name: String,
    pub uuid: String,
    pub hostname: String,
    pub credentials_path: PathBuf,
}

/// The persisted state document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    /// Port the local listener is bound to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Port exposed on the overlay network
    #[serde(default = "default_port")]
    pub ts_port: u16,

    #[serde(default = "default_hostname")]
    pub ts_hostname: String,

    #[serde(default)]
    pub ts_protocol: Protocol,

    #[serde(default = "default_protected_ports")]
    pub protected_ports: Vec<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_tunnel: Option<NamedTunnel>,

    /// Last known pid of the tunnel daemon; a hint, always re-verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_tunnel_pid: Option<u32>,

    #[serde(default)]
    pub shares: Vec<Value>,

    #[serde(default)]
    pub projects: Vec<Value>,

    /// Fields this crate does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_protected_ports() -> Vec<u16> {
    vec![BASELINE_PROTECTED_PORT]
}

impl Default for State {
    fn default() -> Self {
        Self::with_port(DEFAULT_PORT)
    }
}

impl State {
    /// Fresh state for a listener on `port`
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ts_port: port,
            ts_hostname: default_hostname(),
            ts_protocol: Protocol::default(),
            protected_ports: default_protected_ports(),
            named_tunnel: None,
            named_tunnel_pid: None,
            shares: Vec::new(),
            projects: Vec::new(),
            extra: Map::new(),
        }
    }

    /// URL under which shares are reachable from outside this machine
    pub fn public_url(&self) -> String {
        let scheme = self.ts_protocol.scheme();
        if self.ts_port == self.ts_protocol.default_port() {
            format!("{}://{}", scheme, self.ts_hostname)
        } else {
            format!("{}://{}:{}", scheme, self.ts_hostname, self.ts_port)
        }
    }

    pub fn has_shares_or_projects(&self) -> bool {
        !self.shares.is_empty() || !self.projects.is_empty()
    }
}

/// Backend ports that stale-route cleanup never removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedPorts(BTreeSet<u16>);

impl ProtectedPorts {
    pub fn baseline() -> Self {
        Self::from_ports([BASELINE_PROTECTED_PORT])
    }

    pub fn from_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        Self(ports.into_iter().collect())
    }

    /// Resolve the effective set: an explicit override replaces everything,
    /// otherwise the persisted list is used together with the baseline.
    pub fn resolve(state: &State, override_ports: Option<&[u16]>) -> Self {
        match override_ports {
            Some(ports) => Self::from_ports(ports.iter().copied()),
            None => {
                let mut set = Self::baseline();
                set.0.extend(state.protected_ports.iter().copied());
                set
            }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

impl Default for ProtectedPorts {
    fn default() -> Self {
        Self::baseline()
    }
}

/// File-backed store for [`State`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    default_port: u16,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            default_port: DEFAULT_PORT,
        }
    }

    /// Port used for a state file that does not exist yet
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state, returning defaults if the file doesn't exist
    pub fn read(&self) -> StateResult<State> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(State::with_port(self.default_port));
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if contents.trim().is_empty() {
            return Ok(State::with_port(self.default_port));
        }

        serde_json::from_str(&contents).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the state, replacing the file atomically
    pub fn write(&self, state: &State) -> StateResult<()> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        debug!(path = %self.path.display(), port = state.port, "Wrote state");
        Ok(())
    }

    /// Read, mutate and write back the state.
    ///
    /// Concurrent writers are not coordinated; the last write wins.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut State) -> R) -> StateResult<R> {
        let mut state = self.read()?;
        let result = mutate(&mut state);
        self.write(&state)?;
        Ok(result)
    }
}
