//! Parsing and classification of overlay route mappings
//!
//! `tailscale serve status` prints an indented tree:
//!
//! ```text
//! https://box.tailnet.ts.net (tailnet only)
//! |-- / proxy http://127.0.0.1:18789
//!
//! https://box.tailnet.ts.net:8443 (tailnet only)
//! |-- /docs proxy http://127.0.0.1:7780
//! |-- /api  proxy http://127.0.0.1:3000
//! ```
//!
//! The format is not versioned, so matching is kept narrow and anything
//! unrecognised is skipped rather than treated as an error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::state::ProtectedPorts;

/// Exposed port used by header lines that carry no explicit port
pub const DEFAULT_EXPOSED_PORT: u16 = 443;

/// One path mapping from an exposed port to a loopback backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub https_port: u16,
    pub backend_port: u16,
}

/// How cleanup treats one exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Default exposed port or a mapping onto a protected backend
    Protected,
    /// At least one backend is still listening
    Skipped,
    /// Nothing behind it is alive; safe to remove
    Stale,
}

/// Exposed ports partitioned by [`RouteClass`], each ascending and unique
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePartition {
    pub protected: Vec<u16>,
    pub skipped: Vec<u16>,
    pub stale: Vec<u16>,
}

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://[^\s/:]+(?::(\d+))?").expect("header pattern is valid")
    })
}

fn backend_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:https?|https\+insecure)://(?:127\.0\.0\.1|localhost|\[::1\]):(\d+)")
            .expect("backend pattern is valid")
    })
}

/// Parse route-status text into mappings.
///
/// Header lines start at column zero and set the current exposed port;
/// indented lines that name a loopback backend attach to it. Several mappings
/// may share an exposed port.
pub fn parse_route_status(text: &str) -> Vec<RouteEntry> {
    let mut current_port = DEFAULT_EXPOSED_PORT;
    let mut entries = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let indented = line.starts_with(|c: char| c.is_whitespace() || c == '|');

        if !indented {
            if let Some(caps) = header_regex().captures(line) {
                current_port = caps
                    .get(1)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(DEFAULT_EXPOSED_PORT);
            }
            continue;
        }

        if let Some(backend_port) = backend_regex()
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
        {
            entries.push(RouteEntry {
                https_port: current_port,
                backend_port,
            });
        }
    }

    entries
}

/// Classify every exposed port found in `entries`.
///
/// Classification is per exposed port, not per mapping: one protected or live
/// mapping keeps the whole exposed port.
pub fn classify_routes(
    entries: &[RouteEntry],
    protected: &ProtectedPorts,
    is_live: impl Fn(u16) -> bool,
) -> RoutePartition {
    let mut by_port: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
    for entry in entries {
        by_port
            .entry(entry.https_port)
            .or_default()
            .push(entry.backend_port);
    }

    let mut partition = RoutePartition::default();

    for (https_port, backends) in by_port {
        let backends: BTreeSet<u16> = backends.into_iter().collect();

        let class = if https_port == DEFAULT_EXPOSED_PORT
            || backends.iter().any(|&b| protected.contains(b))
        {
            RouteClass::Protected
        } else if backends.iter().any(|&b| is_live(b)) {
            RouteClass::Skipped
        } else {
            RouteClass::Stale
        };

        match class {
            RouteClass::Protected => partition.protected.push(https_port),
            RouteClass::Skipped => partition.skipped.push(https_port),
            RouteClass::Stale => partition.stale.push(https_port),
        }
    }

    partition
}

/// Parse the hostname from tailscale status JSON
///
/// The status JSON has a "Self" object with "DNSName" like "hostname.tailnet-name.ts.net."
pub fn parse_hostname_from_status(json_output: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(json_output).ok()?;

    let dns_name = json.get("Self")?.get("DNSName")?.as_str()?;
    let dns_name = dns_name.trim_end_matches('.');

    if dns_name.is_empty() {
        return None;
    }

    Some(dns_name.to_string())
}
