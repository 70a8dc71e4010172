//! tailshare - share local files, directories and ports over Tailscale or
//! Cloudflare tunnels.
//!
//! The crate orchestrates two external CLIs (`tailscale` and `cloudflared`)
//! around a small local HTTP server and a JSON state file.

pub mod config;
pub mod logging;
pub mod overlay;
pub mod process;
pub mod server;
pub mod state;
pub mod tunnel;
