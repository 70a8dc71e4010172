//! Generated cloudflared ingress configuration

use crate::state::NamedTunnel;

/// Render the cloudflared config for `tunnel` forwarding to `port`.
///
/// One hostname rule to the local listener, then a 404 catch-all so
/// cloudflared accepts the file.
pub fn generate_config(tunnel: &NamedTunnel, port: u16) -> String {
    format!(
        "tunnel: {uuid}\n\
         credentials-file: {credentials}\n\
         \n\
         ingress:\n  \
         - hostname: {hostname}\n    \
         service: http://127.0.0.1:{port}\n  \
         - service: http_status:404\n",
        uuid = tunnel.uuid,
        credentials = tunnel.credentials_path.display(),
        hostname = tunnel.hostname,
        port = port,
    )
}
