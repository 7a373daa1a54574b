//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::server::ConnectionTimeouts;
use crate::status::Frontend;

/// Signaling relay pairing one viewer with one camera source.
#[derive(Debug, Clone, Parser)]
#[command(name = "pairing-relay", version)]
pub struct Config {
    /// Plain WebSocket endpoint (ws://)
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:3001")]
    pub listen: SocketAddr,

    /// TLS WebSocket endpoint (wss://), enabled when a certificate is given
    #[arg(long, env = "RELAY_TLS_LISTEN", default_value = "0.0.0.0:3444")]
    pub tls_listen: SocketAddr,

    /// PEM certificate chain for the TLS endpoint
    #[arg(long, env = "RELAY_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for the TLS endpoint
    #[arg(long, env = "RELAY_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// HTTP status endpoint
    #[arg(long, env = "RELAY_STATUS_LISTEN", default_value = "0.0.0.0:8080")]
    pub status_listen: SocketAddr,

    /// Milliseconds to wait after a bound client leaves before resetting the session
    #[arg(long, env = "RELAY_GRACE_MS", default_value_t = 3000)]
    pub grace_ms: u64,

    /// Seconds between host address lookups
    #[arg(long, env = "RELAY_IP_POLL_SECS", default_value_t = 10)]
    pub ip_poll_secs: u64,

    /// Seconds a client gets to complete the TLS and WebSocket handshakes
    #[arg(long, env = "RELAY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Seconds between keepalive pings to each client
    #[arg(long, env = "RELAY_PING_SECS", default_value_t = 15)]
    pub ping_secs: u64,

    /// Seconds of silence after which a client is dropped
    #[arg(long, env = "RELAY_IDLE_TIMEOUT_SECS", default_value_t = 45)]
    pub idle_timeout_secs: u64,

    /// Advertise this address instead of detecting one
    #[arg(long, env = "HOST_IP")]
    pub host_ip: Option<String>,

    /// Port the frontend is served on over http
    #[arg(long, default_value_t = 3000)]
    pub frontend_http_port: u16,

    /// Port the frontend is served on over https
    #[arg(long, default_value_t = 3443)]
    pub frontend_https_port: u16,
}

impl Config {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Poll interval, never below one second.
    pub fn ip_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ip_poll_secs.max(1))
    }

    /// Certificate and key paths, when the TLS endpoint is enabled.
    pub fn tls(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    /// Connection limits. Each is at least one second, and the idle limit
    /// never undercuts the ping interval.
    pub fn timeouts(&self) -> ConnectionTimeouts {
        let ping_secs = self.ping_secs.max(1);
        ConnectionTimeouts {
            handshake: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            ping_interval: Duration::from_secs(ping_secs),
            idle: Duration::from_secs(self.idle_timeout_secs.max(ping_secs)),
        }
    }

    pub fn frontend(&self) -> Frontend {
        Frontend {
            http_port: self.frontend_http_port,
            https_port: self.frontend_https_port,
        }
    }
}
