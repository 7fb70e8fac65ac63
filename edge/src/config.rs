//! # Configuration
//!
//! The edge reads its table name, object-store bucket, and timing
//! parameters from the environment (§6), the same way the rest of the
//! deployment surface does. There is no config file: a service this size
//! reads plain env vars with typed defaults.

use std::net::SocketAddr;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// How long the edge tolerates a briefly-absent agent before returning
    /// 503 (§4.4, default 30s).
    pub reconnect_grace: Duration,
    /// Only enter the grace window if the tunnel's `updated_at` is within
    /// this long ago (§4.4, default 5 minutes).
    pub reconnect_grace_eligibility: Duration,
    /// Overall deadline for a single tunneled request (§5, default 180s).
    pub poll_deadline: Duration,
    /// Poll tick interval while waiting on the store (§4.4, default 50ms).
    pub poll_interval: Duration,
    /// Reconnect-grace poll interval (§4.4, default 500ms).
    pub reconnect_poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("TUNNEL_EDGE_BIND_ADDR", "0.0.0.0:8080".parse().unwrap()),
            reconnect_grace: Duration::from_secs(env_or("TUNNEL_RECONNECT_GRACE_SECS", 30)),
            reconnect_grace_eligibility: Duration::from_secs(env_or(
                "TUNNEL_RECONNECT_ELIGIBILITY_SECS",
                300,
            )),
            poll_deadline: Duration::from_secs(env_or("TUNNEL_POLL_DEADLINE_SECS", 180)),
            poll_interval: Duration::from_millis(env_or("TUNNEL_POLL_INTERVAL_MS", 50)),
            reconnect_poll_interval: Duration::from_millis(env_or(
                "TUNNEL_RECONNECT_POLL_INTERVAL_MS",
                500,
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
