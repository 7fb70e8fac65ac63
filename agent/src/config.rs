//! # Agent Configuration
//!
//! Read from the environment and overridable on the command line (design
//! §6 "Agent read... the channel endpoint URL... from configuration"). The
//! CLI layer mirrors the pattern the `agentgateway` forks use for their
//! binaries: `clap` derive struct with `env` fallbacks, no config file.

use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "tunnel-agent", about = "Relays tunneled requests to a local service")]
pub struct Config {
    /// Control channel URL, e.g. ws://edge.example.com/control
    #[arg(long, env = "TUNNEL_EDGE_URL")]
    pub edge_url: String,

    /// Tunnel identifier this agent binds to.
    #[arg(long, env = "TUNNEL_ID")]
    pub tunnel_id: String,

    /// Bearer credential presented at connect time.
    #[arg(long, env = "TUNNEL_TOKEN")]
    pub token: String,

    /// Local service port requests are forwarded to.
    #[arg(long, env = "TUNNEL_LOCAL_PORT", default_value_t = 8000)]
    pub local_port: u16,

    #[arg(skip = Duration::from_secs(30))]
    pub heartbeat_interval: Duration,

    #[arg(skip = Duration::from_secs(3))]
    pub reconnect_delay: Duration,

    #[arg(skip = Duration::from_secs(180))]
    pub call_timeout: Duration,
}

impl Config {
    pub fn control_url(&self) -> String {
        format!(
            "{}?tunnel_id={}&token={}",
            self.edge_url, self.tunnel_id, self.token
        )
    }
}
