use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};
use common::config::{Config, PortRange, RelayConfig, WebRtcNetworkType};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Path to the json config, written with defaults when missing
    #[arg(long, env = "CONFIG_PATH", default_value = "server/config.json")]
    pub config_path: String,

    #[command(flatten)]
    pub options: CliOptions,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn load() -> Self {
        Self::parse()
    }
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Runs the server, the default
    Run,
    /// Prints the effective config and exits
    PrintConfig,
}

#[derive(Args, Debug, Default)]
pub struct CliOptions {
    #[arg(long, env = "BIND_ADDRESS")]
    pub bind_address: Option<SocketAddr>,

    #[arg(long, env = "URL_PATH_PREFIX")]
    pub url_path_prefix: Option<String>,

    /// Use redis at this url as the pub/sub relay
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// UDP ports used for ICE, as "MIN:MAX"
    #[arg(long, env = "WEBRTC_PORT_RANGE")]
    pub webrtc_port_range: Option<PortRange>,

    #[arg(long, value_delimiter = ',')]
    pub webrtc_network_types: Option<Vec<WebRtcNetworkType>>,

    #[arg(long)]
    pub base_display: Option<u32>,

    #[arg(long)]
    pub capture_pool_size: Option<usize>,

    #[arg(long)]
    pub log_level: Option<LevelFilter>,
}

impl CliOptions {
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind_address) = self.bind_address {
            config.web_server.bind_address = bind_address;
        }
        if let Some(url_path_prefix) = &self.url_path_prefix {
            config.web_server.url_path_prefix = url_path_prefix.clone();
        }
        if let Some(url) = &self.redis_url {
            config.relay = RelayConfig::Redis { url: url.clone() };
        }
        if let Some(jwt_secret) = &self.jwt_secret {
            config.auth.jwt_secret = jwt_secret.clone();
        }
        if let Some(port_range) = &self.webrtc_port_range {
            config.webrtc.port_range = Some(port_range.clone());
        }
        if let Some(network_types) = &self.webrtc_network_types {
            config.webrtc.network_types = network_types.clone();
        }
        if let Some(base_display) = self.base_display {
            config.capture.base_display = base_display;
        }
        if let Some(pool_size) = self.capture_pool_size {
            config.capture.pool_size = pool_size;
        }
        if let Some(level_filter) = self.log_level {
            config.log.level_filter = level_filter;
        }
    }
}
