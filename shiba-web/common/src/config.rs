use std::{
    fmt::Display,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    num::ParseIntError,
    str::FromStr,
    time::Duration,
};

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api_bindings::RtcIceServer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data_storage: StorageConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub web_server: WebServerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default = "default_bringup_timeout")]
    pub bringup_timeout: Duration,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_storage: Default::default(),
            relay: Default::default(),
            auth: Default::default(),
            webrtc: Default::default(),
            web_server: Default::default(),
            capture: Default::default(),
            pipeline: Default::default(),
            bringup_timeout: default_bringup_timeout(),
            log: Default::default(),
        }
    }
}

fn default_bringup_timeout() -> Duration {
    Duration::from_secs(20)
}

// -- Log

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level_filter: LevelFilter,
    pub file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level_filter: default_level_filter(),
            file_path: None,
        }
    }
}

fn default_level_filter() -> LevelFilter {
    LevelFilter::Info
}

// -- Data Storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum StorageConfig {
    Json { path: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Json {
            path: "server/data.json".to_string(),
        }
    }
}

// -- Relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum RelayConfig {
    /// Only sockets of this process see each other
    #[default]
    Local,
    Redis { url: String },
}

// -- Auth

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Falls back to the `JWT_SECRET` environment variable when empty
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            cookie_name: default_cookie_name(),
            issuer: default_issuer(),
            audience: default_audience(),
        }
    }
}

fn default_cookie_name() -> String {
    "shiba-auth-token".to_string()
}
fn default_issuer() -> String {
    "shiba".to_string()
}
fn default_audience() -> String {
    "user".to_string()
}

// -- WebRTC Config

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<RtcIceServer>,
    #[serde(default)]
    pub port_range: Option<PortRange>,
    #[serde(default)]
    pub nat_1to1: Option<WebRtcNat1To1Mapping>,
    #[serde(default = "default_network_types")]
    pub network_types: Vec<WebRtcNetworkType>,
    #[serde(default = "default_include_loopback_candidates")]
    pub include_loopback_candidates: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            port_range: None,
            nat_1to1: None,
            network_types: default_network_types(),
            include_loopback_candidates: default_include_loopback_candidates(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebRtcNetworkType {
    #[serde(rename = "udp4")]
    Udp4,
    #[serde(rename = "udp6")]
    Udp6,
    #[serde(rename = "tcp4")]
    Tcp4,
    #[serde(rename = "tcp6")]
    Tcp6,
}

impl Display for WebRtcNetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ty = match self {
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        };
        write!(f, "{}", ty)
    }
}

#[derive(Debug, Error)]
#[error("not a valid network type")]
pub struct WebRtcNetworkTypeFromStr;

impl FromStr for WebRtcNetworkType {
    type Err = WebRtcNetworkTypeFromStr;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp4" => Ok(Self::Udp4),
            "udp6" => Ok(Self::Udp6),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            _ => Err(WebRtcNetworkTypeFromStr),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcNat1To1Mapping {
    pub ips: Vec<String>,
    pub ice_candidate_type: WebRtcNat1To1IceCandidateType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WebRtcNat1To1IceCandidateType {
    #[serde(rename = "srflx")]
    Srflx,
    #[serde(rename = "host")]
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Error)]
pub enum PortRangeFromStrError {
    #[error("the port range must be of format \"MIN:MAX\"")]
    Split,
    #[error("couldn't parse number: {0}")]
    ParseNumber(#[from] ParseIntError),
}

impl FromStr for PortRange {
    type Err = PortRangeFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = s.split_once(":").ok_or(PortRangeFromStrError::Split)?;
        Ok(PortRange {
            min: min.parse().map_err(PortRangeFromStrError::ParseNumber)?,
            max: max.parse().map_err(PortRangeFromStrError::ParseNumber)?,
        })
    }
}

fn default_ice_servers() -> Vec<RtcIceServer> {
    vec![RtcIceServer {
        urls: vec![
            // Google
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:3478".to_string(),
        ],
        ..Default::default()
    }]
}
fn default_network_types() -> Vec<WebRtcNetworkType> {
    vec![WebRtcNetworkType::Udp4, WebRtcNetworkType::Udp6]
}
fn default_include_loopback_candidates() -> bool {
    true
}

// -- Web Server Config

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    pub certificate: Option<ConfigSsl>,
    #[serde(default)]
    pub url_path_prefix: String,
    /// Sent as `Access-Control-Allow-Origin` when set
    #[serde(default)]
    pub allowed_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSsl {
    pub private_key_pem: String,
    pub certificate_pem: String,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            certificate: None,
            url_path_prefix: "".to_string(),
            allowed_origin: None,
        }
    }
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080))
}

// -- Capture

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub fps: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            depth: 24,
            fps: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Display number of the first pool slot, slot `n` uses `base_display + n`
    #[serde(default = "default_base_display")]
    pub base_display: u32,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub geometry: Geometry,
    #[serde(default = "default_display_server_path")]
    pub display_server_path: String,
    #[serde(default = "default_browser_path")]
    pub browser_path: String,
    #[serde(default = "default_startup_url")]
    pub startup_url: String,
    #[serde(default = "default_profile_root")]
    pub profile_root: String,
    #[serde(default = "default_remote_debugging_port")]
    pub remote_debugging_port: Option<u16>,
    #[serde(default = "default_settle_delay")]
    pub settle_delay: Duration,
    #[serde(default = "default_grace_period")]
    pub grace_period: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            base_display: default_base_display(),
            pool_size: default_pool_size(),
            geometry: Default::default(),
            display_server_path: default_display_server_path(),
            browser_path: default_browser_path(),
            startup_url: default_startup_url(),
            profile_root: default_profile_root(),
            remote_debugging_port: default_remote_debugging_port(),
            settle_delay: default_settle_delay(),
            grace_period: default_grace_period(),
        }
    }
}

fn default_base_display() -> u32 {
    99
}
fn default_pool_size() -> usize {
    1
}
fn default_display_server_path() -> String {
    "Xvfb".to_string()
}
fn default_browser_path() -> String {
    "google-chrome".to_string()
}
fn default_startup_url() -> String {
    "https://www.youtube.com".to_string()
}
fn default_profile_root() -> String {
    "./tmp/chrome-xvfb".to_string()
}
fn default_remote_debugging_port() -> Option<u16> {
    Some(9222)
}
fn default_settle_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_grace_period() -> Duration {
    Duration::from_secs(1)
}

// -- Pipeline

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// kbit/s
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: u32,
    #[serde(default = "default_key_int_max")]
    pub key_int_max: u32,
    #[serde(default = "default_audio_source")]
    pub audio_source: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_bitrate: default_video_bitrate(),
            key_int_max: default_key_int_max(),
            audio_source: default_audio_source(),
        }
    }
}

fn default_video_bitrate() -> u32 {
    4000
}
fn default_key_int_max() -> u32 {
    30
}
fn default_audio_source() -> String {
    "pulsesrc".to_string()
}
