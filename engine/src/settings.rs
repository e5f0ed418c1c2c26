use common::BurstBand;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How engines are launched and reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_singbox_binary")]
    pub singbox_binary: String,

    #[serde(default = "default_xray_binary")]
    pub xray_binary: String,

    /// Where the engine configuration files are written.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// sing-box Clash API `external_controller`.
    #[serde(default = "default_clash_api_addr")]
    pub clash_api_addr: String,

    /// xray gRPC API (StatsService) listen address.
    #[serde(default = "default_xray_api_addr")]
    pub xray_api_addr: String,

    /// Local SOCKS5 dispatch relay the engine routes user traffic through.
    #[serde(default = "default_relay_addr")]
    pub relay_addr: String,

    #[serde(default = "default_accounting_relay")]
    pub accounting_relay: bool,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    #[serde(default = "default_certificate_path")]
    pub certificate_path: String,

    #[serde(default = "default_private_key_path")]
    pub private_key_path: String,
}

fn default_singbox_binary() -> String {
    "sing-box".to_string()
}

fn default_xray_binary() -> String {
    "xray".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_clash_api_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_xray_api_addr() -> String {
    "127.0.0.1:10085".to_string()
}

fn default_relay_addr() -> String {
    "127.0.0.1:10086".to_string()
}

fn default_accounting_relay() -> bool {
    true
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_startup_grace_ms() -> u64 {
    500
}

fn default_certificate_path() -> String {
    "data/certificate.crt".to_string()
}

fn default_private_key_path() -> String {
    "data/private.key".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            singbox_binary: default_singbox_binary(),
            xray_binary: default_xray_binary(),
            data_dir: default_data_dir(),
            clash_api_addr: default_clash_api_addr(),
            xray_api_addr: default_xray_api_addr(),
            relay_addr: default_relay_addr(),
            accounting_relay: default_accounting_relay(),
            settle_delay_ms: default_settle_delay_ms(),
            startup_grace_ms: default_startup_grace_ms(),
            certificate_path: default_certificate_path(),
            private_key_path: default_private_key_path(),
        }
    }
}

impl EngineSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Number of ticks between two commits of the traffic accumulator.
    #[serde(default = "default_flush_every_ticks")]
    pub flush_every_ticks: u32,

    /// Attribute connections without a user to the only configured user.
    #[serde(default = "default_single_user_fallback")]
    pub single_user_fallback: bool,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_flush_every_ticks() -> u32 {
    10
}

fn default_single_user_fallback() -> bool {
    true
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            flush_every_ticks: default_flush_every_ticks(),
            single_user_fallback: default_single_user_fallback(),
        }
    }
}

impl MonitorSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "default_burst_floor_bytes")]
    pub burst_floor_bytes: u64,

    #[serde(default = "default_burst_ceiling_bytes")]
    pub burst_ceiling_bytes: u64,

    /// Bucket used for traffic that matches no configured user.
    #[serde(default = "default_identity")]
    pub default_identity: String,
}

fn default_burst_floor_bytes() -> u64 {
    64 * 1024
}

fn default_burst_ceiling_bytes() -> u64 {
    512 * 1024
}

fn default_identity() -> String {
    "__DEFAULT__".to_string()
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            burst_floor_bytes: default_burst_floor_bytes(),
            burst_ceiling_bytes: default_burst_ceiling_bytes(),
            default_identity: default_identity(),
        }
    }
}

impl LimiterSettings {
    pub fn band(&self) -> BurstBand {
        BurstBand {
            min_bytes: self.burst_floor_bytes,
            max_bytes: self.burst_ceiling_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_subscriber_capacity() -> usize {
    100
}

fn default_keepalive_secs() -> u64 {
    10
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}
