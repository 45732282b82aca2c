use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_instance_id")]
    pub id: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            id: default_instance_id(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Listen address for the LAN-facing interface.
    #[serde(default = "default_lan_listen")]
    pub lan_listen: String,
    /// Listen address for the WAN-facing interface.
    #[serde(default = "default_wan_listen")]
    pub wan_listen: String,
    /// Authoritative zone suffixes (normalized to a trailing dot on load).
    #[serde(default)]
    pub soa_zones: Vec<String>,
    /// Upstream resolvers used for LAN-no-SOA forwarding.
    #[serde(default)]
    pub resolvers: Vec<String>,
    /// Per-record-type retransmission schedule, in seconds. `null`/absent key uses
    /// the default `[0]` (one blocking attempt, §4.4).
    #[serde(default)]
    pub timeouts: HashMap<String, Vec<f64>>,
}

fn default_lan_listen() -> String {
    "0.0.0.0:53".to_string()
}
fn default_wan_listen() -> String {
    "0.0.0.0:5300".to_string()
}
fn default_instance_id() -> String {
    "rgw-01".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// Circular Pool — finite set of public IPv4 addresses (§3).
    #[serde(default)]
    pub circularpool: Vec<Ipv4Addr>,
    /// Service Pool — small pool used for proxy indirection (§4.4 step 4).
    #[serde(default)]
    pub servicepool: Vec<Ipv4Addr>,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            circularpool: Vec::new(),
            servicepool: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Global CIRCULARPOOL.max — maximum concurrent reservations across all hosts.
    #[serde(default = "default_global_max")]
    pub circularpool_max: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            circularpool_max: default_global_max(),
        }
    }
}

fn default_global_max() -> u32 {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub fqdn: String,
    pub ipv4: Ipv4Addr,
    #[serde(default = "default_host_max")]
    pub circularpool_max: u32,
    #[serde(default)]
    pub carriergrade_whitelist: Vec<Ipv4Addr>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_host_max() -> u32 {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub sfqdn: String,
    pub port: u16,
    pub protocol: u8,
    #[serde(default)]
    pub proxy_required: bool,
    #[serde(default)]
    pub carriergrade: bool,
    #[serde(default)]
    pub loose_packet: i32,
    #[serde(default = "default_true")]
    pub autobind: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,
}

fn default_true() -> bool {
    true
}
fn default_timeout() -> f64 {
    2.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: InstanceConfig::default(),
            dns: DnsConfig {
                lan_listen: default_lan_listen(),
                wan_listen: default_wan_listen(),
                soa_zones: Vec::new(),
                resolvers: Vec::new(),
                timeouts: HashMap::new(),
            },
            pools: PoolsConfig::default(),
            policy: PolicyConfig::default(),
            logging: LoggingConfig::default(),
            hosts: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        for zone in &mut config.dns.soa_zones {
            *zone = crate::types::ensure_fqdn(zone);
        }
        Ok(config)
    }
}
