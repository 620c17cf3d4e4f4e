//! Node configuration: `0xnet.toml` with environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use node_mesh::{GlobalDiscoveryConfig, LocalDiscoveryConfig};
use node_relay::RelayClientConfig;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "0xnet.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    #[serde(default = "default_relay_probe")]
    pub relay_probe_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub local_scan_interval_secs: u64,
    #[serde(default = "default_scan_timeout")]
    pub local_scan_timeout_secs: u64,
    #[serde(default = "default_advertise_interval")]
    pub advertise_interval_secs: u64,
    #[serde(default = "default_resolve_interval")]
    pub resolve_interval_secs: u64,
    #[serde(default = "default_backoff")]
    pub discovery_backoff_secs: u64,
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub relay_connect_attempts: u32,
    #[serde(default = "default_connect_backoff")]
    pub relay_connect_backoff_secs: u64,
    /// 0 picks an ephemeral port.
    #[serde(default)]
    pub overlay_port: u16,
    #[serde(default)]
    pub rendezvous_url: Option<String>,
    #[serde(default = "default_true")]
    pub enable_global: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_api_port() -> u16 {
    8080
}
fn default_relay_port() -> u16 {
    9090
}
fn default_relay_probe() -> u64 {
    3
}
fn default_scan_interval() -> u64 {
    10
}
fn default_scan_timeout() -> u64 {
    3
}
fn default_advertise_interval() -> u64 {
    30
}
fn default_resolve_interval() -> u64 {
    20
}
fn default_backoff() -> u64 {
    5
}
fn default_sync_timeout() -> u64 {
    2
}
fn default_connect_attempts() -> u32 {
    10
}
fn default_connect_backoff() -> u64 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_port: default_api_port(),
            relay_port: default_relay_port(),
            relay_probe_secs: default_relay_probe(),
            local_scan_interval_secs: default_scan_interval(),
            local_scan_timeout_secs: default_scan_timeout(),
            advertise_interval_secs: default_advertise_interval(),
            resolve_interval_secs: default_resolve_interval(),
            discovery_backoff_secs: default_backoff(),
            sync_timeout_secs: default_sync_timeout(),
            relay_connect_attempts: default_connect_attempts(),
            relay_connect_backoff_secs: default_connect_backoff(),
            overlay_port: 0,
            rendezvous_url: None,
            enable_global: true,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid {name}={value:?}"))
}

impl NodeConfig {
    /// Read `path` if it exists, then apply process environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Override fields from `PORT`, `OXNET_RELAY_PORT`, `OXNET_DATA_DIR` and
    /// `OXNET_RENDEZVOUS_URL`. Empty values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PORT") {
            self.api_port = parse_var("PORT", &v)?;
        }
        if let Some(v) = get("OXNET_RELAY_PORT") {
            self.relay_port = parse_var("OXNET_RELAY_PORT", &v)?;
        }
        if let Some(v) = get("OXNET_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("OXNET_RENDEZVOUS_URL") {
            self.rendezvous_url = Some(v);
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("0xnet.db")
    }

    pub fn relay_probe(&self) -> Duration {
        Duration::from_secs(self.relay_probe_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn local_discovery(&self) -> LocalDiscoveryConfig {
        LocalDiscoveryConfig {
            scan_interval: Duration::from_secs(self.local_scan_interval_secs),
            scan_timeout: Duration::from_secs(self.local_scan_timeout_secs),
        }
    }

    pub fn global_discovery(&self) -> GlobalDiscoveryConfig {
        GlobalDiscoveryConfig {
            advertise_interval: Duration::from_secs(self.advertise_interval_secs),
            resolve_interval: Duration::from_secs(self.resolve_interval_secs),
            backoff: Duration::from_secs(self.discovery_backoff_secs),
            ..Default::default()
        }
    }

    pub fn relay_client(&self) -> RelayClientConfig {
        RelayClientConfig {
            attempts: self.relay_connect_attempts,
            backoff: Duration::from_secs(self.relay_connect_backoff_secs),
        }
    }
}
