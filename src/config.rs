use serde::Deserialize;
use std::path::Path;

use crate::lorawan::keys::{Aes128Key, Eui64, NetId};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub http: HttpConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub keks: Vec<KekConfig>,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// One provisioned device.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub dev_eui: Eui64,
    pub nwk_key: Aes128Key,
    /// Root application key; only 1.1 devices need it (the legacy
    /// hierarchy derives everything from nwk_key).
    #[serde(default)]
    pub app_key: Option<Aes128Key>,
    pub home_net_id: NetId,
    /// KEK label protecting the AppSKey toward the application server.
    #[serde(default)]
    pub as_kek_label: Option<String>,
    /// Starting join-nonce; advanced on every served activation.
    #[serde(default)]
    pub join_nonce: u32,
}

/// A named key-encryption-key. The key is hex, 16/24/32 bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct KekConfig {
    pub label: String,
    pub kek: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig {
                bind: "0.0.0.0:8003".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            devices: Vec::new(),
            keks: Vec::new(),
        }
    }
}
