//! In-memory, config-backed collaborator stores.
//!
//! Root key material and KEKs come from the `[[devices]]`/`[[keks]]`
//! config tables. The per-device join-nonce lives here: each served
//! activation reads the current value and advances the counter, so the
//! core always sees a monotonically fresh nonce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::Config;
use crate::joinserver::{DeviceKeys, DeviceStore, StoreError};
use crate::lorawan::keys::{Aes128Key, Eui64, NetId};

struct DeviceEntry {
    nwk_key: Aes128Key,
    app_key: Aes128Key,
    home_net_id: NetId,
    as_kek_label: Option<String>,
    join_nonce: AtomicU32,
}

pub struct ConfigStore {
    devices: HashMap<Eui64, DeviceEntry>,
    keks: HashMap<String, Vec<u8>>,
}

impl ConfigStore {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut devices = HashMap::new();
        for device in &config.devices {
            devices.insert(
                device.dev_eui,
                DeviceEntry {
                    nwk_key: device.nwk_key,
                    // Unused on the legacy path; zero when unprovisioned.
                    app_key: device.app_key.unwrap_or_default(),
                    home_net_id: device.home_net_id,
                    as_kek_label: device.as_kek_label.clone(),
                    join_nonce: AtomicU32::new(device.join_nonce),
                },
            );
        }

        let mut keks = HashMap::new();
        for kek in &config.keks {
            let bytes = hex::decode(&kek.kek)
                .map_err(|e| anyhow::anyhow!("Invalid KEK hex for label {:?}: {}", kek.label, e))?;
            keks.insert(kek.label.clone(), bytes);
        }

        Ok(ConfigStore { devices, keks })
    }
}

impl DeviceStore for ConfigStore {
    fn device_keys(&self, dev_eui: &Eui64) -> Result<Option<DeviceKeys>, StoreError> {
        Ok(self.devices.get(dev_eui).map(|entry| DeviceKeys {
            dev_eui: *dev_eui,
            nwk_key: entry.nwk_key,
            app_key: entry.app_key,
            join_nonce: entry.join_nonce.fetch_add(1, Ordering::Relaxed),
        }))
    }

    fn kek(&self, label: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.keks.get(label).cloned())
    }

    fn app_s_kek_label(&self, dev_eui: &Eui64) -> Result<Option<String>, StoreError> {
        Ok(self
            .devices
            .get(dev_eui)
            .and_then(|entry| entry.as_kek_label.clone()))
    }

    fn home_net_id(&self, dev_eui: &Eui64) -> Result<Option<NetId>, StoreError> {
        Ok(self.devices.get(dev_eui).map(|entry| entry.home_net_id))
    }
}
