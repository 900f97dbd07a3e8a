//! Device profile registry.
//!
//! Profiles are read-only JSON descriptors, one file per device, loaded from
//! the configured directory. The registry never writes them back.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsSupport {
    pub os_id: u32,
    #[serde(default)]
    pub driver_family_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub device_id: String,
    #[serde(default)]
    pub os_support: Vec<OsSupport>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DeviceProfile {
    pub fn supports(&self, os_id: u32) -> bool {
        self.os_support.iter().any(|o| o.os_id == os_id)
    }

    pub fn supported_os_ids(&self) -> Vec<u32> {
        self.os_support.iter().map(|o| o.os_id).collect()
    }

    pub fn driver_families_for(&self, os_id: u32) -> &[u32] {
        self.os_support
            .iter()
            .find(|o| o.os_id == os_id)
            .map(|o| o.driver_family_ids.as_slice())
            .unwrap_or(&[])
    }
}

pub struct DeviceRegistry {
    profiles: BTreeMap<String, DeviceProfile>,
}

impl DeviceRegistry {
    /// Load every `*.json` profile under `dir`. A malformed profile is
    /// skipped with a warning rather than taking the daemon down.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut profiles = BTreeMap::new();

        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "device profile directory missing");
            return Ok(Self { profiles });
        }

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read device directory {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match Self::load_profile(&path) {
                Ok(profile) => {
                    profiles.insert(profile.device_id.clone(), profile);
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping device profile");
                }
            }
        }

        tracing::info!(count = profiles.len(), "device profiles loaded");
        Ok(Self { profiles })
    }

    fn load_profile(path: &Path) -> Result<DeviceProfile> {
        let raw = std::fs::read_to_string(path)?;
        let profile: DeviceProfile = serde_json::from_str(&raw)?;
        anyhow::ensure!(
            !profile.device_id.trim().is_empty(),
            "deviceId must not be empty"
        );
        Ok(profile)
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceProfile> {
        self.profiles.get(device_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &DeviceProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
