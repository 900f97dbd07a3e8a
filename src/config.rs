//! Layered daemon configuration.
//!
//! Precedence, lowest to highest: built-in defaults, `wipd.toml`,
//! `WIPD_`-prefixed environment variables, CLI arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "wipd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root of the asset tree (`sbi/`, `drivers/`, `updates/`, `postdeploy/`).
    pub assets_root: PathBuf,
    /// Directory of device profile JSON files.
    pub devices_dir: PathBuf,
    /// Scratch space for the working copy of the base image.
    pub temp_dir: PathBuf,
    /// Mount point root; slot directories are created beneath it.
    pub mount_dir: PathBuf,
    /// Destination for exported images.
    pub export_dir: PathBuf,
    pub database_path: PathBuf,
    /// External imaging tool executable.
    pub dism_path: String,
    /// Path inside the image for staged post-deployment payloads.
    pub payload_dir: String,
    /// Independent mount slots; 1 unless the host really has more.
    pub mount_slots: usize,
    pub stage_timeout_secs: u64,
    pub queue_capacity: usize,
    pub live_log_capacity: usize,
    pub heartbeat_secs: u64,
    /// Minimum plausible base image size; smaller files fail validation.
    pub min_image_bytes: u64,
    pub http_bind: SocketAddr,
    /// Run against the simulated imaging tool instead of DISM.
    pub simulation: bool,
    pub verbose: bool,
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            assets_root: PathBuf::from("assets"),
            devices_dir: PathBuf::from("config/devices"),
            temp_dir: PathBuf::from("runtime/temp"),
            mount_dir: PathBuf::from("runtime/mount"),
            export_dir: PathBuf::from("runtime/export"),
            database_path: PathBuf::from("runtime/data/wipd.db"),
            dism_path: "dism.exe".to_string(),
            payload_dir: "Users/Public/Postdeploy".to_string(),
            mount_slots: 1,
            stage_timeout_secs: 3600,
            queue_capacity: 64,
            live_log_capacity: 200,
            heartbeat_secs: 30,
            min_image_bytes: 100 * 1024 * 1024,
            http_bind: "127.0.0.1:8418".parse().expect("valid default bind"),
            simulation: false,
            verbose: false,
            log_json: false,
        }
    }
}

impl AppConfig {
    pub fn new<A: Serialize>(cli_args: Option<&A>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed("WIPD_"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment.extract().context("invalid configuration")
    }

    /// Create the runtime directories the pipeline writes into.
    pub fn ensure_runtime_dirs(&self) -> Result<()> {
        for dir in [&self.temp_dir, &self.mount_dir, &self.export_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}
