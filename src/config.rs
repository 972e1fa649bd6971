use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::classifier::MAX_UPLOAD_BYTES;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "EQ_STUDIO_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "eq-studio.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_templates")]
    pub templates: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Sleep 1..3 s per request like a real analysis pipeline would
    #[serde(default = "default_simulate_latency")]
    pub simulate_latency: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// Output device name filter, default device when unset
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub output_gain_db: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            templates: default_templates(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            simulate_latency: default_simulate_latency(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            tick_interval_ms: default_tick_interval_ms(),
            output_gain_db: 0.0,
        }
    }
}

fn default_bind() -> String { "127.0.0.1:9000".into() }
fn default_templates() -> String { "templates/**/*".into() }
fn default_max_upload_bytes() -> u64 { MAX_UPLOAD_BYTES }
fn default_simulate_latency() -> bool { true }
fn default_tick_interval_ms() -> u64 { 16 }

pub fn load_config(path: &Path) -> Result<Config, anyhow::Error> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

/// `$EQ_STUDIO_CONFIG`, else `./eq-studio.toml` when present, else defaults.
pub fn resolve_config() -> Result<Config, anyhow::Error> {
    let path = match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !local.exists() {
                info!("No config file, using defaults");
                return Ok(Config::default());
            }
            local
        }
    };
    info!(path = %path.display(), "Loading config");
    load_config(&path)
}
