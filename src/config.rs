//! TOML-backed server configuration.
//!
//! Loaded once at startup and handed around as `Arc<Config>`. Values
//! absent from the file fall back to the documented defaults below;
//! composed-required fields (like `cron_time` when `mode = "cron"`) are
//! validated once at load time rather than deferred to first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// `pyfsd.client.*` - the runtime config every accepted connection reads
/// from (`Shared::config` in `session.rs`/`server.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub motd: Vec<String>,
    /// Charset name the MOTD lines are assumed to be written in. Stored
    /// for parity with the documented config surface; this port treats
    /// the wire as opaque bytes end-to-end, so only `UTF-8` is actually
    /// exercised.
    #[serde(default = "default_motd_encoding")]
    pub motd_encoding: String,
}

fn default_port() -> u16 {
    6809
}

fn default_motd_encoding() -> String {
    "UTF-8".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            blacklist: Vec::new(),
            motd: Vec::new(),
            motd_encoding: default_motd_encoding(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetarConfig {
    #[serde(default = "default_metar_mode")]
    pub mode: String,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub fetchers: Vec<String>,
    #[serde(default)]
    pub cron_time: Option<u64>,
    #[serde(default)]
    pub skip_previous_fetcher: bool,
}

fn default_metar_mode() -> String {
    "once".to_string()
}

impl Default for MetarConfig {
    fn default() -> Self {
        Self {
            mode: default_metar_mode(),
            fallback: None,
            fetchers: vec!["NOAA".to_string()],
            cron_time: None,
            skip_previous_fetcher: false,
        }
    }
}

/// The `pyfsd.*` subtree: `database`, `client` (the accept-loop/session
/// config, named `client` per the documented surface even though the Rust
/// type is [`ServerConfig`]), and `metar`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PyfsdConfig {
    #[serde(rename = "client", default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metar: MetarConfig,
}

/// Root of the TOML config file: the `pyfsd.*` surface plus `plugin.<name>.*`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub pyfsd: PyfsdConfig,
    /// Per-plugin config subtrees, keyed by `plugin_name` - each plugin
    /// only ever sees the one entry matching its own name.
    #[serde(default)]
    pub plugin: HashMap<String, toml::Table>,
}

impl Config {
    pub fn server(&self) -> &ServerConfig {
        &self.pyfsd.server
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.pyfsd.database
    }

    pub fn metar(&self) -> &MetarConfig {
        &self.pyfsd.metar
    }

    /// The config subtree a plugin named `name` should be handed, or an
    /// empty table if the operator supplied none.
    pub fn plugin_config(&self, name: &str) -> toml::Table {
        self.plugin.get(name).cloned().unwrap_or_default()
    }
    /// Load and validate config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file (atomic: write to `.tmp` then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, &contents)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", tmp_path, path))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let metar = &self.pyfsd.metar;
        let cron_participates = metar.mode == "cron" || metar.fallback.as_deref() == Some("cron");
        if cron_participates && metar.cron_time.is_none() {
            bail!("pyfsd.metar.cron_time is required when cron mode participates");
        }
        if metar.mode == "once"
            && metar.fallback.as_deref() == Some("cron")
            && metar.skip_previous_fetcher
            && metar.cron_time.is_none()
        {
            bail!("pyfsd.metar.cron_time is required for once/cron fallback composition");
        }
        Ok(())
    }
}

/// Resolve the server config file path.
///
/// Priority:
/// 1. `FSDD_CONFIG` env var
/// 2. `/etc/fsdd/fsdd.toml` (production/staging)
/// 3. `./fsdd.toml` (development)
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FSDD_CONFIG") {
        return PathBuf::from(path);
    }

    match std::env::var("FSDD_ENV").as_deref() {
        Ok("production") | Ok("staging") => PathBuf::from("/etc/fsdd/fsdd.toml"),
        _ => PathBuf::from("./fsdd.toml"),
    }
}
