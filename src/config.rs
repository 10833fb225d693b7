//! A thin per-server TOML profile file, grounded in `octofhir-cli`'s
//! `config.rs`. CLI flags always win over anything stored here; this exists
//! so `--since-mode` and the Epic-server hint don't need to be retyped every
//! run.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct ProfileConfig {
    pub fhir_url: Option<String>,
    pub since_mode: Option<String>,
    /// Hints that the server is Epic, which doesn't support `_since` /
    /// last-modified search the way the default `updated` since-mode needs,
    /// and doesn't support three of the default Observation categories.
    #[serde(default)]
    pub epic: bool,
}

pub type ConfigFile = HashMap<String, ProfileConfig>;

fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("Cannot determine config directory")?
        .join("smart-fetch");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn load_all() -> Result<ConfigFile> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(ConfigFile::new());
    }
    let content = fs::read_to_string(&path)?;
    let cfg: ConfigFile = toml::from_str(&content)?;
    Ok(cfg)
}

pub fn load_profile(profile: &str) -> Result<ProfileConfig> {
    let all = load_all()?;
    Ok(all.into_iter().find(|(k, _)| k == profile).map(|(_, v)| v).unwrap_or_default())
}

pub fn save_profile(profile: &str, config: ProfileConfig) -> Result<()> {
    let mut all = load_all()?;
    all.insert(profile.to_string(), config);
    let content = toml::to_string_pretty(&all)?;
    fs::write(config_path()?, content)?;
    Ok(())
}
