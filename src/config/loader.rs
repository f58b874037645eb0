use std::path::Path;

use anyhow::{Context, Result};

use super::types::Config;

/// File looked up in the working directory when no path is given.
pub const CONFIG_FILE: &str = ".pipexrc";

/// Load `.pipexrc` from `dir`, or defaults if there is none.
pub fn load(dir: &Path) -> Result<Config> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Config::default());
    }
    load_file(&path)
}

/// Load a config file that must exist.
pub fn load_file(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("invalid config {}", path.display()))
}
