//! Configuration sources
//!
//! Priority: `--set` flags > environment > config file > built-in defaults.
//! The config file is flat TOML using the same keys as the environment:
//!
//! ```toml
//! FIRST_NODE = true
//! GPU_NODE = false
//! CLUSTER_DISKS = ["/dev/nvme1n1", "/dev/nvme2n1"]
//! DOMAIN = "cluster.example.com"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sprout_provision::config::KEYS;

/// Config path, XDG-style even on macOS
/// Always ~/.config/sprout/node.toml unless `XDG_CONFIG_HOME` says otherwise
pub fn config_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sprout")
        .join("node.toml")
}

/// Read the config file into a key/value map; a missing file is empty
pub fn load_file(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    parse_file(&content).with_context(|| format!("Failed to parse config: {}", path.display()))
}

/// Flatten TOML into strings, the form every other source uses
pub fn parse_file(content: &str) -> Result<BTreeMap<String, String>> {
    let table: toml::Table = toml::from_str(content)?;
    let mut map = BTreeMap::new();
    for (key, value) in table {
        let value = match value {
            toml::Value::String(s) => s,
            toml::Value::Boolean(b) => b.to_string(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(s),
                    other => bail!("{key}: list entries must be strings, got {other}"),
                })
                .collect::<Result<Vec<_>>>()?
                .join(","),
            other => bail!("{key}: unsupported value {other}"),
        };
        map.insert(key.to_ascii_uppercase(), value);
    }
    Ok(map)
}

/// Merge the sources; `env` looks up one variable by name
pub fn resolve(
    file: BTreeMap<String, String>,
    env: impl Fn(&str) -> Option<String>,
    overrides: &[(String, String)],
) -> BTreeMap<String, String> {
    let mut map = file;
    for key in KEYS {
        if let Some(value) = env(key) {
            map.insert((*key).to_string(), value);
        }
    }
    for (key, value) in overrides {
        map.insert(key.to_ascii_uppercase(), value.clone());
    }
    map
}

/// Load and merge every source for this process
pub fn load(config: Option<&Path>, overrides: &[(String, String)]) -> Result<BTreeMap<String, String>> {
    let path = config.map_or_else(config_path, Path::to_path_buf);
    let file = load_file(&path)?;
    Ok(resolve(file, |key| std::env::var(key).ok(), overrides))
}

/// Parse a `KEY=VALUE` command-line override
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
