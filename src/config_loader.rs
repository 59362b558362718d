// Configuration file loader
//
// Exports the keys of a flat TOML file into the environment, where the config
// structures and the validator read them. Variables already set win, so the
// precedence is environment, then file, then compiled defaults.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use toml::Value;

const DEFAULT_CONFIG_FILE: &str = "transcript_jobs.conf";

/// Path of the configuration file, `JOBS_CONFIG_FILE` or the default
pub fn config_path() -> PathBuf {
    env::var("JOBS_CONFIG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Flatten a TOML document into string values.
///
/// Nested tables and arrays are skipped with a warning.
pub fn parse_flat(content: &str) -> Result<BTreeMap<String, String>, toml::de::Error> {
    let table: toml::Table = content.parse()?;
    let mut values = BTreeMap::new();
    for (key, value) in table {
        let value = match value {
            Value::String(s) => s,
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Datetime(d) => d.to_string(),
            Value::Array(_) | Value::Table(_) => {
                warn!("Skipping unsupported TOML value type for key: {}", key);
                continue;
            }
        };
        values.insert(key, value);
    }
    Ok(values)
}

/// Load `path` into the environment.
///
/// Returns the number of variables set, `None` when the file is missing or
/// unreadable.
pub fn load_config_from(path: &Path) -> Option<usize> {
    if !path.exists() {
        debug!("Configuration file not found at: {}", path.display());
        return None;
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read configuration file {}: {}", path.display(), e);
            return None;
        }
    };
    let values = match parse_flat(&content) {
        Ok(values) => values,
        Err(e) => {
            warn!("Failed to parse configuration file {}: {}", path.display(), e);
            return None;
        }
    };

    let mut exported = 0;
    for (key, value) in values {
        if env::var_os(&key).is_some() {
            debug!("{} set in the environment, ignoring file value", key);
            continue;
        }
        env::set_var(&key, value);
        exported += 1;
    }
    info!(
        "Configuration loaded from {} ({} values)",
        path.display(),
        exported
    );
    Some(exported)
}

/// Load the configuration file at [`config_path`]
pub fn load_config() -> bool {
    load_config_from(&config_path()).is_some()
}
