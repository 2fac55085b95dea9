//! On-disk documents: `setup.json` (read-only), `config.json`, and
//! `auth_tokens.json`.
//!
//! All writes are whole-file replacements; the daemon is the only
//! writer of the config and token files.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;

use bondcast_common::models::{Config, Setup};

/// Paths of the mutable documents, rooted in the config directory.
pub struct Store {
    config_path: PathBuf,
    tokens_path: PathBuf,
}

impl Store {
    pub fn new(dir: &Path) -> Self {
        Self {
            config_path: dir.join("config.json"),
            tokens_path: dir.join("auth_tokens.json"),
        }
    }

    /// Load the read-only appliance description. Missing or malformed
    /// setup is fatal at startup.
    pub fn load_setup(path: &Path) -> anyhow::Result<Setup> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading setup file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load the operator config; a missing file yields the defaults.
    pub fn load_config(&self) -> Config {
        match std::fs::read_to_string(&self.config_path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "config file is malformed, starting from defaults");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    pub fn save_config(&self, config: &Config) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.config_path, json)
            .with_context(|| format!("writing {}", self.config_path.display()))?;
        Ok(())
    }

    /// Load the persistent token set. File format is an object of
    /// token → true.
    pub fn load_tokens(&self) -> HashSet<String> {
        match std::fs::read_to_string(&self.tokens_path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, bool>>(&raw) {
                Ok(map) => map.into_keys().collect(),
                Err(e) => {
                    tracing::error!(error = %e, "token file is malformed, ignoring");
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        }
    }

    pub fn save_tokens(&self, tokens: &HashSet<String>) -> anyhow::Result<()> {
        let map: HashMap<&str, bool> = tokens.iter().map(|t| (t.as_str(), true)).collect();
        let json = serde_json::to_string_pretty(&map)?;
        std::fs::write(&self.tokens_path, json)
            .with_context(|| format!("writing {}", self.tokens_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut config = Config::default();
        config.max_br = Some(4000);
        config.srtla_addr = Some("relay.example.com".into());
        config.password_hash = Some("$argon2id$test".into());
        store.save_config(&config).unwrap();

        let back = store.load_config();
        assert_eq!(back.max_br, Some(4000));
        assert_eq!(back.srtla_addr.as_deref(), Some("relay.example.com"));
        assert_eq!(back.password_hash.as_deref(), Some("$argon2id$test"));
    }

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        let config = store.load_config();
        assert!(config.password_hash.is_none());
        assert!(config.max_br.is_none());
    }

    #[test]
    fn token_file_is_an_object_of_token_to_true() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let tokens: HashSet<String> = ["alpha".to_string(), "beta".to_string()].into();
        store.save_tokens(&tokens).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("auth_tokens.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["alpha"], true);
        assert_eq!(value["beta"], true);

        assert_eq!(store.load_tokens(), tokens);
    }
}
