use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub admin_password: String,
    pub persist_path: Option<PathBuf>,
    pub max_commit_retries: u32,
    pub allow_draw_seed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            admin_password: "changeme".to_string(),
            persist_path: None,
            max_commit_retries: 5,
            allow_draw_seed: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("BIND_ADDR") {
            config.bind_addr = parse("BIND_ADDR", value)?;
        }
        if let Some(value) = lookup("ADMIN_PASSWORD") {
            config.admin_password = value;
        }
        if let Some(value) = lookup("PERSIST_PATH").filter(|v| !v.trim().is_empty()) {
            config.persist_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("MAX_COMMIT_RETRIES") {
            config.max_commit_retries = parse("MAX_COMMIT_RETRIES", value)?;
        }
        if let Some(value) = lookup("ALLOW_DRAW_SEED") {
            config.allow_draw_seed = parse_flag("ALLOW_DRAW_SEED", value)?;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.admin_password, "changeme");
        assert!(config.persist_path.is_none());
        assert_eq!(config.max_commit_retries, 5);
        assert!(!config.allow_draw_seed);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("ADMIN_PASSWORD", "rudolph"),
            ("PERSIST_PATH", "/tmp/groups.json"),
            ("MAX_COMMIT_RETRIES", "9"),
            ("ALLOW_DRAW_SEED", "yes"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.admin_password, "rudolph");
        assert_eq!(config.persist_path, Some(PathBuf::from("/tmp/groups.json")));
        assert_eq!(config.max_commit_retries, 9);
        assert!(config.allow_draw_seed);
    }

    #[test]
    fn rejects_garbage() {
        let err = Config::from_lookup(lookup(&[("MAX_COMMIT_RETRIES", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "MAX_COMMIT_RETRIES",
                value: "lots".into()
            }
        );
        assert!(Config::from_lookup(lookup(&[("ALLOW_DRAW_SEED", "maybe")])).is_err());
    }
}
