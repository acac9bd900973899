use log::info;
use std::{env, fmt::Display, str::FromStr, time::Duration};

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub public_url: Option<String>,
    pub sweep_interval: Duration,
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: None,
            public_url: None,
            sweep_interval: Duration::from_secs(60),
            history_limit: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    // Separated from the process environment so tests can feed values in
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let sweep_secs: u64 = try_load(&lookup, "SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?;
        if sweep_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_INTERVAL_SECS",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            port: try_load(&lookup, "PORT", defaults.port)?,
            database_url: optional(&lookup, "DATABASE_URL"),
            public_url: optional(&lookup, "PUBLIC_URL").map(|url| url.trim_end_matches('/').to_string()),
            sweep_interval: Duration::from_secs(sweep_secs),
            history_limit: try_load(&lookup, "HISTORY_LIMIT", defaults.history_limit)?,
        })
    }
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn try_load<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match optional(lookup, key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.history_limit, 100);
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("PORT", "8080"),
            ("DATABASE_URL", "sqlite:polls.db"),
            ("PUBLIC_URL", "https://polls.example.com/"),
            ("SWEEP_INTERVAL_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url.as_deref(), Some("sqlite:polls.db"));
        assert_eq!(config.public_url.as_deref(), Some("https://polls.example.com"));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            load(&[("PORT", "eighty")]),
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));
        assert!(load(&[("SWEEP_INTERVAL_SECS", "0")]).is_err());
    }
}
