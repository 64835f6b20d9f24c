use std::{collections::HashMap, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;

/// Period of the collector tick.
pub const GC_INTERVAL: Duration = Duration::from_secs(30);
/// How long a record's process tree must have been gone before the sweep
/// may remove it.
pub const STALE_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// String-keyed configuration handed down by the embedding agent.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(key.into(), value.into())
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns a typed configuration value, falling back to `default`
    /// when the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Ok(default),
            Some(value) => parse(value, config_name),
        }
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

pub const DEFAULT_CACHE_SIZE: usize = 65536;

/// Runtime configuration of the process cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of the record store. Must be positive.
    pub cache_size: usize,
    /// Minutes between stale sweeps. Zero disables the sweep.
    pub stale_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            stale_interval: 0,
        }
    }
}

impl CacheConfig {
    pub fn with_size(cache_size: usize) -> Self {
        Self {
            cache_size,
            ..Default::default()
        }
    }
}

impl TryFrom<&ModuleConfig> for CacheConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            cache_size: config.with_default("process_cache_size", DEFAULT_CACHE_SIZE)?,
            stale_interval: config.with_default("process_cache_stale_interval", 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_fields_missing() {
        let config = CacheConfig::try_from(&ModuleConfig::default()).unwrap();
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.stale_interval, 0);
    }

    #[test]
    fn typed_fields_parse() {
        let mut raw = ModuleConfig::default();
        raw.insert("process_cache_size", "128");
        raw.insert("process_cache_stale_interval", "5");
        let config = CacheConfig::try_from(&raw).unwrap();
        assert_eq!(config.cache_size, 128);
        assert_eq!(config.stale_interval, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut raw = ModuleConfig::default();
        raw.insert("process_cache_size", "not-a-number");
        let err = CacheConfig::try_from(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "process_cache_size"));
    }

    #[test]
    fn required_reports_missing_fields() {
        let raw = ModuleConfig::default();
        let err = raw.required::<usize>("process_cache_size").unwrap_err();
        assert!(matches!(err, ConfigError::RequiredValue { field } if field == "process_cache_size"));
    }
}
