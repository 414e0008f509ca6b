//! Configuration loader.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::schema::DeferqConfig;
use crate::validator::ConfigValidator;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "DEFERQ_";

/// Configuration loader with environment variable substitution and overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<DeferqConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<DeferqConfig, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let mut config: DeferqConfig = toml::from_str(&expanded)?;
        config.base_dir = Self::expand_path(&config.base_dir);
        Ok(config)
    }

    /// Resolve the effective configuration: defaults, then the optional file,
    /// then `DEFERQ_*` overrides from the process environment. The result is
    /// validated; warnings are left to the caller to report.
    pub fn resolve(path: Option<&Path>) -> Result<DeferqConfig, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => DeferqConfig::default(),
        };
        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        ConfigValidator::validate(&config).into_result()?;
        Ok(config)
    }

    /// Apply `DEFERQ_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(config: &mut DeferqConfig, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("BASE_DIR") {
            config.base_dir = Self::expand_path(Path::new(&v));
        }
        override_parsed(&var, "BATCH_SIZE", &mut config.batch_size)?;
        override_parsed(&var, "POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        override_parsed(&var, "IDLE_EXIT_SECS", &mut config.idle_exit_secs)?;
        override_parsed(&var, "MAX_RETRIES", &mut config.max_retries)?;
        override_parsed(&var, "RETRY_BASE_DELAY_MS", &mut config.retry_base_delay_ms)?;
        override_parsed(&var, "PROCESSING_TIMEOUT_SECS", &mut config.processing_timeout_secs)?;
        override_parsed(&var, "MAINTENANCE_EVERY", &mut config.maintenance_every)?;
        override_parsed(&var, "HEARTBEAT_INTERVAL_SECS", &mut config.heartbeat_interval_secs)?;
        override_parsed(&var, "HEARTBEAT_TIMEOUT_SECS", &mut config.heartbeat_timeout_secs)?;
        override_parsed(&var, "HEALTH_CACHE_TTL_SECS", &mut config.health_cache_ttl_secs)?;
        override_parsed(&var, "STARTUP_LOCK_TIMEOUT_SECS", &mut config.startup_lock_timeout_secs)?;
        override_parsed(&var, "STARTUP_WAIT_TIMEOUT_MS", &mut config.startup_wait_timeout_ms)?;
        override_parsed(&var, "SEQUENCE_LOCK_TIMEOUT_MS", &mut config.sequence_lock_timeout_ms)?;
        override_parsed(&var, "EVENT_READ_TIMEOUT_SECS", &mut config.event_read_timeout_secs)?;
        override_parsed(&var, "MAX_WATCHER_RESTARTS", &mut config.max_watcher_restarts)?;
        override_parsed(&var, "LOOP_STRATEGY", &mut config.loop_strategy)?;
        override_parsed(&var, "COMPLETED_RETENTION_SECS", &mut config.completed_retention_secs)?;
        override_parsed(&var, "FAILED_RETENTION_SECS", &mut config.failed_retention_secs)?;
        override_parsed(&var, "DURABLE_WRITES", &mut config.durable_writes)?;
        override_parsed(&var, "STORE_KIND", &mut config.store.kind)?;
        override_parsed(&var, "STORE_TIMEOUT_SECS", &mut config.store.timeout_secs)?;
        if let Some(v) = var("STORE_DATABASE") {
            config.store.database = Some(Self::expand_path(Path::new(&v)));
        }
        if let Some(v) = var("STORE_COMMAND") {
            config.store.command = Some(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            config.log.level = v;
        }

        Ok(())
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let mut result = content.to_string();
        let re = regex::Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.deferq`).
    pub fn expand_path(path: &Path) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
    }
}

fn override_parsed<T, F>(var: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = raw.trim().parse::<T>().map_err(|e| {
            ConfigError::invalid_value(format!("{}{}", ENV_PREFIX, name), e.to_string())
        })?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "loader_tests.rs"]
mod tests;
