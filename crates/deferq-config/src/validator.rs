//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::{DeferqConfig, StoreKind};

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Collapse into a single error carrying every error message.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        if self.is_valid() {
            return Ok(self.warnings);
        }
        let joined = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.path, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ConfigError::Invalid(joined))
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &DeferqConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_worker(config, &mut result);
        Self::validate_liveness(config, &mut result);
        Self::validate_store(config, &mut result);

        result
    }

    fn validate_worker(config: &DeferqConfig, result: &mut ValidationResult) {
        if config.base_dir.as_os_str().is_empty() {
            result.add_error(ValidationError::new("base_dir", "base_dir cannot be empty"));
        }

        if config.batch_size == 0 {
            result.add_error(ValidationError::new(
                "batch_size",
                "batch_size must be greater than 0",
            ));
        }

        if config.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "poll_interval_ms",
                "poll_interval_ms must be greater than 0",
            ));
        }

        if config.max_retries == 0 {
            result.add_error(ValidationError::new(
                "max_retries",
                "max_retries must be at least 1",
            ));
        }

        if config.maintenance_every == 0 {
            result.add_error(ValidationError::new(
                "maintenance_every",
                "maintenance_every must be greater than 0",
            ));
        }

        if config.processing_timeout_secs == 0 {
            result.add_error(ValidationError::new(
                "processing_timeout_secs",
                "processing_timeout_secs must be greater than 0",
            ));
        }

        if config.batch_size > 1000 {
            result.add_warning(ValidationWarning::new(
                "batch_size",
                "batch_size is very high (>1000), a single store transaction may run long",
            ));
        }
    }

    fn validate_liveness(config: &DeferqConfig, result: &mut ValidationResult) {
        if config.heartbeat_interval_secs == 0 {
            result.add_error(ValidationError::new(
                "heartbeat_interval_secs",
                "heartbeat_interval_secs must be greater than 0",
            ));
        }

        if config.heartbeat_timeout_secs <= config.heartbeat_interval_secs {
            result.add_error(ValidationError::new(
                "heartbeat_timeout_secs",
                "heartbeat_timeout_secs must exceed heartbeat_interval_secs",
            ));
        }

        if config.startup_wait_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                "startup_wait_timeout_ms",
                "startup_wait_timeout_ms must be greater than 0",
            ));
        }
    }

    fn validate_store(config: &DeferqConfig, result: &mut ValidationResult) {
        if config.store.timeout_secs == 0 {
            result.add_error(ValidationError::new(
                "store.timeout_secs",
                "store.timeout_secs must be greater than 0",
            ));
        }

        if config.store.kind == StoreKind::Command {
            let missing = config
                .store
                .command
                .as_deref()
                .map(|c| c.trim().is_empty())
                .unwrap_or(true);
            if missing {
                result.add_error(ValidationError::new(
                    "store.command",
                    "store.command is required when store.kind = \"command\"",
                ));
            }
        }
    }
}
