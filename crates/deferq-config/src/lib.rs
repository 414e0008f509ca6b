//! Configuration for the deferq queue, worker and supervisor.
//!
//! Values come from built-in defaults, an optional TOML file and `DEFERQ_*`
//! environment overrides, in that order.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validator;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{DeferqConfig, LogConfig, LoopStrategyKind, StoreConfig, StoreKind};
pub use validator::{ConfigValidator, ValidationError, ValidationResult, ValidationWarning};
