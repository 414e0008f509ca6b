//! Task entry definition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Current on-disk record version.
pub const SCHEMA_VERSION: u32 = 1;

/// Most urgent priority.
pub const TOP_PRIORITY: u8 = 1;

/// Least urgent priority; retries never degrade past it.
pub const LOWEST_PRIORITY: u8 = 10;

/// Priority used when the caller does not choose one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Operation tag used when the caller does not supply one.
pub const DEFAULT_TAG: &str = "generic";

/// Extension of every committed record.
pub const ENTRY_EXTENSION: &str = "json";

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Record schema version.
    pub version: u32,
    /// Globally comparable submission identifier.
    pub sequence: String,
    /// 1 (most urgent) to 10.
    pub priority: u8,
    /// Statements to execute against the store.
    pub payload: String,
    /// Free-form classification for logs and metrics.
    pub operation_tag: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl TaskEntry {
    /// Create a new entry.
    pub fn new(
        sequence: impl Into<String>,
        priority: u8,
        payload: impl Into<String>,
        operation_tag: impl Into<String>,
    ) -> Self {
        Self {
            version: SCHEMA_VERSION,
            sequence: sequence.into(),
            priority,
            payload: payload.into(),
            operation_tag: operation_tag.into(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            failed_at: None,
        }
    }

    /// Set metadata.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Storage key: lexicographic order equals execution order.
    pub fn file_name(&self) -> String {
        format!("{:02}_{}.{}", self.priority, self.sequence, ENTRY_EXTENSION)
    }

    /// Move one level towards [`LOWEST_PRIORITY`].
    pub fn degrade_priority(&mut self) {
        self.priority = (self.priority + 1).min(LOWEST_PRIORITY);
    }

    /// Record a failure annotation.
    pub fn annotate_failure(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
        self.failed_at = Some(Utc::now());
    }

    /// Clear retry state for an operator replay.
    pub fn reset_for_replay(&mut self) {
        self.retry_count = 0;
        self.last_error = None;
        self.failed_at = None;
    }

    /// Check that `priority` is in range.
    pub fn validate_priority(priority: u8) -> Result<(), QueueError> {
        if (TOP_PRIORITY..=LOWEST_PRIORITY).contains(&priority) {
            Ok(())
        } else {
            Err(QueueError::InvalidArgument(format!(
                "priority must be in {}..={}, got {}",
                TOP_PRIORITY, LOWEST_PRIORITY, priority
            )))
        }
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| QueueError::corrupt(self.file_name(), e.to_string()))
    }

    /// Parse and validate a stored record.
    pub fn from_json(name: &str, bytes: &[u8]) -> Result<Self, QueueError> {
        let entry: TaskEntry =
            serde_json::from_slice(bytes).map_err(|e| QueueError::corrupt(name, e.to_string()))?;

        if entry.version != SCHEMA_VERSION {
            return Err(QueueError::corrupt(
                name,
                format!("unsupported schema version {}", entry.version),
            ));
        }
        if entry.sequence.is_empty() {
            return Err(QueueError::corrupt(name, "empty sequence"));
        }
        if entry.payload.trim().is_empty() {
            return Err(QueueError::corrupt(name, "empty payload"));
        }
        Self::validate_priority(entry.priority)
            .map_err(|e| QueueError::corrupt(name, e.to_string()))?;

        Ok(entry)
    }
}

/// Split `{priority:02}_{sequence}.json` into its parts.
pub fn parse_file_name(name: &str) -> Option<(u8, &str)> {
    let stem = name.strip_suffix(".json")?;
    let (priority, sequence) = stem.split_once('_')?;
    let priority = priority.parse::<u8>().ok()?;
    if sequence.is_empty() {
        return None;
    }
    Some((priority, sequence))
}
