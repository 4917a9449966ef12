// Prompt Log Configuration
//
// Loaded from JSON. Store identity is validated at init; partition sizing
// has defaults matching the backing store's practical cell limits.

use serde::{Deserialize, Serialize};

use crate::error::LogError;

pub const DEFAULT_PARTITION_CAPACITY: usize = 2000;
pub const DEFAULT_MAX_FIELD_CHARS: usize = 50_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub partitions: PartitionConfig,
}

/// Identity of the backing store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store identifier (spreadsheet id, file path, ...).
    pub target: Option<String>,

    /// Opaque credential blob handed to the store client.
    pub credentials: Option<String>,

    /// Stores that need no credentials (local files, in-memory).
    #[serde(default)]
    pub anonymous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Data rows per partition before rotation.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Free-text fields are cut to this many characters.
    #[serde(default = "default_max_field_chars")]
    pub max_field_chars: usize,

    /// Apply presentational formatting to new partitions.
    #[serde(default = "default_format")]
    pub format: bool,
}

fn default_capacity() -> usize {
    DEFAULT_PARTITION_CAPACITY
}

fn default_max_field_chars() -> usize {
    DEFAULT_MAX_FIELD_CHARS
}

fn default_format() -> bool {
    true
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_PARTITION_CAPACITY,
            max_field_chars: DEFAULT_MAX_FIELD_CHARS,
            format: true,
        }
    }
}

impl LogConfig {
    /// Config for a store that needs no credentials.
    pub fn anonymous(target: impl Into<String>) -> Self {
        Self {
            store: StoreConfig {
                target: Some(target.into()),
                credentials: None,
                anonymous: true,
            },
            partitions: PartitionConfig::default(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.partitions.capacity = capacity;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, LogError> {
        serde_json::from_str(json).map_err(|e| LogError::Config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> Result<(), LogError> {
        let missing = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());

        if missing(&self.store.target) {
            return Err(LogError::Config("missing store target".into()));
        }
        if !self.store.anonymous && missing(&self.store.credentials) {
            return Err(LogError::Config("missing store credentials".into()));
        }
        if self.partitions.capacity == 0 {
            return Err(LogError::Config("partition capacity must be positive".into()));
        }
        if self.partitions.max_field_chars == 0 {
            return Err(LogError::Config("max_field_chars must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_partial_json() {
        let config = LogConfig::from_json(
            r#"{ "store": { "target": "sheet-1", "credentials": "abc" }, "partitions": { "capacity": 10 } }"#,
        )
        .unwrap();

        assert_eq!(config.partitions.capacity, 10);
        assert_eq!(config.partitions.max_field_chars, DEFAULT_MAX_FIELD_CHARS);
        assert!(config.partitions.format);
        config.validate().unwrap();
    }

    #[test]
    fn missing_credentials_is_a_config_error() {
        let config = LogConfig::from_json(r#"{ "store": { "target": "sheet-1" } }"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, LogError::Config(msg) if msg.contains("credentials")));
    }

    #[test]
    fn anonymous_store_needs_only_a_target() {
        LogConfig::anonymous("log.json").validate().unwrap();

        let err = LogConfig::default().validate().unwrap_err();
        assert!(matches!(err, LogError::Config(msg) if msg.contains("target")));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = LogConfig::anonymous("x").with_capacity(0).validate().unwrap_err();
        assert!(matches!(err, LogError::Config(_)));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(LogConfig::from_json("{"), Err(LogError::Config(_))));
    }
}
