//! Engine tunables.
//!
//! Every field has a serde default, so an empty table (or no table at all)
//! yields the production values.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Session number used for every session this engine creates.
pub const DEFAULT_SESSION_NUMBER: u32 = 100;

/// Instances requested per backfill page.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Tag key that marks a target as serving a destination subnet.
pub const DEFAULT_SUBNET_TAG_KEY: &str = "TargetSubnetId";

/// Interface tag whose value selects a classification filter.
pub const DEFAULT_CLASSIFICATION_TAG_KEY: &str = "server_type";

/// Token that starts a backfill walk from the beginning of the inventory.
pub const START_BACKFILL_TOKEN: &str = "StartToken";

/// Bounds the inventory API accepts for a page size.
pub const MIN_PAGE_SIZE: usize = 5;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Engine settings shared by every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Session number passed on every session create
    #[serde(default = "default_session_number")]
    pub session_number: u32,

    /// Instances requested per backfill page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Tag key linking a target to its destination subnet
    #[serde(default = "default_subnet_tag_key")]
    pub subnet_tag_key: String,

    /// Interface tag key read for classification-derived filters
    #[serde(default = "default_classification_tag_key")]
    pub classification_tag_key: String,

    /// Accepted classification values
    #[serde(default = "default_classification_values")]
    pub classification_values: Vec<String>,

    /// Sentinel token that starts a backfill walk
    #[serde(default = "default_start_token")]
    pub start_token: String,

    /// Instance state treated as active
    #[serde(default = "default_running_state")]
    pub running_state: String,

    /// Description attached to targets the engine creates
    #[serde(default = "default_target_description")]
    pub target_description: String,
}

fn default_session_number() -> u32 {
    DEFAULT_SESSION_NUMBER
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_subnet_tag_key() -> String {
    DEFAULT_SUBNET_TAG_KEY.to_string()
}

fn default_classification_tag_key() -> String {
    DEFAULT_CLASSIFICATION_TAG_KEY.to_string()
}

fn default_classification_values() -> Vec<String> {
    vec!["web".to_string(), "app".to_string(), "db".to_string()]
}

fn default_start_token() -> String {
    START_BACKFILL_TOKEN.to_string()
}

fn default_running_state() -> String {
    "running".to_string()
}

fn default_target_description() -> String {
    "Traffic mirror target provisioned by tmirror".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            session_number: default_session_number(),
            page_size: default_page_size(),
            subnet_tag_key: default_subnet_tag_key(),
            classification_tag_key: default_classification_tag_key(),
            classification_values: default_classification_values(),
            start_token: default_start_token(),
            running_state: default_running_state(),
            target_description: default_target_description(),
        }
    }
}

impl EngineSettings {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Whether `value` is one of the accepted classification values.
    pub fn is_classification(&self, value: &str) -> bool {
        self.classification_values.iter().any(|v| v == value)
    }

    /// Validates the settings.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=32766).contains(&self.session_number) {
            return Err(ConfigError::invalid_settings(
                "session_number",
                "must be between 1 and 32766",
            ));
        }

        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(ConfigError::invalid_settings(
                "page_size",
                format!("must be between {} and {}", MIN_PAGE_SIZE, MAX_PAGE_SIZE),
            ));
        }

        for (field, value) in [
            ("subnet_tag_key", &self.subnet_tag_key),
            ("classification_tag_key", &self.classification_tag_key),
            ("start_token", &self.start_token),
            ("running_state", &self.running_state),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid_settings(field, "cannot be empty"));
            }
        }

        if self.classification_values.is_empty()
            || self.classification_values.iter().any(|v| v.trim().is_empty())
        {
            return Err(ConfigError::invalid_settings(
                "classification_values",
                "must list at least one non-empty value",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.session_number, 100);
        assert_eq!(settings.page_size, 200);
        assert_eq!(settings.subnet_tag_key, "TargetSubnetId");
        assert!(settings.is_classification("db"));
        assert!(!settings.is_classification("cache"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings: EngineSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn test_page_size_bounds() {
        assert!(EngineSettings::default().with_page_size(4).validate().is_err());
        assert!(EngineSettings::default().with_page_size(5).validate().is_ok());
        assert!(EngineSettings::default().with_page_size(1001).validate().is_err());
    }

    #[test]
    fn test_empty_classification_values_rejected() {
        let settings = EngineSettings {
            classification_values: vec![],
            ..EngineSettings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("classification_values"));
    }
}
