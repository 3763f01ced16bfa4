//! Error types for engine operations.
//!
//! Failures are grouped by how far they reach:
//!
//! | Error | Scope | Handling |
//! |-------|-------|----------|
//! | [`ConfigError`] | process | fatal at load, nothing is served |
//! | [`EventError::Unsupported`] | one trigger | logged and ignored |
//! | [`ProvisionError`] | one interface | logged, siblings continue |
//! | [`BackfillError`] | one page | surfaced so the message is redelivered |
//!
//! A missing policy match is not an error; see
//! [`InterfaceOutcome::NoPolicyMatch`](crate::engine::InterfaceOutcome::NoPolicyMatch).

use std::io;
use thiserror::Error;

use crate::acquisition::AcquisitionError;
use crate::control_plane::ControlPlaneError;
use crate::messaging::PublishError;

/// Result type alias for policy and settings loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Invalid policy document or settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The policy file could not be read.
    #[error("Failed to read policy document '{path}': {source}")]
    Read {
        /// Path of the policy document.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The policy document is not well-formed YAML of the expected shape.
    #[error("Failed to parse policy document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A policy entry failed validation.
    #[error("Invalid {section} policy #{index}: {message}")]
    InvalidPolicy {
        /// Document section (`tags`, `subnets`, `networks`).
        section: &'static str,
        /// Zero-based position within the section.
        index: usize,
        /// What is wrong with the entry.
        message: String,
    },

    /// The document defines no policies at all.
    #[error("Policy document defines no tag, subnet or network policies")]
    Empty,

    /// An engine setting is out of range.
    #[error("Invalid engine setting {field}: {message}")]
    InvalidSettings {
        /// The offending field.
        field: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    pub fn invalid_policy(section: &'static str, index: usize, message: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            section,
            index,
            message: message.into(),
        }
    }

    pub fn invalid_settings(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSettings {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Per-interface provisioning failures.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The filter could not be derived for the interface.
    #[error("Invalid filter reference for {interface_id}: {reason}")]
    InvalidFilterReference {
        /// Source interface.
        interface_id: String,
        /// Why no filter could be chosen.
        reason: String,
    },

    /// No usable target could be acquired, or the rotated target was also full.
    #[error("Target acquisition failed for {interface_id}: {source}")]
    AcquisitionFailed {
        /// Source interface.
        interface_id: String,
        /// What went wrong in the acquisition state machine.
        #[source]
        source: AcquisitionError,
    },

    /// A target pinned by policy has no session capacity left.
    #[error("Pinned target {target_id} has no capacity for {interface_id}")]
    CapacityExceeded {
        /// Source interface.
        interface_id: String,
        /// The exhausted target.
        target_id: String,
    },

    /// Any other control-plane failure.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

impl ProvisionError {
    pub fn invalid_filter(interface_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilterReference {
            interface_id: interface_id.into(),
            reason: reason.into(),
        }
    }

    pub fn acquisition_failed(interface_id: impl Into<String>, source: AcquisitionError) -> Self {
        Self::AcquisitionFailed {
            interface_id: interface_id.into(),
            source,
        }
    }
}

/// Trigger payloads that cannot be turned into an interface record.
#[derive(Debug, Error)]
pub enum EventError {
    /// The payload is not one of the supported trigger types.
    #[error("Unsupported event: {0}")]
    Unsupported(String),

    /// The payload has a supported type but the wrong shape.
    #[error("Malformed {kind} payload: {message}")]
    Malformed {
        /// Trigger type.
        kind: &'static str,
        /// Parse failure detail.
        message: String,
    },

    /// Looking up the instance or subnet failed.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

impl EventError {
    pub fn malformed(kind: &'static str, message: impl ToString) -> Self {
        Self::Malformed {
            kind,
            message: message.to_string(),
        }
    }

    /// Unsupported events are ignored rather than reported to the caller.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, EventError::Unsupported(_))
    }
}

/// Failures that abort a whole backfill page.
#[derive(Debug, Error)]
pub enum BackfillError {
    /// The inventory page could not be fetched.
    #[error("Failed to describe instances: {0}")]
    Inventory(#[source] ControlPlaneError),

    /// The continuation message could not be published.
    #[error("Failed to publish continuation: {0}")]
    Publish(#[from] PublishError),
}

/// Failures of the one-shot bootstrap hook.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The create request did not name a topic.
    #[error("Lifecycle event is missing ResourceProperties.SNSTopicArn")]
    MissingTopic,

    /// The start message could not be published.
    #[error("Failed to publish backfill start: {0}")]
    Publish(#[from] PublishError),
}
