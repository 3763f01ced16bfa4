//! One-shot provisioning lifecycle hook that starts the first backfill walk.

use serde::{Deserialize, Serialize};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::error::BootstrapError;
use crate::messaging::{ContinuationMessage, Publisher};
use crate::settings::EngineSettings;
use crate::{audit_log, debug_log, info_log};

/// Custom resource type this hook answers to.
pub const APP_CONFIGURATION_RESOURCE: &str = "Custom::AppConfiguration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleRequest {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProperties {
    #[serde(rename = "SNSTopicArn", default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// A custom-resource lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleEvent {
    pub request_type: LifecycleRequest,
    pub resource_type: String,
    #[serde(default)]
    pub resource_properties: ResourceProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LifecycleOutcome {
    /// The start message was published to `topic`.
    BackfillStarted { topic: String },
    /// Update or delete; nothing to do.
    NoOp,
    /// Not an event for this hook's resource type.
    Ignored,
}

/// Publishes the start sentinel on `Create`; `Update` and `Delete` do nothing.
pub async fn handle_lifecycle_event<P: Publisher + ?Sized>(
    event: &LifecycleEvent,
    publisher: &P,
    settings: &EngineSettings,
) -> Result<LifecycleOutcome, BootstrapError> {
    if event.resource_type != APP_CONFIGURATION_RESOURCE {
        debug_log!(
            "Bootstrap",
            resource_type = %event.resource_type,
            "Ignoring lifecycle event for other resource"
        );
        return Ok(LifecycleOutcome::Ignored);
    }

    match event.request_type {
        LifecycleRequest::Create => {
            let topic = event
                .resource_properties
                .topic
                .as_deref()
                .filter(|topic| !topic.trim().is_empty())
                .ok_or(BootstrapError::MissingTopic)?;

            info_log!(
                "Bootstrap",
                topic = %topic,
                "Initiating traffic mirroring for existing instances"
            );
            publisher
                .publish(ContinuationMessage::new(topic, settings.start_token.clone()))
                .await?;
            audit_log!(AuditRecord::new(
                AuditCategory::Backfill,
                "Bootstrap",
                "start_backfill"
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(topic)
            .with_object_type("backfill_topic"));

            Ok(LifecycleOutcome::BackfillStarted {
                topic: topic.to_string(),
            })
        }
        LifecycleRequest::Update | LifecycleRequest::Delete => {
            debug_log!("Bootstrap", request = ?event.request_type, "Nothing to do");
            Ok(LifecycleOutcome::NoOp)
        }
    }
}
