//! Trigger adapters.
//!
//! Raw JSON payloads are parsed once into a [`Trigger`], then turned into the
//! canonical [`ObservedInterface`] by [`EventAdapter`]. Nothing past this
//! module looks at payload shapes.
//!
//! Supported payloads:
//!
//! - `detail-type: EC2 Instance State-change Notification` with
//!   `detail.instance-id` and `detail.state`
//! - `detail-type: GuardDuty Finding` whose `detail.resource.resourceType` is
//!   `Instance`
//! - a notification envelope `Records[0].Sns` carrying `TopicArn` and the
//!   `NextToken` message attribute (a backfill continuation)

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::control_plane::{ControlPlane, InstanceRecord, SubnetRecord};
use crate::error::EventError;
use crate::messaging::{Continuation, NEXT_TOKEN_ATTRIBUTE};
use crate::settings::EngineSettings;
use crate::types::{ObservedInterface, Tag};
use crate::{debug_log, warn_log};

pub const INSTANCE_STATE_CHANGE: &str = "EC2 Instance State-change Notification";
pub const SECURITY_FINDING: &str = "GuardDuty Finding";

/// A normalized inbound trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    InstanceStateChange { instance_id: String, state: Option<String> },
    SecurityFinding(FindingInstance),
    BackfillContinuation(Continuation),
}

/// The instance a security finding refers to, as reported by the finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindingInstance {
    pub instance_id: String,
    pub network_interface_id: String,
    pub subnet_id: String,
    pub network_id: String,
    pub tags: Vec<Tag>,
}

#[derive(Deserialize)]
struct StateChangeDetail {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindingDetail {
    resource: Option<FindingResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindingResource {
    resource_type: String,
    instance_details: Option<FindingInstanceDetails>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindingInstanceDetails {
    instance_id: String,
    #[serde(default)]
    network_interfaces: Vec<FindingInterface>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindingInterface {
    network_interface_id: String,
    subnet_id: String,
    vpc_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NotificationEnvelope {
    records: Vec<NotificationRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NotificationRecord {
    sns: NotificationMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NotificationMessage {
    topic_arn: String,
    #[serde(default)]
    message_attributes: BTreeMap<String, NotificationAttribute>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NotificationAttribute {
    value: String,
}

/// Classifies a raw payload.
pub fn parse_trigger(payload: &Value) -> Result<Trigger, EventError> {
    if let Some(detail_type) = payload.get("detail-type").and_then(Value::as_str) {
        let detail = payload.get("detail").cloned().unwrap_or(Value::Null);
        return match detail_type {
            INSTANCE_STATE_CHANGE => {
                let detail: StateChangeDetail = serde_json::from_value(detail)
                    .map_err(|e| EventError::malformed("instance state-change", e))?;
                Ok(Trigger::InstanceStateChange {
                    instance_id: detail.instance_id,
                    state: detail.state,
                })
            }
            SECURITY_FINDING => parse_finding(detail),
            other => Err(EventError::Unsupported(format!("detail-type '{}'", other))),
        };
    }

    if payload.get("Records").is_some() {
        let envelope: NotificationEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| EventError::malformed("notification", e))?;
        let record = envelope
            .records
            .into_iter()
            .next()
            .ok_or_else(|| EventError::malformed("notification", "no records"))?;
        let next_token = record
            .sns
            .message_attributes
            .get(NEXT_TOKEN_ATTRIBUTE)
            .map(|attr| attr.value.clone());
        return Ok(Trigger::BackfillContinuation(Continuation::new(
            record.sns.topic_arn,
            next_token,
        )));
    }

    Err(EventError::Unsupported("payload has neither detail-type nor Records".to_string()))
}

fn parse_finding(detail: Value) -> Result<Trigger, EventError> {
    let detail: FindingDetail =
        serde_json::from_value(detail).map_err(|e| EventError::malformed("finding", e))?;
    let resource = detail
        .resource
        .ok_or_else(|| EventError::Unsupported("finding without a resource".to_string()))?;
    if resource.resource_type != "Instance" {
        return Err(EventError::Unsupported(format!(
            "finding for resource type '{}'",
            resource.resource_type
        )));
    }

    let instance = resource
        .instance_details
        .ok_or_else(|| EventError::malformed("finding", "missing instanceDetails"))?;
    let primary = instance
        .network_interfaces
        .into_iter()
        .next()
        .ok_or_else(|| EventError::malformed("finding", "instance has no network interfaces"))?;

    Ok(Trigger::SecurityFinding(FindingInstance {
        instance_id: instance.instance_id,
        network_interface_id: primary.network_interface_id,
        subnet_id: primary.subnet_id,
        network_id: primary.vpc_id,
        tags: instance.tags,
    }))
}

/// Builds the record for an instance's primary interface.
///
/// The zone key comes from the subnet. Returns `None` for an instance with no
/// interfaces.
pub fn interface_from_instance(
    instance: &InstanceRecord,
    subnet: &SubnetRecord,
) -> Option<ObservedInterface> {
    let primary = instance.primary_interface()?;
    Some(
        ObservedInterface::new(
            primary.network_interface_id.clone(),
            instance.subnet_id.clone(),
            instance.network_id.clone(),
            subnet.availability_zone_key.clone(),
        )
        .with_tags(instance.tags.iter().cloned()),
    )
}

/// Turns single-interface triggers into [`ObservedInterface`] records.
pub struct EventAdapter<'a, C: ControlPlane + ?Sized> {
    control_plane: &'a C,
    settings: &'a EngineSettings,
}

impl<'a, C: ControlPlane + ?Sized> EventAdapter<'a, C> {
    pub fn new(control_plane: &'a C, settings: &'a EngineSettings) -> Self {
        Self {
            control_plane,
            settings,
        }
    }

    /// Produces zero or one interface record.
    ///
    /// Instances that are not running yield `None`, as do backfill
    /// continuations, which carry no interface of their own.
    pub async fn observe(
        &self,
        trigger: &Trigger,
    ) -> Result<Option<ObservedInterface>, EventError> {
        match trigger {
            Trigger::InstanceStateChange { instance_id, state } => {
                let running = self.settings.running_state.as_str();
                if let Some(state) = state.as_deref().filter(|s| *s != running) {
                    debug_log!(
                        "EventAdapter",
                        instance_id = %instance_id,
                        state,
                        "Ignoring state change"
                    );
                    return Ok(None);
                }

                let instance = self.control_plane.describe_instance(instance_id).await?;
                if instance.state != self.settings.running_state {
                    debug_log!(
                        "EventAdapter",
                        instance_id = %instance_id,
                        state = %instance.state,
                        "Instance is not running"
                    );
                    return Ok(None);
                }
                let subnet = self.control_plane.describe_subnet(&instance.subnet_id).await?;
                let iface = interface_from_instance(&instance, &subnet);
                if iface.is_none() {
                    warn_log!(
                        "EventAdapter",
                        instance_id = %instance_id,
                        "Instance has no network interfaces"
                    );
                }
                Ok(iface)
            }
            Trigger::SecurityFinding(finding) => {
                let subnet = self.control_plane.describe_subnet(&finding.subnet_id).await?;
                Ok(Some(
                    ObservedInterface::new(
                        finding.network_interface_id.clone(),
                        finding.subnet_id.clone(),
                        finding.network_id.clone(),
                        subnet.availability_zone_key,
                    )
                    .with_tags(finding.tags.iter().cloned()),
                ))
            }
            Trigger::BackfillContinuation(_) => Ok(None),
        }
    }
}
