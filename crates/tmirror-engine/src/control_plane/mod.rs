//! Compute/network control-plane boundary.
//!
//! The engine never talks to a cloud SDK directly. Hosts implement
//! [`ControlPlane`] over their SDK; [`memory::InMemoryControlPlane`] is a
//! deterministic fleet model used for dry runs and tests.
//!
//! Every operation may fail with [`ControlPlaneError::LimitExceeded`]. Only
//! the per-target source limit makes the provisioner rotate; every other
//! limit is surfaced like a generic failure.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Tag;

pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

/// Error code returned when a target cannot accept more sessions.
pub const SOURCES_PER_TARGET_LIMIT_EXCEEDED: &str = "TrafficMirrorSourcesPerTargetLimitExceeded";

/// Control-plane failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    /// A quota or per-resource limit was hit.
    #[error("{operation} rejected ({code}): {message}")]
    LimitExceeded {
        operation: String,
        code: String,
        message: String,
    },

    /// The referenced resource does not exist.
    #[error("{operation}: {resource} not found")]
    NotFound { operation: String, resource: String },

    /// Any other API failure.
    #[error("{operation} failed ({code}): {message}")]
    Api {
        operation: String,
        code: String,
        message: String,
    },
}

impl ControlPlaneError {
    pub fn limit_exceeded(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::LimitExceeded {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(operation: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::NotFound {
            operation: operation.into(),
            resource: resource.into(),
        }
    }

    pub fn api(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Api {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, ControlPlaneError::LimitExceeded { .. })
    }

    /// The target has no room for another source. Other limits (per
    /// interface, per account) do not qualify.
    pub fn is_target_capacity_exhausted(&self) -> bool {
        match self {
            ControlPlaneError::LimitExceeded { code, .. } => {
                code == SOURCES_PER_TARGET_LIMIT_EXCEEDED
            }
            _ => false,
        }
    }
}

/// One network attachment of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInterface {
    pub network_interface_id: String,
    #[serde(default)]
    pub device_index: u32,
}

/// Inventory view of a compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: String,
    pub state: String,
    pub subnet_id: String,
    pub network_id: String,
    #[serde(default)]
    pub network_interfaces: Vec<InstanceInterface>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl InstanceRecord {
    /// The interface at device index 0, falling back to the first listed.
    pub fn primary_interface(&self) -> Option<&InstanceInterface> {
        self.network_interfaces
            .iter()
            .find(|nic| nic.device_index == 0)
            .or_else(|| self.network_interfaces.first())
    }
}

/// Inventory view of a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetRecord {
    pub subnet_id: String,
    pub network_id: String,
    pub availability_zone_key: String,
}

/// A mirror target.
///
/// `tags` holds the weak back-reference used for lookup by destination
/// subnet. The control plane owns the target's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorTarget {
    pub target_id: String,
    #[serde(default)]
    pub network_interface_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl MirrorTarget {
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.key == key).map(|t| t.value.as_str())
    }
}

/// Paginated instance inventory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceQuery {
    /// Only instances in one of these states; empty means any state.
    pub states: Vec<String>,
    pub max_results: usize,
    pub next_token: Option<String>,
}

/// One page of instance inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancePage {
    pub instances: Vec<InstanceRecord>,
    pub next_token: Option<String>,
}

/// Target lookup filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetFilter {
    /// Targets associated with this interface: backed by it, or already
    /// receiving its mirrored traffic.
    NetworkInterface(String),
    /// Targets carrying this tag.
    Tag { key: String, value: String },
}

/// Backing instance launch parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub security_group_ids: Vec<String>,
    pub subnet_id: String,
    pub tags: Vec<Tag>,
}

/// A launched backing instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedInstance {
    pub instance_id: String,
    pub primary_interface_id: String,
}

/// Mirror target creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRequest {
    pub network_interface_id: String,
    pub description: String,
    /// Tags applied at creation time.
    pub tags: Vec<Tag>,
}

/// Mirror session creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub network_interface_id: String,
    pub target_id: String,
    pub filter_id: String,
    pub session_number: u32,
}

/// Control-plane operations consumed by the engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn describe_instances(&self, query: &InstanceQuery) -> ControlPlaneResult<InstancePage>;

    async fn describe_instance(&self, instance_id: &str) -> ControlPlaneResult<InstanceRecord>;

    async fn describe_subnet(&self, subnet_id: &str) -> ControlPlaneResult<SubnetRecord>;

    async fn describe_targets(
        &self,
        filter: &TargetFilter,
    ) -> ControlPlaneResult<Vec<MirrorTarget>>;

    async fn run_instance(&self, request: &LaunchRequest) -> ControlPlaneResult<LaunchedInstance>;

    async fn terminate_instance(&self, instance_id: &str) -> ControlPlaneResult<()>;

    async fn create_target(&self, request: &TargetRequest) -> ControlPlaneResult<MirrorTarget>;

    async fn tag_resource(&self, resource_id: &str, tags: &[Tag]) -> ControlPlaneResult<()>;

    async fn untag_resource(&self, resource_id: &str, keys: &[String]) -> ControlPlaneResult<()>;

    /// Creates a session and returns its id.
    async fn create_session(&self, request: &SessionRequest) -> ControlPlaneResult<String>;
}
