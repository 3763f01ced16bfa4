//! Target acquisition state machine.
//!
//! ```text
//!   targetId / targetsByZone          targetCreation
//!            │                              │
//!            ↓                              ↓
//!   UsingFixedTarget            LookingUpBySubnetTag ──found──┐
//!            │                              │ none            │
//!            │                              ↓                 │
//!            │                       CreatingTarget ──────────┤
//!            │                              │ error           │
//!            ↓                              ↓                 ↓
//!          Ready                         Failed             Ready
//! ```
//!
//! Rotation re-enters `CreatingTarget` after untagging the exhausted target,
//! and is refused for targets pinned by policy.

use std::fmt;
use thiserror::Error;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::control_plane::{
    ControlPlane, ControlPlaneError, LaunchRequest, TargetFilter, TargetRequest,
};
use crate::policy::{SessionConfig, TargetCreation, TargetSource};
use crate::settings::EngineSettings;
use crate::types::{ObservedInterface, Tag};
use crate::{audit_log, debug_log, error_log, info_log, warn_log};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionState {
    UsingFixedTarget,
    LookingUpBySubnetTag,
    CreatingTarget,
    Ready,
    Failed,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionState::UsingFixedTarget => write!(f, "UsingFixedTarget"),
            AcquisitionState::LookingUpBySubnetTag => write!(f, "LookingUpBySubnetTag"),
            AcquisitionState::CreatingTarget => write!(f, "CreatingTarget"),
            AcquisitionState::Ready => write!(f, "Ready"),
            AcquisitionState::Failed => write!(f, "Failed"),
        }
    }
}

/// How a target was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOrigin {
    /// Named by the policy, directly or per zone.
    Pinned,
    /// Found through the destination-subnet tag.
    Discovered,
    /// Created during this acquisition.
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredTarget {
    pub target_id: String,
    pub origin: TargetOrigin,
    /// Subnet the target serves; `None` for pinned targets.
    pub destination_subnet: Option<String>,
}

impl AcquiredTarget {
    pub fn is_pinned(&self) -> bool {
        self.origin == TargetOrigin::Pinned
    }
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("No target configured for zone {zone} of {interface_id}")]
    ZoneNotConfigured { zone: String, interface_id: String },

    #[error("Target lookup for subnet {subnet_id} failed: {source}")]
    Lookup {
        subnet_id: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("Failed to launch backing instance in {subnet_id}: {source}")]
    Launch {
        subnet_id: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("Failed to create target on instance {instance_id}: {source}")]
    CreateTarget {
        instance_id: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("Failed to tag target {target_id}: {source}")]
    Tag {
        target_id: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("Target {target_id} is pinned by policy and cannot be rotated")]
    PinnedTarget { target_id: String },

    #[error("Failed to retire exhausted target {target_id}: {source}")]
    Retire {
        target_id: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("Replacement target {target_id} is also at capacity: {source}")]
    ReplacementExhausted {
        target_id: String,
        #[source]
        source: ControlPlaneError,
    },
}

/// Resolves a usable target for one interface.
pub struct TargetAcquirer<'a, C: ControlPlane + ?Sized> {
    control_plane: &'a C,
    settings: &'a EngineSettings,
}

impl<'a, C: ControlPlane + ?Sized> TargetAcquirer<'a, C> {
    pub fn new(control_plane: &'a C, settings: &'a EngineSettings) -> Self {
        Self {
            control_plane,
            settings,
        }
    }

    pub async fn acquire(
        &self,
        session: &SessionConfig,
        iface: &ObservedInterface,
    ) -> Result<AcquiredTarget, AcquisitionError> {
        match &session.target {
            TargetSource::Fixed(target_id) => {
                self.transition(
                    iface,
                    AcquisitionState::UsingFixedTarget,
                    AcquisitionState::Ready,
                    "policy pins target",
                );
                Ok(pinned(target_id))
            }
            TargetSource::PerZone(targets) => {
                let zone = iface.zone_suffix();
                match targets.get(zone) {
                    Some(target_id) => {
                        self.transition(
                            iface,
                            AcquisitionState::UsingFixedTarget,
                            AcquisitionState::Ready,
                            "policy pins target for zone",
                        );
                        Ok(pinned(target_id))
                    }
                    None => {
                        self.transition(
                            iface,
                            AcquisitionState::UsingFixedTarget,
                            AcquisitionState::Failed,
                            "zone has no configured target",
                        );
                        Err(AcquisitionError::ZoneNotConfigured {
                            zone: zone.to_string(),
                            interface_id: iface.interface_id().to_string(),
                        })
                    }
                }
            }
            TargetSource::Create(creation) => {
                let destination = destination_subnet(creation, iface);
                if let Some(target) = self.lookup(iface, &destination).await? {
                    return Ok(target);
                }
                self.transition(
                    iface,
                    AcquisitionState::LookingUpBySubnetTag,
                    AcquisitionState::CreatingTarget,
                    "no tagged target for destination subnet",
                );
                self.create(creation, iface, &destination).await
            }
        }
    }

    /// Retires `exhausted` and creates a replacement.
    ///
    /// The subnet tag is removed so later lookups skip the exhausted target;
    /// the target itself is left for out-of-band cleanup.
    pub async fn rotate(
        &self,
        exhausted: &AcquiredTarget,
        session: &SessionConfig,
        iface: &ObservedInterface,
    ) -> Result<AcquiredTarget, AcquisitionError> {
        let creation = match &session.target {
            TargetSource::Create(creation) if !exhausted.is_pinned() => creation,
            _ => {
                return Err(AcquisitionError::PinnedTarget {
                    target_id: exhausted.target_id.clone(),
                })
            }
        };
        let destination = exhausted
            .destination_subnet
            .clone()
            .unwrap_or_else(|| destination_subnet(creation, iface));

        let keys = [self.settings.subnet_tag_key.clone()];
        if let Err(source) = self.control_plane.untag_resource(&exhausted.target_id, &keys).await {
            self.transition(
                iface,
                AcquisitionState::Ready,
                AcquisitionState::Failed,
                "untagging exhausted target failed",
            );
            audit_log!(AuditRecord::new(
                AuditCategory::ResourceModify,
                "TargetAcquirer",
                "retire_target"
            )
            .with_outcome(AuditOutcome::Failure)
            .with_object_id(&exhausted.target_id)
            .with_object_type("mirror_target")
            .with_error(source.to_string()));
            return Err(AcquisitionError::Retire {
                target_id: exhausted.target_id.clone(),
                source,
            });
        }

        warn_log!(
            "TargetAcquirer",
            target_id = %exhausted.target_id,
            subnet_id = %destination,
            "Target reached its session limit, retired from subnet lookup"
        );
        audit_log!(AuditRecord::new(
            AuditCategory::ResourceModify,
            "TargetAcquirer",
            "retire_target"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(&exhausted.target_id)
        .with_object_type("mirror_target")
        .with_details(serde_json::json!({
            "removed_tag": self.settings.subnet_tag_key,
            "subnet_id": destination,
        })));

        self.transition(
            iface,
            AcquisitionState::Ready,
            AcquisitionState::CreatingTarget,
            "target capacity exhausted",
        );
        self.create(creation, iface, &destination).await
    }

    async fn lookup(
        &self,
        iface: &ObservedInterface,
        destination: &str,
    ) -> Result<Option<AcquiredTarget>, AcquisitionError> {
        let filter = TargetFilter::Tag {
            key: self.settings.subnet_tag_key.clone(),
            value: destination.to_string(),
        };
        let targets = match self.control_plane.describe_targets(&filter).await {
            Ok(targets) => targets,
            Err(source) => {
                self.transition(
                    iface,
                    AcquisitionState::LookingUpBySubnetTag,
                    AcquisitionState::Failed,
                    "target lookup failed",
                );
                return Err(AcquisitionError::Lookup {
                    subnet_id: destination.to_string(),
                    source,
                });
            }
        };

        Ok(targets.into_iter().next().map(|target| {
            self.transition(
                iface,
                AcquisitionState::LookingUpBySubnetTag,
                AcquisitionState::Ready,
                "found target tagged with destination subnet",
            );
            AcquiredTarget {
                target_id: target.target_id,
                origin: TargetOrigin::Discovered,
                destination_subnet: Some(destination.to_string()),
            }
        }))
    }

    /// Launches a backing instance, creates a target on its primary interface
    /// and tags the target with the destination subnet. The instance is
    /// terminated if any step after the launch fails.
    async fn create(
        &self,
        creation: &TargetCreation,
        iface: &ObservedInterface,
        destination: &str,
    ) -> Result<AcquiredTarget, AcquisitionError> {
        let name = Tag::new("Name", format!("tmirror-target-{}", destination));
        let launch = LaunchRequest {
            image_id: creation.image_id.clone(),
            instance_type: creation.instance_type.clone(),
            security_group_ids: creation.security_group_ids.clone(),
            subnet_id: destination.to_string(),
            tags: vec![name.clone()],
        };

        let launched = match self.control_plane.run_instance(&launch).await {
            Ok(launched) => launched,
            Err(source) => {
                self.transition(
                    iface,
                    AcquisitionState::CreatingTarget,
                    AcquisitionState::Failed,
                    "backing instance launch failed",
                );
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceCreate,
                    "TargetAcquirer",
                    "launch_backing_instance"
                )
                .with_outcome(AuditOutcome::Failure)
                .with_object_type("instance")
                .with_details(serde_json::json!({ "subnet_id": destination }))
                .with_error(source.to_string()));
                return Err(AcquisitionError::Launch {
                    subnet_id: destination.to_string(),
                    source,
                });
            }
        };
        audit_log!(AuditRecord::new(
            AuditCategory::ResourceCreate,
            "TargetAcquirer",
            "launch_backing_instance"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(&launched.instance_id)
        .with_object_type("instance")
        .with_details(serde_json::json!({
            "subnet_id": destination,
            "network_interface_id": launched.primary_interface_id,
        })));

        let request = TargetRequest {
            network_interface_id: launched.primary_interface_id.clone(),
            description: self.settings.target_description.clone(),
            tags: vec![name],
        };
        let target = match self.control_plane.create_target(&request).await {
            Ok(target) => target,
            Err(source) => {
                self.transition(
                    iface,
                    AcquisitionState::CreatingTarget,
                    AcquisitionState::Failed,
                    "target creation failed",
                );
                self.terminate_backing_instance(&launched.instance_id).await;
                return Err(AcquisitionError::CreateTarget {
                    instance_id: launched.instance_id,
                    source,
                });
            }
        };

        let subnet_tag = [Tag::new(self.settings.subnet_tag_key.clone(), destination)];
        if let Err(source) = self.control_plane.tag_resource(&target.target_id, &subnet_tag).await {
            self.transition(
                iface,
                AcquisitionState::CreatingTarget,
                AcquisitionState::Failed,
                "tagging new target failed",
            );
            self.terminate_backing_instance(&launched.instance_id).await;
            return Err(AcquisitionError::Tag {
                target_id: target.target_id,
                source,
            });
        }

        info_log!(
            "TargetAcquirer",
            target_id = %target.target_id,
            instance_id = %launched.instance_id,
            subnet_id = %destination,
            "Created mirror target"
        );
        audit_log!(AuditRecord::new(
            AuditCategory::ResourceCreate,
            "TargetAcquirer",
            "create_target"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(&target.target_id)
        .with_object_type("mirror_target")
        .with_details(serde_json::json!({
            "backing_instance_id": launched.instance_id,
            "network_interface_id": launched.primary_interface_id,
            "subnet_tag": subnet_tag[0].to_string(),
        })));

        self.transition(
            iface,
            AcquisitionState::CreatingTarget,
            AcquisitionState::Ready,
            "target created and tagged",
        );
        Ok(AcquiredTarget {
            target_id: target.target_id,
            origin: TargetOrigin::Created,
            destination_subnet: Some(destination.to_string()),
        })
    }

    /// Compensating teardown. A failed terminate is logged; the caller's
    /// original error is what gets propagated.
    async fn terminate_backing_instance(&self, instance_id: &str) {
        match self.control_plane.terminate_instance(instance_id).await {
            Ok(()) => {
                info_log!(
                    "TargetAcquirer",
                    instance_id = %instance_id,
                    "Terminated partially provisioned backing instance"
                );
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceDelete,
                    "TargetAcquirer",
                    "terminate_backing_instance"
                )
                .with_outcome(AuditOutcome::Success)
                .with_object_id(instance_id)
                .with_object_type("instance"));
            }
            Err(e) => {
                error_log!(
                    "TargetAcquirer",
                    instance_id = %instance_id,
                    error = %e,
                    "Failed to terminate backing instance"
                );
                audit_log!(AuditRecord::new(
                    AuditCategory::ErrorCondition,
                    "TargetAcquirer",
                    "terminate_backing_instance"
                )
                .with_outcome(AuditOutcome::Failure)
                .with_object_id(instance_id)
                .with_object_type("instance")
                .with_error(e.to_string()));
            }
        }
    }

    fn transition(
        &self,
        iface: &ObservedInterface,
        from: AcquisitionState,
        to: AcquisitionState,
        condition: &str,
    ) {
        debug_log!(
            "TargetAcquirer",
            interface_id = %iface.interface_id(),
            from = %from,
            to = %to,
            condition,
            "Acquisition state transition"
        );
    }
}

fn pinned(target_id: &str) -> AcquiredTarget {
    AcquiredTarget {
        target_id: target_id.to_string(),
        origin: TargetOrigin::Pinned,
        destination_subnet: None,
    }
}

fn destination_subnet(creation: &TargetCreation, iface: &ObservedInterface) -> String {
    creation
        .target_subnet_id
        .clone()
        .unwrap_or_else(|| iface.subnet_id().to_string())
}
