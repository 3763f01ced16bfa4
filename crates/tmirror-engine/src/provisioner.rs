//! Session provisioning.
//!
//! One session per source interface. The provisioner drives the acquisition
//! state machine and owns its single rotation cycle: a target capacity error
//! on a discovered or created target triggers one rotation and one retry, a
//! second one ends the attempt for that interface. Any other limit is surfaced
//! as is.

use serde::Serialize;

use crate::acquisition::{AcquiredTarget, AcquisitionError, TargetAcquirer};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::control_plane::{ControlPlane, ControlPlaneResult, SessionRequest, TargetFilter};
use crate::error::ProvisionError;
use crate::policy::{FilterSource, PolicyEntry};
use crate::settings::EngineSettings;
use crate::types::ObservedInterface;
use crate::{audit_log, info_log, warn_log};

/// What provisioning did for one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Created {
        session_id: String,
        target_id: String,
        filter_id: String,
        /// Whether the session landed on a replacement target.
        rotated: bool,
    },
    /// The interface is already associated with a target; nothing was done.
    AlreadyMirrored { target_id: String },
}

pub struct SessionProvisioner<'a, C: ControlPlane + ?Sized> {
    control_plane: &'a C,
    settings: &'a EngineSettings,
}

impl<'a, C: ControlPlane + ?Sized> SessionProvisioner<'a, C> {
    pub fn new(control_plane: &'a C, settings: &'a EngineSettings) -> Self {
        Self {
            control_plane,
            settings,
        }
    }

    pub async fn provision_session(
        &self,
        iface: &ObservedInterface,
        policy: &PolicyEntry,
    ) -> Result<SessionOutcome, ProvisionError> {
        let existing = self
            .control_plane
            .describe_targets(&TargetFilter::NetworkInterface(iface.interface_id().to_string()))
            .await?;
        if let Some(target) = existing.into_iter().next() {
            info_log!(
                "SessionProvisioner",
                interface_id = %iface.interface_id(),
                target_id = %target.target_id,
                "Interface already has a target association, skipping"
            );
            return Ok(SessionOutcome::AlreadyMirrored {
                target_id: target.target_id,
            });
        }

        let session = policy.session();
        let filter_id = self.resolve_filter(iface, &session.filter)?;

        let acquirer = TargetAcquirer::new(self.control_plane, self.settings);
        let target = acquirer
            .acquire(session, iface)
            .await
            .map_err(|e| ProvisionError::acquisition_failed(iface.interface_id(), e))?;

        match self.create_session(iface, &target, &filter_id).await {
            Ok(session_id) => Ok(SessionOutcome::Created {
                session_id,
                target_id: target.target_id,
                filter_id,
                rotated: false,
            }),
            Err(e) if e.is_target_capacity_exhausted() => {
                if target.is_pinned() {
                    warn_log!(
                        "SessionProvisioner",
                        interface_id = %iface.interface_id(),
                        target_id = %target.target_id,
                        "Pinned target is at capacity, not rotating"
                    );
                    return Err(ProvisionError::CapacityExceeded {
                        interface_id: iface.interface_id().to_string(),
                        target_id: target.target_id,
                    });
                }

                let replacement = acquirer
                    .rotate(&target, session, iface)
                    .await
                    .map_err(|e| ProvisionError::acquisition_failed(iface.interface_id(), e))?;

                match self.create_session(iface, &replacement, &filter_id).await {
                    Ok(session_id) => Ok(SessionOutcome::Created {
                        session_id,
                        target_id: replacement.target_id,
                        filter_id,
                        rotated: true,
                    }),
                    Err(source) if source.is_target_capacity_exhausted() => {
                        Err(ProvisionError::acquisition_failed(
                            iface.interface_id(),
                            AcquisitionError::ReplacementExhausted {
                                target_id: replacement.target_id,
                                source,
                            },
                        ))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Picks the filter for `iface`: the fixed one, or the one keyed by the
    /// interface's classification tag.
    pub fn resolve_filter(
        &self,
        iface: &ObservedInterface,
        filter: &FilterSource,
    ) -> Result<String, ProvisionError> {
        let filters = match filter {
            FilterSource::Fixed(filter_id) => return Ok(filter_id.clone()),
            FilterSource::ByClassification(filters) => filters,
        };

        let key = &self.settings.classification_tag_key;
        let class = iface.tag_value(key).ok_or_else(|| {
            ProvisionError::invalid_filter(
                iface.interface_id(),
                format!("required tag '{}' is missing", key),
            )
        })?;
        if !self.settings.is_classification(class) {
            return Err(ProvisionError::invalid_filter(
                iface.interface_id(),
                format!(
                    "tag '{}' has value '{}', expected one of {}",
                    key,
                    class,
                    self.settings.classification_values.join(", ")
                ),
            ));
        }
        filters.get(class).cloned().ok_or_else(|| {
            ProvisionError::invalid_filter(
                iface.interface_id(),
                format!("no filter configured for '{}'", class),
            )
        })
    }

    async fn create_session(
        &self,
        iface: &ObservedInterface,
        target: &AcquiredTarget,
        filter_id: &str,
    ) -> ControlPlaneResult<String> {
        let request = SessionRequest {
            network_interface_id: iface.interface_id().to_string(),
            target_id: target.target_id.clone(),
            filter_id: filter_id.to_string(),
            session_number: self.settings.session_number,
        };

        match self.control_plane.create_session(&request).await {
            Ok(session_id) => {
                info_log!(
                    "SessionProvisioner",
                    session_id = %session_id,
                    interface_id = %request.network_interface_id,
                    target_id = %request.target_id,
                    filter_id = %request.filter_id,
                    "Created mirror session"
                );
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceCreate,
                    "SessionProvisioner",
                    "create_session"
                )
                .with_outcome(AuditOutcome::Success)
                .with_object_id(&session_id)
                .with_object_type("mirror_session")
                .with_details(serde_json::json!({
                    "network_interface_id": request.network_interface_id,
                    "target_id": request.target_id,
                    "filter_id": request.filter_id,
                    "session_number": request.session_number,
                })));
                Ok(session_id)
            }
            Err(e) => {
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceCreate,
                    "SessionProvisioner",
                    "create_session"
                )
                .with_outcome(AuditOutcome::Failure)
                .with_object_type("mirror_session")
                .with_details(serde_json::json!({
                    "network_interface_id": request.network_interface_id,
                    "target_id": request.target_id,
                }))
                .with_error(e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{
        ControlPlaneError, LaunchedInstance, MirrorTarget, MockControlPlane,
        SOURCES_PER_TARGET_LIMIT_EXCEEDED,
    };
    use crate::policy::{SessionConfig, TargetCreation, TargetSource};
    use crate::types::Tag;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn limit() -> ControlPlaneError {
        ControlPlaneError::limit_exceeded(
            "CreateTrafficMirrorSession",
            SOURCES_PER_TARGET_LIMIT_EXCEEDED,
            "full",
        )
    }

    fn web_iface() -> ObservedInterface {
        ObservedInterface::new("eni-src", "subnet-123", "vpc-1", "use1-az1")
            .with_tags([Tag::new("server_type", "web")])
    }

    fn network_policy(target: TargetSource, filter: FilterSource) -> PolicyEntry {
        PolicyEntry::Network {
            network_id: "vpc-1".into(),
            session: SessionConfig { target, filter },
        }
    }

    fn fixed_policy() -> PolicyEntry {
        network_policy(TargetSource::Fixed("tmt-fixed".into()), FilterSource::Fixed("tmf-1".into()))
    }

    fn creation_policy() -> PolicyEntry {
        network_policy(
            TargetSource::Create(TargetCreation {
                image_id: "ami-1".into(),
                instance_type: "c5n.large".into(),
                security_group_ids: vec!["sg-1".into()],
                target_subnet_id: None,
            }),
            FilterSource::Fixed("tmf-1".into()),
        )
    }

    fn target(id: &str) -> MirrorTarget {
        MirrorTarget {
            target_id: id.into(),
            network_interface_id: Some(format!("eni-{}", id)),
            tags: vec![Tag::new("TargetSubnetId", "subnet-123")],
        }
    }

    /// Mock with no existing association and, for subnet-tag lookups, `tagged`.
    fn mock_with_lookup(tagged: Vec<MirrorTarget>) -> MockControlPlane {
        let mut cp = MockControlPlane::new();
        cp.expect_describe_targets().returning(move |filter| match filter {
            TargetFilter::NetworkInterface(_) => Ok(vec![]),
            TargetFilter::Tag { .. } => Ok(tagged.clone()),
        });
        cp
    }

    /// Expectations for creating one replacement target, `tmt-new`.
    fn expect_target_creation(cp: &mut MockControlPlane) {
        cp.expect_run_instance().times(1).returning(|_| {
            Ok(LaunchedInstance {
                instance_id: "i-new".into(),
                primary_interface_id: "eni-new".into(),
            })
        });
        cp.expect_create_target()
            .withf(|req| req.network_interface_id == "eni-new")
            .times(1)
            .returning(|_| Ok(target("tmt-new")));
        cp.expect_tag_resource()
            .withf(|id, tags| id == "tmt-new" && tags == [Tag::new("TargetSubnetId", "subnet-123")])
            .times(1)
            .returning(|_, _| Ok(()));
    }

    #[tokio::test]
    async fn test_existing_association_is_a_noop() {
        let mut cp = MockControlPlane::new();
        cp.expect_describe_targets()
            .withf(|filter| *filter == TargetFilter::NetworkInterface("eni-src".into()))
            .times(1)
            .returning(|_| Ok(vec![target("tmt-existing")]));
        cp.expect_create_session().never();
        let settings = EngineSettings::default();

        let outcome = SessionProvisioner::new(&cp, &settings)
            .provision_session(&web_iface(), &creation_policy())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::AlreadyMirrored {
                target_id: "tmt-existing".into()
            }
        );
    }

    #[tokio::test]
    async fn test_fixed_target_session() {
        let mut cp = mock_with_lookup(vec![]);
        cp.expect_create_session()
            .withf(|req| {
                req.target_id == "tmt-fixed"
                    && req.filter_id == "tmf-1"
                    && req.session_number == 100
            })
            .times(1)
            .returning(|_| Ok("tms-1".into()));
        let settings = EngineSettings::default();

        let outcome = SessionProvisioner::new(&cp, &settings)
            .provision_session(&web_iface(), &fixed_policy())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Created {
                session_id: "tms-1".into(),
                target_id: "tmt-fixed".into(),
                filter_id: "tmf-1".into(),
                rotated: false,
            }
        );
    }

    #[tokio::test]
    async fn test_pinned_target_capacity_is_surfaced_without_rotation() {
        let mut cp = mock_with_lookup(vec![]);
        cp.expect_create_session().times(1).returning(|_| Err(limit()));
        cp.expect_untag_resource().never();
        cp.expect_run_instance().never();
        let settings = EngineSettings::default();

        let err = SessionProvisioner::new(&cp, &settings)
            .provision_session(&web_iface(), &fixed_policy())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::CapacityExceeded { ref target_id, .. } if target_id == "tmt-fixed"
        ));
    }

    #[tokio::test]
    async fn test_capacity_triggers_exactly_one_rotation() {
        let mut cp = mock_with_lookup(vec![target("tmt-old")]);
        cp.expect_create_session()
            .withf(|req| req.target_id == "tmt-old")
            .times(1)
            .returning(|_| Err(limit()));
        cp.expect_create_session()
            .withf(|req| req.target_id == "tmt-new")
            .times(1)
            .returning(|_| Ok("tms-2".into()));
        cp.expect_untag_resource()
            .withf(|id, keys| id == "tmt-old" && keys == ["TargetSubnetId".to_string()])
            .times(1)
            .returning(|_, _| Ok(()));
        expect_target_creation(&mut cp);
        let settings = EngineSettings::default();

        let outcome = SessionProvisioner::new(&cp, &settings)
            .provision_session(&web_iface(), &creation_policy())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Created {
                session_id: "tms-2".into(),
                target_id: "tmt-new".into(),
                filter_id: "tmf-1".into(),
                rotated: true,
            }
        );
    }

    #[tokio::test]
    async fn test_second_capacity_error_is_acquisition_failure() {
        let mut cp = mock_with_lookup(vec![target("tmt-old")]);
        cp.expect_create_session().times(2).returning(|_| Err(limit()));
        cp.expect_untag_resource().times(1).returning(|_, _| Ok(()));
        expect_target_creation(&mut cp);
        let settings = EngineSettings::default();

        let err = SessionProvisioner::new(&cp, &settings)
            .provision_session(&web_iface(), &creation_policy())
            .await
            .unwrap_err();
        match err {
            ProvisionError::AcquisitionFailed {
                source: AcquisitionError::ReplacementExhausted { target_id, source },
                ..
            } => {
                assert_eq!(target_id, "tmt-new");
                assert!(source.is_target_capacity_exhausted());
            }
            other => panic!("expected ReplacementExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_target_limit_is_surfaced_without_rotation() {
        let mut cp = mock_with_lookup(vec![target("tmt-old")]);
        cp.expect_create_session().times(1).returning(|_| {
            Err(ControlPlaneError::limit_exceeded(
                "CreateTrafficMirrorSession",
                "TrafficMirrorSessionsPerInterfaceLimitExceeded",
                "interface has too many sessions",
            ))
        });
        cp.expect_untag_resource().never();
        cp.expect_run_instance().never();
        cp.expect_create_target().never();
        let settings = EngineSettings::default();

        let err = SessionProvisioner::new(&cp, &settings)
            .provision_session(&web_iface(), &creation_policy())
            .await
            .unwrap_err();
        match err {
            ProvisionError::ControlPlane(ControlPlaneError::LimitExceeded { code, .. }) => {
                assert_eq!(code, "TrafficMirrorSessionsPerInterfaceLimitExceeded");
            }
            other => panic!("expected the limit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_session_errors_are_not_retried() {
        let mut cp = mock_with_lookup(vec![]);
        cp.expect_create_session()
            .times(1)
            .returning(|_| {
                Err(ControlPlaneError::api(
                    "CreateTrafficMirrorSession",
                    "InternalError",
                    "boom",
                ))
            });
        let settings = EngineSettings::default();

        let err = SessionProvisioner::new(&cp, &settings)
            .provision_session(&web_iface(), &fixed_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ControlPlane(_)));
    }

    #[tokio::test]
    async fn test_missing_classification_tag_makes_no_session_call() {
        let mut cp = mock_with_lookup(vec![]);
        cp.expect_create_session().never();
        let settings = EngineSettings::default();
        let mut filters = BTreeMap::new();
        filters.insert("web".to_string(), "tmf-web".to_string());
        let policy = network_policy(
            TargetSource::Fixed("tmt-fixed".into()),
            FilterSource::ByClassification(filters),
        );
        let untagged = ObservedInterface::new("eni-src", "subnet-123", "vpc-1", "use1-az1");

        let err = SessionProvisioner::new(&cp, &settings)
            .provision_session(&untagged, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidFilterReference { .. }));
    }

    #[test]
    fn test_resolve_filter_by_classification() {
        let cp = MockControlPlane::new();
        let settings = EngineSettings::default();
        let provisioner = SessionProvisioner::new(&cp, &settings);
        let mut filters = BTreeMap::new();
        filters.insert("web".to_string(), "tmf-web".to_string());
        let source = FilterSource::ByClassification(filters);

        assert_eq!(provisioner.resolve_filter(&web_iface(), &source).unwrap(), "tmf-web");

        let cache = ObservedInterface::new("eni-2", "subnet-1", "vpc-1", "use1-az1")
            .with_tags([Tag::new("server_type", "cache")]);
        let err = provisioner.resolve_filter(&cache, &source).unwrap_err();
        assert!(err.to_string().contains("expected one of web, app, db"));

        let db = ObservedInterface::new("eni-3", "subnet-1", "vpc-1", "use1-az1")
            .with_tags([Tag::new("server_type", "db")]);
        let err = provisioner.resolve_filter(&db, &source).unwrap_err();
        assert!(err.to_string().contains("no filter configured for 'db'"));
    }
}
