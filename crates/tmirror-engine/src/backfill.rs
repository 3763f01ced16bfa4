//! Paginated backfill of already-running instances.
//!
//! One invocation handles one inventory page. The continuation token comes in
//! with the invocation and leaves in at most one published message; the
//! coordinator keeps no cursor of its own. Re-delivery of a page is safe
//! because provisioning skips interfaces that already have an association.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::control_plane::{ControlPlane, InstanceQuery, SubnetRecord};
use crate::engine::{InterfaceOutcome, MirrorEngine};
use crate::error::BackfillError;
use crate::events::interface_from_instance;
use crate::messaging::{Continuation, ContinuationMessage, Publisher};
use crate::provisioner::SessionOutcome;
use crate::{audit_log, debug_log, info_log, warn_log};

/// Counters for one backfill page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageReport {
    /// Instances returned by the inventory call.
    pub processed: usize,
    pub provisioned: usize,
    pub already_mirrored: usize,
    pub unmatched: usize,
    pub failed: usize,
    /// Instances skipped because they were not running or had no interface.
    pub skipped_inactive: usize,
    /// Token carried by the published continuation, if one was published.
    pub next_token: Option<String>,
}

pub struct BackfillCoordinator<C: ControlPlane + ?Sized, P: Publisher + ?Sized> {
    engine: MirrorEngine<C>,
    publisher: Arc<P>,
}

impl<C: ControlPlane + ?Sized, P: Publisher + ?Sized> BackfillCoordinator<C, P> {
    pub fn new(engine: MirrorEngine<C>, publisher: Arc<P>) -> Self {
        Self { engine, publisher }
    }

    pub fn engine(&self) -> &MirrorEngine<C> {
        &self.engine
    }

    /// Processes one page and re-arms the walk if the inventory has more.
    ///
    /// An absent or empty token, or the start sentinel, begins at the start
    /// of the inventory. Per-interface failures are counted and logged; only
    /// an inventory or publish failure fails the page.
    pub async fn run_backfill_page(
        &self,
        continuation: &Continuation,
    ) -> Result<PageReport, BackfillError> {
        let settings = self.engine.settings();
        let resume_from = continuation
            .next_token
            .as_deref()
            .filter(|token| !token.is_empty() && *token != settings.start_token)
            .map(str::to_string);

        match &resume_from {
            None => info_log!(
                "BackfillCoordinator",
                topic = %continuation.topic,
                "Starting backfill walk"
            ),
            Some(token) => debug_log!(
                "BackfillCoordinator",
                topic = %continuation.topic,
                token = %token,
                "Resuming backfill walk"
            ),
        }

        let query = InstanceQuery {
            states: vec![settings.running_state.clone()],
            max_results: settings.page_size,
            next_token: resume_from,
        };
        let page = self
            .engine
            .control_plane()
            .describe_instances(&query)
            .await
            .map_err(BackfillError::Inventory)?;

        let mut report = PageReport {
            processed: page.instances.len(),
            ..PageReport::default()
        };
        let mut subnets: HashMap<String, SubnetRecord> = HashMap::new();

        for instance in &page.instances {
            if instance.state != settings.running_state {
                report.skipped_inactive += 1;
                continue;
            }

            let subnet = match subnets.get(&instance.subnet_id) {
                Some(subnet) => subnet.clone(),
                None => match self
                    .engine
                    .control_plane()
                    .describe_subnet(&instance.subnet_id)
                    .await
                {
                    Ok(subnet) => {
                        subnets.insert(instance.subnet_id.clone(), subnet.clone());
                        subnet
                    }
                    Err(e) => {
                        warn_log!(
                            "BackfillCoordinator",
                            instance_id = %instance.instance_id,
                            subnet_id = %instance.subnet_id,
                            error = %e,
                            "Subnet lookup failed, skipping instance"
                        );
                        report.failed += 1;
                        continue;
                    }
                },
            };

            let Some(iface) = interface_from_instance(instance, &subnet) else {
                report.skipped_inactive += 1;
                continue;
            };

            match self.engine.handle_interface(&iface).await {
                Ok(InterfaceOutcome::Session(SessionOutcome::Created { .. })) => {
                    report.provisioned += 1
                }
                Ok(InterfaceOutcome::Session(SessionOutcome::AlreadyMirrored { .. })) => {
                    report.already_mirrored += 1
                }
                Ok(InterfaceOutcome::NoPolicyMatch) => report.unmatched += 1,
                Err(e) => {
                    warn_log!(
                        "BackfillCoordinator",
                        instance_id = %instance.instance_id,
                        interface_id = %iface.interface_id(),
                        error = %e,
                        "Failed to set up mirroring, continuing with page"
                    );
                    report.failed += 1;
                }
            }
        }

        match page.next_token {
            Some(token) => {
                self.publisher
                    .publish(ContinuationMessage::new(continuation.topic.clone(), token.clone()))
                    .await?;
                info_log!(
                    "BackfillCoordinator",
                    topic = %continuation.topic,
                    next_token = %token,
                    provisioned = report.provisioned,
                    failed = report.failed,
                    "Backfill page complete, continuation published"
                );
                report.next_token = Some(token);
            }
            None => {
                info_log!(
                    "BackfillCoordinator",
                    provisioned = report.provisioned,
                    failed = report.failed,
                    "Finished backfilling existing instances"
                );
            }
        }

        audit_log!(AuditRecord::new(
            AuditCategory::Backfill,
            "BackfillCoordinator",
            "run_backfill_page"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(&continuation.topic)
        .with_object_type("backfill_topic")
        .with_details(serde_json::to_value(&report).unwrap_or_default()));

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::memory::{InMemoryControlPlane, Operation};
    use crate::control_plane::{
        ControlPlaneError, InstanceInterface, InstancePage, InstanceRecord, MirrorTarget,
        MockControlPlane, TargetFilter,
    };
    use crate::messaging::ChannelPublisher;
    use crate::policy::PolicyStore;
    use crate::settings::EngineSettings;
    use pretty_assertions::assert_eq;

    const POLICY: &str =
        "networks:\n  - networkId: vpc-1\n    targetId: tmt-fixed\n    filterId: tmf-1\n";

    fn instance(n: usize, state: &str, network_id: &str) -> InstanceRecord {
        InstanceRecord {
            instance_id: format!("i-{}", n),
            state: state.into(),
            subnet_id: "subnet-1".into(),
            network_id: network_id.into(),
            network_interfaces: vec![InstanceInterface {
                network_interface_id: format!("eni-{}", n),
                device_index: 0,
            }],
            tags: vec![],
        }
    }

    fn coordinator(
        instances: Vec<InstanceRecord>,
        page_size: usize,
    ) -> (
        BackfillCoordinator<InMemoryControlPlane, ChannelPublisher>,
        tokio::sync::mpsc::UnboundedReceiver<ContinuationMessage>,
    ) {
        let cp = InMemoryControlPlane::new();
        cp.add_subnet("subnet-1", "vpc-1", "use1-az1");
        cp.add_target(MirrorTarget {
            target_id: "tmt-fixed".into(),
            network_interface_id: Some("eni-target".into()),
            tags: vec![],
        });
        for i in instances {
            cp.add_instance(i);
        }
        let settings = EngineSettings::default().with_page_size(page_size);
        let policies = PolicyStore::from_yaml_str(POLICY, &settings).unwrap();
        let (publisher, rx) = ChannelPublisher::new();
        let engine = MirrorEngine::new(Arc::new(cp), policies, settings);
        (BackfillCoordinator::new(engine, Arc::new(publisher)), rx)
    }

    #[tokio::test]
    async fn test_single_page_publishes_nothing() {
        let (coordinator, mut rx) = coordinator(
            vec![instance(1, "running", "vpc-1"), instance(2, "running", "vpc-other")],
            10,
        );
        let report = coordinator
            .run_backfill_page(&Continuation::new("arn:topic", Some("StartToken".into())))
            .await
            .unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.provisioned, 1);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.next_token, None);
        assert!(rx.try_recv().is_err());
        assert_eq!(coordinator.engine().control_plane().calls(Operation::DescribeSubnet), 1);
    }

    #[tokio::test]
    async fn test_continuation_is_published() {
        let instances = (0..7).map(|n| instance(n, "running", "vpc-1")).collect();
        let (coordinator, mut rx) = coordinator(instances, 5);

        let report = coordinator
            .run_backfill_page(&Continuation::new("arn:topic", None))
            .await
            .unwrap();
        assert_eq!(report.provisioned, 5);
        let message = rx.try_recv().unwrap();
        assert_eq!(message.topic, "arn:topic");
        assert_eq!(message.next_token(), Some("5"));

        let report = coordinator.run_backfill_page(&message.continuation()).await.unwrap();
        assert_eq!(report.provisioned, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_redelivered_page_is_idempotent() {
        let (coordinator, _rx) = coordinator(vec![instance(1, "running", "vpc-1")], 5);
        let start = Continuation::new("arn:topic", Some("StartToken".into()));

        coordinator.run_backfill_page(&start).await.unwrap();
        let report = coordinator.run_backfill_page(&start).await.unwrap();
        assert_eq!(report.already_mirrored, 1);
        assert_eq!(coordinator.engine().control_plane().sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_interface_failure_does_not_abort_page() {
        let (coordinator, _rx) = coordinator(
            vec![instance(1, "running", "vpc-1"), instance(2, "running", "vpc-1")],
            5,
        );
        coordinator.engine().control_plane().fail_next(
            Operation::CreateSession,
            ControlPlaneError::api("CreateTrafficMirrorSession", "InternalError", "boom"),
        );

        let report = coordinator
            .run_backfill_page(&Continuation::new("arn:topic", None))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.provisioned, 1);
    }

    #[tokio::test]
    async fn test_inactive_instances_in_page_are_skipped() {
        let mut cp = MockControlPlane::new();
        let mut detached = instance(3, "running", "vpc-1");
        detached.network_interfaces.clear();
        let listed = vec![
            instance(1, "running", "vpc-1"),
            instance(2, "stopped", "vpc-1"),
            detached,
        ];
        cp.expect_describe_instances()
            .withf(|query| query.states == ["running".to_string()])
            .times(1)
            .returning(move |_| {
                Ok(InstancePage {
                    instances: listed.clone(),
                    next_token: None,
                })
            });
        cp.expect_describe_subnet().times(1).returning(|subnet_id| {
            Ok(SubnetRecord {
                subnet_id: subnet_id.to_string(),
                network_id: "vpc-1".into(),
                availability_zone_key: "use1-az1".into(),
            })
        });
        cp.expect_describe_targets()
            .withf(|filter| *filter == TargetFilter::NetworkInterface("eni-1".into()))
            .times(1)
            .returning(|_| Ok(vec![]));
        cp.expect_create_session()
            .withf(|req| req.network_interface_id == "eni-1" && req.target_id == "tmt-fixed")
            .times(1)
            .returning(|_| Ok("tms-1".into()));

        let settings = EngineSettings::default();
        let policies = PolicyStore::from_yaml_str(POLICY, &settings).unwrap();
        let (publisher, mut rx) = ChannelPublisher::new();
        let engine = MirrorEngine::new(Arc::new(cp), policies, settings);
        let coordinator = BackfillCoordinator::new(engine, Arc::new(publisher));

        let report = coordinator
            .run_backfill_page(&Continuation::new("arn:topic", None))
            .await
            .unwrap();
        assert_eq!(
            report,
            PageReport {
                processed: 3,
                provisioned: 1,
                skipped_inactive: 2,
                ..PageReport::default()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inventory_failure_fails_page() {
        let (coordinator, mut rx) = coordinator(vec![instance(1, "running", "vpc-1")], 5);
        coordinator.engine().control_plane().fail_next(
            Operation::DescribeInstances,
            ControlPlaneError::api("DescribeInstances", "Throttling", "slow down"),
        );

        let err = coordinator
            .run_backfill_page(&Continuation::new("arn:topic", None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackfillError::Inventory(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_failure_fails_page() {
        let instances = (0..6).map(|n| instance(n, "running", "vpc-1")).collect();
        let (coordinator, rx) = coordinator(instances, 5);
        drop(rx);

        let err = coordinator
            .run_backfill_page(&Continuation::new("arn:topic", None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackfillError::Publish(_)));
    }
}
