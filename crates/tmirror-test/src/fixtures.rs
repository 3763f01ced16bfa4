//! Test fixtures for common provisioning scenarios
//!
//! Provides fleet builders, policy documents and trigger payloads shared by
//! the scenario tests.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use tmirror_engine::control_plane::{InstanceInterface, InstanceRecord, MirrorTarget};
use tmirror_engine::{
    BackfillCoordinator, ChannelPublisher, ConfigError, Continuation, ContinuationMessage,
    EngineSettings, InMemoryControlPlane, MirrorEngine, ObservedInterface, PolicyStore, Tag,
};

/// Builds a running instance with a single primary interface `eni-<id>`.
pub fn running_instance(instance_id: &str, subnet_id: &str, network_id: &str) -> InstanceRecord {
    InstanceRecord {
        instance_id: instance_id.to_string(),
        state: "running".to_string(),
        subnet_id: subnet_id.to_string(),
        network_id: network_id.to_string(),
        network_interfaces: vec![InstanceInterface {
            network_interface_id: format!("eni-{}", instance_id),
            device_index: 0,
        }],
        tags: vec![],
    }
}

/// Builds an interface record in `use1-az1`.
pub fn interface(interface_id: &str, subnet_id: &str, network_id: &str) -> ObservedInterface {
    ObservedInterface::new(interface_id, subnet_id, network_id, "use1-az1")
}

/// Builds a mirror target with no tags.
pub fn target(target_id: &str) -> MirrorTarget {
    MirrorTarget {
        target_id: target_id.to_string(),
        network_interface_id: Some(format!("eni-{}", target_id)),
        tags: vec![],
    }
}

/// Builds a mirror target already serving `subnet_id`.
pub fn subnet_target(target_id: &str, settings: &EngineSettings, subnet_id: &str) -> MirrorTarget {
    MirrorTarget {
        tags: vec![Tag::new(settings.subnet_tag_key.clone(), subnet_id)],
        ..target(target_id)
    }
}

/// Incrementally assembles an in-memory fleet.
#[derive(Debug, Default)]
pub struct FleetBuilder {
    control_plane: InMemoryControlPlane,
}

impl FleetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subnet(self, subnet_id: &str, network_id: &str, availability_zone_key: &str) -> Self {
        self.control_plane.add_subnet(subnet_id, network_id, availability_zone_key);
        self
    }

    pub fn instance(self, instance: InstanceRecord) -> Self {
        self.control_plane.add_instance(instance);
        self
    }

    /// Adds `count` running instances `<prefix>-0000`, `<prefix>-0001`, ... in `subnet_id`.
    pub fn instances(self, prefix: &str, count: usize, subnet_id: &str, network_id: &str) -> Self {
        for n in 0..count {
            let instance_id = format!("{}-{:04}", prefix, n);
            self.control_plane
                .add_instance(running_instance(&instance_id, subnet_id, network_id));
        }
        self
    }

    pub fn target(self, target: MirrorTarget) -> Self {
        self.control_plane.add_target(target);
        self
    }

    /// Caps the sessions a single target accepts.
    pub fn target_capacity(self, capacity: usize) -> Self {
        Self {
            control_plane: self.control_plane.with_target_capacity(capacity),
        }
    }

    pub fn build(self) -> Arc<InMemoryControlPlane> {
        Arc::new(self.control_plane)
    }
}

/// An engine wired to an in-memory fleet and an in-process publisher.
pub struct TestHarness {
    pub control_plane: Arc<InMemoryControlPlane>,
    pub engine: MirrorEngine<InMemoryControlPlane>,
    pub publisher: Arc<ChannelPublisher>,
    pub published: UnboundedReceiver<ContinuationMessage>,
}

impl TestHarness {
    /// Loads `policy_yaml` and wires it to `control_plane`.
    pub fn new(
        control_plane: Arc<InMemoryControlPlane>,
        policy_yaml: &str,
        settings: EngineSettings,
    ) -> Result<Self, ConfigError> {
        let policies = PolicyStore::from_yaml_str(policy_yaml, &settings)?;
        let engine = MirrorEngine::new(Arc::clone(&control_plane), policies, settings);
        let (publisher, published) = ChannelPublisher::new();
        Ok(Self {
            control_plane,
            engine,
            publisher: Arc::new(publisher),
            published,
        })
    }

    pub fn coordinator(&self) -> BackfillCoordinator<InMemoryControlPlane, ChannelPublisher> {
        BackfillCoordinator::new(self.engine.clone(), Arc::clone(&self.publisher))
    }

    /// Takes every message published so far.
    pub fn drain_published(&mut self) -> Vec<ContinuationMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.published.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// The continuation that starts a backfill walk on `topic`.
pub fn start_continuation(topic: &str, settings: &EngineSettings) -> Continuation {
    Continuation::new(topic, Some(settings.start_token.clone()))
}

/// Policy documents
pub mod policy_fixtures {
    /// One policy of each kind, all pinned to fixed targets and filters.
    ///
    /// - tag `team=payments` -> `tmt-tag` / `tmf-tag`
    /// - subnet `subnet-1` -> `tmt-subnet` / `tmf-subnet`
    /// - network `vpc-1` -> `tmt-network` / `tmf-network`
    pub const PRIORITY: &str = r#"
tags:
  - tagList:
      - {Key: team, Value: payments}
    targetId: tmt-tag
    filterId: tmf-tag
subnets:
  - subnetId: subnet-1
    targetId: tmt-subnet
    filterId: tmf-subnet
networks:
  - networkId: vpc-1
    targetId: tmt-network
    filterId: tmf-network
"#;

    /// Network `vpc-1` pinned to `tmt-fixed` with filter `tmf-1`.
    pub const FIXED_NETWORK: &str = r#"
networks:
  - networkId: vpc-1
    targetId: tmt-fixed
    filterId: tmf-1
"#;

    /// Subnet `subnet-123` served by engine-created targets.
    pub const CREATED_SUBNET: &str = r#"
subnets:
  - subnetId: subnet-123
    targetCreation:
      imageId: ami-12345678
      instanceType: c5.large
      securityGroupIds: [sg-mirror]
    filterId: tmf-1
"#;

    /// Network `vpc-1` with filters keyed by the `server_type` tag.
    pub const CLASSIFIED_NETWORK: &str = r#"
networks:
  - networkId: vpc-1
    targetId: tmt-fixed
    filtersByClassification:
      web: tmf-web
      app: tmf-app
      db: tmf-db
"#;

    /// Network `vpc-1` with one target per availability zone.
    pub const ZONED_NETWORK: &str = r#"
networks:
  - networkId: vpc-1
    targetsByZone:
      az1: tmt-az1
      az2: tmt-az2
    filterId: tmf-1
"#;
}

/// Trigger payloads
pub mod event_fixtures {
    use super::*;
    use tmirror_engine::bootstrap::APP_CONFIGURATION_RESOURCE;
    use tmirror_engine::events::{INSTANCE_STATE_CHANGE, SECURITY_FINDING};

    /// Instance state-change notification.
    pub fn state_change(instance_id: &str, state: &str) -> Value {
        json!({
            "version": "0",
            "detail-type": INSTANCE_STATE_CHANGE,
            "source": "aws.ec2",
            "detail": {"instance-id": instance_id, "state": state}
        })
    }

    /// Security finding for an instance's primary interface.
    pub fn instance_finding(
        instance_id: &str,
        interface_id: &str,
        subnet_id: &str,
        network_id: &str,
        tags: &[(&str, &str)],
    ) -> Value {
        let tags: Vec<Value> = tags.iter().map(|(k, v)| json!({"key": k, "value": v})).collect();
        json!({
            "detail-type": SECURITY_FINDING,
            "detail": {
                "resource": {
                    "resourceType": "Instance",
                    "instanceDetails": {
                        "instanceId": instance_id,
                        "networkInterfaces": [{
                            "networkInterfaceId": interface_id,
                            "subnetId": subnet_id,
                            "vpcId": network_id
                        }],
                        "tags": tags
                    }
                }
            }
        })
    }

    /// Backfill continuation notification.
    pub fn continuation(topic: &str, next_token: &str) -> Value {
        json!({"Records": [{"Sns": {
            "TopicArn": topic,
            "Message": "Backfill existing instances",
            "MessageAttributes": {"NextToken": {"Type": "String", "Value": next_token}}
        }}]})
    }

    /// Provisioning lifecycle event for the backfill resource.
    pub fn lifecycle(request_type: &str, topic: Option<&str>) -> Value {
        let properties = match topic {
            Some(topic) => json!({"SNSTopicArn": topic}),
            None => json!({}),
        };
        json!({
            "RequestType": request_type,
            "ResourceType": APP_CONFIGURATION_RESOURCE,
            "ResourceProperties": properties
        })
    }
}
