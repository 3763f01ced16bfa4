//! In-memory control plane.
//!
//! A deterministic fleet model: instances, subnets, mirror targets and
//! sessions, with a per-target session capacity, queued fault injection per
//! operation, and a journal of every call. Identifiers are allocated from a
//! counter so runs are reproducible.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use super::{
    ControlPlane, ControlPlaneError, ControlPlaneResult, InstanceInterface, InstancePage,
    InstanceQuery, InstanceRecord, LaunchRequest, LaunchedInstance, MirrorTarget, SessionRequest,
    SubnetRecord, TargetFilter, TargetRequest, SOURCES_PER_TARGET_LIMIT_EXCEEDED,
};
use crate::types::Tag;

/// Control-plane operations, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    DescribeInstances,
    DescribeInstance,
    DescribeSubnet,
    DescribeTargets,
    RunInstance,
    TerminateInstance,
    CreateTarget,
    TagResource,
    UntagResource,
    CreateSession,
}

impl Operation {
    /// API name used in error messages.
    pub fn api_name(&self) -> &'static str {
        match self {
            Operation::DescribeInstances | Operation::DescribeInstance => "DescribeInstances",
            Operation::DescribeSubnet => "DescribeSubnets",
            Operation::DescribeTargets => "DescribeTrafficMirrorTargets",
            Operation::RunInstance => "RunInstances",
            Operation::TerminateInstance => "TerminateInstances",
            Operation::CreateTarget => "CreateTrafficMirrorTarget",
            Operation::TagResource => "CreateTags",
            Operation::UntagResource => "DeleteTags",
            Operation::CreateSession => "CreateTrafficMirrorSession",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// A session held by the in-memory control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub network_interface_id: String,
    pub target_id: String,
    pub filter_id: String,
    pub session_number: u32,
}

/// Serializable fleet state, used to seed and dump the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    #[serde(default)]
    pub subnets: Vec<SubnetRecord>,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub targets: Vec<MirrorTarget>,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
    /// Sessions a single target accepts; unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_capacity: Option<usize>,
}

#[derive(Debug, Default)]
struct FleetState {
    fleet: FleetSnapshot,
    next_id: u64,
    faults: HashMap<Operation, VecDeque<ControlPlaneError>>,
    journal: Vec<Operation>,
}

impl FleetState {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }

    /// Journals the call and pops a queued fault for it, if any.
    fn enter(&mut self, op: Operation) -> ControlPlaneResult<()> {
        self.journal.push(op);
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn subnet(&self, subnet_id: &str) -> Option<&SubnetRecord> {
        self.fleet.subnets.iter().find(|s| s.subnet_id == subnet_id)
    }

    fn tags_of_mut(&mut self, resource_id: &str) -> Option<&mut Vec<Tag>> {
        if let Some(target) = self.fleet.targets.iter_mut().find(|t| t.target_id == resource_id) {
            return Some(&mut target.tags);
        }
        self.fleet
            .instances
            .iter_mut()
            .find(|i| i.instance_id == resource_id)
            .map(|i| &mut i.tags)
    }
}

/// Deterministic in-memory [`ControlPlane`].
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    state: Mutex<FleetState>,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(fleet: FleetSnapshot) -> Self {
        Self {
            state: Mutex::new(FleetState {
                fleet,
                ..FleetState::default()
            }),
        }
    }

    /// Limits how many sessions a single target accepts.
    pub fn with_target_capacity(self, capacity: usize) -> Self {
        self.state.lock().fleet.target_capacity = Some(capacity);
        self
    }

    pub fn add_subnet(&self, subnet_id: &str, network_id: &str, availability_zone_key: &str) {
        self.state.lock().fleet.subnets.push(SubnetRecord {
            subnet_id: subnet_id.to_string(),
            network_id: network_id.to_string(),
            availability_zone_key: availability_zone_key.to_string(),
        });
    }

    pub fn add_instance(&self, instance: InstanceRecord) {
        self.state.lock().fleet.instances.push(instance);
    }

    pub fn add_target(&self, target: MirrorTarget) {
        self.state.lock().fleet.targets.push(target);
    }

    /// Makes the next call to `op` fail with `error`. Faults queue up per operation.
    pub fn fail_next(&self, op: Operation, error: ControlPlaneError) {
        self.state.lock().faults.entry(op).or_default().push_back(error);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().journal.iter().filter(|o| **o == op).count()
    }

    pub fn journal(&self) -> Vec<Operation> {
        self.state.lock().journal.clone()
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.state.lock().fleet.clone()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.state.lock().fleet.sessions.clone()
    }

    pub fn targets(&self) -> Vec<MirrorTarget> {
        self.state.lock().fleet.targets.clone()
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.state
            .lock()
            .fleet
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned()
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn describe_instances(&self, query: &InstanceQuery) -> ControlPlaneResult<InstancePage> {
        let mut state = self.state.lock();
        state.enter(Operation::DescribeInstances)?;

        let offset = match query.next_token.as_deref() {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| {
                ControlPlaneError::api(
                    Operation::DescribeInstances.api_name(),
                    "InvalidParameterValue",
                    format!("invalid next token '{}'", token),
                )
            })?,
        };

        let matching: Vec<&InstanceRecord> = state
            .fleet
            .instances
            .iter()
            .filter(|i| query.states.is_empty() || query.states.contains(&i.state))
            .collect();

        let page_size = query.max_results.max(1);
        let end = offset.saturating_add(page_size).min(matching.len());
        let instances = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|i| (*i).clone())
            .collect();
        let next_token = (end < matching.len()).then(|| end.to_string());

        Ok(InstancePage { instances, next_token })
    }

    async fn describe_instance(&self, instance_id: &str) -> ControlPlaneResult<InstanceRecord> {
        let mut state = self.state.lock();
        state.enter(Operation::DescribeInstance)?;
        state
            .fleet
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned()
            .ok_or_else(|| {
                ControlPlaneError::not_found(Operation::DescribeInstance.api_name(), instance_id)
            })
    }

    async fn describe_subnet(&self, subnet_id: &str) -> ControlPlaneResult<SubnetRecord> {
        let mut state = self.state.lock();
        state.enter(Operation::DescribeSubnet)?;
        state
            .subnet(subnet_id)
            .cloned()
            .ok_or_else(|| {
                ControlPlaneError::not_found(Operation::DescribeSubnet.api_name(), subnet_id)
            })
    }

    async fn describe_targets(
        &self,
        filter: &TargetFilter,
    ) -> ControlPlaneResult<Vec<MirrorTarget>> {
        let mut state = self.state.lock();
        state.enter(Operation::DescribeTargets)?;
        let fleet = &state.fleet;
        let targets = fleet
            .targets
            .iter()
            .filter(|t| match filter {
                TargetFilter::NetworkInterface(id) => {
                    t.network_interface_id.as_deref() == Some(id.as_str())
                        || fleet
                            .sessions
                            .iter()
                            .any(|s| s.network_interface_id == *id && s.target_id == t.target_id)
                }
                TargetFilter::Tag { key, value } => t.tag_value(key) == Some(value.as_str()),
            })
            .cloned()
            .collect();
        Ok(targets)
    }

    async fn run_instance(&self, request: &LaunchRequest) -> ControlPlaneResult<LaunchedInstance> {
        let mut state = self.state.lock();
        state.enter(Operation::RunInstance)?;

        let network_id = state
            .subnet(&request.subnet_id)
            .map(|s| s.network_id.clone())
            .ok_or_else(|| {
                ControlPlaneError::not_found(Operation::RunInstance.api_name(), &request.subnet_id)
            })?;

        let instance_id = state.allocate("i");
        let interface_id = state.allocate("eni");
        state.fleet.instances.push(InstanceRecord {
            instance_id: instance_id.clone(),
            state: "running".to_string(),
            subnet_id: request.subnet_id.clone(),
            network_id,
            network_interfaces: vec![InstanceInterface {
                network_interface_id: interface_id.clone(),
                device_index: 0,
            }],
            tags: request.tags.clone(),
        });

        Ok(LaunchedInstance {
            instance_id,
            primary_interface_id: interface_id,
        })
    }

    async fn terminate_instance(&self, instance_id: &str) -> ControlPlaneResult<()> {
        let mut state = self.state.lock();
        state.enter(Operation::TerminateInstance)?;
        let instance = state
            .fleet
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| {
                ControlPlaneError::not_found(Operation::TerminateInstance.api_name(), instance_id)
            })?;
        instance.state = "terminated".to_string();
        Ok(())
    }

    async fn create_target(&self, request: &TargetRequest) -> ControlPlaneResult<MirrorTarget> {
        let mut state = self.state.lock();
        state.enter(Operation::CreateTarget)?;
        let target = MirrorTarget {
            target_id: state.allocate("tmt"),
            network_interface_id: Some(request.network_interface_id.clone()),
            tags: request.tags.clone(),
        };
        state.fleet.targets.push(target.clone());
        Ok(target)
    }

    async fn tag_resource(&self, resource_id: &str, tags: &[Tag]) -> ControlPlaneResult<()> {
        let mut state = self.state.lock();
        state.enter(Operation::TagResource)?;
        let existing = state
            .tags_of_mut(resource_id)
            .ok_or_else(|| {
                ControlPlaneError::not_found(Operation::TagResource.api_name(), resource_id)
            })?;
        for tag in tags {
            existing.retain(|t| t.key != tag.key);
            existing.push(tag.clone());
        }
        Ok(())
    }

    async fn untag_resource(&self, resource_id: &str, keys: &[String]) -> ControlPlaneResult<()> {
        let mut state = self.state.lock();
        state.enter(Operation::UntagResource)?;
        let existing = state
            .tags_of_mut(resource_id)
            .ok_or_else(|| {
                ControlPlaneError::not_found(Operation::UntagResource.api_name(), resource_id)
            })?;
        existing.retain(|t| !keys.contains(&t.key));
        Ok(())
    }

    async fn create_session(&self, request: &SessionRequest) -> ControlPlaneResult<String> {
        let mut state = self.state.lock();
        state.enter(Operation::CreateSession)?;

        if !state.fleet.targets.iter().any(|t| t.target_id == request.target_id) {
            return Err(ControlPlaneError::not_found(
                Operation::CreateSession.api_name(),
                &request.target_id,
            ));
        }

        if let Some(capacity) = state.fleet.target_capacity {
            let used = state
                .fleet
                .sessions
                .iter()
                .filter(|s| s.target_id == request.target_id)
                .count();
            if used >= capacity {
                return Err(ControlPlaneError::limit_exceeded(
                    Operation::CreateSession.api_name(),
                    SOURCES_PER_TARGET_LIMIT_EXCEEDED,
                    format!("target {} already serves {} sources", request.target_id, used),
                ));
            }
        }

        let session_id = state.allocate("tms");
        state.fleet.sessions.push(SessionRecord {
            session_id: session_id.clone(),
            network_interface_id: request.network_interface_id.clone(),
            target_id: request.target_id.clone(),
            filter_id: request.filter_id.clone(),
            session_number: request.session_number,
        });
        Ok(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, state: &str) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            state: state.to_string(),
            subnet_id: "subnet-1".to_string(),
            network_id: "vpc-1".to_string(),
            network_interfaces: vec![InstanceInterface {
                network_interface_id: format!("eni-{}", id),
                device_index: 0,
            }],
            tags: vec![],
        }
    }

    fn query(token: Option<&str>) -> InstanceQuery {
        InstanceQuery {
            states: vec!["running".to_string()],
            max_results: 2,
            next_token: token.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_describe_instances_paginates_running_only() {
        let cp = InMemoryControlPlane::new();
        cp.add_instance(instance("a", "running"));
        cp.add_instance(instance("b", "stopped"));
        cp.add_instance(instance("c", "running"));
        cp.add_instance(instance("d", "running"));

        let first = cp.describe_instances(&query(None)).await.unwrap();
        assert_eq!(first.instances.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("2"));

        let second = cp.describe_instances(&query(first.next_token.as_deref())).await.unwrap();
        assert_eq!(second.instances.len(), 1);
        assert_eq!(second.instances[0].instance_id, "d");
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let cp = InMemoryControlPlane::new();
        let err = cp.describe_instances(&query(Some("bogus"))).await.unwrap_err();
        assert!(!err.is_limit_exceeded());
    }

    #[tokio::test]
    async fn test_session_capacity() {
        let cp = InMemoryControlPlane::new().with_target_capacity(1);
        cp.add_target(MirrorTarget {
            target_id: "tmt-1".into(),
            network_interface_id: Some("eni-t".into()),
            tags: vec![],
        });
        let request = |eni: &str| SessionRequest {
            network_interface_id: eni.to_string(),
            target_id: "tmt-1".to_string(),
            filter_id: "tmf-1".to_string(),
            session_number: 100,
        };

        assert!(cp.create_session(&request("eni-1")).await.is_ok());
        let err = cp.create_session(&request("eni-2")).await.unwrap_err();
        assert!(err.is_target_capacity_exhausted());
        assert_eq!(cp.sessions().len(), 1);
        assert_eq!(cp.calls(Operation::CreateSession), 2);
    }

    #[tokio::test]
    async fn test_interface_filter_sees_session_association() {
        let cp = InMemoryControlPlane::new();
        cp.add_target(MirrorTarget {
            target_id: "tmt-1".into(),
            network_interface_id: Some("eni-t".into()),
            tags: vec![],
        });
        let source = TargetFilter::NetworkInterface("eni-src".into());
        assert!(cp.describe_targets(&source).await.unwrap().is_empty());

        cp.create_session(&SessionRequest {
            network_interface_id: "eni-src".into(),
            target_id: "tmt-1".into(),
            filter_id: "tmf-1".into(),
            session_number: 100,
        })
        .await
        .unwrap();
        assert_eq!(cp.describe_targets(&source).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let cp = InMemoryControlPlane::new();
        cp.add_subnet("subnet-1", "vpc-1", "use1-az1");
        cp.fail_next(
            Operation::DescribeSubnet,
            ControlPlaneError::api("DescribeSubnets", "Throttling", "slow down"),
        );

        assert!(cp.describe_subnet("subnet-1").await.is_err());
        assert!(cp.describe_subnet("subnet-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_tag_and_untag_target() {
        let cp = InMemoryControlPlane::new();
        cp.add_target(MirrorTarget {
            target_id: "tmt-1".into(),
            network_interface_id: None,
            tags: vec![],
        });
        let by_subnet = TargetFilter::Tag {
            key: "TargetSubnetId".into(),
            value: "subnet-9".into(),
        };

        cp.tag_resource("tmt-1", &[Tag::new("TargetSubnetId", "subnet-9")]).await.unwrap();
        assert_eq!(cp.describe_targets(&by_subnet).await.unwrap().len(), 1);

        cp.untag_resource("tmt-1", &["TargetSubnetId".to_string()]).await.unwrap();
        assert!(cp.describe_targets(&by_subnet).await.unwrap().is_empty());
    }
}
