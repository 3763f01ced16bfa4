//! Resolution and provisioning pipeline for one interface.

use serde::Serialize;
use std::sync::Arc;

use crate::control_plane::ControlPlane;
use crate::error::ProvisionError;
use crate::info_log;
use crate::policy::PolicyStore;
use crate::provisioner::{SessionOutcome, SessionProvisioner};
use crate::resolver::resolve;
use crate::settings::EngineSettings;
use crate::types::ObservedInterface;

/// Result of running the pipeline for one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceOutcome {
    /// No tag, subnet or network policy applies.
    NoPolicyMatch,
    Session(SessionOutcome),
}

/// Shared, read-only engine state: the control plane, the policy store and
/// the settings. Cheap to clone; every invocation works from its own clone.
pub struct MirrorEngine<C: ControlPlane + ?Sized> {
    control_plane: Arc<C>,
    policies: Arc<PolicyStore>,
    settings: Arc<EngineSettings>,
}

impl<C: ControlPlane + ?Sized> Clone for MirrorEngine<C> {
    fn clone(&self) -> Self {
        Self {
            control_plane: Arc::clone(&self.control_plane),
            policies: Arc::clone(&self.policies),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<C: ControlPlane + ?Sized> MirrorEngine<C> {
    pub fn new(control_plane: Arc<C>, policies: PolicyStore, settings: EngineSettings) -> Self {
        Self {
            control_plane,
            policies: Arc::new(policies),
            settings: Arc::new(settings),
        }
    }

    pub fn control_plane(&self) -> &C {
        &self.control_plane
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Resolves the policy for `iface` and provisions its session.
    pub async fn handle_interface(
        &self,
        iface: &ObservedInterface,
    ) -> Result<InterfaceOutcome, ProvisionError> {
        let Some(policy) = resolve(iface, self.policies.entries()) else {
            info_log!(
                "MirrorEngine",
                interface_id = %iface.interface_id(),
                subnet_id = %iface.subnet_id(),
                network_id = %iface.network_id(),
                "Interface does not match any tag, subnet or network policy"
            );
            return Ok(InterfaceOutcome::NoPolicyMatch);
        };

        info_log!(
            "MirrorEngine",
            interface_id = %iface.interface_id(),
            policy = %policy,
            "Provisioning interface"
        );
        SessionProvisioner::new(self.control_plane.as_ref(), &self.settings)
            .provision_session(iface, policy)
            .await
            .map(InterfaceOutcome::Session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::memory::{InMemoryControlPlane, Operation};
    use crate::control_plane::MirrorTarget;

    const POLICY: &str =
        "networks:\n  - networkId: vpc-1\n    targetId: tmt-fixed\n    filterId: tmf-1\n";

    fn engine() -> MirrorEngine<InMemoryControlPlane> {
        let cp = InMemoryControlPlane::new();
        cp.add_target(MirrorTarget {
            target_id: "tmt-fixed".into(),
            network_interface_id: Some("eni-target".into()),
            tags: vec![],
        });
        let settings = EngineSettings::default();
        let policies = PolicyStore::from_yaml_str(POLICY, &settings).unwrap();
        MirrorEngine::new(Arc::new(cp), policies, settings)
    }

    #[tokio::test]
    async fn test_unmatched_interface_does_nothing() {
        let engine = engine();
        let iface = ObservedInterface::new("eni-1", "subnet-1", "vpc-other", "use1-az1");
        let outcome = engine.handle_interface(&iface).await.unwrap();
        assert_eq!(outcome, InterfaceOutcome::NoPolicyMatch);
        assert!(engine.control_plane().journal().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_creates_one_session() {
        let engine = engine();
        let iface = ObservedInterface::new("eni-1", "subnet-1", "vpc-1", "use1-az1");

        let first = engine.handle_interface(&iface).await.unwrap();
        assert!(matches!(first, InterfaceOutcome::Session(SessionOutcome::Created { .. })));

        let second = engine.clone().handle_interface(&iface).await.unwrap();
        assert_eq!(
            second,
            InterfaceOutcome::Session(SessionOutcome::AlreadyMirrored {
                target_id: "tmt-fixed".into()
            })
        );
        assert_eq!(engine.control_plane().calls(Operation::CreateSession), 1);
    }
}
