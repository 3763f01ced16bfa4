//! Verification helpers for the in-memory fleet
//!
//! Provides assertions over sessions, targets and the control-plane call
//! journal after a scenario has run.

use thiserror::Error;

use tmirror_engine::control_plane::memory::SessionRecord;
use tmirror_engine::control_plane::MirrorTarget;
use tmirror_engine::{InMemoryControlPlane, Operation};

/// Verification error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Expected a session for '{interface_id}', found none")]
    SessionNotFound { interface_id: String },

    #[error("Expected {expected} sessions for '{interface_id}', found {actual}")]
    SessionCountMismatch {
        interface_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Session {field} mismatch for '{interface_id}': expected '{expected}', got '{actual}'")]
    SessionMismatch {
        interface_id: String,
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Expected {expected} calls to {operation}, found {actual}")]
    CallCountMismatch {
        operation: Operation,
        expected: usize,
        actual: usize,
    },

    #[error("Expected {expected} targets tagged with '{subnet_id}', found {actual}")]
    SubnetTargetCountMismatch {
        subnet_id: String,
        expected: usize,
        actual: usize,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Fleet state verification helper
pub struct FleetVerifier<'a> {
    control_plane: &'a InMemoryControlPlane,
    subnet_tag_key: String,
}

impl<'a> FleetVerifier<'a> {
    /// `subnet_tag_key` is the tag linking targets to destination subnets.
    pub fn new(control_plane: &'a InMemoryControlPlane, subnet_tag_key: impl Into<String>) -> Self {
        Self {
            control_plane,
            subnet_tag_key: subnet_tag_key.into(),
        }
    }

    fn sessions_for(&self, interface_id: &str) -> Vec<SessionRecord> {
        self.control_plane
            .sessions()
            .into_iter()
            .filter(|s| s.network_interface_id == interface_id)
            .collect()
    }

    /// Verify that exactly one session mirrors `interface_id` and return it
    pub fn assert_single_session(&self, interface_id: &str) -> VerifyResult<SessionRecord> {
        let mut sessions = self.sessions_for(interface_id);
        match sessions.len() {
            0 => Err(VerificationError::SessionNotFound {
                interface_id: interface_id.to_string(),
            }),
            1 => Ok(sessions.remove(0)),
            actual => Err(VerificationError::SessionCountMismatch {
                interface_id: interface_id.to_string(),
                expected: 1,
                actual,
            }),
        }
    }

    /// Verify the single session of `interface_id` uses `target_id` and `filter_id`
    pub fn assert_session(
        &self,
        interface_id: &str,
        target_id: &str,
        filter_id: &str,
    ) -> VerifyResult<()> {
        let session = self.assert_single_session(interface_id)?;
        if session.target_id != target_id {
            return Err(VerificationError::SessionMismatch {
                interface_id: interface_id.to_string(),
                field: "target",
                expected: target_id.to_string(),
                actual: session.target_id,
            });
        }
        if session.filter_id != filter_id {
            return Err(VerificationError::SessionMismatch {
                interface_id: interface_id.to_string(),
                field: "filter",
                expected: filter_id.to_string(),
                actual: session.filter_id,
            });
        }
        Ok(())
    }

    /// Verify that no session mirrors `interface_id`
    pub fn assert_no_session(&self, interface_id: &str) -> VerifyResult<()> {
        let actual = self.sessions_for(interface_id).len();
        if actual != 0 {
            return Err(VerificationError::SessionCountMismatch {
                interface_id: interface_id.to_string(),
                expected: 0,
                actual,
            });
        }
        Ok(())
    }

    /// Verify the number of calls made to `operation`, failed ones included
    pub fn assert_calls(&self, operation: Operation, expected: usize) -> VerifyResult<()> {
        let actual = self.control_plane.calls(operation);
        if actual != expected {
            return Err(VerificationError::CallCountMismatch {
                operation,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Targets currently tagged as serving `subnet_id`
    pub fn targets_for_subnet(&self, subnet_id: &str) -> Vec<MirrorTarget> {
        self.control_plane
            .targets()
            .into_iter()
            .filter(|t| t.tag_value(&self.subnet_tag_key) == Some(subnet_id))
            .collect()
    }

    /// Verify how many targets are tagged as serving `subnet_id`
    pub fn assert_subnet_targets(
        &self,
        subnet_id: &str,
        expected: usize,
    ) -> VerifyResult<Vec<MirrorTarget>> {
        let targets = self.targets_for_subnet(subnet_id);
        if targets.len() != expected {
            return Err(VerificationError::SubnetTargetCountMismatch {
                subnet_id: subnet_id.to_string(),
                expected,
                actual: targets.len(),
            });
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{target, FleetBuilder};

    #[test]
    fn test_missing_session_reported() {
        let fleet = FleetBuilder::new().target(target("tmt-1")).build();
        let verifier = FleetVerifier::new(&fleet, "TargetSubnetId");
        assert_eq!(
            verifier.assert_single_session("eni-1").unwrap_err(),
            VerificationError::SessionNotFound {
                interface_id: "eni-1".to_string()
            }
        );
        assert!(verifier.assert_no_session("eni-1").is_ok());
        assert!(verifier.assert_calls(Operation::CreateSession, 0).is_ok());
        assert!(verifier.assert_subnet_targets("subnet-1", 0).is_ok());
    }
}
