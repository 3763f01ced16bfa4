//! Policy matching.

use crate::debug_log;
use crate::policy::PolicyEntry;
use crate::types::ObservedInterface;

/// Picks the policy that applies to `iface`.
///
/// A tag policy matches when the interface carries at least one of its tags,
/// compared on key and value; the first matching tag policy in `entries`
/// wins. Without a tag match, a subnet policy for the interface's subnet
/// applies, then a network policy for its network. Returns `None` when
/// nothing matches.
pub fn resolve<'a>(
    iface: &ObservedInterface,
    entries: &'a [PolicyEntry],
) -> Option<&'a PolicyEntry> {
    let by_tag = entries.iter().find(|entry| match entry {
        PolicyEntry::Tag { tags, .. } => tags.iter().any(|tag| iface.has_tag(tag)),
        _ => false,
    });

    let matched = by_tag
        .or_else(|| {
            entries.iter().find(|entry| {
                matches!(
                    entry,
                    PolicyEntry::Subnet { subnet_id, .. } if subnet_id == iface.subnet_id()
                )
            })
        })
        .or_else(|| {
            entries.iter().find(|entry| {
                matches!(
                    entry,
                    PolicyEntry::Network { network_id, .. } if network_id == iface.network_id()
                )
            })
        });

    match matched {
        Some(entry) => {
            debug_log!(
                "Resolver",
                interface_id = %iface.interface_id(),
                policy = %entry,
                "Policy matched"
            )
        }
        None => debug_log!("Resolver", interface_id = %iface.interface_id(), "No policy matched"),
    }

    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FilterSource, SessionConfig, TargetSource};
    use crate::types::Tag;
    use pretty_assertions::assert_eq;

    fn session(target: &str) -> SessionConfig {
        SessionConfig {
            target: TargetSource::Fixed(target.to_string()),
            filter: FilterSource::Fixed("tmf-1".to_string()),
        }
    }

    fn tag_policy(tags: &[(&str, &str)], target: &str) -> PolicyEntry {
        PolicyEntry::Tag {
            tags: tags.iter().map(|(k, v)| Tag::new(*k, *v)).collect(),
            session: session(target),
        }
    }

    fn entries() -> Vec<PolicyEntry> {
        vec![
            tag_policy(&[("team", "payments"), ("team", "billing")], "tmt-tag-team"),
            tag_policy(&[("env", "prod")], "tmt-tag-env"),
            PolicyEntry::Subnet {
                subnet_id: "subnet-1".to_string(),
                session: session("tmt-subnet"),
            },
            PolicyEntry::Network {
                network_id: "vpc-1".to_string(),
                session: session("tmt-network"),
            },
        ]
    }

    fn target_of(entry: Option<&PolicyEntry>) -> Option<&str> {
        entry.map(|e| match &e.session().target {
            TargetSource::Fixed(id) => id.as_str(),
            _ => "",
        })
    }

    #[test]
    fn test_tag_beats_subnet_and_network() {
        let iface = ObservedInterface::new("eni-1", "subnet-1", "vpc-1", "use1-az1")
            .with_tags([Tag::new("env", "prod")]);
        assert_eq!(target_of(resolve(&iface, &entries())), Some("tmt-tag-env"));
    }

    #[test]
    fn test_any_policy_tag_matches_and_first_policy_wins() {
        let iface = ObservedInterface::new("eni-1", "subnet-9", "vpc-9", "use1-az1")
            .with_tags([Tag::new("env", "prod"), Tag::new("team", "billing")]);
        assert_eq!(target_of(resolve(&iface, &entries())), Some("tmt-tag-team"));
    }

    #[test]
    fn test_tag_value_must_match() {
        let iface = ObservedInterface::new("eni-2", "subnet-1", "vpc-1", "use1-az1")
            .with_tags([Tag::new("env", "dev")]);
        assert_eq!(target_of(resolve(&iface, &entries())), Some("tmt-subnet"));
    }

    #[test]
    fn test_subnet_beats_network() {
        let iface = ObservedInterface::new("eni-1", "subnet-1", "vpc-1", "use1-az1");
        assert_eq!(target_of(resolve(&iface, &entries())), Some("tmt-subnet"));
    }

    #[test]
    fn test_network_fallback_and_no_match() {
        let iface = ObservedInterface::new("eni-1", "subnet-2", "vpc-1", "use1-az1");
        assert_eq!(target_of(resolve(&iface, &entries())), Some("tmt-network"));

        let stranger = ObservedInterface::new("eni-2", "subnet-2", "vpc-2", "use1-az1");
        assert!(resolve(&stranger, &entries()).is_none());
    }
}
