//! Policy store.
//!
//! The policy document is YAML with three optional sections, each a list of
//! entries combining a match key with a session config:
//!
//! ```yaml
//! tags:
//!   - tagList: [{Key: env, Value: prod}]
//!     targetCreation:
//!       imageId: ami-0abc
//!       instanceType: c5n.large
//!       securityGroupIds: [sg-1]
//!       targetSubnetId: subnet-mirror   # optional, defaults to the source subnet
//!     filtersByClassification: {web: tmf-web, app: tmf-app, db: tmf-db}
//! subnets:
//!   - subnetId: subnet-123
//!     targetsByZone: {az1: tmt-a, az2: tmt-b}
//!     filterId: tmf-all
//! networks:          # `vpcs` is accepted as well
//!   - networkId: vpc-1
//!     targetId: tmt-fixed
//!     filterId: tmf-all
//! ```
//!
//! The document is validated in full at load; a store that exists is valid.
//! Entries keep their document order within each section, which is the
//! tie-break when several tag policies match.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::error::{ConfigError, ConfigResult};
use crate::settings::EngineSettings;
use crate::types::Tag;
use crate::{audit_log, info_log};

/// Value left in templates for fields the operator has to fill in.
const PLACEHOLDER: &str = "<INSERT_VALUE>";

/// `targetsByZone` is keyed by the last characters of the zone key
/// (`use1-az1` -> `az1`).
const ZONE_SUFFIX_LEN: usize = 3;

/// Where a policy's mirror target comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    /// A single target pinned by the operator.
    Fixed(String),
    /// A pinned target per availability-zone suffix.
    PerZone(BTreeMap<String, String>),
    /// Targets discovered by subnet tag, or created on demand.
    Create(TargetCreation),
}

/// Parameters for launching a target's backing instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCreation {
    pub image_id: String,
    pub instance_type: String,
    pub security_group_ids: Vec<String>,
    /// Destination subnet; the source interface's subnet when absent.
    pub target_subnet_id: Option<String>,
}

/// Where a policy's mirror filter comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    Fixed(String),
    /// Keyed by the interface's classification tag value.
    ByClassification(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub target: TargetSource,
    pub filter: FilterSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Tag,
    Subnet,
    Network,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Tag => write!(f, "tag"),
            PolicyKind::Subnet => write!(f, "subnet"),
            PolicyKind::Network => write!(f, "network"),
        }
    }
}

/// A match rule with its session config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEntry {
    Tag { tags: Vec<Tag>, session: SessionConfig },
    Subnet { subnet_id: String, session: SessionConfig },
    Network { network_id: String, session: SessionConfig },
}

impl PolicyEntry {
    pub fn session(&self) -> &SessionConfig {
        match self {
            PolicyEntry::Tag { session, .. }
            | PolicyEntry::Subnet { session, .. }
            | PolicyEntry::Network { session, .. } => session,
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            PolicyEntry::Tag { .. } => PolicyKind::Tag,
            PolicyEntry::Subnet { .. } => PolicyKind::Subnet,
            PolicyEntry::Network { .. } => PolicyKind::Network,
        }
    }
}

impl fmt::Display for PolicyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEntry::Tag { tags, .. } => {
                let tags: Vec<String> = tags.iter().map(Tag::to_string).collect();
                write!(f, "tag policy [{}]", tags.join(", "))
            }
            PolicyEntry::Subnet { subnet_id, .. } => write!(f, "subnet policy {}", subnet_id),
            PolicyEntry::Network { network_id, .. } => write!(f, "network policy {}", network_id),
        }
    }
}

/// Immutable, validated set of policies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyStore {
    entries: Vec<PolicyEntry>,
}

impl PolicyStore {
    /// Builds a store from already-constructed entries, kept in the given order.
    pub fn new(entries: Vec<PolicyEntry>) -> Self {
        Self { entries }
    }

    /// Path of the policy document selected for `region`.
    pub fn policy_path(policy_dir: impl AsRef<Path>, region: &str) -> PathBuf {
        policy_dir.as_ref().join(format!("{}.yaml", region))
    }

    pub fn load_from_file(path: impl AsRef<Path>, settings: &EngineSettings) -> ConfigResult<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let store = Self::from_yaml_str(&yaml, settings)?;

        info_log!(
            "PolicyStore",
            path = %path.display(),
            entries = store.len(),
            "Policy document loaded"
        );
        audit_log!(AuditRecord::new(
            AuditCategory::ConfigurationChange,
            "PolicyStore",
            "load_policies"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(path.display().to_string())
        .with_object_type("policy_document")
        .with_details(serde_json::json!({
            "tag_policies": store.count(PolicyKind::Tag),
            "subnet_policies": store.count(PolicyKind::Subnet),
            "network_policies": store.count(PolicyKind::Network),
        })));

        Ok(store)
    }

    pub fn from_yaml_str(yaml: &str, settings: &EngineSettings) -> ConfigResult<Self> {
        let document: PolicyDocument = if yaml.trim().is_empty() {
            PolicyDocument::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        document.validate(settings)
    }

    /// All entries: tag policies, then subnet policies, then network policies.
    pub fn entries(&self) -> &[PolicyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: PolicyKind) -> usize {
        self.entries.iter().filter(|e| e.kind() == kind).count()
    }
}

// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyDocument {
    #[serde(default)]
    tags: Vec<RawTagPolicy>,
    #[serde(default)]
    subnets: Vec<RawSubnetPolicy>,
    #[serde(default, alias = "vpcs")]
    networks: Vec<RawNetworkPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTagPolicy {
    #[serde(default)]
    tag_list: Vec<RawTag>,
    #[serde(flatten)]
    session: RawSessionConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubnetPolicy {
    subnet_id: Option<String>,
    #[serde(flatten)]
    session: RawSessionConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNetworkPolicy {
    #[serde(alias = "vpcId")]
    network_id: Option<String>,
    #[serde(flatten)]
    session: RawSessionConfig,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    #[serde(rename = "Key", alias = "key")]
    key: Option<String>,
    #[serde(rename = "Value", alias = "value")]
    value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSessionConfig {
    target_id: Option<String>,
    #[serde(default)]
    targets_by_zone: BTreeMap<String, String>,
    target_creation: Option<RawTargetCreation>,
    filter_id: Option<String>,
    #[serde(default)]
    filters_by_classification: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTargetCreation {
    image_id: Option<String>,
    instance_type: Option<String>,
    #[serde(default)]
    security_group_ids: Vec<String>,
    target_subnet_id: Option<String>,
}

/// A configured value counts only when non-blank and not the template placeholder.
fn provided(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty() && *v != PLACEHOLDER)
}

impl PolicyDocument {
    fn validate(self, settings: &EngineSettings) -> ConfigResult<PolicyStore> {
        let mut entries =
            Vec::with_capacity(self.tags.len() + self.subnets.len() + self.networks.len());

        for (index, raw) in self.tags.into_iter().enumerate() {
            let invalid = |message: String| ConfigError::invalid_policy("tags", index, message);
            if raw.tag_list.is_empty() {
                return Err(invalid("tagList must list at least one tag".to_string()));
            }
            let mut tags = Vec::with_capacity(raw.tag_list.len());
            for tag in raw.tag_list {
                let key = provided(tag.key.as_deref())
                    .ok_or_else(|| invalid("tag is missing its Key".to_string()))?;
                tags.push(Tag::new(key, tag.value.unwrap_or_default()));
            }
            let session = raw.session.validate(settings).map_err(invalid)?;
            entries.push(PolicyEntry::Tag { tags, session });
        }

        for (index, raw) in self.subnets.into_iter().enumerate() {
            let invalid = |message: String| ConfigError::invalid_policy("subnets", index, message);
            let subnet_id = provided(raw.subnet_id.as_deref())
                .ok_or_else(|| invalid("missing subnetId".to_string()))?
                .to_string();
            let session = raw.session.validate(settings).map_err(invalid)?;
            entries.push(PolicyEntry::Subnet { subnet_id, session });
        }

        for (index, raw) in self.networks.into_iter().enumerate() {
            let invalid = |message: String| ConfigError::invalid_policy("networks", index, message);
            let network_id = provided(raw.network_id.as_deref())
                .ok_or_else(|| invalid("missing networkId".to_string()))?
                .to_string();
            let session = raw.session.validate(settings).map_err(invalid)?;
            entries.push(PolicyEntry::Network { network_id, session });
        }

        if entries.is_empty() {
            return Err(ConfigError::Empty);
        }

        Ok(PolicyStore::new(entries))
    }
}

impl RawSessionConfig {
    fn validate(self, settings: &EngineSettings) -> Result<SessionConfig, String> {
        let fixed_target = provided(self.target_id.as_deref()).map(str::to_string);
        let sources = usize::from(fixed_target.is_some())
            + usize::from(!self.targets_by_zone.is_empty())
            + usize::from(self.target_creation.is_some());
        if sources != 1 {
            return Err(
                "exactly one of targetId, targetsByZone or targetCreation is required".to_string(),
            );
        }

        let target = if let Some(target_id) = fixed_target {
            TargetSource::Fixed(target_id)
        } else if let Some(creation) = self.target_creation {
            TargetSource::Create(creation.validate()?)
        } else {
            for (zone, target_id) in &self.targets_by_zone {
                if zone.chars().count() != ZONE_SUFFIX_LEN {
                    return Err(format!(
                        "targetsByZone key '{}' must be a {}-character zone suffix such as 'az1'",
                        zone, ZONE_SUFFIX_LEN
                    ));
                }
                if provided(Some(target_id.as_str())).is_none() {
                    return Err(format!("targetsByZone.{} has no target id", zone));
                }
            }
            TargetSource::PerZone(self.targets_by_zone)
        };

        let fixed_filter = provided(self.filter_id.as_deref()).map(str::to_string);
        let filter = match (fixed_filter, self.filters_by_classification.is_empty()) {
            (Some(filter_id), true) => FilterSource::Fixed(filter_id),
            (None, false) => {
                for (class, filter_id) in &self.filters_by_classification {
                    if !settings.is_classification(class) {
                        return Err(format!(
                            "filtersByClassification.{} is not one of {}",
                            class,
                            settings.classification_values.join(", ")
                        ));
                    }
                    if provided(Some(filter_id.as_str())).is_none() {
                        return Err(format!("filtersByClassification.{} has no filter id", class));
                    }
                }
                FilterSource::ByClassification(self.filters_by_classification)
            }
            _ => {
                return Err(
                    "exactly one of filterId or filtersByClassification is required".to_string(),
                )
            }
        };

        Ok(SessionConfig { target, filter })
    }
}

impl RawTargetCreation {
    fn validate(self) -> Result<TargetCreation, String> {
        let image_id = provided(self.image_id.as_deref())
            .ok_or("targetCreation.imageId is required")?
            .to_string();
        let instance_type = provided(self.instance_type.as_deref())
            .ok_or("targetCreation.instanceType is required")?
            .to_string();
        if self.security_group_ids.is_empty()
            || self.security_group_ids.iter().any(|sg| provided(Some(sg.as_str())).is_none())
        {
            return Err("targetCreation.securityGroupIds must list at least one group".to_string());
        }
        Ok(TargetCreation {
            image_id,
            instance_type,
            security_group_ids: self.security_group_ids,
            target_subnet_id: provided(self.target_subnet_id.as_deref()).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const DOCUMENT: &str = r#"
tags:
  - tagList:
      - Key: env
        Value: prod
    targetCreation:
      imageId: ami-1
      instanceType: c5n.large
      securityGroupIds: [sg-1]
    filtersByClassification:
      web: tmf-web
      db: tmf-db
subnets:
  - subnetId: subnet-123
    targetsByZone:
      az1: tmt-a
    filterId: tmf-all
vpcs:
  - vpcId: vpc-1
    targetId: tmt-fixed
    filterId: tmf-all
"#;

    fn load(yaml: &str) -> ConfigResult<PolicyStore> {
        PolicyStore::from_yaml_str(yaml, &EngineSettings::default())
    }

    #[test]
    fn test_load_document_in_section_order() {
        let store = load(DOCUMENT).unwrap();
        assert_eq!(store.len(), 3);
        let kinds: Vec<PolicyKind> = store.entries().iter().map(PolicyEntry::kind).collect();
        assert_eq!(kinds, vec![PolicyKind::Tag, PolicyKind::Subnet, PolicyKind::Network]);

        match &store.entries()[0] {
            PolicyEntry::Tag { tags, session } => {
                assert_eq!(tags, &vec![Tag::new("env", "prod")]);
                assert!(matches!(
                    session.target,
                    TargetSource::Create(ref c) if c.target_subnet_id.is_none()
                ));
                assert!(matches!(
                    session.filter,
                    FilterSource::ByClassification(ref m) if m.len() == 2
                ));
            }
            other => panic!("unexpected entry {:?}", other),
        }

        assert_eq!(
            store.entries()[2],
            PolicyEntry::Network {
                network_id: "vpc-1".to_string(),
                session: SessionConfig {
                    target: TargetSource::Fixed("tmt-fixed".to_string()),
                    filter: FilterSource::Fixed("tmf-all".to_string()),
                },
            }
        );
    }

    #[test]
    fn test_empty_document_is_invalid() {
        assert!(matches!(load(""), Err(ConfigError::Empty)));
        assert!(matches!(load("tags: []"), Err(ConfigError::Empty)));
    }

    #[test]
    fn test_placeholder_subnet_is_invalid() {
        let yaml = r#"
subnets:
  - subnetId: <INSERT_VALUE>
    targetId: tmt-1
    filterId: tmf-1
"#;
        let err = load(yaml).unwrap_err();
        assert_eq!(err.to_string(), "Invalid subnets policy #0: missing subnetId");
    }

    #[test]
    fn test_tag_without_key_is_invalid() {
        let yaml = r#"
tags:
  - tagList: [{Value: prod}]
    targetId: tmt-1
    filterId: tmf-1
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.to_string().contains("missing its Key"));
    }

    #[test]
    fn test_tag_list_must_be_a_list() {
        let yaml = r#"
tags:
  - tagList: env
    targetId: tmt-1
    filterId: tmf-1
"#;
        let err = load(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_conflicting_target_sources_rejected() {
        let yaml = r#"
networks:
  - networkId: vpc-1
    targetId: tmt-1
    targetsByZone: {az1: tmt-2}
    filterId: tmf-1
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.to_string().contains("exactly one of targetId"));
    }

    #[test]
    fn test_full_zone_key_rejected() {
        let yaml = r#"
networks:
  - networkId: vpc-1
    targetsByZone: {use1-az1: tmt-1}
    filterId: tmf-1
"#;
        let err = load(yaml).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid networks policy #0: targetsByZone key 'use1-az1' must be a 3-character \
             zone suffix such as 'az1'"
        );
    }

    #[test]
    fn test_missing_filter_rejected() {
        let err = load("networks:\n  - networkId: vpc-1\n    targetId: tmt-1\n").unwrap_err();
        assert!(err.to_string().contains("filterId"));
    }

    #[test]
    fn test_unknown_classification_rejected() {
        let yaml = r#"
networks:
  - networkId: vpc-1
    targetId: tmt-1
    filtersByClassification: {cache: tmf-1}
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.to_string().contains("filtersByClassification.cache"));
    }

    #[test]
    fn test_creation_requires_security_groups() {
        let yaml = r#"
networks:
  - networkId: vpc-1
    targetCreation: {imageId: ami-1, instanceType: c5.large}
    filterId: tmf-1
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.to_string().contains("securityGroupIds"));
    }

    #[test]
    fn test_load_from_file_and_region_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = PolicyStore::policy_path(dir.path(), "us-east-1");
        assert!(path.ends_with("us-east-1.yaml"));

        let mut file = fs::File::create(&path).unwrap();
        file.write_all(DOCUMENT.as_bytes()).unwrap();

        let store = PolicyStore::load_from_file(&path, &EngineSettings::default()).unwrap();
        assert_eq!(store.count(PolicyKind::Subnet), 1);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let settings = EngineSettings::default();
        let err =
            PolicyStore::load_from_file("/nonexistent/eu-west-1.yaml", &settings).unwrap_err();
        assert!(err.to_string().contains("eu-west-1.yaml"));
    }
}
