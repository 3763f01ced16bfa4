//! Canonical interface record and tag types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A resource tag.
///
/// Serialized with the control plane's `Key`/`Value` casing; the lower-case
/// spelling used by security findings is accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "Key", alias = "key")]
    pub key: String,
    #[serde(rename = "Value", alias = "value", default)]
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A network interface as seen by one invocation.
///
/// Built fresh from a trigger payload or an inventory page and never
/// persisted. There are no setters; [`ObservedInterface::with_tags`] is only
/// usable while the record is being constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedInterface {
    interface_id: String,
    subnet_id: String,
    network_id: String,
    availability_zone_key: String,
    tags: BTreeSet<Tag>,
}

impl ObservedInterface {
    pub fn new(
        interface_id: impl Into<String>,
        subnet_id: impl Into<String>,
        network_id: impl Into<String>,
        availability_zone_key: impl Into<String>,
    ) -> Self {
        Self {
            interface_id: interface_id.into(),
            subnet_id: subnet_id.into(),
            network_id: network_id.into(),
            availability_zone_key: availability_zone_key.into(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn interface_id(&self) -> &str {
        &self.interface_id
    }

    pub fn subnet_id(&self) -> &str {
        &self.subnet_id
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn availability_zone_key(&self) -> &str {
        &self.availability_zone_key
    }

    pub fn tags(&self) -> &BTreeSet<Tag> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    /// Value of the first tag with `key`, if any.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }

    /// Last three characters of the availability-zone key (`use1-az2` -> `az2`).
    ///
    /// Zone keys are stable across accounts, unlike zone names, so per-zone
    /// targets are keyed by this suffix.
    pub fn zone_suffix(&self) -> &str {
        let key = self.availability_zone_key.as_str();
        key.char_indices()
            .rev()
            .nth(2)
            .map(|(idx, _)| &key[idx..])
            .unwrap_or(key)
    }
}

impl fmt::Display for ObservedInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (subnet {}, network {}, zone {})",
            self.interface_id, self.subnet_id, self.network_id, self.availability_zone_key
        )
    }
}
