//! Pod identity helpers.
//!
//! Pods use the orchestrator's canonical schema (`k8s_openapi` `Pod`)
//! end to end. This module adds the key type and the accessors the
//! reconciler needs.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{Pod, PodStatus};

use crate::error::Error;

/// (namespace, name) tuple used throughout the queue and the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of `pod`. Pods without a namespace fall into `default`.
    pub fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for PodKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::InvalidArgument(format!("invalid pod key {s:?}"))),
        }
    }
}

pub fn uid(pod: &Pod) -> Option<&str> {
    pod.metadata.uid.as_deref()
}

pub fn generation(pod: &Pod) -> i64 {
    pod.metadata.generation.unwrap_or(0)
}

pub fn resource_version(pod: &Pod) -> Option<&str> {
    pod.metadata.resource_version.as_deref()
}

pub fn is_deleting(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn restart_policy(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.restart_policy.as_deref())
        .unwrap_or("Always")
}

pub fn phase(status: &PodStatus) -> &str {
    status.phase.as_deref().unwrap_or("Unknown")
}

/// Compare two resource versions.
///
/// Resource versions are opaque strings but numeric in practice. When both
/// parse, returns whether `incoming` is older than `stored`; otherwise
/// nothing is considered older.
pub fn is_older(incoming: Option<&str>, stored: Option<&str>) -> bool {
    match (
        incoming.and_then(|v| v.parse::<u64>().ok()),
        stored.and_then(|v| v.parse::<u64>().ok()),
    ) {
        (Some(incoming), Some(stored)) => incoming < stored,
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_key_of_pod() {
        let pod = fixtures::pod("a", "p1", "U1", 1, "10");
        let key = PodKey::of(&pod);
        assert_eq!(key, PodKey::new("a", "p1"));
        assert_eq!(key.to_string(), "a/p1");
        assert_eq!("a/p1".parse::<PodKey>().unwrap(), key);
    }

    #[rstest]
    #[case("")]
    #[case("a")]
    #[case("/p1")]
    #[case("a/")]
    #[case("a/b/c")]
    fn test_key_parse_rejects(#[case] input: &str) {
        assert!(input.parse::<PodKey>().is_err());
    }

    #[rstest]
    #[case(Some("5"), Some("10"), true)]
    #[case(Some("10"), Some("10"), false)]
    #[case(Some("11"), Some("10"), false)]
    #[case(None, Some("10"), false)]
    #[case(Some("abc"), Some("10"), false)]
    fn test_is_older(#[case] incoming: Option<&str>, #[case] stored: Option<&str>, #[case] older: bool) {
        assert_eq!(is_older(incoming, stored), older);
    }

    #[test]
    fn test_restart_policy_defaults_to_always() {
        let pod = fixtures::pod("a", "p1", "U1", 1, "10");
        assert_eq!(restart_policy(&pod), "Always");
    }
}
