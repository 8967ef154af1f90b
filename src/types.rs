//! Shared data model: catalog records, key entries and health results.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A service as reported by one node's catalog listing.
///
/// The per-node listing is keyed by service id; the fragment carries
/// everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFragment {
    /// Service name (many instances share one name).
    pub service: String,
    /// Address the instance listens on.
    pub address: String,
    /// Port the instance listens on.
    pub port: u16,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ServiceFragment {
    pub fn new(service: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// One service instance, flattened out of a node's catalog listing.
///
/// Immutable snapshot; two records are equal when all fields are.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_name: String,
    pub address: String,
    pub port: u16,
    pub node_name: String,
    pub tags: BTreeSet<String>,
}

impl ServiceRecord {
    /// Flatten a catalog fragment, attaching the node it was found on.
    pub fn from_fragment(node_name: &str, fragment: ServiceFragment) -> Self {
        Self {
            service_name: fragment.service,
            address: fragment.address,
            port: fragment.port,
            node_name: node_name.to_string(),
            tags: fragment.tags.into_iter().collect(),
        }
    }

    /// `"<address>:<port>"`.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Exact, case-sensitive service name match.
    pub fn is_named(&self, service_name: &str) -> bool {
        self.service_name == service_name
    }
}

/// A stored key with its version metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Index at which the key was first created.
    pub create_index: u64,
    /// Index of the last write. This is the fencing token for CAS writes.
    pub modify_index: u64,
}

impl KeyEntry {
    /// Value as UTF-8, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Status of a single health check.
///
/// Ordered from best to worst so that the aggregate of several checks is
/// their maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "passing" => Some(Self::Passing),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A health check registered against a node or one of its services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub node: String,
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    /// `None` for node-level checks, which apply to every service on the node.
    pub service_name: Option<String>,
    #[serde(default)]
    pub output: String,
}

/// One instance of a service together with the checks that apply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: ServiceRecord,
    pub checks: Vec<HealthCheck>,
}

impl ServiceHealth {
    /// Worst status across all checks; an instance with no checks is passing.
    pub fn aggregated_status(&self) -> HealthStatus {
        self.checks.iter().map(|c| c.status).max().unwrap_or_default()
    }

    pub fn is_passing(&self) -> bool {
        self.aggregated_status() == HealthStatus::Passing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(status: HealthStatus) -> HealthCheck {
        HealthCheck {
            node: "n1".to_string(),
            check_id: format!("check-{status}"),
            name: "http".to_string(),
            status,
            service_name: Some("web".to_string()),
            output: String::new(),
        }
    }

    #[test]
    fn record_from_fragment_keeps_fields() {
        let fragment = ServiceFragment::new("web", "10.0.0.1", 8080).with_tags(["primary", "v2"]);
        let record = ServiceRecord::from_fragment("n1", fragment);

        assert_eq!(record.service_name, "web");
        assert_eq!(record.node_name, "n1");
        assert_eq!(record.socket_address(), "10.0.0.1:8080");
        assert!(record.tags.contains("primary"));
        assert_eq!(record.tags.len(), 2);
    }

    #[test]
    fn duplicate_tags_collapse_into_set() {
        let fragment = ServiceFragment::new("db", "10.0.0.3", 5432).with_tags(["a", "a", "b"]);
        let record = ServiceRecord::from_fragment("n2", fragment);
        assert_eq!(record.tags.len(), 2);
    }

    #[test]
    fn name_match_is_exact() {
        let record = ServiceRecord::from_fragment("n1", ServiceFragment::new("web", "10.0.0.1", 80));
        assert!(record.is_named("web"));
        assert!(!record.is_named("Web"));
        assert!(!record.is_named("we"));
        assert!(!record.is_named("web-api"));
    }

    #[test]
    fn aggregated_status_is_worst_check() {
        let record = ServiceRecord::from_fragment("n1", ServiceFragment::new("web", "10.0.0.1", 80));
        let mut health = ServiceHealth {
            service: record,
            checks: vec![],
        };
        assert!(health.is_passing());

        health.checks = vec![check(HealthStatus::Passing), check(HealthStatus::Warning)];
        assert_eq!(health.aggregated_status(), HealthStatus::Warning);

        health.checks.push(check(HealthStatus::Critical));
        assert_eq!(health.aggregated_status(), HealthStatus::Critical);
        assert!(!health.is_passing());
    }

    #[test]
    fn health_status_parse_roundtrip() {
        for status in [HealthStatus::Passing, HealthStatus::Warning, HealthStatus::Critical] {
            assert_eq!(HealthStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(HealthStatus::parse("CRITICAL"), Some(HealthStatus::Critical));
        assert_eq!(HealthStatus::parse("maintenance"), None);
    }

    #[test]
    fn key_entry_value_str() {
        let entry = KeyEntry {
            key: "cfg/x".to_string(),
            value: b"42".to_vec(),
            create_index: 3,
            modify_index: 5,
        };
        assert_eq!(entry.value_str(), Some("42"));

        let binary = KeyEntry {
            value: vec![0xff, 0xfe],
            ..entry
        };
        assert_eq!(binary.value_str(), None);
    }
}
