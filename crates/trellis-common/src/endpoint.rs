//! Cluster endpoint metadata from the endpoint resource watch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Readiness of a cluster endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Ready,
    NotReady,
    Unknown,
}

/// What happened to an endpoint in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointEventKind {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for EndpointEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointEventKind::Added => write!(f, "ADDED"),
            EndpointEventKind::Modified => write!(f, "MODIFIED"),
            EndpointEventKind::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Metadata for one network endpoint (pod/identity) in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    pub namespace: String,
    /// Numeric security identity assigned by the CNI.
    pub identity: u64,
    pub node_name: String,
    pub pod_name: String,
    pub ipv4_address: String,
    pub ipv6_address: String,
    pub state: EndpointState,
    pub labels: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl EndpointInfo {
    /// Composite identifier: `namespace/name`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// One change observed on the endpoint watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointEvent {
    #[serde(rename = "type")]
    pub kind: EndpointEventKind,
    pub endpoint: EndpointInfo,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_id() {
        let ep = EndpointInfo {
            name: "web-0".into(),
            namespace: "prod".into(),
            identity: 1234,
            node_name: "node-a".into(),
            pod_name: "web-0".into(),
            ipv4_address: "10.0.1.5".into(),
            ipv6_address: String::new(),
            state: EndpointState::Ready,
            labels: vec!["app=web".into()],
            last_updated: Utc::now(),
        };
        assert_eq!(ep.id(), "prod/web-0");
    }

    #[test]
    fn event_kind_uses_watch_vocabulary() {
        assert_eq!(
            serde_json::to_string(&EndpointEventKind::Added).unwrap(),
            "\"ADDED\""
        );
        assert_eq!(EndpointEventKind::Deleted.to_string(), "DELETED");
    }
}
