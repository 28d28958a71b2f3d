//! Flow records streamed from the cluster-wide observer.
//!
//! The observer emits one JSON object per flow; the `wire` module mirrors
//! that shape (nested `l4` keyed by protocol) and [`FlowRecord`] is the
//! flattened form the per-flow state machine consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verdict attached to an observed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowVerdict {
    Forwarded,
    Dropped,
    Error,
    Audit,
    Redirected,
    Traced,
    Translated,
    Unknown,
}

impl FlowVerdict {
    pub fn parse(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "FORWARDED" => FlowVerdict::Forwarded,
            "DROPPED" => FlowVerdict::Dropped,
            "ERROR" => FlowVerdict::Error,
            "AUDIT" => FlowVerdict::Audit,
            "REDIRECTED" => FlowVerdict::Redirected,
            "TRACED" => FlowVerdict::Traced,
            "TRANSLATED" => FlowVerdict::Translated,
            _ => FlowVerdict::Unknown,
        }
    }
}

/// Direction of an observed flow relative to the reporting endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowDirection {
    Ingress,
    Egress,
    Unknown,
}

/// Per-flow link state derived from verdicts and idle timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Active,
    Idle,
    Down,
    Unknown,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowState::Active => write!(f, "active"),
            FlowState::Idle => write!(f, "idle"),
            FlowState::Down => write!(f, "down"),
            FlowState::Unknown => write!(f, "unknown"),
        }
    }
}

/// One side of an observed flow (pod, service, or bare IP).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowEndpoint {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub identity: u64,
    #[serde(default)]
    pub ip: String,
}

impl FlowEndpoint {
    /// Stable endpoint identifier: `namespace/pod`, falling back to the
    /// IP, then to the numeric security identity.
    pub fn id(&self) -> String {
        if !self.namespace.is_empty() && !self.pod_name.is_empty() {
            format!("{}/{}", self.namespace, self.pod_name)
        } else if !self.ip.is_empty() {
            self.ip.clone()
        } else {
            format!("identity:{}", self.identity)
        }
    }
}

/// A single flow observation, flattened from the wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub source: FlowEndpoint,
    pub destination: FlowEndpoint,
    pub verdict: FlowVerdict,
    pub direction: FlowDirection,
    pub l4_protocol: String,
    pub source_port: u16,
    pub destination_port: u16,
    pub bytes: u64,
    pub timestamp: DateTime<Utc>,
    pub drop_reason: String,
    pub is_reply: bool,
}

impl FlowRecord {
    /// Directed key naming this conversation for state-machine purposes.
    ///
    /// Deliberately conflates L4 sessions between the same endpoint pair;
    /// the state machine tracks link-level liveness, not sessions.
    pub fn flow_key(&self) -> String {
        format!("{}->{}", self.source.id(), self.destination.id())
    }
}

/// Wire shapes matching the observer's JSON output.
pub mod wire {
    use super::*;

    /// Top-level line: `{"flow": {...}}`.
    #[derive(Debug, Deserialize)]
    pub struct FlowLine {
        pub flow: FlowBody,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct FlowBody {
        #[serde(default)]
        pub source: FlowEndpoint,
        #[serde(default)]
        pub destination: FlowEndpoint,
        #[serde(default)]
        pub verdict: String,
        #[serde(default)]
        pub traffic_direction: String,
        #[serde(default)]
        pub l4: Option<L4>,
        #[serde(default)]
        pub drop_reason_desc: String,
        #[serde(default)]
        pub is_reply: bool,
        #[serde(default)]
        pub time: Option<DateTime<Utc>>,
    }

    /// L4 header keyed by protocol, one variant populated.
    #[derive(Debug, Default, Deserialize)]
    pub struct L4 {
        #[serde(rename = "TCP")]
        pub tcp: Option<PortPair>,
        #[serde(rename = "UDP")]
        pub udp: Option<PortPair>,
        #[serde(rename = "ICMPv4")]
        pub icmpv4: Option<serde_json::Value>,
        #[serde(rename = "ICMPv6")]
        pub icmpv6: Option<serde_json::Value>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct PortPair {
        #[serde(default)]
        pub source_port: u16,
        #[serde(default)]
        pub destination_port: u16,
    }

    impl From<FlowBody> for FlowRecord {
        fn from(body: FlowBody) -> Self {
            let (l4_protocol, source_port, destination_port) = match &body.l4 {
                Some(L4 { tcp: Some(p), .. }) => ("TCP".into(), p.source_port, p.destination_port),
                Some(L4 { udp: Some(p), .. }) => ("UDP".into(), p.source_port, p.destination_port),
                Some(l4) if l4.icmpv4.is_some() || l4.icmpv6.is_some() => ("ICMP".into(), 0, 0),
                _ => ("UNKNOWN".into(), 0, 0),
            };

            let direction = match body.traffic_direction.to_ascii_uppercase().as_str() {
                "INGRESS" => FlowDirection::Ingress,
                "EGRESS" => FlowDirection::Egress,
                _ => FlowDirection::Unknown,
            };

            FlowRecord {
                verdict: FlowVerdict::parse(&body.verdict),
                direction,
                l4_protocol,
                source_port,
                destination_port,
                bytes: 0,
                timestamp: body.time.unwrap_or_else(Utc::now),
                drop_reason: body.drop_reason_desc,
                is_reply: body.is_reply,
                source: body.source,
                destination: body.destination,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_id_fallback_chain() {
        let full = FlowEndpoint {
            namespace: "ns".into(),
            pod_name: "web-0".into(),
            ip: "10.0.0.1".into(),
            identity: 7,
            ..Default::default()
        };
        assert_eq!(full.id(), "ns/web-0");

        let ip_only = FlowEndpoint {
            ip: "10.0.0.2".into(),
            identity: 7,
            ..Default::default()
        };
        assert_eq!(ip_only.id(), "10.0.0.2");

        let identity_only = FlowEndpoint {
            identity: 42,
            ..Default::default()
        };
        assert_eq!(identity_only.id(), "identity:42");
    }

    #[test]
    fn parses_observer_line() {
        let line = r#"{"flow":{"source":{"namespace":"ns","pod_name":"a"},"destination":{"namespace":"ns","pod_name":"b"},"verdict":"FORWARDED","traffic_direction":"EGRESS","l4":{"TCP":{"source_port":51234,"destination_port":80}},"is_reply":false}}"#;
        let parsed: wire::FlowLine = serde_json::from_str(line).unwrap();
        let record: FlowRecord = parsed.flow.into();

        assert_eq!(record.verdict, FlowVerdict::Forwarded);
        assert_eq!(record.direction, FlowDirection::Egress);
        assert_eq!(record.l4_protocol, "TCP");
        assert_eq!(record.destination_port, 80);
        assert_eq!(record.flow_key(), "ns/a->ns/b");
    }

    #[test]
    fn icmp_and_unknown_l4() {
        let icmp = r#"{"flow":{"verdict":"DROPPED","l4":{"ICMPv4":{}},"drop_reason_desc":"POLICY_DENIED"}}"#;
        let parsed: wire::FlowLine = serde_json::from_str(icmp).unwrap();
        let record: FlowRecord = parsed.flow.into();
        assert_eq!(record.l4_protocol, "ICMP");
        assert_eq!(record.verdict, FlowVerdict::Dropped);
        assert_eq!(record.drop_reason, "POLICY_DENIED");

        let bare = r#"{"flow":{"verdict":"TRACED"}}"#;
        let parsed: wire::FlowLine = serde_json::from_str(bare).unwrap();
        let record: FlowRecord = parsed.flow.into();
        assert_eq!(record.l4_protocol, "UNKNOWN");
    }

    #[test]
    fn verdict_parse_is_case_insensitive() {
        assert_eq!(FlowVerdict::parse("forwarded"), FlowVerdict::Forwarded);
        assert_eq!(FlowVerdict::parse("DROPPED"), FlowVerdict::Dropped);
        assert_eq!(FlowVerdict::parse("bogus"), FlowVerdict::Unknown);
    }
}
