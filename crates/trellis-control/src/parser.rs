//! Containerlab topology parsing.
//!
//! Turns a containerlab YAML definition into store-ready nodes and
//! links, prefixing every identifier with the lab name so multiple labs
//! multiplex into one store without collisions. A wrapper form (the
//! clabernetes Topology CRD) carries the same definition under
//! `spec.definition.containerlab`.

use std::collections::HashMap;

use serde::Deserialize;

use trellis_common::models::{Link, LinkMetrics, LinkState, Node, NodeStatus};

/// Containerlab kinds mapped to node types; unmapped kinds are hosts.
fn kind_to_type(kind: &str) -> &'static str {
    match kind {
        "srl" | "nokia_srlinux" | "ceos" | "arista_ceos" | "vr-sros" | "crpd" | "frr" => "router",
        "bridge" | "ovs-bridge" => "switch",
        "linux" => "host",
        _ => "host",
    }
}

/// Platform tag derived from kind and image substrings.
fn detect_platform(kind: &str, image: &str) -> Option<String> {
    let image = image.to_ascii_lowercase();
    if kind == "srl" || kind == "nokia_srlinux" || image.contains("srlinux") {
        Some("srlinux".into())
    } else if kind == "ceos" || kind == "arista_ceos" || image.contains("ceos") {
        Some("ceos".into())
    } else if kind == "frr" || image.contains("frr") {
        Some("frr".into())
    } else if image.contains("iperf") {
        Some("iperf".into())
    } else if kind.is_empty() {
        None
    } else {
        Some(kind.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("missing 'topology' section in containerlab YAML")]
    MissingTopology,
    #[error("no containerlab definition found in CRD")]
    MissingDefinition,
}

#[derive(Debug, Deserialize)]
struct ClabFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    topology: Option<ClabTopology>,
}

#[derive(Debug, Default, Deserialize)]
struct ClabTopology {
    #[serde(default)]
    nodes: HashMap<String, Option<ClabNode>>,
    #[serde(default)]
    links: Vec<ClabLink>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClabNode {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ClabLink {
    #[serde(default)]
    endpoints: Vec<String>,
}

/// Lab name declared inside the containerlab file, if any.
pub fn lab_name_from_yaml(yaml: &str) -> Option<String> {
    let file: ClabFile = serde_yaml::from_str(yaml).ok()?;
    file.name.filter(|n| !n.is_empty())
}

/// Parse a containerlab definition into `(nodes, links)`, every id
/// prefixed `lab/`.
pub fn parse(yaml: &str, lab: &str) -> Result<(Vec<Node>, Vec<Link>), ParseError> {
    let file: ClabFile = serde_yaml::from_str(yaml)?;
    let topology = file.topology.ok_or(ParseError::MissingTopology)?;

    let nodes = parse_nodes(&topology, lab);
    let links = parse_links(&topology, lab);
    tracing::info!(
        lab,
        nodes = nodes.len(),
        links = links.len(),
        "parsed containerlab topology"
    );
    Ok((nodes, links))
}

fn parse_nodes(topology: &ClabTopology, lab: &str) -> Vec<Node> {
    let mut nodes: Vec<Node> = topology
        .nodes
        .iter()
        .map(|(name, config)| {
            let config = config.clone().unwrap_or_default();
            let kind = config.kind.unwrap_or_else(|| "linux".into());
            let image = config.image.unwrap_or_default();

            let mut metadata = HashMap::new();
            metadata.insert("kind".into(), serde_json::Value::String(kind.clone()));
            metadata.insert("image".into(), serde_json::Value::String(image.clone()));
            metadata.insert(
                "original_name".into(),
                serde_json::Value::String(name.clone()),
            );

            Node {
                id: format!("{lab}/{name}"),
                lab: lab.to_string(),
                label: name.clone(),
                node_type: kind_to_type(&kind).to_string(),
                status: NodeStatus::Unknown,
                ip_address: None,
                platform: detect_platform(&kind, &image),
                metadata,
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    nodes
}

fn parse_links(topology: &ClabTopology, lab: &str) -> Vec<Link> {
    let mut links = Vec::new();
    // Parallel links between the same pair get an ordinal suffix
    let mut pair_counts: HashMap<(String, String), u32> = HashMap::new();

    for (idx, link) in topology.links.iter().enumerate() {
        if link.endpoints.len() != 2 {
            tracing::warn!(index = idx, "skipping link: expected exactly 2 endpoints");
            continue;
        }

        let parsed = link.endpoints[0]
            .split_once(':')
            .zip(link.endpoints[1].split_once(':'));
        let Some(((src_node, src_iface), (dst_node, dst_iface))) = parsed else {
            tracing::warn!(index = idx, "skipping link: malformed endpoint");
            continue;
        };
        if src_node.is_empty() || src_iface.is_empty() || dst_node.is_empty() || dst_iface.is_empty()
        {
            tracing::warn!(index = idx, "skipping link: empty endpoint component");
            continue;
        }

        let pair = (src_node.to_string(), dst_node.to_string());
        let count = pair_counts.entry(pair).or_insert(0);
        *count += 1;
        let link_id = if *count == 1 {
            format!("{lab}/{src_node}-{dst_node}")
        } else {
            format!("{lab}/{src_node}-{dst_node}-{count}")
        };

        let mut metadata = HashMap::new();
        metadata.insert(
            "original_endpoints".into(),
            serde_json::Value::Array(
                link.endpoints
                    .iter()
                    .map(|e| serde_json::Value::String(e.clone()))
                    .collect(),
            ),
        );

        links.push(Link {
            id: link_id,
            lab: lab.to_string(),
            source: format!("{lab}/{src_node}"),
            target: format!("{lab}/{dst_node}"),
            source_interface: src_iface.to_string(),
            target_interface: dst_iface.to_string(),
            state: LinkState::Unknown,
            metrics: LinkMetrics::default(),
            speed_mbps: 0,
            mtu: 1500,
            last_updated: chrono::Utc::now(),
            metadata,
        });
    }

    links
}

// ── Clabernetes wrapper ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WrapperFile {
    #[serde(default)]
    metadata: Option<WrapperMetadata>,
    #[serde(default)]
    spec: Option<WrapperSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct WrapperMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WrapperSpec {
    #[serde(default)]
    definition: Option<WrapperDefinition>,
}

#[derive(Debug, Default, Deserialize)]
struct WrapperDefinition {
    #[serde(default)]
    containerlab: Option<String>,
}

/// Extract `(name, namespace, containerlab yaml)` from a clabernetes
/// Topology CRD. Namespace defaults to `clab` when absent.
pub fn parse_wrapper(yaml: &str) -> Result<(String, String, String), ParseError> {
    let file: WrapperFile = serde_yaml::from_str(yaml)?;

    let metadata = file.metadata.unwrap_or_default();
    let name = metadata.name.unwrap_or_default();
    let namespace = metadata
        .namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "clab".into());

    let definition = file
        .spec
        .and_then(|s| s.definition)
        .and_then(|d| d.containerlab)
        .filter(|c| !c.is_empty())
        .ok_or(ParseError::MissingDefinition)?;

    Ok((name, namespace, definition))
}
