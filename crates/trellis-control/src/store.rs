//! Topology and link-state store.
//!
//! In-memory, single source of truth for nodes, links, the
//! interface→link index, and the per-lab entity index. Every mutation is
//! atomic under one store-wide lock; the lock is always released before
//! publishing to the event bus so slow subscribers can never stall
//! writers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use trellis_common::models::{Link, LinkMetrics, LinkState, Node, TopologyView};
use trellis_common::protocol::{InterfaceEvent, LinkStateEvent};

use crate::bus::EventBus;

#[derive(Default)]
struct LabEntities {
    nodes: HashSet<String>,
    links: HashSet<String>,
}

#[derive(Default)]
struct StoreInner {
    nodes: HashMap<String, Node>,
    links: HashMap<String, Link>,
    /// interface name -> link id; both endpoints of every link appear here.
    interface_index: HashMap<String, String>,
    labs: HashMap<String, LabEntities>,
}

impl StoreInner {
    fn index_link(&mut self, link: &Link) {
        for iface in [&link.source_interface, &link.target_interface] {
            if let Some(existing) = self.interface_index.get(iface) {
                if existing != &link.id {
                    tracing::warn!(
                        interface = %iface,
                        old_link = %existing,
                        new_link = %link.id,
                        "interface name collision, newer link wins"
                    );
                }
            }
            self.interface_index.insert(iface.clone(), link.id.clone());
        }
    }

    fn unindex_link(&mut self, link: &Link) {
        for iface in [&link.source_interface, &link.target_interface] {
            if self.interface_index.get(iface) == Some(&link.id) {
                self.interface_index.remove(iface);
            }
        }
    }

    fn track(&mut self, lab: &str, node_id: Option<&str>, link_id: Option<&str>) {
        let entry = self.labs.entry(lab.to_string()).or_default();
        if let Some(id) = node_id {
            entry.nodes.insert(id.to_string());
        }
        if let Some(id) = link_id {
            entry.links.insert(id.to_string());
        }
    }
}

/// Per-state link counts and store totals.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub node_count: usize,
    pub link_count: usize,
    pub link_states: HashMap<String, usize>,
    pub uptime_seconds: f64,
}

/// Handle to the shared topology store. Cheap to clone.
#[derive(Clone)]
pub struct TopologyStore {
    inner: Arc<Mutex<StoreInner>>,
    bus: EventBus,
    started_at: DateTime<Utc>,
}

impl TopologyStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            bus,
            started_at: Utc::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store lock poisoned")
    }

    /// Atomically replace the whole topology.
    pub fn init_topology(&self, nodes: Vec<Node>, links: Vec<Link>) {
        let node_count = nodes.len();
        let link_count = links.len();
        let mut inner = self.lock();
        *inner = StoreInner::default();
        for node in nodes {
            let (lab, id) = (node.lab.clone(), node.id.clone());
            inner.track(&lab, Some(id.as_str()), None);
            inner.nodes.insert(id, node);
        }
        for link in links {
            inner.index_link(&link);
            let (lab, id) = (link.lab.clone(), link.id.clone());
            inner.track(&lab, None, Some(id.as_str()));
            inner.links.insert(id, link);
        }
        drop(inner);
        tracing::info!(nodes = node_count, links = link_count, "topology initialized");
    }

    pub fn add_node(&self, node: Node) {
        let payload = serde_json::to_value(&node).expect("node serialization");
        {
            let mut inner = self.lock();
            inner.track(&node.lab, Some(node.id.as_str()), None);
            inner.nodes.insert(node.id.clone(), node);
        }
        self.bus.publish("node_added", payload, "store");
    }

    pub fn add_link(&self, link: Link) {
        let payload = serde_json::to_value(&link).expect("link serialization");
        {
            let mut inner = self.lock();
            inner.index_link(&link);
            inner.track(&link.lab, None, Some(link.id.as_str()));
            inner.links.insert(link.id.clone(), link);
        }
        self.bus.publish("link_added", payload, "store");
    }

    pub fn remove_node(&self, node_id: &str) -> bool {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.nodes.remove(node_id);
            if let Some(node) = &removed {
                if let Some(lab) = inner.labs.get_mut(&node.lab) {
                    lab.nodes.remove(node_id);
                }
            }
            removed.is_some()
        };
        if removed {
            self.bus.publish(
                "node_removed",
                serde_json::json!({ "node_id": node_id }),
                "store",
            );
        }
        removed
    }

    pub fn remove_link(&self, link_id: &str) -> bool {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.links.remove(link_id);
            if let Some(link) = &removed {
                inner.unindex_link(link);
                if let Some(lab) = inner.labs.get_mut(&link.lab) {
                    lab.links.remove(link_id);
                }
            }
            removed.is_some()
        };
        if removed {
            self.bus.publish(
                "link_removed",
                serde_json::json!({ "link_id": link_id }),
                "store",
            );
        }
        removed
    }

    pub fn get_topology(&self) -> TopologyView {
        let inner = self.lock();
        TopologyView {
            nodes: inner.nodes.values().cloned().collect(),
            edges: inner.links.values().cloned().collect(),
            timestamp: Utc::now(),
        }
    }

    pub fn get_all_links(&self) -> Vec<Link> {
        self.lock().links.values().cloned().collect()
    }

    pub fn get_link(&self, link_id: &str) -> Option<Link> {
        self.lock().links.get(link_id).cloned()
    }

    pub fn get_link_by_interface(&self, interface: &str) -> Option<Link> {
        let inner = self.lock();
        let link_id = inner.interface_index.get(interface)?;
        inner.links.get(link_id).cloned()
    }

    /// Nodes and links tagged with the given lab.
    pub fn get_topology_by_lab(&self, lab: &str) -> TopologyView {
        let inner = self.lock();
        let nodes = inner
            .nodes
            .values()
            .filter(|n| n.lab == lab)
            .cloned()
            .collect();
        let edges = inner
            .links
            .values()
            .filter(|l| l.lab == lab)
            .cloned()
            .collect();
        TopologyView {
            nodes,
            edges,
            timestamp: Utc::now(),
        }
    }

    pub fn get_labs(&self) -> Vec<String> {
        let inner = self.lock();
        let mut labs: Vec<String> = inner.labs.keys().cloned().collect();
        labs.sort();
        labs
    }

    /// Update a link's state, applying metrics either way.
    ///
    /// Emits (and returns) a `link_state_change` event only when the
    /// state actually changed; an update to an unknown link is a
    /// debug-logged no-op.
    pub fn update_link_state(
        &self,
        link_id: &str,
        new_state: LinkState,
        metrics: Option<LinkMetrics>,
        source: &str,
    ) -> Option<LinkStateEvent> {
        let event = {
            let mut inner = self.lock();
            let link = match inner.links.get_mut(link_id) {
                Some(link) => link,
                None => {
                    tracing::debug!(link = %link_id, "state update for unknown link");
                    return None;
                }
            };

            let old_state = link.state;
            link.state = new_state;
            link.last_updated = Utc::now();
            if let Some(metrics) = metrics {
                link.metrics = metrics;
            }

            if old_state == new_state {
                return None;
            }

            LinkStateEvent {
                link_id: link_id.to_string(),
                interface: link.source_interface.clone(),
                old_state,
                new_state,
                timestamp: link.last_updated,
                source: source.to_string(),
                metrics: Some(link.metrics.clone()),
            }
        };

        let payload = serde_json::to_value(&event).expect("event serialization");
        self.bus.publish("link_state_change", payload, source);
        tracing::info!(
            link = %link_id,
            old = %event.old_state,
            new = %event.new_state,
            source,
            "link state changed"
        );
        Some(event)
    }

    /// Update metrics only; no event.
    pub fn update_link_metrics(&self, link_id: &str, metrics: LinkMetrics) -> bool {
        let mut inner = self.lock();
        match inner.links.get_mut(link_id) {
            Some(link) => {
                link.metrics = metrics;
                link.last_updated = Utc::now();
                true
            }
            None => {
                tracing::debug!(link = %link_id, "metrics update for unknown link");
                false
            }
        }
    }

    /// Resolve an agent interface event to a link and apply it.
    pub fn handle_agent_event(&self, event: &InterfaceEvent) -> Option<LinkStateEvent> {
        let link = match self.get_link_by_interface(&event.interface) {
            Some(link) => link,
            None => {
                tracing::debug!(interface = %event.interface, "no link for interface");
                return None;
            }
        };

        let new_state = LinkState::from_agent_token(&event.new_state);
        self.update_link_state(&link.id, new_state, event.metrics.clone(), &event.source)
    }

    /// Remove every entity tagged with `lab` and its index entries.
    pub fn clear_lab(&self, lab: &str) -> (usize, usize) {
        let (removed_nodes, removed_links) = {
            let mut inner = self.lock();
            let Some(entities) = inner.labs.remove(lab) else {
                return (0, 0);
            };
            for node_id in &entities.nodes {
                inner.nodes.remove(node_id);
            }
            let links: Vec<Link> = entities
                .links
                .iter()
                .filter_map(|id| inner.links.remove(id))
                .collect();
            for link in &links {
                inner.unindex_link(link);
            }
            (entities.nodes.len(), links.len())
        };

        self.bus.publish(
            "lab_cleared",
            serde_json::json!({
                "lab": lab,
                "nodes_removed": removed_nodes,
                "links_removed": removed_links,
            }),
            "store",
        );
        tracing::info!(lab, nodes = removed_nodes, links = removed_links, "lab cleared");
        (removed_nodes, removed_links)
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        let mut link_states: HashMap<String, usize> = HashMap::new();
        for link in inner.links.values() {
            *link_states.entry(link.state.to_string()).or_insert(0) += 1;
        }
        StoreStats {
            node_count: inner.nodes.len(),
            link_count: inner.links.len(),
            link_states,
            uptime_seconds: (Utc::now() - self.started_at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0,
        }
    }
}
