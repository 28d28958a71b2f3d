//! Cluster endpoint registry.
//!
//! Watches the CNI's endpoint custom resource (cilium.io/v2
//! `ciliumendpoints`) through a list+watch stream and maintains a lookup
//! of endpoint metadata by composite id (`namespace/name`). Watch expiry
//! ("resource version too old") is handled by the runtime watcher, which
//! re-lists and continues. The registry never infers link state; it only
//! supplies metadata to the flow observer and the control plane.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::watcher;
use tokio::sync::{mpsc, watch};

use trellis_common::endpoint::{EndpointEvent, EndpointEventKind, EndpointInfo, EndpointState};

/// Shared endpoint lookup table.
pub type EndpointTable = Arc<RwLock<HashMap<String, EndpointInfo>>>;

fn endpoint_resource() -> ApiResource {
    ApiResource {
        group: "cilium.io".into(),
        version: "v2".into(),
        api_version: "cilium.io/v2".into(),
        kind: "CiliumEndpoint".into(),
        plural: "ciliumendpoints".into(),
    }
}

/// Parse a watched object into endpoint metadata.
pub fn parse_endpoint(obj: &DynamicObject) -> EndpointInfo {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let namespace = obj
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".into());

    let status = obj.data.get("status").cloned().unwrap_or_default();
    let networking = &status["networking"];

    let mut ipv4 = String::new();
    let mut ipv6 = String::new();
    if let Some(addresses) = networking["addressing"].as_array() {
        for addr in addresses {
            if let Some(v4) = addr["ipv4"].as_str() {
                ipv4 = v4.to_string();
            }
            if let Some(v6) = addr["ipv6"].as_str() {
                ipv6 = v6.to_string();
            }
        }
    }

    let state = match status["state"].as_str() {
        Some("ready") => EndpointState::Ready,
        Some("not-ready") => EndpointState::NotReady,
        _ => EndpointState::Unknown,
    };

    let identity = &status["identity"];
    let labels = identity["labels"]
        .as_array()
        .map(|ls| {
            ls.iter()
                .filter_map(|l| l.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    EndpointInfo {
        pod_name: name.clone(),
        name,
        namespace,
        identity: identity["id"].as_u64().unwrap_or(0),
        node_name: networking["node"].as_str().unwrap_or_default().to_string(),
        ipv4_address: ipv4,
        ipv6_address: ipv6,
        state,
        labels,
        last_updated: Utc::now(),
    }
}

/// Watches cluster endpoints and keeps the lookup table current.
pub struct EndpointRegistry {
    namespace: Option<String>,
    table: EndpointTable,
    tx: mpsc::Sender<EndpointEvent>,
}

impl EndpointRegistry {
    pub fn new(namespace: Option<String>, tx: mpsc::Sender<EndpointEvent>) -> Self {
        Self {
            namespace,
            table: Arc::new(RwLock::new(HashMap::new())),
            tx,
        }
    }

    pub fn table(&self) -> EndpointTable {
        self.table.clone()
    }

    /// Run the watch loop until shutdown.
    pub async fn run(self, client: kube::Client, mut shutdown: watch::Receiver<bool>) {
        let ar = endpoint_resource();
        let api: Api<DynamicObject> = match &self.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        };

        tracing::info!(
            namespace = self.namespace.as_deref().unwrap_or("<all>"),
            "endpoint registry started"
        );

        let mut stream = watcher(api, watcher::Config::default()).boxed();

        loop {
            tokio::select! {
                item = stream.next() => {
                    match item {
                        Some(Ok(event)) => self.handle_watch_event(event).await,
                        Some(Err(e)) => {
                            // The watcher re-lists internally on 410; other
                            // errors surface here and the stream resumes
                            tracing::warn!(error = %e, "endpoint watch error");
                        }
                        None => {
                            tracing::warn!("endpoint watch stream closed");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("endpoint registry stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_watch_event(&self, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Init | watcher::Event::InitDone => {}
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let endpoint = parse_endpoint(&obj);
                let id = endpoint.id();
                let kind = {
                    let mut table = self.table.write().expect("endpoint table poisoned");
                    let existed = table.insert(id.clone(), endpoint.clone()).is_some();
                    if existed {
                        EndpointEventKind::Modified
                    } else {
                        EndpointEventKind::Added
                    }
                };
                self.emit(kind, endpoint, &id).await;
            }
            watcher::Event::Delete(obj) => {
                let endpoint = parse_endpoint(&obj);
                let id = endpoint.id();
                let removed = self
                    .table
                    .write()
                    .expect("endpoint table poisoned")
                    .remove(&id)
                    .is_some();
                if removed {
                    self.emit(EndpointEventKind::Deleted, endpoint, &id).await;
                }
            }
        }
    }

    async fn emit(&self, kind: EndpointEventKind, endpoint: EndpointInfo, id: &str) {
        tracing::info!(endpoint = %id, kind = %kind, "endpoint event");
        let event = EndpointEvent {
            kind,
            endpoint,
            timestamp: Utc::now(),
        };
        if self.tx.send(event).await.is_err() {
            tracing::warn!("endpoint event channel closed");
        }
    }
}

/// Endpoints in a given namespace.
pub fn endpoints_by_namespace(table: &EndpointTable, namespace: &str) -> Vec<EndpointInfo> {
    table
        .read()
        .expect("endpoint table poisoned")
        .values()
        .filter(|ep| ep.namespace == namespace)
        .cloned()
        .collect()
}

/// Endpoints scheduled on a given node.
pub fn endpoints_by_node(table: &EndpointTable, node_name: &str) -> Vec<EndpointInfo> {
    table
        .read()
        .expect("endpoint table poisoned")
        .values()
        .filter(|ep| ep.node_name == node_name)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_object() -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "cilium.io/v2",
            "kind": "CiliumEndpoint",
            "metadata": {
                "name": "web-0",
                "namespace": "prod"
            },
            "status": {
                "state": "ready",
                "identity": {
                    "id": 51234,
                    "labels": ["k8s:app=web", "k8s:io.kubernetes.pod.namespace=prod"]
                },
                "networking": {
                    "node": "node-a",
                    "addressing": [
                        {"ipv4": "10.0.1.5", "ipv6": "f00d::a10:0:0:1"}
                    ]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn parses_endpoint_resource() {
        let endpoint = parse_endpoint(&sample_object());
        assert_eq!(endpoint.id(), "prod/web-0");
        assert_eq!(endpoint.identity, 51234);
        assert_eq!(endpoint.node_name, "node-a");
        assert_eq!(endpoint.ipv4_address, "10.0.1.5");
        assert_eq!(endpoint.ipv6_address, "f00d::a10:0:0:1");
        assert_eq!(endpoint.state, EndpointState::Ready);
        assert_eq!(endpoint.labels.len(), 2);
    }

    #[test]
    fn missing_status_yields_unknown_state() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "cilium.io/v2",
            "kind": "CiliumEndpoint",
            "metadata": {"name": "bare", "namespace": "default"}
        }))
        .unwrap();
        let endpoint = parse_endpoint(&obj);
        assert_eq!(endpoint.state, EndpointState::Unknown);
        assert_eq!(endpoint.identity, 0);
        assert!(endpoint.ipv4_address.is_empty());
    }

    #[tokio::test]
    async fn apply_and_delete_maintain_table_and_kinds() {
        let (tx, mut rx) = mpsc::channel(8);
        let registry = EndpointRegistry::new(None, tx);
        let table = registry.table();

        registry
            .handle_watch_event(watcher::Event::Apply(sample_object()))
            .await;
        assert_eq!(rx.recv().await.unwrap().kind, EndpointEventKind::Added);
        assert!(table.read().unwrap().contains_key("prod/web-0"));

        registry
            .handle_watch_event(watcher::Event::Apply(sample_object()))
            .await;
        assert_eq!(rx.recv().await.unwrap().kind, EndpointEventKind::Modified);

        registry
            .handle_watch_event(watcher::Event::Delete(sample_object()))
            .await;
        assert_eq!(rx.recv().await.unwrap().kind, EndpointEventKind::Deleted);
        assert!(table.read().unwrap().is_empty());

        // Deleting an unknown endpoint emits nothing
        registry
            .handle_watch_event(watcher::Event::Delete(sample_object()))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn namespace_and_node_lookups() {
        let table: EndpointTable = Arc::new(RwLock::new(HashMap::new()));
        let mut ep = parse_endpoint(&sample_object());
        table.write().unwrap().insert(ep.id(), ep.clone());
        ep.name = "db-0".into();
        ep.namespace = "staging".into();
        ep.node_name = "node-b".into();
        table.write().unwrap().insert(ep.id(), ep);

        assert_eq!(endpoints_by_namespace(&table, "prod").len(), 1);
        assert_eq!(endpoints_by_namespace(&table, "staging").len(), 1);
        assert_eq!(endpoints_by_node(&table, "node-b").len(), 1);
        assert_eq!(endpoints_by_node(&table, "node-z").len(), 0);
    }
}
