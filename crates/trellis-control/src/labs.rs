//! Lab lifecycle orchestration.
//!
//! Coordinates parse → CRD create → store ingest → status watch for each
//! lab. Nodes and links are ingested into the store even when CRD
//! creation fails, so visualization reflects the operator's intent while
//! the lab record carries the failure; an identifier conflict is the one
//! terminal error that rejects the deploy outright.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use trellis_common::models::TopologyView;

use crate::k8s::{status_from_conditions, CrdError, TopologyCrdClient};
use crate::parser;
use crate::store::TopologyStore;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Deployment state of a lab, mirrored from the external resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabStatus {
    Pending,
    Deploying,
    Running,
    Failed,
    Deleted,
    Unknown,
}

impl std::fmt::Display for LabStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabStatus::Pending => write!(f, "pending"),
            LabStatus::Deploying => write!(f, "deploying"),
            LabStatus::Running => write!(f, "running"),
            LabStatus::Failed => write!(f, "failed"),
            LabStatus::Deleted => write!(f, "deleted"),
            LabStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl LabStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LabStatus::Running | LabStatus::Failed | LabStatus::Deleted)
    }
}

/// One deployed (or failed) lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lab {
    pub name: String,
    pub namespace: String,
    pub status: LabStatus,
    pub topology_name: String,
    pub nodes_count: usize,
    pub links_count: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lab deployment request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub containerlab_yaml: Option<String>,
    #[serde(default)]
    pub clabernetes_yaml: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployResponse {
    pub lab: String,
    pub status: LabStatus,
    pub nodes_discovered: usize,
    pub links_discovered: usize,
    pub topology_crd: String,
    pub node_ids: Vec<String>,
    pub link_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("{0}")]
    Validation(String),
    #[error("lab '{0}' already exists")]
    AlreadyExists(String),
}

/// Where lab CRDs live: a real cluster, or in-process when running
/// without one (tests, demos, cluster-less development).
pub enum LabBackend {
    Kube(TopologyCrdClient),
    InProcess(Mutex<HashMap<String, String>>),
}

impl LabBackend {
    pub fn in_process() -> Self {
        LabBackend::InProcess(Mutex::new(HashMap::new()))
    }

    async fn create(&self, name: &str, namespace: &str, yaml: &str) -> Result<(), CrdError> {
        match self {
            LabBackend::Kube(client) => client.create_topology(name, namespace, yaml).await,
            LabBackend::InProcess(labs) => {
                let mut labs = labs.lock().expect("backend lock poisoned");
                if labs.contains_key(name) {
                    return Err(CrdError::AlreadyExists(name.into(), namespace.into()));
                }
                labs.insert(name.to_string(), namespace.to_string());
                Ok(())
            }
        }
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<bool, CrdError> {
        match self {
            LabBackend::Kube(client) => client.delete_topology(name, namespace).await,
            LabBackend::InProcess(labs) => Ok(labs
                .lock()
                .expect("backend lock poisoned")
                .remove(name)
                .is_some()),
        }
    }

    async fn status(&self, name: &str, namespace: &str) -> LabStatus {
        match self {
            LabBackend::Kube(client) => client.get_status(name, namespace).await,
            LabBackend::InProcess(labs) => {
                if labs.lock().expect("backend lock poisoned").contains_key(name) {
                    LabStatus::Running
                } else {
                    LabStatus::Deleted
                }
            }
        }
    }

    /// Externally discovered labs carrying the managed-by marker.
    async fn list(&self) -> Vec<(String, String, LabStatus, Option<DateTime<Utc>>)> {
        match self {
            LabBackend::Kube(client) => match client.list_managed().await {
                Ok(objects) => objects
                    .into_iter()
                    .map(|obj| {
                        let status = status_from_conditions(&obj);
                        let created = obj.metadata.creation_timestamp.as_ref().map(|t| t.0);
                        (
                            obj.metadata.name.unwrap_or_default(),
                            obj.metadata.namespace.unwrap_or_else(|| "clab".into()),
                            status,
                            created,
                        )
                    })
                    .collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "listing cluster topologies failed");
                    Vec::new()
                }
            },
            LabBackend::InProcess(labs) => labs
                .lock()
                .expect("backend lock poisoned")
                .iter()
                .map(|(name, ns)| (name.clone(), ns.clone(), LabStatus::Running, None))
                .collect(),
        }
    }
}

struct LabsInner {
    backend: LabBackend,
    store: TopologyStore,
    labs: Mutex<HashMap<String, Lab>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Handle to the lab orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct LabOrchestrator {
    inner: Arc<LabsInner>,
}

impl LabOrchestrator {
    pub fn new(backend: LabBackend, store: TopologyStore) -> Self {
        Self {
            inner: Arc::new(LabsInner {
                backend,
                store,
                labs: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Deploy a lab: resolve the topology text, parse, create the CRD,
    /// ingest nodes/links, start the status watcher.
    pub async fn deploy_lab(&self, request: DeployRequest) -> Result<DeployResponse, DeployError> {
        let mut lab_name = request.name.clone();
        let mut namespace = request.namespace.clone();

        // Resolve the containerlab text; wrapper metadata fills any
        // caller fields left empty, uniformly for both deploy paths
        let containerlab_yaml = if let Some(wrapper) = &request.clabernetes_yaml {
            let (crd_name, crd_ns, inner) =
                parser::parse_wrapper(wrapper).map_err(|e| DeployError::Validation(e.to_string()))?;
            if lab_name.is_empty() {
                lab_name = crd_name;
            }
            if namespace.is_empty() {
                namespace = crd_ns;
            }
            inner
        } else if let Some(yaml) = &request.containerlab_yaml {
            if lab_name.is_empty() {
                lab_name = parser::lab_name_from_yaml(yaml).unwrap_or_default();
            }
            yaml.clone()
        } else {
            return Err(DeployError::Validation(
                "either containerlab_yaml or clabernetes_yaml is required".into(),
            ));
        };

        if lab_name.is_empty() {
            return Err(DeployError::Validation("lab name is required".into()));
        }
        if namespace.is_empty() {
            namespace = "clab".into();
        }
        if self
            .inner
            .labs
            .lock()
            .expect("labs lock poisoned")
            .contains_key(&lab_name)
        {
            return Err(DeployError::AlreadyExists(lab_name));
        }

        // Parse failure rejects the deploy with nothing ingested
        let (nodes, links) = parser::parse(&containerlab_yaml, &lab_name)
            .map_err(|e| DeployError::Validation(e.to_string()))?;

        let mut lab = Lab {
            name: lab_name.clone(),
            namespace: namespace.clone(),
            status: LabStatus::Pending,
            topology_name: lab_name.clone(),
            nodes_count: nodes.len(),
            links_count: links.len(),
            created_at: Utc::now(),
            message: None,
        };

        match self
            .inner
            .backend
            .create(&lab_name, &namespace, &containerlab_yaml)
            .await
        {
            Ok(()) => lab.status = LabStatus::Deploying,
            Err(CrdError::AlreadyExists(name, _)) => {
                return Err(DeployError::AlreadyExists(name));
            }
            Err(e) => {
                lab.status = LabStatus::Failed;
                lab.message = Some(e.to_string());
                tracing::error!(lab = %lab_name, error = %e, "lab CRD creation failed");
            }
        }

        // Ingest regardless of CRD outcome so the view shows intent
        let node_ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let link_ids: Vec<String> = links.iter().map(|l| l.id.clone()).collect();
        for node in nodes {
            self.inner.store.add_node(node);
        }
        for link in links {
            self.inner.store.add_link(link);
        }

        tracing::info!(
            lab = %lab_name,
            nodes = node_ids.len(),
            links = link_ids.len(),
            status = %lab.status,
            "lab deployed"
        );

        let response = DeployResponse {
            lab: lab_name.clone(),
            status: lab.status,
            nodes_discovered: node_ids.len(),
            links_discovered: link_ids.len(),
            topology_crd: lab_name.clone(),
            node_ids,
            link_ids,
            message: lab.message.clone(),
        };

        let deploying = lab.status == LabStatus::Deploying;
        self.inner
            .labs
            .lock()
            .expect("labs lock poisoned")
            .insert(lab_name.clone(), lab);
        if deploying {
            self.start_status_watcher(lab_name, namespace);
        }

        Ok(response)
    }

    /// Lab record with status refreshed from the backend.
    pub async fn get_lab(&self, name: &str) -> Option<Lab> {
        let lab = self
            .inner
            .labs
            .lock()
            .expect("labs lock poisoned")
            .get(name)
            .cloned()?;
        let status = self.inner.backend.status(&lab.topology_name, &lab.namespace).await;
        if status != lab.status {
            if let Some(record) = self
                .inner
                .labs
                .lock()
                .expect("labs lock poisoned")
                .get_mut(name)
            {
                record.status = status;
            }
        }
        Some(Lab { status, ..lab })
    }

    /// In-memory records merged with externally discovered labs.
    pub async fn list_labs(&self) -> Vec<Lab> {
        let discovered = self.inner.backend.list().await;
        let mut labs = self.inner.labs.lock().expect("labs lock poisoned");

        for (name, namespace, status, created_at) in discovered {
            if name.is_empty() || labs.contains_key(&name) {
                continue;
            }
            labs.insert(
                name.clone(),
                Lab {
                    topology_name: name.clone(),
                    name,
                    namespace,
                    status,
                    nodes_count: 0,
                    links_count: 0,
                    created_at: created_at.unwrap_or_else(Utc::now),
                    message: None,
                },
            );
        }

        let mut list: Vec<Lab> = labs.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn get_lab_status(&self, name: &str) -> Option<LabStatus> {
        Some(self.get_lab(name).await?.status)
    }

    /// The lab's current nodes and links from the store.
    pub fn get_lab_topology(&self, name: &str) -> Option<TopologyView> {
        if !self
            .inner
            .labs
            .lock()
            .expect("labs lock poisoned")
            .contains_key(name)
        {
            return None;
        }
        Some(self.inner.store.get_topology_by_lab(name))
    }

    /// Delete a lab: cancel its watcher, delete the CRD, clear the store.
    pub async fn delete_lab(&self, name: &str) -> bool {
        let lab = match self
            .inner
            .labs
            .lock()
            .expect("labs lock poisoned")
            .remove(name)
        {
            Some(lab) => lab,
            None => return false,
        };

        if let Some(watcher) = self
            .inner
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .remove(name)
        {
            watcher.abort();
        }

        if let Err(e) = self
            .inner
            .backend
            .delete(&lab.topology_name, &lab.namespace)
            .await
        {
            tracing::error!(lab = %name, error = %e, "CRD deletion failed");
        }
        self.inner.store.clear_lab(name);

        tracing::info!(lab = %name, "lab deleted");
        true
    }

    /// Poll the backend until the lab reaches a terminal state, mirroring
    /// each status change into the lab record.
    fn start_status_watcher(&self, lab_name: String, namespace: String) {
        let mut watchers = self.inner.watchers.lock().expect("watchers lock poisoned");
        if watchers.contains_key(&lab_name) {
            return;
        }

        let inner = self.inner.clone();
        let name = lab_name.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                let status = inner.backend.status(&name, &namespace).await;

                {
                    let mut labs = inner.labs.lock().expect("labs lock poisoned");
                    match labs.get_mut(&name) {
                        Some(lab) => {
                            if lab.status != status {
                                tracing::info!(lab = %name, status = %status, "lab status");
                                lab.status = status;
                            }
                        }
                        None => break, // lab deleted under us
                    }
                }

                if status.is_terminal() {
                    break;
                }
            }
            inner
                .watchers
                .lock()
                .expect("watchers lock poisoned")
                .remove(&name);
        });

        watchers.insert(lab_name, handle);
    }
}
