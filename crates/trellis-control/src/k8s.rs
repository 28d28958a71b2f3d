//! Clabernetes Topology CRD client.
//!
//! Manages `topologies.clabernetes.containerlab.dev/v1alpha1` objects for
//! lab lifecycle operations: create with the managed-by marker, read the
//! condition-based deployment status, delete, and list.

use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::Client;

use crate::labs::LabStatus;

pub const CLABERNETES_GROUP: &str = "clabernetes.containerlab.dev";
pub const CLABERNETES_VERSION: &str = "v1alpha1";
pub const CLABERNETES_KIND: &str = "Topology";
pub const CLABERNETES_PLURAL: &str = "topologies";

/// Label marking resources whose lifecycle this system owns.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "trellis";

#[derive(Debug, thiserror::Error)]
pub enum CrdError {
    #[error("topology '{0}' already exists in namespace '{1}'")]
    AlreadyExists(String, String),
    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

fn topology_resource() -> ApiResource {
    ApiResource {
        group: CLABERNETES_GROUP.into(),
        version: CLABERNETES_VERSION.into(),
        api_version: format!("{CLABERNETES_GROUP}/{CLABERNETES_VERSION}"),
        kind: CLABERNETES_KIND.into(),
        plural: CLABERNETES_PLURAL.into(),
    }
}

/// Derive a lab status from the CRD's `status.conditions`.
///
/// Ready=True → Running; Progressing=True → Deploying; a Ready condition
/// whose reason mentions Failed/Error → Failed; anything else → Pending.
pub fn status_from_conditions(obj: &DynamicObject) -> LabStatus {
    let conditions = obj.data["status"]["conditions"].as_array().cloned();
    let Some(conditions) = conditions else {
        return LabStatus::Pending;
    };

    let mut progressing = false;
    for condition in &conditions {
        let cond_type = condition["type"].as_str().unwrap_or_default();
        let cond_true = condition["status"].as_str() == Some("True");
        if cond_type == "Ready" && cond_true {
            return LabStatus::Running;
        }
        if cond_type == "Progressing" && cond_true {
            progressing = true;
        }
    }
    if progressing {
        return LabStatus::Deploying;
    }

    for condition in &conditions {
        if condition["type"].as_str() == Some("Ready") {
            let reason = condition["reason"].as_str().unwrap_or_default();
            if reason.contains("Failed") || reason.contains("Error") {
                return LabStatus::Failed;
            }
        }
    }

    LabStatus::Pending
}

/// Typed client for the clabernetes Topology CRD.
#[derive(Clone)]
pub struct TopologyCrdClient {
    client: Client,
}

impl TopologyCrdClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &topology_resource())
    }

    fn api_all(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &topology_resource())
    }

    /// Create a Topology CRD carrying the containerlab definition.
    pub async fn create_topology(
        &self,
        name: &str,
        namespace: &str,
        containerlab_yaml: &str,
    ) -> Result<(), CrdError> {
        let body = serde_json::json!({
            "apiVersion": format!("{CLABERNETES_GROUP}/{CLABERNETES_VERSION}"),
            "kind": CLABERNETES_KIND,
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": {
                    "app.kubernetes.io/name": name,
                    MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                },
            },
            "spec": {
                "naming": "prefixed",
                "expose": {
                    "disableAutoExpose": false,
                    "exposeType": "ClusterIP",
                },
                "definition": {
                    "containerlab": containerlab_yaml,
                },
            },
        });
        let object: DynamicObject = serde_json::from_value(body).expect("static CRD shape");

        match self.api(namespace).create(&PostParams::default(), &object).await {
            Ok(_) => {
                tracing::info!(topology = %name, namespace, "created clabernetes topology");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                tracing::warn!(topology = %name, namespace, "topology already exists");
                Err(CrdError::AlreadyExists(name.into(), namespace.into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_topology(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, CrdError> {
        match self.api(namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a topology; Ok(false) when it was already gone.
    pub async fn delete_topology(&self, name: &str, namespace: &str) -> Result<bool, CrdError> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(topology = %name, namespace, "deleted clabernetes topology");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                tracing::warn!(topology = %name, namespace, "topology not found");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List topologies carrying the managed-by marker, cluster-wide.
    pub async fn list_managed(&self) -> Result<Vec<DynamicObject>, CrdError> {
        let params =
            ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"));
        let list = self.api_all().list(&params).await?;
        Ok(list.items)
    }

    /// Current deployment status; Deleted when the object is gone.
    pub async fn get_status(&self, name: &str, namespace: &str) -> LabStatus {
        match self.get_topology(name, namespace).await {
            Ok(Some(obj)) => status_from_conditions(&obj),
            Ok(None) => LabStatus::Deleted,
            Err(e) => {
                tracing::warn!(topology = %name, error = %e, "status read failed");
                LabStatus::Unknown
            }
        }
    }
}
