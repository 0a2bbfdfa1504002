//! jobseq kubehub: the cluster capabilities the orchestrator consumes.
//!
//! Everything goes through the [`Cluster`] trait so the orchestration loop can be
//! driven against a live API server ([`KubeCluster`]) or, in tests, an
//! in-memory double (`mem::MemCluster`, behind the `mem` feature).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use jobseq_core::OwnerReferenceSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, PostParams},
    Client,
};
use tracing::debug;

#[cfg(feature = "mem")]
pub mod mem;

/// Cluster API failures, classified by what the orchestrator can say about them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
            kube::Error::Api(ae) => ClusterError::Rejected { code: ae.code, message: ae.message },
            other => ClusterError::Transport(other.to_string()),
        }
    }
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Namespaced object operations the orchestrator relies on.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Create a config object holding `data`, owned by `owners`.
    async fn create_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>, owners: &OwnerReferenceSet) -> ClusterResult<()>;
    /// Read a config object's data; absent data reads as empty.
    async fn read_config_map(&self, namespace: &str, name: &str) -> ClusterResult<BTreeMap<String, String>>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    /// Create a batch Job, returning the object as stored by the server.
    async fn create_job(&self, namespace: &str, job: &Job) -> ClusterResult<Job>;
    async fn read_job(&self, namespace: &str, name: &str) -> ClusterResult<Job>;

    async fn read_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod>;
}

/// Build a client from in-cluster config or the local kubeconfig.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client (in-cluster config or kubeconfig)")
}

/// [`Cluster`] backed by kube-rs typed APIs over an explicit client handle.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    fn config_maps(&self, ns: &str) -> Api<ConfigMap> { Api::namespaced(self.client.clone(), ns) }
    fn jobs(&self, ns: &str) -> Api<Job> { Api::namespaced(self.client.clone(), ns) }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn create_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>, owners: &OwnerReferenceSet) -> ClusterResult<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                owner_references: owners.to_metadata(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        self.config_maps(namespace).create(&PostParams::default(), &cm).await?;
        debug!(ns = %namespace, name = %name, "config map created");
        Ok(())
    }

    async fn read_config_map(&self, namespace: &str, name: &str) -> ClusterResult<BTreeMap<String, String>> {
        let cm = self.config_maps(namespace).get(name).await?;
        Ok(cm.data.unwrap_or_default())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        // Either the deleted object or a Status; both mean the delete was accepted.
        let _ = self.config_maps(namespace).delete(name, &DeleteParams::default()).await?;
        debug!(ns = %namespace, name = %name, "config map deleted");
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> ClusterResult<Job> {
        Ok(self.jobs(namespace).create(&PostParams::default(), job).await?)
    }

    async fn read_job(&self, namespace: &str, name: &str) -> ClusterResult<Job> {
        Ok(self.jobs(namespace).get(name).await?)
    }

    async fn read_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }
}
