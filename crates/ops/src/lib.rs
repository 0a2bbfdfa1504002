//! jobseq ops: the per-step cluster operations of a job sequence.
//!
//! - [`ResultChannels`]: create/read/delete the ephemeral config map a job reports through.
//! - [`JobLauncher`]: bind the channel into a job document and submit it once.
//! - [`CompletionPoller`]: fixed-interval wait for a terminal job state.
//! - [`OwnershipBinder`]: find the enclosing Job so created objects are garbage collected with it.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use jobseq_core::{BaseName, JobDocument, JobIdentity, OwnerReferenceSet, ResolutionError, ShapeError};
use jobseq_kubehub::{Cluster, ClusterError, ClusterResult};
use metrics::counter;
use tracing::{debug, info, warn};

pub mod poller;

pub use poller::{cancel_pair, CancelHandle, CancelToken, CompletionPoller, JobState, PollError, PollPolicy, Terminal};

/// Manages the lifecycle of per-step result channels.
pub struct ResultChannels {
    cluster: Arc<dyn Cluster>,
}

impl ResultChannels {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self { Self { cluster } }

    /// Create an empty channel; must happen before the job that writes to it starts.
    pub async fn create(&self, namespace: &str, name: &str, owners: &OwnerReferenceSet) -> ClusterResult<()> {
        info!(ns = %namespace, channel = %name, "creating result channel");
        self.cluster.create_config_map(namespace, name, BTreeMap::new(), owners).await?;
        counter!("jobseq_channels_created_total", 1u64);
        Ok(())
    }

    pub async fn read(&self, namespace: &str, name: &str) -> ClusterResult<BTreeMap<String, String>> {
        info!(ns = %namespace, channel = %name, "reading result channel");
        let data = self.cluster.read_config_map(namespace, name).await?;
        debug!(channel = %name, entries = data.len(), "result channel read");
        Ok(data)
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        info!(ns = %namespace, channel = %name, "deleting result channel");
        self.cluster.delete_config_map(namespace, name).await?;
        counter!("jobseq_channels_deleted_total", 1u64);
        Ok(())
    }
}

/// Name of a submitted Job as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("submitting job: {0}")]
    Submit(#[from] ClusterError),
}

pub struct JobLauncher {
    cluster: Arc<dyn Cluster>,
}

impl JobLauncher {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self { Self { cluster } }

    /// Name the document after `identity`, record `owners`, bind the result
    /// channel into its environment and create the Job. No retries.
    pub async fn submit(&self, namespace: &str, mut document: JobDocument, identity: &JobIdentity, owners: &OwnerReferenceSet) -> Result<JobHandle, LaunchError> {
        document.prepare(identity.name(), owners, identity.name())?;
        let job = document.into_job()?;
        info!(ns = %namespace, job = %identity, "creating job");
        let created = self.cluster.create_job(namespace, &job).await?;
        counter!("jobseq_jobs_submitted_total", 1u64);
        let name = created.metadata.name.unwrap_or_else(|| identity.name().to_string());
        Ok(JobHandle { name })
    }
}

/// Who the orchestrator is: its own pod (when running in-cluster) and an
/// optional explicit job-family name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfIdentity {
    pub pod_name: Option<String>,
    pub job_name: Option<String>,
}

/// Resolved naming base and owner chain for every object of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Ownership {
    pub base: BaseName,
    pub owners: OwnerReferenceSet,
}

pub struct OwnershipBinder {
    cluster: Arc<dyn Cluster>,
}

impl OwnershipBinder {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self { Self { cluster } }

    /// Resolve the enclosing Job through our pod's owner references, falling back
    /// to the configured job name. Fails when neither yields a name.
    pub async fn resolve(&self, namespace: &str, me: &SelfIdentity) -> Result<Ownership, ResolutionError> {
        let enclosing = match me.pod_name.as_deref() {
            Some(pod) => self.enclosing_job(namespace, pod).await,
            None => None,
        };
        let base = match (me.job_name.as_deref(), enclosing.as_ref()) {
            (Some(explicit), _) => BaseName::new(explicit)?,
            (None, Some((job, _))) => BaseName::from_object_name(job)?,
            (None, None) => return Err(ResolutionError::NoIdentity),
        };
        let owners = match &enclosing {
            Some((job, uid)) => OwnerReferenceSet::enclosing_job(job, uid),
            None => OwnerReferenceSet::new(),
        };
        info!(base = %base, owners = owners.len(), "resolved job identity");
        Ok(Ownership { base, owners })
    }

    async fn enclosing_job(&self, namespace: &str, pod: &str) -> Option<(String, String)> {
        match self.cluster.read_pod(namespace, pod).await {
            Ok(p) => {
                let owner = p.metadata.owner_references.unwrap_or_default().into_iter().find(|o| o.kind == "Job");
                if owner.is_none() {
                    warn!(ns = %namespace, pod = %pod, "no enclosing Job found for pod");
                }
                owner.map(|o| (o.name, o.uid))
            }
            Err(e) => {
                warn!(ns = %namespace, pod = %pod, error = %e, "self pod lookup failed; no enclosing Job");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobseq_core::document::result_channel_of;
    use jobseq_kubehub::mem::{ClusterEvent, FailPoint, MemCluster};
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    const DOC: &str = "spec:\n  template:\n    spec:\n      containers:\n        - name: main\n          image: busybox\n";

    fn pod(name: &str, owner_kind: &str) -> Pod {
        pod_owned_by(name, owner_kind, "nightly-pipeline")
    }

    fn pod_owned_by(name: &str, owner_kind: &str, owner: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "batch/v1".into(),
                    kind: owner_kind.into(),
                    name: owner.into(),
                    uid: "1c7e4c4e-0b43-4a8e-bb5f-6a3f8a0b9e21".into(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn channel_lifecycle_records_owners() {
        let c = Arc::new(MemCluster::new());
        let channels = ResultChannels::new(c.clone());
        let owners = OwnerReferenceSet::enclosing_job("parent", "uid-1");
        channels.create("ns", "job-a1", &owners).await.unwrap();
        assert!(channels.read("ns", "job-a1").await.unwrap().is_empty());
        channels.delete("ns", "job-a1").await.unwrap();
        assert!(c.config_map_names("ns").is_empty());
        match &c.events()[0] {
            ClusterEvent::ConfigMapCreated { name, owners } => {
                assert_eq!(name, "job-a1");
                assert_eq!(owners[0].name, "parent");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn launcher_names_and_binds_the_channel() {
        let c = Arc::new(MemCluster::new());
        let launcher = JobLauncher::new(c.clone());
        let id = JobIdentity::derive(&BaseName::new("seq").unwrap());
        let handle = launcher.submit("ns", JobDocument::parse(DOC).unwrap(), &id, &OwnerReferenceSet::new()).await.unwrap();
        assert_eq!(handle.name, id.name());
        let jobs = c.created_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(result_channel_of(&jobs[0]), Some(id.name()));
    }

    #[tokio::test]
    async fn launcher_surfaces_submission_errors() {
        let c = Arc::new(MemCluster::new());
        c.fail_next(FailPoint::CreateJob, ClusterError::Rejected { code: 422, message: "bad".into() });
        let launcher = JobLauncher::new(c.clone());
        let id = JobIdentity::derive(&BaseName::new("seq").unwrap());
        let err = launcher.submit("ns", JobDocument::parse(DOC).unwrap(), &id, &OwnerReferenceSet::new()).await.unwrap_err();
        assert!(matches!(err, LaunchError::Submit(ClusterError::Rejected { code: 422, .. })));
        assert!(c.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn launcher_rejects_documents_without_containers() {
        let c = Arc::new(MemCluster::new());
        let launcher = JobLauncher::new(c.clone());
        let id = JobIdentity::derive(&BaseName::new("seq").unwrap());
        let doc = JobDocument::parse("spec:\n  template:\n    spec: {}\n").unwrap();
        let err = launcher.submit("ns", doc, &id, &OwnerReferenceSet::new()).await.unwrap_err();
        assert!(matches!(err, LaunchError::Shape(_)));
        assert!(c.events().is_empty());
    }

    #[tokio::test]
    async fn binder_prefers_enclosing_job() {
        let c = Arc::new(MemCluster::new());
        c.put_pod("ns", pod("runner-xyz", "Job"));
        let binder = OwnershipBinder::new(c.clone());
        let me = SelfIdentity { pod_name: Some("runner-xyz".into()), job_name: None };
        let own = binder.resolve("ns", &me).await.unwrap();
        assert_eq!(own.base.as_str(), "nightly-pipeline");
        let refs = own.owners.to_metadata().unwrap();
        assert_eq!(refs[0].uid, "1c7e4c4e-0b43-4a8e-bb5f-6a3f8a0b9e21");
        assert_eq!(refs[0].controller, Some(false));
    }

    #[tokio::test]
    async fn dotted_enclosing_job_name_yields_a_label_base() {
        let c = Arc::new(MemCluster::new());
        c.put_pod("ns", pod_owned_by("runner-abc", "Job", "nightly.v2"));
        let binder = OwnershipBinder::new(c.clone());
        let me = SelfIdentity { pod_name: Some("runner-abc".into()), job_name: None };
        let own = binder.resolve("ns", &me).await.unwrap();
        assert_eq!(own.base.as_str(), "nightly-v2");
        assert_eq!(own.owners.to_metadata().unwrap()[0].name, "nightly.v2");
        let derived = JobIdentity::derive(&own.base);
        assert!(derived.name().starts_with("nightly-v2-"), "name={}", derived);
    }

    #[tokio::test]
    async fn explicit_job_name_overrides_base_but_keeps_owner() {
        let c = Arc::new(MemCluster::new());
        c.put_pod("ns", pod("runner-xyz", "Job"));
        let binder = OwnershipBinder::new(c.clone());
        let me = SelfIdentity { pod_name: Some("runner-xyz".into()), job_name: Some("custom".into()) };
        let own = binder.resolve("ns", &me).await.unwrap();
        assert_eq!(own.base.as_str(), "custom");
        assert_eq!(own.owners.len(), 1);
    }

    #[tokio::test]
    async fn binder_falls_back_when_pod_lookup_fails() {
        let c = Arc::new(MemCluster::new());
        let binder = OwnershipBinder::new(c.clone());
        let me = SelfIdentity { pod_name: Some("missing".into()), job_name: Some("fallback".into()) };
        let own = binder.resolve("ns", &me).await.unwrap();
        assert_eq!(own.base.as_str(), "fallback");
        assert!(own.owners.is_empty());
    }

    #[tokio::test]
    async fn binder_ignores_non_job_owners() {
        let c = Arc::new(MemCluster::new());
        c.put_pod("ns", pod("rs-pod", "ReplicaSet"));
        let binder = OwnershipBinder::new(c.clone());
        let me = SelfIdentity { pod_name: Some("rs-pod".into()), job_name: None };
        assert_eq!(binder.resolve("ns", &me).await.unwrap_err(), ResolutionError::NoIdentity);
    }

    #[tokio::test]
    async fn binder_without_any_source_is_fatal() {
        let c = Arc::new(MemCluster::new());
        let binder = OwnershipBinder::new(c.clone());
        assert_eq!(binder.resolve("ns", &SelfIdentity::default()).await.unwrap_err(), ResolutionError::NoIdentity);
        assert!(c.events().is_empty());
    }
}
