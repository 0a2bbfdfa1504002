//! In-memory [`Cluster`] double.
//!
//! Jobs follow a [`JobScript`]: they stay active for a number of polls, then
//! write their result payload into their result channel and turn terminal.
//! Every call is appended to an event log so tests can assert ordering.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use jobseq_core::document::result_channel_of;
use jobseq_core::OwnerReferenceSet;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::{Cluster, ClusterError, ClusterResult};

/// How a job created in the [`MemCluster`] behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    /// Reads that observe the job as active before it turns terminal.
    pub active_polls: u32,
    pub succeed: bool,
    /// Written into the job's result channel when it turns terminal.
    pub result: BTreeMap<String, String>,
}

impl JobScript {
    pub fn succeed() -> Self { Self { active_polls: 0, succeed: true, result: BTreeMap::new() } }
    pub fn fail() -> Self { Self { active_polls: 0, succeed: false, result: BTreeMap::new() } }

    pub fn active_for(mut self, polls: u32) -> Self { self.active_polls = polls; self }

    pub fn with_result(mut self, key: &str, doc: &str) -> Self {
        self.result.insert(key.to_string(), doc.to_string());
        self
    }
}

/// Calls observed by the [`MemCluster`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    ConfigMapCreated { name: String, owners: Vec<OwnerReference> },
    ConfigMapRead { name: String },
    ConfigMapDeleted { name: String },
    JobCreated { name: String, channel: Option<String> },
    JobPolled { name: String },
    PodRead { name: String },
}

/// Operation that can be made to fail once via [`MemCluster::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateConfigMap,
    ReadConfigMap,
    DeleteConfigMap,
    CreateJob,
    ReadJob,
    ReadPod,
}

struct MemJob {
    job: Job,
    script: JobScript,
    polls: u32,
}

#[derive(Default)]
struct MemState {
    config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    jobs: HashMap<(String, String), MemJob>,
    pods: HashMap<(String, String), Pod>,
    scripts: VecDeque<JobScript>,
    failures: HashMap<FailPoint, ClusterError>,
    events: Vec<ClusterEvent>,
}

impl MemState {
    fn take_failure(&mut self, point: FailPoint) -> ClusterResult<()> {
        match self.failures.remove(&point) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Deterministic cluster held entirely in memory. Jobs without a queued script
/// succeed on their first poll with an empty result.
#[derive(Default)]
pub struct MemCluster {
    state: Mutex<MemState>,
}

impl MemCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the behavior of the next created job (scripts are consumed in creation order).
    pub fn script(&self, script: JobScript) -> &Self {
        self.lock().scripts.push_back(script);
        self
    }

    /// Make the next call at `point` fail with `err`.
    pub fn fail_next(&self, point: FailPoint, err: ClusterError) {
        self.lock().failures.insert(point, err);
    }

    pub fn put_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.lock().config_maps.insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn put_pod(&self, namespace: &str, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.lock().pods.insert((namespace.to_string(), name), pod);
    }

    pub fn events(&self) -> Vec<ClusterEvent> { self.lock().events.clone() }

    /// Names of config maps that currently exist in `namespace`.
    pub fn config_map_names(&self, namespace: &str) -> Vec<String> {
        self.lock().config_maps.keys().filter(|(ns, _)| ns == namespace).map(|(_, n)| n.clone()).collect()
    }

    /// Jobs in creation order, as submitted.
    pub fn created_jobs(&self) -> Vec<Job> {
        let st = self.lock();
        st.events
            .iter()
            .filter_map(|e| match e {
                ClusterEvent::JobCreated { name, .. } => st.jobs.values().find(|j| j.job.metadata.name.as_deref() == Some(name.as_str())).map(|j| j.job.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Cluster for MemCluster {
    async fn create_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>, owners: &OwnerReferenceSet) -> ClusterResult<()> {
        let mut st = self.lock();
        st.take_failure(FailPoint::CreateConfigMap)?;
        let key = (namespace.to_string(), name.to_string());
        if st.config_maps.contains_key(&key) {
            return Err(ClusterError::Conflict(format!("configmaps \"{}\" already exists", name)));
        }
        st.config_maps.insert(key, data);
        st.events.push(ClusterEvent::ConfigMapCreated { name: name.to_string(), owners: owners.iter().cloned().collect() });
        Ok(())
    }

    async fn read_config_map(&self, namespace: &str, name: &str) -> ClusterResult<BTreeMap<String, String>> {
        let mut st = self.lock();
        st.take_failure(FailPoint::ReadConfigMap)?;
        st.events.push(ClusterEvent::ConfigMapRead { name: name.to_string() });
        st.config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("configmaps \"{}\" not found", name)))
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut st = self.lock();
        st.take_failure(FailPoint::DeleteConfigMap)?;
        if st.config_maps.remove(&(namespace.to_string(), name.to_string())).is_none() {
            return Err(ClusterError::NotFound(format!("configmaps \"{}\" not found", name)));
        }
        st.events.push(ClusterEvent::ConfigMapDeleted { name: name.to_string() });
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> ClusterResult<Job> {
        let mut st = self.lock();
        st.take_failure(FailPoint::CreateJob)?;
        let name = job
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Rejected { code: 422, message: "metadata.name: Required value".into() })?;
        let key = (namespace.to_string(), name.clone());
        if st.jobs.contains_key(&key) {
            return Err(ClusterError::Conflict(format!("jobs.batch \"{}\" already exists", name)));
        }
        let mut stored = job.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        let script = st.scripts.pop_front().unwrap_or_else(JobScript::succeed);
        let channel = result_channel_of(&stored).map(|s| s.to_string());
        st.jobs.insert(key, MemJob { job: stored.clone(), script, polls: 0 });
        st.events.push(ClusterEvent::JobCreated { name, channel });
        Ok(stored)
    }

    async fn read_job(&self, namespace: &str, name: &str) -> ClusterResult<Job> {
        let mut st = self.lock();
        st.take_failure(FailPoint::ReadJob)?;
        st.events.push(ClusterEvent::JobPolled { name: name.to_string() });
        let key = (namespace.to_string(), name.to_string());
        let mj = st.jobs.get_mut(&key).ok_or_else(|| ClusterError::NotFound(format!("jobs.batch \"{}\" not found", name)))?;
        if mj.job.status.as_ref().map(|s| s.succeeded.is_some() || s.failed.is_some()).unwrap_or(false) {
            return Ok(mj.job.clone());
        }
        mj.polls += 1;
        if mj.polls <= mj.script.active_polls {
            mj.job.status = Some(JobStatus { active: Some(1), ..Default::default() });
            return Ok(mj.job.clone());
        }
        mj.job.status = Some(if mj.script.succeed {
            JobStatus { succeeded: Some(1), ..Default::default() }
        } else {
            JobStatus { failed: Some(1), ..Default::default() }
        });
        let job = mj.job.clone();
        let result = mj.script.result.clone();
        if let Some(channel) = result_channel_of(&job) {
            if let Some(data) = st.config_maps.get_mut(&(namespace.to_string(), channel.to_string())) {
                data.extend(result);
            }
        }
        Ok(job)
    }

    async fn read_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod> {
        let mut st = self.lock();
        st.take_failure(FailPoint::ReadPod)?;
        st.events.push(ClusterEvent::PodRead { name: name.to_string() });
        st.pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("pods \"{}\" not found", name)))
    }
}
