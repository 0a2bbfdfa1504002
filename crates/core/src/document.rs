//! Typed view over a serialized batch/v1 Job definition.
//!
//! Only the paths the orchestrator touches are modelled: `metadata.name`,
//! `metadata.ownerReferences` and the container env lists. Everything else is
//! carried through untouched in flattened catch-all maps.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::OwnerReferenceSet;

/// Env var through which a running job learns the name of its result channel.
pub const RESULT_CHANNEL_ENV: &str = "JOBSEQUENCE_RESULT_CONFIGMAP";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("job document too large (>{limit} bytes)")]
    TooLarge { limit: usize },
    #[error("job document too complex (>{limit} nodes)")]
    TooComplex { limit: usize },
    #[error("parsing job document: {0}")]
    Parse(String),
    #[error("job document is not a mapping")]
    NotAMapping,
    #[error("job document missing {0}")]
    Missing(&'static str),
    #[error("job document is not a valid batch/v1 Job: {0}")]
    NotAJob(String),
}

/// Size guards applied before a document is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for DocLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_references: Option<Vec<OwnerReference>>,
    #[serde(flatten)]
    pub rest: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocJobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<DocPodTemplate>,
    #[serde(flatten)]
    pub rest: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocPodTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<DocPodSpec>,
    #[serde(flatten)]
    pub rest: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocPodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<DocContainer>>,
    #[serde(flatten)]
    pub rest: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocContainer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(flatten)]
    pub rest: Map<String, Json>,
}

/// One unit of work popped off the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<DocJobSpec>,
    #[serde(flatten)]
    pub rest: Map<String, Json>,
}

impl JobDocument {
    /// Parse a YAML (or JSON) document under the default [`DocLimits`].
    pub fn parse(text: &str) -> Result<Self, ShapeError> {
        Self::parse_with_limits(text, DocLimits::default())
    }

    pub fn parse_with_limits(text: &str, limits: DocLimits) -> Result<Self, ShapeError> {
        if text.len() > limits.max_bytes {
            return Err(ShapeError::TooLarge { limit: limits.max_bytes });
        }
        let val: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| ShapeError::Parse(e.to_string()))?;
        let json = serde_json::to_value(val).map_err(|e| ShapeError::Parse(e.to_string()))?;
        if node_budget_exceeded(&json, limits.max_nodes) {
            return Err(ShapeError::TooComplex { limit: limits.max_nodes });
        }
        if !json.is_object() {
            return Err(ShapeError::NotAMapping);
        }
        serde_json::from_value(json).map_err(|e| ShapeError::Parse(e.to_string()))
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.name.as_deref())
    }

    /// Check that the primary container exists. Runs before any mutation.
    pub fn validate(&self) -> Result<(), ShapeError> {
        let spec = self.spec.as_ref().ok_or(ShapeError::Missing("spec"))?;
        let template = spec.template.as_ref().ok_or(ShapeError::Missing("spec.template"))?;
        let pod = template.spec.as_ref().ok_or(ShapeError::Missing("spec.template.spec"))?;
        let containers = pod.containers.as_ref().ok_or(ShapeError::Missing("spec.template.spec.containers"))?;
        if containers.is_empty() {
            return Err(ShapeError::Missing("spec.template.spec.containers[0]"));
        }
        Ok(())
    }

    fn primary_container_mut(&mut self) -> Result<&mut DocContainer, ShapeError> {
        self.spec
            .as_mut()
            .and_then(|s| s.template.as_mut())
            .and_then(|t| t.spec.as_mut())
            .and_then(|p| p.containers.as_mut())
            .and_then(|c| c.first_mut())
            .ok_or(ShapeError::Missing("spec.template.spec.containers[0]"))
    }

    /// Assign the step name and owners and bind the result channel into the
    /// primary container's environment. A missing env list is initialized empty;
    /// a stale binding for the channel key is replaced so exactly one remains.
    pub fn prepare(&mut self, name: &str, owners: &OwnerReferenceSet, channel: &str) -> Result<(), ShapeError> {
        self.validate()?;
        let meta = self.metadata.get_or_insert_with(DocMetadata::default);
        meta.name = Some(name.to_string());
        if let Some(refs) = owners.to_metadata() {
            meta.owner_references = Some(refs);
        }
        let env = self.primary_container_mut()?.env.get_or_insert_with(Vec::new);
        env.retain(|e| e.name != RESULT_CHANNEL_ENV);
        env.push(EnvVar { name: RESULT_CHANNEL_ENV.to_string(), value: Some(channel.to_string()), value_from: None });
        Ok(())
    }

    pub fn into_job(self) -> Result<Job, ShapeError> {
        let json = serde_json::to_value(&self).map_err(|e| ShapeError::NotAJob(e.to_string()))?;
        serde_json::from_value(json).map_err(|e| ShapeError::NotAJob(e.to_string()))
    }
}

/// Name of the result channel bound into a Job's primary container, if any.
pub fn result_channel_of(job: &Job) -> Option<&str> {
    job.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == RESULT_CHANNEL_ENV)
        .and_then(|e| e.value.as_deref())
}

/// True when the tree holds more than `max` nodes. Stops counting at `max + 1`.
fn node_budget_exceeded(root: &Json, max: usize) -> bool {
    let mut seen = 0usize;
    let mut pending = vec![root];
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen > max {
            return true;
        }
        match node {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    false
}
