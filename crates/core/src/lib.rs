//! jobseq core types: job documents, derived names and owner references.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod document;
pub mod naming;

pub use document::{DocLimits, JobDocument, ShapeError, RESULT_CHANNEL_ENV};
pub use naming::{BaseName, JobIdentity, ResolutionError};

pub mod prelude {
    pub use super::{BaseName, JobDocument, JobIdentity, OwnerReferenceSet, ResolutionError, ShapeError, RESULT_CHANNEL_ENV};
}

/// Owner references stamped onto every object the orchestrator creates.
///
/// Usually empty (running outside a Job) or a single reference to the enclosing Job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerReferenceSet(SmallVec<[OwnerReference; 1]>);

impl OwnerReferenceSet {
    pub fn new() -> Self { Self::default() }

    /// Reference to an enclosing batch/v1 Job. Not a controller reference: the Job
    /// controller must not try to adopt the objects we create.
    pub fn enclosing_job(name: &str, uid: &str) -> Self {
        let mut refs = SmallVec::new();
        refs.push(OwnerReference {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            block_owner_deletion: Some(true),
            controller: Some(false),
        });
        Self(refs)
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn iter(&self) -> impl Iterator<Item = &OwnerReference> { self.0.iter() }

    /// Value for `metadata.ownerReferences`, `None` when there is nothing to record.
    pub fn to_metadata(&self) -> Option<Vec<OwnerReference>> {
        if self.0.is_empty() { None } else { Some(self.0.to_vec()) }
    }
}
