//! jobseq sequence driver.
//!
//! Owns the FIFO queue and runs one step at a time: derive a name, create the
//! result channel, submit the job, wait for it, read the channel, delete it,
//! then either extend the queue with the harvested documents or stop.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use jobseq_core::{DocLimits, JobDocument, JobIdentity, ResolutionError, ShapeError};
use jobseq_kubehub::{Cluster, ClusterError};
use jobseq_ops::{CancelToken, CompletionPoller, JobLauncher, LaunchError, Ownership, OwnershipBinder, PollError, PollPolicy, ResultChannels, SelfIdentity, Terminal};
use jobseq_store::{JobQueue, SeedError, SeedSource};
use metrics::{counter, histogram};
use tracing::{error, info, warn};

pub use jobseq_ops::{cancel_pair, CancelHandle};

/// How a sequence ended when no error interrupted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Queue exhausted; every job succeeded.
    Completed { steps: usize },
    /// A job reached the failed state; nothing after it was submitted.
    Aborted { steps: usize, failed_job: String },
}

impl RunOutcome {
    pub fn steps(&self) -> usize {
        match self {
            RunOutcome::Completed { steps } | RunOutcome::Aborted { steps, .. } => *steps,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed { .. } => 0,
            RunOutcome::Aborted { .. } => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("step {step}: {source}")]
    Shape { step: usize, #[source] source: ShapeError },
    #[error("step {step}: submitting job {name}: {source}")]
    Submission { step: usize, name: String, #[source] source: ClusterError },
    #[error("step {step}: result channel {channel}: {source}")]
    Channel { step: usize, channel: String, #[source] source: ClusterError },
    #[error("step {step}: waiting for job {job}: {source}")]
    Poll { step: usize, job: String, #[source] source: PollError },
    #[error("resolving job identity: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("seeding queue: {0}")]
    Seed(#[from] SeedError),
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub namespace: String,
    pub ownership: Ownership,
    pub poll: PollPolicy,
    /// Guards applied to every document popped off the queue.
    pub limits: DocLimits,
}

pub struct SequenceDriver {
    settings: DriverSettings,
    channels: ResultChannels,
    launcher: JobLauncher,
    poller: CompletionPoller,
}

/// What a step produced before its channel is deleted.
struct StepResult {
    job: String,
    terminal: Terminal,
    payload: Vec<String>,
}

impl SequenceDriver {
    pub fn new(cluster: Arc<dyn Cluster>, settings: DriverSettings) -> Self {
        Self {
            channels: ResultChannels::new(cluster.clone()),
            launcher: JobLauncher::new(cluster.clone()),
            poller: CompletionPoller::new(cluster, settings.poll),
            settings,
        }
    }

    /// Resolve ownership and seed the queue. Only reads happen here, so a
    /// failure leaves nothing behind in the cluster.
    pub async fn bootstrap(
        cluster: Arc<dyn Cluster>,
        namespace: &str,
        me: &SelfIdentity,
        seed: &SeedSource,
        poll: PollPolicy,
        limits: DocLimits,
    ) -> Result<(Self, JobQueue), SequenceError> {
        let ownership = OwnershipBinder::new(cluster.clone()).resolve(namespace, me).await?;
        let queue = seed.load(cluster.as_ref(), namespace).await?;
        let settings = DriverSettings { namespace: namespace.to_string(), ownership, poll, limits };
        Ok((Self::new(cluster, settings), queue))
    }

    pub fn settings(&self) -> &DriverSettings { &self.settings }

    pub async fn run(&self, queue: JobQueue) -> Result<RunOutcome, SequenceError> {
        self.run_with_cancel(queue, None).await
    }

    /// Process the queue to exhaustion or first failure. `cancel` interrupts the
    /// completion wait; the step's channel is still cleaned up.
    pub async fn run_with_cancel(&self, mut queue: JobQueue, cancel: Option<CancelToken>) -> Result<RunOutcome, SequenceError> {
        let ns = self.settings.namespace.as_str();
        info!(ns = %ns, queued = queue.len(), base = %self.settings.ownership.base, "starting job sequence");
        let mut steps = 0usize;

        while let Some(text) = queue.pop_front() {
            steps += 1;
            let started = Instant::now();
            let document = JobDocument::parse_with_limits(&text, self.settings.limits)
                .and_then(|d| d.validate().map(|_| d))
                .map_err(|source| SequenceError::Shape { step: steps, source })?;

            let identity = JobIdentity::derive(&self.settings.ownership.base);
            let channel = identity.name();
            self.channels
                .create(ns, channel, &self.settings.ownership.owners)
                .await
                .map_err(|source| SequenceError::Channel { step: steps, channel: channel.to_string(), source })?;

            let result = match self.execute(steps, document, &identity, cancel.clone()).await {
                Ok(r) => r,
                Err(e) => {
                    self.cleanup(ns, channel).await;
                    return Err(e);
                }
            };
            self.channels
                .delete(ns, channel)
                .await
                .map_err(|source| SequenceError::Channel { step: steps, channel: channel.to_string(), source })?;

            counter!("jobseq_steps_total", 1u64);
            histogram!("jobseq_step_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
            match result.terminal {
                Terminal::Failed => {
                    counter!("jobseq_jobs_failed_total", 1u64);
                    error!(ns = %ns, job = %result.job, step = steps, "exiting due to job failure");
                    return Ok(RunOutcome::Aborted { steps, failed_job: result.job });
                }
                Terminal::Succeeded => {
                    if !result.payload.is_empty() {
                        info!(job = %result.job, follow_ups = result.payload.len(), "queueing follow-up jobs");
                    }
                    queue.extend_back(result.payload);
                }
            }
        }

        info!(ns = %ns, steps, "job sequence completed");
        Ok(RunOutcome::Completed { steps })
    }

    /// Submit, wait, and read the channel. The caller owns channel deletion.
    async fn execute(&self, step: usize, document: JobDocument, identity: &JobIdentity, cancel: Option<CancelToken>) -> Result<StepResult, SequenceError> {
        let ns = self.settings.namespace.as_str();
        let handle = self
            .launcher
            .submit(ns, document, identity, &self.settings.ownership.owners)
            .await
            .map_err(|e| match e {
                LaunchError::Shape(source) => SequenceError::Shape { step, source },
                LaunchError::Submit(source) => SequenceError::Submission { step, name: identity.name().to_string(), source },
            })?;

        info!(ns = %ns, job = %handle.name, step, "waiting for job to complete");
        let terminal = self
            .poller
            .wait(ns, &handle.name, cancel)
            .await
            .map_err(|source| SequenceError::Poll { step, job: handle.name.clone(), source })?;

        let data = self
            .channels
            .read(ns, identity.name())
            .await
            .map_err(|source| SequenceError::Channel { step, channel: identity.name().to_string(), source })?;
        Ok(StepResult { job: handle.name, terminal, payload: data.into_values().collect() })
    }

    async fn cleanup(&self, ns: &str, channel: &str) {
        if let Err(e) = self.channels.delete(ns, channel).await {
            counter!("jobseq_channel_cleanup_errors_total", 1u64);
            warn!(ns = %ns, channel = %channel, error = %e, "failed to delete result channel after step error; owner GC is the backstop");
        }
    }
}
