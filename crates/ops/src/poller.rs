//! Completion polling: fixed-interval status checks until a Job is terminal.

use std::sync::Arc;
use std::time::Duration;

use jobseq_kubehub::{Cluster, ClusterError};
use k8s_openapi::api::batch::v1::Job;
use metrics::counter;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Observed state of a submitted Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Active(i32),
    Succeeded,
    Failed,
}

impl JobState {
    /// Success wins over failure when both counters are set.
    pub fn of(job: &Job) -> Self {
        let st = job.status.as_ref();
        let succeeded = st.and_then(|s| s.succeeded).unwrap_or(0);
        let failed = st.and_then(|s| s.failed).unwrap_or(0);
        let active = st.and_then(|s| s.active).unwrap_or(0);
        if succeeded > 0 {
            JobState::Succeeded
        } else if failed > 0 {
            JobState::Failed
        } else if active > 0 {
            JobState::Active(active)
        } else {
            JobState::Pending
        }
    }

    pub fn terminal(self) -> Option<Terminal> {
        match self {
            JobState::Succeeded => Some(Terminal::Succeeded),
            JobState::Failed => Some(Terminal::Failed),
            JobState::Pending | JobState::Active(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("wait cancelled")]
    Cancelled,
    #[error("job not terminal after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5), timeout: None }
    }
}

/// Cancels every [`CancelToken`] cloned from the same pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool { *self.rx.borrow() }

    /// Resolves once cancelled. Never resolves if the handle is dropped uncancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() { return; }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

pub struct CompletionPoller {
    cluster: Arc<dyn Cluster>,
    policy: PollPolicy,
}

impl CompletionPoller {
    pub fn new(cluster: Arc<dyn Cluster>, policy: PollPolicy) -> Self { Self { cluster, policy } }

    pub fn policy(&self) -> PollPolicy { self.policy }

    /// Block until the Job reaches a terminal state. Read errors are returned
    /// as-is; nothing is retried.
    pub async fn wait(&self, namespace: &str, name: &str, cancel: Option<CancelToken>) -> Result<Terminal, PollError> {
        let started = Instant::now();
        let deadline = self.policy.timeout.map(|t| started + t);
        let mut cancel = cancel;
        let mut polls: u64 = 0;
        loop {
            if cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                return Err(PollError::Cancelled);
            }
            let job = self.cluster.read_job(namespace, name).await?;
            polls += 1;
            counter!("jobseq_polls_total", 1u64);
            let state = JobState::of(&job);
            match state.terminal() {
                Some(Terminal::Succeeded) => {
                    info!(ns = %namespace, job = %name, polls, "job succeeded");
                    return Ok(Terminal::Succeeded);
                }
                Some(Terminal::Failed) => {
                    error!(ns = %namespace, job = %name, polls, "job failed");
                    return Ok(Terminal::Failed);
                }
                None => {
                    let active = match state { JobState::Active(n) => n, _ => 0 };
                    info!(ns = %namespace, job = %name, active, "job status: {} active pods", active);
                }
            }

            let nap = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        warn!(ns = %namespace, job = %name, polls, "gave up waiting for job");
                        return Err(PollError::TimedOut(now - started));
                    }
                    (d - now).min(self.policy.interval)
                }
                None => self.policy.interval,
            };
            match cancel.as_mut() {
                Some(tok) => tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    _ = tok.cancelled() => {
                        warn!(ns = %namespace, job = %name, "wait cancelled");
                        return Err(PollError::Cancelled);
                    }
                },
                None => tokio::time::sleep(nap).await,
            }
        }
    }
}
