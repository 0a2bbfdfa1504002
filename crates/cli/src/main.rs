use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jobseq_api::{cancel_pair, RunOutcome, SequenceDriver};
use jobseq_core::DocLimits;
use jobseq_kubehub::{Cluster, KubeCluster};
use jobseq_ops::{PollPolicy, SelfIdentity};
use jobseq_store::SeedSource;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "jobseq", version, about = "Run a queue-driven sequence of Kubernetes Jobs")]
struct Cli {
    /// Namespace for every object created
    #[arg(long = "namespace", env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Config map whose values seed the queue (otherwise the jobs directory is scanned)
    #[arg(long = "job-configmap", env = "JOB_CONFIGMAP")]
    job_configmap: Option<String>,

    /// Base name for derived result channel and job names
    #[arg(long = "job-name", env = "JOB_NAME")]
    job_name: Option<String>,

    /// Our own pod, used to find the enclosing Job
    #[arg(long = "pod-name", env = "HOSTNAME")]
    pod_name: Option<String>,

    /// Directory scanned for *.yaml / *.yml job documents
    #[arg(long = "jobs-dir", env = "JOBSEQ_JOBS_DIR", default_value = "/jobs")]
    jobs_dir: PathBuf,

    /// Seconds between job status checks
    #[arg(long = "poll-secs", env = "JOBSEQ_POLL_SECS", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    poll_secs: u64,

    /// Give up on a job after this many seconds (default: wait forever)
    #[arg(long = "timeout-secs", env = "JOBSEQ_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Reject job documents larger than this many bytes
    #[arg(long = "max-doc-bytes", env = "JOBSEQ_MAX_DOC_BYTES", default_value_t = DocLimits::default().max_bytes)]
    max_doc_bytes: usize,

    /// Reject job documents with more than this many YAML nodes
    #[arg(long = "max-doc-nodes", env = "JOBSEQ_MAX_DOC_NODES", default_value_t = DocLimits::default().max_nodes)]
    max_doc_nodes: usize,
}

impl Cli {
    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll_secs),
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }

    fn doc_limits(&self) -> DocLimits {
        DocLimits { max_bytes: self.max_doc_bytes, max_nodes: self.max_doc_nodes }
    }

    fn self_identity(&self) -> SelfIdentity {
        SelfIdentity {
            pod_name: self.pod_name.clone().filter(|s| !s.is_empty()),
            job_name: self.job_name.clone().filter(|s| !s.is_empty()),
        }
    }

    fn seed_source(&self) -> SeedSource {
        SeedSource::choose(self.job_configmap.clone(), &self.jobs_dir)
    }
}

fn init_tracing() {
    let env = std::env::var("JOBSEQ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("JOBSEQ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid JOBSEQ_METRICS_ADDR; expected host:port");
        }
    }
}

/// Ctrl-C, or SIGTERM when the pod is being torn down.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(cli: Cli) -> Result<RunOutcome> {
    info!(ns = %cli.namespace, "starting the job sequence");
    let client = jobseq_kubehub::get_kube_client().await?;
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(client));

    let (driver, queue) = SequenceDriver::bootstrap(cluster, &cli.namespace, &cli.self_identity(), &cli.seed_source(), cli.poll_policy(), cli.doc_limits())
        .await
        .context("preparing job sequence")?;

    let (handle, token) = cancel_pair();
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown signal received; cancelling current wait");
        handle.cancel();
    });
    let outcome = driver.run_with_cancel(queue, Some(token)).await;
    signals.abort();
    outcome.context("running job sequence")
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(outcome) => {
            match &outcome {
                RunOutcome::Completed { steps } => info!(steps, "job sequence completed"),
                RunOutcome::Aborted { steps, failed_job } => error!(steps, job = %failed_job, "job sequence aborted"),
            }
            outcome.exit_code()
        }
        Err(e) => {
            error!(error = ?e, "job sequence failed");
            eprintln!("jobseq error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
