//! Batch mode: many transformations on a worker pool.
//!
//! A batch file is a JSON array of jobs:
//!
//! ```json
//! [
//!   { "source": "in/cat.jpg", "query": "w=200&quality=80", "output": "out/cat-200.jpg" },
//!   { "source": "in/dog.png", "query": "lb=300,300", "output": "out/dog.png",
//!     "accept": "image/webp", "dpr": "2" }
//! ]
//! ```
//!
//! Jobs run in parallel, each with its own [`ImageSubject`](crate::engine::ImageSubject);
//! only the configuration, backend and tool runner are shared. A failing job
//! is reported and does not stop the others.

use crate::config::{ProxyConfig, effective_threads};
use crate::engine::{Engine, Transformed};
use crate::imaging::ImageBackend;
use crate::optimize::ToolRunner;
use crate::request::ClientRequest;
use crate::response;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to create thread pool: {0}")]
    ThreadPool(String),
}

/// One entry of a batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchJob {
    pub source: PathBuf,
    #[serde(default)]
    pub query: String,
    pub output: PathBuf,
    #[serde(default)]
    pub accept: Option<String>,
    #[serde(default)]
    pub dpr: Option<String>,
    #[serde(default)]
    pub canonical_url: Option<String>,
}

impl BatchJob {
    pub fn request(&self) -> ClientRequest {
        let mut request = ClientRequest::from_query(&self.query);
        request.accept = self.accept.clone();
        request.dpr = self.dpr.clone();
        request.canonical_url = self.canonical_url.clone();
        request
    }
}

/// Per-job result written to the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub source: PathBuf,
    pub output: PathBuf,
    #[serde(flatten)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Ok {
        mime: String,
        size: usize,
        width: u32,
        height: u32,
        applied: Vec<String>,
        bytes_saved: u64,
        passthrough: bool,
        headers: Vec<(String, String)>,
    },
    Error {
        error: String,
    },
}

/// Read a batch file.
pub fn load_jobs(path: &Path) -> Result<Vec<BatchJob>, BatchError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now())
}

fn ok_status(config: &ProxyConfig, job: &BatchJob, result: &Transformed) -> JobStatus {
    let headers = response::headers(
        config,
        result,
        job.canonical_url.as_deref(),
        modified(&job.source),
        SystemTime::now(),
    );
    JobStatus::Ok {
        mime: result.mime_type().as_str().to_string(),
        size: result.bytes.len(),
        width: result.subject.dimensions.width,
        height: result.subject.dimensions.height,
        applied: result.subject.applied.iter().map(|s| s.to_string()).collect(),
        bytes_saved: result.subject.bytes_saved,
        passthrough: result.passthrough,
        headers: headers
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    }
}

fn run_job_inner(
    config: &ProxyConfig,
    engine: &Engine<'_>,
    job: &BatchJob,
) -> Result<JobStatus, Box<dyn std::error::Error + Send + Sync>> {
    let source = std::fs::read(&job.source)?;
    let result = engine.transform(&source, &job.request())?;
    if let Some(parent) = job.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&job.output, &result.bytes)?;
    Ok(ok_status(config, job, &result))
}

/// Run one job. Failures become an error status.
pub fn run_job(config: &ProxyConfig, engine: &Engine<'_>, job: &BatchJob) -> JobReport {
    let status = match run_job_inner(config, engine, job) {
        Ok(status) => status,
        Err(e) => {
            warn!(source = %job.source.display(), error = %e, "batch job failed");
            JobStatus::Error {
                error: e.to_string(),
            }
        }
    };
    JobReport {
        source: job.source.clone(),
        output: job.output.clone(),
        status,
    }
}

/// Run every job on a pool sized by `[processing]`. Reports keep job order.
pub fn run_batch(
    config: &ProxyConfig,
    backend: &dyn ImageBackend,
    runner: &dyn ToolRunner,
    jobs: &[BatchJob],
) -> Result<Vec<JobReport>, BatchError> {
    let threads = effective_threads(&config.processing);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| BatchError::ThreadPool(e.to_string()))?;
    let engine = Engine::new(config, backend, runner);

    info!(jobs = jobs.len(), threads, "running batch");
    let reports: Vec<JobReport> = pool.install(|| {
        jobs.par_iter()
            .map(|job| run_job(config, &engine, job))
            .collect()
    });

    let failed = reports
        .iter()
        .filter(|r| matches!(r.status, JobStatus::Error { .. }))
        .count();
    info!(ok = reports.len() - failed, failed, "batch finished");
    Ok(reports)
}
