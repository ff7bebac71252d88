//! Remote job delegation.
//!
//! The job service accepts `POST {url}/jobs/{kind}` with a shared-secret
//! header and answers `{jobId, queue, status}`. Progress is read from
//! `GET {url}/jobs/{kind}/{jobId}/status`. [`RemoteExecutor`] polls until the
//! job completes, fails or the deadline passes, and translates the outcome
//! into the same shapes the local executor returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use triage::WorkItem;

use crate::config::JobServiceConfig;
use crate::errors::{snippet, JobError, PipelineError, SNIPPET_CHARS};
use crate::pipeline::{GenerateRequest, IngestRequest, PipelineExecutor, PipelineOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Ingest,
    GenerateWorkItem,
}

impl JobKind {
    pub fn path(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::GenerateWorkItem => "generate-workitem",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedJob {
    pub job_id: String,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Completed,
    Failed,
    /// Anything not finished yet (`pending`, `waiting`, `active`, ...).
    #[serde(other)]
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub status: JobState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobServiceHealth {
    pub ready: bool,
    pub healthy: bool,
    pub detail: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobService: Send + Sync {
    async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<EnqueuedJob, JobError>;

    async fn status(&self, kind: JobKind, job_id: &str) -> Result<JobStatus, JobError>;

    /// Probe `/ready` and `/health`.
    async fn health(&self) -> JobServiceHealth;
}

/// Job service client over reqwest.
pub struct HttpJobService {
    client: reqwest::Client,
    base_url: String,
    secret: Option<String>,
    secret_header: String,
}

impl HttpJobService {
    pub fn new(config: &JobServiceConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            secret: config.secret.clone(),
            secret_header: config.secret_header.clone(),
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => builder.header(self.secret_header.as_str(), secret),
            None => builder,
        }
    }

    async fn probe(&self, path: &str) -> Result<(), String> {
        let url = format!("{}/{path}", self.base_url);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| format!("{url}: {e}"))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("{url}: HTTP {}", resp.status().as_u16()))
        }
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<EnqueuedJob, JobError> {
        let endpoint = format!("{}/jobs/{}", self.base_url, kind.path());
        let enqueue_err = |message: String| JobError::Enqueue {
            kind: kind.to_string(),
            endpoint: endpoint.clone(),
            message,
        };

        let resp = self
            .authed(self.client.post(&endpoint).json(&payload))
            .send()
            .await
            .map_err(|e| enqueue_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(enqueue_err(format!(
                "HTTP {}: {}",
                status.as_u16(),
                snippet(&body, SNIPPET_CHARS)
            )));
        }
        let job: EnqueuedJob = resp
            .json()
            .await
            .map_err(|e| enqueue_err(format!("unreadable response: {e}")))?;
        info!(kind = %kind, job_id = %job.job_id, queue = %job.queue, "Job enqueued");
        Ok(job)
    }

    async fn status(&self, kind: JobKind, job_id: &str) -> Result<JobStatus, JobError> {
        let endpoint = format!("{}/jobs/{}/{job_id}/status", self.base_url, kind.path());
        let status_err = |message: String| JobError::Status {
            job_id: job_id.to_string(),
            endpoint: endpoint.clone(),
            message,
        };

        let resp = self
            .authed(self.client.get(&endpoint))
            .send()
            .await
            .map_err(|e| status_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_err(format!("HTTP {}", resp.status().as_u16())));
        }
        resp.json()
            .await
            .map_err(|e| status_err(format!("unreadable response: {e}")))
    }

    async fn health(&self) -> JobServiceHealth {
        let ready = self.probe("ready").await;
        let healthy = self.probe("health").await;
        let detail = [ready.as_ref().err(), healthy.as_ref().err()]
            .into_iter()
            .flatten()
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        JobServiceHealth {
            ready: ready.is_ok(),
            healthy: healthy.is_ok(),
            detail: if detail.is_empty() {
                "ok".to_string()
            } else {
                detail
            },
        }
    }
}

/// Delegates pipeline runs to the job service and waits for the result.
pub struct RemoteExecutor {
    jobs: Arc<dyn JobService>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(jobs: Arc<dyn JobService>, config: &JobServiceConfig) -> Self {
        Self {
            jobs,
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
        }
    }

    /// Enqueue a job and poll until it finishes or the deadline passes.
    pub async fn run_job(&self, kind: JobKind, payload: Value) -> Result<Value, JobError> {
        let job = self.jobs.enqueue(kind, payload).await?;
        self.wait_for(kind, &job.job_id).await
    }

    /// Run a job and decode its result.
    async fn run_typed<Req, T>(&self, kind: JobKind, request: &Req) -> Result<T, JobError>
    where
        Req: Serialize + Sync,
        T: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(|e| JobError::Enqueue {
            kind: kind.to_string(),
            endpoint: String::new(),
            message: format!("unserializable payload: {e}"),
        })?;
        let job = self.jobs.enqueue(kind, payload).await?;
        let result = self.wait_for(kind, &job.job_id).await?;
        serde_json::from_value(result).map_err(|e| JobError::InvalidResult {
            job_id: job.job_id,
            message: e.to_string(),
        })
    }

    async fn wait_for(&self, kind: JobKind, job_id: &str) -> Result<Value, JobError> {
        let start = Instant::now();

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let status = self.jobs.status(kind, job_id).await?;
            match status.status {
                JobState::Completed => {
                    debug!(kind = %kind, job_id = %job_id, "Job completed");
                    return Ok(status.result.unwrap_or(Value::Null));
                }
                JobState::Failed => {
                    let reason = status
                        .failed_reason
                        .unwrap_or_else(|| "no reason given".to_string());
                    warn!(kind = %kind, job_id = %job_id, reason = %reason, "Job failed");
                    return Err(JobError::JobFailed {
                        job_id: job_id.to_string(),
                        reason,
                    });
                }
                JobState::Pending => {
                    if start.elapsed() >= self.poll_timeout {
                        warn!(kind = %kind, job_id = %job_id, "Job polling timed out");
                        return Err(JobError::Timeout {
                            job_id: job_id.to_string(),
                            waited_secs: self.poll_timeout.as_secs(),
                        });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PipelineExecutor for RemoteExecutor {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn ingest(&self, request: &IngestRequest) -> Result<PipelineOutcome, PipelineError> {
        Ok(self.run_typed(JobKind::Ingest, request).await?)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Option<WorkItem>, PipelineError> {
        Ok(self.run_typed(JobKind::GenerateWorkItem, request).await?)
    }
}
