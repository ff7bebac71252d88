//! Pipeline error taxonomy with retry classification.
//!
//! Callers can query `is_retriable()` / `retry_category()` without string
//! matching. Only invalid structured output is retried, and only inside the
//! completion client's correction loop.
//!
//! | Category       | Retriable | Source                                   |
//! |----------------|-----------|------------------------------------------|
//! | Transport      | no        | connection refused, DNS, TLS             |
//! | Timeout        | no        | completion or job request timed out      |
//! | HttpStatus     | no        | non-2xx from the LLM or job service      |
//! | InvalidOutput  | yes       | model reply failed parse/validation      |
//! | JobFailed      | no        | remote job reported failure              |
//! | JobTimeout     | no        | remote job still pending after deadline  |
//! | Persistence    | no        | store write failed                       |

use std::fmt;

use thiserror::Error;
use triage::StoreError;

/// Raw model output kept on errors is cut to this many characters when logged.
pub const SNIPPET_CHARS: usize = 200;

/// Classification used to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    Transport,
    Timeout,
    HttpStatus,
    InvalidOutput,
    JobFailed,
    JobTimeout,
    Persistence,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::InvalidOutput)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Timeout => write!(f, "timeout"),
            Self::HttpStatus => write!(f, "http_status"),
            Self::InvalidOutput => write!(f, "invalid_output"),
            Self::JobFailed => write!(f, "job_failed"),
            Self::JobTimeout => write!(f, "job_timeout"),
            Self::Persistence => write!(f, "persistence"),
        }
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn snippet(raw: &str, max: usize) -> String {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &raw[..idx]),
        None => raw.to_string(),
    }
}

/// Failure of a structured chat completion.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// Connection-level failure talking to the endpoint.
    #[error("LLM transport error at {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("LLM request to {endpoint} timed out after {timeout_secs}s")]
    Timeout { endpoint: String, timeout_secs: u64 },

    #[error("LLM endpoint {endpoint} returned HTTP {status}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Every attempt produced output that failed parsing or validation.
    #[error("invalid structured output after {attempts} attempt(s): {reason}")]
    InvalidOutput {
        attempts: u32,
        reason: String,
        last_raw: String,
    },
}

impl CompletionError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Transport { .. } => RetryCategory::Transport,
            Self::Timeout { .. } => RetryCategory::Timeout,
            Self::Http { .. } => RetryCategory::HttpStatus,
            Self::InvalidOutput { .. } => RetryCategory::InvalidOutput,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }

    /// The endpoint involved, for network-level failures.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Transport { endpoint, .. }
            | Self::Timeout { endpoint, .. }
            | Self::Http { endpoint, .. } => Some(endpoint),
            Self::InvalidOutput { .. } => None,
        }
    }

    /// Truncated raw model output, for invalid-output failures.
    pub fn raw_snippet(&self) -> Option<String> {
        match self {
            Self::InvalidOutput { last_raw, .. } => Some(snippet(last_raw, SNIPPET_CHARS)),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(endpoint: &str, timeout_secs: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                endpoint: endpoint.to_string(),
                timeout_secs,
            }
        } else {
            Self::Transport {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Failure talking to the remote job service.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to enqueue {kind} job at {endpoint}: {message}")]
    Enqueue {
        kind: String,
        endpoint: String,
        message: String,
    },

    #[error("failed to read status of job {job_id} at {endpoint}: {message}")]
    Status {
        job_id: String,
        endpoint: String,
        message: String,
    },

    /// The job ran and reported failure.
    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    /// The job was still pending when the polling deadline passed.
    #[error("job {job_id} did not finish within {waited_secs}s")]
    Timeout { job_id: String, waited_secs: u64 },

    #[error("job {job_id} returned an unreadable result: {message}")]
    InvalidResult { job_id: String, message: String },
}

impl JobError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Enqueue { .. } | Self::Status { .. } => RetryCategory::Transport,
            Self::JobFailed { .. } => RetryCategory::JobFailed,
            Self::Timeout { .. } => RetryCategory::JobTimeout,
            Self::InvalidResult { .. } => RetryCategory::InvalidOutput,
        }
    }

    pub fn is_retriable(&self) -> bool {
        // Remote results are not re-requested.
        false
    }
}

/// Unified error for one pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Completion(e) => e.retry_category(),
            Self::Job(e) => e.retry_category(),
            Self::Store(_) => RetryCategory::Persistence,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Completion(e) => e.is_retriable(),
            Self::Job(e) => e.is_retriable(),
            Self::Store(_) => false,
        }
    }
}
