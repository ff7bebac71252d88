//! Runtime configuration.
//!
//! Precedence: `TRIAGE_*` environment variables, then the TOML file, then
//! built-in defaults.
//!
//! | Variable                        | Field                              |
//! |---------------------------------|------------------------------------|
//! | `TRIAGE_LLM_BASE_URL`           | `llm.base_url`                     |
//! | `TRIAGE_LLM_API_KEY`            | `llm.api_key`                      |
//! | `TRIAGE_LLM_MODEL`              | `llm.model`                        |
//! | `TRIAGE_LLM_TIMEOUT_SECS`       | `llm.timeout_secs`                 |
//! | `TRIAGE_JOB_URL`                | `jobs.url` (enables remote jobs)   |
//! | `TRIAGE_JOB_SECRET`             | `jobs.secret`                      |
//! | `TRIAGE_CONFIDENCE_THRESHOLD`   | `tuning.confidence_threshold`      |
//! | `TRIAGE_DEBOUNCE_MS`            | `tuning.debounce_ms`               |
//! | `TRIAGE_STORE_PATH`             | `store_path`                       |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use triage::CONFIDENCE_THRESHOLD;

/// Messages for one thread arriving within this window are coalesced.
pub const DEFAULT_DEBOUNCE_MS: u64 = 3_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One way of checking that the LLM endpoint is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthProbe {
    /// GET `{base}/models` (OpenAI-compatible servers).
    Models,
    /// GET `/api/tags` on the server root (Ollama).
    OllamaTags,
    /// Minimal chat completion; any non-5xx counts as alive.
    Completion,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL including the API prefix, e.g. `http://localhost:8080/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub max_tokens: u32,
    pub merger_temperature: f32,
    pub generator_temperature: f32,
    /// Corrective retries after the first attempt.
    pub merger_max_retries: u32,
    pub generator_max_retries: u32,
    pub health_probes: Vec<HealthProbe>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            api_key: None,
            model: "llama3.1:8b".into(),
            timeout_secs: 120,
            health_timeout_secs: 5,
            max_tokens: 2048,
            merger_temperature: 0.2,
            generator_temperature: 0.3,
            merger_max_retries: 1,
            generator_max_retries: 2,
            health_probes: vec![
                HealthProbe::Models,
                HealthProbe::OllamaTags,
                HealthProbe::Completion,
            ],
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

/// Remote job-processing service. Absent means run everything locally.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobServiceConfig {
    pub url: String,
    pub secret: Option<String>,
    pub secret_header: String,
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: None,
            secret_header: "x-job-secret".into(),
            poll_interval_ms: 2_000,
            poll_timeout_secs: 120,
            request_timeout_secs: 10,
        }
    }
}

impl JobServiceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineTuning {
    pub confidence_threshold: f64,
    pub debounce_ms: u64,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            confidence_threshold: CONFIDENCE_THRESHOLD,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl PipelineTuning {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Top-level configuration. Fields missing from a file take the built-in
/// defaults; the environment is applied separately.
#[derive(Debug, Clone, Deserialize)]
#[serde(default = "TriageConfig::builtin")]
pub struct TriageConfig {
    pub llm: LlmConfig,
    pub jobs: Option<JobServiceConfig>,
    pub tuning: PipelineTuning,
    pub store_path: PathBuf,
}

impl Default for TriageConfig {
    fn default() -> Self {
        let mut config = Self::builtin();
        config.apply_env();
        config
    }
}

impl TriageConfig {
    /// Defaults without looking at the environment.
    pub fn builtin() -> Self {
        Self {
            llm: LlmConfig::default(),
            jobs: None,
            tuning: PipelineTuning::default(),
            store_path: PathBuf::from("triage-store.json"),
        }
    }

    /// Load a TOML file, then re-apply environment overrides.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse TOML; missing fields keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// File when given, environment and defaults otherwise. Always validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `TRIAGE_*` overrides from any key lookup. Unparseable numbers
    /// are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TRIAGE_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = var("TRIAGE_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = var("TRIAGE_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = var("TRIAGE_LLM_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.llm.timeout_secs = v;
        }
        if let Some(url) = var("TRIAGE_JOB_URL") {
            self.jobs.get_or_insert_with(JobServiceConfig::default).url = url;
        }
        if let (Some(jobs), Some(secret)) = (self.jobs.as_mut(), var("TRIAGE_JOB_SECRET")) {
            jobs.secret = Some(secret);
        }
        if let Some(v) = var("TRIAGE_CONFIDENCE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.tuning.confidence_threshold = v;
        }
        if let Some(v) = var("TRIAGE_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.tuning.debounce_ms = v;
        }
        if let Some(v) = var("TRIAGE_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.llm.base_url.trim().is_empty() {
            return invalid("llm.base_url must not be empty".into());
        }
        if self.llm.model.trim().is_empty() {
            return invalid("llm.model must not be empty".into());
        }
        for (name, t) in [
            ("merger_temperature", self.llm.merger_temperature),
            ("generator_temperature", self.llm.generator_temperature),
        ] {
            if !(0.0..=2.0).contains(&t) {
                return invalid(format!("llm.{name} must be within [0, 2], got {t}"));
            }
        }
        if self.llm.timeout_secs == 0 || self.llm.health_timeout_secs == 0 {
            return invalid("llm timeouts must be greater than zero".into());
        }
        if self.llm.max_tokens == 0 {
            return invalid("llm.max_tokens must be greater than zero".into());
        }
        if self.llm.health_probes.is_empty() {
            return invalid("llm.health_probes must list at least one probe".into());
        }
        if !(0.0..=1.0).contains(&self.tuning.confidence_threshold) {
            return invalid(format!(
                "tuning.confidence_threshold must be within [0, 1], got {}",
                self.tuning.confidence_threshold
            ));
        }
        if let Some(jobs) = &self.jobs {
            if jobs.url.trim().is_empty() {
                return invalid("jobs.url must not be empty when [jobs] is configured".into());
            }
            if jobs.poll_interval_ms == 0 || jobs.poll_timeout_secs == 0 {
                return invalid("jobs polling interval and timeout must be greater than zero".into());
            }
            if jobs.request_timeout_secs == 0 {
                return invalid("jobs.request_timeout_secs must be greater than zero".into());
            }
        }
        Ok(())
    }
}
