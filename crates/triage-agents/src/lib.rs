//! LLM side of feedback triage.
//!
//! The deterministic pieces (salvage, coercion, gatekeeper, lifecycle, store)
//! live in the `triage` crate. This crate adds the parts that talk to the
//! outside world: the completion client with its corrective retry loop, the
//! thread state merger and work item generator built on it, the remote job
//! service, and the ingest orchestrator that ties them together.

pub mod config;
pub mod debounce;
pub mod errors;
pub mod generator;
pub mod llm;
pub mod merger;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod remote;

pub use config::{JobServiceConfig, LlmConfig, PipelineTuning, TriageConfig};
pub use debounce::DebounceScheduler;
pub use errors::{CompletionError, JobError, PipelineError, RetryCategory};
pub use generator::WorkItemGenerator;
pub use llm::{probe_llm_health, ChatBackend, CompletionClient, HttpChatBackend, LlmHealth};
pub use merger::{MergeOutcome, MessageMetadata, ThreadStateMerger};
pub use orchestrator::{build_executor, IngestOrchestrator};
pub use pipeline::{
    GenerateRequest, IngestRequest, LocalExecutor, PipelineExecutor, PipelineOutcome,
};
pub use remote::{HttpJobService, JobService, RemoteExecutor};
