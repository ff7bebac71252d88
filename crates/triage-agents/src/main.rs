use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use triage::{
    transition_work_item, update_work_item, AuditAction, AuditFilter, AuditQuery, EntityType,
    MemoryStore, TriageStore, WorkItemStatus, WorkItemType, WorkItemUpdate,
};
use triage_agents::orchestrator::ingest_request;
use triage_agents::remote::{HttpJobService, JobService};
use triage_agents::{probe_llm_health, IngestOrchestrator, TriageConfig};

/// Feedback triage: fold customer messages into thread state and draft work items.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file. Environment variables (TRIAGE_*) override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot file for threads, work items and audit log.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one customer message and run the pipeline.
    Ingest {
        #[arg(long)]
        thread: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        channel: Option<String>,
        /// Run in the background with the AI-processing flag and wait for it.
        #[arg(long, default_value_t = false)]
        background: bool,
    },
    /// Generate a work item for a thread from its current state.
    Generate {
        #[arg(long)]
        thread: String,
        /// bug, feature, chore or docs. Inferred when omitted.
        #[arg(long = "type")]
        item_type: Option<String>,
    },
    /// Move a work item to a new lifecycle state.
    Transition {
        #[arg(long)]
        id: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Edit work item fields from a JSON patch.
    Update {
        #[arg(long)]
        id: String,
        /// e.g. '{"priority": "high", "labels": ["auth"]}'
        #[arg(long)]
        patch: String,
    },
    /// List work items, optionally for one thread.
    WorkItems {
        #[arg(long)]
        thread: Option<String>,
    },
    /// Delete a thread with its state and messages. Audit entries are kept.
    DeleteThread {
        #[arg(long)]
        thread: String,
    },
    /// Query the audit log, newest first.
    Audit {
        /// thread or work_item
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        entity_id: Option<String>,
        /// Dotted action name, e.g. gatekeeper.decided
        #[arg(long)]
        action: Option<String>,
        /// pipeline, work_item or errors
        #[arg(long)]
        filter: Option<AuditFilter>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Probe the LLM endpoint and, when configured, the job service.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = TriageConfig::load(args.config.as_deref()).context("Invalid configuration")?;
    if let Some(path) = args.store {
        config.store_path = path;
    }

    let store = Arc::new(
        MemoryStore::load(&config.store_path)
            .await
            .with_context(|| format!("Failed to load store {}", config.store_path.display()))?,
    );

    let mutated = run(args.command, &config, Arc::clone(&store)).await?;
    if mutated {
        store
            .save(&config.store_path)
            .await
            .with_context(|| format!("Failed to save store {}", config.store_path.display()))?;
    }
    Ok(())
}

/// Execute one command. Returns whether the store changed.
async fn run(command: Command, config: &TriageConfig, store: Arc<MemoryStore>) -> Result<bool> {
    match command {
        Command::Ingest {
            thread,
            message,
            channel,
            background,
        } => {
            let orchestrator = IngestOrchestrator::from_config(config, store.clone())?;
            info!(
                thread_id = %thread,
                executor = orchestrator.executor_name(),
                "Ingesting message"
            );
            let request = ingest_request(&thread, &message, channel.as_deref());

            if background {
                orchestrator
                    .run_ingest_pipeline_async(request)
                    .await?
                    .await
                    .context("Background ingest task panicked")?;
                print_json(&store.get_thread(&thread).await?)?;
            } else {
                let outcome = orchestrator.run_ingest_pipeline(request).await?;
                print_json(&outcome)?;
            }
            Ok(true)
        }
        Command::Generate { thread, item_type } => {
            let item_type = item_type.as_deref().map(parse_item_type).transpose()?;
            let orchestrator = IngestOrchestrator::from_config(config, store.clone())?;
            match orchestrator.generate_for_thread(&thread, item_type).await? {
                Some(item) => print_json(&item)?,
                None => bail!("Work item generation failed for thread {thread}; see audit log"),
            }
            Ok(true)
        }
        Command::Transition { id, to, reason } => {
            let to: WorkItemStatus = to.parse().map_err(anyhow::Error::msg)?;
            let item = transition_work_item(store.as_ref(), &id, to, reason.as_deref()).await?;
            print_json(&item)?;
            Ok(true)
        }
        Command::Update { id, patch } => {
            let update: WorkItemUpdate =
                serde_json::from_str(&patch).context("Patch must be a JSON object")?;
            let item = update_work_item(store.as_ref(), &id, &update).await?;
            print_json(&item)?;
            Ok(true)
        }
        Command::WorkItems { thread } => {
            print_json(&store.list_work_items(thread.as_deref()).await?)?;
            Ok(false)
        }
        Command::DeleteThread { thread } => {
            if !store.delete_thread(&thread).await? {
                bail!("No thread {thread}");
            }
            info!(thread_id = %thread, "Thread deleted");
            Ok(true)
        }
        Command::Audit {
            entity_type,
            entity_id,
            action,
            filter,
            limit,
        } => {
            let query = AuditQuery {
                entity_type: entity_type.as_deref().map(parse_entity_type).transpose()?,
                entity_id,
                action: action
                    .as_deref()
                    .map(|name| {
                        AuditAction::from_name(name)
                            .with_context(|| format!("Unknown audit action '{name}'"))
                    })
                    .transpose()?,
                filter,
                limit,
            };
            print_json(&store.query_audit(&query).await?)?;
            Ok(false)
        }
        Command::Health => {
            let llm = probe_llm_health(&config.llm).await;
            let jobs = match &config.jobs {
                Some(jobs) => Some(HttpJobService::new(jobs)?.health().await),
                None => None,
            };
            print_json(&serde_json::json!({ "llm": llm, "jobs": jobs }))?;
            Ok(false)
        }
    }
}

fn parse_item_type(raw: &str) -> Result<WorkItemType> {
    WorkItemType::parse(Some(&Value::String(raw.to_string())))
        .with_context(|| format!("Unknown work item type '{raw}'"))
}

fn parse_entity_type(raw: &str) -> Result<EntityType> {
    match raw.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
        "thread" => Ok(EntityType::Thread),
        "work_item" | "workitem" => Ok(EntityType::WorkItem),
        other => bail!("Unknown entity type '{other}'"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
