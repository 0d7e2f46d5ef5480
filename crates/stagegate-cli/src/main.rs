//! Stagegate CLI
//!
//! The `stagegate` command drives gated build pipelines from a shell.
//!
//! ## Commands
//!
//! - `init`, `status`, `transition`: pipeline lifecycle
//! - `lock`, `unlock`: stage lock around a producer run
//! - `request-approval`, `approve`, `reject`, `halt`: human gate
//! - `artifact`: submit, approve, verify and show artifacts
//! - `verify`, `audit`, `apply`: verification and completion decisions
//! - `validate`: downstream preconditions
//! - `hash`, `classify`: offline helpers

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use uuid::Uuid;

use stagegate_core::{
    ClassificationRules, FsWorkspace, GateConfig, ProvenanceHasher, StageLock, Stagegate,
    StateSnapshot,
};
use stagegate_state::{
    ArtifactType, ContentDigest, DecisionStore, EventLog, LockToken, PipelineId, PipelineReader,
    PipelineStatus, SurrealGateStore,
};

const DEFAULT_CONFIG: &str = "stagegate.toml";

#[derive(Parser)]
#[command(name = "stagegate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Gated, hash-locked, auditable build pipelines", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ./stagegate.toml when present)
    #[arg(short, long, global = true, env = "STAGEGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a pipeline in `initialized`
    Init {
        pipeline: String,

        /// Workspace resource name (default: the pipeline id)
        #[arg(long)]
        workspace_ref: Option<String>,
    },

    /// Show one pipeline, or list all of them
    Status { pipeline: Option<String> },

    /// Advance a pipeline along one edge of the transition table
    Transition { pipeline: String, to: PipelineStatus },

    /// Take the stage lock; prints the lock id
    Lock { pipeline: String, stage: String },

    /// Release the stage lock, optionally completing the stage
    Unlock {
        pipeline: String,
        lock_id: Uuid,

        /// Status to move to in the same write
        #[arg(long)]
        complete: Option<PipelineStatus>,
    },

    /// Pause the pipeline for human sign-off
    RequestApproval {
        pipeline: String,
        #[arg(short, long)]
        reason: String,
    },

    /// Human approval: move to `to` and reopen the gate
    Approve {
        pipeline: String,
        to: PipelineStatus,
        #[arg(long, default_value = "operator")]
        reviewer: String,
    },

    /// Human rejection: fail the pipeline
    Reject {
        pipeline: String,
        #[arg(short, long)]
        reason: String,
        #[arg(long, default_value = "operator")]
        reviewer: String,
    },

    /// Halt a pipeline until a human answers
    Halt {
        pipeline: String,
        #[arg(short, long)]
        reason: String,
    },

    /// Artifact registry operations
    Artifact {
        #[command(subcommand)]
        action: ArtifactAction,
    },

    /// Compute the provenance hash of a payload file
    Hash {
        #[arg(short = 't', long = "type")]
        artifact_type: ArtifactType,

        /// JSON payload file
        payload: PathBuf,

        /// Upstream hashes, in order
        #[arg(short, long)]
        upstream: Vec<String>,
    },

    /// Record the execution units of the build plan
    PlanUnits {
        pipeline: String,
        #[arg(required = true)]
        units: Vec<String>,
    },

    /// Run the built-in and configured checks against a workspace
    Verify {
        pipeline: String,

        /// Workspace directory (default: <workspace_root>/<workspace_ref>)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Decide on the latest verification result
    Audit { pipeline: String },

    /// Execute the latest completion decision
    Apply { pipeline: String },

    /// Check the preconditions of downstream operations
    Validate { pipeline: String },

    /// Classify diagnostic lines with the configured rules
    Classify {
        #[arg(required = true)]
        lines: Vec<String>,
    },

    /// Print the event log of a pipeline
    Events { pipeline: String },
}

#[derive(Subcommand)]
enum ArtifactAction {
    /// Submit a draft
    Submit {
        pipeline: String,
        #[arg(short = 't', long = "type")]
        artifact_type: ArtifactType,
        #[arg(short, long)]
        stage: String,
        /// JSON payload file
        payload: PathBuf,
        /// Upstream hashes of approved artifacts
        #[arg(short, long)]
        upstream: Vec<String>,
    },
    /// Hash-lock and approve a draft
    Approve { artifact_id: String },
    /// Re-hash an approved artifact; a mismatch halts the pipeline
    Verify { artifact_id: String },
    /// Print an artifact as JSON
    Show { artifact_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stagegate_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    // Offline commands never touch the database.
    match &cli.command {
        Commands::Hash {
            artifact_type,
            payload,
            upstream,
        } => return cmd_hash(*artifact_type, payload, upstream),
        Commands::Classify { lines } => return cmd_classify(&config, lines),
        _ => {}
    }

    let store = Arc::new(
        SurrealGateStore::from_env()
            .await
            .context("Failed to connect to Stagegate database")?,
    );
    let gate = Stagegate::new(store.clone(), &config)?;

    match cli.command {
        Commands::Init {
            pipeline,
            workspace_ref,
        } => cmd_init(&gate, &pipeline, workspace_ref.as_deref()).await,
        Commands::Status { pipeline } => match pipeline {
            Some(pipeline) => cmd_status(&gate, &pipeline).await,
            None => cmd_list(store.as_ref()).await,
        },
        Commands::Transition { pipeline, to } => {
            let state = gate.conductor.transition(&pid(&pipeline), to).await?;
            println!("{} -> {}", pipeline, state.status);
            Ok(())
        }
        Commands::Lock { pipeline, stage } => {
            let lock = gate.conductor.lock(&pid(&pipeline), &stage).await?;
            println!("{}", lock.lock_id);
            Ok(())
        }
        Commands::Unlock {
            pipeline,
            lock_id,
            complete,
        } => cmd_unlock(&gate, &pipeline, lock_id, complete).await,
        Commands::RequestApproval { pipeline, reason } => {
            gate.conductor
                .request_approval(&pid(&pipeline), &reason)
                .await?;
            println!("{} is awaiting approval", pipeline);
            Ok(())
        }
        Commands::Approve {
            pipeline,
            to,
            reviewer,
        } => {
            let state = gate
                .conductor
                .approve(&pid(&pipeline), to, &reviewer)
                .await?;
            println!("{} approved by {} -> {}", pipeline, reviewer, state.status);
            Ok(())
        }
        Commands::Reject {
            pipeline,
            reason,
            reviewer,
        } => {
            gate.conductor
                .reject(&pid(&pipeline), &reviewer, &reason)
                .await?;
            println!("{} rejected by {}: {}", pipeline, reviewer, reason);
            Ok(())
        }
        Commands::Halt { pipeline, reason } => {
            gate.conductor.halt(&pid(&pipeline), &reason).await?;
            println!("{} halted: {}", pipeline, reason);
            Ok(())
        }
        Commands::Artifact { action } => cmd_artifact(&gate, action).await,
        Commands::PlanUnits { pipeline, units } => {
            let state = gate.conductor.plan_units(&pid(&pipeline), units).await?;
            println!(
                "{} execution units planned for {}",
                state.progress.units.len(),
                pipeline
            );
            Ok(())
        }
        Commands::Verify { pipeline, dir } => {
            cmd_verify(&gate, &config, &pipeline, dir.as_deref()).await
        }
        Commands::Audit { pipeline } => {
            let decision = gate.auditor.audit(&pid(&pipeline)).await?;
            print_json(&decision)
        }
        Commands::Apply { pipeline } => cmd_apply(&gate, store.as_ref(), &pipeline).await,
        Commands::Validate { pipeline } => {
            gate.preconditions.validate(&pid(&pipeline)).await?;
            println!("All preconditions hold for {}", pipeline);
            Ok(())
        }
        Commands::Events { pipeline } => cmd_events(store.as_ref(), &pipeline).await,
        Commands::Hash { .. } | Commands::Classify { .. } => Ok(()),
    }
}

fn pid(raw: &str) -> PipelineId {
    PipelineId::from(raw)
}

fn load_config(path: Option<&Path>) -> Result<GateConfig> {
    let default = Path::new(DEFAULT_CONFIG);
    let path = path.or_else(|| default.exists().then_some(default));
    let config = GateConfig::load_layered(path)
        .with_context(|| format!("Failed to load configuration {:?}", path))?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_payload(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path).context(format!("Failed to read {:?}", path))?;
    serde_json::from_str(&raw).context(format!("{:?} is not valid JSON", path))
}

fn parse_hashes(raw: &[String]) -> Result<Vec<ContentDigest>> {
    raw.iter()
        .map(|h| {
            h.parse::<ContentDigest>()
                .map_err(|e| anyhow::anyhow!("invalid upstream hash {}: {}", h, e))
        })
        .collect()
}

/// Initialize a pipeline
async fn cmd_init(gate: &Stagegate, pipeline: &str, workspace_ref: Option<&str>) -> Result<()> {
    let id = pid(pipeline);
    let state = gate
        .conductor
        .initialize_in(&id, workspace_ref.unwrap_or(pipeline))
        .await?;
    info!(pipeline_id = %id, "pipeline initialized");
    println!("Initialized pipeline {}", state.pipeline_id);
    println!("  workspace:     {}", state.workspace_ref);
    println!("  repair budget: {}", state.repair.budget);
    Ok(())
}

fn print_snapshot(s: &StateSnapshot) {
    println!("Pipeline {}", s.pipeline_id);
    println!("  status:   {}", s.status);
    match &s.lock_holder {
        Some(holder) => println!("  lock:     held by {}", holder),
        None => println!("  lock:     free"),
    }
    match &s.gate_reason {
        Some(reason) => println!("  gate:     {} ({})", s.gate, reason),
        None => println!("  gate:     {}", s.gate),
    }
    if let Some(stage) = &s.last_stage {
        println!("  last stage: {}", stage);
    }
    println!("  attempt:  {}/{}", s.repair_attempt, s.repair_budget);
    if let Some(unit) = &s.current_unit {
        println!("  unit:     {} ({} pending)", unit, s.pending_units);
    }
    let next: Vec<&str> = s.allowed_next_states.iter().map(|st| st.as_str()).collect();
    println!(
        "  next:     {}",
        if next.is_empty() {
            "-".to_string()
        } else {
            next.join(", ")
        }
    );
}

/// Show pipeline status
async fn cmd_status(gate: &Stagegate, pipeline: &str) -> Result<()> {
    let snapshot = gate.conductor.snapshot(&pid(pipeline)).await?;
    print_snapshot(&snapshot);
    Ok(())
}

/// List pipelines
async fn cmd_list(store: &SurrealGateStore) -> Result<()> {
    let pipelines = store.list_pipelines().await?;
    if pipelines.is_empty() {
        println!("No pipelines");
        return Ok(());
    }
    for state in pipelines {
        println!(
            "{:<24} {:<20} {}",
            state.pipeline_id,
            state.status.as_str(),
            state.gate.label()
        );
    }
    Ok(())
}

/// Release or complete a stage lock
async fn cmd_unlock(
    gate: &Stagegate,
    pipeline: &str,
    lock_id: Uuid,
    complete: Option<PipelineStatus>,
) -> Result<()> {
    let id = pid(pipeline);
    let state = gate.conductor.state(&id).await?;
    let stage = match &state.lock {
        LockToken::Held { holder, .. } => holder.clone(),
        LockToken::Free => bail!("{} is not locked", pipeline),
    };
    let lock = StageLock {
        pipeline_id: id,
        lock_id,
        stage,
    };
    let state = match complete {
        Some(target) => gate.conductor.complete_stage(&lock, target).await?,
        None => gate.conductor.unlock(&lock).await?,
    };
    println!("Released {} ({})", lock.stage, state.status);
    Ok(())
}

/// Artifact registry operations
async fn cmd_artifact(gate: &Stagegate, action: ArtifactAction) -> Result<()> {
    match action {
        ArtifactAction::Submit {
            pipeline,
            artifact_type,
            stage,
            payload,
            upstream,
        } => {
            let artifact = gate
                .registry
                .submit(
                    &pid(&pipeline),
                    artifact_type,
                    &stage,
                    read_payload(&payload)?,
                    parse_hashes(&upstream)?,
                )
                .await?;
            println!("{}", artifact.artifact_id);
        }
        ArtifactAction::Approve { artifact_id } => {
            let artifact = gate.registry.approve(&artifact_id).await?;
            if let Some(hash) = artifact.content_hash {
                println!("{}", hash);
            }
        }
        ArtifactAction::Verify { artifact_id } => {
            let hash = gate.registry.verify(&artifact_id).await?;
            println!("OK {}", hash);
        }
        ArtifactAction::Show { artifact_id } => {
            let artifact = gate.registry.get(&artifact_id).await?;
            print_json(&artifact)?;
        }
    }
    Ok(())
}

/// Hash a payload offline
fn cmd_hash(artifact_type: ArtifactType, payload: &Path, upstream: &[String]) -> Result<()> {
    let hash = ProvenanceHasher::new().hash(
        artifact_type,
        &read_payload(payload)?,
        &parse_hashes(upstream)?,
    )?;
    println!("{}", hash);
    Ok(())
}

/// Classify diagnostic lines offline
fn cmd_classify(config: &GateConfig, lines: &[String]) -> Result<()> {
    let rules: ClassificationRules = config.classification_rules()?;
    print_json(&rules.classify(lines))
}

/// Run checks for the pipeline's current attempt
async fn cmd_verify(
    gate: &Stagegate,
    config: &GateConfig,
    pipeline: &str,
    dir: Option<&Path>,
) -> Result<()> {
    let id = pid(pipeline);
    let state = gate.conductor.state(&id).await?;
    let root = dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.workspace_dir(&state.workspace_ref));
    if !root.is_dir() {
        bail!("workspace directory {:?} does not exist", root);
    }

    let result = gate
        .verification
        .run_checks(
            &id,
            state.repair.attempt,
            state.progress.current(),
            &FsWorkspace::new(root),
        )
        .await?;

    for step in &result.steps {
        println!("[{}] {} (exit {})", step.status.as_str(), step.command, step.exit_code);
        for line in step.stderr.lines() {
            println!("    {}", line);
        }
    }
    println!(
        "attempt {}: {} ({})",
        result.attempt,
        result.overall_status.as_str(),
        result.result_hash.short()
    );
    Ok(())
}

/// Apply the latest recorded decision
async fn cmd_apply(gate: &Stagegate, store: &SurrealGateStore, pipeline: &str) -> Result<()> {
    let id = pid(pipeline);
    let decision = store
        .latest_decision(&id)
        .await?
        .context(format!("No completion decision recorded for {}", pipeline))?;
    let state = gate.conductor.apply_decision(&decision).await?;
    println!(
        "Applied {} -> {} ({})",
        decision.decision_type,
        state.status,
        state.gate.label()
    );
    Ok(())
}

/// Print the event log
async fn cmd_events(store: &SurrealGateStore, pipeline: &str) -> Result<()> {
    for event in store.events(&pid(pipeline)).await? {
        println!(
            "{:>4} {} {:<24} {}",
            event.seq,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.kind,
            event.payload
        );
    }
    Ok(())
}
