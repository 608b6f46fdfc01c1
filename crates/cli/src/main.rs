//! `officeflow-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    — start an engine instance against Redis.
//! - `validate` — validate a workflow definition JSON file.
//! - `simulate` — drive one workflow end to end fully in memory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use bus::InMemoryBus;
use engine::{dag, EngineConfig, EngineService, InMemoryWorkflowRepository};
use model::{SystemClock, TriggerEvent, WorkflowDefinition};
use nodes::{MockExecutorService, ScriptedExecutor};
use store::{MemoryStore, RedisStore, StateStore, StoreConfig};

#[derive(Parser)]
#[command(
    name = "officeflow-engine",
    about = "Distributed workflow engine for employee lifecycle events",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an engine instance.
    Serve {
        /// Redis connection URL; omit to run on the in-memory store.
        #[arg(long, env = "REDIS_URL")]
        redis_url: Option<String>,
        /// Key namespace in the shared store.
        #[arg(long, env = "OFFICEFLOW_NAMESPACE", default_value = "officeflow:")]
        namespace: String,
        /// Directory of workflow definition JSON files to serve.
        #[arg(long, env = "OFFICEFLOW_WORKFLOWS", default_value = "workflows")]
        workflows: PathBuf,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Run one workflow in memory end to end and print the outcome.
    Simulate {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Optional trigger event JSON file; a synthetic onboard event is
        /// used when omitted.
        #[arg(long)]
        event: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            redis_url,
            namespace,
            workflows,
        } => serve(redis_url, namespace, workflows).await,
        Command::Validate { path } => validate(path),
        Command::Simulate { path, event } => simulate(path, event).await,
    }
}

fn load_definition(path: &PathBuf) -> anyhow::Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

async fn serve(
    redis_url: Option<String>,
    namespace: String,
    workflows: PathBuf,
) -> anyhow::Result<()> {
    let store_config = StoreConfig {
        namespace,
        ..Default::default()
    };
    let clock = Arc::new(SystemClock);
    let store: Arc<dyn StateStore> = match &redis_url {
        Some(url) => {
            info!(url, "connecting to Redis state store");
            Arc::new(RedisStore::connect(url, store_config).await?)
        }
        None => {
            info!("running on the in-memory state store");
            Arc::new(MemoryStore::new(store_config, clock.clone()))
        }
    };

    let repository = Arc::new(InMemoryWorkflowRepository::new());
    let mut loaded = 0usize;
    if workflows.is_dir() {
        for entry in std::fs::read_dir(&workflows)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let definition = load_definition(&path)?;
            dag::parse(&definition)
                .map_err(|errors| anyhow::anyhow!("{}: invalid definition: {errors:?}", path.display()))?;
            repository.insert(definition);
            loaded += 1;
        }
    }
    info!(loaded, "workflow definitions loaded");

    let bus = Arc::new(InMemoryBus::new());
    let service = EngineService::start(
        EngineConfig::default(),
        store,
        bus,
        repository,
        clock,
    )
    .await?;

    info!("engine running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    service.stop().await;
    Ok(())
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let definition = load_definition(&path)?;
    match dag::parse(&definition) {
        Ok(parsed) => {
            println!("workflow is valid");
            println!("  execution order: {:?}", parsed.topological_order);
            println!("  entry nodes:     {:?}", parsed.entry_nodes);
            println!("  exit nodes:      {:?}", parsed.exit_nodes);
            Ok(())
        }
        Err(errors) => {
            eprintln!("validation failed:");
            for error in &errors {
                eprintln!("  [{}] {}", error.code.as_str(), error.message);
            }
            std::process::exit(1);
        }
    }
}

async fn simulate(path: PathBuf, event_path: Option<PathBuf>) -> anyhow::Result<()> {
    let definition = load_definition(&path)?;
    if let Err(errors) = dag::parse(&definition) {
        bail!("definition invalid: {errors:?}");
    }

    let event: TriggerEvent = match event_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_str(&raw)?
        }
        None => TriggerEvent {
            event_type: format!("employee.{:?}.started", definition.trigger).to_lowercase(),
            organization_id: definition.org_id.clone(),
            employee_id: "emp-sim".into(),
            payload: serde_json::json!({}),
            timestamp: chrono::Utc::now(),
            correlation_id: None,
        },
    };

    let clock = Arc::new(SystemClock);
    let store: Arc<dyn StateStore> =
        Arc::new(MemoryStore::new(StoreConfig::default(), clock.clone()));
    let bus = Arc::new(InMemoryBus::new());
    let repository = Arc::new(InMemoryWorkflowRepository::new());
    repository.insert(definition.clone());

    // Every executor succeeds with an empty output in simulation.
    let executors =
        MockExecutorService::start(bus.clone(), Arc::new(ScriptedExecutor::new())).await;

    let service = EngineService::start(
        EngineConfig::default(),
        store,
        bus,
        repository,
        clock,
    )
    .await?;

    let runs = service.trigger_event(&event).await?;
    let Some(run) = runs.first() else {
        bail!("event matched no active workflow");
    };
    info!(run_id = %run.run_id, "simulation started");

    // Give the in-memory pipeline a moment to drain.
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if let Some(state) = service.run_state(run.run_id).await? {
            if state.status.is_terminal() {
                println!("run {} finished: {}", run.run_id, state.status);
                println!("  completed: {:?}", state.completed_nodes);
                println!("  failed:    {:?}", state.failed_nodes);
                println!("  skipped:   {:?}", state.skipped_nodes);
                service.stop().await;
                executors.stop().await;
                return Ok(());
            }
        }
    }

    service.stop().await;
    executors.stop().await;
    bail!("simulation did not reach a terminal status in time");
}
