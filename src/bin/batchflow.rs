//! batchflow CLI: operator interface to workflows and their run history.

use batchflow::archive::RunFilter;
use batchflow::config::{Config, ExposeSecret};
use batchflow::db::Db;
use batchflow::definition::{Backend, DefinitionRegistry};
use batchflow::model::{RunId, State, WorkUnit, WorkflowRun};
use batchflow::telemetry::{TelemetryConfig, init_telemetry};
use batchflow::trigger::Shutdown;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "batchflow", about = "Idempotent batch-job workflows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load workflow definitions and run their triggers until Ctrl-C
    Serve {
        /// Directory containing workflow TOML definitions
        #[arg(long)]
        workflows: Option<PathBuf>,
    },
    /// Run one work unit through a workflow in the foreground
    Run {
        /// Workflow name
        workflow: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Directory containing workflow TOML definitions
        #[arg(long)]
        workflows: Option<PathBuf>,
    },
    /// Archived run operations
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
    /// Put a JSON message on a queue
    Send {
        queue: String,
        json: String,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List archived runs, newest first
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Filter by workflow
        #[arg(long)]
        workflow: Option<String>,
        /// Only failures an operator should look at
        #[arg(long)]
        alertable: bool,
        /// Maximum runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a run
    Show {
        /// Run ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "batchflow".to_string(),
        log_level: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Serve { workflows } => {
            let dir = workflows.unwrap_or_else(|| config.workflows_dir.clone());
            cmd_serve(&config, dir).await
        }
        Command::Run {
            workflow,
            payload,
            workflows,
        } => {
            let dir = workflows.unwrap_or_else(|| config.workflows_dir.clone());
            cmd_run(&config, dir, workflow, payload).await
        }
        Command::Runs { action } => {
            let db = connect(&config).await?;
            match action {
                RunsAction::List {
                    state,
                    workflow,
                    alertable,
                    limit,
                } => cmd_runs_list(&db, state, workflow, alertable, limit).await,
                RunsAction::Show { id } => cmd_runs_show(&db, id).await,
            }
        }
        Command::Send { queue, json } => {
            let db = connect(&config).await?;
            let payload: serde_json::Value = serde_json::from_str(&json)?;
            db.create_queue(&queue).await?;
            let msg_id = db.send_to_queue(&queue, &payload, 0).await?;
            println!("Sent: {msg_id} → {queue}");
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let Some(url) = &config.database_url else {
        anyhow::bail!("DATABASE_URL is not set; run history and queues need Postgres");
    };
    let db = Db::connect(url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn backend(config: &Config) -> anyhow::Result<Backend> {
    Ok(match config.database_url {
        Some(_) => Backend::postgres(Arc::new(connect(config).await?)),
        None => {
            info!("DATABASE_URL not set, using in-memory store and queues");
            Backend::in_memory()
        }
    })
}

async fn cmd_serve(config: &Config, dir: PathBuf) -> anyhow::Result<()> {
    let registry = DefinitionRegistry::load_from_dir(&dir)?;
    if registry.is_empty() {
        anyhow::bail!("no workflow definitions in {}", dir.display());
    }
    let backend = backend(config).await?;
    let shutdown = Shutdown::new();

    let mut workflows = Vec::new();
    let mut tasks = Vec::new();
    for definition in registry.iter() {
        let workflow = definition.build(&backend, config.max_in_flight).await?;
        for trigger in definition.triggers(&workflow, &backend).await? {
            let shutdown = shutdown.clone();
            let name = workflow.name().to_string();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = trigger.run(shutdown).await {
                    error!(
                        workflow = %name,
                        trigger = trigger.kind(),
                        error = %e,
                        "trigger stopped"
                    );
                }
            }));
        }
        workflows.push(workflow);
    }
    info!(
        workflows = workflows.len(),
        triggers = tasks.len(),
        "batchflow serving"
    );

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    shutdown.trigger();
    for workflow in &workflows {
        workflow.close();
    }
    for task in tasks {
        task.await.ok();
    }

    // Let handed-off runs reach a terminal state.
    while workflows.iter().any(|w| w.in_flight() > 0) {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    Ok(())
}

async fn cmd_run(
    config: &Config,
    dir: PathBuf,
    name: String,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let registry = DefinitionRegistry::load_from_dir(&dir)?;
    let definition = registry
        .get(&name)
        .ok_or_else(|| anyhow::anyhow!("no workflow named '{name}' in {}", dir.display()))?;

    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let backend = backend(config).await?;
    let workflow = definition.build(&backend, 0).await?;
    let run = workflow.run(WorkUnit::new(payload)).await;
    print_run(&run)?;

    if run.state != State::Succeeded {
        anyhow::bail!("run {} ended in state {}", run.id, run.state);
    }
    Ok(())
}

async fn cmd_runs_list(
    db: &Db,
    state: Option<String>,
    workflow: Option<String>,
    alertable: bool,
    limit: usize,
) -> anyhow::Result<()> {
    use batchflow::archive::RunArchive as _;

    let state: Option<State> = match state {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid state: {s}"))?,
        ),
        None => None,
    };

    let runs = db
        .list(&RunFilter {
            state,
            workflow,
            alertable_only: alertable,
            limit,
        })
        .await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<10}  {:<20}  {:<4}  STARTED",
        "ID", "WORKFLOW", "STATE", "FAILURE", "TRY"
    );
    println!("{}", "-".repeat(90));

    for run in &runs {
        let short_id = &run.id.to_string()[..8];
        let failure = run.failure_kind().map(|k| k.as_str()).unwrap_or("-");
        println!(
            "{:<8}  {:<20}  {:<10}  {:<20}  {:<4}  {}",
            short_id,
            run.workflow,
            run.state,
            failure,
            run.attempts.len(),
            run.started_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} run(s)", runs.len());
    Ok(())
}

async fn cmd_runs_show(db: &Db, id_str: String) -> anyhow::Result<()> {
    use batchflow::archive::RunArchive as _;

    let id = if id_str.len() < 36 {
        let runs = db
            .list(&RunFilter {
                limit: 100,
                ..Default::default()
            })
            .await?;
        let matches: Vec<_> = runs
            .iter()
            .filter(|run| run.id.to_string().starts_with(&id_str))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no run matching prefix '{id_str}'"),
            1 => matches[0].id,
            n => anyhow::bail!("{n} runs match prefix '{id_str}', be more specific"),
        }
    } else {
        RunId(uuid::Uuid::parse_str(&id_str)?)
    };

    let run = db.get(id).await?;
    print_run(&run)
}

fn print_run(run: &WorkflowRun) -> anyhow::Result<()> {
    println!("ID:         {}", run.id);
    println!("Workflow:   {}", run.workflow);
    println!("State:      {}", run.state);
    println!("Key:        {}", run.key.as_deref().unwrap_or("-"));
    println!(
        "Payload:    {}",
        serde_json::to_string_pretty(run.work_unit.payload())?
    );
    println!("Started:    {}", run.started_at);
    if let Some(finished) = run.finished_at {
        println!("Finished:   {finished}");
    }
    for attempt in &run.attempts {
        println!(
            "Attempt {}:  {}ms {}",
            attempt.number,
            attempt.duration_ms,
            attempt.error.as_deref().unwrap_or("ok")
        );
    }
    if let Some(ref output) = run.output {
        println!("Output:     {}", serde_json::to_string_pretty(output)?);
    }
    if let Some(ref err) = run.error {
        println!("---");
        println!("Failure:    {}", err.kind.as_str());
        println!("Error:      {}", err.message);
    }
    println!("---");
    for t in &run.transitions {
        println!(
            "{}  {} → {} ({:?})",
            t.at.format("%H:%M:%S%.3f"),
            t.from,
            t.to,
            t.signal
        );
    }
    Ok(())
}
