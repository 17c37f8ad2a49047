//! Command-line interface: enqueue, inspect, admin, ingest, dispatch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use quarry_config::Config;
use quarry_connector::{Connector, HttpConnector, TestConnector};
use quarry_dispatch::handlers::entity_facts::EntityFactsHandler;
use quarry_dispatch::handlers::page_classification::PageClassificationHandler;
use quarry_dispatch::handlers::LlmDerivation;
use quarry_dispatch::{DispatcherConfig, JobDispatcher, JobTypeRegistry};
use quarry_ingest::{seed_work_items, IngestRunner, LinkDiscovery, RunnerOptions};
use quarry_lake::FileLakeWriter;
use quarry_llm::OllamaClient;
use quarry_state::{NewJob, StateStore};

#[derive(Parser)]
#[command(name = "quarry", version, about = "Durable work-orchestration runtime")]
pub struct Cli {
    /// Path to a YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue an LLM derivation job
    Enqueue(EnqueueArgs),
    /// Inspect jobs, runs, and queue statistics
    Inspect(InspectArgs),
    /// Administrative queue operations
    Admin(AdminArgs),
    /// Run the ingest pipeline over pending work items
    Ingest(IngestArgs),
    /// Run the LLM job dispatcher
    Dispatch(DispatchArgs),
}

#[derive(Args)]
struct EnqueueArgs {
    /// Type of entity (e.g. character, planet)
    #[arg(long)]
    entity_type: String,

    /// Entity identifier (e.g. luke_skywalker)
    #[arg(long)]
    entity_id: String,

    /// Inline evidence text (repeatable)
    #[arg(long)]
    evidence: Vec<String>,

    /// Path to a file containing evidence (repeatable)
    #[arg(long)]
    evidence_file: Vec<PathBuf>,

    /// Interrogation key
    #[arg(long, default_value = "entity_facts_v1")]
    interrogation: String,

    /// Job priority (higher is processed sooner)
    #[arg(long, default_value_t = 100)]
    priority: i64,

    /// Model hint (e.g. llama3.2)
    #[arg(long)]
    model: Option<String>,

    /// Maximum retry attempts
    #[arg(long, default_value_t = 3)]
    max_attempts: i64,
}

#[derive(Args)]
struct InspectArgs {
    /// List recent jobs
    #[arg(long, conflicts_with_all = ["job_id", "stats"])]
    list: bool,

    /// Show details for one job
    #[arg(long)]
    job_id: Option<String>,

    /// Show queue statistics
    #[arg(long, conflicts_with = "job_id")]
    stats: bool,

    /// Number of jobs to list
    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[derive(Args)]
struct AdminArgs {
    #[command(subcommand)]
    action: AdminAction,
}

#[derive(Subcommand)]
enum AdminAction {
    /// Mark every non-terminal work item of a source as failed
    MarkSourceFailed {
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "manually failed by operator")]
        reason: String,
    },
    /// Reset completed work items of a source to pending for a re-run
    ResetCompleted {
        #[arg(long)]
        source: String,
    },
}

#[derive(Args)]
struct IngestArgs {
    /// Items claimed per batch (overrides config)
    #[arg(long)]
    batch_size: Option<i64>,

    /// Stop after this many items
    #[arg(long)]
    max_items: Option<u64>,

    /// Worker identifier
    #[arg(long, default_value = "ingest-cli")]
    worker_id: String,
}

#[derive(Args)]
struct DispatchArgs {
    /// Process jobs without external side effects
    #[arg(long)]
    dry_run: bool,

    /// Process at most one job, then exit
    #[arg(long)]
    once: bool,

    /// Worker identifier
    #[arg(long, default_value = "dispatch-cli")]
    worker_id: String,
}

/// Entry point used by the binary.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let _ = quarry_utils::logging::init_tracing(cli.verbose, cli.log_json);

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let config_errors = config.validate();
    if !config_errors.is_empty() {
        bail!("invalid configuration:\n  {}", config_errors.join("\n  "));
    }

    match cli.command {
        Command::Enqueue(args) => enqueue(&config, args).await,
        Command::Inspect(args) => inspect(&config, args).await,
        Command::Admin(args) => admin(&config, args).await,
        Command::Ingest(args) => ingest(&config, args).await,
        Command::Dispatch(args) => dispatch(&config, args).await,
    }
}

async fn connect_store(config: &Config) -> Result<StateStore> {
    StateStore::connect(&config.state.database_path)
        .await
        .with_context(|| {
            format!(
                "failed to open state database at {} (is the path writable?)",
                config.state.database_path
            )
        })
}

async fn enqueue(config: &Config, args: EnqueueArgs) -> Result<()> {
    let mut evidence_items = Vec::new();
    let mut index = 1;

    for text in &args.evidence {
        evidence_items.push(json!({
            "evidence_id": format!("e{index}"),
            "source_uri": "cli_input",
            "text": text,
        }));
        index += 1;
    }
    for path in &args.evidence_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("evidence file not found: {}", path.display()))?;
        evidence_items.push(json!({
            "evidence_id": format!("e{index}"),
            "source_uri": path.canonicalize().unwrap_or_else(|_| path.clone()).display().to_string(),
            "text": text,
        }));
        index += 1;
    }

    if evidence_items.is_empty() {
        bail!("no evidence provided; use --evidence or --evidence-file");
    }
    let evidence_count = evidence_items.len();

    let input = json!({
        "entity_type": args.entity_type,
        "entity_id": args.entity_id,
        "source_refs": [],
        "extra_params": {"evidence": evidence_items},
    });

    let store = connect_store(config).await?;
    let job_id = store
        .enqueue_job(&NewJob {
            interrogation_key: args.interrogation.clone(),
            input_json: input.to_string(),
            priority: args.priority,
            max_attempts: args.max_attempts,
            model_hint: args.model.clone(),
            dedupe_key: None,
        })
        .await?;

    println!("Job enqueued");
    println!("  Job ID:         {job_id}");
    println!("  Interrogation:  {}", args.interrogation);
    println!("  Entity:         {}/{}", args.entity_type, args.entity_id);
    println!("  Evidence items: {evidence_count}");
    println!("  Priority:       {}", args.priority);
    if let Some(model) = &args.model {
        println!("  Model hint:     {model}");
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

async fn inspect(config: &Config, args: InspectArgs) -> Result<()> {
    let store = connect_store(config).await?;

    if args.stats {
        let stats = store.job_stats().await?;
        let total: i64 = stats.values().sum();
        println!("QUEUE STATISTICS");
        println!("{}", "-".repeat(40));
        for (status, count) in &stats {
            let pct = if total > 0 {
                *count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            println!("  {status:<12} {count:>6} ({pct:5.1}%)");
        }
        println!("{}", "-".repeat(40));
        println!("  {:<12} {total:>6}", "TOTAL");
        return Ok(());
    }

    if let Some(job_id) = &args.job_id {
        let Some(job) = store.get_job(job_id).await? else {
            bail!("job not found: {job_id}");
        };

        println!("JOB DETAILS");
        println!("{}", "=".repeat(60));
        println!("Job ID:        {}", job.job_id);
        println!("Status:        {}", job.status);
        println!("Interrogation: {}", job.interrogation_key);
        println!("Priority:      {}", job.priority);
        println!("Attempts:      {}/{}", job.attempt_count, job.max_attempts);
        println!("Created:       {}", job.created_utc);
        println!("Available:     {}", job.available_utc);
        println!("Locked by:     {}", job.locked_by.as_deref().unwrap_or("None"));
        println!("Model hint:    {}", job.model_hint.as_deref().unwrap_or("None"));
        if let Some(error) = &job.last_error {
            println!("\nLast error:\n{error}");
        }

        let runs = store.runs_for_job(job_id).await?;
        if !runs.is_empty() {
            println!("\nRUNS");
            println!("{}", "=".repeat(60));
            for run in &runs {
                println!("\nRun ID:    {}", run.run_id);
                println!("Status:    {}", run.status);
                println!("Model:     {}", run.model_name.as_deref().unwrap_or("None"));
                println!("Started:   {}", run.started_utc);
                match &run.completed_utc {
                    Some(at) => println!("Completed: {at}"),
                    None => println!("Completed: in progress"),
                }
                if let Some(metrics) = &run.metrics_json {
                    println!("Metrics:   {metrics}");
                }
                if let Some(error) = &run.error {
                    println!("Error:     {}", truncate(error, 200));
                }

                let artifacts = store.artifacts_for_run(&run.run_id).await?;
                if !artifacts.is_empty() {
                    println!("Artifacts:");
                    for artifact in &artifacts {
                        println!(
                            "  - {}: {} ({} bytes)",
                            artifact.artifact_type,
                            artifact.lake_uri.as_deref().unwrap_or("<sql only>"),
                            artifact.byte_count
                        );
                    }
                }
            }
        }
        return Ok(());
    }

    // --list (also the default)
    let jobs = store.list_jobs(args.limit).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<26} {:>4} {:>5}  {}",
        "Job ID", "Status", "Key", "Pri", "Att", "Error"
    );
    println!("{}", "-".repeat(120));
    for job in &jobs {
        let error = job.last_error.as_deref().map(|e| truncate(e, 40)).unwrap_or_default();
        println!(
            "{:<38} {:<10} {:<26} {:>4} {:>2}/{:<2}  {}",
            job.job_id,
            job.status.to_string(),
            truncate(&job.interrogation_key, 26),
            job.priority,
            job.attempt_count,
            job.max_attempts,
            error
        );
    }
    Ok(())
}

async fn admin(config: &Config, args: AdminArgs) -> Result<()> {
    let store = connect_store(config).await?;

    match args.action {
        AdminAction::MarkSourceFailed { source, reason } => {
            let affected = store.mark_source_failed(&source, &reason).await?;
            println!("Marked {affected} work item(s) of '{source}' as failed");
        }
        AdminAction::ResetCompleted { source } => {
            let affected = store.reset_completed_to_pending(&source).await?;
            println!("Reset {affected} completed work item(s) of '{source}' to pending");
        }
    }
    Ok(())
}

fn build_connectors(config: &Config) -> Result<HashMap<String, Arc<dyn Connector>>> {
    let mut connectors: HashMap<String, Arc<dyn Connector>> = HashMap::new();

    for source in config.sources.iter().filter(|s| s.enabled) {
        if connectors.contains_key(&source.system) {
            continue;
        }
        let connector: Arc<dyn Connector> = if source.system == "test" {
            Arc::new(TestConnector::new())
        } else {
            Arc::new(
                HttpConnector::new(
                    source.system.clone(),
                    source.requests_per_second,
                    Duration::from_secs(30),
                    source.contact_email.clone(),
                )
                .context("failed to build HTTP connector")?,
            )
        };
        connectors.insert(source.system.clone(), connector);
    }

    Ok(connectors)
}

async fn ingest(config: &Config, args: IngestArgs) -> Result<()> {
    let store = connect_store(config).await?;

    // Seed declared work items; duplicates drop silently at the index.
    let seeds = seed_work_items(&config.seeds);
    let mut seeded = 0;
    for item in &seeds {
        if store.enqueue(item).await?.accepted() {
            seeded += 1;
        }
    }
    if !seeds.is_empty() {
        info!(seeded, declared = seeds.len(), "seeded work items");
    }

    let connectors = build_connectors(config)?;
    if connectors.is_empty() {
        bail!("no enabled sources configured; nothing to ingest");
    }

    let lake_base = Utf8PathBuf::from(config.storage.data_lake.base_dir.clone());
    let options = RunnerOptions {
        batch_size: args.batch_size.unwrap_or(config.runner.batch_size as i64),
        max_items: args.max_items,
        enable_discovery: config.runner.enable_discovery,
        lease: Duration::from_secs(config.runner.lease_seconds),
        heartbeat_interval: Duration::from_secs(config.runner.heartbeat_interval),
        respect_retry_after: config.runner.respect_retry_after,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    // A bounded run (--max-items) stays single-worker so the bound is
    // exact; otherwise parallelism is horizontal across workers and the
    // claim contract keeps them from colliding.
    let worker_count = if args.max_items.is_some() {
        1
    } else {
        config.runner.max_workers.max(1)
    };

    let mut handles = Vec::new();
    for i in 0..worker_count {
        let discovery: Vec<Box<dyn quarry_ingest::DiscoveryPlugin>> =
            if config.runner.enable_discovery {
                vec![Box::new(LinkDiscovery::new(
                    "https://test.example.com/resources/{id}",
                ))]
            } else {
                Vec::new()
            };
        let runner = IngestRunner::new(
            store.clone(),
            connectors.clone(),
            vec![FileLakeWriter::new(lake_base.clone())],
            discovery,
            options.clone(),
            format!("{}-{i}", args.worker_id),
        );
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { runner.run(Some(shutdown)).await }));
    }

    let mut processed = 0u64;
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    let mut discovered = 0u64;
    for handle in handles {
        let metrics = handle.await.context("ingest worker panicked")??;
        processed += metrics.items_processed;
        succeeded += metrics.items_succeeded;
        failed += metrics.items_failed;
        discovered += metrics.items_discovered;
    }

    println!(
        "Processed {processed} item(s): {succeeded} succeeded, {failed} failed, {discovered} discovered"
    );
    Ok(())
}

async fn dispatch(config: &Config, args: DispatchArgs) -> Result<()> {
    let store = connect_store(config).await?;
    let lake = FileLakeWriter::new(Utf8PathBuf::from(config.storage.data_lake.base_dir.clone()));

    let llm = Arc::new(
        OllamaClient::new(config.llm.endpoint.clone()).context("failed to build LLM client")?,
    );

    let mut dispatcher_config = DispatcherConfig::new(args.worker_id.clone(), args.dry_run);
    dispatcher_config.poll_interval = Duration::from_secs(config.llm.poll_seconds);
    dispatcher_config.lease = Duration::from_secs(config.runner.lease_seconds);
    dispatcher_config.heartbeat_interval = Duration::from_secs(config.runner.heartbeat_interval);
    dispatcher_config.default_model = config.llm.model.clone();

    let registry = JobTypeRegistry::with_builtins();
    let mut dispatcher = JobDispatcher::new(dispatcher_config, store, lake, registry);

    let call_timeout = Duration::from_secs(config.llm.timeout_seconds);
    let mut classification = LlmDerivation::new(llm.clone(), config.llm.model.clone());
    classification.call_timeout = call_timeout;
    let mut facts = LlmDerivation::new(llm, config.llm.model.clone());
    facts.call_timeout = call_timeout;

    dispatcher.register_handler(
        "page_classification",
        Arc::new(PageClassificationHandler::new(classification)),
    );
    dispatcher.register_handler("entity_facts", Arc::new(EntityFactsHandler::new(facts)));

    if args.once {
        let processed = dispatcher.dispatch_once().await?;
        if processed {
            println!("Processed one job");
        } else {
            println!("Queue idle");
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await?;
    Ok(())
}
