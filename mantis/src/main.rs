//! API test-suite orchestration CLI.
//!
//! `mantis run` plans, generates, executes and heals a pytest suite for one API
//! schema and leaves every artifact under `<output>/<task id>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use mantis::core::dependency::{DEFAULT_PROMPT_LIMIT, DependencyAnalyzer};
use mantis::core::events::TodoSnapshot;
use mantis::core::types::WorkflowState;
use mantis::exit_codes;
use mantis::io::agent::ClaudeCliAdapter;
use mantis::io::config::{DEFAULT_CONFIG_FILE, MantisConfig, load_config, write_config};
use mantis::io::harness::PytestHarness;
use mantis::io::inputs::load_api_schema;
use mantis::io::skeleton::EnvConfig;
use mantis::logging;
use mantis::service::{InMemoryTaskStore, TaskRecord, TaskRequest, TaskService};
use mantis::workflow::WorkflowObserver;

#[derive(Parser)]
#[command(
    name = "mantis",
    version,
    about = "Generate, run and self-heal API test suites"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task end to end and print its summary.
    Run(RunArgs),
    /// Print the dependency analysis of a schema.
    Analyze {
        /// OpenAPI/Swagger document (JSON or YAML).
        #[arg(long)]
        schema: PathBuf,
        /// Cap on dependency links.
        #[arg(long, default_value_t = 200)]
        max_dependencies: usize,
        /// Links shown in the text summary.
        #[arg(long, default_value_t = DEFAULT_PROMPT_LIMIT)]
        limit: usize,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Write a default config file.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// OpenAPI/Swagger document (JSON or YAML).
    #[arg(long)]
    schema: PathBuf,
    /// Base URL of the API under test.
    #[arg(long)]
    base_url: String,
    /// Bearer token sent by the generated tests.
    #[arg(long)]
    token: Option<String>,
    /// Business requirements document.
    #[arg(long)]
    requirements: Option<PathBuf>,
    /// Test data document.
    #[arg(long)]
    test_data: Option<PathBuf>,
    /// Directory that receives one subdirectory per task.
    #[arg(long, default_value = "mantis-output")]
    output: PathBuf,
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Override `workflow.max_healing_attempts`.
    #[arg(long)]
    max_healing: Option<u32>,
    /// Override `harness.per_test_timeout_secs`.
    #[arg(long)]
    per_test_timeout: Option<u64>,
    /// Per-request timeout used by the generated tests, in seconds.
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,
    /// Read live ids from list endpoints before planning.
    #[arg(long)]
    explore: bool,
}

/// Prints state changes and agent progress to stderr.
struct ConsoleObserver;

impl WorkflowObserver for ConsoleObserver {
    fn state_changed(&self, task_id: &str, state: WorkflowState, reason: Option<&str>) {
        match reason {
            Some(reason) => eprintln!("[{task_id}] {state}: {reason}"),
            None => eprintln!("[{task_id}] {state}"),
        }
    }

    fn progress(&self, task_id: &str, message: &str) {
        eprintln!("[{task_id}]   {message}");
    }

    fn todos(&self, task_id: &str, snapshot: &TodoSnapshot) {
        if let Some(current) = snapshot.current() {
            eprintln!(
                "[{task_id}]   todo {}/{}: {}",
                snapshot.completed,
                snapshot.items.len(),
                current.content
            );
        }
    }
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Analyze {
            schema,
            max_dependencies,
            limit,
            json,
        } => cmd_analyze(&schema, max_dependencies, limit, json),
        Command::InitConfig { path, force } => cmd_init_config(&path, force),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let config = resolve_config(&args)?;
    check_inputs(&args)?;

    let agent = ClaudeCliAdapter::new(config.agent.clone());
    let harness = PytestHarness::new(config.harness.clone(), config.agent.poll_interval());
    let service = TaskService::new(agent, harness, config, Arc::new(InMemoryTaskStore::new()))
        .with_observer(Arc::new(ConsoleObserver));

    let id = service.submit(TaskRequest {
        output_root: args.output,
        schema_path: args.schema,
        requirements_path: args.requirements,
        test_data_path: args.test_data,
        env: EnvConfig {
            base_url: args.base_url,
            auth_token: args.token,
            request_timeout_secs: args.request_timeout,
        },
    })?;
    let record = service.wait(&id)?;
    print_summary(&record);
    Ok(exit_code_for(&record))
}

fn resolve_config(args: &RunArgs) -> Result<MantisConfig> {
    let mut config = load_config(&args.config)?;
    if let Some(max) = args.max_healing {
        config.workflow.max_healing_attempts = max;
    }
    if let Some(secs) = args.per_test_timeout {
        config.harness.per_test_timeout_secs = secs;
    }
    if args.explore {
        config.exploration.enabled = true;
    }
    config.validate().context("validate command-line overrides")?;
    Ok(config)
}

/// Reject unusable inputs before a task directory is created.
fn check_inputs(args: &RunArgs) -> Result<()> {
    let loaded = load_api_schema(&args.schema)?;
    if loaded.schema.is_empty() {
        bail!("schema {} defines no operations", args.schema.display());
    }
    for path in [&args.requirements, &args.test_data].into_iter().flatten() {
        if !path.is_file() {
            bail!("input file {} does not exist", path.display());
        }
    }
    if args.base_url.trim().is_empty() {
        bail!("--base-url must be non-empty");
    }
    Ok(())
}

fn print_summary(record: &TaskRecord) {
    println!("task {} {}", record.id, record.state);
    if let Some(reason) = &record.reason {
        println!("reason: {reason}");
    }
    if let Some(report) = &record.report {
        let s = &report.summary;
        println!(
            "tests: {} total, {} passed, {} failed, {} errors, {} skipped, {} timed out",
            s.total, s.passed, s.failed, s.errors, s.skipped, s.timeouts
        );
        println!("healed: {}  bugs: {}  pass rate: {:.1}%", s.healed, s.bugs, s.pass_rate * 100.0);
        if report.total_cost_usd > 0.0 {
            println!("agent cost: ${:.4}", report.total_cost_usd);
        }
    }
    println!("output: {}", record.output_dir.display());
}

fn exit_code_for(record: &TaskRecord) -> i32 {
    match record.state {
        WorkflowState::Completed => match &record.report {
            Some(report) if !report.summary.all_passed() => exit_codes::TESTS_FAILED,
            _ => exit_codes::OK,
        },
        WorkflowState::Cancelled => exit_codes::CANCELLED,
        _ => exit_codes::FAILED,
    }
}

fn cmd_analyze(schema: &Path, max_dependencies: usize, limit: usize, json: bool) -> Result<i32> {
    let loaded = load_api_schema(schema)?;
    let result = DependencyAnalyzer::new(max_dependencies).analyze(&loaded.schema);
    if json {
        let payload = serde_json::to_string_pretty(&result).context("serialize analysis")?;
        println!("{payload}");
    } else {
        print!("{}", result.to_prompt_block(limit));
    }
    Ok(exit_codes::OK)
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &MantisConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}
