//! Task workflow: plan, generate, execute and heal, finalize.
//!
//! One [`WorkflowEngine`] drives one task from `Init` to a terminal state. Every
//! phase runs sequentially on the calling thread; the only suspension points are
//! agent calls and harness runs, both of which observe the task's
//! [`CancellationToken`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::core::cancel::{CancellationToken, Cancelled, is_cancellation};
use crate::core::dependency::{DEFAULT_PROMPT_LIMIT, DependencyAnalysisResult, DependencyAnalyzer};
use crate::core::design::TestDesign;
use crate::core::errors::AgentCallFailed;
use crate::core::events::{ProgressSink, TodoSnapshot};
use crate::core::judge::{LogicVerdict, judge, parse_logic_verdict};
use crate::core::report::{
    AgentCallRecord, BugReport, BugReportFile, BugSeverity, FinalReport, ReportInputs,
    build_final_report,
};
use crate::core::retry::RetryPolicy;
use crate::core::types::{HealingKind, TestCaseResult, TestMode, WorkflowState};
use crate::io::agent::{AgentAdapter, AgentRequest, AgentSessionResult, invoke_with_retry};
use crate::io::artifacts::{
    TaskPaths, load_test_design, write_dependency_snapshot, write_json,
};
use crate::io::config::MantisConfig;
use crate::io::explorer::{HttpExplorer, save_exploration};
use crate::io::harness::{HarnessRequest, HarnessRunner};
use crate::io::inputs::{LoadedSchema, load_api_schema, read_text_input};
use crate::io::prompt::{
    GenerateInputs, PlanInputs, PromptBuilder, PromptPackage, RepairInputs, excerpt,
};
use crate::io::skeleton::{EnvConfig, write_skeleton};

const DESIGN_FILE: &str = "test_design.json";
const TESTS_DIR: &str = "tests";

/// Everything a task needs besides configuration.
#[derive(Debug, Clone)]
pub struct TaskInputs {
    pub task_id: String,
    /// Task output directory; created if missing and owned by this task.
    pub output_dir: PathBuf,
    pub schema_path: PathBuf,
    pub requirements_path: Option<PathBuf>,
    pub test_data_path: Option<PathBuf>,
    pub env: EnvConfig,
}

/// Receives workflow state changes and agent progress.
pub trait WorkflowObserver: Send + Sync {
    fn state_changed(&self, _task_id: &str, _state: WorkflowState, _reason: Option<&str>) {}

    fn progress(&self, _task_id: &str, _message: &str) {}

    fn todos(&self, _task_id: &str, _snapshot: &TodoSnapshot) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl WorkflowObserver for NullObserver {}

/// How a task ended.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub state: WorkflowState,
    /// Failure or cancellation reason; `None` when completed.
    pub reason: Option<String>,
    pub report: Option<FinalReport>,
}

/// Result of one repair call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealOutcome {
    Repaired,
    BugConfirmed,
}

/// Per-task state derived from the inputs once, before planning.
struct TaskContext<'a> {
    inputs: &'a TaskInputs,
    paths: TaskPaths,
    schema: LoadedSchema,
    requirements: Option<String>,
    test_data: Option<String>,
    mode: TestMode,
}

struct ObserverSink<'a> {
    observer: &'a dyn WorkflowObserver,
    task_id: &'a str,
}

impl ProgressSink for ObserverSink<'_> {
    fn progress(&self, message: &str) {
        debug!(task_id = %self.task_id, "{message}");
        self.observer.progress(self.task_id, message);
    }

    fn todos(&self, snapshot: &TodoSnapshot) {
        self.observer.todos(self.task_id, snapshot);
    }
}

/// Drives one task through the phased pipeline.
pub struct WorkflowEngine<A, H> {
    agent: A,
    harness: H,
    config: MantisConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
    observer: Arc<dyn WorkflowObserver>,
    prompts: PromptBuilder,
    state: WorkflowState,
    task_id: String,
    session_id: Option<String>,
    design: Option<TestDesign>,
    /// Fields with live values in `explored_data.json`.
    explored_fields: Vec<String>,
    results: Vec<TestCaseResult>,
    bugs: Vec<BugReport>,
    /// Tests whose failure was confirmed as an API defect; never healed again.
    confirmed_bugs: HashSet<(String, String)>,
    calls: Vec<AgentCallRecord>,
    started_at: DateTime<Utc>,
}

impl<A: AgentAdapter, H: HarnessRunner> WorkflowEngine<A, H> {
    pub fn new(agent: A, harness: H, config: MantisConfig, cancel: CancellationToken) -> Self {
        let prompts = PromptBuilder::new(config.workflow.prompt_budget_bytes, &config.agent);
        Self {
            agent,
            harness,
            retry: config.agent.retry_policy(),
            prompts,
            config,
            cancel,
            observer: Arc::new(NullObserver),
            state: WorkflowState::Init,
            task_id: String::new(),
            session_id: None,
            design: None,
            explored_fields: Vec::new(),
            results: Vec::new(),
            bugs: Vec::new(),
            confirmed_bugs: HashSet::new(),
            calls: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Run the task to a terminal state. Never returns an error: failures and
    /// cancellation are reported through [`TaskOutcome`].
    #[instrument(skip_all, fields(task_id = %inputs.task_id))]
    pub fn run(mut self, inputs: &TaskInputs) -> TaskOutcome {
        self.task_id.clone_from(&inputs.task_id);
        self.started_at = Utc::now();
        info!(output_dir = %inputs.output_dir.display(), "task started");

        match self.execute(inputs) {
            Ok(report) => {
                self.finish(WorkflowState::Completed, None);
                info!(
                    passed = report.summary.passed,
                    total = report.summary.total,
                    "task completed"
                );
                TaskOutcome {
                    task_id: self.task_id,
                    state: WorkflowState::Completed,
                    reason: None,
                    report: Some(report),
                }
            }
            Err(err) if is_cancellation(&err) || self.cancel.is_cancelled() => {
                info!(state = %self.state, "task cancelled");
                let reason = format!("cancelled during {}", self.state);
                self.finish(WorkflowState::Cancelled, Some(&reason));
                TaskOutcome {
                    task_id: self.task_id,
                    state: WorkflowState::Cancelled,
                    reason: Some(reason),
                    report: None,
                }
            }
            Err(err) => {
                let reason = format!("{err:#}");
                error!(state = %self.state, err = %reason, "task failed");
                self.finish(WorkflowState::Failed, Some(&reason));
                TaskOutcome {
                    task_id: self.task_id,
                    state: WorkflowState::Failed,
                    reason: Some(reason),
                    report: None,
                }
            }
        }
    }

    fn execute(&mut self, inputs: &TaskInputs) -> Result<FinalReport> {
        let paths = TaskPaths::new(&inputs.output_dir);
        paths.ensure_dirs()?;
        let schema = load_api_schema(&inputs.schema_path)?;
        if schema.schema.is_empty() {
            bail!(
                "schema {} defines no operations",
                inputs.schema_path.display()
            );
        }
        let requirements = read_text_input(inputs.requirements_path.as_deref())?;
        let test_data = read_text_input(inputs.test_data_path.as_deref())?;
        let ctx = TaskContext {
            inputs,
            paths,
            mode: TestMode::from_inputs(requirements.is_some(), test_data.is_some()),
            schema,
            requirements,
            test_data,
        };
        info!(mode = ?ctx.mode, operations = ctx.schema.schema.operations.len(), "inputs loaded");

        self.enter(WorkflowState::Planning)?;
        let analysis = self.plan(&ctx)?;

        self.enter(WorkflowState::Generating)?;
        self.generate(&ctx, &analysis)?;

        self.execute_and_heal(&ctx)?;

        self.enter(WorkflowState::Finalizing)?;
        self.finalize(&ctx)
    }

    /// Check cancellation, then move to `next`.
    fn enter(&mut self, next: WorkflowState) -> Result<()> {
        self.cancel.check()?;
        if !self.state.can_transition_to(next) {
            return Err(anyhow!("invalid transition {} -> {}", self.state, next));
        }
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        self.observer.state_changed(&self.task_id, next, None);
        Ok(())
    }

    fn finish(&mut self, terminal: WorkflowState, reason: Option<&str>) {
        if !self.state.can_transition_to(terminal) {
            warn!(from = %self.state, to = %terminal, "unexpected terminal transition");
        }
        self.state = terminal;
        self.observer.state_changed(&self.task_id, terminal, reason);
    }

    #[instrument(skip_all)]
    fn plan(&mut self, ctx: &TaskContext<'_>) -> Result<DependencyAnalysisResult> {
        let analysis =
            DependencyAnalyzer::new(self.config.workflow.max_dependencies).analyze(&ctx.schema.schema);
        write_dependency_snapshot(&ctx.paths.dependency_path, &analysis)?;
        info!(
            resources = analysis.resources.len(),
            dependencies = analysis.dependencies.len(),
            truncated = analysis.truncated,
            "dependency analysis written"
        );

        for stale in [
            &ctx.paths.design_path,
            &ctx.paths.exploration_log_path,
            &ctx.paths.explored_data_path,
        ] {
            if stale.exists() {
                fs::remove_file(stale)
                    .with_context(|| format!("remove stale {}", stale.display()))?;
            }
        }
        let exploration_block = if self.config.exploration.enabled {
            Some(self.explore(ctx, &analysis)?)
        } else {
            None
        };
        let dependency_block = analysis.to_prompt_block(DEFAULT_PROMPT_LIMIT);
        let package = self.prompts.build_plan(&PlanInputs {
            api_title: &ctx.schema.schema.title,
            mode: ctx.mode,
            schema_text: &ctx.schema.text,
            requirements: ctx.requirements.as_deref(),
            test_data: ctx.test_data.as_deref(),
            dependency_block: &dependency_block,
            exploration_block: exploration_block.as_deref(),
            design_file: DESIGN_FILE,
        })?;
        self.call_agent("planning", package, None, &ctx.paths)?;

        let design = load_test_design(&ctx.paths.design_path)
            .context("planning produced no usable test design")?;
        info!(cases = design.cases.len(), "test design loaded");
        self.design = Some(design);
        Ok(analysis)
    }

    /// Query the live service and persist what it returned. Returns the prompt block.
    fn explore(
        &mut self,
        ctx: &TaskContext<'_>,
        analysis: &DependencyAnalysisResult,
    ) -> Result<String> {
        self.observer
            .progress(&self.task_id, "exploring read-only endpoints of the live service");
        let result = HttpExplorer::new(&self.config.exploration)?.explore(
            analysis,
            &ctx.inputs.env,
            &self.cancel,
        )?;
        save_exploration(&ctx.paths, &result)?;
        self.explored_fields = result.extracted_values.keys().cloned().collect();
        Ok(result.to_prompt_block(DEFAULT_PROMPT_LIMIT))
    }

    #[instrument(skip_all)]
    fn generate(&mut self, ctx: &TaskContext<'_>, analysis: &DependencyAnalysisResult) -> Result<()> {
        let written = write_skeleton(&ctx.paths.tests_dir, &ctx.inputs.env)?;
        debug!(files = written.len(), "skeleton ready");

        let design = self
            .design
            .clone()
            .ok_or_else(|| anyhow!("generating without a test design"))?;
        let call_order: Vec<String> = analysis.sorted_endpoints.iter().map(|e| e.label()).collect();
        let package = self.prompts.build_generate(&GenerateInputs {
            design: &design,
            design_file: DESIGN_FILE,
            base_url: &ctx.inputs.env.base_url,
            mode: ctx.mode,
            tests_dir: TESTS_DIR,
            call_order: &call_order,
            explored_fields: &self.explored_fields,
        })?;
        let resume = self.session_id.clone();
        self.call_agent("generating", package, resume, &ctx.paths)?;
        Ok(())
    }

    /// Alternate harness runs and repair batches until nothing is left to heal.
    fn execute_and_heal(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        let max_attempts = self.config.workflow.max_healing_attempts;
        let request = HarnessRequest::for_task(
            &ctx.paths,
            Duration::from_secs(self.config.harness.per_test_timeout_secs),
        );
        let mut round = 0u32;
        loop {
            round += 1;
            self.enter(WorkflowState::Executing)?;
            let run = self.harness.run(&request, &self.cancel)?;
            self.merge_results(run.results);
            info!(
                round,
                total = self.results.len(),
                passed = self.results.iter().filter(|r| r.passed()).count(),
                "harness round finished"
            );

            let mut candidates = Vec::new();
            for (index, result) in self.results.iter().enumerate() {
                if result.passed() || self.confirmed_bugs.contains(&result.key()) {
                    continue;
                }
                let verdict = judge(result, ctx.mode, max_attempts);
                debug!(
                    function = %result.function_name,
                    need_healing = verdict.need_healing,
                    is_bug = verdict.is_bug,
                    detail = %verdict.detail,
                    "judged result"
                );
                if let Some(kind) = verdict.healing_kind.filter(|_| verdict.need_healing) {
                    candidates.push((index, kind));
                } else if verdict.is_bug {
                    let bug = BugReport::from_result(result, BugSeverity::Medium, verdict.detail);
                    if !self.bugs.iter().any(|b| b.key() == bug.key()) {
                        self.bugs.push(bug);
                    }
                }
            }
            if candidates.is_empty() {
                return Ok(());
            }

            self.enter(WorkflowState::Healing)?;
            let mut repaired = 0usize;
            for (index, kind) in candidates {
                self.cancel.check()?;
                if self.heal_one(ctx, index, kind)? == HealOutcome::Repaired {
                    repaired += 1;
                }
            }
            info!(round, repaired, "healing batch finished");
            if repaired == 0 {
                return Ok(());
            }
        }
    }

    /// Replace results with a fresh run, carrying healing counters over by test identity.
    fn merge_results(&mut self, fresh: Vec<TestCaseResult>) {
        let previous = std::mem::take(&mut self.results);
        self.results = fresh
            .into_iter()
            .map(|mut result| {
                if let Some(prior) = previous.iter().find(|p| p.key() == result.key()) {
                    result.healing_attempts = prior.healing_attempts;
                    result.healed = prior.healed;
                }
                result
            })
            .collect();
    }

    #[instrument(skip_all, fields(kind = kind.as_str()))]
    fn heal_one(
        &mut self,
        ctx: &TaskContext<'_>,
        index: usize,
        kind: HealingKind,
    ) -> Result<HealOutcome> {
        let result = self.results[index].clone();
        let requirements = ctx
            .requirements
            .as_deref()
            .map(|r| excerpt(r, self.config.workflow.requirements_excerpt_chars));
        let package = self.prompts.build_repair(
            kind,
            &RepairInputs {
                result: &result,
                requirements: requirements.as_deref(),
            },
        )?;
        let resume = self.session_id.clone();
        let session = self.call_agent("healing", package, resume, &ctx.paths)?;

        self.results[index].healing_attempts += 1;
        if kind == HealingKind::Logic && parse_logic_verdict(&session.text_output) == LogicVerdict::Bug {
            info!(function = %result.function_name, "agent confirmed an API defect");
            let detail = session
                .structured_payload
                .as_ref()
                .and_then(|p| p.get("reason"))
                .and_then(|r| r.as_str())
                .map_or_else(|| excerpt(&session.text_output, 500), str::to_string);
            self.bugs.retain(|b| b.key() != result.key());
            self.bugs
                .push(BugReport::from_result(&result, BugSeverity::High, detail));
            self.confirmed_bugs.insert(result.key());
            return Ok(HealOutcome::BugConfirmed);
        }
        self.results[index].healed = true;
        Ok(HealOutcome::Repaired)
    }

    /// One agent call with retries, recorded for the report.
    ///
    /// Cancellation becomes [`Cancelled`] and any other failure [`AgentCallFailed`].
    fn call_agent(
        &mut self,
        phase: &str,
        package: PromptPackage,
        resume_id: Option<String>,
        paths: &TaskPaths,
    ) -> Result<AgentSessionResult> {
        let sequence = self.calls.len() as u32 + 1;
        let request = AgentRequest {
            workdir: paths.root.clone(),
            prompt: package.prompt,
            resume_id,
            allowed_tools: package.allowed_tools,
            phase: phase.to_string(),
            log: Some(paths.call_paths(sequence, phase)),
        };
        let sink = ObserverSink {
            observer: self.observer.as_ref(),
            task_id: &self.task_id,
        };
        let poll = self.config.agent.poll_interval();
        let cancel = self.cancel.clone();
        let started = Instant::now();
        let result = invoke_with_retry(
            &self.agent,
            &request,
            &self.cancel,
            &sink,
            &self.retry,
            |delay| sleep_unless_cancelled(&cancel, delay, poll),
        );

        self.calls.push(AgentCallRecord {
            sequence,
            phase: phase.to_string(),
            success: result.success,
            cancelled: result.is_cancelled(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            cost_usd: result.cost_usd,
            error: result.error_text.clone(),
        });

        if result.is_cancelled() || self.cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        if !result.success {
            return Err(AgentCallFailed {
                phase: phase.to_string(),
                error: result.error_message(),
            }
            .into());
        }
        if let Some(id) = &result.continuation_id {
            self.session_id = Some(id.clone());
        }
        Ok(result)
    }

    #[instrument(skip_all)]
    fn finalize(&mut self, ctx: &TaskContext<'_>) -> Result<FinalReport> {
        let paths = &ctx.paths;
        if !self.bugs.is_empty() {
            write_json(&paths.bug_report_path, &BugReportFile::new(&self.bugs))?;
        }
        let report = build_final_report(ReportInputs {
            task_id: &self.task_id,
            mode: ctx.mode,
            started_at: self.started_at,
            finished_at: Utc::now(),
            results: &self.results,
            bugs: &self.bugs,
            design: self.design.as_ref(),
            agent_calls: &self.calls,
            output_files: list_output_files(paths)?,
        });
        write_json(&paths.final_report_path, &report)?;
        info!(
            path = %paths.final_report_path.display(),
            bugs = report.bugs.len(),
            "final report written"
        );
        Ok(report)
    }
}

/// Artifacts present in the task directory, relative to its root.
fn list_output_files(paths: &TaskPaths) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for path in [
        &paths.design_path,
        &paths.dependency_path,
        &paths.exploration_log_path,
        &paths.explored_data_path,
        &paths.junit_path,
        &paths.html_report_path,
        &paths.harness_log_path,
        &paths.bug_report_path,
    ] {
        if path.exists() {
            files.push(paths.relative(path));
        }
    }
    files.extend(test_sources(paths, &paths.tests_dir)?);
    files.push(paths.relative(&paths.final_report_path));
    Ok(files)
}

fn test_sources(paths: &TaskPaths, dir: &Path) -> Result<Vec<String>> {
    let mut sources = Vec::new();
    if !dir.exists() {
        return Ok(sources);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read directory {}", dir.display()))?
            .path();
        if path.extension().is_some_and(|e| e == "py") {
            sources.push(paths.relative(&path));
        }
    }
    sources.sort();
    Ok(sources)
}

/// Sleep in poll-sized slices, returning early once cancelled.
fn sleep_unless_cancelled(cancel: &CancellationToken, total: Duration, poll: Duration) {
    let deadline = Instant::now() + total;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(poll.min(deadline - now));
    }
}
