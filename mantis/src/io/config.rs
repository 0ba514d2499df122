//! Mantis configuration stored in `mantis.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "mantis.toml";

/// Mantis configuration (TOML).
///
/// Every section is optional; missing fields take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MantisConfig {
    pub agent: AgentConfig,
    pub harness: HarnessConfig,
    pub workflow: WorkflowConfig,
    pub exploration: ExplorationConfig,
}

/// Code-generation agent CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable (looked up on `PATH`).
    pub program: String,
    /// Optional `--model` override.
    pub model: Option<String>,
    /// Wall-clock limit per agent call.
    pub timeout_secs: u64,
    /// Bounded wait between cancellation checks while reading the stream.
    pub poll_interval_ms: u64,
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    /// Bytes of stderr kept for diagnostics.
    pub output_limit_bytes: usize,
    pub plan_tools: Vec<String>,
    pub generate_tools: Vec<String>,
    pub heal_tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let tools = |names: &[&str]| -> Vec<String> { names.iter().map(|s| (*s).to_string()).collect() };
        Self {
            program: "claude".to_string(),
            model: None,
            timeout_secs: 30 * 60,
            poll_interval_ms: 200,
            max_attempts: 3,
            retry_backoff_secs: 2,
            output_limit_bytes: 1024 * 1024,
            plan_tools: tools(&["Read", "Write"]),
            generate_tools: tools(&["Read", "Write"]),
            heal_tools: tools(&["Read", "Edit"]),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, Duration::from_secs(self.retry_backoff_secs))
    }
}

/// Test harness (pytest) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Harness command prefix, e.g. `["pytest"]` or `["python", "-m", "pytest"]`.
    pub program: Vec<String>,
    pub per_test_timeout_secs: u64,
    /// Wall-clock limit for one harness run.
    pub run_timeout_secs: u64,
    /// Truncate harness stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            program: vec!["pytest".to_string()],
            per_test_timeout_secs: 120,
            run_timeout_secs: 30 * 60,
            output_limit_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_healing_attempts: u32,
    pub max_dependencies: usize,
    /// Rendered prompts above this size drop optional sections.
    pub prompt_budget_bytes: usize,
    /// Characters of business requirements quoted in logic-repair prompts.
    pub requirements_excerpt_chars: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_healing_attempts: 3,
            max_dependencies: crate::core::dependency::DEFAULT_MAX_DEPENDENCIES,
            prompt_budget_bytes: 200_000,
            requirements_excerpt_chars: 4_000,
        }
    }
}

/// Opt-in live probing of read-only endpoints before planning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExplorationConfig {
    pub enabled: bool,
    pub request_timeout_secs: u64,
    /// Resources explored at most; each contributes one parameterless `GET`.
    pub max_endpoints: usize,
    /// Skip TLS certificate checks (self-signed test environments).
    pub accept_invalid_certs: bool,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            request_timeout_secs: 5,
            max_endpoints: 10,
            accept_invalid_certs: false,
        }
    }
}

impl ExplorationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl MantisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be non-empty"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.poll_interval_ms == 0 {
            return Err(anyhow!("agent.poll_interval_ms must be > 0"));
        }
        if self.agent.max_attempts == 0 {
            return Err(anyhow!("agent.max_attempts must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.harness.program.is_empty() || self.harness.program[0].trim().is_empty() {
            return Err(anyhow!("harness.program must be a non-empty array"));
        }
        if self.harness.per_test_timeout_secs == 0 {
            return Err(anyhow!("harness.per_test_timeout_secs must be > 0"));
        }
        if self.harness.run_timeout_secs == 0 {
            return Err(anyhow!("harness.run_timeout_secs must be > 0"));
        }
        if self.harness.output_limit_bytes == 0 {
            return Err(anyhow!("harness.output_limit_bytes must be > 0"));
        }
        if self.workflow.prompt_budget_bytes == 0 {
            return Err(anyhow!("workflow.prompt_budget_bytes must be > 0"));
        }
        if self.exploration.request_timeout_secs == 0 {
            return Err(anyhow!("exploration.request_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MantisConfig::default()`.
pub fn load_config(path: &Path) -> Result<MantisConfig> {
    if !path.exists() {
        let cfg = MantisConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MantisConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MantisConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::artifacts::write_atomic(path, buf.as_bytes())
}
