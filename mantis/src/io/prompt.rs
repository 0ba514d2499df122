//! Prompt builder for agent calls.
//!
//! Templates carry `<!-- section:KEY required|droppable -->` markers. After
//! rendering, sections are split on those markers so an oversized prompt can
//! shed optional context before the agent sees it.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::design::TestDesign;
use crate::core::types::{ErrorInfo, HealingKind, TestCaseResult, TestMode};
use crate::io::config::AgentConfig;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const HEAL_SYNTAX_TEMPLATE: &str = include_str!("prompts/heal_syntax.md");
const HEAL_LOGIC_TEMPLATE: &str = include_str!("prompts/heal_logic.md");

const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid section regex")
});

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("plan", PLAN_TEMPLATE),
            ("generate", GENERATE_TEMPLATE),
            ("heal_syntax", HEAL_SYNTAX_TEMPLATE),
            ("heal_logic", HEAL_LOGIC_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load {name} template"))?;
        }
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections from the end, then truncate the largest survivor.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    while total_len(sections) > budget {
        let Some(idx) = sections.iter().rposition(|s| !s.required) else {
            break;
        };
        let dropped = sections.remove(idx);
        debug!(
            section = %dropped.key,
            bytes_dropped = dropped.content.len(),
            "dropped section for budget"
        );
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(idx) = sections
        .iter()
        .enumerate()
        .max_by_key(|(_, s)| s.content.len())
        .map(|(i, _)| i)
    else {
        return;
    };
    let others = total - sections[idx].content.len();
    let allowed = budget.saturating_sub(others);
    let section = &mut sections[idx];
    let before_len = section.content.len();
    if allowed > TRUNCATION_MARKER.len() {
        truncate_at_boundary(&mut section.content, allowed - TRUNCATION_MARKER.len());
        section.content.push_str(TRUNCATION_MARKER);
    } else {
        truncate_at_boundary(&mut section.content, allowed);
    }
    debug!(
        section = %section.key,
        before_len,
        after_len = section.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// First `max_chars` characters of `text`, with a marker when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("\n[...]");
    out
}

/// Inputs for the planning prompt.
#[derive(Debug, Clone)]
pub struct PlanInputs<'a> {
    pub api_title: &'a str,
    pub mode: TestMode,
    /// Raw schema document text, as supplied.
    pub schema_text: &'a str,
    pub requirements: Option<&'a str>,
    pub test_data: Option<&'a str>,
    pub dependency_block: &'a str,
    /// Live exploration summary, when exploration ran.
    pub exploration_block: Option<&'a str>,
    /// Design artifact path relative to the agent's working directory.
    pub design_file: &'a str,
}

/// Inputs for the generation prompt.
#[derive(Debug, Clone)]
pub struct GenerateInputs<'a> {
    pub design: &'a TestDesign,
    pub design_file: &'a str,
    pub base_url: &'a str,
    pub mode: TestMode,
    pub tests_dir: &'a str,
    /// Recommended call order as `METHOD /path` labels.
    pub call_order: &'a [String],
    /// Field names with live values in `explored_data.json`.
    pub explored_fields: &'a [String],
}

/// Inputs for a repair prompt.
#[derive(Debug, Clone)]
pub struct RepairInputs<'a> {
    pub result: &'a TestCaseResult,
    /// Business requirements excerpt, used by logic repairs.
    pub requirements: Option<&'a str>,
}

#[derive(Serialize)]
struct FailureContext<'a> {
    file: &'a str,
    function: &'a str,
    testcase_id: &'a str,
    line: Option<u32>,
    message: &'a str,
    assertion: Option<&'a str>,
    expected: Option<&'a str>,
    actual: Option<&'a str>,
    response: Option<&'a str>,
    diagnostic: &'a str,
}

impl<'a> FailureContext<'a> {
    fn new(result: &'a TestCaseResult, info: Option<&'a ErrorInfo>) -> Self {
        Self {
            file: &result.file_path,
            function: &result.function_name,
            testcase_id: &result.testcase_id,
            line: info.and_then(|i| i.line),
            message: info.map_or("", |i| i.message.as_str()),
            assertion: info.and_then(|i| i.assertion.as_deref()),
            expected: info.and_then(|i| i.expected.as_deref()),
            actual: info.and_then(|i| i.actual.as_deref()),
            response: info.and_then(|i| i.response_body.as_deref()),
            diagnostic: info.map_or("", |i| i.raw_diagnostic.trim()),
        }
    }
}

/// A rendered prompt plus the tools the agent may use while answering it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPackage {
    pub prompt: String,
    pub allowed_tools: Vec<String>,
}

/// Builds prompts within a byte budget, dropping optional sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    plan_tools: Vec<String>,
    generate_tools: Vec<String>,
    heal_tools: Vec<String>,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize, agent: &AgentConfig) -> Self {
        Self {
            budget_bytes,
            plan_tools: agent.plan_tools.clone(),
            generate_tools: agent.generate_tools.clone(),
            heal_tools: agent.heal_tools.clone(),
        }
    }

    pub fn build_plan(&self, input: &PlanInputs<'_>) -> Result<PromptPackage> {
        let ctx = context! {
            api_title => input.api_title,
            mode => input.mode,
            business => input.mode.has_business_rules(),
            design_file => input.design_file,
            schema => input.schema_text.trim(),
            requirements => non_blank(input.requirements),
            test_data => non_blank(input.test_data),
            dependencies => non_blank(Some(input.dependency_block)),
            exploration => non_blank(input.exploration_block),
        };
        self.package("plan", ctx, &self.plan_tools)
    }

    pub fn build_generate(&self, input: &GenerateInputs<'_>) -> Result<PromptPackage> {
        let ctx = context! {
            cases => &input.design.cases,
            design_file => input.design_file,
            base_url => input.base_url,
            mode => input.mode,
            tests_dir => input.tests_dir,
            order => input.call_order,
            explored => input.explored_fields,
        };
        self.package("generate", ctx, &self.generate_tools)
    }

    pub fn build_repair(&self, kind: HealingKind, input: &RepairInputs<'_>) -> Result<PromptPackage> {
        let failure = FailureContext::new(input.result, input.result.error_info.as_ref());
        let (template, ctx) = match kind {
            HealingKind::Syntax => ("heal_syntax", minijinja::Value::from_serialize(&failure)),
            HealingKind::Logic => (
                "heal_logic",
                context! {
                    requirements => non_blank(input.requirements),
                    ..minijinja::Value::from_serialize(&failure)
                },
            ),
        };
        self.package(template, ctx, &self.heal_tools)
    }

    fn package(
        &self,
        template: &str,
        ctx: minijinja::Value,
        tools: &[String],
    ) -> Result<PromptPackage> {
        let rendered = PromptEngine::new()?.render(template, ctx)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(PromptPackage {
            prompt: render_sections(&sections),
            allowed_tools: tools.to_vec(),
        })
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::design::DesignedCase;
    use crate::core::types::{ErrorKind, TestStatus};

    fn builder(budget: usize) -> PromptBuilder {
        PromptBuilder::new(budget, &AgentConfig::default())
    }

    fn plan_inputs<'a>(requirements: Option<&'a str>, deps: &'a str) -> PlanInputs<'a> {
        PlanInputs {
            api_title: "Shop API",
            mode: TestMode::Business,
            schema_text: "{\"paths\": {}}",
            requirements,
            test_data: None,
            dependency_block: deps,
            exploration_block: None,
            design_file: "test_design.json",
        }
    }

    fn failing_result() -> TestCaseResult {
        TestCaseResult {
            testcase_id: "TC-004".to_string(),
            function_name: "test_cancel_order".to_string(),
            file_path: "tests/test_orders.py".to_string(),
            status: TestStatus::Fail,
            duration: 0.3,
            error_info: Some(ErrorInfo {
                kind: ErrorKind::Assertion,
                line: Some(42),
                message: "AssertionError: assert 200 == 409".to_string(),
                raw_diagnostic: "E   assert 200 == 409".to_string(),
                assertion: Some("200 == 409".to_string()),
                expected: Some("409".to_string()),
                actual: Some("200".to_string()),
                response_body: Some("{\"status\": \"cancelled\"}".to_string()),
                ..ErrorInfo::default()
            }),
            healing_attempts: 0,
            healed: false,
        }
    }

    /// Verifies plan sections appear in template order with the plan tool allowlist.
    #[test]
    fn plan_prompt_orders_sections() {
        let package = builder(100_000)
            .build_plan(&plan_inputs(Some("Orders ship once."), "- resources: 1"))
            .expect("plan");
        let prompt = &package.prompt;
        let contract = prompt.find("### Planning Contract").expect("contract");
        let schema = prompt.find("<schema>").expect("schema");
        let reqs = prompt.find("<requirements>").expect("requirements");
        let deps = prompt.find("<dependencies>").expect("dependencies");
        assert!(contract < schema && schema < reqs && reqs < deps);
        assert!(prompt.contains("Every business rule"));
        assert!(!prompt.contains("<test_data>"));
        assert!(!prompt.contains("section:"));
        assert_eq!(package.allowed_tools, vec!["Read", "Write"]);
    }

    /// Verifies live exploration renders after dependencies and explored fields reach generation.
    #[test]
    fn exploration_sections_render_when_present() {
        let mut inputs = plan_inputs(None, "- resources: 1");
        inputs.exploration_block = Some("- queried endpoints: 1, fields with values: 1\n- id: 11");
        let plan = builder(100_000).build_plan(&inputs).expect("plan");
        let deps = plan.prompt.find("<dependencies>").expect("dependencies");
        let explored = plan.prompt.find("### Live Exploration").expect("exploration");
        assert!(deps < explored);
        assert!(plan.prompt.contains("- id: 11"));

        let fields = vec!["id".to_string(), "vendor_id".to_string()];
        let design = TestDesign { cases: Vec::new() };
        let generate = builder(100_000)
            .build_generate(&GenerateInputs {
                design: &design,
                design_file: "test_design.json",
                base_url: "http://localhost:8080",
                mode: TestMode::Interface,
                tests_dir: "tests",
                call_order: &[],
                explored_fields: &fields,
            })
            .expect("generate");
        assert!(generate.prompt.contains("Fields: id, vendor_id"));
        assert!(generate.prompt.contains("explored_id(\"<field>\")"));

        let bare = builder(100_000).build_plan(&plan_inputs(None, "")).expect("plan");
        assert!(!bare.prompt.contains("Live Exploration"));
    }

    /// Verifies droppable sections go last-first under a tight budget.
    #[test]
    fn budget_drops_trailing_optional_sections() {
        let requirements = "rule ".repeat(40);
        let deps = "dependency ".repeat(200);
        let full = builder(100_000)
            .build_plan(&plan_inputs(Some(&requirements), &deps))
            .expect("full");
        let budget = full.prompt.len() - deps.len() / 2;
        let trimmed = builder(budget)
            .build_plan(&plan_inputs(Some(&requirements), &deps))
            .expect("trimmed");
        assert!(!trimmed.prompt.contains("<dependencies>"));
        assert!(trimmed.prompt.contains("<requirements>"));
        assert!(trimmed.prompt.contains("### Planning Contract"));
    }

    /// Verifies the largest required section is truncated when dropping is not enough.
    #[test]
    fn budget_truncates_largest_section() {
        let mut sections = vec![
            ParsedSection {
                key: "contract".to_string(),
                required: true,
                content: "c".repeat(50),
            },
            ParsedSection {
                key: "schema".to_string(),
                required: true,
                content: "é".repeat(200),
            },
        ];
        apply_budget(&mut sections, 150);
        assert_eq!(sections[0].content.len(), 50);
        assert!(sections[1].content.ends_with("[truncated]"));
        assert!(total_len(&sections) <= 150);
    }

    /// Verifies generation prompts list every designed case.
    #[test]
    fn generate_prompt_lists_cases() {
        let design = TestDesign {
            cases: vec![DesignedCase {
                testcase_id: "TC-001".to_string(),
                api: "POST /orders".to_string(),
                title: "create order".to_string(),
                priority: Some("P0".to_string()),
                steps: Vec::new(),
                expected: "201 with orderId".to_string(),
            }],
        };
        let order = vec!["POST /orders".to_string(), "GET /orders/{orderId}".to_string()];
        let package = builder(100_000)
            .build_generate(&GenerateInputs {
                design: &design,
                design_file: "test_design.json",
                base_url: "http://localhost:8080",
                mode: TestMode::Interface,
                tests_dir: "tests",
                call_order: &order,
                explored_fields: &[],
            })
            .expect("generate");
        assert!(package
            .prompt
            .contains("- TC-001 [P0] POST /orders: create order (expect: 201 with orderId)"));
        assert!(package.prompt.contains("2. GET /orders/{orderId}"));
        assert!(package.prompt.contains("Test mode: interface"));
    }

    /// Verifies syntax and logic repairs use their own templates.
    #[test]
    fn repair_prompts_carry_failure_detail() {
        let result = failing_result();
        let syntax = builder(100_000)
            .build_repair(
                HealingKind::Syntax,
                &RepairInputs {
                    result: &result,
                    requirements: Some("Shipped orders cannot be cancelled."),
                },
            )
            .expect("syntax");
        assert!(syntax.prompt.contains("### Repair Contract"));
        assert!(syntax.prompt.contains("Line: 42"));
        assert!(!syntax.prompt.contains("<requirements>"));
        assert_eq!(syntax.allowed_tools, vec!["Read", "Edit"]);

        let logic = builder(100_000)
            .build_repair(
                HealingKind::Logic,
                &RepairInputs {
                    result: &result,
                    requirements: Some("Shipped orders cannot be cancelled."),
                },
            )
            .expect("logic");
        assert!(logic.prompt.contains("BUG_FOUND"));
        assert!(logic.prompt.contains("Expected: 409"));
        assert!(logic.prompt.contains("Shipped orders cannot be cancelled."));
        assert!(logic.prompt.contains("<response>"));
    }

    /// Verifies excerpts cut on characters.
    #[test]
    fn excerpt_cuts_long_text() {
        assert_eq!(excerpt("  short  ", 10), "short");
        assert_eq!(excerpt("ééééé", 2), "éé\n[...]");
    }
}
