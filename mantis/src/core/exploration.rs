//! Live exploration results: which read-only endpoints were queried and which
//! identifiers their responses carried.
//!
//! Target selection and id extraction are pure; the HTTP side lives in
//! `io::explorer`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::dependency::{DependencyAnalysisResult, Endpoint};

/// Values kept per field name.
pub const MAX_VALUES_PER_FIELD: usize = 20;

/// Identifiers collected from responses, keyed by field name.
pub type ExploredValues = BTreeMap<String, Vec<Value>>;

/// One queried endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorationStep {
    pub step: u32,
    pub endpoint: Endpoint,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub extracted: ExploredValues,
}

/// Contents of `exploration_log.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplorationResult {
    pub overall_success: bool,
    pub steps: Vec<ExplorationStep>,
    pub extracted_values: ExploredValues,
}

impl ExplorationResult {
    /// Record a step and fold its values into the merged set.
    pub fn push(&mut self, step: ExplorationStep) {
        merge_values(&mut self.extracted_values, &step.extracted);
        self.overall_success |= step.success;
        self.steps.push(step);
    }

    pub fn to_prompt_block(&self, limit: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "- queried endpoints: {}, fields with values: {}",
            self.steps.len(),
            self.extracted_values.len()
        );
        for step in self.steps.iter().take(limit) {
            let status = step
                .status
                .map_or_else(|| "n/a".to_string(), |s| s.to_string());
            let mark = if step.success { "ok" } else { "failed" };
            let _ = writeln!(
                out,
                "- {mark} {} ({status}) {}",
                step.endpoint.label(),
                step.message
            );
        }
        if !self.extracted_values.is_empty() {
            out.push_str("### Identifiers seen in live responses\n");
            for (field, values) in self.extracted_values.iter().take(limit) {
                let preview: Vec<String> = values.iter().take(3).map(render_value).collect();
                let _ = writeln!(out, "- {field}: {}", preview.join(", "));
            }
        }
        out.trim_end().to_string()
    }
}

/// Read-only exploration targets: the first parameterless `GET` of each resource.
///
/// Only resources that have such an endpoint count toward `max_endpoints`.
pub fn select_targets(analysis: &DependencyAnalysisResult, max_endpoints: usize) -> Vec<Endpoint> {
    analysis
        .resources
        .iter()
        .filter_map(|resource| {
            resource
                .endpoints
                .iter()
                .find(|ep| ep.method.eq_ignore_ascii_case("GET") && !ep.path.contains('{'))
                .cloned()
        })
        .take(max_endpoints)
        .collect()
}

/// True for `id`, `order_id`, `orderId`, `orderID` and `uuid`-style keys.
pub fn is_identifier_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower == "id"
        || lower.ends_with("_id")
        || lower.ends_with("uuid")
        || ((key.ends_with("Id") || key.ends_with("ID")) && key.len() > 2)
}

/// Walk a response body and collect scalar values under identifier keys.
pub fn extract_ids(payload: &Value) -> ExploredValues {
    let mut collected = ExploredValues::new();
    walk(payload, &mut collected);
    collected
}

fn walk(value: &Value, collected: &mut ExploredValues) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if is_identifier_key(key) && is_usable(child) {
                    push_unique(collected.entry(key.clone()).or_default(), child);
                }
                walk(child, collected);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, collected);
            }
        }
        _ => {}
    }
}

fn is_usable(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.trim().is_empty(),
        Value::Number(_) => true,
        _ => false,
    }
}

fn push_unique(values: &mut Vec<Value>, value: &Value) {
    if values.len() < MAX_VALUES_PER_FIELD && !values.contains(value) {
        values.push(value.clone());
    }
}

/// Merge `new` into `target`, keeping first-seen order and dropping duplicates.
pub fn merge_values(target: &mut ExploredValues, new: &ExploredValues) {
    for (key, values) in new {
        let slot = target.entry(key.clone()).or_default();
        for value in values {
            push_unique(slot, value);
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
