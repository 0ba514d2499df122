//! The test-design artifact produced by the planning call.

use std::collections::HashSet;

use anyhow::{Result, anyhow, bail};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const TEST_DESIGN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/test_design.schema.json"
));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignedCase {
    pub testcase_id: String,
    /// `METHOD /path` of the operation under test.
    pub api: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
    pub expected: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDesign {
    pub cases: Vec<DesignedCase>,
}

impl TestDesign {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|c| c.testcase_id.as_str())
    }
}

/// Validate against the embedded schema, then deserialize.
///
/// Duplicate testcase ids are rejected as well; they would make the
/// coverage cross-reference ambiguous.
pub fn parse_test_design(value: &Value) -> Result<TestDesign> {
    let schema: Value = serde_json::from_str(TEST_DESIGN_SCHEMA)
        .map_err(|err| anyhow!("embedded test design schema: {err}"))?;
    let validator =
        validator_for(&schema).map_err(|err| anyhow!("invalid test design schema: {err}"))?;
    if !validator.is_valid(value) {
        let messages = validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!("test design validation failed: {}", messages.join("; "));
    }

    let design: TestDesign = serde_json::from_value(value.clone())
        .map_err(|err| anyhow!("decode test design: {err}"))?;
    let mut seen = HashSet::new();
    for id in design.ids() {
        if !seen.insert(id) {
            bail!("duplicate testcase id {id} in test design");
        }
    }
    Ok(design)
}
