//! Task input files: the API schema document and optional free-text inputs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::debug;

use crate::core::schema::ApiSchema;

/// A parsed schema together with the text it came from.
#[derive(Debug, Clone)]
pub struct LoadedSchema {
    pub schema: ApiSchema,
    /// Original document text, quoted verbatim in the planning prompt.
    pub text: String,
}

/// Load an OpenAPI/Swagger document from JSON or YAML.
///
/// `.json` is parsed as JSON and `.yaml`/`.yml` as YAML; any other extension
/// tries JSON first, then YAML.
pub fn load_api_schema(path: &Path) -> Result<LoadedSchema> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let document = match extension.as_deref() {
        Some("json") => parse_json(&text),
        Some("yaml" | "yml") => parse_yaml(&text),
        _ => parse_json(&text).or_else(|json_err| {
            parse_yaml(&text).map_err(|yaml_err| {
                anyhow!("not JSON ({json_err:#}) or YAML ({yaml_err:#})")
            })
        }),
    }
    .with_context(|| format!("parse {}", path.display()))?;
    if !document.is_object() {
        return Err(anyhow!("{} is not a schema document", path.display()));
    }
    let schema = ApiSchema::from_document(&document);
    debug!(operations = schema.operations.len(), "loaded api schema");
    Ok(LoadedSchema { schema, text })
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).context("parse json")
}

fn parse_yaml(text: &str) -> Result<Value> {
    serde_yaml::from_str(text).context("parse yaml")
}

/// Read an optional text input; a blank file counts as absent.
pub fn read_text_input(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok((!text.trim().is_empty()).then_some(text))
}
