//! Opt-in live probing of the API under test.
//!
//! Before planning, [`HttpExplorer`] sends one `GET` to each resource's
//! parameterless list endpoint and records the identifiers in the responses.
//! Only reads are issued. A failed request is recorded as a failed step and
//! never fails the task.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancellationToken;
use crate::core::dependency::{DependencyAnalysisResult, Endpoint};
use crate::core::exploration::{
    ExplorationResult, ExplorationStep, ExploredValues, extract_ids, select_targets,
};
use crate::io::artifacts::{TaskPaths, write_json};
use crate::io::config::ExplorationConfig;
use crate::io::skeleton::{EnvConfig, sanitize_token};

/// Blocking HTTP client for read-only exploration.
#[derive(Debug, Clone)]
pub struct HttpExplorer {
    client: Client,
    max_endpoints: usize,
}

impl HttpExplorer {
    pub fn new(config: &ExplorationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("build exploration http client")?;
        Ok(Self {
            client,
            max_endpoints: config.max_endpoints,
        })
    }

    /// Query every selected endpoint in order, checking cancellation between requests.
    #[instrument(skip_all, fields(base_url = %env.base_url))]
    pub fn explore(
        &self,
        analysis: &DependencyAnalysisResult,
        env: &EnvConfig,
        cancel: &CancellationToken,
    ) -> Result<ExplorationResult> {
        let headers = request_headers(env)?;
        let targets = select_targets(analysis, self.max_endpoints);
        debug!(targets = targets.len(), "exploring read-only endpoints");

        let mut result = ExplorationResult::default();
        for (step, endpoint) in (1..).zip(targets) {
            cancel.check()?;
            let url = join_url(&env.base_url, &endpoint.path);
            result.push(self.fetch(step, endpoint, url, &headers));
        }
        info!(
            steps = result.steps.len(),
            fields = result.extracted_values.len(),
            success = result.overall_success,
            "exploration finished"
        );
        Ok(result)
    }

    fn fetch(
        &self,
        step: u32,
        endpoint: Endpoint,
        url: String,
        headers: &HeaderMap,
    ) -> ExplorationStep {
        let mut entry = ExplorationStep {
            step,
            endpoint,
            url,
            status: None,
            success: false,
            message: String::new(),
            extracted: ExploredValues::new(),
        };
        let response = match self.client.get(&entry.url).headers(headers.clone()).send() {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %entry.url, err = %err, "exploration request failed");
                entry.message = format!("request failed: {err}");
                return entry;
            }
        };

        let status = response.status();
        entry.status = Some(status.as_u16());
        if status != StatusCode::OK {
            debug!(url = %entry.url, status = status.as_u16(), "exploration got non-200");
            entry.message = format!("status {}", status.as_u16());
            return entry;
        }

        entry.success = true;
        match response.json::<Value>() {
            Ok(payload) => {
                entry.extracted = extract_ids(&payload);
                let count: usize = entry.extracted.values().map(Vec::len).sum();
                entry.message = format!("extracted {count} values");
            }
            Err(err) => {
                debug!(url = %entry.url, err = %err, "exploration response is not json");
                entry.message = "response is not JSON".to_string();
            }
        }
        entry
    }
}

/// Write `exploration_log.json` and the `explored_data.json` read by `conftest.py`.
pub fn save_exploration(paths: &TaskPaths, result: &ExplorationResult) -> Result<()> {
    write_json(&paths.exploration_log_path, result)?;
    write_json(&paths.explored_data_path, &result.extracted_values)
}

fn request_headers(env: &EnvConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    let token = env.auth_token.as_deref().map(sanitize_token).unwrap_or_default();
    if !token.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("auth token is not a valid header value")?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
