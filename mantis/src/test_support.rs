//! Scripted fakes and fixtures for exercising the workflow without subprocesses.

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::cancel::{CancellationToken, Cancelled};
use crate::core::errors::HarnessReportMissing;
use crate::core::events::ProgressSink;
use crate::core::types::{ErrorInfo, ErrorKind, TestCaseResult, TestStatus};
use crate::io::agent::{AgentAdapter, AgentOutcome, AgentRequest, AgentSessionResult};
use crate::io::harness::{HarnessRequest, HarnessRun, HarnessRunner};
use crate::io::skeleton::EnvConfig;
use crate::workflow::TaskInputs;

/// Session id handed out by [`ScriptedCall::ok`].
pub const SESSION_ID: &str = "session-1";

/// One canned agent call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub result: AgentSessionResult,
    /// Files written relative to the request's workdir before returning.
    pub writes: Vec<(String, String)>,
    pub progress: Vec<String>,
    /// Trip the cancellation token during the call.
    pub cancel: bool,
}

impl ScriptedCall {
    pub fn ok(text: &str) -> Self {
        Self {
            result: AgentSessionResult::succeeded(text, Some(SESSION_ID.to_string())),
            writes: Vec::new(),
            progress: Vec::new(),
            cancel: false,
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            result: AgentSessionResult::failure(AgentOutcome::Failed, error, Duration::ZERO),
            ..Self::ok("")
        }
    }

    /// Cancels the task mid-call, the way a user would.
    pub fn cancelled() -> Self {
        Self {
            result: AgentSessionResult::cancelled(Duration::ZERO),
            cancel: true,
            ..Self::ok("")
        }
    }

    pub fn write(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((path.to_string(), contents.to_string()));
        self
    }

    pub fn progress(mut self, message: &str) -> Self {
        self.progress.push(message.to_string());
        self
    }

    pub fn cost(mut self, usd: f64) -> Self {
        self.result.cost_usd = Some(usd);
        self
    }
}

#[derive(Debug, Default)]
struct AgentScript {
    calls: VecDeque<ScriptedCall>,
    requests: Vec<AgentRequest>,
}

/// Agent that replays [`ScriptedCall`]s in order and records every request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    script: Arc<Mutex<AgentScript>>,
}

impl ScriptedAgent {
    pub fn new(calls: Vec<ScriptedCall>) -> Self {
        Self {
            script: Arc::new(Mutex::new(AgentScript {
                calls: calls.into(),
                requests: Vec::new(),
            })),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.lock().requests.clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AgentScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AgentAdapter for ScriptedAgent {
    fn invoke(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> AgentSessionResult {
        let call = {
            let mut script = self.lock();
            script.requests.push(request.clone());
            script.calls.pop_front()
        };
        let Some(call) = call else {
            return AgentSessionResult::failure(
                AgentOutcome::Failed,
                "no scripted agent call left",
                Duration::ZERO,
            );
        };
        for (path, contents) in &call.writes {
            let target = request.workdir.join(path);
            if let Some(parent) = target.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Err(err) = fs::write(&target, contents) {
                return AgentSessionResult::failure(
                    AgentOutcome::Failed,
                    format!("write {}: {err}", target.display()),
                    Duration::ZERO,
                );
            }
        }
        for message in &call.progress {
            sink.progress(message);
        }
        if call.cancel {
            cancel.cancel();
        }
        call.result
    }
}

/// One canned harness run.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Results(Vec<TestCaseResult>),
    MissingReport,
    Cancelled,
}

#[derive(Debug, Default)]
struct HarnessScript {
    runs: VecDeque<ScriptedRun>,
    executed: usize,
}

/// Harness that replays [`ScriptedRun`]s in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHarness {
    script: Arc<Mutex<HarnessScript>>,
}

impl ScriptedHarness {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            script: Arc::new(Mutex::new(HarnessScript {
                runs: runs.into(),
                executed: 0,
            })),
        }
    }

    pub fn executed(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .executed
    }
}

impl HarnessRunner for ScriptedHarness {
    fn run(&self, request: &HarnessRequest, cancel: &CancellationToken) -> Result<HarnessRun> {
        cancel.check()?;
        let run = {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            script.executed += 1;
            script.runs.pop_front()
        };
        match run.ok_or_else(|| anyhow!("no scripted harness run left"))? {
            ScriptedRun::Results(results) => Ok(HarnessRun {
                results,
                exit_code: Some(0),
                duration: Duration::ZERO,
                timed_out: false,
            }),
            ScriptedRun::MissingReport => Err(HarnessReportMissing {
                path: request.junit_path.clone(),
                detail: "scripted missing report".to_string(),
            }
            .into()),
            ScriptedRun::Cancelled => {
                cancel.cancel();
                Err(Cancelled.into())
            }
        }
    }
}

/// A passing result in `tests/test_orders.py`.
pub fn passed(testcase_id: &str, function: &str) -> TestCaseResult {
    TestCaseResult {
        testcase_id: testcase_id.to_string(),
        function_name: function.to_string(),
        file_path: "tests/test_orders.py".to_string(),
        status: TestStatus::Pass,
        duration: 0.05,
        error_info: None,
        healing_attempts: 0,
        healed: false,
    }
}

/// A failing result whose error has the given kind.
pub fn failed(testcase_id: &str, function: &str, kind: ErrorKind) -> TestCaseResult {
    let message = match kind {
        ErrorKind::Syntax => "NameError: name 'resp' is not defined",
        ErrorKind::Assertion => "AssertionError: assert 404 == 200",
        ErrorKind::Connection => "ConnectionError: connection refused",
        ErrorKind::Timeout => "Failed: Timeout >120.0s",
        ErrorKind::Unknown => "RuntimeError: unexpected",
    };
    let mut result = passed(testcase_id, function);
    result.status = if kind == ErrorKind::Assertion {
        TestStatus::Fail
    } else {
        TestStatus::Error
    };
    result.error_info = Some(ErrorInfo {
        kind,
        file: result.file_path.clone(),
        function: function.to_string(),
        testcase_id: testcase_id.to_string(),
        line: Some(12),
        message: message.to_string(),
        raw_diagnostic: message.to_string(),
        expected: (kind == ErrorKind::Assertion).then(|| "200".to_string()),
        actual: (kind == ErrorKind::Assertion).then(|| "404".to_string()),
        ..ErrorInfo::default()
    });
    result
}

/// A valid `test_design.json` body with one case per id.
pub fn design_json(ids: &[&str]) -> String {
    let cases: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            serde_json::json!({
                "testcase_id": id,
                "api": "POST /orders",
                "title": format!("case {id}"),
                "priority": "P1",
                "expected": "201",
            })
        })
        .collect();
    serde_json::json!({ "cases": cases }).to_string()
}

/// OpenAPI document with a producer and a consumer of `orderId`.
pub const ORDERS_SCHEMA: &str = r#"{
  "openapi": "3.0.0",
  "info": {"title": "Orders API", "version": "1.0"},
  "paths": {
    "/orders/{orderId}": {
      "get": {
        "summary": "Fetch an order",
        "parameters": [{"name": "orderId", "in": "path", "required": true}]
      }
    },
    "/orders": {
      "post": {
        "summary": "Create an order",
        "requestBody": {"content": {"application/json": {"schema": {
          "type": "object",
          "required": ["sku"],
          "properties": {"sku": {"type": "string"}, "quantity": {"type": "integer"}}
        }}}}
      }
    }
  }
}"#;

/// Write [`ORDERS_SCHEMA`] and return inputs for a task under `dir/task`.
pub fn task_inputs(dir: &Path, requirements: Option<&str>) -> TaskInputs {
    let schema_path = dir.join("openapi.json");
    fs::write(&schema_path, ORDERS_SCHEMA).expect("write schema");
    let requirements_path = requirements.map(|text| {
        let path = dir.join("requirements.md");
        fs::write(&path, text).expect("write requirements");
        path
    });
    TaskInputs {
        task_id: "task-1".to_string(),
        output_dir: dir.join("task"),
        schema_path,
        requirements_path,
        test_data_path: None,
        env: env_config(),
    }
}

pub fn env_config() -> EnvConfig {
    EnvConfig {
        base_url: "http://localhost:8080".to_string(),
        auth_token: None,
        request_timeout_secs: 10,
    }
}

/// Path of a file inside a task's output directory.
pub fn task_file(inputs: &TaskInputs, relative: &str) -> PathBuf {
    inputs.output_dir.join(relative)
}

/// OpenAPI document whose resources each expose a parameterless `GET`.
pub const CATALOG_SCHEMA: &str = r#"{
  "openapi": "3.0.0",
  "info": {"title": "Catalog API", "version": "1.0"},
  "paths": {
    "/products": {
      "get": {"summary": "List products"},
      "post": {"summary": "Create a product"}
    },
    "/products/{productId}": {
      "get": {
        "summary": "Fetch a product",
        "parameters": [{"name": "productId", "in": "path", "required": true}]
      }
    },
    "/vendors": {
      "get": {"summary": "List vendors"}
    }
  }
}"#;

/// A request seen by [`StubHttpServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Header names lower-cased.
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP/1.1 responder on localhost serving canned JSON bodies by path.
///
/// Unknown paths get a 404. One connection per request (`Connection: close`).
pub struct StubHttpServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StubHttpServer {
    /// Serve `routes` as `(path, status, body)`.
    pub fn start(routes: &[(&str, u16, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let addr = listener.local_addr().expect("stub address");
        let routes: Vec<(String, u16, String)> = routes
            .iter()
            .map(|(path, status, body)| ((*path).to_string(), *status, (*body).to_string()))
            .collect();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let requests = Arc::clone(&requests);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    serve_one(stream, &routes, &requests);
                }
            })
        };
        Self {
            addr,
            requests,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for StubHttpServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_one(
    mut stream: TcpStream,
    routes: &[(String, u16, String)],
    requests: &Mutex<Vec<RecordedRequest>>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let head = String::from_utf8_lossy(&buf).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default().to_string();
    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let (status, body) = routes
        .iter()
        .find(|(route, _, _)| *route == path)
        .map_or((404, r#"{"error": "not found"}"#), |(_, status, body)| {
            (*status, body.as_str())
        });
    requests
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(RecordedRequest {
            method,
            path,
            headers,
        });
    let response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}
