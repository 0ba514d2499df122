//! Task host: submits workflows onto worker threads and tracks them in a [`TaskStore`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::core::cancel::CancellationToken;
use crate::core::events::TodoSnapshot;
use crate::core::report::FinalReport;
use crate::core::types::WorkflowState;
use crate::io::agent::AgentAdapter;
use crate::io::config::MantisConfig;
use crate::io::harness::HarnessRunner;
use crate::io::skeleton::EnvConfig;
use crate::workflow::{NullObserver, TaskInputs, WorkflowEngine, WorkflowObserver};

/// Externally visible state of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub state: WorkflowState,
    /// Failure or cancellation reason for terminal states.
    pub reason: Option<String>,
    pub output_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<FinalReport>,
}

/// Storage for task records, shared between the host and its workers.
pub trait TaskStore: Send + Sync {
    fn get(&self, id: &str) -> Option<TaskRecord>;
    fn put(&self, record: TaskRecord);
    fn delete(&self, id: &str) -> Option<TaskRecord>;
}

/// Process-local store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get(&self, id: &str) -> Option<TaskRecord> {
        self.lock().get(id).cloned()
    }

    fn put(&self, record: TaskRecord) {
        self.lock().insert(record.id.clone(), record);
    }

    fn delete(&self, id: &str) -> Option<TaskRecord> {
        self.lock().remove(id)
    }
}

/// What to run. The task directory is `output_root/<task id>`.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub output_root: PathBuf,
    pub schema_path: PathBuf,
    pub requirements_path: Option<PathBuf>,
    pub test_data_path: Option<PathBuf>,
    pub env: EnvConfig,
}

/// Mirrors state changes into the store, then forwards to the caller's observer.
struct StoreObserver {
    store: Arc<dyn TaskStore>,
    forward: Arc<dyn WorkflowObserver>,
}

impl WorkflowObserver for StoreObserver {
    fn state_changed(&self, task_id: &str, state: WorkflowState, reason: Option<&str>) {
        if let Some(mut record) = self.store.get(task_id) {
            record.state = state;
            record.reason = reason.map(str::to_string);
            self.store.put(record);
        }
        self.forward.state_changed(task_id, state, reason);
    }

    fn progress(&self, task_id: &str, message: &str) {
        self.forward.progress(task_id, message);
    }

    fn todos(&self, task_id: &str, snapshot: &TodoSnapshot) {
        self.forward.todos(task_id, snapshot);
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Runs each submitted task on its own thread with a fresh [`WorkflowEngine`].
pub struct TaskService<A, H> {
    agent: A,
    harness: H,
    config: MantisConfig,
    store: Arc<dyn TaskStore>,
    observer: Arc<dyn WorkflowObserver>,
    workers: Mutex<HashMap<String, Worker>>,
    counter: AtomicU64,
}

impl<A, H> TaskService<A, H>
where
    A: AgentAdapter + Clone + Send + 'static,
    H: HarnessRunner + Clone + Send + 'static,
{
    pub fn new(agent: A, harness: H, config: MantisConfig, store: Arc<dyn TaskStore>) -> Self {
        Self {
            agent,
            harness,
            config,
            store,
            observer: Arc::new(NullObserver),
            workers: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Register the task as `Init` and start its worker. Returns the task id.
    pub fn submit(&self, request: TaskRequest) -> Result<String> {
        let id = self.next_id();
        let output_dir = request.output_root.join(&id);
        self.store.put(TaskRecord {
            id: id.clone(),
            state: WorkflowState::Init,
            reason: None,
            output_dir: output_dir.clone(),
            created_at: Utc::now(),
            report: None,
        });

        let inputs = TaskInputs {
            task_id: id.clone(),
            output_dir,
            schema_path: request.schema_path,
            requirements_path: request.requirements_path,
            test_data_path: request.test_data_path,
            env: request.env,
        };
        let cancel = CancellationToken::new();
        let observer: Arc<dyn WorkflowObserver> = Arc::new(StoreObserver {
            store: Arc::clone(&self.store),
            forward: Arc::clone(&self.observer),
        });
        let engine = WorkflowEngine::new(
            self.agent.clone(),
            self.harness.clone(),
            self.config.clone(),
            cancel.clone(),
        )
        .with_observer(observer);
        let store = Arc::clone(&self.store);

        let handle = thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || {
                let outcome = engine.run(&inputs);
                if let Some(mut record) = store.get(&outcome.task_id) {
                    record.state = outcome.state;
                    record.reason = outcome.reason;
                    record.report = outcome.report;
                    store.put(record);
                }
            })
            .with_context(|| format!("spawn worker for task {id}"))?;

        self.lock_workers().insert(
            id.clone(),
            Worker {
                cancel,
                handle: Some(handle),
            },
        );
        info!(task_id = %id, "task submitted");
        Ok(id)
    }

    /// Request cancellation. Returns false for unknown or finished tasks.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(record) = self.store.get(id) else {
            return false;
        };
        if record.state.is_terminal() {
            return false;
        }
        match self.lock_workers().get(id) {
            Some(worker) => {
                info!(task_id = %id, "cancellation requested");
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> Option<TaskRecord> {
        self.store.get(id)
    }

    /// Block until the task's worker exits, then return its final record.
    pub fn wait(&self, id: &str) -> Result<TaskRecord> {
        let handle = self
            .lock_workers()
            .get_mut(id)
            .and_then(|worker| worker.handle.take());
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!(task_id = %id, "task worker panicked");
            if let Some(mut record) = self.store.get(id)
                && !record.state.is_terminal()
            {
                record.state = WorkflowState::Failed;
                record.reason = Some("task worker panicked".to_string());
                self.store.put(record);
            }
        }
        self.store
            .get(id)
            .with_context(|| format!("unknown task {id}"))
    }

    /// Forget a finished task. Running tasks must be cancelled and waited first.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let Some(record) = self.store.get(id) else {
            return Ok(false);
        };
        if !record.state.is_terminal() {
            bail!("task {id} is still {}", record.state);
        }
        self.lock_workers().remove(id);
        self.store.delete(id);
        debug!(task_id = %id, "task removed");
        Ok(true)
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{:04}", Utc::now().format("%Y%m%d-%H%M%S"), n % 10_000)
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
