//! Workflow Registry
//!
//! Accepts step graphs, runs them in the background and keeps their
//! execution records queryable while they run.
//!
//! - [`ExecutionStore`]: the shared id -> execution map
//! - [`WorkflowRegistry`]: submit, status, cancel, wait, purge
//!
//! The registry is an ordinary value; create one per orchestrator and pass
//! it where it is needed.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::CapabilityCatalog;
use crate::execution::Engine;
use crate::workflow::planner::{plan_batches, ScheduleError};
use crate::workflow::state::{WorkflowExecution, WorkflowStatus};
use crate::workflow::validator::{validate_graph, ValidationOptions, ValidationReport};
use crate::workflow::StepGraph;

/// Concurrent map of workflow executions.
///
/// Cloning is cheap and every clone sees the same records. Reads return
/// snapshots, so callers never hold a lock.
#[derive(Clone, Default)]
pub struct ExecutionStore {
    inner: Arc<DashMap<String, WorkflowExecution>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new execution. Returns false if the id is already taken.
    pub fn insert_new(&self, execution: WorkflowExecution) -> bool {
        match self.inner.entry(execution.workflow_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(execution);
                true
            }
        }
    }

    /// Snapshot of an execution.
    pub fn get(&self, workflow_id: &str) -> Option<WorkflowExecution> {
        self.inner.get(workflow_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.inner.contains_key(workflow_id)
    }

    /// Applies `f` to an execution under its entry lock.
    pub fn update<R>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&mut WorkflowExecution) -> R,
    ) -> Option<R> {
        self.inner
            .get_mut(workflow_id)
            .map(|mut entry| f(entry.value_mut()))
    }

    pub fn remove(&self, workflow_id: &str) -> Option<WorkflowExecution> {
        self.inner.remove(workflow_id).map(|(_, execution)| execution)
    }

    /// Removes an execution only if it has reached a terminal status.
    pub fn remove_terminal(&self, workflow_id: &str) -> Option<WorkflowExecution> {
        self.inner
            .remove_if(workflow_id, |_, execution| execution.is_terminal())
            .map(|(_, execution)| execution)
    }

    /// Ids of executions currently in `status`, sorted.
    pub fn ids_with_status(&self, status: WorkflowStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Reasons a graph was not accepted, or a workflow could not be awaited.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("chain is invalid: {}", .0.errors.join("; "))]
    Invalid(ValidationReport),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("workflow '{0}' already exists")]
    DuplicateWorkflowId(String),
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),
    #[error("no tokio runtime available to run workflows")]
    NoRuntime,
    #[error("workflow '{id}' task failed: {message}")]
    Join { id: String, message: String },
}

/// Submits and tracks workflow executions.
pub struct WorkflowRegistry {
    engine: Engine,
    catalog: Arc<dyn CapabilityCatalog>,
    validation: ValidationOptions,
    store: ExecutionStore,
    tokens: DashMap<String, CancellationToken>,
    handles: DashMap<String, JoinHandle<()>>,
}

impl WorkflowRegistry {
    pub fn new(engine: Engine, catalog: Arc<dyn CapabilityCatalog>) -> Self {
        Self {
            engine,
            catalog,
            validation: ValidationOptions::default(),
            store: ExecutionStore::new(),
            tokens: DashMap::new(),
            handles: DashMap::new(),
        }
    }

    /// Sets the checks run on every submitted graph.
    pub fn set_validation(&mut self, options: ValidationOptions) {
        self.validation = options;
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    /// Validates and schedules `graph`, then starts it in the background.
    ///
    /// Validation and scheduling problems are returned here, before anything
    /// runs. Must be called from within a tokio runtime.
    pub fn submit(&self, graph: StepGraph) -> Result<String, SubmitError> {
        self.submit_with_id(Uuid::new_v4().to_string(), graph)
    }

    /// Like [`submit`](Self::submit) with a caller-chosen workflow id.
    pub fn submit_with_id(
        &self,
        workflow_id: impl Into<String>,
        graph: StepGraph,
    ) -> Result<String, SubmitError> {
        let workflow_id = workflow_id.into();
        if self.store.contains(&workflow_id) {
            return Err(SubmitError::DuplicateWorkflowId(workflow_id));
        }

        let report = validate_graph(&graph, self.catalog.as_ref(), &self.validation);
        if !report.valid {
            warn!(
                "Rejected workflow '{}': {} validation errors",
                workflow_id,
                report.errors.len()
            );
            return Err(SubmitError::Invalid(report));
        }

        let plan = plan_batches(&graph)?;
        let runtime = Handle::try_current().map_err(|_| SubmitError::NoRuntime)?;

        if !self
            .store
            .insert_new(WorkflowExecution::new(workflow_id.clone(), &graph))
        {
            return Err(SubmitError::DuplicateWorkflowId(workflow_id));
        }

        let token = CancellationToken::new();
        self.tokens.insert(workflow_id.clone(), token.clone());

        let engine = self.engine.clone();
        let store = self.store.clone();
        let graph = Arc::new(graph);
        let id = workflow_id.clone();
        let handle = runtime.spawn(async move {
            engine.execute(graph, &plan, &store, &id, &token).await;
        });
        self.handles.insert(workflow_id.clone(), handle);

        info!("Submitted workflow '{}'", workflow_id);
        Ok(workflow_id)
    }

    /// Submits `graph` and waits for it to finish.
    pub async fn run(&self, graph: StepGraph) -> Result<WorkflowExecution, SubmitError> {
        let workflow_id = self.submit(graph)?;
        self.wait(&workflow_id).await
    }

    /// Snapshot of a workflow's execution record.
    pub fn status(&self, workflow_id: &str) -> Option<WorkflowExecution> {
        self.store.get(workflow_id)
    }

    /// Cancels a running workflow.
    ///
    /// The status becomes `cancelled` immediately; steps already in flight
    /// finish, and no further batch starts. Returns false (and changes
    /// nothing) if the workflow is unknown or not running.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let cancelled = self
            .store
            .update(workflow_id, WorkflowExecution::cancel)
            .unwrap_or(false);

        if cancelled {
            if let Some(token) = self.tokens.get(workflow_id) {
                token.cancel();
            }
            info!("Cancelled workflow '{}'", workflow_id);
        } else {
            debug!("Workflow '{}' is not running, nothing to cancel", workflow_id);
        }
        cancelled
    }

    /// Ids of running workflows, sorted.
    pub fn list_active(&self) -> Vec<String> {
        self.store.ids_with_status(WorkflowStatus::Running)
    }

    /// Waits for the engine task of a submitted workflow, then returns its
    /// final record. If another caller is already waiting, returns the
    /// current snapshot.
    pub async fn wait(&self, workflow_id: &str) -> Result<WorkflowExecution, SubmitError> {
        let handle = self.handles.remove(workflow_id).map(|(_, handle)| handle);
        if let Some(handle) = handle {
            handle.await.map_err(|e| SubmitError::Join {
                id: workflow_id.to_string(),
                message: e.to_string(),
            })?;
            self.tokens.remove(workflow_id);
        }

        self.store
            .get(workflow_id)
            .ok_or_else(|| SubmitError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Drops a finished workflow's record. Returns false if it is unknown or
    /// still running.
    pub fn purge(&self, workflow_id: &str) -> bool {
        match self.store.remove_terminal(workflow_id) {
            Some(_) => {
                self.tokens.remove(workflow_id);
                self.handles.remove(workflow_id);
                debug!("Purged workflow '{}'", workflow_id);
                true
            }
            None => false,
        }
    }
}
