//! Execution State
//!
//! Per-step outcomes and the workflow execution record they roll up into.
//!
//! Status transitions are one-way: a step moves `pending -> running ->
//! completed | failed`, or straight to `skipped` if it never starts. Once a
//! step is terminal its outcome no longer changes. Records can be persisted
//! as JSON with [`save_execution`] and read back with [`load_execution`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::model::StepGraph;
use crate::execution::aggregate::OverallResult;
use crate::serde_ext::option_duration_ms;

/// Lifecycle state of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting for its batch
    Pending,
    /// Being invoked (possibly between retry attempts)
    Running,
    /// Invoker returned a result
    Completed,
    /// Invoker or parameter resolution returned an error
    Failed,
    /// Never started because of fail-fast or cancellation
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Lifecycle state of a whole workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Recorded result of one step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Time spent invoking the step, retries included
    #[serde(
        default,
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_time: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Present only when the step failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Extra attempts made after the first failure
    #[serde(default)]
    pub retry_count: u32,
}

impl StepOutcome {
    /// Creates a pending outcome for `step_id`.
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            execution_time: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }

    /// Moves a pending step to running. Returns false for any other state.
    pub fn mark_running(&mut self, at: DateTime<Utc>) -> bool {
        if self.status != StepStatus::Pending {
            return false;
        }
        self.status = StepStatus::Running;
        self.started_at = Some(at);
        true
    }

    /// Records a successful invocation. Terminal outcomes are left untouched.
    pub fn mark_completed(&mut self, result: Value, at: DateTime<Utc>, elapsed: Duration) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.finish_timing(at, elapsed);
        true
    }

    /// Records a failed invocation. Terminal outcomes are left untouched.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
        elapsed: Duration,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finish_timing(at, elapsed);
        true
    }

    /// Marks a step that never ran. Only pending steps can be skipped.
    pub fn mark_skipped(&mut self) -> bool {
        if self.status != StepStatus::Pending {
            return false;
        }
        self.status = StepStatus::Skipped;
        true
    }

    fn finish_timing(&mut self, at: DateTime<Utc>, elapsed: Duration) {
        if self.started_at.is_none() {
            self.started_at = Some(at);
        }
        self.completed_at = Some(at);
        self.execution_time = Some(elapsed);
    }
}

/// Full record of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub status: WorkflowStatus,

    /// One outcome per step, in declaration order
    pub steps: Vec<StepOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_result: Option<OverallResult>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Wall-clock time from start to finish
    #[serde(
        default,
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_time: Option<Duration>,

    /// Present only when the workflow failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// Creates a running execution with every step pending.
    pub fn new(workflow_id: impl Into<String>, graph: &StepGraph) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Running,
            steps: graph
                .steps
                .iter()
                .map(|s| StepOutcome::pending(s.id.clone()))
                .collect(),
            overall_result: None,
            started_at: Utc::now(),
            completed_at: None,
            execution_time: None,
            error: None,
        }
    }

    /// Gets the outcome of a step.
    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|o| o.step_id == step_id)
    }

    pub fn outcome_mut(&mut self, step_id: &str) -> Option<&mut StepOutcome> {
        self.steps.iter_mut().find(|o| o.step_id == step_id)
    }

    /// Number of steps currently in `status`.
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|o| o.status == status).count()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves a running workflow to cancelled. Returns false otherwise.
    pub fn cancel(&mut self) -> bool {
        if self.status != WorkflowStatus::Running {
            return false;
        }
        self.status = WorkflowStatus::Cancelled;
        true
    }

    /// Marks every still-pending step as skipped, returning how many changed.
    pub fn skip_pending(&mut self) -> usize {
        self.steps
            .iter_mut()
            .map(|o| o.mark_skipped())
            .filter(|changed| *changed)
            .count()
    }

    /// Writes the final status, timing and aggregate.
    ///
    /// `status` and `error` apply only while the workflow is still running, so
    /// a concurrent cancellation is never overwritten. Timing and the
    /// aggregate are recorded either way.
    pub fn finish(
        &mut self,
        status: WorkflowStatus,
        error: Option<String>,
        overall: OverallResult,
        elapsed: Duration,
    ) {
        if self.status == WorkflowStatus::Running {
            self.status = status;
            self.error = if status == WorkflowStatus::Failed {
                error
            } else {
                None
            };
        }
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
            self.execution_time = Some(elapsed);
        }
        self.overall_result = Some(overall);
    }
}

/// Errors raised while persisting execution records.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file '{}' is not a valid execution record: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Saves an execution record as pretty JSON, creating parent directories.
pub fn save_execution(
    execution: &WorkflowExecution,
    path: impl AsRef<Path>,
) -> Result<(), StateError> {
    let path = path.as_ref();
    let io_error = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let json = serde_json::to_string_pretty(execution).map_err(|source| StateError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(io_error)?;

    info!(
        "Saved execution '{}' to {}",
        execution.workflow_id,
        path.display()
    );
    Ok(())
}

/// Loads an execution record saved by [`save_execution`].
pub fn load_execution(path: impl AsRef<Path>) -> Result<WorkflowExecution, StateError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let execution: WorkflowExecution =
        serde_json::from_str(&content).map_err(|source| StateError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    info!(
        "Loaded execution '{}' ({}) from {}",
        execution.workflow_id,
        execution.status,
        path.display()
    );
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::aggregate::aggregate_results;
    use crate::workflow::{CapabilityRef, Step};
    use serde_json::json;
    use tempfile::tempdir;

    fn graph() -> StepGraph {
        StepGraph::from_steps(vec![
            Step::new("a", CapabilityRef::new("s", "a")),
            Step::new("b", CapabilityRef::new("s", "b")).depends_on("a"),
        ])
    }

    #[test]
    fn test_new_execution_is_running_with_pending_steps() {
        let execution = WorkflowExecution::new("wf-1", &graph());
        assert_eq!(execution.status, WorkflowStatus::Running);
        assert_eq!(execution.steps.len(), 2);
        assert_eq!(execution.count(StepStatus::Pending), 2);
        assert_eq!(execution.steps[0].step_id, "a");
        assert!(!execution.is_terminal());
    }

    #[test]
    fn test_step_transitions() {
        let mut outcome = StepOutcome::pending("a");
        let now = Utc::now();

        assert!(outcome.mark_running(now));
        assert!(!outcome.mark_running(now));
        assert!(outcome.mark_completed(json!({"v": 1}), now, Duration::from_millis(5)));

        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(outcome.execution_time, Some(Duration::from_millis(5)));
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_terminal_step_never_changes() {
        let mut outcome = StepOutcome::pending("a");
        let now = Utc::now();
        outcome.mark_running(now);
        outcome.mark_failed("boom", now, Duration::ZERO);

        assert!(!outcome.mark_completed(json!(1), now, Duration::ZERO));
        assert!(!outcome.mark_skipped());
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_only_pending_steps_are_skipped() {
        let mut execution = WorkflowExecution::new("wf", &graph());
        execution.steps[0].mark_running(Utc::now());

        assert_eq!(execution.skip_pending(), 1);
        assert_eq!(execution.outcome("a").unwrap().status, StepStatus::Running);
        assert_eq!(execution.outcome("b").unwrap().status, StepStatus::Skipped);
    }

    #[test]
    fn test_cancel_only_from_running() {
        let mut execution = WorkflowExecution::new("wf", &graph());
        assert!(execution.cancel());
        assert!(!execution.cancel());
        assert_eq!(execution.status, WorkflowStatus::Cancelled);
    }

    #[test]
    fn test_finish_keeps_cancelled_status() {
        let mut execution = WorkflowExecution::new("wf", &graph());
        execution.cancel();
        execution.skip_pending();
        let overall = aggregate_results(&execution.steps);

        execution.finish(
            WorkflowStatus::Completed,
            None,
            overall,
            Duration::from_millis(3),
        );

        assert_eq!(execution.status, WorkflowStatus::Cancelled);
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.execution_time, Some(Duration::from_millis(3)));
        assert_eq!(
            execution.overall_result.as_ref().unwrap().summary.skipped_steps,
            2
        );
    }

    #[test]
    fn test_finish_records_error_only_on_failure() {
        let mut execution = WorkflowExecution::new("wf", &graph());
        let overall = aggregate_results(&execution.steps);
        execution.finish(
            WorkflowStatus::Completed,
            Some("ignored".into()),
            overall,
            Duration::ZERO,
        );
        assert!(execution.error.is_none());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(WorkflowStatus::Cancelled).unwrap(),
            json!("cancelled")
        );
        assert_eq!(StepStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn test_save_and_load_execution() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("runs").join("wf.json");

        let mut execution = WorkflowExecution::new("wf-save", &graph());
        let now = Utc::now();
        execution.steps[0].mark_running(now);
        execution.steps[0].mark_completed(json!({"value": 42}), now, Duration::from_millis(12));

        save_execution(&execution, &path).unwrap();
        let loaded = load_execution(&path).unwrap();

        assert_eq!(loaded.workflow_id, "wf-save");
        assert_eq!(loaded.steps[0].result, Some(json!({"value": 42})));
        assert_eq!(
            loaded.steps[0].execution_time,
            Some(Duration::from_millis(12))
        );
        assert_eq!(loaded.steps[1].status, StepStatus::Pending);
    }

    #[test]
    fn test_load_nonexistent_execution() {
        let result = load_execution("/nonexistent/path/wf.json");
        assert!(matches!(result, Err(StateError::Io { .. })));
    }

    #[test]
    fn test_load_corrupt_execution() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_execution(&path), Err(StateError::Json { .. })));
    }
}
