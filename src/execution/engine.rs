//! Workflow Execution Engine
//!
//! Drives one workflow execution from `running` to a terminal status:
//! - Batches run strictly in order; each batch is a hard barrier
//! - Steps within a batch run concurrently as tokio tasks
//! - Optional concurrency limit and per-step timeout
//! - Fail-fast or run-everything failure handling
//! - Cooperative cancellation checked between batches
//!
//! All state changes go through the [`ExecutionStore`], so the execution can
//! be inspected while it runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::aggregate::aggregate_results;
use super::resolver::ResolutionMode;
use super::step::{execute_step, StepContext, StepRun};
use crate::capability::CapabilityInvoker;
use crate::registry::ExecutionStore;
use crate::serde_ext::option_duration_ms;
use crate::workflow::planner::BatchPlan;
use crate::workflow::state::{WorkflowExecution, WorkflowStatus};
use crate::workflow::StepGraph;

/// Engine behaviour switches.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Stop scheduling new batches after the first failed step
    pub fail_fast: bool,
    /// Maximum steps running at once; `None` means unbounded
    pub max_parallel: Option<usize>,
    /// Upper bound for each invocation attempt
    #[serde(with = "option_duration_ms", alias = "step_timeout_ms")]
    pub step_timeout: Option<Duration>,
    /// Re-invoke failing steps up to their `max_retries`
    pub retry_in_slot: bool,
    pub resolution_mode: ResolutionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_parallel: None,
            step_timeout: None,
            retry_in_slot: true,
            resolution_mode: ResolutionMode::Permissive,
        }
    }
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use chainrunner::capability::DryRunInvoker;
/// use chainrunner::execution::Engine;
///
/// let mut engine = Engine::new(Arc::new(DryRunInvoker));
/// engine.set_fail_fast(true);
/// engine.set_max_parallel(Some(4));
/// ```
#[derive(Clone)]
pub struct Engine {
    invoker: Arc<dyn CapabilityInvoker>,
    config: EngineConfig,
}

impl Engine {
    /// Creates an engine with the default configuration.
    pub fn new(invoker: Arc<dyn CapabilityInvoker>) -> Self {
        Self::with_config(invoker, EngineConfig::default())
    }

    pub fn with_config(invoker: Arc<dyn CapabilityInvoker>, config: EngineConfig) -> Self {
        Self { invoker, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Enables or disables fail-fast.
    pub fn set_fail_fast(&mut self, fail_fast: bool) {
        self.config.fail_fast = fail_fast;
    }

    /// Sets the maximum number of concurrently running steps.
    pub fn set_max_parallel(&mut self, max: Option<usize>) {
        self.config.max_parallel = max;
    }

    /// Sets the per-invocation timeout.
    pub fn set_step_timeout(&mut self, timeout: Option<Duration>) {
        self.config.step_timeout = timeout;
    }

    pub fn set_retry_in_slot(&mut self, retry_in_slot: bool) {
        self.config.retry_in_slot = retry_in_slot;
    }

    pub fn set_resolution_mode(&mut self, mode: ResolutionMode) {
        self.config.resolution_mode = mode;
    }

    /// Executes `plan` for the execution `workflow_id` held in `store`.
    ///
    /// The execution must already be in the store with every step pending.
    /// Returns the final snapshot, or `None` if the record disappeared from
    /// the store while running.
    pub async fn execute(
        &self,
        graph: Arc<StepGraph>,
        plan: &BatchPlan,
        store: &ExecutionStore,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Option<WorkflowExecution> {
        let clock = Instant::now();
        let limiter = self
            .config
            .max_parallel
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        let variables = Arc::new(graph.variables.clone());
        let mut first_error: Option<String> = None;

        info!(
            "Workflow '{}': {} steps in {} batches",
            workflow_id,
            plan.step_count(),
            plan.len()
        );

        for (index, batch) in plan.batches().iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    "Workflow '{}' cancelled, not starting batch {}",
                    workflow_id, index
                );
                break;
            }

            let now = Utc::now();
            let snapshot = store
                .update(workflow_id, |execution| {
                    if execution.status != WorkflowStatus::Running {
                        return None;
                    }
                    for id in batch {
                        if let Some(outcome) = execution.outcome_mut(id) {
                            outcome.mark_running(now);
                        }
                    }
                    Some(
                        execution
                            .steps
                            .iter()
                            .filter(|o| o.status.is_terminal())
                            .cloned()
                            .collect::<Vec<_>>(),
                    )
                })
                .flatten();

            let Some(outcomes) = snapshot else {
                warn!(
                    "Workflow '{}' is no longer running, stopping before batch {}",
                    workflow_id, index
                );
                break;
            };

            debug!("Workflow '{}': batch {} {:?}", workflow_id, index, batch);

            let ctx = Arc::new(StepContext {
                invoker: Arc::clone(&self.invoker),
                variables: Arc::clone(&variables),
                outcomes: Arc::new(outcomes),
                resolution_mode: self.config.resolution_mode,
                timeout: self.config.step_timeout,
                retry_in_slot: self.config.retry_in_slot,
                limiter: limiter.clone(),
            });

            let mut tasks = JoinSet::new();
            for step_id in batch {
                let graph = Arc::clone(&graph);
                let ctx = Arc::clone(&ctx);
                let step_id = step_id.clone();
                tasks.spawn(async move {
                    match graph.get_step(&step_id) {
                        Some(step) => execute_step(step, &ctx).await,
                        None => missing_step_run(step_id),
                    }
                });
            }

            let mut finished = HashSet::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(run) => {
                        finished.insert(run.step_id.clone());
                        if let Some(message) = record_run(store, workflow_id, run) {
                            first_error.get_or_insert(message);
                        }
                    }
                    Err(e) => error!("Workflow '{}': step task aborted: {}", workflow_id, e),
                }
            }

            // Any step whose task died without reporting is failed, not left running
            let now = Utc::now();
            store.update(workflow_id, |execution| {
                for id in batch.iter().filter(|id| !finished.contains(*id)) {
                    if let Some(outcome) = execution.outcome_mut(id) {
                        if outcome.mark_failed("step task aborted", now, Duration::ZERO) {
                            first_error.get_or_insert_with(|| {
                                format!("Step '{}' failed: step task aborted", id)
                            });
                        }
                    }
                }
            });

            if self.config.fail_fast && first_error.is_some() {
                warn!(
                    "Workflow '{}': fail-fast after batch {}, skipping remaining steps",
                    workflow_id, index
                );
                break;
            }
        }

        let elapsed = clock.elapsed();
        store.update(workflow_id, |execution| {
            let skipped = execution.skip_pending();
            if skipped > 0 {
                debug!("Workflow '{}': {} steps skipped", workflow_id, skipped);
            }

            let overall = aggregate_results(&execution.steps);
            let summary = &overall.summary;
            let (status, error) = if summary.completed_steps == summary.total_steps {
                (WorkflowStatus::Completed, None)
            } else {
                let message = first_error.clone().unwrap_or_else(|| {
                    format!(
                        "{} of {} steps did not complete",
                        summary.total_steps - summary.completed_steps,
                        summary.total_steps
                    )
                });
                (WorkflowStatus::Failed, Some(message))
            };

            execution.finish(status, error, overall, elapsed);
            match execution.status {
                WorkflowStatus::Completed => info!(
                    "Workflow '{}' completed in {:.2}s",
                    workflow_id,
                    elapsed.as_secs_f64()
                ),
                WorkflowStatus::Cancelled => info!("Workflow '{}' cancelled", workflow_id),
                _ => error!(
                    "Workflow '{}' failed: {}",
                    workflow_id,
                    execution.error.as_deref().unwrap_or("unknown error")
                ),
            }
            execution.clone()
        })
    }
}

/// Writes a finished step into the store. Returns the workflow-level error
/// message if the step failed.
fn record_run(store: &ExecutionStore, workflow_id: &str, run: StepRun) -> Option<String> {
    let StepRun {
        step_id,
        started_at,
        completed_at,
        elapsed,
        result,
        retry_count,
    } = run;

    let failure = match &result {
        Ok(_) => {
            info!(
                "Step '{}' completed in {:.2}s",
                step_id,
                elapsed.as_secs_f64()
            );
            None
        }
        Err(e) => {
            error!("Step '{}' failed: {}", step_id, e);
            Some(format!("Step '{}' failed: {}", step_id, e))
        }
    };

    store.update(workflow_id, |execution| {
        if let Some(outcome) = execution.outcome_mut(&step_id) {
            outcome.started_at = Some(started_at);
            outcome.retry_count = retry_count;
            match result {
                Ok(value) => outcome.mark_completed(value, completed_at, elapsed),
                Err(e) => outcome.mark_failed(e, completed_at, elapsed),
            };
        }
    });

    failure
}

fn missing_step_run(step_id: String) -> StepRun {
    let now = Utc::now();
    StepRun {
        result: Err(format!("step '{}' is not part of the graph", step_id)),
        step_id,
        started_at: now,
        completed_at: now,
        elapsed: Duration::ZERO,
        retry_count: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InvocationError;
    use crate::workflow::planner::plan_batches;
    use crate::workflow::state::StepStatus;
    use crate::workflow::{CapabilityRef, Step};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers from a fixed table keyed by tool name; tools starting with
    /// `fail` return an error. Every call is recorded.
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl CapabilityInvoker for Scripted {
        async fn invoke(
            &self,
            capability: &CapabilityRef,
            parameters: &Map<String, Value>,
        ) -> Result<Value, InvocationError> {
            self.calls
                .lock()
                .unwrap()
                .push((capability.tool.clone(), parameters.clone()));

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if capability.tool.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            match capability.tool.as_str() {
                "answer" => Ok(json!({"value": 42})),
                tool if tool.starts_with("fail") => {
                    Err(InvocationError::failed(capability, "scripted failure"))
                }
                _ => Ok(json!({"echo": parameters})),
            }
        }
    }

    impl Scripted {
        fn params_for(&self, tool: &str) -> Option<Map<String, Value>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(t, _)| t == tool)
                .map(|(_, p)| p.clone())
        }

        fn called(&self, tool: &str) -> bool {
            self.params_for(tool).is_some()
        }
    }

    fn cap(tool: &str) -> CapabilityRef {
        CapabilityRef::new("test", tool)
    }

    async fn run(
        engine: &Engine,
        graph: StepGraph,
    ) -> WorkflowExecution {
        let plan = plan_batches(&graph).unwrap();
        let store = ExecutionStore::new();
        store.insert_new(WorkflowExecution::new("wf", &graph));
        engine
            .execute(
                Arc::new(graph),
                &plan,
                &store,
                "wf",
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_output_mapping_flows_between_steps() {
        let invoker = Arc::new(Scripted::default());
        let engine = Engine::new(invoker.clone());
        let graph = StepGraph::from_steps(vec![
            Step::new("A", cap("answer")),
            Step::new("B", cap("consume"))
                .depends_on("A")
                .with_output_mapping("x", "A.value"),
        ]);

        let execution = run(&engine, graph).await;

        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(invoker.params_for("consume").unwrap()["x"], json!(42));
        let overall = execution.overall_result.unwrap();
        assert_eq!(overall.summary.completed_steps, 2);
        assert_eq!(overall.results["A"], json!({"value": 42}));
        assert!(execution.error.is_none());
        assert!(execution.execution_time.is_some());
    }

    #[tokio::test]
    async fn test_failure_without_fail_fast_runs_everything() {
        let invoker = Arc::new(Scripted::default());
        let engine = Engine::new(invoker.clone());
        let graph = StepGraph::from_steps(vec![
            Step::new("one", cap("first")),
            Step::new("two", cap("fail_second")).depends_on("one"),
            Step::new("three", cap("third")),
        ]);

        let execution = run(&engine, graph).await;

        assert_eq!(execution.status, WorkflowStatus::Failed);
        assert_eq!(execution.outcome("one").unwrap().status, StepStatus::Completed);
        assert_eq!(execution.outcome("two").unwrap().status, StepStatus::Failed);
        assert_eq!(execution.outcome("three").unwrap().status, StepStatus::Completed);
        assert!(execution.error.as_deref().unwrap().contains("'two'"));
        assert_eq!(
            execution.outcome("two").unwrap().error.as_deref(),
            Some("capability 'test/fail_second' failed: scripted failure")
        );
    }

    #[tokio::test]
    async fn test_fail_fast_skips_later_batches() {
        let invoker = Arc::new(Scripted::default());
        let mut engine = Engine::new(invoker.clone());
        engine.set_fail_fast(true);
        let graph = StepGraph::from_steps(vec![
            Step::new("bad", cap("fail")),
            Step::new("sibling", cap("ok")),
            Step::new("later", cap("later")).depends_on("sibling"),
        ]);

        let execution = run(&engine, graph).await;

        assert_eq!(execution.status, WorkflowStatus::Failed);
        assert_eq!(execution.outcome("sibling").unwrap().status, StepStatus::Completed);
        assert_eq!(execution.outcome("later").unwrap().status, StepStatus::Skipped);
        assert!(!invoker.called("later"));
        assert!(execution.error.unwrap().contains("'bad'"));

        let summary = execution.overall_result.unwrap().summary;
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.skipped_steps, 1);
    }

    #[tokio::test]
    async fn test_max_parallel_limits_concurrency() {
        let invoker = Arc::new(Scripted {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let mut engine = Engine::new(invoker.clone());
        engine.set_max_parallel(Some(2));
        let graph = StepGraph::from_steps(
            (0..6).map(|i| Step::new(format!("s{}", i), cap("work"))).collect(),
        );

        let execution = run(&engine, graph).await;

        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert!(invoker.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(invoker.calls.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_next_batch_waits_for_unrelated_slow_step() {
        let invoker = Arc::new(Scripted::default());
        let engine = Engine::new(invoker.clone());
        let graph = StepGraph::from_steps(vec![
            Step::new("A", cap("slow")),
            Step::new("B", cap("quick")),
            Step::new("C", cap("after_quick")).depends_on("B"),
        ]);

        let execution = run(&engine, graph).await;

        assert_eq!(execution.status, WorkflowStatus::Completed);
        let a_done = execution.outcome("A").unwrap().completed_at.unwrap();
        let c_start = execution.outcome("C").unwrap().started_at.unwrap();
        assert!(c_start >= a_done, "C started before A finished");

        let order: Vec<String> = invoker
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(tool, _)| tool.clone())
            .collect();
        assert_eq!(order.last().map(String::as_str), Some("after_quick"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_first_batch() {
        let invoker = Arc::new(Scripted::default());
        let engine = Engine::new(invoker.clone());
        let graph = StepGraph::from_steps(vec![Step::new("a", cap("x"))]);
        let plan = plan_batches(&graph).unwrap();

        let store = ExecutionStore::new();
        store.insert_new(WorkflowExecution::new("wf", &graph));
        store.update("wf", |e| e.cancel());
        let token = CancellationToken::new();
        token.cancel();

        let execution = engine
            .execute(Arc::new(graph), &plan, &store, "wf", &token)
            .await
            .unwrap();

        assert_eq!(execution.status, WorkflowStatus::Cancelled);
        assert_eq!(execution.outcome("a").unwrap().status, StepStatus::Skipped);
        assert!(execution.completed_at.is_some());
        assert!(!invoker.called("x"));
    }

    #[tokio::test]
    async fn test_globals_substituted_at_run_time() {
        let invoker = Arc::new(Scripted::default());
        let engine = Engine::new(invoker.clone());
        let graph = StepGraph::from_steps(vec![
            Step::new("a", cap("greet")).with_parameter("who", "$name")
        ])
        .with_variable("name", "world");

        run(&engine, graph).await;
        assert_eq!(invoker.params_for("greet").unwrap()["who"], json!("world"));
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert!(!config.fail_fast);
        assert!(config.retry_in_slot);
        assert!(config.max_parallel.is_none());
        assert!(config.step_timeout.is_none());
        assert_eq!(config.resolution_mode, ResolutionMode::Permissive);
    }

    #[test]
    fn test_engine_config_from_yaml() {
        let config: EngineConfig =
            serde_yaml::from_str("fail_fast: true\nstep_timeout: 1500\nresolution_mode: strict\n")
                .unwrap();
        assert!(config.fail_fast);
        assert_eq!(config.step_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.resolution_mode, ResolutionMode::Strict);
        assert!(config.retry_in_slot);
    }
}
