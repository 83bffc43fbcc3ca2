//! Result aggregation.
//!
//! Rolls the per-step outcomes of a run into one result map plus summary
//! counts.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::serde_ext::duration_ms;
use crate::workflow::state::{StepOutcome, StepStatus};

/// Counts and timing over all steps of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionSummary {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,

    /// Sum of per-step execution times. Parallel steps overlap, so this can
    /// exceed the workflow's wall-clock time.
    #[serde(with = "duration_ms")]
    pub total_step_time: Duration,
}

/// Merged view of a finished run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OverallResult {
    /// Step id -> result, completed steps only
    pub results: BTreeMap<String, Value>,
    pub summary: ExecutionSummary,
}

/// Merges step outcomes into an [`OverallResult`].
pub fn aggregate_results(outcomes: &[StepOutcome]) -> OverallResult {
    let mut overall = OverallResult::default();
    overall.summary.total_steps = outcomes.len();

    for outcome in outcomes {
        match outcome.status {
            StepStatus::Completed => {
                overall.summary.completed_steps += 1;
                overall.results.insert(
                    outcome.step_id.clone(),
                    outcome.result.clone().unwrap_or(Value::Null),
                );
            }
            StepStatus::Failed => overall.summary.failed_steps += 1,
            StepStatus::Skipped => overall.summary.skipped_steps += 1,
            StepStatus::Pending | StepStatus::Running => {}
        }

        if let Some(elapsed) = outcome.execution_time {
            overall.summary.total_step_time += elapsed;
        }
    }

    overall
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn finished(id: &str, ok: bool, millis: u64) -> StepOutcome {
        let mut outcome = StepOutcome::pending(id);
        let now = Utc::now();
        outcome.mark_running(now);
        if ok {
            outcome.mark_completed(json!({"id": id}), now, Duration::from_millis(millis));
        } else {
            outcome.mark_failed("boom", now, Duration::from_millis(millis));
        }
        outcome
    }

    #[test]
    fn test_aggregate_counts_and_results() {
        let mut skipped = StepOutcome::pending("d");
        skipped.mark_skipped();

        let outcomes = vec![
            finished("a", true, 100),
            finished("b", false, 50),
            finished("c", true, 25),
            skipped,
        ];
        let overall = aggregate_results(&outcomes);

        assert_eq!(overall.summary.total_steps, 4);
        assert_eq!(overall.summary.completed_steps, 2);
        assert_eq!(overall.summary.failed_steps, 1);
        assert_eq!(overall.summary.skipped_steps, 1);
        assert_eq!(overall.summary.total_step_time, Duration::from_millis(175));

        assert_eq!(overall.results.len(), 2);
        assert_eq!(overall.results["a"], json!({"id": "a"}));
        assert!(!overall.results.contains_key("b"));
    }

    #[test]
    fn test_aggregate_empty() {
        let overall = aggregate_results(&[]);
        assert_eq!(overall.summary, ExecutionSummary::default());
        assert!(overall.results.is_empty());
    }

    #[test]
    fn test_summary_serializes_millis() {
        let overall = aggregate_results(&[finished("a", true, 1500)]);
        let value = serde_json::to_value(&overall).unwrap();
        assert_eq!(value["summary"]["total_step_time"], 1500);
    }
}
