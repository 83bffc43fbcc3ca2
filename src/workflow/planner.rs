//! Batch Planning
//!
//! Turns a step graph into an ordered list of batches:
//! - Every step lands in exactly one batch
//! - A step's dependencies all sit in earlier batches
//! - Each batch holds every step that is ready at that level
//! - Steps within a batch keep their declaration order
//!
//! Steps in the same batch have no ordering constraints between them and may
//! run concurrently.

use std::collections::HashMap;

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::StepGraph;

/// Why a graph could not be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Steps whose dependencies can never be satisfied (a cycle or a
    /// reference to a missing step).
    #[error("cannot schedule steps {}: unresolved or circular dependencies", format_ids(.stuck))]
    Unschedulable { stuck: Vec<String> },
    #[error("duplicate step ID '{0}'")]
    DuplicateStepId(String),
}

fn format_ids(ids: &[String]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", id))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Ordered sequence of parallel-safe batches.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    batches: Vec<Vec<String>>,
}

impl BatchPlan {
    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total number of scheduled steps.
    pub fn step_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Size of the widest batch.
    pub fn max_width(&self) -> usize {
        self.batches.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Index of the batch containing `step_id`.
    pub fn position_of(&self, step_id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|id| id == step_id))
    }
}

/// Levels the graph into batches (Kahn's algorithm, one level at a time).
///
/// Fails with [`ScheduleError::Unschedulable`] naming every step that could
/// not be placed; steps are never dropped.
pub fn plan_batches(graph: &StepGraph) -> Result<BatchPlan, ScheduleError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, step) in graph.steps.iter().enumerate() {
        if index.insert(step.id.as_str(), i).is_some() {
            error!("Cannot schedule chain: duplicate step ID '{}'", step.id);
            return Err(ScheduleError::DuplicateStepId(step.id.clone()));
        }
    }

    let n = graph.steps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, step) in graph.steps.iter().enumerate() {
        for dep in step.unique_dependencies() {
            in_degree[i] += 1;
            match index.get(dep) {
                // A self-dependency is never released
                Some(&j) if j != i => dependents[j].push(i),
                _ => {}
            }
        }
    }

    let mut batches = Vec::new();
    let mut placed = vec![false; n];
    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();

    while !ready.is_empty() {
        let mut next = Vec::new();
        for &i in &ready {
            placed[i] = true;
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }

        let batch: Vec<String> = ready.iter().map(|&i| graph.steps[i].id.clone()).collect();
        debug!("Batch {}: {:?}", batches.len(), batch);
        batches.push(batch);

        next.sort_unstable();
        ready = next;
    }

    let stuck: Vec<String> = (0..n)
        .filter(|&i| !placed[i])
        .map(|i| graph.steps[i].id.clone())
        .collect();

    if !stuck.is_empty() {
        error!(
            "Cannot schedule chain: {} steps have unresolved or circular dependencies: {:?}",
            stuck.len(),
            stuck
        );
        return Err(ScheduleError::Unschedulable { stuck });
    }

    info!("Planned {} steps into {} batches", n, batches.len());
    Ok(BatchPlan { batches })
}
