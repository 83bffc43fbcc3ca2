//! Individual Step Execution
//!
//! Runs one step inside its batch slot:
//! - Parameter resolution against the outcomes known when the batch began
//! - Invocation through the configured [`CapabilityInvoker`]
//! - Optional per-invocation timeout
//! - In-slot retries when the step allows them
//!
//! The result is returned as a [`StepRun`]; recording it into the workflow
//! execution is the engine's job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use super::resolver::{resolve_parameters, ResolutionMode};
use crate::capability::{CapabilityInvoker, InvocationError};
use crate::workflow::state::StepOutcome;
use crate::workflow::Step;

/// Everything a step needs from its surroundings.
pub struct StepContext {
    pub invoker: Arc<dyn CapabilityInvoker>,
    /// Graph variables for `$name` substitution
    pub variables: Arc<Map<String, Value>>,
    /// Terminal outcomes recorded before the current batch began
    pub outcomes: Arc<Vec<StepOutcome>>,
    pub resolution_mode: ResolutionMode,
    /// Upper bound for a single invocation attempt
    pub timeout: Option<Duration>,
    /// Whether failing steps are re-invoked up to their `max_retries`
    pub retry_in_slot: bool,
    /// Shared concurrency limit, if any
    pub limiter: Option<Arc<Semaphore>>,
}

/// What happened when a step ran.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub step_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Invoker result, or the error message of the last attempt
    pub result: Result<Value, String>,
    /// Extra attempts made after the first failure
    pub retry_count: u32,
}

/// Executes a single step.
///
/// If parameter resolution fails the capability is never invoked. Otherwise
/// the step is invoked once, plus up to `max_retries` more times when
/// `retry_on_failure` is set and the context allows in-slot retries.
pub async fn execute_step(step: &Step, ctx: &StepContext) -> StepRun {
    // Held until the step finishes
    let _permit = match &ctx.limiter {
        Some(limiter) => limiter.acquire().await.ok(),
        None => None,
    };

    let started_at = Utc::now();
    let clock = Instant::now();

    let (result, retry_count) = match resolve_parameters(
        step,
        &ctx.variables,
        &ctx.outcomes,
        ctx.resolution_mode,
    ) {
        Ok(parameters) => invoke_with_retries(step, &parameters, ctx).await,
        Err(e) => {
            warn!("Step '{}' not invoked: {}", step.id, e);
            (Err(e.to_string()), 0)
        }
    };

    StepRun {
        step_id: step.id.clone(),
        started_at,
        completed_at: Utc::now(),
        elapsed: clock.elapsed(),
        result,
        retry_count,
    }
}

async fn invoke_with_retries(
    step: &Step,
    parameters: &Map<String, Value>,
    ctx: &StepContext,
) -> (Result<Value, String>, u32) {
    let attempts = if ctx.retry_in_slot {
        step.max_attempts()
    } else {
        1
    };

    let mut retries = 0;
    loop {
        match invoke_once(step, parameters, ctx).await {
            Ok(value) => {
                debug!("Step '{}' completed after {} retries", step.id, retries);
                return (Ok(value), retries);
            }
            Err(e) if retries + 1 < attempts => {
                retries += 1;
                warn!(
                    "Step '{}' failed ({}), retrying ({}/{})",
                    step.id,
                    e,
                    retries,
                    attempts - 1
                );
            }
            Err(e) => return (Err(e.to_string()), retries),
        }
    }
}

async fn invoke_once(
    step: &Step,
    parameters: &Map<String, Value>,
    ctx: &StepContext,
) -> Result<Value, InvocationError> {
    let call = ctx.invoker.invoke(&step.capability, parameters);
    match ctx.timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| {
                Err(InvocationError::Timeout {
                    capability: step.capability.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }),
        None => call.await,
    }
}
