//! Parameter Resolution
//!
//! Computes the concrete parameters for one step just before it is invoked:
//!
//! 1. Start from a copy of the declared parameters
//! 2. Replace `$name` strings with the graph variable `name`
//! 3. Overwrite mapped parameters with values from completed prior steps
//!
//! In [`ResolutionMode::Permissive`] anything that cannot be resolved is
//! left as it was after the previous stage. [`ResolutionMode::Strict`] turns
//! each gap into a [`ResolutionError`].

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workflow::model::{OutputRef, Step};
use crate::workflow::state::{StepOutcome, StepStatus};

/// How unresolved references are handled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Unresolved references keep their literal value
    #[default]
    Permissive,
    /// Unresolved references are errors
    Strict,
}

/// A reference that could not be resolved in strict mode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("step '{step}': parameter '{parameter}' refers to undefined variable '${name}'")]
    UndefinedVariable {
        step: String,
        parameter: String,
        name: String,
    },
    #[error("step '{step}': parameter '{parameter}' maps from '{source_step}', which has not completed")]
    SourceNotCompleted {
        step: String,
        parameter: String,
        source_step: String,
    },
    #[error("step '{step}': parameter '{parameter}' maps from '{source_step}.{key}', but that output does not exist")]
    MissingOutputKey {
        step: String,
        parameter: String,
        source_step: String,
        key: String,
    },
    #[error("step '{step}': output mapping '{parameter}: {reference}' is not of the form <stepId>.<outputKey>")]
    MalformedReference {
        step: String,
        parameter: String,
        reference: String,
    },
}

/// Returns the variable name if `value` is a `$name` reference.
pub fn variable_reference(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => s.strip_prefix('$').filter(|name| !name.is_empty()),
        _ => None,
    }
}

/// Looks up `key` in a step result: first as a literal key, then as a dotted
/// path through nested objects and arrays (`items.0.name`).
pub fn lookup_output<'a>(result: &'a Value, key: &str) -> Option<&'a Value> {
    if let Some(value) = result.get(key) {
        return Some(value);
    }
    if !key.contains('.') {
        return None;
    }

    key.split('.').try_fold(result, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolves the parameters of `step`.
///
/// `outcomes` may contain every outcome of the run; only completed ones are
/// consulted.
pub fn resolve_parameters(
    step: &Step,
    variables: &Map<String, Value>,
    outcomes: &[StepOutcome],
    mode: ResolutionMode,
) -> Result<Map<String, Value>, ResolutionError> {
    let strict = mode == ResolutionMode::Strict;
    let mut resolved = step.parameters.clone();

    for (parameter, value) in resolved.iter_mut() {
        let Some(name) = variable_reference(value).map(str::to_string) else {
            continue;
        };
        match variables.get(&name) {
            Some(replacement) => *value = replacement.clone(),
            None if strict => {
                return Err(ResolutionError::UndefinedVariable {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    name,
                })
            }
            None => debug!(
                "Step '{}': variable '${}' is undefined, keeping literal",
                step.id, name
            ),
        }
    }

    for (parameter, reference) in &step.output_mapping {
        let Some(output) = OutputRef::parse(reference) else {
            if strict {
                return Err(ResolutionError::MalformedReference {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    reference: reference.clone(),
                });
            }
            debug!(
                "Step '{}': ignoring malformed mapping '{}: {}'",
                step.id, parameter, reference
            );
            continue;
        };

        let source = outcomes
            .iter()
            .find(|o| o.step_id == output.step_id && o.status == StepStatus::Completed);

        let Some(source) = source else {
            if strict {
                return Err(ResolutionError::SourceNotCompleted {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    source_step: output.step_id.to_string(),
                });
            }
            debug!(
                "Step '{}': source '{}' has no completed result for '{}'",
                step.id, output.step_id, parameter
            );
            continue;
        };

        match source
            .result
            .as_ref()
            .and_then(|result| lookup_output(result, output.key))
        {
            Some(value) => {
                resolved.insert(parameter.clone(), value.clone());
            }
            None if strict => {
                return Err(ResolutionError::MissingOutputKey {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    source_step: output.step_id.to_string(),
                    key: output.key.to_string(),
                })
            }
            None => debug!(
                "Step '{}': '{}' has no output '{}'",
                step.id, output.step_id, output.key
            ),
        }
    }

    Ok(resolved)
}
