//! Step Graph Validation
//!
//! Checks a graph before anything runs and reports every problem at once:
//! - Structural completeness (ids, capabilities)
//! - Dependency cycles
//! - References to steps that don't exist
//! - Capabilities missing from the catalog
//! - Parameter and output-mapping shape
//! - Retry configuration
//!
//! Validation never fails with `Err`; problems are collected into a
//! [`ValidationReport`]. Errors make the graph invalid, warnings do not.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{OutputRef, StepGraph};
use crate::capability::CapabilityCatalog;
use crate::execution::resolver::{variable_reference, ResolutionMode};

/// Which checks [`validate_graph`] performs. Everything is on by default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationOptions {
    pub check_structure: bool,
    pub check_cycles: bool,
    pub check_dependencies: bool,
    pub check_capabilities: bool,
    pub check_parameters: bool,
    pub check_retry_config: bool,
    /// In strict mode unresolvable references are errors instead of warnings
    pub resolution_mode: ResolutionMode,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            check_structure: true,
            check_cycles: true,
            check_dependencies: true,
            check_capabilities: true,
            check_parameters: true,
            check_retry_config: true,
            resolution_mode: ResolutionMode::Permissive,
        }
    }
}

/// Problems that make a graph invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Chain has no steps")]
    EmptyGraph,
    #[error("Step #{index} has an empty or whitespace-only ID")]
    EmptyStepId { index: usize },
    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),
    #[error("Step '{0}' has no capability tool specified")]
    MissingTool(String),
    #[error("Step '{0}' has no capability server specified")]
    MissingServer(String),
    #[error("Circular dependency: step '{from}' depends on '{to}', which leads back to '{from}'")]
    CircularDependency { from: String, to: String },
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("Step '{step}' uses capability '{capability}', which is not in the catalog")]
    UnknownCapability { step: String, capability: String },
    #[error("Step '{0}' has retry_on_failure set but no max_retries")]
    MissingMaxRetries(String),
    #[error("Step '{step}': parameter '{parameter}' refers to undefined variable '${name}'")]
    UnresolvedVariable {
        step: String,
        parameter: String,
        name: String,
    },
    #[error("Step '{step}': parameter '{parameter}' maps from '{source_step}', which is not one of its dependencies")]
    UnreachableOutputSource {
        step: String,
        parameter: String,
        source_step: String,
    },
}

/// Advisory findings that don't block execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationWarning {
    #[error("Step '{0}' has a parameter with an empty name")]
    EmptyParameterName(String),
    #[error("Step '{step}': output mapping for '{parameter}' refers to unknown step '{source_step}'")]
    UnknownOutputSource {
        step: String,
        parameter: String,
        source_step: String,
    },
    #[error("Step '{step}': output mapping '{parameter}: {reference}' should be <stepId>.<outputKey>")]
    MalformedOutputMapping {
        step: String,
        parameter: String,
        reference: String,
    },
    #[error("Step '{step}' lists dependency '{dependency}', which does not match any step")]
    DanglingDependency { step: String, dependency: String },
    #[error("Step '{step}' lists dependency '{dependency}' more than once")]
    DuplicateDependency { step: String, dependency: String },
    #[error("Step '{step}': parameter '{parameter}' refers to undefined variable '${name}' and will be passed literally")]
    UnresolvedVariable {
        step: String,
        parameter: String,
        name: String,
    },
    #[error("Step '{step}': parameter '{parameter}' maps from '{source_step}', which is not one of its dependencies")]
    UnorderedOutputSource {
        step: String,
        parameter: String,
        source_step: String,
    },
}

/// Outcome of validating a graph.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_findings(errors: Vec<ValidationError>, warnings: Vec<ValidationWarning>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors: errors.iter().map(ToString::to_string).collect(),
            warnings: warnings.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Validates `graph` against `catalog`, running the checks enabled in `options`.
pub fn validate_graph(
    graph: &StepGraph,
    catalog: &dyn CapabilityCatalog,
    options: &ValidationOptions,
) -> ValidationReport {
    info!("Validating chain with {} steps", graph.len());

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if graph.is_empty() {
        if options.check_structure {
            errors.push(ValidationError::EmptyGraph);
        }
        return ValidationReport::from_findings(errors, warnings);
    }

    let step_ids = graph.step_ids();

    if options.check_structure {
        errors.extend(check_structure(graph));
    }

    if options.check_cycles {
        errors.extend(
            find_cycles(graph)
                .into_iter()
                .map(|(from, to)| ValidationError::CircularDependency { from, to }),
        );
    }

    for step in &graph.steps {
        if options.check_dependencies {
            for dep in step.unique_dependencies() {
                if !step_ids.contains(dep) {
                    errors.push(ValidationError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        if options.check_capabilities && !catalog.contains(&step.capability) {
            errors.push(ValidationError::UnknownCapability {
                step: step.id.clone(),
                capability: step.capability.to_string(),
            });
        }

        if options.check_retry_config && step.retry_on_failure && step.max_retries.is_none() {
            errors.push(ValidationError::MissingMaxRetries(step.id.clone()));
        }
    }

    if options.check_parameters {
        warnings.extend(check_parameters(graph, &step_ids));
    }

    let (strict_errors, reference_warnings) = check_references(graph, &step_ids);
    if options.resolution_mode == ResolutionMode::Strict {
        errors.extend(strict_errors);
    } else if options.check_parameters {
        warnings.extend(reference_warnings);
    }

    let report = ValidationReport::from_findings(errors, warnings);
    if report.valid {
        info!(
            "Chain validated: {} steps, {} warnings",
            graph.len(),
            report.warnings.len()
        );
    } else {
        warn!("Chain is invalid: {} errors", report.errors.len());
    }
    for warning in &report.warnings {
        debug!("Validation warning: {}", warning);
    }
    report
}

/// Ids, duplicate ids and capability names.
fn check_structure(graph: &StepGraph) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut reported: HashSet<&str> = HashSet::new();

    for (index, step) in graph.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            errors.push(ValidationError::EmptyStepId { index });
            continue;
        }

        if !seen.insert(step.id.as_str()) && reported.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }

        if step.capability.tool.trim().is_empty() {
            errors.push(ValidationError::MissingTool(step.id.clone()));
        }
        if step.capability.server.trim().is_empty() {
            errors.push(ValidationError::MissingServer(step.id.clone()));
        }
    }

    errors
}

/// Advisory checks on parameter names, mapping shape and dependency lists.
fn check_parameters(graph: &StepGraph, step_ids: &HashSet<&str>) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    for step in &graph.steps {
        if step.parameters.keys().any(|k| k.trim().is_empty()) {
            warnings.push(ValidationWarning::EmptyParameterName(step.id.clone()));
        }

        for (parameter, reference) in &step.output_mapping {
            match OutputRef::parse(reference) {
                None => warnings.push(ValidationWarning::MalformedOutputMapping {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    reference: reference.clone(),
                }),
                Some(output) if !step_ids.contains(output.step_id) => {
                    warnings.push(ValidationWarning::UnknownOutputSource {
                        step: step.id.clone(),
                        parameter: parameter.clone(),
                        source_step: output.step_id.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        let mut listed = HashSet::new();
        for dep in &step.depends_on {
            if !listed.insert(dep.as_str()) {
                warnings.push(ValidationWarning::DuplicateDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            } else if !step_ids.contains(dep.as_str()) {
                warnings.push(ValidationWarning::DanglingDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    warnings
}

/// References that the resolver would be unable to satisfy at run time:
/// undefined `$name` variables, and output mappings whose source step is
/// present but not a (transitive) dependency. Returned both as strict-mode
/// errors and as permissive-mode warnings.
fn check_references(
    graph: &StepGraph,
    step_ids: &HashSet<&str>,
) -> (Vec<ValidationError>, Vec<ValidationWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for step in &graph.steps {
        for (parameter, value) in &step.parameters {
            let Some(name) = variable_reference(value) else {
                continue;
            };
            if !graph.variables.contains_key(name) {
                errors.push(ValidationError::UnresolvedVariable {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    name: name.to_string(),
                });
                warnings.push(ValidationWarning::UnresolvedVariable {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    name: name.to_string(),
                });
            }
        }

        if step.output_mapping.is_empty() {
            continue;
        }
        let ancestors = graph.ancestors_of(&step.id);
        for (parameter, reference) in &step.output_mapping {
            let Some(output) = OutputRef::parse(reference) else {
                continue;
            };
            if step_ids.contains(output.step_id) && !ancestors.contains(output.step_id) {
                errors.push(ValidationError::UnreachableOutputSource {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    source_step: output.step_id.to_string(),
                });
                warnings.push(ValidationWarning::UnorderedOutputSource {
                    step: step.id.clone(),
                    parameter: parameter.clone(),
                    source_step: output.step_id.to_string(),
                });
            }
        }
    }

    (errors, warnings)
}

/// Finds every back-edge in the dependency relation.
///
/// An edge `A -> B` means "A depends on B". Steps are visited once each with
/// white/gray/black colouring; a dependency on a gray step closes a cycle and
/// is reported as `(A, B)`. Dependencies on ids that aren't in the graph are
/// ignored here. For duplicate ids only the first occurrence is followed.
pub fn find_cycles(graph: &StepGraph) -> Vec<(String, String)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, step) in graph.steps.iter().enumerate() {
        index.entry(step.id.as_str()).or_insert(i);
    }

    let edges: Vec<Vec<usize>> = graph
        .steps
        .iter()
        .map(|step| {
            step.unique_dependencies()
                .into_iter()
                .filter_map(|dep| index.get(dep).copied())
                .collect()
        })
        .collect();

    let mut color = vec![Color::White; graph.steps.len()];
    let mut seen_edges: HashSet<(usize, usize)> = HashSet::new();
    let mut back_edges = Vec::new();

    for start in 0..graph.steps.len() {
        if color[start] != Color::White || index.get(graph.steps[start].id.as_str()) != Some(&start)
        {
            continue;
        }

        // Iterative DFS: (node, next edge to explore)
        let mut stack = vec![(start, 0usize)];
        color[start] = Color::Gray;

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            match edges[node].get(next) {
                Some(&dep) => {
                    frame.1 += 1;
                    match color[dep] {
                        Color::White => {
                            color[dep] = Color::Gray;
                            stack.push((dep, 0));
                        }
                        Color::Gray => {
                            if seen_edges.insert((node, dep)) {
                                back_edges.push((
                                    graph.steps[node].id.clone(),
                                    graph.steps[dep].id.clone(),
                                ));
                            }
                        }
                        Color::Black => {}
                    }
                }
                None => {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }
    }

    if !back_edges.is_empty() {
        debug!("Found {} circular dependencies", back_edges.len());
    }
    back_edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::OpenCatalog;
    use crate::workflow::{CapabilityRef, Step};
    use std::collections::BTreeSet;

    fn cap(tool: &str) -> CapabilityRef {
        CapabilityRef::new("srv", tool)
    }

    fn validate(graph: &StepGraph) -> ValidationReport {
        validate_graph(graph, &OpenCatalog, &ValidationOptions::default())
    }

    #[test]
    fn test_valid_graph() {
        let graph = StepGraph::from_steps(vec![
            Step::new("a", cap("fetch")),
            Step::new("b", cap("parse"))
                .depends_on("a")
                .with_output_mapping("input", "a.body"),
        ]);

        let report = validate(&graph);
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_empty_graph() {
        let report = validate(&StepGraph::new());
        assert!(!report.valid);
        assert!(report.errors[0].contains("no steps"));
    }

    #[test]
    fn test_structural_errors() {
        let graph = StepGraph::from_steps(vec![
            Step::new("", cap("x")),
            Step::new("dup", cap("x")),
            Step::new("dup", cap("x")),
            Step::new("dup", cap("x")),
            Step::new("bare", CapabilityRef::new("", "")),
        ]);

        let report = validate(&graph);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("Step #0")));
        assert_eq!(
            report
                .errors
                .iter()
                .filter(|e| e.contains("Duplicate step ID"))
                .count(),
            1
        );
        assert!(report.errors.iter().any(|e| e.contains("no capability tool")));
        assert!(report.errors.iter().any(|e| e.contains("no capability server")));
    }

    #[test]
    fn test_two_step_cycle_names_both_ends() {
        let graph = StepGraph::from_steps(vec![
            Step::new("a", cap("x")).depends_on("b"),
            Step::new("b", cap("x")).depends_on("a"),
        ]);

        let report = validate(&graph);
        assert!(!report.valid);
        let cycle = report
            .errors
            .iter()
            .find(|e| e.contains("Circular"))
            .unwrap();
        assert!(cycle.contains("'a'") && cycle.contains("'b'"));
    }

    #[test]
    fn test_find_cycles_distinct_back_edges() {
        let graph = StepGraph::from_steps(vec![
            Step::new("a", cap("x")).depends_on("b"),
            Step::new("b", cap("x")).depends_on("c"),
            Step::new("c", cap("x")).depends_on("a"),
            Step::new("d", cap("x")).depends_on("d"),
            Step::new("e", cap("x")).depends_on("a"),
        ]);

        let cycles: BTreeSet<_> = find_cycles(&graph).into_iter().collect();
        assert_eq!(cycles.len(), 2);
        assert!(cycles.contains(&("c".to_string(), "a".to_string())));
        assert!(cycles.contains(&("d".to_string(), "d".to_string())));
    }

    #[test]
    fn test_find_cycles_acyclic_diamond() {
        let graph = StepGraph::from_steps(vec![
            Step::new("a", cap("x")),
            Step::new("b", cap("x")).depends_on("a"),
            Step::new("c", cap("x")).depends_on("a"),
            Step::new("d", cap("x")).depends_on("b").depends_on("c"),
        ]);
        assert!(find_cycles(&graph).is_empty());
    }

    #[test]
    fn test_unknown_dependency_is_error_and_warning() {
        let graph = StepGraph::from_steps(vec![Step::new("a", cap("x")).depends_on("ghost")]);

        let report = validate(&graph);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("unknown step 'ghost'")));
        assert!(report.warnings.iter().any(|w| w.contains("'ghost'")));
    }

    #[test]
    fn test_unknown_capability() {
        let catalog: BTreeSet<CapabilityRef> = [cap("known")].into_iter().collect();
        let graph = StepGraph::from_steps(vec![
            Step::new("ok", cap("known")),
            Step::new("bad", cap("unknown")),
        ]);

        let report = validate_graph(&graph, &catalog, &ValidationOptions::default());
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("srv/unknown"));
        assert!(report.errors[0].contains("'bad'"));
    }

    #[test]
    fn test_incomplete_capability_missing_without_structure_check() {
        let catalog: BTreeSet<CapabilityRef> = [cap("known")].into_iter().collect();
        let graph = StepGraph::from_steps(vec![Step::new("a", CapabilityRef::new("srv", ""))]);
        let options = ValidationOptions {
            check_structure: false,
            ..Default::default()
        };

        let report = validate_graph(&graph, &catalog, &options);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("'a'"));
    }

    #[test]
    fn test_capability_check_can_be_disabled() {
        let catalog: BTreeSet<CapabilityRef> = BTreeSet::new();
        let graph = StepGraph::from_steps(vec![Step::new("a", cap("anything"))]);
        let options = ValidationOptions {
            check_capabilities: false,
            ..Default::default()
        };

        assert!(validate_graph(&graph, &catalog, &options).valid);
    }

    #[test]
    fn test_retry_without_max_retries() {
        let mut step = Step::new("a", cap("x"));
        step.retry_on_failure = true;
        let report = validate(&StepGraph::from_steps(vec![step]));

        assert!(!report.valid);
        assert!(report.errors[0].contains("max_retries"));
    }

    #[test]
    fn test_mapping_warnings() {
        let graph = StepGraph::from_steps(vec![
            Step::new("a", cap("x")),
            Step::new("b", cap("x"))
                .depends_on("a")
                .depends_on("a")
                .with_parameter("", 1)
                .with_output_mapping("p", "nowhere.value")
                .with_output_mapping("q", "no-dot"),
        ]);

        let report = validate(&graph);
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("empty name")));
        assert!(report.warnings.iter().any(|w| w.contains("unknown step 'nowhere'")));
        assert!(report.warnings.iter().any(|w| w.contains("<stepId>.<outputKey>")));
        assert!(report.warnings.iter().any(|w| w.contains("more than once")));
    }

    #[test]
    fn test_strict_mode_turns_gaps_into_errors() {
        let graph = StepGraph::from_steps(vec![
            Step::new("a", cap("x")),
            Step::new("b", cap("x"))
                .with_parameter("city", "$city")
                .with_output_mapping("x", "a.value"),
        ]);

        let permissive = validate(&graph);
        assert!(permissive.valid);
        assert_eq!(permissive.warnings.len(), 2);

        let strict = validate_graph(
            &graph,
            &OpenCatalog,
            &ValidationOptions {
                resolution_mode: ResolutionMode::Strict,
                ..Default::default()
            },
        );
        assert!(!strict.valid);
        assert!(strict.errors.iter().any(|e| e.contains("$city")));
        assert!(strict.errors.iter().any(|e| e.contains("not one of its dependencies")));
    }

    #[test]
    fn test_strict_mode_accepts_transitive_source() {
        let graph = StepGraph::from_steps(vec![
            Step::new("a", cap("x")),
            Step::new("b", cap("x")).depends_on("a"),
            Step::new("c", cap("x"))
                .depends_on("b")
                .with_output_mapping("x", "a.value"),
        ])
        .with_variable("unused", 1);

        let options = ValidationOptions {
            resolution_mode: ResolutionMode::Strict,
            ..Default::default()
        };
        assert!(validate_graph(&graph, &OpenCatalog, &options).valid);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::EmptyGraph;
        assert_eq!(err.to_string(), "Chain has no steps");

        let err = ValidationError::CircularDependency {
            from: "a".into(),
            to: "b".into(),
        };
        assert!(err.to_string().contains("'a'"));
        assert!(err.to_string().contains("'b'"));
    }
}
