//! Static chain analysis.
//!
//! Grades a step graph without running it: estimated cost, complexity
//! spread, likely bottlenecks, how much of the chain could run in parallel,
//! structural defects, and advisory suggestions.

use std::collections::HashSet;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityCatalog;
use crate::workflow::validator::find_cycles;
use crate::workflow::{CapabilityRef, StepGraph};

/// Share of steps reported as bottlenecks.
const BOTTLENECK_SHARE: f64 = 0.2;
/// Highest complexity counted as low.
const LOW_COMPLEXITY_MAX: u32 = 2;
/// Highest complexity counted as medium.
const MEDIUM_COMPLEXITY_MAX: u32 = 4;
/// Average complexity above which the chain is flagged.
const HIGH_AVERAGE_COMPLEXITY: f64 = 4.0;
/// Fraction of retrying steps above which the chain is flagged.
const RETRY_HEAVY_RATIO: f64 = 0.3;
/// Step count above which the chain is flagged as long.
const LONG_CHAIN_STEPS: usize = 10;
/// Total estimated duration above which splitting is suggested.
const SPLIT_CHAIN_MS: u64 = 30_000;
/// Dependency count above which a step is flagged.
const MAX_FAN_IN: usize = 3;
/// Parallelization potential below which a hint is given.
const LOW_PARALLELIZATION: f64 = 0.5;

/// Which parts of the analysis run. Everything is on by default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AnalysisOptions {
    pub detect_cycles: bool,
    pub detect_unresolved: bool,
    /// Only used when a catalog is supplied
    pub check_capabilities: bool,
    pub suggestions: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            detect_cycles: true,
            detect_unresolved: true,
            check_capabilities: true,
            suggestions: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionMetrics {
    /// Sum of every step's estimated duration
    pub total_estimated_duration_ms: u64,
    pub average_complexity: f64,
    /// Slowest steps by estimated duration
    pub bottlenecks: Vec<String>,
    /// Fraction of steps whose dependencies are satisfied in declaration order
    pub parallelization_potential: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComplexityDistribution {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ComplexityAnalysis {
    pub average: f64,
    pub distribution: ComplexityDistribution,
    pub risk_factors: Vec<String>,
}

/// A `step -> dependency` edge.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub step: String,
    pub dependency: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MissingCapability {
    pub step: String,
    pub capability: CapabilityRef,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralFindings {
    /// Back-edges closing a cycle
    pub circular_dependencies: Vec<DependencyEdge>,
    /// Dependencies on ids that are not in the graph
    pub unresolved_dependencies: Vec<DependencyEdge>,
    pub missing_capabilities: Vec<MissingCapability>,
}

impl StructuralFindings {
    pub fn is_clean(&self) -> bool {
        self.circular_dependencies.is_empty()
            && self.unresolved_dependencies.is_empty()
            && self.missing_capabilities.is_empty()
    }
}

/// Full static analysis of a chain.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChainAnalysis {
    pub step_count: usize,
    pub metrics: ExecutionMetrics,
    pub complexity: ComplexityAnalysis,
    pub structure: StructuralFindings,
    pub suggestions: Vec<String>,
}

impl ChainAnalysis {
    /// True when no structural defect would stop the chain from running.
    pub fn is_executable(&self) -> bool {
        self.step_count > 0 && self.structure.is_clean()
    }
}

/// Analyzes `graph` without executing it.
pub fn analyze_chain(
    graph: &StepGraph,
    catalog: Option<&dyn CapabilityCatalog>,
    options: &AnalysisOptions,
) -> ChainAnalysis {
    let metrics = execution_metrics(graph);
    let complexity = complexity_analysis(graph, metrics.average_complexity);

    let mut structure = StructuralFindings::default();
    if options.detect_cycles {
        structure.circular_dependencies = find_cycles(graph)
            .into_iter()
            .map(|(step, dependency)| DependencyEdge { step, dependency })
            .collect();
    }
    if options.detect_unresolved {
        structure.unresolved_dependencies = unresolved_dependencies(graph);
    }
    if let Some(catalog) = catalog.filter(|_| options.check_capabilities) {
        structure.missing_capabilities = graph
            .steps
            .iter()
            .filter(|s| !catalog.contains(&s.capability))
            .map(|s| MissingCapability {
                step: s.id.clone(),
                capability: s.capability.clone(),
            })
            .collect();
    }

    let suggestions = if options.suggestions {
        suggestions(graph, &metrics)
    } else {
        Vec::new()
    };

    debug!(
        "Analyzed chain: {} steps, potential {:.2}, {} suggestions",
        graph.len(),
        metrics.parallelization_potential,
        suggestions.len()
    );

    ChainAnalysis {
        step_count: graph.len(),
        metrics,
        complexity,
        structure,
        suggestions,
    }
}

/// Number of steps reported as bottlenecks for a chain of `n` steps.
pub fn bottleneck_count(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    ((n as f64 * BOTTLENECK_SHARE).ceil() as usize).max(1)
}

fn execution_metrics(graph: &StepGraph) -> ExecutionMetrics {
    let n = graph.len();
    if n == 0 {
        return ExecutionMetrics::default();
    }

    let total_estimated_duration_ms = graph
        .steps
        .iter()
        .fold(0u64, |total, s| total.saturating_add(s.estimated_duration()));
    let average_complexity =
        graph.steps.iter().map(|s| s.complexity_score() as f64).sum::<f64>() / n as f64;

    // Slowest first; equal durations keep declaration order
    let mut ranked: Vec<usize> = (0..n).collect();
    ranked.sort_by_key(|&i| std::cmp::Reverse(graph.steps[i].estimated_duration()));
    let bottlenecks = ranked
        .into_iter()
        .take(bottleneck_count(n))
        .map(|i| graph.steps[i].id.clone())
        .collect();

    ExecutionMetrics {
        total_estimated_duration_ms,
        average_complexity,
        bottlenecks,
        parallelization_potential: parallelization_potential(graph),
    }
}

/// Greedy single pass in declaration order: a step counts when every one of
/// its dependencies has already been counted.
pub fn parallelization_potential(graph: &StepGraph) -> f64 {
    if graph.is_empty() {
        return 0.0;
    }

    let mut counted: HashSet<&str> = HashSet::new();
    let mut count = 0usize;
    for step in &graph.steps {
        if step.depends_on.iter().all(|d| counted.contains(d.as_str())) {
            counted.insert(step.id.as_str());
            count += 1;
        }
    }
    count as f64 / graph.len() as f64
}

fn complexity_analysis(graph: &StepGraph, average: f64) -> ComplexityAnalysis {
    let mut distribution = ComplexityDistribution::default();
    for step in &graph.steps {
        match step.complexity_score() {
            c if c <= LOW_COMPLEXITY_MAX => distribution.low += 1,
            c if c <= MEDIUM_COMPLEXITY_MAX => distribution.medium += 1,
            _ => distribution.high += 1,
        }
    }

    let mut risk_factors = Vec::new();
    if average > HIGH_AVERAGE_COMPLEXITY {
        risk_factors.push(format!(
            "High overall complexity: average {:.2} exceeds {}",
            average, HIGH_AVERAGE_COMPLEXITY
        ));
    }

    let retrying = graph.steps.iter().filter(|s| s.retry_on_failure).count();
    if !graph.is_empty() && retrying as f64 / graph.len() as f64 > RETRY_HEAVY_RATIO {
        risk_factors.push(format!(
            "Retry-heavy chain: {} of {} steps retry on failure",
            retrying,
            graph.len()
        ));
    }

    if graph.len() > LONG_CHAIN_STEPS {
        risk_factors.push(format!(
            "Long chain: {} steps (more than {})",
            graph.len(),
            LONG_CHAIN_STEPS
        ));
    }

    ComplexityAnalysis {
        average,
        distribution,
        risk_factors,
    }
}

fn unresolved_dependencies(graph: &StepGraph) -> Vec<DependencyEdge> {
    let ids = graph.step_ids();
    let mut unresolved = Vec::new();
    for step in &graph.steps {
        for dep in step.unique_dependencies() {
            if !ids.contains(dep) {
                unresolved.push(DependencyEdge {
                    step: step.id.clone(),
                    dependency: dep.to_string(),
                });
            }
        }
    }
    unresolved
}

fn suggestions(graph: &StepGraph, metrics: &ExecutionMetrics) -> Vec<String> {
    let mut suggestions = Vec::new();
    if graph.is_empty() {
        return suggestions;
    }

    if !metrics.bottlenecks.is_empty() {
        suggestions.push(format!(
            "Optimize bottleneck steps: {}",
            metrics.bottlenecks.join(", ")
        ));
    }

    if metrics.total_estimated_duration_ms > SPLIT_CHAIN_MS {
        suggestions.push(format!(
            "Consider splitting the chain: estimated {} ms exceeds {} ms",
            metrics.total_estimated_duration_ms, SPLIT_CHAIN_MS
        ));
    }

    let crowded: Vec<String> = graph
        .steps
        .iter()
        .map(|s| (s, s.unique_dependencies().len()))
        .filter(|(_, fan_in)| *fan_in > MAX_FAN_IN)
        .map(|(s, fan_in)| format!("{} ({})", s.id, fan_in))
        .collect();
    if !crowded.is_empty() {
        suggestions.push(format!(
            "Reduce dependency depth for steps with more than {} dependencies: {}",
            MAX_FAN_IN,
            crowded.join(", ")
        ));
    }

    if metrics.parallelization_potential < LOW_PARALLELIZATION {
        suggestions.push(format!(
            "Low parallelization potential ({:.2}): restructure dependencies so more steps can run concurrently",
            metrics.parallelization_potential
        ));
    }

    suggestions
}
