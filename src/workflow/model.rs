//! Step Graph Data Model
//!
//! Core data structures representing chain steps and their relationships.
//!
//! # Example YAML Format
//!
//! ```yaml
//! variables:
//!   city: Lisbon
//!
//! steps:
//!   - id: forecast
//!     capability: weather/forecast
//!     parameters:
//!       location: $city
//!       days: 3
//!
//!   - id: summarize
//!     capability:
//!       server: text
//!       tool: summarize
//!     depends_on: forecast
//!     output_mapping:
//!       input: forecast.report
//!     retry_on_failure: true
//!     max_retries: 2
//!     estimated_duration_ms: 4000
//!     complexity: 3
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::serde_ext::single_or_vec;

/// Estimated duration assumed for steps that don't declare one.
pub const DEFAULT_ESTIMATED_DURATION_MS: u64 = 1000;

/// Complexity assumed for steps that don't declare one.
pub const DEFAULT_COMPLEXITY: u32 = 1;

/// Reference to an external capability: a tool exposed by a named server.
///
/// Accepts either `"server/tool"` or `{server, tool}` when deserialized.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityRef {
    /// Server (or provider) exposing the tool
    pub server: String,
    /// Tool name on that server
    pub tool: String,
}

impl CapabilityRef {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into().trim().to_string(),
            tool: tool.into().trim().to_string(),
        }
    }

    /// Parses the `server/tool` shorthand. A string without a separator is
    /// treated as a bare tool with no server.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('/') {
            Some((server, tool)) => Self::new(server, tool),
            None => Self::new("", raw),
        }
    }

    /// True when both the server and the tool are named.
    pub fn is_complete(&self) -> bool {
        !self.server.is_empty() && !self.tool.is_empty()
    }
}

impl fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.tool)
    }
}

impl<'de> Deserialize<'de> for CapabilityRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawCapability {
            Shorthand(String),
            Parts {
                #[serde(default, alias = "serverName")]
                server: String,
                #[serde(alias = "toolName", alias = "name")]
                tool: String,
            },
        }

        Ok(match RawCapability::deserialize(deserializer)? {
            RawCapability::Shorthand(raw) => Self::parse(&raw),
            RawCapability::Parts { server, tool } => Self::new(server, tool),
        })
    }
}

/// A `<stepId>.<outputKey>` reference to a value produced by an earlier step.
///
/// The step id ends at the first `.`; everything after it is the output key,
/// which may itself be a dotted path into nested results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRef<'a> {
    pub step_id: &'a str,
    pub key: &'a str,
}

impl<'a> OutputRef<'a> {
    pub fn parse(reference: &'a str) -> Option<Self> {
        let (step_id, key) = reference.trim().split_once('.')?;
        if step_id.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self { step_id, key })
    }
}

/// Represents a single step in a chain.
///
/// Each step invokes one capability with a parameter map, optionally after
/// other steps have completed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier for this step
    pub id: String,

    /// Capability invoked by this step
    pub capability: CapabilityRef,

    /// Parameters passed to the capability; `$name` strings refer to graph variables
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// IDs of steps that must complete before this step can run
    #[serde(
        default,
        alias = "dependsOn",
        deserialize_with = "single_or_vec",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub depends_on: Vec<String>,

    /// Parameter name -> `<stepId>.<outputKey>` of a prior step's result
    #[serde(default, alias = "outputMapping", skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,

    /// Whether a failed invocation may be retried
    #[serde(default, alias = "retryOnFailure")]
    pub retry_on_failure: bool,

    /// Extra attempts allowed when `retry_on_failure` is set
    #[serde(default, alias = "maxRetries", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Declared duration estimate, used only by chain analysis
    #[serde(
        default,
        alias = "estimatedDuration",
        alias = "estimatedDurationMs",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_duration_ms: Option<u64>,

    /// Declared complexity score, used only by chain analysis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<u32>,
}

impl Step {
    /// Creates a new Step invoking `capability`.
    ///
    /// # Example
    ///
    /// ```
    /// use chainrunner::workflow::{CapabilityRef, Step};
    ///
    /// let step = Step::new("summarize", CapabilityRef::new("text", "summarize"))
    ///     .with_parameter("max_words", 120)
    ///     .depends_on("fetch")
    ///     .with_output_mapping("input", "fetch.body")
    ///     .with_retries(2);
    /// ```
    pub fn new(id: impl Into<String>, capability: CapabilityRef) -> Self {
        Self {
            id: id.into().trim().to_string(),
            capability,
            parameters: Map::new(),
            depends_on: Vec::new(),
            output_mapping: BTreeMap::new(),
            retry_on_failure: false,
            max_retries: None,
            estimated_duration_ms: None,
            complexity: None,
        }
    }

    /// Sets one parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Wires `parameter` to `<stepId>.<outputKey>` of a prior step.
    pub fn with_output_mapping(
        mut self,
        parameter: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        self.output_mapping.insert(parameter.into(), reference.into());
        self
    }

    /// Enables retries with the given number of extra attempts.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_on_failure = true;
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_estimated_duration(mut self, millis: u64) -> Self {
        self.estimated_duration_ms = Some(millis);
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = Some(complexity);
        self
    }

    /// Dependencies with duplicates removed, in declaration order.
    pub fn unique_dependencies(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.depends_on
            .iter()
            .map(String::as_str)
            .filter(|dep| seen.insert(*dep))
            .collect()
    }

    /// Estimated duration, falling back to [`DEFAULT_ESTIMATED_DURATION_MS`].
    pub fn estimated_duration(&self) -> u64 {
        self.estimated_duration_ms
            .unwrap_or(DEFAULT_ESTIMATED_DURATION_MS)
    }

    /// Complexity score, falling back to [`DEFAULT_COMPLEXITY`].
    pub fn complexity_score(&self) -> u32 {
        self.complexity.unwrap_or(DEFAULT_COMPLEXITY)
    }

    /// Number of attempts the engine may make for this step.
    pub fn max_attempts(&self) -> u32 {
        if self.retry_on_failure {
            1 + self.max_retries.unwrap_or(0)
        } else {
            1
        }
    }
}

/// A complete chain: ordered steps plus global variables.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StepGraph {
    /// Ordered list of steps in the chain
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Global variables available to every step through `$name`
    #[serde(default, alias = "globals", skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
}

impl StepGraph {
    /// Creates a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a graph from a list of steps.
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            variables: Map::new(),
        }
    }

    /// Sets a global variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Adds a step to the graph.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Gets a mutable reference to a step by ID.
    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Set of all step IDs.
    pub fn step_ids(&self) -> HashSet<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Returns steps nothing depends on (exit points).
    pub fn leaf_steps(&self) -> Vec<&Step> {
        let referenced: HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();
        self.steps
            .iter()
            .filter(|s| !referenced.contains(s.id.as_str()))
            .collect()
    }

    /// IDs of the steps that directly depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == id))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Every step reachable by following `depends_on` from `id`, excluding `id`
    /// itself unless it lies on a cycle.
    pub fn ancestors_of(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self
            .get_step(id)
            .map(|s| s.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default();

        while let Some(current) = stack.pop() {
            if !seen.insert(current.to_string()) {
                continue;
            }
            if let Some(step) = self.get_step(current) {
                stack.extend(step.depends_on.iter().map(String::as_str));
            }
        }
        seen
    }

    /// Unique capabilities used by the chain, sorted.
    pub fn capabilities(&self) -> Vec<CapabilityRef> {
        let set: BTreeSet<_> = self.steps.iter().map(|s| s.capability.clone()).collect();
        set.into_iter().collect()
    }

    /// Returns the number of steps in the graph.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
