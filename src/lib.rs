//! ChainRunner - Declarative Step Orchestration
//!
//! Runs chains of capability invocations described as step graphs: each
//! step calls one `server/tool` capability, may depend on other steps, and
//! may feed on their outputs. Chains are validated and scheduled into
//! dependency levels before anything runs; steps within a level run
//! concurrently.
//!
//! # Architecture
//!
//! - [`workflow`]: Step graph model, loading, validation, scheduling and run state
//! - [`execution`]: Engine, step execution, parameter resolution and result aggregation
//! - [`capability`]: Catalog and invoker seams to the outside world
//! - [`registry`]: Background submission, status, cancellation and purge
//! - [`analysis`]: Static cost and structure analysis of a chain
//! - [`monitoring`]: Execution timeline and Gantt chart
//! - [`config`]: YAML orchestrator configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chainrunner::capability::{DryRunInvoker, OpenCatalog};
//! use chainrunner::execution::Engine;
//! use chainrunner::registry::WorkflowRegistry;
//! use chainrunner::load_graph;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = load_graph("chain.yaml")?;
//!
//!     let mut engine = Engine::new(Arc::new(DryRunInvoker));
//!     engine.set_max_parallel(Some(4));
//!
//!     let registry = WorkflowRegistry::new(engine, Arc::new(OpenCatalog));
//!     let execution = registry.run(graph).await?;
//!     println!("{}: {}", execution.workflow_id, execution.status);
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod capability;
pub mod config;
pub mod execution;
pub mod monitoring;
pub mod registry;
pub mod serde_ext;
pub mod workflow;

// Re-export commonly used types
pub use analysis::{analyze_chain, ChainAnalysis};
pub use execution::engine::Engine;
pub use registry::{ExecutionStore, SubmitError, WorkflowRegistry};
pub use workflow::model::{CapabilityRef, Step, StepGraph};
pub use workflow::parser::load_graph;
pub use workflow::state::{WorkflowExecution, WorkflowStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ChainRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ChainRunner");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("fetch", CapabilityRef::new("http", "get"));
        assert_eq!(step.id, "fetch");
        assert_eq!(step.capability.tool, "get");
    }

    #[test]
    fn test_module_exports_graph() {
        let graph = StepGraph::new();
        assert!(graph.is_empty());
        assert!(!analyze_chain(&graph, None, &Default::default()).is_executable());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
