//! Step Graph Module
//!
//! Data structures and utilities for defining, loading, validating and
//! scheduling chains of capability invocations.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, StepGraph, CapabilityRef)
//! - [`parser`]: YAML/JSON loading and saving
//! - [`validator`]: Structural and reference checks
//! - [`planner`]: Batch scheduling by dependency level
//! - [`state`]: Per-run execution records

pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use model::{CapabilityRef, OutputRef, Step, StepGraph};
pub use parser::{infer_mapping_dependencies, load_graph, parse_graph, save_graph, GraphFileError};
pub use planner::{plan_batches, BatchPlan, ScheduleError};
pub use state::{StepOutcome, StepStatus, WorkflowExecution, WorkflowStatus};
pub use validator::{find_cycles, validate_graph, ValidationOptions, ValidationReport};
