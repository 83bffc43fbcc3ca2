//! Chain Execution Module
//!
//! Runs a scheduled step graph batch by batch against a capability invoker.
//!
//! # Architecture
//!
//! - [`engine`]: Batch loop, fail-fast and cancellation handling
//! - [`step`]: Single step execution with retries and timeouts
//! - [`resolver`]: Parameter resolution from variables and prior outputs
//! - [`aggregate`]: Overall result of a finished run

pub mod aggregate;
pub mod engine;
pub mod resolver;
pub mod step;

pub use aggregate::{aggregate_results, ExecutionSummary, OverallResult};
pub use engine::{Engine, EngineConfig};
pub use resolver::{resolve_parameters, ResolutionError, ResolutionMode};
