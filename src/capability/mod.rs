//! Capability Module
//!
//! The two external seams of the orchestrator:
//!
//! - [`catalog`]: which capabilities exist (used by validation and analysis)
//! - [`invoker`]: how a capability is actually called during execution

pub mod catalog;
pub mod invoker;

pub use catalog::{CapabilityCatalog, CapabilityEntry, CatalogError, OpenCatalog, StaticCatalog};
pub use invoker::{CapabilityInvoker, DryRunInvoker, InvocationError, ProcessInvoker};
