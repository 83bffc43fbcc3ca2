//! Monitoring Module
//!
//! Reporting helpers for finished or in-flight chain runs.
//!
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
