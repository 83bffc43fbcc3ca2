//! Chain Analysis Module
//!
//! Static grading of a step graph before it runs: cost estimates,
//! complexity, bottlenecks, parallelization potential and structural
//! defects.

pub mod chain;

pub use chain::{
    analyze_chain, bottleneck_count, parallelization_potential, AnalysisOptions, ChainAnalysis,
    ComplexityAnalysis, ComplexityDistribution, DependencyEdge, ExecutionMetrics,
    MissingCapability, StructuralFindings,
};
