//! Step Graph Parser
//!
//! Loads and saves step graphs as YAML (or JSON, which the YAML parser also
//! accepts). Structural checks are left to the validator so that a broken
//! graph can still be loaded, reported on and analyzed.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use super::model::{OutputRef, StepGraph};

/// Errors raised while reading or writing graph files.
#[derive(Debug, Error)]
pub enum GraphFileError {
    #[error("failed to read chain file '{}': {source}. Check that the file exists and is readable.", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse chain file '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("failed to write chain file '{}': {message}", path.display())]
    Write { path: PathBuf, message: String },
}

/// Parses a graph from YAML or JSON text.
pub fn parse_graph(content: &str) -> Result<StepGraph, serde_yaml::Error> {
    serde_yaml::from_str(content)
}

/// Loads a step graph from a file.
///
/// # Example
///
/// ```rust,no_run
/// use chainrunner::workflow::load_graph;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let graph = load_graph("chain.yaml")?;
///     println!("Loaded {} steps", graph.len());
///     Ok(())
/// }
/// ```
pub fn load_graph(path: impl AsRef<Path>) -> Result<StepGraph, GraphFileError> {
    let path = path.as_ref();
    info!("Loading chain from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| GraphFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Chain file loaded ({} bytes)", content.len());

    let graph = parse_graph(&content).map_err(|e| GraphFileError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    info!(
        "Parsed {} steps, {} variables",
        graph.len(),
        graph.variables.len()
    );
    Ok(graph)
}

/// Saves a graph; `.json` paths are written as JSON, anything else as YAML.
pub fn save_graph(graph: &StepGraph, path: impl AsRef<Path>) -> Result<(), GraphFileError> {
    let path = path.as_ref();
    let write_error = |message: String| GraphFileError::Write {
        path: path.to_path_buf(),
        message,
    };

    let content = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::to_string_pretty(graph).map_err(|e| write_error(e.to_string()))?
    } else {
        serde_yaml::to_string(graph).map_err(|e| write_error(e.to_string()))?
    };
    fs::write(path, content).map_err(|e| write_error(e.to_string()))?;

    info!("Chain saved to: {}", path.display());
    Ok(())
}

/// Adds the source step of every output mapping to the step's `depends_on`
/// when it isn't listed already, so mapped values are always available when
/// the step runs. Mappings that are malformed or name unknown steps are left
/// for the validator to report. Returns the number of dependencies added.
pub fn infer_mapping_dependencies(graph: &mut StepGraph) -> usize {
    let ids: HashSet<String> = graph.steps.iter().map(|s| s.id.clone()).collect();
    let mut added = 0;

    for step in &mut graph.steps {
        let sources: Vec<String> = step
            .output_mapping
            .values()
            .filter_map(|reference| OutputRef::parse(reference))
            .map(|output| output.step_id.to_string())
            .filter(|source| ids.contains(source) && *source != step.id)
            .collect();

        for source in sources {
            if !step.depends_on.contains(&source) {
                debug!("Step '{}' now depends on '{}' (output mapping)", step.id, source);
                step.depends_on.push(source);
                added += 1;
            }
        }
    }

    if added > 0 {
        info!("Inferred {} dependencies from output mappings", added);
    }
    added
}
