//! Orchestrator configuration file.
//!
//! ```yaml
//! catalog: capabilities.yaml
//! engine:
//!   fail_fast: true
//!   max_parallel: 4
//!   step_timeout: 30000
//!   resolution_mode: strict
//! validation:
//!   check_capabilities: false
//! analysis:
//!   suggestions: true
//! ```
//!
//! Every field is optional. A relative `catalog` path is resolved against the
//! directory of the config file.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::AnalysisOptions;
use crate::execution::{EngineConfig, ResolutionMode};
use crate::workflow::validator::ValidationOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Settings shared by the engine, the validator and the analyzer.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub engine: EngineConfig,
    pub validation: ValidationOptions,
    pub analysis: AnalysisOptions,
    /// Capability catalog file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathBuf>,
}

impl OrchestratorConfig {
    /// Applies one resolution mode to both execution and validation.
    pub fn set_resolution_mode(&mut self, mode: ResolutionMode) {
        self.engine.resolution_mode = mode;
        self.validation.resolution_mode = mode;
    }
}

/// Loads an [`OrchestratorConfig`] from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<OrchestratorConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config: OrchestratorConfig = if content.trim().is_empty() {
        OrchestratorConfig::default()
    } else {
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    };

    if let Some(catalog) = config.catalog.take() {
        config.catalog = Some(match path.parent() {
            Some(dir) if catalog.is_relative() => dir.join(catalog),
            _ => catalog,
        });
    }

    // Strict execution implies strict validation
    if config.engine.resolution_mode == ResolutionMode::Strict {
        config.validation.resolution_mode = ResolutionMode::Strict;
    }

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_load_full_config() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("chainrunner.yaml");
        fs::write(
            &path,
            r#"
catalog: caps.yaml
engine:
  fail_fast: true
  max_parallel: 4
  step_timeout: 2500
  resolution_mode: strict
validation:
  check_capabilities: false
analysis:
  suggestions: false
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(config.engine.fail_fast);
        assert_eq!(config.engine.max_parallel, Some(4));
        assert_eq!(config.engine.step_timeout, Some(Duration::from_millis(2500)));
        assert!(config.engine.retry_in_slot);
        assert!(!config.validation.check_capabilities);
        assert!(config.validation.check_cycles);
        assert_eq!(config.validation.resolution_mode, ResolutionMode::Strict);
        assert!(!config.analysis.suggestions);
        assert_eq!(config.catalog, Some(temp_dir.path().join("caps.yaml")));
    }

    #[test]
    fn test_empty_config_is_default() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("empty.yaml");
        fs::write(&path, "\n").unwrap();

        assert_eq!(load_config(&path).unwrap(), OrchestratorConfig::default());
    }

    #[test]
    fn test_absolute_catalog_path_kept() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("abs.yaml");
        fs::write(&path, "catalog: /etc/chainrunner/caps.yaml\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(
            config.catalog,
            Some(PathBuf::from("/etc/chainrunner/caps.yaml"))
        );
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            load_config("/nonexistent/chainrunner.yaml"),
            Err(ConfigError::Read { .. })
        ));

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "engine: [not, a, map]\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_set_resolution_mode() {
        let mut config = OrchestratorConfig::default();
        config.set_resolution_mode(ResolutionMode::Strict);
        assert_eq!(config.engine.resolution_mode, ResolutionMode::Strict);
        assert_eq!(config.validation.resolution_mode, ResolutionMode::Strict);
    }
}
