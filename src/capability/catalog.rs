//! Capability Catalog
//!
//! The set of capabilities a chain is allowed to reference. The validator and
//! the chain analyzer only ever ask one question of it: does this capability
//! exist?
//!
//! # File Format
//!
//! ```yaml
//! servers:
//!   weather:
//!     forecast: "curl -s https://wttr.in/{location}?format=j1"
//!   text:
//!     summarize:
//!       command: "python3 summarize.py"
//!       description: Summarizes the `input` parameter
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::CapabilityRef;

/// Errors raised while loading or saving a catalog file.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write catalog '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Queryable set of known capabilities.
pub trait CapabilityCatalog: Send + Sync {
    /// Returns true if `capability` is available.
    fn contains(&self, capability: &CapabilityRef) -> bool;
}

impl CapabilityCatalog for HashSet<CapabilityRef> {
    fn contains(&self, capability: &CapabilityRef) -> bool {
        HashSet::contains(self, capability)
    }
}

impl CapabilityCatalog for BTreeSet<CapabilityRef> {
    fn contains(&self, capability: &CapabilityRef) -> bool {
        BTreeSet::contains(self, capability)
    }
}

/// Catalog that accepts every capability.
///
/// Used when no catalog is configured and capability checks are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCatalog;

impl CapabilityCatalog for OpenCatalog {
    fn contains(&self, _capability: &CapabilityRef) -> bool {
        true
    }
}

/// How a catalog entry runs, written either as a bare command string or a
/// detailed table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum CapabilityEntry {
    Command(String),
    Detailed {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl CapabilityEntry {
    /// Shell command template for this capability.
    pub fn command(&self) -> &str {
        match self {
            Self::Command(command) => command,
            Self::Detailed { command, .. } => command,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Command(_) => None,
            Self::Detailed { description, .. } => description.as_deref(),
        }
    }
}

/// File-backed catalog mapping `server -> tool -> command`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StaticCatalog {
    #[serde(default)]
    servers: BTreeMap<String, BTreeMap<String, CapabilityEntry>>,
}

impl StaticCatalog {
    /// Creates a new empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a catalog from a YAML or JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let catalog: StaticCatalog =
            serde_yaml::from_str(&content).map_err(|e| CatalogError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        info!(
            "Loaded capability catalog from {} ({} capabilities)",
            path.display(),
            catalog.len()
        );
        Ok(catalog)
    }

    /// Saves the catalog; `.json` files are written as JSON, anything else as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CatalogError> {
        let path = path.as_ref();
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");

        let content = if is_json {
            serde_json::to_string_pretty(self).map_err(|e| e.to_string())
        } else {
            serde_yaml::to_string(self).map_err(|e| e.to_string())
        }
        .map_err(|message| CatalogError::Parse {
            path: path.to_path_buf(),
            message,
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CatalogError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| CatalogError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Saved capability catalog to {}", path.display());
        Ok(())
    }

    /// Registers a capability backed by a shell command template.
    pub fn insert(
        &mut self,
        server: impl Into<String>,
        tool: impl Into<String>,
        command: impl Into<String>,
    ) {
        self.servers
            .entry(server.into())
            .or_default()
            .insert(tool.into(), CapabilityEntry::Command(command.into()));
    }

    /// Gets the entry for a capability.
    pub fn get(&self, capability: &CapabilityRef) -> Option<&CapabilityEntry> {
        self.servers
            .get(&capability.server)
            .and_then(|tools| tools.get(&capability.tool))
    }

    /// All capabilities in the catalog, sorted.
    pub fn capabilities(&self) -> Vec<CapabilityRef> {
        self.servers
            .iter()
            .flat_map(|(server, tools)| {
                tools
                    .keys()
                    .map(move |tool| CapabilityRef::new(server.clone(), tool.clone()))
            })
            .collect()
    }

    /// Number of capabilities across all servers.
    pub fn len(&self) -> usize {
        self.servers.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CapabilityCatalog for StaticCatalog {
    fn contains(&self, capability: &CapabilityRef) -> bool {
        self.get(capability).is_some()
    }
}
