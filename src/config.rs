//! Planner configuration.
//!
//! Loaded from JSON with every field optional, then validated before the
//! compiler sees it.

use crate::attributes::CONTAINERS_MAX_COUNT;
use crate::graph::LogicalGraph;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error raised while loading or validating a [`PlanConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
  /// Config file could not be read.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Config file is not valid JSON for this schema.
  #[error("parse error: {0}")]
  Parse(#[from] serde_json::Error),
  /// A value is out of range.
  #[error("invalid value for '{field}': {reason}")]
  Invalid {
    /// Offending field.
    field: &'static str,
    /// What is wrong with it.
    reason: String,
  },
}

/// Limits and defaults used when compiling a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
  /// Upper bound on container slots.
  pub max_containers: u32,
  /// Memory offered by one container; `None` disables memory-aware placement.
  pub container_memory_mb: Option<u32>,
  /// Memory ask of an operator without a `MEMORY_MB` attribute.
  pub default_operator_memory_mb: u32,
  /// Compute ask per container.
  pub container_vcores: u32,
  /// Base directory of the file checkpoint store.
  pub checkpoint_dir: Option<PathBuf>,
}

impl Default for PlanConfig {
  fn default() -> Self {
    Self {
      max_containers: 1,
      container_memory_mb: None,
      default_operator_memory_mb: 256,
      container_vcores: 1,
      checkpoint_dir: None,
    }
  }
}

impl PlanConfig {
  /// Reads and validates a JSON config file.
  ///
  /// # Errors
  ///
  /// Returns [`ConfigError`] if the file is unreadable, malformed or invalid.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let config: PlanConfig = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }

  /// Sets the container cap.
  #[must_use]
  pub fn with_max_containers(mut self, max_containers: u32) -> Self {
    self.max_containers = max_containers;
    self
  }

  /// Enables memory-aware placement.
  #[must_use]
  pub fn with_container_memory_mb(mut self, memory_mb: u32) -> Self {
    self.container_memory_mb = Some(memory_mb);
    self
  }

  /// Sets the default operator memory ask.
  #[must_use]
  pub fn with_default_operator_memory_mb(mut self, memory_mb: u32) -> Self {
    self.default_operator_memory_mb = memory_mb;
    self
  }

  /// Sets the per-container compute ask.
  #[must_use]
  pub fn with_container_vcores(mut self, vcores: u32) -> Self {
    self.container_vcores = vcores;
    self
  }

  /// Sets the checkpoint directory.
  #[must_use]
  pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.checkpoint_dir = Some(dir.into());
    self
  }

  /// Checks value ranges.
  ///
  /// # Errors
  ///
  /// Returns [`ConfigError::Invalid`] naming the first bad field.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_containers == 0 {
      return Err(ConfigError::Invalid {
        field: "max_containers",
        reason: "must be at least 1".to_string(),
      });
    }
    if self.container_memory_mb == Some(0) {
      return Err(ConfigError::Invalid {
        field: "container_memory_mb",
        reason: "must be positive".to_string(),
      });
    }
    if self.default_operator_memory_mb == 0 {
      return Err(ConfigError::Invalid {
        field: "default_operator_memory_mb",
        reason: "must be positive".to_string(),
      });
    }
    if self.container_vcores == 0 {
      return Err(ConfigError::Invalid {
        field: "container_vcores",
        reason: "must be positive".to_string(),
      });
    }
    Ok(())
  }

  /// Container cap for `graph`: its `CONTAINERS_MAX_COUNT` attribute wins.
  ///
  /// Non-positive attribute values fall back to the configured cap.
  pub fn max_containers_for(&self, graph: &LogicalGraph) -> u32 {
    graph
      .attributes()
      .get_int(CONTAINERS_MAX_COUNT)
      .filter(|n| *n > 0)
      .and_then(|n| u32::try_from(n).ok())
      .unwrap_or(self.max_containers)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_are_valid() {
    assert!(PlanConfig::default().validate().is_ok());
  }

  #[test]
  fn test_validation_rejects_zero_cap() {
    let config = PlanConfig::default().with_max_containers(0);
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid { field: "max_containers", .. })
    ));
  }

  #[test]
  fn test_graph_attribute_overrides_cap() {
    let mut graph = LogicalGraph::new();
    let config = PlanConfig::default().with_max_containers(4);
    assert_eq!(config.max_containers_for(&graph), 4);
    graph.attributes_mut().set(CONTAINERS_MAX_COUNT, 2);
    assert_eq!(config.max_containers_for(&graph), 2);
  }

  #[test]
  fn test_from_json_file_fills_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "max_containers": 6, "container_memory_mb": 1024 }}"#).unwrap();
    let config = PlanConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.max_containers, 6);
    assert_eq!(config.container_memory_mb, Some(1024));
    assert_eq!(config.default_operator_memory_mb, 256);
  }
}
