//! Operator checkpoints.
//!
//! Every physical operator has a snapshot per streaming window. The control
//! plane writes the initial snapshot (window 0) when a plan is built and reads
//! snapshots back when a container is restarted, to pick the recovery window
//! and to check that a recovered operator is what the plan says it is.

use crate::graph::LogicRef;
use crate::plan::{OperatorId, OperatorKind, PhysicalOperator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Window of the snapshot written at plan construction.
pub const INITIAL_WINDOW: u64 = 0;

/// Error type for checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(String),
  /// Checkpoint not found.
  #[error("checkpoint not found: {0}")]
  NotFound(String),
  /// The stored snapshot belongs to a different kind of operator.
  #[error("operator {operator} restored as {found:?}, expected {expected:?}")]
  KindMismatch {
    /// Operator id.
    operator: OperatorId,
    /// Kind declared by the plan.
    expected: OperatorKind,
    /// Kind found in the snapshot.
    found: OperatorKind,
  },
  /// Other error.
  #[error("checkpoint error: {0}")]
  Other(String),
}

impl From<serde_json::Error> for CheckpointError {
  fn from(e: serde_json::Error) -> Self {
    CheckpointError::Serialization(e.to_string())
  }
}

/// Which window to load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowSelector {
  /// The highest stored window.
  Latest,
  /// A specific window.
  Window(u64),
}

/// Persisted state of one operator at one window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSnapshot {
  /// Operator id.
  pub operator_id: OperatorId,
  /// Logical operator name.
  pub declared_id: String,
  /// Operator role.
  pub kind: OperatorKind,
  /// Logic the operator was instantiated from.
  pub logic: LogicRef,
  /// Window the snapshot was taken at.
  pub window: u64,
  /// Opaque operator state.
  #[serde(default)]
  pub state: Vec<u8>,
}

impl OperatorSnapshot {
  /// Empty snapshot of `operator` at [`INITIAL_WINDOW`].
  pub fn initial(operator: &PhysicalOperator) -> Self {
    Self {
      operator_id: operator.id(),
      declared_id: operator.logical_name().to_string(),
      kind: operator.kind(),
      logic: operator.logic().clone(),
      window: INITIAL_WINDOW,
      state: Vec::new(),
    }
  }
}

/// Storage backend for operator snapshots.
pub trait CheckpointStore: Send + Sync + fmt::Debug {
  /// Stores the serialized snapshot of `operator` at `window`.
  fn save(&self, operator: OperatorId, window: u64, bytes: &[u8]) -> Result<(), CheckpointError>;

  /// Opens a stored snapshot.
  fn load_stream(
    &self,
    operator: OperatorId,
    window: WindowSelector,
  ) -> Result<Box<dyn Read + Send>, CheckpointError>;

  /// Stored windows of `operator` in ascending order.
  fn windows(&self, operator: OperatorId) -> Result<Vec<u64>, CheckpointError>;

  /// Highest stored window of `operator`, if any.
  fn latest_window(&self, operator: OperatorId) -> Result<Option<u64>, CheckpointError> {
    Ok(self.windows(operator)?.last().copied())
  }
}

fn resolve(
  store: &dyn CheckpointStore,
  operator: OperatorId,
  window: WindowSelector,
) -> Result<u64, CheckpointError> {
  match window {
    WindowSelector::Window(w) => Ok(w),
    WindowSelector::Latest => store
      .latest_window(operator)?
      .ok_or_else(|| CheckpointError::NotFound(format!("operator {}", operator))),
  }
}

/// File-based checkpoint store.
///
/// Snapshots live at `<base>/<operator>/<window>`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
  base_path: PathBuf,
}

impl FileCheckpointStore {
  /// Creates a store rooted at `base_path`.
  pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
    Self {
      base_path: base_path.as_ref().to_path_buf(),
    }
  }

  fn operator_dir(&self, operator: OperatorId) -> PathBuf {
    self.base_path.join(operator.to_string())
  }
}

impl CheckpointStore for FileCheckpointStore {
  fn save(&self, operator: OperatorId, window: u64, bytes: &[u8]) -> Result<(), CheckpointError> {
    let dir = self.operator_dir(operator);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(window.to_string()), bytes)?;
    Ok(())
  }

  fn load_stream(
    &self,
    operator: OperatorId,
    window: WindowSelector,
  ) -> Result<Box<dyn Read + Send>, CheckpointError> {
    let window = resolve(self, operator, window)?;
    let path = self.operator_dir(operator).join(window.to_string());
    if !path.exists() {
      return Err(CheckpointError::NotFound(format!(
        "operator {} window {}",
        operator, window
      )));
    }
    Ok(Box::new(std::fs::File::open(path)?))
  }

  fn windows(&self, operator: OperatorId) -> Result<Vec<u64>, CheckpointError> {
    let dir = self.operator_dir(operator);
    if !dir.exists() {
      return Ok(Vec::new());
    }
    let mut windows = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
      let entry = entry?;
      if let Some(window) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
        windows.push(window);
      }
    }
    windows.sort_unstable();
    Ok(windows)
  }
}

/// Checkpoint store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
  snapshots: Mutex<BTreeMap<(OperatorId, u64), Vec<u8>>>,
}

impl InMemoryCheckpointStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(OperatorId, u64), Vec<u8>>>, CheckpointError> {
    self
      .snapshots
      .lock()
      .map_err(|_| CheckpointError::Other("checkpoint store lock poisoned".to_string()))
  }
}

impl CheckpointStore for InMemoryCheckpointStore {
  fn save(&self, operator: OperatorId, window: u64, bytes: &[u8]) -> Result<(), CheckpointError> {
    self.lock()?.insert((operator, window), bytes.to_vec());
    Ok(())
  }

  fn load_stream(
    &self,
    operator: OperatorId,
    window: WindowSelector,
  ) -> Result<Box<dyn Read + Send>, CheckpointError> {
    let window = resolve(self, operator, window)?;
    let bytes = self
      .lock()?
      .get(&(operator, window))
      .cloned()
      .ok_or_else(|| CheckpointError::NotFound(format!("operator {} window {}", operator, window)))?;
    Ok(Box::new(Cursor::new(bytes)))
  }

  fn windows(&self, operator: OperatorId) -> Result<Vec<u64>, CheckpointError> {
    Ok(
      self
        .lock()?
        .range((operator, 0)..=(operator, u64::MAX))
        .map(|((_, window), _)| *window)
        .collect(),
    )
  }
}

/// Serializes `snapshot` into `store`.
pub fn write_snapshot(store: &dyn CheckpointStore, snapshot: &OperatorSnapshot) -> Result<(), CheckpointError> {
  let bytes = serde_json::to_vec(snapshot)?;
  store.save(snapshot.operator_id, snapshot.window, &bytes)
}

/// Loads a snapshot and checks that it restores the expected kind of operator.
///
/// # Errors
///
/// Returns [`CheckpointError::KindMismatch`] when the stored kind differs from
/// `expected_kind`, besides the usual lookup and decoding errors.
pub fn retrieve_operator(
  store: &dyn CheckpointStore,
  operator: OperatorId,
  window: WindowSelector,
  expected_kind: OperatorKind,
) -> Result<OperatorSnapshot, CheckpointError> {
  let stream = store.load_stream(operator, window)?;
  let snapshot: OperatorSnapshot = serde_json::from_reader(stream)?;
  if snapshot.kind != expected_kind {
    return Err(CheckpointError::KindMismatch {
      operator,
      expected: expected_kind,
      found: snapshot.kind,
    });
  }
  Ok(snapshot)
}
