//! # Error Types
//!
//! Errors raised while building a logical graph, compiling it into a physical
//! plan and binding that plan to cluster resources.
//!
//! ## Overview
//!
//! - **GraphError**: the logical graph is malformed (unknown ports, cycles, ...)
//! - **PlanError**: the graph is well formed but cannot be laid out
//! - **AssignmentError**: a resource grant does not match the orchestrator's state
//!
//! Container failure is not an error: it is reported through
//! [`ContainerManager::schedule_container_restart`](crate::orchestrator::ContainerManager::schedule_container_restart)
//! and handled by recovery. Checkpoint, wire and configuration failures have
//! their own types next to the code that raises them.

use crate::checkpoint::CheckpointError;
use crate::graph::PortDirection;
use thiserror::Error;

/// Error raised while building or validating a logical graph.
#[derive(Error, Debug)]
pub enum GraphError {
  /// An operator with the same name was already added.
  #[error("operator '{0}' already exists")]
  DuplicateOperator(String),
  /// A stream with the same id was already added.
  #[error("stream '{0}' already exists")]
  DuplicateStream(String),
  /// A stream references an operator that is not in the graph.
  #[error("operator '{0}' does not exist")]
  UnknownOperator(String),
  /// A stream references a port the operator does not declare.
  #[error("operator '{operator}' has no {direction} port '{port}'")]
  UnknownPort {
    /// Operator name.
    operator: String,
    /// Port name.
    port: String,
    /// Direction the port was expected to have.
    direction: PortDirection,
  },
  /// An input port can be fed by one stream only.
  #[error("input port '{operator}.{port}' is already connected to stream '{stream}'")]
  PortAlreadyConnected {
    /// Operator name.
    operator: String,
    /// Port name.
    port: String,
    /// Stream already feeding the port.
    stream: String,
  },
  /// A stream must have at least one sink.
  #[error("stream '{0}' has no sinks")]
  NoSinks(String),
  /// The graph is not a DAG.
  #[error("graph contains a cycle through: {0:?}")]
  Cycle(Vec<String>),
  /// Serialized graph could not be parsed.
  #[error("invalid graph document: {0}")]
  Parse(#[from] serde_json::Error),
}

/// Error raised while compiling a logical graph into a physical plan.
#[derive(Error, Debug)]
pub enum PlanError {
  /// The logical graph is invalid.
  #[error(transparent)]
  Graph(#[from] GraphError),
  /// `INITIAL_PARTITION_COUNT` is not a positive integer.
  #[error("operator '{operator}' has invalid partition count {count}")]
  InvalidPartitionCount {
    /// Operator name.
    operator: String,
    /// Offending value.
    count: i64,
  },
  /// Parallel-partitioned inputs disagree on the instance count.
  #[error("operator '{operator}' is partitioned in parallel with upstreams of different widths {counts:?}")]
  ParallelPartitionMismatch {
    /// Operator name.
    operator: String,
    /// Instance counts of the parallel upstreams.
    counts: Vec<u32>,
  },
  /// A stream names a codec the registry does not know.
  #[error("stream '{stream}' uses unknown codec '{codec}'")]
  UnknownCodec {
    /// Stream id.
    stream: String,
    /// Codec name.
    codec: String,
  },
  /// A codec returned key sets that do not cover every partition.
  #[error("codec '{codec}' on stream '{stream}' returned {found} non-empty key sets for {expected} partitions")]
  InvalidCodecKeys {
    /// Stream id.
    stream: String,
    /// Codec name.
    codec: String,
    /// Partition count asked for.
    expected: u32,
    /// Usable key sets returned.
    found: usize,
  },
  /// Memory asks add up past `u32::MAX` megabytes.
  #[error("memory of {operators:?} overflows a container's memory ask")]
  MemoryOverflow {
    /// Logical names of the operators being summed.
    operators: Vec<String>,
  },
  /// Operators that must share a container do not fit in one.
  #[error("locality group {operators:?} needs {required_mb} MB, containers offer {capacity_mb} MB")]
  LocalityGroupTooLarge {
    /// Logical names of the group's operators.
    operators: Vec<String>,
    /// Summed memory ask.
    required_mb: u32,
    /// Per-container memory.
    capacity_mb: u32,
  },
  /// The plan cannot be laid out within the container cap.
  #[error("plan needs more than {max_containers} containers")]
  ContainerLimitExceeded {
    /// Configured cap.
    max_containers: u32,
  },
  /// Configuration is unusable.
  #[error("invalid configuration: {0}")]
  InvalidConfig(String),
  /// Initial checkpoints could not be written.
  #[error("checkpoint error: {0}")]
  Checkpoint(#[from] CheckpointError),
}

/// Protocol fault raised when a resource grant cannot be applied.
///
/// A rejected grant leaves the plan untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignmentError {
  /// No outstanding resource request matches the grant.
  #[error("no outstanding resource request for container '{external_id}'")]
  NoOutstandingRequest {
    /// External allocation id carried by the grant.
    external_id: String,
  },
  /// The external id is already bound to a live slot.
  #[error("container '{external_id}' is already assigned")]
  AlreadyAssigned {
    /// External allocation id carried by the grant.
    external_id: String,
  },
}
