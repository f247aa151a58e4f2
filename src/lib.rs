//! # StreamWeave Control
//!
//! Control plane for distributed StreamWeave dataflows.
//!
//! A logical graph of operators and streams is compiled into a physical plan of
//! operator instances packed into container slots. The orchestrator binds those
//! slots to containers granted by a resource manager, hands each worker the
//! descriptors of the operators it must run, and recovers from lost containers
//! by requesting replacements and re-wiring the consumers that depended on them.
//!
//! ## Key Features
//!
//! - **Static partitioning**: operators run as N instances, each owning a set of
//!   partition keys; unifiers merge partitioned output back into one stream
//! - **Locality-aware placement**: `CONTAINER_LOCAL` and `THREAD_LOCAL` streams
//!   keep their operators together within a container cap
//! - **Heartbeat-driven deployment**: undeploys and deploys are acknowledged by
//!   workers before the next batch is sent
//! - **Recovery**: lost containers are re-requested and restored from their
//!   latest checkpoint window
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use streamweave_control::checkpoint::InMemoryCheckpointStore;
//! use streamweave_control::config::PlanConfig;
//! use streamweave_control::graph::{LogicalGraph, OperatorDef, PortRef, StreamDef};
//! use streamweave_control::orchestrator::{ContainerManager, ResourceGrant};
//! use streamweave_control::partitioning::CodecRegistry;
//! use streamweave_control::plan::TransportAddress;
//!
//! let mut graph = LogicalGraph::new();
//! graph.add_operator(OperatorDef::new("source", "gen").with_output("out"))?;
//! graph.add_operator(OperatorDef::new("sink", "print").with_input("in"))?;
//! graph.add_stream(StreamDef::new("s", PortRef::new("source", "out")).with_sink(PortRef::new("sink", "in")))?;
//!
//! let mut manager = ContainerManager::new(
//!   &graph,
//!   PlanConfig::default(),
//!   &CodecRegistry::new(),
//!   Arc::new(InMemoryCheckpointStore::new()),
//! )?;
//! let agent = manager.assign_container(
//!   &ResourceGrant::new("container-1", "worker-a", 1024),
//!   TransportAddress::new("worker-a", 9000),
//! )?;
//! assert_eq!(agent.deploy_info().len(), 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Typed attribute maps and well-known attribute names.
pub mod attributes;
/// Operator snapshots and checkpoint stores.
pub mod checkpoint;
/// Planner configuration.
pub mod config;
/// Command loop serializing access to the container manager.
pub mod control_loop;
/// Deploy descriptors handed to worker containers.
pub mod deploy;
/// Error types.
pub mod error;
/// Logical dataflow graph.
pub mod graph;
/// Container orchestration.
pub mod orchestrator;
/// Partition keys and codecs.
pub mod partitioning;
/// Physical plan, compiler and placement.
pub mod plan;
/// Heartbeat wire protocol.
pub mod protocol;
/// Container failure handling.
pub mod recovery;

#[cfg(test)]
mod orchestrator_test;
#[cfg(test)]
mod partitioning_test;
#[cfg(test)]
mod test_support;
