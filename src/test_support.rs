//! Graph fixtures shared by unit tests.

use crate::attributes::{CONTAINERS_MAX_COUNT, INITIAL_PARTITION_COUNT, QUEUE_CAPACITY};
use crate::checkpoint::InMemoryCheckpointStore;
use crate::config::PlanConfig;
use crate::graph::{Locality, LogicalGraph, OperatorDef, PortRef, StreamDef};
use crate::orchestrator::{ContainerManager, ResourceGrant};
use crate::partitioning::CodecRegistry;
use crate::plan::TransportAddress;
use std::sync::Arc;

pub(crate) fn source(name: &str) -> OperatorDef {
  OperatorDef::new(name, "generator").with_output("out")
}

pub(crate) fn generic(name: &str) -> OperatorDef {
  OperatorDef::new(name, "generic").with_input("in").with_output("out")
}

pub(crate) fn link(graph: &mut LogicalGraph, id: &str, from: &str, to: &str, locality: Locality) {
  graph
    .add_stream(
      StreamDef::new(id, PortRef::new(from, "out"))
        .with_sink(PortRef::new(to, "in"))
        .with_locality(locality),
    )
    .unwrap();
}

/// `o1 -> o2 -> o3 -> o4` with DEFAULT, CONTAINER_LOCAL and THREAD_LOCAL
/// streams and a cap of two containers.
pub(crate) fn chain_graph() -> LogicalGraph {
  let mut graph = LogicalGraph::new();
  graph.add_operator(source("o1")).unwrap();
  for name in ["o2", "o3", "o4"] {
    graph.add_operator(generic(name)).unwrap();
  }
  link(&mut graph, "o1.out", "o1", "o2", Locality::Default);
  link(&mut graph, "o2.out", "o2", "o3", Locality::ContainerLocal);
  link(&mut graph, "o3.out", "o3", "o4", Locality::ThreadLocal);
  graph.attributes_mut().set(CONTAINERS_MAX_COUNT, 2);
  graph
}

/// `node1 -> node2 (3 partitions) -> node3` with queue capacity 1111 on
/// node2's output and 2222 on node3's input, six containers allowed.
pub(crate) fn static_partition_graph() -> LogicalGraph {
  let mut graph = LogicalGraph::new();
  graph.add_operator(source("node1")).unwrap();
  graph
    .add_operator(generic("node2").with_attribute(INITIAL_PARTITION_COUNT, 3))
    .unwrap();
  graph.add_operator(generic("node3")).unwrap();
  graph
    .set_output_port_attribute(&PortRef::new("node2", "out"), QUEUE_CAPACITY, 1111)
    .unwrap();
  graph
    .set_input_port_attribute(&PortRef::new("node3", "in"), QUEUE_CAPACITY, 2222)
    .unwrap();
  link(&mut graph, "n1n2", "node1", "node2", Locality::Default);
  link(&mut graph, "n2n3", "node2", "node3", Locality::Default);
  graph.attributes_mut().set(CONTAINERS_MAX_COUNT, 6);
  graph
}

/// `n1 -> n2 -> n3` over DEFAULT streams, two containers allowed.
pub(crate) fn three_node_graph() -> LogicalGraph {
  let mut graph = LogicalGraph::new();
  graph.add_operator(source("n1")).unwrap();
  graph.add_operator(generic("n2")).unwrap();
  graph.add_operator(generic("n3")).unwrap();
  link(&mut graph, "n1n2", "n1", "n2", Locality::Default);
  link(&mut graph, "n2n3", "n2", "n3", Locality::Default);
  graph.attributes_mut().set(CONTAINERS_MAX_COUNT, 2);
  graph
}

pub(crate) fn manager(graph: &LogicalGraph) -> ContainerManager {
  ContainerManager::new(
    graph,
    PlanConfig::default(),
    &CodecRegistry::new(),
    Arc::new(InMemoryCheckpointStore::new()),
  )
  .unwrap()
}

pub(crate) fn grant(external_id: &str) -> ResourceGrant {
  ResourceGrant::new(external_id, "localhost", 1024)
}

pub(crate) fn address(port: u16) -> TransportAddress {
  TransportAddress::new("localhost", port)
}
