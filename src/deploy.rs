//! # Deploy Descriptors
//!
//! Serializable view of a physical operator and its connections, handed to the
//! worker runtime that instantiates the operator.
//!
//! Each inbound connection becomes an [`InputEndpoint`] and each outbound one an
//! [`OutputEndpoint`]. An endpoint carries a transport address only when the
//! two operators run in different containers and the stream is not
//! `THREAD_LOCAL`. A producer whose container is not bound yet leaves the
//! address empty; the consumer is re-queued once the producer is bound.

use crate::attributes::Attributes;
use crate::graph::{Locality, LogicRef};
use crate::partitioning::PartitionKeys;
use crate::plan::{Connection, OperatorId, OperatorKind, PhysicalOperator, PhysicalPlan, SlotId, TransportAddress};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Everything a worker needs to run one operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployDescriptor {
  /// Logical operator name; unifiers carry their upstream's name.
  pub declared_id: String,
  /// Operator role.
  pub kind: OperatorKind,
  /// Physical operator id.
  pub id: OperatorId,
  /// Executable logic.
  pub logic: LogicRef,
  /// Operator attribute snapshot.
  pub attributes: Attributes,
  /// Window to restore from, set after a restart.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub recovery_window: Option<u64>,
  /// Inbound streams.
  pub inputs: Vec<InputEndpoint>,
  /// Outbound streams.
  pub outputs: Vec<OutputEndpoint>,
}

impl fmt::Display for DeployDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inputs: Vec<&str> = self.inputs.iter().map(|i| i.port_name.as_str()).collect();
    let outputs: Vec<&str> = self.outputs.iter().map(|o| o.port_name.as_str()).collect();
    write!(
      f,
      "DeployDescriptor[id={},declared={},kind={:?},inputs={:?},outputs={:?}]",
      self.id, self.declared_id, self.kind, inputs, outputs
    )
  }
}

/// Subscription side of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEndpoint {
  /// Declared logical stream.
  pub declared_stream_id: String,
  /// Consuming port; `<merge:port>` on unifiers.
  pub port_name: String,
  /// Producing operator.
  pub source_operator: OperatorId,
  /// Producing port.
  pub source_port: String,
  /// Placement constraint.
  pub locality: Locality,
  /// Subscription filter; absent unless the leg is statically partitioned.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub partition_keys: Option<PartitionKeys>,
  /// Codec reference; absent unless declared.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub codec: Option<String>,
  /// Attributes of the consuming end.
  pub attributes: Attributes,
  /// Where to subscribe; absent for co-resident or unresolved producers.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<TransportAddress>,
}

/// Publishing side of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEndpoint {
  /// Declared logical stream.
  pub declared_stream_id: String,
  /// Producing port.
  pub port_name: String,
  /// Consuming operator.
  pub sink_operator: OperatorId,
  /// Consuming port.
  pub sink_port: String,
  /// Placement constraint.
  pub locality: Locality,
  /// Codec reference; absent unless declared.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub codec: Option<String>,
  /// Attributes of the producing end.
  pub attributes: Attributes,
  /// Where to publish; absent for co-resident consumers.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<TransportAddress>,
}

/// Returns `true` if the connection needs no transport address.
fn is_local(plan: &PhysicalPlan, connection: &Connection) -> bool {
  if connection.locality == Locality::ThreadLocal {
    return true;
  }
  match (plan.operator(connection.source), plan.operator(connection.sink)) {
    (Some(source), Some(sink)) => source.slot() == sink.slot(),
    _ => false,
  }
}

fn input_endpoint(plan: &PhysicalPlan, connection: &Connection) -> InputEndpoint {
  let address = if is_local(plan, connection) {
    None
  } else {
    plan
      .slot_of(connection.source)
      .and_then(|slot| slot.live_address())
      .cloned()
  };
  InputEndpoint {
    declared_stream_id: connection.stream_id.clone(),
    port_name: connection.sink_port.clone(),
    source_operator: connection.source,
    source_port: connection.source_port.clone(),
    locality: connection.locality,
    partition_keys: connection.partition_keys.clone(),
    codec: connection.codec.clone(),
    attributes: connection.sink_attributes.clone(),
    address,
  }
}

fn output_endpoint(plan: &PhysicalPlan, connection: &Connection) -> OutputEndpoint {
  let address = if is_local(plan, connection) {
    None
  } else {
    plan
      .slot_of(connection.source)
      .and_then(|slot| slot.live_address())
      .cloned()
  };
  OutputEndpoint {
    declared_stream_id: connection.stream_id.clone(),
    port_name: connection.source_port.clone(),
    sink_operator: connection.sink,
    sink_port: connection.sink_port.clone(),
    locality: connection.locality,
    codec: connection.codec.clone(),
    attributes: connection.source_attributes.clone(),
    address,
  }
}

/// Builds the descriptor of one operator.
pub fn describe(plan: &PhysicalPlan, operator: &PhysicalOperator) -> DeployDescriptor {
  DeployDescriptor {
    declared_id: operator.logical_name().to_string(),
    kind: operator.kind(),
    id: operator.id(),
    logic: operator.logic().clone(),
    attributes: operator.attributes().clone(),
    recovery_window: operator.recovery_window(),
    inputs: plan
      .inputs_of(operator.id())
      .map(|c| input_endpoint(plan, c))
      .collect(),
    outputs: plan
      .outputs_of(operator.id())
      .map(|c| output_endpoint(plan, c))
      .collect(),
  }
}

/// Descriptors for the operators awaiting deployment in `slot`.
///
/// Producers come before consumers they feed inside the slot; otherwise
/// operators are ordered by id. Calling this twice without a state change in
/// between yields equal batches.
pub fn pending_descriptors(plan: &PhysicalPlan, slot: SlotId) -> Vec<DeployDescriptor> {
  let Some(slot) = plan.slot(slot) else {
    return Vec::new();
  };
  deploy_order(plan, slot.pending_deploy())
    .into_iter()
    .filter_map(|id| plan.operator(id))
    .map(|operator| describe(plan, operator))
    .collect()
}

/// Kahn's algorithm over the connections between `pending` operators.
fn deploy_order(plan: &PhysicalPlan, pending: &BTreeSet<OperatorId>) -> Vec<OperatorId> {
  let mut in_degree: BTreeMap<OperatorId, usize> = pending.iter().map(|id| (*id, 0)).collect();
  for id in pending {
    for connection in plan.outputs_of(*id) {
      if let Some(degree) = in_degree.get_mut(&connection.sink) {
        *degree += 1;
      }
    }
  }

  let mut order = Vec::with_capacity(pending.len());
  let mut ready: BTreeSet<OperatorId> = in_degree
    .iter()
    .filter(|(_, degree)| **degree == 0)
    .map(|(id, _)| *id)
    .collect();
  while let Some(current) = ready.pop_first() {
    order.push(current);
    for connection in plan.outputs_of(current) {
      if let Some(degree) = in_degree.get_mut(&connection.sink) {
        *degree -= 1;
        if *degree == 0 {
          ready.insert(connection.sink);
        }
      }
    }
  }

  // A plan compiled from a DAG never leaves anything behind.
  for id in pending {
    if !order.contains(id) {
      order.push(*id);
    }
  }
  order
}
