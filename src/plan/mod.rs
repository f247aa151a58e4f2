//! # Physical Plan
//!
//! Concrete operator instances, the connections between them and the container
//! slots that host them.
//!
//! The plan is produced once by the [compiler](compiler) and afterwards mutated
//! only by the [orchestrator](crate::orchestrator) and the
//! [recovery coordinator](crate::recovery). It upholds two ownership rules:
//!
//! - every operator is resident in exactly one slot, and the slot's resident set
//!   and the operator's `slot` always agree;
//! - operators linked by a `CONTAINER_LOCAL` or `THREAD_LOCAL` connection share
//!   a slot.

pub mod compiler;
pub mod placement;


use crate::attributes::Attributes;
use crate::graph::{Locality, LogicRef};
use crate::partitioning::PartitionKeys;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

macro_rules! numeric_id {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct $name(pub u32);

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
      }
    }
  };
}

numeric_id!(
  /// Numeric id of a physical operator, unique within a plan.
  OperatorId
);
numeric_id!(
  /// Id of a logical container slot.
  SlotId
);
numeric_id!(
  /// Id of a connection between two physical operators.
  ConnectionId
);

/// Role of a physical operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorKind {
  /// No upstream connections.
  Input,
  /// Consumes and produces streams.
  Generic,
  /// Synthetic merge of partitioned upstream instances.
  Unifier,
}

/// Deployment lifecycle of a physical operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorState {
  /// Compiled, slot not yet bound.
  Planned,
  /// Waiting for the worker to acknowledge a deploy.
  PendingDeploy,
  /// Running.
  Active,
  /// Waiting for the worker to acknowledge an undeploy.
  PendingUndeploy,
  /// Undeployed and not scheduled again.
  Removed,
}

/// A concrete instance of a logical operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PhysicalOperator {
  id: OperatorId,
  logical: String,
  logic: LogicRef,
  kind: OperatorKind,
  attributes: Attributes,
  partition_keys: Option<PartitionKeys>,
  memory_mb: u32,
  slot: SlotId,
  state: OperatorState,
  inputs: Vec<ConnectionId>,
  outputs: Vec<ConnectionId>,
  recovery_window: Option<u64>,
}

impl PhysicalOperator {
  /// Numeric id.
  pub fn id(&self) -> OperatorId {
    self.id
  }

  /// Name of the backing logical operator; unifiers carry their upstream's name.
  pub fn logical_name(&self) -> &str {
    &self.logical
  }

  /// Executable logic.
  pub fn logic(&self) -> &LogicRef {
    &self.logic
  }

  /// Role.
  pub fn kind(&self) -> OperatorKind {
    self.kind
  }

  /// Operator attribute snapshot.
  pub fn attributes(&self) -> &Attributes {
    &self.attributes
  }

  /// Keys owned by a partitioned instance; `None` when not partitioned.
  pub fn partition_keys(&self) -> Option<&PartitionKeys> {
    self.partition_keys.as_ref()
  }

  /// Memory ask in megabytes.
  pub fn memory_mb(&self) -> u32 {
    self.memory_mb
  }

  /// Owning slot.
  pub fn slot(&self) -> SlotId {
    self.slot
  }

  /// Lifecycle state.
  pub fn state(&self) -> OperatorState {
    self.state
  }

  /// Inbound connections.
  pub fn inputs(&self) -> &[ConnectionId] {
    &self.inputs
  }

  /// Outbound connections.
  pub fn outputs(&self) -> &[ConnectionId] {
    &self.outputs
  }

  /// Checkpoint window the operator restores from after a restart.
  pub fn recovery_window(&self) -> Option<u64> {
    self.recovery_window
  }

  pub(crate) fn set_state(&mut self, state: OperatorState) {
    self.state = state;
  }

  pub(crate) fn set_recovery_window(&mut self, window: Option<u64>) {
    self.recovery_window = window;
  }
}

/// Directed edge between two physical operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
  /// Connection id.
  pub id: ConnectionId,
  /// Declared logical stream.
  pub stream_id: String,
  /// Producing operator.
  pub source: OperatorId,
  /// Producing port.
  pub source_port: String,
  /// Consuming operator.
  pub sink: OperatorId,
  /// Consuming port; `<merge:port>` when the sink is a unifier.
  pub sink_port: String,
  /// Placement constraint.
  pub locality: Locality,
  /// Keys the sink receives; `None` unless this is a partitioned leg.
  pub partition_keys: Option<PartitionKeys>,
  /// Codec reference; `None` unless declared on the stream.
  pub codec: Option<String>,
  /// Attribute snapshot describing the producing end.
  pub source_attributes: Attributes,
  /// Attribute snapshot describing the consuming end.
  pub sink_attributes: Attributes,
}

/// Name of the synthetic input port of a unifier merging `port`.
pub fn merge_port_name(port: &str) -> String {
  format!("<merge:{}>", port)
}

/// Host and port of a container's transport endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportAddress {
  /// Host name.
  pub host: String,
  /// TCP port.
  pub port: u16,
}

impl TransportAddress {
  /// Creates an address.
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }
}

impl fmt::Display for TransportAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

/// Lifecycle state of a container slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
  /// Compiled, waiting for resources.
  New,
  /// Bound to a granted container.
  Allocated,
  /// Container has sent its first heartbeat.
  Active,
  /// Container was lost; waiting for a replacement.
  Killed,
}

/// Logical placement unit, bound to at most one real container at a time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContainerSlot {
  id: SlotId,
  state: SlotState,
  external_id: Option<String>,
  address: Option<TransportAddress>,
  memory_mb: u32,
  operators: BTreeSet<OperatorId>,
  pending_deploy: BTreeSet<OperatorId>,
  pending_undeploy: BTreeSet<OperatorId>,
}

impl ContainerSlot {
  fn new(id: SlotId) -> Self {
    Self {
      id,
      state: SlotState::New,
      external_id: None,
      address: None,
      memory_mb: 0,
      operators: BTreeSet::new(),
      pending_deploy: BTreeSet::new(),
      pending_undeploy: BTreeSet::new(),
    }
  }

  /// Slot id.
  pub fn id(&self) -> SlotId {
    self.id
  }

  /// Lifecycle state.
  pub fn state(&self) -> SlotState {
    self.state
  }

  /// External id of the last container bound to this slot.
  pub fn external_id(&self) -> Option<&str> {
    self.external_id.as_deref()
  }

  /// Transport address of the last container bound to this slot.
  pub fn address(&self) -> Option<&TransportAddress> {
    self.address.as_ref()
  }

  /// Address usable by peers: present only while a container is bound.
  pub fn live_address(&self) -> Option<&TransportAddress> {
    if self.is_bound() {
      self.address.as_ref()
    } else {
      None
    }
  }

  /// Returns `true` while a live container backs the slot.
  pub fn is_bound(&self) -> bool {
    matches!(self.state, SlotState::Allocated | SlotState::Active)
  }

  /// Summed memory ask of the resident operators.
  pub fn memory_mb(&self) -> u32 {
    self.memory_mb
  }

  /// Resident operators.
  pub fn operators(&self) -> &BTreeSet<OperatorId> {
    &self.operators
  }

  /// Operators awaiting a deploy acknowledgement.
  pub fn pending_deploy(&self) -> &BTreeSet<OperatorId> {
    &self.pending_deploy
  }

  /// Operators awaiting an undeploy acknowledgement.
  pub fn pending_undeploy(&self) -> &BTreeSet<OperatorId> {
    &self.pending_undeploy
  }

  pub(crate) fn bind(&mut self, external_id: String, address: TransportAddress) {
    self.external_id = Some(external_id);
    self.address = Some(address);
    self.state = SlotState::Allocated;
    // A fresh container runs nothing yet.
    self.pending_undeploy.clear();
    self.pending_deploy = self.operators.clone();
  }

  pub(crate) fn set_state(&mut self, state: SlotState) {
    self.state = state;
  }

  pub(crate) fn pending_deploy_mut(&mut self) -> &mut BTreeSet<OperatorId> {
    &mut self.pending_deploy
  }

  pub(crate) fn pending_undeploy_mut(&mut self) -> &mut BTreeSet<OperatorId> {
    &mut self.pending_undeploy
  }
}

/// Ask for one container, queued FIFO towards the resource manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
  /// Slot the granted container will be bound to.
  pub slot: SlotId,
  /// Memory ask in megabytes.
  pub memory_mb: u32,
  /// Compute ask in virtual cores.
  pub vcores: u32,
}

/// Error raised when relocating an operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelocationError {
  /// The operator id is not part of the plan.
  #[error("operator {0} does not exist")]
  UnknownOperator(OperatorId),
  /// The slot id is not part of the plan.
  #[error("slot {0} does not exist")]
  UnknownSlot(SlotId),
  /// Only slots that were never bound can exchange operators.
  #[error("slot {0} is already bound to a container")]
  SlotBound(SlotId),
  /// The target slot would outgrow the container size.
  #[error("slot {slot} would need {required_mb} MB, containers offer {capacity_mb} MB")]
  InsufficientMemory {
    /// Target slot.
    slot: SlotId,
    /// Memory the slot would ask for after the move.
    required_mb: u64,
    /// Per-container memory.
    capacity_mb: u32,
  },
}

/// Operators, connections and slots of one application.
#[derive(Clone, Debug, Default)]
pub struct PhysicalPlan {
  operators: BTreeMap<OperatorId, PhysicalOperator>,
  connections: BTreeMap<ConnectionId, Connection>,
  slots: Vec<ContainerSlot>,
  /// Per-container memory the plan was packed against.
  container_memory_mb: Option<u32>,
}

impl PhysicalPlan {
  /// All operators ordered by id.
  pub fn operators(&self) -> impl Iterator<Item = &PhysicalOperator> {
    self.operators.values()
  }

  /// Looks up an operator.
  pub fn operator(&self, id: OperatorId) -> Option<&PhysicalOperator> {
    self.operators.get(&id)
  }

  /// Non-unifier instances of a logical operator, ordered by id.
  pub fn instances_of(&self, logical: &str) -> Vec<&PhysicalOperator> {
    self
      .operators
      .values()
      .filter(|o| o.logical == logical && o.kind != OperatorKind::Unifier)
      .collect()
  }

  /// Unifiers merging the output of a logical operator, ordered by id.
  pub fn unifiers_of(&self, logical: &str) -> Vec<&PhysicalOperator> {
    self
      .operators
      .values()
      .filter(|o| o.logical == logical && o.kind == OperatorKind::Unifier)
      .collect()
  }

  /// All connections ordered by id.
  pub fn connections(&self) -> impl Iterator<Item = &Connection> {
    self.connections.values()
  }

  /// Looks up a connection.
  pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
    self.connections.get(&id)
  }

  /// Inbound connections of an operator in declaration order.
  pub fn inputs_of(&self, id: OperatorId) -> impl Iterator<Item = &Connection> {
    self
      .operators
      .get(&id)
      .into_iter()
      .flat_map(|o| o.inputs.iter())
      .filter_map(|c| self.connections.get(c))
  }

  /// Outbound connections of an operator in declaration order.
  pub fn outputs_of(&self, id: OperatorId) -> impl Iterator<Item = &Connection> {
    self
      .operators
      .get(&id)
      .into_iter()
      .flat_map(|o| o.outputs.iter())
      .filter_map(|c| self.connections.get(c))
  }

  /// All slots ordered by id.
  pub fn slots(&self) -> &[ContainerSlot] {
    &self.slots
  }

  /// Looks up a slot.
  pub fn slot(&self, id: SlotId) -> Option<&ContainerSlot> {
    self.slots.iter().find(|s| s.id == id)
  }

  /// Slot currently hosting an operator.
  pub fn slot_of(&self, id: OperatorId) -> Option<&ContainerSlot> {
    self.operator(id).and_then(|o| self.slot(o.slot))
  }

  /// Slot bound to the given external container id.
  pub fn slot_by_external_id(&self, external_id: &str) -> Option<&ContainerSlot> {
    self
      .slots
      .iter()
      .find(|s| s.is_bound() && s.external_id.as_deref() == Some(external_id))
  }

  /// Moves an operator, together with every operator it must share a
  /// container with, into another slot.
  ///
  /// Each operator is removed from its old slot before it is added to the new
  /// one. Only slots that were never bound may take part, so no deployed
  /// operator ever changes hands.
  ///
  /// # Returns
  ///
  /// The moved operators, ordered by id.
  ///
  /// # Errors
  ///
  /// Returns a [`RelocationError`] if an id is unknown, a slot is not `NEW` or
  /// the target slot would no longer fit in a container.
  pub fn relocate(&mut self, id: OperatorId, to: SlotId) -> Result<Vec<OperatorId>, RelocationError> {
    let from = self
      .operators
      .get(&id)
      .map(|o| o.slot)
      .ok_or(RelocationError::UnknownOperator(id))?;
    for slot in [from, to] {
      let state = self
        .slot(slot)
        .map(|s| s.state)
        .ok_or(RelocationError::UnknownSlot(slot))?;
      if state != SlotState::New {
        return Err(RelocationError::SlotBound(slot));
      }
    }

    let group = placement::co_located_with(self, id);
    let target = self.slot(to).ok_or(RelocationError::UnknownSlot(to))?;
    let required_mb = group
      .iter()
      .filter_map(|op| self.operators.get(op))
      .filter(|op| op.slot != to)
      .map(|op| u64::from(op.memory_mb))
      .sum::<u64>()
      + u64::from(target.memory_mb);
    let fits = u32::try_from(required_mb)
      .is_ok_and(|mb| self.container_memory_mb.is_none_or(|cap| mb <= cap));
    if !fits {
      return Err(RelocationError::InsufficientMemory {
        slot: to,
        required_mb,
        capacity_mb: self.container_memory_mb.unwrap_or(u32::MAX),
      });
    }

    for op in &group {
      self.move_operator(*op, to);
    }
    Ok(group)
  }

  pub(crate) fn operator_mut(&mut self, id: OperatorId) -> Option<&mut PhysicalOperator> {
    self.operators.get_mut(&id)
  }

  pub(crate) fn slot_mut(&mut self, id: SlotId) -> Option<&mut ContainerSlot> {
    self.slots.iter_mut().find(|s| s.id == id)
  }

  fn move_operator(&mut self, id: OperatorId, to: SlotId) {
    let Some(op) = self.operators.get_mut(&id) else {
      return;
    };
    let from = std::mem::replace(&mut op.slot, to);
    let memory = op.memory_mb;
    if let Some(old) = self.slots.iter_mut().find(|s| s.id == from) {
      old.operators.remove(&id);
      old.memory_mb = old.memory_mb.saturating_sub(memory);
    }
    if let Some(new) = self.slots.iter_mut().find(|s| s.id == to) {
      new.operators.insert(id);
      new.memory_mb = new.memory_mb.saturating_add(memory);
    }
  }

  /// Exchanges the ids of two operators everywhere in the plan.
  #[cfg(test)]
  pub(crate) fn swap_operator_ids(&mut self, a: OperatorId, b: OperatorId) {
    let swap = |id: OperatorId| match id {
      id if id == a => b,
      id if id == b => a,
      id => id,
    };
    self.operators = std::mem::take(&mut self.operators)
      .into_values()
      .map(|mut op| {
        op.id = swap(op.id);
        (op.id, op)
      })
      .collect();
    for connection in self.connections.values_mut() {
      connection.source = swap(connection.source);
      connection.sink = swap(connection.sink);
    }
    for slot in &mut self.slots {
      for set in [&mut slot.operators, &mut slot.pending_deploy, &mut slot.pending_undeploy] {
        *set = set.iter().copied().map(swap).collect();
      }
    }
  }

  /// Serializable overview of the plan.
  pub fn summary(&self, requests: &[ResourceRequest]) -> PlanSummary {
    PlanSummary {
      slots: self
        .slots
        .iter()
        .map(|slot| SlotSummary {
          id: slot.id,
          state: slot.state,
          external_id: slot.external_id.clone(),
          address: slot.address.clone(),
          memory_mb: slot.memory_mb,
          operators: slot
            .operators
            .iter()
            .filter_map(|id| self.operators.get(id))
            .map(|op| OperatorSummary {
              id: op.id,
              name: op.logical.clone(),
              kind: op.kind,
              state: op.state,
              partition_keys: op
                .partition_keys
                .as_ref()
                .map(|keys| keys.iter().map(ToString::to_string).collect()),
            })
            .collect(),
          pending_deploy: slot.pending_deploy.iter().copied().collect(),
          pending_undeploy: slot.pending_undeploy.iter().copied().collect(),
        })
        .collect(),
      connections: self.connections.values().cloned().collect(),
      requests: requests.to_vec(),
    }
  }
}

/// Serializable overview of a plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
  /// Slots with their residents.
  pub slots: Vec<SlotSummary>,
  /// All connections.
  pub connections: Vec<Connection>,
  /// Outstanding resource requests.
  pub requests: Vec<ResourceRequest>,
}

/// One slot in a [`PlanSummary`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSummary {
  /// Slot id.
  pub id: SlotId,
  /// Lifecycle state.
  pub state: SlotState,
  /// Bound container, if any.
  pub external_id: Option<String>,
  /// Bound address, if any.
  pub address: Option<TransportAddress>,
  /// Memory ask.
  pub memory_mb: u32,
  /// Residents.
  pub operators: Vec<OperatorSummary>,
  /// Pending deploys.
  pub pending_deploy: Vec<OperatorId>,
  /// Pending undeploys.
  pub pending_undeploy: Vec<OperatorId>,
}

/// One operator in a [`SlotSummary`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSummary {
  /// Operator id.
  pub id: OperatorId,
  /// Logical name.
  pub name: String,
  /// Role.
  pub kind: OperatorKind,
  /// Lifecycle state.
  pub state: OperatorState,
  /// Rendered partition keys of a partitioned instance.
  pub partition_keys: Option<Vec<String>>,
}
