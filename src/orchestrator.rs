//! # Container Orchestrator
//!
//! Binds the slots of a compiled plan to real containers and drives operator
//! deployment through worker heartbeats.
//!
//! A slot moves `NEW -> ALLOCATED` when a resource grant is applied,
//! `ALLOCATED -> ACTIVE` on its first heartbeat and `-> KILLED` when its
//! container is lost (see [recovery](crate::recovery)). A killed slot gets a new
//! resource request and is bound again by the next matching grant.
//!
//! Every mutation goes through `&mut ContainerManager`. Concurrent callers use
//! the [control loop](crate::control_loop), which applies commands one at a time.

use crate::checkpoint::{write_snapshot, CheckpointStore, OperatorSnapshot};
use crate::config::PlanConfig;
use crate::deploy::{pending_descriptors, DeployDescriptor};
use crate::error::{AssignmentError, PlanError};
use crate::graph::{Locality, LogicalGraph};
use crate::partitioning::CodecRegistry;
use crate::plan::compiler::PlanCompiler;
use crate::plan::{
  ContainerSlot, OperatorId, OperatorState, PhysicalOperator, PhysicalPlan, PlanSummary,
  ResourceRequest, SlotId, SlotState, TransportAddress,
};
use crate::protocol::{ContainerHeartbeat, HeartbeatResponse};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A container granted by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGrant {
  /// Resource manager's id for the container.
  pub external_id: String,
  /// Host the container runs on.
  pub host: String,
  /// Granted memory in megabytes.
  pub memory_mb: u32,
  /// Slot the grant answers; `None` takes the oldest outstanding request.
  pub slot: Option<SlotId>,
}

impl ResourceGrant {
  /// Creates a grant for the oldest outstanding request.
  pub fn new(external_id: impl Into<String>, host: impl Into<String>, memory_mb: u32) -> Self {
    Self {
      external_id: external_id.into(),
      host: host.into(),
      memory_mb,
      slot: None,
    }
  }

  /// Targets the request of a specific slot.
  #[must_use]
  pub fn with_slot(mut self, slot: SlotId) -> Self {
    self.slot = Some(slot);
    self
  }
}

/// Owns the physical plan and every piece of orchestration state.
#[derive(Debug)]
pub struct ContainerManager {
  pub(crate) config: PlanConfig,
  pub(crate) plan: PhysicalPlan,
  /// Outstanding requests, oldest first.
  pub(crate) requests: VecDeque<ResourceRequest>,
  /// Requests not yet handed to the resource manager.
  pub(crate) outbox: Vec<ResourceRequest>,
  /// External id to slot, for live containers only.
  pub(crate) allocations: HashMap<String, SlotId>,
  /// Operators sent in a heartbeat deploy batch and not acknowledged yet.
  pub(crate) delivered: HashSet<OperatorId>,
  pub(crate) checkpoints: Arc<dyn CheckpointStore>,
}

/// View of one bound container.
#[derive(Debug, Clone, Copy)]
pub struct ContainerAgent<'a> {
  plan: &'a PhysicalPlan,
  slot: SlotId,
}

impl<'a> ContainerAgent<'a> {
  /// The bound slot.
  pub fn slot_id(&self) -> SlotId {
    self.slot
  }

  /// The bound slot's state.
  pub fn container(&self) -> Option<&'a ContainerSlot> {
    self.plan.slot(self.slot)
  }

  /// Descriptors for the slot's pending deployments.
  ///
  /// Repeated calls return equal batches until the plan changes.
  pub fn deploy_info(&self) -> Vec<DeployDescriptor> {
    pending_descriptors(self.plan, self.slot)
  }
}

impl ContainerManager {
  /// Compiles `graph` and writes the initial checkpoint of every operator.
  ///
  /// # Errors
  ///
  /// Returns [`PlanError`] if compilation fails or a checkpoint cannot be written.
  pub fn new(
    graph: &LogicalGraph,
    config: PlanConfig,
    codecs: &CodecRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
  ) -> Result<Self, PlanError> {
    let compiled = PlanCompiler::new(&config, codecs).compile(graph)?;
    for operator in compiled.plan.operators() {
      write_snapshot(checkpoints.as_ref(), &OperatorSnapshot::initial(operator))?;
    }

    Ok(Self {
      config,
      plan: compiled.plan,
      requests: compiled.requests.iter().cloned().collect(),
      outbox: compiled.requests,
      allocations: HashMap::new(),
      delivered: HashSet::new(),
      checkpoints,
    })
  }

  /// The physical plan.
  pub fn plan(&self) -> &PhysicalPlan {
    &self.plan
  }

  /// Configuration the plan was compiled with.
  pub fn config(&self) -> &PlanConfig {
    &self.config
  }

  /// Checkpoint store used for recovery.
  pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
    &self.checkpoints
  }

  /// Outstanding resource requests, oldest first.
  pub fn resource_requests(&self) -> impl Iterator<Item = &ResourceRequest> {
    self.requests.iter()
  }

  /// Drains requests created since the last call, for the resource manager.
  pub fn take_new_requests(&mut self) -> Vec<ResourceRequest> {
    std::mem::take(&mut self.outbox)
  }

  /// Slot bound to a live container.
  pub fn allocated_slot(&self, external_id: &str) -> Option<SlotId> {
    self.allocations.get(external_id).copied()
  }

  /// Handle on a live container.
  pub fn container_agent(&self, external_id: &str) -> Option<ContainerAgent<'_>> {
    self.allocated_slot(external_id).map(|slot| ContainerAgent {
      plan: &self.plan,
      slot,
    })
  }

  /// Descriptors for a slot's pending deployments.
  pub fn deploy_info(&self, slot: SlotId) -> Vec<DeployDescriptor> {
    pending_descriptors(&self.plan, slot)
  }

  /// Plan overview including outstanding requests.
  pub fn summary(&self) -> PlanSummary {
    let requests: Vec<ResourceRequest> = self.requests.iter().cloned().collect();
    self.plan.summary(&requests)
  }

  /// Binds a granted container to the slot of an outstanding request.
  ///
  /// Every operator of the slot becomes pending for deployment. Consumers on
  /// other live containers that run, or were sent a deploy batch, against this
  /// slot's operators are re-queued so they learn the new address.
  ///
  /// # Errors
  ///
  /// Returns [`AssignmentError`] if the container is already bound or no
  /// request matches. The plan is left untouched in that case.
  pub fn assign_container(
    &mut self,
    grant: &ResourceGrant,
    address: TransportAddress,
  ) -> Result<ContainerAgent<'_>, AssignmentError> {
    if self.allocations.contains_key(&grant.external_id) {
      warn!(external_id = %grant.external_id, "rejected grant for container already assigned");
      return Err(AssignmentError::AlreadyAssigned {
        external_id: grant.external_id.clone(),
      });
    }
    let position = match grant.slot {
      Some(slot) => self.requests.iter().position(|r| r.slot == slot),
      None => (!self.requests.is_empty()).then_some(0),
    };
    let Some(request) = position.and_then(|p| self.requests.remove(p)) else {
      warn!(external_id = %grant.external_id, slot = ?grant.slot, "rejected grant without outstanding request");
      return Err(AssignmentError::NoOutstandingRequest {
        external_id: grant.external_id.clone(),
      });
    };
    if grant.memory_mb < request.memory_mb {
      warn!(
        external_id = %grant.external_id,
        granted_mb = grant.memory_mb,
        requested_mb = request.memory_mb,
        "container granted less memory than requested"
      );
    }

    let slot_id = request.slot;
    let residents: Vec<OperatorId> = match self.plan.slot_mut(slot_id) {
      Some(slot) => {
        slot.bind(grant.external_id.clone(), address.clone());
        slot.operators().iter().copied().collect()
      }
      None => Vec::new(),
    };
    for id in &residents {
      if let Some(operator) = self.plan.operator_mut(*id) {
        operator.set_state(OperatorState::PendingDeploy);
      }
    }
    self.allocations.insert(grant.external_id.clone(), slot_id);
    info!(
      external_id = %grant.external_id,
      slot = %slot_id,
      %address,
      operators = residents.len(),
      "container assigned"
    );

    self.renotify_consumers(slot_id, &residents);
    Ok(ContainerAgent {
      plan: &self.plan,
      slot: slot_id,
    })
  }

  /// Re-queues cross-container consumers of `producers` that hold a
  /// descriptor built before the producers were bound.
  fn renotify_consumers(&mut self, producer_slot: SlotId, producers: &[OperatorId]) {
    let consumers: BTreeSet<(SlotId, OperatorId)> = producers
      .iter()
      .flat_map(|id| self.plan.outputs_of(*id))
      .filter(|c| c.locality != Locality::ThreadLocal)
      .filter_map(|c| self.plan.operator(c.sink))
      .filter(|sink| sink.slot() != producer_slot && self.holds_descriptor(sink))
      .filter(|sink| self.plan.slot(sink.slot()).is_some_and(ContainerSlot::is_bound))
      .map(|sink| (sink.slot(), sink.id()))
      .collect();

    for (slot, id) in consumers {
      self.requeue(slot, id);
      info!(operator = %id, slot = %slot, producer_slot = %producer_slot, "consumer re-queued for new producer address");
    }
  }

  /// Running operators and operators whose deploy batch is in flight.
  fn holds_descriptor(&self, operator: &PhysicalOperator) -> bool {
    match operator.state() {
      OperatorState::Active => true,
      OperatorState::PendingDeploy => self.delivered.contains(&operator.id()),
      _ => false,
    }
  }

  /// Schedules an undeploy followed by a redeploy of `operator` in `slot`.
  pub(crate) fn requeue(&mut self, slot: SlotId, operator: OperatorId) {
    if let Some(slot) = self.plan.slot_mut(slot) {
      slot.pending_undeploy_mut().insert(operator);
      slot.pending_deploy_mut().insert(operator);
    }
    if let Some(op) = self.plan.operator_mut(operator) {
      op.set_state(OperatorState::PendingUndeploy);
    }
  }

  /// Applies a worker heartbeat and returns the worker's next instructions.
  ///
  /// Heartbeats from containers that are not bound are dropped and yield `None`.
  pub fn process_heartbeat(&mut self, heartbeat: &ContainerHeartbeat) -> Option<HeartbeatResponse> {
    let Some(slot_id) = self.allocated_slot(&heartbeat.external_id) else {
      warn!(external_id = %heartbeat.external_id, "dropped heartbeat from unknown container");
      return None;
    };
    let slot = self.plan.slot_mut(slot_id)?;
    if slot.state() == SlotState::Allocated {
      slot.set_state(SlotState::Active);
      info!(external_id = %heartbeat.external_id, slot = %slot_id, "container active");
    }

    let mut transitions = Vec::new();
    for id in &heartbeat.undeployed {
      if slot.pending_undeploy_mut().remove(id) {
        let next = if slot.pending_deploy().contains(id) {
          OperatorState::PendingDeploy
        } else {
          OperatorState::Removed
        };
        transitions.push((*id, next));
      }
    }
    for id in &heartbeat.deployed {
      if !slot.pending_undeploy().contains(id) && slot.pending_deploy_mut().remove(id) {
        transitions.push((*id, OperatorState::Active));
      }
    }
    let undeploy: Vec<OperatorId> = slot.pending_undeploy().iter().copied().collect();
    let has_deploy = !slot.pending_deploy().is_empty();

    for (id, state) in transitions {
      self.delivered.remove(&id);
      if let Some(operator) = self.plan.operator_mut(id) {
        operator.set_state(state);
      }
      debug!(operator = %id, slot = %slot_id, ?state, "acknowledged by worker");
    }

    let response = if !undeploy.is_empty() {
      HeartbeatResponse {
        undeploy_request: Some(undeploy),
        deploy_request: None,
      }
    } else if has_deploy {
      let batch = pending_descriptors(&self.plan, slot_id);
      self.delivered.extend(batch.iter().map(|d| d.id));
      HeartbeatResponse {
        undeploy_request: None,
        deploy_request: Some(batch),
      }
    } else {
      HeartbeatResponse::default()
    };
    Some(response)
  }
}
