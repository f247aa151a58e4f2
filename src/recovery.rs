//! # Recovery Coordinator
//!
//! Reacts to the loss of a container: the slot is marked `KILLED`, a
//! replacement container is requested for the same slot and every consumer
//! that reads from the lost container across the network is scheduled for
//! undeploy and redeploy so it reconnects once the replacement is up.

use crate::checkpoint::{retrieve_operator, WindowSelector};
use crate::orchestrator::ContainerManager;
use crate::plan::{ContainerSlot, OperatorId, OperatorKind, OperatorState, ResourceRequest, SlotId, SlotState};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

impl ContainerManager {
  /// Handles the loss of the container `external_id`.
  ///
  /// The killed slot keeps its pending sets; they are rebuilt when the slot is
  /// bound again. Each of its operators is set to resume from its latest
  /// checkpoint window. Exactly one resource request for the slot is queued.
  ///
  /// # Returns
  ///
  /// The killed slot, or `None` if `external_id` is not bound.
  pub fn schedule_container_restart(&mut self, external_id: &str) -> Option<SlotId> {
    let Some(slot_id) = self.allocations.remove(external_id) else {
      warn!(external_id, "restart requested for unknown container");
      return None;
    };
    let slot = self.plan.slot_mut(slot_id)?;
    slot.set_state(SlotState::Killed);
    let residents: Vec<OperatorId> = slot.operators().iter().copied().collect();
    let memory_mb = slot.memory_mb();

    for id in &residents {
      self.restore_window(*id);
    }

    if self.requests.iter().any(|r| r.slot == slot_id) {
      warn!(slot = %slot_id, "replacement already requested");
    } else {
      let request = ResourceRequest {
        slot: slot_id,
        memory_mb,
        vcores: self.config.container_vcores,
      };
      self.requests.push_back(request.clone());
      self.outbox.push(request);
    }

    let consumers: BTreeSet<(SlotId, OperatorId)> = residents
      .iter()
      .flat_map(|id| self.plan.outputs_of(*id))
      .filter_map(|c| self.plan.operator(c.sink))
      .filter(|sink| sink.slot() != slot_id)
      .filter(|sink| self.plan.slot(sink.slot()).is_some_and(ContainerSlot::is_bound))
      .map(|sink| (sink.slot(), sink.id()))
      .collect();
    for (slot, id) in &consumers {
      self.requeue(*slot, *id);
    }

    info!(
      external_id,
      slot = %slot_id,
      operators = residents.len(),
      consumers = consumers.len(),
      "container restart scheduled"
    );
    Some(slot_id)
  }

  /// Points `id` at its latest checkpoint and validates recovered unifiers.
  fn restore_window(&mut self, id: OperatorId) {
    let window = match self.checkpoints.latest_window(id) {
      Ok(window) => window,
      Err(e) => {
        error!(operator = %id, error = %e, "cannot list checkpoints");
        None
      }
    };

    let is_unifier = self
      .plan
      .operator(id)
      .is_some_and(|o| o.kind() == OperatorKind::Unifier);
    if is_unifier && window.is_some() {
      if let Err(e) = retrieve_operator(
        self.checkpoints.as_ref(),
        id,
        WindowSelector::Latest,
        OperatorKind::Unifier,
      ) {
        error!(operator = %id, error = %e, "unifier checkpoint failed validation");
      }
    }

    self.delivered.remove(&id);
    if let Some(operator) = self.plan.operator_mut(id) {
      operator.set_recovery_window(window);
      operator.set_state(OperatorState::Planned);
    }
  }
}
