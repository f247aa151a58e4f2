//! Packs operators into container slots.
//!
//! Operators joined by a co-locating connection form a locality group that is
//! always placed as a unit. Groups are taken in order of their lowest operator
//! id. A group opens a new slot while the cap allows; after that it joins the
//! slot with the fewest operators that still has memory for it.

use super::{ContainerSlot, OperatorId, PhysicalPlan, ResourceRequest, SlotId};
use crate::config::PlanConfig;
use crate::error::PlanError;
use std::collections::BTreeMap;
use tracing::debug;

/// Union-find over operator ids; every root is the smallest id of its set.
struct DisjointSet {
  parent: BTreeMap<OperatorId, OperatorId>,
}

impl DisjointSet {
  fn new(ids: impl Iterator<Item = OperatorId>) -> Self {
    Self {
      parent: ids.map(|id| (id, id)).collect(),
    }
  }

  fn find(&mut self, mut id: OperatorId) -> OperatorId {
    while let Some(&parent) = self.parent.get(&id) {
      if parent == id {
        break;
      }
      let grandparent = self.parent.get(&parent).copied().unwrap_or(parent);
      self.parent.insert(id, grandparent);
      id = grandparent;
    }
    id
  }

  fn union(&mut self, a: OperatorId, b: OperatorId) {
    let (a, b) = (self.find(a), self.find(b));
    if a != b {
      let (root, child) = if a < b { (a, b) } else { (b, a) };
      self.parent.insert(child, root);
    }
  }
}

/// Locality groups of `plan`, each sorted, ordered by lowest member id.
pub(crate) fn locality_groups(plan: &PhysicalPlan) -> Vec<Vec<OperatorId>> {
  let mut sets = DisjointSet::new(plan.operators.keys().copied());
  for connection in plan.connections.values() {
    if connection.locality.requires_co_location() {
      sets.union(connection.source, connection.sink);
    }
  }

  let mut groups: BTreeMap<OperatorId, Vec<OperatorId>> = BTreeMap::new();
  for id in plan.operators.keys().copied() {
    let root = sets.find(id);
    groups.entry(root).or_default().push(id);
  }
  groups.into_values().collect()
}

/// The locality group containing `id`.
pub(crate) fn co_located_with(plan: &PhysicalPlan, id: OperatorId) -> Vec<OperatorId> {
  locality_groups(plan)
    .into_iter()
    .find(|group| group.contains(&id))
    .unwrap_or_default()
}

fn group_names(plan: &PhysicalPlan, group: &[OperatorId]) -> Vec<String> {
  group
    .iter()
    .filter_map(|id| plan.operators.get(id))
    .map(|o| o.logical.clone())
    .collect()
}

/// Creates the slots of `plan` and returns one resource request per slot.
///
/// # Errors
///
/// Returns [`PlanError::LocalityGroupTooLarge`] when a group outgrows one
/// container and [`PlanError::ContainerLimitExceeded`] when no slot within the
/// cap has room left.
pub(crate) fn assign_slots(
  plan: &mut PhysicalPlan,
  max_containers: u32,
  config: &PlanConfig,
) -> Result<Vec<ResourceRequest>, PlanError> {
  let capacity = config.container_memory_mb;
  let mut slots: Vec<ContainerSlot> = Vec::new();

  for group in locality_groups(plan) {
    let required = group
      .iter()
      .filter_map(|id| plan.operators.get(id))
      .try_fold(0u32, |sum, o| sum.checked_add(o.memory_mb))
      .ok_or_else(|| PlanError::MemoryOverflow { operators: group_names(plan, &group) })?;
    if let Some(capacity_mb) = capacity {
      if required > capacity_mb {
        return Err(PlanError::LocalityGroupTooLarge {
          operators: group_names(plan, &group),
          required_mb: required,
          capacity_mb,
        });
      }
    }

    let target = if (slots.len() as u32) < max_containers {
      slots.push(ContainerSlot::new(SlotId(slots.len() as u32 + 1)));
      slots.len() - 1
    } else {
      slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| {
          capacity.is_none_or(|cap| slot.memory_mb.checked_add(required).is_some_and(|mb| mb <= cap))
        })
        .min_by_key(|(index, slot)| (slot.operators.len(), *index))
        .map(|(index, _)| index)
        .ok_or(PlanError::ContainerLimitExceeded { max_containers })?
    };

    let slot = &mut slots[target];
    slot.memory_mb = slot
      .memory_mb
      .checked_add(required)
      .ok_or_else(|| PlanError::MemoryOverflow { operators: group_names(plan, &group) })?;
    for id in &group {
      slot.operators.insert(*id);
      if let Some(operator) = plan.operators.get_mut(id) {
        operator.slot = slot.id;
      }
    }
    debug!(slot = %slot.id, operators = ?group, memory_mb = required, "placed locality group");
  }

  let requests = slots
    .iter()
    .map(|slot| ResourceRequest {
      slot: slot.id,
      memory_mb: slot.memory_mb,
      vcores: config.container_vcores,
    })
    .collect();
  plan.slots = slots;
  plan.container_memory_mb = capacity;
  Ok(requests)
}
