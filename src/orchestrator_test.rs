//! Tests for container assignment and the heartbeat lifecycle.

use crate::error::AssignmentError;
use crate::plan::{OperatorId, OperatorState, RelocationError, SlotId, SlotState};
use crate::protocol::ContainerHeartbeat;
use crate::test_support::{address, chain_graph, grant, manager, three_node_graph};

fn ids_of(dnm: &crate::orchestrator::ContainerManager, name: &str) -> OperatorId {
  dnm.plan().instances_of(name)[0].id()
}

#[test]
fn test_grants_bind_slots_in_request_order() {
  let mut dnm = manager(&three_node_graph());
  let requested: Vec<SlotId> = dnm.resource_requests().map(|r| r.slot).collect();
  assert_eq!(requested, [SlotId(1), SlotId(2)]);
  assert_eq!(dnm.take_new_requests().len(), 2);
  assert!(dnm.take_new_requests().is_empty());

  let agent = dnm.assign_container(&grant("container1"), address(9001)).unwrap();
  assert_eq!(agent.slot_id(), SlotId(1));
  let slot = agent.container().unwrap();
  assert_eq!(slot.state(), SlotState::Allocated);
  assert_eq!(slot.external_id(), Some("container1"));
  assert_eq!(slot.pending_deploy(), slot.operators());

  for id in dnm.plan().slot(SlotId(1)).unwrap().operators() {
    assert_eq!(dnm.plan().operator(*id).unwrap().state(), OperatorState::PendingDeploy);
  }
  assert_eq!(dnm.allocated_slot("container1"), Some(SlotId(1)));
}

#[test]
fn test_rejected_grants_leave_plan_untouched() {
  let mut dnm = manager(&three_node_graph());
  dnm.assign_container(&grant("container1"), address(9001)).unwrap();

  let before = dnm.summary();
  assert_eq!(
    dnm.assign_container(&grant("container1"), address(9009)).unwrap_err(),
    AssignmentError::AlreadyAssigned {
      external_id: "container1".to_string()
    }
  );
  assert_eq!(
    dnm
      .assign_container(&grant("container9").with_slot(SlotId(1)), address(9009))
      .unwrap_err(),
    AssignmentError::NoOutstandingRequest {
      external_id: "container9".to_string()
    }
  );
  assert_eq!(dnm.summary(), before);

  dnm.assign_container(&grant("container2"), address(9002)).unwrap();
  assert!(matches!(
    dnm.assign_container(&grant("container3"), address(9003)),
    Err(AssignmentError::NoOutstandingRequest { .. })
  ));
}

#[test]
fn test_grant_for_specific_slot() {
  let mut dnm = manager(&three_node_graph());
  let agent = dnm
    .assign_container(&grant("container2").with_slot(SlotId(2)), address(9002))
    .unwrap();
  assert_eq!(agent.slot_id(), SlotId(2));
  let remaining: Vec<SlotId> = dnm.resource_requests().map(|r| r.slot).collect();
  assert_eq!(remaining, [SlotId(1)]);
}

#[test]
fn test_heartbeat_lifecycle() {
  let mut dnm = manager(&three_node_graph());
  dnm.assign_container(&grant("container1"), address(9001)).unwrap();

  let response = dnm.process_heartbeat(&ContainerHeartbeat::new("container1")).unwrap();
  assert!(response.undeploy_request.is_none());
  let batch = response.deploy_request.unwrap();
  assert_eq!(batch.len(), 2);
  assert_eq!(dnm.plan().slot(SlotId(1)).unwrap().state(), SlotState::Active);

  let deployed: Vec<OperatorId> = batch.iter().map(|d| d.id).collect();
  let response = dnm
    .process_heartbeat(&ContainerHeartbeat::new("container1").with_deployed(deployed.clone()))
    .unwrap();
  assert!(response.is_empty());
  for id in deployed {
    assert_eq!(dnm.plan().operator(id).unwrap().state(), OperatorState::Active);
  }
  assert!(dnm.plan().slot(SlotId(1)).unwrap().pending_deploy().is_empty());

  assert!(dnm.process_heartbeat(&ContainerHeartbeat::new("unknown")).is_none());
}

#[test]
fn test_late_producer_requeues_active_consumer() {
  let mut dnm = manager(&chain_graph());
  let o2 = ids_of(&dnm, "o2");

  let batch = dnm
    .assign_container(&grant("container2").with_slot(SlotId(2)), address(9002))
    .unwrap()
    .deploy_info();
  assert_eq!(batch[0].inputs[0].address, None);
  let all: Vec<OperatorId> = batch.iter().map(|d| d.id).collect();
  dnm.process_heartbeat(&ContainerHeartbeat::new("container2").with_deployed(all));
  assert_eq!(dnm.plan().operator(o2).unwrap().state(), OperatorState::Active);

  dnm.assign_container(&grant("container1"), address(9001)).unwrap();
  let c2 = dnm.plan().slot(SlotId(2)).unwrap();
  assert_eq!(c2.pending_undeploy().iter().copied().collect::<Vec<_>>(), [o2]);
  assert_eq!(c2.pending_deploy().iter().copied().collect::<Vec<_>>(), [o2]);
  assert_eq!(dnm.plan().operator(o2).unwrap().state(), OperatorState::PendingUndeploy);

  // Undeploy goes out alone.
  let response = dnm.process_heartbeat(&ContainerHeartbeat::new("container2")).unwrap();
  assert_eq!(response.undeploy_request, Some(vec![o2]));
  assert!(response.deploy_request.is_none());

  let response = dnm
    .process_heartbeat(&ContainerHeartbeat::new("container2").with_undeployed([o2]))
    .unwrap();
  assert_eq!(dnm.plan().operator(o2).unwrap().state(), OperatorState::PendingDeploy);
  let redeploy = response.deploy_request.unwrap();
  assert_eq!(redeploy.len(), 1);
  assert_eq!(redeploy[0].inputs[0].address, Some(address(9001)));

  dnm.process_heartbeat(&ContainerHeartbeat::new("container2").with_deployed([o2]));
  assert_eq!(dnm.plan().operator(o2).unwrap().state(), OperatorState::Active);
}

#[test]
fn test_late_producer_requeues_consumer_with_unresolved_batch() {
  let mut dnm = manager(&three_node_graph());
  let n2 = ids_of(&dnm, "n2");

  dnm
    .assign_container(&grant("container2").with_slot(SlotId(2)), address(9002))
    .unwrap();
  let response = dnm.process_heartbeat(&ContainerHeartbeat::new("container2")).unwrap();
  let batch = response.deploy_request.unwrap();
  assert_eq!(batch[0].id, n2);
  assert_eq!(batch[0].inputs[0].address, None);

  dnm.assign_container(&grant("container1"), address(9001)).unwrap();
  assert_eq!(dnm.plan().operator(n2).unwrap().state(), OperatorState::PendingUndeploy);

  // The ack of the unresolved batch does not make it stick.
  let response = dnm
    .process_heartbeat(&ContainerHeartbeat::new("container2").with_deployed([n2]))
    .unwrap();
  assert_eq!(response.undeploy_request, Some(vec![n2]));
  assert_eq!(dnm.plan().operator(n2).unwrap().state(), OperatorState::PendingUndeploy);

  let response = dnm
    .process_heartbeat(&ContainerHeartbeat::new("container2").with_undeployed([n2]))
    .unwrap();
  let redeploy = response.deploy_request.unwrap();
  assert_eq!(redeploy[0].inputs[0].address, Some(address(9001)));
  dnm.process_heartbeat(&ContainerHeartbeat::new("container2").with_deployed([n2]));
  assert_eq!(dnm.plan().operator(n2).unwrap().state(), OperatorState::Active);
}

#[test]
fn test_consumer_without_batch_is_not_requeued() {
  let mut dnm = manager(&three_node_graph());
  let n3 = ids_of(&dnm, "n3");
  dnm.assign_container(&grant("container1"), address(9001)).unwrap();
  dnm.assign_container(&grant("container2"), address(9002)).unwrap();

  let slot1 = dnm.plan().slot(SlotId(1)).unwrap();
  assert!(slot1.pending_undeploy().is_empty());
  assert_eq!(dnm.plan().operator(n3).unwrap().state(), OperatorState::PendingDeploy);
  let batch = dnm.deploy_info(SlotId(1));
  assert_eq!(batch[1].id, n3);
  assert_eq!(batch[1].inputs[0].address, Some(address(9002)));
}

#[test]
fn test_undeploy_without_redeploy_removes_operator() {
  let mut dnm = manager(&three_node_graph());
  dnm.assign_container(&grant("container1"), address(9001)).unwrap();
  let n1 = ids_of(&dnm, "n1");
  dnm.process_heartbeat(&ContainerHeartbeat::new("container1").with_deployed([n1]));

  dnm
    .plan
    .slot_mut(SlotId(1))
    .unwrap()
    .pending_undeploy_mut()
    .insert(n1);
  let response = dnm.process_heartbeat(&ContainerHeartbeat::new("container1")).unwrap();
  assert_eq!(response.undeploy_request, Some(vec![n1]));
  dnm.process_heartbeat(&ContainerHeartbeat::new("container1").with_undeployed([n1]));
  assert_eq!(dnm.plan().operator(n1).unwrap().state(), OperatorState::Removed);
}

#[test]
fn test_bound_slots_cannot_exchange_operators() {
  let mut dnm = manager(&three_node_graph());
  dnm.assign_container(&grant("container1"), address(9001)).unwrap();
  let n2 = ids_of(&dnm, "n2");
  assert_eq!(
    dnm.plan.relocate(n2, SlotId(1)),
    Err(RelocationError::SlotBound(SlotId(1)))
  );
  assert_eq!(dnm.plan().operator(n2).unwrap().slot(), SlotId(2));
}
