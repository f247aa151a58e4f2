use std::sync::Arc;
use streamweave_control::checkpoint::{CheckpointStore, FileCheckpointStore};
use streamweave_control::config::PlanConfig;
use streamweave_control::control_loop;
use streamweave_control::graph::LogicalGraph;
use streamweave_control::orchestrator::{ContainerManager, ResourceGrant};
use streamweave_control::partitioning::CodecRegistry;
use streamweave_control::plan::{OperatorId, OperatorKind, OperatorState, PlanSummary, SlotState, TransportAddress};
use streamweave_control::protocol::{ContainerHeartbeat, HeartbeatResponse};
use tempfile::TempDir;
use tokio_stream::StreamExt;

const GRAPH: &str = r#"{
  "attributes": { "CONTAINERS_MAX_COUNT": 4 },
  "operators": [
    { "name": "reader", "logic": "kafka-reader",
      "attributes": { "INITIAL_PARTITION_COUNT": 2 },
      "outputs": [ { "name": "out", "direction": "output" } ] },
    { "name": "parser", "logic": "json-parser",
      "inputs": [ { "name": "in", "direction": "input",
        "attributes": { "PARTITION_PARALLEL": true } } ],
      "outputs": [ { "name": "out", "direction": "output" } ] },
    { "name": "writer", "logic": "db-writer",
      "inputs": [ { "name": "in", "direction": "input",
        "attributes": { "QUEUE_CAPACITY": 64 } } ] }
  ],
  "streams": [
    { "id": "raw", "source": { "operator": "reader", "port": "out" },
      "sinks": [ { "operator": "parser", "port": "in" } ], "locality": "CONTAINER_LOCAL" },
    { "id": "parsed", "source": { "operator": "parser", "port": "out" },
      "sinks": [ { "operator": "writer", "port": "in" } ] }
  ]
}"#;

fn build(dir: &TempDir) -> ContainerManager {
  let graph = LogicalGraph::from_json(GRAPH).unwrap();
  let config = PlanConfig::default().with_checkpoint_dir(dir.path());
  let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
  ContainerManager::new(&graph, config, &CodecRegistry::new(), store).unwrap()
}

fn ack(manager: &mut ContainerManager, external_id: &str) -> Option<HeartbeatResponse> {
  let response = manager.process_heartbeat(&ContainerHeartbeat::new(external_id))?;
  let deployed: Vec<OperatorId> = response
    .deploy_request
    .iter()
    .flatten()
    .map(|d| d.id)
    .collect();
  let undeployed = response.undeploy_request.clone().unwrap_or_default();
  manager.process_heartbeat(
    &ContainerHeartbeat::new(external_id)
      .with_deployed(deployed)
      .with_undeployed(undeployed),
  );
  Some(response)
}

#[test]
fn test_partitioned_pipeline_lifecycle() {
  let dir = TempDir::new().unwrap();
  let mut manager = build(&dir);
  let plan = manager.plan();

  // reader(2) -> parser(2, parallel) -> unifier -> writer
  assert_eq!(plan.instances_of("reader").len(), 2);
  assert_eq!(plan.instances_of("parser").len(), 2);
  assert_eq!(plan.unifiers_of("parser").len(), 1);
  assert_eq!(plan.slots().len(), 4);
  for reader in plan.instances_of("reader") {
    let parser = plan.outputs_of(reader.id()).next().unwrap().sink;
    assert_eq!(plan.operator(parser).unwrap().slot(), reader.slot());
    assert!(dir.path().join(reader.id().to_string()).join("0").is_file());
  }

  let requests = manager.take_new_requests();
  assert_eq!(requests.len(), 4);
  for (i, request) in requests.iter().enumerate() {
    manager
      .assign_container(
        &ResourceGrant::new(format!("c{}", i + 1), "worker", request.memory_mb),
        TransportAddress::new("worker", 7000 + i as u16),
      )
      .unwrap();
  }
  for i in 1..=4 {
    let response = ack(&mut manager, &format!("c{}", i)).unwrap();
    assert!(response.undeploy_request.is_none());
    assert!(response.deploy_request.is_some());
  }
  assert!(manager.plan().operators().all(|o| o.state() == OperatorState::Active));
  assert!(manager.plan().slots().iter().all(|s| s.state() == SlotState::Active));

  // Lose the first reader's container.
  let killed = manager.schedule_container_restart("c1").unwrap();
  let unifier = manager.plan().unifiers_of("parser")[0].id();
  let unifier_slot = manager.plan().operator(unifier).unwrap().slot();
  assert!(manager.plan().slot(unifier_slot).unwrap().pending_undeploy().contains(&unifier));
  assert_eq!(manager.take_new_requests().len(), 1);

  let unifier_container = format!("c{}", unifier_slot.0);
  let response = ack(&mut manager, &unifier_container).unwrap();
  assert_eq!(response.undeploy_request, Some(vec![unifier]));

  let agent = manager
    .assign_container(&ResourceGrant::new("c1-b", "worker-2", 512), TransportAddress::new("worker-2", 7100))
    .unwrap();
  assert_eq!(agent.slot_id(), killed);
  let batch = agent.deploy_info();
  assert!(batch.iter().all(|d| d.recovery_window == Some(0)));
  assert_eq!(batch[0].kind, OperatorKind::Input);

  // The unifier was handed a batch while its upstream slot was down.
  let response = ack(&mut manager, &unifier_container).unwrap();
  assert_eq!(response.undeploy_request, Some(vec![unifier]));
  assert!(response.deploy_request.is_none());

  let redeploy = ack(&mut manager, &unifier_container)
    .unwrap()
    .deploy_request
    .unwrap();
  let from_replacement = redeploy[0]
    .inputs
    .iter()
    .find(|i| i.address.as_ref().map(|a| a.port) == Some(7100));
  assert!(from_replacement.is_some());

  ack(&mut manager, "c1-b");
  assert!(manager.plan().operators().all(|o| o.state() == OperatorState::Active));

  let summary: PlanSummary = serde_json::from_str(&serde_json::to_string(&manager.summary()).unwrap()).unwrap();
  assert_eq!(summary, manager.summary());
  assert!(summary.requests.is_empty());
}

#[tokio::test]
async fn test_control_loop_drives_recovery() {
  let dir = TempDir::new().unwrap();
  let (handle, mut requests, task) = control_loop::spawn(build(&dir), 16);

  let mut granted = Vec::new();
  for i in 0..4 {
    let request = requests.next().await.unwrap();
    let id = format!("c{}", i + 1);
    let batch = handle
      .assign_container(
        ResourceGrant::new(&id, "worker", request.memory_mb).with_slot(request.slot),
        TransportAddress::new("worker", 7000 + i),
      )
      .await
      .unwrap();
    assert!(!batch.is_empty());
    granted.push(id);
  }

  let workers: Vec<_> = granted
    .iter()
    .cloned()
    .map(|id| {
      let handle = handle.clone();
      tokio::spawn(async move { handle.heartbeat(ContainerHeartbeat::new(id)).await })
    })
    .collect();
  for worker in workers {
    assert!(worker.await.unwrap().unwrap().is_some());
  }

  handle.restart_container("c2").await.unwrap();
  let replacement = requests.next().await.unwrap();
  let summary = handle.summary().await.unwrap();
  assert_eq!(summary.requests, vec![replacement.clone()]);
  assert!(summary
    .slots
    .iter()
    .any(|s| s.id == replacement.slot && s.state == SlotState::Killed));

  drop(handle);
  let manager = task.await.unwrap();
  assert_eq!(manager.resource_requests().count(), 1);
}
