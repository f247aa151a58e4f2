//! Single-consumer command loop around a [`ContainerManager`].
//!
//! Grants, heartbeats and restarts arrive from independent tasks. The loop owns
//! the manager and applies their commands one at a time; callers get the
//! outcome back on a oneshot channel. Resource requests created by any command
//! are forwarded on an unbounded stream for the resource manager.

use crate::deploy::DeployDescriptor;
use crate::error::AssignmentError;
use crate::orchestrator::{ContainerManager, ResourceGrant};
use crate::plan::{PlanSummary, ResourceRequest, SlotId, TransportAddress};
use crate::protocol::{ContainerHeartbeat, HeartbeatResponse};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Error returned by [`ManagerHandle`] calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlLoopError {
  /// The loop has exited.
  #[error("control loop has stopped")]
  Stopped,
  /// The grant was rejected.
  #[error(transparent)]
  Assignment(#[from] AssignmentError),
}

enum Command {
  AssignContainer {
    grant: ResourceGrant,
    address: TransportAddress,
    reply: oneshot::Sender<Result<Vec<DeployDescriptor>, AssignmentError>>,
  },
  Heartbeat {
    heartbeat: ContainerHeartbeat,
    reply: oneshot::Sender<Option<HeartbeatResponse>>,
  },
  RestartContainer {
    external_id: String,
    reply: oneshot::Sender<Option<SlotId>>,
  },
  Summary {
    reply: oneshot::Sender<PlanSummary>,
  },
}

/// Cloneable sender side of the control loop.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
  commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Command::AssignContainer { grant, .. } => write!(f, "AssignContainer({})", grant.external_id),
      Command::Heartbeat { heartbeat, .. } => write!(f, "Heartbeat({})", heartbeat.external_id),
      Command::RestartContainer { external_id, .. } => write!(f, "RestartContainer({})", external_id),
      Command::Summary { .. } => write!(f, "Summary"),
    }
  }
}

impl ManagerHandle {
  async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ControlLoopError> {
    let (reply, response) = oneshot::channel();
    self
      .commands
      .send(command(reply))
      .await
      .map_err(|_| ControlLoopError::Stopped)?;
    response.await.map_err(|_| ControlLoopError::Stopped)
  }

  /// Binds a granted container; returns its initial deploy batch.
  pub async fn assign_container(
    &self,
    grant: ResourceGrant,
    address: TransportAddress,
  ) -> Result<Vec<DeployDescriptor>, ControlLoopError> {
    Ok(
      self
        .call(|reply| Command::AssignContainer {
          grant,
          address,
          reply,
        })
        .await??,
    )
  }

  /// Applies a heartbeat; `None` if the container is unknown.
  pub async fn heartbeat(
    &self,
    heartbeat: ContainerHeartbeat,
  ) -> Result<Option<HeartbeatResponse>, ControlLoopError> {
    self.call(|reply| Command::Heartbeat { heartbeat, reply }).await
  }

  /// Reports a lost container.
  pub async fn restart_container(&self, external_id: impl Into<String>) -> Result<Option<SlotId>, ControlLoopError> {
    let external_id = external_id.into();
    self
      .call(|reply| Command::RestartContainer { external_id, reply })
      .await
  }

  /// Current plan overview.
  pub async fn summary(&self) -> Result<PlanSummary, ControlLoopError> {
    self.call(|reply| Command::Summary { reply }).await
  }
}

/// Starts the loop on the current tokio runtime.
///
/// The loop ends once every [`ManagerHandle`] is dropped and hands the manager
/// back through the join handle.
pub fn spawn(
  mut manager: ContainerManager,
  capacity: usize,
) -> (
  ManagerHandle,
  UnboundedReceiverStream<ResourceRequest>,
  JoinHandle<ContainerManager>,
) {
  let (commands, mut inbox) = mpsc::channel(capacity.max(1));
  let (requests, outbound) = mpsc::unbounded_channel();

  let task = tokio::spawn(async move {
    forward(&mut manager, &requests);
    while let Some(command) = inbox.recv().await {
      debug!(?command, "control command");
      apply(&mut manager, command);
      forward(&mut manager, &requests);
    }
    manager
  });

  (
    ManagerHandle { commands },
    UnboundedReceiverStream::new(outbound),
    task,
  )
}

fn apply(manager: &mut ContainerManager, command: Command) {
  // A caller that gave up waiting is not an error.
  match command {
    Command::AssignContainer {
      grant,
      address,
      reply,
    } => {
      let result = manager
        .assign_container(&grant, address)
        .map(|agent| agent.deploy_info());
      let _ = reply.send(result);
    }
    Command::Heartbeat { heartbeat, reply } => {
      let _ = reply.send(manager.process_heartbeat(&heartbeat));
    }
    Command::RestartContainer { external_id, reply } => {
      let _ = reply.send(manager.schedule_container_restart(&external_id));
    }
    Command::Summary { reply } => {
      let _ = reply.send(manager.summary());
    }
  }
}

fn forward(manager: &mut ContainerManager, requests: &mpsc::UnboundedSender<ResourceRequest>) {
  for request in manager.take_new_requests() {
    // Nobody listening for requests means nobody can grant them either.
    let _ = requests.send(request);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::plan::SlotState;
  use crate::test_support::{address, grant, manager, three_node_graph};
  use tokio_stream::StreamExt;
  use tokio_test::assert_ok;

  #[tokio::test]
  async fn test_commands_are_applied_in_order() {
    let (handle, mut requests, task) = spawn(manager(&three_node_graph()), 8);

    let first = requests.next().await.unwrap();
    let second = requests.next().await.unwrap();
    assert_eq!((first.slot, second.slot), (SlotId(1), SlotId(2)));

    let batch = assert_ok!(handle.assign_container(grant("container1"), address(9001)).await);
    assert_eq!(batch.len(), 2);
    assert_eq!(
      handle.assign_container(grant("container1"), address(9001)).await,
      Err(ControlLoopError::Assignment(AssignmentError::AlreadyAssigned {
        external_id: "container1".to_string()
      }))
    );

    let response = assert_ok!(handle.heartbeat(ContainerHeartbeat::new("container1")).await);
    assert_eq!(response.and_then(|r| r.deploy_request).map(|d| d.len()), Some(2));
    assert_eq!(assert_ok!(handle.heartbeat(ContainerHeartbeat::new("ghost")).await), None);

    let killed = assert_ok!(handle.restart_container("container1").await);
    assert_eq!(killed, Some(SlotId(1)));
    assert_eq!(requests.next().await.unwrap().slot, SlotId(1));

    let summary = assert_ok!(handle.summary().await);
    assert_eq!(summary.slots[0].state, SlotState::Killed);
    assert_eq!(summary.requests.len(), 2);

    drop(handle);
    let manager = task.await.unwrap();
    assert_eq!(manager.resource_requests().count(), 2);
  }
}
