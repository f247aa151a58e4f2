//! Wire protocol between the control plane and worker containers.
//!
//! Workers report heartbeats carrying deploy and undeploy acknowledgements;
//! the control plane answers with the next batch of work. Both travel inside a
//! versioned [`Envelope`] serialized as JSON.

use crate::deploy::DeployDescriptor;
use crate::plan::OperatorId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Protocol version for backward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProtocolVersion {
  /// Heartbeat-driven deployment.
  #[default]
  V1,
}

/// Message types exchanged with workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
  /// Heartbeat from worker to control plane.
  Heartbeat,
  /// Deploy/undeploy instructions from control plane to worker.
  HeartbeatResponse,
}

/// Protocol errors.
#[derive(Error, Debug)]
pub enum WireError {
  /// Encoding or decoding failed.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  /// Peer speaks a version this build does not understand.
  #[error("unsupported protocol version: {0:?}")]
  UnsupportedVersion(ProtocolVersion),
  /// Envelope holds a different message than the caller expected.
  #[error("expected {expected:?} message, got {found:?}")]
  UnexpectedMessage {
    /// Expected type.
    expected: MessageType,
    /// Received type.
    found: MessageType,
  },
}

static NEXT_MESSAGE: AtomicU64 = AtomicU64::new(1);

/// Protocol message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  /// Unique message identifier.
  pub id: String,
  /// Message type.
  pub message_type: MessageType,
  /// Timestamp when the message was created.
  pub timestamp: DateTime<Utc>,
  /// Protocol version.
  pub version: ProtocolVersion,
  /// Serialized message body.
  pub payload: Vec<u8>,
}

impl Envelope {
  /// Wraps a serialized body.
  #[must_use]
  pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
    Self {
      id: format!("msg-{}", NEXT_MESSAGE.fetch_add(1, Ordering::Relaxed)),
      message_type,
      timestamp: Utc::now(),
      version: ProtocolVersion::default(),
      payload,
    }
  }

  /// Serializes the envelope.
  pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(self)?)
  }

  /// Parses an envelope.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
    Ok(serde_json::from_slice(bytes)?)
  }

  fn wrap<T: Serialize>(message_type: MessageType, body: &T) -> Result<Vec<u8>, WireError> {
    Self::new(message_type, serde_json::to_vec(body)?).to_bytes()
  }

  fn unwrap_body<T: DeserializeOwned>(bytes: &[u8], expected: MessageType) -> Result<T, WireError> {
    let envelope = Self::from_bytes(bytes)?;
    if envelope.version != ProtocolVersion::V1 {
      return Err(WireError::UnsupportedVersion(envelope.version));
    }
    if envelope.message_type != expected {
      return Err(WireError::UnexpectedMessage {
        expected,
        found: envelope.message_type,
      });
    }
    Ok(serde_json::from_slice(&envelope.payload)?)
  }
}

/// Periodic report from a worker container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHeartbeat {
  /// External allocation id of the reporting container.
  pub external_id: String,
  /// When the worker produced the report.
  pub timestamp: DateTime<Utc>,
  /// Operators the worker has finished deploying.
  #[serde(default)]
  pub deployed: Vec<OperatorId>,
  /// Operators the worker has finished undeploying.
  #[serde(default)]
  pub undeployed: Vec<OperatorId>,
}

impl ContainerHeartbeat {
  /// A heartbeat without acknowledgements.
  pub fn new(external_id: impl Into<String>) -> Self {
    Self {
      external_id: external_id.into(),
      timestamp: Utc::now(),
      deployed: Vec::new(),
      undeployed: Vec::new(),
    }
  }

  /// Acknowledges deployed operators.
  #[must_use]
  pub fn with_deployed(mut self, ids: impl IntoIterator<Item = OperatorId>) -> Self {
    self.deployed.extend(ids);
    self
  }

  /// Acknowledges undeployed operators.
  #[must_use]
  pub fn with_undeployed(mut self, ids: impl IntoIterator<Item = OperatorId>) -> Self {
    self.undeployed.extend(ids);
    self
  }

  /// Encodes the heartbeat in an envelope.
  pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
    Envelope::wrap(MessageType::Heartbeat, self)
  }

  /// Decodes a heartbeat envelope.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
    Envelope::unwrap_body(bytes, MessageType::Heartbeat)
  }
}

/// Work handed back to a worker.
///
/// Undeploys are always sent on their own; a deploy batch follows once the
/// worker has acknowledged them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
  /// Operators to stop.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub undeploy_request: Option<Vec<OperatorId>>,
  /// Operators to start.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deploy_request: Option<Vec<DeployDescriptor>>,
}

impl HeartbeatResponse {
  /// Returns `true` when there is nothing to do.
  pub fn is_empty(&self) -> bool {
    self.undeploy_request.is_none() && self.deploy_request.is_none()
  }

  /// Encodes the response in an envelope.
  pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
    Envelope::wrap(MessageType::HeartbeatResponse, self)
  }

  /// Decodes a response envelope.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
    Envelope::unwrap_body(bytes, MessageType::HeartbeatResponse)
  }
}
