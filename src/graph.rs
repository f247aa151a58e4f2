//! # Logical Graph
//!
//! The user-declared dataflow: operators with named ports, streams connecting
//! one output port to one or more input ports, and attributes on all of them.
//!
//! The logical graph is pure data. It is validated as it is built (ports must
//! exist, an input port is fed by at most one stream) and is the only input of
//! the [plan compiler](crate::plan::compiler).
//!
//! ## Example
//!
//! ```rust
//! use streamweave_control::graph::{Locality, LogicalGraph, OperatorDef, PortRef, StreamDef};
//!
//! let mut graph = LogicalGraph::new();
//! graph.add_operator(OperatorDef::new("source", "gen").with_output("out"))?;
//! graph.add_operator(OperatorDef::new("sink", "print").with_input("in"))?;
//! graph.add_stream(
//!   StreamDef::new("numbers", PortRef::new("source", "out"))
//!     .with_sink(PortRef::new("sink", "in"))
//!     .with_locality(Locality::ContainerLocal),
//! )?;
//!
//! let order: Vec<&str> = graph.topological_order()?.iter().map(|o| o.name.as_str()).collect();
//! assert_eq!(order, ["source", "sink"]);
//! # Ok::<(), streamweave_control::error::GraphError>(())
//! ```

use crate::attributes::{AttributeValue, Attributes};
use crate::error::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Opaque reference to the executable logic behind an operator.
///
/// The control plane never interprets it; the worker runtime resolves it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicRef(pub String);

impl LogicRef {
  /// Creates a logic reference.
  pub fn new(reference: impl Into<String>) -> Self {
    Self(reference.into())
  }

  /// Returns the reference as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for LogicRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Direction of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
  /// Consumes a stream.
  Input,
  /// Produces a stream.
  Output,
}

impl fmt::Display for PortDirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PortDirection::Input => f.write_str("input"),
      PortDirection::Output => f.write_str("output"),
    }
  }
}

/// A named port on an operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDef {
  /// Port name, unique per operator and direction.
  pub name: String,
  /// Whether the port consumes or produces.
  pub direction: PortDirection,
  /// Port attributes such as queue capacity.
  #[serde(default)]
  pub attributes: Attributes,
}

impl PortDef {
  /// Creates an input port.
  pub fn input(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      direction: PortDirection::Input,
      attributes: Attributes::new(),
    }
  }

  /// Creates an output port.
  pub fn output(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      direction: PortDirection::Output,
      attributes: Attributes::new(),
    }
  }
}

/// A logical operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorDef {
  /// Unique name; becomes the declared id of every physical instance.
  pub name: String,
  /// Executable logic.
  pub logic: LogicRef,
  /// Operator attributes.
  #[serde(default)]
  pub attributes: Attributes,
  /// Input ports in declaration order.
  #[serde(default)]
  pub inputs: Vec<PortDef>,
  /// Output ports in declaration order.
  #[serde(default)]
  pub outputs: Vec<PortDef>,
}

impl OperatorDef {
  /// Creates an operator without ports.
  pub fn new(name: impl Into<String>, logic: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      logic: LogicRef::new(logic),
      attributes: Attributes::new(),
      inputs: Vec::new(),
      outputs: Vec::new(),
    }
  }

  /// Adds an input port.
  #[must_use]
  pub fn with_input(mut self, port: impl Into<String>) -> Self {
    self.inputs.push(PortDef::input(port));
    self
  }

  /// Adds an output port.
  #[must_use]
  pub fn with_output(mut self, port: impl Into<String>) -> Self {
    self.outputs.push(PortDef::output(port));
    self
  }

  /// Sets an operator attribute.
  #[must_use]
  pub fn with_attribute(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
    self.attributes.set(name, value);
    self
  }

  /// Looks up an input port.
  pub fn input_port(&self, name: &str) -> Option<&PortDef> {
    self.inputs.iter().find(|p| p.name == name)
  }

  /// Looks up an output port.
  pub fn output_port(&self, name: &str) -> Option<&PortDef> {
    self.outputs.iter().find(|p| p.name == name)
  }
}

/// Placement constraint of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Locality {
  /// Producer and consumer may live in different processes.
  #[default]
  Default,
  /// Producer and consumer share a process.
  ContainerLocal,
  /// Producer and consumer share an execution thread.
  ThreadLocal,
}

impl Locality {
  /// Returns `true` if the endpoints must be placed in the same container.
  pub fn requires_co_location(self) -> bool {
    matches!(self, Locality::ContainerLocal | Locality::ThreadLocal)
  }
}

/// `operator.port` reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
  /// Operator name.
  pub operator: String,
  /// Port name.
  pub port: String,
}

impl PortRef {
  /// Creates a port reference.
  pub fn new(operator: impl Into<String>, port: impl Into<String>) -> Self {
    Self {
      operator: operator.into(),
      port: port.into(),
    }
  }
}

impl fmt::Display for PortRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.operator, self.port)
  }
}

/// A stream from one output port to one or more input ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDef {
  /// Declared stream id.
  pub id: String,
  /// Producing port.
  pub source: PortRef,
  /// Consuming ports (fan-out).
  pub sinks: Vec<PortRef>,
  /// Placement constraint.
  #[serde(default)]
  pub locality: Locality,
  /// Codec used for partitioning and serialization, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub codec: Option<String>,
}

impl StreamDef {
  /// Creates a stream without sinks.
  pub fn new(id: impl Into<String>, source: PortRef) -> Self {
    Self {
      id: id.into(),
      source,
      sinks: Vec::new(),
      locality: Locality::Default,
      codec: None,
    }
  }

  /// Adds a sink.
  #[must_use]
  pub fn with_sink(mut self, sink: PortRef) -> Self {
    self.sinks.push(sink);
    self
  }

  /// Sets the locality.
  #[must_use]
  pub fn with_locality(mut self, locality: Locality) -> Self {
    self.locality = locality;
    self
  }

  /// Sets the codec reference.
  #[must_use]
  pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
    self.codec = Some(codec.into());
    self
  }
}

/// Operators, streams and application attributes.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LogicalGraph {
  attributes: Attributes,
  operators: Vec<OperatorDef>,
  streams: Vec<StreamDef>,
}

/// Unvalidated serialized form of a graph.
#[derive(Deserialize)]
struct GraphDocument {
  #[serde(default)]
  attributes: Attributes,
  #[serde(default)]
  operators: Vec<OperatorDef>,
  #[serde(default)]
  streams: Vec<StreamDef>,
}

impl LogicalGraph {
  /// Creates an empty graph.
  pub fn new() -> Self {
    Self::default()
  }

  /// Parses and validates a JSON graph document.
  ///
  /// # Errors
  ///
  /// Returns [`GraphError::Parse`] for malformed JSON and the usual
  /// construction errors for invalid operators or streams.
  pub fn from_json(json: &str) -> Result<Self, GraphError> {
    let doc: GraphDocument = serde_json::from_str(json)?;
    let mut graph = LogicalGraph {
      attributes: doc.attributes,
      ..Default::default()
    };
    for operator in doc.operators {
      graph.add_operator(operator)?;
    }
    for stream in doc.streams {
      graph.add_stream(stream)?;
    }
    Ok(graph)
  }

  /// Application-level attributes.
  pub fn attributes(&self) -> &Attributes {
    &self.attributes
  }

  /// Mutable application-level attributes.
  pub fn attributes_mut(&mut self) -> &mut Attributes {
    &mut self.attributes
  }

  /// All operators in insertion order.
  pub fn operators(&self) -> &[OperatorDef] {
    &self.operators
  }

  /// All streams in insertion order.
  pub fn streams(&self) -> &[StreamDef] {
    &self.streams
  }

  /// Looks up an operator by name.
  pub fn operator(&self, name: &str) -> Option<&OperatorDef> {
    self.operators.iter().find(|o| o.name == name)
  }

  /// Looks up a stream by id.
  pub fn stream(&self, id: &str) -> Option<&StreamDef> {
    self.streams.iter().find(|s| s.id == id)
  }

  /// Adds an operator.
  ///
  /// # Errors
  ///
  /// Returns an error if the name is taken or a port is listed under the
  /// wrong direction.
  pub fn add_operator(&mut self, operator: OperatorDef) -> Result<(), GraphError> {
    if self.operator(&operator.name).is_some() {
      return Err(GraphError::DuplicateOperator(operator.name));
    }
    let misplaced = operator
      .inputs
      .iter()
      .find(|p| p.direction != PortDirection::Input)
      .map(|p| (p, PortDirection::Input))
      .or_else(|| {
        operator
          .outputs
          .iter()
          .find(|p| p.direction != PortDirection::Output)
          .map(|p| (p, PortDirection::Output))
      });
    if let Some((port, direction)) = misplaced {
      return Err(GraphError::UnknownPort {
        operator: operator.name.clone(),
        port: port.name.clone(),
        direction,
      });
    }
    self.operators.push(operator);
    Ok(())
  }

  /// Adds a stream.
  ///
  /// # Errors
  ///
  /// Returns an error if the id is taken, the stream has no sinks, a port does
  /// not exist with the expected direction, or a sink port is already fed.
  pub fn add_stream(&mut self, stream: StreamDef) -> Result<(), GraphError> {
    if self.stream(&stream.id).is_some() {
      return Err(GraphError::DuplicateStream(stream.id));
    }
    if stream.sinks.is_empty() {
      return Err(GraphError::NoSinks(stream.id));
    }

    let source = self
      .operator(&stream.source.operator)
      .ok_or_else(|| GraphError::UnknownOperator(stream.source.operator.clone()))?;
    if source.output_port(&stream.source.port).is_none() {
      return Err(GraphError::UnknownPort {
        operator: stream.source.operator.clone(),
        port: stream.source.port.clone(),
        direction: PortDirection::Output,
      });
    }

    for sink in &stream.sinks {
      let target = self
        .operator(&sink.operator)
        .ok_or_else(|| GraphError::UnknownOperator(sink.operator.clone()))?;
      if target.input_port(&sink.port).is_none() {
        return Err(GraphError::UnknownPort {
          operator: sink.operator.clone(),
          port: sink.port.clone(),
          direction: PortDirection::Input,
        });
      }
      if let Some(existing) = self.stream_into(sink) {
        return Err(GraphError::PortAlreadyConnected {
          operator: sink.operator.clone(),
          port: sink.port.clone(),
          stream: existing.id.clone(),
        });
      }
    }

    self.streams.push(stream);
    Ok(())
  }

  /// Sets an operator attribute.
  ///
  /// # Errors
  ///
  /// Returns [`GraphError::UnknownOperator`] if the operator is missing.
  pub fn set_operator_attribute(
    &mut self,
    operator: &str,
    name: &str,
    value: impl Into<AttributeValue>,
  ) -> Result<(), GraphError> {
    self.operator_mut(operator)?.attributes.set(name, value);
    Ok(())
  }

  /// Sets an attribute on an input port.
  ///
  /// # Errors
  ///
  /// Returns an error if the operator or port is missing.
  pub fn set_input_port_attribute(
    &mut self,
    port: &PortRef,
    name: &str,
    value: impl Into<AttributeValue>,
  ) -> Result<(), GraphError> {
    let operator = self.operator_mut(&port.operator)?;
    let def = operator
      .inputs
      .iter_mut()
      .find(|p| p.name == port.port)
      .ok_or_else(|| GraphError::UnknownPort {
        operator: port.operator.clone(),
        port: port.port.clone(),
        direction: PortDirection::Input,
      })?;
    def.attributes.set(name, value);
    Ok(())
  }

  /// Sets an attribute on an output port.
  ///
  /// # Errors
  ///
  /// Returns an error if the operator or port is missing.
  pub fn set_output_port_attribute(
    &mut self,
    port: &PortRef,
    name: &str,
    value: impl Into<AttributeValue>,
  ) -> Result<(), GraphError> {
    let operator = self.operator_mut(&port.operator)?;
    let def = operator
      .outputs
      .iter_mut()
      .find(|p| p.name == port.port)
      .ok_or_else(|| GraphError::UnknownPort {
        operator: port.operator.clone(),
        port: port.port.clone(),
        direction: PortDirection::Output,
      })?;
    def.attributes.set(name, value);
    Ok(())
  }

  /// Stream feeding the given input port, if any.
  pub fn stream_into(&self, sink: &PortRef) -> Option<&StreamDef> {
    self.streams.iter().find(|s| s.sinks.contains(sink))
  }

  /// Streams feeding `operator`, paired with the consuming port.
  pub fn input_streams<'a>(
    &'a self,
    operator: &'a str,
  ) -> impl Iterator<Item = (&'a StreamDef, &'a PortRef)> + 'a {
    self.streams.iter().flat_map(move |s| {
      s.sinks
        .iter()
        .filter(move |sink| sink.operator == operator)
        .map(move |sink| (s, sink))
    })
  }

  /// Streams produced by `operator`.
  pub fn output_streams<'a>(&'a self, operator: &'a str) -> impl Iterator<Item = &'a StreamDef> + 'a {
    self.streams.iter().filter(move |s| s.source.operator == operator)
  }

  /// Operators without upstream streams.
  pub fn root_operators(&self) -> Vec<&OperatorDef> {
    self
      .operators
      .iter()
      .filter(|o| self.input_streams(&o.name).next().is_none())
      .collect()
  }

  /// Operators in execution order: sources first, sinks last.
  ///
  /// Ties are broken by insertion order so the result is deterministic.
  ///
  /// # Errors
  ///
  /// Returns [`GraphError::Cycle`] listing the operators left on a cycle.
  pub fn topological_order(&self) -> Result<Vec<&OperatorDef>, GraphError> {
    let index: HashMap<&str, usize> = self
      .operators
      .iter()
      .enumerate()
      .map(|(i, o)| (o.name.as_str(), i))
      .collect();

    let mut in_degree = vec![0usize; self.operators.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.operators.len()];
    for stream in &self.streams {
      let source = index[stream.source.operator.as_str()];
      for sink in &stream.sinks {
        let target = index[sink.operator.as_str()];
        adjacency[source].push(target);
        in_degree[target] += 1;
      }
    }

    // Kahn's algorithm
    let mut queue: VecDeque<usize> = (0..self.operators.len())
      .filter(|&i| in_degree[i] == 0)
      .collect();
    let mut result = Vec::with_capacity(self.operators.len());
    while let Some(current) = queue.pop_front() {
      result.push(&self.operators[current]);
      for &next in &adjacency[current] {
        in_degree[next] -= 1;
        if in_degree[next] == 0 {
          queue.push_back(next);
        }
      }
    }

    if result.len() != self.operators.len() {
      let stuck = (0..self.operators.len())
        .filter(|&i| in_degree[i] > 0)
        .map(|i| self.operators[i].name.clone())
        .collect();
      return Err(GraphError::Cycle(stuck));
    }
    Ok(result)
  }

  /// Serializes the graph to pretty JSON.
  ///
  /// # Errors
  ///
  /// Returns [`GraphError::Parse`] if serialization fails.
  pub fn to_json(&self) -> Result<String, GraphError> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  fn operator_mut(&mut self, name: &str) -> Result<&mut OperatorDef, GraphError> {
    self
      .operators
      .iter_mut()
      .find(|o| o.name == name)
      .ok_or_else(|| GraphError::UnknownOperator(name.to_string()))
  }
}
