//! Expands a logical graph into physical operator instances, connects them and
//! hands the result to [placement](super::placement).

use super::{
  merge_port_name, placement, Connection, ConnectionId, OperatorId, OperatorKind, OperatorState,
  PhysicalOperator, PhysicalPlan, ResourceRequest, SlotId,
};
use crate::attributes::{Attributes, INITIAL_PARTITION_COUNT, MEMORY_MB, PARTITION_PARALLEL, UNIFIER};
use crate::config::PlanConfig;
use crate::error::{GraphError, PlanError};
use crate::graph::{Locality, LogicRef, LogicalGraph, OperatorDef, PortRef, StreamDef};
use crate::partitioning::{round_robin_keys, CodecRegistry, PartitionCodec, PartitionKeys};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Logic reference of unifiers on ports without a `UNIFIER` attribute.
pub const DEFAULT_UNIFIER: &str = "default-unifier";

/// Largest accepted `INITIAL_PARTITION_COUNT`.
pub const MAX_PARTITION_COUNT: i64 = 1 << 16;

/// A compiled plan and the resource requests that will bring it up.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
  /// Operators, connections and `NEW` slots.
  pub plan: PhysicalPlan,
  /// One request per slot, in slot order.
  pub requests: Vec<ResourceRequest>,
}

/// Compiles logical graphs under one configuration.
#[derive(Debug, Clone, Copy)]
pub struct PlanCompiler<'a> {
  config: &'a PlanConfig,
  codecs: &'a CodecRegistry,
}

impl<'a> PlanCompiler<'a> {
  /// Creates a compiler.
  pub fn new(config: &'a PlanConfig, codecs: &'a CodecRegistry) -> Self {
    Self { config, codecs }
  }

  /// Compiles `graph` into a physical plan.
  ///
  /// Operators are expanded in topological order, so operator ids grow from
  /// sources to sinks and every unifier is numbered before the instances it
  /// feeds.
  ///
  /// # Errors
  ///
  /// Returns [`PlanError`] if the graph is cyclic, a partition count or codec
  /// is invalid, or the operators cannot be placed within the container cap.
  pub fn compile(&self, graph: &LogicalGraph) -> Result<CompiledPlan, PlanError> {
    self
      .config
      .validate()
      .map_err(|e| PlanError::InvalidConfig(e.to_string()))?;
    let order = graph.topological_order()?;
    let codecs = self.resolve_codecs(graph)?;

    let mut builder = PlanBuilder::default();
    for def in order {
      self.expand(graph, def, &codecs, &mut builder)?;
    }

    let mut plan = builder.finish();
    let max_containers = self.config.max_containers_for(graph);
    let requests = placement::assign_slots(&mut plan, max_containers, self.config)?;

    info!(
      operators = plan.operators.len(),
      connections = plan.connections.len(),
      slots = plan.slots.len(),
      max_containers,
      "physical plan compiled"
    );
    Ok(CompiledPlan { plan, requests })
  }

  fn resolve_codecs(
    &self,
    graph: &LogicalGraph,
  ) -> Result<HashMap<String, Arc<dyn PartitionCodec>>, PlanError> {
    let mut resolved = HashMap::new();
    for stream in graph.streams() {
      if let Some(name) = &stream.codec {
        let codec = self.codecs.get(name).ok_or_else(|| PlanError::UnknownCodec {
          stream: stream.id.clone(),
          codec: name.clone(),
        })?;
        resolved.insert(stream.id.clone(), codec);
      }
    }
    Ok(resolved)
  }

  fn expand(
    &self,
    graph: &LogicalGraph,
    def: &OperatorDef,
    codecs: &HashMap<String, Arc<dyn PartitionCodec>>,
    builder: &mut PlanBuilder,
  ) -> Result<(), PlanError> {
    let inputs: Vec<(&StreamDef, &PortRef)> = graph.input_streams(&def.name).collect();
    let count = partition_count(def, &inputs, builder)?;
    let kind = if inputs.is_empty() {
      OperatorKind::Input
    } else {
      OperatorKind::Generic
    };

    // Unifiers are numbered ahead of the instances they feed.
    let mut unifiers = Vec::with_capacity(inputs.len());
    for (stream, port) in &inputs {
      let upstream = builder.instances(&stream.source.operator).len();
      if is_parallel(def, port) || upstream <= 1 {
        unifiers.push(None);
        continue;
      }
      let logic = output_port_attributes(graph, &stream.source)?
        .get_text(UNIFIER)
        .unwrap_or(DEFAULT_UNIFIER)
        .to_string();
      let ids: Vec<OperatorId> = (0..count)
        .map(|_| {
          builder.add_operator(
            &stream.source.operator,
            LogicRef::new(logic.clone()),
            OperatorKind::Unifier,
            Attributes::new(),
            None,
            self.config.default_operator_memory_mb,
          )
        })
        .collect();
      debug!(
        stream = %stream.id,
        upstream = %stream.source.operator,
        unifiers = ids.len(),
        "inserted unifiers"
      );
      unifiers.push(Some(ids));
    }

    let instance_keys = if count <= 1 {
      None
    } else if let Some((stream, _)) = inputs.iter().find(|(_, port)| !is_parallel(def, port)) {
      Some(keys_for(stream, count, codecs)?)
    } else if inputs.is_empty() {
      Some(round_robin_keys(count))
    } else {
      None
    };
    let memory_mb = def
      .attributes
      .get_int(MEMORY_MB)
      .filter(|mb| *mb > 0)
      .and_then(|mb| u32::try_from(mb).ok())
      .unwrap_or(self.config.default_operator_memory_mb);
    let instances: Vec<OperatorId> = (0..count as usize)
      .map(|i| {
        builder.add_operator(
          &def.name,
          def.logic.clone(),
          kind,
          def.attributes.clone(),
          instance_keys.as_ref().and_then(|keys| keys.get(i).cloned()),
          memory_mb,
        )
      })
      .collect();
    builder.instances.insert(def.name.clone(), instances.clone());

    for ((stream, port), unifiers) in inputs.iter().zip(unifiers) {
      let upstream = builder.instances(&stream.source.operator).to_vec();
      let out_attributes = output_port_attributes(graph, &stream.source)?;
      let in_attributes = def
        .input_port(&port.port)
        .map(|p| p.attributes.clone())
        .unwrap_or_default();
      let leg = |source: OperatorId, sink: OperatorId| Connection {
        id: ConnectionId(0),
        stream_id: stream.id.clone(),
        source,
        source_port: stream.source.port.clone(),
        sink,
        sink_port: port.port.clone(),
        locality: stream.locality,
        partition_keys: None,
        codec: stream.codec.clone(),
        source_attributes: out_attributes.clone(),
        sink_attributes: in_attributes.clone(),
      };

      if is_parallel(def, port) {
        for (source, sink) in upstream.iter().zip(&instances) {
          builder.connect(leg(*source, *sink));
        }
        continue;
      }

      let keys = if count > 1 {
        Some(keys_for(stream, count, codecs)?)
      } else {
        None
      };
      let keys_of = |i: usize| keys.as_ref().and_then(|k| k.get(i).cloned());
      match unifiers {
        Some(unifiers) => {
          for (i, (unifier, sink)) in unifiers.iter().zip(&instances).enumerate() {
            for source in &upstream {
              builder.connect(Connection {
                sink_port: merge_port_name(&stream.source.port),
                locality: Locality::Default,
                partition_keys: keys_of(i),
                sink_attributes: out_attributes.clone(),
                ..leg(*source, *unifier)
              });
            }
            builder.connect(Connection {
              source_attributes: in_attributes.clone(),
              ..leg(*unifier, *sink)
            });
          }
        }
        None => {
          for (i, sink) in instances.iter().enumerate() {
            for source in &upstream {
              builder.connect(Connection {
                partition_keys: keys_of(i),
                ..leg(*source, *sink)
              });
            }
          }
        }
      }
    }
    Ok(())
  }
}

fn is_parallel(def: &OperatorDef, port: &PortRef) -> bool {
  def
    .input_port(&port.port)
    .and_then(|p| p.attributes.get_bool(PARTITION_PARALLEL))
    .unwrap_or(false)
}

fn partition_count(
  def: &OperatorDef,
  inputs: &[(&StreamDef, &PortRef)],
  builder: &PlanBuilder,
) -> Result<u32, PlanError> {
  let parallel: Vec<u32> = inputs
    .iter()
    .filter(|(_, port)| is_parallel(def, port))
    .map(|(stream, _)| builder.instances(&stream.source.operator).len() as u32)
    .collect();
  if let Some(&first) = parallel.first() {
    if parallel.iter().any(|count| *count != first) {
      return Err(PlanError::ParallelPartitionMismatch {
        operator: def.name.clone(),
        counts: parallel,
      });
    }
    return Ok(first);
  }

  match def.attributes.get_int(INITIAL_PARTITION_COUNT) {
    None => Ok(1),
    Some(count) if (1..=MAX_PARTITION_COUNT).contains(&count) => Ok(count as u32),
    Some(count) => Err(PlanError::InvalidPartitionCount {
      operator: def.name.clone(),
      count,
    }),
  }
}

/// Key sets for the `count` partitions fed by `stream`.
///
/// A codec must hand back one non-empty set per partition.
fn keys_for(
  stream: &StreamDef,
  count: u32,
  codecs: &HashMap<String, Arc<dyn PartitionCodec>>,
) -> Result<Vec<PartitionKeys>, PlanError> {
  let Some(codec) = codecs.get(&stream.id) else {
    return Ok(round_robin_keys(count));
  };
  let keys = codec.assign_keys(count);
  let usable = keys.iter().filter(|k| !k.is_empty()).count();
  if keys.len() != count as usize || usable != keys.len() {
    return Err(PlanError::InvalidCodecKeys {
      stream: stream.id.clone(),
      codec: codec.name().to_string(),
      expected: count,
      found: usable,
    });
  }
  Ok(keys)
}

fn output_port_attributes(graph: &LogicalGraph, port: &PortRef) -> Result<Attributes, GraphError> {
  graph
    .operator(&port.operator)
    .ok_or_else(|| GraphError::UnknownOperator(port.operator.clone()))
    .map(|o| {
      o.output_port(&port.port)
        .map(|p| p.attributes.clone())
        .unwrap_or_default()
    })
}

#[derive(Default)]
struct PlanBuilder {
  operators: BTreeMap<OperatorId, PhysicalOperator>,
  connections: BTreeMap<ConnectionId, Connection>,
  instances: HashMap<String, Vec<OperatorId>>,
  last_operator: u32,
  last_connection: u32,
}

impl PlanBuilder {
  fn instances(&self, logical: &str) -> &[OperatorId] {
    self.instances.get(logical).map_or(&[], Vec::as_slice)
  }

  fn add_operator(
    &mut self,
    logical: &str,
    logic: LogicRef,
    kind: OperatorKind,
    attributes: Attributes,
    partition_keys: Option<PartitionKeys>,
    memory_mb: u32,
  ) -> OperatorId {
    self.last_operator += 1;
    let id = OperatorId(self.last_operator);
    self.operators.insert(
      id,
      PhysicalOperator {
        id,
        logical: logical.to_string(),
        logic,
        kind,
        attributes,
        partition_keys,
        memory_mb,
        // Placement assigns the real slot.
        slot: SlotId(0),
        state: OperatorState::Planned,
        inputs: Vec::new(),
        outputs: Vec::new(),
        recovery_window: None,
      },
    );
    id
  }

  /// Registers `connection` under a fresh id.
  fn connect(&mut self, mut connection: Connection) -> ConnectionId {
    self.last_connection += 1;
    let id = ConnectionId(self.last_connection);
    connection.id = id;
    if let Some(source) = self.operators.get_mut(&connection.source) {
      source.outputs.push(id);
    }
    if let Some(sink) = self.operators.get_mut(&connection.sink) {
      sink.inputs.push(id);
    }
    self.connections.insert(id, connection);
    id
  }

  fn finish(self) -> PhysicalPlan {
    PhysicalPlan {
      operators: self.operators,
      connections: self.connections,
      slots: Vec::new(),
      container_memory_mb: None,
    }
  }
}
