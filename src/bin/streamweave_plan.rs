//! Compiles a logical graph document and prints the resulting plan.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use streamweave_control::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use streamweave_control::config::PlanConfig;
use streamweave_control::graph::LogicalGraph;
use streamweave_control::orchestrator::{ContainerManager, ResourceGrant};
use streamweave_control::partitioning::CodecRegistry;
use streamweave_control::plan::TransportAddress;
use tracing::info;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "streamweave-plan")]
#[command(about = "Compile StreamWeave dataflows into container plans", long_about = None)]
struct Cli {
  /// Planner configuration (JSON).
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Print slots, operators, connections and resource requests.
  Plan {
    /// Logical graph document (JSON).
    graph: PathBuf,
  },
  /// Bind every slot to a local container and print its deploy batch.
  Deploy {
    /// Logical graph document (JSON).
    graph: PathBuf,

    /// Host used for the simulated containers.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// First transport port; each container takes the next one.
    #[arg(long, default_value_t = 9000)]
    base_port: u16,
  },
}

fn load(graph: &Path, config: Option<&Path>) -> Result<ContainerManager> {
  let config = match config {
    Some(path) => PlanConfig::from_json_file(path)?,
    None => PlanConfig::default(),
  };
  let graph = LogicalGraph::from_json(&std::fs::read_to_string(graph)?)?;
  let store: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
    Some(dir) => Arc::new(FileCheckpointStore::new(dir)),
    None => Arc::new(InMemoryCheckpointStore::new()),
  };
  Ok(ContainerManager::new(&graph, config, &CodecRegistry::new(), store)?)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  match cli.cmd {
    Commands::Plan { graph } => {
      let manager = load(&graph, cli.config.as_deref())?;
      println!("{}", serde_json::to_string_pretty(&manager.summary())?);
    }
    Commands::Deploy {
      graph,
      host,
      base_port,
    } => {
      let mut manager = load(&graph, cli.config.as_deref())?;
      let requests = manager.take_new_requests();
      let mut batches = serde_json::Map::new();
      for (i, request) in requests.iter().enumerate() {
        let external_id = format!("container-{}", request.slot);
        let port = base_port.saturating_add(i as u16);
        manager.assign_container(
          &ResourceGrant::new(&external_id, &host, request.memory_mb).with_slot(request.slot),
          TransportAddress::new(&host, port),
        )?;
      }
      // Batches are rendered once every address is known.
      for request in &requests {
        let descriptors = manager.deploy_info(request.slot);
        batches.insert(
          format!("container-{}", request.slot),
          serde_json::to_value(descriptors)?,
        );
      }
      info!(containers = requests.len(), "deploy batches generated");
      println!("{}", serde_json::to_string_pretty(&batches)?);
    }
  }
  Ok(())
}
