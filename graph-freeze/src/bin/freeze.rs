//! Freeze an exported checkpoint into its graph and optimize the result for
//! inference.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use graph_freeze::codec::{read_graph, write_graph};
use graph_freeze::config::PipelineConfig;
use graph_freeze::freeze::{freeze_graph, FreezeOptions};
use graph_freeze::logging::init_logging;
use graph_freeze::optimize::optimize_for_inference;

#[derive(Parser)]
struct Args {
    /// Pipeline configuration file (TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding the exported artifacts
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Stem of the artifact file names
    #[arg(long)]
    model_name: Option<String>,
    /// Saver definition file; the restore op is run directly when omitted
    #[arg(long)]
    input_saver: Option<PathBuf>,
    /// Nodes to run after restoring
    #[arg(long, value_delimiter = ',')]
    initializer_nodes: Vec<String>,
    /// Only convert these variables
    #[arg(long, value_delimiter = ',')]
    variable_names_whitelist: Vec<String>,
    /// Never convert these variables
    #[arg(long, value_delimiter = ',')]
    variable_names_blacklist: Vec<String>,
}

/// Application entry point for freezing and optimizing.
struct FreezeApp {
    config: PipelineConfig,
    options: FreezeOptions,
}

impl FreezeApp {
    fn new(cli: Args) -> Result<Self> {
        let mut config = PipelineConfig::load(cli.config.as_deref())?;
        if let Some(dir) = cli.dir {
            config.output_dir = dir;
        }
        if let Some(name) = cli.model_name {
            config.model_name = name;
        }

        let paths = config.artifacts();
        let input_graph = if config.input_binary {
            paths.graph_binary.clone()
        } else {
            paths.graph_text.clone()
        };
        let outputs: Vec<&str> = config.output_node_names.iter().map(String::as_str).collect();

        let mut options = FreezeOptions::new(input_graph, paths.checkpoint, &outputs, paths.frozen_graph);
        options.input_saver = cli.input_saver;
        options.input_binary = config.input_binary;
        options.restore_op_name = config.restore_op_name.clone();
        options.filename_tensor_name = config.filename_tensor_name.clone();
        options.clear_devices = config.clear_devices;
        options.initializer_nodes = cli.initializer_nodes;
        options.variable_names_whitelist = cli.variable_names_whitelist;
        options.variable_names_blacklist = cli.variable_names_blacklist;
        Ok(Self { config, options })
    }

    fn run(&self) -> Result<()> {
        freeze_graph(&self.options).context("freezing graph")?;

        let frozen = read_graph(&self.options.output_graph, true)
            .with_context(|| format!("reading {:?}", self.options.output_graph))?;
        let optimized = optimize_for_inference(
            &frozen,
            self.config.input_node_names.as_slice(),
            self.config.output_node_names.as_slice(),
            self.config.placeholder_type.as_datatype_enum(),
        )
        .context("optimizing graph")?;

        let target = self.config.artifacts().optimized_graph;
        let dir = target.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .context("optimized graph path has no file name")?;
        let path = write_graph(&optimized, dir, name, false)?;
        info!(path = %path.display(), nodes = optimized.len(), "wrote optimized graph");
        println!("Saved frozen graph to {:?}", self.options.output_graph);
        println!("Saved optimized graph to {:?}", path);
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Args::parse();
    let app = FreezeApp::new(cli)?;
    init_logging(&app.config.log_level);
    app.run()
}
