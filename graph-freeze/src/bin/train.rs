//! Build the toy model, run it once and export its checkpoint and graph.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ndarray::array;

use graph_freeze::config::PipelineConfig;
use graph_freeze::logging::init_logging;
use graph_freeze::model::{BiasInit, ModelArgs, ToyModel};

#[derive(Parser)]
struct Args {
    /// Pipeline configuration file (TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory the artifacts are written to
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Stem of the artifact file names
    #[arg(long)]
    model_name: Option<String>,
    /// Draw the bias uniformly from LOW..=HIGH instead of all ones
    #[arg(long, num_args = 2, value_names = ["LOW", "HIGH"], allow_negative_numbers = true)]
    random_bias: Option<Vec<i32>>,
}

/// Application entry point for training and export.
struct TrainApp {
    config: PipelineConfig,
    args: ModelArgs,
}

impl TrainApp {
    fn new(cli: Args) -> Result<Self> {
        let mut config = PipelineConfig::load(cli.config.as_deref())?;
        if let Some(dir) = cli.dir {
            config.output_dir = dir;
        }
        if let Some(name) = cli.model_name {
            config.model_name = name;
        }

        let mut args = ModelArgs::new();
        if let Some(input) = config.input_node_names.first() {
            args.input_name = input.clone();
        }
        if let Some(output) = config.output_node_names.first() {
            args.output_name = output.clone();
        }
        if let Some(range) = cli.random_bias {
            args.bias_init = BiasInit::RandomUniform { low: range[0], high: range[1] };
        }
        Ok(Self { config, args })
    }

    fn run(self) -> Result<()> {
        let model = ToyModel::new(self.args).context("building model graph")?;
        let mut session = model.session()?;

        let output = model.forward(&mut session, array![[1, 2], [3, 4]])?;
        println!("{}", output);

        let saver = model.saver_def();
        println!("{}", saver.filename_tensor_name);
        println!("{}", saver.restore_op_name);

        let exported = model
            .export(&mut session, &self.config.artifacts())
            .context("exporting model")?;
        println!("Saved checkpoint to {:?}", exported.checkpoint);
        println!("Saved graph to {:?} and {:?}", exported.graph_binary, exported.graph_text);
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Args::parse();
    let app = TrainApp::new(cli)?;
    init_logging(&app.config.log_level);
    app.run()
}
