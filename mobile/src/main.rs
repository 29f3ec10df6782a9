use anyhow::{bail, Context, Result};
use clap::Parser;
use graph_freeze::logging::init_logging;
use mobile::{FrozenModel, DEFAULT_INPUT, DEFAULT_OUTPUT};
use ndarray::Array2;
use std::path::PathBuf;

#[derive(Parser)]
struct Args {
    /// Frozen or optimized graph to load
    #[arg(long, default_value = "frozen_trained_model.pb")]
    model: PathBuf,
    /// Input values, row-major
    #[arg(long, value_delimiter = ',', default_value = "1,2,3,4", allow_negative_numbers = true)]
    input: Vec<i32>,
    /// Input shape as ROWS,COLS
    #[arg(long, value_delimiter = ',', default_value = "2,2")]
    shape: Vec<usize>,
    #[arg(long, default_value = DEFAULT_INPUT)]
    input_node: String,
    #[arg(long, default_value = DEFAULT_OUTPUT)]
    output_node: String,
}

fn main() -> Result<()> {
    init_logging("warn");
    let args = Args::parse();
    if args.shape.len() != 2 {
        bail!("--shape takes two dimensions, got {:?}", args.shape);
    }

    let mut model = FrozenModel::load_mmap(&args.model, &args.input_node, &args.output_node)
        .with_context(|| format!("loading {:?}", args.model))?;
    let input = Array2::from_shape_vec((args.shape[0], args.shape[1]), args.input)
        .context("input does not match --shape")?;
    let output = model.run_i32(input)?;
    for value in output.iter() {
        println!("{}", value);
    }
    Ok(())
}
