//! Inference runtime for frozen graphs.
//!
//! A [`FrozenModel`] holds a graph with no variables left and evaluates one
//! output from one input. The C ABI in [`ffi`] wraps it for other hosts.

use std::fs::{self, File};
use std::path::Path;

use graph_freeze::codec::{decode_graph, encode_graph};
use graph_freeze::model::output_matrix;
use graph_freeze::{GraphDef, GraphError, Result, Session, Tensor};
use memmap2::MmapOptions;
use ndarray::Array2;
use tracing::debug;

pub mod ffi;
pub use ffi::*;

pub const DEFAULT_INPUT: &str = "input";
pub const DEFAULT_OUTPUT: &str = "output";

/// A frozen graph ready for inference.
pub struct FrozenModel {
    session: Session,
    input: String,
    output: String,
}

impl FrozenModel {
    /// Wrap `graph`, checking that it is frozen and has both endpoints.
    pub fn from_graph(graph: GraphDef, input: &str, output: &str) -> Result<Self> {
        if let Some(var) = graph.variables().next() {
            return Err(GraphError::FailedPrecondition(format!(
                "graph still contains variable '{}'; freeze it first",
                var.name
            )));
        }
        for name in [input, output] {
            if !graph.contains(name) {
                return Err(GraphError::NodeNotFound(name.to_string()));
            }
        }
        debug!(nodes = graph.len(), input, output, "loaded frozen model");
        Ok(Self {
            session: Session::new(graph)?,
            input: input.to_string(),
            output: output.to_string(),
        })
    }

    pub fn load(path: &Path, input: &str, output: &str) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_graph(decode_graph(&bytes)?, input, output)
    }

    pub fn load_mmap(path: &Path, input: &str, output: &str) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::from_graph(decode_graph(&mmap[..])?, input, output)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, encode_graph(self.session.graph()))?;
        Ok(())
    }

    pub fn graph(&self) -> &GraphDef {
        self.session.graph()
    }

    pub fn input_name(&self) -> &str {
        &self.input
    }

    pub fn output_name(&self) -> &str {
        &self.output
    }

    /// Feed `input` and fetch the output tensor.
    pub fn run(&mut self, input: Tensor) -> Result<Tensor> {
        let out = self
            .session
            .runner()
            .feed(&self.input, input)
            .fetch(&self.output)
            .run()?;
        out.into_iter()
            .next()
            .ok_or_else(|| GraphError::NodeNotFound(self.output.clone()))
    }

    pub fn run_i32(&mut self, input: Array2<i32>) -> Result<Array2<i32>> {
        let out = self.run(input.into())?;
        output_matrix(&self.output, Some(out))
    }
}
