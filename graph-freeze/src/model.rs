use std::path::PathBuf;

use ndarray::{Array2, Ix2};
use rand::Rng;
use tracing::info;

use crate::builder::GraphBuilder;
use crate::checkpoint::{Saver, SaverDef};
use crate::codec::write_graph;
use crate::config::ArtifactPaths;
use crate::error::{GraphError, Result};
use crate::graph::GraphDef;
use crate::session::Session;
use crate::tensor::{DataType, Tensor};

/// How the bias variable gets its starting value.
#[derive(Clone, Debug)]
pub enum BiasInit {
    /// A fixed matrix; must match the model shape.
    Constant(Array2<i32>),
    /// Integers drawn uniformly from `low..=high`.
    RandomUniform { low: i32, high: i32 },
}

/// Configuration for the toy addition model.
#[derive(Clone, Debug)]
pub struct ModelArgs {
    /// Rows of the input and bias.
    pub rows: usize,
    /// Columns of the input and bias.
    pub cols: usize,
    pub input_name: String,
    pub bias_name: String,
    pub output_name: String,
    pub bias_init: BiasInit,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            rows: 2,
            cols: 2,
            input_name: "input".to_string(),
            bias_name: "bias".to_string(),
            output_name: "output".to_string(),
            bias_init: BiasInit::Constant(Array2::ones((2, 2))),
        }
    }
}

impl ModelArgs {
    /// Convenience constructor for the reference 2x2 model.
    pub fn new() -> Self {
        Self::default()
    }

    fn initial_bias(&self) -> Result<Array2<i32>> {
        match &self.bias_init {
            BiasInit::Constant(bias) => {
                if bias.dim() != (self.rows, self.cols) {
                    return Err(GraphError::ShapeMismatch {
                        node: self.bias_name.clone(),
                        expected: vec![self.rows as i64, self.cols as i64],
                        actual: bias.shape().to_vec(),
                    });
                }
                Ok(bias.clone())
            }
            BiasInit::RandomUniform { low, high } => {
                if low > high {
                    return Err(GraphError::InvalidArgument(format!(
                        "empty bias range {}..={}",
                        low, high
                    )));
                }
                let mut rng = rand::thread_rng();
                Ok(Array2::from_shape_fn((self.rows, self.cols), |_| {
                    rng.gen_range(*low..=*high)
                }))
            }
        }
    }
}

/// `output = input + bias`, with `bias` held in a variable.
pub struct ToyModel {
    args: ModelArgs,
    graph: GraphDef,
    saver: Saver,
    init_op: String,
}

/// Files written by [`ToyModel::export`].
#[derive(Debug, Clone)]
pub struct ExportedModel {
    pub checkpoint: PathBuf,
    pub graph_binary: PathBuf,
    pub graph_text: PathBuf,
}

impl ToyModel {
    pub fn new(args: ModelArgs) -> Result<Self> {
        let bias = args.initial_bias()?;
        let shape = [args.rows as i64, args.cols as i64];

        let mut b = GraphBuilder::new();
        let input = b.placeholder(&args.input_name, DataType::Int32, &shape)?;
        let bias = b.variable(&args.bias_name, bias.into())?;
        b.add(&args.output_name, &input, &bias.read)?;
        let init_op = b.global_variables_initializer("init")?;
        let saver = Saver::new(b.saver()?);

        Ok(Self {
            args,
            graph: b.finish(),
            saver,
            init_op,
        })
    }

    pub fn graph(&self) -> &GraphDef {
        &self.graph
    }

    pub fn saver_def(&self) -> &SaverDef {
        self.saver.saver_def()
    }

    /// A session with every variable initialized.
    pub fn session(&self) -> Result<Session> {
        let mut session = Session::new(self.graph.clone())?;
        session.run(&[], &[], &[self.init_op.as_str()])?;
        Ok(session)
    }

    /// Run the model once on `input`.
    pub fn forward(&self, session: &mut Session, input: Array2<i32>) -> Result<Array2<i32>> {
        let out = session
            .runner()
            .feed(&self.args.input_name, input.into())
            .fetch(&self.args.output_name)
            .run()?;
        output_matrix(&self.args.output_name, out.into_iter().next())
    }

    /// Write the checkpoint plus the binary and text graph definitions.
    pub fn export(&self, session: &mut Session, paths: &ArtifactPaths) -> Result<ExportedModel> {
        let checkpoint = self.saver.save(session, &paths.checkpoint)?;
        let graph_binary = write_artifact(&self.graph, &paths.graph_binary, false)?;
        let graph_text = write_artifact(&self.graph, &paths.graph_text, true)?;

        info!(
            checkpoint = %checkpoint.display(),
            graph = %graph_binary.display(),
            nodes = self.graph.len(),
            "exported model"
        );
        Ok(ExportedModel {
            checkpoint,
            graph_binary,
            graph_text,
        })
    }
}

fn write_artifact(graph: &GraphDef, path: &std::path::Path, as_text: bool) -> Result<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GraphError::InvalidArgument(format!("bad artifact path {}", path.display())))?;
    write_graph(graph, dir, name, as_text)
}

/// Convert a fetched tensor into an `i32` matrix.
pub fn output_matrix(name: &str, tensor: Option<Tensor>) -> Result<Array2<i32>> {
    let tensor = tensor.ok_or_else(|| GraphError::NodeNotFound(name.to_string()))?;
    let actual = tensor.dtype();
    match tensor {
        Tensor::Int32(values) => {
            let shape = values.shape().to_vec();
            values.into_dimensionality::<Ix2>().map_err(|_| GraphError::ShapeMismatch {
                node: name.to_string(),
                expected: vec![-1, -1],
                actual: shape,
            })
        }
        _ => Err(GraphError::TypeMismatch {
            node: name.to_string(),
            expected: DataType::Int32,
            actual,
        }),
    }
}
