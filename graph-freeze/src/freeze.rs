//! Freezing: restore a checkpoint into a session and bake every variable the
//! outputs depend on into a `Const` node.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::checkpoint::{Saver, SaverDef};
use crate::codec::{encode_graph, read_graph};
use crate::error::{GraphError, Result};
use crate::graph::{AttrValue, GraphDef, NodeDef};
use crate::session::Session;
use crate::tensor::Tensor;

/// Everything `freeze_graph` needs to locate its inputs and outputs.
#[derive(Debug, Clone)]
pub struct FreezeOptions {
    pub input_graph: PathBuf,
    /// Saver definition file; when absent the restore op is run directly.
    pub input_saver: Option<PathBuf>,
    pub input_binary: bool,
    pub input_checkpoint: PathBuf,
    pub output_node_names: Vec<String>,
    pub restore_op_name: String,
    pub filename_tensor_name: String,
    pub output_graph: PathBuf,
    pub clear_devices: bool,
    /// Nodes run after restoring, e.g. table initializers.
    pub initializer_nodes: Vec<String>,
    /// When non-empty, only these variables are converted.
    pub variable_names_whitelist: Vec<String>,
    pub variable_names_blacklist: Vec<String>,
}

impl FreezeOptions {
    pub fn new(
        input_graph: impl Into<PathBuf>,
        input_checkpoint: impl Into<PathBuf>,
        output_node_names: &[&str],
        output_graph: impl Into<PathBuf>,
    ) -> Self {
        let saver = SaverDef::default();
        Self {
            input_graph: input_graph.into(),
            input_saver: None,
            input_binary: false,
            input_checkpoint: input_checkpoint.into(),
            output_node_names: output_node_names.iter().map(|s| s.to_string()).collect(),
            restore_op_name: saver.restore_op_name,
            filename_tensor_name: saver.filename_tensor_name,
            output_graph: output_graph.into(),
            clear_devices: true,
            initializer_nodes: Vec::new(),
            variable_names_whitelist: Vec::new(),
            variable_names_blacklist: Vec::new(),
        }
    }
}

/// Read the graph named by `opts`, freeze it and write the result as a binary
/// graph to `opts.output_graph`.
pub fn freeze_graph(opts: &FreezeOptions) -> Result<GraphDef> {
    let graph = read_graph(&opts.input_graph, opts.input_binary)?;
    let saver_def = match &opts.input_saver {
        Some(path) => Some(SaverDef::load(path)?),
        None => None,
    };

    let frozen = freeze_graph_with_def(graph, saver_def.as_ref(), opts)?;

    if let Some(parent) = opts.output_graph.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&opts.output_graph, encode_graph(&frozen))?;
    info!(
        path = %opts.output_graph.display(),
        nodes = frozen.len(),
        "wrote frozen graph"
    );
    Ok(frozen)
}

/// Freeze an in-memory graph. Only the checkpoint is read from disk.
pub fn freeze_graph_with_def(
    mut graph: GraphDef,
    saver_def: Option<&SaverDef>,
    opts: &FreezeOptions,
) -> Result<GraphDef> {
    if !opts.input_checkpoint.is_file() {
        return Err(GraphError::CheckpointNotFound(opts.input_checkpoint.clone()));
    }
    if opts.output_node_names.is_empty() {
        return Err(GraphError::InvalidArgument(
            "You need to supply the name of a node to output_node_names".into(),
        ));
    }
    for name in &opts.output_node_names {
        if !graph.contains(name) {
            return Err(GraphError::NodeNotFound(name.clone()));
        }
    }

    if opts.clear_devices {
        graph.clear_devices();
    }

    let mut session = Session::new(graph)?;
    match saver_def {
        Some(def) => Saver::new(def.clone()).restore(&mut session, &opts.input_checkpoint)?,
        None => {
            let filename = Tensor::scalar_string(opts.input_checkpoint.to_string_lossy());
            session.run(
                &[(opts.filename_tensor_name.as_str(), filename)],
                &[],
                &[opts.restore_op_name.as_str()],
            )?;
        }
    }

    if !opts.initializer_nodes.is_empty() {
        let targets: Vec<&str> = opts.initializer_nodes.iter().map(String::as_str).collect();
        session.run(&[], &[], &targets)?;
    }

    convert_variables_to_constants(
        &mut session,
        opts.output_node_names.as_slice(),
        opts.variable_names_whitelist.as_slice(),
        opts.variable_names_blacklist.as_slice(),
    )
}

/// Replace every variable reachable from `output_node_names` with a `Const`
/// holding its current value in `session`.
///
/// The result contains only the nodes the outputs depend on.
pub fn convert_variables_to_constants<S: AsRef<str>>(
    session: &mut Session,
    output_node_names: &[S],
    whitelist: &[S],
    blacklist: &[S],
) -> Result<GraphDef> {
    let inference = session.graph().extract_sub_graph(output_node_names)?;

    let whitelist: HashSet<&str> = whitelist.iter().map(AsRef::as_ref).collect();
    let blacklist: HashSet<&str> = blacklist.iter().map(AsRef::as_ref).collect();

    let selected: Vec<&str> = inference
        .variables()
        .map(|n| n.name.as_str())
        .filter(|name| whitelist.is_empty() || whitelist.contains(name))
        .filter(|name| !blacklist.contains(name))
        .collect();
    for name in &whitelist {
        if !inference.contains(name) {
            warn!(variable = %name, "whitelisted variable is not used by the outputs");
        }
    }

    let values = session.run(&[], &selected, &[])?;

    let mut frozen = GraphDef {
        nodes: Vec::with_capacity(inference.len()),
        version: inference.version,
    };
    for node in &inference.nodes {
        match selected.iter().position(|name| *name == node.name) {
            Some(i) => {
                let value = values[i].clone();
                debug!(variable = %node.name, shape = ?value.shape(), "converting to const");
                let mut constant = NodeDef::new(node.name.clone(), "Const")
                    .attr("dtype", AttrValue::Type(value.dtype()))
                    .attr("value", AttrValue::Tensor(value));
                constant.device = node.device.clone();
                frozen.nodes.push(constant);
            }
            None => frozen.nodes.push(node.clone()),
        }
    }

    let remaining = frozen.variables().count();
    if remaining > 0 {
        debug!(remaining, "variables left unconverted");
    }
    info!(converted = selected.len(), "converted variables to const ops");
    Ok(frozen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::tensor::DataType;
    use ndarray::array;
    use tempfile::tempdir;

    fn trained(dir: &std::path::Path) -> (GraphDef, PathBuf) {
        let mut b = GraphBuilder::new();
        b.placeholder("input", DataType::Int32, &[2, 2]).unwrap();
        let bias = b.variable("bias", array![[1, 1], [1, 1]].into()).unwrap();
        b.add("output", "input", &bias.read).unwrap();
        let init = b.global_variables_initializer("init").unwrap();
        let saver = Saver::new(b.saver().unwrap());
        let graph = b.finish();

        let mut session = Session::new(graph.clone()).unwrap();
        session.run(&[], &[], &[init.as_str()]).unwrap();
        let ckpt = saver.save(&mut session, dir.join("model.sd")).unwrap();
        (graph, ckpt)
    }

    #[test]
    fn test_freeze_replaces_variables() {
        let dir = tempdir().unwrap();
        let (graph, ckpt) = trained(dir.path());
        let opts = FreezeOptions::new("unused", &ckpt, &["output"], "unused");

        let frozen = freeze_graph_with_def(graph, None, &opts).unwrap();
        assert_eq!(frozen.variables().count(), 0);
        let bias = frozen.node("bias").unwrap();
        assert_eq!(bias.op, "Const");
        assert_eq!(bias.get_tensor("value"), Some(&Tensor::from(array![[1, 1], [1, 1]])));
        assert!(!frozen.contains("save/restore_all"));
        assert!(!frozen.contains("init"));
    }

    #[test]
    fn test_freeze_with_saver_def() {
        let dir = tempdir().unwrap();
        let (graph, ckpt) = trained(dir.path());
        let opts = FreezeOptions::new("unused", &ckpt, &["output"], "unused");
        let frozen = freeze_graph_with_def(graph, Some(&SaverDef::default()), &opts).unwrap();
        assert_eq!(frozen.node("bias").unwrap().op, "Const");
    }

    #[test]
    fn test_missing_output_node() {
        let dir = tempdir().unwrap();
        let (graph, ckpt) = trained(dir.path());
        let opts = FreezeOptions::new("unused", &ckpt, &["logits"], "unused");
        let err = freeze_graph_with_def(graph, None, &opts).unwrap_err();
        assert!(matches!(err, GraphError::NodeNotFound(ref n) if n == "logits"));
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempdir().unwrap();
        let (graph, _) = trained(dir.path());
        let opts = FreezeOptions::new("unused", dir.path().join("nope.sd"), &["output"], "unused");
        assert!(matches!(
            freeze_graph_with_def(graph, None, &opts).unwrap_err(),
            GraphError::CheckpointNotFound(_)
        ));
    }

    #[test]
    fn test_blacklist_keeps_variable() {
        let dir = tempdir().unwrap();
        let (graph, ckpt) = trained(dir.path());
        let mut opts = FreezeOptions::new("unused", &ckpt, &["output"], "unused");
        opts.variable_names_blacklist = vec!["bias".to_string()];
        let frozen = freeze_graph_with_def(graph, None, &opts).unwrap();
        assert_eq!(frozen.node("bias").unwrap().op, "VariableV2");
    }
}
