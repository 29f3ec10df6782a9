use std::fs;
use std::path::Path;

use graph_freeze::codec::read_graph;
use graph_freeze::config::{ArtifactPaths, PipelineConfig};
use graph_freeze::freeze::{freeze_graph, FreezeOptions};
use graph_freeze::model::{output_matrix, ModelArgs, ToyModel};
use graph_freeze::optimize::optimize_for_inference;
use graph_freeze::{DataType, GraphDef, GraphError, Session, Tensor};
use ndarray::{array, Array2};
use tempfile::tempdir;

fn export(dir: &Path) -> ArtifactPaths {
    let model = ToyModel::new(ModelArgs::new()).unwrap();
    let mut session = model.session().unwrap();
    let paths = ArtifactPaths::new(dir, "trained_model");
    model.export(&mut session, &paths).unwrap();
    paths
}

fn freeze_options(paths: &ArtifactPaths) -> FreezeOptions {
    FreezeOptions::new(&paths.graph_text, &paths.checkpoint, &["output"], &paths.frozen_graph)
}

fn run(graph: GraphDef, input: Array2<i32>) -> Array2<i32> {
    let mut session = Session::new(graph).unwrap();
    let out = session.run(&[("input", input.into())], &["output"], &[]).unwrap();
    output_matrix("output", out.into_iter().next()).unwrap()
}

#[test]
fn test_trained_output() {
    let model = ToyModel::new(ModelArgs::new()).unwrap();
    let mut session = model.session().unwrap();
    let out = model.forward(&mut session, array![[1, 2], [3, 4]]).unwrap();
    assert_eq!(out, array![[2, 3], [4, 5]]);
}

#[test]
fn test_frozen_graph_output() {
    let dir = tempdir().unwrap();
    let paths = export(dir.path());

    freeze_graph(&freeze_options(&paths)).unwrap();
    let frozen = read_graph(&paths.frozen_graph, true).unwrap();
    assert_eq!(frozen.variables().count(), 0);
    assert_eq!(run(frozen, array![[1, 2], [3, 4]]), array![[2, 3], [4, 5]]);
}

#[test]
fn test_frozen_from_binary_graph() {
    let dir = tempdir().unwrap();
    let paths = export(dir.path());

    let mut opts = freeze_options(&paths);
    opts.input_graph = paths.graph_binary.clone();
    opts.input_binary = true;
    let frozen = freeze_graph(&opts).unwrap();
    assert_eq!(run(frozen, array![[0, 0], [0, 0]]), array![[1, 1], [1, 1]]);
}

#[test]
fn test_optimized_graph_output() {
    let dir = tempdir().unwrap();
    let paths = export(dir.path());
    freeze_graph(&freeze_options(&paths)).unwrap();

    let frozen = read_graph(&paths.frozen_graph, true).unwrap();
    let optimized = optimize_for_inference(
        &frozen,
        &["input"],
        &["output"],
        DataType::Int32.as_datatype_enum(),
    )
    .unwrap();

    assert!(optimized.nodes.iter().all(|n| n.op != "Identity"));
    assert_eq!(optimized.variables().count(), 0);
    assert_eq!(optimized.len(), 3);
    assert_eq!(run(optimized, array![[1, 2], [3, 4]]), array![[2, 3], [4, 5]]);
}

#[test]
fn test_float_placeholder_rejects_int_feed() {
    let dir = tempdir().unwrap();
    let paths = export(dir.path());
    let frozen = freeze_graph(&freeze_options(&paths)).unwrap();

    let optimized = optimize_for_inference(
        &frozen,
        &["input"],
        &["output"],
        DataType::Float32.as_datatype_enum(),
    )
    .unwrap();
    let mut session = Session::new(optimized).unwrap();
    let err = session
        .run(&[("input", Tensor::from(array![[1, 2], [3, 4]]))], &["output"], &[])
        .unwrap_err();
    assert!(matches!(err, GraphError::TypeMismatch { .. }));
}

#[test]
fn test_freeze_fails_on_missing_output() {
    let dir = tempdir().unwrap();
    let paths = export(dir.path());
    let mut opts = freeze_options(&paths);
    opts.output_node_names = vec!["prediction".to_string()];

    let err = freeze_graph(&opts).unwrap_err();
    assert!(matches!(err, GraphError::NodeNotFound(ref n) if n == "prediction"));
    assert!(!paths.frozen_graph.exists());
}

#[test]
fn test_freeze_fails_without_outputs() {
    let dir = tempdir().unwrap();
    let paths = export(dir.path());
    let mut opts = freeze_options(&paths);
    opts.output_node_names.clear();
    assert!(matches!(freeze_graph(&opts).unwrap_err(), GraphError::InvalidArgument(_)));
}

#[test]
fn test_freeze_fails_on_corrupt_graph() {
    let dir = tempdir().unwrap();
    let paths = export(dir.path());
    fs::write(&paths.graph_binary, b"TGDF\x01\x00").unwrap();

    let mut opts = freeze_options(&paths);
    opts.input_graph = paths.graph_binary.clone();
    opts.input_binary = true;
    assert!(matches!(freeze_graph(&opts).unwrap_err(), GraphError::Decode(_)));
}

#[test]
fn test_optimize_fails_on_missing_input() {
    let dir = tempdir().unwrap();
    let paths = export(dir.path());
    let frozen = freeze_graph(&freeze_options(&paths)).unwrap();
    let err = optimize_for_inference(&frozen, &["features"], &["output"], 3).unwrap_err();
    assert!(matches!(err, GraphError::NodeNotFound(_)));
}

#[test]
fn test_default_config_names_match_export() {
    let cfg = PipelineConfig::default();
    let dir = tempdir().unwrap();
    let paths = export(dir.path());
    let from_cfg = ArtifactPaths::new(dir.path(), &cfg.model_name);
    assert_eq!(paths, from_cfg);
}
