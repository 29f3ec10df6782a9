use graph_freeze::codec::encode_graph;
use graph_freeze::config::ArtifactPaths;
use graph_freeze::freeze::{freeze_graph, FreezeOptions};
use graph_freeze::model::{ModelArgs, ToyModel};
use graph_freeze::optimize::optimize_for_inference;
use graph_freeze::GraphError;
use mobile::FrozenModel;
use ndarray::array;
use std::path::Path;
use tempfile::{tempdir, NamedTempFile};

fn frozen_file(dir: &Path) -> ArtifactPaths {
    let model = ToyModel::new(ModelArgs::new()).unwrap();
    let mut session = model.session().unwrap();
    let paths = ArtifactPaths::new(dir, "trained_model");
    model.export(&mut session, &paths).unwrap();
    freeze_graph(&FreezeOptions::new(
        &paths.graph_text,
        &paths.checkpoint,
        &["output"],
        &paths.frozen_graph,
    ))
    .unwrap();
    paths
}

#[test]
fn test_load_and_run() {
    let dir = tempdir().unwrap();
    let paths = frozen_file(dir.path());

    let mut model = FrozenModel::load(&paths.frozen_graph, "input", "output").unwrap();
    assert_eq!(model.input_name(), "input");
    assert_eq!(model.output_name(), "output");
    let out = model.run_i32(array![[1, 2], [3, 4]]).unwrap();
    assert_eq!(out, array![[2, 3], [4, 5]]);
}

#[test]
fn test_load_mmap_optimized() {
    let dir = tempdir().unwrap();
    let paths = frozen_file(dir.path());
    let frozen = FrozenModel::load(&paths.frozen_graph, "input", "output").unwrap();
    let optimized = optimize_for_inference(frozen.graph(), &["input"], &["output"], 3).unwrap();

    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), encode_graph(&optimized)).unwrap();
    let mut model = FrozenModel::load_mmap(file.path(), "input", "output").unwrap();
    assert_eq!(model.run_i32(array![[10, 20], [30, 40]]).unwrap(), array![[11, 21], [31, 41]]);
}

#[test]
fn test_save_and_reload() {
    let dir = tempdir().unwrap();
    let paths = frozen_file(dir.path());
    let model = FrozenModel::load(&paths.frozen_graph, "input", "output").unwrap();

    let file = NamedTempFile::new().unwrap();
    model.save(file.path()).unwrap();
    let reloaded = FrozenModel::load(file.path(), "input", "output").unwrap();
    assert_eq!(reloaded.graph(), model.graph());
}

#[test]
fn test_rejects_unfrozen_graph() {
    let model = ToyModel::new(ModelArgs::new()).unwrap();
    let err = FrozenModel::from_graph(model.graph().clone(), "input", "output").err().unwrap();
    assert!(matches!(err, GraphError::FailedPrecondition(_)));
}

#[test]
fn test_rejects_missing_endpoint() {
    let dir = tempdir().unwrap();
    let paths = frozen_file(dir.path());
    let err = FrozenModel::load(&paths.frozen_graph, "features", "output").err().unwrap();
    assert!(matches!(err, GraphError::NodeNotFound(ref n) if n == "features"));
}

#[test]
fn test_wrong_input_shape() {
    let dir = tempdir().unwrap();
    let paths = frozen_file(dir.path());
    let mut model = FrozenModel::load(&paths.frozen_graph, "input", "output").unwrap();
    assert!(model.run_i32(array![[1, 2, 3]]).is_err());
}
