//! Pipeline configuration.
//!
//! Defaults reproduce the reference export: a model called `trained_model` in
//! the working directory with nodes `input` and `output`. A TOML or JSON file
//! can override any field.

use std::path::{Path, PathBuf};

use config::{Config, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::DataType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stem shared by every artifact file name.
    pub model_name: String,
    /// Directory the artifacts are written to and read from.
    pub output_dir: PathBuf,
    pub input_node_names: Vec<String>,
    pub output_node_names: Vec<String>,
    pub restore_op_name: String,
    pub filename_tensor_name: String,
    pub clear_devices: bool,
    /// Whether the freezer reads the binary graph instead of the text one.
    pub input_binary: bool,
    /// Element type the optimizer gives the input placeholders.
    pub placeholder_type: DataType,
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_name: "trained_model".to_string(),
            output_dir: PathBuf::from("."),
            input_node_names: vec!["input".to_string()],
            output_node_names: vec!["output".to_string()],
            restore_op_name: "save/restore_all".to_string(),
            filename_tensor_name: "save/Const:0".to_string(),
            clear_devices: true,
            input_binary: false,
            placeholder_type: DataType::Int32,
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load the defaults, overlaid with `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn artifacts(&self) -> ArtifactPaths {
        ArtifactPaths::new(&self.output_dir, &self.model_name)
    }
}

/// File locations of every artifact the pipeline produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub checkpoint: PathBuf,
    pub graph_binary: PathBuf,
    pub graph_text: PathBuf,
    pub frozen_graph: PathBuf,
    pub optimized_graph: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: impl AsRef<Path>, model_name: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            checkpoint: dir.join(format!("{}.sd", model_name)),
            graph_binary: dir.join(format!("{}.proto", model_name)),
            graph_text: dir.join(format!("{}.txt", model_name)),
            frozen_graph: dir.join(format!("frozen_{}.pb", model_name)),
            optimized_graph: dir.join(format!("optimized_{}.pb", model_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_reference_names() {
        let cfg = PipelineConfig::load(None).unwrap();
        let paths = cfg.artifacts();
        assert_eq!(paths.checkpoint, PathBuf::from("./trained_model.sd"));
        assert_eq!(paths.graph_binary, PathBuf::from("./trained_model.proto"));
        assert_eq!(paths.graph_text, PathBuf::from("./trained_model.txt"));
        assert_eq!(paths.frozen_graph, PathBuf::from("./frozen_trained_model.pb"));
        assert_eq!(paths.optimized_graph, PathBuf::from("./optimized_trained_model.pb"));
        assert_eq!(cfg.output_node_names, vec!["output"]);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(
            &path,
            "model_name = \"toy\"\nplaceholder_type = \"float32\"\nclear_devices = false\n",
        )
        .unwrap();

        let cfg = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.model_name, "toy");
        assert_eq!(cfg.placeholder_type, DataType::Float32);
        assert!(!cfg.clear_devices);
        assert_eq!(cfg.restore_op_name, "save/restore_all");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(PipelineConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
