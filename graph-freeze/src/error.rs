//! Error type shared by every stage of the export pipeline.

use std::path::PathBuf;
use thiserror::Error;

use crate::tensor::DataType;

/// Errors raised while building, running, freezing or optimizing a graph.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Malformed graph definition: {0}")]
    Decode(String),

    #[error("Node '{0}' is not in graph")]
    NodeNotFound(String),

    #[error("Duplicate node name: '{0}'")]
    DuplicateNode(String),

    #[error("Node '{node}' has an input from missing node '{input}'")]
    MissingInput { node: String, input: String },

    #[error("Type mismatch at '{node}': expected {expected}, got {actual}")]
    TypeMismatch {
        node: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("Shape mismatch at '{node}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        node: String,
        expected: Vec<i64>,
        actual: Vec<usize>,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Op '{op}' (node '{node}') is not implemented")]
    Unimplemented { node: String, op: String },

    #[error("Graph contains a cycle through node '{0}'")]
    Cycle(String),

    #[error("Input checkpoint '{}' doesn't exist", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("Key '{0}' not found in checkpoint")]
    KeyNotFound(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
