//! Train, freeze and optimize small dataflow graphs.
//!
//! [`model`] builds and exports a graph with a variable, [`freeze`] bakes a
//! checkpoint into constants and [`optimize`] strips the frozen graph down to
//! what inference needs. The `train` and `freeze` binaries drive the stages.

pub mod builder;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod freeze;
pub mod graph;
pub mod logging;
pub mod model;
pub mod ops;
pub mod optimize;
pub mod session;
pub mod tensor;

pub use error::{GraphError, Result};
pub use graph::{GraphDef, NodeDef};
pub use session::Session;
pub use tensor::{DataType, Tensor};
