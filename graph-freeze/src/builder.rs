//! Incremental graph construction with variables, initializers and savers.

use tracing::debug;

use crate::checkpoint::SaverDef;
use crate::error::{GraphError, Result};
use crate::graph::{is_variable_op, AttrValue, GraphDef, NodeDef};
use crate::tensor::{DataType, Tensor};

/// Names of the nodes that make up one variable.
#[derive(Debug, Clone)]
pub struct Variable {
    /// The `VariableV2` node.
    pub name: String,
    /// `Identity` node that reads the current value.
    pub read: String,
    /// `Assign` node that sets the initial value.
    pub initializer: String,
    pub dtype: DataType,
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: GraphDef,
    variables: Vec<Variable>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            graph: GraphDef::new(),
            variables: Vec::new(),
        }
    }

    pub fn graph(&self) -> &GraphDef {
        &self.graph
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn finish(self) -> GraphDef {
        self.graph
    }

    fn push(&mut self, node: NodeDef) -> Result<String> {
        let name = node.name.clone();
        self.graph.add_node(node)?;
        Ok(name)
    }

    /// Element type produced by the node behind `input`, if known.
    pub fn output_type(&self, input: &str) -> Option<DataType> {
        let node = self.graph.node(crate::graph::node_name_from_input(input))?;
        node.get_type("dtype").or_else(|| node.get_type("T"))
    }

    /// A value supplied at run time. Use `-1` for unknown dimensions.
    pub fn placeholder(&mut self, name: &str, dtype: DataType, shape: &[i64]) -> Result<String> {
        self.push(
            NodeDef::new(name, "Placeholder")
                .attr("dtype", AttrValue::Type(dtype))
                .attr("shape", AttrValue::Shape(shape.to_vec())),
        )
    }

    pub fn constant(&mut self, name: &str, value: Tensor) -> Result<String> {
        self.push(
            NodeDef::new(name, "Const")
                .attr("dtype", AttrValue::Type(value.dtype()))
                .attr("value", AttrValue::Tensor(value)),
        )
    }

    /// A mutable tensor initialized from `initial_value`.
    ///
    /// Adds `name` (`VariableV2`), `name/initial_value` (`Const`),
    /// `name/Assign` and `name/read` (`Identity`).
    pub fn variable(&mut self, name: &str, initial_value: Tensor) -> Result<Variable> {
        let dtype = initial_value.dtype();
        let shape: Vec<i64> = initial_value.shape().iter().map(|&d| d as i64).collect();

        self.push(
            NodeDef::new(name, "VariableV2")
                .attr("dtype", AttrValue::Type(dtype))
                .attr("shape", AttrValue::Shape(shape)),
        )?;
        let init_value = self.constant(&format!("{}/initial_value", name), initial_value)?;
        let initializer = self.push(
            NodeDef::new(format!("{}/Assign", name), "Assign")
                .input(name)
                .input(init_value)
                .attr("T", AttrValue::Type(dtype))
                .attr("validate_shape", AttrValue::B(true)),
        )?;
        let read = self.identity(&format!("{}/read", name), name)?;

        let var = Variable {
            name: name.to_string(),
            read,
            initializer,
            dtype,
        };
        debug!(variable = %var.name, %dtype, "added variable");
        self.variables.push(var.clone());
        Ok(var)
    }

    pub fn identity(&mut self, name: &str, input: &str) -> Result<String> {
        let mut node = NodeDef::new(name, "Identity").input(input);
        if let Some(t) = self.output_type(input) {
            node = node.attr("T", AttrValue::Type(t));
        }
        self.push(node)
    }

    pub fn add(&mut self, name: &str, a: &str, b: &str) -> Result<String> {
        self.binary("Add", name, a, b)
    }

    pub fn sub(&mut self, name: &str, a: &str, b: &str) -> Result<String> {
        self.binary("Sub", name, a, b)
    }

    pub fn mul(&mut self, name: &str, a: &str, b: &str) -> Result<String> {
        self.binary("Mul", name, a, b)
    }

    fn binary(&mut self, op: &str, name: &str, a: &str, b: &str) -> Result<String> {
        let mut node = NodeDef::new(name, op).input(a).input(b);
        match (self.output_type(a), self.output_type(b)) {
            (Some(ta), Some(tb)) if ta != tb => {
                return Err(GraphError::TypeMismatch {
                    node: name.to_string(),
                    expected: ta,
                    actual: tb,
                })
            }
            (Some(t), _) | (None, Some(t)) => node = node.attr("T", AttrValue::Type(t)),
            (None, None) => {}
        }
        self.push(node)
    }

    /// A `NoOp` that runs every variable initializer.
    pub fn global_variables_initializer(&mut self, name: &str) -> Result<String> {
        let mut node = NodeDef::new(name, "NoOp");
        for var in &self.variables {
            node = node.control_input(&var.initializer);
        }
        self.push(node)
    }

    /// Adds the `save/` subgraph covering every variable in the graph.
    pub fn saver(&mut self) -> Result<SaverDef> {
        let vars: Vec<(String, DataType)> = self
            .graph
            .nodes
            .iter()
            .filter(|n| is_variable_op(&n.op))
            .map(|n| (n.name.clone(), n.get_type("dtype").unwrap_or(DataType::Float32)))
            .collect();
        if vars.is_empty() {
            return Err(GraphError::InvalidArgument("No variables to save".into()));
        }
        let names: Vec<&str> = vars.iter().map(|(n, _)| n.as_str()).collect();
        let dtypes: Vec<DataType> = vars.iter().map(|(_, t)| *t).collect();

        let filename = self.constant("save/Const", Tensor::scalar_string("model"))?;

        let save_names = self.constant("save/SaveV2/tensor_names", Tensor::string_list(&names))?;
        let mut save = NodeDef::new("save/SaveV2", "SaveV2")
            .input(filename.as_str())
            .input(save_names)
            .attr("dtypes", AttrValue::TypeList(dtypes.clone()));
        for name in &names {
            save = save.input(*name);
        }
        let save = self.push(save)?;
        self.push(
            NodeDef::new("save/control_dependency", "Identity")
                .input(filename.as_str())
                .control_input(&save)
                .attr("T", AttrValue::Type(DataType::String)),
        )?;

        let restore_names =
            self.constant("save/RestoreV2/tensor_names", Tensor::string_list(&names))?;
        let restore = self.push(
            NodeDef::new("save/RestoreV2", "RestoreV2")
                .input(filename.as_str())
                .input(restore_names)
                .attr("dtypes", AttrValue::TypeList(dtypes.clone())),
        )?;

        let mut restore_all = NodeDef::new("save/restore_all", "NoOp");
        for (i, (name, dtype)) in vars.iter().enumerate() {
            let assign_name = if i == 0 {
                "save/Assign".to_string()
            } else {
                format!("save/Assign_{}", i)
            };
            let assign = self.push(
                NodeDef::new(assign_name, "Assign")
                    .input(name.as_str())
                    .input(format!("{}:{}", restore, i))
                    .attr("T", AttrValue::Type(*dtype))
                    .attr("validate_shape", AttrValue::B(true)),
            )?;
            restore_all = restore_all.control_input(&assign);
        }
        self.push(restore_all)?;

        Ok(SaverDef::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, Saver};
    use crate::session::Session;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn test_variable_nodes() {
        let mut b = GraphBuilder::new();
        let var = b.variable("bias", array![[1, 1], [1, 1]].into()).unwrap();
        assert_eq!(var.read, "bias/read");
        assert_eq!(var.initializer, "bias/Assign");
        let g = b.graph();
        assert_eq!(g.node("bias").unwrap().op, "VariableV2");
        assert_eq!(g.node("bias/read").unwrap().get_type("T"), Some(DataType::Int32));
    }

    #[test]
    fn test_binary_rejects_mixed_types() {
        let mut b = GraphBuilder::new();
        b.placeholder("x", DataType::Int32, &[2]).unwrap();
        b.placeholder("y", DataType::Float32, &[2]).unwrap();
        assert!(b.add("z", "x", "y").is_err());
    }

    #[test]
    fn test_sub_and_mul() {
        let mut b = GraphBuilder::new();
        b.placeholder("x", DataType::Int32, &[2]).unwrap();
        b.constant("k", Tensor::Int32(array![3, 4].into_dyn())).unwrap();
        b.sub("diff", "x", "k").unwrap();
        b.mul("prod", "diff", "k").unwrap();
        assert_eq!(b.graph().node("prod").unwrap().get_type("T"), Some(DataType::Int32));
        assert_eq!(b.graph().node("diff").unwrap().get_type("T"), Some(DataType::Int32));

        let mut session = Session::new(b.finish()).unwrap();
        let out = session
            .run(&[("x", Tensor::Int32(array![10, 20].into_dyn()))], &["diff", "prod"], &[])
            .unwrap();
        assert_eq!(out[0], Tensor::Int32(array![7, 16].into_dyn()));
        assert_eq!(out[1], Tensor::Int32(array![21, 64].into_dyn()));
    }

    #[test]
    fn test_saver_overwrites_stale_checkpoint() {
        let dir = tempdir().unwrap();
        let ckpt = dir.path().join("vars.sd");
        let stale = Tensor::from(array![[9, 9], [9, 9]]);
        CheckpointStore::create(&ckpt)
            .unwrap()
            .save_tensors(&[("old_weight", &stale)])
            .unwrap();

        let mut b = GraphBuilder::new();
        b.variable("bias", array![[1, 1], [1, 1]].into()).unwrap();
        let init = b.global_variables_initializer("init").unwrap();
        let saver = Saver::new(b.saver().unwrap());
        let mut session = Session::new(b.finish()).unwrap();
        session.run(&[], &[], &[init.as_str()]).unwrap();
        saver.save(&mut session, &ckpt).unwrap();

        let store = CheckpointStore::open(&ckpt).unwrap();
        assert_eq!(store.tensor_names().unwrap(), vec!["bias"]);
    }

    #[test]
    fn test_saver_requires_variables() {
        let mut b = GraphBuilder::new();
        b.placeholder("x", DataType::Int32, &[2]).unwrap();
        assert!(b.saver().is_err());
    }

    #[test]
    fn test_saver_save_and_restore() {
        let dir = tempdir().unwrap();
        let ckpt = dir.path().join("vars.sd");

        let mut b = GraphBuilder::new();
        b.variable("bias", array![[1, 1], [1, 1]].into()).unwrap();
        b.variable("scale", array![[2, 2], [2, 2]].into()).unwrap();
        let init = b.global_variables_initializer("init").unwrap();
        let saver = Saver::new(b.saver().unwrap());
        let graph = b.finish();

        let mut trained = Session::new(graph.clone()).unwrap();
        trained.run(&[], &[], &[init.as_str()]).unwrap();
        saver.save(&mut trained, &ckpt).unwrap();

        let mut restored = Session::new(graph).unwrap();
        saver.restore(&mut restored, &ckpt).unwrap();
        assert_eq!(restored.variable("bias"), trained.variable("bias"));
        assert_eq!(restored.variable("scale"), Some(&Tensor::from(array![[2, 2], [2, 2]])));
    }
}
