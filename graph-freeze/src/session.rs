//! Graph execution.
//!
//! A [`Session`] owns a graph and the current value of every variable. Each
//! run evaluates only what the requested fetches and targets depend on.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::checkpoint::CheckpointStore;
use crate::error::{GraphError, Result};
use crate::graph::{is_variable_op, AttrValue, GraphDef, InputRef, NodeDef};
use crate::ops;
use crate::tensor::Tensor;

pub struct Session {
    graph: GraphDef,
    index: HashMap<String, usize>,
    variables: HashMap<String, Tensor>,
}

impl Session {
    /// Create a session over a validated copy of `graph`.
    pub fn new(graph: GraphDef) -> Result<Self> {
        graph.validate()?;
        let index = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        Ok(Self {
            graph,
            index,
            variables: HashMap::new(),
        })
    }

    pub fn graph(&self) -> &GraphDef {
        &self.graph
    }

    /// Current value of a variable, if it has been initialized.
    pub fn variable(&self, name: &str) -> Option<&Tensor> {
        self.variables.get(name)
    }

    pub fn runner(&mut self) -> Runner<'_> {
        Runner {
            session: self,
            feeds: Vec::new(),
            fetches: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Evaluate `fetches` (tensor names) and run `targets` (node names).
    ///
    /// Fed tensors replace whatever their node would have produced.
    pub fn run(
        &mut self,
        feeds: &[(&str, Tensor)],
        fetches: &[&str],
        targets: &[&str],
    ) -> Result<Vec<Tensor>> {
        self.execute(
            feeds.iter().map(|(n, t)| (n.to_string(), t.clone())).collect(),
            fetches.iter().map(|s| s.to_string()).collect(),
            targets.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn execute(
        &mut self,
        feeds: Vec<(String, Tensor)>,
        fetches: Vec<String>,
        targets: Vec<String>,
    ) -> Result<Vec<Tensor>> {
        let mut fed = HashMap::with_capacity(feeds.len());
        for (name, tensor) in feeds {
            let r = InputRef::parse(&name);
            let node = self.node(r.node)?;
            check_feed(node, &tensor)?;
            fed.insert((r.node.to_string(), r.index), tensor);
        }

        debug!(
            feeds = fed.len(),
            fetches = fetches.len(),
            targets = targets.len(),
            "session run"
        );

        let mut exec = Execution {
            graph: &self.graph,
            index: &self.index,
            variables: &mut self.variables,
            fed,
            cache: HashMap::new(),
            visiting: HashSet::new(),
        };

        for target in &targets {
            exec.eval_node(target)?;
        }
        fetches
            .iter()
            .map(|name| exec.eval_tensor(InputRef::parse(name)))
            .collect()
    }

    fn node(&self, name: &str) -> Result<&NodeDef> {
        self.index
            .get(name)
            .map(|&i| &self.graph.nodes[i])
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))
    }
}

/// Feed/fetch builder over a session.
pub struct Runner<'s> {
    session: &'s mut Session,
    feeds: Vec<(String, Tensor)>,
    fetches: Vec<String>,
    targets: Vec<String>,
}

impl<'s> Runner<'s> {
    pub fn feed(mut self, name: &str, tensor: Tensor) -> Self {
        self.feeds.push((name.to_string(), tensor));
        self
    }

    pub fn fetch(mut self, name: &str) -> Self {
        self.fetches.push(name.to_string());
        self
    }

    pub fn add_target(mut self, name: &str) -> Self {
        self.targets.push(name.to_string());
        self
    }

    pub fn run(self) -> Result<Vec<Tensor>> {
        self.session.execute(self.feeds, self.fetches, self.targets)
    }
}

/// Placeholders only accept tensors of their declared dtype and static shape.
fn check_feed(node: &NodeDef, tensor: &Tensor) -> Result<()> {
    if !node.op.starts_with("Placeholder") {
        return Ok(());
    }
    if let Some(expected) = node.get_type("dtype") {
        if expected != tensor.dtype() {
            return Err(GraphError::TypeMismatch {
                node: node.name.clone(),
                expected,
                actual: tensor.dtype(),
            });
        }
    }
    if let Some(dims) = node.get_shape("shape") {
        let actual = tensor.shape();
        let compatible = dims.len() == actual.len()
            && dims
                .iter()
                .zip(actual)
                .all(|(&want, &got)| want < 0 || want as usize == got);
        if !compatible {
            return Err(GraphError::ShapeMismatch {
                node: node.name.clone(),
                expected: dims.to_vec(),
                actual: actual.to_vec(),
            });
        }
    }
    Ok(())
}

struct Execution<'a> {
    graph: &'a GraphDef,
    index: &'a HashMap<String, usize>,
    variables: &'a mut HashMap<String, Tensor>,
    fed: HashMap<(String, usize), Tensor>,
    cache: HashMap<String, Vec<Tensor>>,
    visiting: HashSet<String>,
}

impl<'a> Execution<'a> {
    fn node(&self, name: &str) -> Result<&'a NodeDef> {
        let graph = self.graph;
        self.index
            .get(name)
            .map(|&i| &graph.nodes[i])
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))
    }

    fn eval_tensor(&mut self, r: InputRef<'_>) -> Result<Tensor> {
        if let Some(t) = self.fed.get(&(r.node.to_string(), r.index)) {
            return Ok(t.clone());
        }
        self.eval_node(r.node)?;
        self.cache
            .get(r.node)
            .and_then(|outputs| outputs.get(r.index))
            .cloned()
            .ok_or_else(|| {
                GraphError::InvalidArgument(format!(
                    "node '{}' has no output {}",
                    r.node, r.index
                ))
            })
    }

    fn eval_node(&mut self, name: &str) -> Result<()> {
        if self.cache.contains_key(name) {
            return Ok(());
        }
        if !self.visiting.insert(name.to_string()) {
            return Err(GraphError::Cycle(name.to_string()));
        }
        let node = self.node(name)?;

        for input in &node.input {
            let r = InputRef::parse(input);
            if r.control {
                self.eval_node(r.node)?;
            }
        }

        trace!(node = %node.name, op = %node.op, "evaluating");
        let outputs = self.compute(node)?;
        self.visiting.remove(name);
        self.cache.insert(name.to_string(), outputs);
        Ok(())
    }

    fn data_inputs(&mut self, node: &NodeDef) -> Result<Vec<Tensor>> {
        node.data_inputs().map(|r| self.eval_tensor(r)).collect()
    }

    fn compute(&mut self, node: &'a NodeDef) -> Result<Vec<Tensor>> {
        match node.op.as_str() {
            "Placeholder" => Err(GraphError::FailedPrecondition(format!(
                "You must feed a value for placeholder tensor '{}'",
                node.name
            ))),
            "PlaceholderWithDefault" => self.data_inputs(node),
            op if is_variable_op(op) => match self.variables.get(&node.name) {
                Some(value) => Ok(vec![value.clone()]),
                None => Err(GraphError::FailedPrecondition(format!(
                    "Attempting to use uninitialized value {}",
                    node.name
                ))),
            },
            "Assign" => self.assign(node),
            "NoOp" => Ok(Vec::new()),
            "SaveV2" => self.save(node),
            "RestoreV2" => self.restore(node),
            op if ops::is_pure(op) => {
                let inputs = self.data_inputs(node)?;
                Ok(vec![ops::compute(node, &inputs)?])
            }
            op => Err(GraphError::Unimplemented {
                node: node.name.clone(),
                op: op.to_string(),
            }),
        }
    }

    fn assign(&mut self, node: &NodeDef) -> Result<Vec<Tensor>> {
        let mut refs = node.data_inputs();
        let (var_ref, value_ref) = match (refs.next(), refs.next()) {
            (Some(v), Some(x)) => (v, x),
            _ => {
                return Err(GraphError::InvalidArgument(format!(
                    "Assign '{}' needs a variable and a value",
                    node.name
                )))
            }
        };
        let var = self.node(var_ref.node)?;
        if !is_variable_op(&var.op) {
            return Err(GraphError::InvalidArgument(format!(
                "Assign '{}' targets '{}', which is not a variable",
                node.name, var.name
            )));
        }

        let value = self.eval_tensor(value_ref)?;
        if let Some(expected) = var.get_type("dtype") {
            if expected != value.dtype() {
                return Err(GraphError::TypeMismatch {
                    node: node.name.clone(),
                    expected,
                    actual: value.dtype(),
                });
            }
        }
        let validate_shape = !matches!(node.attr.get("validate_shape"), Some(AttrValue::B(false)));
        if validate_shape {
            if let Some(dims) = var.get_shape("shape") {
                let fits = dims.len() == value.shape().len()
                    && dims
                        .iter()
                        .zip(value.shape())
                        .all(|(&want, &got)| want < 0 || want as usize == got);
                if !fits {
                    return Err(GraphError::ShapeMismatch {
                        node: node.name.clone(),
                        expected: dims.to_vec(),
                        actual: value.shape().to_vec(),
                    });
                }
            }
        }

        self.variables.insert(var.name.clone(), value.clone());
        Ok(vec![value])
    }

    fn checkpoint_args(&mut self, node: &NodeDef) -> Result<(String, Vec<String>)> {
        let mut refs = node.data_inputs();
        let (file_ref, names_ref) = match (refs.next(), refs.next()) {
            (Some(f), Some(n)) => (f, n),
            _ => {
                return Err(GraphError::InvalidArgument(format!(
                    "'{}' needs a filename and tensor names",
                    node.name
                )))
            }
        };
        let filename = self.eval_tensor(file_ref)?;
        let filename = filename
            .as_scalar_string()
            .ok_or_else(|| {
                GraphError::InvalidArgument(format!("'{}' filename must be a string scalar", node.name))
            })?
            .to_string();
        let names = self.eval_tensor(names_ref)?;
        let names = names
            .as_strings()
            .ok_or_else(|| {
                GraphError::InvalidArgument(format!("'{}' tensor names must be strings", node.name))
            })?
            .iter()
            .cloned()
            .collect();
        Ok((filename, names))
    }

    fn save(&mut self, node: &NodeDef) -> Result<Vec<Tensor>> {
        let (filename, names) = self.checkpoint_args(node)?;
        let values: Vec<Tensor> = node
            .data_inputs()
            .skip(2)
            .map(|r| self.eval_tensor(r))
            .collect::<Result<_>>()?;
        if values.len() != names.len() {
            return Err(GraphError::InvalidArgument(format!(
                "'{}' got {} tensor names but {} tensors",
                node.name,
                names.len(),
                values.len()
            )));
        }
        let store = CheckpointStore::create(&filename)?;
        let pairs: Vec<(&str, &Tensor)> = names.iter().map(String::as_str).zip(values.iter()).collect();
        store.write_snapshot(&pairs)?;
        Ok(Vec::new())
    }

    fn restore(&mut self, node: &NodeDef) -> Result<Vec<Tensor>> {
        let (filename, names) = self.checkpoint_args(node)?;
        let store = CheckpointStore::open(&filename)?;
        let dtypes = match node.attr.get("dtypes") {
            Some(AttrValue::TypeList(ts)) => Some(ts),
            _ => None,
        };
        let mut out = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let tensor = store.load_tensor(name)?;
            if let Some(expected) = dtypes.and_then(|ts| ts.get(i)) {
                if *expected != tensor.dtype() {
                    return Err(GraphError::TypeMismatch {
                        node: node.name.clone(),
                        expected: *expected,
                        actual: tensor.dtype(),
                    });
                }
            }
            out.push(tensor);
        }
        Ok(out)
    }
}
