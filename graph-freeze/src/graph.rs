//! Graph definitions: named operation nodes wired together by input references.
//!
//! A node input is written `name` (first output of `name`), `name:k` (the
//! k-th output) or `^name` (a control dependency that carries no data).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::tensor::{DataType, Tensor};

/// Value of a node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Type(DataType),
    TypeList(Vec<DataType>),
    /// Static dimensions, `-1` for unknown.
    Shape(Vec<i64>),
    Tensor(Tensor),
    S(String),
    I(i64),
    B(bool),
}

/// A single operation in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attr: BTreeMap<String, AttrValue>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            input: Vec::new(),
            device: String::new(),
            attr: BTreeMap::new(),
        }
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input.push(input.into());
        self
    }

    pub fn control_input(mut self, node: &str) -> Self {
        self.input.push(format!("^{}", node));
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attr.insert(key.into(), value);
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn get_type(&self, key: &str) -> Option<DataType> {
        match self.attr.get(key) {
            Some(AttrValue::Type(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn get_shape(&self, key: &str) -> Option<&[i64]> {
        match self.attr.get(key) {
            Some(AttrValue::Shape(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_tensor(&self, key: &str) -> Option<&Tensor> {
        match self.attr.get(key) {
            Some(AttrValue::Tensor(t)) => Some(t),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.attr.get(key) {
            Some(AttrValue::S(s)) => Some(s),
            _ => None,
        }
    }

    /// Data inputs only, in order.
    pub fn data_inputs(&self) -> impl Iterator<Item = InputRef<'_>> {
        self.input
            .iter()
            .map(|i| InputRef::parse(i))
            .filter(|r| !r.control)
    }

    pub fn has_control_inputs(&self) -> bool {
        self.input.iter().any(|i| i.starts_with('^'))
    }
}

/// A parsed node input reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRef<'a> {
    pub node: &'a str,
    pub index: usize,
    pub control: bool,
}

impl<'a> InputRef<'a> {
    pub fn parse(input: &'a str) -> Self {
        if let Some(node) = input.strip_prefix('^') {
            return Self { node, index: 0, control: true };
        }
        match input.rsplit_once(':') {
            Some((node, idx)) => match idx.parse::<usize>() {
                Ok(index) => Self { node, index, control: false },
                Err(_) => Self { node: input, index: 0, control: false },
            },
            None => Self { node: input, index: 0, control: false },
        }
    }
}

/// Strips `^` and `:k` decorations from an input reference.
pub fn node_name_from_input(input: &str) -> &str {
    InputRef::parse(input).node
}

/// An ordered collection of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(rename = "node", default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default = "default_version")]
    pub version: u32,
}

impl Default for GraphDef {
    fn default() -> Self {
        Self::new()
    }
}

fn default_version() -> u32 {
    GraphDef::VERSION
}

impl GraphDef {
    pub const VERSION: u32 = 1;

    pub fn new() -> Self {
        Self { nodes: Vec::new(), version: Self::VERSION }
    }

    /// Appends a node, rejecting duplicate names.
    pub fn add_node(&mut self, node: NodeDef) -> Result<()> {
        if self.contains(&node.name) {
            return Err(GraphError::DuplicateNode(node.name));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut NodeDef> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes whose op is a variable.
    pub fn variables(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.iter().filter(|n| is_variable_op(&n.op))
    }

    /// Checks name uniqueness and that every input names an existing node.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }
        for node in &self.nodes {
            for input in &node.input {
                let target = node_name_from_input(input);
                if !seen.contains(target) {
                    return Err(GraphError::MissingInput {
                        node: node.name.clone(),
                        input: target.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Removes device placements from every node.
    pub fn clear_devices(&mut self) {
        for node in &mut self.nodes {
            node.device.clear();
        }
    }

    /// Keeps only the nodes needed to compute `dest_nodes`, preserving order.
    ///
    /// Fails if any destination is absent.
    pub fn extract_sub_graph<S: AsRef<str>>(&self, dest_nodes: &[S]) -> Result<GraphDef> {
        let index: HashMap<&str, &NodeDef> =
            self.nodes.iter().map(|n| (n.name.as_str(), n)).collect();

        let mut keep: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for dest in dest_nodes {
            let dest = dest.as_ref();
            if !index.contains_key(dest) {
                return Err(GraphError::NodeNotFound(dest.to_string()));
            }
            if keep.insert(dest) {
                queue.push_back(dest);
            }
        }

        while let Some(name) = queue.pop_front() {
            let node = index[name];
            for input in &node.input {
                let target = node_name_from_input(input);
                if !index.contains_key(target) {
                    return Err(GraphError::MissingInput {
                        node: node.name.clone(),
                        input: target.to_string(),
                    });
                }
                if keep.insert(target) {
                    queue.push_back(target);
                }
            }
        }

        let nodes = self
            .nodes
            .iter()
            .filter(|n| keep.contains(n.name.as_str()))
            .cloned()
            .collect();
        Ok(GraphDef { nodes, version: self.version })
    }

    /// Node names in an order where every node follows all of its inputs.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        let mut pending: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            let mut deps: HashSet<&str> = HashSet::new();
            for input in &node.input {
                let target = node_name_from_input(input);
                if self.node(target).is_none() {
                    return Err(GraphError::MissingInput {
                        node: node.name.clone(),
                        input: target.to_string(),
                    });
                }
                deps.insert(target);
            }
            pending.insert(node.name.as_str(), deps.len());
            for dep in deps {
                consumers.entry(dep).or_default().push(node.name.as_str());
            }
        }

        let mut ready: VecDeque<&str> = self
            .nodes
            .iter()
            .map(|n| n.name.as_str())
            .filter(|n| pending[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(name) = ready.pop_front() {
            order.push(name);
            if let Some(users) = consumers.get(name) {
                for &user in users {
                    if let Some(count) = pending.get_mut(user) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(user);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .find(|n| pending[n.name.as_str()] > 0)
                .map(|n| n.name.clone())
                .unwrap_or_default();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }
}

pub fn is_variable_op(op: &str) -> bool {
    matches!(op, "Variable" | "VariableV2")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> GraphDef {
        let mut g = GraphDef::new();
        g.add_node(NodeDef::new("a", "Placeholder")).unwrap();
        g.add_node(NodeDef::new("b", "Identity").input("a")).unwrap();
        g.add_node(NodeDef::new("c", "Identity").input("b:0")).unwrap();
        g.add_node(NodeDef::new("unused", "NoOp").control_input("a")).unwrap();
        g
    }

    #[test]
    fn test_parse_input_refs() {
        assert_eq!(InputRef::parse("x"), InputRef { node: "x", index: 0, control: false });
        assert_eq!(InputRef::parse("save/RestoreV2:1").index, 1);
        assert_eq!(InputRef::parse("save/RestoreV2:1").node, "save/RestoreV2");
        assert!(InputRef::parse("^init").control);
        assert_eq!(node_name_from_input("^init"), "init");
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut g = chain();
        let err = g.add_node(NodeDef::new("a", "Const")).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(_)));
    }

    #[test]
    fn test_validate_reports_dangling_input() {
        let mut g = chain();
        g.nodes.push(NodeDef::new("d", "Identity").input("ghost"));
        match g.validate().unwrap_err() {
            GraphError::MissingInput { node, input } => {
                assert_eq!(node, "d");
                assert_eq!(input, "ghost");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_extract_sub_graph_prunes_unreachable() {
        let sub = chain().extract_sub_graph(&["c"]).unwrap();
        let names: Vec<_> = sub.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_extract_sub_graph_missing_destination() {
        let err = chain().extract_sub_graph(&["output"]).unwrap_err();
        assert!(matches!(err, GraphError::NodeNotFound(ref n) if n == "output"));
    }

    #[test]
    fn test_topological_order_and_cycle() {
        let mut g = GraphDef::new();
        g.nodes.push(NodeDef::new("z", "Identity").input("y"));
        g.nodes.push(NodeDef::new("y", "Const"));
        assert_eq!(g.topological_order().unwrap(), vec!["y", "z"]);

        g.node_mut("y").unwrap().input.push("z".into());
        assert!(matches!(g.topological_order().unwrap_err(), GraphError::Cycle(_)));
    }

    #[test]
    fn test_clear_devices() {
        let mut g = GraphDef::new();
        g.add_node(NodeDef::new("a", "Const").device("/device:GPU:0")).unwrap();
        g.clear_devices();
        assert!(g.node("a").unwrap().device.is_empty());
    }
}
