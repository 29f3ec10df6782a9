//! Inference-time graph rewrites applied to a frozen graph.
//!
//! The passes run in a fixed order: strip unused nodes, remove training-only
//! nodes, fold constants, then prune once more.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::graph::{node_name_from_input, AttrValue, GraphDef, InputRef, NodeDef};
use crate::ops::{compute, is_pure, is_training_only};
use crate::tensor::{DataType, Tensor};

/// Rewrite `graph` so only what the outputs need at inference time remains.
///
/// `placeholder_type_enum` is the dtype tag given to every input placeholder.
pub fn optimize_for_inference<S: AsRef<str>>(
    graph: &GraphDef,
    input_node_names: &[S],
    output_node_names: &[S],
    placeholder_type_enum: u32,
) -> Result<GraphDef> {
    graph.validate()?;
    let placeholder_type = DataType::from_datatype_enum(placeholder_type_enum)?;
    let before = graph.len();

    let stripped = strip_unused(graph, input_node_names, output_node_names, placeholder_type)?;

    let mut protected: Vec<&str> = input_node_names.iter().map(AsRef::as_ref).collect();
    protected.extend(output_node_names.iter().map(AsRef::as_ref));
    let trimmed = remove_training_nodes(&stripped, &protected);

    let folded = fold_constants(&trimmed)?;
    let optimized = folded.extract_sub_graph(output_node_names)?;
    optimized.validate()?;

    info!(before, after = optimized.len(), "optimized graph for inference");
    Ok(optimized)
}

/// Replace each input node with a `Placeholder` of `placeholder_type` and drop
/// every node the outputs do not depend on.
pub fn strip_unused<S: AsRef<str>>(
    graph: &GraphDef,
    input_node_names: &[S],
    output_node_names: &[S],
    placeholder_type: DataType,
) -> Result<GraphDef> {
    let mut stripped = graph.clone();
    for name in input_node_names {
        let name = node_name_from_input(name.as_ref());
        let node = stripped
            .node_mut(name)
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))?;

        let shape = node.get_shape("shape").map(<[i64]>::to_vec).or_else(|| {
            node.get_tensor("value")
                .map(|t| t.shape().iter().map(|&d| d as i64).collect())
        });
        let mut placeholder =
            NodeDef::new(name, "Placeholder").attr("dtype", AttrValue::Type(placeholder_type));
        if let Some(shape) = shape {
            placeholder = placeholder.attr("shape", AttrValue::Shape(shape));
        }
        placeholder.device = std::mem::take(&mut node.device);
        *node = placeholder;
        debug!(input = %name, dtype = %placeholder_type, "replaced input with placeholder");
    }
    stripped.extract_sub_graph(output_node_names)
}

/// Splice out `Identity`, `CheckNumerics` and `StopGradient` nodes.
///
/// Nodes named in `protected` or carrying control inputs are kept.
pub fn remove_training_nodes(graph: &GraphDef, protected: &[&str]) -> GraphDef {
    let protected: HashSet<&str> = protected.iter().map(|n| node_name_from_input(n)).collect();

    // removed node name -> the input its consumers read instead
    let mut forward: HashMap<&str, &str> = HashMap::new();
    for node in &graph.nodes {
        if !is_training_only(&node.op)
            || protected.contains(node.name.as_str())
            || node.has_control_inputs()
            || node.input.len() != 1
        {
            continue;
        }
        forward.insert(node.name.as_str(), node.input[0].as_str());
    }
    if forward.is_empty() {
        return graph.clone();
    }

    let resolve = |input: &str| -> String {
        let parsed = InputRef::parse(input);
        let mut target = input.to_string();
        let mut current = parsed.node;
        let mut hops = 0;
        while let Some(next) = forward.get(current) {
            target = (*next).to_string();
            current = node_name_from_input(next);
            hops += 1;
            if hops > forward.len() {
                break;
            }
        }
        if parsed.control {
            format!("^{}", node_name_from_input(&target))
        } else {
            target
        }
    };

    let mut nodes = Vec::with_capacity(graph.len() - forward.len());
    for node in &graph.nodes {
        if forward.contains_key(node.name.as_str()) {
            continue;
        }
        let mut rewritten = node.clone();
        let mut inputs: Vec<String> = Vec::with_capacity(node.input.len());
        for input in &node.input {
            let resolved = resolve(input);
            if resolved.starts_with('^') && inputs.contains(&resolved) {
                continue;
            }
            inputs.push(resolved);
        }
        rewritten.input = inputs;
        nodes.push(rewritten);
    }

    debug!(removed = forward.len(), "removed training-only nodes");
    GraphDef { nodes, version: graph.version }
}

/// Replace pure nodes whose data inputs are all constants with a `Const`
/// holding the computed value.
pub fn fold_constants(graph: &GraphDef) -> Result<GraphDef> {
    let order: Vec<String> = graph
        .topological_order()?
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut folded = graph.clone();
    let mut count = 0usize;
    for name in &order {
        let Some(node) = folded.node(name) else { continue };
        if node.op == "Const" || !is_pure(&node.op) || node.has_control_inputs() {
            continue;
        }

        let mut values: Vec<Tensor> = Vec::new();
        let mut all_const = true;
        for input in node.data_inputs() {
            match folded.node(input.node) {
                Some(src) if src.op == "Const" && input.index == 0 => match src.get_tensor("value") {
                    Some(value) => values.push(value.clone()),
                    None => {
                        all_const = false;
                        break;
                    }
                },
                _ => {
                    all_const = false;
                    break;
                }
            }
        }
        if !all_const || values.is_empty() {
            continue;
        }

        let value = compute(node, &values)?;
        let mut constant = NodeDef::new(name.clone(), "Const")
            .attr("dtype", AttrValue::Type(value.dtype()))
            .attr("value", AttrValue::Tensor(value));
        constant.device = node.device.clone();
        if let Some(slot) = folded.node_mut(name) {
            *slot = constant;
            count += 1;
        }
    }

    if count > 0 {
        debug!(count, "folded constant nodes");
    }
    Ok(folded)
}
