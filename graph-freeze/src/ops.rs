//! Kernels for the stateless ops. The session uses them at run time and the
//! optimizer uses them to fold constant subgraphs.

use ndarray::{ArrayD, IxDyn, Zip};

use crate::error::{GraphError, Result};
use crate::graph::NodeDef;
use crate::tensor::{broadcast_shape, Tensor};

/// Ops whose single output depends only on their data inputs.
pub fn is_pure(op: &str) -> bool {
    matches!(
        op,
        "Const" | "Identity" | "StopGradient" | "CheckNumerics" | "Add" | "AddV2" | "Sub" | "Mul"
    )
}

/// Ops that only forward their input during inference.
pub fn is_training_only(op: &str) -> bool {
    matches!(op, "Identity" | "CheckNumerics" | "StopGradient")
}

/// Evaluates a pure op on already computed inputs.
pub fn compute(node: &NodeDef, inputs: &[Tensor]) -> Result<Tensor> {
    match node.op.as_str() {
        "Const" => node.get_tensor("value").cloned().ok_or_else(|| {
            GraphError::InvalidArgument(format!("Const node '{}' has no value", node.name))
        }),
        "Identity" | "StopGradient" => unary(node, inputs).cloned(),
        "CheckNumerics" => {
            let x = unary(node, inputs)?;
            if let Some(values) = x.as_f32() {
                if values.iter().any(|v| !v.is_finite()) {
                    let message = node.get_str("message").unwrap_or("");
                    return Err(GraphError::InvalidArgument(format!(
                        "{} : Tensor had NaN or Inf values",
                        message
                    )));
                }
            }
            Ok(x.clone())
        }
        "Add" | "AddV2" => arith(node, inputs, Arith::Add),
        "Sub" => arith(node, inputs, Arith::Sub),
        "Mul" => arith(node, inputs, Arith::Mul),
        other => Err(GraphError::Unimplemented {
            node: node.name.clone(),
            op: other.to_string(),
        }),
    }
}

fn unary<'a>(node: &NodeDef, inputs: &'a [Tensor]) -> Result<&'a Tensor> {
    match inputs {
        [x] => Ok(x),
        _ => Err(GraphError::InvalidArgument(format!(
            "'{}' ({}) expects 1 input, got {}",
            node.name,
            node.op,
            inputs.len()
        ))),
    }
}

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
}

trait Wrapping: Copy {
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
}

macro_rules! impl_wrapping {
    ($($t:ty),*) => {$(
        impl Wrapping for $t {
            fn add(self, rhs: Self) -> Self { self.wrapping_add(rhs) }
            fn sub(self, rhs: Self) -> Self { self.wrapping_sub(rhs) }
            fn mul(self, rhs: Self) -> Self { self.wrapping_mul(rhs) }
        }
    )*};
}

impl_wrapping!(i32, i64);

fn int_apply<T: Wrapping>(kind: Arith, a: T, b: T) -> T {
    match kind {
        Arith::Add => a.add(b),
        Arith::Sub => a.sub(b),
        Arith::Mul => a.mul(b),
    }
}

fn arith(node: &NodeDef, inputs: &[Tensor], kind: Arith) -> Result<Tensor> {
    let (a, b) = match inputs {
        [a, b] => (a, b),
        _ => {
            return Err(GraphError::InvalidArgument(format!(
                "'{}' ({}) expects 2 inputs, got {}",
                node.name,
                node.op,
                inputs.len()
            )))
        }
    };
    if let Some(expected) = node.get_type("T") {
        for t in [a, b] {
            if t.dtype() != expected {
                return Err(GraphError::TypeMismatch {
                    node: node.name.clone(),
                    expected,
                    actual: t.dtype(),
                });
            }
        }
    }

    match (a, b) {
        (Tensor::Int32(x), Tensor::Int32(y)) => {
            Ok(Tensor::Int32(broadcast_with(node, x, y, |p: i32, q: i32| int_apply(kind, p, q))?))
        }
        (Tensor::Int64(x), Tensor::Int64(y)) => {
            Ok(Tensor::Int64(broadcast_with(node, x, y, |p: i64, q: i64| int_apply(kind, p, q))?))
        }
        (Tensor::Float32(x), Tensor::Float32(y)) => Ok(Tensor::Float32(broadcast_with(
            node,
            x,
            y,
            |p: f32, q: f32| match kind {
                Arith::Add => p + q,
                Arith::Sub => p - q,
                Arith::Mul => p * q,
            },
        )?)),
        _ if a.dtype() != b.dtype() => Err(GraphError::TypeMismatch {
            node: node.name.clone(),
            expected: a.dtype(),
            actual: b.dtype(),
        }),
        _ => Err(GraphError::InvalidArgument(format!(
            "'{}' ({}) does not support {} tensors",
            node.name,
            node.op,
            a.dtype()
        ))),
    }
}

fn broadcast_with<T, F>(node: &NodeDef, a: &ArrayD<T>, b: &ArrayD<T>, f: F) -> Result<ArrayD<T>>
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    let incompatible = || {
        GraphError::InvalidArgument(format!(
            "Incompatible shapes for '{}': {:?} vs. {:?}",
            node.name,
            a.shape(),
            b.shape()
        ))
    };
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(incompatible)?;
    let av = a.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
    let bv = b.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
    Ok(Zip::from(av).and(bv).map_collect(|&x, &y| f(x, y)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttrValue;
    use crate::tensor::DataType;
    use ndarray::array;

    fn add_node() -> NodeDef {
        NodeDef::new("output", "Add").attr("T", AttrValue::Type(DataType::Int32))
    }

    #[test]
    fn test_add_matrices() {
        let out = compute(
            &add_node(),
            &[array![[1, 2], [3, 4]].into(), array![[1, 1], [1, 1]].into()],
        )
        .unwrap();
        assert_eq!(out, Tensor::from(array![[2, 3], [4, 5]]));
    }

    #[test]
    fn test_add_broadcasts_row() {
        let row = Tensor::Int32(array![10, 20].into_dyn());
        let out = compute(&add_node(), &[array![[1, 2], [3, 4]].into(), row]).unwrap();
        assert_eq!(out, Tensor::from(array![[11, 22], [13, 24]]));
    }

    #[test]
    fn test_add_wraps_on_overflow() {
        let a = Tensor::Int32(array![i32::MAX].into_dyn());
        let b = Tensor::Int32(array![1].into_dyn());
        let out = compute(&add_node(), &[a, b]).unwrap();
        assert_eq!(out, Tensor::Int32(array![i32::MIN].into_dyn()));
    }

    #[test]
    fn test_add_type_mismatch() {
        let f = Tensor::from(array![[1.0f32, 2.0], [3.0, 4.0]]);
        let err = compute(&add_node(), &[array![[1, 2], [3, 4]].into(), f]).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
    }

    #[test]
    fn test_incompatible_shapes() {
        let a = Tensor::Int32(array![1, 2, 3].into_dyn());
        let err = compute(&add_node(), &[array![[1, 2], [3, 4]].into(), a]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn test_sub_matrices_and_wraparound() {
        let node = NodeDef::new("diff", "Sub").attr("T", AttrValue::Type(DataType::Int32));
        let out = compute(
            &node,
            &[array![[5, 6], [7, 8]].into(), array![[1, 2], [3, 4]].into()],
        )
        .unwrap();
        assert_eq!(out, Tensor::from(array![[4, 4], [4, 4]]));

        let low = Tensor::Int32(array![i32::MIN, 0].into_dyn());
        let one = Tensor::Int32(array![1].into_dyn());
        let out = compute(&node, &[low, one]).unwrap();
        assert_eq!(out, Tensor::Int32(array![i32::MAX, -1].into_dyn()));
    }

    #[test]
    fn test_sub_floats() {
        let node = NodeDef::new("diff", "Sub");
        let a = Tensor::Float32(array![1.5f32, 2.0].into_dyn());
        let b = Tensor::Float32(array![0.5f32, 3.0].into_dyn());
        assert_eq!(
            compute(&node, &[a, b]).unwrap(),
            Tensor::Float32(array![1.0f32, -1.0].into_dyn())
        );
    }

    #[test]
    fn test_check_numerics_rejects_nan() {
        let node = NodeDef::new("check", "CheckNumerics").attr("message", AttrValue::S("bias".into()));
        let bad = Tensor::Float32(array![1.0f32, f32::NAN].into_dyn());
        assert!(compute(&node, &[bad]).is_err());
    }

    #[test]
    fn test_unknown_op() {
        let node = NodeDef::new("m", "MatMul");
        assert!(matches!(
            compute(&node, &[]).unwrap_err(),
            GraphError::Unimplemented { .. }
        ));
    }
}
