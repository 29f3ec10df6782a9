//! Typed n-dimensional tensors backed by `ndarray`.

use std::fmt;

use bytemuck::{cast_slice, pod_read_unaligned};
use ndarray::{Array2, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Element type of a tensor.
///
/// The numeric tags returned by [`DataType::as_datatype_enum`] are the ones
/// used in serialized graphs and accepted by the inference optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Int32,
    String,
    Int64,
}

impl DataType {
    pub fn as_datatype_enum(self) -> u32 {
        match self {
            DataType::Float32 => 1,
            DataType::Int32 => 3,
            DataType::String => 7,
            DataType::Int64 => 9,
        }
    }

    pub fn from_datatype_enum(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(DataType::Float32),
            3 => Ok(DataType::Int32),
            7 => Ok(DataType::String),
            9 => Ok(DataType::Int64),
            other => Err(GraphError::InvalidArgument(format!(
                "unknown data type enum {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float32 => "float32",
            DataType::Int32 => "int32",
            DataType::String => "string",
            DataType::Int64 => "int64",
        };
        f.write_str(name)
    }
}

/// A dense tensor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "TensorProto", try_from = "TensorProto")]
pub enum Tensor {
    Float32(ArrayD<f32>),
    Int32(ArrayD<i32>),
    String(ArrayD<String>),
    Int64(ArrayD<i64>),
}

impl Tensor {
    /// A rank-0 string tensor, used for checkpoint file names.
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Tensor::String(ArrayD::from_elem(IxDyn(&[]), value.into()))
    }

    /// A rank-1 string tensor.
    pub fn string_list<S: AsRef<str>>(values: &[S]) -> Self {
        let items: Vec<String> = values.iter().map(|s| s.as_ref().to_string()).collect();
        Tensor::String(ndarray::Array1::from(items).into_dyn())
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Tensor::Float32(_) => DataType::Float32,
            Tensor::Int32(_) => DataType::Int32,
            Tensor::String(_) => DataType::String,
            Tensor::Int64(_) => DataType::Int64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::Float32(a) => a.shape(),
            Tensor::Int32(a) => a.shape(),
            Tensor::String(a) => a.shape(),
            Tensor::Int64(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_i32(&self) -> Option<&ArrayD<i32>> {
        match self {
            Tensor::Int32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Tensor::Float32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&ArrayD<String>> {
        match self {
            Tensor::String(a) => Some(a),
            _ => None,
        }
    }

    /// Returns the single string held by a scalar (or one-element) string tensor.
    pub fn as_scalar_string(&self) -> Option<&str> {
        match self {
            Tensor::String(a) if a.len() == 1 => a.iter().next().map(String::as_str),
            _ => None,
        }
    }

    /// Raw element bytes: little-endian numbers, or u32-length-prefixed UTF-8
    /// strings. Shape and dtype are stored separately.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Tensor::Float32(a) => numeric_bytes(a),
            Tensor::Int32(a) => numeric_bytes(a),
            Tensor::Int64(a) => numeric_bytes(a),
            Tensor::String(a) => {
                let mut out = Vec::new();
                for s in a.iter() {
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                out
            }
        }
    }

    /// Inverse of [`Tensor::to_bytes`].
    pub fn from_bytes(dtype: DataType, shape: &[usize], bytes: &[u8]) -> Result<Self> {
        let count = element_count(shape)?;
        let dim = IxDyn(shape);
        let tensor = match dtype {
            DataType::Float32 => Tensor::Float32(read_numeric(dim, count, bytes)?),
            DataType::Int32 => Tensor::Int32(read_numeric(dim, count, bytes)?),
            DataType::Int64 => Tensor::Int64(read_numeric(dim, count, bytes)?),
            DataType::String => {
                // each string takes at least its 4-byte length prefix
                if count > bytes.len() / 4 {
                    return Err(GraphError::Decode(format!(
                        "{} strings cannot fit in {} bytes",
                        count,
                        bytes.len()
                    )));
                }
                let mut items = Vec::with_capacity(count);
                let mut offset = 0;
                for _ in 0..count {
                    let len_bytes = bytes
                        .get(offset..offset + 4)
                        .ok_or_else(|| GraphError::Decode("truncated string length".into()))?;
                    let len = pod_read_unaligned::<u32>(len_bytes) as usize;
                    offset += 4;
                    let raw = offset
                        .checked_add(len)
                        .and_then(|end| bytes.get(offset..end))
                        .ok_or_else(|| GraphError::Decode("truncated string data".into()))?;
                    offset += len;
                    let s = std::str::from_utf8(raw)
                        .map_err(|e| GraphError::Decode(format!("invalid UTF-8 string: {}", e)))?;
                    items.push(s.to_string());
                }
                if offset != bytes.len() {
                    return Err(GraphError::Decode("trailing bytes after string tensor".into()));
                }
                Tensor::String(
                    ArrayD::from_shape_vec(dim, items)
                        .map_err(|e| GraphError::Decode(e.to_string()))?,
                )
            }
        };
        Ok(tensor)
    }
}

fn numeric_bytes<T: bytemuck::Pod>(a: &ArrayD<T>) -> Vec<u8> {
    let values: Vec<T> = a.iter().copied().collect();
    cast_slice(&values).to_vec()
}

/// Number of elements in `shape`, or a decode error if it overflows.
fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| GraphError::Decode(format!("tensor shape {:?} is too large", shape)))
}

fn read_numeric<T: bytemuck::Pod>(dim: IxDyn, count: usize, bytes: &[u8]) -> Result<ArrayD<T>> {
    let width = std::mem::size_of::<T>();
    let expected = count.checked_mul(width).ok_or_else(|| {
        GraphError::Decode(format!("{} elements of {} bytes overflow", count, width))
    })?;
    if bytes.len() != expected {
        return Err(GraphError::Decode(format!(
            "expected {} bytes of tensor data, found {}",
            expected,
            bytes.len()
        )));
    }
    let values: Vec<T> = bytes.chunks_exact(width).map(pod_read_unaligned::<T>).collect();
    ArrayD::from_shape_vec(dim, values).map_err(|e| GraphError::Decode(e.to_string()))
}

impl From<ArrayD<i32>> for Tensor {
    fn from(a: ArrayD<i32>) -> Self {
        Tensor::Int32(a)
    }
}

impl From<Array2<i32>> for Tensor {
    fn from(a: Array2<i32>) -> Self {
        Tensor::Int32(a.into_dyn())
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(a: ArrayD<f32>) -> Self {
        Tensor::Float32(a)
    }
}

impl From<Array2<f32>> for Tensor {
    fn from(a: Array2<f32>) -> Self {
        Tensor::Float32(a.into_dyn())
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(a: ArrayD<i64>) -> Self {
        Tensor::Int64(a)
    }
}

/// Serialized form of a [`Tensor`] in text graph definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorProto {
    pub dtype: DataType,
    #[serde(default)]
    pub tensor_shape: Vec<usize>,
    #[serde(default, with = "float_values", skip_serializing_if = "Vec::is_empty")]
    pub float_val: Vec<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub int_val: Vec<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub string_val: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub int64_val: Vec<i64>,
}

/// JSON has no literal for non-finite numbers, so those are written as the
/// strings `"nan"`, `"inf"` and `"-inf"`.
mod float_values {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f32),
        Text(String),
    }

    pub fn serialize<S: Serializer>(values: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|&v| {
            if v.is_finite() {
                Repr::Number(v)
            } else if v.is_nan() {
                Repr::Text("nan".to_string())
            } else if v > 0.0 {
                Repr::Text("inf".to_string())
            } else {
                Repr::Text("-inf".to_string())
            }
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        Vec::<Repr>::deserialize(deserializer)?
            .into_iter()
            .map(|r| match r {
                Repr::Number(v) => Ok(v),
                Repr::Text(t) => match t.as_str() {
                    "nan" => Ok(f32::NAN),
                    "inf" => Ok(f32::INFINITY),
                    "-inf" => Ok(f32::NEG_INFINITY),
                    other => Err(de::Error::custom(format!("invalid float value '{}'", other))),
                },
            })
            .collect()
    }
}

impl From<Tensor> for TensorProto {
    fn from(t: Tensor) -> Self {
        let mut proto = TensorProto {
            dtype: t.dtype(),
            tensor_shape: t.shape().to_vec(),
            float_val: Vec::new(),
            int_val: Vec::new(),
            string_val: Vec::new(),
            int64_val: Vec::new(),
        };
        match t {
            Tensor::Float32(a) => proto.float_val = a.iter().copied().collect(),
            Tensor::Int32(a) => proto.int_val = a.iter().copied().collect(),
            Tensor::String(a) => proto.string_val = a.iter().cloned().collect(),
            Tensor::Int64(a) => proto.int64_val = a.iter().copied().collect(),
        }
        proto
    }
}

impl TryFrom<TensorProto> for Tensor {
    type Error = GraphError;

    fn try_from(p: TensorProto) -> Result<Self> {
        let dim = IxDyn(&p.tensor_shape);
        let shape_err = |e: ndarray::ShapeError| {
            GraphError::Decode(format!(
                "tensor values do not fit shape {:?}: {}",
                p.tensor_shape, e
            ))
        };
        let tensor = match p.dtype {
            DataType::Float32 => {
                Tensor::Float32(ArrayD::from_shape_vec(dim, p.float_val.clone()).map_err(shape_err)?)
            }
            DataType::Int32 => {
                Tensor::Int32(ArrayD::from_shape_vec(dim, p.int_val.clone()).map_err(shape_err)?)
            }
            DataType::String => Tensor::String(
                ArrayD::from_shape_vec(dim, p.string_val.clone()).map_err(shape_err)?,
            ),
            DataType::Int64 => {
                Tensor::Int64(ArrayD::from_shape_vec(dim, p.int64_val.clone()).map_err(shape_err)?)
            }
        };
        Ok(tensor)
    }
}

/// Broadcast two shapes against each other, numpy style.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}
