//! Binary and text serialization of graph definitions.
//!
//! Binary layout (all integers little-endian):
//!
//! ```text
//! magic "TGDF" | version u32 | node_count u32 | node*
//! node   = name str | op str | device str | input_count u32 | str* | attr_count u32 | attr*
//! attr   = key str | tag u8 | payload
//! tensor = dtype u32 | rank u32 | dim u64* | byte_len u64 | bytes
//! str    = len u32 | utf-8 bytes
//! ```
//!
//! The text form is pretty-printed JSON.

use std::fs;
use std::path::{Path, PathBuf};

use bytemuck::pod_read_unaligned;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::graph::{AttrValue, GraphDef, NodeDef};
use crate::tensor::{DataType, Tensor};

const MAGIC: &[u8; 4] = b"TGDF";

const TAG_TYPE: u8 = 0;
const TAG_TYPE_LIST: u8 = 1;
const TAG_SHAPE: u8 = 2;
const TAG_TENSOR: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_INT: u8 = 5;
const TAG_BOOL: u8 = 6;

/// Serializes a graph to its binary form.
pub fn encode_graph(graph: &GraphDef) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    put_u32(&mut out, graph.version);
    put_u32(&mut out, graph.nodes.len() as u32);
    for node in &graph.nodes {
        put_str(&mut out, &node.name);
        put_str(&mut out, &node.op);
        put_str(&mut out, &node.device);
        put_u32(&mut out, node.input.len() as u32);
        for input in &node.input {
            put_str(&mut out, input);
        }
        put_u32(&mut out, node.attr.len() as u32);
        for (key, value) in &node.attr {
            put_str(&mut out, key);
            put_attr(&mut out, value);
        }
    }
    out
}

/// Parses the binary form produced by [`encode_graph`].
pub fn decode_graph(bytes: &[u8]) -> Result<GraphDef> {
    let mut r = ByteReader::new(bytes);
    if r.take(4)? != MAGIC {
        return Err(GraphError::Decode("bad magic, not a binary graph definition".into()));
    }
    let version = r.u32()?;
    if version > GraphDef::VERSION {
        return Err(GraphError::Decode(format!("unsupported graph version {}", version)));
    }
    let count = r.u32()? as usize;
    let mut nodes = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let mut node = NodeDef::new(r.string()?, r.string()?);
        node.device = r.string()?;
        let inputs = r.u32()?;
        for _ in 0..inputs {
            node.input.push(r.string()?);
        }
        let attrs = r.u32()?;
        for _ in 0..attrs {
            let key = r.string()?;
            let value = r.attr()?;
            node.attr.insert(key, value);
        }
        nodes.push(node);
    }
    if !r.is_empty() {
        return Err(GraphError::Decode(format!(
            "{} trailing bytes after last node",
            r.remaining()
        )));
    }
    Ok(GraphDef { nodes, version })
}

/// Serializes a graph to pretty JSON.
pub fn to_text(graph: &GraphDef) -> Result<String> {
    Ok(serde_json::to_string_pretty(graph)?)
}

pub fn from_text(text: &str) -> Result<GraphDef> {
    Ok(serde_json::from_str(text)?)
}

/// Writes `graph` to `dir/name`, creating `dir` if needed.
pub fn write_graph(graph: &GraphDef, dir: impl AsRef<Path>, name: &str, as_text: bool) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    if as_text {
        fs::write(&path, to_text(graph)?)?;
    } else {
        fs::write(&path, encode_graph(graph))?;
    }
    debug!(path = %path.display(), nodes = graph.len(), as_text, "wrote graph");
    Ok(path)
}

/// Reads a graph written by [`write_graph`].
pub fn read_graph(path: impl AsRef<Path>, binary: bool) -> Result<GraphDef> {
    let path = path.as_ref();
    let graph = if binary {
        decode_graph(&fs::read(path)?)?
    } else {
        from_text(&fs::read_to_string(path)?)?
    };
    debug!(path = %path.display(), nodes = graph.len(), "read graph");
    Ok(graph)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn put_tensor(out: &mut Vec<u8>, t: &Tensor) {
    put_u32(out, t.dtype().as_datatype_enum());
    put_u32(out, t.shape().len() as u32);
    for &d in t.shape() {
        put_u64(out, d as u64);
    }
    let data = t.to_bytes();
    put_u64(out, data.len() as u64);
    out.extend_from_slice(&data);
}

fn put_attr(out: &mut Vec<u8>, value: &AttrValue) {
    match value {
        AttrValue::Type(t) => {
            out.push(TAG_TYPE);
            put_u32(out, t.as_datatype_enum());
        }
        AttrValue::TypeList(ts) => {
            out.push(TAG_TYPE_LIST);
            put_u32(out, ts.len() as u32);
            for t in ts {
                put_u32(out, t.as_datatype_enum());
            }
        }
        AttrValue::Shape(dims) => {
            out.push(TAG_SHAPE);
            put_u32(out, dims.len() as u32);
            for &d in dims {
                out.extend_from_slice(&d.to_le_bytes());
            }
        }
        AttrValue::Tensor(t) => {
            out.push(TAG_TENSOR);
            put_tensor(out, t);
        }
        AttrValue::S(s) => {
            out.push(TAG_STRING);
            put_str(out, s);
        }
        AttrValue::I(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        AttrValue::B(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
    }
}

/// Bounds-checked cursor over a byte buffer.
struct ByteReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(GraphError::Decode(format!(
                "unexpected end of data at offset {} (wanted {} bytes, {} left)",
                self.offset,
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(pod_read_unaligned(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(pod_read_unaligned(self.take(8)?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(pod_read_unaligned(self.take(8)?))
    }

    fn len(&mut self) -> Result<usize> {
        usize::try_from(self.u64()?).map_err(|_| GraphError::Decode("length overflows usize".into()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| GraphError::Decode(format!("invalid UTF-8 at offset {}: {}", self.offset, e)))
    }

    fn dtype(&mut self) -> Result<DataType> {
        DataType::from_datatype_enum(self.u32()?).map_err(|e| GraphError::Decode(e.to_string()))
    }

    fn tensor(&mut self) -> Result<Tensor> {
        let dtype = self.dtype()?;
        let rank = self.u32()? as usize;
        let mut shape = Vec::with_capacity(rank.min(16));
        for _ in 0..rank {
            shape.push(self.len()?);
        }
        let byte_len = self.len()?;
        let data = self.take(byte_len)?;
        Tensor::from_bytes(dtype, &shape, data)
    }

    fn attr(&mut self) -> Result<AttrValue> {
        let value = match self.u8()? {
            TAG_TYPE => AttrValue::Type(self.dtype()?),
            TAG_TYPE_LIST => {
                let n = self.u32()?;
                let mut types = Vec::new();
                for _ in 0..n {
                    types.push(self.dtype()?);
                }
                AttrValue::TypeList(types)
            }
            TAG_SHAPE => {
                let n = self.u32()?;
                let mut dims = Vec::new();
                for _ in 0..n {
                    dims.push(self.i64()?);
                }
                AttrValue::Shape(dims)
            }
            TAG_TENSOR => AttrValue::Tensor(self.tensor()?),
            TAG_STRING => AttrValue::S(self.string()?),
            TAG_INT => AttrValue::I(self.i64()?),
            TAG_BOOL => AttrValue::B(self.u8()? != 0),
            tag => return Err(GraphError::Decode(format!("unknown attribute tag {}", tag))),
        };
        Ok(value)
    }
}
