//! Tensor handles and raw tensor data
//!
//! A [`TensorHandle`] is a lightweight, freely clonable reference: identity,
//! shape and element type. The element data itself lives in exactly one
//! backend storage pool, and liveness is owned by the engine's tensor arena
//! rather than by the handle.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    I32,
    Bool,
    Str,
}

impl DType {
    /// Bytes per element. String elements are counted when written.
    pub fn bytes_per_element(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::Bool => 1,
            DType::Str => 0,
        }
    }
}

/// Identity-bearing reference to a tensor
///
/// Handles are cheap to clone and never carry data. Whether the id is still
/// live is decided by the engine arena; operations on a disposed id fail with
/// [`Error::DisposedTensor`].
#[derive(Debug, Clone, PartialEq)]
pub struct TensorHandle {
    id: u64,
    shape: Vec<usize>,
    dtype: DType,
}

impl TensorHandle {
    pub(crate) fn new(id: u64, shape: Vec<usize>, dtype: DType) -> Self {
        Self { id, shape, dtype }
    }

    /// Process-unique, monotonically increasing id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Dimension sizes
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Raw element data, as stored and returned by backends
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
    Bool(ArrayD<bool>),
    /// Flat string payload; the shape is tracked by the handle
    Str(Vec<String>),
}

impl TensorData {
    /// Build an f32 tensor from a flat vector and shape
    pub fn from_f32(values: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let got = values.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![got],
            }
        })?;
        Ok(TensorData::F32(array))
    }

    /// Zero-initialized data of the given format
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(ArrayD::zeros(IxDyn(shape))),
            DType::I32 => TensorData::I32(ArrayD::zeros(IxDyn(shape))),
            DType::Bool => TensorData::Bool(ArrayD::from_elem(IxDyn(shape), false)),
            DType::Str => {
                let len = shape.iter().product();
                TensorData::Str(vec![String::new(); len])
            }
        }
    }

    /// One-initialized f32 data
    pub fn ones(shape: &[usize]) -> Self {
        TensorData::F32(ArrayD::from_elem(IxDyn(shape), 1.0))
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::Bool(_) => DType::Bool,
            TensorData::Str(_) => DType::Str,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            TensorData::F32(a) => a.shape().to_vec(),
            TensorData::I32(a) => a.shape().to_vec(),
            TensorData::Bool(a) => a.shape().to_vec(),
            TensorData::Str(v) => vec![v.len()],
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(a) => a.len(),
            TensorData::I32(a) => a.len(),
            TensorData::Bool(a) => a.len(),
            TensorData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes occupied by this payload
    pub fn byte_size(&self) -> usize {
        match self {
            TensorData::Str(v) => v.iter().map(|s| s.len()).sum(),
            other => other.len() * other.dtype().bytes_per_element(),
        }
    }

    /// View as f32, or fail with [`Error::InvalidDType`]
    pub fn as_f32(&self) -> Result<&ArrayD<f32>> {
        match self {
            TensorData::F32(a) => Ok(a),
            other => Err(Error::InvalidDType(format!(
                "expected f32 data, got {:?}",
                other.dtype()
            ))),
        }
    }

    /// Elementwise sum of two f32 payloads of identical shape
    ///
    /// This is the accumulation primitive used when several gradient
    /// contributions flow into the same tensor.
    pub fn add(&self, other: &TensorData) -> Result<TensorData> {
        let a = self.as_f32()?;
        let b = other.as_f32()?;
        if a.shape() != b.shape() {
            return Err(Error::ShapeMismatch {
                expected: a.shape().to_vec(),
                got: b.shape().to_vec(),
            });
        }
        Ok(TensorData::F32(a + b))
    }
}
