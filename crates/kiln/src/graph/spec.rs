//! Structural tensor metadata shared by the graph model and the key builder.
//!
//! Everything here describes *shape-class* information only: the cache never
//! looks at backing storage, so two tensors with identical descriptors are
//! indistinguishable to every component in this crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Scalar element types understood by the caching layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F16,
    Bf16,
    F32,
    F64,
    Si32,
    Si64,
    Bool,
}

impl DType {
    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }

    /// Storage size in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool => 1,
            DType::F16 | DType::Bf16 => 2,
            DType::F32 | DType::Si32 => 4,
            DType::F64 | DType::Si64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Si32 => "si32",
            DType::Si64 => "si64",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Placement of a tensor. Accelerators are identified by ordinal only; the
/// caching layer never talks to a device directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Accel(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accel(index) => write!(f, "accel:{index}"),
        }
    }
}

/// A symbolic dimension: a stable name plus the concrete value it is bound to
/// in the current call, when one is known.
///
/// The hint is what executors read; the fingerprint of a tensor dimension
/// deliberately ignores it so that two calls differing only in a dynamic size
/// share a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymDim {
    pub symbol: String,
    pub hint: Option<u64>,
}

impl SymDim {
    pub fn new(symbol: impl Into<String>, hint: Option<u64>) -> Self {
        Self {
            symbol: symbol.into(),
            hint,
        }
    }
}

/// One dimension of a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(usize),
    Dynamic(SymDim),
}

impl Dim {
    pub fn dynamic(symbol: impl Into<String>, hint: u64) -> Self {
        Dim::Dynamic(SymDim::new(symbol, Some(hint)))
    }

    /// The concrete extent of this dimension, if one is available.
    pub fn concrete(&self) -> Option<usize> {
        match self {
            Dim::Static(value) => Some(*value),
            Dim::Dynamic(sym) => sym.hint.map(|hint| hint as usize),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dim::Dynamic(_))
    }
}

/// An ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Shape {
    dims: SmallVec<[Dim; 4]>,
}

impl Shape {
    pub fn new(dims: impl IntoIterator<Item = Dim>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    /// All-static shape from plain extents.
    pub fn of(extents: &[usize]) -> Self {
        Self::new(extents.iter().map(|&extent| Dim::Static(extent)))
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_fully_static(&self) -> bool {
        self.dims.iter().all(|dim| !dim.is_dynamic())
    }

    /// Concrete extents for every dimension, using hints for dynamic ones.
    /// `None` when some dynamic dimension has no hint bound.
    pub fn concrete_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(Dim::concrete).collect()
    }

    /// Total element count under the concrete extents.
    pub fn numel(&self) -> Option<usize> {
        self.concrete_dims()
            .map(|dims| dims.iter().product::<usize>())
    }

    /// Row-major strides for the concrete extents.
    pub fn contiguous_strides(&self) -> Option<Vec<usize>> {
        let dims = self.concrete_dims()?;
        let mut strides = vec![1usize; dims.len()];
        for axis in (0..dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * dims[axis + 1];
        }
        Some(strides)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            match dim {
                Dim::Static(value) => write!(f, "{value}")?,
                Dim::Dynamic(sym) => write!(f, "?{}", sym.symbol)?,
            }
        }
        f.write_str("]")
    }
}

/// Physical layout class of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MemoryFormat {
    #[default]
    Contiguous,
    ChannelsLast,
    Preserve,
}

/// Structural descriptor of a tensor argument: everything the key builder is
/// allowed to see, and everything an executor needs to validate a binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub device: Device,
    pub dtype: DType,
    pub shape: Shape,
    /// Element strides under the current hints. Empty when the shape has
    /// unbound dynamic dimensions.
    pub strides: SmallVec<[usize; 4]>,
    pub storage_offset: usize,
    pub requires_grad: bool,
    pub memory_format: MemoryFormat,
}

impl TensorDesc {
    /// A contiguous descriptor with default layout flags.
    pub fn contiguous(device: Device, dtype: DType, shape: Shape) -> Self {
        let strides = shape
            .contiguous_strides()
            .map(SmallVec::from_vec)
            .unwrap_or_default();
        Self {
            device,
            dtype,
            shape,
            strides,
            storage_offset: 0,
            requires_grad: false,
            memory_format: MemoryFormat::Contiguous,
        }
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", self.dtype, self.shape, self.device)
    }
}

/// A constant scalar bound into the graph or passed as an input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Int(value) => write!(f, "{value}"),
            ScalarValue::Float(value) => write!(f, "{value}"),
            ScalarValue::Bool(value) => write!(f, "{value}"),
            ScalarValue::Str(value) => write!(f, "{value:?}"),
        }
    }
}
