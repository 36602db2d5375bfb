//! Content-addressed cache keys.
//!
//! A key is derived from the canonical byte form of {graph structure, input
//! descriptors, configuration}: map keys and set elements are sorted before
//! serialization, tensors contribute their structural descriptor only, and
//! dynamic tensor dimensions contribute their symbol rather than the value
//! they happen to be bound to, so one entry serves every concrete size of a
//! dynamic-shape compilation. Two FNV-1a lanes (structure, specialization)
//! are joined under a short namespace tag to form the final key string.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::env;
use crate::error::{BypassReason, CacheError, CacheResult};
use crate::graph::inputs::{ExampleInput, ExampleInputs};
use crate::graph::spec::{
    DType, Device, Dim, MemoryFormat, ScalarValue, TensorDesc,
};
use crate::graph::{Graph, NodeSafety};

/// Namespace tag for compiled-graph entries.
pub const GRAPH_NAMESPACE: &str = "gk";
/// Namespace tag for generated-kernel entries.
pub const KERNEL_NAMESPACE: &str = "kn";
/// Namespace tag for autotune-result entries.
pub const AUTOTUNE_NAMESPACE: &str = "at";

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV1A_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

fn hash_serializable<T: Serialize>(value: &T) -> CacheResult<u64> {
    let bytes = bincode::serialize(value)?;
    Ok(fnv1a(&bytes))
}

/// A fixed-length, namespace-tagged digest string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    text: String,
}

impl CacheKey {
    fn new(tag: &str, structure: u64, specialization: u64) -> Self {
        Self {
            text: format!("{tag}{structure:016x}{specialization:016x}"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

/// A configuration value; maps and sets canonicalize themselves by sorting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConfigValue>),
    Map(Vec<(String, ConfigValue)>),
    Set(Vec<String>),
}

impl ConfigValue {
    fn canonical(&self) -> ConfigValue {
        match self {
            ConfigValue::List(items) => {
                ConfigValue::List(items.iter().map(ConfigValue::canonical).collect())
            }
            ConfigValue::Map(entries) => {
                let sorted: BTreeMap<&String, &ConfigValue> =
                    entries.iter().map(|(key, value)| (key, value)).collect();
                ConfigValue::Map(
                    sorted
                        .into_iter()
                        .map(|(key, value)| (key.clone(), value.canonical()))
                        .collect(),
                )
            }
            ConfigValue::Set(items) => {
                let sorted: BTreeSet<&String> = items.iter().collect();
                ConfigValue::Set(sorted.into_iter().cloned().collect())
            }
            other => other.clone(),
        }
    }

    fn render(&self) -> String {
        match self {
            ConfigValue::Bool(value) => value.to_string(),
            ConfigValue::Int(value) => value.to_string(),
            ConfigValue::Float(value) => value.to_string(),
            ConfigValue::Str(value) => format!("{value:?}"),
            ConfigValue::List(items) => {
                let rendered: Vec<_> = items.iter().map(ConfigValue::render).collect();
                format!("[{}]", rendered.join(","))
            }
            ConfigValue::Map(entries) => {
                let rendered: Vec<_> = entries
                    .iter()
                    .map(|(key, value)| format!("{key}={}", value.render()))
                    .collect();
                format!("{{{}}}", rendered.join(","))
            }
            ConfigValue::Set(items) => format!("{{{}}}", items.join(",")),
        }
    }
}

/// The active configuration passed to `compute_key`.
///
/// Entries keep insertion order for the caller's convenience; the key builder
/// sorts them (recursively) before hashing, so insertion order never reaches
/// the digest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileConfig {
    entries: Vec<(String, ConfigValue)>,
}

impl CompileConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) -> &mut Self {
        self.entries.push((key.into(), value));
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries
            .iter()
            .rev()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted, recursively-canonicalized view; later duplicates win.
    fn canonical_entries(&self) -> Vec<(String, ConfigValue)> {
        let mut sorted: BTreeMap<&String, &ConfigValue> = BTreeMap::new();
        for (key, value) in &self.entries {
            sorted.insert(key, value);
        }
        sorted
            .into_iter()
            .map(|(key, value)| (key.clone(), value.canonical()))
            .collect()
    }
}

/// What a tensor dimension contributes to the digest: static extent by
/// value, dynamic extent by symbol only.
#[derive(Serialize)]
enum DimFingerprint {
    Static(usize),
    Dynamic(String),
}

/// What one stride axis contributes: concrete strides when the shape is
/// fully static, otherwise the layout class stands in.
#[derive(Serialize)]
enum StrideFingerprint {
    Concrete(Vec<usize>),
    Format(MemoryFormat),
}

/// Structural digest form of a tensor descriptor. Two tensors with identical
/// descriptors produce identical fingerprints regardless of backing storage.
#[derive(Serialize)]
struct TensorFingerprint {
    device: Device,
    dtype: DType,
    dims: Vec<DimFingerprint>,
    strides: StrideFingerprint,
    storage_offset: usize,
    requires_grad: bool,
}

impl TensorFingerprint {
    fn of(desc: &TensorDesc) -> Self {
        let dims = desc
            .shape
            .dims()
            .iter()
            .map(|dim| match dim {
                Dim::Static(value) => DimFingerprint::Static(*value),
                Dim::Dynamic(sym) => DimFingerprint::Dynamic(sym.symbol.clone()),
            })
            .collect();
        let strides = if desc.shape.is_fully_static() {
            StrideFingerprint::Concrete(desc.strides.to_vec())
        } else {
            StrideFingerprint::Format(desc.memory_format)
        };
        Self {
            device: desc.device,
            dtype: desc.dtype,
            dims,
            strides,
            storage_offset: desc.storage_offset,
            requires_grad: desc.requires_grad,
        }
    }
}

/// Digest form of one example input.
#[derive(Serialize)]
enum InputFingerprint {
    Tensor(TensorFingerprint),
    Scalar(ScalarValue),
    /// A standalone symbolic size: by resolved hint when bound, else by its
    /// structural symbol.
    SizeHint(u64),
    SizeSymbol(String),
}

impl InputFingerprint {
    fn of(input: &ExampleInput) -> Self {
        match input {
            ExampleInput::Tensor(tensor) => {
                InputFingerprint::Tensor(TensorFingerprint::of(&tensor.desc))
            }
            ExampleInput::Scalar(value) => InputFingerprint::Scalar(value.clone()),
            ExampleInput::Size(sym) => match sym.hint {
                Some(hint) => InputFingerprint::SizeHint(hint),
                None => InputFingerprint::SizeSymbol(sym.symbol.clone()),
            },
        }
    }

    fn render(&self) -> String {
        match self {
            InputFingerprint::Tensor(tensor) => {
                let dims: Vec<String> = tensor
                    .dims
                    .iter()
                    .map(|dim| match dim {
                        DimFingerprint::Static(value) => value.to_string(),
                        DimFingerprint::Dynamic(symbol) => format!("?{symbol}"),
                    })
                    .collect();
                format!(
                    "tensor {}[{}]@{} grad={}",
                    tensor.dtype,
                    dims.join(","),
                    tensor.device,
                    tensor.requires_grad
                )
            }
            InputFingerprint::Scalar(value) => format!("scalar {value}"),
            InputFingerprint::SizeHint(hint) => format!("size {hint}"),
            InputFingerprint::SizeSymbol(symbol) => format!("size ?{symbol}"),
        }
    }
}

/// Digest form of one operand binding.
#[derive(Serialize)]
enum OperandFingerprint {
    Node(u32),
    Tensor(TensorFingerprint),
    Scalar(ScalarValue),
}

impl OperandFingerprint {
    fn of(operand: &crate::graph::Operand) -> Self {
        match operand {
            crate::graph::Operand::Node(id) => OperandFingerprint::Node(id.0),
            crate::graph::Operand::Tensor(desc) => {
                OperandFingerprint::Tensor(TensorFingerprint::of(desc))
            }
            crate::graph::Operand::Scalar(value) => OperandFingerprint::Scalar(value.clone()),
        }
    }
}

/// Canonical signature hashed into the structure lane. Tensor operands go
/// through the same hint-stripping as inputs, so re-capturing a graph under
/// different dynamic sizes leaves the structure hash unchanged.
#[derive(Serialize)]
struct GraphSignature {
    nodes: Vec<NodeSignature>,
}

#[derive(Serialize)]
struct NodeSignature {
    op: crate::graph::OpKind,
    args: Vec<OperandFingerprint>,
    kwargs: Vec<(String, OperandFingerprint)>,
}

impl GraphSignature {
    fn of(graph: &Graph) -> Self {
        let nodes = graph
            .nodes()
            .iter()
            .map(|node| NodeSignature {
                op: node.op.clone(),
                args: node.args.iter().map(OperandFingerprint::of).collect(),
                kwargs: node
                    .kwargs
                    .iter()
                    .map(|(key, value)| (key.clone(), OperandFingerprint::of(value)))
                    .collect(),
            })
            .collect();
        Self { nodes }
    }
}

thread_local! {
    static COMPILE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the current thread as inside a compilation region; a nested
/// `check_cacheable` call on the same thread bypasses.
pub struct CompileScope {
    _private: (),
}

impl CompileScope {
    pub fn enter() -> Self {
        COMPILE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }
}

impl Drop for CompileScope {
    fn drop(&mut self) {
        COMPILE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn nested_compile_active() -> bool {
    COMPILE_DEPTH.with(|depth| depth.get() > 0)
}

/// Decides whether the triple is cacheable at all.
///
/// Conservative safety property: a node is safe only when the fields that
/// reach the digest fully determine its behavior. Externally-defined
/// operators, nested compilation regions, and a globally disabled cache all
/// force a bypass.
pub fn check_cacheable(graph: &Graph) -> CacheResult<()> {
    if env::cache_disabled() {
        return Err(CacheError::Bypass(BypassReason::CacheDisabled));
    }
    if nested_compile_active() {
        return Err(CacheError::Bypass(BypassReason::NestedCompile));
    }
    for node in graph.nodes() {
        if let NodeSafety::Unsafe { op } = node.safety() {
            return Err(CacheError::Bypass(BypassReason::UnsafeOp { op }));
        }
    }
    Ok(())
}

/// Canonical signature hashed into the specialization lane.
#[derive(Serialize)]
struct SpecializationSignature {
    inputs: Vec<InputFingerprint>,
    config: Vec<(String, ConfigValue)>,
    version: &'static str,
}

/// Computes the cache key for a triple, together with one human-readable
/// debug line per contributing field.
pub fn compute_key(
    graph: &Graph,
    inputs: &ExampleInputs,
    config: &CompileConfig,
) -> CacheResult<(CacheKey, Vec<String>)> {
    let structure_hash = hash_serializable(&GraphSignature::of(graph))?;

    let input_prints: Vec<InputFingerprint> =
        inputs.values().iter().map(InputFingerprint::of).collect();
    let signature = SpecializationSignature {
        inputs: input_prints,
        config: config.canonical_entries(),
        version: crate::KILN_VERSION,
    };
    let specialization_hash = hash_serializable(&signature)?;

    let mut debug_lines = Vec::with_capacity(graph.len() + signature.inputs.len() + 2);
    debug_lines.push(format!("version: {}", crate::KILN_VERSION));
    for line in graph.render_lines() {
        debug_lines.push(format!("graph: {line}"));
    }
    for (idx, print) in signature.inputs.iter().enumerate() {
        debug_lines.push(format!("input[{idx}]: {}", print.render()));
    }
    for (key, value) in &signature.config {
        debug_lines.push(format!("config: {key}={}", value.render()));
    }

    Ok((
        CacheKey::new(GRAPH_NAMESPACE, structure_hash, specialization_hash),
        debug_lines,
    ))
}

/// Key for an autotune-result entry: the candidate set, the concrete problem
/// extents, and the device. Autotuning is size-specific, so hints are hashed
/// here even for dynamic dimensions.
pub fn autotune_key<T: Serialize>(detail: &T) -> CacheResult<CacheKey> {
    let hash = hash_serializable(detail)?;
    // Single-lane digest; repeat the lane so the key length matches.
    Ok(CacheKey::new(AUTOTUNE_NAMESPACE, hash, hash.rotate_left(17)))
}

/// Key for a generated-kernel entry, derived from the definition alone.
pub fn kernel_key(def: &crate::registry::KernelDef) -> CacheResult<CacheKey> {
    let hash = hash_serializable(def)?;
    Ok(CacheKey::new(KERNEL_NAMESPACE, hash, hash.rotate_left(17)))
}
