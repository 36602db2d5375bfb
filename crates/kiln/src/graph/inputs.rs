//! Concrete example inputs.
//!
//! The same flat sequence serves two purposes: its structural descriptors
//! feed the key builder, and its payloads feed real execution on a cache miss
//! or during benchmarking. Payloads are stored as f32 regardless of the
//! declared dtype; the declared dtype still participates in the fingerprint.

use serde::{Deserialize, Serialize};

use super::spec::{ScalarValue, SymDim, TensorDesc};

/// A tensor argument: structural descriptor plus backing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    pub desc: TensorDesc,
    pub data: Vec<f32>,
}

impl TensorValue {
    pub fn new(desc: TensorDesc, data: Vec<f32>) -> Self {
        Self { desc, data }
    }

    /// Concrete extents under the descriptor's current hints.
    pub fn concrete_dims(&self) -> Option<Vec<usize>> {
        self.desc.shape.concrete_dims()
    }
}

/// One entry of the example-input sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExampleInput {
    Tensor(TensorValue),
    Scalar(ScalarValue),
    /// A standalone symbolic size (e.g. a sequence length passed by value).
    Size(SymDim),
}

/// The flat ordered argument list for one call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExampleInputs {
    values: Vec<ExampleInput>,
}

impl ExampleInputs {
    pub fn new(values: Vec<ExampleInput>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[ExampleInput] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: ExampleInput) {
        self.values.push(value);
    }

    /// Tensor arguments in order, skipping scalars and sizes.
    pub fn tensors(&self) -> impl Iterator<Item = &TensorValue> {
        self.values.iter().filter_map(|value| match value {
            ExampleInput::Tensor(tensor) => Some(tensor),
            _ => None,
        })
    }
}

impl FromIterator<ExampleInput> for ExampleInputs {
    fn from_iter<I: IntoIterator<Item = ExampleInput>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
