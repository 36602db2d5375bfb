//! Graph lowering for the reference backend.
//!
//! Lowering here is thin: the interpreter executes the graph directly, so
//! the only real decision is which matmul kernel each matmul node runs.
//! With a tuner in the context that decision is benchmarked; without one the
//! default variant wins unmeasured.

use std::collections::BTreeMap;

use kiln::artifact::{
    CompileContext, CompiledArtifact, CompileOutput, GraphCompiler, KernelChoice,
};
use kiln::autotune::BenchJob;
use kiln::error::CompileResult;
use kiln::fingerprint::{kernel_key, CompileConfig};
use kiln::graph::inputs::{ExampleInputs, TensorValue};
use kiln::graph::spec::TensorDesc;
use kiln::graph::{Graph, OpKind, Operand};
use kiln::KernelDef;

use crate::kernels::{matmul_candidates, MATMUL_OP, VARIANT_NAIVE};

#[derive(Debug, Default)]
pub struct ReferenceCompiler;

impl ReferenceCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl GraphCompiler for ReferenceCompiler {
    fn compile(
        &self,
        graph: &Graph,
        inputs: &ExampleInputs,
        _config: &CompileConfig,
        ctx: &CompileContext,
    ) -> CompileResult<CompileOutput> {
        let mut choices = BTreeMap::new();
        let mut kernels: BTreeMap<String, KernelDef> = BTreeMap::new();

        for (idx, node) in graph.nodes().iter().enumerate() {
            if node.op != OpKind::MatMul {
                continue;
            }
            let bench_args = node
                .args
                .iter()
                .map(|operand| bench_input(graph, inputs, operand))
                .collect::<Option<Vec<TensorValue>>>();

            let (def, latency_ms) = match (&ctx.tuner, bench_args) {
                (Some(tuner), Some(args)) => {
                    let settings = tuner.settings();
                    let jobs = matmul_candidates()
                        .into_iter()
                        .map(|kernel| BenchJob {
                            kernel,
                            inputs: args.clone(),
                            warmup: settings.warmup,
                            reps: settings.reps,
                        })
                        .collect();
                    let selection = tuner.select(jobs)?;
                    (selection.kernel, selection.latency_ms)
                }
                // No tuner, or arguments we cannot stage concrete values
                // for: fall back to the default variant.
                _ => (KernelDef::new(MATMUL_OP, VARIANT_NAIVE), 0.0),
            };

            let key = kernel_key(&def)?.to_string();
            choices.insert(
                idx as u32,
                KernelChoice {
                    kernel_key: key.clone(),
                    latency_ms,
                },
            );
            kernels.insert(key, def);
        }

        Ok(CompileOutput {
            artifact: CompiledArtifact {
                graph: graph.clone(),
                choices,
            },
            kernels: kernels.into_iter().collect(),
        })
    }
}

/// Stages a concrete tensor for benchmarking one matmul operand: the bound
/// example input for placeholders, a ones-filled buffer for tensor
/// constants, nothing for intermediate values (their extents are unknown
/// without shape inference).
fn bench_input(graph: &Graph, inputs: &ExampleInputs, operand: &Operand) -> Option<TensorValue> {
    match operand {
        Operand::Node(id) => {
            let node = graph.node(*id)?;
            if node.op != OpKind::Placeholder {
                return None;
            }
            let position = graph.placeholders().iter().position(|p| p == id)?;
            inputs.tensors().nth(position).cloned()
        }
        Operand::Tensor(desc) => ones_like(desc),
        Operand::Scalar(_) => None,
    }
}

fn ones_like(desc: &TensorDesc) -> Option<TensorValue> {
    let numel = desc.shape.numel()?;
    Some(TensorValue::new(desc.clone(), vec![1.0; numel]))
}
