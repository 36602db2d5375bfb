//! Compiled artifacts and their rehydrated, runnable form.
//!
//! A [`CompiledArtifact`] is the serializable result of real compilation: the
//! canonical graph plus the kernel choices autotuning settled on, referencing
//! generated kernels by their cache keys rather than embedding them. An
//! [`ExecutableProgram`] is the same thing after rehydration: kernel keys
//! resolved through the kernel cache and registered into the process-local
//! [`KernelRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CompileResult;
use crate::fingerprint::CompileConfig;
use crate::generation::GenerationTracker;
use crate::graph::inputs::{ExampleInput, ExampleInputs, TensorValue};
use crate::graph::spec::Dim;
use crate::graph::{Graph, OpKind, Operand};
use crate::registry::{KernelDef, KernelId, KernelRegistry};

/// The kernel selected for one tuned node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelChoice {
    /// Key of the kernel definition in the generated-kernel cache namespace.
    pub kernel_key: String,
    /// Winning measured latency in milliseconds; provenance only.
    pub latency_ms: f64,
}

/// Serializable compiled form of a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub graph: Graph,
    /// Node index → chosen kernel, for every node that was autotuned.
    pub choices: BTreeMap<u32, KernelChoice>,
}

/// What `compile_fn` hands back: the artifact plus the kernel definitions it
/// references, so the orchestrator can persist them under their own keys.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub artifact: CompiledArtifact,
    pub kernels: Vec<(String, KernelDef)>,
}

/// A rehydrated program: kernel keys resolved to process-local ids.
#[derive(Debug)]
pub struct ExecutableProgram {
    pub graph: Arc<Graph>,
    /// Node index → registered kernel id, mirroring the artifact's choices.
    pub kernels: BTreeMap<u32, KernelId>,
}

/// Executes rehydrated programs. Implemented by backend crates; the caching
/// layer treats it as opaque.
pub trait ProgramExecutor: Send + Sync {
    fn execute(
        &self,
        program: &ExecutableProgram,
        registry: &KernelRegistry,
        inputs: &ExampleInputs,
    ) -> anyhow::Result<Vec<TensorValue>>;
}

/// The real compiler invoked on a cache miss. May consult the context's
/// tuner when a lowering decision has several viable kernels.
pub trait GraphCompiler {
    fn compile(
        &self,
        graph: &Graph,
        inputs: &ExampleInputs,
        config: &CompileConfig,
        ctx: &CompileContext,
    ) -> CompileResult<CompileOutput>;
}

/// Per-pipeline state the orchestrator and compilers share: the executor,
/// the kernel side-table, the mutation tracker, and (optionally) a tuner.
#[derive(Clone)]
pub struct CompileContext {
    pub executor: Arc<dyn ProgramExecutor>,
    pub registry: KernelRegistry,
    pub generation: GenerationTracker,
    pub tuner: Option<Arc<crate::autotune::Tuner>>,
}

impl CompileContext {
    pub fn new(executor: Arc<dyn ProgramExecutor>) -> Self {
        Self {
            executor,
            registry: KernelRegistry::new(),
            generation: GenerationTracker::new(),
            tuner: None,
        }
    }

    pub fn with_tuner(mut self, tuner: Arc<crate::autotune::Tuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }
}

/// A previously-compiled program bound to an executor, ready to run against
/// fresh inputs. Symbolic sizes bind to each call's concrete values, so one
/// callable serves every size of a dynamic-shape compilation.
#[derive(Clone)]
pub struct CompiledCallable {
    program: Arc<ExecutableProgram>,
    registry: KernelRegistry,
    executor: Arc<dyn ProgramExecutor>,
}

impl CompiledCallable {
    pub fn new(
        program: Arc<ExecutableProgram>,
        registry: KernelRegistry,
        executor: Arc<dyn ProgramExecutor>,
    ) -> Self {
        Self {
            program,
            registry,
            executor,
        }
    }

    pub fn program(&self) -> &ExecutableProgram {
        &self.program
    }

    /// Validates the binding and executes.
    pub fn call(&self, inputs: &ExampleInputs) -> anyhow::Result<Vec<TensorValue>> {
        validate_binding(&self.program.graph, inputs)?;
        self.executor.execute(&self.program, &self.registry, inputs)
    }
}

/// Checks that the call's inputs are compatible with the compiled graph's
/// placeholders: tensor count, rank, dtype, and every static extent must
/// match; dynamic extents accept any bound value.
pub fn validate_binding(graph: &Graph, inputs: &ExampleInputs) -> anyhow::Result<()> {
    let placeholders = graph.placeholders();
    let tensor_inputs: Vec<&TensorValue> = inputs
        .values()
        .iter()
        .filter_map(|input| match input {
            ExampleInput::Tensor(tensor) => Some(tensor),
            _ => None,
        })
        .collect();

    let tensor_placeholders: Vec<_> = placeholders
        .iter()
        .filter_map(|&id| match graph.node(id)?.op {
            OpKind::Placeholder => match graph.node(id)?.args.first() {
                Some(Operand::Tensor(desc)) => Some(desc),
                _ => None,
            },
            _ => None,
        })
        .collect();

    anyhow::ensure!(
        tensor_placeholders.len() == tensor_inputs.len(),
        "expected {} tensor inputs, got {}",
        tensor_placeholders.len(),
        tensor_inputs.len()
    );

    for (idx, (desc, value)) in tensor_placeholders.iter().zip(&tensor_inputs).enumerate() {
        anyhow::ensure!(
            desc.dtype == value.desc.dtype,
            "input[{idx}]: dtype mismatch ({} vs {})",
            desc.dtype,
            value.desc.dtype
        );
        anyhow::ensure!(
            desc.shape.rank() == value.desc.shape.rank(),
            "input[{idx}]: rank mismatch ({} vs {})",
            desc.shape.rank(),
            value.desc.shape.rank()
        );
        for (axis, (expected, actual)) in desc
            .shape
            .dims()
            .iter()
            .zip(value.desc.shape.dims())
            .enumerate()
        {
            if let Dim::Static(extent) = expected {
                anyhow::ensure!(
                    actual.concrete() == Some(*extent),
                    "input[{idx}] axis {axis}: expected extent {extent}, got {:?}",
                    actual.concrete()
                );
            }
        }
    }
    Ok(())
}
