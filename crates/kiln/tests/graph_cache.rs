//! Orchestrator behavior end-to-end against the reference backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kiln::artifact::{CompileContext, CompileOutput, GraphCompiler};
use kiln::cache::remote::MemoryCacheBackend;
use kiln::counters;
use kiln::events::{install_global_sink, CacheOutcome, RecordingSink};
use kiln::fingerprint::CompileConfig;
use kiln::graph::inputs::{ExampleInput, ExampleInputs, TensorValue};
use kiln::graph::spec::{DType, Device, Dim, ScalarValue, Shape, TensorDesc};
use kiln::graph::{Graph, GraphBuilder, OpKind, Operand};
use kiln::{CacheError, CacheSettings, CompileError, GraphCache};
use kiln_backend_ref_cpu::kernels::{run_matmul, VARIANT_NAIVE};
use kiln_backend_ref_cpu::{CpuExecutor, ReferenceCompiler};

/// These tests assert on process-global counters; run them one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn desc(dims: &[usize]) -> TensorDesc {
    TensorDesc::contiguous(Device::Cpu, DType::F32, Shape::of(dims))
}

/// fn(x, y) = (x * 2, y @ y)
fn double_and_square() -> Graph {
    let mut builder = GraphBuilder::new();
    let x = builder.placeholder(desc(&[25]));
    let y = builder.placeholder(desc(&[5, 5]));
    let doubled = builder.binary_scalar(OpKind::Mul, x, ScalarValue::Float(2.0));
    let squared = builder.binary(OpKind::MatMul, y, y);
    builder.output(vec![doubled, squared])
}

fn standard_inputs() -> ExampleInputs {
    let x: Vec<f32> = (0..25).map(|i| i as f32 * 0.5).collect();
    let y: Vec<f32> = (0..25).map(|i| (i % 4) as f32 - 1.0).collect();
    ExampleInputs::new(vec![
        ExampleInput::Tensor(TensorValue::new(desc(&[25]), x)),
        ExampleInput::Tensor(TensorValue::new(desc(&[5, 5]), y)),
    ])
}

fn expected_outputs(inputs: &ExampleInputs) -> (Vec<f32>, Vec<f32>) {
    let tensors: Vec<&TensorValue> = inputs.tensors().collect();
    let x = &tensors[0].data;
    let y = &tensors[1].data;
    let n = tensors[1].concrete_dims().unwrap()[0];
    (
        x.iter().map(|v| v * 2.0).collect(),
        run_matmul(VARIANT_NAIVE, y, y, n, n, n).unwrap(),
    )
}

struct CountingCompiler {
    inner: ReferenceCompiler,
    compiles: AtomicUsize,
}

impl CountingCompiler {
    fn new() -> Self {
        Self {
            inner: ReferenceCompiler::new(),
            compiles: AtomicUsize::new(0),
        }
    }

    fn count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl GraphCompiler for CountingCompiler {
    fn compile(
        &self,
        graph: &Graph,
        inputs: &ExampleInputs,
        config: &CompileConfig,
        ctx: &CompileContext,
    ) -> Result<CompileOutput, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(graph, inputs, config, ctx)
    }
}

struct Harness {
    dir: tempfile::TempDir,
    cache: GraphCache,
    ctx: CompileContext,
    compiler: CountingCompiler,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(|_| {})
    }

    fn with_settings(adjust: impl FnOnce(&mut CacheSettings)) -> Self {
        let dir = tempfile::tempdir().expect("temp cache root");
        let mut settings = CacheSettings::at(dir.path());
        adjust(&mut settings);
        Self {
            dir,
            cache: GraphCache::new(settings),
            ctx: CompileContext::new(Arc::new(CpuExecutor::new())),
            compiler: CountingCompiler::new(),
        }
    }

    fn load(
        &self,
        graph: &Graph,
        inputs: &ExampleInputs,
    ) -> Result<kiln::artifact::CompiledCallable, CompileError> {
        self.cache.load(
            &self.ctx,
            &self.compiler,
            graph,
            inputs,
            &CompileConfig::new(),
        )
    }
}

fn assert_outputs(callable: &kiln::artifact::CompiledCallable, inputs: &ExampleInputs) {
    let outputs = callable.call(inputs).expect("callable runs");
    let (doubled, squared) = expected_outputs(inputs);
    assert_eq!(outputs[0].data, doubled);
    assert_eq!(outputs[1].data, squared);
}

#[test]
fn first_load_misses_second_hits_from_disk() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let harness = Harness::new();
    let graph = double_and_square();
    let inputs = standard_inputs();

    let callable = harness.load(&graph, &inputs)?;
    assert_eq!(counters::get(counters::GRAPH_CACHE_MISS), 1);
    assert_eq!(counters::get(counters::GRAPH_CACHE_HIT), 0);
    assert_eq!(harness.compiler.count(), 1);
    assert_outputs(&callable, &inputs);

    // Reset only the in-memory memo; the disk entry must satisfy the
    // second load without recompiling.
    harness.cache.reset_memo();
    let reloaded = harness.load(&graph, &inputs)?;
    assert_eq!(counters::get(counters::GRAPH_CACHE_MISS), 1);
    assert_eq!(counters::get(counters::GRAPH_CACHE_HIT), 1);
    assert_eq!(harness.compiler.count(), 1);
    assert_outputs(&reloaded, &inputs);
    Ok(())
}

#[test]
fn repeat_loads_hit_the_memo() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let harness = Harness::new();
    let graph = double_and_square();
    let inputs = standard_inputs();

    harness.load(&graph, &inputs)?;
    harness.load(&graph, &inputs)?;
    harness.load(&graph, &inputs)?;
    assert_eq!(counters::get(counters::GRAPH_CACHE_MISS), 1);
    assert_eq!(counters::get(counters::GRAPH_CACHE_HIT), 2);
    assert_eq!(harness.compiler.count(), 1);
    Ok(())
}

#[test]
fn clear_resets_a_hitting_key_to_miss() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let harness = Harness::new();
    let graph = double_and_square();
    let inputs = standard_inputs();

    harness.load(&graph, &inputs)?;
    harness.cache.clear()?;
    harness.load(&graph, &inputs)?;
    assert_eq!(counters::get(counters::GRAPH_CACHE_MISS), 2);
    assert_eq!(harness.compiler.count(), 2);
    Ok(())
}

#[test]
fn missing_kernel_entry_is_a_guard_miss_not_an_error() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let harness = Harness::new();
    let graph = double_and_square();
    let inputs = standard_inputs();

    harness.load(&graph, &inputs)?;
    harness.cache.reset_memo();

    // The graph entry survives but the kernel namespace it references is
    // gone; tiers are not transactionally consistent.
    std::fs::remove_dir_all(harness.dir.path().join("kernel"))?;

    let callable = harness.load(&graph, &inputs)?;
    assert!(counters::get(counters::GRAPH_CACHE_GUARD_MISS) >= 1);
    assert_eq!(counters::get(counters::GRAPH_CACHE_MISS), 2);
    assert_eq!(harness.compiler.count(), 2);
    assert_outputs(&callable, &inputs);
    Ok(())
}

#[test]
fn mutated_tracked_constant_invalidates_the_memo() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let harness = Harness::new();
    let graph = double_and_square();
    let inputs = standard_inputs();

    harness.load(&graph, &inputs)?;
    harness.ctx.generation.bump();

    // The memoized program is stale, but the disk entry still validates.
    harness.load(&graph, &inputs)?;
    assert_eq!(counters::get(counters::GRAPH_CACHE_GUARD_MISS), 1);
    assert_eq!(counters::get(counters::GRAPH_CACHE_HIT), 1);
    assert_eq!(harness.compiler.count(), 1);
    Ok(())
}

#[test]
fn remote_hits_write_back_into_the_local_tier() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let backend = MemoryCacheBackend::new();
    let graph = double_and_square();
    let inputs = standard_inputs();

    // First process compiles and publishes to the shared backend.
    let first = Harness::with_settings(|settings| settings.remote_graph = true);
    let first_cache = GraphCache::new(first.cache.settings().clone())
        .with_remote(backend.clone() as Arc<dyn kiln::cache::remote::RemoteCacheBackend>);
    first_cache.load(
        &first.ctx,
        &first.compiler,
        &graph,
        &inputs,
        &CompileConfig::new(),
    )?;
    assert!(backend.stats().puts() >= 2, "graph and kernel entries published");

    // Second process has a cold local disk but the same remote backend.
    let second = Harness::with_settings(|settings| settings.remote_graph = true);
    let second_cache = GraphCache::new(second.cache.settings().clone())
        .with_remote(backend.clone() as Arc<dyn kiln::cache::remote::RemoteCacheBackend>);
    let callable = second_cache.load(
        &second.ctx,
        &second.compiler,
        &graph,
        &inputs,
        &CompileConfig::new(),
    )?;
    assert_eq!(second.compiler.count(), 0, "remote hit must not recompile");
    assert!(counters::get(counters::LOOKUP_WRITE_FILE) >= 1);
    assert!(backend.stats().hits() >= 1);
    assert_outputs(&callable, &inputs);
    Ok(())
}

fn extern_graph() -> Graph {
    let mut builder = GraphBuilder::new();
    let x = builder.placeholder(desc(&[4]));
    let fused = builder.apply(
        OpKind::Extern("vendor::fused_norm".into()),
        vec![Operand::Node(x)],
    );
    builder.output(vec![fused])
}

#[test]
fn unsafe_operators_bypass_without_failing_the_compile() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let harness = Harness::new();
    let inputs = ExampleInputs::new(vec![ExampleInput::Tensor(TensorValue::new(
        desc(&[4]),
        vec![1.0; 4],
    ))]);

    harness.load(&extern_graph(), &inputs)?;
    harness.load(&extern_graph(), &inputs)?;
    assert_eq!(counters::get(counters::GRAPH_CACHE_BYPASS), 2);
    assert_eq!(counters::get(counters::GRAPH_CACHE_MISS), 0);
    assert_eq!(harness.compiler.count(), 2, "bypassed loads always compile");
    assert!(
        !harness.dir.path().join("graph").exists(),
        "bypassed compiles must not be persisted"
    );
    Ok(())
}

#[test]
fn strict_mode_surfaces_bypasses() {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let harness = Harness::with_settings(|settings| settings.strict = true);
    let inputs = ExampleInputs::new(vec![ExampleInput::Tensor(TensorValue::new(
        desc(&[4]),
        vec![1.0; 4],
    ))]);

    match harness.load(&extern_graph(), &inputs) {
        Err(CompileError::Cache(CacheError::Bypass(_))) => {}
        Err(other) => panic!("expected a bypass error in strict mode, got {other:?}"),
        Ok(_) => panic!("expected a bypass error in strict mode, got a callable"),
    }
}

#[test]
fn dynamic_shapes_share_one_entry_across_sizes() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let harness = Harness::new();

    let dynamic_desc = |hint: u64| {
        TensorDesc::contiguous(
            Device::Cpu,
            DType::F32,
            Shape::new([Dim::dynamic("n", hint), Dim::dynamic("n", hint)]),
        )
    };
    let mut builder = GraphBuilder::new();
    let y = builder.placeholder(dynamic_desc(5));
    let squared = builder.binary(OpKind::MatMul, y, y);
    let graph = builder.output(vec![squared]);

    let inputs_for = |extent: usize| {
        let data: Vec<f32> = (0..extent * extent).map(|i| (i % 5) as f32).collect();
        ExampleInputs::new(vec![ExampleInput::Tensor(TensorValue::new(
            dynamic_desc(extent as u64),
            data,
        ))])
    };

    harness.load(&graph, &inputs_for(5))?;
    assert_eq!(counters::get(counters::GRAPH_CACHE_MISS), 1);

    harness.cache.reset_memo();
    let six = inputs_for(6);
    let callable = harness.load(&graph, &six)?;
    assert_eq!(
        counters::get(counters::GRAPH_CACHE_MISS),
        1,
        "same symbolic shape class must reuse the entry"
    );
    assert_eq!(counters::get(counters::GRAPH_CACHE_HIT), 1);
    assert_eq!(harness.compiler.count(), 1);

    // The rehydrated callable must bind the new concrete size correctly.
    let outputs = callable.call(&six)?;
    let y_data = &six.tensors().next().unwrap().data;
    assert_eq!(
        outputs[0].data,
        run_matmul(VARIANT_NAIVE, y_data, y_data, 6, 6, 6)?
    );
    Ok(())
}

#[test]
fn every_load_emits_one_structured_event() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().expect("serial mutex poisoned");
    counters::reset();
    let sink = RecordingSink::new();
    let _guard = install_global_sink(sink.clone());

    let harness = Harness::new();
    let graph = double_and_square();
    let inputs = standard_inputs();
    harness.load(&graph, &inputs)?;
    harness.cache.reset_memo();
    harness.load(&graph, &inputs)?;

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].outcome, CacheOutcome::Miss);
    assert_eq!(events[1].outcome, CacheOutcome::Hit);
    assert_eq!(events[0].key, events[1].key);
    assert!(!events[0].key.is_empty());
    assert!(events[0].debug_lines.iter().any(|line| line.starts_with("graph: ")));
    assert_eq!(events[0].namespace, "graph");
    Ok(())
}
