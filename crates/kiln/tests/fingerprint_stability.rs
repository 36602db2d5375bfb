//! Key stability and sensitivity across full graphs.

use kiln::fingerprint::{compute_key, CompileConfig, ConfigValue};
use kiln::graph::inputs::{ExampleInput, ExampleInputs, TensorValue};
use kiln::graph::spec::{
    DType, Device, MemoryFormat, ScalarValue, Shape, TensorDesc,
};
use kiln::graph::{Graph, GraphBuilder, OpKind};

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

fn tensor_with(desc: TensorDesc, fill: f32) -> ExampleInput {
    let numel = desc.shape.numel().unwrap_or(0);
    ExampleInput::Tensor(TensorValue::new(desc, vec![fill; numel]))
}

fn standard_inputs(fill: f32) -> ExampleInputs {
    ExampleInputs::new(vec![
        tensor_with(desc(&[25]), fill),
        tensor_with(desc(&[5, 5]), fill),
    ])
}

#[test]
fn structurally_equal_inputs_yield_equal_keys() -> anyhow::Result<()> {
    // Distinct graph and input instances, different backing data, permuted
    // config insertion order: one key.
    let config_forward = CompileConfig::new()
        .with("max_autotune", ConfigValue::Bool(true))
        .with("tiling", ConfigValue::Int(32));
    let config_reverse = CompileConfig::new()
        .with("tiling", ConfigValue::Int(32))
        .with("max_autotune", ConfigValue::Bool(true));

    let (key_a, lines_a) =
        compute_key(&double_and_square(), &standard_inputs(1.0), &config_forward)?;
    let (key_b, lines_b) =
        compute_key(&double_and_square(), &standard_inputs(9.5), &config_reverse)?;

    assert_eq!(key_a, key_b);
    assert_eq!(lines_a, lines_b);
    Ok(())
}

#[test]
fn every_relevant_field_perturbs_the_key() -> anyhow::Result<()> {
    let graph = double_and_square();
    let config = CompileConfig::new().with("max_autotune", ConfigValue::Bool(true));
    let (base_key, _) = compute_key(&graph, &standard_inputs(0.0), &config)?;

    let mut variants: Vec<(&str, ExampleInputs)> = Vec::new();

    let mut dtype = desc(&[25]);
    dtype.dtype = DType::F16;
    variants.push((
        "dtype",
        ExampleInputs::new(vec![
            tensor_with(dtype, 0.0),
            tensor_with(desc(&[5, 5]), 0.0),
        ]),
    ));

    let mut device = desc(&[25]);
    device.device = Device::Accel(0);
    variants.push((
        "device",
        ExampleInputs::new(vec![
            tensor_with(device, 0.0),
            tensor_with(desc(&[5, 5]), 0.0),
        ]),
    ));

    variants.push((
        "shape",
        ExampleInputs::new(vec![
            tensor_with(desc(&[26]), 0.0),
            tensor_with(desc(&[5, 5]), 0.0),
        ]),
    ));

    let mut strides = desc(&[5, 5]);
    strides.strides = smallvec_from(&[1, 5]);
    variants.push((
        "strides",
        ExampleInputs::new(vec![tensor_with(desc(&[25]), 0.0), tensor_with(strides, 0.0)]),
    ));

    let grad = desc(&[25]).with_requires_grad(true);
    variants.push((
        "requires_grad",
        ExampleInputs::new(vec![tensor_with(grad, 0.0), tensor_with(desc(&[5, 5]), 0.0)]),
    ));

    for (what, inputs) in variants {
        let (key, _) = compute_key(&graph, &inputs, &config)?;
        assert_ne!(base_key, key, "changing {what} must change the key");
    }

    let flipped = CompileConfig::new().with("max_autotune", ConfigValue::Bool(false));
    let (config_key, _) = compute_key(&graph, &standard_inputs(0.0), &flipped)?;
    assert_ne!(base_key, config_key, "config flag must change the key");

    let mut other_graph_builder = GraphBuilder::new();
    let x = other_graph_builder.placeholder(desc(&[25]));
    let y = other_graph_builder.placeholder(desc(&[5, 5]));
    let doubled = other_graph_builder.binary_scalar(OpKind::Add, x, ScalarValue::Float(2.0));
    let squared = other_graph_builder.binary(OpKind::MatMul, y, y);
    let other_graph = other_graph_builder.output(vec![doubled, squared]);
    let (graph_key, _) = compute_key(&other_graph, &standard_inputs(0.0), &config)?;
    assert_ne!(base_key, graph_key, "operator change must change the key");
    Ok(())
}

#[test]
fn memory_format_stands_in_for_strides_on_dynamic_shapes() -> anyhow::Result<()> {
    let graph = double_and_square();
    let config = CompileConfig::new();
    let dynamic = |format: MemoryFormat| {
        let mut first = TensorDesc::contiguous(
            Device::Cpu,
            DType::F32,
            Shape::new([kiln::graph::spec::Dim::dynamic("n", 25)]),
        );
        first.memory_format = format;
        ExampleInputs::new(vec![
            ExampleInput::Tensor(TensorValue::new(first, vec![0.0; 25])),
            tensor_with(desc(&[5, 5]), 0.0),
        ])
    };
    let (contiguous, _) = compute_key(&graph, &dynamic(MemoryFormat::Contiguous), &config)?;
    let (channels_last, _) = compute_key(&graph, &dynamic(MemoryFormat::ChannelsLast), &config)?;
    assert_ne!(contiguous, channels_last);
    Ok(())
}

fn smallvec_from(values: &[usize]) -> smallvec::SmallVec<[usize; 4]> {
    values.iter().copied().collect()
}
