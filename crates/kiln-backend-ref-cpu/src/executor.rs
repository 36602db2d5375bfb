//! Program interpreter over f32 buffers.

use anyhow::{anyhow, bail, ensure, Context, Result};
use kiln::artifact::{ExecutableProgram, ProgramExecutor};
use kiln::graph::inputs::{ExampleInputs, TensorValue};
use kiln::graph::spec::{ScalarValue, Shape, TensorDesc};
use kiln::graph::{Graph, Node, NodeId, OpKind, Operand};
use kiln::KernelRegistry;

use crate::kernels::{run_matmul, VARIANT_NAIVE};

/// Runtime tensor: concrete extents plus a flat buffer.
#[derive(Debug, Clone)]
struct Value {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl Value {
    fn scalar(value: f32) -> Self {
        Self {
            dims: vec![],
            data: vec![value],
        }
    }
}

/// Executes rehydrated programs by walking the graph in node order.
#[derive(Debug, Default)]
pub struct CpuExecutor;

impl CpuExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl ProgramExecutor for CpuExecutor {
    fn execute(
        &self,
        program: &ExecutableProgram,
        registry: &KernelRegistry,
        inputs: &ExampleInputs,
    ) -> Result<Vec<TensorValue>> {
        interpret(program, registry, inputs)
    }
}

fn scalar_of(value: &ScalarValue) -> Result<f32> {
    match value {
        ScalarValue::Int(v) => Ok(*v as f32),
        ScalarValue::Float(v) => Ok(*v as f32),
        ScalarValue::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
        ScalarValue::Str(text) => bail!("string constant `{text}` is not numeric"),
    }
}

fn interpret(
    program: &ExecutableProgram,
    registry: &KernelRegistry,
    inputs: &ExampleInputs,
) -> Result<Vec<TensorValue>> {
    let graph: &Graph = &program.graph;
    let mut values: Vec<Option<Value>> = vec![None; graph.len()];
    let mut tensor_inputs = inputs.tensors();
    let mut outputs = Vec::new();

    for (idx, node) in graph.nodes().iter().enumerate() {
        let value = match &node.op {
            OpKind::Placeholder => {
                let tensor = tensor_inputs
                    .next()
                    .ok_or_else(|| anyhow!("ran out of tensor inputs at node %{idx}"))?;
                let dims = tensor
                    .concrete_dims()
                    .ok_or_else(|| anyhow!("input for node %{idx} has unbound dimensions"))?;
                ensure!(
                    dims.iter().product::<usize>() == tensor.data.len(),
                    "input for node %{idx} has {} elements for shape {dims:?}",
                    tensor.data.len()
                );
                Value {
                    dims,
                    data: tensor.data.clone(),
                }
            }
            OpKind::Output => {
                for operand in &node.args {
                    let result = resolve(&values, graph, operand)
                        .with_context(|| format!("output operand of node %{idx}"))?;
                    outputs.push(result);
                }
                continue;
            }
            OpKind::Add => binary(&values, graph, node, idx, |x, y| x + y)?,
            OpKind::Sub => binary(&values, graph, node, idx, |x, y| x - y)?,
            OpKind::Mul => binary(&values, graph, node, idx, |x, y| x * y)?,
            OpKind::Div => binary(&values, graph, node, idx, |x, y| x / y)?,
            OpKind::Neg => unary(&values, graph, node, idx, |x| -x)?,
            OpKind::Exp => unary(&values, graph, node, idx, f32::exp)?,
            OpKind::Relu => unary(&values, graph, node, idx, |x| x.max(0.0))?,
            OpKind::Sum => {
                let input = single_arg(&values, graph, node, idx)?;
                Value::scalar(input.data.iter().sum())
            }
            OpKind::MatMul => matmul(&values, graph, node, idx, program, registry)?,
            OpKind::Transpose => {
                let input = single_arg(&values, graph, node, idx)?;
                ensure!(
                    input.dims.len() == 2,
                    "transpose at node %{idx} needs a rank-2 input"
                );
                let (rows, cols) = (input.dims[0], input.dims[1]);
                let mut data = vec![0.0f32; rows * cols];
                for r in 0..rows {
                    for c in 0..cols {
                        data[c * rows + r] = input.data[r * cols + c];
                    }
                }
                Value {
                    dims: vec![cols, rows],
                    data,
                }
            }
            OpKind::GetAttr | OpKind::Reshape => {
                bail!("operator `{}` is not executable by the reference backend", node.op.name())
            }
            OpKind::Extern(name) => {
                bail!("external operator `{name}` is not executable by the reference backend")
            }
        };
        values[idx] = Some(value);
    }

    Ok(outputs
        .into_iter()
        .map(|value| {
            let desc = TensorDesc::contiguous(
                kiln::graph::spec::Device::Cpu,
                kiln::graph::spec::DType::F32,
                Shape::of(&value.dims),
            );
            TensorValue::new(desc, value.data)
        })
        .collect())
}

fn resolve(values: &[Option<Value>], _graph: &Graph, operand: &Operand) -> Result<Value> {
    match operand {
        Operand::Node(NodeId(id)) => values
            .get(*id as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or_else(|| anyhow!("node %{id} was not evaluated before use")),
        Operand::Scalar(value) => Ok(Value::scalar(scalar_of(value)?)),
        Operand::Tensor(desc) => bail!(
            "tensor constant {desc} has no bound storage in the reference backend"
        ),
    }
}

fn single_arg(values: &[Option<Value>], graph: &Graph, node: &Node, idx: usize) -> Result<Value> {
    ensure!(
        node.args.len() == 1,
        "operator `{}` at node %{idx} takes one argument",
        node.op.name()
    );
    resolve(values, graph, &node.args[0])
}

fn unary(
    values: &[Option<Value>],
    graph: &Graph,
    node: &Node,
    idx: usize,
    f: impl Fn(f32) -> f32,
) -> Result<Value> {
    let mut input = single_arg(values, graph, node, idx)?;
    for x in &mut input.data {
        *x = f(*x);
    }
    Ok(input)
}

fn binary(
    values: &[Option<Value>],
    graph: &Graph,
    node: &Node,
    idx: usize,
    f: impl Fn(f32, f32) -> f32,
) -> Result<Value> {
    ensure!(
        node.args.len() == 2,
        "operator `{}` at node %{idx} takes two arguments",
        node.op.name()
    );
    let lhs = resolve(values, graph, &node.args[0])?;
    let rhs = resolve(values, graph, &node.args[1])?;
    // Scalar operands broadcast; tensor operands must match exactly.
    if rhs.dims.is_empty() {
        let y = rhs.data[0];
        let mut out = lhs;
        for x in &mut out.data {
            *x = f(*x, y);
        }
        return Ok(out);
    }
    if lhs.dims.is_empty() {
        let x = lhs.data[0];
        let mut out = rhs;
        for y in &mut out.data {
            *y = f(x, *y);
        }
        return Ok(out);
    }
    ensure!(
        lhs.dims == rhs.dims,
        "shape mismatch at node %{idx}: {:?} vs {:?}",
        lhs.dims,
        rhs.dims
    );
    let mut out = lhs;
    for (x, y) in out.data.iter_mut().zip(&rhs.data) {
        *x = f(*x, *y);
    }
    Ok(out)
}

fn matmul(
    values: &[Option<Value>],
    graph: &Graph,
    node: &Node,
    idx: usize,
    program: &ExecutableProgram,
    registry: &KernelRegistry,
) -> Result<Value> {
    ensure!(
        node.args.len() == 2,
        "matmul at node %{idx} takes two arguments"
    );
    let lhs = resolve(values, graph, &node.args[0])?;
    let rhs = resolve(values, graph, &node.args[1])?;
    ensure!(
        lhs.dims.len() == 2 && rhs.dims.len() == 2,
        "matmul at node %{idx} needs rank-2 inputs, got {:?} and {:?}",
        lhs.dims,
        rhs.dims
    );
    let (m, k) = (lhs.dims[0], lhs.dims[1]);
    let (k2, n) = (rhs.dims[0], rhs.dims[1]);
    ensure!(
        k == k2,
        "matmul at node %{idx}: inner extents differ ({k} vs {k2})"
    );

    // The artifact's kernel choice, resolved through the side-table; a node
    // that was never tuned runs the default variant.
    let variant = program
        .kernels
        .get(&(idx as u32))
        .and_then(|id| registry.get(*id))
        .map(|def| def.variant)
        .unwrap_or_else(|| VARIANT_NAIVE.to_string());

    let data = run_matmul(&variant, &lhs.data, &rhs.data, m, k, n)?;
    Ok(Value {
        dims: vec![m, n],
        data,
    })
}
