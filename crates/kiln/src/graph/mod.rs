//! Captured computation graphs.
//!
//! A [`Graph`] is an immutable, already-captured representation of a numeric
//! program: an ordered node list where each node names an operator and binds
//! its arguments to constants, tensor descriptors, or earlier nodes' outputs.
//! The caching layer never mutates a graph and never executes one itself.

pub mod inputs;
pub mod spec;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use spec::{ScalarValue, TensorDesc};

/// Index of a node within its graph's node list.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// The operator a node invokes.
///
/// Structural operators (placeholders, attribute reads, outputs) and the
/// well-known numeric operators are eligible for caching; [`OpKind::Extern`]
/// names an operator outside the allow-list and always forces a bypass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Placeholder,
    GetAttr,
    Output,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Relu,
    Sum,
    MatMul,
    Reshape,
    Transpose,
    /// A call into an operator this crate knows nothing about.
    Extern(String),
}

impl OpKind {
    /// Short stable operator name used in debug lines and event payloads.
    pub fn name(&self) -> &str {
        match self {
            OpKind::Placeholder => "placeholder",
            OpKind::GetAttr => "get_attr",
            OpKind::Output => "output",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Neg => "neg",
            OpKind::Exp => "exp",
            OpKind::Relu => "relu",
            OpKind::Sum => "sum",
            OpKind::MatMul => "matmul",
            OpKind::Reshape => "reshape",
            OpKind::Transpose => "transpose",
            OpKind::Extern(name) => name,
        }
    }
}

/// Safety classification of a single node, as seen by the key builder.
///
/// "Safe" means the node's behavior is fully determined by the fields that
/// participate in the fingerprint; anything else must bypass the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSafety {
    Safe,
    Unsafe { op: String },
}

/// One argument binding of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// Output of an earlier node.
    Node(NodeId),
    /// A tensor-valued constant, represented structurally.
    Tensor(TensorDesc),
    /// A scalar constant.
    Scalar(ScalarValue),
}

/// A single operation in the captured program.
///
/// Keyword bindings live in a sorted map so that two captures of the same
/// call never differ by kwarg order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: OpKind,
    pub args: Vec<Operand>,
    pub kwargs: BTreeMap<String, Operand>,
}

impl Node {
    pub fn new(op: OpKind, args: Vec<Operand>) -> Self {
        Self {
            op,
            args,
            kwargs: BTreeMap::new(),
        }
    }

    /// Conservative allow-list check: structural and well-known numeric
    /// operators are safe, external calls are not.
    pub fn safety(&self) -> NodeSafety {
        match &self.op {
            OpKind::Extern(name) => NodeSafety::Unsafe { op: name.clone() },
            _ => NodeSafety::Safe,
        }
    }
}

/// An immutable captured graph.
///
/// Nodes are stored in capture order; placeholders come first and the final
/// node is the [`OpKind::Output`] node listing the program results. Node ids
/// are indices into the node list, which makes the structure canonical by
/// construction: re-capturing the same program yields the same ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of all placeholder nodes, in input order.
    pub fn placeholders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.op == OpKind::Placeholder)
            .map(|(idx, _)| NodeId(idx as u32))
            .collect()
    }

    /// The argument list of the output node, i.e. the program results.
    pub fn outputs(&self) -> &[Operand] {
        self.nodes
            .iter()
            .rev()
            .find(|node| node.op == OpKind::Output)
            .map(|node| node.args.as_slice())
            .unwrap_or(&[])
    }

    /// Declared descriptor of the `index`-th placeholder, when it is a
    /// tensor placeholder.
    pub fn placeholder_desc(&self, index: usize) -> Option<&TensorDesc> {
        let id = *self.placeholders().get(index)?;
        match self.node(id)?.args.first()? {
            Operand::Tensor(desc) => Some(desc),
            _ => None,
        }
    }

    /// One human-readable line per node, in id order.
    pub fn render_lines(&self) -> Vec<String> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                let mut line = format!("%{idx} = {}(", node.op.name());
                for (arg_idx, arg) in node.args.iter().enumerate() {
                    if arg_idx > 0 {
                        line.push_str(", ");
                    }
                    match arg {
                        Operand::Node(id) => line.push_str(&id.to_string()),
                        Operand::Tensor(desc) => line.push_str(&desc.to_string()),
                        Operand::Scalar(value) => line.push_str(&value.to_string()),
                    }
                }
                for (key, value) in &node.kwargs {
                    line.push_str(&format!(", {key}="));
                    match value {
                        Operand::Node(id) => line.push_str(&id.to_string()),
                        Operand::Tensor(desc) => line.push_str(&desc.to_string()),
                        Operand::Scalar(scalar) => line.push_str(&scalar.to_string()),
                    }
                }
                line.push(')');
                line
            })
            .collect()
    }
}

/// Incremental builder used by graph producers and tests.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Declares a tensor input with the given structural descriptor.
    pub fn placeholder(&mut self, desc: TensorDesc) -> NodeId {
        self.push(Node::new(
            OpKind::Placeholder,
            vec![Operand::Tensor(desc)],
        ))
    }

    /// Reads a named module attribute (a constant from the caller's side).
    pub fn get_attr(&mut self, name: &str, desc: TensorDesc) -> NodeId {
        let mut node = Node::new(OpKind::GetAttr, vec![Operand::Tensor(desc)]);
        node.kwargs.insert(
            "name".to_string(),
            Operand::Scalar(ScalarValue::Str(name.to_string())),
        );
        self.push(node)
    }

    pub fn apply(&mut self, op: OpKind, args: Vec<Operand>) -> NodeId {
        self.push(Node::new(op, args))
    }

    pub fn unary(&mut self, op: OpKind, input: NodeId) -> NodeId {
        self.apply(op, vec![Operand::Node(input)])
    }

    pub fn binary(&mut self, op: OpKind, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.apply(op, vec![Operand::Node(lhs), Operand::Node(rhs)])
    }

    pub fn binary_scalar(&mut self, op: OpKind, lhs: NodeId, rhs: ScalarValue) -> NodeId {
        self.apply(op, vec![Operand::Node(lhs), Operand::Scalar(rhs)])
    }

    /// Seals the graph with an output node listing the results.
    pub fn output(mut self, results: Vec<NodeId>) -> Graph {
        self.push(Node::new(
            OpKind::Output,
            results.into_iter().map(Operand::Node).collect(),
        ));
        Graph { nodes: self.nodes }
    }
}

#[cfg(test)]
mod tests {
    use super::spec::{DType, Device, Shape};
    use super::*;

    fn desc(dims: &[usize]) -> TensorDesc {
        TensorDesc::contiguous(Device::Cpu, DType::F32, Shape::of(dims))
    }

    #[test]
    fn builder_orders_placeholders_and_output() {
        let mut builder = GraphBuilder::new();
        let x = builder.placeholder(desc(&[4]));
        let y = builder.placeholder(desc(&[4]));
        let sum = builder.binary(OpKind::Add, x, y);
        let graph = builder.output(vec![sum]);

        assert_eq!(graph.placeholders(), vec![NodeId(0), NodeId(1)]);
        assert_eq!(graph.outputs(), &[Operand::Node(sum)]);
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn extern_nodes_are_unsafe() {
        let node = Node::new(OpKind::Extern("vendor::fused_rope".into()), vec![]);
        assert_eq!(
            node.safety(),
            NodeSafety::Unsafe {
                op: "vendor::fused_rope".into()
            }
        );
        assert_eq!(Node::new(OpKind::MatMul, vec![]).safety(), NodeSafety::Safe);
    }

    #[test]
    fn render_lines_are_stable() {
        let mut builder = GraphBuilder::new();
        let x = builder.placeholder(desc(&[2, 2]));
        let doubled = builder.binary_scalar(OpKind::Mul, x, ScalarValue::Float(2.0));
        let graph = builder.output(vec![doubled]);
        let lines = graph.render_lines();
        assert_eq!(lines[1], "%1 = mul(%0, 2)");
        assert_eq!(lines.last().unwrap(), "%2 = output(%1)");
    }
}
