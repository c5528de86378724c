//! Target-independent computation-graph representation.
//!
//! Nodes reference parameters by placeholder name only; concrete tensors
//! live in a [`TracedModule`](crate::trace::TracedModule) until parameter
//! detachment. The graph itself is plain data and serializes with serde.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{CrepeError, CrepeResult};

/// Element-wise activation that can be fused into a producing op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Sigmoid,
}

/// An operation in the computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphOp {
    /// The single graph input, tagged with its element type.
    Input { dtype: String },
    Reshape {
        shape: Vec<usize>,
    },
    Conv2d {
        weight: String,
        bias: String,
        stride: (usize, usize),
        padding: (usize, usize),
        fused_activation: Option<Activation>,
    },
    BatchNorm {
        weight: String,
        bias: String,
        running_mean: String,
        running_var: String,
        eps: f64,
        fused_activation: Option<Activation>,
    },
    Relu,
    MaxPool2d {
        kernel: (usize, usize),
    },
    /// Identity at inference time; recorded by the tracer, removed by the
    /// optimizer.
    Dropout {
        rate: f32,
    },
    Permute {
        dims: Vec<usize>,
    },
    Flatten {
        start_dim: usize,
    },
    Linear {
        weight: String,
        bias: String,
        fused_activation: Option<Activation>,
    },
    Sigmoid,
}

impl GraphOp {
    /// Parameter placeholder names referenced by this op, in order.
    pub fn param_names(&self) -> Vec<&str> {
        match self {
            GraphOp::Conv2d { weight, bias, .. } | GraphOp::Linear { weight, bias, .. } => {
                vec![weight, bias]
            }
            GraphOp::BatchNorm {
                weight,
                bias,
                running_mean,
                running_var,
                ..
            } => vec![weight, bias, running_mean, running_var],
            _ => Vec::new(),
        }
    }

    /// Kernel name this op lowers to, including any fused activation.
    pub fn kernel_name(&self) -> String {
        let (base, fused) = match self {
            GraphOp::Input { .. } => ("input", None),
            GraphOp::Reshape { .. } => ("reshape", None),
            GraphOp::Conv2d {
                fused_activation, ..
            } => ("conv2d", *fused_activation),
            GraphOp::BatchNorm {
                fused_activation, ..
            } => ("batch_norm", *fused_activation),
            GraphOp::Relu => ("relu", None),
            GraphOp::MaxPool2d { .. } => ("max_pool2d", None),
            GraphOp::Dropout { .. } => ("dropout", None),
            GraphOp::Permute { .. } => ("permute", None),
            GraphOp::Flatten { .. } => ("flatten", None),
            GraphOp::Linear {
                fused_activation, ..
            } => ("linear", *fused_activation),
            GraphOp::Sigmoid => ("sigmoid", None),
        };
        match fused {
            Some(Activation::Relu) => format!("{base}_relu"),
            Some(Activation::Sigmoid) => format!("{base}_sigmoid"),
            None => base.to_string(),
        }
    }

    /// Whether this op is the identity in inference mode.
    pub fn is_inference_identity(&self) -> bool {
        matches!(self, GraphOp::Dropout { .. })
    }
}

/// Shape and element type of a named parameter placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// A node in the computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Unique node ID; nodes are stored in topological order.
    pub id: usize,
    pub op: GraphOp,
    /// Input node IDs.
    pub inputs: Vec<usize>,
    pub output_shape: Vec<usize>,
}

/// A static computation graph with a single tagged input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub input_shape: Vec<usize>,
    pub input_dtype: String,
    /// Ordered parameter placeholder table, by first appearance.
    pub placeholders: Vec<ParamSpec>,
}

impl Graph {
    /// Create a graph holding only its input node.
    pub fn new(input_shape: Vec<usize>, input_dtype: impl Into<String>) -> Self {
        let input_dtype = input_dtype.into();
        let input = GraphNode {
            id: 0,
            op: GraphOp::Input {
                dtype: input_dtype.clone(),
            },
            inputs: Vec::new(),
            output_shape: input_shape.clone(),
        };
        Self {
            nodes: vec![input],
            input_shape,
            input_dtype,
            placeholders: Vec::new(),
        }
    }

    /// Add a node and return its ID.
    pub fn add_node(&mut self, op: GraphOp, inputs: Vec<usize>, output_shape: Vec<usize>) -> usize {
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            id,
            op,
            inputs,
            output_shape,
        });
        id
    }

    /// Output shape of the last node.
    pub fn output_shape(&self) -> &[usize] {
        self.nodes
            .last()
            .map(|n| n.output_shape.as_slice())
            .unwrap_or(&[])
    }

    /// All parameter placeholder names referenced by ops, in appearance
    /// order, deduplicated.
    pub fn param_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for node in &self.nodes {
            for name in node.op.param_names() {
                if seen.insert(name.to_string()) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    /// How many nodes consume each node's output.
    pub fn consumer_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for &input in &node.inputs {
                counts[input] += 1;
            }
        }
        counts
    }

    /// Remove the given single-input nodes, rewiring their consumers to the
    /// removed nodes' inputs. IDs are reassigned to stay dense.
    pub fn remove_nodes(&mut self, removed: &HashSet<usize>) -> CrepeResult<()> {
        let n = self.nodes.len();
        // old id -> surviving old id that provides its value
        let mut alias = vec![0usize; n];
        // surviving old id -> new id
        let mut remap = vec![usize::MAX; n];
        let mut new_nodes = Vec::with_capacity(n.saturating_sub(removed.len()));

        for node in &self.nodes {
            if removed.contains(&node.id) {
                let src = *node.inputs.first().ok_or_else(|| {
                    CrepeError::compile("cannot remove a node with no inputs")
                })?;
                alias[node.id] = alias[src];
            } else {
                alias[node.id] = node.id;
                let new_id = new_nodes.len();
                remap[node.id] = new_id;
                let inputs = node.inputs.iter().map(|&i| remap[alias[i]]).collect();
                new_nodes.push(GraphNode {
                    id: new_id,
                    op: node.op.clone(),
                    inputs,
                    output_shape: node.output_shape.clone(),
                });
            }
        }

        self.nodes = new_nodes;
        Ok(())
    }
}
