//! Symbolic tracing of the forward transform.
//!
//! The architecture contains no data-dependent control flow, so tracing is
//! a lossless symbolic execution: each op is recorded with its propagated
//! output shape and its concrete parameter bindings, then wired into the
//! graph IR with the input tagged by shape and element type.

use std::collections::{HashMap, HashSet};

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::config::{BN_EPS, DROPOUT_RATE, FRAME_LEN};
use crate::error::{CrepeError, CrepeResult};
use crate::graph::{Graph, GraphOp, ParamSpec};
use crate::model::CrepeNet;

/// Shape and element type of the traced input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub shape: (usize, usize),
    pub dtype: DType,
}

impl Default for InputSpec {
    fn default() -> Self {
        Self {
            shape: (1, FRAME_LEN),
            dtype: DType::F32,
        }
    }
}

fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::U8 => "u8",
        DType::U32 => "u32",
        DType::I64 => "i64",
        DType::BF16 => "bf16",
        DType::F16 => "f16",
        DType::F32 => "f32",
        DType::F64 => "f64",
    }
}

/// One recorded op with its propagated output shape.
#[derive(Debug, Clone)]
pub struct TraceStep {
    pub op: GraphOp,
    pub output_shape: Vec<usize>,
}

/// A complete recording of one symbolic forward execution.
#[derive(Debug, Clone)]
pub struct Trace {
    pub input: InputSpec,
    pub steps: Vec<TraceStep>,
    /// Concrete tensors for every parameter placeholder the steps name.
    pub bindings: HashMap<String, Tensor>,
}

/// Symbolically execute the model's forward transform once.
///
/// The model must be in inference mode: dropout layers in training mode
/// would make the traced graph non-deterministic, so this is enforced here
/// rather than left to the caller.
pub fn trace_model(model: &CrepeNet, input: &InputSpec) -> CrepeResult<Trace> {
    if model.is_training() {
        return Err(CrepeError::compile(
            "cannot trace a model in training mode; call train(false) first",
        ));
    }
    let (batch, len) = input.shape;
    if len != FRAME_LEN {
        return Err(CrepeError::shape_mismatch(
            "input",
            &[batch, FRAME_LEN],
            &[batch, len],
        ));
    }

    let config = *model.config();
    let mut steps = Vec::new();

    // (batch, 1024) -> (batch, 1, 1024, 1)
    let mut shape = vec![batch, 1, len, 1];
    steps.push(TraceStep {
        op: GraphOp::Reshape {
            shape: shape.clone(),
        },
        output_shape: shape.clone(),
    });

    for (i, spec) in config.block_specs().iter().enumerate() {
        let conv = format!("conv_blocks.{}", 5 * i);
        let bn = format!("conv_blocks.{}", 5 * i + 1);

        let h = shape[2];
        let out_h = (h + 2 * spec.padding.0 - spec.kernel_height) / spec.stride.0 + 1;
        shape = vec![batch, spec.out_channels, out_h, 1];
        steps.push(TraceStep {
            op: GraphOp::Conv2d {
                weight: format!("{conv}.weight"),
                bias: format!("{conv}.bias"),
                stride: spec.stride,
                padding: spec.padding,
                fused_activation: None,
            },
            output_shape: shape.clone(),
        });

        steps.push(TraceStep {
            op: GraphOp::BatchNorm {
                weight: format!("{bn}.weight"),
                bias: format!("{bn}.bias"),
                running_mean: format!("{bn}.running_mean"),
                running_var: format!("{bn}.running_var"),
                eps: BN_EPS,
                fused_activation: None,
            },
            output_shape: shape.clone(),
        });

        steps.push(TraceStep {
            op: GraphOp::Relu,
            output_shape: shape.clone(),
        });

        shape = vec![batch, spec.out_channels, shape[2] / 2, 1];
        steps.push(TraceStep {
            op: GraphOp::MaxPool2d { kernel: (2, 1) },
            output_shape: shape.clone(),
        });

        steps.push(TraceStep {
            op: GraphOp::Dropout { rate: DROPOUT_RATE },
            output_shape: shape.clone(),
        });
    }

    // (batch, C, H, W) -> (batch, W, C, H)
    shape = vec![shape[0], shape[3], shape[1], shape[2]];
    steps.push(TraceStep {
        op: GraphOp::Permute {
            dims: vec![0, 3, 1, 2],
        },
        output_shape: shape.clone(),
    });

    let flat = shape[1] * shape[2] * shape[3];
    shape = vec![batch, flat];
    steps.push(TraceStep {
        op: GraphOp::Flatten { start_dim: 1 },
        output_shape: shape.clone(),
    });

    shape = vec![batch, crate::config::PITCH_BINS];
    steps.push(TraceStep {
        op: GraphOp::Linear {
            weight: "fc.weight".to_string(),
            bias: "fc.bias".to_string(),
            fused_activation: None,
        },
        output_shape: shape.clone(),
    });

    steps.push(TraceStep {
        op: GraphOp::Sigmoid,
        output_shape: shape,
    });

    let bindings = model.state_dict()?;
    debug!(
        steps = steps.len(),
        params = bindings.len(),
        "traced forward transform"
    );

    Ok(Trace {
        input: *input,
        steps,
        bindings,
    })
}

/// A graph together with concrete tensors for its placeholders.
#[derive(Debug, Clone)]
pub struct TracedModule {
    pub graph: Graph,
    pub bindings: HashMap<String, Tensor>,
}

impl TracedModule {
    /// Convert a trace into the graph IR, tagging the input node with its
    /// declared shape and element type.
    pub fn from_trace(trace: Trace) -> CrepeResult<Self> {
        let (batch, len) = trace.input.shape;
        let mut graph = Graph::new(vec![batch, len], dtype_name(trace.input.dtype));

        let mut prev = 0usize;
        for step in &trace.steps {
            for name in step.op.param_names() {
                let tensor = trace
                    .bindings
                    .get(name)
                    .ok_or_else(|| CrepeError::MissingParam(name.to_string()))?;
                if !graph.placeholders.iter().any(|p| p.name == name) {
                    graph.placeholders.push(ParamSpec {
                        name: name.to_string(),
                        shape: tensor.dims().to_vec(),
                        dtype: dtype_name(tensor.dtype()).to_string(),
                    });
                }
            }
            prev = graph.add_node(step.op.clone(), vec![prev], step.output_shape.clone());
        }

        Ok(Self {
            graph,
            bindings: trace.bindings,
        })
    }

    /// Split into a parameter-free graph and the placeholder-name-to-tensor
    /// mapping. Placeholder names and binding names must match exactly.
    pub fn detach_params(self) -> CrepeResult<(Graph, HashMap<String, Tensor>)> {
        let referenced: HashSet<String> = self.graph.param_names().into_iter().collect();
        for name in &referenced {
            if !self.bindings.contains_key(name) {
                return Err(CrepeError::MissingParam(name.clone()));
            }
        }
        for name in self.bindings.keys() {
            if !referenced.contains(name) {
                return Err(CrepeError::UnexpectedParam(name.clone()));
            }
        }
        Ok((self.graph, self.bindings))
    }
}
