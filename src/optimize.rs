//! Graph optimization passes.
//!
//! The pipeline applies a fixed, ordered list of passes. Passes rewrite the
//! graph only: they never rename, fold, or drop parameter placeholders, so
//! the placeholder set is invariant across optimization and stays in exact
//! correspondence with the detached parameter mapping.

use std::collections::HashSet;

use tracing::debug;

use crate::error::CrepeResult;
use crate::graph::{Activation, Graph, GraphOp};

/// A single named graph rewrite.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph) -> CrepeResult<()>;
}

/// Removes ops that are the identity at inference time (dropout).
pub struct EliminateIdentity;

impl Pass for EliminateIdentity {
    fn name(&self) -> &'static str {
        "eliminate-identity"
    }

    fn run(&self, graph: &mut Graph) -> CrepeResult<()> {
        let removed: HashSet<usize> = graph
            .nodes
            .iter()
            .filter(|n| n.op.is_inference_identity())
            .map(|n| n.id)
            .collect();
        if !removed.is_empty() {
            debug!(count = removed.len(), "eliminating identity nodes");
            graph.remove_nodes(&removed)?;
        }
        Ok(())
    }
}

/// Folds element-wise activations into their producing op when the producer
/// has a single consumer and no activation fused yet.
pub struct FuseActivations;

impl Pass for FuseActivations {
    fn name(&self) -> &'static str {
        "fuse-activations"
    }

    fn run(&self, graph: &mut Graph) -> CrepeResult<()> {
        let consumers = graph.consumer_counts();
        let mut removed = HashSet::new();

        for id in 0..graph.nodes.len() {
            let activation = match graph.nodes[id].op {
                GraphOp::Relu => Activation::Relu,
                GraphOp::Sigmoid => Activation::Sigmoid,
                _ => continue,
            };
            let producer = match graph.nodes[id].inputs.as_slice() {
                [single] => *single,
                _ => continue,
            };
            if consumers[producer] != 1 {
                continue;
            }
            let slot = match &mut graph.nodes[producer].op {
                GraphOp::Conv2d {
                    fused_activation, ..
                }
                | GraphOp::BatchNorm {
                    fused_activation, ..
                }
                | GraphOp::Linear {
                    fused_activation, ..
                } => fused_activation,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(activation);
                removed.insert(id);
            }
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "fusing activations");
            graph.remove_nodes(&removed)?;
        }
        Ok(())
    }
}

/// Normalizes shape-only ops: rewrites `Flatten` into an explicit `Reshape`
/// (shapes are static after tracing) and merges consecutive reshapes.
pub struct NormalizeLayout;

impl Pass for NormalizeLayout {
    fn name(&self) -> &'static str {
        "normalize-layout"
    }

    fn run(&self, graph: &mut Graph) -> CrepeResult<()> {
        for node in &mut graph.nodes {
            if matches!(node.op, GraphOp::Flatten { .. }) {
                node.op = GraphOp::Reshape {
                    shape: node.output_shape.clone(),
                };
            }
        }

        // A reshape whose only purpose is to feed another reshape is dead.
        let consumers = graph.consumer_counts();
        let mut removed = HashSet::new();
        for node in &graph.nodes {
            if !matches!(node.op, GraphOp::Reshape { .. }) {
                continue;
            }
            if let [single] = node.inputs.as_slice() {
                if matches!(graph.nodes[*single].op, GraphOp::Reshape { .. })
                    && consumers[*single] == 1
                {
                    removed.insert(*single);
                }
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "merging consecutive reshapes");
            graph.remove_nodes(&removed)?;
        }
        Ok(())
    }
}

/// The fixed default pass pipeline, in application order.
pub fn default_pipeline() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(EliminateIdentity),
        Box::new(FuseActivations),
        Box::new(NormalizeLayout),
    ]
}

/// Apply the full default pipeline in order.
pub fn optimize(graph: &mut Graph) -> CrepeResult<()> {
    for pass in default_pipeline() {
        debug!(pass = pass.name(), "running optimization pass");
        pass.run(graph)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrepeConfig, ModelCapacity};
    use crate::model::CrepeNet;
    use crate::trace::{trace_model, InputSpec, TracedModule};
    use candle_core::Device;

    fn tiny_graph() -> Graph {
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let model = CrepeNet::new(&config, &Device::Cpu).unwrap();
        let trace = trace_model(&model, &InputSpec::default()).unwrap();
        TracedModule::from_trace(trace).unwrap().graph
    }

    #[test]
    fn test_optimize_removes_dropout_and_fuses_activations() {
        let mut graph = tiny_graph();
        let before = graph.nodes.len();
        optimize(&mut graph).unwrap();

        // 6 dropouts eliminated, 6 relus and 1 sigmoid fused.
        assert_eq!(graph.nodes.len(), before - 13);
        assert!(graph
            .nodes
            .iter()
            .all(|n| !matches!(n.op, GraphOp::Dropout { .. } | GraphOp::Relu | GraphOp::Sigmoid)));

        let fused_relu = graph
            .nodes
            .iter()
            .filter(|n| {
                matches!(
                    n.op,
                    GraphOp::BatchNorm {
                        fused_activation: Some(Activation::Relu),
                        ..
                    }
                )
            })
            .count();
        assert_eq!(fused_relu, 6);
        assert!(graph.nodes.iter().any(|n| matches!(
            n.op,
            GraphOp::Linear {
                fused_activation: Some(Activation::Sigmoid),
                ..
            }
        )));
    }

    #[test]
    fn test_optimize_preserves_placeholders_and_output() {
        let mut graph = tiny_graph();
        let placeholders = graph.placeholders.clone();
        let params = graph.param_names();
        let output = graph.output_shape().to_vec();

        optimize(&mut graph).unwrap();

        assert_eq!(graph.placeholders, placeholders);
        assert_eq!(graph.param_names(), params);
        assert_eq!(graph.output_shape(), output.as_slice());
    }

    #[test]
    fn test_normalize_layout_rewrites_flatten() {
        let mut graph = tiny_graph();
        optimize(&mut graph).unwrap();
        assert!(graph
            .nodes
            .iter()
            .all(|n| !matches!(n.op, GraphOp::Flatten { .. })));
    }

    #[test]
    fn test_consecutive_reshapes_merge() {
        let mut g = Graph::new(vec![1, 8], "f32");
        let a = g.add_node(GraphOp::Reshape { shape: vec![1, 2, 4] }, vec![0], vec![1, 2, 4]);
        g.add_node(GraphOp::Reshape { shape: vec![1, 8] }, vec![a], vec![1, 8]);

        NormalizeLayout.run(&mut g).unwrap();
        assert_eq!(g.nodes.len(), 2);
        assert_eq!(g.nodes[1].op, GraphOp::Reshape { shape: vec![1, 8] });
        assert_eq!(g.nodes[1].inputs, vec![0]);
    }

    #[test]
    fn test_fuse_skips_shared_producer() {
        // Two consumers of the same conv output: the relu must stay.
        let mut g = Graph::new(vec![1, 4], "f32");
        let conv = g.add_node(
            GraphOp::Linear {
                weight: "w".to_string(),
                bias: "b".to_string(),
                fused_activation: None,
            },
            vec![0],
            vec![1, 4],
        );
        g.add_node(GraphOp::Relu, vec![conv], vec![1, 4]);
        g.add_node(GraphOp::Sigmoid, vec![conv], vec![1, 4]);

        FuseActivations.run(&mut g).unwrap();
        assert_eq!(g.nodes.len(), 4);
    }
}
