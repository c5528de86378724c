//! Target compilation and artifact encoding.
//!
//! Lowers a parameter-free graph into a per-node kernel program for a named
//! GPU-compute backend and encodes it as an opaque binary. Parameters are
//! never embedded: kernels reference placeholder names that are bound from
//! the parameter artifact at load time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CrepeError, CrepeResult};
use crate::graph::{Graph, GraphOp, ParamSpec};

/// Artifact header; rejects files that are not compiled graphs.
const ARTIFACT_MAGIC: [u8; 4] = *b"CRPE";

/// Artifact format version.
const ARTIFACT_VERSION: u32 = 1;

/// Recognized GPU-compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    WebGpu,
    Vulkan,
    Metal,
    Cuda,
}

impl Target {
    pub const ALL: [Target; 4] = [Target::WebGpu, Target::Vulkan, Target::Metal, Target::Cuda];

    pub fn name(self) -> &'static str {
        match self {
            Target::WebGpu => "webgpu",
            Target::Vulkan => "vulkan",
            Target::Metal => "metal",
            Target::Cuda => "cuda",
        }
    }

    /// Preferred workgroup width for this backend.
    fn workgroup_size(self) -> usize {
        match self {
            Target::WebGpu | Target::Vulkan => 256,
            Target::Metal => 512,
            Target::Cuda => 1024,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Target {
    type Err = CrepeError;

    fn from_str(s: &str) -> CrepeResult<Self> {
        match s {
            "webgpu" => Ok(Target::WebGpu),
            "vulkan" => Ok(Target::Vulkan),
            "metal" => Ok(Target::Metal),
            "cuda" => Ok(Target::Cuda),
            other => Err(CrepeError::UnknownTarget(other.to_string())),
        }
    }
}

/// One lowered kernel dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    /// Kernel entry point, e.g. "batch_norm_relu".
    pub name: String,
    /// Graph node this kernel was lowered from.
    pub node_id: usize,
    /// Parameter placeholders bound at load time, in binding order.
    pub params: Vec<String>,
    /// Dispatch grid (x, y, z).
    pub dispatch: [usize; 3],
    /// Output element count.
    pub output_len: usize,
}

/// A compiled, parameter-free graph for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledGraph {
    pub version: u32,
    pub target: Target,
    pub opt_level: u8,
    pub input_shape: Vec<usize>,
    pub input_dtype: String,
    pub output_shape: Vec<usize>,
    pub kernels: Vec<Kernel>,
    /// Placeholder table the parameter artifact must satisfy exactly.
    pub params: Vec<ParamSpec>,
}

impl CompiledGraph {
    /// Encode into the opaque artifact binary.
    pub fn to_bytes(&self) -> CrepeResult<Vec<u8>> {
        let payload =
            bincode::serialize(self).map_err(|e| CrepeError::compile(e.to_string()))?;
        let mut bytes = Vec::with_capacity(ARTIFACT_MAGIC.len() + payload.len());
        bytes.extend_from_slice(&ARTIFACT_MAGIC);
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode an artifact binary.
    pub fn from_bytes(bytes: &[u8]) -> CrepeResult<Self> {
        let payload = bytes
            .strip_prefix(&ARTIFACT_MAGIC)
            .ok_or_else(|| CrepeError::compile("not a compiled-graph artifact"))?;
        let compiled: Self =
            bincode::deserialize(payload).map_err(|e| CrepeError::compile(e.to_string()))?;
        if compiled.version != ARTIFACT_VERSION {
            return Err(CrepeError::compile(format!(
                "unsupported artifact version {}",
                compiled.version
            )));
        }
        Ok(compiled)
    }
}

/// Compile a parameter-free graph for a target at the given optimization
/// level (0 through 3, highest = most aggressive).
pub fn compile(graph: &Graph, target: Target, opt_level: u8) -> CrepeResult<CompiledGraph> {
    if opt_level > 3 {
        return Err(CrepeError::compile(format!(
            "opt_level must be 0..=3, got {opt_level}"
        )));
    }

    let mut kernels = Vec::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        if matches!(node.op, GraphOp::Input { .. }) {
            continue;
        }
        let output_len: usize = node.output_shape.iter().product();
        // Below level 2 the lowering stays naive: one thread per element.
        let dispatch = if opt_level >= 2 {
            [output_len.div_ceil(target.workgroup_size()), 1, 1]
        } else {
            [output_len, 1, 1]
        };
        kernels.push(Kernel {
            name: node.op.kernel_name(),
            node_id: node.id,
            params: node.op.param_names().iter().map(|s| s.to_string()).collect(),
            dispatch,
            output_len,
        });
    }

    debug!(
        target = %target,
        opt_level,
        kernels = kernels.len(),
        "compiled graph"
    );

    Ok(CompiledGraph {
        version: ARTIFACT_VERSION,
        target,
        opt_level,
        input_shape: graph.input_shape.clone(),
        input_dtype: graph.input_dtype.clone(),
        output_shape: graph.output_shape().to_vec(),
        kernels,
        params: graph.placeholders.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrepeConfig, ModelCapacity};
    use crate::model::CrepeNet;
    use crate::optimize::optimize;
    use crate::trace::{trace_model, InputSpec, TracedModule};
    use candle_core::Device;

    fn optimized_tiny_graph() -> Graph {
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let model = CrepeNet::new(&config, &Device::Cpu).unwrap();
        let trace = trace_model(&model, &InputSpec::default()).unwrap();
        let mut graph = TracedModule::from_trace(trace).unwrap().graph;
        optimize(&mut graph).unwrap();
        graph
    }

    #[test]
    fn test_target_parse() {
        for target in Target::ALL {
            assert_eq!(target.name().parse::<Target>().unwrap(), target);
        }
        match "tpu".parse::<Target>().unwrap_err() {
            CrepeError::UnknownTarget(name) => assert_eq!(name, "tpu"),
            other => panic!("expected UnknownTarget, got {other:?}"),
        }
    }

    #[test]
    fn test_compile_kernel_layout() {
        let graph = optimized_tiny_graph();
        let compiled = compile(&graph, Target::WebGpu, 3).unwrap();

        // One kernel per non-input node.
        assert_eq!(compiled.kernels.len(), graph.nodes.len() - 1);
        assert_eq!(compiled.output_shape, vec![1, 360]);
        assert_eq!(compiled.params.len(), 38);

        let names: Vec<&str> = compiled.kernels.iter().map(|k| k.name.as_str()).collect();
        assert!(names.contains(&"conv2d"));
        assert!(names.contains(&"batch_norm_relu"));
        assert!(names.contains(&"linear_sigmoid"));
        assert!(!names.contains(&"dropout"));
    }

    #[test]
    fn test_compile_rejects_bad_opt_level() {
        let graph = optimized_tiny_graph();
        assert!(matches!(
            compile(&graph, Target::WebGpu, 4).unwrap_err(),
            CrepeError::Compile(_)
        ));
    }

    #[test]
    fn test_dispatch_scales_with_opt_level() {
        let graph = optimized_tiny_graph();
        let naive = compile(&graph, Target::WebGpu, 0).unwrap();
        let tiled = compile(&graph, Target::WebGpu, 3).unwrap();

        let k0 = &naive.kernels[0];
        let k3 = &tiled.kernels[0];
        assert_eq!(k0.dispatch[0], k0.output_len);
        assert_eq!(k3.dispatch[0], k3.output_len.div_ceil(256));
    }

    #[test]
    fn test_artifact_bytes_roundtrip() {
        let graph = optimized_tiny_graph();
        let compiled = compile(&graph, Target::Metal, 3).unwrap();

        let bytes = compiled.to_bytes().unwrap();
        let restored = CompiledGraph::from_bytes(&bytes).unwrap();
        assert_eq!(restored, compiled);
    }

    #[test]
    fn test_artifact_encoding_is_deterministic() {
        let graph = optimized_tiny_graph();
        let a = compile(&graph, Target::WebGpu, 3).unwrap().to_bytes().unwrap();
        let b = compile(&graph, Target::WebGpu, 3).unwrap().to_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(CompiledGraph::from_bytes(b"not an artifact").is_err());
    }
}
