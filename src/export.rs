//! End-to-end export pipeline.
//!
//! Runs the fixed stage order: trace, graph conversion, optimization,
//! parameter detachment, target compilation, serialization. The result is
//! two artifacts: an opaque compiled-graph binary and a separate parameter
//! file keyed by the canonical placeholder names.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use candle_core::Tensor;
use tracing::info;

use crate::compile::{compile, Target};
use crate::config::ExportConfig;
use crate::error::CrepeResult;
use crate::model::CrepeNet;
use crate::optimize::optimize;
use crate::trace::{trace_model, InputSpec, TracedModule};

/// Paths of the two artifacts an export run produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifacts {
    pub graph_path: PathBuf,
    pub params_path: PathBuf,
}

/// One configured export run.
#[derive(Debug)]
pub struct ExportPipeline {
    config: ExportConfig,
    target: Target,
}

impl ExportPipeline {
    /// Validate the configuration up front so a bad target or optimization
    /// level fails before any pipeline stage runs.
    pub fn new(config: ExportConfig) -> CrepeResult<Self> {
        config.validate()?;
        let target = Target::from_str(&config.target)?;
        Ok(Self { config, target })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Export a model in the configured form.
    ///
    /// The output directory is created before compilation starts, so a
    /// filesystem failure surfaces before any expensive work.
    pub fn run(&self, model: &CrepeNet) -> CrepeResult<ExportArtifacts> {
        let out_dir = PathBuf::from(&self.config.output_dir);
        std::fs::create_dir_all(&out_dir)?;

        info!(capacity = %model.config().capacity, "tracing model");
        let trace = trace_model(model, &InputSpec::default())?;

        info!(steps = trace.steps.len(), "converting trace to graph");
        let mut module = TracedModule::from_trace(trace)?;

        optimize(&mut module.graph)?;
        info!(nodes = module.graph.nodes.len(), "optimized graph");

        let (graph, params) = module.detach_params()?;
        info!(params = params.len(), "detached parameters");

        let compiled = compile(&graph, self.target, self.config.opt_level)?;
        info!(
            target = %self.target,
            opt_level = self.config.opt_level,
            kernels = compiled.kernels.len(),
            "compiled graph"
        );

        let artifacts = self.write_artifacts(&compiled.to_bytes()?, &params, &out_dir)?;
        info!(
            graph = %artifacts.graph_path.display(),
            params = %artifacts.params_path.display(),
            "export complete"
        );
        Ok(artifacts)
    }

    fn write_artifacts(
        &self,
        graph_bytes: &[u8],
        params: &HashMap<String, Tensor>,
        out_dir: &std::path::Path,
    ) -> CrepeResult<ExportArtifacts> {
        let graph_path = out_dir.join(&self.config.graph_filename);
        let params_path = out_dir.join(&self.config.params_filename);

        std::fs::write(&graph_path, graph_bytes)?;
        candle_core::safetensors::save(params, &params_path)?;

        Ok(ExportArtifacts {
            graph_path,
            params_path,
        })
    }
}
