//! CREPE pitch-estimation model with a GPU export pipeline.
//!
//! This crate implements the CREPE convolutional pitch estimator in Rust,
//! providing:
//! - The six-block convolutional network over 1024-sample audio frames,
//!   at five capacity tiers
//! - Checkpoint normalization from wrapped training checkpoints into a
//!   canonical safetensors weight file
//! - An export pipeline that traces the model, optimizes the resulting
//!   graph, detaches parameters, and compiles for a GPU-compute target
//!
//! # Example
//!
//! ```no_run
//! use crepe_model_rs::{CrepeConfig, CrepeNet, ModelCapacity};
//! use candle_core::Device;
//!
//! let config = CrepeConfig::new(ModelCapacity::Tiny);
//! let model = CrepeNet::new(&config, &Device::Cpu).unwrap();
//! ```
//!
//! # Export
//!
//! ```no_run
//! use crepe_model_rs::{CrepeConfig, CrepeNet, ExportConfig, ExportPipeline};
//! use candle_core::Device;
//!
//! let config = ExportConfig::default();
//! let model_config = CrepeConfig::new(config.capacity);
//! let model = CrepeNet::new(&model_config, &Device::Cpu).unwrap();
//!
//! let pipeline = ExportPipeline::new(config).unwrap();
//! let artifacts = pipeline.run(&model).unwrap();
//! println!("compiled graph at {}", artifacts.graph_path.display());
//! ```

pub mod checkpoint;
pub mod compile;
pub mod config;
pub mod error;
pub mod export;
pub mod graph;
pub mod model;
pub mod optimize;
pub mod trace;

pub use compile::{CompiledGraph, Target};
pub use config::{CrepeConfig, ExportConfig, ModelCapacity};
pub use error::{CrepeError, CrepeResult};
pub use export::{ExportArtifacts, ExportPipeline};
pub use graph::{Graph, GraphOp};
pub use model::CrepeNet;
pub use trace::TracedModule;
