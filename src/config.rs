//! Model and export-pipeline configuration.
//!
//! The architecture is fully determined by a capacity tier: a fixed base
//! filter table scaled by the tier's multiplier, fixed kernel heights and
//! strides, and a final 360-bin projection. All tables here are constants;
//! nothing is derived at runtime beyond the multiplication.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CrepeError, CrepeResult};

/// Base filter counts per block, scaled by the capacity multiplier.
pub const FILTER_BASE: [usize; 6] = [32, 4, 4, 4, 8, 16];

/// Convolution kernel heights per block.
pub const KERNEL_HEIGHTS: [usize; 6] = [512, 64, 64, 64, 64, 64];

/// Convolution strides (height, width) per block.
pub const STRIDES: [(usize, usize); 6] = [(4, 1), (1, 1), (1, 1), (1, 1), (1, 1), (1, 1)];

/// Expected input frame length.
pub const FRAME_LEN: usize = 1024;

/// Number of output pitch bins.
pub const PITCH_BINS: usize = 360;

/// Dropout rate inside each block (training mode only).
pub const DROPOUT_RATE: f32 = 0.25;

/// Batch-norm epsilon.
pub const BN_EPS: f64 = 1e-5;

/// Capacity tier of the model. Determines every layer's channel width.
///
/// This is a closed enumeration: any tier name outside the five recognized
/// values is a configuration error, never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCapacity {
    Tiny,
    Small,
    Medium,
    Large,
    Full,
}

impl ModelCapacity {
    /// All recognized tiers, in increasing capacity order.
    pub const ALL: [ModelCapacity; 5] = [
        ModelCapacity::Tiny,
        ModelCapacity::Small,
        ModelCapacity::Medium,
        ModelCapacity::Large,
        ModelCapacity::Full,
    ];

    /// Channel-width multiplier for this tier.
    pub fn multiplier(self) -> usize {
        match self {
            ModelCapacity::Tiny => 4,
            ModelCapacity::Small => 8,
            ModelCapacity::Medium => 16,
            ModelCapacity::Large => 24,
            ModelCapacity::Full => 32,
        }
    }

    /// Tier name as used in configuration files and CLI flags.
    pub fn name(self) -> &'static str {
        match self {
            ModelCapacity::Tiny => "tiny",
            ModelCapacity::Small => "small",
            ModelCapacity::Medium => "medium",
            ModelCapacity::Large => "large",
            ModelCapacity::Full => "full",
        }
    }
}

impl fmt::Display for ModelCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelCapacity {
    type Err = CrepeError;

    fn from_str(s: &str) -> CrepeResult<Self> {
        match s {
            "tiny" => Ok(ModelCapacity::Tiny),
            "small" => Ok(ModelCapacity::Small),
            "medium" => Ok(ModelCapacity::Medium),
            "large" => Ok(ModelCapacity::Large),
            "full" => Ok(ModelCapacity::Full),
            other => Err(CrepeError::InvalidCapacity(other.to_string())),
        }
    }
}

/// Shape of one convolutional block, derived from the capacity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_height: usize,
    /// (height, width) stride. The width dimension is a singleton throughout.
    pub stride: (usize, usize),
    /// (height, width) zero padding; height padding is `kernel_height / 2`.
    pub padding: (usize, usize),
}

/// Architecture configuration for [`CrepeNet`](crate::model::CrepeNet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrepeConfig {
    pub capacity: ModelCapacity,
}

impl Default for CrepeConfig {
    fn default() -> Self {
        Self::new(ModelCapacity::Tiny)
    }
}

impl CrepeConfig {
    pub fn new(capacity: ModelCapacity) -> Self {
        Self { capacity }
    }

    /// Filter counts per block: base table times the capacity multiplier.
    pub fn filters(&self) -> [usize; 6] {
        let m = self.capacity.multiplier();
        let mut out = [0usize; 6];
        for (o, base) in out.iter_mut().zip(FILTER_BASE.iter()) {
            *o = base * m;
        }
        out
    }

    /// The six block specs, channel-chained: each block's output channel
    /// count is the next block's input channel count.
    pub fn block_specs(&self) -> Vec<BlockSpec> {
        let filters = self.filters();
        let mut specs = Vec::with_capacity(6);
        let mut in_channels = 1;
        for i in 0..6 {
            let k = KERNEL_HEIGHTS[i];
            specs.push(BlockSpec {
                in_channels,
                out_channels: filters[i],
                kernel_height: k,
                stride: STRIDES[i],
                padding: (k / 2, 0),
            });
            in_channels = filters[i];
        }
        specs
    }

    /// Input width of the final linear layer.
    ///
    /// The permute-then-flatten order in the forward transform leaves a
    /// feature map of `filters[5]` channels at a spatial height of 4, so
    /// the flattened vector is `filters[5] * 4` wide.
    pub fn fc_in_features(&self) -> usize {
        self.filters()[5] * 4
    }

    /// The full ordered canonical parameter table: name and expected shape
    /// for every learnable parameter and batch-norm running statistic.
    ///
    /// Names follow the sequential layout of the training framework: block
    /// `i` holds its convolution at index `5i` and its batch norm at
    /// `5i + 1`, then `fc.weight` / `fc.bias`.
    pub fn param_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::with_capacity(6 * 6 + 2);
        for (i, spec) in self.block_specs().iter().enumerate() {
            let conv = format!("conv_blocks.{}", 5 * i);
            let bn = format!("conv_blocks.{}", 5 * i + 1);
            let f = spec.out_channels;
            shapes.push((
                format!("{conv}.weight"),
                vec![f, spec.in_channels, spec.kernel_height, 1],
            ));
            shapes.push((format!("{conv}.bias"), vec![f]));
            shapes.push((format!("{bn}.weight"), vec![f]));
            shapes.push((format!("{bn}.bias"), vec![f]));
            shapes.push((format!("{bn}.running_mean"), vec![f]));
            shapes.push((format!("{bn}.running_var"), vec![f]));
        }
        shapes.push((
            "fc.weight".to_string(),
            vec![PITCH_BINS, self.fc_in_features()],
        ));
        shapes.push(("fc.bias".to_string(), vec![PITCH_BINS]));
        shapes
    }
}

/// Settings for one export run, loadable from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Capacity tier of the checkpoint being exported.
    pub capacity: ModelCapacity,
    /// Hardware target identifier (e.g. "webgpu").
    pub target: String,
    /// Backend optimization aggressiveness, 0 through 3 (highest).
    pub opt_level: u8,
    /// Directory holding the raw checkpoint and canonical weight file.
    pub trained_model_dir: String,
    /// Canonical weight file name inside `trained_model_dir`.
    pub weights_filename: String,
    /// Directory the artifacts are written to (created if absent).
    pub output_dir: String,
    /// Compiled-graph artifact file name.
    pub graph_filename: String,
    /// Parameter artifact file name.
    pub params_filename: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            capacity: ModelCapacity::Tiny,
            target: "webgpu".to_string(),
            opt_level: 3,
            trained_model_dir: "assets/trained_model".to_string(),
            weights_filename: "last.safetensors".to_string(),
            output_dir: "assets/export".to_string(),
            graph_filename: "model.bin".to_string(),
            params_filename: "params.safetensors".to_string(),
        }
    }
}

impl ExportConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CrepeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> CrepeResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate target and optimization level before any pipeline work.
    pub fn validate(&self) -> CrepeResult<()> {
        crate::compile::Target::from_str(&self.target)?;
        if self.opt_level > 3 {
            return Err(CrepeError::config(format!(
                "opt_level must be 0..=3, got {}",
                self.opt_level
            )));
        }
        if self.graph_filename.is_empty() || self.params_filename.is_empty() {
            return Err(CrepeError::config("artifact file names must not be empty"));
        }
        Ok(())
    }

    /// Path of the canonical weight file.
    pub fn weights_path(&self) -> std::path::PathBuf {
        Path::new(&self.trained_model_dir).join(&self.weights_filename)
    }
}
