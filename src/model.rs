//! CREPE pitch-estimation network.
//!
//! Six convolutional blocks over a single 1024-sample frame, followed by a
//! linear projection to 360 pitch bins with sigmoid activations. The forward
//! transform order is load-bearing: the feature map is permuted to
//! (batch, W, C, H) before flattening, which is what the linear layer's
//! input width assumes. A different flatten order still type-checks but
//! produces wrong predictions.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{batch_norm, BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder, VarMap};

use crate::config::{CrepeConfig, BN_EPS, DROPOUT_RATE, FRAME_LEN, PITCH_BINS};
use crate::error::{CrepeError, CrepeResult};

/// One block: conv -> batch norm -> ReLU -> 2x1 max pool -> dropout.
#[derive(Debug)]
pub struct ConvBlock {
    weight: Tensor,
    bias: Tensor,
    bn: BatchNorm,
    /// Height stride. The width dimension stays a singleton, so applying
    /// the same stride symmetrically is inert there.
    stride: usize,
    /// Height padding (`kernel_height / 2`); width padding is 0.
    padding: usize,
    dropout: Dropout,
}

impl ConvBlock {
    fn new(weight: Tensor, bias: Tensor, bn: BatchNorm, stride: usize, padding: usize) -> Self {
        Self {
            weight,
            bias,
            bn,
            stride,
            padding,
            dropout: Dropout::new(DROPOUT_RATE),
        }
    }

    /// Convolution weight, shape (out, in, kernel_height, 1).
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Convolution bias, shape (out,).
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn batch_norm(&self) -> &BatchNorm {
        &self.bn
    }

    /// Input: (batch, in_channels, height, 1).
    fn forward_t(&self, x: &Tensor, train: bool) -> CrepeResult<Tensor> {
        // Candle's conv2d pads both spatial dims symmetrically; only the
        // height dim may be padded here, so pad it by hand first.
        let x = x.pad_with_zeros(2, self.padding, self.padding)?;
        let x = x.conv2d(&self.weight, 0, self.stride, 1, 1)?;
        let x = x.broadcast_add(&self.bias.reshape((1, (), 1, 1))?)?;
        let x = self.bn.forward_t(&x, train)?;
        let x = x.relu()?;
        let x = x.max_pool2d((2, 1))?;
        Ok(self.dropout.forward(&x, train)?)
    }
}

/// The CREPE network.
#[derive(Debug)]
pub struct CrepeNet {
    blocks: Vec<ConvBlock>,
    fc: Linear,
    config: CrepeConfig,
    training: bool,
}

impl CrepeNet {
    /// Create a model with random initialization.
    pub fn new(config: &CrepeConfig, device: &Device) -> CrepeResult<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb)
    }

    /// Create a model whose variables come from a `VarBuilder`.
    pub fn from_varbuilder(config: &CrepeConfig, vb: VarBuilder) -> CrepeResult<Self> {
        let mut blocks = Vec::with_capacity(6);
        for (i, spec) in config.block_specs().iter().enumerate() {
            let conv_vb = vb.pp(format!("conv_blocks.{}", 5 * i));
            let weight = conv_vb.get_with_hints(
                (
                    spec.out_channels,
                    spec.in_channels,
                    spec.kernel_height,
                    1usize,
                ),
                "weight",
                candle_nn::init::DEFAULT_KAIMING_NORMAL,
            )?;
            let bias = conv_vb.get_with_hints(
                spec.out_channels,
                "bias",
                candle_nn::Init::Const(0.0),
            )?;
            let bn = batch_norm(
                spec.out_channels,
                BN_EPS,
                vb.pp(format!("conv_blocks.{}", 5 * i + 1)),
            )?;
            blocks.push(ConvBlock::new(
                weight,
                bias,
                bn,
                spec.stride.0,
                spec.padding.0,
            ));
        }

        let fc = candle_nn::linear(config.fc_in_features(), PITCH_BINS, vb.pp("fc"))?;

        Ok(Self {
            blocks,
            fc,
            config: *config,
            training: false,
        })
    }

    /// Create a model from an explicit canonical weight mapping.
    ///
    /// Every parameter named by [`CrepeConfig::param_shapes`] must be present
    /// with exactly the expected shape; a mismatch names the offending
    /// parameter. Extra keys are errors, except `.num_batches_tracked`
    /// bookkeeping scalars, which carry no inference semantics.
    ///
    /// The model is constructed in inference mode.
    pub fn from_weights(
        config: &CrepeConfig,
        weights: &HashMap<String, Tensor>,
    ) -> CrepeResult<Self> {
        let expected = config.param_shapes();
        for (name, shape) in &expected {
            let tensor = weights
                .get(name)
                .ok_or_else(|| CrepeError::MissingParam(name.clone()))?;
            if tensor.dims() != shape.as_slice() {
                return Err(CrepeError::shape_mismatch(name, shape, tensor.dims()));
            }
        }
        for name in weights.keys() {
            if name.ends_with(".num_batches_tracked") {
                continue;
            }
            if !expected.iter().any(|(n, _)| n == name) {
                return Err(CrepeError::UnexpectedParam(name.clone()));
            }
        }

        let get = |name: String| -> Tensor {
            // Presence was checked above.
            weights[&name].clone()
        };

        let mut blocks = Vec::with_capacity(6);
        for (i, spec) in config.block_specs().iter().enumerate() {
            let conv = format!("conv_blocks.{}", 5 * i);
            let bn_name = format!("conv_blocks.{}", 5 * i + 1);
            let bn = BatchNorm::new(
                spec.out_channels,
                get(format!("{bn_name}.running_mean")),
                get(format!("{bn_name}.running_var")),
                get(format!("{bn_name}.weight")),
                get(format!("{bn_name}.bias")),
                BN_EPS,
            )?;
            blocks.push(ConvBlock::new(
                get(format!("{conv}.weight")),
                get(format!("{conv}.bias")),
                bn,
                spec.stride.0,
                spec.padding.0,
            ));
        }

        let fc = Linear::new(get("fc.weight".to_string()), Some(get("fc.bias".to_string())));

        Ok(Self {
            blocks,
            fc,
            config: *config,
            training: false,
        })
    }

    pub fn config(&self) -> &CrepeConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[ConvBlock] {
        &self.blocks
    }

    /// Switch between training mode (dropout and batch-norm batch
    /// statistics active) and inference mode.
    pub fn train(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Forward transform in the model's current mode.
    ///
    /// Input: (batch, 1024). Output: (batch, 360), every value in [0, 1].
    pub fn forward(&self, input: &Tensor) -> CrepeResult<Tensor> {
        self.forward_t(input, self.training)
    }

    /// Forward transform with an explicit mode.
    pub fn forward_t(&self, input: &Tensor, train: bool) -> CrepeResult<Tensor> {
        let (batch, len) = input.dims2()?;
        if len != FRAME_LEN {
            return Err(CrepeError::shape_mismatch(
                "input",
                &[batch, FRAME_LEN],
                &[batch, len],
            ));
        }

        // (batch, 1024) -> (batch, 1 channel, 1024 height, 1 width)
        let mut x = input.reshape((batch, 1, FRAME_LEN, 1))?;
        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }

        // (batch, C, H, W) -> (batch, W, C, H), then flatten. The fc layer's
        // input width (filters[5] * 4) assumes exactly this axis order.
        let x = x.permute((0, 3, 1, 2))?;
        let x = x.flatten_from(1)?;

        let x = self.fc.forward(&x)?;
        Ok(candle_nn::ops::sigmoid(&x)?)
    }

    /// Canonical parameter mapping of the live model, keyed per
    /// [`CrepeConfig::param_shapes`].
    pub fn state_dict(&self) -> CrepeResult<HashMap<String, Tensor>> {
        let mut state = HashMap::with_capacity(6 * 6 + 2);
        for (i, block) in self.blocks.iter().enumerate() {
            let conv = format!("conv_blocks.{}", 5 * i);
            let bn_name = format!("conv_blocks.{}", 5 * i + 1);
            state.insert(format!("{conv}.weight"), block.weight.clone());
            state.insert(format!("{conv}.bias"), block.bias.clone());
            let (bn_weight, bn_bias) = block.bn.weight_and_bias().ok_or_else(|| {
                CrepeError::MissingParam(format!("{bn_name}.weight"))
            })?;
            state.insert(format!("{bn_name}.weight"), bn_weight.clone());
            state.insert(format!("{bn_name}.bias"), bn_bias.clone());
            state.insert(
                format!("{bn_name}.running_mean"),
                block.bn.running_mean().clone(),
            );
            state.insert(
                format!("{bn_name}.running_var"),
                block.bn.running_var().clone(),
            );
        }
        state.insert("fc.weight".to_string(), self.fc.weight().clone());
        let fc_bias = self
            .fc
            .bias()
            .ok_or_else(|| CrepeError::MissingParam("fc.bias".to_string()))?;
        state.insert("fc.bias".to_string(), fc_bias.clone());
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelCapacity;

    /// All-zero weight mapping matching the canonical table.
    pub(crate) fn zero_weights(config: &CrepeConfig) -> HashMap<String, Tensor> {
        config
            .param_shapes()
            .into_iter()
            .map(|(name, shape)| {
                let t = Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap();
                (name, t)
            })
            .collect()
    }

    #[test]
    fn test_constructs_for_all_capacities() {
        let device = Device::Cpu;
        for cap in ModelCapacity::ALL {
            let config = CrepeConfig::new(cap);
            let model = CrepeNet::new(&config, &device).unwrap();
            assert_eq!(model.blocks().len(), 6);
            assert!(!model.is_training());
        }
    }

    #[test]
    fn test_forward_shape_and_range() {
        let device = Device::Cpu;
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let model = CrepeNet::new(&config, &device).unwrap();

        let input = Tensor::randn(0f32, 1f32, (1, FRAME_LEN), &device).unwrap();
        let out = model.forward(&input).unwrap();
        assert_eq!(out.dims(), &[1, PITCH_BINS]);

        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_forward_rejects_wrong_frame_length() {
        let device = Device::Cpu;
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let model = CrepeNet::new(&config, &device).unwrap();

        let input = Tensor::zeros((1, 512), DType::F32, &device).unwrap();
        let err = model.forward(&input).unwrap_err();
        assert!(matches!(err, CrepeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_weights_zero_checkpoint() {
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let weights = zero_weights(&config);
        let model = CrepeNet::from_weights(&config, &weights).unwrap();

        // Zero weights push zero logits through the sigmoid.
        let input = Tensor::randn(0f32, 1f32, (2, FRAME_LEN), &Device::Cpu).unwrap();
        let out = model.forward(&input).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_from_weights_names_shape_mismatch() {
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let mut weights = zero_weights(&config);
        weights.insert(
            "conv_blocks.5.weight".to_string(),
            Tensor::zeros((16, 128, 64, 1), DType::F32, &Device::Cpu).unwrap(),
        );

        match CrepeNet::from_weights(&config, &weights).unwrap_err() {
            CrepeError::ShapeMismatch { name, .. } => {
                assert_eq!(name, "conv_blocks.5.weight");
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_from_weights_rejects_missing_param() {
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let mut weights = zero_weights(&config);
        weights.remove("fc.bias");

        match CrepeNet::from_weights(&config, &weights).unwrap_err() {
            CrepeError::MissingParam(name) => assert_eq!(name, "fc.bias"),
            other => panic!("expected MissingParam, got {other:?}"),
        }
    }

    #[test]
    fn test_from_weights_rejects_unexpected_param() {
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let mut weights = zero_weights(&config);
        weights.insert(
            "decoder.weight".to_string(),
            Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap(),
        );

        match CrepeNet::from_weights(&config, &weights).unwrap_err() {
            CrepeError::UnexpectedParam(name) => assert_eq!(name, "decoder.weight"),
            other => panic!("expected UnexpectedParam, got {other:?}"),
        }
    }

    #[test]
    fn test_from_weights_ignores_num_batches_tracked() {
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let mut weights = zero_weights(&config);
        weights.insert(
            "conv_blocks.1.num_batches_tracked".to_string(),
            Tensor::zeros((), DType::I64, &Device::Cpu).unwrap(),
        );
        assert!(CrepeNet::from_weights(&config, &weights).is_ok());
    }

    #[test]
    fn test_state_dict_matches_param_table() {
        let device = Device::Cpu;
        let config = CrepeConfig::new(ModelCapacity::Tiny);
        let model = CrepeNet::new(&config, &device).unwrap();

        let state = model.state_dict().unwrap();
        let expected = config.param_shapes();
        assert_eq!(state.len(), expected.len());
        for (name, shape) in expected {
            let tensor = state.get(&name).unwrap_or_else(|| panic!("missing {name}"));
            assert_eq!(tensor.dims(), shape.as_slice(), "shape of {name}");
        }
    }
}
