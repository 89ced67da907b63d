use crate::backend::BackendSet;
use crate::conv::{ConvParams, ConvolutionOperator, NeedsGrad};
use crate::{EmberError, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 2D Convolution parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub groups: usize,
    pub bias: bool,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: (3, 3),
            stride: (1, 1),
            padding: (0, 0),
            groups: 1,
            bias: true,
        }
    }
}

/// 2D Convolution layer
///
/// Holds the parameters; each call to [`Conv2d::forward`] builds a fresh
/// [`ConvolutionOperator`] and hands it back for the backward pass.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub config: Conv2dConfig,
    backends: BackendSet,
}

impl Conv2d {
    /// Square kernel, stride and padding, with bias
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        Self::from_config(Conv2dConfig {
            in_channels,
            out_channels,
            kernel_size: (kernel_size, kernel_size),
            stride: (stride, stride),
            padding: (padding, padding),
            ..Default::default()
        })
    }

    /// Create from config with an entropy-seeded generator
    pub fn from_config(config: Conv2dConfig) -> Result<Self> {
        Self::from_config_with_rng(config, &mut StdRng::from_entropy())
    }

    /// Reproducible construction.
    pub fn from_config_seeded(config: Conv2dConfig, seed: u64) -> Result<Self> {
        Self::from_config_with_rng(config, &mut StdRng::seed_from_u64(seed))
    }

    pub fn from_config_with_rng<R: Rng + ?Sized>(
        config: Conv2dConfig,
        rng: &mut R,
    ) -> Result<Self> {
        // validates stride and groups
        ConvParams::new(config.stride, config.padding, config.groups)?;
        if config.in_channels % config.groups != 0 || config.out_channels % config.groups != 0 {
            return Err(EmberError::InvalidShape(format!(
                "channels {} -> {} not divisible by groups {}",
                config.in_channels, config.out_channels, config.groups
            )));
        }

        let (kh, kw) = config.kernel_size;
        let weight_shape = Shape::from_dims(&[
            config.out_channels,
            config.in_channels / config.groups,
            kh,
            kw,
        ]);

        // Xavier normal
        let fan_in = (config.in_channels / config.groups) * kh * kw;
        let fan_out = (config.out_channels / config.groups) * kh * kw;
        let std = (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();

        let weight = Tensor::randn(weight_shape, 0.0, std, rng)?.requires_grad_(true);
        let bias = config
            .bias
            .then(|| Tensor::zeros(Shape::from_dims(&[config.out_channels])).requires_grad_(true));

        Ok(Self {
            weight,
            bias,
            config,
            backends: BackendSet::default(),
        })
    }

    /// Route this layer's operators through `backends`.
    pub fn with_backends(mut self, backends: BackendSet) -> Self {
        self.backends = backends;
        self
    }

    pub fn params(&self) -> ConvParams {
        ConvParams {
            stride: self.config.stride,
            padding: self.config.padding,
            groups: self.config.groups,
        }
    }

    /// Fresh operator for one application of this layer.
    pub fn operator(&self) -> ConvolutionOperator {
        ConvolutionOperator::with_backends(self.params(), self.backends.clone())
    }

    /// Forward pass. Returns the output and the operator that holds the
    /// state for its backward pass.
    pub fn forward(&self, input: &Tensor) -> Result<(Tensor, ConvolutionOperator)> {
        let (_, channels, _, _) = input
            .shape()
            .dims4()
            .map_err(|_| EmberError::rank("Conv2d input", 4, input.shape()))?;
        if channels != self.config.in_channels {
            return Err(EmberError::InvalidShape(format!(
                "Conv2d expects {} input channels, got {}",
                self.config.in_channels, channels
            )));
        }

        let mut op = self.operator();
        let output = op.forward(input, &self.weight, self.bias.as_ref())?;
        Ok((output, op))
    }

    /// Which gradients backward should produce for `input` through this layer.
    pub fn needs_grad_for(&self, input: &Tensor) -> NeedsGrad {
        NeedsGrad::from_inputs(input, &self.weight, self.bias.as_ref())
    }
}
