//! Conv2d - 2-D convolution with an overlay-aware kernel

use candle_core::{Result, Tensor};
use candle_nn::{Conv2dConfig, VarBuilder};

use super::{Layer, LayerKind, Parameter};

/// 2-D convolution, weight stored as (out, in / groups, kh, kw)
pub struct Conv2d {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    config: Conv2dConfig,
}

impl Conv2d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: Conv2dConfig) -> Result<Self> {
        let _ = weight.dims4()?;
        Ok(Self {
            weight: Parameter::from_tensor(&weight)?,
            bias: bias.as_ref().map(Parameter::from_tensor).transpose()?,
            config,
        })
    }

    pub fn load(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init = candle_nn::init::DEFAULT_KAIMING_NORMAL;
        let weight = vb.get_with_hints(
            (
                out_channels,
                in_channels / config.groups,
                kernel_size,
                kernel_size,
            ),
            "weight",
            init,
        )?;
        let bias = vb.get_with_hints(out_channels, "bias", candle_nn::Init::Const(0.0))?;
        Self::new(weight, Some(bias), config)
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }
}

impl Layer for Conv2d {
    fn kind(&self) -> LayerKind {
        LayerKind::Conv2d
    }

    /// `xs`: (batch, in, h, w)
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let w = self.weight.value()?;
        let ys = xs.conv2d(
            &w,
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        match &self.bias {
            Some(bias) => {
                let out = bias.original().dims()[0];
                ys.broadcast_add(&bias.value()?.reshape((1, out, 1, 1))?)
            }
            None => Ok(ys),
        }
    }

    fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        let mut params = vec![("weight", &self.weight)];
        if let Some(bias) = &self.bias {
            params.push(("bias", bias));
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Parameter)> {
        let mut params = vec![("weight", &mut self.weight)];
        if let Some(bias) = &mut self.bias {
            params.push(("bias", bias));
        }
        params
    }
}
