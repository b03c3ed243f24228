//! Linear - Dense layer with an overlay-aware weight

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::{Embedding, Layer, LayerKind, Parameter, TensorExt};

/// Dense layer computing `x @ W^T + b`, weight stored as (out, in)
pub struct Linear {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Ok(Self {
            weight: Parameter::from_tensor(&weight)?,
            bias: bias.as_ref().map(Parameter::from_tensor).transpose()?,
        })
    }

    pub fn load(in_dim: usize, out_dim: usize, with_bias: bool, vb: VarBuilder) -> Result<Self> {
        let init = candle_nn::init::DEFAULT_KAIMING_NORMAL;
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
        let bias = if with_bias {
            Some(vb.get_with_hints(out_dim, "bias", candle_nn::Init::Const(0.0))?)
        } else {
            None
        };
        Self::new(weight, bias)
    }

    /// Output projection sharing its weight storage with `embedding`
    /// (vocab, hidden), as in a tied LM head.
    pub fn tied_to(embedding: &Embedding) -> Self {
        Self {
            weight: embedding.weight.tied(),
            bias: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.original().dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.original().dims()[0]
    }
}

impl Layer for Linear {
    fn kind(&self) -> LayerKind {
        LayerKind::Linear
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let w = self.weight.value()?;
        let ys = xs.matmul_robust(&w.t()?)?;
        match &self.bias {
            Some(bias) => ys.broadcast_add(&bias.value()?),
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
