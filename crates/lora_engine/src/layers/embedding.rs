//! Embedding - Lookup table with an overlay-aware weight

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::{Layer, LayerKind, Parameter};

/// Token embedding, weight stored as (vocab, hidden)
pub struct Embedding {
    pub weight: Parameter,
    hidden_size: usize,
}

impl Embedding {
    pub fn new(weight: Tensor) -> Result<Self> {
        let (_, hidden_size) = weight.dims2()?;
        Ok(Self {
            weight: Parameter::from_tensor(&weight)?,
            hidden_size,
        })
    }

    pub fn load(vocab_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let init = candle_nn::Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        let weight = vb.get_with_hints((vocab_size, hidden_size), "weight", init)?;
        Self::new(weight)
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

impl Layer for Embedding {
    fn kind(&self) -> LayerKind {
        LayerKind::Embedding
    }

    /// `xs` holds integer token ids of any shape
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut final_dims = xs.dims().to_vec();
        final_dims.push(self.hidden_size);
        let ids = xs.flatten_all()?;
        let values = self.weight.value()?.index_select(&ids, 0)?;
        values.reshape(final_dims)
    }

    fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        vec![("weight", &self.weight)]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Parameter)> {
        vec![("weight", &mut self.weight)]
    }
}
