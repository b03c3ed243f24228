//! Activation - Parameter-free nonlinearities

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use super::{Layer, LayerKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    Silu,
    Gelu,
}

pub struct Activation {
    pub act: ActivationKind,
}

impl Activation {
    pub fn new(act: ActivationKind) -> Self {
        Self { act }
    }
}

impl Layer for Activation {
    fn kind(&self) -> LayerKind {
        LayerKind::Activation
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self.act {
            ActivationKind::Relu => xs.relu(),
            ActivationKind::Silu => candle_nn::ops::silu(xs),
            ActivationKind::Gelu => xs.gelu(),
        }
    }
}
