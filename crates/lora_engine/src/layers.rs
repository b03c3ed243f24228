//! Layers Module - Host layers that LoRA overlays attach to
//!
//! This module contains the minimal module system the engine traverses:
//! - Parameter: weight storage plus the stack of active overlays
//! - Linear: dense layer, weight (out, in)
//! - Conv2d: 2-D convolution, weight (out, in / groups, kh, kw)
//! - Embedding: lookup table, weight (vocab, hidden)
//! - Activation: parameter-free nonlinearity
//! - Sequential: named container

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

pub mod activation;
pub mod conv;
pub mod embedding;
pub mod linear;
pub mod parameter;
pub mod sequential;

pub use activation::{Activation, ActivationKind};
pub use conv::Conv2d;
pub use embedding::Embedding;
pub use linear::Linear;
pub use parameter::Parameter;
pub use sequential::Sequential;

/// Stable tag identifying a layer type. Registries are keyed by this tag
/// instead of inspecting concrete Rust types at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Linear,
    Conv2d,
    Embedding,
    Activation,
    Sequential,
}

/// Capability contract between the engine and a host layer.
///
/// A layer exposes its parameters by attribute name and its children by
/// local name. Reads of a parametrized attribute must go through
/// [`Parameter::value`] so that active overlays are applied.
pub trait Layer {
    fn kind(&self) -> LayerKind;

    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Parameter)> {
        Vec::new()
    }

    fn children(&self) -> Vec<(&str, &dyn Layer)> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut dyn Layer)> {
        Vec::new()
    }

    fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters()
            .into_iter()
            .find_map(|(attr, p)| (attr == name).then_some(p))
    }

    fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters_mut()
            .into_iter()
            .find_map(|(attr, p)| (attr == name).then_some(p))
    }
}

// --- Helper Trait for Robust Operations ---
pub(crate) trait TensorExt {
    fn matmul_robust(&self, rhs: &Tensor) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    fn matmul_robust(&self, rhs: &Tensor) -> Result<Tensor> {
        let lhs = self.contiguous()?;
        let rhs = rhs.contiguous()?;
        let lhs_rank = lhs.rank();

        // Weights may have been merged on another device
        let rhs = if rhs.device().same_device(lhs.device()) {
            rhs
        } else {
            rhs.to_device(lhs.device())?
        };

        if lhs_rank == 1 {
            lhs.unsqueeze(0)?.matmul(&rhs)?.squeeze(0)
        } else if lhs_rank == 2 {
            lhs.matmul(&rhs)
        } else {
            let flattened = lhs.flatten(0, lhs_rank - 2)?;
            let out = flattened.matmul(&rhs)?;
            let mut new_shape = lhs.dims()[..lhs_rank - 1].to_vec();
            new_shape.push(out.dim(1)?);
            out.reshape(new_shape)
        }
    }
}
