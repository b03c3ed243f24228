//! Parametrization - Overlay contract between a `Parameter` and a factorization

use candle_core::{Result, Tensor, Var};

/// Whether an overlay adds its correction on evaluation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverlayState {
    #[default]
    Enabled,
    Disabled,
}

/// A transformation of a parameter's value, evaluated on every read.
pub trait Parametrization {
    /// Corrected value of `x`. Samples dropout when in training mode.
    fn apply(&self, x: &Tensor) -> Result<Tensor>;

    /// Corrected value of `x` with dropout never sampled. Used for merging.
    fn fold(&self, x: &Tensor) -> Result<Tensor>;

    fn state(&self) -> OverlayState;

    fn set_state(&mut self, state: OverlayState);

    fn enable(&mut self) {
        self.set_state(OverlayState::Enabled);
    }

    fn disable(&mut self) {
        self.set_state(OverlayState::Disabled);
    }

    fn is_enabled(&self) -> bool {
        self.state() == OverlayState::Enabled
    }

    fn set_training(&mut self, training: bool);

    /// Variables an optimizer should update
    fn trainable_vars(&self) -> Vec<Var>;

    /// Every tensor this overlay owns, trainable or not, by local name
    fn named_tensors(&self) -> Vec<(&'static str, Tensor)>;
}
