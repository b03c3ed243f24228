//! Parameter - Weight storage with a stack of overlays

use candle_core::{Result, Tensor, Var};

use crate::parametrization::Parametrization;

/// A layer attribute backed by a [`Var`], optionally decorated by overlays.
///
/// The original storage stays addressable through [`Parameter::original`];
/// [`Parameter::value`] returns it with every overlay applied in
/// registration order.
pub struct Parameter {
    original: Var,
    overlays: Vec<Box<dyn Parametrization>>,
}

impl Parameter {
    pub fn new(original: Var) -> Self {
        Self {
            original,
            overlays: Vec::new(),
        }
    }

    /// Wraps a tensor; a tensor that is already a variable keeps its storage.
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        Ok(Self::new(Var::from_tensor(t)?))
    }

    /// A second handle on the same storage without any overlays. Used to tie
    /// weights between layers.
    pub fn tied(&self) -> Self {
        Self::new(self.original.clone())
    }

    pub fn original(&self) -> &Var {
        &self.original
    }

    pub fn value(&self) -> Result<Tensor> {
        let mut value = self.original.as_tensor().clone();
        for overlay in &self.overlays {
            value = overlay.apply(&value)?;
        }
        Ok(value)
    }

    pub fn is_parametrized(&self) -> bool {
        !self.overlays.is_empty()
    }

    pub fn overlays(&self) -> &[Box<dyn Parametrization>] {
        &self.overlays
    }

    pub fn overlays_mut(&mut self) -> &mut [Box<dyn Parametrization>] {
        &mut self.overlays
    }

    /// Pushes an overlay on top of the existing ones. An already parametrized
    /// attribute gets a second, independent overlay.
    ///
    /// The overlay is evaluated once against the current value so that an
    /// incompatible factorization fails here rather than on the next forward.
    pub fn push_overlay(&mut self, overlay: Box<dyn Parametrization>) -> Result<()> {
        let current = self.value()?;
        let probe = overlay.fold(&current)?;
        if probe.dims() != current.dims() {
            candle_core::bail!(
                "overlay changes parameter shape {:?} -> {:?}",
                current.dims(),
                probe.dims()
            );
        }
        self.overlays.push(overlay);
        Ok(())
    }

    /// Drops every overlay, leaving the original storage untouched.
    /// Returns how many overlays were dropped.
    pub fn remove(&mut self) -> usize {
        let removed = self.overlays.len();
        self.overlays.clear();
        removed
    }

    /// Writes the corrected value into the original storage, then drops
    /// every overlay. Returns how many overlays were folded in.
    ///
    /// Dropout is never sampled while folding.
    pub fn merge(&mut self) -> Result<usize> {
        if self.overlays.is_empty() {
            return Ok(0);
        }
        // All-disabled overlays evaluate to the original storage itself
        if self.overlays.iter().any(|o| o.is_enabled()) {
            let mut merged = self.original.as_tensor().clone();
            for overlay in &self.overlays {
                merged = overlay.fold(&merged)?;
            }
            self.original.set(&merged.detach())?;
        }
        Ok(self.remove())
    }
}
