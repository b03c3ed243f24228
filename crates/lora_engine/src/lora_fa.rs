//! LoRA-FA - LoRA with a frozen projection-down factor
//!
//! Only B is trained. With kaiming init, A is replaced by an orthonormal
//! basis of its own row space (QR of A^T) and B absorbs R, so `B @ A` is
//! unchanged by the reprojection.

use candle_core::{Device, Result, Tensor, Var};

use crate::linalg;
use crate::lora::{FactorA, InitMethod, LoraConfig, LoraParametrization};
use crate::parametrization::{OverlayState, Parametrization};

pub struct LoraFaParametrization {
    inner: LoraParametrization,
}

impl LoraFaParametrization {
    pub fn new(
        fan_in: usize,
        fan_out: usize,
        fan_in_fan_out: bool,
        config: &LoraConfig,
        original_weights: Option<&Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let mut inner = LoraParametrization::new(
            fan_in,
            fan_out,
            fan_in_fan_out,
            config,
            original_weights,
            device,
        )?;
        if config.init_method == InitMethod::Kaiming {
            reproject_orthogonal(&mut inner)?;
        }
        inner.freeze_a()?;
        Ok(Self { inner })
    }

    pub fn lora_a(&self) -> &Tensor {
        self.inner.lora_a()
    }

    pub fn lora_b(&self) -> &Var {
        self.inner.lora_b()
    }

    pub fn inner(&self) -> &LoraParametrization {
        &self.inner
    }

    pub fn delta_weight(&self) -> Result<Tensor> {
        self.inner.delta_weight()
    }
}

/// A <- Q^T and B <- B @ R where A^T = Q R, in (fan_out, fan_in) orientation
fn reproject_orthogonal(lora: &mut LoraParametrization) -> Result<()> {
    let swapped = lora.fan_in_fan_out;
    let a = lora.lora_a();
    let a = if swapped { a.t()? } else { a.clone() };
    let b = lora.lora_b().as_tensor();
    let b = if swapped { b.t()? } else { b.clone() };

    let (q, r) = linalg::qr(&a.t()?)?;
    let a_new = q.t()?;
    let b_new = b.matmul(&r)?;

    let (a_new, b_new) = if swapped {
        (q, b_new.t()?)
    } else {
        (a_new, b_new)
    };
    lora.lora_a = FactorA::Trainable(Var::from_tensor(&a_new.contiguous()?)?);
    lora.lora_b.set(&b_new.contiguous()?)?;
    Ok(())
}

impl Parametrization for LoraFaParametrization {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        self.inner.apply(x)
    }

    fn fold(&self, x: &Tensor) -> Result<Tensor> {
        self.inner.fold(x)
    }

    fn state(&self) -> OverlayState {
        self.inner.state()
    }

    fn set_state(&mut self, state: OverlayState) {
        self.inner.set_state(state);
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.inner.trainable_vars()
    }

    fn named_tensors(&self) -> Vec<(&'static str, Tensor)> {
        self.inner.named_tensors()
    }
}
