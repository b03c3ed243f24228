//! LoRA - Low-rank factorization overlay
//!
//! Adds `scaling * B @ A` (reshaped to the parameter's shape) to a frozen
//! weight, where A is (rank, fan_in) and B is (fan_out, rank).
//!
//! With `fan_in_fan_out` the factors are stored transposed and the product is
//! `A @ B`, which matches weights stored as (fan_in, fan_out) such as
//! embedding tables. A dense layer and an embedding can then share one
//! storage while each applies a correctly oriented correction.

use candle_core::{DType, Device, Result, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::linalg;
use crate::parametrization::{OverlayState, Parametrization};

/// How the factors are initialized
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMethod {
    /// A ~ kaiming-uniform (a = sqrt(5)), B = 0: the correction starts at zero
    #[default]
    Kaiming,
    /// Rank-r truncation of the SVD of the original weight
    Svd,
}

/// Hyper-parameters of one LoRA overlay
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub rank: usize,
    #[serde(alias = "lora_alpha")]
    pub alpha: f64,
    #[serde(alias = "lora_dropout_p")]
    pub dropout_p: f32,
    pub init_method: InitMethod,
    /// Keep the orthonormal SVD basis used for B as a buffer
    pub cache_v: bool,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 4,
            alpha: 1.0,
            dropout_p: 0.0,
            init_method: InitMethod::Kaiming,
            cache_v: false,
        }
    }
}

impl LoraConfig {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            ..Default::default()
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.dropout_p = dropout_p;
        self
    }

    pub fn with_init(mut self, init_method: InitMethod) -> Self {
        self.init_method = init_method;
        self
    }

    pub fn with_cache_v(mut self, cache_v: bool) -> Self {
        self.cache_v = cache_v;
        self
    }

    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            candle_core::bail!("lora: rank must be >= 1");
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            candle_core::bail!("lora: dropout_p must be in [0, 1), got {}", self.dropout_p);
        }
        if !self.alpha.is_finite() {
            candle_core::bail!("lora: alpha must be finite, got {}", self.alpha);
        }
        Ok(())
    }
}

/// Factor A is trainable in plain LoRA and frozen in the LoRA-FA variant
pub(crate) enum FactorA {
    Trainable(Var),
    Frozen(Tensor),
}

impl FactorA {
    fn tensor(&self) -> &Tensor {
        match self {
            FactorA::Trainable(var) => var.as_tensor(),
            FactorA::Frozen(t) => t,
        }
    }
}

/// Low-rank overlay `x + scaling * reshape(B @ dropout(A))`
pub struct LoraParametrization {
    pub(crate) lora_a: FactorA,
    pub(crate) lora_b: Var,
    /// All-ones (1, fan_in); dropout on it masks input columns of A
    dropout_mask: Tensor,
    cached_v: Option<Tensor>,
    pub(crate) fan_in_fan_out: bool,
    rank: usize,
    scaling: f64,
    dropout_p: f32,
    state: OverlayState,
    training: bool,
}

impl LoraParametrization {
    /// Builds and initializes the factors.
    ///
    /// `original_weights` is required by [`InitMethod::Svd`] and ignored
    /// otherwise. It may be 2-D or a conv kernel flattened from dim 1, stored
    /// as (fan_in, fan_out) when `fan_in_fan_out` is set.
    pub fn new(
        fan_in: usize,
        fan_out: usize,
        fan_in_fan_out: bool,
        config: &LoraConfig,
        original_weights: Option<&Tensor>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let rank = config.rank;
        let swap = |(r, c): (usize, usize)| if fan_in_fan_out { (c, r) } else { (r, c) };

        let (a, b, basis) = match config.init_method {
            InitMethod::Kaiming => {
                let a_shape = swap((rank, fan_in));
                // kaiming_uniform(a = sqrt(5)) reduces to U(-1/sqrt(fan), 1/sqrt(fan))
                let bound = 1.0 / (a_shape.1 as f32).sqrt();
                let a = Tensor::rand(-bound, bound, a_shape, device)?;
                let b = Tensor::zeros(swap((fan_out, rank)), DType::F32, device)?;
                (a, b, None)
            }
            InitMethod::Svd => {
                let Some(weights) = original_weights else {
                    candle_core::bail!("lora: original_weights must be provided for svd init");
                };
                let (a, b) = svd_factors(weights, fan_in, fan_out, fan_in_fan_out, rank, device)?;
                let basis = b.copy()?;
                (a, b, Some(basis))
            }
        };

        Ok(Self {
            lora_a: FactorA::Trainable(Var::from_tensor(&a)?),
            lora_b: Var::from_tensor(&b)?,
            dropout_mask: Tensor::ones(swap((1, fan_in)), DType::F32, device)?,
            cached_v: basis.filter(|_| config.cache_v),
            fan_in_fan_out,
            rank,
            scaling: config.scaling(),
            dropout_p: config.dropout_p,
            state: OverlayState::Enabled,
            training: true,
        })
    }

    pub fn lora_a(&self) -> &Tensor {
        self.lora_a.tensor()
    }

    /// `None` once A has been frozen
    pub fn lora_a_var(&self) -> Option<&Var> {
        match &self.lora_a {
            FactorA::Trainable(var) => Some(var),
            FactorA::Frozen(_) => None,
        }
    }

    pub fn lora_b(&self) -> &Var {
        &self.lora_b
    }

    pub fn dropout_mask(&self) -> &Tensor {
        &self.dropout_mask
    }

    pub fn cached_v(&self) -> Option<&Tensor> {
        self.cached_v.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    pub fn fan_in_fan_out(&self) -> bool {
        self.fan_in_fan_out
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn is_a_frozen(&self) -> bool {
        matches!(self.lora_a, FactorA::Frozen(_))
    }

    /// `scaling * B @ A` in the stored layout, dropout not applied
    pub fn delta_weight(&self) -> Result<Tensor> {
        self.delta(false)
    }

    pub(crate) fn freeze_a(&mut self) -> Result<()> {
        if let FactorA::Trainable(var) = &self.lora_a {
            let frozen = var.as_tensor().copy()?.detach();
            self.lora_a = FactorA::Frozen(frozen);
        }
        Ok(())
    }

    fn delta(&self, sample_dropout: bool) -> Result<Tensor> {
        let a = self.lora_a.tensor();
        let a = if sample_dropout && self.training && self.dropout_p > 0.0 {
            let mask = candle_nn::ops::dropout(&self.dropout_mask, self.dropout_p)?;
            a.broadcast_mul(&mask)?
        } else {
            a.clone()
        };
        let b = self.lora_b.as_tensor();
        let product = if self.fan_in_fan_out {
            a.matmul(b)?
        } else {
            b.matmul(&a)?
        };
        product * self.scaling
    }

    fn evaluate(&self, x: &Tensor, sample_dropout: bool) -> Result<Tensor> {
        match self.state {
            OverlayState::Disabled => Ok(x.clone()),
            OverlayState::Enabled => {
                let delta = self
                    .delta(sample_dropout)?
                    .reshape(x.shape())?
                    .to_dtype(x.dtype())?;
                x + delta
            }
        }
    }
}

impl Parametrization for LoraParametrization {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        self.evaluate(x, true)
    }

    fn fold(&self, x: &Tensor) -> Result<Tensor> {
        self.evaluate(x, false)
    }

    fn state(&self) -> OverlayState {
        self.state
    }

    fn set_state(&mut self, state: OverlayState) {
        self.state = state;
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn trainable_vars(&self) -> Vec<Var> {
        match &self.lora_a {
            FactorA::Trainable(a) => vec![a.clone(), self.lora_b.clone()],
            FactorA::Frozen(_) => vec![self.lora_b.clone()],
        }
    }

    fn named_tensors(&self) -> Vec<(&'static str, Tensor)> {
        let mut tensors = vec![
            ("lora_a", self.lora_a.tensor().clone()),
            ("lora_b", self.lora_b.as_tensor().clone()),
            ("lora_dropout_mask", self.dropout_mask.clone()),
        ];
        if let Some(v) = &self.cached_v {
            tensors.push(("v", v.clone()));
        }
        tensors
    }
}

/// Rank-r SVD factors of `weights` in the stored layout.
///
/// With `W = U S V^T` in (fan_out, fan_in) orientation, A = S_r V_r^T and
/// B = U_r, so `B @ A` is the best rank-r approximation of W.
fn svd_factors(
    weights: &Tensor,
    fan_in: usize,
    fan_out: usize,
    fan_in_fan_out: bool,
    rank: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let w = weights.to_device(device)?.flatten_from(1)?;
    let w = if fan_in_fan_out { w.t()? } else { w };
    let (rows, cols) = w.dims2()?;
    if (rows, cols) != (fan_out, fan_in) {
        candle_core::bail!(
            "lora: original_weights {:?} do not match fan_out={fan_out}, fan_in={fan_in}",
            weights.dims()
        );
    }
    let k = rows.min(cols);
    if rank > k {
        candle_core::bail!("lora: svd init needs rank <= {k}, got {rank}");
    }

    let svd = linalg::svd(&w)?;
    let s = svd.s.narrow(0, 0, rank)?;
    let a = svd.vt.narrow(0, 0, rank)?.broadcast_mul(&s.unsqueeze(1)?)?;
    let b = svd.u.narrow(1, 0, rank)?;
    if fan_in_fan_out {
        Ok((a.t()?.contiguous()?, b.t()?.contiguous()?))
    } else {
        Ok((a.contiguous()?, b.contiguous()?))
    }
}
