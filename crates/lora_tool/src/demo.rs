//! Demo network the tool attaches overlays to
//!
//! ```text
//! encoder.fc1  Linear  input  -> hidden
//! encoder.act  SiLU
//! encoder.fc2  Linear  hidden -> hidden
//! head         Linear  hidden -> output
//! ```

use candle_core::{DType, Device, Result};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use lora_engine::layers::{Activation, ActivationKind, Linear, Sequential};

#[derive(Args, Debug, Clone, Copy)]
pub struct DemoDims {
    #[arg(long, default_value_t = 16)]
    pub input_dim: usize,

    #[arg(long, default_value_t = 32)]
    pub hidden_dim: usize,

    #[arg(long, default_value_t = 4)]
    pub output_dim: usize,
}

pub fn build_mlp(dims: DemoDims, vb: VarBuilder) -> Result<Sequential> {
    let enc = vb.pp("encoder");
    let encoder = Sequential::new()
        .add(
            "fc1",
            Linear::load(dims.input_dim, dims.hidden_dim, true, enc.pp("fc1"))?,
        )
        .add("act", Activation::new(ActivationKind::Silu))
        .add(
            "fc2",
            Linear::load(dims.hidden_dim, dims.hidden_dim, true, enc.pp("fc2"))?,
        );
    let head = Linear::load(dims.hidden_dim, dims.output_dim, true, vb.pp("head"))?;
    Ok(Sequential::new().add("encoder", encoder).add("head", head))
}

/// Fresh network plus the map that owns its base weights
pub fn fresh(dims: DemoDims, device: &Device) -> Result<(Sequential, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let net = build_mlp(dims, vb)?;
    Ok((net, varmap))
}
