use anyhow::Result;
use candle_core::Device;
use clap::Args;
use lora_engine::named_layers;

use crate::demo::{self, DemoDims};

#[derive(Args, Debug, Clone)]
pub struct LayersArgs {
    #[command(flatten)]
    pub dims: DemoDims,
}

pub fn run(args: LayersArgs) -> Result<()> {
    let (net, _varmap) = demo::fresh(args.dims, &Device::Cpu)?;
    for (name, kind) in named_layers(&net) {
        let name = if name.is_empty() { "<root>" } else { name.as_str() };
        println!("{name:<16} {kind:?}");
    }
    Ok(())
}
