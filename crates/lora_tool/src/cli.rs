use crate::inspect::InspectArgs;
use crate::layers::LayersArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "LoRA attach / merge toolchain", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Attach overlays to the demo network, optionally train them, then merge
    Inspect(InspectArgs),

    /// List qualified layer names of the demo network
    Layers(LayersArgs),
}
