use std::path::PathBuf;

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::{Optimizer, SGD};
use clap::Args;
use lora_engine::apply::visit;
use lora_engine::{
    add_lora, add_lora_by_layer_names, add_lora_by_name, count_lora_parameters, lora_parameters,
    merge_lora, set_lora_training, Layer, LoraRegistry, NamedRegistryConfig, RegistryConfig,
};
use tracing::{debug, info, warn};

use crate::demo::{self, DemoDims};

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Registry config (JSON, layer kind -> attribute -> adapter)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Exact-name registry config (JSON, layer name -> registry config)
    #[arg(long, conflicts_with_all = ["config", "target"])]
    pub named_config: Option<PathBuf>,

    /// Only attach under layers whose name contains one of these
    #[arg(short, long)]
    pub target: Vec<String>,

    #[command(flatten)]
    pub dims: DemoDims,

    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,

    /// SGD steps on a random regression target before merging
    #[arg(long, default_value_t = 0)]
    pub train_steps: usize,

    #[arg(long, default_value_t = 0.05)]
    pub lr: f64,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InspectReport {
    pub attached: usize,
    pub base_parameters: usize,
    pub lora_parameters: usize,
    /// Max |y_attached - y_base| right after attaching
    pub attach_drift: f32,
    pub final_loss: Option<f32>,
    pub merged: usize,
    /// Max |y_merged - y_before_merge|
    pub merge_drift: f32,
}

impl InspectReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "attached": self.attached,
            "base_parameters": self.base_parameters,
            "lora_parameters": self.lora_parameters,
            "attach_drift": self.attach_drift,
            "final_loss": self.final_loss,
            "merged": self.merged,
            "merge_drift": self.merge_drift,
        })
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

fn count_base_parameters(net: &dyn Layer) -> usize {
    let mut total = 0;
    visit(net, "", &mut |_, layer| {
        total += layer
            .parameters()
            .iter()
            .map(|(_, p)| p.original().elem_count())
            .sum::<usize>();
    });
    total
}

fn attach(net: &mut dyn Layer, args: &InspectArgs) -> Result<usize> {
    if let Some(path) = &args.named_config {
        let named = NamedRegistryConfig::from_json_file(path)?.build()?;
        info!("Attaching by exact name from {:?}", path);
        return Ok(add_lora_by_layer_names(net, &named)?);
    }

    let registry = match &args.config {
        Some(path) => {
            info!("Registry config: {:?}", path);
            RegistryConfig::from_json_file(path)?.build()?
        }
        None => LoraRegistry::default(),
    };
    if args.target.is_empty() {
        Ok(add_lora(net, &registry)?)
    } else {
        let targets: Vec<&str> = args.target.iter().map(String::as_str).collect();
        Ok(add_lora_by_name(net, &targets, &registry)?)
    }
}

pub fn inspect(args: &InspectArgs, device: &Device) -> Result<InspectReport> {
    let (mut net, _varmap) = demo::fresh(args.dims, device)?;
    let x = Tensor::randn(0.0f32, 1.0, (args.batch_size, args.dims.input_dim), device)?;
    let base = net.forward(&x)?;

    let attached = attach(&mut net, args)?;
    if attached == 0 {
        warn!("No overlay was attached; check the registry and targets");
    }

    set_lora_training(&mut net, false);
    let attach_drift = max_abs_diff(&net.forward(&x)?, &base)?;

    let mut final_loss = None;
    if args.train_steps > 0 {
        let vars = lora_parameters(&net);
        let target = Tensor::randn(0.0f32, 1.0, (args.batch_size, args.dims.output_dim), device)?;
        let mut opt = SGD::new(vars, args.lr)?;
        set_lora_training(&mut net, true);
        for step in 0..args.train_steps {
            let loss = (net.forward(&x)? - &target)?.sqr()?.mean_all()?;
            opt.backward_step(&loss)?;
            let loss = loss.to_scalar::<f32>()?;
            debug!("step {step}: loss {loss:.6}");
            final_loss = Some(loss);
        }
        set_lora_training(&mut net, false);
    }

    let report_base = count_base_parameters(&net);
    let report_lora = count_lora_parameters(&net);

    let before_merge = net.forward(&x)?;
    let merged = merge_lora(&mut net)?;
    let merge_drift = max_abs_diff(&net.forward(&x)?, &before_merge)?;

    Ok(InspectReport {
        attached,
        base_parameters: report_base,
        lora_parameters: report_lora,
        attach_drift,
        final_loss,
        merged,
        merge_drift,
    })
}

pub fn run(args: InspectArgs) -> Result<()> {
    info!("--- LoRA Inspect ---");
    let report = inspect(&args, &Device::Cpu)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        return Ok(());
    }

    info!("Overlays attached: {}", report.attached);
    info!(
        "Trainable LoRA parameters: {} ({:.2}% of {} base)",
        report.lora_parameters,
        100.0 * report.lora_parameters as f64 / report.base_parameters.max(1) as f64,
        report.base_parameters
    );
    info!("Output drift after attach: {:.3e}", report.attach_drift);
    if let Some(loss) = report.final_loss {
        info!("Final training loss: {:.6}", loss);
    }
    info!(
        "Merged {} overlay(s), output drift {:.3e}",
        report.merged, report.merge_drift
    );
    Ok(())
}
