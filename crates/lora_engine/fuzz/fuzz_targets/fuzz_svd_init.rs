#![no_main]
use candle_core::{Device, Tensor};
use libfuzzer_sys::fuzz_target;
use lora_engine::{InitMethod, LoraConfig, LoraParametrization, Parametrization};

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }

    // 1. Shape and rank from the first bytes
    let fan_out = 1 + (data[0] as usize % 8);
    let fan_in = 1 + (data[1] as usize % 8);
    let rank = 1 + (data[2] as usize % fan_out.min(fan_in));
    let fan_in_fan_out = data[0] & 0x80 != 0;

    // 2. Weights from the remaining bytes
    let weight_bytes = &data[3..];
    let len = fan_out * fan_in;
    if weight_bytes.len() < len * 4 {
        return;
    }
    let values: Vec<f32> = weight_bytes[..len * 4]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if values.iter().any(|v| !v.is_finite() || v.abs() > 1e6) {
        return;
    }

    let device = Device::Cpu;
    let shape = if fan_in_fan_out { (fan_in, fan_out) } else { (fan_out, fan_in) };
    let Ok(w) = Tensor::from_vec(values, shape, &device) else {
        return;
    };

    // 3. Init and evaluate; errors are fine, panics are not
    let cfg = LoraConfig::new(rank).with_init(InitMethod::Svd);
    if let Ok(lora) = LoraParametrization::new(fan_in, fan_out, fan_in_fan_out, &cfg, Some(&w), &device) {
        let _ = lora.fold(&w);
    }
});
