use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2dConfig, Optimizer, SGD};
use lora_engine::layers::{Activation, ActivationKind, Conv2d, Embedding, Linear, Sequential};
use lora_engine::{
    add_lora, add_lora_by_layer_names, add_lora_by_name, disable_lora, lora_parameters,
    merge_lora, merge_lora_by_layer_names, merge_lora_by_name, remove_lora,
    remove_lora_by_layer_names, remove_lora_by_name, AdapterSpec, InitMethod,
    Layer, LayerKind, LoraConfig, LoraRegistry, NamedRegistry, ParametrizationFactory,
};

fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

fn linear_registry(config: LoraConfig) -> LoraRegistry {
    LoraRegistry::empty().with(
        LayerKind::Linear,
        "weight",
        ParametrizationFactory::from_linear(AdapterSpec::lora(config)),
    )
}

fn random_linear(out_dim: usize, in_dim: usize, device: &Device) -> anyhow::Result<Linear> {
    let w = Tensor::randn(0.0f32, 1.0, (out_dim, in_dim), device)?;
    let b = Tensor::randn(0.0f32, 1.0, out_dim, device)?;
    Ok(Linear::new(w, Some(b))?)
}

fn network(device: &Device) -> anyhow::Result<Sequential> {
    Ok(Sequential::new()
        .add(
            "encoder",
            Sequential::new()
                .add("fc1", random_linear(16, 8, device)?)
                .add("act", Activation::new(ActivationKind::Silu))
                .add("fc2", random_linear(16, 16, device)?),
        )
        .add(
            "decoder",
            Sequential::new()
                .add("fc1", random_linear(8, 16, device)?)
                .add("act", Activation::new(ActivationKind::Gelu)),
        )
        .add("head", random_linear(2, 8, device)?))
}

/// Snapshot of every parameter's raw storage by qualified name
fn snapshot(net: &dyn Layer) -> anyhow::Result<Vec<(String, Vec<f32>)>> {
    fn walk(layer: &dyn Layer, name: &str, out: &mut Vec<(String, Vec<f32>)>) -> anyhow::Result<()> {
        for (attr, param) in layer.parameters() {
            let values = param.original().flatten_all()?.to_vec1::<f32>()?;
            out.push((format!("{name}.{attr}"), values));
        }
        for (child, sub) in layer.children() {
            walk(sub, &format!("{name}.{child}"), out)?;
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(net, "", &mut out)?;
    Ok(out)
}

#[test]
fn test_dense_scenario_rank2_alpha2() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut layer = random_linear(4, 8, &device)?;
    let x = Tensor::randn(0.0f32, 1.0, (5, 8), &device)?;
    let base = layer.forward(&x)?;

    let registry = linear_registry(LoraConfig::new(2).with_alpha(2.0));
    assert_eq!(add_lora(&mut layer, &registry)?, 1);
    assert_eq!(layer.forward(&x)?.to_vec2::<f32>()?, base.to_vec2::<f32>()?);

    let vars = lora_parameters(&layer);
    assert_eq!(vars.len(), 2);
    let (a, b) = (&vars[0], &vars[1]);
    assert_eq!(a.dims(), &[2, 8]);
    assert_eq!(b.dims(), &[4, 2]);
    a.set(&Tensor::randn(0.0f32, 1.0, (2, 8), &device)?)?;
    b.set(&Tensor::randn(0.0f32, 1.0, (4, 2), &device)?)?;

    // scaling = 2 / 2 = 1
    let delta = b.matmul(a)?;
    let expected = (&base + x.matmul(&delta.t()?)?)?;
    assert!(max_abs_diff(&layer.forward(&x)?, &expected)? < 1e-4);
    Ok(())
}

#[test]
fn test_merge_bakes_in_corrected_value() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut layer = random_linear(6, 5, &device)?;
    add_lora(&mut layer, &linear_registry(LoraConfig::new(3).with_alpha(6.0)))?;
    let b = lora_parameters(&layer)[1].clone();
    b.set(&Tensor::randn(0.0f32, 1.0, (6, 3), &device)?)?;

    let x = Tensor::randn(0.0f32, 1.0, (2, 5), &device)?;
    let corrected_weight = layer.weight.value()?;
    let corrected_out = layer.forward(&x)?;

    assert_eq!(merge_lora(&mut layer)?, 1);
    assert!(!layer.weight.is_parametrized());
    assert!(max_abs_diff(layer.weight.original(), &corrected_weight)? < 1e-6);
    assert!(max_abs_diff(&layer.forward(&x)?, &corrected_out)? < 1e-5);
    assert!(lora_parameters(&layer).is_empty());
    Ok(())
}

#[test]
fn test_remove_restores_exact_original() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut net = network(&device)?;
    let before = snapshot(&net)?;

    add_lora(&mut net, &LoraRegistry::default())?;
    for b in lora_parameters(&net).iter().skip(1).step_by(2) {
        b.set(&Tensor::ones(b.dims(), DType::F32, &device)?)?;
    }
    assert_eq!(remove_lora(&mut net)?, 4);
    assert_eq!(snapshot(&net)?, before);
    Ok(())
}

#[test]
fn test_merge_of_disabled_overlay_keeps_original() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut net = network(&device)?;
    let before = snapshot(&net)?;

    add_lora(&mut net, &LoraRegistry::default())?;
    for b in lora_parameters(&net).iter().skip(1).step_by(2) {
        b.set(&Tensor::ones(b.dims(), DType::F32, &device)?)?;
    }
    disable_lora(&mut net);
    assert_eq!(merge_lora(&mut net)?, 4);
    assert_eq!(snapshot(&net)?, before);
    Ok(())
}

#[test]
fn test_stacked_overlays_add_up() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut layer = random_linear(4, 4, &device)?;
    let w = layer.weight.original().as_tensor().copy()?;
    let registry = linear_registry(LoraConfig::new(1));
    add_lora(&mut layer, &registry)?;
    add_lora(&mut layer, &registry)?;
    assert_eq!(layer.weight.overlays().len(), 2);

    let vars = lora_parameters(&layer);
    vars[1].set(&Tensor::ones((4, 1), DType::F32, &device)?)?;
    vars[3].set(&Tensor::ones((4, 1), DType::F32, &device)?)?;
    let d1 = vars[1].matmul(&vars[0])?;
    let d2 = vars[3].matmul(&vars[2])?;
    let expected = ((&w + d1)? + d2)?;

    merge_lora(&mut layer)?;
    assert!(max_abs_diff(layer.weight.original(), &expected)? < 1e-5);
    Ok(())
}

#[test]
fn test_substring_selection_leaves_others_untouched() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut net = network(&device)?;
    let before = snapshot(&net)?;

    let registry = LoraRegistry::default();
    // "encoder" covers encoder.fc1 and encoder.fc2, "head" covers head
    assert_eq!(add_lora_by_name(&mut net, &["encoder", "head"], &registry)?, 3);
    let state = lora_engine::lora_state_dict(&net);
    assert!(state.keys().all(|k| !k.starts_with("decoder.")));

    for b in lora_parameters(&net).iter().skip(1).step_by(2) {
        b.set(&Tensor::ones(b.dims(), DType::F32, &device)?)?;
    }
    // only the head is merged; encoder overlays are dropped
    assert_eq!(merge_lora_by_name(&mut net, &["head"])?, 1);
    assert_eq!(remove_lora_by_name(&mut net, &["enc"])?, 2);
    assert!(lora_parameters(&net).is_empty());

    let after = snapshot(&net)?;
    for ((name, old), (_, new)) in before.iter().zip(after.iter()) {
        if name == ".head.weight" {
            assert_ne!(old, new);
        } else {
            assert_eq!(old, new, "{name} changed");
        }
    }
    Ok(())
}

#[test]
fn test_exact_name_selection_only_touches_keys() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut net = network(&device)?;
    let named = NamedRegistry::new()
        .with("decoder.fc1", linear_registry(LoraConfig::new(2)))
        .with("head", linear_registry(LoraConfig::new(1)));
    assert_eq!(add_lora_by_layer_names(&mut net, &named)?, 2);

    let state = lora_engine::lora_state_dict(&net);
    assert!(state
        .keys()
        .all(|k| k.starts_with("decoder.fc1.") || k.starts_with("head.")));
    assert_eq!(state["decoder.fc1.weight.lora.0.lora_a"].dims(), &[2, 16]);
    assert_eq!(state["head.weight.lora.0.lora_a"].dims(), &[1, 8]);
    Ok(())
}

#[test]
fn test_exact_name_merge_and_remove_leave_others_untouched() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut net = network(&device)?;
    let before = snapshot(&net)?;

    add_lora(&mut net, &LoraRegistry::default())?;
    for b in lora_parameters(&net).iter().skip(1).step_by(2) {
        b.set(&Tensor::ones(b.dims(), DType::F32, &device)?)?;
    }

    // exact keys only: "fc1" alone names no layer
    assert_eq!(merge_lora_by_layer_names(&mut net, &["fc1"])?, 0);
    assert_eq!(merge_lora_by_layer_names(&mut net, &["decoder.fc1"])?, 1);
    assert_eq!(remove_lora_by_layer_names(&mut net, &["encoder"])?, 2);
    let state = lora_engine::lora_state_dict(&net);
    assert!(state.keys().all(|k| k.starts_with("head.")));
    assert_eq!(remove_lora_by_layer_names(&mut net, &["head"])?, 1);

    let after = snapshot(&net)?;
    for ((name, old), (_, new)) in before.iter().zip(after.iter()) {
        if name == ".decoder.fc1.weight" {
            assert_ne!(old, new);
        } else {
            assert_eq!(old, new, "{name} changed");
        }
    }
    Ok(())
}

#[test]
fn test_nested_exact_keys_stack_overlays() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut net = network(&device)?;
    let named = NamedRegistry::new()
        .with("encoder", linear_registry(LoraConfig::new(1)))
        .with("encoder.fc2", linear_registry(LoraConfig::new(3)));
    assert_eq!(add_lora_by_layer_names(&mut net, &named)?, 3);

    let state = lora_engine::lora_state_dict(&net);
    assert_eq!(state["encoder.fc1.weight.lora.0.lora_a"].dims(), &[1, 8]);
    assert_eq!(state["encoder.fc2.weight.lora.0.lora_a"].dims(), &[1, 16]);
    assert_eq!(state["encoder.fc2.weight.lora.1.lora_a"].dims(), &[3, 16]);
    Ok(())
}

#[test]
fn test_svd_registry_reads_layer_weight() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut layer = random_linear(6, 4, &device)?;
    let w = layer.weight.original().as_tensor().copy()?;

    // full rank, scaling 1: the overlay adds W again
    let cfg = LoraConfig::new(4).with_alpha(4.0).with_init(InitMethod::Svd);
    add_lora(&mut layer, &linear_registry(cfg))?;
    let doubled = (&w * 2.0)?;
    assert!(max_abs_diff(&layer.weight.value()?, &doubled)? < 1e-4);
    Ok(())
}

#[test]
fn test_conv_overlay_merges() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let w = Tensor::randn(0.0f32, 1.0, (3, 2, 3, 3), &device)?;
    let config = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    let mut conv = Conv2d::new(w, None, config)?;
    let registry = LoraRegistry::empty().with(
        LayerKind::Conv2d,
        "weight",
        ParametrizationFactory::from_conv2d(AdapterSpec::lora(LoraConfig::new(2))),
    );
    add_lora(&mut conv, &registry)?;
    let x = Tensor::randn(0.0f32, 1.0, (1, 2, 5, 5), &device)?;
    let base = conv.forward(&x)?;
    assert_eq!(max_abs_diff(&conv.forward(&x)?, &base)?, 0.0);

    let b = lora_parameters(&conv)[1].clone();
    assert_eq!(b.dims(), &[3, 2]);
    b.set(&Tensor::ones((3, 2), DType::F32, &device)?)?;
    let corrected = conv.forward(&x)?;
    assert!(max_abs_diff(&corrected, &base)? > 0.0);

    merge_lora(&mut conv)?;
    assert_eq!(conv.weight.original().dims(), &[3, 2, 3, 3]);
    assert!(max_abs_diff(&conv.forward(&x)?, &corrected)? < 1e-4);
    Ok(())
}

#[test]
fn test_tied_embedding_and_head_apply_own_corrections() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let w = Tensor::randn(0.0f32, 1.0, (10, 6), &device)?;
    let mut embed = Embedding::new(w.copy()?)?;
    let mut head = Linear::tied_to(&embed);

    let spec = AdapterSpec::lora(LoraConfig::new(2));
    let registry = LoraRegistry::empty()
        .with(LayerKind::Linear, "weight", ParametrizationFactory::from_linear(spec.clone()))
        .with(LayerKind::Embedding, "weight", ParametrizationFactory::from_embedding(spec));
    add_lora(&mut embed, &registry)?;
    add_lora(&mut head, &registry)?;

    let embed_vars = lora_parameters(&embed);
    let head_vars = lora_parameters(&head);
    // embedding factors are stored transposed
    assert_eq!(embed_vars[0].dims(), &[10, 2]);
    assert_eq!(embed_vars[1].dims(), &[2, 6]);
    assert_eq!(head_vars[0].dims(), &[2, 6]);
    assert_eq!(head_vars[1].dims(), &[10, 2]);

    embed_vars[1].set(&Tensor::ones((2, 6), DType::F32, &device)?)?;
    head_vars[1].set(&Tensor::ones((10, 2), DType::F32, &device)?)?;
    let delta_embed = (embed.weight.value()? - &w)?;
    let delta_head = (head.weight.value()? - &w)?;
    assert!(max_abs_diff(&delta_embed, &delta_head)? > 0.0);

    let ids = Tensor::new(&[3u32, 7], &device)?;
    let looked_up = embed.forward(&ids)?;
    assert_eq!(looked_up.dims(), &[2, 6]);
    assert!(max_abs_diff(&looked_up, &embed.weight.value()?.index_select(&ids, 0)?)? == 0.0);

    // both merges land in the shared storage
    merge_lora(&mut embed)?;
    merge_lora(&mut head)?;
    let expected = ((&w + delta_embed)? + delta_head)?;
    assert!(max_abs_diff(embed.weight.original(), &expected)? < 1e-5);
    assert!(max_abs_diff(head.weight.original(), &expected)? == 0.0);
    Ok(())
}

#[test]
fn test_optimizer_only_moves_lora_factors() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut layer = random_linear(3, 5, &device)?;
    let w = layer.weight.original().as_tensor().copy()?;
    add_lora(&mut layer, &LoraRegistry::default())?;

    let mut opt = SGD::new(lora_parameters(&layer), 0.05)?;
    let x = Tensor::randn(0.0f32, 1.0, (4, 5), &device)?;
    let target = Tensor::randn(0.0f32, 1.0, (4, 3), &device)?;
    for _ in 0..3 {
        let loss = (layer.forward(&x)? - &target)?.sqr()?.mean_all()?;
        opt.backward_step(&loss)?;
    }

    assert_eq!(max_abs_diff(layer.weight.original(), &w)?, 0.0);
    let b = &lora_parameters(&layer)[1];
    assert!(b.abs()?.max_all()?.to_scalar::<f32>()? > 0.0);
    Ok(())
}
