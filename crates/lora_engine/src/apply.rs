//! Apply - Attach, merge and remove overlays across a layer tree
//!
//! Layers are visited depth-first, parent before children, under dotted
//! qualified names (the root is `""`, a child `fc` of `encoder` is
//! `encoder.fc`).
//!
//! None of these operations are atomic: an error partway through leaves the
//! layers visited so far already mutated. Attaching twice stacks a second
//! overlay on every targeted attribute; merging or removing where there is no
//! overlay does nothing.

use std::collections::HashMap;

use candle_core::{Result, Tensor, Var};
use tracing::{debug, info};

use crate::layers::{Layer, LayerKind};
use crate::parametrization::Parametrization;
use crate::registry::{LoraRegistry, NamedRegistry};

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Visits every layer with its qualified name
pub fn visit_mut(
    layer: &mut dyn Layer,
    name: &str,
    f: &mut dyn FnMut(&str, &mut dyn Layer) -> Result<()>,
) -> Result<()> {
    f(name, &mut *layer)?;
    for (child, sub) in layer.children_mut() {
        visit_mut(sub, &qualify(name, child), f)?;
    }
    Ok(())
}

pub fn visit(layer: &dyn Layer, name: &str, f: &mut dyn FnMut(&str, &dyn Layer)) {
    f(name, layer);
    for (child, sub) in layer.children() {
        visit(sub, &qualify(name, child), f);
    }
}

/// Qualified names and kinds in traversal order
pub fn named_layers(network: &dyn Layer) -> Vec<(String, LayerKind)> {
    let mut out = Vec::new();
    visit(network, "", &mut |name, layer| {
        out.push((name.to_string(), layer.kind()));
    });
    out
}

/// Layers that match `matches`, or sit below a layer that does.
fn visit_selected_mut(
    layer: &mut dyn Layer,
    name: &str,
    inherited: bool,
    matches: &dyn Fn(&str) -> bool,
    f: &mut dyn FnMut(&str, &mut dyn Layer) -> Result<()>,
) -> Result<()> {
    let selected = inherited || matches(name);
    if selected {
        f(name, &mut *layer)?;
    }
    for (child, sub) in layer.children_mut() {
        visit_selected_mut(sub, &qualify(name, child), selected, matches, f)?;
    }
    Ok(())
}

fn contains_any<'a>(fragments: &'a [&'a str]) -> impl Fn(&str) -> bool + 'a {
    move |name: &str| fragments.iter().any(|frag| name.contains(frag))
}

fn equals_any<'a>(names: &'a [&'a str]) -> impl Fn(&str) -> bool + 'a {
    move |name: &str| names.iter().any(|n| *n == name)
}

/// Registers overlays on one layer according to `registry`.
/// Returns how many overlays were registered.
fn attach_layer(name: &str, layer: &mut dyn Layer, registry: &LoraRegistry) -> Result<usize> {
    let Some(targets) = registry.targets(layer.kind()) else {
        return Ok(0);
    };
    let mut registered = 0;
    for (attr, factory) in targets {
        let overlay = factory.build(&*layer, attr)?;
        let Some(param) = layer.parameter_mut(attr) else {
            candle_core::bail!("layer `{name}` has no parameter `{attr}`");
        };
        if param.is_parametrized() {
            debug!("stacking a second overlay on `{name}`.{attr}");
        }
        param.push_overlay(overlay)?;
        debug!("registered LoRA on `{name}`.{attr}");
        registered += 1;
    }
    Ok(registered)
}

fn merge_layer(name: &str, layer: &mut dyn Layer) -> Result<usize> {
    let mut merged = 0;
    for (attr, param) in layer.parameters_mut() {
        let n = param.merge()?;
        if n > 0 {
            debug!("merged {n} overlay(s) into `{name}`.{attr}");
        }
        merged += n;
    }
    Ok(merged)
}

fn remove_layer(name: &str, layer: &mut dyn Layer) -> usize {
    let mut removed = 0;
    for (attr, param) in layer.parameters_mut() {
        let n = param.remove();
        if n > 0 {
            debug!("removed {n} overlay(s) from `{name}`.{attr}");
        }
        removed += n;
    }
    removed
}

/// Attaches overlays to every layer whose kind is in `registry`.
pub fn add_lora(network: &mut dyn Layer, registry: &LoraRegistry) -> Result<usize> {
    let mut total = 0;
    visit_mut(network, "", &mut |name, layer| {
        total += attach_layer(name, layer, registry)?;
        Ok(())
    })?;
    info!("add_lora: registered {total} overlay(s)");
    Ok(total)
}

/// Like [`add_lora`], restricted to layers whose qualified name, or the
/// name of one of their ancestors, contains any of `target_names`.
/// Each selected layer is visited once per call.
pub fn add_lora_by_name(
    network: &mut dyn Layer,
    target_names: &[&str],
    registry: &LoraRegistry,
) -> Result<usize> {
    let mut total = 0;
    let matches = contains_any(target_names);
    visit_selected_mut(network, "", false, &matches, &mut |name, layer| {
        total += attach_layer(name, layer, registry)?;
        Ok(())
    })?;
    info!("add_lora_by_name({target_names:?}): registered {total} overlay(s)");
    Ok(total)
}

/// Attaches `named[name]` to the subtree rooted at each layer whose
/// qualified name is a key of `named`.
///
/// Nested keys stack: a layer below both `encoder` and `encoder.fc2` gets the
/// outer registry's overlays first, then the inner one's. Two registries
/// targeting the same attribute leave it with two overlays.
pub fn add_lora_by_layer_names(network: &mut dyn Layer, named: &NamedRegistry) -> Result<usize> {
    fn walk<'a>(
        layer: &mut dyn Layer,
        name: &str,
        active: &mut Vec<&'a LoraRegistry>,
        named: &'a NamedRegistry,
        total: &mut usize,
    ) -> Result<()> {
        let own = named.get(name);
        if let Some(registry) = own {
            active.push(registry);
        }
        for registry in active.iter() {
            *total += attach_layer(name, &mut *layer, registry)?;
        }
        for (child, sub) in layer.children_mut() {
            walk(sub, &qualify(name, child), active, named, total)?;
        }
        if own.is_some() {
            active.pop();
        }
        Ok(())
    }

    let mut total = 0;
    walk(network, "", &mut Vec::new(), named, &mut total)?;
    info!("add_lora_by_layer_names: registered {total} overlay(s)");
    Ok(total)
}

/// Folds every overlay into its parameter's storage and drops it.
pub fn merge_lora(network: &mut dyn Layer) -> Result<usize> {
    let mut total = 0;
    visit_mut(network, "", &mut |name, layer| {
        total += merge_layer(name, layer)?;
        Ok(())
    })?;
    info!("merge_lora: merged {total} overlay(s)");
    Ok(total)
}

/// Drops every overlay without touching the original storage.
pub fn remove_lora(network: &mut dyn Layer) -> Result<usize> {
    let mut total = 0;
    visit_mut(network, "", &mut |name, layer| {
        total += remove_layer(name, layer);
        Ok(())
    })?;
    info!("remove_lora: removed {total} overlay(s)");
    Ok(total)
}

/// [`merge_lora`] restricted as in [`add_lora_by_name`].
pub fn merge_lora_by_name(network: &mut dyn Layer, target_names: &[&str]) -> Result<usize> {
    let mut total = 0;
    let matches = contains_any(target_names);
    visit_selected_mut(network, "", false, &matches, &mut |name, layer| {
        total += merge_layer(name, layer)?;
        Ok(())
    })?;
    info!("merge_lora_by_name({target_names:?}): merged {total} overlay(s)");
    Ok(total)
}

/// [`remove_lora`] restricted as in [`add_lora_by_name`].
pub fn remove_lora_by_name(network: &mut dyn Layer, target_names: &[&str]) -> Result<usize> {
    let mut total = 0;
    let matches = contains_any(target_names);
    visit_selected_mut(network, "", false, &matches, &mut |name, layer| {
        total += remove_layer(name, layer);
        Ok(())
    })?;
    info!("remove_lora_by_name({target_names:?}): removed {total} overlay(s)");
    Ok(total)
}

/// [`merge_lora`] restricted to the subtrees rooted at the layers named
/// exactly by `layer_names`.
pub fn merge_lora_by_layer_names(network: &mut dyn Layer, layer_names: &[&str]) -> Result<usize> {
    let mut total = 0;
    let matches = equals_any(layer_names);
    visit_selected_mut(network, "", false, &matches, &mut |name, layer| {
        total += merge_layer(name, layer)?;
        Ok(())
    })?;
    info!("merge_lora_by_layer_names({layer_names:?}): merged {total} overlay(s)");
    Ok(total)
}

/// [`remove_lora`] restricted as in [`merge_lora_by_layer_names`].
pub fn remove_lora_by_layer_names(network: &mut dyn Layer, layer_names: &[&str]) -> Result<usize> {
    let mut total = 0;
    let matches = equals_any(layer_names);
    visit_selected_mut(network, "", false, &matches, &mut |name, layer| {
        total += remove_layer(name, layer);
        Ok(())
    })?;
    info!("remove_lora_by_layer_names({layer_names:?}): removed {total} overlay(s)");
    Ok(total)
}

/// Like [`visit_mut`] for closures that cannot fail
fn visit_each_mut(layer: &mut dyn Layer, f: &mut dyn FnMut(&mut dyn Layer)) {
    f(&mut *layer);
    for (_, sub) in layer.children_mut() {
        visit_each_mut(sub, f);
    }
}

fn for_each_overlay_mut(
    network: &mut dyn Layer,
    f: &mut dyn FnMut(&mut dyn Parametrization),
) {
    visit_each_mut(network, &mut |layer| {
        for (_, param) in layer.parameters_mut() {
            for overlay in param.overlays_mut() {
                f(overlay.as_mut());
            }
        }
    });
}

pub fn enable_lora(network: &mut dyn Layer) {
    for_each_overlay_mut(network, &mut |o| o.enable());
}

pub fn disable_lora(network: &mut dyn Layer) {
    for_each_overlay_mut(network, &mut |o| o.disable());
}

/// Switches dropout sampling on or off for every overlay
pub fn set_lora_training(network: &mut dyn Layer, training: bool) {
    for_each_overlay_mut(network, &mut |o| o.set_training(training));
}

/// Trainable factors of every overlay, in traversal order. Frozen factors
/// and the host's own weights are not included.
pub fn lora_parameters(network: &dyn Layer) -> Vec<Var> {
    let mut vars = Vec::new();
    visit(network, "", &mut |_, layer| {
        for (_, param) in layer.parameters() {
            for overlay in param.overlays() {
                vars.extend(overlay.trainable_vars());
            }
        }
    });
    vars
}

pub fn count_lora_parameters(network: &dyn Layer) -> usize {
    lora_parameters(network)
        .iter()
        .map(|v| v.elem_count())
        .sum()
}

/// Every overlay tensor keyed `{layer}.{attr}.lora.{index}.{tensor}`
pub fn lora_state_dict(network: &dyn Layer) -> HashMap<String, Tensor> {
    let mut state = HashMap::new();
    visit(network, "", &mut |name, layer| {
        for (attr, param) in layer.parameters() {
            let base = qualify(name, attr);
            for (i, overlay) in param.overlays().iter().enumerate() {
                for (key, tensor) in overlay.named_tensors() {
                    state.insert(format!("{base}.lora.{i}.{key}"), tensor);
                }
            }
        }
    });
    state
}
