//! Registry - Which attributes of which layers receive an overlay
//!
//! A [`LoraRegistry`] maps a [`LayerKind`] to attribute names, each with a
//! [`ParametrizationFactory`] that builds the overlay from the live layer.
//! A [`NamedRegistry`] maps exact qualified layer names to whole registries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::layers::{Layer, LayerKind, Parameter};
use crate::lora::{InitMethod, LoraConfig, LoraParametrization};
use crate::lora_fa::LoraFaParametrization;
use crate::parametrization::Parametrization;

/// Which factorization a factory produces
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterVariant {
    #[default]
    Lora,
    /// Frozen-A variant (LoRA-FA)
    LoraFa,
}

/// A LoRA configuration together with the variant to build
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    #[serde(default)]
    pub variant: AdapterVariant,
    #[serde(flatten)]
    pub config: LoraConfig,
}

impl AdapterSpec {
    pub fn lora(config: LoraConfig) -> Self {
        Self {
            variant: AdapterVariant::Lora,
            config,
        }
    }

    pub fn lora_fa(config: LoraConfig) -> Self {
        Self {
            variant: AdapterVariant::LoraFa,
            config,
        }
    }

    /// Builds the overlay for a (fan_out, fan_in)-oriented factorization.
    pub fn build(
        &self,
        fan_in: usize,
        fan_out: usize,
        fan_in_fan_out: bool,
        original_weights: Option<&Tensor>,
        device: &candle_core::Device,
    ) -> Result<Box<dyn Parametrization>> {
        let cfg = &self.config;
        Ok(match self.variant {
            AdapterVariant::Lora => Box::new(LoraParametrization::new(
                fan_in,
                fan_out,
                fan_in_fan_out,
                cfg,
                original_weights,
                device,
            )?),
            AdapterVariant::LoraFa => Box::new(LoraFaParametrization::new(
                fan_in,
                fan_out,
                fan_in_fan_out,
                cfg,
                original_weights,
                device,
            )?),
        })
    }
}

type FactoryFn = dyn Fn(&dyn Layer, &str) -> Result<Box<dyn Parametrization>> + Send + Sync;

/// Builds an overlay for attribute `attr` of a live layer
#[derive(Clone)]
pub struct ParametrizationFactory(Arc<FactoryFn>);

impl fmt::Debug for ParametrizationFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ParametrizationFactory")
    }
}

impl ParametrizationFactory {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&dyn Layer, &str) -> Result<Box<dyn Parametrization>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn build(&self, layer: &dyn Layer, attr: &str) -> Result<Box<dyn Parametrization>> {
        (self.0)(layer, attr)
    }

    /// Dense layer: weight read as (fan_out, fan_in)
    pub fn from_linear(spec: AdapterSpec) -> Self {
        Self::new(move |layer, attr| {
            let param = lookup(layer, attr)?;
            let (fan_out, fan_in) = param.original().dims2()?;
            build_for(&spec, param, fan_in, fan_out, false)
        })
    }

    /// Convolution: kernel flattened to (out, in / groups * kh * kw)
    pub fn from_conv2d(spec: AdapterSpec) -> Self {
        Self::new(move |layer, attr| {
            let param = lookup(layer, attr)?;
            let dims = param.original().dims();
            let Some((&fan_out, rest)) = dims.split_first() else {
                candle_core::bail!("{:?} layer parameter `{attr}` is a scalar", layer.kind());
            };
            let fan_in = rest.iter().product();
            build_for(&spec, param, fan_in, fan_out, false)
        })
    }

    /// Embedding: weight read as (fan_in, fan_out) with the layout flag set
    pub fn from_embedding(spec: AdapterSpec) -> Self {
        Self::new(move |layer, attr| {
            let param = lookup(layer, attr)?;
            let (fan_in, fan_out) = param.original().dims2()?;
            build_for(&spec, param, fan_in, fan_out, true)
        })
    }

    /// Canonical factory for `kind`, if there is one
    pub fn canonical(kind: LayerKind, spec: AdapterSpec) -> Option<Self> {
        match kind {
            LayerKind::Linear => Some(Self::from_linear(spec)),
            LayerKind::Conv2d => Some(Self::from_conv2d(spec)),
            LayerKind::Embedding => Some(Self::from_embedding(spec)),
            LayerKind::Activation | LayerKind::Sequential => None,
        }
    }
}

fn lookup<'a>(layer: &'a dyn Layer, attr: &str) -> Result<&'a Parameter> {
    match layer.parameter(attr) {
        Some(param) => Ok(param),
        None => candle_core::bail!("{:?} layer has no parameter `{attr}`", layer.kind()),
    }
}

/// svd init factorizes the value the layer currently exposes
fn build_for(
    spec: &AdapterSpec,
    param: &Parameter,
    fan_in: usize,
    fan_out: usize,
    fan_in_fan_out: bool,
) -> Result<Box<dyn Parametrization>> {
    let device = param.original().device().clone();
    let weights = match spec.config.init_method {
        InitMethod::Svd => Some(param.value()?.detach()),
        InitMethod::Kaiming => None,
    };
    spec.build(fan_in, fan_out, fan_in_fan_out, weights.as_ref(), &device)
}

/// Layer kind -> attribute -> factory
#[derive(Clone, Debug)]
pub struct LoraRegistry {
    targets: BTreeMap<LayerKind, BTreeMap<String, ParametrizationFactory>>,
}

impl Default for LoraRegistry {
    /// Dense layers only, attribute `weight`, rank 4
    fn default() -> Self {
        Self::empty().with(
            LayerKind::Linear,
            "weight",
            ParametrizationFactory::from_linear(AdapterSpec::lora(LoraConfig::new(4))),
        )
    }
}

impl LoraRegistry {
    pub fn empty() -> Self {
        Self {
            targets: BTreeMap::new(),
        }
    }

    pub fn with(
        mut self,
        kind: LayerKind,
        attr: impl Into<String>,
        factory: ParametrizationFactory,
    ) -> Self {
        self.insert(kind, attr, factory);
        self
    }

    /// Canonical factory for `kind` with the given spec.
    pub fn with_spec(self, kind: LayerKind, attr: impl Into<String>, spec: AdapterSpec) -> Result<Self> {
        let Some(factory) = ParametrizationFactory::canonical(kind, spec) else {
            candle_core::bail!("no canonical LoRA factory for {kind:?} layers");
        };
        Ok(self.with(kind, attr, factory))
    }

    pub fn insert(&mut self, kind: LayerKind, attr: impl Into<String>, factory: ParametrizationFactory) {
        self.targets
            .entry(kind)
            .or_default()
            .insert(attr.into(), factory);
    }

    pub fn targets(&self, kind: LayerKind) -> Option<&BTreeMap<String, ParametrizationFactory>> {
        self.targets.get(&kind)
    }

    pub fn contains(&self, kind: LayerKind) -> bool {
        self.targets.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = LayerKind> + '_ {
        self.targets.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Exact qualified layer name -> registry applied to that layer's subtree
#[derive(Clone, Debug, Default)]
pub struct NamedRegistry {
    by_name: BTreeMap<String, LoraRegistry>,
}

impl NamedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, registry: LoraRegistry) -> Self {
        self.insert(name, registry);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, registry: LoraRegistry) {
        self.by_name.insert(name.into(), registry);
    }

    pub fn get(&self, name: &str) -> Option<&LoraRegistry> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
