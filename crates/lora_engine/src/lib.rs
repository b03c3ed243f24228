//! LoRA Engine
//!
//! Low-rank adaptation as a parametrization of existing layer weights.
//! A frozen weight W is read as `W + alpha / r * B @ A` while an overlay is
//! attached; overlays are attached, merged and removed across a whole layer
//! tree by layer kind or by name.
//!
//! ```ignore
//! use lora_engine::{add_lora, merge_lora, LoraRegistry};
//!
//! add_lora(&mut model, &LoraRegistry::default())?;
//! // ... train lora_engine::lora_parameters(&model) ...
//! merge_lora(&mut model)?;
//! ```

pub mod apply;
pub mod config;
pub mod layers;
pub mod linalg;
pub mod lora;
pub mod lora_fa;
pub mod parametrization;
pub mod registry;

pub use apply::{
    add_lora, add_lora_by_layer_names, add_lora_by_name, count_lora_parameters, disable_lora,
    enable_lora, lora_parameters, lora_state_dict, merge_lora, merge_lora_by_layer_names,
    merge_lora_by_name, named_layers, remove_lora, remove_lora_by_layer_names,
    remove_lora_by_name, set_lora_training,
};
pub use config::{NamedRegistryConfig, RegistryConfig};
pub use layers::{Layer, LayerKind, Parameter};
pub use lora::{InitMethod, LoraConfig, LoraParametrization};
pub use lora_fa::LoraFaParametrization;
pub use parametrization::{OverlayState, Parametrization};
pub use registry::{
    AdapterSpec, AdapterVariant, LoraRegistry, NamedRegistry, ParametrizationFactory,
};
