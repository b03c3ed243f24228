//! RegistryConfig - Serializable description of a registry
//!
//! ```json
//! {
//!   "linear":    { "weight": { "rank": 8, "alpha": 16 } },
//!   "embedding": { "weight": { "rank": 4, "variant": "lora_fa", "init_method": "svd" } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::Result;
use serde::{Deserialize, Serialize};

use crate::layers::LayerKind;
use crate::registry::{AdapterSpec, LoraRegistry, NamedRegistry, ParametrizationFactory};

/// Layer kind -> attribute -> adapter spec
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryConfig {
    pub targets: BTreeMap<LayerKind, BTreeMap<String, AdapterSpec>>,
}

impl RegistryConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(candle_core::Error::wrap)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(candle_core::Error::wrap)
    }

    /// Every entry gets the canonical factory for its layer kind.
    pub fn build(&self) -> Result<LoraRegistry> {
        let mut registry = LoraRegistry::empty();
        for (&kind, attrs) in &self.targets {
            for (attr, spec) in attrs {
                spec.config.validate()?;
                let Some(factory) = ParametrizationFactory::canonical(kind, spec.clone()) else {
                    candle_core::bail!("no canonical LoRA factory for {kind:?} layers");
                };
                registry.insert(kind, attr.clone(), factory);
            }
        }
        Ok(registry)
    }
}

/// Exact layer name -> registry config
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamedRegistryConfig {
    pub layers: BTreeMap<String, RegistryConfig>,
}

impl NamedRegistryConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(candle_core::Error::wrap)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn build(&self) -> Result<NamedRegistry> {
        let mut named = NamedRegistry::new();
        for (name, config) in &self.layers {
            named.insert(name.clone(), config.build()?);
        }
        Ok(named)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::InitMethod;
    use crate::registry::AdapterVariant;
    use std::io::Write;

    const CONFIG: &str = r#"{
        "linear": { "weight": { "rank": 8, "alpha": 16 } },
        "embedding": { "weight": { "rank": 2, "variant": "lora_fa", "init_method": "svd" } }
    }"#;

    #[test]
    fn test_parse_and_build() -> anyhow::Result<()> {
        let cfg = RegistryConfig::from_json_str(CONFIG)?;
        let linear = &cfg.targets[&LayerKind::Linear]["weight"];
        assert_eq!(linear.config.rank, 8);
        assert_eq!(linear.config.scaling(), 2.0);
        let emb = &cfg.targets[&LayerKind::Embedding]["weight"];
        assert_eq!(emb.variant, AdapterVariant::LoraFa);
        assert_eq!(emb.config.init_method, InitMethod::Svd);

        let registry = cfg.build()?;
        assert!(registry.contains(LayerKind::Linear));
        assert!(registry.contains(LayerKind::Embedding));
        assert!(!registry.contains(LayerKind::Conv2d));
        Ok(())
    }

    #[test]
    fn test_round_trip_through_file() -> anyhow::Result<()> {
        let cfg = RegistryConfig::from_json_str(CONFIG)?;
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(cfg.to_json_string()?.as_bytes())?;
        let loaded = RegistryConfig::from_json_file(file.path())?;
        assert_eq!(loaded, cfg);
        Ok(())
    }

    #[test]
    fn test_invalid_entries_are_rejected() -> anyhow::Result<()> {
        let bad_rank = RegistryConfig::from_json_str(r#"{"linear": {"weight": {"rank": 0}}}"#)?;
        assert!(bad_rank.build().is_err());

        let no_factory = RegistryConfig::from_json_str(r#"{"sequential": {"weight": {}}}"#)?;
        assert!(no_factory.build().is_err());

        assert!(RegistryConfig::from_json_str(r#"{"transformer": {}}"#).is_err());
        Ok(())
    }

    #[test]
    fn test_named_config() -> anyhow::Result<()> {
        let json = r#"{
            "encoder.fc1": { "linear": { "weight": { "rank": 1 } } },
            "head": { "linear": { "weight": { "rank": 2 } } }
        }"#;
        let named = NamedRegistryConfig::from_json_str(json)?.build()?;
        assert_eq!(named.names().collect::<Vec<_>>(), vec!["encoder.fc1", "head"]);
        assert!(named.get("encoder").is_none());
        Ok(())
    }
}
