//! Sequential - Named container of layers

use candle_core::{Result, Tensor};

use super::{Layer, LayerKind};

/// Ordered container; children are addressed by the names they were pushed with.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<(String, Box<dyn Layer>)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: impl Into<String>, layer: impl Layer + 'static) -> Self {
        self.push(name, Box::new(layer));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, layer: Box<dyn Layer>) {
        self.layers.push((name.into(), layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for Sequential {
    fn kind(&self) -> LayerKind {
        LayerKind::Sequential
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (_, layer) in &self.layers {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }

    fn children(&self) -> Vec<(&str, &dyn Layer)> {
        self.layers
            .iter()
            .map(|(name, layer)| (name.as_str(), layer.as_ref() as &dyn Layer))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut dyn Layer)> {
        self.layers
            .iter_mut()
            .map(|(name, layer)| (name.as_str(), layer.as_mut() as &mut dyn Layer))
            .collect()
    }
}
