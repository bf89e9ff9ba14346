//! Low-rank adaptation of a frozen base model.
//!
//! The manager owns the adapter parameters; [`AdapterSet`] is the cheap
//! shared view the model's forward consults for per-layer deltas.

mod layer;
mod manager;

pub use layer::LoraLayer;
pub use manager::{AdapterManager, AdapterState, LayerState};

use crate::autograd::Tensor;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Which base-model layers receive adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLayers {
    /// Every adaptable layer.
    All,
    /// Exactly the named layers.
    Names(Vec<String>),
    /// Layers whose id starts with the prefix.
    Prefix(String),
}

impl TargetLayers {
    /// Whether a layer id is selected.
    pub fn matches(&self, layer_id: &str) -> bool {
        match self {
            TargetLayers::All => true,
            TargetLayers::Names(names) => names.iter().any(|n| n == layer_id),
            TargetLayers::Prefix(prefix) => layer_id.starts_with(prefix.as_str()),
        }
    }
}

/// Read-only adapter view passed into the model's forward pass.
///
/// Clones share the underlying parameter tensors, so a view captured by a
/// gradient-checkpoint recompute closure still routes gradients into the
/// manager's parameters. While the adapter is merged into base weights the
/// view reports no deltas, preventing double application.
#[derive(Clone)]
pub struct AdapterSet {
    pub(crate) layers: Rc<BTreeMap<String, LoraLayer>>,
    pub(crate) merged: Rc<Cell<bool>>,
}

impl AdapterSet {
    /// A view with no adapters: the base model runs unmodified.
    pub fn empty() -> Self {
        Self {
            layers: Rc::new(BTreeMap::new()),
            merged: Rc::new(Cell::new(false)),
        }
    }

    /// The additive correction for `layer_id` on a `rows x d_in` input, or
    /// `None` when the layer is not adapted (or the adapter is merged).
    pub fn delta(&self, layer_id: &str, input: &Tensor, rows: usize) -> Option<Tensor> {
        if self.merged.get() {
            return None;
        }
        self.layers.get(layer_id).map(|layer| layer.forward_delta(input, rows))
    }

    /// Number of adapted layers visible through this view.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
