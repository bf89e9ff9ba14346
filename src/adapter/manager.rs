//! Ownership and lifecycle of the adapter parameters layered onto a frozen
//! base model: attach, forward view, merge/unmerge, and composer-keyed
//! persistence.

use super::layer::LoraLayer;
use super::{AdapterSet, TargetLayers};
use crate::autograd::Tensor;
use crate::data::sequence::Composer;
use crate::error::{Error, Result};
use crate::model::BaseModel;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::rc::Rc;

const ADAPTER_FORMAT_VERSION: &str = "1.0";

/// Serializable adapter parameters, keyed by composer identity.
///
/// Only adapter matrices are persisted — never base weights — so one frozen
/// base can carry an adapter set per composer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterState {
    pub(crate) version: String,
    pub composer: Composer,
    pub rank: usize,
    pub alpha: f32,
    pub layers: Vec<LayerState>,
}

/// One layer's persisted matrices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerState {
    pub id: String,
    pub d_in: usize,
    pub d_out: usize,
    pub a: Vec<f32>,
    pub b: Vec<f32>,
}

/// Owns the low-rank adapters for one (base model, composer) pairing.
#[derive(Debug)]
pub struct AdapterManager {
    composer: Composer,
    rank: usize,
    alpha: f32,
    layers: BTreeMap<String, LoraLayer>,
    merged: Rc<Cell<bool>>,
    premerge: Option<BTreeMap<String, Array1<f32>>>,
}

impl AdapterManager {
    /// Install adapters on every model layer matching `target`.
    ///
    /// Base weights are untouched; they simply stay outside the gradient
    /// tape. Fails with [`Error::UnknownLayer`] when an explicitly named
    /// target does not exist, and with [`Error::InvalidConfig`] when the
    /// selector matches nothing or the rank is zero.
    pub fn attach(
        model: &dyn BaseModel,
        composer: Composer,
        rank: usize,
        alpha: f32,
        target: &TargetLayers,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(Error::InvalidConfig("adapter rank must be positive".into()));
        }
        let specs = model.layer_specs();
        if let TargetLayers::Names(names) = target {
            for name in names {
                if !specs.iter().any(|s| &s.id == name) {
                    return Err(Error::UnknownLayer(name.clone()));
                }
            }
        }

        let layers: BTreeMap<String, LoraLayer> = specs
            .iter()
            .filter(|s| target.matches(&s.id))
            .map(|s| (s.id.clone(), LoraLayer::new(s.d_in, s.d_out, rank, alpha)))
            .collect();
        if layers.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "target selector {target:?} matches no model layer"
            )));
        }

        Ok(Self {
            composer,
            rank,
            alpha,
            layers,
            merged: Rc::new(Cell::new(false)),
            premerge: None,
        })
    }

    /// Cheap shared view for the model's forward delta hook.
    pub fn adapter_set(&self) -> AdapterSet {
        AdapterSet {
            layers: Rc::new(self.layers.clone()),
            merged: Rc::clone(&self.merged),
        }
    }

    /// All trainable tensors, in stable layer order.
    pub fn trainable_params(&self) -> Vec<Tensor> {
        self.layers.values().flat_map(LoraLayer::trainable_params).collect()
    }

    /// Trainable parameter count.
    pub fn num_trainable(&self) -> usize {
        self.layers.values().map(LoraLayer::num_params).sum()
    }

    /// Clear all adapter gradients.
    pub fn zero_grads(&self) {
        for param in self.trainable_params() {
            param.zero_grad();
        }
    }

    /// Fold `alpha/r * B A` into the model's working weights for faster
    /// inference. With `retain_premerge` the original weights are kept so
    /// [`unmerge`](Self::unmerge) can restore them; otherwise the fold is
    /// one-way. While merged, the forward delta hook goes quiet so the
    /// correction is never applied twice.
    pub fn merge(&mut self, model: &dyn BaseModel, retain_premerge: bool) -> Result<()> {
        if self.merged.get() {
            return Ok(());
        }
        let mut retained = retain_premerge.then(BTreeMap::new);
        for (id, layer) in &self.layers {
            let weight = self
                .resolve_weight(model, id)?;
            if let Some(store) = retained.as_mut() {
                store.insert(id.clone(), weight.data().clone());
            }
            let delta = layer.delta_matrix();
            let mut data = weight.data_mut();
            *data = &*data + &delta;
        }
        self.premerge = retained;
        self.merged.set(true);
        Ok(())
    }

    /// Restore the retained pre-merge weights bit-for-bit.
    ///
    /// Fails with [`Error::UnmergeUnavailable`] if the merge did not retain
    /// them; recover by reloading base weights from their checkpoint.
    pub fn unmerge(&mut self, model: &dyn BaseModel) -> Result<()> {
        if !self.merged.get() {
            return Ok(());
        }
        let premerge = self.premerge.take().ok_or(Error::UnmergeUnavailable)?;
        for (id, original) in premerge {
            let weight = self.resolve_weight(model, &id)?;
            *weight.data_mut() = original;
        }
        self.merged.set(false);
        Ok(())
    }

    /// Whether the adapter is currently folded into the base weights.
    pub fn is_merged(&self) -> bool {
        self.merged.get()
    }

    fn resolve_weight(&self, model: &dyn BaseModel, id: &str) -> Result<Tensor> {
        model
            .layer_weight(id)
            .ok_or_else(|| Error::UnknownLayer(id.to_string()))
    }

    /// Snapshot the adapter parameters.
    pub fn state(&self) -> AdapterState {
        AdapterState {
            version: ADAPTER_FORMAT_VERSION.to_string(),
            composer: self.composer,
            rank: self.rank,
            alpha: self.alpha,
            layers: self
                .layers
                .iter()
                .map(|(id, layer)| LayerState {
                    id: id.clone(),
                    d_in: layer.d_in(),
                    d_out: layer.d_out(),
                    a: layer.lora_a().data().to_vec(),
                    b: layer.lora_b().data().to_vec(),
                })
                .collect(),
        }
    }

    /// Rebuild a manager from persisted state, validating every layer
    /// against the model's specs.
    pub fn from_state(state: AdapterState, model: &dyn BaseModel) -> Result<Self> {
        if state.version != ADAPTER_FORMAT_VERSION {
            return Err(Error::AdapterValidation(format!(
                "unsupported adapter version {} (expected {ADAPTER_FORMAT_VERSION})",
                state.version
            )));
        }
        let specs = model.layer_specs();
        let mut layers = BTreeMap::new();
        for layer_state in state.layers {
            let spec = specs
                .iter()
                .find(|s| s.id == layer_state.id)
                .ok_or_else(|| Error::UnknownLayer(layer_state.id.clone()))?;
            if spec.d_in != layer_state.d_in || spec.d_out != layer_state.d_out {
                return Err(Error::AdapterValidation(format!(
                    "layer {}: expected {}x{}, adapter carries {}x{}",
                    layer_state.id, spec.d_out, spec.d_in, layer_state.d_out, layer_state.d_in
                )));
            }
            if layer_state.a.len() != state.rank * spec.d_in
                || layer_state.b.len() != spec.d_out * state.rank
            {
                return Err(Error::AdapterValidation(format!(
                    "layer {}: matrix sizes inconsistent with rank {}",
                    layer_state.id, state.rank
                )));
            }
            let mut layer = LoraLayer::new(spec.d_in, spec.d_out, state.rank, state.alpha);
            layer.set_weights(layer_state.a, layer_state.b);
            layers.insert(layer_state.id, layer);
        }
        if layers.is_empty() {
            return Err(Error::AdapterValidation("adapter state has no layers".into()));
        }
        Ok(Self {
            composer: state.composer,
            rank: state.rank,
            alpha: state.alpha,
            layers,
            merged: Rc::new(Cell::new(false)),
            premerge: None,
        })
    }

    /// Persist adapter parameters (only) to versioned JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), &self.state())?;
        Ok(())
    }

    /// Load adapter parameters and validate them against `model`.
    pub fn load(path: impl AsRef<Path>, model: &dyn BaseModel) -> Result<Self> {
        let file = File::open(path)?;
        let state: AdapterState = serde_json::from_reader(BufReader::new(file))?;
        Self::from_state(state, model)
    }

    /// Composer this adapter set is keyed by.
    pub fn composer(&self) -> Composer {
        self.composer
    }

    /// Adapter rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Adapted layer ids, in stable order.
    pub fn layer_ids(&self) -> Vec<&str> {
        self.layers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseModel, ForwardOptions, FrozenLanguageModel};
    use tempfile::tempdir;

    fn model() -> FrozenLanguageModel {
        FrozenLanguageModel::synthetic(32, 4, 2, 16)
    }

    fn manager(model: &FrozenLanguageModel) -> AdapterManager {
        AdapterManager::attach(model, Composer::Bach, 2, 4.0, &TargetLayers::All).unwrap()
    }

    #[test]
    fn test_attach_all_layers() {
        let model = model();
        let mgr = manager(&model);
        assert_eq!(mgr.layer_ids(), vec!["block0.proj", "block1.proj", "head"]);
        // blocks: A 2x4 + B 4x2 = 16 each; head: A 2x4 + B 32x2 = 72
        assert_eq!(mgr.num_trainable(), 16 + 16 + 72);
    }

    #[test]
    fn test_attach_by_prefix_and_names() {
        let model = model();
        let mgr = AdapterManager::attach(
            &model,
            Composer::Bach,
            2,
            4.0,
            &TargetLayers::Prefix("block".into()),
        )
        .unwrap();
        assert_eq!(mgr.layer_ids(), vec!["block0.proj", "block1.proj"]);

        let mgr = AdapterManager::attach(
            &model,
            Composer::Bach,
            2,
            4.0,
            &TargetLayers::Names(vec!["head".into()]),
        )
        .unwrap();
        assert_eq!(mgr.layer_ids(), vec!["head"]);
    }

    #[test]
    fn test_attach_unknown_layer_rejected() {
        let model = model();
        let err = AdapterManager::attach(
            &model,
            Composer::Bach,
            2,
            4.0,
            &TargetLayers::Names(vec!["block9.proj".into()]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownLayer(_)));
    }

    #[test]
    fn test_attach_empty_selector_rejected() {
        let model = model();
        let err = AdapterManager::attach(
            &model,
            Composer::Bach,
            2,
            4.0,
            &TargetLayers::Prefix("nothing".into()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_fresh_adapters_leave_forward_unchanged() {
        let model = model();
        let mgr = manager(&model);
        let tokens = [13, 14, 15];
        let plain = model.forward(&tokens, &AdapterSet::empty(), &ForwardOptions::default());
        let adapted = model.forward(&tokens, &mgr.adapter_set(), &ForwardOptions::default());
        assert_eq!(plain.data().to_vec(), adapted.data().to_vec());
        assert!(adapted.requires_grad(), "adapter path must join the tape");
    }

    #[test]
    fn test_merge_unmerge_round_trip_bit_exact() {
        let model = model();
        let mut mgr = manager(&model);
        // Give the adapter a non-zero correction.
        for param in mgr.trainable_params() {
            param.data_mut().mapv_inplace(|_| 0.25);
        }
        let before: Vec<Vec<f32>> = mgr
            .layer_ids()
            .into_iter()
            .map(|id| model.layer_weight(id).unwrap().data().to_vec())
            .collect();

        mgr.merge(&model, true).unwrap();
        assert!(mgr.is_merged());
        let merged_w = model.layer_weight("block0.proj").unwrap().data().to_vec();
        assert_ne!(merged_w, before[0]);

        mgr.unmerge(&model).unwrap();
        assert!(!mgr.is_merged());
        for (id, original) in mgr.layer_ids().into_iter().zip(before.iter()) {
            let restored = model.layer_weight(id).unwrap().data().to_vec();
            assert_eq!(&restored, original, "layer {id} must restore bit-for-bit");
        }
    }

    #[test]
    fn test_merged_forward_matches_adapted_forward() {
        let model = model();
        let mut mgr = manager(&model);
        for param in mgr.trainable_params() {
            param.data_mut().mapv_inplace(|_| 0.1);
        }
        let tokens = [20, 21, 22];
        let adapted = model.forward(&tokens, &mgr.adapter_set(), &ForwardOptions::default());

        mgr.merge(&model, true).unwrap();
        let merged = model.forward(&tokens, &mgr.adapter_set(), &ForwardOptions::default());
        for (a, m) in adapted.data().iter().zip(merged.data().iter()) {
            assert!((a - m).abs() < 1e-4, "adapted {a} vs merged {m}");
        }
        mgr.unmerge(&model).unwrap();
    }

    #[test]
    fn test_unmerge_without_retention_fails() {
        let model = model();
        let mut mgr = manager(&model);
        mgr.merge(&model, false).unwrap();
        assert!(matches!(mgr.unmerge(&model).unwrap_err(), Error::UnmergeUnavailable));
    }

    #[test]
    fn test_unmerge_when_not_merged_is_noop() {
        let model = model();
        let mut mgr = manager(&model);
        assert!(mgr.unmerge(&model).is_ok());
    }

    #[test]
    fn test_save_load_round_trip() {
        let model = model();
        let mgr = manager(&model);
        for param in mgr.trainable_params() {
            param.data_mut().mapv_inplace(|v| v + 0.5);
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}-adapter.json", mgr.composer()));
        mgr.save(&path).unwrap();

        let loaded = AdapterManager::load(&path, &model).unwrap();
        assert_eq!(loaded.composer(), Composer::Bach);
        assert_eq!(loaded.rank(), 2);
        let tokens = [13, 19];
        let a = model.forward(&tokens, &mgr.adapter_set(), &ForwardOptions::default());
        let b = model.forward(&tokens, &loaded.adapter_set(), &ForwardOptions::default());
        assert_eq!(a.data().to_vec(), b.data().to_vec());
    }

    #[test]
    fn test_load_rejects_dimension_mismatch() {
        let model = model();
        let mgr = manager(&model);
        let dir = tempdir().unwrap();
        let path = dir.path().join("adapter.json");
        mgr.save(&path).unwrap();

        let other = FrozenLanguageModel::synthetic(32, 8, 2, 16);
        let err = AdapterManager::load(&path, &other).unwrap_err();
        assert!(matches!(err, Error::AdapterValidation(_)));
    }
}
