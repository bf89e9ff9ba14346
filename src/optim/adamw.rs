//! AdamW: Adam with decoupled weight decay.
//!
//! Weight decay is applied directly to the parameters instead of being mixed
//! into the gradient:
//! `θ_t = (1 - lr·λ)·θ_{t-1} - lr_t · m̂_t / (√v̂_t + ε)`.
//!
//! Moment buffers are exportable so a training run can resume from a disk
//! snapshot with bitwise-identical continuation.

use super::Optimizer;
use crate::autograd::Tensor;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// AdamW optimizer over a fixed parameter list.
#[derive(Debug)]
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    m: Vec<Option<Array1<f32>>>,
    v: Vec<Option<Array1<f32>>>,
}

/// Serializable optimizer state for snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub t: u64,
    pub m: Vec<Option<Vec<f32>>>,
    pub v: Vec<Option<Vec<f32>>>,
}

impl AdamW {
    /// Full-control constructor.
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Standard hyperparameters (β=0.9/0.999, ε=1e-8, weight decay 0.01).
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.01)
    }

    fn ensure_moments(&mut self, n: usize) {
        if self.m.len() < n {
            self.m.resize(n, None);
            self.v.resize(n, None);
        }
    }

    /// Optimizer step counter.
    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.t
    }

    /// Export moments and step counter for a snapshot.
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            t: self.t,
            m: self.m.iter().map(|m| m.as_ref().map(|a| a.to_vec())).collect(),
            v: self.v.iter().map(|v| v.as_ref().map(|a| a.to_vec())).collect(),
        }
    }

    /// Restore moments and step counter from a snapshot.
    pub fn restore(&mut self, state: OptimizerState) {
        self.t = state.t;
        self.m = state.m.into_iter().map(|m| m.map(Array1::from)).collect();
        self.v = state.v.into_iter().map(|v| v.map(Array1::from)).collect();
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [Tensor]) {
        self.ensure_moments(params.len());
        self.t += 1;

        // Bias-corrected step size.
        let lr_t = self.lr
            * ((1.0 - self.beta2.powi(self.t as i32)).sqrt()
                / (1.0 - self.beta1.powi(self.t as i32)));

        for (i, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad() else {
                continue;
            };

            // m_t = β1·m + (1-β1)·g
            let m_t = match &self.m[i] {
                Some(m) => m * self.beta1 + &grad * (1.0 - self.beta1),
                None => &grad * (1.0 - self.beta1),
            };

            // v_t = β2·v + (1-β2)·g²
            let grad_sq = &grad * &grad;
            let v_t = match &self.v[i] {
                Some(v) => v * self.beta2 + &grad_sq * (1.0 - self.beta2),
                None => &grad_sq * (1.0 - self.beta2),
            };

            let update = &m_t / &(v_t.mapv(f32::sqrt) + self.epsilon) * lr_t;
            let decay = 1.0 - self.lr * self.weight_decay;
            let decayed = param.data().mapv(|w| w * decay) - &update;
            *param.data_mut() = decayed;

            self.m[i] = Some(m_t);
            self.v[i] = Some(v_t);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
