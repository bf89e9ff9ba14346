//! Mixed-precision support: reduced-precision storage types and dynamic
//! loss scaling.
//!
//! Reduced precision shrinks activation storage; loss scaling keeps small
//! gradients representable. On a detected overflow (non-finite gradient) the
//! scale is halved and the step is skipped without advancing the optimizer;
//! after a run of stable steps the scale doubles again.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric precision for activations and gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    /// 32-bit floating point (default).
    #[default]
    Fp32,
    /// 16-bit brain floating point (f32 exponent range, 7 mantissa bits).
    Bf16,
}

impl Precision {
    /// Storage size in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Precision::Fp32 => 4,
            Precision::Bf16 => 2,
        }
    }

    /// Whether this is a reduced-precision type.
    pub fn is_reduced(&self) -> bool {
        matches!(self, Precision::Bf16)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Fp32 => write!(f, "fp32"),
            Precision::Bf16 => write!(f, "bf16"),
        }
    }
}

/// Configuration for mixed-precision training.
#[derive(Debug, Clone)]
pub struct MixedPrecisionConfig {
    /// Precision for activations and gradients.
    pub compute_precision: Precision,
    /// Initial loss scale.
    pub initial_scale: f32,
    /// Multiplier applied on a stable-run scale increase.
    pub scale_growth_factor: f32,
    /// Multiplier applied on overflow.
    pub scale_backoff_factor: f32,
    /// Consecutive stable steps before the scale grows.
    pub scale_growth_interval: usize,
    /// Whether the scale adapts at all.
    pub dynamic_scaling: bool,
}

impl MixedPrecisionConfig {
    /// Full precision, no scaling.
    pub fn fp32() -> Self {
        Self {
            compute_precision: Precision::Fp32,
            initial_scale: 1.0,
            scale_growth_factor: 2.0,
            scale_backoff_factor: 0.5,
            scale_growth_interval: 2000,
            dynamic_scaling: false,
        }
    }

    /// Reduced precision with dynamic loss scaling.
    pub fn reduced() -> Self {
        Self {
            compute_precision: Precision::Bf16,
            initial_scale: 65536.0,
            scale_growth_factor: 2.0,
            scale_backoff_factor: 0.5,
            scale_growth_interval: 2000,
            dynamic_scaling: true,
        }
    }

    /// Whether mixed precision is enabled.
    pub fn is_mixed(&self) -> bool {
        self.compute_precision.is_reduced()
    }
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self::fp32()
    }
}

/// Serializable scaler state for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub steps_since_growth: usize,
    pub overflow_count: u64,
    pub successful_steps: u64,
}

/// Dynamic loss scaler.
#[derive(Debug)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    steps_since_growth: usize,
    dynamic: bool,
    overflow_count: u64,
    successful_steps: u64,
}

impl GradScaler {
    /// Build from a precision config.
    pub fn from_config(config: &MixedPrecisionConfig) -> Self {
        Self {
            scale: config.initial_scale,
            growth_factor: config.scale_growth_factor,
            backoff_factor: config.scale_backoff_factor,
            growth_interval: config.scale_growth_interval,
            steps_since_growth: 0,
            dynamic: config.dynamic_scaling,
            overflow_count: 0,
            successful_steps: 0,
        }
    }

    /// Current loss scale.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Unscale gradients in place and report whether they are all finite.
    pub fn unscale_and_check(&self, grads: &mut [f32]) -> bool {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        for g in grads.iter_mut() {
            *g *= inv;
            if !g.is_finite() {
                finite = false;
            }
        }
        finite
    }

    /// Advance the scale schedule after a step attempt.
    ///
    /// `grads_valid = false` halves the scale and resets the stable-step run;
    /// a full interval of valid steps doubles it.
    pub fn update(&mut self, grads_valid: bool) {
        if grads_valid {
            self.successful_steps += 1;
        } else {
            self.overflow_count += 1;
        }
        if !self.dynamic {
            return;
        }
        if grads_valid {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.steps_since_growth = 0;
            }
        } else {
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.steps_since_growth = 0;
        }
    }

    /// Number of overflowed (skipped) step attempts.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Number of successful steps.
    pub fn successful_steps(&self) -> u64 {
        self.successful_steps
    }

    /// Export state for a snapshot.
    pub fn state(&self) -> ScalerState {
        ScalerState {
            scale: self.scale,
            steps_since_growth: self.steps_since_growth,
            overflow_count: self.overflow_count,
            successful_steps: self.successful_steps,
        }
    }

    /// Restore state from a snapshot.
    pub fn restore(&mut self, state: &ScalerState) {
        self.scale = state.scale;
        self.steps_since_growth = state.steps_since_growth;
        self.overflow_count = state.overflow_count;
        self.successful_steps = state.successful_steps;
    }
}

/// Truncate an f32 to bf16 storage bits.
pub fn f32_to_bf16(value: f32) -> u16 {
    (value.to_bits() >> 16) as u16
}

/// Expand bf16 storage bits back to f32.
pub fn bf16_to_f32(value: u16) -> f32 {
    f32::from_bits(u32::from(value) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_sizes() {
        assert_eq!(Precision::Fp32.size_bytes(), 4);
        assert_eq!(Precision::Bf16.size_bytes(), 2);
        assert!(Precision::Bf16.is_reduced());
        assert!(!Precision::Fp32.is_reduced());
    }

    #[test]
    fn test_config_presets() {
        assert!(!MixedPrecisionConfig::fp32().is_mixed());
        let reduced = MixedPrecisionConfig::reduced();
        assert!(reduced.is_mixed());
        assert!(reduced.dynamic_scaling);
        assert_eq!(reduced.initial_scale, 65536.0);
    }

    #[test]
    fn test_unscale_and_check_valid() {
        let scaler = GradScaler::from_config(&MixedPrecisionConfig {
            initial_scale: 100.0,
            ..MixedPrecisionConfig::reduced()
        });
        let mut grads = vec![100.0, 200.0];
        assert!(scaler.unscale_and_check(&mut grads));
        assert_eq!(grads, vec![1.0, 2.0]);
    }

    #[test]
    fn test_unscale_and_check_overflow() {
        let scaler = GradScaler::from_config(&MixedPrecisionConfig::reduced());
        let mut grads = vec![1.0, f32::INFINITY];
        assert!(!scaler.unscale_and_check(&mut grads));
    }

    #[test]
    fn test_overflow_halves_scale() {
        let mut scaler = GradScaler::from_config(&MixedPrecisionConfig {
            initial_scale: 1024.0,
            ..MixedPrecisionConfig::reduced()
        });
        scaler.update(false);
        assert_eq!(scaler.scale(), 512.0);
        assert_eq!(scaler.overflow_count(), 1);
    }

    #[test]
    fn test_scale_floor_at_one() {
        let mut scaler = GradScaler::from_config(&MixedPrecisionConfig {
            initial_scale: 1.0,
            ..MixedPrecisionConfig::reduced()
        });
        scaler.update(false);
        assert!(scaler.scale() >= 1.0);
    }

    #[test]
    fn test_scale_grows_after_stable_run() {
        let mut scaler = GradScaler::from_config(&MixedPrecisionConfig {
            initial_scale: 8.0,
            scale_growth_interval: 2,
            ..MixedPrecisionConfig::reduced()
        });
        scaler.update(true);
        assert_eq!(scaler.scale(), 8.0);
        scaler.update(true);
        assert_eq!(scaler.scale(), 16.0);
    }

    #[test]
    fn test_overflow_resets_stable_run() {
        let mut scaler = GradScaler::from_config(&MixedPrecisionConfig {
            initial_scale: 8.0,
            scale_growth_interval: 2,
            ..MixedPrecisionConfig::reduced()
        });
        scaler.update(true);
        scaler.update(false);
        scaler.update(true);
        // The run restarted after the overflow, so no growth yet.
        assert_eq!(scaler.scale(), 4.0);
    }

    #[test]
    fn test_static_scaler_never_moves() {
        let mut scaler = GradScaler::from_config(&MixedPrecisionConfig::fp32());
        scaler.update(false);
        scaler.update(true);
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_state_round_trip() {
        let mut scaler = GradScaler::from_config(&MixedPrecisionConfig::reduced());
        scaler.update(false);
        scaler.update(true);
        let state = scaler.state();
        let mut restored = GradScaler::from_config(&MixedPrecisionConfig::reduced());
        restored.restore(&state);
        assert_eq!(restored.scale(), scaler.scale());
        assert_eq!(restored.overflow_count(), 1);
        assert_eq!(restored.successful_steps(), 1);
    }

    #[test]
    fn test_bf16_round_trip_tolerance() {
        for &v in &[0.0f32, 1.0, -1.0, 0.5, 100.0, -0.001] {
            let back = bf16_to_f32(f32_to_bf16(v));
            if v.abs() > 1e-6 {
                assert!(((back - v) / v).abs() < 0.01, "bf16 error too large for {v}");
            }
        }
    }
}
