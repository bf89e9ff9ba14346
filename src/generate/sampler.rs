//! Token sampling: temperature, top-k, and top-p (nucleus) filtering.
//!
//! The policy is configuration passed through unchanged per window — the
//! generator applies the same sampler settings to every window of a request
//! so the style stays reproducible across the stitched output.

use crate::train::loss::softmax;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Sampling configuration for one generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Softmax temperature; `0.0` means greedy argmax.
    pub temperature: f32,
    /// Keep only the `k` highest-probability tokens (`0` disables).
    pub top_k: usize,
    /// Nucleus threshold: keep the smallest prefix of the sorted
    /// distribution whose mass reaches `top_p` (`>= 1.0` disables).
    pub top_p: f32,
    /// RNG seed; a fixed seed reproduces the request exactly.
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 0.9,
            seed: 42,
        }
    }
}

/// Stateful sampler for one request.
pub struct Sampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl Sampler {
    /// Seeded sampler from a config.
    pub fn new(config: SamplerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    /// Sample a token id from raw logits.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        assert!(!logits.is_empty(), "cannot sample from empty logits");

        if self.config.temperature == 0.0 {
            return argmax(logits) as u32;
        }

        let scaled: Vec<f32> =
            logits.iter().map(|&l| l / self.config.temperature).collect();
        let probs = softmax(&scaled);

        // Sort candidate indices by descending probability, then filter.
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).expect("probs are finite"));

        let mut kept = order;
        if self.config.top_k > 0 && self.config.top_k < kept.len() {
            kept.truncate(self.config.top_k);
        }
        if self.config.top_p < 1.0 {
            let mut mass = 0.0;
            let mut cut = kept.len();
            for (i, &idx) in kept.iter().enumerate() {
                mass += probs[idx];
                if mass >= self.config.top_p {
                    cut = i + 1;
                    break;
                }
            }
            kept.truncate(cut.max(1));
        }

        let total: f32 = kept.iter().map(|&i| probs[i]).sum();
        let mut draw = self.rng.gen::<f32>() * total;
        for &idx in &kept {
            draw -= probs[idx];
            if draw <= 0.0 {
                return idx as u32;
            }
        }
        *kept.last().expect("kept at least one candidate") as u32
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_temperature_is_greedy() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 0.0,
            ..SamplerConfig::default()
        });
        for _ in 0..5 {
            assert_eq!(sampler.sample(&[0.1, 3.0, -1.0, 0.5]), 1);
        }
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
            seed: 9,
        });
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[0.0, 0.0, 5.0]), 2);
        }
    }

    #[test]
    fn test_tiny_top_p_keeps_the_mode() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 1.0,
            top_k: 0,
            top_p: 1e-6,
            seed: 9,
        });
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[1.0, 4.0, 2.0]), 1);
        }
    }

    #[test]
    fn test_same_seed_reproduces_sequence() {
        let logits = [1.0, 1.1, 0.9, 1.05];
        let draw = |seed: u64| -> Vec<u32> {
            let mut sampler = Sampler::new(SamplerConfig {
                seed,
                top_p: 1.0,
                ..SamplerConfig::default()
            });
            (0..20).map(|_| sampler.sample(&logits)).collect()
        };
        assert_eq!(draw(3), draw(3));
        assert_ne!(draw(3), draw(4));
    }

    #[test]
    fn test_samples_cover_plausible_support() {
        // With flat logits and no filtering, every token should appear.
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            seed: 1,
        });
        let mut seen = [false; 4];
        for _ in 0..200 {
            seen[sampler.sample(&[0.0, 0.0, 0.0, 0.0]) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_top_k_excludes_tail() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 1.0,
            top_k: 2,
            top_p: 1.0,
            seed: 5,
        });
        for _ in 0..100 {
            let token = sampler.sample(&[5.0, 4.0, -10.0, -10.0]);
            assert!(token < 2, "token {token} is outside the top-2");
        }
    }
}
