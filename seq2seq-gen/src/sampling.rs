//! Next-token selection: temperature, top-k / nucleus filtering and
//! categorical sampling.

use ndarray::{Array1, ArrayView1};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::{Error, Result};

/// Sampling controls for one decoding run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingConfig {
    /// Keep the `top_k` highest logits (ties at the boundary included); 0 disables.
    pub top_k: usize,
    /// Nucleus threshold; 0 disables.
    pub top_p: f32,
    /// Divisor applied to logits before filtering. Not checked for zero.
    pub temperature: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 70,
            top_p: 0.0,
            temperature: 1.0,
        }
    }
}

impl SamplingConfig {
    /// Draw the next token id from the logits of the last target position.
    pub fn sample<R: Rng + ?Sized>(&self, logits: ArrayView1<f32>, rng: &mut R) -> Result<usize> {
        let scaled = &logits / self.temperature;
        let filtered = top_k_top_p_filtering(scaled.view(), self.top_k, self.top_p);
        sample_categorical(softmax(filtered.view()).view(), rng)
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Suppress unlikely candidates by setting their logits to negative infinity.
///
/// The top-k stage keeps every logit not less than the k-th largest value, so
/// ties at the boundary can leave more than k candidates. The nucleus stage
/// keeps the shortest prefix of the descending order whose cumulative
/// probability exceeds `top_p`, always including the most likely token.
/// Entries already at negative infinity stay there.
pub fn top_k_top_p_filtering(logits: ArrayView1<f32>, top_k: usize, top_p: f32) -> Array1<f32> {
    let mut filtered = logits.to_owned();
    let top_k = top_k.min(filtered.len());

    if top_k > 0 {
        let mut sorted = filtered.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let threshold = sorted[top_k - 1];
        filtered.mapv_inplace(|v| if v < threshold { f32::NEG_INFINITY } else { v });
    }

    if top_p > 0.0 {
        let mut order: Vec<usize> = (0..filtered.len()).collect();
        order.sort_by(|&a, &b| filtered[b].total_cmp(&filtered[a]));
        let sorted: Array1<f32> = order.iter().map(|&i| filtered[i]).collect();
        let probs = softmax(sorted.view());

        // Removal is shifted right by one so the token crossing the threshold
        // stays, and the first token is never removed.
        let mut cumulative = 0.0;
        let mut remove = vec![false; order.len()];
        for j in 0..order.len().saturating_sub(1) {
            cumulative += probs[j];
            remove[j + 1] = cumulative > top_p;
        }
        for (j, &i) in order.iter().enumerate() {
            if remove[j] {
                filtered[i] = f32::NEG_INFINITY;
            }
        }
    }

    filtered
}

/// Draw one index with probability proportional to `probs`.
pub fn sample_categorical<R: Rng + ?Sized>(probs: ArrayView1<f32>, rng: &mut R) -> Result<usize> {
    let dist = WeightedIndex::new(probs.iter()).map_err(|e| Error::Sampling(e.to_string()))?;
    Ok(dist.sample(rng))
}
