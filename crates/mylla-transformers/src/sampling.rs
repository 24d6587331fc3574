//! Token sampling: temperature scaling, top-k/top-p filtering, repeat
//! penalty, and a seeded draw.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::kernels::scalar::softmax;

/// Seeded sampler. Zero temperature is argmax; otherwise logits are
/// scaled, filtered, renormalized and drawn with a xorshift-class PRNG so
/// a fixed seed reproduces the token sequence exactly.
pub struct Sampler {
    rng: SmallRng,
}

impl Sampler {
    pub fn new(seed: i64) -> Self {
        let rng = if seed < 0 {
            SmallRng::from_entropy()
        } else {
            SmallRng::seed_from_u64(seed as u64)
        };
        Sampler { rng }
    }

    pub fn sample(
        &mut self,
        logits: &mut [f32],
        temperature: f32,
        top_k: usize,
        top_p: f32,
    ) -> u32 {
        if temperature == 0.0 {
            return argmax(logits);
        }
        let inv_t = 1.0 / temperature;
        for l in logits.iter_mut() {
            *l *= inv_t;
        }
        if top_k > 0 {
            top_k_filter(logits, top_k);
        }
        if top_p < 1.0 {
            top_p_filter(logits, top_p);
        }
        softmax(logits);
        let draw: f32 = self.rng.gen();
        let mut cumulative = 0.0f32;
        for (idx, &p) in logits.iter().enumerate() {
            cumulative += p;
            if cumulative >= draw {
                return idx as u32;
            }
        }
        (logits.len() - 1) as u32
    }
}

/// Index of the highest logit, first occurrence on ties.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as u32
}

/// Divides positive logits of recently seen tokens by the penalty and
/// multiplies negative ones, suppressing repeats. Penalty 1 is a no-op.
pub fn apply_repeat_penalty(logits: &mut [f32], recent: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &token in recent {
        let idx = token as usize;
        if idx < logits.len() {
            let score = logits[idx];
            logits[idx] = if score < 0.0 {
                score * penalty
            } else {
                score / penalty
            };
        }
    }
}

fn top_k_filter(logits: &mut [f32], k: usize) {
    if k >= logits.len() {
        return;
    }
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap());
    for &idx in &indices[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

fn top_p_filter(logits: &mut [f32], p: f32) {
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap());

    let mut probs = logits.to_vec();
    softmax(&mut probs);

    let mut cumulative = 0.0f32;
    for (rank, &idx) in indices.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative > p {
            for &cut in &indices[rank + 1..] {
                logits[cut] = f32::NEG_INFINITY;
            }
            break;
        }
    }
}
