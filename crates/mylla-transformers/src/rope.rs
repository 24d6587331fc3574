//! Rotary position embeddings.
//!
//! Angles are precomputed per (position, frequency) pair once per session.
//! Keys and queries are rotated in place through the kernel table; the
//! ring-buffer eviction path re-anchors cached keys by rotating them through
//! a negative position delta.

use crate::kernels::Kernels;

/// Which pairing the rotation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeVariant {
    /// Pairs (i, i + d/2). Llama-family models.
    RotateHalf,
    /// Pairs (2i, 2i + 1). GPT-J-family models.
    Interleaved,
}

/// Cos/sin tables of shape [max_positions, head_dim / 2].
pub struct RopeCache {
    cos: Vec<f32>,
    sin: Vec<f32>,
    half_dim: usize,
    max_positions: usize,
}

impl RopeCache {
    pub fn new(head_dim: usize, max_positions: usize, theta: f32) -> Self {
        let half_dim = head_dim / 2;
        let mut cos = vec![0f32; max_positions * half_dim];
        let mut sin = vec![0f32; max_positions * half_dim];
        for pos in 0..max_positions {
            for i in 0..half_dim {
                let exponent = (2 * i) as f32 / head_dim as f32;
                let inv_freq = 1.0 / theta.powf(exponent);
                let angle = pos as f32 * inv_freq;
                cos[pos * half_dim + i] = angle.cos();
                sin[pos * half_dim + i] = angle.sin();
            }
        }
        RopeCache {
            cos,
            sin,
            half_dim,
            max_positions,
        }
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn row(&self, pos: usize) -> (&[f32], &[f32]) {
        let start = pos * self.half_dim;
        (
            &self.cos[start..start + self.half_dim],
            &self.sin[start..start + self.half_dim],
        )
    }

    /// Rotates one head vector to position `pos`.
    pub fn apply(&self, kernels: &Kernels, x: &mut [f32], pos: usize, variant: RopeVariant) {
        debug_assert!(pos < self.max_positions);
        debug_assert_eq!(x.len(), self.half_dim * 2);
        let (cos, sin) = self.row(pos);
        match variant {
            RopeVariant::RotateHalf => (kernels.rope_rotate_half)(x, cos, sin),
            RopeVariant::Interleaved => (kernels.rope_interleaved)(x, cos, sin),
        }
    }

    /// Rotates one head vector by a signed position delta, used when the
    /// ring buffer re-anchors cached keys. A negative delta undoes a
    /// positive one.
    pub fn apply_shift(
        &self,
        kernels: &Kernels,
        x: &mut [f32],
        delta: i64,
        variant: RopeVariant,
    ) {
        let magnitude = delta.unsigned_abs() as usize;
        debug_assert!(magnitude < self.max_positions);
        let (cos, sin) = self.row(magnitude);
        if delta >= 0 {
            match variant {
                RopeVariant::RotateHalf => (kernels.rope_rotate_half)(x, cos, sin),
                RopeVariant::Interleaved => (kernels.rope_interleaved)(x, cos, sin),
            }
        } else {
            // Rotation by -theta: cos is even, sin is odd.
            let neg_sin: Vec<f32> = sin.iter().map(|s| -s).collect();
            match variant {
                RopeVariant::RotateHalf => (kernels.rope_rotate_half)(x, cos, &neg_sin),
                RopeVariant::Interleaved => (kernels.rope_interleaved)(x, cos, &neg_sin),
            }
        }
    }
}
