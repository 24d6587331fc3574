//! Per-layer key/value cache.
//!
//! Physical storage is a fixed ring of `ctx_size` slots per layer; a side
//! array maps each slot to its logical position (-1 when empty). In
//! non-ring mode slots fill 0..L and never wrap. In ring mode the oldest
//! slot is overwritten and the shift-rope-K pass re-anchors positions so
//! attention geometry survives the wrap without recomputation.

use half::f16;

use crate::error::{EngineError, Result};
use crate::kernels::Kernels;
use crate::rope::{RopeCache, RopeVariant};

/// KV storage precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvPrecision {
    F32,
    /// Values round-trip through f16 on write.
    F16,
}

struct LayerKv {
    keys: Vec<f32>,
    values: Vec<f32>,
    /// Physical slot -> logical position, -1 when empty.
    slots: Vec<i64>,
    /// Next write slot, always in [0, ctx_size).
    head: usize,
}

pub struct KvCache {
    layers: Vec<LayerKv>,
    ctx_size: usize,
    n_kv_heads: usize,
    head_dim: usize,
    ring: bool,
    precision: KvPrecision,
}

impl KvCache {
    pub fn new(
        n_layers: usize,
        ctx_size: usize,
        n_kv_heads: usize,
        head_dim: usize,
        ring: bool,
        precision: KvPrecision,
    ) -> Self {
        let slot_len = n_kv_heads * head_dim;
        let layers = (0..n_layers)
            .map(|_| LayerKv {
                keys: vec![0f32; ctx_size * slot_len],
                values: vec![0f32; ctx_size * slot_len],
                slots: vec![-1i64; ctx_size],
                head: 0,
            })
            .collect();
        log::debug!(
            "kv cache: {} layers x {} slots x {} kv heads x {} dims ({} mode)",
            n_layers,
            ctx_size,
            n_kv_heads,
            head_dim,
            if ring { "ring" } else { "linear" }
        );
        KvCache {
            layers,
            ctx_size,
            n_kv_heads,
            head_dim,
            ring,
            precision,
        }
    }

    pub fn ctx_size(&self) -> usize {
        self.ctx_size
    }

    fn slot_len(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Writes (k, v) for one position into the next slot and returns the
    /// physical slot index. In ring mode a full cache overwrites the oldest
    /// slot; in linear mode it is an internal fault (the controller checks
    /// capacity first).
    pub fn append(&mut self, layer: usize, k: &[f32], v: &[f32], position: i64) -> Result<usize> {
        let slot_len = self.slot_len();
        debug_assert_eq!(k.len(), slot_len);
        debug_assert_eq!(v.len(), slot_len);
        let ctx = self.ctx_size;
        let layer_kv = &mut self.layers[layer];
        if !self.ring && layer_kv.slots[layer_kv.head] >= 0 {
            return Err(EngineError::internal(format!(
                "kv cache overflow at position {position} (ctx {ctx})"
            )));
        }
        let slot = layer_kv.head;
        let dst_k = &mut layer_kv.keys[slot * slot_len..(slot + 1) * slot_len];
        let dst_v = &mut layer_kv.values[slot * slot_len..(slot + 1) * slot_len];
        match self.precision {
            KvPrecision::F32 => {
                dst_k.copy_from_slice(k);
                dst_v.copy_from_slice(v);
            }
            KvPrecision::F16 => {
                for (d, &s) in dst_k.iter_mut().zip(k.iter()) {
                    *d = f16::from_f32(s).to_f32();
                }
                for (d, &s) in dst_v.iter_mut().zip(v.iter()) {
                    *d = f16::from_f32(s).to_f32();
                }
            }
        }
        layer_kv.slots[slot] = position;
        layer_kv.head = (layer_kv.head + 1) % ctx;
        Ok(slot)
    }

    /// Live (slot, position) pairs ordered by position, oldest first. The
    /// attention op walks this order and masks positions beyond the newest
    /// query.
    pub fn gather_attention_inputs(&self, layer: usize) -> Vec<(usize, i64)> {
        let mut live: Vec<(usize, i64)> = self.layers[layer]
            .slots
            .iter()
            .enumerate()
            .filter(|(_, &p)| p >= 0)
            .map(|(s, &p)| (s, p))
            .collect();
        live.sort_by_key(|&(_, p)| p);
        live
    }

    pub fn key(&self, layer: usize, slot: usize, kv_head: usize) -> &[f32] {
        let base = slot * self.slot_len() + kv_head * self.head_dim;
        &self.layers[layer].keys[base..base + self.head_dim]
    }

    pub fn value(&self, layer: usize, slot: usize, kv_head: usize) -> &[f32] {
        let base = slot * self.slot_len() + kv_head * self.head_dim;
        &self.layers[layer].values[base..base + self.head_dim]
    }

    pub fn live_len(&self, layer: usize) -> usize {
        self.layers[layer].slots.iter().filter(|&&p| p >= 0).count()
    }

    /// Oldest live logical position, or `None` when empty.
    pub fn min_live_position(&self, layer: usize) -> Option<i64> {
        self.layers[layer]
            .slots
            .iter()
            .filter(|&&p| p >= 0)
            .min()
            .copied()
    }

    /// Re-anchors every live position to `position - delta`, rotating the
    /// stored keys to match. Only meaningful in ring mode; applying the
    /// negated delta restores an attention-equivalent state.
    pub fn shift_rope_k(
        &mut self,
        kernels: &Kernels,
        rope: &RopeCache,
        variant: RopeVariant,
        delta: i64,
    ) {
        let slot_len = self.slot_len();
        let (n_kv_heads, head_dim) = (self.n_kv_heads, self.head_dim);
        for layer_kv in &mut self.layers {
            for slot in 0..layer_kv.slots.len() {
                if layer_kv.slots[slot] < 0 {
                    continue;
                }
                for h in 0..n_kv_heads {
                    let base = slot * slot_len + h * head_dim;
                    let key = &mut layer_kv.keys[base..base + head_dim];
                    rope.apply_shift(kernels, key, -delta, variant);
                }
                layer_kv.slots[slot] -= delta;
            }
        }
        log::debug!("shift-rope-k re-anchored cache by {delta}");
    }

    pub fn clear(&mut self) {
        for layer_kv in &mut self.layers {
            layer_kv.slots.fill(-1);
            layer_kv.head = 0;
        }
    }
}
