//! Decode-session runtime parameters.

use serde::{Deserialize, Serialize};

use crate::container::Hparams;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Engine default (currently f16 KV storage).
    Auto,
    F16,
    F32,
}

/// Everything a decode session accepts from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Context window for this session; at most the model maximum.
    pub ctx_size: usize,
    /// Largest prompt chunk processed per prefill pass.
    pub batch_size_truncate: usize,
    /// Worker-pool size for the numeric primitives.
    pub threads: usize,
    /// Tokens to produce; -1 means unlimited.
    pub n_predict: i64,
    /// Sampler seed; negative draws one from the OS.
    pub seed: i64,
    /// 0 selects greedy argmax.
    pub temperature: f32,
    /// 0 disables the top-k filter.
    pub top_k: usize,
    /// 1.0 disables the nucleus filter.
    pub top_p: f32,
    /// 1.0 disables the repeat penalty.
    pub repeat_penalty: f32,
    /// Penalty window; -1 covers the whole context.
    pub keep: i64,
    /// Ring-buffer KV eviction with rope re-anchoring.
    pub shift_roped_k: bool,
    pub memory_type: MemoryType,
    /// Terminators in addition to the model EOS.
    pub extra_stop_ids: Vec<u32>,
    /// Scan logits for NaN/Inf after every step.
    pub numeric_guard: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ctx_size: 512,
            batch_size_truncate: 512,
            threads: 4,
            n_predict: -1,
            seed: -1,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.1,
            keep: -1,
            shift_roped_k: false,
            memory_type: MemoryType::Auto,
            extra_stop_ids: Vec::new(),
            numeric_guard: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self, hparams: &Hparams) -> Result<()> {
        if self.ctx_size == 0 {
            return Err(EngineError::config("ctx_size must be positive"));
        }
        if self.ctx_size > hparams.ctx_max {
            return Err(EngineError::config(format!(
                "ctx_size {} exceeds model maximum {}",
                self.ctx_size, hparams.ctx_max
            )));
        }
        if self.batch_size_truncate == 0 {
            return Err(EngineError::config("batch_size_truncate must be positive"));
        }
        if self.threads == 0 {
            return Err(EngineError::config("thread count must be positive"));
        }
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(EngineError::config(format!(
                "temperature {} out of range",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(EngineError::config(format!(
                "top_p {} outside [0, 1]",
                self.top_p
            )));
        }
        if self.repeat_penalty < 1.0 {
            return Err(EngineError::config(format!(
                "repeat_penalty {} below 1",
                self.repeat_penalty
            )));
        }
        Ok(())
    }
}
