//! The decode controller.
//!
//! A session owns its KV cache and worker pool and walks
//! Idle -> Prefill -> Decode -> Finished. The token stream is a pull
//! iterator: the caller stops asking and the session is released at the
//! next step boundary. Any mid-decode error finishes the session; its
//! cache is discarded with it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{KvCache, KvPrecision};
use crate::config::{MemoryType, SessionConfig};
use crate::error::{EngineError, Result};
use crate::kernels::{self, Kernels};
use crate::model::Model;
use crate::rope::RopeCache;
use crate::sampling::{apply_repeat_penalty, Sampler};
use crate::stats::GenerationStats;

/// Cooperative cancellation, checked at step boundaries.
pub struct CancellationToken(Arc<AtomicBool>);
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> (CancellationToken, CancellationHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            CancellationToken(Arc::clone(&flag)),
            CancellationHandle(flag),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prefill,
    Decode,
    Finished,
}

pub struct DecoderSession {
    model: Arc<Model>,
    config: SessionConfig,
    kernels: &'static Kernels,
    pool: rayon::ThreadPool,
    cache: KvCache,
    rope: RopeCache,
    sampler: Sampler,
    state: SessionState,
    /// Prompt plus emitted tokens, the repeat-penalty window source.
    context: Vec<u32>,
    prompt_len: usize,
    produced: usize,
    /// Next absolute position to write.
    next_pos: i64,
    /// Ring re-anchoring offset; effective position = absolute - base.
    base: i64,
    /// Tokens waiting to be forwarded (the prompt, then each sampled token).
    pending: Vec<u32>,
    stop_ids: HashSet<u32>,
    cancellation: Option<CancellationToken>,
    stop_criterion: Option<Box<dyn Fn(&[u32]) -> bool + Send>>,
    stats: GenerationStats,
}

impl DecoderSession {
    pub fn new(model: Arc<Model>, config: SessionConfig) -> Result<Self> {
        config.validate(&model.hparams)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| EngineError::ResourceExhausted(format!("worker pool: {e}")))?;

        let precision = match config.memory_type {
            MemoryType::F32 => KvPrecision::F32,
            MemoryType::F16 | MemoryType::Auto => KvPrecision::F16,
        };
        let cache = KvCache::new(
            model.hparams.n_layer,
            config.ctx_size,
            model.hparams.n_kv_head,
            model.hparams.head_dim,
            config.shift_roped_k,
            precision,
        );
        // Ring mode runs effective positions up to one full wrap past the
        // window before re-anchoring pulls them back.
        let rope_positions = if config.shift_roped_k {
            config.ctx_size * 2
        } else {
            config.ctx_size
        };
        let rope = RopeCache::new(
            model.hparams.head_dim,
            rope_positions,
            model.hparams.rope_theta,
        );

        let mut stop_ids: HashSet<u32> = config.extra_stop_ids.iter().copied().collect();
        stop_ids.insert(model.eos_id());

        let sampler = Sampler::new(config.seed);
        log::info!(
            "session opened: ctx {}, threads {}, seed {}, ring {}",
            config.ctx_size,
            config.threads,
            config.seed,
            config.shift_roped_k
        );

        Ok(DecoderSession {
            model,
            kernels: kernels::best(),
            pool,
            cache,
            rope,
            sampler,
            state: SessionState::Idle,
            context: Vec::new(),
            prompt_len: 0,
            produced: 0,
            next_pos: 0,
            base: 0,
            pending: Vec::new(),
            stop_ids,
            cancellation: None,
            stop_criterion: None,
            stats: GenerationStats::new(),
            config,
        })
    }

    /// Installs the prompt and arms the prefill pass. A BOS token is
    /// prepended when the model defines one and the prompt lacks it.
    pub fn set_prompt(&mut self, tokens: &[u32]) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(EngineError::config("prompt already set for this session"));
        }
        let mut prompt = tokens.to_vec();
        if let Some(bos) = self.model.bos_id() {
            if prompt.first() != Some(&bos) {
                prompt.insert(0, bos);
                log::trace!("prepended bos token {bos}");
            }
        }
        if prompt.is_empty() {
            return Err(EngineError::config("cannot generate from an empty prompt"));
        }
        self.prompt_len = prompt.len();
        self.context = prompt.clone();
        self.pending = prompt;
        self.stats.start_prefill(self.prompt_len);
        self.state = SessionState::Prefill;
        Ok(())
    }

    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancellation = Some(token);
    }

    /// Extra stop test, evaluated on the context after each sampled token.
    pub fn set_stop_criterion(&mut self, f: impl Fn(&[u32]) -> bool + Send + 'static) {
        self.stop_criterion = Some(Box::new(f));
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn context(&self) -> &[u32] {
        &self.context
    }

    /// Pulls the next token. `None` ends the stream; an error also
    /// finishes the session.
    pub fn next_token(&mut self) -> Option<Result<u32>> {
        if self.state == SessionState::Finished || self.state == SessionState::Idle {
            return None;
        }
        if let Some(token) = &self.cancellation {
            if token.is_cancelled() {
                self.finish("cancelled");
                return Some(Err(EngineError::Cancelled(
                    "session released by caller".into(),
                )));
            }
        }
        if self.config.n_predict >= 0 && self.produced as i64 >= self.config.n_predict {
            self.finish("n_predict reached");
            return None;
        }
        match self.step() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => None,
            Err(e) => {
                self.finish("error");
                Some(Err(e))
            }
        }
    }

    /// Borrowing iterator over the remaining tokens.
    pub fn stream(&mut self) -> TokenStream<'_> {
        TokenStream { session: self }
    }

    fn finish(&mut self, reason: &str) {
        if self.state != SessionState::Finished {
            log::debug!("session finished: {reason}");
            self.stats.log_summary();
            self.state = SessionState::Finished;
        }
    }

    fn step(&mut self) -> Result<Option<u32>> {
        let mut logits = if self.state == SessionState::Prefill {
            let logits = self.prefill()?;
            self.stats.end_prefill();
            self.state = SessionState::Decode;
            logits
        } else {
            let tokens: Vec<u32> = std::mem::take(&mut self.pending);
            debug_assert_eq!(tokens.len(), 1);
            self.forward_batch(&tokens)?
        };

        if self.config.numeric_guard && logits.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::NumericFault(
                "non-finite logit detected".into(),
            ));
        }

        let window = if self.config.keep < 0 {
            &self.context[..]
        } else {
            let keep = (self.config.keep as usize).min(self.context.len());
            &self.context[self.context.len() - keep..]
        };
        apply_repeat_penalty(&mut logits, window, self.config.repeat_penalty);

        let token = self.sampler.sample(
            &mut logits,
            self.config.temperature,
            self.config.top_k,
            self.config.top_p,
        );

        if self.stop_ids.contains(&token) {
            self.finish("stop token");
            return Ok(None);
        }
        self.context.push(token);
        if let Some(criterion) = &self.stop_criterion {
            if criterion(&self.context) {
                self.finish("user stop criterion");
                return Ok(None);
            }
        }
        self.produced += 1;
        self.stats.record_token();
        self.pending = vec![token];
        Ok(Some(token))
    }

    fn prefill(&mut self) -> Result<Vec<f32>> {
        let prompt = std::mem::take(&mut self.pending);
        let chunk_len = self.config.batch_size_truncate.min(self.config.ctx_size);
        let mut logits = Vec::new();
        for chunk in prompt.chunks(chunk_len) {
            logits = self.forward_batch(chunk)?;
        }
        log::debug!(
            "prefill done: {} tokens in chunks of {}",
            self.prompt_len,
            chunk_len
        );
        Ok(logits)
    }

    /// One layer-stack pass over a token batch, with the capacity check
    /// (linear mode) or rope re-anchoring (ring mode) ahead of it.
    fn forward_batch(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        let ctx = self.config.ctx_size as i64;
        let kernels = self.kernels;
        let last_eff = self.next_pos - self.base + tokens.len() as i64 - 1;
        if self.config.shift_roped_k {
            // Re-anchor before the batch would step past the rope table;
            // the oldest live position becomes zero again.
            if last_eff >= self.rope.max_positions() as i64 {
                if let Some(min_live) = self.cache.min_live_position(0) {
                    if min_live > 0 {
                        let variant = self.model.profile.rope;
                        let DecoderSession {
                            pool, cache, rope, ..
                        } = self;
                        pool.install(|| cache.shift_rope_k(kernels, rope, variant, min_live));
                        self.base += min_live;
                        log::trace!("ring re-anchored by {min_live} (base {})", self.base);
                    }
                }
            }
        } else if last_eff >= ctx {
            return Err(EngineError::config(format!(
                "context window of {ctx} exceeded at position {}; \
                 enable shift_roped_k for ring eviction",
                self.next_pos + tokens.len() as i64 - 1
            )));
        }

        let positions: Vec<i64> = (0..tokens.len() as i64)
            .map(|i| self.next_pos - self.base + i)
            .collect();
        let DecoderSession {
            pool,
            model,
            cache,
            rope,
            ..
        } = self;
        let logits = pool.install(|| model.forward(kernels, tokens, &positions, cache, rope))?;
        self.next_pos += tokens.len() as i64;
        Ok(logits)
    }
}

/// Pull iterator over a session's remaining tokens.
pub struct TokenStream<'a> {
    session: &'a mut DecoderSession,
}

impl Iterator for TokenStream<'_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        self.session.next_token()
    }
}
