//! Generation timing counters, reported through the log facade at session
//! end.

use std::time::Instant;

pub struct GenerationStats {
    started: Instant,
    prompt_tokens: usize,
    prefill_done: Option<Instant>,
    decoded_tokens: usize,
}

impl GenerationStats {
    pub fn new() -> Self {
        GenerationStats {
            started: Instant::now(),
            prompt_tokens: 0,
            prefill_done: None,
            decoded_tokens: 0,
        }
    }

    pub fn start_prefill(&mut self, prompt_tokens: usize) {
        self.prompt_tokens = prompt_tokens;
        self.started = Instant::now();
    }

    pub fn end_prefill(&mut self) {
        self.prefill_done = Some(Instant::now());
    }

    pub fn record_token(&mut self) {
        self.decoded_tokens += 1;
    }

    pub fn decoded(&self) -> usize {
        self.decoded_tokens
    }

    pub fn log_summary(&self) {
        let prefill = self
            .prefill_done
            .map(|t| t.duration_since(self.started).as_secs_f64())
            .unwrap_or(0.0);
        let decode = self
            .prefill_done
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_else(|| self.started.elapsed().as_secs_f64());
        let tps = if decode > 0.0 {
            self.decoded_tokens as f64 / decode
        } else {
            0.0
        };
        log::debug!(
            "session done: {} prompt tokens prefilled in {:.3}s, {} decoded in {:.3}s ({:.1} tok/s)",
            self.prompt_tokens,
            prefill,
            self.decoded_tokens,
            decode,
            tps
        );
    }
}

impl Default for GenerationStats {
    fn default() -> Self {
        Self::new()
    }
}
