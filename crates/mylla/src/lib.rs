//! High-level text-generation API over `mylla-transformers`.
//!
//! ```no_run
//! use mylla::{Engine, GenerateOptions};
//!
//! let engine = Engine::load("model.myla")?;
//! let text = engine.generate("Hello", &GenerateOptions::default())?;
//! println!("{text}");
//! # anyhow::Ok(())
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use mylla_transformers::prelude::*;
use mylla_transformers::session::CancellationToken;

pub use mylla_transformers::{
    self as transformers, EngineError, MemoryType, QuantAlgo, QuantizeConfig, SessionConfig,
};

/// Per-call generation options layered over the session config.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub session: SessionConfig,
    /// Stop once any of these strings appears at the end of the output.
    pub stop_sequences: Vec<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions {
            session: SessionConfig::default(),
            stop_sequences: Vec::new(),
        }
    }
}

/// A loaded model plus its tokenizer, ready to open decode sessions.
pub struct Engine {
    model: Arc<Model>,
    tokenizer: VocabTokenizer,
}

impl Engine {
    pub fn load(path: impl AsRef<Path>) -> Result<Engine> {
        let path = path.as_ref();
        let model = Model::load(path, mylla_transformers::kernels::best())
            .with_context(|| format!("loading model from {}", path.display()))?;
        let tokenizer = VocabTokenizer::new(&model.vocab, model.eos_id());
        log::info!("engine ready: {} tokens in vocabulary", tokenizer.vocab_size());
        Ok(Engine {
            model: Arc::new(model),
            tokenizer,
        })
    }

    pub fn tokenizer(&self) -> &VocabTokenizer {
        &self.tokenizer
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Opens a raw decode session over already-encoded tokens.
    pub fn open_session(&self, tokens: &[u32], config: &SessionConfig) -> Result<DecoderSession> {
        let mut session = DecoderSession::new(Arc::clone(&self.model), config.clone())
            .context("opening decode session")?;
        session.set_prompt(tokens).context("installing prompt")?;
        Ok(session)
    }

    /// Encodes, decodes and collects a full completion.
    pub fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        self.generate_with(prompt, options, None)
    }

    /// Like [`Engine::generate`] with cooperative cancellation; a cancelled
    /// run surfaces `EngineError::Cancelled`.
    pub fn generate_with(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancellation: Option<CancellationToken>,
    ) -> Result<String> {
        let tokens = self
            .tokenizer
            .encode(prompt)
            .context("encoding prompt")?;
        let mut session = self.open_session(&tokens, &options.session)?;
        if let Some(token) = cancellation {
            session.set_cancellation(token);
        }

        let mut out = String::new();
        let mut ids = Vec::new();
        for token in session.stream() {
            let token = token?;
            ids.push(token);
            out = self.tokenizer.decode(&ids).context("decoding output")?;
            if options
                .stop_sequences
                .iter()
                .any(|stop| out.ends_with(stop.as_str()))
            {
                break;
            }
        }
        for stop in &options.stop_sequences {
            if let Some(stripped) = out.strip_suffix(stop.as_str()) {
                out = stripped.to_string();
                break;
            }
        }
        Ok(out)
    }
}
