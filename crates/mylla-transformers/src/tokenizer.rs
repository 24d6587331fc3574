//! Tokenizer contract.
//!
//! The engine does not introspect tokenizer internals; anything that can
//! encode, decode and name its terminator satisfies the trait. The built-in
//! implementation is a greedy longest-match over the container's scored
//! vocabulary.

use std::collections::HashMap;

use crate::error::{EngineError, Result};

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, tokens: &[u32]) -> Result<String>;
    fn eos_id(&self) -> u32;
}

/// Greedy longest-match tokenizer over the model file's vocabulary.
pub struct VocabTokenizer {
    pieces: Vec<String>,
    lookup: HashMap<String, u32>,
    max_piece_len: usize,
    eos: u32,
}

impl VocabTokenizer {
    pub fn new(vocab: &[(String, f32)], eos: u32) -> Self {
        let mut lookup = HashMap::with_capacity(vocab.len());
        let mut max_piece_len = 1;
        for (id, (piece, _score)) in vocab.iter().enumerate() {
            max_piece_len = max_piece_len.max(piece.len());
            // First writer wins on duplicates, matching id order.
            lookup.entry(piece.clone()).or_insert(id as u32);
        }
        VocabTokenizer {
            pieces: vocab.iter().map(|(p, _)| p.clone()).collect(),
            lookup,
            max_piece_len,
            eos,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let mut matched = None;
            let limit = (bytes.len() - i).min(self.max_piece_len);
            for len in (1..=limit).rev() {
                if let Some(candidate) = text.get(i..i + len) {
                    if let Some(&id) = self.lookup.get(candidate) {
                        matched = Some((id, len));
                        break;
                    }
                }
            }
            match matched {
                Some((id, len)) => {
                    out.push(id);
                    i += len;
                }
                None => {
                    return Err(EngineError::config(format!(
                        "prompt contains text outside the model vocabulary at byte {i}"
                    )));
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let mut out = String::new();
        for &t in tokens {
            let piece = self.pieces.get(t as usize).ok_or_else(|| {
                EngineError::config(format!(
                    "token id {} outside vocabulary of {}",
                    t,
                    self.pieces.len()
                ))
            })?;
            out.push_str(piece);
        }
        Ok(out)
    }

    fn eos_id(&self) -> u32 {
        self.eos
    }
}
