//! Core engine for block-quantized transformer inference on CPUs.
//!
//! This crate provides the numeric primitives, weight containers, KV cache
//! and decode controller without any front-end concerns.

pub mod cache;
pub mod config;
pub mod container;
pub mod error;
pub mod graph;
pub mod isa;
pub mod kernels;
pub mod model;
pub mod ops;
pub mod quant;
pub mod rope;
pub mod sampling;
pub mod session;
pub mod stats;
pub mod tensor;
pub mod tokenizer;
pub mod weights;

// Re-export commonly used items
pub use crate::{
    cache::{KvCache, KvPrecision},
    config::{MemoryType, SessionConfig},
    container::{ContainerWriter, Hparams, ModelFile},
    error::{EngineError, Result},
    graph::ArchKind,
    isa::{detected_tier, IsaTier},
    model::Model,
    quant::{quantize_file, quantize_matrix, QuantAlgo, QuantizeConfig},
    session::{CancellationToken, DecoderSession, SessionState, TokenStream},
    tensor::{ComputeDType, ScaleDType, TensorDType},
    tokenizer::{Tokenizer, VocabTokenizer},
};

// Prelude for easy imports
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::error::{EngineError, Result};
    pub use crate::model::Model;
    pub use crate::session::{DecoderSession, SessionState};
    pub use crate::tokenizer::{Tokenizer, VocabTokenizer};
}
