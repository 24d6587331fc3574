//! Per-architecture decoder-layer composition.
//!
//! Structure is data-driven: an architecture resolves to a profile plus a
//! fixed op sequence, and the forward pass interprets that sequence. Every
//! layer of a given model executes the identical ops; there are no
//! per-architecture branches in the execution path.

use crate::error::{EngineError, Result};
use crate::rope::RopeVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchKind {
    Llama,
    GptJ,
    Mistral,
}

impl ArchKind {
    pub fn from_tag(tag: u32) -> Result<ArchKind> {
        Ok(match tag {
            0 => ArchKind::Llama,
            1 => ArchKind::GptJ,
            2 => ArchKind::Mistral,
            other => {
                return Err(EngineError::malformed(format!(
                    "unknown architecture tag {other}"
                )))
            }
        })
    }

    pub fn tag(self) -> u32 {
        match self {
            ArchKind::Llama => 0,
            ArchKind::GptJ => 1,
            ArchKind::Mistral => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// RMS norm, no mean subtraction, no bias.
    Rms,
    /// Full layer norm with bias.
    Layer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfnKind {
    /// SwiGLU: down(silu(gate(x)) * up(x)).
    Gated,
    /// Plain: down(gelu(up(x))).
    Plain,
}

/// One step of the per-layer op sequence. `Attention` and `Ffn` read the
/// most recent norm output and write their own branch buffers; the add ops
/// fold branches back into the residual stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOp {
    AttnNorm,
    Attention,
    AddAttn,
    FfnNorm,
    Ffn,
    AddFfn,
}

/// Sequential pre-norm block: norm, attention, residual, norm, ffn,
/// residual.
const PRE_NORM_OPS: &[LayerOp] = &[
    LayerOp::AttnNorm,
    LayerOp::Attention,
    LayerOp::AddAttn,
    LayerOp::FfnNorm,
    LayerOp::Ffn,
    LayerOp::AddFfn,
];

/// Parallel-residual block: one norm feeds both attention and the FFN, and
/// both branches add back into the stream.
const PARALLEL_OPS: &[LayerOp] = &[
    LayerOp::AttnNorm,
    LayerOp::Attention,
    LayerOp::Ffn,
    LayerOp::AddAttn,
    LayerOp::AddFfn,
];

/// Everything the forward pass needs to know about an architecture.
#[derive(Debug, Clone, Copy)]
pub struct ArchProfile {
    pub kind: ArchKind,
    pub norm: NormKind,
    pub ffn: FfnKind,
    pub rope: RopeVariant,
    /// Attention/FFN projections carry bias vectors.
    pub has_bias: bool,
    pub ops: &'static [LayerOp],
}

const LLAMA_PROFILE: ArchProfile = ArchProfile {
    kind: ArchKind::Llama,
    norm: NormKind::Rms,
    ffn: FfnKind::Gated,
    rope: RopeVariant::RotateHalf,
    has_bias: false,
    ops: PRE_NORM_OPS,
};

const GPTJ_PROFILE: ArchProfile = ArchProfile {
    kind: ArchKind::GptJ,
    norm: NormKind::Layer,
    ffn: FfnKind::Plain,
    rope: RopeVariant::Interleaved,
    has_bias: true,
    ops: PARALLEL_OPS,
};

const MISTRAL_PROFILE: ArchProfile = ArchProfile {
    kind: ArchKind::Mistral,
    ..LLAMA_PROFILE
};

pub fn profile_for(kind: ArchKind) -> &'static ArchProfile {
    match kind {
        ArchKind::Llama => &LLAMA_PROFILE,
        ArchKind::GptJ => &GPTJ_PROFILE,
        ArchKind::Mistral => &MISTRAL_PROFILE,
    }
}
