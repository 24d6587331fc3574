use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// On-disk element type of a tensor.
///
/// Plain types store dense values; quantized types store low-bit codes plus
/// per-k-block scales (and zero-points for asymmetric integer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorDType {
    F32,
    F16,
    BF16,
    /// Signed 8-bit integer codes, one per byte.
    Int8,
    /// Signed 4-bit integer codes, two per byte.
    Int4,
    /// 8-bit micro-float, 4 exponent / 3 mantissa bits.
    Fp8E4M3,
    /// 8-bit micro-float, 5 exponent / 2 mantissa bits.
    Fp8E5M2,
    /// 4-bit micro-float, 2 exponent / 1 mantissa bit, lookup-decoded.
    Fp4E2M1,
    /// 4-bit normal-float, fixed 16-entry quantile table.
    Nf4,
}

impl TensorDType {
    pub fn code(self) -> u8 {
        match self {
            TensorDType::F32 => 0,
            TensorDType::F16 => 1,
            TensorDType::BF16 => 2,
            TensorDType::Int8 => 3,
            TensorDType::Int4 => 4,
            TensorDType::Fp8E4M3 => 5,
            TensorDType::Fp8E5M2 => 6,
            TensorDType::Fp4E2M1 => 7,
            TensorDType::Nf4 => 8,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => TensorDType::F32,
            1 => TensorDType::F16,
            2 => TensorDType::BF16,
            3 => TensorDType::Int8,
            4 => TensorDType::Int4,
            5 => TensorDType::Fp8E4M3,
            6 => TensorDType::Fp8E5M2,
            7 => TensorDType::Fp4E2M1,
            8 => TensorDType::Nf4,
            other => {
                return Err(EngineError::malformed(format!(
                    "unknown dtype code {other}"
                )))
            }
        })
    }

    pub fn is_quantized(self) -> bool {
        !matches!(
            self,
            TensorDType::F32 | TensorDType::F16 | TensorDType::BF16
        )
    }

    /// Bits per stored code (quantized) or per element (plain).
    pub fn bits(self) -> usize {
        match self {
            TensorDType::F32 => 32,
            TensorDType::F16 | TensorDType::BF16 => 16,
            TensorDType::Int8 | TensorDType::Fp8E4M3 | TensorDType::Fp8E5M2 => 8,
            TensorDType::Int4 | TensorDType::Fp4E2M1 | TensorDType::Nf4 => 4,
        }
    }

    /// True for the integer code formats that may carry zero-points.
    pub fn is_integer(self) -> bool {
        matches!(self, TensorDType::Int4 | TensorDType::Int8)
    }
}

/// Element type of the per-block scale buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDType {
    F32,
    Bf16,
    /// Exponent-only 8-bit scale; valid only with FP8/FP4 weights, where it
    /// adds directly into the reconstructed exponent field.
    Fp8E8M0,
}

impl ScaleDType {
    pub fn code(self) -> u8 {
        match self {
            ScaleDType::F32 => 0,
            ScaleDType::Bf16 => 1,
            ScaleDType::Fp8E8M0 => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ScaleDType::F32,
            1 => ScaleDType::Bf16,
            2 => ScaleDType::Fp8E8M0,
            other => {
                return Err(EngineError::malformed(format!(
                    "unknown scale dtype code {other}"
                )))
            }
        })
    }

    pub fn size_of(self) -> usize {
        match self {
            ScaleDType::F32 => 4,
            ScaleDType::Bf16 => 2,
            ScaleDType::Fp8E8M0 => 1,
        }
    }
}

/// Preferred arithmetic for quantized matmuls, recorded at quantize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDType {
    F32,
    Bf16,
    /// Mixed-precision integer outer product with post-scale.
    Int8,
}

impl ComputeDType {
    pub fn code(self) -> u8 {
        match self {
            ComputeDType::F32 => 0,
            ComputeDType::Bf16 => 1,
            ComputeDType::Int8 => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ComputeDType::F32,
            1 => ComputeDType::Bf16,
            2 => ComputeDType::Int8,
            other => {
                return Err(EngineError::malformed(format!(
                    "unknown compute dtype code {other}"
                )))
            }
        })
    }
}

/// Nibble sign interpretation for 4-bit integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignPolicy {
    /// The nibble already holds a two's-complement value in [-8, 7].
    Clip,
    /// The nibble holds a biased value; subtract 8 after unpacking.
    FullRange,
}

/// Packed description of a quantized (or plain) tensor, round-tripped
/// through the container's `dtype_tag` field.
///
/// Layout: bits 0-7 dtype, 8-15 scale dtype, 16-23 group selector
/// (log2 of block K, 0xFF = per-column), 24-25 pack-row (log2),
/// bit 26 asymmetric, bits 27-28 compute dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtypeTag {
    pub dtype: TensorDType,
    pub scale_dtype: ScaleDType,
    /// Block size K along the reduction dimension; `None` = per-column.
    pub group_size: Option<usize>,
    /// Consecutive K-blocks sharing one scale slot: 1, 2, or 4.
    pub pack_row: usize,
    pub asymmetric: bool,
    pub compute_dtype: ComputeDType,
}

impl DtypeTag {
    pub fn plain(dtype: TensorDType) -> Self {
        DtypeTag {
            dtype,
            scale_dtype: ScaleDType::F32,
            group_size: None,
            pack_row: 1,
            asymmetric: false,
            compute_dtype: ComputeDType::F32,
        }
    }

    pub fn encode(&self) -> u32 {
        let group = match self.group_size {
            None => 0xFF,
            Some(g) => {
                debug_assert!(g.is_power_of_two());
                g.trailing_zeros()
            }
        };
        let pack = self.pack_row.trailing_zeros();
        u32::from(self.dtype.code())
            | (u32::from(self.scale_dtype.code()) << 8)
            | (group << 16)
            | (pack << 24)
            | (u32::from(self.asymmetric) << 26)
            | (u32::from(self.compute_dtype.code()) << 27)
    }

    pub fn decode(tag: u32) -> Result<Self> {
        let dtype = TensorDType::from_code((tag & 0xFF) as u8)?;
        let scale_dtype = ScaleDType::from_code(((tag >> 8) & 0xFF) as u8)?;
        let group_bits = (tag >> 16) & 0xFF;
        let group_size = if group_bits == 0xFF {
            None
        } else {
            Some(1usize << group_bits)
        };
        let pack_row = 1usize << ((tag >> 24) & 0x3);
        if pack_row > 4 {
            return Err(EngineError::malformed(format!("pack_row {pack_row}")));
        }
        let asymmetric = (tag >> 26) & 1 == 1;
        let compute_dtype = ComputeDType::from_code(((tag >> 27) & 0x3) as u8)?;
        Ok(DtypeTag {
            dtype,
            scale_dtype,
            group_size,
            pack_row,
            asymmetric,
            compute_dtype,
        })
    }
}
