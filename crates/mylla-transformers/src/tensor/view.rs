use std::ops::Range;
use std::sync::Arc;

use half::{bf16, f16};
use memmap2::Mmap;
use ndarray::Array2;

use crate::error::{EngineError, Result};
use crate::tensor::dtype::{DtypeTag, TensorDType};

/// A raw view into one tensor's bytes inside the mapped model file.
///
/// The view owns its metadata and borrows the bytes through the shared
/// mapping; the mapping outlives every view derived from it.
#[derive(Clone, Debug)]
pub struct TensorView {
    pub name: String,
    pub shape: Vec<usize>,
    pub tag: DtypeTag,
    mmap: Arc<Mmap>,
    range: Range<usize>,
}

impl TensorView {
    pub fn new(
        name: String,
        shape: Vec<usize>,
        tag: DtypeTag,
        mmap: Arc<Mmap>,
        range: Range<usize>,
    ) -> Result<Self> {
        if range.end > mmap.len() {
            return Err(EngineError::malformed(format!(
                "tensor '{}' points outside of file bounds",
                name
            )));
        }
        Ok(TensorView {
            name,
            shape,
            tag,
            mmap,
            range,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap[self.range.clone()]
    }

    pub fn byte_len(&self) -> usize {
        self.range.end - self.range.start
    }

    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Splits this view's byte range into a sub-view (used to carve the
    /// `[codes][scales][zero_points?]` sections of a quantized tensor).
    pub fn slice(&self, offset: usize, len: usize) -> Result<TensorView> {
        let start = self.range.start + offset;
        let end = start + len;
        if end > self.range.end {
            return Err(EngineError::malformed(format!(
                "tensor '{}' section [{}..{}] exceeds data size {}",
                self.name,
                offset,
                offset + len,
                self.byte_len()
            )));
        }
        Ok(TensorView {
            name: self.name.clone(),
            shape: self.shape.clone(),
            tag: self.tag,
            mmap: Arc::clone(&self.mmap),
            range: start..end,
        })
    }

    /// Decodes a plain (non-quantized) 1-D tensor into f32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let bytes = self.bytes();
        let n = self.elements();
        match self.tag.dtype {
            TensorDType::F32 => {
                if bytes.len() != n * 4 {
                    return Err(self.size_mismatch(n * 4));
                }
                Ok(bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect())
            }
            TensorDType::F16 => {
                if bytes.len() != n * 2 {
                    return Err(self.size_mismatch(n * 2));
                }
                Ok(bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes(c.try_into().unwrap()).to_f32())
                    .collect())
            }
            TensorDType::BF16 => {
                if bytes.len() != n * 2 {
                    return Err(self.size_mismatch(n * 2));
                }
                Ok(bytes
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes(c.try_into().unwrap()).to_f32())
                    .collect())
            }
            other => Err(EngineError::malformed(format!(
                "tensor '{}': automatic f32 conversion not supported for {:?}",
                self.name, other
            ))),
        }
    }

    /// Decodes a plain 2-D tensor into a dense f32 matrix.
    pub fn to_f32_matrix(&self) -> Result<Array2<f32>> {
        if self.shape.len() != 2 {
            return Err(EngineError::malformed(format!(
                "tensor '{}': expected 2 dims, got {:?}",
                self.name, self.shape
            )));
        }
        let data = self.to_f32_vec()?;
        Array2::from_shape_vec((self.shape[0], self.shape[1]), data)
            .map_err(|e| EngineError::malformed(format!("tensor '{}': {}", self.name, e)))
    }

    fn size_mismatch(&self, expected: usize) -> EngineError {
        EngineError::malformed(format!(
            "tensor '{}': {} data bytes, expected {}",
            self.name,
            self.byte_len(),
            expected
        ))
    }
}
