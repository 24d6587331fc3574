//! Weight containers.
//!
//! A [`QuantTensor`] owns its block metadata and borrows code, scale and
//! zero-point bytes from the file mapping. Matrices are stored reduction-
//! major: shape [K, N] with one scale slot per k-block per output column.

use ndarray::Array2;

use crate::error::{EngineError, Result};
use crate::kernels::block::{Fp8Format, KBlockLayout, Scales, FP4_E2M1_LUT, NF4_LUT};
use crate::kernels::Kernels;
use crate::tensor::{ComputeDType, SignPolicy, TensorDType, TensorView};

/// A block-quantized weight matrix backed by the model mapping.
#[derive(Debug)]
pub struct QuantTensor {
    pub name: String,
    /// Reduction dimension (rows of the stored matrix).
    pub rows: usize,
    /// Output dimension (columns).
    pub cols: usize,
    pub dtype: TensorDType,
    pub compute_dtype: ComputeDType,
    pub asymmetric: bool,
    kblock: usize,
    pack_row: usize,
    codes: TensorView,
    scales: TensorView,
    zps: Option<TensorView>,
}

impl QuantTensor {
    /// Carves the `[codes][scales][zero_points?]` sections out of a raw
    /// tensor view and validates the geometry.
    pub fn from_view(view: TensorView) -> Result<Self> {
        let tag = view.tag;
        if !tag.dtype.is_quantized() {
            return Err(EngineError::malformed(format!(
                "tensor '{}' is not quantized ({:?})",
                view.name, tag.dtype
            )));
        }
        if view.shape.len() != 2 {
            return Err(EngineError::malformed(format!(
                "tensor '{}': quantized tensors are 2-D, got {:?}",
                view.name, view.shape
            )));
        }
        let (rows, cols) = (view.shape[0], view.shape[1]);
        let kblock = tag.group_size.unwrap_or(rows);
        if kblock == 0 || rows % kblock != 0 {
            return Err(EngineError::malformed(format!(
                "tensor '{}': block {} does not divide rows {}",
                view.name, kblock, rows
            )));
        }
        let n_blocks = rows / kblock;
        if n_blocks % tag.pack_row != 0 && n_blocks != 1 {
            return Err(EngineError::malformed(format!(
                "tensor '{}': pack_row {} does not divide {} blocks",
                view.name, tag.pack_row, n_blocks
            )));
        }
        if tag.dtype.bits() == 4 && cols % 2 != 0 {
            return Err(EngineError::malformed(format!(
                "tensor '{}': 4-bit tensors need an even column count",
                view.name
            )));
        }
        if tag.asymmetric && !tag.dtype.is_integer() {
            return Err(EngineError::malformed(format!(
                "tensor '{}': zero-points are only valid for integer codes",
                view.name
            )));
        }

        let code_bytes = rows * cols * tag.dtype.bits() / 8;
        let n_slots = n_blocks.div_ceil(tag.pack_row) * cols;
        let scale_bytes = n_slots * tag.scale_dtype.size_of();
        let zp_bytes = if tag.asymmetric { n_slots } else { 0 };
        let expected = code_bytes + scale_bytes + zp_bytes;
        if view.byte_len() != expected {
            return Err(EngineError::malformed(format!(
                "tensor '{}': {} data bytes, expected {}",
                view.name,
                view.byte_len(),
                expected
            )));
        }

        let codes = view.slice(0, code_bytes)?;
        let scales = view.slice(code_bytes, scale_bytes)?;
        let zps = if tag.asymmetric {
            Some(view.slice(code_bytes + scale_bytes, zp_bytes)?)
        } else {
            None
        };

        Ok(QuantTensor {
            name: view.name.clone(),
            rows,
            cols,
            dtype: tag.dtype,
            compute_dtype: tag.compute_dtype,
            asymmetric: tag.asymmetric,
            kblock,
            pack_row: tag.pack_row,
            codes,
            scales,
            zps,
        })
    }

    pub fn kblock(&self) -> usize {
        self.kblock
    }

    pub fn pack_row(&self) -> usize {
        self.pack_row
    }

    pub fn codes(&self) -> &[u8] {
        self.codes.bytes()
    }

    fn codes_i8(&self) -> &[i8] {
        bytemuck::cast_slice(self.codes.bytes())
    }

    pub fn scales(&self) -> Scales<'_> {
        Scales::from_bytes(self.scales.tag.scale_dtype, self.scales.bytes())
    }

    pub fn zero_points(&self) -> Option<&[i8]> {
        self.zps.as_ref().map(|v| bytemuck::cast_slice(v.bytes()))
    }

    fn layout(&self, k_offset: usize) -> KBlockLayout {
        KBlockLayout {
            k_offset,
            kblock: self.kblock,
            pack_row: self.pack_row,
            scale_stride: self.cols,
        }
    }

    /// Dequantizes the tile starting at (k0, c0) into `dst` (row-major,
    /// `cols` wide).
    pub fn dequant_tile(
        &self,
        kernels: &Kernels,
        k0: usize,
        c0: usize,
        rows: usize,
        cols: usize,
        dst: &mut [f32],
    ) {
        let lay = self.layout(k0);
        let scales = self.scales().offset(c0);
        let zps = self.zero_points().map(|z| &z[c0..]);
        match self.dtype {
            TensorDType::Int8 => {
                let src = &self.codes_i8()[k0 * self.cols + c0..];
                (kernels.dequant_s8_tile)(src, self.cols, dst, cols, rows, cols, scales, zps, lay);
            }
            TensorDType::Int4 => {
                let src = &self.codes()[(k0 * self.cols + c0) / 2..];
                (kernels.dequant_s4_tile)(
                    src,
                    self.cols,
                    dst,
                    cols,
                    rows,
                    cols,
                    SignPolicy::Clip,
                    scales,
                    zps,
                    lay,
                );
            }
            TensorDType::Fp4E2M1 => {
                let src = &self.codes()[(k0 * self.cols + c0) / 2..];
                (kernels.dequant_f4_tile)(
                    src,
                    self.cols,
                    dst,
                    cols,
                    rows,
                    cols,
                    &FP4_E2M1_LUT,
                    scales,
                    lay,
                );
            }
            TensorDType::Nf4 => {
                let src = &self.codes()[(k0 * self.cols + c0) / 2..];
                (kernels.dequant_f4_tile)(
                    src,
                    self.cols,
                    dst,
                    cols,
                    rows,
                    cols,
                    &NF4_LUT,
                    scales,
                    lay,
                );
            }
            TensorDType::Fp8E4M3 | TensorDType::Fp8E5M2 => {
                let fmt = if self.dtype == TensorDType::Fp8E4M3 {
                    Fp8Format::E4M3
                } else {
                    Fp8Format::E5M2
                };
                let src = &self.codes()[k0 * self.cols + c0..];
                (kernels.dequant_f8_tile)(src, self.cols, dst, cols, rows, cols, fmt, scales, lay);
            }
            _ => unreachable!("plain dtype in QuantTensor"),
        }
        if self.compute_dtype == ComputeDType::Bf16 {
            (kernels.cast_bf16)(&mut dst[..rows * cols]);
        }
    }

    /// Full dense reconstruction, used at load for small tensors and by
    /// tests.
    pub fn dequantize(&self, kernels: &Kernels) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((self.rows, self.cols));
        let dst = out.as_slice_mut().expect("freshly allocated");
        self.dequant_tile(kernels, 0, 0, self.rows, self.cols, dst);
        out
    }
}

/// Repacked integer weight for the mixed-precision compute path.
///
/// Codes are re-laid out output-major so each column's k-strip is
/// contiguous; per-block code sums are precomputed for zero-point
/// correction.
pub struct PackedInt8 {
    /// [cols * rows], column-major strips of signed codes.
    codes: Vec<i8>,
    /// [cols * n_blocks] scales, column-major.
    scales: Vec<f32>,
    /// [cols * n_blocks] weight zero-points (zeros when symmetric).
    zps: Vec<i32>,
    /// [cols * n_blocks] per-block code sums.
    sums: Vec<i32>,
    pub rows: usize,
    pub cols: usize,
    pub kblock: usize,
}

impl PackedInt8 {
    pub fn from_quant(q: &QuantTensor, kernels: &Kernels) -> Result<Self> {
        if !q.dtype.is_integer() {
            return Err(EngineError::internal(format!(
                "int8 repack of non-integer tensor '{}'",
                q.name
            )));
        }
        let (rows, cols, kblock) = (q.rows, q.cols, q.kblock);
        let n_blocks = rows / kblock;

        // Widen 4-bit codes once, row-major.
        let row_major: Vec<i8> = match q.dtype {
            TensorDType::Int8 => q.codes_i8().to_vec(),
            TensorDType::Int4 => {
                let mut tmp = vec![0i8; rows * cols];
                (kernels.unpack_s4)(q.codes(), &mut tmp, SignPolicy::Clip);
                tmp
            }
            _ => unreachable!(),
        };

        let mut codes = vec![0i8; rows * cols];
        let mut scales = vec![0f32; cols * n_blocks];
        let mut zps = vec![0i32; cols * n_blocks];
        let mut sums = vec![0i32; cols * n_blocks];
        let src_scales = q.scales();
        let src_zps = q.zero_points();
        for c in 0..cols {
            for r in 0..rows {
                codes[c * rows + r] = row_major[r * cols + c];
            }
            for b in 0..n_blocks {
                let slot = (b / q.pack_row) * cols + c;
                scales[c * n_blocks + b] = src_scales.get(slot);
                zps[c * n_blocks + b] = src_zps.map_or(0, |z| i32::from(z[slot]));
                let strip = &codes[c * rows + b * kblock..c * rows + (b + 1) * kblock];
                sums[c * n_blocks + b] = strip.iter().map(|&v| i32::from(v)).sum();
            }
        }
        Ok(PackedInt8 {
            codes,
            scales,
            zps,
            sums,
            rows,
            cols,
            kblock,
        })
    }

    #[inline]
    pub fn column_codes(&self, c: usize) -> &[i8] {
        &self.codes[c * self.rows..(c + 1) * self.rows]
    }

    #[inline]
    pub fn block_meta(&self, c: usize, b: usize) -> (f32, i32, i32) {
        let n_blocks = self.rows / self.kblock;
        let i = c * n_blocks + b;
        (self.scales[i], self.zps[i], self.sums[i])
    }
}

/// A linear-layer weight in whichever representation the file provided.
pub enum Linear {
    /// Dense rows, output-major [N, K]; each output is a dot product.
    Rows(Array2<f32>),
    /// Block-quantized, reduction-major; dequantize-tile-and-accumulate.
    Quant(QuantTensor),
    /// Integer codes repacked for the mixed-precision path.
    QuantInt8(QuantTensor, PackedInt8),
}

impl Linear {
    /// Loads a 2-D weight view into the right representation.
    pub fn from_view(view: TensorView, kernels: &Kernels) -> Result<Self> {
        if view.tag.dtype.is_quantized() {
            let q = QuantTensor::from_view(view)?;
            if q.compute_dtype == ComputeDType::Int8 && q.dtype.is_integer() {
                let packed = PackedInt8::from_quant(&q, kernels)?;
                Ok(Linear::QuantInt8(q, packed))
            } else {
                Ok(Linear::Quant(q))
            }
        } else {
            // Dense weights are stored [K, N] like everything else; the dot
            // kernels want rows per output.
            let m = view.to_f32_matrix()?;
            Ok(Linear::Rows(m.t().to_owned()))
        }
    }

    /// (in_features, out_features).
    pub fn dims(&self) -> (usize, usize) {
        match self {
            Linear::Rows(m) => (m.ncols(), m.nrows()),
            Linear::Quant(q) | Linear::QuantInt8(q, _) => (q.rows, q.cols),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerWriter, Hparams, ModelFile, NO_TOKEN};
    use crate::quant::{quantize_matrix, QuantAlgo, QuantizeConfig};
    use crate::tensor::ScaleDType;

    fn hparams() -> Hparams {
        Hparams {
            n_vocab: 1,
            n_embd: 8,
            n_head: 1,
            n_kv_head: 1,
            head_dim: 8,
            n_ff: 16,
            n_layer: 1,
            arch_tag: 0,
            rope_theta: 10000.0,
            ctx_max: 32,
            bos_id: NO_TOKEN,
            eos_id: 0,
        }
    }

    #[test]
    fn test_quant_tensor_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.myla");

        let k = 64;
        let n = 8;
        let data = Array2::from_shape_fn((k, n), |(i, j)| ((i * n + j) as f32 * 0.01).sin());
        let cfg = QuantizeConfig {
            weight_dtype: TensorDType::Int8,
            group_size: 32,
            algo: QuantAlgo::Sym,
            scale_dtype: ScaleDType::F32,
            compute_dtype: ComputeDType::F32,
        };
        let parts = quantize_matrix(&data, &cfg).unwrap();

        let mut writer = ContainerWriter::new(hparams(), vec![("a".into(), 0.0)]);
        writer.add_tensor("w", &[k, n], parts.tag, parts.into_bytes());
        writer.write_to(&path).unwrap();

        let file = ModelFile::open(&path).unwrap();
        let q = QuantTensor::from_view(file.tensor("w").unwrap()).unwrap();
        assert_eq!(q.rows, k);
        assert_eq!(q.cols, n);
        assert_eq!(q.kblock(), 32);

        let kernels = crate::kernels::best();
        let deq = q.dequantize(kernels);
        for ((i, j), &orig) in data.indexed_iter() {
            let err = (deq[[i, j]] - orig).abs();
            assert!(err <= 1.0 / 127.0, "({}, {}): {} vs {}", i, j, deq[[i, j]], orig);
        }
    }

    #[test]
    fn test_quant_tensor_rejects_truncated_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.myla");

        let data = Array2::from_elem((32, 4), 1.0f32);
        let cfg = QuantizeConfig {
            weight_dtype: TensorDType::Int8,
            group_size: 32,
            algo: QuantAlgo::Sym,
            scale_dtype: ScaleDType::F32,
            compute_dtype: ComputeDType::F32,
        };
        let parts = quantize_matrix(&data, &cfg).unwrap();
        let mut bytes = parts.into_bytes();
        bytes.pop();

        let mut writer = ContainerWriter::new(hparams(), vec![("a".into(), 0.0)]);
        let tag = quantize_matrix(&data, &cfg).unwrap().tag;
        writer.add_tensor("w", &[32, 4], tag, bytes);
        writer.write_to(&path).unwrap();

        let file = ModelFile::open(&path).unwrap();
        let err = QuantTensor::from_view(file.tensor("w").unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::MalformedModel(_)));
    }

    #[test]
    fn test_packed_int8_metadata() {
        let k = 64;
        let n = 4;
        let data = Array2::from_shape_fn((k, n), |(i, j)| (i as f32 - 32.0) * 0.1 + j as f32);
        let cfg = QuantizeConfig {
            weight_dtype: TensorDType::Int8,
            group_size: 32,
            algo: QuantAlgo::Sym,
            scale_dtype: ScaleDType::F32,
            compute_dtype: ComputeDType::Int8,
        };
        let parts = quantize_matrix(&data, &cfg).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.myla");
        let mut writer = ContainerWriter::new(hparams(), vec![("a".into(), 0.0)]);
        writer.add_tensor("w", &[k, n], parts.tag, parts.into_bytes());
        writer.write_to(&path).unwrap();

        let file = ModelFile::open(&path).unwrap();
        let kernels = crate::kernels::best();
        let lin = Linear::from_view(file.tensor("w").unwrap(), kernels).unwrap();
        let Linear::QuantInt8(q, packed) = lin else {
            panic!("expected int8 repack");
        };
        assert_eq!(packed.rows, k);
        assert_eq!(packed.cols, n);
        // Column strips must agree with the row-major codes.
        let deq = q.dequantize(kernels);
        let col0 = packed.column_codes(0);
        let (scale, zp, sum) = packed.block_meta(0, 0);
        assert_eq!(zp, 0);
        assert_eq!(
            sum,
            col0[..32].iter().map(|&v| i32::from(v)).sum::<i32>()
        );
        let approx = f32::from(col0[0]) * scale;
        assert!((approx - deq[[0, 0]]).abs() < 1e-6);
    }
}
