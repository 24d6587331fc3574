//! The offline quantization tool: converts dense weight matrices into
//! k-block codes, and whole model files into quantized model files.

use std::path::Path;

use half::bf16;
use ndarray::Array2;

use crate::container::{ContainerWriter, ModelFile};
use crate::error::{EngineError, Result};
use crate::kernels::block::{
    encode_lut4, f32_to_f8, Fp8Format, KBlockLayout, Scales, FP4_E2M1_LUT, NF4_LUT,
};
use crate::kernels::Kernels;
use crate::tensor::{ComputeDType, DtypeTag, ScaleDType, SignPolicy, TensorDType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantAlgo {
    Sym,
    Asym,
}

/// Everything `quantize_file` needs to know. Mirrors the supported
/// (weight, compute, scale) triples; anything else is rejected up front.
#[derive(Debug, Clone, Copy)]
pub struct QuantizeConfig {
    pub weight_dtype: TensorDType,
    /// 32, 128, or -1 for one block per column.
    pub group_size: i32,
    pub algo: QuantAlgo,
    pub scale_dtype: ScaleDType,
    pub compute_dtype: ComputeDType,
}

impl QuantizeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.weight_dtype.is_quantized() {
            return Err(EngineError::config(format!(
                "{:?} is not a quantized weight dtype",
                self.weight_dtype
            )));
        }
        if !matches!(self.group_size, 32 | 128 | -1) {
            return Err(EngineError::config(format!(
                "group_size {} (expected 32, 128 or -1)",
                self.group_size
            )));
        }
        if self.algo == QuantAlgo::Asym && !self.weight_dtype.is_integer() {
            return Err(EngineError::config(
                "asymmetric quantization is only defined for integer weights",
            ));
        }
        if self.scale_dtype == ScaleDType::Fp8E8M0
            && !matches!(
                self.weight_dtype,
                TensorDType::Fp8E4M3 | TensorDType::Fp8E5M2
            )
        {
            return Err(EngineError::config(
                "exponent-only scales require an fp8 weight dtype",
            ));
        }
        if self.compute_dtype == ComputeDType::Int8 && !self.weight_dtype.is_integer() {
            return Err(EngineError::config(
                "int8 compute requires integer weights",
            ));
        }
        if self.compute_dtype == ComputeDType::Int8 && self.scale_dtype == ScaleDType::Fp8E8M0 {
            return Err(EngineError::config(
                "int8 compute cannot use exponent-only scales",
            ));
        }
        Ok(())
    }

    fn kblock_for(&self, rows: usize) -> Result<usize> {
        let kblock = if self.group_size < 0 {
            rows
        } else {
            self.group_size as usize
        };
        if rows % kblock != 0 {
            return Err(EngineError::config(format!(
                "group size {} does not divide {} rows",
                kblock, rows
            )));
        }
        Ok(kblock)
    }
}

/// Output of matrix quantization, section layout matching the container's
/// per-tensor data region.
pub struct QuantizedParts {
    pub codes: Vec<u8>,
    pub scales: Vec<u8>,
    pub zps: Option<Vec<u8>>,
    pub tag: DtypeTag,
}

impl QuantizedParts {
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = self.codes;
        out.extend_from_slice(&self.scales);
        if let Some(z) = self.zps {
            out.extend_from_slice(&z);
        }
        out
    }
}

/// Stores one scale and returns the value the codes must be computed
/// against (i.e. the scale after its own storage rounding).
fn push_scale(buf: &mut Vec<u8>, raw: f32, dtype: ScaleDType) -> f32 {
    match dtype {
        ScaleDType::F32 => {
            buf.extend_from_slice(&raw.to_le_bytes());
            raw
        }
        ScaleDType::Bf16 => {
            let v = bf16::from_f32(raw);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
            v.to_f32()
        }
        ScaleDType::Fp8E8M0 => {
            // Round the exponent up so codes never overflow the format.
            let e = raw.log2().ceil().clamp(-127.0, 127.0) as i8;
            buf.push(e as u8);
            (f32::from(e)).exp2()
        }
    }
}

#[inline]
fn pack_nibble(codes: &mut [u8], idx: usize, v: u8) {
    let byte = &mut codes[idx / 2];
    if idx % 2 == 0 {
        *byte = (*byte & 0xF0) | (v & 0x0F);
    } else {
        *byte = (*byte & 0x0F) | (v << 4);
    }
}

/// Quantizes a dense [K, N] matrix into k-block parts.
///
/// Rounds to nearest with ties away from zero, clamping into the code range
/// before packing. Scales are strictly positive even for all-zero blocks.
pub fn quantize_matrix(data: &Array2<f32>, cfg: &QuantizeConfig) -> Result<QuantizedParts> {
    cfg.validate()?;
    let (rows, cols) = data.dim();
    let kblock = cfg.kblock_for(rows)?;
    if cfg.weight_dtype.bits() == 4 && cols % 2 != 0 {
        return Err(EngineError::config(
            "4-bit formats need an even column count",
        ));
    }
    let n_blocks = rows / kblock;

    let code_bytes = rows * cols * cfg.weight_dtype.bits() / 8;
    let mut codes = vec![0u8; code_bytes];
    let mut scales = Vec::with_capacity(n_blocks * cols * cfg.scale_dtype.size_of());
    let mut zps: Vec<u8> = Vec::new();
    let asym = cfg.algo == QuantAlgo::Asym;

    for b in 0..n_blocks {
        for c in 0..cols {
            let strip: Vec<f32> = (0..kblock).map(|r| data[[b * kblock + r, c]]).collect();
            let amax = strip.iter().fold(0.0f32, |m, &v| m.max(v.abs()));

            match cfg.weight_dtype {
                TensorDType::Int8 | TensorDType::Int4 => {
                    let qmax = if cfg.weight_dtype == TensorDType::Int4 {
                        7.0f32
                    } else {
                        127.0
                    };
                    if asym {
                        let qmin = -(qmax + 1.0);
                        let range = 2.0 * qmax + 1.0;
                        let min = strip.iter().cloned().fold(0.0f32, f32::min);
                        let max = strip.iter().cloned().fold(0.0f32, f32::max);
                        let raw = if max > min { (max - min) / range } else { 1.0 };
                        let s = push_scale(&mut scales, raw, cfg.scale_dtype);
                        let zp = (qmin - (min / s).round()).clamp(qmin, qmax);
                        zps.push(zp as i8 as u8);
                        for (r, &x) in strip.iter().enumerate() {
                            let q = ((x / s).round() + zp).clamp(qmin, qmax);
                            store_int_code(&mut codes, cfg.weight_dtype, (b * kblock + r) * cols + c, q as i32);
                        }
                    } else {
                        let raw = if amax > 0.0 { amax / qmax } else { 1.0 };
                        let s = push_scale(&mut scales, raw, cfg.scale_dtype);
                        for (r, &x) in strip.iter().enumerate() {
                            let q = (x / s).round().clamp(-qmax, qmax);
                            store_int_code(&mut codes, cfg.weight_dtype, (b * kblock + r) * cols + c, q as i32);
                        }
                    }
                }
                TensorDType::Fp8E4M3 | TensorDType::Fp8E5M2 => {
                    let fmt = if cfg.weight_dtype == TensorDType::Fp8E4M3 {
                        Fp8Format::E4M3
                    } else {
                        Fp8Format::E5M2
                    };
                    let raw = if amax > 0.0 { amax / fmt.max_value() } else { 1.0 };
                    let s = push_scale(&mut scales, raw, cfg.scale_dtype);
                    for (r, &x) in strip.iter().enumerate() {
                        codes[(b * kblock + r) * cols + c] = f32_to_f8(x / s, fmt);
                    }
                }
                TensorDType::Fp4E2M1 | TensorDType::Nf4 => {
                    let lut = if cfg.weight_dtype == TensorDType::Nf4 {
                        &NF4_LUT
                    } else {
                        &FP4_E2M1_LUT
                    };
                    let raw = if amax > 0.0 { amax } else { 1.0 };
                    let s = push_scale(&mut scales, raw, cfg.scale_dtype);
                    for (r, &x) in strip.iter().enumerate() {
                        let idx = encode_lut4(x / s, lut);
                        pack_nibble(&mut codes, (b * kblock + r) * cols + c, idx);
                    }
                }
                _ => unreachable!("validated above"),
            }
        }
    }

    Ok(QuantizedParts {
        codes,
        scales,
        zps: if asym { Some(zps) } else { None },
        tag: DtypeTag {
            dtype: cfg.weight_dtype,
            scale_dtype: cfg.scale_dtype,
            group_size: if cfg.group_size < 0 { None } else { Some(kblock) },
            pack_row: 1,
            asymmetric: asym,
            compute_dtype: cfg.compute_dtype,
        },
    })
}

#[inline]
fn store_int_code(codes: &mut [u8], dtype: TensorDType, idx: usize, q: i32) {
    match dtype {
        TensorDType::Int8 => codes[idx] = q as i8 as u8,
        TensorDType::Int4 => pack_nibble(codes, idx, (q as i8 as u8) & 0x0F),
        _ => unreachable!(),
    }
}

/// Dense reconstruction of quantized parts, without going through a file.
pub fn dequantize_parts(
    parts: &QuantizedParts,
    rows: usize,
    cols: usize,
    kernels: &Kernels,
) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((rows, cols));
    let dst = out.as_slice_mut().expect("freshly allocated");
    let lay = KBlockLayout {
        k_offset: 0,
        kblock: parts.tag.group_size.unwrap_or(rows),
        pack_row: parts.tag.pack_row,
        scale_stride: cols,
    };
    let scales = Scales::from_bytes(parts.tag.scale_dtype, &parts.scales);
    let zps: Option<&[i8]> = parts.zps.as_deref().map(bytemuck::cast_slice);
    match parts.tag.dtype {
        TensorDType::Int8 => (kernels.dequant_s8_tile)(
            bytemuck::cast_slice(&parts.codes),
            cols,
            dst,
            cols,
            rows,
            cols,
            scales,
            zps,
            lay,
        ),
        TensorDType::Int4 => (kernels.dequant_s4_tile)(
            &parts.codes,
            cols,
            dst,
            cols,
            rows,
            cols,
            SignPolicy::Clip,
            scales,
            zps,
            lay,
        ),
        TensorDType::Fp4E2M1 => {
            (kernels.dequant_f4_tile)(&parts.codes, cols, dst, cols, rows, cols, &FP4_E2M1_LUT, scales, lay)
        }
        TensorDType::Nf4 => {
            (kernels.dequant_f4_tile)(&parts.codes, cols, dst, cols, rows, cols, &NF4_LUT, scales, lay)
        }
        TensorDType::Fp8E4M3 => (kernels.dequant_f8_tile)(
            &parts.codes,
            cols,
            dst,
            cols,
            rows,
            cols,
            Fp8Format::E4M3,
            scales,
            lay,
        ),
        TensorDType::Fp8E5M2 => (kernels.dequant_f8_tile)(
            &parts.codes,
            cols,
            dst,
            cols,
            rows,
            cols,
            Fp8Format::E5M2,
            scales,
            lay,
        ),
        _ => unreachable!(),
    }
    out
}

/// Whether this tensor participates in weight quantization.
///
/// Norm weights, biases and the token embedding stay dense; projection
/// matrices qualify when the block size divides their reduction dimension.
fn should_quantize(name: &str, shape: &[usize], cfg: &QuantizeConfig) -> bool {
    if shape.len() != 2 || name.contains("norm") || name.starts_with("tok_embd") {
        return false;
    }
    let rows = shape[0];
    let kblock = if cfg.group_size < 0 {
        rows
    } else {
        cfg.group_size as usize
    };
    rows % kblock == 0 && (cfg.weight_dtype.bits() != 4 || shape[1] % 2 == 0)
}

/// Quantizes every eligible weight of `input` into a new container at
/// `output`. Ineligible tensors are copied through unchanged.
pub fn quantize_file(input: &Path, output: &Path, cfg: &QuantizeConfig) -> Result<()> {
    cfg.validate()?;
    let file = ModelFile::open(input)?;
    let mut writer = ContainerWriter::new(file.hparams.clone(), file.vocab.clone());

    let mut names: Vec<String> = file.tensor_names().map(String::from).collect();
    names.sort();

    let mut quantized = 0usize;
    for name in &names {
        let view = file.tensor(name)?;
        if view.tag.dtype.is_quantized() {
            return Err(EngineError::config(format!(
                "input tensor '{name}' is already quantized"
            )));
        }
        if should_quantize(name, &view.shape, cfg) {
            let dense = view.to_f32_matrix()?;
            let parts = quantize_matrix(&dense, cfg)?;
            let shape = view.shape.clone();
            writer.add_tensor(name, &shape, parts.tag, parts.into_bytes());
            quantized += 1;
        } else {
            writer.add_tensor(name, &view.shape, view.tag, view.bytes().to_vec());
        }
    }

    writer.write_to(output)?;
    log::info!(
        "quantized {} of {} tensors to {:?} (group {}, {:?})",
        quantized,
        names.len(),
        cfg.weight_dtype,
        cfg.group_size,
        cfg.algo
    );
    Ok(())
}
