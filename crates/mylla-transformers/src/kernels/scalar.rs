//! Portable reference kernels.
//!
//! Every operation in the dispatch table has its baseline here. These are
//! the semantics the SIMD tiers are tested against; tail handling in the
//! accelerated kernels must reproduce these results exactly.

use libm::{erff, expf};

use crate::kernels::block::{f8_to_f32, Fp8Format, KBlockLayout, Scales};
use crate::tensor::SignPolicy;

// =======================================================================
//  Code unpacking
// =======================================================================

/// Sign-interprets one nibble.
#[inline(always)]
pub fn s4_code(nibble: u8, policy: SignPolicy) -> i8 {
    match policy {
        // Two's-complement in 4 bits: flip the sign bit, then re-center.
        SignPolicy::Clip => ((nibble ^ 8) as i8) - 8,
        SignPolicy::FullRange => nibble as i8 - 8,
    }
}

/// Unpacks `dst.len()` 4-bit codes (two per source byte, low nibble first)
/// into signed bytes. Consumes `dst.len() / 2` source bytes.
pub fn unpack_s4(src: &[u8], dst: &mut [i8], policy: SignPolicy) {
    let n = dst.len();
    debug_assert!(src.len() * 2 >= n);
    for i in 0..n {
        let byte = src[i / 2];
        let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
        dst[i] = s4_code(nibble, policy);
    }
}

#[inline(always)]
fn nibble_at(src: &[u8], idx: usize) -> u8 {
    let byte = src[idx / 2];
    if idx % 2 == 0 {
        byte & 0x0F
    } else {
        byte >> 4
    }
}

// =======================================================================
//  K-block dequantization
// =======================================================================

/// Dequantizes a tile of 8-bit integer codes to f32.
///
/// `src_ld` / `dst_ld` are row strides in elements. Scale slots are located
/// through `lay`, which also carries the `k_offset` of the tile.
pub fn dequant_s8_tile(
    src: &[i8],
    src_ld: usize,
    dst: &mut [f32],
    dst_ld: usize,
    rows: usize,
    cols: usize,
    scales: Scales<'_>,
    zps: Option<&[i8]>,
    lay: KBlockLayout,
) {
    for r in 0..rows {
        for c in 0..cols {
            let slot = lay.slot(r, c);
            let mut v = f32::from(src[r * src_ld + c]);
            if let Some(zp) = zps {
                v -= f32::from(zp[slot]);
            }
            dst[r * dst_ld + c] = v * scales.get(slot);
        }
    }
}

/// Dequantizes a tile of packed 4-bit integer codes to f32.
///
/// `src_ld` must be even so every row starts on a byte boundary.
pub fn dequant_s4_tile(
    src: &[u8],
    src_ld: usize,
    dst: &mut [f32],
    dst_ld: usize,
    rows: usize,
    cols: usize,
    policy: SignPolicy,
    scales: Scales<'_>,
    zps: Option<&[i8]>,
    lay: KBlockLayout,
) {
    debug_assert!(src_ld % 2 == 0);
    for r in 0..rows {
        for c in 0..cols {
            let slot = lay.slot(r, c);
            let code = s4_code(nibble_at(src, r * src_ld + c), policy);
            let mut v = f32::from(code);
            if let Some(zp) = zps {
                v -= f32::from(zp[slot]);
            }
            dst[r * dst_ld + c] = v * scales.get(slot);
        }
    }
}

/// Dequantizes a tile of packed 4-bit lookup codes (FP4/NF4) to f32.
pub fn dequant_f4_tile(
    src: &[u8],
    src_ld: usize,
    dst: &mut [f32],
    dst_ld: usize,
    rows: usize,
    cols: usize,
    lut: &[f32; 16],
    scales: Scales<'_>,
    lay: KBlockLayout,
) {
    debug_assert!(src_ld % 2 == 0);
    for r in 0..rows {
        for c in 0..cols {
            let slot = lay.slot(r, c);
            let idx = nibble_at(src, r * src_ld + c) as usize;
            dst[r * dst_ld + c] = lut[idx] * scales.get(slot);
        }
    }
}

/// Dequantizes a tile of 8-bit micro-float codes to f32.
///
/// With an exponent-only scale the block exponent is added into the
/// reconstructed value's exponent field; otherwise the decoded value is
/// multiplied by the block scale.
pub fn dequant_f8_tile(
    src: &[u8],
    src_ld: usize,
    dst: &mut [f32],
    dst_ld: usize,
    rows: usize,
    cols: usize,
    fmt: Fp8Format,
    scales: Scales<'_>,
    lay: KBlockLayout,
) {
    for r in 0..rows {
        for c in 0..cols {
            let slot = lay.slot(r, c);
            let byte = src[r * src_ld + c];
            dst[r * dst_ld + c] = match scales.exponent(slot) {
                Some(e) => f8_to_f32(byte, fmt, e),
                None => f8_to_f32(byte, fmt, 0) * scales.get(slot),
            };
        }
    }
}

// =======================================================================
//  Activation quantization
// =======================================================================

/// Asymmetric per-row quantization of f32 activations to u8, one scale and
/// zero-point per `kblock` elements. `sums` (when present) receives the
/// per-block sum of emitted codes, consumed later by bias correction.
///
/// Rounds to nearest, ties away from zero; clamps before packing.
pub fn quantize_row_u8(
    src: &[f32],
    codes: &mut [u8],
    scales: &mut [f32],
    zps: &mut [u8],
    mut sums: Option<&mut [i32]>,
    kblock: usize,
) {
    debug_assert_eq!(src.len(), codes.len());
    for (b, chunk) in src.chunks(kblock).enumerate() {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &x in chunk {
            min = min.min(x);
            max = max.max(x);
        }
        min = min.min(0.0);
        max = max.max(0.0);
        let scale = if max > min { (max - min) / 255.0 } else { 1.0 };
        let zp = (-min / scale).round().clamp(0.0, 255.0);
        scales[b] = scale;
        zps[b] = zp as u8;
        let mut block_sum = 0i32;
        for (i, &x) in chunk.iter().enumerate() {
            let q = (x / scale).round() + zp;
            let q = q.clamp(0.0, 255.0) as u8;
            codes[b * kblock + i] = q;
            block_sum += i32::from(q);
        }
        if let Some(s) = sums.as_deref_mut() {
            s[b] = block_sum;
        }
    }
}

// =======================================================================
//  Dot products and tile accumulation
// =======================================================================

/// out[i] = dot(a, b_rows[i]); `b_rows` is row-major [len(out), k].
pub fn matmul_vec_f32(out: &mut [f32], a: &[f32], b_rows: &[f32], k: usize) {
    for (i, out_val) in out.iter_mut().enumerate() {
        let row = &b_rows[i * k..(i + 1) * k];
        let mut sum = 0.0f32;
        for j in 0..k {
            sum += a[j] * row[j];
        }
        *out_val = sum;
    }
}

/// acc += alpha * x, the column-tile microkernel of the quantized matmul.
pub fn axpy(acc: &mut [f32], alpha: f32, x: &[f32]) {
    for (a, &v) in acc.iter_mut().zip(x.iter()) {
        *a += alpha * v;
    }
}

/// Integer dot product of u8 activations against i8 weight codes.
pub fn dot_u8s8(a: &[u8], w: &[i8]) -> i32 {
    let mut acc = 0i32;
    for (&x, &y) in a.iter().zip(w.iter()) {
        acc += i32::from(x) * i32::from(y);
    }
    acc
}

/// Removes the zero-point contributions from an integer accumulator:
/// `acc - zp_a*sum_b - zp_b*sum_a + zp_a*zp_b*k`.
#[inline(always)]
pub fn bias_correct(acc: i32, zp_a: i32, zp_b: i32, sum_a: i32, sum_b: i32, k: i32) -> i32 {
    acc - zp_a * sum_b - zp_b * sum_a + zp_a * zp_b * k
}

// =======================================================================
//  Elementwise
// =======================================================================

/// dst = alpha * a + beta * b.
pub fn alphabeta(dst: &mut [f32], alpha: f32, a: &[f32], beta: f32, b: &[f32]) {
    for i in 0..dst.len() {
        dst[i] = alpha * a[i] + beta * b[i];
    }
}

pub fn add_assign(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

pub fn mul_assign(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d *= s;
    }
}

/// dst += alpha * src.
pub fn accumulate_alpha(dst: &mut [f32], alpha: f32, src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d += alpha * s;
    }
}

pub fn clip(dst: &mut [f32], lo: f32, hi: f32) {
    for d in dst.iter_mut() {
        *d = d.clamp(lo, hi);
    }
}

/// Rounds every value through bf16, the reduced-precision compute path.
pub fn cast_bf16(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = half::bf16::from_f32(*v).to_f32();
    }
}

pub fn silu(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = if *v <= -20.0 {
            0.0
        } else if *v >= 20.0 {
            *v
        } else {
            *v / (1.0 + expf(-*v))
        };
    }
}

pub fn gelu(x: &mut [f32]) {
    const SQRT_2_INV: f32 = 0.707_106_77;
    for v in x.iter_mut() {
        *v = 0.5 * *v * (1.0 + erff(*v * SQRT_2_INV));
    }
}

/// Numerically stable softmax. A +inf entry collapses the row to a one-hot
/// at the first maximum.
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let mut max = f32::NEG_INFINITY;
    let mut argmax = 0;
    for (i, &v) in x.iter().enumerate() {
        if v > max {
            max = v;
            argmax = i;
        }
    }
    if max.is_infinite() && max > 0.0 {
        for v in x.iter_mut() {
            *v = 0.0;
        }
        x[argmax] = 1.0;
        return;
    }
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = expf(*v - max);
        sum += *v;
    }
    if sum == 0.0 {
        for v in x.iter_mut() {
            *v = 0.0;
        }
        x[argmax] = 1.0;
        return;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
}

pub fn rms_norm(x: &mut [f32], w: &[f32], eps: f32) {
    let len = x.len();
    let sum_sq: f32 = x.iter().map(|v| v * v).sum();
    let scale = 1.0 / (sum_sq / len as f32 + eps).sqrt();
    for i in 0..len {
        x[i] = x[i] * scale * w[i];
    }
}

pub fn layer_norm(x: &mut [f32], w: &[f32], bias: Option<&[f32]>, eps: f32) {
    let len = x.len();
    let mean: f32 = x.iter().sum::<f32>() / len as f32;
    let var: f32 = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / len as f32;
    let inv_std = 1.0 / (var + eps).sqrt();
    match bias {
        Some(b) => {
            for i in 0..len {
                x[i] = (x[i] - mean) * inv_std * w[i] + b[i];
            }
        }
        None => {
            for i in 0..len {
                x[i] = (x[i] - mean) * inv_std * w[i];
            }
        }
    }
}

// =======================================================================
//  Rotary position embedding
// =======================================================================

/// Rotate-half RoPE: pairs (i, i + d/2), `cos`/`sin` indexed by i.
pub fn rope_rotate_half(x: &mut [f32], cos: &[f32], sin: &[f32]) {
    let half = x.len() / 2;
    for i in 0..half {
        let x0 = x[i];
        let x1 = x[i + half];
        x[i] = x0 * cos[i] - x1 * sin[i];
        x[i + half] = x0 * sin[i] + x1 * cos[i];
    }
}

/// Interleaved RoPE: pairs (2i, 2i + 1), `cos`/`sin` indexed by i.
pub fn rope_interleaved(x: &mut [f32], cos: &[f32], sin: &[f32]) {
    let half = x.len() / 2;
    for i in 0..half {
        let x0 = x[2 * i];
        let x1 = x[2 * i + 1];
        x[2 * i] = x0 * cos[i] - x1 * sin[i];
        x[2 * i + 1] = x0 * sin[i] + x1 * cos[i];
    }
}

// =======================================================================
//  Reductions
// =======================================================================

pub fn reduce_max(x: &[f32]) -> f32 {
    x.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
}

pub fn reduce_sum(x: &[f32]) -> f32 {
    x.iter().sum()
}

/// Per-block, per-column sums of signed weight codes: out[b * cols + c] =
/// sum of codes in block b, column c. Consumed by bias correction.
pub fn sum_kblock_s8(src: &[i8], rows: usize, cols: usize, kblock: usize, out: &mut [i32]) {
    for v in out.iter_mut() {
        *v = 0;
    }
    for r in 0..rows {
        let b = r / kblock;
        for c in 0..cols {
            out[b * cols + c] += i32::from(src[r * cols + c]);
        }
    }
}
