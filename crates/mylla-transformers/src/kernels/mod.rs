//! SIMD-dispatched numeric primitives.
//!
//! Every operation has a portable reference in [`scalar`]; accelerated
//! implementations live in per-architecture submodules. A [`Kernels`] table
//! is populated once at startup for the probed tier, and every call site
//! goes through it. `Kernels::for_tier` builds tables for lower tiers so
//! tests can cross-check each tier against the reference.

pub mod block;
pub mod scalar;

#[cfg(target_arch = "x86_64")]
pub(crate) mod x86;

use once_cell::sync::Lazy;

use crate::isa::{detected_tier, IsaTier};
use crate::kernels::block::{Fp8Format, KBlockLayout, Scales};
use crate::tensor::SignPolicy;

type UnpackS4Fn = fn(&[u8], &mut [i8], SignPolicy);
type DequantS8Fn =
    fn(&[i8], usize, &mut [f32], usize, usize, usize, Scales<'_>, Option<&[i8]>, KBlockLayout);
type DequantS4Fn = fn(
    &[u8],
    usize,
    &mut [f32],
    usize,
    usize,
    usize,
    SignPolicy,
    Scales<'_>,
    Option<&[i8]>,
    KBlockLayout,
);
type DequantF4Fn =
    fn(&[u8], usize, &mut [f32], usize, usize, usize, &[f32; 16], Scales<'_>, KBlockLayout);
type DequantF8Fn =
    fn(&[u8], usize, &mut [f32], usize, usize, usize, Fp8Format, Scales<'_>, KBlockLayout);
type MatmulVecFn = fn(&mut [f32], &[f32], &[f32], usize);
type AxpyFn = fn(&mut [f32], f32, &[f32]);
type DotU8S8Fn = fn(&[u8], &[i8]) -> i32;
type QuantizeRowU8Fn = fn(&[f32], &mut [u8], &mut [f32], &mut [u8], Option<&mut [i32]>, usize);
type NormFn = fn(&mut [f32], &[f32], f32);
type LayerNormFn = fn(&mut [f32], &[f32], Option<&[f32]>, f32);
type MapFn = fn(&mut [f32]);
type RopeFn = fn(&mut [f32], &[f32], &[f32]);
type AlphaBetaFn = fn(&mut [f32], f32, &[f32], f32, &[f32]);
type BinFn = fn(&mut [f32], &[f32]);
type AccumFn = fn(&mut [f32], f32, &[f32]);
type ClipFn = fn(&mut [f32], f32, f32);
type ReduceFn = fn(&[f32]) -> f32;
type BiasCorrectFn = fn(i32, i32, i32, i32, i32, i32) -> i32;

/// Dispatch table for one instruction-set tier.
#[derive(Clone)]
pub struct Kernels {
    pub tier: IsaTier,
    pub unpack_s4: UnpackS4Fn,
    pub dequant_s8_tile: DequantS8Fn,
    pub dequant_s4_tile: DequantS4Fn,
    pub dequant_f4_tile: DequantF4Fn,
    pub dequant_f8_tile: DequantF8Fn,
    pub matmul_vec_f32: MatmulVecFn,
    pub axpy: AxpyFn,
    pub dot_u8s8: DotU8S8Fn,
    pub quantize_row_u8: QuantizeRowU8Fn,
    pub bias_correct: BiasCorrectFn,
    pub rms_norm: NormFn,
    pub layer_norm: LayerNormFn,
    pub softmax: MapFn,
    pub silu: MapFn,
    pub gelu: MapFn,
    pub rope_rotate_half: RopeFn,
    pub rope_interleaved: RopeFn,
    pub alphabeta: AlphaBetaFn,
    pub add_assign: BinFn,
    pub mul_assign: BinFn,
    pub accumulate_alpha: AccumFn,
    pub clip: ClipFn,
    pub cast_bf16: MapFn,
    pub reduce_max: ReduceFn,
    pub reduce_sum: ReduceFn,
}

impl Kernels {
    fn reference() -> Kernels {
        Kernels {
            tier: IsaTier::NoSimd,
            unpack_s4: scalar::unpack_s4,
            dequant_s8_tile: scalar::dequant_s8_tile,
            dequant_s4_tile: scalar::dequant_s4_tile,
            dequant_f4_tile: scalar::dequant_f4_tile,
            dequant_f8_tile: scalar::dequant_f8_tile,
            matmul_vec_f32: scalar::matmul_vec_f32,
            axpy: scalar::axpy,
            dot_u8s8: scalar::dot_u8s8,
            quantize_row_u8: scalar::quantize_row_u8,
            bias_correct: scalar::bias_correct,
            rms_norm: scalar::rms_norm,
            layer_norm: scalar::layer_norm,
            softmax: scalar::softmax,
            silu: scalar::silu,
            gelu: scalar::gelu,
            rope_rotate_half: scalar::rope_rotate_half,
            rope_interleaved: scalar::rope_interleaved,
            alphabeta: scalar::alphabeta,
            add_assign: scalar::add_assign,
            mul_assign: scalar::mul_assign,
            accumulate_alpha: scalar::accumulate_alpha,
            clip: scalar::clip,
            cast_bf16: scalar::cast_bf16,
            reduce_max: scalar::reduce_max,
            reduce_sum: scalar::reduce_sum,
        }
    }

    /// Builds the table for `tier`, clamped to what the host supports.
    ///
    /// Tiers above AVX2 currently resolve to the AVX2 entries; ops without
    /// an accelerated form keep their reference entry.
    pub fn for_tier(tier: IsaTier) -> Kernels {
        let tier = tier.min(detected_tier());
        let mut table = Kernels::reference();
        table.tier = tier;
        #[cfg(target_arch = "x86_64")]
        if tier >= IsaTier::Avx2 {
            table.unpack_s4 = avx2::unpack_s4;
            table.dequant_s8_tile = avx2::dequant_s8_tile;
            table.dequant_s4_tile = avx2::dequant_s4_tile;
            table.dequant_f4_tile = avx2::dequant_f4_tile;
            table.dequant_f8_tile = avx2::dequant_f8_tile;
            table.matmul_vec_f32 = avx2::matmul_vec_f32;
            table.axpy = avx2::axpy;
            table.dot_u8s8 = avx2::dot_u8s8;
            table.rms_norm = avx2::rms_norm;
            table.layer_norm = avx2::layer_norm;
            table.rope_rotate_half = avx2::rope_rotate_half;
            table.alphabeta = avx2::alphabeta;
            table.add_assign = avx2::add_assign;
            table.mul_assign = avx2::mul_assign;
        }
        table
    }
}

static BEST: Lazy<Kernels> = Lazy::new(|| Kernels::for_tier(detected_tier()));

/// The table for the highest tier available on this host.
pub fn best() -> &'static Kernels {
    &BEST
}

/// Safe AVX2 entry points. Callers reach these only through a table built
/// after feature detection succeeded.
#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::*;

    pub fn unpack_s4(src: &[u8], dst: &mut [i8], policy: SignPolicy) {
        unsafe { x86::unpack::unpack_s4_avx2(src, dst, policy) }
    }

    #[allow(clippy::too_many_arguments)]
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
        unsafe {
            x86::dequant::dequant_s8_tile_avx2(
                src, src_ld, dst, dst_ld, rows, cols, scales, zps, lay,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        unsafe {
            x86::dequant::dequant_s4_tile_avx2(
                src, src_ld, dst, dst_ld, rows, cols, policy, scales, zps, lay,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        unsafe {
            x86::dequant::dequant_f4_tile_avx2(
                src, src_ld, dst, dst_ld, rows, cols, lut, scales, lay,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        unsafe {
            x86::dequant::dequant_f8_tile_avx2(
                src, src_ld, dst, dst_ld, rows, cols, fmt, scales, lay,
            )
        }
    }

    pub fn matmul_vec_f32(out: &mut [f32], a: &[f32], b_rows: &[f32], k: usize) {
        unsafe { x86::matmul::matmul_vec_f32_avx2(out, a, b_rows, k) }
    }

    pub fn axpy(acc: &mut [f32], alpha: f32, x: &[f32]) {
        unsafe { x86::matmul::axpy_avx2(acc, alpha, x) }
    }

    pub fn dot_u8s8(a: &[u8], w: &[i8]) -> i32 {
        unsafe { x86::matmul::dot_u8s8_avx2(a, w) }
    }

    pub fn rms_norm(x: &mut [f32], w: &[f32], eps: f32) {
        unsafe { x86::norm::rms_norm_avx2(x, w, eps) }
    }

    pub fn layer_norm(x: &mut [f32], w: &[f32], bias: Option<&[f32]>, eps: f32) {
        unsafe { x86::norm::layer_norm_avx2(x, w, bias, eps) }
    }

    pub fn rope_rotate_half(x: &mut [f32], cos: &[f32], sin: &[f32]) {
        unsafe { x86::rope::rope_rotate_half_avx2(x, cos, sin) }
    }

    pub fn alphabeta(dst: &mut [f32], alpha: f32, a: &[f32], beta: f32, b: &[f32]) {
        unsafe { x86::elementwise::alphabeta_avx2(dst, alpha, a, beta, b) }
    }

    pub fn add_assign(dst: &mut [f32], src: &[f32]) {
        unsafe { x86::elementwise::add_assign_avx2(dst, src) }
    }

    pub fn mul_assign(dst: &mut [f32], src: &[f32]) {
        unsafe { x86::elementwise::mul_assign_avx2(dst, src) }
    }
}
