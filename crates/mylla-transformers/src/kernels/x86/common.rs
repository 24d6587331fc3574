#![allow(unsafe_code)]
use std::arch::x86_64::*;

use crate::kernels::block::Scales;

/// Horizontally sums a `__m256` vector.
#[inline(always)]
pub(crate) unsafe fn hsum_ps_avx(v: __m256) -> f32 {
    let vlow = _mm256_castps256_ps128(v);
    let vhigh = _mm256_extractf128_ps(v, 1);
    let vsum = _mm_add_ps(vlow, vhigh);
    let vsum = _mm_hadd_ps(vsum, vsum);
    let vsum = _mm_hadd_ps(vsum, vsum);
    _mm_cvtss_f32(vsum)
}

/// Horizontally sums a `__m256i` of eight i32 lanes.
#[inline(always)]
pub(crate) unsafe fn hsum_epi32_avx(v: __m256i) -> i32 {
    let lo = _mm256_castsi256_si128(v);
    let hi = _mm256_extracti128_si256(v, 1);
    let s = _mm_add_epi32(lo, hi);
    let s = _mm_hadd_epi32(s, s);
    let s = _mm_hadd_epi32(s, s);
    _mm_cvtsi128_si32(s)
}

/// Widens eight packed bf16 values to f32.
#[inline(always)]
pub(crate) unsafe fn bf16x8_to_f32x8(v: __m128i) -> __m256 {
    let expanded = _mm256_cvtepu16_epi32(v);
    _mm256_castsi256_ps(_mm256_slli_epi32(expanded, 16))
}

/// Loads eight consecutive scale values starting at element `idx`.
///
/// Exponent-only scales go through a scalar gather; the float formats load
/// directly from the (unaligned) byte buffer.
#[inline(always)]
pub(crate) unsafe fn load_scales8(scales: &Scales<'_>, idx: usize) -> __m256 {
    match scales {
        Scales::F32(b) => _mm256_loadu_ps(b.as_ptr().add(idx * 4) as *const f32),
        Scales::Bf16(b) => {
            let v = _mm_loadu_si128(b.as_ptr().add(idx * 2) as *const __m128i);
            bf16x8_to_f32x8(v)
        }
        Scales::Fp8E8M0(_) => {
            let mut tmp = [0f32; 8];
            for (i, t) in tmp.iter_mut().enumerate() {
                *t = scales.get(idx + i);
            }
            _mm256_loadu_ps(tmp.as_ptr())
        }
    }
}
