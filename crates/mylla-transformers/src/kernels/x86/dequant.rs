#![allow(unsafe_code)]
//! K-block dequantization tiles.
//!
//! Scale slots are contiguous along the column axis, so a row's scales load
//! as plain unaligned vectors; only the row-block index changes with
//! `k_offset` and pack-row.

use std::arch::x86_64::*;

use crate::kernels::block::{Fp8Format, KBlockLayout, Scales};
use crate::kernels::scalar;
use crate::kernels::x86::common::load_scales8;
use crate::kernels::x86::unpack::{unpack_s4_16, unpack_u4_16};
use crate::tensor::SignPolicy;

#[inline(always)]
unsafe fn dequant_s8_row8(
    src: *const i8,
    dst: *mut f32,
    scale_v: __m256,
    zp: Option<__m256i>,
) {
    let codes = _mm_loadl_epi64(src as *const __m128i);
    let mut v = _mm256_cvtepi8_epi32(codes);
    if let Some(zp_v) = zp {
        v = _mm256_sub_epi32(v, zp_v);
    }
    let f = _mm256_cvtepi32_ps(v);
    _mm256_storeu_ps(dst, _mm256_mul_ps(f, scale_v));
}

#[inline(always)]
unsafe fn load_zp8(zps: &[i8], idx: usize) -> __m256i {
    let v = _mm_loadl_epi64(zps.as_ptr().add(idx) as *const __m128i);
    _mm256_cvtepi8_epi32(v)
}

#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn dequant_s8_tile_avx2(
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
    let cols8 = cols - cols % 8;
    for r in 0..rows {
        let slot_base = ((lay.k_offset + r) / (lay.kblock * lay.pack_row)) * lay.scale_stride;
        let mut c = 0;
        while c < cols8 {
            let scale_v = load_scales8(&scales, slot_base + c);
            let zp_v = zps.map(|z| load_zp8(z, slot_base + c));
            dequant_s8_row8(
                src.as_ptr().add(r * src_ld + c),
                dst.as_mut_ptr().add(r * dst_ld + c),
                scale_v,
                zp_v,
            );
            c += 8;
        }
        for j in c..cols {
            let slot = slot_base + j;
            let mut v = f32::from(src[r * src_ld + j]);
            if let Some(z) = zps {
                v -= f32::from(z[slot]);
            }
            dst[r * dst_ld + j] = v * scales.get(slot);
        }
    }
}

#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn dequant_s4_tile_avx2(
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
    let cols16 = cols - cols % 16;
    let mut tmp = [0i8; 16];
    for r in 0..rows {
        let slot_base = ((lay.k_offset + r) / (lay.kblock * lay.pack_row)) * lay.scale_stride;
        let row_bytes = r * src_ld / 2;
        let mut c = 0;
        while c < cols16 {
            unpack_s4_16(src.as_ptr().add(row_bytes + c / 2), tmp.as_mut_ptr(), policy);
            for half in 0..2 {
                let off = c + half * 8;
                let scale_v = load_scales8(&scales, slot_base + off);
                let zp_v = zps.map(|z| load_zp8(z, slot_base + off));
                dequant_s8_row8(
                    tmp.as_ptr().add(half * 8),
                    dst.as_mut_ptr().add(r * dst_ld + off),
                    scale_v,
                    zp_v,
                );
            }
            c += 16;
        }
        if c < cols {
            // Scalar epilogue on a one-row tile keeps results bit-identical
            // to the reference.
            let tail_lay = KBlockLayout {
                k_offset: lay.k_offset + r,
                ..lay
            };
            scalar::dequant_s4_tile(
                &src[row_bytes + c / 2..],
                src_ld,
                &mut dst[r * dst_ld + c..],
                dst_ld,
                1,
                cols - c,
                policy,
                scales.offset(c),
                zps.map(|z| &z[c..]),
                tail_lay,
            );
        }
    }
}

#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn dequant_f4_tile_avx2(
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
    let cols16 = cols - cols % 16;
    let mut tmp = [0u8; 16];
    for r in 0..rows {
        let slot_base = ((lay.k_offset + r) / (lay.kblock * lay.pack_row)) * lay.scale_stride;
        let row_bytes = r * src_ld / 2;
        let mut c = 0;
        while c < cols16 {
            unpack_u4_16(src.as_ptr().add(row_bytes + c / 2), tmp.as_mut_ptr());
            for half in 0..2 {
                let off = c + half * 8;
                let idx8 = _mm_loadl_epi64(tmp.as_ptr().add(half * 8) as *const __m128i);
                let idx = _mm256_cvtepu8_epi32(idx8);
                let vals = _mm256_i32gather_ps(lut.as_ptr(), idx, 4);
                let scale_v = load_scales8(&scales, slot_base + off);
                _mm256_storeu_ps(
                    dst.as_mut_ptr().add(r * dst_ld + off),
                    _mm256_mul_ps(vals, scale_v),
                );
            }
            c += 16;
        }
        if c < cols {
            let tail_lay = KBlockLayout {
                k_offset: lay.k_offset + r,
                ..lay
            };
            scalar::dequant_f4_tile(
                &src[row_bytes + c / 2..],
                src_ld,
                &mut dst[r * dst_ld + c..],
                dst_ld,
                1,
                cols - c,
                lut,
                scales.offset(c),
                tail_lay,
            );
        }
    }
}

#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn dequant_f8_tile_avx2(
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
    let mbits = fmt.mbits() as i32;
    let bias = fmt.bias();
    let cols8 = cols - cols % 8;
    let sign_mask = _mm256_set1_epi32(0x8000_0000u32 as i32);
    let field_mask = _mm256_set1_epi32(0x7F);
    let mantissa_mask = _mm256_set1_epi32((1 << mbits) - 1);
    let exp_adjust = _mm256_set1_epi32(127 - bias);
    let sub_scale = _mm256_set1_ps(((1 - bias - mbits) as f32).exp2());
    // Shift amounts depend on the runtime format, so the variable-count
    // intrinsics (which take the count in an xmm register) are used in
    // place of the immediate-shift forms.
    let mbits_count = _mm_cvtsi32_si128(mbits);
    let mantissa_shift_count = _mm_cvtsi32_si128(23 - mbits);
    for r in 0..rows {
        let slot_base = ((lay.k_offset + r) / (lay.kblock * lay.pack_row)) * lay.scale_stride;
        let mut c = 0;
        while c < cols8 {
            let raw = _mm_loadl_epi64(src.as_ptr().add(r * src_ld + c) as *const __m128i);
            let v = _mm256_cvtepu8_epi32(raw);
            let sign = _mm256_and_si256(_mm256_slli_epi32(v, 24), sign_mask);
            let fields = _mm256_and_si256(v, field_mask);
            let e = _mm256_srl_epi32(fields, mbits_count);
            let m = _mm256_and_si256(v, mantissa_mask);
            // Normal numbers: rebias the exponent and shift fields into place.
            let norm_bits = _mm256_or_si256(
                _mm256_slli_epi32(_mm256_add_epi32(e, exp_adjust), 23),
                _mm256_sll_epi32(m, mantissa_shift_count),
            );
            let normal = _mm256_castsi256_ps(norm_bits);
            // Subnormals: m * 2^(1 - bias - mbits), no implicit one.
            let sub = _mm256_mul_ps(_mm256_cvtepi32_ps(m), sub_scale);
            let is_sub = _mm256_castsi256_ps(_mm256_cmpeq_epi32(e, _mm256_setzero_si256()));
            let mag = _mm256_blendv_ps(normal, sub, is_sub);
            let val = _mm256_or_ps(mag, _mm256_castsi256_ps(sign));
            let scale_v = load_scales8(&scales, slot_base + c);
            _mm256_storeu_ps(
                dst.as_mut_ptr().add(r * dst_ld + c),
                _mm256_mul_ps(val, scale_v),
            );
            c += 8;
        }
        for j in c..cols {
            let slot = slot_base + j;
            let byte = src[r * src_ld + j];
            dst[r * dst_ld + j] = match scales.exponent(slot) {
                Some(ea) => crate::kernels::block::f8_to_f32(byte, fmt, ea),
                None => crate::kernels::block::f8_to_f32(byte, fmt, 0) * scales.get(slot),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::block::{FP4_E2M1_LUT, NF4_LUT};

    fn avx2_available() -> bool {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }

    fn scales_f32(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_dequant_s8_tile_matches_reference() {
        if !avx2_available() {
            return;
        }
        let rows: usize = 7;
        let cols: usize = 19; // forces a column tail
        let kblock: usize = 4;
        let src: Vec<i8> = (0..rows * cols).map(|i| (i as i8).wrapping_mul(3)).collect();
        let nblocks = rows.div_ceil(kblock);
        let scale_vals: Vec<f32> = (0..nblocks * cols).map(|i| 0.01 + i as f32 * 0.003).collect();
        let scale_bytes = scales_f32(&scale_vals);
        let zps: Vec<i8> = (0..nblocks * cols).map(|i| (i % 11) as i8 - 5).collect();
        let lay = KBlockLayout {
            k_offset: 0,
            kblock,
            pack_row: 1,
            scale_stride: cols,
        };
        let mut expected = vec![0f32; rows * cols];
        scalar::dequant_s8_tile(
            &src,
            cols,
            &mut expected,
            cols,
            rows,
            cols,
            Scales::F32(&scale_bytes),
            Some(&zps),
            lay,
        );
        let mut actual = vec![0f32; rows * cols];
        unsafe {
            dequant_s8_tile_avx2(
                &src,
                cols,
                &mut actual,
                cols,
                rows,
                cols,
                Scales::F32(&scale_bytes),
                Some(&zps),
                lay,
            );
        }
        for (e, a) in expected.iter().zip(actual.iter()) {
            assert!((e - a).abs() < 1e-6, "{} vs {}", e, a);
        }
    }

    #[test]
    fn test_dequant_s4_tile_pack_row_matches_reference() {
        if !avx2_available() {
            return;
        }
        for pack_row in [1usize, 2, 4] {
            let rows = 16;
            let cols = 34;
            let kblock = 4;
            let codes: Vec<u8> = (0..rows * cols / 2).map(|i| (i * 73 % 256) as u8).collect();
            let nslots = rows / (kblock * pack_row);
            let scale_vals: Vec<f32> = (0..nslots * cols).map(|i| 0.02 + i as f32 * 0.001).collect();
            let scale_bytes = scales_f32(&scale_vals);
            let lay = KBlockLayout {
                k_offset: 0,
                kblock,
                pack_row,
                scale_stride: cols,
            };
            let mut expected = vec![0f32; rows * cols];
            scalar::dequant_s4_tile(
                &codes,
                cols,
                &mut expected,
                cols,
                rows,
                cols,
                SignPolicy::Clip,
                Scales::F32(&scale_bytes),
                None,
                lay,
            );
            let mut actual = vec![0f32; rows * cols];
            unsafe {
                dequant_s4_tile_avx2(
                    &codes,
                    cols,
                    &mut actual,
                    cols,
                    rows,
                    cols,
                    SignPolicy::Clip,
                    Scales::F32(&scale_bytes),
                    None,
                    lay,
                );
            }
            assert_eq!(expected, actual, "pack_row {}", pack_row);
        }
    }

    #[test]
    fn test_dequant_f4_tile_matches_reference() {
        if !avx2_available() {
            return;
        }
        for lut in [&NF4_LUT, &FP4_E2M1_LUT] {
            let rows = 8;
            let cols = 26;
            let kblock = 8;
            let codes: Vec<u8> = (0..rows * cols / 2).map(|i| (i * 29 % 256) as u8).collect();
            let scale_vals: Vec<f32> = (0..cols).map(|i| 0.5 + i as f32 * 0.01).collect();
            let scale_bytes = scales_f32(&scale_vals);
            let lay = KBlockLayout {
                k_offset: 0,
                kblock,
                pack_row: 1,
                scale_stride: cols,
            };
            let mut expected = vec![0f32; rows * cols];
            scalar::dequant_f4_tile(
                &codes,
                cols,
                &mut expected,
                cols,
                rows,
                cols,
                lut,
                Scales::F32(&scale_bytes),
                lay,
            );
            let mut actual = vec![0f32; rows * cols];
            unsafe {
                dequant_f4_tile_avx2(
                    &codes,
                    cols,
                    &mut actual,
                    cols,
                    rows,
                    cols,
                    lut,
                    Scales::F32(&scale_bytes),
                    lay,
                );
            }
            for (e, a) in expected.iter().zip(actual.iter()) {
                assert!((e - a).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_dequant_f8_tile_matches_reference() {
        if !avx2_available() {
            return;
        }
        for fmt in [Fp8Format::E4M3, Fp8Format::E5M2] {
            let rows = 4;
            let cols = 21;
            let kblock = 2;
            let src: Vec<u8> = (0..rows * cols).map(|i| (i * 53 % 256) as u8).collect();
            let nblocks = rows / kblock;
            let scale_vals: Vec<f32> = (0..nblocks * cols).map(|i| 0.25 + i as f32 * 0.01).collect();
            let scale_bytes = scales_f32(&scale_vals);
            let lay = KBlockLayout {
                k_offset: 0,
                kblock,
                pack_row: 1,
                scale_stride: cols,
            };
            let mut expected = vec![0f32; rows * cols];
            scalar::dequant_f8_tile(
                &src,
                cols,
                &mut expected,
                cols,
                rows,
                cols,
                fmt,
                Scales::F32(&scale_bytes),
                lay,
            );
            let mut actual = vec![0f32; rows * cols];
            unsafe {
                dequant_f8_tile_avx2(
                    &src,
                    cols,
                    &mut actual,
                    cols,
                    rows,
                    cols,
                    fmt,
                    Scales::F32(&scale_bytes),
                    lay,
                );
            }
            for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
                assert!((e - a).abs() <= e.abs() * 1e-6, "{:?} idx {}: {} vs {}", fmt, i, e, a);
            }
        }
    }

    #[test]
    fn test_dequant_f8_exponent_scale_matches_reference() {
        if !avx2_available() {
            return;
        }
        let rows = 2;
        let cols = 10;
        let src: Vec<u8> = (0..rows * cols).map(|i| (i * 17 % 256) as u8).collect();
        let exps: Vec<u8> = (0..cols).map(|i| (i as i8 - 4) as u8).collect();
        let lay = KBlockLayout {
            k_offset: 0,
            kblock: 2,
            pack_row: 1,
            scale_stride: cols,
        };
        let mut expected = vec![0f32; rows * cols];
        scalar::dequant_f8_tile(
            &src,
            cols,
            &mut expected,
            cols,
            rows,
            cols,
            Fp8Format::E4M3,
            Scales::Fp8E8M0(&exps),
            lay,
        );
        let mut actual = vec![0f32; rows * cols];
        unsafe {
            dequant_f8_tile_avx2(
                &src,
                cols,
                &mut actual,
                cols,
                rows,
                cols,
                Fp8Format::E4M3,
                Scales::Fp8E8M0(&exps),
                lay,
            );
        }
        assert_eq!(expected, actual);
    }
}
