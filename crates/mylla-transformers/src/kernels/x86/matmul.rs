#![allow(unsafe_code)]
use std::arch::x86_64::*;

use crate::kernels::x86::common::{hsum_epi32_avx, hsum_ps_avx};

/// out[i] = dot(a, b_rows[i]); four output rows in flight to keep the FMA
/// ports busy without spilling.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn matmul_vec_f32_avx2(out: &mut [f32], a: &[f32], b_rows: &[f32], k: usize) {
    let n = out.len();
    let a_ptr = a.as_ptr();
    let b_ptr = b_rows.as_ptr();
    let k8 = k - k % 8;
    let mut i = 0;

    while i + 4 <= n {
        let mut sum0 = _mm256_setzero_ps();
        let mut sum1 = _mm256_setzero_ps();
        let mut sum2 = _mm256_setzero_ps();
        let mut sum3 = _mm256_setzero_ps();
        let r0 = b_ptr.add(i * k);
        let r1 = b_ptr.add((i + 1) * k);
        let r2 = b_ptr.add((i + 2) * k);
        let r3 = b_ptr.add((i + 3) * k);
        let mut j = 0;
        while j < k8 {
            let av = _mm256_loadu_ps(a_ptr.add(j));
            sum0 = _mm256_fmadd_ps(av, _mm256_loadu_ps(r0.add(j)), sum0);
            sum1 = _mm256_fmadd_ps(av, _mm256_loadu_ps(r1.add(j)), sum1);
            sum2 = _mm256_fmadd_ps(av, _mm256_loadu_ps(r2.add(j)), sum2);
            sum3 = _mm256_fmadd_ps(av, _mm256_loadu_ps(r3.add(j)), sum3);
            j += 8;
        }
        let mut s0 = hsum_ps_avx(sum0);
        let mut s1 = hsum_ps_avx(sum1);
        let mut s2 = hsum_ps_avx(sum2);
        let mut s3 = hsum_ps_avx(sum3);
        for jj in j..k {
            let av = *a_ptr.add(jj);
            s0 += av * *r0.add(jj);
            s1 += av * *r1.add(jj);
            s2 += av * *r2.add(jj);
            s3 += av * *r3.add(jj);
        }
        out[i] = s0;
        out[i + 1] = s1;
        out[i + 2] = s2;
        out[i + 3] = s3;
        i += 4;
    }

    while i < n {
        let row = b_ptr.add(i * k);
        let mut sum = _mm256_setzero_ps();
        let mut j = 0;
        while j < k8 {
            let av = _mm256_loadu_ps(a_ptr.add(j));
            sum = _mm256_fmadd_ps(av, _mm256_loadu_ps(row.add(j)), sum);
            j += 8;
        }
        let mut s = hsum_ps_avx(sum);
        for jj in j..k {
            s += *a_ptr.add(jj) * *row.add(jj);
        }
        out[i] = s;
        i += 1;
    }
}

/// acc += alpha * x.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn axpy_avx2(acc: &mut [f32], alpha: f32, x: &[f32]) {
    let n = acc.len();
    let n8 = n - n % 8;
    let va = _mm256_set1_ps(alpha);
    let mut i = 0;
    while i < n8 {
        let xv = _mm256_loadu_ps(x.as_ptr().add(i));
        let av = _mm256_loadu_ps(acc.as_ptr().add(i));
        _mm256_storeu_ps(acc.as_mut_ptr().add(i), _mm256_fmadd_ps(va, xv, av));
        i += 8;
    }
    for j in i..n {
        acc[j] += alpha * x[j];
    }
}

/// Integer dot of u8 activations against i8 weight codes.
///
/// `maddubs` saturates at i16 for unsigned operands up to 255, so the
/// activations are recentred to i8 first (|a'| <= 128 keeps pair sums in
/// range for weights above -128) and the 128 offset is restored from the
/// weight sum afterwards.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn dot_u8s8_avx2(a: &[u8], w: &[i8]) -> i32 {
    let n = a.len().min(w.len());
    let n32 = n - n % 32;
    let off = _mm256_set1_epi8(0x80u8 as i8);
    let ones16 = _mm256_set1_epi16(1);
    let ones8 = _mm256_set1_epi8(1);
    let mut acc = _mm256_setzero_si256();
    let mut wsum = _mm256_setzero_si256();
    let mut i = 0;
    while i < n32 {
        let va = _mm256_loadu_si256(a.as_ptr().add(i) as *const __m256i);
        let vw = _mm256_loadu_si256(w.as_ptr().add(i) as *const __m256i);
        // a - 128 as i8; |a'| <= 128 keeps the pair sums inside i16.
        let va_s = _mm256_sub_epi8(va, off);
        let va_abs = _mm256_sign_epi8(va_s, va_s);
        let vw_signed = _mm256_sign_epi8(vw, va_s);
        let p16 = _mm256_maddubs_epi16(va_abs, vw_signed);
        acc = _mm256_add_epi32(acc, _mm256_madd_epi16(p16, ones16));
        let w16 = _mm256_maddubs_epi16(ones8, vw);
        wsum = _mm256_add_epi32(wsum, _mm256_madd_epi16(w16, ones16));
        i += 32;
    }
    let mut dot = hsum_epi32_avx(acc);
    let mut sw = hsum_epi32_avx(wsum);
    for j in i..n {
        dot += (i32::from(a[j]) - 128) * i32::from(w[j]);
        sw += i32::from(w[j]);
    }
    dot + 128 * sw
}
