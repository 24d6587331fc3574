#![allow(unsafe_code)]
use std::arch::x86_64::*;

/// dst = alpha * a + beta * b.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn alphabeta_avx2(dst: &mut [f32], alpha: f32, a: &[f32], beta: f32, b: &[f32]) {
    let n = dst.len();
    let n8 = n - n % 8;
    let va = _mm256_set1_ps(alpha);
    let vb = _mm256_set1_ps(beta);
    let mut i = 0;
    while i < n8 {
        let sa = _mm256_loadu_ps(a.as_ptr().add(i));
        let sb = _mm256_loadu_ps(b.as_ptr().add(i));
        let out = _mm256_fmadd_ps(vb, sb, _mm256_mul_ps(va, sa));
        _mm256_storeu_ps(dst.as_mut_ptr().add(i), out);
        i += 8;
    }
    for j in i..n {
        dst[j] = alpha * a[j] + beta * b[j];
    }
}

/// dst += src.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn add_assign_avx2(dst: &mut [f32], src: &[f32]) {
    let n = dst.len();
    let n8 = n - n % 8;
    let mut i = 0;
    while i < n8 {
        let d = _mm256_loadu_ps(dst.as_ptr().add(i));
        let s = _mm256_loadu_ps(src.as_ptr().add(i));
        _mm256_storeu_ps(dst.as_mut_ptr().add(i), _mm256_add_ps(d, s));
        i += 8;
    }
    for j in i..n {
        dst[j] += src[j];
    }
}

/// dst *= src.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn mul_assign_avx2(dst: &mut [f32], src: &[f32]) {
    let n = dst.len();
    let n8 = n - n % 8;
    let mut i = 0;
    while i < n8 {
        let d = _mm256_loadu_ps(dst.as_ptr().add(i));
        let s = _mm256_loadu_ps(src.as_ptr().add(i));
        _mm256_storeu_ps(dst.as_mut_ptr().add(i), _mm256_mul_ps(d, s));
        i += 8;
    }
    for j in i..n {
        dst[j] *= src[j];
    }
}
