#![allow(unsafe_code)]
use std::arch::x86_64::*;

use crate::kernels::x86::common::hsum_ps_avx;

/// RMS norm, in place: x = x / rms(x) * w.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn rms_norm_avx2(x: &mut [f32], w: &[f32], eps: f32) {
    let len = x.len();
    let len8 = len - len % 8;
    let mut sum_sq = _mm256_setzero_ps();
    let mut i = 0;
    while i < len8 {
        let v = _mm256_loadu_ps(x.as_ptr().add(i));
        sum_sq = _mm256_fmadd_ps(v, v, sum_sq);
        i += 8;
    }
    let mut total = hsum_ps_avx(sum_sq);
    for j in i..len {
        total += x[j] * x[j];
    }

    let scale = 1.0 / (total / len as f32 + eps).sqrt();
    let scale_v = _mm256_set1_ps(scale);
    i = 0;
    while i < len8 {
        let v = _mm256_loadu_ps(x.as_ptr().add(i));
        let wv = _mm256_loadu_ps(w.as_ptr().add(i));
        _mm256_storeu_ps(
            x.as_mut_ptr().add(i),
            _mm256_mul_ps(_mm256_mul_ps(v, scale_v), wv),
        );
        i += 8;
    }
    for j in i..len {
        x[j] = x[j] * scale * w[j];
    }
}

/// Layer norm, in place: x = (x - mean) / std * w (+ bias).
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn layer_norm_avx2(x: &mut [f32], w: &[f32], bias: Option<&[f32]>, eps: f32) {
    let len = x.len();
    let len8 = len - len % 8;

    let mut sum_v = _mm256_setzero_ps();
    let mut i = 0;
    while i < len8 {
        sum_v = _mm256_add_ps(sum_v, _mm256_loadu_ps(x.as_ptr().add(i)));
        i += 8;
    }
    let mut sum = hsum_ps_avx(sum_v);
    for j in i..len {
        sum += x[j];
    }
    let mean = sum / len as f32;

    let mean_v = _mm256_set1_ps(mean);
    let mut var_v = _mm256_setzero_ps();
    i = 0;
    while i < len8 {
        let d = _mm256_sub_ps(_mm256_loadu_ps(x.as_ptr().add(i)), mean_v);
        var_v = _mm256_fmadd_ps(d, d, var_v);
        i += 8;
    }
    let mut var = hsum_ps_avx(var_v);
    for j in i..len {
        var += (x[j] - mean) * (x[j] - mean);
    }
    var /= len as f32;

    let inv_std = 1.0 / (var + eps).sqrt();
    let inv_v = _mm256_set1_ps(inv_std);
    i = 0;
    while i < len8 {
        let d = _mm256_sub_ps(_mm256_loadu_ps(x.as_ptr().add(i)), mean_v);
        let wv = _mm256_loadu_ps(w.as_ptr().add(i));
        let mut out = _mm256_mul_ps(_mm256_mul_ps(d, inv_v), wv);
        if let Some(b) = bias {
            out = _mm256_add_ps(out, _mm256_loadu_ps(b.as_ptr().add(i)));
        }
        _mm256_storeu_ps(x.as_mut_ptr().add(i), out);
        i += 8;
    }
    for j in i..len {
        let mut v = (x[j] - mean) * inv_std * w[j];
        if let Some(b) = bias {
            v += b[j];
        }
        x[j] = v;
    }
}
