#![allow(unsafe_code)]
//! Rotate-half rotary embedding.
//!
//! Each pair (x[i], x[i + d/2]) is rotated by the position angle:
//!
//! ```text
//! x'[i]        = x[i] * cos - x[i + half] * sin
//! x'[i + half] = x[i] * sin + x[i + half] * cos
//! ```

use std::arch::x86_64::*;

#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn rope_rotate_half_avx2(x: &mut [f32], cos: &[f32], sin: &[f32]) {
    let half = x.len() / 2;
    let half8 = half - half % 8;
    let x0_ptr = x.as_mut_ptr();
    let x1_ptr = x.as_mut_ptr().add(half);

    let mut i = 0;
    while i < half8 {
        let x0 = _mm256_loadu_ps(x0_ptr.add(i));
        let x1 = _mm256_loadu_ps(x1_ptr.add(i));
        let c = _mm256_loadu_ps(cos.as_ptr().add(i));
        let s = _mm256_loadu_ps(sin.as_ptr().add(i));

        let x1s = _mm256_mul_ps(x1, s);
        let out0 = _mm256_fmsub_ps(x0, c, x1s);
        let x1c = _mm256_mul_ps(x1, c);
        let out1 = _mm256_fmadd_ps(x0, s, x1c);

        _mm256_storeu_ps(x0_ptr.add(i), out0);
        _mm256_storeu_ps(x1_ptr.add(i), out1);
        i += 8;
    }

    for j in i..half {
        let x0 = *x0_ptr.add(j);
        let x1 = *x1_ptr.add(j);
        *x0_ptr.add(j) = x0 * cos[j] - x1 * sin[j];
        *x1_ptr.add(j) = x0 * sin[j] + x1 * cos[j];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::scalar;

    #[test]
    fn test_rotate_half_matches_reference() {
        if !is_x86_feature_detected!("avx2") || !is_x86_feature_detected!("fma") {
            return;
        }
        for dim in [16usize, 64, 128, 20] {
            let half = dim / 2;
            let base: Vec<f32> = (0..dim).map(|i| (i as f32) * 0.1 - 2.0).collect();
            let cos: Vec<f32> = (0..half).map(|i| ((i as f32) * 0.05).cos()).collect();
            let sin: Vec<f32> = (0..half).map(|i| ((i as f32) * 0.05).sin()).collect();
            let mut expected = base.clone();
            scalar::rope_rotate_half(&mut expected, &cos, &sin);
            let mut actual = base.clone();
            unsafe { rope_rotate_half_avx2(&mut actual, &cos, &sin) };
            for (e, a) in expected.iter().zip(actual.iter()) {
                assert!((e - a).abs() < 1e-5, "dim {}", dim);
            }
        }
    }
}
