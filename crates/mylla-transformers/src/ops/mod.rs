//! Shape-checked tensor operations over the kernel layer.
//!
//! Activations are dense f32; weights dispatch by representation. The
//! single-row (decode) path parallelizes over output chunks, the batch
//! (prefill) path over rows, both with deterministic index-based tiling.

use std::cell::RefCell;

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::kernels::Kernels;
use crate::weights::{Linear, PackedInt8, QuantTensor};

/// Rows per dequantized tile.
const TILE_K: usize = 64;
/// Output columns per task.
const TILE_N: usize = 64;

thread_local! {
    static TILE_SCRATCH: RefCell<Vec<f32>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` with a per-thread f32 scratch buffer of at least `len`
/// elements. The buffer never escapes the calling primitive.
fn with_scratch<R>(len: usize, f: impl FnOnce(&mut [f32]) -> R) -> R {
    TILE_SCRATCH.with(|cell| {
        let mut buf = cell.borrow_mut();
        if buf.len() < len {
            buf.resize(len, 0.0);
        }
        f(&mut buf[..len])
    })
}

/// C = A @ W for activations [M, K] against any weight representation,
/// yielding [M, N].
pub fn linear_forward(a: &ArrayView2<f32>, w: &Linear, kernels: &Kernels) -> Result<Array2<f32>> {
    let (in_features, out_features) = w.dims();
    if a.ncols() != in_features {
        return Err(EngineError::internal(format!(
            "matmul reduction mismatch: activation {} vs weight {}",
            a.ncols(),
            in_features
        )));
    }
    match w {
        Linear::Rows(rows) => Ok(matmul_rows(a, rows, kernels)),
        Linear::Quant(q) => Ok(matmul_quant(a, q, kernels)),
        Linear::QuantInt8(q, packed) => {
            debug_assert_eq!(q.cols, out_features);
            Ok(matmul_int8(a, packed, kernels))
        }
    }
}

/// General dense form: C <- alpha * A @ Bᵀ + beta * C, with B output-major
/// [N, K]. The decode path always uses alpha = 1, beta = 0 through
/// [`linear_forward`]; scoring paths scale and accumulate here.
pub fn gemm_f32(
    a: &ArrayView2<f32>,
    b_rows: &ArrayView2<f32>,
    c: &mut Array2<f32>,
    alpha: f32,
    beta: f32,
    kernels: &Kernels,
) -> Result<()> {
    let (m, k) = a.dim();
    let (n, k2) = b_rows.dim();
    if k != k2 || c.dim() != (m, n) {
        return Err(EngineError::internal(format!(
            "gemm shape mismatch: a [{m}, {k}], b [{n}, {k2}], c {:?}",
            c.dim()
        )));
    }
    let b_std = b_rows.as_standard_layout();
    let b_slice = b_std.as_slice().expect("weights are standard layout");
    for (a_row, mut c_row) in a.outer_iter().zip(c.outer_iter_mut()) {
        let a_slice = a_row.as_slice().expect("activations are contiguous");
        let dst = c_row.as_slice_mut().expect("output is contiguous");
        with_scratch(n, |tmp| {
            (kernels.matmul_vec_f32)(tmp, a_slice, b_slice, k);
            if beta == 0.0 {
                for (d, &t) in dst.iter_mut().zip(tmp.iter()) {
                    *d = alpha * t;
                }
            } else {
                for d in dst.iter_mut() {
                    *d *= beta;
                }
                (kernels.accumulate_alpha)(dst, alpha, tmp);
            }
        });
    }
    Ok(())
}

/// Dense path: W is output-major [N, K]; every output is a dot product.
fn matmul_rows(a: &ArrayView2<f32>, w: &Array2<f32>, kernels: &Kernels) -> Array2<f32> {
    let (m, k) = a.dim();
    let n = w.nrows();
    let w_slice = w.as_slice().expect("weights are standard layout");
    let mut out = Array2::<f32>::zeros((m, n));

    if m == 1 {
        let a_row = a.row(0);
        let a_slice = a_row.as_slice().expect("activations are contiguous");
        let out_slice = out.as_slice_mut().unwrap();
        let chunk = n.div_ceil(rayon::current_num_threads()).max(1);
        out_slice
            .par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(ci, out_chunk)| {
                let row0 = ci * chunk;
                (kernels.matmul_vec_f32)(out_chunk, a_slice, &w_slice[row0 * k..], k);
            });
    } else {
        out.outer_iter_mut()
            .into_par_iter()
            .zip(a.outer_iter())
            .for_each(|(mut out_row, a_row)| {
                let a_slice = a_row.as_slice().expect("activations are contiguous");
                let out_slice = out_row.as_slice_mut().unwrap();
                (kernels.matmul_vec_f32)(out_slice, a_slice, w_slice, k);
            });
    }
    out
}

/// Quantized path: dequantize [TILE_K, TILE_N] tiles into per-thread
/// scratch and accumulate with the axpy microkernel. Tiles are shared
/// across the batch dimension, so prefill dequantizes each tile once.
fn matmul_quant(a: &ArrayView2<f32>, w: &QuantTensor, kernels: &Kernels) -> Array2<f32> {
    let (m, k) = a.dim();
    let n = w.cols;
    let mut out = Array2::<f32>::zeros((m, n));

    out.axis_chunks_iter_mut(Axis(1), TILE_N)
        .into_par_iter()
        .enumerate()
        .for_each(|(ci, mut chunk)| {
            let c0 = ci * TILE_N;
            let cols = chunk.ncols();
            with_scratch(TILE_K * cols, |tile| {
                let mut k0 = 0;
                while k0 < k {
                    let rows = TILE_K.min(k - k0);
                    w.dequant_tile(kernels, k0, c0, rows, cols, tile);
                    for (mi, a_row) in a.outer_iter().enumerate() {
                        let a_slice = a_row.as_slice().expect("activations are contiguous");
                        let mut out_row = chunk.row_mut(mi);
                        let dst = out_row.as_slice_mut().expect("row chunk is contiguous");
                        for r in 0..rows {
                            let alpha = a_slice[k0 + r];
                            if alpha != 0.0 {
                                (kernels.axpy)(dst, alpha, &tile[r * cols..(r + 1) * cols]);
                            }
                        }
                    }
                    k0 += rows;
                }
            });
        });
    out
}

/// Mixed-precision integer path: activations quantize to u8 per k-block,
/// the outer product accumulates in i32 and the zero-point contributions
/// are removed before the float post-scale.
fn matmul_int8(a: &ArrayView2<f32>, w: &PackedInt8, kernels: &Kernels) -> Array2<f32> {
    let (m, k) = a.dim();
    let n = w.cols;
    let kblock = w.kblock;
    let n_blocks = k / kblock;
    let mut out = Array2::<f32>::zeros((m, n));

    let mut a_codes = vec![0u8; k];
    let mut a_scales = vec![0f32; n_blocks];
    let mut a_zps = vec![0u8; n_blocks];
    let mut a_sums = vec![0i32; n_blocks];

    for (mi, a_row) in a.outer_iter().enumerate() {
        let a_slice = a_row.as_slice().expect("activations are contiguous");
        (kernels.quantize_row_u8)(
            a_slice,
            &mut a_codes,
            &mut a_scales,
            &mut a_zps,
            Some(&mut a_sums[..]),
            kblock,
        );

        let mut out_row = out.row_mut(mi);
        let out_slice = out_row.as_slice_mut().unwrap();
        out_slice
            .par_chunks_mut(TILE_N)
            .enumerate()
            .for_each(|(ci, out_chunk)| {
                for (j, out_val) in out_chunk.iter_mut().enumerate() {
                    let c = ci * TILE_N + j;
                    let col = w.column_codes(c);
                    let mut acc = 0.0f32;
                    for b in 0..n_blocks {
                        let (sw, zp_w, sum_w) = w.block_meta(c, b);
                        let strip = &col[b * kblock..(b + 1) * kblock];
                        let a_strip = &a_codes[b * kblock..(b + 1) * kblock];
                        let dot = (kernels.dot_u8s8)(a_strip, strip);
                        let corrected = (kernels.bias_correct)(
                            dot,
                            i32::from(a_zps[b]),
                            zp_w,
                            a_sums[b],
                            sum_w,
                            kblock as i32,
                        );
                        acc += a_scales[b] * sw * corrected as f32;
                    }
                    *out_val = acc;
                }
            });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;
    use crate::quant::{quantize_matrix, QuantAlgo, QuantizeConfig};
    use crate::tensor::{ComputeDType, ScaleDType, TensorDType};

    fn dense_reference(a: &Array2<f32>, w: &Array2<f32>) -> Array2<f32> {
        // a [M, K] @ w [K, N]
        let (m, _) = a.dim();
        let n = w.ncols();
        let mut out = Array2::<f32>::zeros((m, n));
        for mi in 0..m {
            for c in 0..n {
                let mut s = 0.0;
                for r in 0..a.ncols() {
                    s += a[[mi, r]] * w[[r, c]];
                }
                out[[mi, c]] = s;
            }
        }
        out
    }

    fn quant_linear(
        data: &Array2<f32>,
        weight: TensorDType,
        compute: ComputeDType,
        algo: QuantAlgo,
    ) -> Linear {
        let cfg = QuantizeConfig {
            weight_dtype: weight,
            group_size: 32,
            algo,
            scale_dtype: ScaleDType::F32,
            compute_dtype: compute,
        };
        let parts = quantize_matrix(data, &cfg).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.myla");
        let hp = crate::container::Hparams {
            n_vocab: 1,
            n_embd: 1,
            n_head: 1,
            n_kv_head: 1,
            head_dim: 1,
            n_ff: 1,
            n_layer: 1,
            arch_tag: 0,
            rope_theta: 10000.0,
            ctx_max: 8,
            bos_id: crate::container::NO_TOKEN,
            eos_id: 0,
        };
        let mut writer = crate::container::ContainerWriter::new(hp, vec![("a".into(), 0.0)]);
        writer.add_tensor("w", &[data.nrows(), data.ncols()], parts.tag, parts.into_bytes());
        writer.write_to(&path).unwrap();
        // Keep the mapping alive past the tempdir by reading eagerly.
        let file = crate::container::ModelFile::open(&path).unwrap();
        Linear::from_view(file.tensor("w").unwrap(), kernels::best()).unwrap()
    }

    #[test]
    fn test_linear_rows_matches_reference() {
        let k = 48;
        let n = 20;
        let w = Array2::from_shape_fn((k, n), |(i, j)| ((i * 7 + j) as f32 * 0.03).sin());
        let a = Array2::from_shape_fn((3, k), |(i, j)| ((i + j) as f32 * 0.11).cos());
        let expected = dense_reference(&a, &w);

        let lin = Linear::Rows(w.t().to_owned());
        let out = linear_forward(&a.view(), &lin, kernels::best()).unwrap();
        for (e, o) in expected.iter().zip(out.iter()) {
            assert!((e - o).abs() < 1e-4);
        }
    }

    #[test]
    fn test_linear_quant_close_to_dense() {
        let k = 64;
        let n = 96; // crosses a TILE_N boundary
        let w = Array2::from_shape_fn((k, n), |(i, j)| ((i * j) as f32 / 64.0).sin() * 0.5);
        let a = Array2::from_shape_fn((2, k), |(i, j)| ((i * 13 + j) as f32 * 0.07).cos());
        let expected = dense_reference(&a, &w);

        let lin = quant_linear(&w, TensorDType::Int8, ComputeDType::F32, QuantAlgo::Sym);
        let out = linear_forward(&a.view(), &lin, kernels::best()).unwrap();
        for (e, o) in expected.iter().zip(out.iter()) {
            assert!((e - o).abs() < 0.1, "{} vs {}", e, o);
        }
    }

    #[test]
    fn test_linear_int8_compute_close_to_dense() {
        let k = 64;
        let n = 40;
        let w = Array2::from_shape_fn((k, n), |(i, j)| ((i + 2 * j) as f32 * 0.05).sin() * 0.3);
        let a = Array2::from_shape_fn((1, k), |(_, j)| (j as f32 * 0.09).cos());
        let expected = dense_reference(&a, &w);

        for algo in [QuantAlgo::Sym, QuantAlgo::Asym] {
            let lin = quant_linear(&w, TensorDType::Int8, ComputeDType::Int8, algo);
            assert!(matches!(lin, Linear::QuantInt8(..)));
            let out = linear_forward(&a.view(), &lin, kernels::best()).unwrap();
            for (e, o) in expected.iter().zip(out.iter()) {
                assert!((e - o).abs() < 0.2, "{:?}: {} vs {}", algo, e, o);
            }
        }
    }

    #[test]
    fn test_gemm_alpha_beta() {
        let a = Array2::from_shape_fn((2, 8), |(i, j)| (i + j) as f32 * 0.1);
        let b_rows = Array2::from_shape_fn((3, 8), |(i, j)| (i as f32 - j as f32) * 0.2);
        let mut c = Array2::from_elem((2, 3), 1.0f32);
        let product = {
            let mut p = Array2::<f32>::zeros((2, 3));
            for i in 0..2 {
                for n in 0..3 {
                    for j in 0..8 {
                        p[[i, n]] += a[[i, j]] * b_rows[[n, j]];
                    }
                }
            }
            p
        };
        gemm_f32(&a.view(), &b_rows.view(), &mut c, 2.0, 0.5, kernels::best()).unwrap();
        for ((i, n), &v) in c.indexed_iter() {
            let expect = 2.0 * product[[i, n]] + 0.5;
            assert!((v - expect).abs() < 1e-5, "{v} vs {expect}");
        }
    }

    #[test]
    fn test_bf16_compute_rounds_tiles() {
        let k = 32;
        let n = 4;
        let w = Array2::from_shape_fn((k, n), |(i, j)| ((i * 3 + j) as f32 * 0.05).sin());
        let lin = quant_linear(&w, TensorDType::Int8, ComputeDType::Bf16, QuantAlgo::Sym);
        let Linear::Quant(q) = &lin else {
            panic!("bf16 compute stays on the tile path");
        };
        let deq = q.dequantize(kernels::best());
        for &v in deq.iter() {
            assert_eq!(v, half::bf16::from_f32(v).to_f32(), "value {v} not bf16-representable");
        }
    }

    #[test]
    fn test_linear_rejects_shape_mismatch() {
        let w = Array2::from_elem((8, 4), 0.5f32);
        let lin = Linear::Rows(w.t().to_owned());
        let a = Array2::from_elem((1, 9), 1.0f32);
        assert!(matches!(
            linear_forward(&a.view(), &lin, kernels::best()),
            Err(EngineError::Internal(_))
        ));
    }
}
