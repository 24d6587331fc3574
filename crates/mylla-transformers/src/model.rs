//! Model descriptor and the decoder layer pass.
//!
//! Loading resolves every tensor the architecture's op sequence needs and
//! validates shapes against the hyperparameters. The forward pass
//! interprets the profile's op list; one call advances the KV cache by the
//! given token batch and returns logits for the final position.

use std::path::Path;

use ndarray::{Array2, ArrayView2};

use crate::cache::KvCache;
use crate::container::{Hparams, ModelFile, NO_TOKEN};
use crate::error::{EngineError, Result};
use crate::graph::{profile_for, ArchKind, ArchProfile, FfnKind, LayerOp, NormKind};
use crate::kernels::Kernels;
use crate::ops::linear_forward;
use crate::rope::RopeCache;
use crate::weights::Linear;

const NORM_EPS: f32 = 1e-5;

pub struct NormWeights {
    w: Vec<f32>,
    b: Option<Vec<f32>>,
}

struct AttnWeights {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    bq: Option<Vec<f32>>,
    bk: Option<Vec<f32>>,
    bv: Option<Vec<f32>>,
    bo: Option<Vec<f32>>,
}

struct FfnWeights {
    gate: Option<Linear>,
    up: Linear,
    down: Linear,
    b_up: Option<Vec<f32>>,
    b_down: Option<Vec<f32>>,
}

struct LayerWeights {
    attn_norm: NormWeights,
    ffn_norm: Option<NormWeights>,
    attn: AttnWeights,
    ffn: FfnWeights,
}

pub struct Model {
    pub hparams: Hparams,
    pub profile: &'static ArchProfile,
    pub vocab: Vec<(String, f32)>,
    embed: Array2<f32>,
    layers: Vec<LayerWeights>,
    final_norm: NormWeights,
    lm_head: Linear,
}

impl Model {
    pub fn load(path: &Path, kernels: &Kernels) -> Result<Model> {
        let file = ModelFile::open(path)?;
        let hp = file.hparams.clone();
        let profile = profile_for(ArchKind::from_tag(hp.arch_tag)?);

        if hp.n_embd != hp.n_head * hp.head_dim {
            return Err(EngineError::malformed(format!(
                "n_embd {} != n_head {} * head_dim {}",
                hp.n_embd, hp.n_head, hp.head_dim
            )));
        }
        if hp.n_kv_head == 0 || hp.n_head % hp.n_kv_head != 0 {
            return Err(EngineError::malformed(format!(
                "n_head {} not a multiple of n_kv_head {}",
                hp.n_head, hp.n_kv_head
            )));
        }
        if hp.head_dim % 2 != 0 {
            return Err(EngineError::malformed(format!(
                "head_dim {} must be even for rotary embedding",
                hp.head_dim
            )));
        }

        let embed_view = file.tensor("tok_embd.weight")?;
        if embed_view.shape != [hp.n_vocab, hp.n_embd] {
            return Err(EngineError::malformed(format!(
                "tok_embd.weight shape {:?}, expected [{}, {}]",
                embed_view.shape, hp.n_vocab, hp.n_embd
            )));
        }
        let embed = embed_view.to_f32_matrix()?;

        let kv_dim = hp.n_kv_head * hp.head_dim;
        let mut layers = Vec::with_capacity(hp.n_layer);
        for i in 0..hp.n_layer {
            let attn_norm = load_norm(&file, &format!("blk.{i}.attn_norm"), profile, hp.n_embd)?;
            let ffn_norm = if profile.ops.contains(&LayerOp::FfnNorm) {
                Some(load_norm(&file, &format!("blk.{i}.ffn_norm"), profile, hp.n_embd)?)
            } else {
                None
            };
            let attn = AttnWeights {
                wq: load_linear(&file, kernels, &format!("blk.{i}.attn_q.weight"), hp.n_embd, hp.n_embd)?,
                wk: load_linear(&file, kernels, &format!("blk.{i}.attn_k.weight"), hp.n_embd, kv_dim)?,
                wv: load_linear(&file, kernels, &format!("blk.{i}.attn_v.weight"), hp.n_embd, kv_dim)?,
                wo: load_linear(&file, kernels, &format!("blk.{i}.attn_output.weight"), hp.n_embd, hp.n_embd)?,
                bq: load_bias(&file, &format!("blk.{i}.attn_q.bias"), hp.n_embd)?,
                bk: load_bias(&file, &format!("blk.{i}.attn_k.bias"), kv_dim)?,
                bv: load_bias(&file, &format!("blk.{i}.attn_v.bias"), kv_dim)?,
                bo: load_bias(&file, &format!("blk.{i}.attn_output.bias"), hp.n_embd)?,
            };
            let gate = if profile.ffn == FfnKind::Gated {
                Some(load_linear(&file, kernels, &format!("blk.{i}.ffn_gate.weight"), hp.n_embd, hp.n_ff)?)
            } else {
                None
            };
            let ffn = FfnWeights {
                gate,
                up: load_linear(&file, kernels, &format!("blk.{i}.ffn_up.weight"), hp.n_embd, hp.n_ff)?,
                down: load_linear(&file, kernels, &format!("blk.{i}.ffn_down.weight"), hp.n_ff, hp.n_embd)?,
                b_up: load_bias(&file, &format!("blk.{i}.ffn_up.bias"), hp.n_ff)?,
                b_down: load_bias(&file, &format!("blk.{i}.ffn_down.bias"), hp.n_embd)?,
            };
            layers.push(LayerWeights {
                attn_norm,
                ffn_norm,
                attn,
                ffn,
            });
        }

        let final_norm = load_norm(&file, "output_norm", profile, hp.n_embd)?;
        let lm_head = if file.contains("output.weight") {
            load_linear(&file, kernels, "output.weight", hp.n_embd, hp.n_vocab)?
        } else {
            // Tied embeddings: the [vocab, embd] table already has the
            // output-major layout the dot kernels want.
            log::debug!("no output.weight, tying logits to the embedding table");
            Linear::Rows(embed.clone())
        };

        log::info!(
            "model ready: {:?}, {} layers, embd {}, {} heads ({} kv), vocab {}",
            profile.kind,
            hp.n_layer,
            hp.n_embd,
            hp.n_head,
            hp.n_kv_head,
            hp.n_vocab
        );

        Ok(Model {
            hparams: hp,
            profile,
            vocab: file.vocab.clone(),
            embed,
            layers,
            final_norm,
            lm_head,
        })
    }

    pub fn eos_id(&self) -> u32 {
        self.hparams.eos_id
    }

    pub fn bos_id(&self) -> Option<u32> {
        (self.hparams.bos_id != NO_TOKEN).then_some(self.hparams.bos_id)
    }

    pub fn vocab_size(&self) -> usize {
        self.hparams.n_vocab
    }

    /// Runs one batch of tokens at the given effective positions through
    /// every layer, appending to the cache, and returns logits for the
    /// final position.
    pub fn forward(
        &self,
        kernels: &Kernels,
        tokens: &[u32],
        positions: &[i64],
        cache: &mut KvCache,
        rope: &RopeCache,
    ) -> Result<Vec<f32>> {
        debug_assert_eq!(tokens.len(), positions.len());
        let h = self.hparams.n_embd;
        let t_len = tokens.len();

        let mut x = Array2::<f32>::zeros((t_len, h));
        for (t, &tok) in tokens.iter().enumerate() {
            let tok = tok as usize;
            if tok >= self.hparams.n_vocab {
                return Err(EngineError::config(format!(
                    "token id {tok} outside vocabulary of {}",
                    self.hparams.n_vocab
                )));
            }
            x.row_mut(t).assign(&self.embed.row(tok));
        }

        for layer_idx in 0..self.layers.len() {
            self.forward_layer(kernels, layer_idx, &mut x, positions, cache, rope)?;
        }

        let mut last = x.row(t_len - 1).to_owned();
        self.apply_norm(
            kernels,
            last.as_slice_mut().expect("contiguous"),
            &self.final_norm,
        );
        let last2 = last.into_shape_with_order((1, h)).expect("row vector");
        let logits = linear_forward(&last2.view(), &self.lm_head, kernels)?;
        Ok(logits.into_raw_vec_and_offset().0)
    }

    fn forward_layer(
        &self,
        kernels: &Kernels,
        layer_idx: usize,
        x: &mut Array2<f32>,
        positions: &[i64],
        cache: &mut KvCache,
        rope: &RopeCache,
    ) -> Result<()> {
        let lw = &self.layers[layer_idx];
        let mut normed = x.clone();
        let mut attn_out: Option<Array2<f32>> = None;
        let mut ffn_out: Option<Array2<f32>> = None;

        for op in self.profile.ops {
            match op {
                LayerOp::AttnNorm => {
                    normed.assign(x);
                    for mut row in normed.rows_mut() {
                        self.apply_norm(kernels, row.as_slice_mut().unwrap(), &lw.attn_norm);
                    }
                }
                LayerOp::FfnNorm => {
                    let norm = lw.ffn_norm.as_ref().ok_or_else(|| {
                        EngineError::internal("op sequence names FfnNorm without weights")
                    })?;
                    normed.assign(x);
                    for mut row in normed.rows_mut() {
                        self.apply_norm(kernels, row.as_slice_mut().unwrap(), norm);
                    }
                }
                LayerOp::Attention => {
                    attn_out = Some(self.attention(
                        kernels,
                        layer_idx,
                        &normed.view(),
                        positions,
                        cache,
                        rope,
                    )?);
                }
                LayerOp::Ffn => {
                    ffn_out = Some(self.ffn(kernels, layer_idx, &normed.view())?);
                }
                LayerOp::AddAttn => {
                    let branch = attn_out.as_ref().ok_or_else(|| {
                        EngineError::internal("op sequence adds attention before computing it")
                    })?;
                    add_rows(kernels, x, branch);
                }
                LayerOp::AddFfn => {
                    let branch = ffn_out.as_ref().ok_or_else(|| {
                        EngineError::internal("op sequence adds ffn before computing it")
                    })?;
                    add_rows(kernels, x, branch);
                }
            }
        }
        Ok(())
    }

    fn apply_norm(&self, kernels: &Kernels, row: &mut [f32], norm: &NormWeights) {
        match self.profile.norm {
            NormKind::Rms => (kernels.rms_norm)(row, &norm.w, NORM_EPS),
            NormKind::Layer => (kernels.layer_norm)(row, &norm.w, norm.b.as_deref(), NORM_EPS),
        }
    }

    fn attention(
        &self,
        kernels: &Kernels,
        layer_idx: usize,
        normed: &ArrayView2<f32>,
        positions: &[i64],
        cache: &mut KvCache,
        rope: &RopeCache,
    ) -> Result<Array2<f32>> {
        let hp = &self.hparams;
        let (nh, nkv, hd) = (hp.n_head, hp.n_kv_head, hp.head_dim);
        let group = nh / nkv;
        let t_len = normed.nrows();
        let aw = &self.layers[layer_idx].attn;

        let mut q = linear_forward(normed, &aw.wq, kernels)?;
        let mut k = linear_forward(normed, &aw.wk, kernels)?;
        let mut v = linear_forward(normed, &aw.wv, kernels)?;
        add_bias(kernels, &mut q, aw.bq.as_deref());
        add_bias(kernels, &mut k, aw.bk.as_deref());
        add_bias(kernels, &mut v, aw.bv.as_deref());

        for t in 0..t_len {
            let pos = positions[t] as usize;
            let q_row = q.row_mut(t).into_slice().expect("contiguous");
            for head in 0..nh {
                rope.apply(kernels, &mut q_row[head * hd..(head + 1) * hd], pos, self.profile.rope);
            }
            let k_row = k.row_mut(t).into_slice().expect("contiguous");
            for head in 0..nkv {
                rope.apply(kernels, &mut k_row[head * hd..(head + 1) * hd], pos, self.profile.rope);
            }
            cache.append(
                layer_idx,
                k_row,
                v.row(t).to_slice().expect("contiguous"),
                positions[t],
            )?;
        }

        let live = cache.gather_attention_inputs(layer_idx);
        let scale = 1.0 / (hd as f32).sqrt();
        let mut out = Array2::<f32>::zeros((t_len, nh * hd));
        let mut scores: Vec<f32> = Vec::with_capacity(live.len());
        let mut dot = [0f32; 1];

        for t in 0..t_len {
            let q_row = q.row(t);
            let q_slice = q_row.to_slice().expect("contiguous");
            let out_row = out.row_mut(t).into_slice().expect("contiguous");
            for head in 0..nh {
                let kv_head = head / group;
                let q_head = &q_slice[head * hd..(head + 1) * hd];

                scores.clear();
                for &(slot, pos) in &live {
                    // Live slots are position-ordered; everything past the
                    // query is masked.
                    if pos > positions[t] {
                        break;
                    }
                    (kernels.matmul_vec_f32)(&mut dot, q_head, cache.key(layer_idx, slot, kv_head), hd);
                    scores.push(dot[0] * scale);
                }
                (kernels.softmax)(&mut scores);

                let acc = &mut out_row[head * hd..(head + 1) * hd];
                for (j, &(slot, _)) in live[..scores.len()].iter().enumerate() {
                    (kernels.axpy)(acc, scores[j], cache.value(layer_idx, slot, kv_head));
                }
            }
        }

        let mut o = linear_forward(&out.view(), &aw.wo, kernels)?;
        add_bias(kernels, &mut o, aw.bo.as_deref());
        Ok(o)
    }

    fn ffn(
        &self,
        kernels: &Kernels,
        layer_idx: usize,
        normed: &ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let fw = &self.layers[layer_idx].ffn;
        match self.profile.ffn {
            FfnKind::Gated => {
                let gate = fw.gate.as_ref().ok_or_else(|| {
                    EngineError::internal("gated ffn without gate weights")
                })?;
                let mut g = linear_forward(normed, gate, kernels)?;
                let u = linear_forward(normed, &fw.up, kernels)?;
                (kernels.silu)(g.as_slice_mut().expect("contiguous"));
                (kernels.mul_assign)(
                    g.as_slice_mut().expect("contiguous"),
                    u.as_slice().expect("contiguous"),
                );
                linear_forward(&g.view(), &fw.down, kernels)
            }
            FfnKind::Plain => {
                let mut u = linear_forward(normed, &fw.up, kernels)?;
                add_bias(kernels, &mut u, fw.b_up.as_deref());
                (kernels.gelu)(u.as_slice_mut().expect("contiguous"));
                let mut d = linear_forward(&u.view(), &fw.down, kernels)?;
                add_bias(kernels, &mut d, fw.b_down.as_deref());
                Ok(d)
            }
        }
    }
}

fn add_rows(kernels: &Kernels, x: &mut Array2<f32>, branch: &Array2<f32>) {
    (kernels.add_assign)(
        x.as_slice_mut().expect("contiguous"),
        branch.as_slice().expect("contiguous"),
    );
}

fn add_bias(kernels: &Kernels, x: &mut Array2<f32>, bias: Option<&[f32]>) {
    if let Some(b) = bias {
        for mut row in x.rows_mut() {
            (kernels.add_assign)(row.as_slice_mut().expect("contiguous"), b);
        }
    }
}

fn load_norm(
    file: &ModelFile,
    stem: &str,
    profile: &ArchProfile,
    expected: usize,
) -> Result<NormWeights> {
    let w = file.tensor(&format!("{stem}.weight"))?.to_f32_vec()?;
    if w.len() != expected {
        return Err(EngineError::malformed(format!(
            "{stem}.weight has {} elements, expected {expected}",
            w.len()
        )));
    }
    let bias_name = format!("{stem}.bias");
    let b = if profile.norm == NormKind::Layer && file.contains(&bias_name) {
        let b = file.tensor(&bias_name)?.to_f32_vec()?;
        if b.len() != expected {
            return Err(EngineError::malformed(format!(
                "{bias_name} has {} elements, expected {expected}",
                b.len()
            )));
        }
        Some(b)
    } else {
        None
    };
    Ok(NormWeights { w, b })
}

fn load_linear(
    file: &ModelFile,
    kernels: &Kernels,
    name: &str,
    expect_in: usize,
    expect_out: usize,
) -> Result<Linear> {
    let lin = Linear::from_view(file.tensor(name)?, kernels)?;
    let (fin, fout) = lin.dims();
    if (fin, fout) != (expect_in, expect_out) {
        return Err(EngineError::malformed(format!(
            "{name}: [{fin}, {fout}] inconsistent with architecture [{expect_in}, {expect_out}]"
        )));
    }
    Ok(lin)
}

fn load_bias(file: &ModelFile, name: &str, expected: usize) -> Result<Option<Vec<f32>>> {
    if !file.contains(name) {
        return Ok(None);
    }
    let b = file.tensor(name)?.to_f32_vec()?;
    if b.len() != expected {
        return Err(EngineError::malformed(format!(
            "{name} has {} elements, expected {expected}",
            b.len()
        )));
    }
    Ok(Some(b))
}
