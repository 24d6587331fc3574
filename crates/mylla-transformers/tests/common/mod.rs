//! Shared builders for the end-to-end tests: deterministic tiny models
//! written through the container writer.

use std::path::Path;

use mylla_transformers::container::{ContainerWriter, Hparams, NO_TOKEN};
use mylla_transformers::tensor::{DtypeTag, TensorDType};
use mylla_transformers::ArchKind;

pub const VOCAB: usize = 16;
pub const EMBD: usize = 32;
pub const HEADS: usize = 2;
pub const KV_HEADS: usize = 2;
pub const HEAD_DIM: usize = 16;
pub const FF: usize = 64;
pub const LAYERS: usize = 2;

/// Terminator id that no sampled token can match; decode tests run to
/// their n_predict budget.
pub const NEVER_EOS: u32 = 9999;

pub fn hparams(arch: ArchKind, eos_id: u32) -> Hparams {
    Hparams {
        n_vocab: VOCAB,
        n_embd: EMBD,
        n_head: HEADS,
        n_kv_head: KV_HEADS,
        head_dim: HEAD_DIM,
        n_ff: FF,
        n_layer: LAYERS,
        arch_tag: arch.tag(),
        rope_theta: 10000.0,
        ctx_max: 64,
        bos_id: NO_TOKEN,
        eos_id,
    }
}

fn vocab() -> Vec<(String, f32)> {
    (0..VOCAB)
        .map(|i| {
            let c = (b'a' + i as u8) as char;
            (c.to_string(), -(i as f32))
        })
        .collect()
}

/// Deterministic pseudo-random weight values.
fn gen(seed: usize, len: usize, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((seed * 31 + i * 7) as f32 * 0.137).sin() * amplitude)
        .collect()
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn add_f32(writer: &mut ContainerWriter, name: &str, shape: &[usize], values: Vec<f32>) {
    writer.add_tensor(name, shape, DtypeTag::plain(TensorDType::F32), f32_bytes(&values));
}

/// Writes a complete dense-f32 model to `path` and returns nothing; tests
/// open it through the public loaders.
pub fn write_tiny_model(path: &Path, arch: ArchKind, eos_id: u32) {
    let mut writer = ContainerWriter::new(hparams(arch, eos_id), vocab());
    let with_bias = arch == ArchKind::GptJ;
    let gated = arch != ArchKind::GptJ;
    let kv = KV_HEADS * HEAD_DIM;

    add_f32(&mut writer, "tok_embd.weight", &[VOCAB, EMBD], gen(1, VOCAB * EMBD, 0.3));
    add_f32(&mut writer, "output_norm.weight", &[EMBD], vec![1.0; EMBD]);
    if with_bias {
        add_f32(&mut writer, "output_norm.bias", &[EMBD], vec![0.0; EMBD]);
    }

    for i in 0..LAYERS {
        let seed = 100 * (i + 2);
        add_f32(&mut writer, &format!("blk.{i}.attn_norm.weight"), &[EMBD], vec![1.0; EMBD]);
        if with_bias {
            add_f32(&mut writer, &format!("blk.{i}.attn_norm.bias"), &[EMBD], vec![0.0; EMBD]);
        }
        add_f32(&mut writer, &format!("blk.{i}.attn_q.weight"), &[EMBD, EMBD], gen(seed + 1, EMBD * EMBD, 0.15));
        add_f32(&mut writer, &format!("blk.{i}.attn_k.weight"), &[EMBD, kv], gen(seed + 2, EMBD * kv, 0.15));
        add_f32(&mut writer, &format!("blk.{i}.attn_v.weight"), &[EMBD, kv], gen(seed + 3, EMBD * kv, 0.15));
        add_f32(&mut writer, &format!("blk.{i}.attn_output.weight"), &[EMBD, EMBD], gen(seed + 4, EMBD * EMBD, 0.15));
        if with_bias {
            add_f32(&mut writer, &format!("blk.{i}.attn_q.bias"), &[EMBD], gen(seed + 5, EMBD, 0.02));
            add_f32(&mut writer, &format!("blk.{i}.attn_k.bias"), &[kv], gen(seed + 6, kv, 0.02));
            add_f32(&mut writer, &format!("blk.{i}.attn_v.bias"), &[kv], gen(seed + 7, kv, 0.02));
            add_f32(&mut writer, &format!("blk.{i}.attn_output.bias"), &[EMBD], gen(seed + 8, EMBD, 0.02));
        }
        if gated {
            add_f32(&mut writer, &format!("blk.{i}.ffn_norm.weight"), &[EMBD], vec![1.0; EMBD]);
            add_f32(&mut writer, &format!("blk.{i}.ffn_gate.weight"), &[EMBD, FF], gen(seed + 9, EMBD * FF, 0.12));
        }
        add_f32(&mut writer, &format!("blk.{i}.ffn_up.weight"), &[EMBD, FF], gen(seed + 10, EMBD * FF, 0.12));
        add_f32(&mut writer, &format!("blk.{i}.ffn_down.weight"), &[FF, EMBD], gen(seed + 11, FF * EMBD, 0.12));
        if with_bias {
            add_f32(&mut writer, &format!("blk.{i}.ffn_up.bias"), &[FF], gen(seed + 12, FF, 0.02));
            add_f32(&mut writer, &format!("blk.{i}.ffn_down.bias"), &[EMBD], gen(seed + 13, EMBD, 0.02));
        }
    }

    writer.write_to(path).expect("write tiny model");
}
