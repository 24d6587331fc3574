//! The quantize tool end to end: dense container in, quantized container
//! out, and the quantized model still decodes.

mod common;

use std::sync::Arc;

use mylla_transformers::kernels;
use mylla_transformers::prelude::*;
use mylla_transformers::{
    quantize_file, ArchKind, ComputeDType, EngineError, ModelFile, QuantAlgo, QuantizeConfig,
    ScaleDType, SessionConfig, TensorDType,
};

use common::{write_tiny_model, NEVER_EOS};

fn quant_config(weight: TensorDType, algo: QuantAlgo, compute: ComputeDType) -> QuantizeConfig {
    QuantizeConfig {
        weight_dtype: weight,
        group_size: 32,
        algo,
        scale_dtype: ScaleDType::F32,
        compute_dtype: compute,
    }
}

fn decode_five(model: Arc<Model>) -> Vec<u32> {
    let config = SessionConfig {
        ctx_size: 32,
        threads: 2,
        n_predict: 5,
        temperature: 0.0,
        repeat_penalty: 1.0,
        numeric_guard: true,
        ..Default::default()
    };
    let mut session = DecoderSession::new(model, config).unwrap();
    session.set_prompt(&[1, 2, 3, 4]).unwrap();
    session.stream().collect::<Result<Vec<u32>>>().unwrap()
}

#[test]
fn test_quantize_file_roundtrip_decodes() {
    let dir = tempfile::tempdir().unwrap();
    let dense = dir.path().join("dense.myla");
    write_tiny_model(&dense, ArchKind::Llama, NEVER_EOS);

    let reference = {
        let model = Model::load(&dense, kernels::best()).unwrap();
        decode_five(Arc::new(model))
    };
    assert_eq!(reference.len(), 5);

    for (weight, algo, compute) in [
        (TensorDType::Int8, QuantAlgo::Sym, ComputeDType::F32),
        (TensorDType::Int8, QuantAlgo::Asym, ComputeDType::F32),
        (TensorDType::Int8, QuantAlgo::Sym, ComputeDType::Int8),
        (TensorDType::Int4, QuantAlgo::Sym, ComputeDType::F32),
        (TensorDType::Nf4, QuantAlgo::Sym, ComputeDType::F32),
        (TensorDType::Fp4E2M1, QuantAlgo::Sym, ComputeDType::F32),
        (TensorDType::Fp8E4M3, QuantAlgo::Sym, ComputeDType::F32),
        (TensorDType::Fp8E5M2, QuantAlgo::Sym, ComputeDType::F32),
    ] {
        let out = dir.path().join(format!("{weight:?}-{algo:?}-{compute:?}.myla"));
        quantize_file(&dense, &out, &quant_config(weight, algo, compute)).unwrap();
        let model = Model::load(&out, kernels::best()).unwrap();
        let tokens = decode_five(Arc::new(model));
        assert_eq!(tokens.len(), 5, "{weight:?} {algo:?} {compute:?}");
    }
}

#[test]
fn test_int8_quantization_keeps_logits_close() {
    use mylla_transformers::cache::{KvCache, KvPrecision};
    use mylla_transformers::rope::RopeCache;

    let dir = tempfile::tempdir().unwrap();
    let dense = dir.path().join("dense.myla");
    let quant = dir.path().join("int8.myla");
    write_tiny_model(&dense, ArchKind::Llama, NEVER_EOS);
    quantize_file(
        &dense,
        &quant,
        &quant_config(TensorDType::Int8, QuantAlgo::Sym, ComputeDType::F32),
    )
    .unwrap();

    let forward = |path: &std::path::Path| {
        let model = Model::load(path, kernels::best()).unwrap();
        let hp = &model.hparams;
        let mut cache = KvCache::new(
            hp.n_layer,
            16,
            hp.n_kv_head,
            hp.head_dim,
            false,
            KvPrecision::F32,
        );
        let rope = RopeCache::new(hp.head_dim, 16, hp.rope_theta);
        model
            .forward(kernels::best(), &[1, 2, 3], &[0, 1, 2], &mut cache, &rope)
            .unwrap()
    };

    let a = forward(&dense);
    let b = forward(&quant);
    let amax = a.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= amax * 0.05, "{x} vs {y} (amax {amax})");
    }
}

#[test]
fn test_invalid_triple_is_rejected_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let dense = dir.path().join("dense.myla");
    let out = dir.path().join("out.myla");
    write_tiny_model(&dense, ArchKind::Llama, NEVER_EOS);

    let bad = quant_config(TensorDType::Nf4, QuantAlgo::Asym, ComputeDType::F32);
    match quantize_file(&dense, &out, &bad) {
        Err(EngineError::InvalidConfiguration(_)) => {}
        other => panic!("expected InvalidConfiguration, got {other:?}"),
    }
    assert!(!out.exists());
}

#[test]
fn test_quantized_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let dense = dir.path().join("dense.myla");
    let once = dir.path().join("once.myla");
    let twice = dir.path().join("twice.myla");
    write_tiny_model(&dense, ArchKind::Llama, NEVER_EOS);

    let cfg = quant_config(TensorDType::Int8, QuantAlgo::Sym, ComputeDType::F32);
    quantize_file(&dense, &once, &cfg).unwrap();
    assert!(matches!(
        quantize_file(&once, &twice, &cfg),
        Err(EngineError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_norms_and_embeddings_stay_dense() {
    let dir = tempfile::tempdir().unwrap();
    let dense = dir.path().join("dense.myla");
    let quant = dir.path().join("quant.myla");
    write_tiny_model(&dense, ArchKind::Llama, NEVER_EOS);
    quantize_file(
        &dense,
        &quant,
        &quant_config(TensorDType::Int4, QuantAlgo::Sym, ComputeDType::F32),
    )
    .unwrap();

    let file = ModelFile::open(&quant).unwrap();
    assert!(!file.tensor("tok_embd.weight").unwrap().tag.dtype.is_quantized());
    assert!(!file.tensor("blk.0.attn_norm.weight").unwrap().tag.dtype.is_quantized());
    assert!(file.tensor("blk.0.attn_q.weight").unwrap().tag.dtype.is_quantized());
}
