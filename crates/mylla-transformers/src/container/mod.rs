//! The model container format.
//!
//! A single memory-mapped binary file carries the hyperparameters, the
//! scored tokenizer vocabulary, a tensor directory and the per-tensor data
//! region. Quantized tensors store `[codes][scales][zero_points?]`
//! back-to-back; block geometry travels in the directory's `dtype_tag`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{EngineError, Result};
use crate::tensor::{DtypeTag, TensorView};

pub const MAGIC: [u8; 4] = *b"MYLA";
pub const VERSION: u32 = 1;
/// Tensor data offsets are aligned to this boundary.
pub const DATA_ALIGN: usize = 32;
/// Sentinel for "model defines no BOS token".
pub const NO_TOKEN: u32 = u32::MAX;

/// Fixed, ordered hyperparameter block.
#[derive(Debug, Clone, PartialEq)]
pub struct Hparams {
    pub n_vocab: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_kv_head: usize,
    pub head_dim: usize,
    pub n_ff: usize,
    pub n_layer: usize,
    pub arch_tag: u32,
    pub rope_theta: f32,
    pub ctx_max: usize,
    pub bos_id: u32,
    pub eos_id: u32,
}

impl Hparams {
    fn write_to(&self, out: &mut Vec<u8>) {
        for v in [
            self.n_vocab as u32,
            self.n_embd as u32,
            self.n_head as u32,
            self.n_kv_head as u32,
            self.head_dim as u32,
            self.n_ff as u32,
            self.n_layer as u32,
            self.arch_tag,
            self.rope_theta.to_bits(),
            self.ctx_max as u32,
            self.bos_id,
            self.eos_id,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn read_from(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Hparams {
            n_vocab: cur.read_u32()? as usize,
            n_embd: cur.read_u32()? as usize,
            n_head: cur.read_u32()? as usize,
            n_kv_head: cur.read_u32()? as usize,
            head_dim: cur.read_u32()? as usize,
            n_ff: cur.read_u32()? as usize,
            n_layer: cur.read_u32()? as usize,
            arch_tag: cur.read_u32()?,
            rope_theta: f32::from_bits(cur.read_u32()?),
            ctx_max: cur.read_u32()? as usize,
            bos_id: cur.read_u32()?,
            eos_id: cur.read_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
struct DirEntry {
    shape: Vec<usize>,
    tag: DtypeTag,
    offset: u64,
    size: u64,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(EngineError::malformed(format!(
                "truncated file: need {} bytes at offset {}",
                n, self.pos
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EngineError::malformed(format!("invalid utf-8 in string table: {e}")))
    }
}

/// A parsed, memory-mapped model file.
///
/// Tensor views borrow the mapping through an `Arc`, so they stay valid for
/// as long as any part of the model is alive.
#[derive(Debug)]
pub struct ModelFile {
    mmap: Arc<Mmap>,
    pub hparams: Hparams,
    /// Scored vocabulary, index = token id.
    pub vocab: Vec<(String, f32)>,
    tensors: HashMap<String, DirEntry>,
}

impl ModelFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            EngineError::ResourceExhausted(format!("open {}: {e}", path.display()))
        })?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| EngineError::ResourceExhausted(format!("mmap {}: {e}", path.display())))?;
        let mmap = Arc::new(mmap);

        let mut cur = Cursor::new(&mmap);
        let magic = cur.take(4)?;
        if magic != MAGIC {
            return Err(EngineError::malformed(format!(
                "bad magic {:02x?}, expected {:02x?}",
                magic, MAGIC
            )));
        }
        let version = cur.read_u32()?;
        if version != VERSION {
            return Err(EngineError::malformed(format!(
                "unsupported container version {version}"
            )));
        }

        let hparams = Hparams::read_from(&mut cur)?;

        let vocab_count = cur.read_u32()? as usize;
        if vocab_count != hparams.n_vocab {
            return Err(EngineError::malformed(format!(
                "tokenizer section lists {} tokens, hyperparameters say {}",
                vocab_count, hparams.n_vocab
            )));
        }
        let mut vocab = Vec::with_capacity(vocab_count);
        for _ in 0..vocab_count {
            let text = cur.read_string()?;
            let score = cur.read_f32()?;
            vocab.push((text, score));
        }

        let n_tensors = cur.read_u32()? as usize;
        let mut tensors = HashMap::with_capacity(n_tensors);
        for _ in 0..n_tensors {
            let name = cur.read_string()?;
            let n_dims = cur.read_u32()? as usize;
            if n_dims == 0 || n_dims > 4 {
                return Err(EngineError::malformed(format!(
                    "tensor '{name}': {n_dims} dims"
                )));
            }
            let mut shape = Vec::with_capacity(n_dims);
            for _ in 0..n_dims {
                shape.push(cur.read_u32()? as usize);
            }
            let tag = DtypeTag::decode(cur.read_u32()?)?;
            let offset = cur.read_u64()?;
            let size = cur.read_u64()?;
            if offset as usize + size as usize > mmap.len() {
                return Err(EngineError::malformed(format!(
                    "tensor '{name}' data [{offset}, +{size}] exceeds file size {}",
                    mmap.len()
                )));
            }
            tensors.insert(
                name,
                DirEntry {
                    shape,
                    tag,
                    offset,
                    size,
                },
            );
        }

        log::info!(
            "loaded model container: {} tensors, vocab {}, {} layers",
            tensors.len(),
            hparams.n_vocab,
            hparams.n_layer
        );

        Ok(ModelFile {
            mmap,
            hparams,
            vocab,
            tensors,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    pub fn tensor(&self, name: &str) -> Result<TensorView> {
        let entry = self
            .tensors
            .get(name)
            .ok_or_else(|| EngineError::malformed(format!("tensor '{name}' not found")))?;
        let start = entry.offset as usize;
        TensorView::new(
            name.to_string(),
            entry.shape.clone(),
            entry.tag,
            Arc::clone(&self.mmap),
            start..start + entry.size as usize,
        )
    }
}

struct PendingTensor {
    name: String,
    shape: Vec<usize>,
    tag: DtypeTag,
    bytes: Vec<u8>,
}

/// Builds a container file in memory and writes it out in one pass.
pub struct ContainerWriter {
    hparams: Hparams,
    vocab: Vec<(String, f32)>,
    tensors: Vec<PendingTensor>,
}

impl ContainerWriter {
    pub fn new(hparams: Hparams, vocab: Vec<(String, f32)>) -> Self {
        ContainerWriter {
            hparams,
            vocab,
            tensors: Vec::new(),
        }
    }

    pub fn add_tensor(&mut self, name: &str, shape: &[usize], tag: DtypeTag, bytes: Vec<u8>) {
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            shape: shape.to_vec(),
            tag,
            bytes,
        });
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if self.vocab.len() != self.hparams.n_vocab {
            return Err(EngineError::config(format!(
                "vocab has {} entries, hyperparameters say {}",
                self.vocab.len(),
                self.hparams.n_vocab
            )));
        }

        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        self.hparams.write_to(&mut header);

        header.extend_from_slice(&(self.vocab.len() as u32).to_le_bytes());
        for (text, score) in &self.vocab {
            header.extend_from_slice(&(text.len() as u32).to_le_bytes());
            header.extend_from_slice(text.as_bytes());
            header.extend_from_slice(&score.to_bits().to_le_bytes());
        }

        // The directory length is known up front, so tensor offsets can be
        // assigned before anything is written.
        let mut dir_len = 4usize;
        for t in &self.tensors {
            dir_len += 4 + t.name.len() + 4 + 4 * t.shape.len() + 4 + 8 + 8;
        }

        let mut offset = align_up(header.len() + dir_len, DATA_ALIGN);
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            offsets.push(offset as u64);
            offset = align_up(offset + t.bytes.len(), DATA_ALIGN);
        }

        header.extend_from_slice(&(self.tensors.len() as u32).to_le_bytes());
        for (t, &off) in self.tensors.iter().zip(offsets.iter()) {
            header.extend_from_slice(&(t.name.len() as u32).to_le_bytes());
            header.extend_from_slice(t.name.as_bytes());
            header.extend_from_slice(&(t.shape.len() as u32).to_le_bytes());
            for &d in &t.shape {
                header.extend_from_slice(&(d as u32).to_le_bytes());
            }
            header.extend_from_slice(&t.tag.encode().to_le_bytes());
            header.extend_from_slice(&off.to_le_bytes());
            header.extend_from_slice(&(t.bytes.len() as u64).to_le_bytes());
        }

        let mut file = File::create(path).map_err(|e| {
            EngineError::ResourceExhausted(format!("create {}: {e}", path.display()))
        })?;
        let mut written = 0usize;
        let mut write = |buf: &[u8], written: &mut usize| -> Result<()> {
            file.write_all(buf)
                .map_err(|e| EngineError::ResourceExhausted(format!("write: {e}")))?;
            *written += buf.len();
            Ok(())
        };

        write(&header, &mut written)?;
        for (t, &off) in self.tensors.iter().zip(offsets.iter()) {
            let pad = off as usize - written;
            write(&vec![0u8; pad], &mut written)?;
            write(&t.bytes, &mut written)?;
        }

        log::debug!(
            "wrote container {}: {} tensors, {} bytes",
            path.display(),
            self.tensors.len(),
            written
        );
        Ok(())
    }
}

fn align_up(v: usize, align: usize) -> usize {
    v.div_ceil(align) * align
}
