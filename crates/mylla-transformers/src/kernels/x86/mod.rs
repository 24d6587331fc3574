#![allow(unsafe_code)]
//! AVX2 + FMA kernel implementations.
//!
//! Callers must verify `avx2` and `fma` support before invoking anything in
//! this module; the safe dispatch table does that once at construction.

pub(crate) mod common;
pub(crate) mod dequant;
pub(crate) mod elementwise;
pub(crate) mod matmul;
pub(crate) mod norm;
pub(crate) mod rope;
pub(crate) mod unpack;
