//! Tensor element types and raw mmap-backed views.

mod dtype;
mod view;

pub use dtype::{ComputeDType, DtypeTag, ScaleDType, SignPolicy, TensorDType};
pub use view::TensorView;
