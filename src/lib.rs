//! # fmha
//!
//! **Fused multi-head attention: kernel dispatch, tiling and gradient reduction.**
//!
//! fmha maps an attention call (element type, head dims, mask, bias, batched or
//! packed variable-length sequences) onto one compile-time specialized kernel
//! instance, derives the strides and offsets that instance needs to address
//! framework-owned tensors in place, and runs the tiled attention algorithm.
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  binding::OperatorTable / MemoryEfficientAttentionOps   │
//! ├─────────────────────────────────────────────────────────┤
//! │  ops::fmha      validation, allocation, param packing   │
//! │  ops::dispatch  registry of compiled instances          │
//! │  ops::layout    per-problem descriptors, pointer tables │
//! ├─────────────────────────────────────────────────────────┤
//! │  ops::device_op GEMM-based forward/backward instances   │
//! │  ops::tile      tile pipeline, masks, dropout           │
//! ├─────────────────────────────────────────────────────────┤
//! │  runtime / tensor   stream, storage, strided views      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The accelerator is emulated on the host: a [`Stream`] runs queued jobs in
//! order on a worker thread, and each kernel spreads its grid over a rayon pool.

pub mod binding;
pub mod config;
pub mod error;
pub mod ops;
pub mod runtime;
pub mod tensor;

pub use binding::{OpArgs, OpOutput, OperatorTable};
pub use config::{FmhaConfig, InferPipeline};
pub use error::{Error, ErrorKind, Result};
pub use ops::{
    efficient_attention_backward, efficient_attention_forward, efficient_attention_forward_decoder,
    BackwardOptions, BackwardOutput, ForwardOptions, ForwardOutput, MemoryEfficientAttentionOps,
};
pub use runtime::{FmhaClient, Stream, StreamConfig};
pub use tensor::{DType, Device, Tensor};
