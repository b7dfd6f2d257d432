//! Kernel selection.
//!
//! Maps the runtime description of a call (element type, mask type, bias presence,
//! gradient precision, head dims) onto one compiled instance and launches it.

pub mod headdim;
pub mod mask;
pub mod registry;

pub use headdim::{
    align_switch, select_transfer_vectors, HeadDimBucket, TileHeadDim, TransferVectors,
    B1_MAX_VECTOR_BATCHED, B1_MAX_VECTOR_GROUPED,
};
pub use mask::CustomMaskType;
pub use registry::{BackwardKey, ForwardKey, Registry, TileKey};

use crate::error::Result;
use crate::ops::params::{
    BatchedBackwardParams, BatchedForwardParams, GroupedBackwardParams, GroupedForwardParams,
};
use crate::runtime::StreamConfig;
use crate::tensor::Device;

/// Training forward (and any inference the tile pipeline cannot serve).
pub fn batched_forward(
    p: &BatchedForwardParams,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let key = ForwardKey {
        dtype: p.dtype,
        mask: p.custom_mask_type,
        has_bias: p.has_attn_bias(),
    };
    tracing::debug!(?key, "dispatch batched forward");
    (Registry::global().forward(key)?.batched)(p, config, device)
}

/// Pointer tables of `p` must already be filled. Grouped calls never carry a bias.
pub fn grouped_forward(
    p: &GroupedForwardParams,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let key = ForwardKey {
        dtype: p.dtype,
        mask: p.custom_mask_type,
        has_bias: false,
    };
    tracing::debug!(?key, sequences = p.num_batches, "dispatch grouped forward");
    (Registry::global().forward(key)?.grouped)(p, config, device)
}

pub fn batched_infer(p: &BatchedForwardParams, config: &StreamConfig<'_>) -> Result<()> {
    let key = TileKey::new(
        p.dtype,
        TileHeadDim::select(p.k, p.kv)?,
        p.custom_mask_type,
        p.window_size,
        p.has_attn_bias(),
    );
    tracing::debug!(?key, "dispatch batched infer");
    (Registry::global().tile(key)?.batched)(p, config)
}

/// Reads the sequence tables through their device pointers; no host copy needed.
pub fn grouped_infer(p: &GroupedForwardParams, config: &StreamConfig<'_>) -> Result<()> {
    let key = TileKey::new(
        p.dtype,
        TileHeadDim::select(p.k, p.kv)?,
        p.custom_mask_type,
        p.window_size,
        false,
    );
    tracing::debug!(?key, sequences = p.num_batches, "dispatch grouped infer");
    (Registry::global().tile(key)?.grouped)(p, config)
}

pub fn batched_backward(
    p: &BatchedBackwardParams,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let key = BackwardKey {
        dtype: p.dtype,
        mask: p.custom_mask_type,
        has_bias: p.has_attn_bias(),
        fp32_grad: p.use_fp32_qkv_grad,
    };
    tracing::debug!(?key, "dispatch batched backward");
    (Registry::global().backward(key)?.batched)(p, config, device)
}

/// Pointer tables of `p` must already be filled.
pub fn grouped_backward(
    p: &GroupedBackwardParams,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let key = BackwardKey {
        dtype: p.dtype,
        mask: p.custom_mask_type,
        has_bias: false,
        fp32_grad: p.use_fp32_qkv_grad,
    };
    tracing::debug!(?key, sequences = p.num_batches, "dispatch grouped backward");
    (Registry::global().backward(key)?.grouped)(p, config, device)
}
