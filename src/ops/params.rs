//! Parameter structs: everything one kernel launch needs, as plain data.
//!
//! Built fresh per call by the operator entry points, consumed by the dispatcher
//! and the layout builder, and dropped when the call returns. Pointers are
//! [`DevicePtr`]s into framework-owned storage; strides are in elements.
//!
//! Batched strides are `(batch, seq, head, feature)`. Grouped strides drop the
//! batch axis, since the packed tensors have batch size 1: `(seq, head, feature)`.

use super::dispatch::CustomMaskType;
use crate::tensor::{DType, DevicePtr};

/// Dropout settings shared by forward and backward.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DropoutParams {
    pub probability: f32,
    pub philox_seed: u64,
    pub philox_offset: u64,
}

impl DropoutParams {
    pub fn is_enabled(&self) -> bool {
        self.probability > 0.0
    }
}

#[derive(Debug, Clone)]
pub struct BatchedForwardParams {
    pub dtype: DType,
    pub b: usize,
    pub m: usize,
    pub n: usize,
    pub hq: usize,
    pub hkv: usize,
    pub k: usize,
    pub kv: usize,

    pub q_ptr: DevicePtr,
    pub k_ptr: DevicePtr,
    pub v_ptr: DevicePtr,
    pub out_ptr: DevicePtr,
    pub attn_bias_ptr: Option<DevicePtr>,
    /// f32 `[B, Hq, M]`, contiguous.
    pub logsumexp_ptr: Option<DevicePtr>,
    /// f32 `[B, Hq, M, N]`, written with the dropout random values.
    pub randvals_ptr: Option<DevicePtr>,

    pub q_strides: [usize; 4],
    pub k_strides: [usize; 4],
    pub v_strides: [usize; 4],
    pub out_strides: [usize; 4],
    /// Strides of the `[B, Hq, M, N]` bias view.
    pub attn_bias_strides: [usize; 4],
    /// Strides of the `[B, Hq, M, N]` random-values tensor.
    pub randvals_strides: [usize; 4],

    pub scale: f32,
    pub custom_mask_type: CustomMaskType,
    /// Local attention window; 0 disables it.
    pub window_size: usize,
    pub dropout: DropoutParams,
}

impl BatchedForwardParams {
    pub fn has_attn_bias(&self) -> bool {
        self.attn_bias_ptr.is_some()
    }

    pub fn compute_logsumexp(&self) -> bool {
        self.logsumexp_ptr.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct GroupedForwardParams {
    pub dtype: DType,
    pub num_batches: usize,
    /// Packed query length (sum over sequences).
    pub m: usize,
    /// Packed key length.
    pub n: usize,
    pub hq: usize,
    pub hkv: usize,
    pub k: usize,
    pub kv: usize,
    pub max_seqlen_q: usize,

    /// Host copies of the offset tables, read by the legacy layout builder.
    pub host_seqstart_q: Vec<i32>,
    pub host_seqstart_k: Vec<i32>,
    pub host_seqlen_k: Option<Vec<i32>>,
    /// Device-resident offset tables, read inside the tile kernel.
    pub seqstart_q_dev_ptr: DevicePtr,
    pub seqstart_k_dev_ptr: DevicePtr,
    pub seqlen_k_dev_ptr: Option<DevicePtr>,

    pub q_ptr: DevicePtr,
    pub k_ptr: DevicePtr,
    pub v_ptr: DevicePtr,
    pub out_ptr: DevicePtr,
    /// f32 `[num_batches, Hq, max_seqlen_q]`, contiguous.
    pub logsumexp_ptr: Option<DevicePtr>,

    pub q_strides: [usize; 3],
    pub k_strides: [usize; 3],
    pub v_strides: [usize; 3],
    pub out_strides: [usize; 3],

    /// Per-sequence base pointers, filled by the layout builder.
    pub q_ptrs: Vec<DevicePtr>,
    pub k_ptrs: Vec<DevicePtr>,
    pub v_ptrs: Vec<DevicePtr>,
    pub out_ptrs: Vec<DevicePtr>,
    pub logsumexp_ptrs: Vec<DevicePtr>,

    pub scale: f32,
    pub custom_mask_type: CustomMaskType,
    pub window_size: usize,
    pub dropout: DropoutParams,
}

impl GroupedForwardParams {
    pub fn compute_logsumexp(&self) -> bool {
        self.logsumexp_ptr.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct BatchedBackwardParams {
    pub dtype: DType,
    pub b: usize,
    pub m: usize,
    pub n: usize,
    pub hq: usize,
    pub hkv: usize,
    pub k: usize,
    pub kv: usize,

    pub q_ptr: DevicePtr,
    pub k_ptr: DevicePtr,
    pub v_ptr: DevicePtr,
    pub out_ptr: DevicePtr,
    pub grad_out_ptr: DevicePtr,
    /// f32 `[B, Hq, M]`, contiguous.
    pub logsumexp_ptr: DevicePtr,
    pub attn_bias_ptr: Option<DevicePtr>,

    /// Gradient destinations. With multi-query/grouped-query heads the key/value
    /// pointers address `[B, N, Hq, *]` temporaries.
    pub grad_q_ptr: DevicePtr,
    pub grad_k_ptr: DevicePtr,
    pub grad_v_ptr: DevicePtr,
    pub grad_bias_ptr: Option<DevicePtr>,

    pub q_strides: [usize; 4],
    pub k_strides: [usize; 4],
    pub v_strides: [usize; 4],
    /// Shared by `out` and `grad_out`.
    pub out_strides: [usize; 4],
    pub attn_bias_strides: [usize; 4],
    pub grad_q_strides: [usize; 4],
    pub grad_k_strides: [usize; 4],
    pub grad_v_strides: [usize; 4],
    pub grad_bias_strides: [usize; 4],

    pub scale: f32,
    pub custom_mask_type: CustomMaskType,
    pub dropout: DropoutParams,
    pub use_fp32_qkv_grad: bool,
}

impl BatchedBackwardParams {
    pub fn has_attn_bias(&self) -> bool {
        self.attn_bias_ptr.is_some()
    }

    pub fn bias_has_grad(&self) -> bool {
        self.grad_bias_ptr.is_some()
    }

    pub fn is_mqa_gqa(&self) -> bool {
        self.hq > self.hkv
    }
}

#[derive(Debug, Clone)]
pub struct GroupedBackwardParams {
    pub dtype: DType,
    pub num_batches: usize,
    pub m: usize,
    pub n: usize,
    pub hq: usize,
    pub hkv: usize,
    pub k: usize,
    pub kv: usize,
    pub max_seqlen_q: usize,

    pub host_seqstart_q: Vec<i32>,
    pub host_seqstart_k: Vec<i32>,
    pub host_seqlen_k: Option<Vec<i32>>,

    pub q_ptr: DevicePtr,
    pub k_ptr: DevicePtr,
    pub v_ptr: DevicePtr,
    pub out_ptr: DevicePtr,
    pub grad_out_ptr: DevicePtr,
    /// f32 `[num_batches, Hq, max_seqlen_q]`, contiguous.
    pub logsumexp_ptr: DevicePtr,
    pub grad_q_ptr: DevicePtr,
    pub grad_k_ptr: DevicePtr,
    pub grad_v_ptr: DevicePtr,

    pub q_strides: [usize; 3],
    pub k_strides: [usize; 3],
    pub v_strides: [usize; 3],
    pub out_strides: [usize; 3],
    pub grad_q_strides: [usize; 3],
    pub grad_k_strides: [usize; 3],
    pub grad_v_strides: [usize; 3],

    /// Per-sequence base pointers, filled by the layout builder.
    pub q_ptrs: Vec<DevicePtr>,
    pub k_ptrs: Vec<DevicePtr>,
    pub v_ptrs: Vec<DevicePtr>,
    pub out_ptrs: Vec<DevicePtr>,
    pub grad_out_ptrs: Vec<DevicePtr>,
    pub logsumexp_ptrs: Vec<DevicePtr>,
    pub grad_q_ptrs: Vec<DevicePtr>,
    pub grad_k_ptrs: Vec<DevicePtr>,
    pub grad_v_ptrs: Vec<DevicePtr>,

    pub scale: f32,
    pub custom_mask_type: CustomMaskType,
    pub dropout: DropoutParams,
    pub use_fp32_qkv_grad: bool,
}

impl GroupedBackwardParams {
    pub fn is_mqa_gqa(&self) -> bool {
        self.hq > self.hkv
    }
}
