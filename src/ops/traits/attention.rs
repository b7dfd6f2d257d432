//! Memory-efficient attention operations trait

use crate::error::Result;
use crate::ops::fmha::{BackwardOptions, BackwardOutput, ForwardOptions, ForwardOutput};
use crate::tensor::Tensor;

/// Fused multi-head attention on an accelerator backend.
///
/// Every method validates its inputs synchronously and returns once the work is
/// queued; results are only safe to read after the backend's stream is
/// synchronized.
///
/// # Layout contract
///
/// - `query`: `[B, M, Hq, K]`, or `[1, total_q, Hq, K]` when `seqstart_q` is given
/// - `key`: `[B, N, Hkv, K]` with `Hq % Hkv == 0`
/// - `value`: `[B, N, Hkv, Kv]`
/// - `bias`: optional, broadcastable to `[B, Hq, M, N]`, **additive**
/// - Output: `[B, M, Hq, Kv]`, log-sum-exp `[B, Hq, M]` (f32)
///
/// The feature axis of every operand must be contiguous; other strides are free.
pub trait MemoryEfficientAttentionOps {
    fn efficient_attention_forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        opts: &ForwardOptions<'_>,
    ) -> Result<ForwardOutput>;

    /// Gradients with respect to `query`, `key`, `value` and, when requested, the
    /// bias. `opts` must repeat the forward call's mask, scale and dropout settings.
    #[allow(clippy::too_many_arguments)]
    fn efficient_attention_backward(
        &self,
        grad_out: &Tensor,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        logsumexp: &Tensor,
        out: &Tensor,
        opts: &BackwardOptions<'_>,
    ) -> Result<BackwardOutput>;

    /// Causal attention of `[B, Mq, Hq, K]` queries against a padded
    /// `[B, T, Hkv, K]` cache holding `seq_positions[b]` valid entries.
    fn efficient_attention_forward_decoder(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        seq_positions: &Tensor,
        scale: Option<f64>,
    ) -> Result<Tensor>;
}
