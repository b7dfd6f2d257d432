//! `efficient_attention_backward`: gradients of the forward call with respect to
//! query, key, value and (optionally) bias.
//!
//! The kernel always writes key/value gradients per query head. When query heads
//! share key/value heads, those land in `[B, N, Hq, *]` temporaries that
//! [`sum_head_groups`] folds down afterwards. With 32-bit accumulation, every
//! query/key/value gradient is first written to an f32 shadow and cast back by
//! [`copy_cast`]. All of it is issued on the call's stream in that order.

use super::forward::{dropout_params, softmax_scale};
use super::reduce::{copy_cast, sum_head_groups};
use super::validate::{
    check_backward_inputs, check_bias, check_grouped, get_bias_4d_view, strides3, strides4,
};
use crate::config::FmhaConfig;
use crate::error::{Error, Result};
use crate::ops::dispatch::{self, CustomMaskType};
use crate::ops::layout::fill_grouped_backward_pointers;
use crate::ops::params::{BatchedBackwardParams, GroupedBackwardParams};
use crate::runtime::{Stream, StreamConfig};
use crate::tensor::{DType, Tensor};

#[derive(Debug, Clone, Default)]
pub struct BackwardOptions<'a> {
    pub bias: Option<&'a Tensor>,
    /// Also produce the bias gradient.
    pub bias_requires_grad: bool,
    pub seqstart_q: Option<&'a Tensor>,
    pub seqstart_k: Option<&'a Tensor>,
    pub max_seqlen_q: Option<usize>,
    pub seqlen_k: Option<&'a Tensor>,
    /// Must match the forward call so the dropout mask is regenerated identically.
    pub dropout_p: f64,
    pub rng_seed: u64,
    pub rng_offset: u64,
    pub custom_mask_type: i64,
    pub scale: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BackwardOutput {
    pub grad_q: Tensor,
    pub grad_k: Tensor,
    pub grad_v: Tensor,
    /// Same shape and strides as the bias, when requested.
    pub grad_bias: Option<Tensor>,
}

/// Final gradient tensors, laid out like their inputs.
struct GradTensors {
    q: Tensor,
    k: Tensor,
    v: Tensor,
}

/// Allocate `[q, k, v]` gradients in `dtype`.
///
/// When query, key and value are three slices of one projection output, so are
/// their gradients; likewise for a shared key/value allocation.
fn alloc_grads(query: &Tensor, key: &Tensor, value: &Tensor, dtype: DType) -> Result<GradTensors> {
    let device = query.device();
    let [b, m, hq, k] = [query.size(0), query.size(1), query.size(2), query.size(3)];
    let [n, hkv, kv] = [key.size(1), key.size(2), value.size(3)];

    let packed_qkv = m == n
        && k == kv
        && hq == hkv
        && query.is_alias_of(key)
        && query.is_alias_of(value);
    if packed_qkv {
        let chunk = Tensor::zeros(&[b, m, 3, hq, k], dtype, device);
        tracing::trace!("allocating query/key/value gradients as one chunk");
        return Ok(GradTensors {
            q: chunk.select(2, 0)?,
            k: chunk.select(2, 1)?,
            v: chunk.select(2, 2)?,
        });
    }
    let q = Tensor::empty_strided(query.shape(), query.strides(), dtype, device)?;
    if k == kv && key.is_alias_of(value) {
        let chunk = Tensor::zeros(&[b, n, 2, hkv, kv], dtype, device);
        return Ok(GradTensors {
            q,
            k: chunk.select(2, 0)?,
            v: chunk.select(2, 1)?,
        });
    }
    Ok(GradTensors {
        q,
        k: Tensor::empty_strided(key.shape(), key.strides(), dtype, device)?,
        v: Tensor::empty_strided(value.shape(), value.strides(), dtype, device)?,
    })
}

/// Buffers the kernel writes into, plus the passes that turn them into the final
/// gradients.
struct GradPlan {
    out: GradTensors,
    /// f32 shadows of `out`, or `None` when writing in the input dtype.
    shadow: Option<GradTensors>,
    /// `[B, N, Hq, *]` key/value temporaries when heads are shared.
    per_head: Option<(Tensor, Tensor)>,
}

impl GradPlan {
    fn new(query: &Tensor, key: &Tensor, value: &Tensor, use_fp32: bool) -> Result<Self> {
        let out = alloc_grads(query, key, value, query.dtype())?;
        let shadow = if use_fp32 {
            Some(alloc_grads(query, key, value, DType::F32)?)
        } else {
            None
        };
        let [b, n, hq, hkv] = [query.size(0), key.size(1), query.size(2), key.size(2)];
        let per_head = if hq > hkv {
            let dtype = if use_fp32 { DType::F32 } else { query.dtype() };
            let device = query.device();
            Some((
                Tensor::zeros(&[b, n, hq, key.size(3)], dtype, device),
                Tensor::zeros(&[b, n, hq, value.size(3)], dtype, device),
            ))
        } else {
            None
        };
        Ok(Self { out, shadow, per_head })
    }

    /// Tensors the query/key/value gradients accumulate into before any pass.
    fn accumulators(&self) -> (&Tensor, &Tensor) {
        let target = self.shadow.as_ref().unwrap_or(&self.out);
        (&target.k, &target.v)
    }

    fn kernel_q(&self) -> &Tensor {
        &self.shadow.as_ref().unwrap_or(&self.out).q
    }

    fn kernel_kv(&self) -> (&Tensor, &Tensor) {
        match &self.per_head {
            Some((k, v)) => (k, v),
            None => self.accumulators(),
        }
    }

    fn finish(self, config: &StreamConfig<'_>) -> Result<GradTensors> {
        if let Some((tmp_k, tmp_v)) = &self.per_head {
            let (k, v) = self.accumulators();
            sum_head_groups(config, tmp_k, k)?;
            sum_head_groups(config, tmp_v, v)?;
        }
        if let Some(shadow) = &self.shadow {
            copy_cast(config, &shadow.q, &self.out.q)?;
            copy_cast(config, &shadow.k, &self.out.k)?;
            copy_cast(config, &shadow.v, &self.out.v)?;
        }
        Ok(self.out)
    }
}

fn expect_lse_shape(logsumexp: &Tensor, want: [usize; 3]) -> Result<()> {
    if logsumexp.shape() != want {
        return Err(Error::precondition(
            "logsumexp",
            format!("expected shape {want:?}, got {:?}", logsumexp.shape()),
        ));
    }
    Ok(())
}

/// Backward attention.
///
/// `grad_out`, `out` and `logsumexp` come from the matching forward call, which
/// must also have used the same mask, scale and dropout settings. Gradients match
/// their inputs' shapes and strides.
#[allow(clippy::too_many_arguments)]
pub fn efficient_attention_backward(
    grad_out: &Tensor,
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    logsumexp: &Tensor,
    out: &Tensor,
    opts: &BackwardOptions<'_>,
    config: &FmhaConfig,
    stream: &Stream,
) -> Result<BackwardOutput> {
    if cfg!(feature = "disable-backward") {
        return Err(Error::BackwardDisabled);
    }
    let dims = check_backward_inputs(grad_out, query, key, value, logsumexp, out)?;
    let mask = CustomMaskType::try_from(opts.custom_mask_type)?;
    let dropout = dropout_params(opts.dropout_p, opts.rng_seed, opts.rng_offset)?;
    let tables = check_grouped(
        query,
        key,
        opts.bias,
        opts.seqstart_q,
        opts.seqstart_k,
        opts.max_seqlen_q,
        opts.seqlen_k,
    )?;
    match &tables {
        Some(t) => expect_lse_shape(logsumexp, [t.num_batches(), dims.hq, t.max_seqlen_q])?,
        None => expect_lse_shape(logsumexp, [dims.b, dims.hq, dims.m])?,
    }
    if opts.bias_requires_grad && opts.bias.is_none() {
        return Err(Error::precondition("bias_requires_grad", "set without a bias"));
    }
    let bias = opts.bias.map(|b| check_bias(b, query, &dims)).transpose()?;
    let scale = softmax_scale(opts.scale, dims.k);
    let use_fp32 = config.use_fp32_qkv_grad;
    let stream_config = StreamConfig {
        stream,
        time_kernel: config.time_kernel,
    };
    tracing::debug!(
        grouped = tables.is_some(),
        ?dims,
        %mask,
        fp32_grad = use_fp32,
        bias = bias.is_some(),
        bias_grad = opts.bias_requires_grad,
        dropout = opts.dropout_p,
        "efficient_attention_backward"
    );

    let grads = GradPlan::new(query, key, value, use_fp32)?;
    let grad_bias = match (opts.bias, opts.bias_requires_grad) {
        (Some(b), true) => Some(Tensor::empty_strided(
            b.shape(),
            b.strides(),
            b.dtype(),
            b.device(),
        )?),
        _ => None,
    };
    let grad_bias_4d = grad_bias
        .as_ref()
        .map(|g| get_bias_4d_view(g, dims.b, dims.hq, dims.m, dims.n))
        .transpose()?;

    let grad_q = grads.kernel_q();
    let (grad_k, grad_v) = grads.kernel_kv();
    match tables {
        None => {
            let p = BatchedBackwardParams {
                dtype: query.dtype(),
                b: dims.b,
                m: dims.m,
                n: dims.n,
                hq: dims.hq,
                hkv: dims.hkv,
                k: dims.k,
                kv: dims.kv,
                q_ptr: query.data_ptr(),
                k_ptr: key.data_ptr(),
                v_ptr: value.data_ptr(),
                out_ptr: out.data_ptr(),
                grad_out_ptr: grad_out.data_ptr(),
                logsumexp_ptr: logsumexp.data_ptr(),
                attn_bias_ptr: bias.as_ref().map(Tensor::data_ptr),
                grad_q_ptr: grad_q.data_ptr(),
                grad_k_ptr: grad_k.data_ptr(),
                grad_v_ptr: grad_v.data_ptr(),
                grad_bias_ptr: grad_bias_4d.as_ref().map(Tensor::data_ptr),
                q_strides: strides4(query),
                k_strides: strides4(key),
                v_strides: strides4(value),
                out_strides: strides4(grad_out),
                attn_bias_strides: bias.as_ref().map(strides4).unwrap_or_default(),
                grad_q_strides: strides4(grad_q),
                grad_k_strides: strides4(grad_k),
                grad_v_strides: strides4(grad_v),
                grad_bias_strides: grad_bias_4d.as_ref().map(strides4).unwrap_or_default(),
                scale,
                custom_mask_type: mask,
                dropout,
                use_fp32_qkv_grad: use_fp32,
            };
            dispatch::batched_backward(&p, &stream_config, query.device())?;
        }
        Some(tables) => {
            let num_batches = tables.num_batches();
            let mut p = GroupedBackwardParams {
                dtype: query.dtype(),
                num_batches,
                m: dims.m,
                n: dims.n,
                hq: dims.hq,
                hkv: dims.hkv,
                k: dims.k,
                kv: dims.kv,
                max_seqlen_q: tables.max_seqlen_q,
                host_seqstart_q: tables.seqstart_q,
                host_seqstart_k: tables.seqstart_k,
                host_seqlen_k: tables.seqlen_k,
                q_ptr: query.data_ptr(),
                k_ptr: key.data_ptr(),
                v_ptr: value.data_ptr(),
                out_ptr: out.data_ptr(),
                grad_out_ptr: grad_out.data_ptr(),
                logsumexp_ptr: logsumexp.data_ptr(),
                grad_q_ptr: grad_q.data_ptr(),
                grad_k_ptr: grad_k.data_ptr(),
                grad_v_ptr: grad_v.data_ptr(),
                q_strides: strides3(query),
                k_strides: strides3(key),
                v_strides: strides3(value),
                out_strides: strides3(grad_out),
                grad_q_strides: strides3(grad_q),
                grad_k_strides: strides3(grad_k),
                grad_v_strides: strides3(grad_v),
                q_ptrs: Vec::new(),
                k_ptrs: Vec::new(),
                v_ptrs: Vec::new(),
                out_ptrs: Vec::new(),
                grad_out_ptrs: Vec::new(),
                logsumexp_ptrs: Vec::new(),
                grad_q_ptrs: Vec::new(),
                grad_k_ptrs: Vec::new(),
                grad_v_ptrs: Vec::new(),
                scale,
                custom_mask_type: mask,
                dropout,
                use_fp32_qkv_grad: use_fp32,
            };
            fill_grouped_backward_pointers(&mut p);
            dispatch::grouped_backward(&p, &stream_config, query.device())?;
        }
    }

    let GradTensors { q, k, v } = grads.finish(&stream_config)?;
    Ok(BackwardOutput {
        grad_q: q,
        grad_k: k,
        grad_v: v,
        grad_bias,
    })
}
