//! `efficient_attention_forward`: validation, output allocation, pipeline choice
//! and parameter packing for the forward call.

use super::validate::{
    check_bias, check_grouped, check_qkv, strides3, strides4, AttentionDims, SeqTables,
};
use crate::config::{FmhaConfig, InferPipeline};
use crate::error::{Error, Result};
use crate::ops::device_op::ProblemMode;
use crate::ops::dispatch::registry::forward_instance_name;
use crate::ops::dispatch::{self, CustomMaskType, ForwardKey, TileHeadDim};
use crate::ops::layout::fill_grouped_forward_pointers;
use crate::ops::params::{BatchedForwardParams, DropoutParams, GroupedForwardParams};
use crate::runtime::{Stream, StreamConfig};
use crate::tensor::{DType, Device, Tensor};

/// Optional inputs of a forward call. `Default` is a plain batched, unmasked,
/// dropout-free inference call.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions<'a> {
    /// Additive bias, broadcastable to `[B, Hq, M, N]`.
    pub bias: Option<&'a Tensor>,
    /// `[num_sequences + 1]` i32 query offsets; selects grouped mode.
    pub seqstart_q: Option<&'a Tensor>,
    pub seqstart_k: Option<&'a Tensor>,
    pub max_seqlen_q: Option<usize>,
    /// Per-sequence key lengths overriding the `seqstart_k` differences.
    pub seqlen_k: Option<&'a Tensor>,
    pub dropout_p: f64,
    pub rng_seed: u64,
    pub rng_offset: u64,
    pub compute_logsumexp: bool,
    /// 0 no mask, 1 causal from top-left, 2 causal from bottom-right.
    pub custom_mask_type: i64,
    /// Defaults to `1 / sqrt(K)`.
    pub scale: Option<f64>,
    /// Local attention window; only the tile pipeline supports it.
    pub window_size: usize,
    /// Also return the dropout random values (batched mode only).
    pub return_randvals: bool,
}

#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `[B, M, Hq, Kv]`
    pub out: Tensor,
    /// f32 `[B, Hq, M]`, or `[num_sequences, Hq, max_seqlen_q]` in grouped mode.
    pub logsumexp: Option<Tensor>,
    /// f32 `[B, Hq, M, N]`
    pub randvals: Option<Tensor>,
    pub philox_seed: u64,
    pub philox_offset: u64,
}

pub(crate) fn softmax_scale(scale: Option<f64>, k: usize) -> f32 {
    match scale {
        Some(s) => s as f32,
        None => 1.0 / (k as f32).sqrt(),
    }
}

pub(crate) fn dropout_params(p: f64, seed: u64, offset: u64) -> Result<DropoutParams> {
    if !(0.0..1.0).contains(&p) {
        return Err(Error::precondition("dropout_p", format!("must lie in [0, 1), got {p}")));
    }
    Ok(DropoutParams {
        probability: p as f32,
        philox_seed: seed,
        philox_offset: offset,
    })
}

/// Device copy of a host-resident offset table; device tables are used as is.
pub(crate) fn on_device(t: &Tensor, device: Device) -> Result<Tensor> {
    if t.device().is_accelerator() {
        Ok(t.clone())
    } else {
        t.to_device(device)
    }
}

struct Plan {
    tiled: bool,
    mode: ProblemMode,
}

fn plan(
    config: &FmhaConfig,
    opts: &ForwardOptions<'_>,
    dims: &AttentionDims,
    key: ForwardKey,
    grouped: bool,
) -> Result<Plan> {
    let mode = if grouped {
        ProblemMode::Grouped
    } else {
        ProblemMode::Batched
    };
    let infer = !opts.compute_logsumexp && opts.dropout_p == 0.0 && !opts.return_randvals;
    let tiled = infer
        && match config.infer_pipeline {
            InferPipeline::Tiled => true,
            InferPipeline::DeviceOp => false,
            InferPipeline::Auto => {
                opts.window_size > 0 || TileHeadDim::select(dims.k, dims.kv).is_ok()
            }
        };
    if !tiled && opts.window_size > 0 {
        let reason = if infer {
            "local window attention needs the tile pipeline, which is disabled".to_string()
        } else {
            "local window attention cannot produce logsumexp, dropout or random values".to_string()
        };
        return Err(Error::UnsupportedConfiguration {
            instance: forward_instance_name(key, mode, dims.k, dims.kv)?,
            reason,
        });
    }
    Ok(Plan { tiled, mode })
}

/// Forward attention `out = softmax(scale·Q·Kᵗ + bias)·V` over `[B, M, Hq, K]`
/// queries and `[B, N, Hkv, *]` keys and values.
///
/// Returns once the kernel is queued on `stream`.
pub fn efficient_attention_forward(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    opts: &ForwardOptions<'_>,
    config: &FmhaConfig,
    stream: &Stream,
) -> Result<ForwardOutput> {
    let dims = check_qkv(query, key, value)?;
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
    let bias = opts.bias.map(|b| check_bias(b, query, &dims)).transpose()?;
    let dispatch_key = ForwardKey {
        dtype: query.dtype(),
        mask,
        has_bias: bias.is_some(),
    };
    let plan = plan(config, opts, &dims, dispatch_key, tables.is_some())?;
    let scale = softmax_scale(opts.scale, dims.k);
    let stream_config = StreamConfig {
        stream,
        time_kernel: config.time_kernel,
    };
    tracing::debug!(
        mode = %plan.mode,
        pipeline = if plan.tiled { "tiled" } else { "device_op" },
        ?dims,
        %mask,
        window = opts.window_size,
        dropout = opts.dropout_p,
        "efficient_attention_forward"
    );

    let output = match tables {
        None => forward_batched(
            query,
            key,
            value,
            bias.as_ref(),
            opts,
            &dims,
            mask,
            dropout,
            scale,
            &plan,
            &stream_config,
        )?,
        Some(tables) => {
            if opts.return_randvals {
                return Err(Error::precondition(
                    "return_randvals",
                    "random values are not returned in grouped mode",
                ));
            }
            forward_grouped(
                query,
                key,
                value,
                tables,
                opts,
                &dims,
                mask,
                dropout,
                scale,
                &plan,
                &stream_config,
            )?
        }
    };
    Ok(output)
}

#[allow(clippy::too_many_arguments)]
fn forward_batched(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    bias: Option<&Tensor>,
    opts: &ForwardOptions<'_>,
    dims: &AttentionDims,
    mask: CustomMaskType,
    dropout: DropoutParams,
    scale: f32,
    plan: &Plan,
    stream_config: &StreamConfig<'_>,
) -> Result<ForwardOutput> {
    let d = *dims;
    let device = query.device();
    let out = Tensor::zeros(&[d.b, d.m, d.hq, d.kv], query.dtype(), device);
    let logsumexp = opts
        .compute_logsumexp
        .then(|| Tensor::zeros(&[d.b, d.hq, d.m], DType::F32, device));
    let randvals = opts
        .return_randvals
        .then(|| Tensor::zeros(&[d.b, d.hq, d.m, d.n], DType::F32, device));

    let p = BatchedForwardParams {
        dtype: query.dtype(),
        b: d.b,
        m: d.m,
        n: d.n,
        hq: d.hq,
        hkv: d.hkv,
        k: d.k,
        kv: d.kv,
        q_ptr: query.data_ptr(),
        k_ptr: key.data_ptr(),
        v_ptr: value.data_ptr(),
        out_ptr: out.data_ptr(),
        attn_bias_ptr: bias.map(Tensor::data_ptr),
        logsumexp_ptr: logsumexp.as_ref().map(Tensor::data_ptr),
        randvals_ptr: randvals.as_ref().map(Tensor::data_ptr),
        q_strides: strides4(query),
        k_strides: strides4(key),
        v_strides: strides4(value),
        out_strides: strides4(&out),
        attn_bias_strides: bias.map(strides4).unwrap_or_default(),
        randvals_strides: randvals.as_ref().map(strides4).unwrap_or_default(),
        scale,
        custom_mask_type: mask,
        window_size: opts.window_size,
        dropout,
    };
    if plan.tiled {
        dispatch::batched_infer(&p, stream_config)?;
    } else {
        dispatch::batched_forward(&p, stream_config, device)?;
    }
    Ok(ForwardOutput {
        out,
        logsumexp,
        randvals,
        philox_seed: dropout.philox_seed,
        philox_offset: dropout.philox_offset,
    })
}

#[allow(clippy::too_many_arguments)]
fn forward_grouped(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    tables: SeqTables,
    opts: &ForwardOptions<'_>,
    dims: &AttentionDims,
    mask: CustomMaskType,
    dropout: DropoutParams,
    scale: f32,
    plan: &Plan,
    stream_config: &StreamConfig<'_>,
) -> Result<ForwardOutput> {
    let d = *dims;
    let device = query.device();
    let num_batches = tables.num_batches();
    let out = Tensor::zeros(&[1, d.m, d.hq, d.kv], query.dtype(), device);
    let logsumexp = opts
        .compute_logsumexp
        .then(|| Tensor::zeros(&[num_batches, d.hq, tables.max_seqlen_q], DType::F32, device));

    // the tile kernel reads the offset tables on the device
    let seqstart_q = opts.seqstart_q.map(|t| on_device(t, device)).transpose()?;
    let seqstart_k = opts.seqstart_k.map(|t| on_device(t, device)).transpose()?;
    let seqlen_k = opts.seqlen_k.map(|t| on_device(t, device)).transpose()?;
    let (Some(seqstart_q), Some(seqstart_k)) = (seqstart_q, seqstart_k) else {
        return Err(Error::precondition("seqstart_q", "grouped mode needs both offset tables"));
    };

    let mut p = GroupedForwardParams {
        dtype: query.dtype(),
        num_batches,
        m: d.m,
        n: d.n,
        hq: d.hq,
        hkv: d.hkv,
        k: d.k,
        kv: d.kv,
        max_seqlen_q: tables.max_seqlen_q,
        host_seqstart_q: tables.seqstart_q,
        host_seqstart_k: tables.seqstart_k,
        host_seqlen_k: tables.seqlen_k,
        seqstart_q_dev_ptr: seqstart_q.data_ptr(),
        seqstart_k_dev_ptr: seqstart_k.data_ptr(),
        seqlen_k_dev_ptr: seqlen_k.as_ref().map(Tensor::data_ptr),
        q_ptr: query.data_ptr(),
        k_ptr: key.data_ptr(),
        v_ptr: value.data_ptr(),
        out_ptr: out.data_ptr(),
        logsumexp_ptr: logsumexp.as_ref().map(Tensor::data_ptr),
        q_strides: strides3(query),
        k_strides: strides3(key),
        v_strides: strides3(value),
        out_strides: strides3(&out),
        q_ptrs: Vec::new(),
        k_ptrs: Vec::new(),
        v_ptrs: Vec::new(),
        out_ptrs: Vec::new(),
        logsumexp_ptrs: Vec::new(),
        scale,
        custom_mask_type: mask,
        window_size: opts.window_size,
        dropout,
    };
    if plan.tiled {
        dispatch::grouped_infer(&p, stream_config)?;
    } else {
        fill_grouped_forward_pointers(&mut p);
        dispatch::grouped_forward(&p, stream_config, device)?;
    }
    Ok(ForwardOutput {
        out,
        logsumexp,
        randvals: None,
        philox_seed: dropout.philox_seed,
        philox_offset: dropout.philox_offset,
    })
}
