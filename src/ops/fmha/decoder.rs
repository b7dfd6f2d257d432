//! Single-step decoding against a padded key/value cache.
//!
//! Each batch row holds `Mq` new queries (usually one) and a cache of `T` padded
//! key/value slots of which the first `seq_positions[b]` are valid. Query `i`
//! attends causally: it sees the valid keys except the last `Mq - 1 - i`.

use super::forward::{on_device, softmax_scale};
use super::validate::expect_last_contiguous_on_device;
use crate::config::FmhaConfig;
use crate::error::{Error, Result};
use crate::ops::device_op::{scatter, TileStore};
use crate::ops::tile::view::{load_i32, typed_origin};
use crate::ops::tile::{TensorView, Tile, ViewDesc};
use crate::runtime::{ReadSet, Stream, StreamConfig};
use crate::tensor::{DType, DevicePtr, Element, Tensor};
use half::{bf16, f16};
use rayon::prelude::*;

/// Largest supported head dimension.
pub const DECODER_MAX_K: usize = 256;
/// Largest supported cache padding.
pub const DECODER_MAX_PADDING: usize = 8192;

#[derive(Debug, Clone)]
struct DecoderKargs {
    q_ptr: DevicePtr,
    k_ptr: DevicePtr,
    v_ptr: DevicePtr,
    o_ptr: DevicePtr,
    seq_positions_ptr: DevicePtr,
    b: usize,
    mq: usize,
    t: usize,
    hq: usize,
    hkv: usize,
    k: usize,
    q_strides: [usize; 4],
    k_strides: [usize; 4],
    v_strides: [usize; 4],
    o_strides: [usize; 4],
    scale: f32,
}

fn strides(t: &Tensor) -> [usize; 4] {
    [t.stride(0), t.stride(1), t.stride(2), t.stride(3)]
}

fn check_decoder_inputs(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    seq_positions: &Tensor,
) -> Result<()> {
    for (t, arg) in [(query, "query"), (key, "key"), (value, "value")] {
        if t.dim() != 4 {
            return Err(Error::precondition(arg, format!("expected 4D, got {}D", t.dim())));
        }
    }
    let dtype = query.dtype();
    if !matches!(dtype, DType::F16 | DType::BF16 | DType::F32) {
        return Err(Error::UnmappedDispatchValue {
            what: "input data-type is not supported",
            value: dtype.to_string(),
        });
    }
    if key.dtype() != dtype || value.dtype() != dtype {
        return Err(Error::precondition("key", "query, key and value must share a dtype"));
    }
    if key.shape() != value.shape() {
        return Err(Error::precondition(
            "value",
            format!("shape {:?} does not match key {:?}", value.shape(), key.shape()),
        ));
    }
    let [b, _, hq, k] = [query.size(0), query.size(1), query.size(2), query.size(3)];
    if key.size(0) != b || key.size(3) != k {
        return Err(Error::precondition(
            "key",
            format!("shape {:?} does not match query {:?}", key.shape(), query.shape()),
        ));
    }
    if k > DECODER_MAX_K || k % 4 != 0 {
        return Err(Error::precondition(
            "query",
            format!("head_dim={k}; must be at most {DECODER_MAX_K} and divisible by 4"),
        ));
    }
    if key.size(1) > DECODER_MAX_PADDING {
        return Err(Error::precondition(
            "key",
            format!("padding {} exceeds {DECODER_MAX_PADDING}", key.size(1)),
        ));
    }
    let hkv = key.size(2);
    if hkv == 0 || hq % hkv != 0 {
        return Err(Error::precondition(
            "key",
            format!("query heads ({hq}) must be divisible by key heads ({hkv})"),
        ));
    }
    expect_last_contiguous_on_device(query, "query")?;
    expect_last_contiguous_on_device(key, "key")?;
    expect_last_contiguous_on_device(value, "value")?;
    if seq_positions.dtype() != DType::I32 || seq_positions.shape() != [b] {
        return Err(Error::precondition(
            "seq_positions",
            format!(
                "expected i32 [{b}], got {} {:?}",
                seq_positions.dtype(),
                seq_positions.shape()
            ),
        ));
    }
    Ok(())
}

/// `[rows, features]` view of head `h` of batch `b`.
fn head_view<'a, T: Element>(
    reads: &'a ReadSet<'_>,
    ptr: &DevicePtr,
    s: [usize; 4],
    b: usize,
    h: usize,
    lengths: [usize; 2],
    what: &str,
) -> Result<TensorView<'a, T>> {
    let origin = typed_origin::<T>(ptr, what)? + b * s[0] + h * s[2];
    let desc = ViewDesc::new(origin, lengths, [s[1], s[3]]);
    TensorView::new(reads.bytes(ptr.storage())?, desc, what)
}

/// One `(batch, query head)` block: all `Mq` query rows against the cache.
fn run_block<T: Element>(
    kargs: &DecoderKargs,
    reads: &ReadSet<'_>,
    b: usize,
    h: usize,
) -> Result<TileStore> {
    let a = kargs;
    let hk = h / (a.hq / a.hkv);
    let q = head_view::<T>(reads, &a.q_ptr, a.q_strides, b, h, [a.mq, a.k], "q")?;
    let k = head_view::<T>(reads, &a.k_ptr, a.k_strides, b, hk, [a.t, a.k], "k")?;
    let v = head_view::<T>(reads, &a.v_ptr, a.v_strides, b, hk, [a.t, a.k], "v")?;
    let positions = &a.seq_positions_ptr;
    let valid = load_i32(reads.bytes(positions.storage())?, positions, b, "seq_positions")?;
    let valid = (valid.max(0) as usize).min(a.t);

    let mut tile = Tile::zeros(a.mq, a.k);
    let mut scores = Vec::with_capacity(valid);
    for i in 0..a.mq {
        let visible = valid.saturating_sub(a.mq - 1 - i);
        if visible == 0 {
            continue;
        }
        scores.clear();
        scores.extend(
            (0..visible)
                .map(|j| (0..a.k).map(|c| q.get(i, c) * k.get(j, c)).sum::<f32>() * a.scale),
        );
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for s in scores.iter_mut() {
            *s = (*s - max).exp();
            sum += *s;
        }
        let row = tile.row_mut(i);
        for (j, p) in scores.iter().enumerate() {
            for (c, acc) in row.iter_mut().enumerate() {
                *acc += p * v.get(j, c);
            }
        }
        row.iter_mut().for_each(|x| *x /= sum);
    }

    let o = &a.o_strides;
    let origin = a.o_ptr.element_offset()? + b * o[0] + h * o[2];
    let desc = ViewDesc::new(origin, [a.mq, a.k], [o[1], o[3]]);
    Ok(TileStore::new(&a.o_ptr, desc, [0, 0], tile))
}

fn execute<T: Element>(kargs: &DecoderKargs) -> Result<()> {
    let stores = {
        let storages = [
            kargs.q_ptr.storage(),
            kargs.k_ptr.storage(),
            kargs.v_ptr.storage(),
            kargs.seq_positions_ptr.storage(),
        ];
        let reads = ReadSet::lock(storages.into_iter().map(|s| s.as_ref()))?;
        (0..kargs.b * kargs.hq)
            .into_par_iter()
            .map(|id| run_block::<T>(kargs, &reads, id / kargs.hq, id % kargs.hq))
            .collect::<Result<Vec<_>>>()?
    };
    scatter(stores)
}

fn launch<T: Element>(config: &StreamConfig<'_>, kargs: DecoderKargs) -> Result<()> {
    tracing::debug!(
        dtype = %T::DTYPE,
        batch = kargs.b,
        heads = kargs.hq,
        padding = kargs.t,
        "launching decoder kernel"
    );
    config
        .stream
        .launch_with(config, "fmha_fwd_decoder", move || execute::<T>(&kargs))
}

/// Decoder forward over `[B, Mq, Hq, K]` queries and `[B, T, Hkv, K]` padded
/// caches. Key heads may be broadcast with stride 0.
pub fn efficient_attention_forward_decoder(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    seq_positions: &Tensor,
    scale: Option<f64>,
    config: &FmhaConfig,
    stream: &Stream,
) -> Result<Tensor> {
    check_decoder_inputs(query, key, value, seq_positions)?;
    let device = query.device();
    let out = Tensor::zeros(query.shape(), query.dtype(), device);
    let seq_positions = on_device(seq_positions, device)?;
    let kargs = DecoderKargs {
        q_ptr: query.data_ptr(),
        k_ptr: key.data_ptr(),
        v_ptr: value.data_ptr(),
        o_ptr: out.data_ptr(),
        seq_positions_ptr: seq_positions.data_ptr(),
        b: query.size(0),
        mq: query.size(1),
        t: key.size(1),
        hq: query.size(2),
        hkv: key.size(2),
        k: query.size(3),
        q_strides: strides(query),
        k_strides: strides(key),
        v_strides: strides(value),
        o_strides: strides(&out),
        scale: softmax_scale(scale, query.size(3)),
    };
    let stream_config = StreamConfig {
        stream,
        time_kernel: config.time_kernel,
    };
    match query.dtype() {
        DType::F16 => launch::<f16>(&stream_config, kargs)?,
        DType::BF16 => launch::<bf16>(&stream_config, kargs)?,
        _ => launch::<f32>(&stream_config, kargs)?,
    }
    Ok(out)
}
