//! Shape, stride, dtype and device preconditions of the operator entry points.
//!
//! Every check runs before any allocation or device work; a failure aborts the
//! call with [`Error::PreconditionViolation`].

use crate::error::{Error, Result};
use crate::tensor::{DType, Tensor};

/// Problem sizes read off `(query, key, value)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub b: usize,
    pub m: usize,
    pub n: usize,
    pub hq: usize,
    pub hkv: usize,
    pub k: usize,
    pub kv: usize,
}

fn expect_rank(t: &Tensor, arg: &'static str) -> Result<()> {
    if t.dim() != 4 {
        return Err(Error::precondition(
            arg,
            format!("expected 4D [B, S, H, D], got {}D", t.dim()),
        ));
    }
    Ok(())
}

/// Feature axis contiguous and resident on the accelerator.
pub fn expect_last_contiguous_on_device(t: &Tensor, arg: &'static str) -> Result<()> {
    if !t.device().is_accelerator() {
        return Err(Error::precondition(
            arg,
            format!("expected an accelerator tensor, got {}", t.device()),
        ));
    }
    if !t.is_last_dim_contiguous() {
        return Err(Error::precondition(
            arg,
            format!("last dim must be contiguous, strides are {:?}", t.strides()),
        ));
    }
    Ok(())
}

pub fn expect_contiguous_on_device(t: &Tensor, arg: &'static str) -> Result<()> {
    if !t.device().is_accelerator() {
        return Err(Error::precondition(
            arg,
            format!("expected an accelerator tensor, got {}", t.device()),
        ));
    }
    if !t.is_contiguous() {
        return Err(Error::precondition(
            arg,
            format!("must be contiguous, strides are {:?} for shape {:?}", t.strides(), t.shape()),
        ));
    }
    Ok(())
}

fn expect_same_dtype(t: &Tensor, dtype: DType, arg: &'static str) -> Result<()> {
    if t.dtype() != dtype {
        return Err(Error::precondition(
            arg,
            format!("dtype {} does not match query dtype {dtype}", t.dtype()),
        ));
    }
    Ok(())
}

/// Checks shared by forward and backward: rank, cross-tensor sizes, dtypes and
/// feature-axis contiguity.
pub fn check_qkv(query: &Tensor, key: &Tensor, value: &Tensor) -> Result<AttentionDims> {
    expect_rank(query, "query")?;
    expect_rank(key, "key")?;
    expect_rank(value, "value")?;

    if query.size(0) != key.size(0) || query.size(0) != value.size(0) {
        return Err(Error::precondition(
            "key",
            format!(
                "batch mismatch: query.B={}, key.B={}, value.B={}",
                query.size(0),
                key.size(0),
                value.size(0)
            ),
        ));
    }
    if key.size(1) != value.size(1) {
        return Err(Error::precondition(
            "value",
            format!("key seqlen {} != value seqlen {}", key.size(1), value.size(1)),
        ));
    }
    if key.size(2) != value.size(2) {
        return Err(Error::precondition(
            "value",
            format!("key heads {} != value heads {}", key.size(2), value.size(2)),
        ));
    }
    if key.size(2) == 0 || query.size(2) % key.size(2) != 0 {
        return Err(Error::precondition(
            "key",
            format!(
                "query heads ({}) must be divisible by key heads ({})",
                query.size(2),
                key.size(2)
            ),
        ));
    }
    if query.size(3) != key.size(3) {
        return Err(Error::precondition(
            "key",
            format!("query head dim {} != key head dim {}", query.size(3), key.size(3)),
        ));
    }
    expect_same_dtype(key, query.dtype(), "key")?;
    expect_same_dtype(value, query.dtype(), "value")?;
    expect_last_contiguous_on_device(query, "query")?;
    expect_last_contiguous_on_device(key, "key")?;
    expect_last_contiguous_on_device(value, "value")?;

    Ok(AttentionDims {
        b: query.size(0),
        m: query.size(1),
        n: key.size(1),
        hq: query.size(2),
        hkv: key.size(2),
        k: query.size(3),
        kv: value.size(3),
    })
}

/// Backward additionally needs `grad_out` shaped like the forward output, `out`
/// sharing its layout, and a fully contiguous log-sum-exp.
pub fn check_backward_inputs(
    grad_out: &Tensor,
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    logsumexp: &Tensor,
    out: &Tensor,
) -> Result<AttentionDims> {
    expect_rank(grad_out, "grad_out")?;
    let dims = check_qkv(query, key, value)?;
    if grad_out.size(0) != dims.b || grad_out.size(1) != dims.m || grad_out.size(2) != dims.hq {
        return Err(Error::precondition(
            "grad_out",
            format!("shape {:?} does not match query {:?}", grad_out.shape(), query.shape()),
        ));
    }
    if grad_out.size(3) != dims.kv {
        return Err(Error::precondition(
            "grad_out",
            format!("head dim {} != value head dim {}", grad_out.size(3), dims.kv),
        ));
    }
    if !out.same_layout(grad_out) {
        return Err(Error::precondition(
            "out",
            format!(
                "out {:?}/{:?} and grad_out {:?}/{:?} must share shape and strides",
                out.shape(),
                out.strides(),
                grad_out.shape(),
                grad_out.strides()
            ),
        ));
    }
    expect_same_dtype(grad_out, query.dtype(), "grad_out")?;
    expect_same_dtype(out, query.dtype(), "out")?;
    expect_last_contiguous_on_device(grad_out, "grad_out")?;
    expect_contiguous_on_device(logsumexp, "logsumexp")?;
    if logsumexp.dtype() != DType::F32 || logsumexp.dim() != 3 {
        return Err(Error::precondition(
            "logsumexp",
            format!("expected 3D f32, got {}D {}", logsumexp.dim(), logsumexp.dtype()),
        ));
    }
    Ok(dims)
}

/// Host copies of the grouped-mode offset tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqTables {
    pub seqstart_q: Vec<i32>,
    pub seqstart_k: Vec<i32>,
    pub seqlen_k: Option<Vec<i32>>,
    pub max_seqlen_q: usize,
}

impl SeqTables {
    pub fn num_batches(&self) -> usize {
        self.seqstart_q.len().saturating_sub(1)
    }
}

fn expect_i32_vector(t: &Tensor, arg: &'static str) -> Result<()> {
    if t.dtype() != DType::I32 || t.dim() != 1 {
        return Err(Error::precondition(
            arg,
            format!("expected a 1D i32 tensor, got {}D {}", t.dim(), t.dtype()),
        ));
    }
    if !t.is_contiguous() {
        return Err(Error::precondition(arg, "must be contiguous"));
    }
    Ok(())
}

/// Offsets start at or after zero, never decrease and end within `rows`.
fn expect_offsets(offsets: &[i32], rows: usize, arg: &'static str, packed: &str) -> Result<()> {
    if offsets.first().is_some_and(|&start| start < 0) {
        return Err(Error::precondition(arg, format!("first offset {} is negative", offsets[0])));
    }
    for w in offsets.windows(2) {
        if w[1] < w[0] {
            return Err(Error::precondition(
                arg,
                format!("offsets must be non-decreasing, got {} then {}", w[0], w[1]),
            ));
        }
    }
    if offsets.last().is_some_and(|&end| end as usize > rows) {
        return Err(Error::precondition(
            arg,
            format!("last offset runs past the {rows} packed {packed} rows"),
        ));
    }
    Ok(())
}

/// Validate the grouped-mode inputs and read the offset tables.
///
/// Returns `None` for a batched call.
pub fn check_grouped(
    query: &Tensor,
    key: &Tensor,
    bias: Option<&Tensor>,
    seqstart_q: Option<&Tensor>,
    seqstart_k: Option<&Tensor>,
    max_seqlen_q: Option<usize>,
    seqlen_k: Option<&Tensor>,
) -> Result<Option<SeqTables>> {
    let (sq, sk) = match (seqstart_q, seqstart_k) {
        (None, None) => {
            if seqlen_k.is_some() {
                return Err(Error::precondition(
                    "seqlen_k",
                    "only valid together with seqstart_q/seqstart_k",
                ));
            }
            return Ok(None);
        }
        (Some(sq), Some(sk)) => (sq, sk),
        _ => {
            return Err(Error::precondition(
                "seqstart_k",
                "seqstart_q and seqstart_k must be given together",
            ))
        }
    };
    if bias.is_some() {
        return Err(Error::precondition("bias", "seqstart_q + bias not supported"));
    }
    expect_i32_vector(sq, "seqstart_q")?;
    expect_i32_vector(sk, "seqstart_k")?;
    if sq.size(0) != sk.size(0) || sq.size(0) < 1 {
        return Err(Error::precondition(
            "seqstart_k",
            format!("seqstart_q has {} entries, seqstart_k {}", sq.size(0), sk.size(0)),
        ));
    }
    if query.size(0) != 1 {
        return Err(Error::precondition("query", "seqstart_q only supports batch_size=1"));
    }
    let max_seqlen_q = max_seqlen_q
        .ok_or_else(|| Error::precondition("max_seqlen_q", "required with seqstart_q"))?;

    let seqstart_q = sq.to_vec_i32()?;
    let seqstart_k = sk.to_vec_i32()?;
    let num_batches = seqstart_q.len() - 1;
    let seqlen_k = match seqlen_k {
        Some(t) => {
            expect_i32_vector(t, "seqlen_k")?;
            if t.size(0) != num_batches {
                return Err(Error::precondition(
                    "seqlen_k",
                    format!("expected {num_batches} entries, got {}", t.size(0)),
                ));
            }
            Some(t.to_vec_i32()?)
        }
        None => None,
    };
    expect_offsets(&seqstart_q, query.size(1), "seqstart_q", "query")?;
    expect_offsets(&seqstart_k, key.size(1), "seqstart_k", "key")?;
    if let Some(longest) = seqstart_q.windows(2).map(|w| (w[1] - w[0]) as usize).max() {
        if longest > max_seqlen_q {
            return Err(Error::precondition(
                "max_seqlen_q",
                format!("{max_seqlen_q} is shorter than the longest query sequence ({longest})"),
            ));
        }
    }
    if let Some(lens) = &seqlen_k {
        for (i, (&len, w)) in lens.iter().zip(seqstart_k.windows(2)).enumerate() {
            if len < 0 || len > w[1] - w[0] {
                return Err(Error::precondition(
                    "seqlen_k",
                    format!("entry {i} is {len}, outside the key span of {} rows", w[1] - w[0]),
                ));
            }
        }
    }
    Ok(Some(SeqTables {
        seqstart_q,
        seqstart_k,
        seqlen_k,
        max_seqlen_q,
    }))
}

/// View `bias` as `[B, Hq, M, N]`, broadcasting with zero strides.
///
/// Accepts `[M, N]`, `[B * Hq, M, N]`, `[1, M, N]` and anything `expand`-able to the
/// 4D shape.
pub fn get_bias_4d_view(bias: &Tensor, b: usize, hq: usize, m: usize, n: usize) -> Result<Tensor> {
    let dim = bias.dim();
    if dim < 2 || bias.size(dim - 2) != m || bias.size(dim - 1) != n {
        return Err(Error::precondition(
            "bias",
            format!("shape {:?} does not end in [M={m}, N={n}]", bias.shape()),
        ));
    }
    let view = match dim {
        2 => bias.unsqueeze(0)?.unsqueeze(0)?.expand(&[b, hq, m, n]),
        3 if bias.size(0) == b * hq => bias.unflatten(0, &[b, hq]),
        3 if bias.size(0) == 1 => bias.unsqueeze(0)?.expand(&[b, hq, m, n]),
        3 => Err(Error::precondition(
            "bias",
            format!("leading dim {} must be B*Hq={} or 1", bias.size(0), b * hq),
        )),
        4 => bias.expand(&[b, hq, m, n]),
        _ => Err(Error::precondition("bias", format!("expected 2D, 3D or 4D, got {dim}D"))),
    };
    view.map_err(|e| match e {
        Error::InvalidArgument { reason, .. } => Error::precondition("bias", reason),
        other => other,
    })
}

/// Validate a bias tensor and return its `[B, Hq, M, N]` view.
pub fn check_bias(bias: &Tensor, query: &Tensor, dims: &AttentionDims) -> Result<Tensor> {
    expect_same_dtype(bias, query.dtype(), "bias")?;
    if !bias.device().is_accelerator() {
        return Err(Error::precondition(
            "bias",
            format!("expected an accelerator tensor, got {}", bias.device()),
        ));
    }
    if !bias.is_last_dim_contiguous() {
        return Err(Error::precondition("bias", "last dim must be contiguous"));
    }
    get_bias_4d_view(bias, dims.b, dims.hq, dims.m, dims.n)
}

pub fn strides4(t: &Tensor) -> [usize; 4] {
    [t.stride(0), t.stride(1), t.stride(2), t.stride(3)]
}

/// `(seq, head, feature)` strides of a packed grouped-mode tensor.
pub fn strides3(t: &Tensor) -> [usize; 3] {
    [t.stride(1), t.stride(2), t.stride(3)]
}
