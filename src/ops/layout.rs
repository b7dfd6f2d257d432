//! Layout/offset builder.
//!
//! Turns parameter structs into the per-role `(G0, G1, row, col)` descriptors the
//! device ops consume, and, for grouped mode, the per-sequence base-pointer tables.
//! Batched mode is a pure axis reordering of the stored strides; grouped mode
//! derives one descriptor per sequence from the prefix-sum offset tables.

use super::params::{
    BatchedBackwardParams, BatchedForwardParams, GroupedBackwardParams, GroupedForwardParams,
};
use crate::error::{Error, Result};
use crate::tensor::{DType, DevicePtr};

/// Lengths and strides of one tensor role, ordered `(G0, G1, row, col)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDesc {
    pub lengths: [usize; 4],
    pub strides: [usize; 4],
}

impl GemmDesc {
    pub const fn new(lengths: [usize; 4], strides: [usize; 4]) -> Self {
        Self { lengths, strides }
    }

    pub fn rows(&self) -> usize {
        self.lengths[2]
    }

    pub fn cols(&self) -> usize {
        self.lengths[3]
    }

    /// Element offset of the `(g0, g1)` matrix.
    pub fn group_offset(&self, g0: usize, g1: usize) -> usize {
        g0 * self.strides[0] + g1 * self.strides[1]
    }
}

/// Log-sum-exp descriptor, ordered `(G0, G1, row)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LseDesc {
    pub lengths: [usize; 3],
    pub strides: [usize; 3],
}

impl LseDesc {
    pub fn group_offset(&self, g0: usize, g1: usize) -> usize {
        g0 * self.strides[0] + g1 * self.strides[1]
    }
}

/// One forward problem: Q `a_gs_ms_ks`, K `b0_gs_ns_ks`, V `b1_gs_os_ns` (feature
/// by key, i.e. Vᵗ addressing), output `c_gs_ms_os`, random values `z_gs_ms_ns`,
/// bias `d0_gs_ms_ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwdProblemDesc {
    pub a_gs_ms_ks: GemmDesc,
    pub b0_gs_ns_ks: GemmDesc,
    pub b1_gs_os_ns: GemmDesc,
    pub c_gs_ms_os: GemmDesc,
    pub z_gs_ms_ns: GemmDesc,
    pub lse_gs_ms: LseDesc,
    pub d0_gs_ms_ns: Option<GemmDesc>,
}

#[derive(Debug, Clone)]
pub struct FwdProblemPtrs {
    pub q: DevicePtr,
    pub k: DevicePtr,
    pub v: DevicePtr,
    pub out: DevicePtr,
    pub randvals: Option<DevicePtr>,
    pub logsumexp: Option<DevicePtr>,
    pub bias: Option<DevicePtr>,
}

#[derive(Debug, Clone)]
pub struct FwdProblem {
    pub desc: FwdProblemDesc,
    pub ptrs: FwdProblemPtrs,
}

/// One backward problem. `y` describes both the forward output and its gradient,
/// which share strides. Gradient descriptors carry `Hq` heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BwdProblemDesc {
    pub q_gs_ms_ks: GemmDesc,
    pub k_gs_ns_ks: GemmDesc,
    pub z_gs_ms_ns: GemmDesc,
    pub v_gs_os_ns: GemmDesc,
    pub y_gs_ms_os: GemmDesc,
    pub lse_gs_ms: LseDesc,
    pub d0_gs_ms_ns: Option<GemmDesc>,
    pub qgrad_gs_ms_ks: GemmDesc,
    pub kgrad_gs_ns_ks: GemmDesc,
    pub vgrad_gs_os_ns: GemmDesc,
    pub d0grad_gs_ms_ns: Option<GemmDesc>,
}

#[derive(Debug, Clone)]
pub struct BwdProblemPtrs {
    pub q: DevicePtr,
    pub k: DevicePtr,
    pub v: DevicePtr,
    pub y: DevicePtr,
    pub ygrad: DevicePtr,
    pub logsumexp: DevicePtr,
    pub bias: Option<DevicePtr>,
    pub qgrad: DevicePtr,
    pub kgrad: DevicePtr,
    pub vgrad: DevicePtr,
    pub bias_grad: Option<DevicePtr>,
    /// Random-values output; backward never materializes it.
    pub randvals: Option<DevicePtr>,
}

#[derive(Debug, Clone)]
pub struct BwdProblem {
    pub desc: BwdProblemDesc,
    pub ptrs: BwdProblemPtrs,
}

/// `(batch, seq, head, feature)` strides as `(batch, head, seq, feature)`.
fn bshk_as_gs_ms_ks(s: [usize; 4]) -> [usize; 4] {
    [s[0], s[2], s[1], s[3]]
}

/// `(batch, seq, head, feature)` strides as `(batch, head, feature, seq)`.
fn bshk_as_gs_os_ns(s: [usize; 4]) -> [usize; 4] {
    [s[0], s[2], s[3], s[1]]
}

/// Grouped `(seq, head, feature)` strides as a single-group `(0, head, seq, feature)`.
fn shk_as_gs_ms_ks(s: [usize; 3]) -> [usize; 4] {
    [0, s[1], s[0], s[2]]
}

fn shk_as_gs_os_ns(s: [usize; 3]) -> [usize; 4] {
    [0, s[1], s[2], s[0]]
}

pub fn batched_forward_problem(p: &BatchedForwardParams) -> FwdProblem {
    let desc = FwdProblemDesc {
        a_gs_ms_ks: GemmDesc::new([p.b, p.hq, p.m, p.k], bshk_as_gs_ms_ks(p.q_strides)),
        b0_gs_ns_ks: GemmDesc::new([p.b, p.hkv, p.n, p.k], bshk_as_gs_ms_ks(p.k_strides)),
        b1_gs_os_ns: GemmDesc::new([p.b, p.hkv, p.kv, p.n], bshk_as_gs_os_ns(p.v_strides)),
        c_gs_ms_os: GemmDesc::new([p.b, p.hq, p.m, p.kv], bshk_as_gs_ms_ks(p.out_strides)),
        z_gs_ms_ns: GemmDesc::new([p.b, p.hq, p.m, p.n], p.randvals_strides),
        lse_gs_ms: LseDesc {
            lengths: [p.b, p.hq, p.m],
            strides: [p.hq * p.m, p.m, 1],
        },
        d0_gs_ms_ns: p
            .has_attn_bias()
            .then(|| GemmDesc::new([p.b, p.hq, p.m, p.n], p.attn_bias_strides)),
    };
    FwdProblem {
        desc,
        ptrs: FwdProblemPtrs {
            q: p.q_ptr.clone(),
            k: p.k_ptr.clone(),
            v: p.v_ptr.clone(),
            out: p.out_ptr.clone(),
            randvals: p.randvals_ptr.clone(),
            logsumexp: p.logsumexp_ptr.clone(),
            bias: p.attn_bias_ptr.clone(),
        },
    }
}

pub fn batched_backward_problem(p: &BatchedBackwardParams) -> BwdProblem {
    let desc = BwdProblemDesc {
        q_gs_ms_ks: GemmDesc::new([p.b, p.hq, p.m, p.k], bshk_as_gs_ms_ks(p.q_strides)),
        k_gs_ns_ks: GemmDesc::new([p.b, p.hkv, p.n, p.k], bshk_as_gs_ms_ks(p.k_strides)),
        z_gs_ms_ns: GemmDesc::new([p.b, p.hq, p.m, p.n], [p.hq * p.m * p.n, p.m * p.n, p.n, 1]),
        v_gs_os_ns: GemmDesc::new([p.b, p.hkv, p.kv, p.n], bshk_as_gs_os_ns(p.v_strides)),
        y_gs_ms_os: GemmDesc::new([p.b, p.hq, p.m, p.kv], bshk_as_gs_ms_ks(p.out_strides)),
        lse_gs_ms: LseDesc {
            lengths: [p.b, p.hq, p.m],
            strides: [p.hq * p.m, p.m, 1],
        },
        d0_gs_ms_ns: p
            .has_attn_bias()
            .then(|| GemmDesc::new([p.b, p.hq, p.m, p.n], p.attn_bias_strides)),
        qgrad_gs_ms_ks: GemmDesc::new([p.b, p.hq, p.m, p.k], bshk_as_gs_ms_ks(p.grad_q_strides)),
        kgrad_gs_ns_ks: GemmDesc::new([p.b, p.hq, p.n, p.k], bshk_as_gs_ms_ks(p.grad_k_strides)),
        vgrad_gs_os_ns: GemmDesc::new([p.b, p.hq, p.kv, p.n], bshk_as_gs_os_ns(p.grad_v_strides)),
        d0grad_gs_ms_ns: p
            .bias_has_grad()
            .then(|| GemmDesc::new([p.b, p.hq, p.m, p.n], p.grad_bias_strides)),
    };
    BwdProblem {
        desc,
        ptrs: BwdProblemPtrs {
            q: p.q_ptr.clone(),
            k: p.k_ptr.clone(),
            v: p.v_ptr.clone(),
            y: p.out_ptr.clone(),
            ygrad: p.grad_out_ptr.clone(),
            logsumexp: p.logsumexp_ptr.clone(),
            bias: p.attn_bias_ptr.clone(),
            qgrad: p.grad_q_ptr.clone(),
            kgrad: p.grad_k_ptr.clone(),
            vgrad: p.grad_v_ptr.clone(),
            bias_grad: p.grad_bias_ptr.clone(),
            randvals: None,
        },
    }
}

/// Per-sequence query and key lengths from the offset tables.
///
/// `seqlen_k`, when present, overrides the key prefix-sum difference, which lets a
/// key span run past the packed tensor (e.g. into a prefix cache).
pub fn sequence_lengths(
    seqstart_q: &[i32],
    seqstart_k: &[i32],
    seqlen_k: Option<&[i32]>,
) -> Result<Vec<(usize, usize)>> {
    if seqstart_q.len() != seqstart_k.len() || seqstart_q.is_empty() {
        return Err(Error::precondition(
            "seqstart_q",
            format!(
                "offset tables must be non-empty and equally long, got {} and {}",
                seqstart_q.len(),
                seqstart_k.len()
            ),
        ));
    }
    let num_batches = seqstart_q.len() - 1;
    if let Some(lens) = seqlen_k {
        if lens.len() != num_batches {
            return Err(Error::precondition(
                "seqlen_k",
                format!("expected {num_batches} entries, got {}", lens.len()),
            ));
        }
    }
    (0..num_batches)
        .map(|i| {
            let m = seqstart_q[i + 1] - seqstart_q[i];
            let n = match seqlen_k {
                Some(lens) => lens[i],
                None => seqstart_k[i + 1] - seqstart_k[i],
            };
            if m < 0 || n < 0 || seqstart_q[i] < 0 || seqstart_k[i] < 0 {
                return Err(Error::precondition(
                    "seqstart_q",
                    format!("sequence {i} has negative extent (M={m}, N={n})"),
                ));
            }
            Ok((m as usize, n as usize))
        })
        .collect()
}

/// Byte offsets `elementsize(dtype) * seqstart[i] * row_stride` of each sequence.
pub fn grouped_row_offsets(seqstart: &[i32], row_stride: usize, dtype: DType) -> Vec<usize> {
    seqstart
        .iter()
        .take(seqstart.len().saturating_sub(1))
        .map(|&start| dtype.size_in_bytes() * (start.max(0) as usize * row_stride))
        .collect()
}

fn offset_table(base: &DevicePtr, byte_offsets: &[usize]) -> Vec<DevicePtr> {
    byte_offsets.iter().map(|&o| base.offset_bytes(o)).collect()
}

/// Fill the per-sequence pointer tables of a grouped forward call.
pub fn fill_grouped_forward_pointers(p: &mut GroupedForwardParams) {
    let q_offsets = grouped_row_offsets(&p.host_seqstart_q, p.q_strides[0], p.dtype);
    let k_offsets = grouped_row_offsets(&p.host_seqstart_k, p.k_strides[0], p.dtype);
    let v_offsets = grouped_row_offsets(&p.host_seqstart_k, p.v_strides[0], p.dtype);
    let out_offsets = grouped_row_offsets(&p.host_seqstart_q, p.out_strides[0], p.dtype);
    p.q_ptrs = offset_table(&p.q_ptr, &q_offsets);
    p.k_ptrs = offset_table(&p.k_ptr, &k_offsets);
    p.v_ptrs = offset_table(&p.v_ptr, &v_offsets);
    p.out_ptrs = offset_table(&p.out_ptr, &out_offsets);
    p.logsumexp_ptrs = match &p.logsumexp_ptr {
        Some(base) => (0..p.num_batches)
            .map(|i| base.offset_bytes(DType::F32.size_in_bytes() * i * p.hq * p.max_seqlen_q))
            .collect(),
        None => Vec::new(),
    };
}

/// Fill the per-sequence pointer tables of a grouped backward call.
///
/// Gradient offsets follow the input offsets, scaled by `4 / elementsize(dtype)`
/// when gradients are accumulated in f32.
pub fn fill_grouped_backward_pointers(p: &mut GroupedBackwardParams) {
    let multiplier = if p.use_fp32_qkv_grad {
        DType::F32.size_in_bytes() / p.dtype.size_in_bytes()
    } else {
        1
    };
    let q_offsets = grouped_row_offsets(&p.host_seqstart_q, p.q_strides[0], p.dtype);
    let k_offsets = grouped_row_offsets(&p.host_seqstart_k, p.k_strides[0], p.dtype);
    let v_offsets = grouped_row_offsets(&p.host_seqstart_k, p.v_strides[0], p.dtype);
    let out_offsets = grouped_row_offsets(&p.host_seqstart_q, p.out_strides[0], p.dtype);
    let grad_q_offsets = grouped_row_offsets(&p.host_seqstart_q, p.grad_q_strides[0], p.dtype);
    let grad_k_offsets = grouped_row_offsets(&p.host_seqstart_k, p.grad_k_strides[0], p.dtype);
    let grad_v_offsets = grouped_row_offsets(&p.host_seqstart_k, p.grad_v_strides[0], p.dtype);
    let scaled = |offsets: &[usize]| offsets.iter().map(|o| o * multiplier).collect::<Vec<_>>();

    p.q_ptrs = offset_table(&p.q_ptr, &q_offsets);
    p.k_ptrs = offset_table(&p.k_ptr, &k_offsets);
    p.v_ptrs = offset_table(&p.v_ptr, &v_offsets);
    p.out_ptrs = offset_table(&p.out_ptr, &out_offsets);
    p.grad_out_ptrs = offset_table(&p.grad_out_ptr, &out_offsets);
    p.grad_q_ptrs = offset_table(&p.grad_q_ptr, &scaled(&grad_q_offsets));
    p.grad_k_ptrs = offset_table(&p.grad_k_ptr, &scaled(&grad_k_offsets));
    p.grad_v_ptrs = offset_table(&p.grad_v_ptr, &scaled(&grad_v_offsets));
    p.logsumexp_ptrs = (0..p.num_batches)
        .map(|i| {
            p.logsumexp_ptr
                .offset_bytes(DType::F32.size_in_bytes() * i * p.hq * p.max_seqlen_q)
        })
        .collect();
}

/// One descriptor per sequence for a grouped forward call. Pointer tables must be
/// filled first.
pub fn grouped_forward_problems(p: &GroupedForwardParams) -> Result<Vec<FwdProblem>> {
    let lengths = sequence_lengths(
        &p.host_seqstart_q,
        &p.host_seqstart_k,
        p.host_seqlen_k.as_deref(),
    )?;
    lengths
        .into_iter()
        .enumerate()
        .map(|(i, (m, n))| {
            let desc = FwdProblemDesc {
                a_gs_ms_ks: GemmDesc::new([1, p.hq, m, p.k], shk_as_gs_ms_ks(p.q_strides)),
                b0_gs_ns_ks: GemmDesc::new([1, p.hkv, n, p.k], shk_as_gs_ms_ks(p.k_strides)),
                b1_gs_os_ns: GemmDesc::new([1, p.hkv, p.kv, n], shk_as_gs_os_ns(p.v_strides)),
                c_gs_ms_os: GemmDesc::new([1, p.hq, m, p.kv], shk_as_gs_ms_ks(p.out_strides)),
                z_gs_ms_ns: GemmDesc::new([1, p.hq, m, n], [0, m * n, n, 1]),
                lse_gs_ms: LseDesc {
                    lengths: [1, p.hq, m],
                    strides: [0, p.max_seqlen_q, 1],
                },
                d0_gs_ms_ns: None,
            };
            let ptrs = FwdProblemPtrs {
                q: table_entry(&p.q_ptrs, i, "q_ptrs")?,
                k: table_entry(&p.k_ptrs, i, "k_ptrs")?,
                v: table_entry(&p.v_ptrs, i, "v_ptrs")?,
                out: table_entry(&p.out_ptrs, i, "out_ptrs")?,
                randvals: None,
                logsumexp: optional_entry(
                    &p.logsumexp_ptrs,
                    i,
                    p.compute_logsumexp(),
                    "logsumexp_ptrs",
                )?,
                bias: None,
            };
            Ok(FwdProblem { desc, ptrs })
        })
        .collect()
}

/// One descriptor per sequence for a grouped backward call. Pointer tables must be
/// filled first.
pub fn grouped_backward_problems(p: &GroupedBackwardParams) -> Result<Vec<BwdProblem>> {
    let lengths = sequence_lengths(
        &p.host_seqstart_q,
        &p.host_seqstart_k,
        p.host_seqlen_k.as_deref(),
    )?;
    lengths
        .into_iter()
        .enumerate()
        .map(|(i, (m, n))| {
            let desc = BwdProblemDesc {
                q_gs_ms_ks: GemmDesc::new([1, p.hq, m, p.k], shk_as_gs_ms_ks(p.q_strides)),
                k_gs_ns_ks: GemmDesc::new([1, p.hkv, n, p.k], shk_as_gs_ms_ks(p.k_strides)),
                z_gs_ms_ns: GemmDesc::new([1, p.hq, m, n], [0, m * n, n, 1]),
                v_gs_os_ns: GemmDesc::new([1, p.hkv, p.kv, n], shk_as_gs_os_ns(p.v_strides)),
                y_gs_ms_os: GemmDesc::new([1, p.hq, m, p.kv], shk_as_gs_ms_ks(p.out_strides)),
                lse_gs_ms: LseDesc {
                    lengths: [1, p.hq, m],
                    strides: [0, p.max_seqlen_q, 1],
                },
                d0_gs_ms_ns: None,
                qgrad_gs_ms_ks: GemmDesc::new([1, p.hq, m, p.k], shk_as_gs_ms_ks(p.grad_q_strides)),
                kgrad_gs_ns_ks: GemmDesc::new([1, p.hq, n, p.k], shk_as_gs_ms_ks(p.grad_k_strides)),
                vgrad_gs_os_ns: GemmDesc::new(
                    [1, p.hq, p.kv, n],
                    shk_as_gs_os_ns(p.grad_v_strides),
                ),
                d0grad_gs_ms_ns: None,
            };
            let ptrs = BwdProblemPtrs {
                q: table_entry(&p.q_ptrs, i, "q_ptrs")?,
                k: table_entry(&p.k_ptrs, i, "k_ptrs")?,
                v: table_entry(&p.v_ptrs, i, "v_ptrs")?,
                y: table_entry(&p.out_ptrs, i, "out_ptrs")?,
                ygrad: table_entry(&p.grad_out_ptrs, i, "grad_out_ptrs")?,
                logsumexp: table_entry(&p.logsumexp_ptrs, i, "logsumexp_ptrs")?,
                bias: None,
                qgrad: table_entry(&p.grad_q_ptrs, i, "grad_q_ptrs")?,
                kgrad: table_entry(&p.grad_k_ptrs, i, "grad_k_ptrs")?,
                vgrad: table_entry(&p.grad_v_ptrs, i, "grad_v_ptrs")?,
                bias_grad: None,
                randvals: None,
            };
            Ok(BwdProblem { desc, ptrs })
        })
        .collect()
}

fn table_entry(table: &[DevicePtr], i: usize, name: &'static str) -> Result<DevicePtr> {
    table.get(i).cloned().ok_or_else(|| {
        let have = table.len();
        Error::precondition(name, format!("pointer table has {have} entries, need {}", i + 1))
    })
}

fn optional_entry(
    table: &[DevicePtr],
    i: usize,
    present: bool,
    name: &'static str,
) -> Result<Option<DevicePtr>> {
    if present {
        table_entry(table, i, name).map(Some)
    } else {
        Ok(None)
    }
}

/// Start offsets (in elements) of one group-mode tile-kernel block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOffsets {
    pub q: usize,
    pub k: usize,
    pub v: usize,
    pub bias: usize,
    pub o: usize,
}

/// Offsets of sequence `(query_start, key_start)` inside packed tensors, as the
/// tile kernel computes them on the device.
///
/// A row-major V (feature contiguous) is offset by `key_start * stride_v`; a
/// transposed V has the key axis innermost, so it moves by `key_start` alone.
pub fn group_mode_offsets(
    query_start: usize,
    key_start: usize,
    stride_q: usize,
    stride_k: usize,
    stride_v: usize,
    stride_o: usize,
    v_row_major: bool,
) -> BatchOffsets {
    BatchOffsets {
        q: query_start * stride_q,
        k: key_start * stride_k,
        v: if v_row_major {
            key_start * stride_v
        } else {
            key_start
        },
        bias: 0,
        o: query_start * stride_o,
    }
}
