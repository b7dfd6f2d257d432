//! Runtime-to-static dispatch table.
//!
//! Every kernel instance the crate can launch is a monomorphized function reached
//! through one cell of this registry. Cells are generated as a bounded cross
//! product over the element types and the mask/bias/gradient-precision axes, and
//! each cell records the key it was built from, so a lookup that lands on the
//! wrong specialization is detectable.

use super::headdim::{
    select_transfer_vectors, HeadDimBucket, TileHeadDim, B1_MAX_VECTOR_BATCHED,
    B1_MAX_VECTOR_GROUPED,
};
use super::mask::CustomMaskType;
use crate::error::{Error, Result};
use crate::ops::device_op::{run_device_op, DeviceMhaBwdXdl, DeviceMhaFwdXdl, DeviceOp, ProblemMode};
use crate::ops::layout::{
    batched_backward_problem, batched_forward_problem, grouped_backward_problems,
    grouped_forward_problems,
};
use crate::ops::params::{
    BatchedBackwardParams, BatchedForwardParams, GroupedBackwardParams, GroupedForwardParams,
};
use crate::ops::tile::{FmhaFwdKernel, FmhaShapeHdim128, FmhaShapeHdim64, RowMajor, TileShape};
use crate::runtime::StreamConfig;
use crate::tensor::{DType, Device, Element};
use half::{bf16, f16};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Element types with compiled instances.
pub const SUPPORTED_DTYPES: [DType; 2] = [DType::F16, DType::BF16];

fn check_dtype(dtype: DType) -> Result<()> {
    if SUPPORTED_DTYPES.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::UnmappedDispatchValue {
            what: "input data-type is not supported",
            value: dtype.to_string(),
        })
    }
}

fn unregistered(key: impl std::fmt::Debug) -> Error {
    Error::UnmappedDispatchValue {
        what: "no kernel instance registered",
        value: format!("{key:?}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub dtype: DType,
    pub mask: CustomMaskType,
    pub has_bias: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackwardKey {
    pub dtype: DType,
    pub mask: CustomMaskType,
    pub has_bias: bool,
    pub fp32_grad: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub dtype: DType,
    pub head_dim: TileHeadDim,
    pub masked: bool,
    pub local: bool,
    pub has_bias: bool,
}

impl TileKey {
    /// Window size selects the local-mask instance; a causal mask without a window
    /// uses the plain masked one.
    pub fn new(
        dtype: DType,
        head_dim: TileHeadDim,
        mask: CustomMaskType,
        window_size: usize,
        has_bias: bool,
    ) -> Self {
        let (masked, local) = if window_size > 0 {
            (true, true)
        } else if mask != CustomMaskType::NoMask {
            (true, false)
        } else {
            (false, false)
        };
        Self {
            dtype,
            head_dim,
            masked,
            local,
            has_bias,
        }
    }
}

pub type BatchedForwardFn = fn(&BatchedForwardParams, &StreamConfig<'_>, Device) -> Result<()>;
pub type GroupedForwardFn = fn(&GroupedForwardParams, &StreamConfig<'_>, Device) -> Result<()>;
pub type BatchedBackwardFn = fn(&BatchedBackwardParams, &StreamConfig<'_>, Device) -> Result<()>;
pub type GroupedBackwardFn = fn(&GroupedBackwardParams, &StreamConfig<'_>, Device) -> Result<()>;
pub type BatchedInferFn = fn(&BatchedForwardParams, &StreamConfig<'_>) -> Result<()>;
pub type GroupedInferFn = fn(&GroupedForwardParams, &StreamConfig<'_>) -> Result<()>;

#[derive(Clone, Copy)]
pub struct ForwardEntry {
    pub key: ForwardKey,
    pub batched: BatchedForwardFn,
    pub grouped: GroupedForwardFn,
}

#[derive(Clone, Copy)]
pub struct BackwardEntry {
    pub key: BackwardKey,
    pub batched: BatchedBackwardFn,
    pub grouped: GroupedBackwardFn,
}

#[derive(Clone, Copy)]
pub struct TileEntry {
    pub key: TileKey,
    pub batched: BatchedInferFn,
    pub grouped: GroupedInferFn,
}

// ---------------------------------------------------------------------------
// Device-op cells
// ---------------------------------------------------------------------------

fn forward_op<T: Element, const MASK: u8, const BIAS: bool>(
    mode: ProblemMode,
    k: usize,
    kv: usize,
) -> DeviceMhaFwdXdl<T, MASK, BIAS> {
    let cap = match mode {
        ProblemMode::Batched => B1_MAX_VECTOR_BATCHED,
        ProblemMode::Grouped => B1_MAX_VECTOR_GROUPED,
    };
    let bucket = HeadDimBucket::select(k, kv);
    let vectors = select_transfer_vectors(bucket, k, kv, cap);
    tracing::debug!(?mode, ?bucket, ?vectors, "selected forward head-dim bucket");
    DeviceMhaFwdXdl::new(mode, bucket, vectors)
}

fn run_batched_forward<T: Element, const MASK: u8, const BIAS: bool>(
    p: &BatchedForwardParams,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let op = forward_op::<T, MASK, BIAS>(ProblemMode::Batched, p.k, p.kv);
    let arg = op.make_argument(vec![batched_forward_problem(p)], p.scale, p.dropout);
    run_device_op(&op, arg, config, device)
}

fn run_grouped_forward<T: Element, const MASK: u8, const BIAS: bool>(
    p: &GroupedForwardParams,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let op = forward_op::<T, MASK, BIAS>(ProblemMode::Grouped, p.k, p.kv);
    let arg = op.make_argument(grouped_forward_problems(p)?, p.scale, p.dropout);
    run_device_op(&op, arg, config, device)
}

fn backward_op<T: Element, const MASK: u8, const BIAS: bool, const FP32: bool>(
    mode: ProblemMode,
    k: usize,
    kv: usize,
) -> DeviceMhaBwdXdl<T, MASK, BIAS, FP32> {
    let cap = match mode {
        ProblemMode::Batched => B1_MAX_VECTOR_BATCHED,
        ProblemMode::Grouped => B1_MAX_VECTOR_GROUPED,
    };
    let bucket = HeadDimBucket::select(k, kv);
    let vectors = select_transfer_vectors(bucket, k, kv, cap);
    tracing::debug!(?mode, ?bucket, ?vectors, "selected backward head-dim bucket");
    DeviceMhaBwdXdl::new(mode, bucket, vectors)
}

fn run_batched_backward<T: Element, const MASK: u8, const BIAS: bool, const FP32: bool>(
    p: &BatchedBackwardParams,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let op = backward_op::<T, MASK, BIAS, FP32>(ProblemMode::Batched, p.k, p.kv);
    let arg = op.make_argument(vec![batched_backward_problem(p)], p.scale, p.dropout);
    run_device_op(&op, arg, config, device)
}

fn run_grouped_backward<T: Element, const MASK: u8, const BIAS: bool, const FP32: bool>(
    p: &GroupedBackwardParams,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let op = backward_op::<T, MASK, BIAS, FP32>(ProblemMode::Grouped, p.k, p.kv);
    let arg = op.make_argument(grouped_backward_problems(p)?, p.scale, p.dropout);
    run_device_op(&op, arg, config, device)
}

fn forward_entry<T: Element, const MASK: u8, const BIAS: bool>() -> ForwardEntry {
    ForwardEntry {
        key: ForwardKey {
            dtype: T::DTYPE,
            mask: DeviceMhaFwdXdl::<T, MASK, BIAS>::mask_type(),
            has_bias: BIAS,
        },
        batched: run_batched_forward::<T, MASK, BIAS>,
        grouped: run_grouped_forward::<T, MASK, BIAS>,
    }
}

fn backward_entry<T: Element, const MASK: u8, const BIAS: bool, const FP32: bool>(
) -> BackwardEntry {
    BackwardEntry {
        key: BackwardKey {
            dtype: T::DTYPE,
            mask: DeviceMhaBwdXdl::<T, MASK, BIAS, FP32>::mask_type(),
            has_bias: BIAS,
            fp32_grad: FP32,
        },
        batched: run_batched_backward::<T, MASK, BIAS, FP32>,
        grouped: run_grouped_backward::<T, MASK, BIAS, FP32>,
    }
}

fn forward_entries<T: Element>() -> [ForwardEntry; 6] {
    [
        forward_entry::<T, 0, false>(),
        forward_entry::<T, 0, true>(),
        forward_entry::<T, 1, false>(),
        forward_entry::<T, 1, true>(),
        forward_entry::<T, 2, false>(),
        forward_entry::<T, 2, true>(),
    ]
}

fn backward_entries<T: Element>() -> [BackwardEntry; 12] {
    [
        backward_entry::<T, 0, false, false>(),
        backward_entry::<T, 0, false, true>(),
        backward_entry::<T, 0, true, false>(),
        backward_entry::<T, 0, true, true>(),
        backward_entry::<T, 1, false, false>(),
        backward_entry::<T, 1, false, true>(),
        backward_entry::<T, 1, true, false>(),
        backward_entry::<T, 1, true, true>(),
        backward_entry::<T, 2, false, false>(),
        backward_entry::<T, 2, false, true>(),
        backward_entry::<T, 2, true, false>(),
        backward_entry::<T, 2, true, true>(),
    ]
}

// ---------------------------------------------------------------------------
// Tile-kernel cells
// ---------------------------------------------------------------------------

fn tile_head_dim<S: TileShape>() -> TileHeadDim {
    if S::TILE.n1 <= 64 {
        TileHeadDim::Hdim64
    } else {
        TileHeadDim::Hdim128
    }
}

/// The tile kernel reads bias rows with unit column stride.
fn check_tile_bias(
    instance: impl FnOnce() -> String,
    strides: [usize; 4],
    n: usize,
    has_bias: bool,
) -> Result<()> {
    if has_bias && n > 1 && strides[3] != 1 {
        return Err(Error::UnsupportedConfiguration {
            instance: instance(),
            reason: format!("bias column stride is {}, expected 1", strides[3]),
        });
    }
    Ok(())
}

fn run_batched_infer<
    T: Element,
    S: TileShape,
    const MASK: bool,
    const LOCAL: bool,
    const BIAS: bool,
>(
    p: &BatchedForwardParams,
    config: &StreamConfig<'_>,
) -> Result<()> {
    check_tile_bias(
        FmhaFwdKernel::<T, S, RowMajor, MASK, LOCAL, BIAS>::type_string,
        p.attn_bias_strides,
        p.n,
        p.has_attn_bias(),
    )?;
    let kargs = FmhaFwdKernel::<T, S, RowMajor, MASK, LOCAL, BIAS>::make_kargs_batch(p);
    let grid = FmhaFwdKernel::<T, S, RowMajor, MASK, LOCAL, BIAS>::grid_size(p.b, p.hq, p.m, p.kv);
    FmhaFwdKernel::<T, S, RowMajor, MASK, LOCAL, BIAS>::launch(config, kargs, grid)
}

fn run_grouped_infer<
    T: Element,
    S: TileShape,
    const MASK: bool,
    const LOCAL: bool,
    const BIAS: bool,
>(
    p: &GroupedForwardParams,
    config: &StreamConfig<'_>,
) -> Result<()> {
    let kargs = FmhaFwdKernel::<T, S, RowMajor, MASK, LOCAL, BIAS>::make_kargs_group(p);
    let grid = FmhaFwdKernel::<T, S, RowMajor, MASK, LOCAL, BIAS>::grid_size(
        p.num_batches,
        p.hq,
        p.max_seqlen_q,
        p.kv,
    );
    FmhaFwdKernel::<T, S, RowMajor, MASK, LOCAL, BIAS>::launch(config, kargs, grid)
}

fn tile_entry<T: Element, S: TileShape, const MASK: bool, const LOCAL: bool, const BIAS: bool>(
) -> TileEntry {
    TileEntry {
        key: TileKey {
            dtype: T::DTYPE,
            head_dim: tile_head_dim::<S>(),
            masked: MASK,
            local: LOCAL,
            has_bias: BIAS,
        },
        batched: run_batched_infer::<T, S, MASK, LOCAL, BIAS>,
        grouped: run_grouped_infer::<T, S, MASK, LOCAL, BIAS>,
    }
}

fn tile_entries_for_shape<T: Element, S: TileShape>() -> [TileEntry; 6] {
    [
        tile_entry::<T, S, false, false, false>(),
        tile_entry::<T, S, false, false, true>(),
        tile_entry::<T, S, true, false, false>(),
        tile_entry::<T, S, true, false, true>(),
        tile_entry::<T, S, true, true, false>(),
        tile_entry::<T, S, true, true, true>(),
    ]
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    forward: HashMap<ForwardKey, ForwardEntry>,
    backward: HashMap<BackwardKey, BackwardEntry>,
    tile: HashMap<TileKey, TileEntry>,
}

impl Registry {
    fn build() -> Self {
        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        let mut tile = HashMap::new();

        let forward_cells = forward_entries::<f16>().into_iter().chain(forward_entries::<bf16>());
        for entry in forward_cells {
            forward.insert(entry.key, entry);
        }
        let backward_cells = backward_entries::<f16>()
            .into_iter()
            .chain(backward_entries::<bf16>());
        for entry in backward_cells {
            backward.insert(entry.key, entry);
        }
        let tile_cells = tile_entries_for_shape::<f16, FmhaShapeHdim64>()
            .into_iter()
            .chain(tile_entries_for_shape::<f16, FmhaShapeHdim128>())
            .chain(tile_entries_for_shape::<bf16, FmhaShapeHdim64>())
            .chain(tile_entries_for_shape::<bf16, FmhaShapeHdim128>());
        for entry in tile_cells {
            tile.insert(entry.key, entry);
        }

        tracing::debug!(
            forward = forward.len(),
            backward = backward.len(),
            tile = tile.len(),
            "built fmha dispatch registry"
        );
        Self { forward, backward, tile }
    }

    /// Process-wide registry, built on first use.
    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::build)
    }

    pub fn forward(&self, key: ForwardKey) -> Result<&ForwardEntry> {
        check_dtype(key.dtype)?;
        self.forward.get(&key).ok_or_else(|| unregistered(key))
    }

    pub fn backward(&self, key: BackwardKey) -> Result<&BackwardEntry> {
        check_dtype(key.dtype)?;
        self.backward.get(&key).ok_or_else(|| unregistered(key))
    }

    pub fn tile(&self, key: TileKey) -> Result<&TileEntry> {
        check_dtype(key.dtype)?;
        self.tile.get(&key).ok_or_else(|| unregistered(key))
    }

    pub fn forward_keys(&self) -> impl Iterator<Item = &ForwardKey> {
        self.forward.keys()
    }

    pub fn backward_keys(&self) -> impl Iterator<Item = &BackwardKey> {
        self.backward.keys()
    }

    pub fn tile_keys(&self) -> impl Iterator<Item = &TileKey> {
        self.tile.keys()
    }
}

/// Type string of the device-op instance a forward key selects, for diagnostics.
pub fn forward_instance_name(
    key: ForwardKey,
    mode: ProblemMode,
    k: usize,
    kv: usize,
) -> Result<String> {
    check_dtype(key.dtype)?;
    macro_rules! name {
        ($t:ty) => {
            match (key.mask, key.has_bias) {
                (CustomMaskType::NoMask, false) => {
                    forward_op::<$t, 0, false>(mode, k, kv).type_string()
                }
                (CustomMaskType::NoMask, true) => {
                    forward_op::<$t, 0, true>(mode, k, kv).type_string()
                }
                (CustomMaskType::CausalFromTopLeft, false) => {
                    forward_op::<$t, 1, false>(mode, k, kv).type_string()
                }
                (CustomMaskType::CausalFromTopLeft, true) => {
                    forward_op::<$t, 1, true>(mode, k, kv).type_string()
                }
                (CustomMaskType::CausalFromBottomRight, false) => {
                    forward_op::<$t, 2, false>(mode, k, kv).type_string()
                }
                (CustomMaskType::CausalFromBottomRight, true) => {
                    forward_op::<$t, 2, true>(mode, k, kv).type_string()
                }
            }
        };
    }
    Ok(match key.dtype {
        DType::BF16 => name!(bf16),
        _ => name!(f16),
    })
}
