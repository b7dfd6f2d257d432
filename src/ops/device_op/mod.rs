//! GEMM-based device ops.
//!
//! A device op is a configured kernel instance. Launching one follows a fixed
//! protocol: build an argument from problem descriptors, ask for the scratch size,
//! attach a workspace, run the instance's own feasibility check and only then hand
//! the argument to an invoker, which enqueues the job on the stream and returns.
//!
//! Grouped instances keep a table of `[block_start, block_end)` ranges, one per
//! problem, in their workspace; each block finds its problem by binary search.

pub mod bwd;
pub mod fwd;

pub use bwd::DeviceMhaBwdXdl;
pub use fwd::DeviceMhaFwdXdl;

use crate::error::{Error, Result};
use crate::ops::tile::{Tile, ViewDesc};
use crate::runtime::{SimpleDeviceMem, StreamConfig};
use crate::tensor::{DType, Device, DevicePtr, Element, Storage};
use half::{bf16, f16};
use std::fmt;
use std::sync::Arc;

/// Batched instances run one problem whose first group axis is the batch;
/// grouped instances run one problem per packed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProblemMode {
    Batched,
    Grouped,
}

impl fmt::Display for ProblemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProblemMode::Batched => f.write_str("Batched"),
            ProblemMode::Grouped => f.write_str("Grouped"),
        }
    }
}

pub trait DeviceOp: Sized {
    type Argument: Send + 'static;

    /// Human-readable name of the instance, including its specialization.
    fn type_string(&self) -> String;

    fn workspace_size(&self, arg: &Self::Argument) -> usize;

    fn set_workspace_pointer(&self, arg: &mut Self::Argument, workspace: Option<DevicePtr>);

    /// Why this instance cannot run `arg`, if it cannot.
    fn check_argument(&self, arg: &Self::Argument) -> std::result::Result<(), String>;

    fn is_supported_argument(&self, arg: &Self::Argument) -> bool {
        self.check_argument(arg).is_ok()
    }

    /// Enqueue the kernel. Callers go through [`Invoker::run`].
    fn launch(&self, arg: Self::Argument, config: &StreamConfig<'_>) -> Result<()>;

    fn make_invoker(&self) -> Invoker<'_, Self> {
        Invoker { op: self }
    }
}

pub struct Invoker<'a, Op: DeviceOp> {
    op: &'a Op,
}

impl<Op: DeviceOp> Invoker<'_, Op> {
    /// Returns once the work is queued.
    pub fn run(&self, arg: Op::Argument, config: &StreamConfig<'_>) -> Result<()> {
        self.op.launch(arg, config)
    }
}

/// Allocate the workspace, check feasibility and invoke.
///
/// The workspace owner is dropped on return; the queued job holds its own handle,
/// so the memory outlives the kernel that reads it.
pub fn run_device_op<Op: DeviceOp>(
    op: &Op,
    mut arg: Op::Argument,
    config: &StreamConfig<'_>,
    device: Device,
) -> Result<()> {
    let size = op.workspace_size(&arg);
    let workspace = SimpleDeviceMem::new(size, device);
    op.set_workspace_pointer(&mut arg, workspace.device_buffer());

    if let Err(reason) = op.check_argument(&arg) {
        return Err(Error::UnsupportedConfiguration {
            instance: op.type_string(),
            reason,
        });
    }

    tracing::debug!(
        instance = %op.type_string(),
        workspace_bytes = size,
        "invoking device op"
    );
    op.make_invoker().run(arg, config)
}

/// Per-problem block ranges of a grouped launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    ranges: Vec<(u32, u32)>,
}

impl BlockTable {
    pub fn from_counts(counts: impl IntoIterator<Item = usize>) -> Self {
        let mut start = 0u32;
        let ranges = counts
            .into_iter()
            .map(|count| {
                let end = start + count as u32;
                let range = (start, end);
                start = end;
                range
            })
            .collect();
        Self { ranges }
    }

    pub fn num_groups(&self) -> usize {
        self.ranges.len()
    }

    pub fn total_blocks(&self) -> usize {
        self.ranges.last().map_or(0, |&(_, end)| end as usize)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.ranges.len() * 8
    }

    /// Little-endian `(start, end)` pairs, as the kernel reads them.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.ranges
            .iter()
            .flat_map(|&(start, end)| {
                let mut pair = [0u8; 8];
                pair[..4].copy_from_slice(&(start as i32).to_le_bytes());
                pair[4..].copy_from_slice(&(end as i32).to_le_bytes());
                pair
            })
            .collect()
    }
}

fn table_entry(table: &[u8], i: usize) -> i32 {
    let at = i * 4;
    i32::from_le_bytes([table[at], table[at + 1], table[at + 2], table[at + 3]])
}

/// Group owning `block_id` and the block's index inside it, from the serialized
/// table of `num_groups` ranges.
pub fn locate_block(table: &[u8], num_groups: usize, block_id: usize) -> Result<(usize, usize)> {
    if table.len() < num_groups * 8 {
        return Err(Error::DeviceFault {
            reason: format!("block table holds {} bytes, need {}", table.len(), num_groups * 8),
        });
    }
    let id = block_id as i32;
    let (mut lo, mut hi) = (0usize, num_groups);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if id < table_entry(table, 2 * mid) {
            hi = mid;
        } else if id >= table_entry(table, 2 * mid + 1) {
            lo = mid + 1;
        } else {
            return Ok((mid, (id - table_entry(table, 2 * mid)) as usize));
        }
    }
    Err(Error::DeviceFault {
        reason: format!("block {block_id} is outside every group"),
    })
}

/// A finished tile waiting to be written back.
pub(crate) struct TileStore {
    pub storage: Arc<Storage>,
    pub desc: ViewDesc,
    pub origin: [usize; 2],
    pub tile: Tile,
    pub accumulate: bool,
}

impl TileStore {
    pub fn new(ptr: &DevicePtr, desc: ViewDesc, origin: [usize; 2], tile: Tile) -> Self {
        Self {
            storage: Arc::clone(ptr.storage()),
            desc,
            origin,
            tile,
            accumulate: false,
        }
    }

    pub fn accumulating(mut self) -> Self {
        self.accumulate = true;
        self
    }
}

fn store_as(dtype: DType, bytes: &mut [u8], s: &TileStore) -> Result<()> {
    match dtype {
        DType::F16 => s.desc.store::<f16>(bytes, s.origin, &s.tile, s.accumulate),
        DType::BF16 => s.desc.store::<bf16>(bytes, s.origin, &s.tile, s.accumulate),
        DType::F32 => s.desc.store::<f32>(bytes, s.origin, &s.tile, s.accumulate),
        DType::I32 => {
            return Err(Error::DeviceFault {
                reason: "tile store into an i32 allocation".into(),
            })
        }
    }
    Ok(())
}

/// Write tiles back, holding one storage's write lock at a time. Stores to the
/// same storage are applied in the order given.
pub(crate) fn scatter(mut stores: Vec<TileStore>) -> Result<()> {
    stores.sort_by_key(|s| s.storage.id());
    for run in stores.chunk_by(|a, b| a.storage.id() == b.storage.id()) {
        let storage = &run[0].storage;
        let dtype = storage.dtype();
        let mut bytes = storage.write()?;
        let capacity = bytes.len() / dtype.size_in_bytes();
        for s in run {
            s.desc.check(capacity, "output")?;
            store_as(dtype, &mut bytes, s)?;
        }
    }
    Ok(())
}

/// Copy `bytes` into the workspace at `ptr`.
pub(crate) fn upload(ptr: &DevicePtr, bytes: &[u8]) -> Result<()> {
    let mut dst = ptr.storage().write()?;
    let at = ptr.byte_offset();
    if at + bytes.len() > dst.len() {
        return Err(Error::DeviceFault {
            reason: format!("upload of {} bytes overruns the workspace", bytes.len()),
        });
    }
    dst[at..at + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Element type check shared by the feasibility checks.
pub(crate) fn expect_dtype(
    ptr: &DevicePtr,
    dtype: DType,
    what: &str,
) -> std::result::Result<(), String> {
    let found = ptr.storage().dtype();
    if found != dtype {
        return Err(format!("{what} is {found}, instance expects {dtype}"));
    }
    Ok(())
}

pub(crate) fn expect_element<T: Element>(
    ptr: &DevicePtr,
    what: &str,
) -> std::result::Result<(), String> {
    expect_dtype(ptr, T::DTYPE, what)
}

/// Innermost axis of a `[rows, cols]` operand must be unit-stride unless it is a
/// single element wide.
pub(crate) fn expect_unit_stride(
    len: usize,
    stride: usize,
    what: &str,
) -> std::result::Result<(), String> {
    if len > 1 && stride != 1 {
        return Err(format!("{what} innermost stride is {stride}, expected 1"));
    }
    Ok(())
}

/// Every outer stride of an operand must be a multiple of its transfer vector.
pub(crate) fn expect_vector_aligned(
    strides: &[usize],
    vector: usize,
    what: &str,
) -> std::result::Result<(), String> {
    if let Some(bad) = strides.iter().find(|&&s| s % vector != 0) {
        return Err(format!("{what} stride {bad} is not a multiple of vector width {vector}"));
    }
    Ok(())
}
