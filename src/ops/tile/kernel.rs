//! Forward tile kernel: argument packing, per-block addressing and launch.
//!
//! One kernel type per `(element, tile shape, V layout, mask, local, bias)`
//! combination. Batch-mode blocks offset by fixed batch strides; group-mode blocks
//! read their sequence bounds from the device-resident prefix sums and return
//! early when their query tile lies past the end of the sequence.

use super::mask::GenericAttentionMask;
use super::partitioner::{FmhaFwdTilePartitioner, GridSize};
use super::pipeline::{BlockFmhaPipelineQrKsVs, BlockTile, FwdBlockInputs};
use super::view::{load_i32, typed_origin, TensorView, Tile, ViewDesc};
use crate::error::{Error, Result};
use crate::ops::dispatch::CustomMaskType;
use crate::ops::layout::{group_mode_offsets, BatchOffsets};
use crate::ops::params::{BatchedForwardParams, GroupedForwardParams};
use crate::runtime::{ReadSet, StreamConfig};
use crate::tensor::{DevicePtr, Element, Storage};
use rayon::prelude::*;
use std::f32::consts::LOG2_E;
use std::marker::PhantomData;

/// Compile-time tile shape of one head-dim instance.
pub trait TileShape: Send + Sync + 'static {
    const NAME: &'static str;
    const TILE: BlockTile;
}

pub struct FmhaShapeHdim64;

impl TileShape for FmhaShapeHdim64 {
    const NAME: &'static str = "hdim64";
    const TILE: BlockTile = BlockTile {
        m0: 128,
        n0: 64,
        k0: 32,
        n1: 64,
        k1: 32,
    };
}

pub struct FmhaShapeHdim128;

impl TileShape for FmhaShapeHdim128 {
    const NAME: &'static str = "hdim128";
    const TILE: BlockTile = BlockTile {
        m0: 128,
        n0: 128,
        k0: 32,
        n1: 128,
        k1: 32,
    };
}

/// Storage order of V. Row-major is `[seqlen_k, hdim_v]` with features contiguous;
/// column-major is `[hdim_v, seqlen_k]` with keys contiguous.
pub trait VLayout: Send + Sync + 'static {
    const ROW_MAJOR: bool;
    const NAME: &'static str;
}

pub struct RowMajor;

impl VLayout for RowMajor {
    const ROW_MAJOR: bool = true;
    const NAME: &'static str = "row";
}

pub struct ColumnMajor;

impl VLayout for ColumnMajor {
    const ROW_MAJOR: bool = false;
    const NAME: &'static str = "col";
}

/// Arguments shared by both modes. Strides are in elements; `stride_*` is the
/// sequence stride, `nhead_stride_*` the head stride.
#[derive(Debug, Clone)]
pub struct FmhaFwdCommonKargs {
    pub q_ptr: DevicePtr,
    pub k_ptr: DevicePtr,
    pub v_ptr: DevicePtr,
    pub o_ptr: DevicePtr,
    pub hdim_q: usize,
    pub hdim_v: usize,
    /// `nhead_q / nhead_k`; above 1 for multi-query and grouped-query heads.
    pub nhead_ratio_qk: usize,
    /// Softmax scale premultiplied by `log2(e)`.
    pub scale: f32,
    pub stride_q: usize,
    pub stride_k: usize,
    pub stride_v: usize,
    pub stride_o: usize,
    pub nhead_stride_q: usize,
    pub nhead_stride_k: usize,
    pub nhead_stride_v: usize,
    pub nhead_stride_o: usize,
}

#[derive(Debug, Clone)]
pub struct FmhaFwdBiasKargs {
    pub bias_ptr: DevicePtr,
    pub stride_bias: usize,
    pub nhead_stride_bias: usize,
    /// Unused in group mode.
    pub batch_stride_bias: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct FmhaFwdMaskKargs {
    pub mask_type: CustomMaskType,
    pub window_size: usize,
}

#[derive(Debug, Clone)]
pub enum FmhaFwdModeKargs {
    Batch {
        seqlen_q: usize,
        seqlen_k: usize,
        batch_stride_q: usize,
        batch_stride_k: usize,
        batch_stride_v: usize,
        batch_stride_o: usize,
    },
    Group {
        seqstart_q_ptr: DevicePtr,
        seqstart_k_ptr: DevicePtr,
        seqlen_k_ptr: Option<DevicePtr>,
    },
}

#[derive(Debug, Clone)]
pub struct FmhaFwdKargs {
    pub common: FmhaFwdCommonKargs,
    pub bias: Option<FmhaFwdBiasKargs>,
    pub mask: Option<FmhaFwdMaskKargs>,
    pub mode: FmhaFwdModeKargs,
}

impl FmhaFwdKargs {
    fn read_storages(&self) -> Vec<&Storage> {
        let c = &self.common;
        let mut storages = vec![&**c.q_ptr.storage(), &**c.k_ptr.storage(), &**c.v_ptr.storage()];
        if let Some(bias) = &self.bias {
            storages.push(bias.bias_ptr.storage());
        }
        if let FmhaFwdModeKargs::Group {
            seqstart_q_ptr,
            seqstart_k_ptr,
            seqlen_k_ptr,
        } = &self.mode
        {
            storages.push(seqstart_q_ptr.storage());
            storages.push(seqstart_k_ptr.storage());
            if let Some(ptr) = seqlen_k_ptr {
                storages.push(ptr.storage());
            }
        }
        storages
    }
}

/// One block's finished output tile and where it goes.
struct BlockResult {
    o_desc: ViewDesc,
    origin: [usize; 2],
    tile: Tile,
}

pub struct FmhaFwdKernel<T, S, L, const MASK: bool, const LOCAL: bool, const BIAS: bool> {
    _marker: PhantomData<fn() -> (T, S, L)>,
}

impl<T, S, L, const MASK: bool, const LOCAL: bool, const BIAS: bool>
    FmhaFwdKernel<T, S, L, MASK, LOCAL, BIAS>
where
    T: Element,
    S: TileShape,
    L: VLayout,
{
    pub fn type_string() -> String {
        format!(
            "FmhaFwdKernel<{}, {}, v_{}, mask={}, local={}, bias={}>",
            T::DTYPE,
            S::NAME,
            L::NAME,
            MASK,
            LOCAL,
            BIAS
        )
    }

    fn partitioner() -> FmhaFwdTilePartitioner {
        FmhaFwdTilePartitioner::new(S::TILE.m0, S::TILE.n1)
    }

    pub fn grid_size(batch_size: usize, nhead: usize, seqlen_q: usize, hdim_v: usize) -> GridSize {
        Self::partitioner().grid_size(batch_size, nhead, seqlen_q, hdim_v)
    }

    fn mask_kargs(mask_type: CustomMaskType, window_size: usize) -> Option<FmhaFwdMaskKargs> {
        MASK.then_some(FmhaFwdMaskKargs {
            mask_type,
            window_size: if LOCAL { window_size } else { 0 },
        })
    }

    pub fn make_kargs_batch(p: &BatchedForwardParams) -> FmhaFwdKargs {
        FmhaFwdKargs {
            common: FmhaFwdCommonKargs {
                q_ptr: p.q_ptr.clone(),
                k_ptr: p.k_ptr.clone(),
                v_ptr: p.v_ptr.clone(),
                o_ptr: p.out_ptr.clone(),
                hdim_q: p.k,
                hdim_v: p.kv,
                nhead_ratio_qk: p.hq / p.hkv,
                scale: p.scale * LOG2_E,
                stride_q: p.q_strides[1],
                stride_k: p.k_strides[1],
                stride_v: p.v_strides[1],
                stride_o: p.out_strides[1],
                nhead_stride_q: p.q_strides[2],
                nhead_stride_k: p.k_strides[2],
                nhead_stride_v: p.v_strides[2],
                nhead_stride_o: p.out_strides[2],
            },
            bias: match (&p.attn_bias_ptr, BIAS) {
                (Some(ptr), true) => Some(FmhaFwdBiasKargs {
                    bias_ptr: ptr.clone(),
                    stride_bias: p.attn_bias_strides[2],
                    nhead_stride_bias: p.attn_bias_strides[1],
                    batch_stride_bias: p.attn_bias_strides[0],
                }),
                _ => None,
            },
            mask: Self::mask_kargs(p.custom_mask_type, p.window_size),
            mode: FmhaFwdModeKargs::Batch {
                seqlen_q: p.m,
                seqlen_k: p.n,
                batch_stride_q: p.q_strides[0],
                batch_stride_k: p.k_strides[0],
                batch_stride_v: p.v_strides[0],
                batch_stride_o: p.out_strides[0],
            },
        }
    }

    pub fn make_kargs_group(p: &GroupedForwardParams) -> FmhaFwdKargs {
        FmhaFwdKargs {
            common: FmhaFwdCommonKargs {
                q_ptr: p.q_ptr.clone(),
                k_ptr: p.k_ptr.clone(),
                v_ptr: p.v_ptr.clone(),
                o_ptr: p.out_ptr.clone(),
                hdim_q: p.k,
                hdim_v: p.kv,
                nhead_ratio_qk: p.hq / p.hkv,
                scale: p.scale * LOG2_E,
                stride_q: p.q_strides[0],
                stride_k: p.k_strides[0],
                stride_v: p.v_strides[0],
                stride_o: p.out_strides[0],
                nhead_stride_q: p.q_strides[1],
                nhead_stride_k: p.k_strides[1],
                nhead_stride_v: p.v_strides[1],
                nhead_stride_o: p.out_strides[1],
            },
            bias: None,
            mask: Self::mask_kargs(p.custom_mask_type, p.window_size),
            mode: FmhaFwdModeKargs::Group {
                seqstart_q_ptr: p.seqstart_q_dev_ptr.clone(),
                seqstart_k_ptr: p.seqstart_k_dev_ptr.clone(),
                seqlen_k_ptr: p.seqlen_k_dev_ptr.clone(),
            },
        }
    }

    /// Resolve the block's sequence lengths and base offsets. `None` when the block
    /// has nothing to do.
    fn batch_geometry(
        kargs: &FmhaFwdKargs,
        reads: &ReadSet<'_>,
        i_batch: usize,
        i_m0: usize,
    ) -> Result<Option<(usize, usize, BatchOffsets)>> {
        let c = &kargs.common;
        match &kargs.mode {
            FmhaFwdModeKargs::Batch {
                seqlen_q,
                seqlen_k,
                batch_stride_q,
                batch_stride_k,
                batch_stride_v,
                batch_stride_o,
            } => Ok(Some((
                *seqlen_q,
                *seqlen_k,
                BatchOffsets {
                    q: i_batch * batch_stride_q,
                    k: i_batch * batch_stride_k,
                    v: i_batch * batch_stride_v,
                    bias: kargs.bias.as_ref().map_or(0, |b| i_batch * b.batch_stride_bias),
                    o: i_batch * batch_stride_o,
                },
            ))),
            FmhaFwdModeKargs::Group {
                seqstart_q_ptr,
                seqstart_k_ptr,
                seqlen_k_ptr,
            } => {
                let sq = reads.bytes(seqstart_q_ptr.storage())?;
                let sk = reads.bytes(seqstart_k_ptr.storage())?;
                let query_start = load_i32(sq, seqstart_q_ptr, i_batch, "seqstart_q")?;
                let query_end = load_i32(sq, seqstart_q_ptr, i_batch + 1, "seqstart_q")?;
                let key_start = load_i32(sk, seqstart_k_ptr, i_batch, "seqstart_k")?;
                let seqlen_k = match seqlen_k_ptr {
                    Some(ptr) => load_i32(reads.bytes(ptr.storage())?, ptr, i_batch, "seqlen_k")?,
                    None => load_i32(sk, seqstart_k_ptr, i_batch + 1, "seqstart_k")? - key_start,
                };
                let seqlen_q = query_end - query_start;
                if query_start < 0 || key_start < 0 || seqlen_q < 0 || seqlen_k < 0 {
                    return Err(Error::DeviceFault {
                        reason: format!("sequence {i_batch} has a negative offset or length"),
                    });
                }
                let seqlen_q = seqlen_q as usize;
                if seqlen_q <= i_m0 {
                    return Ok(None);
                }
                let offsets = group_mode_offsets(
                    query_start as usize,
                    key_start as usize,
                    c.stride_q,
                    c.stride_k,
                    c.stride_v,
                    c.stride_o,
                    L::ROW_MAJOR,
                );
                Ok(Some((seqlen_q, seqlen_k as usize, offsets)))
            }
        }
    }

    fn run_block(
        kargs: &FmhaFwdKargs,
        reads: &ReadSet<'_>,
        block: [usize; 3],
    ) -> Result<Option<BlockResult>> {
        let tile = S::TILE;
        let c = &kargs.common;
        let coord = Self::partitioner().coord(block, c.hdim_v);
        let i_m0 = coord.i_tile_m * tile.m0;
        let i_n1 = coord.i_tile_n * tile.n1;
        let geometry = Self::batch_geometry(kargs, reads, coord.i_batch, i_m0)?;
        let Some((seqlen_q, seqlen_k, off)) = geometry else {
            return Ok(None);
        };
        let i_nhead = coord.i_nhead;
        let i_nhead_k = i_nhead / c.nhead_ratio_qk.max(1);

        let q_origin = typed_origin::<T>(&c.q_ptr, "q")? + i_nhead * c.nhead_stride_q + off.q;
        let k_origin = typed_origin::<T>(&c.k_ptr, "k")? + i_nhead_k * c.nhead_stride_k + off.k;
        let v_origin = typed_origin::<T>(&c.v_ptr, "v")? + i_nhead_k * c.nhead_stride_v + off.v;
        let o_origin = typed_origin::<T>(&c.o_ptr, "o")? + i_nhead * c.nhead_stride_o + off.o;

        let q = TensorView::<T>::new(
            reads.bytes(c.q_ptr.storage())?,
            ViewDesc::new(q_origin, [seqlen_q, c.hdim_q], [c.stride_q, 1]),
            "q",
        )?
        .pad([tile.m0, 1], [true, false]);
        let k = TensorView::<T>::new(
            reads.bytes(c.k_ptr.storage())?,
            ViewDesc::new(k_origin, [seqlen_k, c.hdim_q], [c.stride_k, 1]),
            "k",
        )?
        .pad([tile.n0, 1], [true, false]);
        let v_bytes = reads.bytes(c.v_ptr.storage())?;
        let vt = (if L::ROW_MAJOR {
            TensorView::<T>::new(
                v_bytes,
                ViewDesc::new(v_origin, [seqlen_k, c.hdim_v], [c.stride_v, 1]),
                "v",
            )?
            .transpose()
        } else {
            TensorView::<T>::new(
                v_bytes,
                ViewDesc::new(v_origin, [c.hdim_v, seqlen_k], [c.stride_v, 1]),
                "v",
            )?
        })
        .pad([1, tile.k1], [false, true]);
        let bias = match (&kargs.bias, BIAS) {
            (Some(b), true) => {
                let origin = typed_origin::<T>(&b.bias_ptr, "bias")?
                    + i_nhead * b.nhead_stride_bias
                    + off.bias;
                Some(
                    TensorView::<T>::new(
                        reads.bytes(b.bias_ptr.storage())?,
                        ViewDesc::new(origin, [seqlen_q, seqlen_k], [b.stride_bias, 1]),
                        "bias",
                    )?
                    .pad([tile.m0, tile.n0], [true, true]),
                )
            }
            _ => None,
        };
        let mask = match (&kargs.mask, MASK) {
            (Some(m), true) => {
                GenericAttentionMask::from_mask_type(m.mask_type, m.window_size, seqlen_q, seqlen_k)
            }
            _ => GenericAttentionMask::no_mask(seqlen_k),
        };

        let inputs = FwdBlockInputs {
            q,
            k,
            vt,
            bias,
            mask,
            dropout: None,
            scale: c.scale,
        };
        let out = BlockFmhaPipelineQrKsVs::<true>::new(tile).run(&inputs, i_m0, i_n1);
        Ok(Some(BlockResult {
            o_desc: ViewDesc::new(o_origin, [seqlen_q, c.hdim_v], [c.stride_o, 1]),
            origin: [i_m0, i_n1],
            tile: out.o,
        }))
    }

    fn execute(kargs: &FmhaFwdKargs, grid: GridSize) -> Result<()> {
        let results: Vec<BlockResult> = {
            let reads = ReadSet::lock(kargs.read_storages())?;
            (0..grid.num_blocks())
                .into_par_iter()
                .map(|id| Self::run_block(kargs, &reads, grid.block_index(id)))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect()
        };
        let o_storage = kargs.common.o_ptr.storage();
        let mut bytes = o_storage.write()?;
        let capacity = bytes.len() / T::DTYPE.size_in_bytes();
        for r in &results {
            r.o_desc.check(capacity, "o")?;
            r.o_desc.store::<T>(&mut bytes, r.origin, &r.tile, false);
        }
        Ok(())
    }

    /// Enqueue the kernel; returns once queued.
    pub fn launch(config: &StreamConfig<'_>, kargs: FmhaFwdKargs, grid: GridSize) -> Result<()> {
        tracing::debug!(
            kernel = %Self::type_string(),
            grid = ?grid,
            "launching tile kernel"
        );
        config
            .stream
            .launch_with(config, "fmha_fwd_tile", move || Self::execute(&kargs, grid))
    }
}
