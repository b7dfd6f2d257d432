//! Forward device op: `out = softmax(scale·Q·Kᵗ + bias) · V`, with optional
//! log-sum-exp, dropout and random-value outputs.

use super::{
    expect_element, expect_unit_stride, expect_vector_aligned, locate_block, scatter, upload,
    BlockTable, DeviceOp, ProblemMode, TileStore,
};
use crate::error::{Error, Result};
use crate::ops::dispatch::{CustomMaskType, HeadDimBucket, TransferVectors};
use crate::ops::layout::FwdProblem;
use crate::ops::params::DropoutParams;
use crate::ops::tile::view::typed_origin;
use crate::ops::tile::{
    BlockDropout, BlockFmhaPipelineQrKsVs, BlockTile, DropoutCoords, FwdBlockInputs,
    GenericAttentionMask, TensorView, Tile, ViewDesc,
};
use crate::runtime::{ReadSet, StreamConfig};
use crate::tensor::{DType, DevicePtr, Element, Storage};
use rayon::prelude::*;
use std::marker::PhantomData;

const M_PER_BLOCK: usize = 128;
const N_PER_BLOCK: usize = 128;
const K_PER_BLOCK: usize = 32;

pub struct FwdArgument {
    pub problems: Vec<FwdProblem>,
    pub scale: f32,
    pub dropout: DropoutParams,
    workspace: Option<DevicePtr>,
}

impl FwdArgument {
    fn read_storages(&self) -> Vec<&Storage> {
        let mut storages = Vec::new();
        for p in &self.problems {
            storages.push(&**p.ptrs.q.storage());
            storages.push(&**p.ptrs.k.storage());
            storages.push(&**p.ptrs.v.storage());
            if let Some(bias) = &p.ptrs.bias {
                storages.push(&**bias.storage());
            }
        }
        if let Some(ws) = &self.workspace {
            storages.push(&**ws.storage());
        }
        storages
    }
}

/// Block coordinates of one forward block.
#[derive(Debug, Clone, Copy)]
struct FwdBlock {
    problem: usize,
    g0: usize,
    g1: usize,
    i_m0: usize,
    i_n1: usize,
}

pub struct DeviceMhaFwdXdl<T, const MASK: u8, const BIAS: bool> {
    mode: ProblemMode,
    bucket: HeadDimBucket,
    vectors: TransferVectors,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Element, const MASK: u8, const BIAS: bool> DeviceMhaFwdXdl<T, MASK, BIAS> {
    pub fn new(mode: ProblemMode, bucket: HeadDimBucket, vectors: TransferVectors) -> Self {
        Self {
            mode,
            bucket,
            vectors,
            _marker: PhantomData,
        }
    }

    pub fn mask_type() -> CustomMaskType {
        CustomMaskType::from_code(MASK).unwrap_or_default()
    }

    pub fn make_argument(
        &self,
        problems: Vec<FwdProblem>,
        scale: f32,
        dropout: DropoutParams,
    ) -> FwdArgument {
        FwdArgument {
            problems,
            scale,
            dropout,
            workspace: None,
        }
    }

    fn block_tile(&self) -> BlockTile {
        BlockTile {
            m0: M_PER_BLOCK,
            n0: N_PER_BLOCK,
            k0: K_PER_BLOCK,
            n1: self.bucket.gemm1_n_per_block(),
            k1: K_PER_BLOCK,
        }
    }

    fn blocks_of(&self, p: &FwdProblem) -> usize {
        let d = &p.desc;
        let [g0, g1, m, _] = d.a_gs_ms_ks.lengths;
        let kv = d.c_gs_ms_os.lengths[3];
        g0 * g1 * m.div_ceil(M_PER_BLOCK) * kv.div_ceil(self.bucket.gemm1_n_per_block())
    }

    fn block_table(&self, arg: &FwdArgument) -> BlockTable {
        BlockTable::from_counts(arg.problems.iter().map(|p| self.blocks_of(p)))
    }

    /// Split a problem-local block index, value-feature tiles fastest.
    fn block_coord(&self, p: &FwdProblem, problem: usize, local: usize) -> FwdBlock {
        let d = &p.desc;
        let g1_len = d.a_gs_ms_ks.lengths[1];
        let n1 = self.bucket.gemm1_n_per_block();
        let tiles_m = d.a_gs_ms_ks.lengths[2].div_ceil(M_PER_BLOCK);
        let tiles_n = d.c_gs_ms_os.lengths[3].div_ceil(n1);
        let i_n = local % tiles_n;
        let i_m = (local / tiles_n) % tiles_m;
        let g = local / (tiles_n * tiles_m);
        FwdBlock {
            problem,
            g0: g / g1_len,
            g1: g % g1_len,
            i_m0: i_m * M_PER_BLOCK,
            i_n1: i_n * n1,
        }
    }

    fn run_block(
        &self,
        arg: &FwdArgument,
        reads: &ReadSet<'_>,
        b: FwdBlock,
    ) -> Result<Vec<TileStore>> {
        let tile = self.block_tile();
        let p = &arg.problems[b.problem];
        let d = &p.desc;
        let [_, hq, m, k] = d.a_gs_ms_ks.lengths;
        let [_, hkv, n, _] = d.b0_gs_ns_ks.lengths;
        let kv = d.c_gs_ms_os.lengths[3];
        let g1_kv = b.g1 / (hq / hkv.max(1)).max(1);

        let a = d.a_gs_ms_ks;
        let q = TensorView::<T>::new(
            reads.bytes(p.ptrs.q.storage())?,
            ViewDesc::new(
                typed_origin::<T>(&p.ptrs.q, "q")? + a.group_offset(b.g0, b.g1),
                [m, k],
                [a.strides[2], a.strides[3]],
            ),
            "q",
        )?;
        let b0 = d.b0_gs_ns_ks;
        let kt = TensorView::<T>::new(
            reads.bytes(p.ptrs.k.storage())?,
            ViewDesc::new(
                typed_origin::<T>(&p.ptrs.k, "k")? + b0.group_offset(b.g0, g1_kv),
                [n, k],
                [b0.strides[2], b0.strides[3]],
            ),
            "k",
        )?;
        let b1 = d.b1_gs_os_ns;
        let vt = TensorView::<T>::new(
            reads.bytes(p.ptrs.v.storage())?,
            ViewDesc::new(
                typed_origin::<T>(&p.ptrs.v, "v")? + b1.group_offset(b.g0, g1_kv),
                [kv, n],
                [b1.strides[2], b1.strides[3]],
            ),
            "v",
        )?;
        let bias = match (&p.ptrs.bias, &d.d0_gs_ms_ns, BIAS) {
            (Some(ptr), Some(d0), true) => Some(TensorView::<T>::new(
                reads.bytes(ptr.storage())?,
                ViewDesc::new(
                    typed_origin::<T>(ptr, "bias")? + d0.group_offset(b.g0, b.g1),
                    [m, n],
                    [d0.strides[2], d0.strides[3]],
                ),
                "bias",
            )?),
            _ => None,
        };

        let dropout_batch = match self.mode {
            ProblemMode::Batched => b.g0,
            ProblemMode::Grouped => b.problem,
        };
        let generator = BlockDropout::new(
            arg.dropout.probability,
            arg.dropout.philox_seed,
            arg.dropout.philox_offset,
        );
        let inputs = FwdBlockInputs {
            q,
            k: kt,
            vt,
            bias,
            mask: GenericAttentionMask::from_mask_type(Self::mask_type(), 0, m, n),
            dropout: arg.dropout.is_enabled().then_some(DropoutCoords {
                dropout: generator,
                batch: dropout_batch,
                head: b.g1,
            }),
            scale: arg.scale,
        };
        let out = BlockFmhaPipelineQrKsVs::<false>::new(tile).run(&inputs, b.i_m0, b.i_n1);

        let c = d.c_gs_ms_os;
        let mut stores = vec![TileStore::new(
            &p.ptrs.out,
            ViewDesc::new(
                typed_origin::<T>(&p.ptrs.out, "out")? + c.group_offset(b.g0, b.g1),
                [m, kv],
                [c.strides[2], c.strides[3]],
            ),
            [b.i_m0, b.i_n1],
            out.o,
        )];

        // row statistics and random values are written once per query tile
        if b.i_n1 == 0 {
            if let Some(ptr) = &p.ptrs.logsumexp {
                let lse = d.lse_gs_ms;
                let mut column = Tile::zeros(tile.m0, 1);
                for (r, &v) in out.lse.iter().enumerate() {
                    column.set(r, 0, v);
                }
                stores.push(TileStore::new(
                    ptr,
                    ViewDesc::new(
                        typed_origin::<f32>(ptr, "logsumexp")? + lse.group_offset(b.g0, b.g1),
                        [m, 1],
                        [lse.strides[2], 1],
                    ),
                    [b.i_m0, 0],
                    column,
                ));
            }
            if let Some(ptr) = &p.ptrs.randvals {
                let z = d.z_gs_ms_ns;
                let rows = tile.m0.min(m.saturating_sub(b.i_m0));
                let mut values = Tile::zeros(rows, n);
                for r in 0..rows {
                    for (col, v) in values.row_mut(r).iter_mut().enumerate() {
                        *v = generator.random_value(dropout_batch, b.g1, b.i_m0 + r, col);
                    }
                }
                stores.push(TileStore::new(
                    ptr,
                    ViewDesc::new(
                        typed_origin::<f32>(ptr, "randvals")? + z.group_offset(b.g0, b.g1),
                        [m, n],
                        [z.strides[2], z.strides[3]],
                    ),
                    [b.i_m0, 0],
                    values,
                ));
            }
        }
        Ok(stores)
    }

    fn execute(&self, arg: &FwdArgument) -> Result<()> {
        let table = self.block_table(arg);
        let table_ptr = match self.mode {
            ProblemMode::Grouped => {
                let ptr = arg.workspace.as_ref().ok_or_else(|| Error::DeviceFault {
                    reason: "grouped forward launched without a workspace".into(),
                })?;
                upload(ptr, &table.to_bytes())?;
                Some(ptr)
            }
            ProblemMode::Batched => None,
        };

        let stores: Vec<TileStore> = {
            let reads = ReadSet::lock(arg.read_storages())?;
            let table_bytes = match table_ptr {
                Some(ptr) => Some(&reads.bytes(ptr.storage())?[ptr.byte_offset()..]),
                None => None,
            };
            (0..table.total_blocks())
                .into_par_iter()
                .map(|id| {
                    let (problem, local) = match table_bytes {
                        Some(bytes) => locate_block(bytes, table.num_groups(), id)?,
                        None => (0, id),
                    };
                    let block = self.block_coord(&arg.problems[problem], problem, local);
                    self.run_block(arg, &reads, block)
                })
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect()
        };
        scatter(stores)
    }
}

impl<T: Element, const MASK: u8, const BIAS: bool> DeviceOp for DeviceMhaFwdXdl<T, MASK, BIAS> {
    type Argument = FwdArgument;

    fn type_string(&self) -> String {
        format!(
            concat!(
                "Device{}MultiheadAttentionForward_Xdl<{}, {}, {}, {}, {}, ",
                "mask={}, bias={}, vec=({}, {}, {})>",
            ),
            self.mode,
            T::DTYPE,
            M_PER_BLOCK,
            N_PER_BLOCK,
            K_PER_BLOCK,
            self.bucket.gemm1_n_per_block(),
            MASK,
            BIAS,
            self.vectors.ab,
            self.vectors.b1,
            self.vectors.c_shuffle
        )
    }

    fn workspace_size(&self, arg: &FwdArgument) -> usize {
        match self.mode {
            ProblemMode::Batched => 0,
            ProblemMode::Grouped => self.block_table(arg).size_in_bytes(),
        }
    }

    fn set_workspace_pointer(&self, arg: &mut FwdArgument, workspace: Option<DevicePtr>) {
        arg.workspace = workspace;
    }

    fn check_argument(&self, arg: &FwdArgument) -> std::result::Result<(), String> {
        if self.mode == ProblemMode::Batched && arg.problems.len() != 1 {
            return Err(format!("batched instance takes one problem, got {}", arg.problems.len()));
        }
        let v = self.vectors;
        for (i, p) in arg.problems.iter().enumerate() {
            let d = &p.desc;
            let [_, hq, _, k] = d.a_gs_ms_ks.lengths;
            let hkv = d.b0_gs_ns_ks.lengths[1];
            let kv = d.c_gs_ms_os.lengths[3];
            let at = |what: &str| format!("problem {i}: {what}");

            if hkv == 0 || hq % hkv != 0 {
                return Err(at(&format!("{hq} query heads do not divide into {hkv} key heads")));
            }
            if k % v.ab != 0 {
                return Err(at(&format!("K={k} is not a multiple of vector width {}", v.ab)));
            }
            if kv % v.b1 != 0 || kv % v.c_shuffle != 0 {
                return Err(at(&format!(
                    "Kv={kv} is not a multiple of vector widths ({}, {})",
                    v.b1, v.c_shuffle
                )));
            }
            expect_unit_stride(k, d.a_gs_ms_ks.strides[3], &at("q"))?;
            expect_unit_stride(k, d.b0_gs_ns_ks.strides[3], &at("k"))?;
            expect_unit_stride(kv, d.b1_gs_os_ns.strides[2], &at("v"))?;
            expect_unit_stride(kv, d.c_gs_ms_os.strides[3], &at("out"))?;
            expect_vector_aligned(&d.a_gs_ms_ks.strides[..3], v.ab, &at("q"))?;
            expect_vector_aligned(&d.b0_gs_ns_ks.strides[..3], v.ab, &at("k"))?;
            let b1 = d.b1_gs_os_ns.strides;
            expect_vector_aligned(&[b1[0], b1[1], b1[3]], v.b1, &at("v"))?;
            expect_vector_aligned(&d.c_gs_ms_os.strides[..3], v.c_shuffle, &at("out"))?;

            match (BIAS, &p.ptrs.bias, &d.d0_gs_ms_ns) {
                (true, Some(ptr), Some(_)) => expect_element::<T>(ptr, &at("bias"))?,
                (true, _, _) => return Err(at("instance expects a bias")),
                (false, None, None) => {}
                (false, _, _) => return Err(at("instance has no bias input")),
            }
            expect_element::<T>(&p.ptrs.q, &at("q"))?;
            expect_element::<T>(&p.ptrs.k, &at("k"))?;
            expect_element::<T>(&p.ptrs.v, &at("v"))?;
            expect_element::<T>(&p.ptrs.out, &at("out"))?;
            if let Some(ptr) = &p.ptrs.logsumexp {
                super::expect_dtype(ptr, DType::F32, &at("logsumexp"))?;
            }
            if let Some(ptr) = &p.ptrs.randvals {
                super::expect_dtype(ptr, DType::F32, &at("randvals"))?;
            }
        }
        if self.mode == ProblemMode::Grouped
            && arg.workspace.is_none()
            && !arg.problems.is_empty()
        {
            return Err("grouped instance needs a workspace".into());
        }
        Ok(())
    }

    fn launch(&self, arg: FwdArgument, config: &StreamConfig<'_>) -> Result<()> {
        let op = Self::new(self.mode, self.bucket, self.vectors);
        tracing::trace!(
            blocks = self.block_table(&arg).total_blocks(),
            problems = arg.problems.len(),
            "forward device op"
        );
        config
            .stream
            .launch_with(config, "fmha_fwd_device_op", move || op.execute(&arg))
    }
}
