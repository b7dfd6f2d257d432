//! Backward device op.
//!
//! One launch runs two passes on the stream worker. The preprocess pass computes
//! `D = rowsum(dO ∘ O)` for every query row of every head and stores it in the
//! workspace, after the grouped block table. The main pass then runs two kinds of
//! blocks side by side: query-gradient blocks (one per query tile) and key/value
//! gradient blocks (one per key tile and *query* head). Key/value gradients are
//! therefore always produced per query head; with shared key/value heads the
//! caller points them at `Hq`-headed temporaries and reduces afterwards.

use super::{
    expect_dtype, expect_element, expect_unit_stride, expect_vector_aligned, locate_block, scatter,
    upload, BlockTable, DeviceOp, ProblemMode, TileStore,
};
use crate::error::{Error, Result};
use crate::ops::dispatch::{CustomMaskType, HeadDimBucket, TransferVectors};
use crate::ops::layout::BwdProblem;
use crate::ops::params::DropoutParams;
use crate::ops::tile::view::typed_origin;
use crate::ops::tile::{
    dot_do_o, BlockDropout, BlockFmhaBwdPipeline, BwdBlockInputs, DropoutCoords,
    GenericAttentionMask, TensorView, ViewDesc,
};
use crate::runtime::{ReadSet, StreamConfig};
use crate::tensor::{DType, DevicePtr, Element, Storage};
use rayon::prelude::*;
use std::marker::PhantomData;

const M_PER_BLOCK: usize = 64;
const N_PER_BLOCK: usize = 128;
const K_PER_BLOCK: usize = 32;

pub struct BwdArgument {
    pub problems: Vec<BwdProblem>,
    pub scale: f32,
    pub dropout: DropoutParams,
    workspace: Option<DevicePtr>,
}

impl BwdArgument {
    fn read_storages(&self) -> Vec<&Storage> {
        let mut storages = Vec::new();
        for p in &self.problems {
            let ptrs = &p.ptrs;
            storages.extend([&**ptrs.q.storage(), &**ptrs.k.storage(), &**ptrs.v.storage()]);
            storages.extend([&**ptrs.ygrad.storage(), &**ptrs.logsumexp.storage()]);
            if let Some(bias) = &ptrs.bias {
                storages.push(&**bias.storage());
            }
        }
        if let Some(ws) = &self.workspace {
            storages.push(&**ws.storage());
        }
        storages
    }

    /// Rows of `D` each problem owns, in workspace order.
    fn d_offsets(&self) -> Vec<usize> {
        let mut at = 0;
        self.problems
            .iter()
            .map(|p| {
                let [g0, g1, m, _] = p.desc.q_gs_ms_ks.lengths;
                let start = at;
                at += g0 * g1 * m;
                start
            })
            .collect()
    }

    fn d_len(&self) -> usize {
        self.problems
            .iter()
            .map(|p| {
                let [g0, g1, m, _] = p.desc.q_gs_ms_ks.lengths;
                g0 * g1 * m
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
enum BwdBlock {
    Dq { i_m0: usize },
    DkDv { i_n0: usize },
}

#[derive(Debug, Clone, Copy)]
struct BlockCoord {
    problem: usize,
    g0: usize,
    g1: usize,
    kind: BwdBlock,
}

pub struct DeviceMhaBwdXdl<T, const MASK: u8, const BIAS: bool, const FP32_GRAD: bool> {
    mode: ProblemMode,
    bucket: HeadDimBucket,
    vectors: TransferVectors,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Element, const MASK: u8, const BIAS: bool, const FP32_GRAD: bool>
    DeviceMhaBwdXdl<T, MASK, BIAS, FP32_GRAD>
{
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

    /// Element type the query/key/value gradients are written in.
    pub fn grad_dtype() -> DType {
        if FP32_GRAD {
            DType::F32
        } else {
            T::DTYPE
        }
    }

    pub fn make_argument(
        &self,
        problems: Vec<BwdProblem>,
        scale: f32,
        dropout: DropoutParams,
    ) -> BwdArgument {
        BwdArgument {
            problems,
            scale,
            dropout,
            workspace: None,
        }
    }

    fn block_counts(p: &BwdProblem) -> (usize, usize) {
        let [g0, g1, m, _] = p.desc.q_gs_ms_ks.lengths;
        let n = p.desc.k_gs_ns_ks.lengths[2];
        (g0 * g1 * m.div_ceil(M_PER_BLOCK), g0 * g1 * n.div_ceil(N_PER_BLOCK))
    }

    fn block_table(arg: &BwdArgument) -> BlockTable {
        BlockTable::from_counts(arg.problems.iter().map(|p| {
            let (dq, dkdv) = Self::block_counts(p);
            dq + dkdv
        }))
    }

    fn table_bytes(&self, arg: &BwdArgument) -> usize {
        match self.mode {
            ProblemMode::Batched => 0,
            ProblemMode::Grouped => Self::block_table(arg).size_in_bytes(),
        }
    }

    fn block_coord(p: &BwdProblem, problem: usize, local: usize) -> BlockCoord {
        let [_, g1_len, m, _] = p.desc.q_gs_ms_ks.lengths;
        let n = p.desc.k_gs_ns_ks.lengths[2];
        let (dq_blocks, _) = Self::block_counts(p);
        let (tiles, local, make): (usize, usize, fn(usize) -> BwdBlock) = if local < dq_blocks {
            (m.div_ceil(M_PER_BLOCK), local, |i| BwdBlock::Dq { i_m0: i * M_PER_BLOCK })
        } else {
            (n.div_ceil(N_PER_BLOCK), local - dq_blocks, |i| BwdBlock::DkDv {
                i_n0: i * N_PER_BLOCK,
            })
        };
        let g = local / tiles;
        BlockCoord {
            problem,
            g0: g / g1_len,
            g1: g % g1_len,
            kind: make(local % tiles),
        }
    }

    fn dropout_coords(&self, arg: &BwdArgument, c: &BlockCoord) -> Option<DropoutCoords> {
        arg.dropout.is_enabled().then(|| DropoutCoords {
            dropout: BlockDropout::new(
                arg.dropout.probability,
                arg.dropout.philox_seed,
                arg.dropout.philox_offset,
            ),
            batch: match self.mode {
                ProblemMode::Batched => c.g0,
                ProblemMode::Grouped => c.problem,
            },
            head: c.g1,
        })
    }

    fn block_inputs<'a>(
        &self,
        arg: &BwdArgument,
        reads: &'a ReadSet<'_>,
        ws: &'a [u8],
        d_origin: usize,
        c: &BlockCoord,
    ) -> Result<BwdBlockInputs<'a, T>> {
        let p = &arg.problems[c.problem];
        let d = &p.desc;
        let [_, hq, m, k] = d.q_gs_ms_ks.lengths;
        let [_, hkv, n, _] = d.k_gs_ns_ks.lengths;
        let kv = d.y_gs_ms_os.lengths[3];
        let g1_kv = c.g1 / (hq / hkv.max(1)).max(1);
        let (g0, g1) = (c.g0, c.g1);

        let view = |ptr: &DevicePtr,
                    origin: usize,
                    lengths: [usize; 2],
                    strides: [usize; 2],
                    what: &str| {
            let desc = ViewDesc::new(origin, lengths, strides);
            TensorView::<T>::new(reads.bytes(ptr.storage())?, desc, what)
        };
        let qd = d.q_gs_ms_ks;
        let q = view(
            &p.ptrs.q,
            typed_origin::<T>(&p.ptrs.q, "q")? + qd.group_offset(g0, g1),
            [m, k],
            [qd.strides[2], qd.strides[3]],
            "q",
        )?;
        let kd = d.k_gs_ns_ks;
        let kt = view(
            &p.ptrs.k,
            typed_origin::<T>(&p.ptrs.k, "k")? + kd.group_offset(g0, g1_kv),
            [n, k],
            [kd.strides[2], kd.strides[3]],
            "k",
        )?;
        let vd = d.v_gs_os_ns;
        let v = view(
            &p.ptrs.v,
            typed_origin::<T>(&p.ptrs.v, "v")? + vd.group_offset(g0, g1_kv),
            [kv, n],
            [vd.strides[2], vd.strides[3]],
            "v",
        )?
        .transpose();
        let yd = d.y_gs_ms_os;
        let o_grad = view(
            &p.ptrs.ygrad,
            typed_origin::<T>(&p.ptrs.ygrad, "grad_out")? + yd.group_offset(g0, g1),
            [m, kv],
            [yd.strides[2], yd.strides[3]],
            "grad_out",
        )?;
        let lse_d = d.lse_gs_ms;
        let lse = TensorView::<f32>::new(
            reads.bytes(p.ptrs.logsumexp.storage())?,
            ViewDesc::new(
                typed_origin::<f32>(&p.ptrs.logsumexp, "logsumexp")? + lse_d.group_offset(g0, g1),
                [m, 1],
                [lse_d.strides[2], 1],
            ),
            "logsumexp",
        )?;
        let dvals = TensorView::<f32>::new(ws, ViewDesc::new(d_origin, [m, 1], [1, 1]), "d")?;
        let bias = match (&p.ptrs.bias, &d.d0_gs_ms_ns, BIAS) {
            (Some(ptr), Some(d0), true) => Some(view(
                ptr,
                typed_origin::<T>(ptr, "bias")? + d0.group_offset(g0, g1),
                [m, n],
                [d0.strides[2], d0.strides[3]],
                "bias",
            )?),
            _ => None,
        };
        Ok(BwdBlockInputs {
            q,
            k: kt,
            v,
            o_grad,
            lse,
            d: dvals,
            bias,
            mask: GenericAttentionMask::from_mask_type(Self::mask_type(), 0, m, n),
            dropout: self.dropout_coords(arg, c),
            scale: arg.scale,
        })
    }

    fn run_block(
        &self,
        arg: &BwdArgument,
        reads: &ReadSet<'_>,
        ws: &[u8],
        d_base: usize,
        d_offsets: &[usize],
        c: BlockCoord,
    ) -> Result<Vec<TileStore>> {
        let p = &arg.problems[c.problem];
        let d = &p.desc;
        let [_, g1_len, m, k] = d.q_gs_ms_ks.lengths;
        let n = d.k_gs_ns_ks.lengths[2];
        let kv = d.y_gs_ms_os.lengths[3];
        let d_origin = d_base + d_offsets[c.problem] + (c.g0 * g1_len + c.g1) * m;
        let inputs = self.block_inputs(arg, reads, ws, d_origin, &c)?;
        let pipeline = BlockFmhaBwdPipeline::new(M_PER_BLOCK, N_PER_BLOCK);

        let mut stores = Vec::new();
        match c.kind {
            BwdBlock::Dq { i_m0 } => {
                let out = pipeline.dq_block(&inputs, i_m0, p.ptrs.bias_grad.is_some());
                let qg = d.qgrad_gs_ms_ks;
                stores.push(TileStore::new(
                    &p.ptrs.qgrad,
                    ViewDesc::new(
                        p.ptrs.qgrad.element_offset()? + qg.group_offset(c.g0, c.g1),
                        [m, k],
                        [qg.strides[2], qg.strides[3]],
                    ),
                    [i_m0, 0],
                    out.dq,
                ));
                if let (Some(ptr), Some(bg)) = (&p.ptrs.bias_grad, &d.d0grad_gs_ms_ns) {
                    let desc = ViewDesc::new(
                        ptr.element_offset()? + bg.group_offset(c.g0, c.g1),
                        [m, n],
                        [bg.strides[2], bg.strides[3]],
                    );
                    for (i_n0, ds) in out.dbias {
                        stores.push(TileStore::new(ptr, desc, [i_m0, i_n0], ds).accumulating());
                    }
                }
            }
            BwdBlock::DkDv { i_n0 } => {
                let out = pipeline.dkdv_block(&inputs, i_n0);
                let kg = d.kgrad_gs_ns_ks;
                stores.push(TileStore::new(
                    &p.ptrs.kgrad,
                    ViewDesc::new(
                        p.ptrs.kgrad.element_offset()? + kg.group_offset(c.g0, c.g1),
                        [n, k],
                        [kg.strides[2], kg.strides[3]],
                    ),
                    [i_n0, 0],
                    out.dk,
                ));
                let vg = d.vgrad_gs_os_ns;
                stores.push(TileStore::new(
                    &p.ptrs.vgrad,
                    ViewDesc::new(
                        p.ptrs.vgrad.element_offset()? + vg.group_offset(c.g0, c.g1),
                        [kv, n],
                        [vg.strides[2], vg.strides[3]],
                    )
                    .transpose(),
                    [i_n0, 0],
                    out.dv,
                ));
            }
        }
        Ok(stores)
    }

    /// `D` for every `(problem, g0, g1)` head, concatenated in workspace order.
    fn preprocess(&self, arg: &BwdArgument) -> Result<Vec<f32>> {
        let heads: Vec<(usize, usize, usize)> = arg
            .problems
            .iter()
            .enumerate()
            .flat_map(|(i, p)| {
                let [g0, g1, _, _] = p.desc.q_gs_ms_ks.lengths;
                (0..g0 * g1).map(move |g| (i, g / g1, g % g1))
            })
            .collect();
        let storages: Vec<&Storage> = arg
            .problems
            .iter()
            .flat_map(|p| [&**p.ptrs.y.storage(), &**p.ptrs.ygrad.storage()])
            .collect();
        let reads = ReadSet::lock(storages)?;
        let rows = heads
            .into_par_iter()
            .map(|(i, g0, g1)| {
                let p = &arg.problems[i];
                let yd = p.desc.y_gs_ms_os;
                let [_, _, m, kv] = yd.lengths;
                let at = |ptr: &DevicePtr, what: &str| {
                    TensorView::<T>::new(
                        reads.bytes(ptr.storage())?,
                        ViewDesc::new(
                            typed_origin::<T>(ptr, what)? + yd.group_offset(g0, g1),
                            [m, kv],
                            [yd.strides[2], yd.strides[3]],
                        ),
                        what,
                    )
                };
                Ok(dot_do_o(&at(&p.ptrs.y, "out")?, &at(&p.ptrs.ygrad, "grad_out")?))
            })
            .collect::<Result<Vec<Vec<f32>>>>()?;
        Ok(rows.concat())
    }

    fn execute(&self, arg: &BwdArgument) -> Result<()> {
        let table = Self::block_table(arg);
        if table.total_blocks() == 0 {
            return Ok(());
        }
        let ws = arg.workspace.as_ref().ok_or_else(|| Error::DeviceFault {
            reason: "backward launched without a workspace".into(),
        })?;

        let mut staged = match self.mode {
            ProblemMode::Grouped => table.to_bytes(),
            ProblemMode::Batched => Vec::new(),
        };
        staged.extend(self.preprocess(arg)?.iter().flat_map(|v| v.to_le_bytes()));
        upload(ws, &staged)?;

        let d_base = ws.element_offset()? + self.table_bytes(arg) / 4;
        let d_offsets = arg.d_offsets();
        let stores: Vec<TileStore> = {
            let reads = ReadSet::lock(arg.read_storages())?;
            let ws_bytes = reads.bytes(ws.storage())?;
            let table_bytes = &ws_bytes[ws.byte_offset()..];
            (0..table.total_blocks())
                .into_par_iter()
                .map(|id| {
                    let (problem, local) = match self.mode {
                        ProblemMode::Grouped => locate_block(table_bytes, table.num_groups(), id)?,
                        ProblemMode::Batched => (0, id),
                    };
                    let coord = Self::block_coord(&arg.problems[problem], problem, local);
                    self.run_block(arg, &reads, ws_bytes, d_base, &d_offsets, coord)
                })
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect()
        };
        scatter(stores)
    }
}

impl<T: Element, const MASK: u8, const BIAS: bool, const FP32_GRAD: bool> DeviceOp
    for DeviceMhaBwdXdl<T, MASK, BIAS, FP32_GRAD>
{
    type Argument = BwdArgument;

    fn type_string(&self) -> String {
        format!(
            concat!(
                "Device{}MultiheadAttentionBackward_Xdl_V1<{}, {}, {}, {}, {}, ",
                "mask={}, bias={}, fp32_grad={}, vec=({}, {}, {})>",
            ),
            self.mode,
            T::DTYPE,
            M_PER_BLOCK,
            N_PER_BLOCK,
            K_PER_BLOCK,
            self.bucket.gemm1_n_per_block(),
            MASK,
            BIAS,
            FP32_GRAD,
            self.vectors.ab,
            self.vectors.b1,
            self.vectors.c_shuffle
        )
    }

    fn workspace_size(&self, arg: &BwdArgument) -> usize {
        self.table_bytes(arg) + arg.d_len() * DType::F32.size_in_bytes()
    }

    fn set_workspace_pointer(&self, arg: &mut BwdArgument, workspace: Option<DevicePtr>) {
        arg.workspace = workspace;
    }

    fn check_argument(&self, arg: &BwdArgument) -> std::result::Result<(), String> {
        if self.mode == ProblemMode::Batched && arg.problems.len() != 1 {
            return Err(format!("batched instance takes one problem, got {}", arg.problems.len()));
        }
        let v = self.vectors;
        let grad = Self::grad_dtype();
        for (i, p) in arg.problems.iter().enumerate() {
            let d = &p.desc;
            let [_, hq, _, k] = d.q_gs_ms_ks.lengths;
            let hkv = d.k_gs_ns_ks.lengths[1];
            let kv = d.y_gs_ms_os.lengths[3];
            let at = |what: &str| format!("problem {i}: {what}");

            if hkv == 0 || hq % hkv != 0 {
                return Err(at(&format!("{hq} query heads do not divide into {hkv} key heads")));
            }
            if d.kgrad_gs_ns_ks.lengths[1] != hq || d.vgrad_gs_os_ns.lengths[1] != hq {
                return Err(at("key/value gradients must be laid out per query head"));
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
            expect_unit_stride(k, d.q_gs_ms_ks.strides[3], &at("q"))?;
            expect_unit_stride(k, d.k_gs_ns_ks.strides[3], &at("k"))?;
            expect_unit_stride(kv, d.v_gs_os_ns.strides[2], &at("v"))?;
            expect_unit_stride(kv, d.y_gs_ms_os.strides[3], &at("out"))?;
            expect_unit_stride(k, d.qgrad_gs_ms_ks.strides[3], &at("grad_q"))?;
            expect_unit_stride(k, d.kgrad_gs_ns_ks.strides[3], &at("grad_k"))?;
            expect_unit_stride(kv, d.vgrad_gs_os_ns.strides[2], &at("grad_v"))?;
            for (desc, what) in [
                (&d.q_gs_ms_ks, "q"),
                (&d.k_gs_ns_ks, "k"),
                (&d.qgrad_gs_ms_ks, "grad_q"),
                (&d.kgrad_gs_ns_ks, "grad_k"),
            ] {
                expect_vector_aligned(&desc.strides[..3], v.ab, &at(what))?;
            }
            for (desc, what) in [(&d.v_gs_os_ns, "v"), (&d.vgrad_gs_os_ns, "grad_v")] {
                let s = desc.strides;
                expect_vector_aligned(&[s[0], s[1], s[3]], v.b1, &at(what))?;
            }
            expect_vector_aligned(&d.y_gs_ms_os.strides[..3], v.c_shuffle, &at("out"))?;

            match (BIAS, &p.ptrs.bias, &d.d0_gs_ms_ns) {
                (true, Some(ptr), Some(_)) => expect_element::<T>(ptr, &at("bias"))?,
                (true, _, _) => return Err(at("instance expects a bias")),
                (false, None, None) => {}
                (false, _, _) => return Err(at("instance has no bias input")),
            }
            match (&p.ptrs.bias_grad, &d.d0grad_gs_ms_ns) {
                (Some(ptr), Some(_)) if BIAS => expect_element::<T>(ptr, &at("grad_bias"))?,
                (None, None) => {}
                _ => {
                    return Err(at(
                        "bias gradient needs a bias instance and both pointer and descriptor",
                    ))
                }
            }
            expect_element::<T>(&p.ptrs.q, &at("q"))?;
            expect_element::<T>(&p.ptrs.k, &at("k"))?;
            expect_element::<T>(&p.ptrs.v, &at("v"))?;
            expect_element::<T>(&p.ptrs.y, &at("out"))?;
            expect_element::<T>(&p.ptrs.ygrad, &at("grad_out"))?;
            expect_dtype(&p.ptrs.logsumexp, DType::F32, &at("logsumexp"))?;
            expect_dtype(&p.ptrs.qgrad, grad, &at("grad_q"))?;
            expect_dtype(&p.ptrs.kgrad, grad, &at("grad_k"))?;
            expect_dtype(&p.ptrs.vgrad, grad, &at("grad_v"))?;
        }
        if self.workspace_size(arg) > 0 && arg.workspace.is_none() {
            return Err("instance needs a workspace".into());
        }
        Ok(())
    }

    fn launch(&self, arg: BwdArgument, config: &StreamConfig<'_>) -> Result<()> {
        let op = Self::new(self.mode, self.bucket, self.vectors);
        tracing::trace!(
            blocks = Self::block_table(&arg).total_blocks(),
            problems = arg.problems.len(),
            "backward device op"
        );
        config
            .stream
            .launch_with(config, "fmha_bwd_device_op", move || op.execute(&arg))
    }
}
