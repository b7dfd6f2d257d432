//! Forward block pipeline: Q resident, K and V streamed (QR/KS/VS).
//!
//! One invocation owns a `[kM0, kN1]` output tile: rows `[i_m0, i_m0 + kM0)` of
//! one head of one batch (or sequence), value features `[i_n1, i_n1 + kN1)`. It
//! sweeps the visible key tiles in order, keeping a running row max and row sum
//! so the full score matrix is never materialized.

use super::dropout::DropoutCoords;
use super::mask::GenericAttentionMask;
use super::view::{TensorView, Tile, TileWindow};
use crate::tensor::Element;
use std::f32::consts::{LN_2, LOG2_E};

/// Block tile extents: `kM0` query rows, `kN0` keys per score tile, `kK0` head-dim
/// slice of the score GEMM, `kN1` value features, `kK1` key slice of the PV GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTile {
    pub m0: usize,
    pub n0: usize,
    pub k0: usize,
    pub n1: usize,
    pub k1: usize,
}

/// Global views one block reads from, already offset to its batch and head.
pub struct FwdBlockInputs<'a, T: Element> {
    /// `[seqlen_q, hdim_q]`
    pub q: TensorView<'a, T>,
    /// `[seqlen_k, hdim_q]`
    pub k: TensorView<'a, T>,
    /// `[hdim_v, seqlen_k]`; a row-major V arrives here transposed.
    pub vt: TensorView<'a, T>,
    /// `[seqlen_q, seqlen_k]`
    pub bias: Option<TensorView<'a, T>>,
    pub mask: GenericAttentionMask,
    pub dropout: Option<DropoutCoords>,
    /// Softmax scale. With base-2 exponentials the caller folds `log2(e)` in.
    pub scale: f32,
}

pub struct FwdBlockOutput {
    /// Normalized `[kM0, kN1]` output tile.
    pub o: Tile,
    /// Natural-log log-sum-exp per row; `-inf` for fully masked rows.
    pub lse: Vec<f32>,
}

pub struct BlockFmhaPipelineQrKsVs<const FAST_EXP2: bool> {
    tile: BlockTile,
}

impl<const FAST_EXP2: bool> BlockFmhaPipelineQrKsVs<FAST_EXP2> {
    pub fn new(tile: BlockTile) -> Self {
        Self { tile }
    }

    #[inline]
    fn exp(x: f32) -> f32 {
        if FAST_EXP2 {
            x.exp2()
        } else {
            x.exp()
        }
    }

    pub fn run<T: Element>(
        &self,
        inputs: &FwdBlockInputs<'_, T>,
        i_m0: usize,
        i_n1: usize,
    ) -> FwdBlockOutput {
        let BlockTile { m0, n0, k0, n1, k1 } = self.tile;
        let hdim_q = inputs.q.lengths()[1];
        let seqlen_k = inputs.k.lengths()[0];
        let bias_scale = if FAST_EXP2 { LOG2_E } else { 1.0 };

        let q_tiles: Vec<Tile> = (0..hdim_q)
            .step_by(k0)
            .map(|kk| TileWindow::new(inputs.q, [m0, k0], [i_m0, kk]).load())
            .collect();

        let mut row_max = vec![f32::NEG_INFINITY; m0];
        let mut row_sum = vec![0.0f32; m0];
        let mut o_acc = Tile::zeros(m0, n1);

        let (start, end) = inputs.mask.tile_range_along_x(i_m0, m0, n0);
        let end = end.min(seqlen_k);

        let mut k_window = TileWindow::new(inputs.k, [n0, k0], [start, 0]);
        let mut i_n0 = start;
        while i_n0 < end {
            // S = Q Kᵗ, accumulated over head-dim slices
            let mut s = Tile::zeros(m0, n0);
            for q_tile in &q_tiles {
                s.gemm_nt_acc(q_tile, &k_window.load());
                k_window.move_by([0, k0]);
            }
            k_window = TileWindow::new(inputs.k, [n0, k0], [i_n0 + n0, 0]);

            for r in 0..m0 {
                for c in 0..n0 {
                    let (row, col) = (i_m0 + r, i_n0 + c);
                    let value = if inputs.mask.is_out_of_bound(row, col) {
                        f32::NEG_INFINITY
                    } else {
                        let mut x = s.get(r, c) * inputs.scale;
                        if let Some(bias) = &inputs.bias {
                            x += bias.get(row, col) * bias_scale;
                        }
                        x
                    };
                    s.set(r, c, value);
                }
            }

            // online softmax: rescale what has been accumulated so far
            let mut p = Tile::zeros(m0, n0);
            for r in 0..m0 {
                let tile_max = s.row(r).iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let new_max = row_max[r].max(tile_max);
                if new_max == f32::NEG_INFINITY {
                    continue;
                }
                let alpha = if row_max[r] == f32::NEG_INFINITY {
                    0.0
                } else {
                    Self::exp(row_max[r] - new_max)
                };
                let mut tile_sum = 0.0f32;
                for (pc, &sc) in p.row_mut(r).iter_mut().zip(s.row(r)) {
                    *pc = Self::exp(sc - new_max);
                    tile_sum += *pc;
                }
                row_sum[r] = row_sum[r] * alpha + tile_sum;
                o_acc.row_mut(r).iter_mut().for_each(|o| *o *= alpha);
                row_max[r] = new_max;
            }

            // the normalizer keeps undropped probabilities
            if let Some(dropout) = &inputs.dropout {
                for r in 0..m0 {
                    for c in 0..n0 {
                        let kept = p.get(r, c) * dropout.factor(i_m0 + r, i_n0 + c);
                        p.set(r, c, kept);
                    }
                }
            }

            // O += P V, over key slices of kK1
            let mut v_window = TileWindow::new(inputs.vt, [n1, k1], [i_n1, i_n0]);
            for kk in (0..n0).step_by(k1) {
                o_acc.gemm_nt_acc(&p.columns(kk, k1), &v_window.load());
                v_window.move_by([0, k1]);
            }

            i_n0 += n0;
        }

        let mut lse = vec![f32::NEG_INFINITY; m0];
        for r in 0..m0 {
            if row_sum[r] > 0.0 {
                let inv = 1.0 / row_sum[r];
                o_acc.row_mut(r).iter_mut().for_each(|o| *o *= inv);
                lse[r] = if FAST_EXP2 {
                    row_max[r] * LN_2 + row_sum[r].ln()
                } else {
                    row_max[r] + row_sum[r].ln()
                };
            } else {
                o_acc.row_mut(r).iter_mut().for_each(|o| *o = 0.0);
            }
        }
        FwdBlockOutput { o: o_acc, lse }
    }
}
