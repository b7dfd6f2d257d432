//! Backward block pipeline.
//!
//! Attention weights are recomputed from the saved log-sum-exp rather than stored.
//! With `S = scale·QKᵗ + bias`, `P = exp(S - lse)`, dropout multipliers `Z` and
//! `D = rowsum(dO ∘ O)`:
//!
//! ```text
//! dV = (P∘Z)ᵗ dO      dS = P ∘ (Z ∘ (dO Vᵗ) - D)
//! dQ = scale · dS K   dK = scale · dSᵗ Q      dBias = dS
//! ```
//!
//! Query-gradient blocks sweep key tiles; key/value-gradient blocks sweep query
//! tiles. Each block owns its output rows, so no atomics are needed.

use super::dropout::DropoutCoords;
use super::mask::GenericAttentionMask;
use super::view::{TensorView, Tile, TileWindow};
use crate::tensor::Element;

/// Views one backward block reads, already offset to its batch and query head.
pub struct BwdBlockInputs<'a, T: Element> {
    /// `[seqlen_q, hdim_q]`
    pub q: TensorView<'a, T>,
    /// `[seqlen_k, hdim_q]`
    pub k: TensorView<'a, T>,
    /// `[seqlen_k, hdim_v]`
    pub v: TensorView<'a, T>,
    /// `[seqlen_q, hdim_v]`
    pub o_grad: TensorView<'a, T>,
    /// `[seqlen_q, 1]`, natural log.
    pub lse: TensorView<'a, f32>,
    /// `[seqlen_q, 1]`, from [`dot_do_o`].
    pub d: TensorView<'a, f32>,
    /// `[seqlen_q, seqlen_k]`
    pub bias: Option<TensorView<'a, T>>,
    pub mask: GenericAttentionMask,
    pub dropout: Option<DropoutCoords>,
    pub scale: f32,
}

/// `D[i] = Σ_c dO[i, c] · O[i, c]` for every row of one head.
pub fn dot_do_o<T: Element>(o: &TensorView<'_, T>, o_grad: &TensorView<'_, T>) -> Vec<f32> {
    let [rows, cols] = o.lengths();
    (0..rows)
        .map(|i| (0..cols).map(|c| o.get(i, c) * o_grad.get(i, c)).sum())
        .collect()
}

pub struct DqBlockOutput {
    /// `[kM0, hdim_q]`
    pub dq: Tile,
    /// `(key tile start, [kM0, kN0] dS)` for every visited key tile.
    pub dbias: Vec<(usize, Tile)>,
}

pub struct DkDvBlockOutput {
    /// `[kN0, hdim_q]`
    pub dk: Tile,
    /// `[kN0, hdim_v]`
    pub dv: Tile,
}

pub struct BlockFmhaBwdPipeline {
    m0: usize,
    n0: usize,
}

impl BlockFmhaBwdPipeline {
    pub fn new(m0: usize, n0: usize) -> Self {
        Self { m0, n0 }
    }

    /// Recompute `P∘Z` and `dS` for one `[kM0, kN0]` tile.
    #[allow(clippy::too_many_arguments)]
    fn recompute<T: Element>(
        &self,
        inputs: &BwdBlockInputs<'_, T>,
        q_tile: &Tile,
        k_tile: &Tile,
        v_tile: &Tile,
        do_tile: &Tile,
        i_m0: usize,
        i_n0: usize,
    ) -> (Tile, Tile) {
        let (m0, n0) = (self.m0, self.n0);
        let seqlen_q = inputs.q.lengths()[0];
        let mut s = Tile::zeros(m0, n0);
        s.gemm_nt_acc(q_tile, k_tile);
        let mut dp = Tile::zeros(m0, n0);
        dp.gemm_nt_acc(do_tile, v_tile);

        let mut pz = Tile::zeros(m0, n0);
        let mut ds = Tile::zeros(m0, n0);
        for r in 0..m0 {
            let row = i_m0 + r;
            let lse = inputs.lse.get(row, 0);
            if row >= seqlen_q || lse == f32::NEG_INFINITY {
                continue;
            }
            let d = inputs.d.get(row, 0);
            for c in 0..n0 {
                let col = i_n0 + c;
                if inputs.mask.is_out_of_bound(row, col) {
                    continue;
                }
                let mut x = s.get(r, c) * inputs.scale;
                if let Some(bias) = &inputs.bias {
                    x += bias.get(row, col);
                }
                let p = (x - lse).exp();
                let z = inputs.dropout.map_or(1.0, |dr| dr.factor(row, col));
                pz.set(r, c, p * z);
                ds.set(r, c, p * (z * dp.get(r, c) - d));
            }
        }
        (pz, ds)
    }

    /// Query gradient (and bias gradient tiles) for rows `[i_m0, i_m0 + kM0)`.
    pub fn dq_block<T: Element>(
        &self,
        inputs: &BwdBlockInputs<'_, T>,
        i_m0: usize,
        want_dbias: bool,
    ) -> DqBlockOutput {
        let (m0, n0) = (self.m0, self.n0);
        let hdim_q = inputs.q.lengths()[1];
        let hdim_v = inputs.v.lengths()[1];
        let seqlen_k = inputs.k.lengths()[0];
        let q_tile = TileWindow::new(inputs.q, [m0, hdim_q], [i_m0, 0]).load();
        let do_tile = TileWindow::new(inputs.o_grad, [m0, hdim_v], [i_m0, 0]).load();

        let mut dq = Tile::zeros(m0, hdim_q);
        let mut dbias = Vec::new();
        let (start, end) = inputs.mask.tile_range_along_x(i_m0, m0, n0);
        for i_n0 in (start..end.min(seqlen_k)).step_by(n0) {
            let k_tile = TileWindow::new(inputs.k, [n0, hdim_q], [i_n0, 0]).load();
            let v_tile = TileWindow::new(inputs.v, [n0, hdim_v], [i_n0, 0]).load();
            let (_, ds) = self.recompute(inputs, &q_tile, &k_tile, &v_tile, &do_tile, i_m0, i_n0);
            dq.gemm_nn_acc(&ds, &k_tile);
            if want_dbias {
                dbias.push((i_n0, ds));
            }
        }
        dq.scale(inputs.scale);
        DqBlockOutput { dq, dbias }
    }

    /// Key and value gradients for keys `[i_n0, i_n0 + kN0)`.
    pub fn dkdv_block<T: Element>(
        &self,
        inputs: &BwdBlockInputs<'_, T>,
        i_n0: usize,
    ) -> DkDvBlockOutput {
        let (m0, n0) = (self.m0, self.n0);
        let hdim_q = inputs.q.lengths()[1];
        let hdim_v = inputs.v.lengths()[1];
        let seqlen_q = inputs.q.lengths()[0];
        let k_tile = TileWindow::new(inputs.k, [n0, hdim_q], [i_n0, 0]).load();
        let v_tile = TileWindow::new(inputs.v, [n0, hdim_v], [i_n0, 0]).load();

        let mut dk = Tile::zeros(n0, hdim_q);
        let mut dv = Tile::zeros(n0, hdim_v);
        for i_m0 in (0..seqlen_q).step_by(m0) {
            if !inputs.mask.tile_has_visible(i_m0, i_n0, m0, n0) {
                continue;
            }
            let q_tile = TileWindow::new(inputs.q, [m0, hdim_q], [i_m0, 0]).load();
            let do_tile = TileWindow::new(inputs.o_grad, [m0, hdim_v], [i_m0, 0]).load();
            let (pz, ds) = self.recompute(inputs, &q_tile, &k_tile, &v_tile, &do_tile, i_m0, i_n0);
            dv.gemm_tn_acc(&pz, &do_tile);
            dk.gemm_tn_acc(&ds, &q_tile);
        }
        dk.scale(inputs.scale);
        DkDvBlockOutput { dk, dv }
    }
}
