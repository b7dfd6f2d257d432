//! Shared helpers for fmha parity tests: deterministic inputs and a dense f64
//! reference for forward and backward attention.

use fmha::{DType, Device, FmhaClient, FmhaConfig, Tensor};

pub fn setup() -> FmhaClient {
    FmhaClient::with_config(Device::accelerator(), FmhaConfig::default())
}

pub fn setup_with(config: FmhaConfig) -> FmhaClient {
    FmhaClient::with_config(Device::accelerator(), config)
}

pub fn det_data(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 + phase) * 0.1).sin() * 0.5).collect()
}

/// Deterministic pseudo-random tensor using sin-based pattern.
pub fn det_tensor(shape: &[usize], phase: f32, dtype: DType) -> Tensor {
    let n: usize = shape.iter().product();
    Tensor::from_f32(&det_data(n, phase), shape, dtype, Device::accelerator()).unwrap()
}

pub fn det_i32_tensor(data: &[i32], device: Device) -> Tensor {
    Tensor::from_i32(data, &[data.len()], device).unwrap()
}

/// Values as stored (after rounding into the element type), widened to f64.
pub fn values(t: &Tensor) -> Vec<f64> {
    t.to_vec_f32().unwrap().into_iter().map(f64::from).collect()
}

pub fn assert_close(got: &[f32], want: &[f64], atol: f64, rtol: f64, what: &str) {
    assert_eq!(got.len(), want.len(), "{what}: length mismatch");
    for (i, (&g, &w)) in got.iter().zip(want).enumerate() {
        let diff = (g as f64 - w).abs();
        let tol = atol + rtol * w.abs();
        assert!(
            diff <= tol,
            "{what} at index {i}: {g} vs {w} (diff={diff}, tol={tol})"
        );
    }
}

/// Masking of one `(query, key)` problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefMask {
    None,
    TopLeft,
    BottomRight,
    /// `|j - i| <= half`
    Window(usize),
}

impl RefMask {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => RefMask::TopLeft,
            2 => RefMask::BottomRight,
            _ => RefMask::None,
        }
    }

    pub fn visible(self, i: usize, j: usize, m: usize, n: usize) -> bool {
        let (i, j) = (i as isize, j as isize);
        match self {
            RefMask::None => true,
            RefMask::TopLeft => j <= i,
            RefMask::BottomRight => j <= i + n as isize - m as isize,
            RefMask::Window(half) => (j - i).abs() <= half as isize,
        }
    }
}

/// Sizes of a batched problem, `[B, S, H, D]` layouts throughout.
#[derive(Debug, Clone, Copy)]
pub struct Dims {
    pub b: usize,
    pub m: usize,
    pub n: usize,
    pub hq: usize,
    pub hkv: usize,
    pub k: usize,
    pub kv: usize,
}

impl Dims {
    pub fn new(b: usize, m: usize, n: usize, hq: usize, hkv: usize, k: usize, kv: usize) -> Self {
        Self { b, m, n, hq, hkv, k, kv }
    }

    fn ratio(&self) -> usize {
        self.hq / self.hkv
    }
}

/// Optional extras of the reference: `[B, Hq, M, N]` bias and dropout keep-mask
/// `(randvals, p)`.
#[derive(Default)]
pub struct RefExtras<'a> {
    pub bias: Option<&'a [f64]>,
    pub dropout: Option<(&'a [f32], f64)>,
}

/// Softmax probabilities (undropped) and log-sum-exp of one `(b, h)` head.
#[allow(clippy::too_many_arguments)]
fn head_probs(
    q: &[f64],
    k: &[f64],
    d: &Dims,
    b: usize,
    h: usize,
    scale: f64,
    mask: RefMask,
    bias: Option<&[f64]>,
) -> (Vec<f64>, Vec<f64>) {
    let hk = h / d.ratio();
    let mut p = vec![0.0; d.m * d.n];
    let mut lse = vec![f64::NEG_INFINITY; d.m];
    for i in 0..d.m {
        let mut s = vec![f64::NEG_INFINITY; d.n];
        for (j, sj) in s.iter_mut().enumerate() {
            if !mask.visible(i, j, d.m, d.n) {
                continue;
            }
            let dot: f64 = (0..d.k)
                .map(|c| {
                    q[((b * d.m + i) * d.hq + h) * d.k + c]
                        * k[((b * d.n + j) * d.hkv + hk) * d.k + c]
                })
                .sum();
            let add = bias.map_or(0.0, |bias| bias[((b * d.hq + h) * d.m + i) * d.n + j]);
            *sj = dot * scale + add;
        }
        let mx = s.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if mx == f64::NEG_INFINITY {
            continue;
        }
        let sum: f64 = s.iter().map(|x| (x - mx).exp()).sum();
        lse[i] = mx + sum.ln();
        for j in 0..d.n {
            p[i * d.n + j] = (s[j] - lse[i]).exp();
        }
    }
    (p, lse)
}

fn keep_scale(extras: &RefExtras<'_>, d: &Dims, b: usize, h: usize, i: usize, j: usize) -> f64 {
    match extras.dropout {
        Some((z, p)) => {
            if z[((b * d.hq + h) * d.m + i) * d.n + j] as f64 >= p {
                1.0 / (1.0 - p)
            } else {
                0.0
            }
        }
        None => 1.0,
    }
}

/// Dense forward: `(out [B, M, Hq, Kv], lse [B, Hq, M])`.
pub fn ref_forward(
    q: &[f64],
    k: &[f64],
    v: &[f64],
    d: &Dims,
    scale: f64,
    mask: RefMask,
    extras: &RefExtras<'_>,
) -> (Vec<f64>, Vec<f64>) {
    let mut out = vec![0.0; d.b * d.m * d.hq * d.kv];
    let mut lse_all = vec![0.0; d.b * d.hq * d.m];
    for b in 0..d.b {
        for h in 0..d.hq {
            let hk = h / d.ratio();
            let (p, lse) = head_probs(q, k, d, b, h, scale, mask, extras.bias);
            lse_all[(b * d.hq + h) * d.m..(b * d.hq + h + 1) * d.m].copy_from_slice(&lse);
            for i in 0..d.m {
                for c in 0..d.kv {
                    out[((b * d.m + i) * d.hq + h) * d.kv + c] = (0..d.n)
                        .map(|j| {
                            p[i * d.n + j]
                                * keep_scale(extras, d, b, h, i, j)
                                * v[((b * d.n + j) * d.hkv + hk) * d.kv + c]
                        })
                        .sum();
                }
            }
        }
    }
    (out, lse_all)
}

/// Dense gradients `(dq, dk, dv, dbias [B, Hq, M, N])` of `Σ grad_out ∘ out`.
#[allow(clippy::too_many_arguments)]
pub fn ref_backward(
    q: &[f64],
    k: &[f64],
    v: &[f64],
    grad_out: &[f64],
    d: &Dims,
    scale: f64,
    mask: RefMask,
    extras: &RefExtras<'_>,
) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut dq = vec![0.0; q.len()];
    let mut dk = vec![0.0; k.len()];
    let mut dv = vec![0.0; v.len()];
    let mut dbias = vec![0.0; d.b * d.hq * d.m * d.n];
    let (out, _) = ref_forward(q, k, v, d, scale, mask, extras);
    let qi = |b: usize, i: usize, h: usize, c: usize| ((b * d.m + i) * d.hq + h) * d.k + c;
    let oi = |b: usize, i: usize, h: usize, c: usize| ((b * d.m + i) * d.hq + h) * d.kv + c;
    let ki = |b: usize, j: usize, h: usize, c: usize| ((b * d.n + j) * d.hkv + h) * d.k + c;
    let vi = |b: usize, j: usize, h: usize, c: usize| ((b * d.n + j) * d.hkv + h) * d.kv + c;

    for b in 0..d.b {
        for h in 0..d.hq {
            let hk = h / d.ratio();
            let (p, _) = head_probs(q, k, d, b, h, scale, mask, extras.bias);
            for i in 0..d.m {
                let row_d: f64 = (0..d.kv)
                    .map(|c| grad_out[oi(b, i, h, c)] * out[oi(b, i, h, c)])
                    .sum();
                for j in 0..d.n {
                    let pij = p[i * d.n + j];
                    if pij == 0.0 {
                        continue;
                    }
                    let z = keep_scale(extras, d, b, h, i, j);
                    for c in 0..d.kv {
                        dv[vi(b, j, hk, c)] += pij * z * grad_out[oi(b, i, h, c)];
                    }
                    let dp: f64 = (0..d.kv)
                        .map(|c| grad_out[oi(b, i, h, c)] * v[vi(b, j, hk, c)])
                        .sum();
                    let ds = pij * (z * dp - row_d);
                    dbias[((b * d.hq + h) * d.m + i) * d.n + j] = ds;
                    for c in 0..d.k {
                        dq[qi(b, i, h, c)] += scale * ds * k[ki(b, j, hk, c)];
                        dk[ki(b, j, hk, c)] += scale * ds * q[qi(b, i, h, c)];
                    }
                }
            }
        }
    }
    (dq, dk, dv, dbias)
}

/// `Σ grad_out ∘ out` of the dense forward, for finite differences.
pub fn ref_loss(
    q: &[f64],
    k: &[f64],
    v: &[f64],
    grad_out: &[f64],
    d: &Dims,
    scale: f64,
    mask: RefMask,
) -> f64 {
    let (out, _) = ref_forward(q, k, v, d, scale, mask, &RefExtras::default());
    out.iter().zip(grad_out).map(|(o, g)| o * g).sum()
}

/// The `[start, end)` rows of a packed `[1, total, H, D]` tensor's flat values.
pub fn packed_rows(values: &[f64], start: usize, end: usize, h: usize, dim: usize) -> Vec<f64> {
    values[start * h * dim..end * h * dim].to_vec()
}
