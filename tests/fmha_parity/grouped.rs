//! Grouped (packed variable-length) forward and backward parity.

use super::helpers::*;
use fmha::{
    BackwardOptions, DType, Device, ErrorKind, FmhaConfig, ForwardOptions, InferPipeline,
    MemoryEfficientAttentionOps, Tensor,
};

const ATOL: f64 = 2e-3;
const RTOL: f64 = 1e-2;

/// One packed problem: query/key offsets per sequence plus optional key-length
/// overrides.
struct Packed {
    seqstart_q: Vec<i32>,
    seqstart_k: Vec<i32>,
    seqlen_k: Option<Vec<i32>>,
    hq: usize,
    hkv: usize,
    k: usize,
    kv: usize,
}

impl Packed {
    fn num_batches(&self) -> usize {
        self.seqstart_q.len() - 1
    }

    fn total_q(&self) -> usize {
        *self.seqstart_q.last().unwrap() as usize
    }

    fn total_k(&self) -> usize {
        *self.seqstart_k.last().unwrap() as usize
    }

    fn max_seqlen_q(&self) -> usize {
        self.seqstart_q.windows(2).map(|w| (w[1] - w[0]) as usize).max().unwrap_or(0)
    }

    /// `(q_start, m, k_start, n)` of sequence `i`.
    fn span(&self, i: usize) -> (usize, usize, usize, usize) {
        let q0 = self.seqstart_q[i] as usize;
        let m = self.seqstart_q[i + 1] as usize - q0;
        let k0 = self.seqstart_k[i] as usize;
        let n = match &self.seqlen_k {
            Some(lens) => lens[i] as usize,
            None => self.seqstart_k[i + 1] as usize - k0,
        };
        (q0, m, k0, n)
    }

    fn inputs(&self) -> (Tensor, Tensor, Tensor) {
        (
            det_tensor(&[1, self.total_q(), self.hq, self.k], 0.0, DType::F16),
            det_tensor(&[1, self.total_k(), self.hkv, self.k], 3.0, DType::F16),
            det_tensor(&[1, self.total_k(), self.hkv, self.kv], 7.0, DType::F16),
        )
    }

    fn tables(&self, device: Device) -> (Tensor, Tensor, Option<Tensor>) {
        (
            det_i32_tensor(&self.seqstart_q, device),
            det_i32_tensor(&self.seqstart_k, device),
            self.seqlen_k.as_ref().map(|l| det_i32_tensor(l, device)),
        )
    }

    fn dims(&self, i: usize) -> Dims {
        let (_, m, _, n) = self.span(i);
        Dims::new(1, m, n, self.hq, self.hkv, self.k, self.kv)
    }
}

fn forward_opts<'a>(
    p: &Packed,
    sq: &'a Tensor,
    sk: &'a Tensor,
    lens: Option<&'a Tensor>,
    mask: i64,
    lse: bool,
) -> ForwardOptions<'a> {
    ForwardOptions {
        seqstart_q: Some(sq),
        seqstart_k: Some(sk),
        seqlen_k: lens,
        max_seqlen_q: Some(p.max_seqlen_q()),
        custom_mask_type: mask,
        compute_logsumexp: lse,
        ..Default::default()
    }
}

/// Forward each sequence with the reference and compare rows and lse.
fn check_grouped_forward(
    p: &Packed,
    mask: i64,
    lse: bool,
    config: FmhaConfig,
    table_device: Device,
) {
    let client = setup_with(config);
    let (q, k, v) = p.inputs();
    let (sq, sk, lens) = p.tables(table_device);
    let opts = forward_opts(p, &sq, &sk, lens.as_ref(), mask, lse);
    let res = client.efficient_attention_forward(&q, &k, &v, &opts).unwrap();
    client.synchronize().unwrap();

    assert_eq!(res.out.shape(), &[1, p.total_q(), p.hq, p.kv]);
    let out = res.out.to_vec_f32().unwrap();
    let lse_vals = res.logsumexp.as_ref().map(|l| l.to_vec_f32().unwrap());
    if let Some(l) = &res.logsumexp {
        assert_eq!(l.shape(), &[p.num_batches(), p.hq, p.max_seqlen_q()]);
    }
    let (qv, kv, vv) = (values(&q), values(&k), values(&v));
    let scale = 1.0 / (p.k as f64).sqrt();
    for i in 0..p.num_batches() {
        let (q0, m, k0, n) = p.span(i);
        if m == 0 {
            continue;
        }
        let d = p.dims(i);
        let (want, want_lse) = ref_forward(
            &packed_rows(&qv, q0, q0 + m, p.hq, p.k),
            &packed_rows(&kv, k0, k0 + n, p.hkv, p.k),
            &packed_rows(&vv, k0, k0 + n, p.hkv, p.kv),
            &d,
            scale,
            RefMask::from_code(mask),
            &RefExtras::default(),
        );
        let got = &out[q0 * p.hq * p.kv..(q0 + m) * p.hq * p.kv];
        assert_close(got, &want, ATOL, RTOL, &format!("sequence {i} out"));
        if let Some(l) = &lse_vals {
            let row = p.max_seqlen_q();
            for h in 0..p.hq {
                for r in 0..m {
                    let g = l[(i * p.hq + h) * row + r] as f64;
                    let w = want_lse[h * m + r];
                    if w == f64::NEG_INFINITY {
                        assert_eq!(g, f64::NEG_INFINITY, "sequence {i} lse");
                    } else {
                        let at = format!("sequence {i} lse h={h} r={r}");
                        assert!((g - w).abs() < 1e-3, "{at}: {g} vs {w}");
                    }
                }
            }
        }
    }
}

fn three_sequences() -> Packed {
    Packed {
        seqstart_q: vec![0, 5, 5, 12],
        seqstart_k: vec![0, 7, 10, 19],
        seqlen_k: None,
        hq: 2,
        hkv: 2,
        k: 64,
        kv: 64,
    }
}

#[test]
fn test_grouped_forward_with_empty_sequence() {
    check_grouped_forward(&three_sequences(), 0, true, FmhaConfig::default(), Device::Host);
}

#[test]
fn test_grouped_causal() {
    check_grouped_forward(&three_sequences(), 1, true, FmhaConfig::default(), Device::Host);
    check_grouped_forward(&three_sequences(), 2, true, FmhaConfig::default(), Device::Host);
}

#[test]
fn test_grouped_tiled_reads_device_tables() {
    let config = FmhaConfig::default().with_infer_pipeline(InferPipeline::Tiled);
    check_grouped_forward(&three_sequences(), 0, false, config.clone(), Device::accelerator());
    check_grouped_forward(&three_sequences(), 2, false, config, Device::Host);
}

#[test]
fn test_grouped_seqlen_k_override() {
    let p = Packed {
        seqlen_k: Some(vec![4, 2, 9]),
        ..three_sequences()
    };
    check_grouped_forward(&p, 0, true, FmhaConfig::default(), Device::Host);
    check_grouped_forward(
        &p,
        0,
        false,
        FmhaConfig::default().with_infer_pipeline(InferPipeline::Tiled),
        Device::accelerator(),
    );
}

#[test]
fn test_grouped_shared_heads_odd_dims() {
    let p = Packed {
        seqstart_q: vec![0, 3, 9],
        seqstart_k: vec![0, 6, 8],
        seqlen_k: None,
        hq: 4,
        hkv: 2,
        k: 24,
        kv: 40,
    };
    check_grouped_forward(&p, 0, true, FmhaConfig::default(), Device::Host);
    check_grouped_forward(&p, 1, false, FmhaConfig::default(), Device::Host);
}

#[test]
fn test_grouped_rejects_bias_and_batch() {
    let p = three_sequences();
    let (q, k, v) = p.inputs();
    let (sq, sk, _) = p.tables(Device::Host);
    let bias = det_tensor(&[p.total_q(), p.total_k()], 0.0, DType::F16);
    let opts = ForwardOptions {
        bias: Some(&bias),
        ..forward_opts(&p, &sq, &sk, None, 0, false)
    };
    let err = setup().efficient_attention_forward(&q, &k, &v, &opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

    let q2 = det_tensor(&[2, p.total_q(), p.hq, p.k], 0.0, DType::F16);
    let k2 = det_tensor(&[2, p.total_k(), p.hkv, p.k], 0.0, DType::F16);
    let err = setup()
        .efficient_attention_forward(&q2, &k2, &k2, &forward_opts(&p, &sq, &sk, None, 0, false))
        .unwrap_err();
    assert!(err.to_string().contains("batch_size=1"), "{err}");
}

#[test]
fn test_grouped_requires_max_seqlen_q() {
    let p = three_sequences();
    let (q, k, v) = p.inputs();
    let (sq, sk, _) = p.tables(Device::Host);
    let opts = ForwardOptions {
        max_seqlen_q: None,
        ..forward_opts(&p, &sq, &sk, None, 0, false)
    };
    let err = setup().efficient_attention_forward(&q, &k, &v, &opts).unwrap_err();
    assert!(err.to_string().contains("'max_seqlen_q'"), "{err}");
}

#[cfg(not(feature = "disable-backward"))]
#[test]
fn test_grouped_backward_matches_reference() {
    let p = Packed {
        seqstart_q: vec![0, 4, 4, 10],
        seqstart_k: vec![0, 5, 8, 14],
        seqlen_k: None,
        hq: 2,
        hkv: 1,
        k: 32,
        kv: 32,
    };
    for mask in [0, 2] {
        let client = setup();
        let (q, k, v) = p.inputs();
        let (sq, sk, _) = p.tables(Device::Host);
        let fwd = client
            .efficient_attention_forward(&q, &k, &v, &forward_opts(&p, &sq, &sk, None, mask, true))
            .unwrap();
        let grad_out = det_tensor(fwd.out.shape(), 13.0, DType::F16);
        let bwd_opts = BackwardOptions {
            seqstart_q: Some(&sq),
            seqstart_k: Some(&sk),
            max_seqlen_q: Some(p.max_seqlen_q()),
            custom_mask_type: mask,
            ..Default::default()
        };
        let lse = fwd.logsumexp.as_ref().unwrap();
        let grads = client
            .efficient_attention_backward(&grad_out, &q, &k, &v, lse, &fwd.out, &bwd_opts)
            .unwrap();
        client.synchronize().unwrap();

        let (qv, kv, vv, gv) = (values(&q), values(&k), values(&v), values(&grad_out));
        let (dq, dk, dv) = (
            grads.grad_q.to_vec_f32().unwrap(),
            grads.grad_k.to_vec_f32().unwrap(),
            grads.grad_v.to_vec_f32().unwrap(),
        );
        for i in 0..p.num_batches() {
            let (q0, m, k0, n) = p.span(i);
            if m == 0 {
                continue;
            }
            let (want_dq, want_dk, want_dv, _) = ref_backward(
                &packed_rows(&qv, q0, q0 + m, p.hq, p.k),
                &packed_rows(&kv, k0, k0 + n, p.hkv, p.k),
                &packed_rows(&vv, k0, k0 + n, p.hkv, p.kv),
                &packed_rows(&gv, q0, q0 + m, p.hq, p.kv),
                &p.dims(i),
                1.0 / (p.k as f64).sqrt(),
                RefMask::from_code(mask),
                &RefExtras::default(),
            );
            let what = |t: &str| format!("mask {mask} sequence {i} {t}");
            let q_rows = q0 * p.hq * p.k..(q0 + m) * p.hq * p.k;
            let k_rows = k0 * p.hkv * p.k..(k0 + n) * p.hkv * p.k;
            let v_rows = k0 * p.hkv * p.kv..(k0 + n) * p.hkv * p.kv;
            assert_close(&dq[q_rows], &want_dq, 5e-3, 2e-2, &what("dq"));
            assert_close(&dk[k_rows], &want_dk, 5e-3, 2e-2, &what("dk"));
            assert_close(&dv[v_rows], &want_dv, 5e-3, 2e-2, &what("dv"));
        }
        // keys of the empty query sequence get no gradient
        let (_, _, k0, n) = p.span(1);
        assert!(dk[k0 * p.hkv * p.k..(k0 + n) * p.hkv * p.k].iter().all(|&x| x == 0.0));
    }
}
