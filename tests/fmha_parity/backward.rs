//! Batched backward parity against the dense reference gradients.

use super::helpers::*;
use fmha::{
    BackwardOptions, DType, ErrorKind, FmhaConfig, ForwardOptions, MemoryEfficientAttentionOps,
    Tensor,
};

const ATOL: f64 = 5e-3;
const RTOL: f64 = 2e-2;

struct Case {
    d: Dims,
    dtype: DType,
    mask: i64,
    config: FmhaConfig,
}

impl Case {
    fn new(d: Dims) -> Self {
        Self {
            d,
            dtype: DType::F16,
            mask: 0,
            config: FmhaConfig::default(),
        }
    }

    fn mask(mut self, mask: i64) -> Self {
        self.mask = mask;
        self
    }

    fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    fn config(mut self, config: FmhaConfig) -> Self {
        self.config = config;
        self
    }

    fn scale(&self) -> f64 {
        1.0 / (self.d.k as f64).sqrt()
    }
}

/// Forward with log-sum-exp, then backward; returns the inputs and gradients.
fn run(case: &Case, q: &Tensor, k: &Tensor, v: &Tensor) -> (Tensor, fmha::BackwardOutput) {
    let client = setup_with(case.config.clone());
    let fwd = client
        .efficient_attention_forward(
            q,
            k,
            v,
            &ForwardOptions {
                custom_mask_type: case.mask,
                compute_logsumexp: true,
                ..Default::default()
            },
        )
        .unwrap();
    let grad_out = det_tensor(fwd.out.shape(), 13.0, case.dtype);
    let grads = client
        .efficient_attention_backward(
            &grad_out,
            q,
            k,
            v,
            fwd.logsumexp.as_ref().unwrap(),
            &fwd.out,
            &BackwardOptions {
                custom_mask_type: case.mask,
                ..Default::default()
            },
        )
        .unwrap();
    client.synchronize().unwrap();
    (grad_out, grads)
}

fn check(case: Case) {
    let d = case.d;
    let q = det_tensor(&[d.b, d.m, d.hq, d.k], 0.0, case.dtype);
    let k = det_tensor(&[d.b, d.n, d.hkv, d.k], 3.0, case.dtype);
    let v = det_tensor(&[d.b, d.n, d.hkv, d.kv], 7.0, case.dtype);
    let (grad_out, grads) = run(&case, &q, &k, &v);

    assert_eq!(grads.grad_q.shape(), q.shape());
    assert_eq!(grads.grad_k.shape(), k.shape());
    assert_eq!(grads.grad_v.shape(), v.shape());
    assert_eq!(grads.grad_q.dtype(), case.dtype);
    assert!(grads.grad_bias.is_none());

    let (dq, dk, dv, _) = ref_backward(
        &values(&q),
        &values(&k),
        &values(&v),
        &values(&grad_out),
        &d,
        case.scale(),
        RefMask::from_code(case.mask),
        &RefExtras::default(),
    );
    let atol = if case.dtype == DType::BF16 { 2e-2 } else { ATOL };
    assert_close(&grads.grad_q.to_vec_f32().unwrap(), &dq, atol, RTOL, "grad_q");
    assert_close(&grads.grad_k.to_vec_f32().unwrap(), &dk, atol, RTOL, "grad_k");
    assert_close(&grads.grad_v.to_vec_f32().unwrap(), &dv, atol, RTOL, "grad_v");
}

#[test]
fn test_backward_matches_reference() {
    check(Case::new(Dims::new(2, 9, 11, 2, 2, 64, 64)));
}

#[test]
fn test_backward_bf16() {
    check(Case::new(Dims::new(1, 8, 8, 2, 2, 32, 32)).dtype(DType::BF16));
}

#[test]
fn test_backward_shared_heads() {
    check(Case::new(Dims::new(2, 7, 9, 4, 2, 32, 32)));
    check(Case::new(Dims::new(1, 6, 6, 3, 1, 16, 24)).mask(1));
}

#[test]
fn test_backward_fp32_accumulation() {
    let config = FmhaConfig::default().with_fp32_qkv_grad(true);
    check(Case::new(Dims::new(1, 8, 10, 2, 2, 64, 64)).config(config.clone()));
    check(Case::new(Dims::new(2, 5, 5, 4, 1, 32, 32)).config(config));
}

#[test]
fn test_backward_causal() {
    check(Case::new(Dims::new(1, 8, 8, 2, 2, 64, 64)).mask(1));
    check(Case::new(Dims::new(1, 6, 10, 2, 2, 64, 64)).mask(2));
    // leading query rows fully masked
    check(Case::new(Dims::new(1, 9, 4, 1, 1, 32, 32)).mask(2));
}

#[test]
fn test_bias_gradient_sums_broadcast_dims() {
    let d = Dims::new(2, 5, 7, 2, 2, 32, 32);
    let client = setup();
    let q = det_tensor(&[d.b, d.m, d.hq, d.k], 0.0, DType::F16);
    let k = det_tensor(&[d.b, d.n, d.hkv, d.k], 3.0, DType::F16);
    let v = det_tensor(&[d.b, d.n, d.hkv, d.kv], 7.0, DType::F16);
    let bias = det_tensor(&[d.m, d.n], 5.0, DType::F16);

    let fwd = client
        .efficient_attention_forward(
            &q,
            &k,
            &v,
            &ForwardOptions {
                bias: Some(&bias),
                compute_logsumexp: true,
                ..Default::default()
            },
        )
        .unwrap();
    let grad_out = det_tensor(fwd.out.shape(), 13.0, DType::F16);
    let grads = client
        .efficient_attention_backward(
            &grad_out,
            &q,
            &k,
            &v,
            fwd.logsumexp.as_ref().unwrap(),
            &fwd.out,
            &BackwardOptions {
                bias: Some(&bias),
                bias_requires_grad: true,
                ..Default::default()
            },
        )
        .unwrap();
    client.synchronize().unwrap();

    let per_head = values(&bias);
    let full: Vec<f64> = (0..d.b * d.hq).flat_map(|_| per_head.iter().copied()).collect();
    let (dq, _, dv, dbias) = ref_backward(
        &values(&q),
        &values(&k),
        &values(&v),
        &values(&grad_out),
        &d,
        1.0 / (d.k as f64).sqrt(),
        RefMask::None,
        &RefExtras {
            bias: Some(&full),
            dropout: None,
        },
    );
    let mut summed = vec![0.0; d.m * d.n];
    for chunk in dbias.chunks(d.m * d.n) {
        summed.iter_mut().zip(chunk).for_each(|(s, x)| *s += x);
    }
    let grad_bias = grads.grad_bias.unwrap();
    assert_eq!(grad_bias.shape(), bias.shape());
    assert_eq!(grad_bias.strides(), bias.strides());
    assert_close(&grad_bias.to_vec_f32().unwrap(), &summed, 1e-2, RTOL, "grad_bias");
    assert_close(&grads.grad_q.to_vec_f32().unwrap(), &dq, ATOL, RTOL, "biased grad_q");
    assert_close(&grads.grad_v.to_vec_f32().unwrap(), &dv, ATOL, RTOL, "biased grad_v");
}

#[test]
fn test_bias_grad_without_bias_rejected() {
    let x = det_tensor(&[1, 4, 1, 64], 0.0, DType::F16);
    let lse = Tensor::zeros(&[1, 1, 4], DType::F32, fmha::Device::accelerator());
    let err = setup()
        .efficient_attention_backward(
            &x,
            &x,
            &x,
            &x,
            &lse,
            &x,
            &BackwardOptions {
                bias_requires_grad: true,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
}

#[test]
fn test_packed_qkv_gradients() {
    let d = Dims::new(1, 6, 6, 2, 2, 32, 32);
    let qkv = det_tensor(&[d.b, d.m, 3, d.hq, d.k], 0.0, DType::F16);
    let q = qkv.select(2, 0).unwrap();
    let k = qkv.select(2, 1).unwrap();
    let v = qkv.select(2, 2).unwrap();
    let case = Case::new(d).mask(1);
    let (grad_out, grads) = run(&case, &q, &k, &v);

    assert!(grads.grad_q.is_alias_of(&grads.grad_k));
    assert!(grads.grad_q.is_alias_of(&grads.grad_v));
    assert_eq!(grads.grad_k.strides(), k.strides());

    let (dq, dk, dv, _) = ref_backward(
        &values(&q),
        &values(&k),
        &values(&v),
        &values(&grad_out),
        &d,
        case.scale(),
        RefMask::TopLeft,
        &RefExtras::default(),
    );
    assert_close(&grads.grad_q.to_vec_f32().unwrap(), &dq, ATOL, RTOL, "packed grad_q");
    assert_close(&grads.grad_k.to_vec_f32().unwrap(), &dk, ATOL, RTOL, "packed grad_k");
    assert_close(&grads.grad_v.to_vec_f32().unwrap(), &dv, ATOL, RTOL, "packed grad_v");
}

#[test]
fn test_packed_qkv_gradients_match_separate_inputs() {
    let d = Dims::new(2, 5, 5, 2, 2, 32, 32);
    let qkv = det_tensor(&[d.b, d.m, 3, d.hq, d.k], 0.0, DType::F16);
    let packed: Vec<Tensor> = (0..3).map(|i| qkv.select(2, i).unwrap()).collect();
    let separate: Vec<Tensor> = packed.iter().map(|t| t.contiguous().unwrap()).collect();
    assert!(!separate[0].is_alias_of(&separate[1]));

    let case = Case::new(d).mask(2);
    let (_, aliased) = run(&case, &packed[0], &packed[1], &packed[2]);
    let (_, plain) = run(&case, &separate[0], &separate[1], &separate[2]);
    assert!(aliased.grad_q.is_alias_of(&aliased.grad_v));
    assert!(!plain.grad_q.is_alias_of(&plain.grad_v));
    for (a, b, what) in [
        (&aliased.grad_q, &plain.grad_q, "grad_q"),
        (&aliased.grad_k, &plain.grad_k, "grad_k"),
        (&aliased.grad_v, &plain.grad_v, "grad_v"),
    ] {
        assert_eq!(a.to_vec_f32().unwrap(), b.to_vec_f32().unwrap(), "{what}");
    }
}

#[test]
fn test_dropout_backward_regenerates_mask() {
    let d = Dims::new(1, 7, 9, 2, 2, 32, 32);
    let p = 0.25;
    let client = setup();
    let q = det_tensor(&[d.b, d.m, d.hq, d.k], 0.0, DType::F16);
    let k = det_tensor(&[d.b, d.n, d.hkv, d.k], 3.0, DType::F16);
    let v = det_tensor(&[d.b, d.n, d.hkv, d.kv], 7.0, DType::F16);
    let fwd = client
        .efficient_attention_forward(
            &q,
            &k,
            &v,
            &ForwardOptions {
                dropout_p: p,
                rng_seed: 99,
                rng_offset: 4,
                compute_logsumexp: true,
                return_randvals: true,
                ..Default::default()
            },
        )
        .unwrap();
    let grad_out = det_tensor(fwd.out.shape(), 13.0, DType::F16);
    let backward = |seed: u64| {
        let grads = client
            .efficient_attention_backward(
                &grad_out,
                &q,
                &k,
                &v,
                fwd.logsumexp.as_ref().unwrap(),
                &fwd.out,
                &BackwardOptions {
                    dropout_p: p,
                    rng_seed: seed,
                    rng_offset: fwd.philox_offset,
                    ..Default::default()
                },
            )
            .unwrap();
        client.synchronize().unwrap();
        grads
    };
    let grads = backward(fwd.philox_seed);

    let z = fwd.randvals.as_ref().unwrap().to_vec_f32().unwrap();
    let (dq, dk, dv, _) = ref_backward(
        &values(&q),
        &values(&k),
        &values(&v),
        &values(&grad_out),
        &d,
        1.0 / (d.k as f64).sqrt(),
        RefMask::None,
        &RefExtras {
            bias: None,
            dropout: Some((&z, p)),
        },
    );
    assert_close(&grads.grad_q.to_vec_f32().unwrap(), &dq, ATOL, RTOL, "dropout grad_q");
    assert_close(&grads.grad_k.to_vec_f32().unwrap(), &dk, ATOL, RTOL, "dropout grad_k");
    assert_close(&grads.grad_v.to_vec_f32().unwrap(), &dv, ATOL, RTOL, "dropout grad_v");

    let again = backward(fwd.philox_seed);
    assert_eq!(grads.grad_v.to_vec_f32().unwrap(), again.grad_v.to_vec_f32().unwrap());
}

/// Central differences of the reference loss at a spread of flat indices.
fn check_finite_differences(d: Dims, mask: i64) {
    let case = Case::new(d)
        .mask(mask)
        .config(FmhaConfig::default().with_fp32_qkv_grad(true));
    let q = det_tensor(&[d.b, d.m, d.hq, d.k], 0.0, DType::F16);
    let k = det_tensor(&[d.b, d.n, d.hkv, d.k], 3.0, DType::F16);
    let v = det_tensor(&[d.b, d.n, d.hkv, d.kv], 7.0, DType::F16);
    let (grad_out, grads) = run(&case, &q, &k, &v);

    let (qv, kv, vv, gv) = (values(&q), values(&k), values(&v), values(&grad_out));
    let scale = case.scale();
    let mask = RefMask::from_code(mask);
    let loss = |q: &[f64], k: &[f64], v: &[f64]| ref_loss(q, k, v, &gv, &d, scale, mask);
    let eps = 1e-4;
    // gradients come back rounded to f16
    let close = |got: f32, fd: f64| (got as f64 - fd).abs() < 2e-3 + 1e-2 * fd.abs();
    let spread = |len: usize| [0, len / 7, len / 3, len / 2 + 1, len - 1];
    let nudged = |x: &[f64], idx: usize, by: f64| {
        let mut x = x.to_vec();
        x[idx] += by;
        x
    };

    let dq = grads.grad_q.to_vec_f32().unwrap();
    for idx in spread(qv.len()) {
        let up = loss(&nudged(&qv, idx, eps), &kv, &vv);
        let fd = (up - loss(&nudged(&qv, idx, -eps), &kv, &vv)) / (2.0 * eps);
        assert!(close(dq[idx], fd), "dq[{idx}]: {} vs {fd}", dq[idx]);
    }
    let dk = grads.grad_k.to_vec_f32().unwrap();
    for idx in spread(kv.len()) {
        let up = loss(&qv, &nudged(&kv, idx, eps), &vv);
        let fd = (up - loss(&qv, &nudged(&kv, idx, -eps), &vv)) / (2.0 * eps);
        assert!(close(dk[idx], fd), "dk[{idx}]: {} vs {fd}", dk[idx]);
    }
    let dv = grads.grad_v.to_vec_f32().unwrap();
    for idx in spread(vv.len()) {
        let up = loss(&qv, &kv, &nudged(&vv, idx, eps));
        let fd = (up - loss(&qv, &kv, &nudged(&vv, idx, -eps))) / (2.0 * eps);
        assert!(close(dv[idx], fd), "dv[{idx}]: {} vs {fd}", dv[idx]);
    }
}

#[test]
fn test_gradients_match_finite_differences() {
    check_finite_differences(Dims::new(1, 4, 5, 2, 2, 8, 8), 0);
    check_finite_differences(Dims::new(1, 4, 5, 2, 1, 8, 8), 2);
}

/// Copy every head of a `[B, S, 1, D]` tensor `times` times along the head axis.
fn repeat_heads(t: &Tensor, times: usize) -> Tensor {
    let [b, s, h, dim] = [t.size(0), t.size(1), t.size(2), t.size(3)];
    assert_eq!(h, 1);
    let src = t.to_vec_f32().unwrap();
    let data: Vec<f32> = src
        .chunks(dim)
        .flat_map(|row| (0..times).flat_map(move |_| row.iter().copied()))
        .collect();
    Tensor::from_f32(&data, &[b, s, times, dim], t.dtype(), t.device()).unwrap()
}

#[test]
fn test_shared_heads_match_repeated_heads() {
    let d = Dims::new(2, 6, 7, 4, 1, 32, 32);
    let case = Case::new(d).mask(1);
    let q = det_tensor(&[d.b, d.m, d.hq, d.k], 0.0, DType::F16);
    let k = det_tensor(&[d.b, d.n, d.hkv, d.k], 3.0, DType::F16);
    let v = det_tensor(&[d.b, d.n, d.hkv, d.kv], 7.0, DType::F16);
    let (_, shared) = run(&case, &q, &k, &v);

    let repeated_case = Case::new(Dims::new(d.b, d.m, d.n, d.hq, d.hq, d.k, d.kv)).mask(1);
    let (k_rep, v_rep) = (repeat_heads(&k, d.hq), repeat_heads(&v, d.hq));
    let (_, repeated) = run(&repeated_case, &q, &k_rep, &v_rep);

    let folded = |t: &Tensor, dim: usize| -> Vec<f64> {
        t.to_vec_f32()
            .unwrap()
            .chunks(d.hq * dim)
            .flat_map(|row| {
                (0..dim).map(move |i| (0..d.hq).map(|h| row[h * dim + i] as f64).sum::<f64>())
            })
            .collect()
    };
    let got = |t: &Tensor| t.to_vec_f32().unwrap();
    assert_close(&got(&shared.grad_q), &values(&repeated.grad_q), 1e-3, 0.0, "grad_q");
    let (want_k, want_v) = (folded(&repeated.grad_k, d.k), folded(&repeated.grad_v, d.kv));
    assert_close(&got(&shared.grad_k), &want_k, 2e-3, 1e-2, "grad_k");
    assert_close(&got(&shared.grad_v), &want_v, 2e-3, 1e-2, "grad_v");
}
