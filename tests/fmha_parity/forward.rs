//! Batched forward parity: both pipelines against the dense reference.

use super::helpers::*;
use fmha::{
    DType, Device, ErrorKind, FmhaConfig, ForwardOptions, InferPipeline,
    MemoryEfficientAttentionOps, Tensor,
};

const F16_ATOL: f64 = 2e-3;
const BF16_ATOL: f64 = 1e-2;
const RTOL: f64 = 1e-2;

fn qkv(d: &Dims, dtype: DType) -> (Tensor, Tensor, Tensor) {
    (
        det_tensor(&[d.b, d.m, d.hq, d.k], 0.0, dtype),
        det_tensor(&[d.b, d.n, d.hkv, d.k], 3.0, dtype),
        det_tensor(&[d.b, d.n, d.hkv, d.kv], 7.0, dtype),
    )
}

fn assert_lse(got: &[f32], want: &[f64], what: &str) {
    assert_eq!(got.len(), want.len());
    for (i, (&g, &w)) in got.iter().zip(want).enumerate() {
        if w == f64::NEG_INFINITY {
            assert_eq!(g, f32::NEG_INFINITY, "{what} at {i}: fully masked row");
        } else {
            assert!((g as f64 - w).abs() < 1e-3, "{what} at {i}: {g} vs {w}");
        }
    }
}

/// Run one batched forward and compare out (and lse when requested).
fn check_forward(d: Dims, dtype: DType, mask_code: i64, lse: bool, config: FmhaConfig) {
    let client = setup_with(config);
    let (q, k, v) = qkv(&d, dtype);
    let opts = ForwardOptions {
        custom_mask_type: mask_code,
        compute_logsumexp: lse,
        ..Default::default()
    };
    let res = client.efficient_attention_forward(&q, &k, &v, &opts).unwrap();
    client.synchronize().unwrap();

    let scale = 1.0 / (d.k as f64).sqrt();
    let (want, want_lse) = ref_forward(
        &values(&q),
        &values(&k),
        &values(&v),
        &d,
        scale,
        RefMask::from_code(mask_code),
        &RefExtras::default(),
    );
    let atol = if dtype == DType::BF16 { BF16_ATOL } else { F16_ATOL };
    assert_eq!(res.out.shape(), &[d.b, d.m, d.hq, d.kv]);
    assert_close(&res.out.to_vec_f32().unwrap(), &want, atol, RTOL, "out");
    match res.logsumexp {
        Some(l) => {
            assert!(lse);
            assert_eq!(l.shape(), &[d.b, d.hq, d.m]);
            assert_eq!(l.dtype(), DType::F32);
            assert_lse(&l.to_vec_f32().unwrap(), &want_lse, "lse");
        }
        None => assert!(!lse),
    }
}

#[test]
fn test_forward_with_logsumexp() {
    check_forward(Dims::new(2, 9, 11, 2, 2, 64, 64), DType::F16, 0, true, FmhaConfig::default());
}

#[test]
fn test_forward_bf16() {
    check_forward(Dims::new(1, 12, 12, 2, 2, 32, 32), DType::BF16, 0, true, FmhaConfig::default());
}

#[test]
fn test_forward_f32_unmapped() {
    let d = Dims::new(1, 7, 5, 1, 1, 16, 16);
    let (q, k, v) = qkv(&d, DType::F32);
    let err = setup()
        .efficient_attention_forward(&q, &k, &v, &ForwardOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnmappedDispatchValue);
    assert_eq!(err.to_string(), "input data-type is not supported: f32");
}

#[test]
fn test_causal_top_left_rectangular() {
    check_forward(Dims::new(1, 6, 10, 2, 2, 64, 64), DType::F16, 1, true, FmhaConfig::default());
}

#[test]
fn test_causal_bottom_right_rectangular() {
    check_forward(Dims::new(1, 6, 10, 2, 2, 64, 64), DType::F16, 2, true, FmhaConfig::default());
    // more queries than keys: leading rows see nothing
    check_forward(Dims::new(1, 10, 4, 1, 1, 64, 64), DType::F16, 2, true, FmhaConfig::default());
}

#[test]
fn test_multi_query_heads() {
    check_forward(Dims::new(2, 8, 8, 4, 1, 64, 64), DType::F16, 0, true, FmhaConfig::default());
    check_forward(Dims::new(1, 8, 8, 6, 2, 32, 32), DType::F16, 1, false, FmhaConfig::default());
}

#[test]
fn test_odd_head_dims() {
    // no tile instance: served by the device op with narrow vectors
    check_forward(Dims::new(1, 5, 7, 2, 2, 20, 12), DType::F16, 0, false, FmhaConfig::default());
    check_forward(Dims::new(1, 5, 7, 1, 1, 17, 9), DType::F16, 1, true, FmhaConfig::default());
}

#[test]
fn test_pipelines_agree() {
    let d = Dims::new(2, 13, 21, 4, 2, 128, 128);
    for mask in [0, 1, 2] {
        let (q, k, v) = qkv(&d, DType::F16);
        let opts = ForwardOptions {
            custom_mask_type: mask,
            ..Default::default()
        };
        let tiled = setup_with(FmhaConfig::default().with_infer_pipeline(InferPipeline::Tiled));
        let legacy = setup_with(FmhaConfig::default().with_infer_pipeline(InferPipeline::DeviceOp));
        let a = tiled.efficient_attention_forward(&q, &k, &v, &opts).unwrap();
        let b = legacy.efficient_attention_forward(&q, &k, &v, &opts).unwrap();
        tiled.synchronize().unwrap();
        legacy.synchronize().unwrap();
        let b_vals: Vec<f64> = values(&b.out);
        assert_close(&a.out.to_vec_f32().unwrap(), &b_vals, F16_ATOL, RTOL, "tiled vs device op");
    }
}

#[test]
fn test_tiled_rejects_unsupported_head_dim() {
    let d = Dims::new(1, 4, 4, 1, 1, 32, 32);
    let (q, k, v) = qkv(&d, DType::F16);
    let client = setup_with(FmhaConfig::default().with_infer_pipeline(InferPipeline::Tiled));
    let err = client
        .efficient_attention_forward(&q, &k, &v, &ForwardOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnmappedDispatchValue);
}

fn bias_run(bias: &Tensor, bias_full: &[f64], d: Dims, mask_code: i64) {
    let client = setup();
    let (q, k, v) = qkv(&d, DType::F16);
    let opts = ForwardOptions {
        bias: Some(bias),
        custom_mask_type: mask_code,
        compute_logsumexp: true,
        ..Default::default()
    };
    let res = client.efficient_attention_forward(&q, &k, &v, &opts).unwrap();
    client.synchronize().unwrap();
    let (want, want_lse) = ref_forward(
        &values(&q),
        &values(&k),
        &values(&v),
        &d,
        1.0 / (d.k as f64).sqrt(),
        RefMask::from_code(mask_code),
        &RefExtras {
            bias: Some(bias_full),
            dropout: None,
        },
    );
    assert_close(&res.out.to_vec_f32().unwrap(), &want, F16_ATOL, RTOL, "biased out");
    assert_lse(&res.logsumexp.unwrap().to_vec_f32().unwrap(), &want_lse, "biased lse");
}

#[test]
fn test_bias_2d_broadcast() {
    let d = Dims::new(2, 6, 9, 2, 2, 64, 64);
    let bias = det_tensor(&[d.m, d.n], 11.0, DType::F16);
    let per_head = values(&bias);
    let full: Vec<f64> = (0..d.b * d.hq).flat_map(|_| per_head.iter().copied()).collect();
    bias_run(&bias, &full, d, 0);
}

#[test]
fn test_bias_3d_per_head() {
    let d = Dims::new(2, 6, 9, 2, 1, 64, 64);
    let bias = det_tensor(&[d.b * d.hq, d.m, d.n], 5.0, DType::F16);
    let full = values(&bias);
    bias_run(&bias, &full, d, 1);
}

#[test]
fn test_bias_dtype_mismatch_rejected() {
    let d = Dims::new(1, 4, 4, 1, 1, 64, 64);
    let (q, k, v) = qkv(&d, DType::F16);
    let bias = det_tensor(&[4, 4], 0.0, DType::F32);
    let opts = ForwardOptions {
        bias: Some(&bias),
        ..Default::default()
    };
    let err = setup().efficient_attention_forward(&q, &k, &v, &opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
}

#[test]
fn test_large_window_matches_unwindowed() {
    let d = Dims::new(1, 16, 16, 2, 2, 64, 64);
    let (q, k, v) = qkv(&d, DType::F16);
    let client = setup();
    let plain = client
        .efficient_attention_forward(&q, &k, &v, &ForwardOptions::default())
        .unwrap();
    let wide = client
        .efficient_attention_forward(
            &q,
            &k,
            &v,
            &ForwardOptions {
                window_size: 64,
                ..Default::default()
            },
        )
        .unwrap();
    client.synchronize().unwrap();
    assert_close(&wide.out.to_vec_f32().unwrap(), &values(&plain.out), 1e-3, 0.0, "wide window");
}

#[test]
fn test_local_window() {
    let d = Dims::new(1, 16, 16, 2, 2, 64, 64);
    let (q, k, v) = qkv(&d, DType::F16);
    let client = setup();
    let res = client
        .efficient_attention_forward(
            &q,
            &k,
            &v,
            &ForwardOptions {
                window_size: 6,
                ..Default::default()
            },
        )
        .unwrap();
    client.synchronize().unwrap();
    let (want, _) = ref_forward(
        &values(&q),
        &values(&k),
        &values(&v),
        &d,
        0.125,
        RefMask::Window(3),
        &RefExtras::default(),
    );
    assert_close(&res.out.to_vec_f32().unwrap(), &want, F16_ATOL, RTOL, "windowed out");
}

#[test]
fn test_dropout_matches_randvals() {
    let d = Dims::new(2, 7, 9, 2, 1, 32, 32);
    let p = 0.3;
    let (q, k, v) = qkv(&d, DType::F16);
    let client = setup();
    let opts = ForwardOptions {
        dropout_p: p,
        rng_seed: 1234,
        rng_offset: 17,
        compute_logsumexp: true,
        return_randvals: true,
        ..Default::default()
    };
    let res = client.efficient_attention_forward(&q, &k, &v, &opts).unwrap();
    client.synchronize().unwrap();
    assert_eq!((res.philox_seed, res.philox_offset), (1234, 17));

    let randvals = res.randvals.unwrap();
    assert_eq!(randvals.shape(), &[d.b, d.hq, d.m, d.n]);
    let z = randvals.to_vec_f32().unwrap();
    assert!(z.iter().all(|&x| (0.0..1.0).contains(&x)));
    let dropped = z.iter().filter(|&&x| (x as f64) < p).count();
    assert!(dropped > 0 && dropped < z.len());

    let (want, want_lse) = ref_forward(
        &values(&q),
        &values(&k),
        &values(&v),
        &d,
        1.0 / (d.k as f64).sqrt(),
        RefMask::None,
        &RefExtras {
            bias: None,
            dropout: Some((&z, p)),
        },
    );
    assert_close(&res.out.to_vec_f32().unwrap(), &want, F16_ATOL, RTOL, "dropout out");
    // log-sum-exp is of the undropped scores
    assert_lse(&res.logsumexp.unwrap().to_vec_f32().unwrap(), &want_lse, "dropout lse");
}

#[test]
fn test_dropout_is_deterministic_per_seed() {
    let d = Dims::new(1, 8, 8, 2, 2, 64, 64);
    let (q, k, v) = qkv(&d, DType::F16);
    let client = setup();
    let run = |seed: u64| {
        let opts = ForwardOptions {
            dropout_p: 0.5,
            rng_seed: seed,
            ..Default::default()
        };
        let res = client.efficient_attention_forward(&q, &k, &v, &opts).unwrap();
        client.synchronize().unwrap();
        res.out.to_vec_f32().unwrap()
    };
    assert_eq!(run(7), run(7));
    assert_ne!(run(7), run(8));
}

#[test]
fn test_non_contiguous_query() {
    let d = Dims::new(1, 6, 6, 2, 2, 64, 64);
    let client = setup();
    // query as a slice of a wider packed buffer: [B, M, 2*Hq, K] narrowed on heads
    let packed = det_tensor(&[d.b, d.m, 2 * d.hq, d.k], 1.0, DType::F16);
    let q = packed.narrow(2, d.hq, d.hq).unwrap();
    assert!(!q.is_contiguous());
    let (_, k, v) = qkv(&d, DType::F16);
    let res = client
        .efficient_attention_forward(&q, &k, &v, &ForwardOptions::default())
        .unwrap();
    client.synchronize().unwrap();
    let (want, _) = ref_forward(
        &values(&q),
        &values(&k),
        &values(&v),
        &d,
        0.125,
        RefMask::None,
        &RefExtras::default(),
    );
    assert_close(&res.out.to_vec_f32().unwrap(), &want, F16_ATOL, RTOL, "strided query");
}

#[test]
fn test_explicit_scale() {
    let d = Dims::new(1, 5, 5, 1, 1, 64, 64);
    let (q, k, v) = qkv(&d, DType::F16);
    let client = setup();
    let res = client
        .efficient_attention_forward(
            &q,
            &k,
            &v,
            &ForwardOptions {
                scale: Some(0.7),
                ..Default::default()
            },
        )
        .unwrap();
    client.synchronize().unwrap();
    let (want, _) = ref_forward(
        &values(&q),
        &values(&k),
        &values(&v),
        &d,
        0.7f32 as f64,
        RefMask::None,
        &RefExtras::default(),
    );
    assert_close(&res.out.to_vec_f32().unwrap(), &want, F16_ATOL, RTOL, "scaled out");
}

#[test]
fn test_host_inputs_rejected() {
    let q = Tensor::zeros(&[1, 4, 1, 64], DType::F16, Device::Host);
    let k = Tensor::zeros(&[1, 4, 1, 64], DType::F16, Device::accelerator());
    let err = setup()
        .efficient_attention_forward(&q, &k, &k, &ForwardOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
}
