// Device Tests: the GPU backend against the host interpreter
//
// Needs a CUDA device; run with `cargo test -p strata-cuda --features cuda`.
// Every test builds the same graph twice, runs it through both backends
// and compares the results.

#![cfg(feature = "cuda")]

use strata::prelude::*;
use strata_cuda::{GpuBackend, GpuConfig};

fn gpu() -> GpuBackend {
    let _ = env_logger::builder().is_test(true).try_init();
    GpuBackend::new(GpuConfig::default()).expect("CUDA device 0 not available")
}

fn ramp(shape: &[usize], scale: f64) -> HostTensor {
    let n: usize = shape.iter().product();
    let data = (0..n).map(|i| ((i as f64) * 0.731).sin() * scale).collect();
    HostTensor::new(shape.to_vec(), data).unwrap()
}

/// Run `build` on the host and on the GPU with the same config and args.
fn both<F>(build: F, config: TransformerConfig, args: &[HostTensor]) -> (Vec<HostTensor>, Vec<HostTensor>)
where
    F: Fn() -> (GraphBuilder, Vec<OpId>, Vec<OpId>),
{
    let values: Vec<Value> = args.iter().cloned().map(Value::from).collect();

    let (g, returns, params) = build();
    let mut host = Transformer::new(g, HostBackend::new(), config.clone());
    let f = host.computation(returns, &params).unwrap();
    let expected = host.call(f, &values).unwrap().into_tuple().unwrap();

    let (g, returns, params) = build();
    let mut device = Transformer::new(g, gpu(), config);
    let f = device.computation(returns, &params).unwrap();
    let got = device.call(f, &values).unwrap().into_tuple().unwrap();
    (expected, got)
}

fn assert_close(expected: &[HostTensor], got: &[HostTensor], tol: f64) {
    assert_eq!(expected.len(), got.len());
    for (i, (e, g)) in expected.iter().zip(got).enumerate() {
        assert_eq!(e.shape(), g.shape(), "result {}", i);
        let diff = e.max_abs_diff(g);
        assert!(diff <= tol, "result {} differs by {}", i, diff);
    }
}

fn mlp() -> (GraphBuilder, Vec<OpId>, Vec<OpId>) {
    let c = Axis::named("C", 5);
    let h = Axis::named("H", 7);
    let n = Axis::batch(4);
    let mut g = GraphBuilder::new();
    let w = g.placeholder([h.clone(), c.clone()]);
    let x = g.placeholder([c, n.clone()]);
    let t = g.placeholder([h, n]);
    let z = g.dot(w, x).unwrap();
    let y = g.softmax(z).unwrap();
    let ce = g.cross_entropy_multi(y, t).unwrap();
    let loss = g.sum(ce, Reduction::All).unwrap();
    let dw = deriv(&mut g, loss, w).unwrap();
    (g, vec![loss, dw], vec![w, x, t])
}

#[test]
fn test_mlp_matches_host() {
    let mut target = vec![0.0; 28];
    for col in 0..4 {
        target[(2 * col + 1) % 7 * 4 + col] = 1.0;
    }
    let args = [
        ramp(&[7, 5], 0.5),
        ramp(&[5, 4], 1.0),
        HostTensor::new(vec![7, 4], target).unwrap(),
    ];
    let config = TransformerConfig::default().with_dtype(DType::F64);
    let (expected, got) = both(mlp, config, &args);
    assert_close(&expected, &got, 1e-10);
}

#[test]
fn test_f32_with_fusion_matches_host() {
    let build = || {
        let a = Axis::named("A", 33);
        let b = Axis::named("B", 17);
        let mut g = GraphBuilder::new();
        let x = g.placeholder([a.clone(), b.clone()]);
        let v = g.placeholder([b.clone()]);
        let s = g.add(x, v);
        let t = g.tanh(s);
        let e = g.exp(t);
        let m = g.max(e, Reduction::over([a])).unwrap();
        let r = g.subtract(e, m);
        let total = g.sum(r, Reduction::All).unwrap();
        let dx = deriv(&mut g, total, x).unwrap();
        (g, vec![total, dx], vec![x, v])
    };
    let args = [ramp(&[33, 17], 1.0), ramp(&[17], 0.3)];
    for fusion in [false, true] {
        let config = TransformerConfig::default().with_fusion(fusion);
        let (expected, got) = both(build, config, &args);
        assert_close(&expected, &got, 1e-4);
    }
}

#[test]
fn test_conv_and_pool_match_host() {
    let build = || {
        let input = Axes::new([
            Axis::named("C", 2),
            Axis::named("D", 1),
            Axis::named("H", 6),
            Axis::named("W", 5),
            Axis::batch(3),
        ]);
        let filter = Axes::new([
            Axis::named("C", 2),
            Axis::named("T", 1),
            Axis::named("R", 3),
            Axis::named("S", 2),
            Axis::named("K", 4),
        ]);
        let mut g = GraphBuilder::new();
        let x = g.placeholder(input);
        let w = g.placeholder(filter);
        let params = ConvParams::new().with_padding([0, 1, 0]).with_stride([1, 1, 2]);
        let y = g.convolution(params, x, w).unwrap();
        let p = g
            .pooling(PoolParams::max([1, 1, 2, 2]).with_stride([1, 1, 2, 1]), y)
            .unwrap();
        let sq = g.square(p);
        let loss = g.sum(sq, Reduction::All).unwrap();
        let dx = deriv(&mut g, loss, x).unwrap();
        let dw = deriv(&mut g, loss, w).unwrap();
        (g, vec![loss, dx, dw], vec![x, w])
    };
    let args = [ramp(&[2, 1, 6, 5, 3], 1.0), ramp(&[2, 1, 3, 2, 4], 0.5)];
    let config = TransformerConfig::default().with_dtype(DType::F64);
    let (expected, got) = both(build, config, &args);
    assert_close(&expected, &got, 1e-10);
}

#[test]
fn test_half_storage_rounds_like_host() {
    let build = || {
        let a = Axis::named("A", 10);
        let mut g = GraphBuilder::new();
        let x = g.placeholder([a]);
        let s = g.sin(x);
        let y = g.multiply(s, x);
        (g, vec![y], vec![x])
    };
    let config = TransformerConfig::default().with_dtype(DType::F16);
    let (expected, got) = both(build, config, &[ramp(&[10], 3.0)]);
    assert_close(&expected, &got, 1e-2);
}
