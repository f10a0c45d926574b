// Autodiff Tests: symbolic gradients against central differences
//
// Every check builds a scalar loss over one or more placeholders, asks for
// deriv(loss, x) and compares it, element by element, with
// (loss(x + h) - loss(x - h)) / 2h computed by the same transformer in F64.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use strata::prelude::*;

const H: f64 = 1e-5;
const TOL: f64 = 1e-5;

fn f64_transformer(g: GraphBuilder) -> Transformer<HostBackend> {
    let config = TransformerConfig::default().with_dtype(DType::F64);
    Transformer::new(g, HostBackend::new(), config)
}

fn random_tensor(rng: &mut StdRng, shape: &[usize], lo: f64, hi: f64) -> HostTensor {
    let n = shape.iter().product();
    let data = (0..n).map(|_| rng.gen_range(lo..hi)).collect();
    HostTensor::new(shape.to_vec(), data).unwrap()
}

/// Compare deriv(loss, p) with central differences at `args` for every p.
fn check_gradients(mut g: GraphBuilder, loss: OpId, params: &[OpId], args: &[HostTensor]) {
    let mut returns = vec![loss];
    for &p in params {
        returns.push(deriv(&mut g, loss, p).unwrap());
    }
    let mut t = f64_transformer(g);
    let f = t.computation(returns, params).unwrap();

    let values: Vec<Value> = args.iter().cloned().map(Value::from).collect();
    let out = t.call(f, &values).unwrap().into_tuple().unwrap();

    for (wrt, arg) in args.iter().enumerate() {
        let symbolic = out[wrt + 1].data().to_vec();
        assert_eq!(symbolic.len(), arg.elem_count());
        for (i, &sym) in symbolic.iter().enumerate() {
            let mut eval = |delta: f64| {
                let mut data = arg.data().to_vec();
                data[i] += delta;
                let mut vals = values.clone();
                vals[wrt] = HostTensor::new(arg.shape().to_vec(), data).unwrap().into();
                let out = t.call(f, &vals).unwrap().into_tuple().unwrap();
                out[0].to_scalar().unwrap()
            };
            let numeric = (eval(H) - eval(-H)) / (2.0 * H);
            assert!(
                (numeric - sym).abs() < TOL * (1.0 + numeric.abs()),
                "param {} elem {}: numeric {} vs symbolic {}",
                wrt,
                i,
                numeric,
                sym
            );
        }
    }
}

fn axes_ab() -> (Axis, Axis) {
    (Axis::named("A", 3), Axis::named("B", 2))
}

#[test]
fn test_elementwise_chain() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut g = GraphBuilder::new();
    let (a, b) = axes_ab();
    let x = g.placeholder([a, b]);
    let t1 = g.tanh(x);
    let e = g.exp(t1);
    let s = g.sin(x);
    let m = g.multiply(e, s);
    let c = g.cos(m);
    let loss = g.sum(c, Reduction::All).unwrap();
    let arg = random_tensor(&mut rng, &[3, 2], -1.0, 1.0);
    check_gradients(g, loss, &[x], &[arg]);
}

#[test]
fn test_division_and_powers() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut g = GraphBuilder::new();
    let (a, b) = axes_ab();
    let x = g.placeholder([a.clone(), b.clone()]);
    let y = g.placeholder([b]);
    let q = g.divide(x, y);
    let sq = g.square(q);
    let r = g.sqrt(x);
    let rec = g.reciprocal(y);
    let p = g.power(x, rec);
    let l = g.log(x);
    let s1 = g.add(sq, r);
    let s2 = g.add(p, l);
    let s = g.subtract(s1, s2);
    let loss = g.sum(s, Reduction::All).unwrap();
    let xa = random_tensor(&mut rng, &[3, 2], 0.5, 2.0);
    let ya = random_tensor(&mut rng, &[2], 0.5, 2.0);
    check_gradients(g, loss, &[x, y], &[xa, ya]);
}

#[test]
fn test_broadcast_reduce_and_max() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut g = GraphBuilder::new();
    let (a, b) = axes_ab();
    let x = g.placeholder([a.clone(), b.clone()]);
    let v = g.placeholder([b.clone()]);
    let sum = g.add(x, v);
    let abs = g.absolute(sum);
    let rowmax = g.max(abs, Reduction::over([b.clone()])).unwrap();
    let colmin = g.min(x, Reduction::over([a])).unwrap();
    let mx = g.maximum(x, v);
    let mxs = g.sum(mx, Reduction::All).unwrap();
    let r1 = g.sum(rowmax, Reduction::All).unwrap();
    let r2 = g.sum(colmin, Reduction::All).unwrap();
    let l1 = g.add(r1, r2);
    let loss = g.add(l1, mxs);
    let xa = random_tensor(&mut rng, &[3, 2], -1.0, 1.0);
    let va = random_tensor(&mut rng, &[2], -1.0, 1.0);
    check_gradients(g, loss, &[x, v], &[xa, va]);
}

#[test]
fn test_dot_chain() {
    let mut rng = StdRng::seed_from_u64(4);
    let mut g = GraphBuilder::new();
    let c = Axis::named("C", 3);
    let d = Axis::named("D", 4);
    let n = Axis::batch(2);
    let w = g.placeholder([d.clone(), c.clone()]);
    let x = g.placeholder([c, n]);
    let h = g.dot(w, x).unwrap();
    let act = g.tanh(h);
    let sq = g.square(act);
    let loss = g.sum(sq, Reduction::All).unwrap();
    let wa = random_tensor(&mut rng, &[4, 3], -1.0, 1.0);
    let xa = random_tensor(&mut rng, &[3, 2], -1.0, 1.0);
    check_gradients(g, loss, &[w, x], &[wa, xa]);
}

#[test]
fn test_slices_pad_and_expand_dims() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut g = GraphBuilder::new();
    let a = Axis::named("A", 5);
    let x = g.placeholder([a]);
    let rev = g.slice(x, &[SliceItem::Range(AxisSlice::reversed())], None).unwrap();
    let part = g.slice(rev, &[SliceItem::Range(AxisSlice::range(1, 4))], None).unwrap();
    let padded = g.pad(part, &[(2, 1)], None).unwrap();
    let e = Axis::named("E", 2);
    let wide = g.expand_dims(padded, e, 0);
    let sq = g.square(wide);
    let first = g.slice(x, &[SliceItem::Index(0)], None).unwrap();
    let s = g.sum(sq, Reduction::All).unwrap();
    let scaled = g.multiply(s, first);
    let loss = g.add(scaled, first);
    let arg = random_tensor(&mut rng, &[5], -1.0, 1.0);
    check_gradients(g, loss, &[x], &[arg]);
}

#[test]
fn test_sigmoid_and_binary_cross_entropy() {
    let mut rng = StdRng::seed_from_u64(6);
    let mut g = GraphBuilder::new();
    let (a, b) = axes_ab();
    let x = g.placeholder([a.clone(), b.clone()]);
    let t = g.placeholder([a, b]);
    let y = g.sigmoid(x);
    let loss = g.cross_entropy_binary(y, t, Reduction::All).unwrap();
    let xa = random_tensor(&mut rng, &[3, 2], -2.0, 2.0);
    let ta = random_tensor(&mut rng, &[3, 2], 0.0, 1.0);
    check_gradients(g, loss, &[x, t], &[xa, ta]);
}

#[test]
fn test_softmax_cross_entropy() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut g = GraphBuilder::new();
    let c = Axis::named("C", 4);
    let n = Axis::batch(3);
    let x = g.placeholder([c.clone(), n.clone()]);
    let t = g.placeholder([c, n]);
    let y = g.softmax(x).unwrap();
    let ce = g.cross_entropy_multi(y, t).unwrap();
    let loss = g.sum(ce, Reduction::All).unwrap();
    let xa = random_tensor(&mut rng, &[4, 3], -2.0, 2.0);
    // Columns of the target sum to one.
    let ta = HostTensor::new(
        vec![4, 3],
        vec![0.1, 0.0, 0.25, 0.2, 1.0, 0.25, 0.3, 0.0, 0.25, 0.4, 0.0, 0.25],
    )
    .unwrap();
    check_gradients(g, loss, &[x, t], &[xa, ta]);
}

#[test]
fn test_convolution_gradients() {
    let mut rng = StdRng::seed_from_u64(8);
    let mut g = GraphBuilder::new();
    let input = Axes::new([
        Axis::named("C", 2),
        Axis::named("D", 1),
        Axis::named("H", 4),
        Axis::named("W", 3),
        Axis::batch(2),
    ]);
    let filter = Axes::new([
        Axis::named("C", 2),
        Axis::named("T", 1),
        Axis::named("R", 2),
        Axis::named("S", 2),
        Axis::named("K", 3),
    ]);
    let x = g.placeholder(input);
    let w = g.placeholder(filter);
    let params = ConvParams::new().with_padding([0, 1, 1]).with_stride([1, 2, 1]);
    let y = g.convolution(params, x, w).unwrap();
    let sq = g.square(y);
    let loss = g.sum(sq, Reduction::All).unwrap();
    let xa = random_tensor(&mut rng, &[2, 1, 4, 3, 2], -1.0, 1.0);
    let wa = random_tensor(&mut rng, &[2, 1, 2, 2, 3], -1.0, 1.0);
    check_gradients(g, loss, &[x, w], &[xa, wa]);
}

#[test]
fn test_avg_pool_gradient() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut g = GraphBuilder::new();
    let input = Axes::new([
        Axis::named("C", 1),
        Axis::named("D", 1),
        Axis::named("H", 3),
        Axis::named("W", 3),
        Axis::batch(2),
    ]);
    let x = g.placeholder(input);
    let p = g
        .pooling(PoolParams::avg([1, 1, 2, 2]).with_stride([1, 1, 1, 1]), x)
        .unwrap();
    let sq = g.square(p);
    let loss = g.sum(sq, Reduction::All).unwrap();
    let xa = random_tensor(&mut rng, &[1, 1, 3, 3, 2], -1.0, 1.0);
    check_gradients(g, loss, &[x], &[xa]);
}

#[test]
fn test_fused_cross_entropy_matches_unfused() {
    let mut rng = StdRng::seed_from_u64(10);
    let mut g = GraphBuilder::new();
    let c = Axis::named("C", 5);
    let n = Axis::batch(4);
    let x = g.placeholder([c.clone(), n.clone()]);
    let t = g.placeholder([c.clone(), n.clone()]);
    let y = g.softmax(x).unwrap();
    let fused = g.cross_entropy_multi(y, t).unwrap();
    let plain_opts = CrossEntropyOptions {
        enable_softmax_opt: false,
        ..Default::default()
    };
    let plain = g.cross_entropy_multi_with(y, t, &plain_opts).unwrap();
    let fused_total = g.sum(fused, Reduction::All).unwrap();
    let plain_total = g.sum(plain, Reduction::All).unwrap();
    let fused_grad = deriv(&mut g, fused_total, x).unwrap();
    let plain_grad = deriv(&mut g, plain_total, x).unwrap();

    let mut tr = f64_transformer(g);
    let f = tr
        .computation(vec![fused, plain, fused_grad, plain_grad], &[x, t])
        .unwrap();
    let xa = random_tensor(&mut rng, &[5, 4], -3.0, 3.0);
    let mut ta = vec![0.0; 20];
    for col in 0..4 {
        ta[(col + 1) % 5 * 4 + col] = 1.0;
    }
    let ta = HostTensor::new(vec![5, 4], ta).unwrap();
    let out = tr.call(f, &[xa.into(), ta.into()]).unwrap().into_tuple().unwrap();
    assert_eq!(out[0].shape(), &[4]);
    assert!(out[0].max_abs_diff(&out[1]) < 1e-6);
    assert!(out[2].max_abs_diff(&out[3]) < 1e-6);
}
