// Engine: convolution and pooling kernels for the host backend
//
// All kernels work on dense row-major arrays in the fixed layouts
//
//   input   (C, D, H, W, N)
//   filter  (C, T, R, S, K)
//   output  (K, M, P, Q, N)
//
// and never look at padding cells: for every output position a slice table
// says which filter taps land inside the input and where. The tables are
// computed once per kernel call and shared by every batch element.
//
//   fprop_slice(q)  taps of output q that read a real input cell
//   bprop_slice(x)  (tap, output) pairs that read input cell x
//   pool_slice(q)   input window of pooled output q, clipped to the input
//
// Parallelism: every kernel splits its output along the leading axis and
// hands each chunk to one rayon task, so each element has a single writer
// and results do not depend on scheduling.

use rayon::prelude::*;

use strata_core::conv::{ConvParams, PoolOp, PoolParams};
use strata_core::error::{Error, Result};

/// A run of `len` (tap, position) pairs: tap `tap + i * tap_step` meets
/// position `pos + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapRange {
    pub tap: usize,
    pub tap_step: isize,
    pub pos: usize,
    pub len: usize,
}

impl TapRange {
    fn empty() -> Self {
        TapRange {
            tap: 0,
            tap_step: 1,
            pos: 0,
            len: 0,
        }
    }

    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.len).map(move |i| {
            let tap = self.tap as isize + i as isize * self.tap_step;
            (tap as usize, self.pos + i)
        })
    }
}

/// Filter taps of output `q` that fall inside an input of length `x`, for
/// a filter of `s` taps.
pub fn fprop_slice(q: usize, s: usize, x: usize, pad: usize, stride: usize) -> TapRange {
    let start = (q * stride) as isize - pad as isize;
    let mut first_tap = 0isize;
    let mut last_tap = s as isize - 1;
    let mut first = start;
    let last = start + last_tap;
    if first < 0 {
        first_tap = -first;
        first = 0;
    }
    if last >= x as isize {
        last_tap -= last - x as isize + 1;
    }
    if last_tap < first_tap {
        return TapRange::empty();
    }
    TapRange {
        tap: first_tap as usize,
        tap_step: 1,
        pos: first as usize,
        len: (last_tap - first_tap + 1) as usize,
    }
}

/// (tap, output) pairs whose window covers input cell `x`, for `q_len`
/// outputs. Taps run downwards by `stride` while outputs run upwards.
pub fn bprop_slice(x: usize, s: usize, q_len: usize, pad: usize, stride: usize) -> TapRange {
    // Flipped filter: tap f of the flipped filter is tap s - 1 - f.
    let qs = x as isize - (s as isize - pad as isize - 1);
    let stride = stride as isize;
    let mut first: Option<(isize, isize)> = None;
    let mut last_q = 0isize;
    for f in 0..s as isize {
        let q = qs + f;
        if q.rem_euclid(stride) != 0 {
            continue;
        }
        let q = q.div_euclid(stride);
        if q >= 0 && q < q_len as isize {
            if first.is_none() {
                first = Some((f, q));
            }
            last_q = q;
        }
    }
    match first {
        None => TapRange::empty(),
        Some((f, q)) => TapRange {
            tap: (s as isize - 1 - f) as usize,
            tap_step: -stride,
            pos: q as usize,
            len: (last_q - q + 1) as usize,
        },
    }
}

/// Window `(first, len)` of pooled output `q` clipped to an input of length
/// `x`. `len` is 0 when the window lies entirely in padding.
pub fn pool_slice(q: usize, s: usize, x: usize, pad: usize, stride: usize) -> (usize, usize) {
    let start = (q * stride) as isize - pad as isize;
    let lo = start.max(0);
    let hi = (start + s as isize).min(x as isize);
    if hi <= lo {
        (0, 0)
    } else {
        (lo as usize, (hi - lo) as usize)
    }
}

/// Dimensions of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    /// Input (C, D, H, W, N).
    pub input: [usize; 5],
    /// Filter (C, T, R, S, K).
    pub filter: [usize; 5],
    /// Output (K, M, P, Q, N).
    pub output: [usize; 5],
    pub params: ConvParams,
}

impl ConvGeometry {
    pub fn new(input: &[usize], filter: &[usize], output: &[usize], params: ConvParams) -> Result<Self> {
        let dims5 = |v: &[usize], what: &str| -> Result<[usize; 5]> {
            v.try_into()
                .map_err(|_| Error::Internal(format!("{} of convolution has shape {:?}", what, v)))
        };
        let geom = ConvGeometry {
            input: dims5(input, "input")?,
            filter: dims5(filter, "filter")?,
            output: dims5(output, "output")?,
            params,
        };
        if geom.input[0] != geom.filter[0] || geom.output[0] != geom.filter[4] || geom.output[4] != geom.input[4] {
            return Err(Error::Internal(format!(
                "inconsistent convolution shapes: input {:?}, filter {:?}, output {:?}",
                input, filter, output
            )));
        }
        Ok(geom)
    }

    /// A 1x1x1 filter with unit stride and no padding is a plain matrix
    /// product over channels.
    pub fn is_pointwise(&self) -> bool {
        self.filter[1..4] == [1, 1, 1] && self.params.stride == [1; 3] && self.params.pad == [0; 3]
    }

    fn fprop_tables(&self) -> [Vec<TapRange>; 3] {
        let p = &self.params;
        std::array::from_fn(|d| {
            (0..self.output[d + 1])
                .map(|q| fprop_slice(q, self.filter[d + 1], self.input[d + 1], p.pad[d], p.stride[d]))
                .collect()
        })
    }

    fn bprop_tables(&self) -> [Vec<TapRange>; 3] {
        let p = &self.params;
        std::array::from_fn(|d| {
            (0..self.input[d + 1])
                .map(|x| bprop_slice(x, self.filter[d + 1], self.output[d + 1], p.pad[d], p.stride[d]))
                .collect()
        })
    }
}

fn for_each_chunk<F>(out: &mut [f64], chunk: usize, parallel: bool, f: F)
where
    F: Fn(usize, &mut [f64]) + Send + Sync,
{
    if chunk == 0 {
        return;
    }
    if parallel {
        out.par_chunks_mut(chunk).enumerate().for_each(|(i, c)| f(i, c));
    } else {
        out.chunks_mut(chunk).enumerate().for_each(|(i, c)| f(i, c));
    }
}

/// Forward convolution.
pub fn conv_fprop(g: &ConvGeometry, input: &[f64], filter: &[f64], parallel: bool) -> Vec<f64> {
    let [c_len, d_len, h_len, w_len, n] = g.input;
    let [_, t_len, r_len, s_len, k_len] = g.filter;
    let [_, m_len, p_len, q_len, _] = g.output;
    let mut out = vec![0.0; g.output.iter().product()];

    if g.is_pointwise() {
        // out[k, l] = sum_c filter[c, k] * input[c, l]
        let l_len = d_len * h_len * w_len * n;
        for_each_chunk(&mut out, l_len, parallel, |k, row| {
            for c in 0..c_len {
                let f = filter[c * k_len + k];
                let src = &input[c * l_len..(c + 1) * l_len];
                for (o, x) in row.iter_mut().zip(src) {
                    *o += f * x;
                }
            }
        });
        return out;
    }

    let [dt, ht, wt] = g.fprop_tables();
    let in_idx = |c: usize, d: usize, h: usize, w: usize| (((c * d_len + d) * h_len + h) * w_len + w) * n;
    let f_idx = |c: usize, t: usize, r: usize, s: usize, k: usize| (((c * t_len + t) * r_len + r) * s_len + s) * k_len + k;
    for_each_chunk(&mut out, m_len * p_len * q_len * n, parallel, |k, chunk| {
        for m in 0..m_len {
            for p in 0..p_len {
                for q in 0..q_len {
                    let base = ((m * p_len + p) * q_len + q) * n;
                    let acc = &mut chunk[base..base + n];
                    for c in 0..c_len {
                        for (t, d) in dt[m].pairs() {
                            for (r, h) in ht[p].pairs() {
                                for (s, w) in wt[q].pairs() {
                                    let f = filter[f_idx(c, t, r, s, k)];
                                    let src = &input[in_idx(c, d, h, w)..in_idx(c, d, h, w) + n];
                                    for (a, x) in acc.iter_mut().zip(src) {
                                        *a += f * x;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    });
    out
}

/// Gradient of a convolution with respect to its input.
pub fn conv_bprop(g: &ConvGeometry, delta: &[f64], filter: &[f64], parallel: bool) -> Vec<f64> {
    let [_, d_len, h_len, w_len, n] = g.input;
    let [_, t_len, r_len, s_len, k_len] = g.filter;
    let [_, m_len, p_len, q_len, _] = g.output;
    let [dt, ht, wt] = g.bprop_tables();
    let mut grad = vec![0.0; g.input.iter().product()];
    let e_idx = |k: usize, m: usize, p: usize, q: usize| (((k * m_len + m) * p_len + p) * q_len + q) * n;
    let f_idx = |c: usize, t: usize, r: usize, s: usize, k: usize| (((c * t_len + t) * r_len + r) * s_len + s) * k_len + k;
    for_each_chunk(&mut grad, d_len * h_len * w_len * n, parallel, |c, chunk| {
        for d in 0..d_len {
            for h in 0..h_len {
                for w in 0..w_len {
                    let base = ((d * h_len + h) * w_len + w) * n;
                    let acc = &mut chunk[base..base + n];
                    for k in 0..k_len {
                        for (t, m) in dt[d].pairs() {
                            for (r, p) in ht[h].pairs() {
                                for (s, q) in wt[w].pairs() {
                                    let f = filter[f_idx(c, t, r, s, k)];
                                    let src = &delta[e_idx(k, m, p, q)..e_idx(k, m, p, q) + n];
                                    for (a, e) in acc.iter_mut().zip(src) {
                                        *a += f * e;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    });
    grad
}

/// Gradient of a convolution with respect to its filter.
pub fn conv_update(g: &ConvGeometry, delta: &[f64], input: &[f64], parallel: bool) -> Vec<f64> {
    let [_, d_len, h_len, w_len, n] = g.input;
    let [_, t_len, r_len, s_len, k_len] = g.filter;
    let [_, m_len, p_len, q_len, _] = g.output;
    let [dt, ht, wt] = g.fprop_tables();
    let mut grad = vec![0.0; g.filter.iter().product()];
    let in_idx = |c: usize, d: usize, h: usize, w: usize| (((c * d_len + d) * h_len + h) * w_len + w) * n;
    let e_idx = |k: usize, m: usize, p: usize, q: usize| (((k * m_len + m) * p_len + p) * q_len + q) * n;
    for_each_chunk(&mut grad, t_len * r_len * s_len * k_len, parallel, |c, chunk| {
        for m in 0..m_len {
            for p in 0..p_len {
                for q in 0..q_len {
                    for (t, d) in dt[m].pairs() {
                        for (r, h) in ht[p].pairs() {
                            for (s, w) in wt[q].pairs() {
                                let src = &input[in_idx(c, d, h, w)..in_idx(c, d, h, w) + n];
                                for k in 0..k_len {
                                    let e = &delta[e_idx(k, m, p, q)..e_idx(k, m, p, q) + n];
                                    let dot: f64 = src.iter().zip(e).map(|(x, e)| x * e).sum();
                                    chunk[((t * r_len + r) * s_len + s) * k_len + k] += dot;
                                }
                            }
                        }
                    }
                }
            }
        }
    });
    grad
}

/// Dimensions of one pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub input: [usize; 5],
    pub output: [usize; 5],
    pub params: PoolParams,
}

impl PoolGeometry {
    pub fn new(input: &[usize], output: &[usize], params: PoolParams) -> Result<Self> {
        let dims5 = |v: &[usize], what: &str| -> Result<[usize; 5]> {
            v.try_into()
                .map_err(|_| Error::Internal(format!("{} of pooling has shape {:?}", what, v)))
        };
        Ok(PoolGeometry {
            input: dims5(input, "input")?,
            output: dims5(output, "output")?,
            params,
        })
    }

    fn tables(&self) -> [Vec<(usize, usize)>; 4] {
        let p = &self.params;
        std::array::from_fn(|d| {
            (0..self.output[d])
                .map(|q| pool_slice(q, p.window[d], self.input[d], p.pad[d], p.stride[d]))
                .collect()
        })
    }

    /// Input cells (flat over C, D, H, W) of every output window, in output
    /// order.
    fn windows(&self) -> Vec<Vec<usize>> {
        let [ct, dt, ht, wt] = self.tables();
        let [_, d_len, h_len, w_len, _] = self.input;
        let mut windows = Vec::with_capacity(self.output[..4].iter().product());
        for &(c0, cl) in &ct {
            for &(d0, dl) in &dt {
                for &(h0, hl) in &ht {
                    for &(w0, wl) in &wt {
                        let mut cells = Vec::with_capacity(cl * dl * hl * wl);
                        for c in c0..c0 + cl {
                            for d in d0..d0 + dl {
                                for h in h0..h0 + hl {
                                    for w in w0..w0 + wl {
                                        cells.push(((c * d_len + d) * h_len + h) * w_len + w);
                                    }
                                }
                            }
                        }
                        windows.push(cells);
                    }
                }
            }
        }
        windows
    }
}

/// Forward pooling. Returns the pooled values and, for each of them, the
/// flat (C, D, H, W) input cell that won a max pool (-1 for an empty
/// window or an average pool).
pub fn pool_fprop(g: &PoolGeometry, input: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = g.input[4];
    let windows = g.windows();
    let mut out = vec![0.0; windows.len() * n];
    let mut argmax = vec![-1.0; windows.len() * n];
    for (wi, cells) in windows.iter().enumerate() {
        if cells.is_empty() {
            continue;
        }
        for b in 0..n {
            let o = wi * n + b;
            match g.params.op {
                PoolOp::Max => {
                    let mut best = cells[0];
                    for &cell in &cells[1..] {
                        if input[cell * n + b] > input[best * n + b] {
                            best = cell;
                        }
                    }
                    out[o] = input[best * n + b];
                    argmax[o] = best as f64;
                }
                PoolOp::Avg => {
                    let sum: f64 = cells.iter().map(|&cell| input[cell * n + b]).sum();
                    out[o] = sum / cells.len() as f64;
                }
            }
        }
    }
    (out, argmax)
}

/// Gradient of a pooling with respect to its input.
pub fn pool_bprop(g: &PoolGeometry, delta: &[f64], argmax: &[f64]) -> Vec<f64> {
    let n = g.input[4];
    let mut grad = vec![0.0; g.input.iter().product()];
    match g.params.op {
        PoolOp::Max => {
            for (o, (&e, &a)) in delta.iter().zip(argmax).enumerate() {
                if a >= 0.0 {
                    grad[a as usize * n + o % n] += e;
                }
            }
        }
        PoolOp::Avg => {
            for (wi, cells) in g.windows().iter().enumerate() {
                if cells.is_empty() {
                    continue;
                }
                let scale = 1.0 / cells.len() as f64;
                for b in 0..n {
                    let e = delta[wi * n + b] * scale;
                    for &cell in cells {
                        grad[cell * n + b] += e;
                    }
                }
            }
        }
    }
    grad
}
