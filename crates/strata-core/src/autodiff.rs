use std::collections::HashMap;

use crate::error::Result;
use crate::graph::{GraphBuilder, OpId};
use crate::op::{BinaryOp, OpKind, ReduceOp, Schema, UnaryOp};
use crate::ops::{DotAxes, Reduction};
use crate::prune::simple_prune;

// Autodiff: reverse-mode adjoints built as graph ops
//
// Differentiation does not compute numbers. It extends the graph with new
// ops whose values are the partial derivatives of one output with respect to
// every op it depends on; those ops are then compiled like any other.
//
// HOW IT WORKS:
//
//   1. Seed: the output's adjoint is Constant(1) when the output is a
//      scalar, otherwise a placeholder with the output's axes (the caller
//      supplies the upstream gradient through it).
//
//   2. Walk the ops reachable from the output in reverse topological order.
//      An op with an adjoint applies its `scale`, then its rule: the first
//      schema's rule if it has one, else the rule for its kind.
//
//   3. Each rule calls `add_delta(target, delta)`, which sums `delta` over
//      the axes the target does not have, broadcasts it to the target's
//      axes, and adds it to the target's partial adjoint.
//
// GRADIENT RULES (self = the op's own value):
//
//   add/subtract    x += delta, y += +-delta
//   multiply        x += delta*y, y += x*delta
//   divide          x += delta/y, y += -delta*self/y
//   exp / log       delta*self / delta/x (log of exp and of a quotient
//                   differentiate through their arguments directly)
//   reductions      sum: delta; max/min: equal(x, self)*delta
//   maximum/minimum equal(self, operand)*delta
//   dot             dot of the other operand with delta, out_axes = operand
//   slice/unslice   unslice/slice of delta
//   conv / pool     bprop_conv + update_conv / bprop_pool
//
// Ties in max/min/maximum/minimum give the full delta to every tied
// operand.

/// Adjoints of one output: ancestor op -> op computing its adjoint.
#[derive(Debug, Clone)]
pub struct Adjoints {
    initial: OpId,
    map: HashMap<OpId, OpId>,
}

impl Adjoints {
    pub fn get(&self, op: OpId) -> Option<OpId> {
        self.map.get(&op).copied()
    }

    /// The seed: Constant(1) or the placeholder for the upstream gradient.
    pub fn initial_adjoint(&self) -> OpId {
        self.initial
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn add_delta(&mut self, g: &mut GraphBuilder, target: OpId, delta: OpId) -> Result<()> {
        let extra = g.axes(delta) - g.axes(target);
        let mut delta = delta;
        if !extra.is_empty() {
            delta = g.sum(delta, Reduction::Over(extra))?;
        }
        if g.axes(delta) != g.axes(target) {
            let axes = g.axes(target).clone();
            delta = g.broadcast(delta, axes)?;
        }
        let total = match self.map.get(&target) {
            Some(&prev) => g.add(delta, prev),
            None => delta,
        };
        self.map.insert(target, total);
        Ok(())
    }
}

/// Adjoints of `output`, built on first request and memoized per output.
pub fn adjoints(g: &mut GraphBuilder, output: OpId) -> Result<Adjoints> {
    if let Some(cached) = g.adjoints.get(&output) {
        return Ok(cached.clone());
    }
    let initial = if g.node(output).is_scalar() {
        g.constant(1.0)
    } else {
        let axes = g.axes(output).clone();
        g.placeholder(axes)
    };
    let mut adj = Adjoints {
        initial,
        map: HashMap::from([(output, initial)]),
    };
    let ops = g.ordered_ops(&[output]);
    for &op in ops.iter().rev() {
        let Some(mut delta) = adj.get(op) else {
            continue;
        };
        if let Some(scale) = g.node(op).scale() {
            delta = g.mul_scalar(delta, scale);
        }
        match g.node(op).schemas().first().cloned() {
            Some(schema) => schema_adjoints(g, &mut adj, &schema, op, delta)?,
            None => op_adjoints(g, &mut adj, op, delta)?,
        }
    }
    log::debug!(
        "adjoints of {}: {} ops differentiated, graph now {} ops",
        output,
        adj.len(),
        g.len()
    );
    g.adjoints.insert(output, adj.clone());
    Ok(adj)
}

/// d(dep)/d(indep), shaped like `indep`.
pub fn deriv(g: &mut GraphBuilder, dep: OpId, indep: OpId) -> Result<OpId> {
    simple_prune(g, &[dep, indep])?;
    let adj = adjoints(g, dep)?;
    let axes = g.axes(indep).clone();
    match adj.get(indep) {
        Some(a) => g.broadcast(a, axes),
        None => Ok(g.constant_with_axes(0.0, axes)),
    }
}

fn schema_adjoints(
    g: &mut GraphBuilder,
    adj: &mut Adjoints,
    schema: &Schema,
    op: OpId,
    delta: OpId,
) -> Result<()> {
    match *schema {
        Schema::Softmax { x, z, .. } => {
            let zd = g.multiply(delta, op);
            let red = g.axes(x) - g.axes(z);
            let zs = g.sum(zd, Reduction::Over(red))?;
            let zso = g.multiply(zs, op);
            let d = g.subtract(zd, zso);
            adj.add_delta(g, x, d)
        }
        Schema::Sigmoid { x } => {
            let one_minus = g.rsub_scalar(1.0, op);
            let a = g.multiply(delta, op);
            let d = g.multiply(a, one_minus);
            adj.add_delta(g, x, d)
        }
        Schema::CrossEntropyMultiInner { x, y, s } => {
            adj.add_delta(g, s, delta)?;
            let d = g.multiply(y, delta);
            adj.add_delta(g, x, d)
        }
        Schema::CrossEntropyBinaryInner { x, y, t } => {
            let ymt = g.subtract(y, t);
            let dx = g.multiply(ymt, delta);
            adj.add_delta(g, x, dx)?;
            let xd = g.multiply(x, delta);
            let dt = g.negative(xd);
            adj.add_delta(g, t, dt)
        }
    }
}

/// log(x): differentiate through quotients and exponentials.
fn log_adjoints(g: &mut GraphBuilder, adj: &mut Adjoints, delta: OpId, x: OpId) -> Result<()> {
    match g.kind(x).clone() {
        OpKind::Binary(BinaryOp::Divide) => {
            let (a, b) = (g.node(x).args()[0], g.node(x).args()[1]);
            log_adjoints(g, adj, delta, a)?;
            let nd = g.negative(delta);
            log_adjoints(g, adj, nd, b)
        }
        OpKind::Unary(UnaryOp::Exp) => {
            let inner = g.node(x).args()[0];
            adj.add_delta(g, inner, delta)
        }
        _ => {
            let d = g.divide(delta, x);
            adj.add_delta(g, x, d)
        }
    }
}

fn op_adjoints(g: &mut GraphBuilder, adj: &mut Adjoints, op: OpId, delta: OpId) -> Result<()> {
    let args = g.node(op).args().to_vec();
    let kind = g.kind(op).clone();
    match kind {
        OpKind::Placeholder
        | OpKind::Variable
        | OpKind::Temporary
        | OpKind::Constant(_)
        | OpKind::Tensor(_)
        | OpKind::Random { .. }
        | OpKind::Compare(_)
        | OpKind::Argmax { .. }
        | OpKind::Argmin { .. }
        | OpKind::Onehot { .. }
        | OpKind::Fill(_)
        | OpKind::SetItem(_)
        | OpKind::DoAll
        | OpKind::BpropConv(_)
        | OpKind::UpdateConv(_)
        | OpKind::BpropPool(_) => Ok(()),

        OpKind::Broadcast | OpKind::ExpandDims { .. } | OpKind::AllReduce => {
            adj.add_delta(g, args[0], delta)
        }
        OpKind::Slice(slices) => {
            let x_axes = g.axes(args[0]).clone();
            let d = g.unslice(delta, &slices, x_axes)?;
            adj.add_delta(g, args[0], d)
        }
        OpKind::Unslice(slices) => {
            let x_axes = g.axes(args[0]).clone();
            let d = g.slice(delta, &slices, Some(x_axes))?;
            adj.add_delta(g, args[0], d)
        }

        OpKind::Unary(u) => {
            let x = args[0];
            let d = match u {
                UnaryOp::Absolute => {
                    let s = g.sign(x);
                    g.multiply(s, delta)
                }
                UnaryOp::Negative => g.negative(delta),
                UnaryOp::Exp => g.multiply(delta, op),
                UnaryOp::Log => return log_adjoints(g, adj, delta, x),
                UnaryOp::SafeLog => g.divide(delta, x),
                UnaryOp::Sqrt => {
                    let half = g.mul_scalar(delta, 0.5);
                    g.divide(half, op)
                }
                UnaryOp::Square => {
                    let two = g.mul_scalar(delta, 2.0);
                    g.multiply(two, x)
                }
                UnaryOp::Reciprocal => {
                    let sq = g.multiply(op, op);
                    let n = g.negative(sq);
                    g.multiply(n, delta)
                }
                UnaryOp::Sign => return Ok(()),
                UnaryOp::Sin => {
                    let c = g.cos(x);
                    g.multiply(delta, c)
                }
                UnaryOp::Cos => {
                    let s = g.sin(x);
                    let ds = g.multiply(delta, s);
                    g.negative(ds)
                }
                UnaryOp::Tanh => {
                    let sq = g.multiply(op, op);
                    let one_minus = g.rsub_scalar(1.0, sq);
                    g.multiply(delta, one_minus)
                }
            };
            adj.add_delta(g, x, d)
        }

        OpKind::Binary(b) => {
            let (x, y) = (args[0], args[1]);
            match b {
                BinaryOp::Add => {
                    adj.add_delta(g, x, delta)?;
                    adj.add_delta(g, y, delta)
                }
                BinaryOp::Subtract => {
                    adj.add_delta(g, x, delta)?;
                    let n = g.negative(delta);
                    adj.add_delta(g, y, n)
                }
                BinaryOp::Multiply => {
                    let dx = g.multiply(delta, y);
                    adj.add_delta(g, x, dx)?;
                    let dy = g.multiply(x, delta);
                    adj.add_delta(g, y, dy)
                }
                BinaryOp::Divide => {
                    let dx = g.divide(delta, y);
                    adj.add_delta(g, x, dx)?;
                    let ds = g.multiply(delta, op);
                    let q = g.divide(ds, y);
                    let dy = g.negative(q);
                    adj.add_delta(g, y, dy)
                }
                BinaryOp::Maximum | BinaryOp::Minimum => {
                    let ex = g.equal(op, x);
                    let dx = g.multiply(ex, delta);
                    adj.add_delta(g, x, dx)?;
                    let ey = g.equal(op, y);
                    let dy = g.multiply(ey, delta);
                    adj.add_delta(g, y, dy)
                }
                BinaryOp::Power => {
                    // d/dx = y * x^(y-1); d/dy = self * log(x)
                    let one = g.constant(1.0);
                    let ym1 = g.subtract(y, one);
                    let p = g.power(x, ym1);
                    let yp = g.multiply(y, p);
                    let dx = g.multiply(delta, yp);
                    adj.add_delta(g, x, dx)?;
                    let lx = g.log(x);
                    let sl = g.multiply(op, lx);
                    let dy = g.multiply(delta, sl);
                    adj.add_delta(g, y, dy)
                }
            }
        }

        OpKind::Reduce { op: r, .. } => {
            let x = args[0];
            match r {
                ReduceOp::Sum => adj.add_delta(g, x, delta),
                ReduceOp::Max | ReduceOp::Min => {
                    let e = g.equal(x, op);
                    let d = g.multiply(e, delta);
                    adj.add_delta(g, x, d)
                }
            }
        }

        OpKind::Dot(_) => {
            let (x, y) = (args[0], args[1]);
            // delta goes second so its ids line up with this dot's output.
            let x_axes = g.axes(x).clone();
            let dx = g.dot_with(
                y,
                delta,
                DotAxes {
                    out_axes: Some(x_axes),
                    reduction_axes: None,
                    forward: Some(op),
                },
            )?;
            adj.add_delta(g, x, dx)?;
            let y_axes = g.axes(y).clone();
            let dy = g.dot_with(
                x,
                delta,
                DotAxes {
                    out_axes: Some(y_axes),
                    reduction_axes: None,
                    forward: Some(op),
                },
            )?;
            adj.add_delta(g, y, dy)
        }

        OpKind::Convolution(params) => {
            let (input, filter) = (args[0], args[1]);
            let di = g.bprop_conv(params, delta, input, filter, op);
            adj.add_delta(g, input, di)?;
            let df = g.update_conv(params, delta, input, filter, op);
            adj.add_delta(g, filter, df)
        }
        OpKind::Pooling(params) => {
            let (input, argmax) = (args[0], args[1]);
            let di = g.bprop_pool(params, delta, input, argmax, op);
            adj.add_delta(g, input, di)
        }
    }
}
