use std::collections::HashMap;

use crate::axes::Axes;
use crate::error::Result;
use crate::graph::{GraphBuilder, OpId};
use crate::op::{BinaryOp, OpKind, ReduceOp, UnaryOp};

// SimplePrune: algebraic clean-up before compilation
//
// Autodiff in particular produces many multiplications by 1, additions of 0
// and negations of constants. Each pass walks the ops reachable from the
// requested results and collects a replacement for every op that matches a
// rule; the replacements are substituted once the walk is over, and passes
// repeat until nothing changes. Requested results are never replaced, so a
// caller holding their OpIds keeps valid handles.
//
//   negative(c)        -> -c
//   x * 0, 0 * x       -> 0
//   x * 1, 1 * x       -> x
//   x * -1, -1 * x     -> -x
//   x + 0, 0 + x       -> x
//   sum(c)             -> c * size(reduction axes)
//   log(exp(a) / b)    -> a - log(b)
//   log(exp(x))        -> x
//
// A replacement whose axes differ from the op it replaces is broadcast to
// the replaced op's axes. Rules are matched without touching the graph, so
// a replacement that could not be broadcast leaves no node behind.

/// What an op is rewritten to. Nothing is added to the graph until the
/// rewrite is applied.
#[derive(Debug, Clone)]
enum Rewrite {
    /// An op that already exists.
    Existing(OpId),
    /// A constant filled over the given axes.
    Constant(f64, Axes),
    Negative(OpId),
    /// `a - log(b)`.
    LogRatio { a: OpId, b: OpId },
}

impl Rewrite {
    /// Axes of the op this rewrite would produce.
    fn axes(&self, g: &GraphBuilder) -> Axes {
        match self {
            Rewrite::Existing(x) | Rewrite::Negative(x) => g.axes(*x).clone(),
            Rewrite::Constant(_, axes) => axes.clone(),
            Rewrite::LogRatio { a, b } => g.axes(*a).union(g.axes(*b)),
        }
    }

    fn build(&self, g: &mut GraphBuilder, applied: &HashMap<OpId, OpId>) -> OpId {
        let current = |id: OpId| follow(applied, id);
        match self {
            Rewrite::Existing(x) => current(*x),
            Rewrite::Constant(c, axes) => g.constant_with_axes(*c, axes.clone()),
            Rewrite::Negative(x) => g.negative(current(*x)),
            Rewrite::LogRatio { a, b } => {
                let logb = g.log(current(*b));
                g.subtract(current(*a), logb)
            }
        }
    }
}

/// The op currently standing in for `id` after this pass's substitutions.
fn follow(applied: &HashMap<OpId, OpId>, mut id: OpId) -> OpId {
    while let Some(&next) = applied.get(&id) {
        id = next;
    }
    id
}

/// Simplify the graph reachable from `results`. Returns the number of ops
/// replaced.
pub fn simple_prune(g: &mut GraphBuilder, results: &[OpId]) -> Result<usize> {
    let mut total = 0;
    loop {
        let pending = collect_rewrites(g, results);
        if pending.is_empty() {
            break;
        }
        let mut applied = HashMap::new();
        for &(op, ref rewrite) in &pending {
            let mut replacement = rewrite.build(g, &applied);
            if g.axes(replacement) != g.axes(op) {
                let axes = g.axes(op).clone();
                replacement = g.broadcast(replacement, axes)?;
            }
            log::trace!("prune: {} {} -> {}", op, g.kind(op), replacement);
            g.replace_all_uses(op, replacement);
            applied.insert(op, replacement);
        }
        total += pending.len();
    }
    if total > 0 {
        log::debug!("simple_prune replaced {} ops", total);
    }
    Ok(total)
}

/// One walk over the ops reachable from `results`: every op that matches a
/// rule and whose replacement fits its axes, in dependency order.
fn collect_rewrites(g: &GraphBuilder, results: &[OpId]) -> Vec<(OpId, Rewrite)> {
    let mut pending = Vec::new();
    for op in g.ordered_ops(results) {
        if results.contains(&op) || g.node(op).users().is_empty() {
            continue;
        }
        let Some(rewrite) = rewrite(g, op) else {
            continue;
        };
        // Broadcasting can add axes but never drop them.
        let fits = rewrite
            .axes(g)
            .as_axis_ids()
            .sub(&g.axes(op).as_axis_ids())
            .is_empty();
        if fits {
            pending.push((op, rewrite));
        }
    }
    pending
}

fn const_of(g: &GraphBuilder, id: OpId) -> Option<f64> {
    g.node(id).const_value()
}

/// The first rule matching `op`, if any.
fn rewrite(g: &GraphBuilder, op: OpId) -> Option<Rewrite> {
    let node = g.node(op);
    let args = node.args();
    match node.kind() {
        // negative(c) -> -c
        OpKind::Unary(UnaryOp::Negative) => {
            let c = const_of(g, args[0])?;
            Some(Rewrite::Constant(-c, g.axes(args[0]).clone()))
        }
        // Multiplication by 0, 1 or -1 on either side.
        OpKind::Binary(BinaryOp::Multiply) => {
            let (x, y) = (args[0], args[1]);
            match (const_of(g, x), const_of(g, y)) {
                (Some(a), _) if a == 0.0 => Some(Rewrite::Constant(0.0, node.axes().clone())),
                (_, Some(b)) if b == 0.0 => Some(Rewrite::Constant(0.0, node.axes().clone())),
                (_, Some(b)) if b == 1.0 => Some(Rewrite::Existing(x)),
                (Some(a), _) if a == 1.0 => Some(Rewrite::Existing(y)),
                (_, Some(b)) if b == -1.0 => Some(Rewrite::Negative(x)),
                (Some(a), _) if a == -1.0 => Some(Rewrite::Negative(y)),
                _ => None,
            }
        }
        // Addition of 0 on either side.
        OpKind::Binary(BinaryOp::Add) => {
            let (x, y) = (args[0], args[1]);
            match (const_of(g, x), const_of(g, y)) {
                (_, Some(b)) if b == 0.0 => Some(Rewrite::Existing(x)),
                (Some(a), _) if a == 0.0 => Some(Rewrite::Existing(y)),
                _ => None,
            }
        }
        // The sum of a constant is the constant times the number of
        // elements folded together.
        OpKind::Reduce {
            op: ReduceOp::Sum,
            reduction_axes,
        } => {
            let c = const_of(g, args[0])?;
            Some(Rewrite::Constant(
                c * reduction_axes.size() as f64,
                node.axes().clone(),
            ))
        }
        // log(exp(x)) and log(exp(a) / b).
        OpKind::Unary(UnaryOp::Log) => {
            let inner = args[0];
            match g.kind(inner) {
                OpKind::Unary(UnaryOp::Exp) => Some(Rewrite::Existing(g.node(inner).args()[0])),
                OpKind::Binary(BinaryOp::Divide) => {
                    let (num, den) = (g.node(inner).args()[0], g.node(inner).args()[1]);
                    match g.kind(num) {
                        OpKind::Unary(UnaryOp::Exp) => Some(Rewrite::LogRatio {
                            a: g.node(num).args()[0],
                            b: den,
                        }),
                        _ => None,
                    }
                }
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::{Axes, Axis};
    use crate::ops::Reduction;

    #[test]
    fn test_multiply_by_one_and_zero() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 3);
        let x = g.placeholder([a.clone()]);
        let one = g.constant(1.0);
        let m = g.multiply(x, one);
        let zero = g.constant(0.0);
        let z = g.multiply(zero, x);
        let r = g.add(m, z);
        let out = g.negative(r);
        let n = simple_prune(&mut g, &[out]).unwrap();
        assert!(n >= 2);
        // m -> x, z -> 0, then r = x + 0 -> x.
        let arg = g.node(out).args()[0];
        assert_eq!(arg, x);
    }

    #[test]
    fn test_results_are_never_replaced() {
        let mut g = GraphBuilder::new();
        let x = g.placeholder(Axes::empty());
        let one = g.constant(1.0);
        let m = g.multiply(x, one);
        simple_prune(&mut g, &[m]).unwrap();
        assert_eq!(g.node(m).args(), &[x, one]);
    }

    #[test]
    fn test_negative_constant_and_sum_constant() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 4);
        let c = g.constant_with_axes(2.0, [a.clone()]);
        let s = g.sum(c, Reduction::All).unwrap();
        let nc = g.constant(3.0);
        let n = g.negative(nc);
        let out = g.add(s, n);
        simple_prune(&mut g, &[out]).unwrap();
        let args = g.node(out).args().to_vec();
        assert_eq!(g.node(args[0]).const_value(), Some(8.0));
        assert_eq!(g.node(args[1]).const_value(), Some(-3.0));
    }

    #[test]
    fn test_log_exp() {
        let mut g = GraphBuilder::new();
        let x = g.placeholder(Axes::empty());
        let e = g.exp(x);
        let l = g.log(e);
        let out = g.negative(l);
        simple_prune(&mut g, &[out]).unwrap();
        assert_eq!(g.node(out).args(), &[x]);

        let b = g.placeholder(Axes::empty());
        let e = g.exp(x);
        let d = g.divide(e, b);
        let l = g.log(d);
        let out = g.negative(l);
        simple_prune(&mut g, &[out]).unwrap();
        let sub = g.node(out).args()[0];
        assert!(matches!(g.kind(sub), OpKind::Binary(BinaryOp::Subtract)));
        assert_eq!(g.node(sub).args()[0], x);
    }

    #[test]
    fn test_replacement_is_broadcast() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 2);
        let x = g.placeholder(Axes::empty());
        let one = g.constant_with_axes(1.0, [a.clone()]);
        let m = g.multiply(x, one);
        let out = g.negative(m);
        simple_prune(&mut g, &[out]).unwrap();
        let arg = g.node(out).args()[0];
        assert!(matches!(g.kind(arg), OpKind::Broadcast));
        assert_eq!(*g.axes(arg), Axes::new([a]));
    }

    #[test]
    fn test_unfit_replacement_adds_no_nodes() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 3);
        let x = g.placeholder(Axes::empty());
        let minus_one = g.constant(-1.0);
        let m = g.multiply(x, minus_one);
        let out = g.exp(m);
        // m keeps its scalar axes while reading a value over A, so -y
        // cannot stand in for it.
        let y = g.placeholder([a]);
        g.replace_arg(m, x, y);
        let before = g.len();
        assert_eq!(simple_prune(&mut g, &[out]).unwrap(), 0);
        assert_eq!(g.len(), before);
        assert_eq!(g.node(out).args(), &[m]);
    }

    #[test]
    fn test_rewrites_in_one_pass_chain() {
        let mut g = GraphBuilder::new();
        let x = g.placeholder(Axes::empty());
        let one = g.constant(1.0);
        let zero = g.constant(0.0);
        // Both m -> x and s -> m are found in the first pass; s must end up
        // reading x directly.
        let m = g.multiply(x, one);
        let s = g.add(m, zero);
        let out = g.exp(s);
        simple_prune(&mut g, &[out]).unwrap();
        assert_eq!(g.node(out).args(), &[x]);
        assert!(g.node(m).users().is_empty());
    }
}
