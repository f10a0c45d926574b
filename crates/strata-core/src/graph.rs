use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::autodiff::Adjoints;
use crate::axes::Axes;
use crate::dtype::DType;
use crate::op::{OpKind, Schema};

// GraphBuilder: the arena that owns every op of a graph
//
// Ops live in a Vec and refer to each other by OpId (an index into it).
// `args` are the operand edges; `users` are the reverse edges and are kept
// in sync by every mutation that touches `args`. Because edges are indices,
// there is no reference counting and no cycle to break.
//
// Capture: while a CaptureGuard is alive, every op created through the
// builder is also recorded in the guard's frame. Variable initializers use
// this to collect "everything the init closure built". Frames form a stack;
// the guard pops its frame when dropped, including during error propagation
// or unwinding.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Handle to a seeded random stream shared by Random ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RngId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    /// Updated by optimizers.
    Trainable,
    /// Keeps its value between computation calls.
    Persistent,
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) kind: OpKind,
    pub(crate) args: Vec<OpId>,
    pub(crate) users: Vec<OpId>,
    pub(crate) axes: Axes,
    pub(crate) dtype: DType,
    pub(crate) tags: BTreeSet<Tag>,
    pub(crate) initializers: Vec<OpId>,
    pub(crate) schemas: Vec<Schema>,
    pub(crate) scale: Option<f64>,
    pub(crate) name: Option<String>,
}

impl Node {
    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn args(&self) -> &[OpId] {
        &self.args
    }

    pub fn users(&self) -> &[OpId] {
        &self.users
    }

    pub fn axes(&self) -> &Axes {
        &self.axes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn tags(&self) -> &BTreeSet<Tag> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    pub fn is_trainable(&self) -> bool {
        self.has_tag(&Tag::Trainable)
    }

    pub fn is_persistent(&self) -> bool {
        self.has_tag(&Tag::Persistent)
    }

    pub fn initializers(&self) -> &[OpId] {
        &self.initializers
    }

    pub fn schemas(&self) -> &[Schema] {
        &self.schemas
    }

    pub fn scale(&self) -> Option<f64> {
        self.scale
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_scalar(&self) -> bool {
        self.axes.is_empty()
    }

    /// Value of a Constant op.
    pub fn const_value(&self) -> Option<f64> {
        match self.kind {
            OpKind::Constant(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    capture: Vec<Vec<OpId>>,
    rng_seeds: Vec<u64>,
    default_dtype: DType,
    pub(crate) adjoints: HashMap<OpId, Adjoints>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Element type given to ops that do not fix their own.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.default_dtype = dtype;
        self
    }

    pub fn default_dtype(&self) -> DType {
        self.default_dtype
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: OpId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn axes(&self, id: OpId) -> &Axes {
        &self.nodes[id.index()].axes
    }

    pub fn kind(&self, id: OpId) -> &OpKind {
        &self.nodes[id.index()].kind
    }

    pub fn ids(&self) -> impl Iterator<Item = OpId> {
        (0..self.nodes.len() as u32).map(OpId)
    }

    pub(crate) fn add_node(&mut self, kind: OpKind, args: Vec<OpId>, axes: Axes, dtype: DType) -> OpId {
        let id = OpId(self.nodes.len() as u32);
        for &arg in &args {
            let users = &mut self.nodes[arg.index()].users;
            if !users.contains(&id) {
                users.push(id);
            }
        }
        log::trace!("new {} {} {}", id, kind, axes);
        self.nodes.push(Node {
            kind,
            args,
            users: Vec::new(),
            axes,
            dtype,
            tags: BTreeSet::new(),
            initializers: Vec::new(),
            schemas: Vec::new(),
            scale: None,
            name: None,
        });
        if let Some(frame) = self.capture.last_mut() {
            frame.push(id);
        }
        id
    }

    pub fn set_name(&mut self, id: OpId, name: impl Into<String>) {
        self.nodes[id.index()].name = Some(name.into());
    }

    pub fn add_tag(&mut self, id: OpId, tag: Tag) {
        self.nodes[id.index()].tags.insert(tag);
    }

    /// Multiply this op's adjoint contribution by `scale`.
    pub fn set_scale(&mut self, id: OpId, scale: f64) {
        self.nodes[id.index()].scale = Some(scale);
    }

    pub fn add_initializer(&mut self, id: OpId, init: OpId) {
        self.nodes[id.index()].initializers.push(init);
    }

    /// Schemas added later take precedence.
    pub(crate) fn add_schema(&mut self, id: OpId, schema: Schema) {
        self.nodes[id.index()].schemas.insert(0, schema);
    }

    pub(crate) fn set_dtype(&mut self, id: OpId, dtype: DType) {
        self.nodes[id.index()].dtype = dtype;
    }

    /// First Softmax schema of `id`, if any.
    pub fn find_softmax(&self, id: OpId) -> Option<(OpId, OpId, OpId)> {
        self.node(id).schemas.iter().find_map(|s| match s {
            Schema::Softmax { x, exps, z } => Some((*x, *exps, *z)),
            _ => None,
        })
    }

    pub fn find_sigmoid(&self, id: OpId) -> Option<OpId> {
        self.node(id).schemas.iter().find_map(|s| match s {
            Schema::Sigmoid { x } => Some(*x),
            _ => None,
        })
    }

    /// Register a seeded random stream.
    pub fn rng(&mut self, seed: u64) -> RngId {
        self.rng_seeds.push(seed);
        RngId(self.rng_seeds.len() as u32 - 1)
    }

    pub fn rng_seed(&self, rng: RngId) -> u64 {
        self.rng_seeds[rng.0 as usize]
    }

    pub fn rng_count(&self) -> usize {
        self.rng_seeds.len()
    }

    /// Start collecting every op created until the guard is dropped or
    /// finished.
    pub fn capture(&mut self) -> CaptureGuard<'_> {
        self.capture.push(Vec::new());
        let depth = self.capture.len();
        CaptureGuard {
            graph: self,
            depth,
            finished: false,
        }
    }

    pub fn capture_depth(&self) -> usize {
        self.capture.len()
    }

    /// Point every use of `old` in `user`'s args at `new`.
    pub fn replace_arg(&mut self, user: OpId, old: OpId, new: OpId) {
        if old == new {
            return;
        }
        let mut changed = false;
        for arg in self.nodes[user.index()].args.iter_mut() {
            if *arg == old {
                *arg = new;
                changed = true;
            }
        }
        if !changed {
            return;
        }
        self.nodes[old.index()].users.retain(|&u| u != user);
        let users = &mut self.nodes[new.index()].users;
        if !users.contains(&user) {
            users.push(user);
        }
    }

    /// Redirect every user of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: OpId, new: OpId) {
        let users = self.nodes[old.index()].users.clone();
        for user in users {
            if user != new {
                self.replace_arg(user, old, new);
            }
        }
    }

    /// Ops reachable from `results` along args, each after all of its args.
    /// Args are visited in order and results in the order given, so the
    /// ordering is a pure function of the graph.
    pub fn ordered_ops(&self, results: &[OpId]) -> Vec<OpId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        // (op, next arg to visit)
        let mut stack: Vec<(OpId, usize)> = Vec::new();
        for &root in results {
            if visited[root.index()] {
                continue;
            }
            visited[root.index()] = true;
            stack.push((root, 0));
            while let Some((op, next)) = stack.pop() {
                let args = &self.nodes[op.index()].args;
                if next < args.len() {
                    stack.push((op, next + 1));
                    let arg = args[next];
                    if !visited[arg.index()] {
                        visited[arg.index()] = true;
                        stack.push((arg, 0));
                    }
                } else {
                    order.push(op);
                }
            }
        }
        order
    }

    /// Variables reachable from `results`; only trainable ones if
    /// `trainable` is set.
    pub fn variables(&self, results: &[OpId], trainable: bool) -> Vec<OpId> {
        self.ordered_ops(results)
            .into_iter()
            .filter(|&id| {
                let node = self.node(id);
                matches!(node.kind, OpKind::Variable) && (!trainable || node.is_trainable())
            })
            .collect()
    }
}

/// RAII capture frame. Derefs to the builder so ops can be created through
/// it; the frame is popped when the guard goes away.
pub struct CaptureGuard<'g> {
    graph: &'g mut GraphBuilder,
    depth: usize,
    finished: bool,
}

impl CaptureGuard<'_> {
    /// Pop the frame and return the ops created while it was active.
    pub fn finish(mut self) -> Vec<OpId> {
        self.finished = true;
        self.pop()
    }

    fn pop(&mut self) -> Vec<OpId> {
        if self.graph.capture.len() >= self.depth {
            self.graph.capture.truncate(self.depth);
            self.graph.capture.pop().unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

impl Deref for CaptureGuard<'_> {
    type Target = GraphBuilder;
    fn deref(&self) -> &GraphBuilder {
        self.graph
    }
}

impl DerefMut for CaptureGuard<'_> {
    fn deref_mut(&mut self) -> &mut GraphBuilder {
        self.graph
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::Axis;

    #[test]
    fn test_users_follow_args() {
        let mut g = GraphBuilder::new();
        let a = g.constant(1.0);
        let b = g.constant(2.0);
        let c = g.add(a, b);
        assert_eq!(g.node(a).users(), &[c]);
        assert_eq!(g.node(c).args(), &[a, b]);

        let d = g.constant(3.0);
        g.replace_arg(c, a, d);
        assert_eq!(g.node(c).args(), &[d, b]);
        assert!(g.node(a).users().is_empty());
        assert_eq!(g.node(d).users(), &[c]);
    }

    #[test]
    fn test_ordered_ops_post_order() {
        let mut g = GraphBuilder::new();
        let x = g.placeholder(Axes::empty());
        let y = g.placeholder(Axes::empty());
        let s = g.add(x, y);
        let p = g.multiply(s, x);
        assert_eq!(g.ordered_ops(&[p]), vec![x, y, s, p]);
        assert_eq!(g.ordered_ops(&[p]), g.ordered_ops(&[p]));
    }

    #[test]
    fn test_capture_guard_pops_on_drop() {
        let mut g = GraphBuilder::new();
        {
            let mut guard = g.capture();
            guard.constant(1.0);
            assert_eq!(guard.capture_depth(), 1);
        }
        assert_eq!(g.capture_depth(), 0);

        let captured = {
            let mut guard = g.capture();
            let a = guard.constant(1.0);
            let inner = {
                let mut nested = guard.capture();
                nested.constant(2.0);
                nested.finish()
            };
            assert_eq!(inner.len(), 1);
            let b = guard.negative(a);
            assert_eq!(guard.capture_depth(), 1);
            let ops = guard.finish();
            assert!(ops.contains(&a) && ops.contains(&b));
            ops
        };
        assert_eq!(captured.len(), 2);
        assert_eq!(g.capture_depth(), 0);
    }

    #[test]
    fn test_capture_guard_pops_on_error() {
        fn build(g: &mut GraphBuilder) -> crate::Result<()> {
            let mut guard = g.capture();
            guard.constant(1.0);
            crate::bail!("failed while capturing")
        }
        let mut g = GraphBuilder::new();
        assert!(build(&mut g).is_err());
        assert_eq!(g.capture_depth(), 0);
    }

    #[test]
    fn test_variables_filter() {
        let mut g = GraphBuilder::new();
        let c = Axis::named("C", 2);
        let w = g.variable(Axes::new([c.clone()]));
        let t = g.temporary(Axes::new([c]));
        let s = g.add(w, t);
        assert_eq!(g.variables(&[s], true), vec![w]);
    }
}
