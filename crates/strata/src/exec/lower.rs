// Lowering: op graph -> backend primitives
//
// After planning every value has a buffer. Lowering turns each computing op
// into a short list of primitives whose operands are (buffer, description)
// pairs laid out the way the primitive wants them:
//
//   elementwise   operands reaxed (with broadcast) to the op's axes
//   reduction     operand reaxed to [flatten(reduction axes)] + out axes,
//                 reduced over its first axis
//   dot           left  -> [flatten(kept), flatten(reduced)]
//                 right -> [flatten(reduced), flatten(kept)]
//                 out   -> [flatten(left kept), flatten(right kept)]
//   unslice       fill the output with 0, copy the arg into the window
//   set_item      copy the value into the target window
//
// Backends never see views as ops: a Broadcast, ExpandDims or Slice only
// changes the description its users are lowered against.

use std::collections::HashMap;
use std::fmt;

use strata_core::axes::{Axes, Axis};
use strata_core::conv::{ConvParams, PoolParams};
use strata_core::description::{StorageId, TensorDescription};
use strata_core::dtype::DType;
use strata_core::error::{Error, Result};
use strata_core::graph::{GraphBuilder, OpId};
use strata_core::op::{BinaryOp, CmpOp, OpKind, ReduceOp, UnaryOp};
use strata_core::ops::sliced_axes;

use super::plan::{MemoryPlan, Value};

/// Tensor descriptions of every value op, created once per transformer.
#[derive(Debug, Clone, Default)]
pub struct Descriptions {
    tds: HashMap<OpId, TensorDescription>,
    /// StorageId -> op owning it.
    owners: Vec<OpId>,
}

impl Descriptions {
    /// Describe the values of `order` (which must list args before their
    /// users). Float values are stored as `dtype` when given.
    pub fn build(g: &GraphBuilder, order: &[OpId], dtype: Option<DType>) -> Result<Self> {
        let mut d = Descriptions::default();
        for &op in order {
            if d.tds.contains_key(&op) {
                continue;
            }
            let node = g.node(op);
            if !node.kind().defines_value() {
                continue;
            }
            let td = if node.kind().is_view() {
                let arg = d.get(node.args()[0])?;
                match node.kind() {
                    OpKind::Slice(slices) => arg.slice(slices, node.axes())?,
                    _ => arg.reaxe(node.axes(), true)?,
                }
            } else {
                let storage = StorageId(d.owners.len() as u32);
                d.owners.push(op);
                let dt = match dtype {
                    Some(dt) if node.dtype().is_float() => dt,
                    _ => node.dtype(),
                };
                TensorDescription::new(node.axes().clone(), dt, storage)
            };
            d.tds.insert(op, td);
        }
        Ok(d)
    }

    pub fn get(&self, op: OpId) -> Result<&TensorDescription> {
        self.tds
            .get(&op)
            .ok_or_else(|| Error::Internal(format!("no tensor description for {}", op)))
    }

    /// Storage read or written through `op`, if it has a value.
    pub fn storage(&self, op: OpId) -> Option<StorageId> {
        self.tds.get(&op).map(|td| td.storage())
    }

    pub fn owner(&self, storage: StorageId) -> Option<OpId> {
        self.owners.get(storage.0 as usize).copied()
    }

    pub fn storage_count(&self) -> usize {
        self.owners.len()
    }

    /// Memory requirement of the base description of `storage`.
    pub fn value(&self, storage: StorageId) -> Result<Value> {
        let owner = self
            .owner(storage)
            .ok_or_else(|| Error::Internal(format!("unknown storage {:?}", storage)))?;
        let td = self.get(owner)?;
        Ok(Value {
            storage,
            bytes: td.base_elems() * td.dtype().size_in_bytes(),
            elems: td.base_elems(),
        })
    }
}

/// A description bound to the buffer holding its storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub buffer: usize,
    pub td: TensorDescription,
}

/// One backend execution step.
#[derive(Debug, Clone)]
pub enum Primitive {
    Unary { op: UnaryOp, x: Operand, out: Operand },
    Binary { op: BinaryOp, x: Operand, y: Operand, out: Operand },
    Compare { op: CmpOp, x: Operand, y: Operand, out: Operand },
    /// Reduce `x` over its first axis.
    Reduce { op: ReduceOp, x: Operand, out: Operand },
    /// Index of the max (or min) over the first axis of `x`.
    ArgReduce { max: bool, x: Operand, out: Operand },
    Copy { x: Operand, out: Operand },
    Fill { out: Operand, value: f64 },
    /// `x` is 1D or 2D (rows, k); `y` is 1D or 2D (k, cols).
    Dot { x: Operand, y: Operand, out: Operand },
    /// `out` has the one-hot axis first, then the axes of `x`.
    Onehot { x: Operand, out: Operand },
    Conv { input: Operand, filter: Operand, out: Operand, params: ConvParams },
    BpropConv { delta: Operand, filter: Operand, out: Operand, params: ConvParams },
    UpdateConv { delta: Operand, input: Operand, out: Operand, params: ConvParams },
    Pool { input: Operand, argmax: Operand, out: Operand, params: PoolParams },
    BpropPool { delta: Operand, argmax: Operand, out: Operand, params: PoolParams },
    AllReduce { x: Operand, out: Operand },
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Unary { op, .. } => op.name(),
            Primitive::Binary { op, .. } => op.name(),
            Primitive::Compare { op, .. } => op.name(),
            Primitive::Reduce { op, .. } => op.name(),
            Primitive::ArgReduce { max: true, .. } => "argmax",
            Primitive::ArgReduce { max: false, .. } => "argmin",
            Primitive::Copy { .. } => "copy",
            Primitive::Fill { .. } => "fill",
            Primitive::Dot { .. } => "dot",
            Primitive::Onehot { .. } => "onehot",
            Primitive::Conv { .. } => "convolution",
            Primitive::BpropConv { .. } => "bprop_conv",
            Primitive::UpdateConv { .. } => "update_conv",
            Primitive::Pool { .. } => "pooling",
            Primitive::BpropPool { .. } => "bprop_pool",
            Primitive::AllReduce { .. } => "all_reduce",
        }
    }

    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Primitive::Unary { .. } | Primitive::Binary { .. } | Primitive::Compare { .. }
        )
    }

    pub fn out(&self) -> &Operand {
        match self {
            Primitive::Unary { out, .. }
            | Primitive::Binary { out, .. }
            | Primitive::Compare { out, .. }
            | Primitive::Reduce { out, .. }
            | Primitive::ArgReduce { out, .. }
            | Primitive::Copy { out, .. }
            | Primitive::Fill { out, .. }
            | Primitive::Dot { out, .. }
            | Primitive::Onehot { out, .. }
            | Primitive::Conv { out, .. }
            | Primitive::BpropConv { out, .. }
            | Primitive::UpdateConv { out, .. }
            | Primitive::Pool { out, .. }
            | Primitive::BpropPool { out, .. }
            | Primitive::AllReduce { out, .. } => out,
        }
    }

    pub fn inputs(&self) -> Vec<&Operand> {
        match self {
            Primitive::Unary { x, .. }
            | Primitive::Reduce { x, .. }
            | Primitive::ArgReduce { x, .. }
            | Primitive::Copy { x, .. }
            | Primitive::Onehot { x, .. }
            | Primitive::AllReduce { x, .. } => vec![x],
            Primitive::Binary { x, y, .. }
            | Primitive::Compare { x, y, .. }
            | Primitive::Dot { x, y, .. } => vec![x, y],
            Primitive::Fill { .. } => vec![],
            Primitive::Conv { input, filter, .. } => vec![input, filter],
            Primitive::BpropConv { delta, filter, .. } => vec![delta, filter],
            Primitive::UpdateConv { delta, input, .. } => vec![delta, input],
            Primitive::Pool { input, .. } => vec![input],
            Primitive::BpropPool { delta, argmax, .. } => vec![delta, argmax],
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> buf{}{:?}", self.name(), self.out().buffer, self.out().td.shape())
    }
}

/// The primitives of one or more ops that a backend compiles as a unit.
#[derive(Debug, Clone)]
pub struct ExecUnit {
    pub ops: Vec<OpId>,
    pub steps: Vec<Primitive>,
    /// Consecutive elementwise ops planned as one fused kernel.
    pub fused: bool,
}

/// Binds descriptions to planned buffers.
pub struct Lowering<'a> {
    g: &'a GraphBuilder,
    descriptions: &'a Descriptions,
    plan: &'a MemoryPlan,
}

impl<'a> Lowering<'a> {
    pub fn new(g: &'a GraphBuilder, descriptions: &'a Descriptions, plan: &'a MemoryPlan) -> Self {
        Lowering {
            g,
            descriptions,
            plan,
        }
    }

    fn bind(&self, td: TensorDescription) -> Result<Operand> {
        let buffer = self
            .plan
            .buffer_of(td.storage())
            .ok_or_else(|| Error::Internal(format!("storage {:?} has no buffer", td.storage())))?;
        Ok(Operand { buffer, td })
    }

    fn operand(&self, op: OpId) -> Result<Operand> {
        self.bind(self.descriptions.get(op)?.clone())
    }

    fn reaxed(&self, op: OpId, axes: &Axes) -> Result<Operand> {
        self.bind(self.descriptions.get(op)?.reaxe(axes, true)?)
    }

    /// Primitives computing `op`. Allocations, views and `doall` have none.
    pub fn lower(&self, op: OpId) -> Result<Vec<Primitive>> {
        let node = self.g.node(op);
        let args = node.args();
        let axes = node.axes();
        let steps = match node.kind() {
            OpKind::Placeholder
            | OpKind::Variable
            | OpKind::Temporary
            | OpKind::Constant(_)
            | OpKind::Tensor(_)
            | OpKind::Random { .. }
            | OpKind::Broadcast
            | OpKind::ExpandDims { .. }
            | OpKind::Slice(_)
            | OpKind::DoAll => vec![],

            OpKind::Unary(u) => vec![Primitive::Unary {
                op: *u,
                x: self.reaxed(args[0], axes)?,
                out: self.operand(op)?,
            }],
            OpKind::Binary(b) => vec![Primitive::Binary {
                op: *b,
                x: self.reaxed(args[0], axes)?,
                y: self.reaxed(args[1], axes)?,
                out: self.operand(op)?,
            }],
            OpKind::Compare(c) => vec![Primitive::Compare {
                op: *c,
                x: self.reaxed(args[0], axes)?,
                y: self.reaxed(args[1], axes)?,
                out: self.operand(op)?,
            }],

            OpKind::Reduce { op: r, reduction_axes } => {
                let out = self.operand(op)?;
                if reduction_axes.is_empty() {
                    vec![Primitive::Copy {
                        x: self.reaxed(args[0], axes)?,
                        out,
                    }]
                } else {
                    vec![Primitive::Reduce {
                        op: *r,
                        x: self.reaxed(args[0], &reduce_first(reduction_axes, axes))?,
                        out,
                    }]
                }
            }
            OpKind::Argmax { reduction_axes } | OpKind::Argmin { reduction_axes } => {
                vec![Primitive::ArgReduce {
                    max: matches!(node.kind(), OpKind::Argmax { .. }),
                    x: self.reaxed(args[0], &reduce_first(reduction_axes, axes))?,
                    out: self.operand(op)?,
                }]
            }

            OpKind::Dot(info) => {
                let mut x = self.descriptions.get(args[0])?.clone();
                let mut y = self.descriptions.get(args[1])?.clone();
                if let Some(dummy) = &info.dummy {
                    x = x.reaxe_with_dummy_axis(dummy, None)?;
                    y = y.reaxe_with_dummy_axis(dummy, None)?;
                }
                let x = x.dot_reaxe_left(&info.reduction_ids)?;
                let y = y.dot_reaxe_right(&info.reduction_ids, info.forward_ids.as_ref())?;
                let mut out_axes: Vec<Axis> = x.axes().as_slice()[..x.ndim().saturating_sub(1)].to_vec();
                out_axes.extend(y.axes().as_slice().iter().skip(1).cloned());
                let out = self.descriptions.get(op)?.reaxe(&Axes::new(out_axes), false)?;
                vec![Primitive::Dot {
                    x: self.bind(x)?,
                    y: self.bind(y)?,
                    out: self.bind(out)?,
                }]
            }

            OpKind::Onehot { .. } => vec![Primitive::Onehot {
                x: self.operand(args[0])?,
                out: self.operand(op)?,
            }],

            OpKind::Unslice(slices) => {
                let out = self.operand(op)?;
                let window = out.td.slice(slices, self.g.axes(args[0]))?;
                vec![
                    Primitive::Fill { out, value: 0.0 },
                    Primitive::Copy {
                        x: self.operand(args[0])?,
                        out: self.bind(window)?,
                    },
                ]
            }

            OpKind::Fill(value) => vec![Primitive::Fill {
                out: self.operand(args[0])?,
                value: *value,
            }],

            OpKind::SetItem(item) => {
                let target_td = self.descriptions.get(args[0])?;
                let window = target_td.slice(item, &sliced_axes(target_td.axes(), item)?)?;
                let value_td = self.descriptions.get(args[1])?;
                let value = value_td
                    .reaxe(window.axes(), true)
                    .or_else(|_| value_td.cast(window.axes()))?;
                vec![Primitive::Copy {
                    x: self.bind(value)?,
                    out: self.bind(window)?,
                }]
            }

            OpKind::Convolution(params) => vec![Primitive::Conv {
                input: self.operand(args[0])?,
                filter: self.operand(args[1])?,
                out: self.operand(op)?,
                params: *params,
            }],
            OpKind::BpropConv(params) => vec![Primitive::BpropConv {
                delta: self.operand(args[0])?,
                filter: self.operand(args[1])?,
                out: self.operand(op)?,
                params: *params,
            }],
            OpKind::UpdateConv(params) => vec![Primitive::UpdateConv {
                delta: self.operand(args[0])?,
                input: self.operand(args[1])?,
                out: self.operand(op)?,
                params: *params,
            }],
            OpKind::Pooling(params) => vec![Primitive::Pool {
                input: self.operand(args[0])?,
                argmax: self.operand(args[1])?,
                out: self.operand(op)?,
                params: *params,
            }],
            OpKind::BpropPool(params) => vec![Primitive::BpropPool {
                delta: self.operand(args[0])?,
                argmax: self.operand(args[1])?,
                out: self.operand(op)?,
                params: *params,
            }],
            OpKind::AllReduce => vec![Primitive::AllReduce {
                x: self.operand(args[0])?,
                out: self.operand(op)?,
            }],
        };
        Ok(steps)
    }

    /// Units for instructions `indices` of the dataflow, merging the members
    /// of each fusion group.
    pub fn units(&self, ops: &[OpId], indices: &[usize]) -> Result<Vec<ExecUnit>> {
        let mut units: Vec<ExecUnit> = Vec::new();
        let mut last_group = None;
        for &i in indices {
            let op = ops[i];
            let steps = self.lower(op)?;
            let group = self.plan.group_of(i);
            let fused = self.plan.groups()[group].len() > 1;
            match units.last_mut() {
                Some(unit) if fused && last_group == Some(group) => {
                    unit.ops.push(op);
                    unit.steps.extend(steps);
                }
                _ => units.push(ExecUnit {
                    ops: vec![op],
                    steps,
                    fused,
                }),
            }
            last_group = Some(group);
        }
        Ok(units)
    }

    /// One unit per op of `ops`, with no fusion.
    pub fn unfused(&self, ops: &[OpId]) -> Result<Vec<ExecUnit>> {
        ops.iter()
            .map(|&op| {
                Ok(ExecUnit {
                    ops: vec![op],
                    steps: self.lower(op)?,
                    fused: false,
                })
            })
            .collect()
    }
}

fn reduce_first(reduction_axes: &Axes, out_axes: &Axes) -> Axes {
    let mut axes = vec![Axis::flattened(reduction_axes.clone())];
    axes.extend(out_axes.iter().cloned());
    Axes::new(axes)
}
