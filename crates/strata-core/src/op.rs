use std::fmt;

use crate::axes::{Axes, Axis, AxisIdTuple};
use crate::conv::{ConvParams, PoolParams};
use crate::description::SliceItem;
use crate::graph::{OpId, RngId};
use crate::tensor::HostTensor;

// OpKind: what a graph node computes
//
// Every node of the arena carries one OpKind. The payload holds everything
// that is specific to the kind (the unary function, reduction axes, conv
// geometry, ...); what all nodes share (args, axes, dtype, tags) lives on
// the Node itself. Passes that need per-kind behaviour (autodiff, pruning,
// lowering, the planner) match on this enum, so adding a kind makes every
// such pass fail to compile until it handles the new case.
//
// Categories:
//
//   allocation   Placeholder, Variable, Temporary, Constant, Tensor, Random
//   view         Broadcast, ExpandDims, Slice (no instruction of their own)
//   elementwise  Unary, Binary, Compare
//   reduction    Reduce, Argmax, Argmin
//   other        Dot, Onehot, Unslice, Convolution and Pooling families,
//                AllReduce
//   side effect  Fill, SetItem, DoAll (produce no value)

/// Values below this are clamped by `safelog`.
pub const SAFELOG_MIN: f64 = 1.928_749_847_963_918e-22; // e^-50

pub fn safelog(x: f64) -> f64 {
    x.max(SAFELOG_MIN).ln()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Absolute,
    Negative,
    Exp,
    Log,
    SafeLog,
    Sqrt,
    Square,
    Reciprocal,
    Sign,
    Sin,
    Cos,
    Tanh,
}

impl UnaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryOp::Absolute => "absolute",
            UnaryOp::Negative => "negative",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::SafeLog => "safelog",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Square => "square",
            UnaryOp::Reciprocal => "reciprocal",
            UnaryOp::Sign => "sign",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tanh => "tanh",
        }
    }

    pub fn apply(&self, x: f64) -> f64 {
        match self {
            UnaryOp::Absolute => x.abs(),
            UnaryOp::Negative => -x,
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::SafeLog => safelog(x),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Square => x * x,
            UnaryOp::Reciprocal => 1.0 / x,
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tanh => x.tanh(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Power,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Subtract => "subtract",
            BinaryOp::Multiply => "multiply",
            BinaryOp::Divide => "divide",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
            BinaryOp::Power => "power",
        }
    }

    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => a / b,
            BinaryOp::Maximum => a.max(b),
            BinaryOp::Minimum => a.min(b),
            BinaryOp::Power => a.powf(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
}

impl CmpOp {
    pub fn name(&self) -> &'static str {
        match self {
            CmpOp::Equal => "equal",
            CmpOp::NotEqual => "not_equal",
            CmpOp::Greater => "greater",
            CmpOp::Less => "less",
            CmpOp::GreaterEqual => "greater_equal",
            CmpOp::LessEqual => "less_equal",
        }
    }

    pub fn apply(&self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Equal => a == b,
            CmpOp::NotEqual => a != b,
            CmpOp::Greater => a > b,
            CmpOp::Less => a < b,
            CmpOp::GreaterEqual => a >= b,
            CmpOp::LessEqual => a <= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    pub fn name(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        }
    }

    pub fn identity(&self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        }
    }

    pub fn combine(&self, acc: f64, x: f64) -> f64 {
        match self {
            ReduceOp::Sum => acc + x,
            ReduceOp::Max => acc.max(x),
            ReduceOp::Min => acc.min(x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RandomDist {
    Uniform { low: f64, high: f64 },
    Normal { loc: f64, scale: f64 },
}

/// Axis bookkeeping of a dot, fixed when the op is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotInfo {
    /// Ids contracted over (in the left operand's and, after renaming, the
    /// right operand's id space).
    pub reduction_ids: AxisIdTuple,
    /// Ids of the forward dot's output when this dot is that dot's adjoint;
    /// the right operand's ids are matched against them positionally.
    pub forward_ids: Option<AxisIdTuple>,
    /// Length-1 axis contracted over when the operands share no axis.
    pub dummy: Option<Axis>,
}

#[derive(Debug, Clone)]
pub enum OpKind {
    Placeholder,
    Variable,
    Temporary,
    Constant(f64),
    Tensor(HostTensor),
    Random { rng: RngId, dist: RandomDist },

    Broadcast,
    ExpandDims { axis: Axis, pos: usize },
    Slice(Vec<SliceItem>),

    Unary(UnaryOp),
    Binary(BinaryOp),
    Compare(CmpOp),

    Reduce { op: ReduceOp, reduction_axes: Axes },
    Argmax { reduction_axes: Axes },
    Argmin { reduction_axes: Axes },

    Dot(DotInfo),
    Onehot { axis: Axis },
    /// Scatter the arg into zeros of the op's axes.
    Unslice(Vec<SliceItem>),
    Convolution(ConvParams),
    /// Input gradient of a convolution. Args: delta, filter, forward op.
    BpropConv(ConvParams),
    /// Filter gradient of a convolution. Args: delta, input, forward op.
    UpdateConv(ConvParams),
    /// Args: input, argmax scratch.
    Pooling(PoolParams),
    /// Args: delta, argmax scratch, forward op.
    BpropPool(PoolParams),
    AllReduce,

    Fill(f64),
    /// Args: target, value. An empty item list assigns the whole target.
    SetItem(Vec<SliceItem>),
    DoAll,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Placeholder => "placeholder",
            OpKind::Variable => "variable",
            OpKind::Temporary => "temporary",
            OpKind::Constant(_) => "constant",
            OpKind::Tensor(_) => "numpy_tensor",
            OpKind::Random { dist, .. } => match dist {
                RandomDist::Uniform { .. } => "uniform",
                RandomDist::Normal { .. } => "normal",
            },
            OpKind::Broadcast => "broadcast",
            OpKind::ExpandDims { .. } => "expand_dims",
            OpKind::Slice(_) => "slice",
            OpKind::Unary(op) => op.name(),
            OpKind::Binary(op) => op.name(),
            OpKind::Compare(op) => op.name(),
            OpKind::Reduce { op, .. } => op.name(),
            OpKind::Argmax { .. } => "argmax",
            OpKind::Argmin { .. } => "argmin",
            OpKind::Dot(_) => "dot",
            OpKind::Onehot { .. } => "onehot",
            OpKind::Unslice(_) => "unslice",
            OpKind::Convolution(_) => "convolution",
            OpKind::BpropConv(_) => "bprop_conv",
            OpKind::UpdateConv(_) => "update_conv",
            OpKind::Pooling(_) => "pooling",
            OpKind::BpropPool(_) => "bprop_pool",
            OpKind::AllReduce => "all_reduce",
            OpKind::Fill(_) => "fill",
            OpKind::SetItem(_) => "set_item",
            OpKind::DoAll => "doall",
        }
    }

    /// Ops whose storage is created and loaded by the transformer rather
    /// than computed by an instruction.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            OpKind::Placeholder
                | OpKind::Variable
                | OpKind::Temporary
                | OpKind::Constant(_)
                | OpKind::Tensor(_)
                | OpKind::Random { .. }
        )
    }

    /// Ops that are a new description of their arg's storage.
    pub fn is_view(&self) -> bool {
        matches!(
            self,
            OpKind::Broadcast | OpKind::ExpandDims { .. } | OpKind::Slice(_)
        )
    }

    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            OpKind::Unary(_) | OpKind::Binary(_) | OpKind::Compare(_)
        )
    }

    /// Ops run only for their effect on another op's storage.
    pub fn is_side_effect(&self) -> bool {
        matches!(self, OpKind::Fill(_) | OpKind::SetItem(_) | OpKind::DoAll)
    }

    pub fn defines_value(&self) -> bool {
        !self.is_side_effect()
    }
}

/// Substructure markers attached to composite results. Autodiff uses the
/// first schema of an op instead of the op's own rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schema {
    Softmax { x: OpId, exps: OpId, z: OpId },
    Sigmoid { x: OpId },
    CrossEntropyMultiInner { x: OpId, y: OpId, s: OpId },
    CrossEntropyBinaryInner { x: OpId, y: OpId, t: OpId },
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safelog_clamps() {
        assert!((safelog(0.0) + 50.0).abs() < 1e-9);
        assert!((safelog(1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_categories() {
        assert!(OpKind::Placeholder.is_allocation());
        assert!(OpKind::Broadcast.is_view());
        assert!(OpKind::Unary(UnaryOp::Exp).is_elementwise());
        assert!(!OpKind::Fill(0.0).defines_value());
        assert!(OpKind::Dot(DotInfo {
            reduction_ids: AxisIdTuple::default(),
            forward_ids: None,
            dummy: None,
        })
        .defines_value());
    }

    #[test]
    fn test_reduce_identity() {
        let xs = [3.0, -1.0, 2.0];
        for op in [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Min] {
            let r = xs.iter().fold(op.identity(), |acc, &x| op.combine(acc, x));
            let expected = match op {
                ReduceOp::Sum => 4.0,
                ReduceOp::Max => 3.0,
                ReduceOp::Min => -1.0,
            };
            assert_eq!(r, expected);
        }
    }
}
