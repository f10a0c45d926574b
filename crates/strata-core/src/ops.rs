use crate::axes::{Axes, Axis, AxisIdTuple, AxisSlice};
use crate::conv::{conv_output_axes, pool_output_axes, ConvParams, PoolParams};
use crate::description::{SliceItem, StorageId, TensorDescription};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{GraphBuilder, OpId, RngId, Tag};
use crate::op::{BinaryOp, CmpOp, DotInfo, OpKind, RandomDist, ReduceOp, Schema, UnaryOp};
use crate::tensor::HostTensor;

// Op constructors
//
// Every public way of adding an op to a graph. Constructors compute the
// result axes eagerly, so an axis mismatch is reported where the op is
// built rather than when the graph is compiled.
//
// Axis rules:
//   elementwise  ordered union of the operands' axes
//   reduction    operand axes minus the reduction axes
//   dot          (x - red) + (y - red), red = shared axes unless given

/// Which axes a reduction removes.
#[derive(Debug, Clone, Default)]
pub enum Reduction {
    /// All sample (non-batch) axes.
    #[default]
    Sample,
    /// Every axis; the result is a scalar.
    All,
    Over(Axes),
    /// Reduce everything except these axes.
    To(Axes),
    Explicit { reduction_axes: Axes, out_axes: Axes },
}

impl Reduction {
    pub fn over(axes: impl Into<Axes>) -> Self {
        Reduction::Over(axes.into())
    }

    pub fn to(axes: impl Into<Axes>) -> Self {
        Reduction::To(axes.into())
    }

    /// `(reduction_axes, out_axes)` for an operand with `axes`. The two
    /// sets must be disjoint and together make up exactly `axes`.
    pub fn resolve(&self, axes: &Axes) -> Result<(Axes, Axes)> {
        let (red, out) = match self {
            Reduction::Sample => {
                let red = axes.sample_axes();
                let out = axes - &red;
                (red, out)
            }
            Reduction::All => (axes.clone(), Axes::empty()),
            Reduction::Over(red) => (red.clone(), axes - red),
            Reduction::To(out) => (axes - out, out.clone()),
            Reduction::Explicit {
                reduction_axes,
                out_axes,
            } => (reduction_axes.clone(), out_axes.clone()),
        };
        let ids = axes.as_axis_ids();
        let red_ids = red.as_axis_ids();
        let out_ids = out.as_axis_ids();
        let foreign = red_ids.append(&out_ids).sub(&ids);
        if !foreign.is_empty() {
            return Err(Error::axis(format!(
                "reduction of {} names axes {} it does not have",
                axes,
                foreign.as_axes()
            )));
        }
        let shared = red_ids.intersect(&out_ids);
        if !shared.is_empty() {
            return Err(Error::axis(format!(
                "axes {} are both reduced and kept",
                shared.as_axes()
            )));
        }
        let missing = ids.sub(&red_ids).sub(&out_ids);
        if !missing.is_empty() {
            return Err(Error::axis(format!(
                "reduction of {} neither reduces nor keeps {}",
                axes,
                missing.as_axes()
            )));
        }
        Ok((red, out))
    }
}

/// Optional axis overrides for `dot_with`.
#[derive(Debug, Clone, Default)]
pub struct DotAxes {
    pub reduction_axes: Option<Axes>,
    pub out_axes: Option<Axes>,
    pub(crate) forward: Option<OpId>,
}

impl DotAxes {
    pub fn reduce(axes: impl Into<Axes>) -> Self {
        DotAxes {
            reduction_axes: Some(axes.into()),
            ..Default::default()
        }
    }

    pub fn out(axes: impl Into<Axes>) -> Self {
        DotAxes {
            out_axes: Some(axes.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrossEntropyOptions {
    /// Report in bits rather than nats.
    pub usebits: bool,
    pub reduction: Reduction,
    /// Use the `x - sum(x*t) + log(Z)` form when `y` is a softmax.
    pub enable_softmax_opt: bool,
    /// Attach the schema that short-circuits the adjoint.
    pub enable_diff_opt: bool,
}

impl Default for CrossEntropyOptions {
    fn default() -> Self {
        CrossEntropyOptions {
            usebits: false,
            reduction: Reduction::Sample,
            enable_softmax_opt: true,
            enable_diff_opt: true,
        }
    }
}

/// Axes kept by `slices` over `axes`. A full range keeps the axis itself;
/// other ranges produce a sliced axis.
pub fn sliced_axes(axes: &Axes, slices: &[SliceItem]) -> Result<Axes> {
    if slices.len() > axes.len() {
        return Err(Error::InvalidSlice(format!(
            "{} slice entries for axes {}",
            slices.len(),
            axes
        )));
    }
    let mut kept = Vec::new();
    for (i, axis) in axes.iter().enumerate() {
        match slices.get(i) {
            None => kept.push(axis.clone()),
            Some(SliceItem::Index(_)) => {}
            Some(SliceItem::Range(s)) if *s == AxisSlice::full() => kept.push(axis.clone()),
            Some(SliceItem::Range(s)) => kept.push(Axis::sliced(axis, *s)?),
        }
    }
    Ok(Axes::new(kept))
}

fn check_value_fits(value: &Axes, target: &Axes) -> Result<()> {
    let subset = value.as_axis_ids().sub(&target.as_axis_ids()).is_empty();
    if subset || value.lengths() == target.lengths() {
        Ok(())
    } else {
        Err(Error::axis(format!(
            "value with axes {} cannot be stored into {}",
            value, target
        )))
    }
}

impl GraphBuilder {
    // Allocation

    /// A value supplied by the caller on every computation call.
    pub fn placeholder(&mut self, axes: impl Into<Axes>) -> OpId {
        let dtype = self.default_dtype();
        self.add_node(OpKind::Placeholder, vec![], axes.into(), dtype)
    }

    /// A trainable, persistent tensor. Uninitialized unless given an
    /// initializer.
    pub fn variable(&mut self, axes: impl Into<Axes>) -> OpId {
        let dtype = self.default_dtype();
        let id = self.add_node(OpKind::Variable, vec![], axes.into(), dtype);
        self.add_tag(id, Tag::Trainable);
        self.add_tag(id, Tag::Persistent);
        id
    }

    /// A variable whose initializer is built by `init`. Every op `init`
    /// creates runs once, before the first computation call.
    pub fn variable_init<F>(&mut self, axes: impl Into<Axes>, init: F) -> Result<OpId>
    where
        F: FnOnce(&mut GraphBuilder, OpId) -> Result<()>,
    {
        let var = self.variable(axes);
        let ops = {
            let mut guard = self.capture();
            init(&mut guard, var)?;
            guard.finish()
        };
        for op in ops {
            self.add_initializer(var, op);
        }
        Ok(var)
    }

    /// A variable initialized to `value` everywhere.
    pub fn variable_filled(&mut self, axes: impl Into<Axes>, value: f64) -> OpId {
        let var = self.variable(axes);
        let fill = self.fill(var, value);
        self.add_initializer(var, fill);
        var
    }

    /// Scratch storage that is neither trainable nor persistent.
    pub fn temporary(&mut self, axes: impl Into<Axes>) -> OpId {
        let dtype = self.default_dtype();
        self.add_node(OpKind::Temporary, vec![], axes.into(), dtype)
    }

    pub fn constant(&mut self, value: f64) -> OpId {
        self.constant_with_axes(value, Axes::empty())
    }

    pub fn constant_with_axes(&mut self, value: f64, axes: impl Into<Axes>) -> OpId {
        let dtype = self.default_dtype();
        let id = self.add_node(OpKind::Constant(value), vec![], axes.into(), dtype);
        self.add_tag(id, Tag::Persistent);
        id
    }

    /// A constant tensor holding `data`, whose shape must match `axes`.
    pub fn numpy_tensor(&mut self, data: HostTensor, axes: impl Into<Axes>) -> Result<OpId> {
        let axes = axes.into();
        if data.shape() != axes.lengths().as_slice() {
            return Err(Error::ShapeMismatch {
                expected: axes.lengths(),
                got: data.shape().to_vec(),
            });
        }
        let dtype = self.default_dtype();
        let id = self.add_node(OpKind::Tensor(data), vec![], axes, dtype);
        self.add_tag(id, Tag::Persistent);
        Ok(id)
    }

    /// Uniform samples from `rng`, drawn once when storage is allocated.
    pub fn uniform(&mut self, rng: RngId, low: f64, high: f64, axes: impl Into<Axes>) -> OpId {
        self.random(rng, RandomDist::Uniform { low, high }, axes.into())
    }

    pub fn normal(&mut self, rng: RngId, loc: f64, scale: f64, axes: impl Into<Axes>) -> OpId {
        self.random(rng, RandomDist::Normal { loc, scale }, axes.into())
    }

    fn random(&mut self, rng: RngId, dist: RandomDist, axes: Axes) -> OpId {
        let dtype = self.default_dtype();
        let id = self.add_node(OpKind::Random { rng, dist }, vec![], axes, dtype);
        self.add_tag(id, Tag::Persistent);
        id
    }

    // Elementwise

    fn unary(&mut self, op: UnaryOp, x: OpId) -> OpId {
        let axes = self.axes(x).clone();
        let dtype = self.default_dtype();
        self.add_node(OpKind::Unary(op), vec![x], axes, dtype)
    }

    fn binary(&mut self, op: BinaryOp, x: OpId, y: OpId) -> OpId {
        let axes = self.axes(x) + self.axes(y);
        let dtype = self.default_dtype();
        self.add_node(OpKind::Binary(op), vec![x, y], axes, dtype)
    }

    fn compare(&mut self, op: CmpOp, x: OpId, y: OpId) -> OpId {
        let axes = self.axes(x) + self.axes(y);
        self.add_node(OpKind::Compare(op), vec![x, y], axes, DType::Bool)
    }

    pub fn absolute(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Absolute, x)
    }

    pub fn negative(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Negative, x)
    }

    pub fn exp(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Exp, x)
    }

    pub fn log(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Log, x)
    }

    /// `log(max(x, e^-50))`.
    pub fn safelog(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::SafeLog, x)
    }

    pub fn sqrt(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Sqrt, x)
    }

    pub fn square(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Square, x)
    }

    pub fn reciprocal(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Reciprocal, x)
    }

    pub fn sign(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Sign, x)
    }

    pub fn sin(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Sin, x)
    }

    pub fn cos(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Cos, x)
    }

    pub fn tanh(&mut self, x: OpId) -> OpId {
        self.unary(UnaryOp::Tanh, x)
    }

    pub fn add(&mut self, x: OpId, y: OpId) -> OpId {
        self.binary(BinaryOp::Add, x, y)
    }

    pub fn subtract(&mut self, x: OpId, y: OpId) -> OpId {
        self.binary(BinaryOp::Subtract, x, y)
    }

    pub fn multiply(&mut self, x: OpId, y: OpId) -> OpId {
        self.binary(BinaryOp::Multiply, x, y)
    }

    pub fn divide(&mut self, x: OpId, y: OpId) -> OpId {
        self.binary(BinaryOp::Divide, x, y)
    }

    pub fn maximum(&mut self, x: OpId, y: OpId) -> OpId {
        self.binary(BinaryOp::Maximum, x, y)
    }

    pub fn minimum(&mut self, x: OpId, y: OpId) -> OpId {
        self.binary(BinaryOp::Minimum, x, y)
    }

    pub fn power(&mut self, x: OpId, y: OpId) -> OpId {
        self.binary(BinaryOp::Power, x, y)
    }

    pub fn equal(&mut self, x: OpId, y: OpId) -> OpId {
        self.compare(CmpOp::Equal, x, y)
    }

    pub fn not_equal(&mut self, x: OpId, y: OpId) -> OpId {
        self.compare(CmpOp::NotEqual, x, y)
    }

    pub fn greater(&mut self, x: OpId, y: OpId) -> OpId {
        self.compare(CmpOp::Greater, x, y)
    }

    pub fn less(&mut self, x: OpId, y: OpId) -> OpId {
        self.compare(CmpOp::Less, x, y)
    }

    pub fn greater_equal(&mut self, x: OpId, y: OpId) -> OpId {
        self.compare(CmpOp::GreaterEqual, x, y)
    }

    pub fn less_equal(&mut self, x: OpId, y: OpId) -> OpId {
        self.compare(CmpOp::LessEqual, x, y)
    }

    /// `c - x` for a scalar constant `c`.
    pub(crate) fn rsub_scalar(&mut self, c: f64, x: OpId) -> OpId {
        let c = self.constant(c);
        self.subtract(c, x)
    }

    pub(crate) fn mul_scalar(&mut self, x: OpId, c: f64) -> OpId {
        let c = self.constant(c);
        self.multiply(x, c)
    }

    // Reductions

    fn reduce(&mut self, op: ReduceOp, x: OpId, reduction: &Reduction) -> Result<OpId> {
        let (reduction_axes, out_axes) = reduction.resolve(self.axes(x))?;
        let dtype = self.default_dtype();
        Ok(self.add_node(
            OpKind::Reduce { op, reduction_axes },
            vec![x],
            out_axes,
            dtype,
        ))
    }

    pub fn sum(&mut self, x: OpId, reduction: Reduction) -> Result<OpId> {
        self.reduce(ReduceOp::Sum, x, &reduction)
    }

    pub fn max(&mut self, x: OpId, reduction: Reduction) -> Result<OpId> {
        self.reduce(ReduceOp::Max, x, &reduction)
    }

    pub fn min(&mut self, x: OpId, reduction: Reduction) -> Result<OpId> {
        self.reduce(ReduceOp::Min, x, &reduction)
    }

    /// Number of elements `reduction` folds together, as a scalar constant.
    pub fn tensor_size(&mut self, x: OpId, reduction: Reduction) -> Result<OpId> {
        let (red, _) = reduction.resolve(self.axes(x))?;
        Ok(self.constant(red.size() as f64))
    }

    pub fn mean(&mut self, x: OpId, reduction: Reduction) -> Result<OpId> {
        let s = self.sum(x, reduction.clone())?;
        let n = self.tensor_size(x, reduction)?;
        Ok(self.divide(s, n))
    }

    /// Index of the largest element along the flattened reduction axes.
    pub fn argmax(&mut self, x: OpId, reduction: Reduction) -> Result<OpId> {
        let (reduction_axes, out_axes) = reduction.resolve(self.axes(x))?;
        Ok(self.add_node(OpKind::Argmax { reduction_axes }, vec![x], out_axes, DType::I64))
    }

    pub fn argmin(&mut self, x: OpId, reduction: Reduction) -> Result<OpId> {
        let (reduction_axes, out_axes) = reduction.resolve(self.axes(x))?;
        Ok(self.add_node(OpKind::Argmin { reduction_axes }, vec![x], out_axes, DType::I64))
    }

    // Linear algebra

    /// Contract `x` and `y` over the axes they share.
    pub fn dot(&mut self, x: OpId, y: OpId) -> Result<OpId> {
        self.dot_with(x, y, DotAxes::default())
    }

    pub fn dot_with(&mut self, x: OpId, y: OpId, axes: DotAxes) -> Result<OpId> {
        let x_ids = self.axes(x).as_axis_ids();
        let own_y_ids = self.axes(y).as_axis_ids();
        let forward_ids = axes.forward.map(|f| self.axes(f).as_axis_ids());
        let y_ids = match &forward_ids {
            Some(ids) if ids.len() != own_y_ids.len() => {
                return Err(Error::axis(format!(
                    "forward dot output {} does not match adjoint {}",
                    ids.as_axes(),
                    self.axes(y)
                )))
            }
            Some(ids) => ids.clone(),
            None => own_y_ids,
        };
        let mut red = match &axes.reduction_axes {
            Some(red) => {
                let red = red.as_axis_ids();
                if !red.sub(&x_ids).is_empty() || !red.sub(&y_ids).is_empty() {
                    return Err(Error::axis(format!(
                        "reduction axes {} are not shared by {} and {}",
                        red.as_axes(),
                        x_ids.as_axes(),
                        y_ids.as_axes()
                    )));
                }
                red
            }
            None => x_ids.intersect(&y_ids),
        };
        let out = match &axes.out_axes {
            Some(out) => out.as_axis_ids(),
            None => x_ids.sub(&red).append(&y_ids.sub(&red)),
        };
        red = red.sub(&out);
        let dummy = if red.is_empty() {
            let dummy = Axis::named("dot_dummy", 1);
            red = Axes::new([dummy.clone()]).as_axis_ids();
            Some(dummy)
        } else {
            None
        };
        let info = DotInfo {
            reduction_ids: red,
            forward_ids,
            dummy,
        };
        let dtype = self.default_dtype();
        Ok(self.add_node(OpKind::Dot(info), vec![x, y], out.as_axes(), dtype))
    }

    // Views

    /// `x` seen with `axes`; axes of `x` may be permuted and new axes are
    /// broadcast. Every axis of `x` must appear in `axes`.
    pub fn broadcast(&mut self, x: OpId, axes: impl Into<Axes>) -> Result<OpId> {
        let axes = axes.into();
        if *self.axes(x) == axes {
            return Ok(x);
        }
        let dropped: AxisIdTuple = self.axes(x).as_axis_ids().sub(&axes.as_axis_ids());
        if !dropped.is_empty() {
            return Err(Error::axis(format!(
                "broadcast of {} to {} would drop {}",
                self.axes(x),
                axes,
                dropped.as_axes()
            )));
        }
        let dtype = self.node(x).dtype();
        Ok(self.add_node(OpKind::Broadcast, vec![x], axes, dtype))
    }

    /// Insert `axis` at `pos`, broadcasting `x` along it.
    pub fn expand_dims(&mut self, x: OpId, axis: Axis, pos: usize) -> OpId {
        let mut axes = self.axes(x).to_vec();
        let pos = pos.min(axes.len());
        axes.insert(pos, axis.clone());
        let dtype = self.node(x).dtype();
        self.add_node(OpKind::ExpandDims { axis, pos }, vec![x], Axes::new(axes), dtype)
    }

    /// Select from `x`. Integer entries drop their axis; range entries keep
    /// it as `axes` (derived sliced axes when `axes` is None).
    pub fn slice(&mut self, x: OpId, slices: &[SliceItem], axes: Option<Axes>) -> Result<OpId> {
        let axes = match axes {
            Some(axes) => axes,
            None => sliced_axes(self.axes(x), slices)?,
        };
        let dtype = self.node(x).dtype();
        TensorDescription::new(self.axes(x).clone(), dtype, StorageId(0)).slice(slices, &axes)?;
        Ok(self.add_node(OpKind::Slice(slices.to_vec()), vec![x], axes, dtype))
    }

    /// Zeros over `out_axes` with `x` written into the `slices` window.
    pub fn unslice(&mut self, x: OpId, slices: &[SliceItem], out_axes: impl Into<Axes>) -> Result<OpId> {
        let out_axes = out_axes.into();
        let dtype = self.node(x).dtype();
        TensorDescription::new(out_axes.clone(), dtype, StorageId(0))
            .slice(slices, self.axes(x))?;
        Ok(self.add_node(OpKind::Unslice(slices.to_vec()), vec![x], out_axes, dtype))
    }

    /// Zero-pad each axis of `x` by `(before, after)`.
    pub fn pad(&mut self, x: OpId, paddings: &[(usize, usize)], axes: Option<Axes>) -> Result<OpId> {
        let x_axes = self.axes(x).clone();
        if paddings.len() != x_axes.len() {
            return Err(Error::axis(format!(
                "{} paddings for axes {}",
                paddings.len(),
                x_axes
            )));
        }
        let axes = match axes {
            Some(axes) => axes,
            None => x_axes
                .iter()
                .zip(paddings)
                .map(|(axis, &(pre, post))| {
                    if pre == 0 && post == 0 {
                        axis.clone()
                    } else {
                        Axis::padded(axis, pre, post)
                    }
                })
                .collect(),
        };
        let slices: Vec<SliceItem> = paddings
            .iter()
            .map(|&(pre, post)| {
                let start = if pre == 0 { None } else { Some(pre as isize) };
                let stop = if post == 0 { None } else { Some(-(post as isize)) };
                SliceItem::Range(AxisSlice::new(start, stop, 1))
            })
            .collect();
        self.unslice(x, &slices, axes)
    }

    // Side effects

    pub fn fill(&mut self, tensor: OpId, value: f64) -> OpId {
        let dtype = self.default_dtype();
        self.add_node(OpKind::Fill(value), vec![tensor], Axes::empty(), dtype)
    }

    /// Store `value` into the `item` window of `tensor`.
    pub fn set_item(&mut self, tensor: OpId, item: &[SliceItem], value: OpId) -> Result<OpId> {
        let target = sliced_axes(self.axes(tensor), item)?;
        check_value_fits(self.axes(value), &target)?;
        let dtype = self.default_dtype();
        Ok(self.add_node(OpKind::SetItem(item.to_vec()), vec![tensor, value], Axes::empty(), dtype))
    }

    /// Store `value` into all of `tensor`.
    pub fn assign(&mut self, tensor: OpId, value: OpId) -> Result<OpId> {
        self.set_item(tensor, &[], value)
    }

    /// Run all of `ops`; has no value of its own.
    pub fn doall(&mut self, ops: &[OpId]) -> OpId {
        let dtype = self.default_dtype();
        self.add_node(OpKind::DoAll, ops.to_vec(), Axes::empty(), dtype)
    }

    // Composites

    pub fn sigmoid(&mut self, x: OpId) -> OpId {
        let nx = self.negative(x);
        let e = self.exp(nx);
        let one = self.constant(1.0);
        let d = self.add(e, one);
        let result = self.reciprocal(d);
        self.add_schema(result, Schema::Sigmoid { x });
        result
    }

    /// Softmax over the sample axes of `x`.
    pub fn softmax(&mut self, x: OpId) -> Result<OpId> {
        self.softmax_over(x, Reduction::Sample)
    }

    pub fn softmax_over(&mut self, x: OpId, reduction: Reduction) -> Result<OpId> {
        let (red, _) = reduction.resolve(self.axes(x))?;
        let xmax = self.max(x, Reduction::Over(red.clone()))?;
        let shifted = self.subtract(x, xmax);
        let exps = self.exp(shifted);
        let z = self.sum(exps, Reduction::Over(red))?;
        let result = self.divide(exps, z);
        self.add_schema(result, Schema::Softmax { x: shifted, exps, z });
        Ok(result)
    }

    pub fn cross_entropy_multi(&mut self, y: OpId, t: OpId) -> Result<OpId> {
        self.cross_entropy_multi_with(y, t, &CrossEntropyOptions::default())
    }

    pub fn cross_entropy_multi_with(
        &mut self,
        y: OpId,
        t: OpId,
        opts: &CrossEntropyOptions,
    ) -> Result<OpId> {
        let softmax = self.find_softmax(y).filter(|_| opts.enable_softmax_opt);
        let mut result = match softmax {
            // Relies on sum(t) == 1 over the softmax axes.
            Some((x, _, z)) => {
                let xt = self.multiply(x, t);
                let sum = self.sum(xt, opts.reduction.clone())?;
                let s = self.negative(sum);
                let logz = self.safelog(z);
                let result = self.add(s, logz);
                if opts.enable_diff_opt {
                    self.add_schema(result, Schema::CrossEntropyMultiInner { x, y, s });
                }
                result
            }
            None => {
                let logy = self.safelog(y);
                let prod = self.multiply(logy, t);
                let sum = self.sum(prod, opts.reduction.clone())?;
                self.negative(sum)
            }
        };
        if opts.usebits {
            result = self.mul_scalar(result, 1.0 / std::f64::consts::LN_2);
        }
        Ok(result)
    }

    pub fn cross_entropy_binary_inner(&mut self, y: OpId, t: OpId, opts: &CrossEntropyOptions) -> OpId {
        match self.find_sigmoid(y).filter(|_| opts.enable_softmax_opt) {
            Some(x) => {
                let one_minus_t = self.rsub_scalar(1.0, t);
                let a = self.multiply(one_minus_t, x);
                let logy = self.safelog(y);
                let result = self.subtract(a, logy);
                if opts.enable_diff_opt {
                    self.add_schema(result, Schema::CrossEntropyBinaryInner { x, y, t });
                }
                result
            }
            None => {
                let logy = self.safelog(y);
                let a = self.multiply(logy, t);
                let one_minus_y = self.rsub_scalar(1.0, y);
                let log1y = self.safelog(one_minus_y);
                let one_minus_t = self.rsub_scalar(1.0, t);
                let b = self.multiply(log1y, one_minus_t);
                let s = self.add(a, b);
                self.negative(s)
            }
        }
    }

    pub fn cross_entropy_binary(&mut self, y: OpId, t: OpId, reduction: Reduction) -> Result<OpId> {
        let inner = self.cross_entropy_binary_inner(y, t, &CrossEntropyOptions::default());
        self.sum(inner, reduction)
    }

    // Other computations

    /// One-hot encoding of the integer values of `x` along `axis`.
    pub fn onehot(&mut self, x: OpId, axis: Axis) -> OpId {
        let axes = Axes::new([axis.clone()]).concat(self.axes(x));
        let dtype = self.default_dtype();
        self.add_node(OpKind::Onehot { axis }, vec![x], axes, dtype)
    }

    pub fn convolution(&mut self, params: ConvParams, input: OpId, filter: OpId) -> Result<OpId> {
        let axes = conv_output_axes(self.axes(input), self.axes(filter), &params)?;
        let dtype = self.default_dtype();
        Ok(self.add_node(OpKind::Convolution(params), vec![input, filter], axes, dtype))
    }

    pub(crate) fn bprop_conv(&mut self, params: ConvParams, delta: OpId, input: OpId, filter: OpId, fprop: OpId) -> OpId {
        let axes = self.axes(input).clone();
        let dtype = self.default_dtype();
        self.add_node(OpKind::BpropConv(params), vec![delta, filter, fprop], axes, dtype)
    }

    pub(crate) fn update_conv(&mut self, params: ConvParams, delta: OpId, input: OpId, filter: OpId, fprop: OpId) -> OpId {
        let axes = self.axes(filter).clone();
        let dtype = self.default_dtype();
        self.add_node(OpKind::UpdateConv(params), vec![delta, input, fprop], axes, dtype)
    }

    /// Pool `input`. Max pooling records the winning window offset in a
    /// scratch tensor that the adjoint reads back.
    pub fn pooling(&mut self, params: PoolParams, input: OpId) -> Result<OpId> {
        let axes = pool_output_axes(self.axes(input), &params)?;
        let argmax = self.temporary(axes.clone());
        self.set_dtype(argmax, DType::I64);
        let dtype = self.default_dtype();
        Ok(self.add_node(OpKind::Pooling(params), vec![input, argmax], axes, dtype))
    }

    pub(crate) fn bprop_pool(&mut self, params: PoolParams, delta: OpId, input: OpId, argmax: OpId, fprop: OpId) -> OpId {
        let axes = self.axes(input).clone();
        let dtype = self.default_dtype();
        self.add_node(OpKind::BpropPool(params), vec![delta, argmax, fprop], axes, dtype)
    }

    /// Sum of `x` across all ranks of the backend's communicator.
    pub fn all_reduce(&mut self, x: OpId) -> OpId {
        let axes = self.axes(x).clone();
        let dtype = self.node(x).dtype();
        self.add_node(OpKind::AllReduce, vec![x], axes, dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elementwise_axes_union() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 2);
        let b = Axis::named("B", 3);
        let x = g.placeholder([a.clone()]);
        let y = g.placeholder([b.clone(), a.clone()]);
        let s = g.add(x, y);
        assert_eq!(*g.axes(s), Axes::new([a.clone(), b.clone()]));
        let c = g.less(x, y);
        assert_eq!(g.node(c).dtype(), DType::Bool);
    }

    #[test]
    fn test_reduction_axes() {
        let mut g = GraphBuilder::new();
        let c = Axis::named("C", 4);
        let n = Axis::batch(8);
        let x = g.placeholder([c.clone(), n.clone()]);
        let s = g.sum(x, Reduction::Sample).unwrap();
        assert_eq!(*g.axes(s), Axes::new([n.clone()]));
        let all = g.sum(x, Reduction::All).unwrap();
        assert!(g.node(all).is_scalar());
        let am = g.argmax(x, Reduction::over([c])).unwrap();
        assert_eq!(g.node(am).dtype(), DType::I64);
        assert_eq!(*g.axes(am), Axes::new([n]));
    }

    #[test]
    fn test_reduction_axes_must_match_operand() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 2);
        let b = Axis::named("B", 3);
        let c = Axis::named("C", 4);
        let x = g.placeholder([a.clone(), b.clone()]);
        let before = g.len();

        let err = g.sum(x, Reduction::over([c.clone()])).unwrap_err();
        assert!(matches!(err, Error::AxisMismatch(_)), "{:?}", err);
        assert!(g.max(x, Reduction::to([a.clone(), c])).is_err());
        // B is neither reduced nor kept.
        let partial = Reduction::Explicit {
            reduction_axes: Axes::new([a.clone()]),
            out_axes: Axes::empty(),
        };
        assert!(g.sum(x, partial.clone()).is_err());
        assert!(g.argmin(x, partial).is_err());
        let overlap = Reduction::Explicit {
            reduction_axes: Axes::new([a.clone()]),
            out_axes: Axes::new([a.clone(), b.clone()]),
        };
        assert!(g.mean(x, overlap).is_err());
        assert_eq!(g.len(), before);

        let swapped = Reduction::Explicit {
            reduction_axes: Axes::new([a]),
            out_axes: Axes::new([b.clone()]),
        };
        let s = g.sum(x, swapped).unwrap();
        assert_eq!(*g.axes(s), Axes::new([b]));
    }

    #[test]
    fn test_dot_axes() {
        let mut g = GraphBuilder::new();
        let c = Axis::named("C", 3);
        let d = Axis::named("D", 2);
        let x = g.placeholder([c.clone(), d.clone()]);
        let y = g.placeholder([d.clone()]);
        let z = g.dot(x, y).unwrap();
        assert_eq!(*g.axes(z), Axes::new([c.clone()]));
        match g.kind(z) {
            OpKind::Dot(info) => {
                assert_eq!(info.reduction_ids.as_axes(), Axes::new([d.clone()]));
                assert!(info.dummy.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        // No shared axis: outer product through a dummy axis.
        let e = Axis::named("E", 5);
        let w = g.placeholder([e.clone()]);
        let outer = g.dot(y, w).unwrap();
        assert_eq!(*g.axes(outer), Axes::new([d, e]));
        assert!(matches!(g.kind(outer), OpKind::Dot(DotInfo { dummy: Some(_), .. })));
    }

    #[test]
    fn test_dot_rejects_unshared_reduction() {
        let mut g = GraphBuilder::new();
        let c = Axis::named("C", 3);
        let d = Axis::named("D", 2);
        let x = g.placeholder([c.clone()]);
        let y = g.placeholder([d]);
        let err = g.dot_with(x, y, DotAxes::reduce([c])).unwrap_err();
        assert!(matches!(err, Error::AxisMismatch(_)));
    }

    #[test]
    fn test_broadcast_rejects_dropping_axes() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 2);
        let b = Axis::named("B", 3);
        let x = g.placeholder([a.clone(), b.clone()]);
        assert!(g.broadcast(x, [a.clone()]).is_err());
        let y = g.placeholder([a.clone()]);
        let yb = g.broadcast(y, [b, a]).unwrap();
        assert!(matches!(g.kind(yb), OpKind::Broadcast));
    }

    #[test]
    fn test_slice_derives_axes() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 5);
        let b = Axis::named("B", 3);
        let x = g.placeholder([a.clone(), b.clone()]);
        let s = g
            .slice(x, &[AxisSlice::range(1, 4).into(), SliceItem::Index(0)], None)
            .unwrap();
        assert_eq!(g.axes(s).lengths(), vec![3]);
        assert!(g.slice(x, &[AxisSlice::new(None, None, 2).into()], None).is_err());
    }

    #[test]
    fn test_pad_axes() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 3);
        let x = g.placeholder([a.clone()]);
        let p = g.pad(x, &[(1, 2)], None).unwrap();
        assert_eq!(g.axes(p).lengths(), vec![6]);
    }

    #[test]
    fn test_numpy_tensor_shape_check() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 3);
        let bad = HostTensor::zeros(&[2]);
        assert!(matches!(
            g.numpy_tensor(bad, [a.clone()]),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(g.numpy_tensor(HostTensor::zeros(&[3]), [a]).is_ok());
    }

    #[test]
    fn test_softmax_schema_used_by_cross_entropy() {
        let mut g = GraphBuilder::new();
        let c = Axis::named("C", 4);
        let x = g.placeholder([c.clone()]);
        let t = g.placeholder([c]);
        let y = g.softmax(x).unwrap();
        assert!(g.find_softmax(y).is_some());
        let loss = g.cross_entropy_multi(y, t).unwrap();
        assert!(g.node(loss).is_scalar());
        assert!(matches!(
            g.node(loss).schemas()[0],
            Schema::CrossEntropyMultiInner { .. }
        ));
    }

    #[test]
    fn test_variable_init_collects_initializers() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 3);
        let w = g
            .variable_init([a], |g, w| {
                g.fill(w, 0.5);
                Ok(())
            })
            .unwrap();
        assert_eq!(g.node(w).initializers().len(), 1);
        assert!(g.node(w).is_trainable());
        assert_eq!(g.capture_depth(), 0);
    }
}
