// Kernel: the launches of one execution unit
//
// A GpuKernel collects the primitives of one ExecUnit and splits them into
// tasks when the program is compiled:
//
//   - runs of steps codegen understands become one fused kernel each;
//   - dot, convolution and pooling steps become native launches, with any
//     strided operand staged through dense scratch by copy_strided first
//     (and strided outputs copied back out afterwards);
//   - all_reduce becomes a host round trip.
//
// Launch arguments are resolved late. bind_buffers turns every view into a
// device address (buffer base plus the view's byte offset) once the
// transformer's buffers and the kernel's scratch exist; binding again is
// only needed if those move.

use strata::exec::engine::{ConvGeometry, PoolGeometry};
use strata::exec::{Operand, Primitive};
use strata_core::conv::PoolOp;
use strata_core::dtype::DType;
use strata_core::error::{Error, Result};

use crate::codegen::{self, KernelCache, Schedule, Slot, View};
use crate::kernels::{self, MATMUL_TILE, NATIVE_MODULE};

/// Upper bound on blocks per grid-stride launch.
const MAX_BLOCKS: usize = 4096;

/// One kernel argument, before binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    View(View),
    Scalar(f64),
    /// The launch's `meta` array.
    Meta,
}

/// One kernel argument, ready to pass to the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Ptr(u64),
    F64(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchShape {
    /// A grid-stride loop over `work` items; `staged` kernels run in a
    /// single block.
    Linear { work: usize, staged: bool },
    /// MATMUL_TILE square tiles covering a rows x cols output.
    Tiled { rows: usize, cols: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub module: String,
    pub function: String,
    pub args: Vec<Arg>,
    pub meta: Vec<i64>,
    pub shape: LaunchShape,
    pub shared_size: u32,
}

#[derive(Debug, Clone)]
pub enum Task {
    Launch(Launch),
    /// Sum `x` across ranks into `out` through the host.
    AllReduce { x: Operand, out: Operand },
}

/// Grid and block dimensions for `shape`.
pub fn launch_dims(shape: LaunchShape, block_size: u32) -> ((u32, u32, u32), (u32, u32, u32)) {
    let block_size = block_size.max(1);
    match shape {
        LaunchShape::Linear { staged: true, .. } => ((1, 1, 1), (block_size, 1, 1)),
        LaunchShape::Linear { work, staged: false } => {
            let blocks = work.div_ceil(block_size as usize).clamp(1, MAX_BLOCKS);
            ((blocks as u32, 1, 1), (block_size, 1, 1))
        }
        LaunchShape::Tiled { rows, cols } => {
            let tile = MATMUL_TILE as usize;
            let grid = (cols.div_ceil(tile).max(1) as u32, rows.div_ceil(tile).max(1) as u32, 1);
            (grid, (MATMUL_TILE, MATMUL_TILE, 1))
        }
    }
}

/// Everything one execution unit runs on the device.
#[derive(Debug, Clone)]
pub struct GpuKernel {
    name: String,
    steps: Vec<Primitive>,
    tasks: Vec<Task>,
    /// Bytes of each scratch slot.
    scratch: Vec<usize>,
    bound: Option<Vec<Vec<Bound>>>,
}

impl GpuKernel {
    pub fn new(name: impl Into<String>) -> Self {
        GpuKernel {
            name: name.into(),
            steps: Vec::new(),
            tasks: Vec::new(),
            scratch: Vec::new(),
            bound: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_op(&mut self, step: Primitive) {
        self.steps.push(step);
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn scratch(&self) -> &[usize] {
        &self.scratch
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// More than one task.
    pub fn is_compound(&self) -> bool {
        self.tasks.len() > 1
    }

    /// Launch arguments resolved by the last bind_buffers, one list per
    /// task (empty for host tasks).
    pub fn bound(&self) -> Option<&[Vec<Bound>]> {
        self.bound.as_deref()
    }

    /// Split the steps into tasks. Returns the names of fused kernels the
    /// cache had not seen, which the caller must compile.
    pub fn generate(&mut self, cache: &mut KernelCache) -> Result<Vec<String>> {
        self.tasks.clear();
        self.scratch.clear();
        self.bound = None;
        let steps = std::mem::take(&mut self.steps);
        let mut fresh = Vec::new();
        let mut run: Vec<&Primitive> = Vec::new();
        for step in &steps {
            if codegen::is_generated(step) {
                run.push(step);
                continue;
            }
            self.flush(&mut run, cache, &mut fresh)?;
            self.native(step)?;
        }
        self.flush(&mut run, cache, &mut fresh)?;
        self.steps = steps;
        log::debug!(
            "cuda: {} -> {} task(s), {} scratch slot(s)",
            self.name,
            self.tasks.len(),
            self.scratch.len()
        );
        Ok(fresh)
    }

    fn flush(&mut self, run: &mut Vec<&Primitive>, cache: &mut KernelCache, fresh: &mut Vec<String>) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        let generated = codegen::generate(run)?;
        run.clear();
        let (function, new) = cache.name(&generated);
        if new {
            fresh.push(function.clone());
        }
        self.tasks.push(Task::Launch(Launch {
            module: function.clone(),
            function,
            args: generated.params.iter().cloned().map(Arg::View).collect(),
            meta: Vec::new(),
            shape: LaunchShape::Linear {
                work: generated.work,
                staged: generated.schedule == Schedule::Staged,
            },
            shared_size: generated.shared_size,
        }));
        Ok(())
    }

    fn new_scratch(&mut self, dtype: DType, dims: Vec<usize>) -> View {
        let view = View::dense(Slot::Scratch(self.scratch.len()), dtype, dims);
        self.scratch.push(view.bytes().max(1));
        view
    }

    /// `op` as a dense view, staging it through scratch if needed.
    fn dense_input(&mut self, op: &Operand) -> Result<View> {
        let view = View::of(op);
        if view.is_dense() {
            return Ok(view);
        }
        let staged = self.new_scratch(view.dtype, view.dims.clone());
        self.tasks.push(Task::Launch(copy_launch(&view, &staged)?));
        Ok(staged)
    }

    /// A dense view to compute `op` into, plus the copy that moves it into
    /// place afterwards.
    fn dense_output(&mut self, op: &Operand) -> Result<(View, Option<Launch>)> {
        let view = View::of(op);
        if view.is_dense() {
            return Ok((view, None));
        }
        let staged = self.new_scratch(view.dtype, view.dims.clone());
        let back = copy_launch(&staged, &view)?;
        Ok((staged, Some(back)))
    }

    fn native(&mut self, step: &Primitive) -> Result<()> {
        let dtype = step.out().td.dtype();
        let suffixed = |base: &str| {
            kernels::native_name(base, dtype).ok_or_else(|| Error::unsupported(step.name(), "cuda"))
        };
        for input in step.inputs() {
            let expected = match step {
                Primitive::BpropPool { argmax, .. } if input == argmax => DType::I64,
                _ => dtype,
            };
            if input.td.dtype() != expected {
                return Err(Error::unsupported(step.name(), "cuda (mixed dtypes)"));
            }
        }

        let (function, inputs, outputs, meta, shape) = match step {
            Primitive::AllReduce { x, out } => {
                self.tasks.push(Task::AllReduce {
                    x: x.clone(),
                    out: out.clone(),
                });
                return Ok(());
            }
            Primitive::Dot { x, y, out } => {
                let (m, k) = matrix_dims(x, true);
                let (k2, n) = matrix_dims(y, false);
                if k != k2 {
                    return Err(Error::Internal(format!("dot contracts {} against {} elements", k, k2)));
                }
                (
                    suffixed("matmul")?,
                    vec![x, y],
                    vec![out],
                    vec![m as i64, k as i64, n as i64],
                    LaunchShape::Tiled { rows: m, cols: n },
                )
            }
            Primitive::Conv { input, filter, out, params } => {
                let g = ConvGeometry::new(&input.td.shape(), &filter.td.shape(), &out.td.shape(), *params)?;
                (
                    suffixed("conv_fprop")?,
                    vec![input, filter],
                    vec![out],
                    conv_meta(&g),
                    linear(out),
                )
            }
            Primitive::BpropConv { delta, filter, out, params } => {
                let g = ConvGeometry::new(&out.td.shape(), &filter.td.shape(), &delta.td.shape(), *params)?;
                (
                    suffixed("conv_bprop")?,
                    vec![delta, filter],
                    vec![out],
                    conv_meta(&g),
                    linear(out),
                )
            }
            Primitive::UpdateConv { delta, input, out, params } => {
                let g = ConvGeometry::new(&input.td.shape(), &out.td.shape(), &delta.td.shape(), *params)?;
                (
                    suffixed("conv_update")?,
                    vec![delta, input],
                    vec![out],
                    conv_meta(&g),
                    linear(out),
                )
            }
            Primitive::Pool { input, argmax, out, params } => {
                if argmax.td.dtype() != DType::I64 {
                    return Err(Error::unsupported(step.name(), "cuda (argmax must be i64)"));
                }
                let g = PoolGeometry::new(&input.td.shape(), &out.td.shape(), *params)?;
                (
                    suffixed("pool_fprop")?,
                    vec![input],
                    vec![out, argmax],
                    pool_meta(&g),
                    linear(out),
                )
            }
            Primitive::BpropPool { delta, argmax, out, params } => {
                let g = PoolGeometry::new(&out.td.shape(), &delta.td.shape(), *params)?;
                (
                    suffixed("pool_bprop")?,
                    vec![delta, argmax],
                    vec![out],
                    pool_meta(&g),
                    linear(out),
                )
            }
            other => {
                return Err(Error::Internal(format!("{} has no native kernel", other.name())));
            }
        };

        let mut args = Vec::with_capacity(inputs.len() + outputs.len() + 1);
        for input in inputs {
            args.push(Arg::View(self.dense_input(input)?));
        }
        let mut copies_back = Vec::new();
        for output in outputs {
            let (view, back) = self.dense_output(output)?;
            args.push(Arg::View(view));
            copies_back.extend(back);
        }
        args.push(Arg::Meta);
        self.tasks.push(Task::Launch(Launch {
            module: NATIVE_MODULE.to_string(),
            function,
            args,
            meta,
            shape,
            shared_size: 0,
        }));
        self.tasks.extend(copies_back.into_iter().map(Task::Launch));
        Ok(())
    }

    /// Resolve every launch argument. `buffers` and `scratch` hold the base
    /// address of each transformer buffer and scratch slot, `meta` the
    /// address of each task's meta array (ignored where it has none).
    pub fn bind_buffers(&mut self, buffers: &[u64], scratch: &[u64], meta: &[u64]) -> Result<()> {
        let mut bound = Vec::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            let Task::Launch(launch) = task else {
                bound.push(Vec::new());
                continue;
            };
            let mut args = Vec::with_capacity(launch.args.len());
            for arg in &launch.args {
                args.push(match arg {
                    Arg::Scalar(v) => Bound::F64(*v),
                    Arg::Meta => Bound::Ptr(*meta.get(i).ok_or_else(|| {
                        Error::Internal(format!("{}: no meta array for task {}", self.name, i))
                    })?),
                    Arg::View(view) => {
                        let base = match view.slot {
                            Slot::Buffer(b) => buffers.get(b),
                            Slot::Scratch(s) => scratch.get(s),
                        }
                        .ok_or_else(|| Error::Internal(format!("{}: {:?} is not allocated", self.name, view.slot)))?;
                        let addr = base.checked_add_signed(view.byte_offset() as i64).ok_or_else(|| {
                            Error::Internal(format!("{}: view offset {} underflows", self.name, view.offset))
                        })?;
                        Bound::Ptr(addr)
                    }
                });
            }
            bound.push(args);
        }
        self.bound = Some(bound);
        Ok(())
    }
}

fn linear(out: &Operand) -> LaunchShape {
    LaunchShape::Linear {
        work: out.td.size(),
        staged: false,
    }
}

/// (rows, k) of a left operand or (k, cols) of a right one.
fn matrix_dims(op: &Operand, left: bool) -> (usize, usize) {
    let shape = op.td.shape();
    match shape.as_slice() {
        [k] if left => (1, *k),
        [k] => (*k, 1),
        [a, b] => (*a, *b),
        _ => (shape.iter().product(), 1),
    }
}

fn conv_meta(g: &ConvGeometry) -> Vec<i64> {
    let mut meta: Vec<i64> = g.input.iter().map(|&d| d as i64).collect();
    meta.extend(g.filter[1..].iter().map(|&d| d as i64));
    meta.extend(g.output[1..4].iter().map(|&d| d as i64));
    meta.extend(g.params.pad.iter().map(|&p| p as i64));
    meta.extend(g.params.stride.iter().map(|&s| s as i64));
    meta
}

fn pool_meta(g: &PoolGeometry) -> Vec<i64> {
    let p = &g.params;
    let mut meta: Vec<i64> = g.input.iter().map(|&d| d as i64).collect();
    meta.extend(g.output[..4].iter().map(|&d| d as i64));
    meta.extend(p.window.iter().map(|&w| w as i64));
    meta.extend(p.pad.iter().map(|&w| w as i64));
    meta.extend(p.stride.iter().map(|&w| w as i64));
    meta.push(match p.op {
        PoolOp::Max => 0,
        PoolOp::Avg => 1,
    });
    meta
}

/// copy_strided from `x` to `out`, which must share dims.
fn copy_launch(x: &View, out: &View) -> Result<Launch> {
    if x.dims != out.dims || x.dtype != out.dtype {
        return Err(Error::Internal(format!("cannot copy {:?} into {:?}", x.dims, out.dims)));
    }
    let function =
        kernels::native_name("copy_strided", x.dtype).ok_or_else(|| Error::unsupported("copy", "cuda"))?;
    Ok(Launch {
        module: NATIVE_MODULE.to_string(),
        function,
        args: vec![Arg::View(x.clone()), Arg::View(out.clone()), Arg::Meta],
        meta: strided_meta(x, &[&x.strides, &out.strides]),
        shape: LaunchShape::Linear {
            work: x.elems(),
            staged: false,
        },
        shared_size: 0,
    })
}

/// fill_strided of `value` into `out`.
pub fn fill_launch(out: &View, value: f64) -> Result<Launch> {
    let function =
        kernels::native_name("fill_strided", out.dtype).ok_or_else(|| Error::unsupported("fill", "cuda"))?;
    Ok(Launch {
        module: NATIVE_MODULE.to_string(),
        function,
        args: vec![Arg::View(out.clone()), Arg::Scalar(value), Arg::Meta],
        meta: strided_meta(out, &[&out.strides]),
        shape: LaunchShape::Linear {
            work: out.elems(),
            staged: false,
        },
        shared_size: 0,
    })
}

/// ndim, n, dims, then each stride list.
fn strided_meta(view: &View, strides: &[&[isize]]) -> Vec<i64> {
    let mut meta = vec![view.dims.len() as i64, view.elems() as i64];
    meta.extend(view.dims.iter().map(|&d| d as i64));
    for s in strides {
        meta.extend(s.iter().map(|&s| s as i64));
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_dims() {
        let linear = LaunchShape::Linear {
            work: 1000,
            staged: false,
        };
        assert_eq!(launch_dims(linear, 256), ((4, 1, 1), (256, 1, 1)));
        let huge = LaunchShape::Linear {
            work: 1 << 30,
            staged: false,
        };
        assert_eq!(launch_dims(huge, 256).0, (MAX_BLOCKS as u32, 1, 1));
        let staged = LaunchShape::Linear { work: 1000, staged: true };
        assert_eq!(launch_dims(staged, 128), ((1, 1, 1), (128, 1, 1)));
        let empty = LaunchShape::Linear { work: 0, staged: false };
        assert_eq!(launch_dims(empty, 256).0, (1, 1, 1));
        let tiled = LaunchShape::Tiled { rows: 33, cols: 16 };
        assert_eq!(launch_dims(tiled, 256), ((1, 3, 1), (16, 16, 1)));
    }

    #[test]
    fn test_strided_meta_layout() {
        let v = View {
            slot: Slot::Buffer(0),
            dtype: DType::F32,
            offset: 0,
            dims: vec![2, 3],
            strides: vec![1, 2],
        };
        let launch = fill_launch(&v, 2.5).unwrap();
        assert_eq!(launch.meta, vec![2, 6, 2, 3, 1, 2]);
        assert_eq!(launch.function, "fill_strided_f32");
        assert!(fill_launch(&View { dtype: DType::F16, ..v }, 0.0).is_err());
    }
}
