// HostBackend: a direct interpreter over lowered primitives
//
// Every buffer is a Vec<f64>; the dtype of a description only decides how
// values are rounded when they are stored (DType::quantize), so an F32
// tensor reads back exactly as an f32 array would.
//
// A step gathers each input view into a dense row-major array, computes, and
// scatters the result into its output view. Gathering copies, so an output
// may share a buffer with one of its inputs.
//
// Compilation only resolves what does not change between calls: the
// geometry of each convolution and pooling step.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use strata_core::description::TensorDescription;
use strata_core::error::{Error, Result};
use strata_core::tensor::HostTensor;

use super::backend::{Backend, Communicator, LocalCommunicator};
use super::engine::{self, ConvGeometry, PoolGeometry};
use super::lower::{ExecUnit, Operand, Primitive};
use super::plan::Buffer;
use super::transformer::TransformerConfig;

/// Rows of a dot handed to one rayon task.
const DOT_ROWS_PER_TASK: usize = 16;

/// Index tables built once per conv or pool step at compile time.
#[derive(Debug, Clone)]
enum Geometry {
    Conv(ConvGeometry),
    Pool(PoolGeometry),
}

/// One primitive plus whatever compilation resolved for it.
#[derive(Debug, Clone)]
struct HostStep {
    primitive: Primitive,
    geometry: Option<Geometry>,
}

/// A computation compiled for the host.
#[derive(Debug, Clone)]
pub struct HostProgram {
    name: String,
    steps: Vec<HostStep>,
}

impl HostProgram {
    /// The computation's name, as given to `Backend::compile`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of primitives executed per run.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for HostProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {} ({} steps)", self.name, self.steps.len())?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  [{:>3}] {}", i, step.primitive)?;
        }
        Ok(())
    }
}

/// Interpreter backend running on the calling thread (plus rayon).
pub struct HostBackend {
    parallel: bool,
    communicator: Arc<dyn Communicator>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// A single-process backend: `all_reduce` returns its input unchanged.
    pub fn new() -> Self {
        HostBackend {
            parallel: true,
            communicator: Arc::new(LocalCommunicator),
        }
    }

    /// A backend whose `all_reduce` ops sum across `communicator`'s group.
    pub fn with_communicator(communicator: Arc<dyn Communicator>) -> Self {
        HostBackend {
            parallel: true,
            communicator,
        }
    }

    /// Run one step against the transformer's buffers.
    ///
    /// Inputs are gathered into dense row-major arrays, so every arm works on
    /// plain slices regardless of the views' strides.
    fn execute(&mut self, step: &HostStep, buffers: &mut [Vec<f64>]) -> Result<()> {
        match (&step.primitive, &step.geometry) {
            // out[i] = op(x[i])
            (Primitive::Unary { op, x, out }, _) => {
                let xs = gather(buffers, x)?;
                let vals: Vec<f64> = xs.iter().map(|&v| op.apply(v)).collect();
                scatter(buffers, out, &vals)
            }
            // out[i] = op(x[i], y[i]); broadcasting is already in the views.
            (Primitive::Binary { op, x, y, out }, _) => {
                let xs = gather(buffers, x)?;
                let ys = gather(buffers, y)?;
                let vals: Vec<f64> = xs.iter().zip(&ys).map(|(&a, &b)| op.apply(a, b)).collect();
                scatter(buffers, out, &vals)
            }
            // 1.0 where the comparison holds, 0.0 elsewhere.
            (Primitive::Compare { op, x, y, out }, _) => {
                let xs = gather(buffers, x)?;
                let ys = gather(buffers, y)?;
                let vals: Vec<f64> = xs
                    .iter()
                    .zip(&ys)
                    .map(|(&a, &b)| if op.apply(a, b) { 1.0 } else { 0.0 })
                    .collect();
                scatter(buffers, out, &vals)
            }
            // x is viewed as (reduced, kept): fold each row into the output.
            (Primitive::Reduce { op, x, out }, _) => {
                let xs = gather(buffers, x)?;
                let n = out.td.size();
                let mut acc = vec![op.identity(); n];
                for row in xs.chunks(n.max(1)) {
                    for (a, &v) in acc.iter_mut().zip(row) {
                        *a = op.combine(*a, v);
                    }
                }
                scatter(buffers, out, &acc)
            }
            // Same layout as Reduce; the first extreme wins on ties.
            (Primitive::ArgReduce { max, x, out }, _) => {
                let xs = gather(buffers, x)?;
                let n = out.td.size();
                let mut best = vec![0usize; n];
                for (r, row) in xs.chunks(n.max(1)).enumerate().skip(1) {
                    for (j, &v) in row.iter().enumerate() {
                        let cur = xs[best[j] * n + j];
                        if (*max && v > cur) || (!*max && v < cur) {
                            best[j] = r;
                        }
                    }
                }
                let vals: Vec<f64> = best.iter().map(|&b| b as f64).collect();
                scatter(buffers, out, &vals)
            }
            (Primitive::Copy { x, out }, _) => {
                let xs = gather(buffers, x)?;
                scatter(buffers, out, &xs)
            }
            (Primitive::Fill { out, value }, _) => fill_view(buffers, out, *value),
            // (m, k) x (k, n) after the lowering's dot reshapes.
            (Primitive::Dot { x, y, out }, _) => {
                let (m, k) = matrix_dims(&x.td, true);
                let (k2, n) = matrix_dims(&y.td, false);
                if k != k2 {
                    return Err(Error::Internal(format!(
                        "dot contracts {} against {} elements",
                        k, k2
                    )));
                }
                let xs = gather(buffers, x)?;
                let ys = gather(buffers, y)?;
                let vals = matmul(&xs, &ys, m, k, n, self.parallel);
                scatter(buffers, out, &vals)
            }
            // Values outside [0, depth) leave their column all zero.
            (Primitive::Onehot { x, out }, _) => {
                let xs = gather(buffers, x)?;
                let n = xs.len();
                let depth = out.td.size() / n.max(1);
                let mut vals = vec![0.0; depth * n];
                for (j, &v) in xs.iter().enumerate() {
                    if v >= 0.0 && (v as usize) < depth {
                        vals[v as usize * n + j] = 1.0;
                    }
                }
                scatter(buffers, out, &vals)
            }
            (Primitive::Conv { input, filter, out, .. }, Some(Geometry::Conv(g))) => {
                let xs = gather(buffers, input)?;
                let fs = gather(buffers, filter)?;
                let vals = engine::conv_fprop(g, &xs, &fs, self.parallel);
                scatter(buffers, out, &vals)
            }
            (Primitive::BpropConv { delta, filter, out, .. }, Some(Geometry::Conv(g))) => {
                let ds = gather(buffers, delta)?;
                let fs = gather(buffers, filter)?;
                let vals = engine::conv_bprop(g, &ds, &fs, self.parallel);
                scatter(buffers, out, &vals)
            }
            (Primitive::UpdateConv { delta, input, out, .. }, Some(Geometry::Conv(g))) => {
                let ds = gather(buffers, delta)?;
                let xs = gather(buffers, input)?;
                let vals = engine::conv_update(g, &ds, &xs, self.parallel);
                scatter(buffers, out, &vals)
            }
            // Writes the selected cell of each window alongside the result
            // so BpropPool can route the gradient back.
            (Primitive::Pool { input, argmax, out, .. }, Some(Geometry::Pool(g))) => {
                let xs = gather(buffers, input)?;
                let (vals, arg) = engine::pool_fprop(g, &xs);
                scatter(buffers, argmax, &arg)?;
                scatter(buffers, out, &vals)
            }
            (Primitive::BpropPool { delta, argmax, out, .. }, Some(Geometry::Pool(g))) => {
                let ds = gather(buffers, delta)?;
                let arg = gather(buffers, argmax)?;
                let vals = engine::pool_bprop(g, &ds, &arg);
                scatter(buffers, out, &vals)
            }
            // Blocks until every rank of the communicator has contributed.
            (Primitive::AllReduce { x, out }, _) => {
                let mut xs = gather(buffers, x)?;
                self.allreduce(&mut xs)?;
                scatter(buffers, out, &xs)
            }
            (p, _) => Err(Error::Internal(format!(
                "{} step compiled without its geometry",
                p.name()
            ))),
        }
    }
}

fn buffer<'a>(buffers: &'a [Vec<f64>], op: &Operand) -> Result<&'a [f64]> {
    buffers
        .get(op.buffer)
        .map(|b| b.as_slice())
        .ok_or_else(|| Error::Internal(format!("buffer {} does not exist", op.buffer)))
}

/// Dense row-major copy of a view.
fn gather(buffers: &[Vec<f64>], op: &Operand) -> Result<Vec<f64>> {
    read_view(buffer(buffers, op)?, &op.td)
}

/// Values of `td` in row-major order. Offsets outside `buf` are a planner
/// bug and reported as `Error::Internal`.
fn read_view(buf: &[f64], td: &TensorDescription) -> Result<Vec<f64>> {
    td.offsets()
        .map(|off| {
            usize::try_from(off)
                .ok()
                .and_then(|i| buf.get(i).copied())
                .ok_or_else(|| out_of_bounds(off, buf.len(), td))
        })
        .collect()
}

/// Store `vals` through `td`, rounding each value to the view's dtype.
fn write_view(buf: &mut [f64], td: &TensorDescription, vals: &[f64]) -> Result<()> {
    if vals.len() != td.size() {
        return Err(Error::ShapeMismatch {
            expected: td.shape(),
            got: vec![vals.len()],
        });
    }
    let dtype = td.dtype();
    let len = buf.len();
    for (off, &v) in td.offsets().zip(vals) {
        let slot = usize::try_from(off)
            .ok()
            .and_then(|i| buf.get_mut(i))
            .ok_or_else(|| out_of_bounds(off, len, td))?;
        *slot = dtype.quantize(v);
    }
    Ok(())
}

fn scatter(buffers: &mut [Vec<f64>], op: &Operand, vals: &[f64]) -> Result<()> {
    let buf = buffers
        .get_mut(op.buffer)
        .ok_or_else(|| Error::Internal(format!("buffer {} does not exist", op.buffer)))?;
    write_view(buf, &op.td, vals)
}

fn fill_view(buffers: &mut [Vec<f64>], op: &Operand, value: f64) -> Result<()> {
    let vals = vec![value; op.td.size()];
    scatter(buffers, op, &vals)
}

fn out_of_bounds(off: isize, len: usize, td: &TensorDescription) -> Error {
    Error::Internal(format!(
        "offset {} outside buffer of {} elements for {:?}",
        off, len, td
    ))
}

/// (rows, cols) of a dot operand; vectors are a single row on the left and
/// a single column on the right.
fn matrix_dims(td: &TensorDescription, left: bool) -> (usize, usize) {
    let shape = td.shape();
    match (shape.as_slice(), left) {
        ([r, c], _) => (*r, *c),
        ([k], true) => (1, *k),
        ([k], false) => (*k, 1),
        _ => (1, td.size()),
    }
}

/// Row-major `(m, k) x (k, n)`. With `parallel`, blocks of
/// `DOT_ROWS_PER_TASK` output rows run as separate rayon tasks; each output
/// row is written by exactly one task.
fn matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize, parallel: bool) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    if n == 0 {
        return out;
    }
    let rows = |(ci, chunk): (usize, &mut [f64])| {
        for (ri, row) in chunk.chunks_mut(n).enumerate() {
            let i = ci * DOT_ROWS_PER_TASK + ri;
            for p in 0..k {
                let av = a[i * k + p];
                if av == 0.0 {
                    continue;
                }
                for (o, &bv) in row.iter_mut().zip(&b[p * n..(p + 1) * n]) {
                    *o += av * bv;
                }
            }
        }
    };
    let chunk = DOT_ROWS_PER_TASK * n;
    if parallel && m > DOT_ROWS_PER_TASK {
        out.par_chunks_mut(chunk).enumerate().for_each(rows);
    } else {
        out.chunks_mut(chunk).enumerate().for_each(rows);
    }
    out
}

impl Backend for HostBackend {
    type Storage = Vec<f64>;
    type Program = HostProgram;

    fn name(&self) -> &'static str {
        "host"
    }

    fn configure(&mut self, config: &TransformerConfig) {
        self.parallel = config.parallel;
    }

    fn empty(&mut self, buffer: &Buffer) -> Result<Vec<f64>> {
        Ok(vec![0.0; buffer.elems])
    }

    fn nparray(&mut self, storage: &mut Vec<f64>, td: &TensorDescription, data: &HostTensor) -> Result<()> {
        if data.elem_count() != td.size() {
            return Err(Error::ShapeMismatch {
                expected: td.shape(),
                got: data.shape().to_vec(),
            });
        }
        write_view(storage, td, data.data())
    }

    fn fill(&mut self, storage: &mut Vec<f64>, td: &TensorDescription, value: f64) -> Result<()> {
        let vals = vec![value; td.size()];
        write_view(storage, td, &vals)
    }

    fn read(&self, storage: &Vec<f64>, td: &TensorDescription) -> Result<HostTensor> {
        let data = read_view(storage, td)?;
        Ok(HostTensor::new(td.shape(), data)?.with_dtype(td.dtype()))
    }

    /// Flattens the units into one step list and resolves the geometry of
    /// every conv and pool step.
    fn compile(&mut self, name: &str, units: Vec<ExecUnit>) -> Result<HostProgram> {
        let mut steps = Vec::new();
        for unit in units {
            for primitive in unit.steps {
                let geometry = match &primitive {
                    Primitive::Conv { input, filter, out, params } => Some(Geometry::Conv(
                        ConvGeometry::new(&input.td.shape(), &filter.td.shape(), &out.td.shape(), *params)?,
                    )),
                    Primitive::UpdateConv { delta, input, out, params } => Some(Geometry::Conv(
                        ConvGeometry::new(&input.td.shape(), &out.td.shape(), &delta.td.shape(), *params)?,
                    )),
                    Primitive::BpropConv { delta, filter, out, params } => Some(Geometry::Conv(
                        ConvGeometry::new(&out.td.shape(), &filter.td.shape(), &delta.td.shape(), *params)?,
                    )),
                    Primitive::Pool { input, out, params, .. } => Some(Geometry::Pool(PoolGeometry::new(
                        &input.td.shape(),
                        &out.td.shape(),
                        *params,
                    )?)),
                    Primitive::BpropPool { delta, out, params, .. } => Some(Geometry::Pool(PoolGeometry::new(
                        &out.td.shape(),
                        &delta.td.shape(),
                        *params,
                    )?)),
                    _ => None,
                };
                steps.push(HostStep { primitive, geometry });
            }
        }
        let program = HostProgram {
            name: name.to_string(),
            steps,
        };
        log::debug!("host: compiled {} into {} steps", program.name, program.len());
        Ok(program)
    }

    fn run(&mut self, program: &mut HostProgram, buffers: &mut [Vec<f64>]) -> Result<()> {
        let timing = log::log_enabled!(log::Level::Trace);
        for step in &program.steps {
            let start = timing.then(Instant::now);
            self.execute(step, buffers)?;
            if let Some(start) = start {
                log::trace!(
                    "host: {} {} in {:?}",
                    program.name,
                    step.primitive,
                    start.elapsed()
                );
            }
        }
        Ok(())
    }

    fn allreduce(&mut self, values: &mut [f64]) -> Result<()> {
        self.communicator.allreduce_sum(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::axes::{Axes, Axis};
    use strata_core::description::StorageId;
    use strata_core::dtype::DType;
    use strata_core::op::{BinaryOp, ReduceOp};

    fn operand(buffer: usize, axes: &[Axis], storage: u32) -> Operand {
        Operand {
            buffer,
            td: TensorDescription::new(Axes::new(axes.to_vec()), DType::F64, StorageId(storage)),
        }
    }

    fn program(backend: &mut HostBackend, steps: Vec<Primitive>) -> HostProgram {
        let unit = ExecUnit {
            ops: vec![],
            steps,
            fused: false,
        };
        backend.compile("test", vec![unit]).unwrap()
    }

    #[test]
    fn test_binary_with_broadcast_operand() {
        let a = Axis::named("A", 2);
        let b = Axis::named("B", 3);
        let x = operand(0, &[a.clone(), b.clone()], 0);
        let y_base = operand(1, &[b.clone()], 1);
        let y = Operand {
            buffer: 1,
            td: y_base.td.reaxe(&Axes::new([a.clone(), b.clone()]), true).unwrap(),
        };
        let out = operand(2, &[a, b], 2);
        let mut backend = HostBackend::new();
        let mut prog = program(
            &mut backend,
            vec![Primitive::Binary {
                op: BinaryOp::Add,
                x,
                y,
                out: out.clone(),
            }],
        );
        let mut buffers = vec![
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            vec![10.0, 20.0, 30.0],
            vec![0.0; 6],
        ];
        backend.run(&mut prog, &mut buffers).unwrap();
        assert_eq!(buffers[2], vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_reduce_first_axis() {
        let r = Axis::named("R", 2);
        let c = Axis::named("C", 3);
        let x = operand(0, &[r, c.clone()], 0);
        let out = operand(1, &[c], 1);
        let mut backend = HostBackend::new();
        let mut prog = program(
            &mut backend,
            vec![Primitive::Reduce {
                op: ReduceOp::Max,
                x,
                out,
            }],
        );
        let mut buffers = vec![vec![1.0, 9.0, 3.0, 4.0, 5.0, 6.0], vec![0.0; 3]];
        backend.run(&mut prog, &mut buffers).unwrap();
        assert_eq!(buffers[1], vec![4.0, 9.0, 6.0]);
    }

    #[test]
    fn test_argmax_first_axis() {
        let r = Axis::named("R", 3);
        let c = Axis::named("C", 2);
        let x = operand(0, &[r, c.clone()], 0);
        let mut out = operand(1, &[c], 1);
        out.td = TensorDescription::new(out.td.axes().clone(), DType::I64, StorageId(1));
        let mut backend = HostBackend::new();
        let mut prog = program(&mut backend, vec![Primitive::ArgReduce { max: true, x, out }]);
        let mut buffers = vec![vec![1.0, 5.0, 7.0, 2.0, 3.0, 9.0], vec![0.0; 2]];
        backend.run(&mut prog, &mut buffers).unwrap();
        assert_eq!(buffers[1], vec![1.0, 2.0]);
    }

    #[test]
    fn test_matmul_serial_and_parallel_agree() {
        let (m, k, n) = (40, 7, 5);
        let a: Vec<f64> = (0..m * k).map(|i| (i % 11) as f64 - 5.0).collect();
        let b: Vec<f64> = (0..k * n).map(|i| (i % 7) as f64 * 0.5).collect();
        let serial = matmul(&a, &b, m, k, n, false);
        let parallel = matmul(&a, &b, m, k, n, true);
        assert_eq!(serial, parallel);
        let expect: f64 = (0..k).map(|p| a[3 * k + p] * b[p * n + 2]).sum();
        assert_eq!(serial[3 * n + 2], expect);
    }

    #[test]
    fn test_store_rounds_to_dtype() {
        let a = Axis::named("A", 1);
        let td = TensorDescription::new(Axes::new([a]), DType::F32, StorageId(0));
        let mut backend = HostBackend::new();
        let buffer = Buffer {
            color: 0,
            size: 4,
            elems: 1,
            views: vec![StorageId(0)],
            dedicated: false,
        };
        let mut buf = backend.empty(&buffer).unwrap();
        backend.fill(&mut buf, &td, 0.1).unwrap();
        assert_eq!(buf[0], 0.1f32 as f64);
    }

    #[test]
    fn test_local_allreduce_passes_through() {
        let mut backend = HostBackend::new();
        let mut v = vec![2.0];
        backend.allreduce(&mut v).unwrap();
        assert_eq!(v, vec![2.0]);
    }
}
