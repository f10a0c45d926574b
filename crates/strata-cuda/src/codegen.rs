// Codegen: CUDA C source for fused kernels
//
// A fused kernel runs every step of one execution unit in a single launch.
// Each distinct view (buffer, dtype, layout) the steps touch becomes one
// `unsigned char*` parameter; the view's offset is folded into the address
// at bind time, so the body only bakes in dims and strides. Bodies that
// only differ in which buffers they touch are therefore identical, and the
// KernelCache hands them the same name.
//
// Values are loaded into doubles and rounded on store, the same way the
// host backend computes in f64 and quantizes per dtype.
//
// Schedule:
//   Parallel  every step walks the same index space and every buffer the
//             kernel writes is accessed through one layout, so element i
//             is produced and consumed by the same thread; one grid-stride
//             loop holds all steps.
//   Staged    anything else (reductions, transposed reads of a value just
//             written, ...): one block, one loop per step, __syncthreads()
//             between steps.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use strata::exec::{Operand, Primitive};
use strata_core::dtype::DType;
use strata_core::error::{Error, Result};
use strata_core::op::{BinaryOp, CmpOp, ReduceOp, UnaryOp, SAFELOG_MIN};

/// Where a view's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    /// A planned buffer of the transformer.
    Buffer(usize),
    /// Dense scratch owned by one kernel.
    Scratch(usize),
}

/// A strided window of a slot, with flattened axes expanded to leaf dims.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    pub slot: Slot,
    pub dtype: DType,
    /// In elements.
    pub offset: isize,
    pub dims: Vec<usize>,
    /// In elements.
    pub strides: Vec<isize>,
}

impl View {
    pub fn of(op: &Operand) -> View {
        let (dims, strides) = op.td.leaf_layout(0..op.td.ndim());
        View {
            slot: Slot::Buffer(op.buffer),
            dtype: op.td.dtype(),
            offset: op.td.offset(),
            dims,
            strides,
        }
    }

    /// Row-major contiguous storage at the start of `slot`.
    pub fn dense(slot: Slot, dtype: DType, dims: Vec<usize>) -> View {
        let strides = row_major(&dims);
        View {
            slot,
            dtype,
            offset: 0,
            dims,
            strides,
        }
    }

    pub fn elems(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn bytes(&self) -> usize {
        self.elems() * self.dtype.size_in_bytes()
    }

    /// Offset in bytes from the start of the slot.
    pub fn byte_offset(&self) -> isize {
        self.offset * self.dtype.size_in_bytes() as isize
    }

    /// Whether the elements sit contiguously in row-major order.
    pub fn is_dense(&self) -> bool {
        let expect = row_major(&self.dims);
        self.dims
            .iter()
            .zip(self.strides.iter().zip(&expect))
            .all(|(&d, (&s, &e))| d <= 1 || s == e)
    }

    /// The same layout without its placement, which is all a kernel body
    /// depends on.
    fn layout_key(&self) -> (DType, &[usize], &[isize]) {
        (self.dtype, &self.dims, &self.strides)
    }
}

pub fn row_major(dims: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; dims.len()];
    let mut stride = 1isize;
    for (s, &d) in strides.iter_mut().zip(dims).rev() {
        *s = stride;
        stride *= d as isize;
    }
    strides
}

/// C expression for the buffer index of logical element `var` of a
/// row-major walk over `dims`.
fn index_expr(dims: &[usize], strides: &[isize], var: &str) -> String {
    let mut terms = Vec::new();
    let mut inner = 1usize;
    for k in (0..dims.len()).rev() {
        let (d, s) = (dims[k], strides[k]);
        if d > 1 && s != 0 {
            let mut t = var.to_string();
            if inner > 1 {
                t = format!("({} / {})", t, inner);
            }
            if k > 0 {
                t = format!("({} % {})", t, d);
            }
            if s != 1 {
                t = format!("{} * {}", t, s);
            }
            terms.push(t);
        }
        inner *= d;
    }
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.reverse();
        terms.join(" + ")
    }
}

/// `v` as a C double literal.
pub fn c_literal(v: f64) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "INFINITY" } else { "(-INFINITY)" }.to_string()
    } else {
        let s = format!("{:?}", v);
        if s.contains('.') || s.contains('e') {
            s
        } else {
            format!("{}.0", s)
        }
    }
}

fn suffix(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "f16",
        DType::F32 => "f32",
        DType::F64 => "f64",
        DType::I64 => "i64",
        DType::Bool => "bool",
    }
}

fn unary_expr(op: UnaryOp, a: &str) -> String {
    match op {
        UnaryOp::Absolute => format!("fabs({})", a),
        UnaryOp::Negative => format!("(-{})", a),
        UnaryOp::Exp => format!("exp({})", a),
        UnaryOp::Log => format!("log({})", a),
        UnaryOp::SafeLog => format!("log(fmax({}, {}))", a, c_literal(SAFELOG_MIN)),
        UnaryOp::Sqrt => format!("sqrt({})", a),
        UnaryOp::Square => format!("({0} * {0})", a),
        UnaryOp::Reciprocal => format!("(1.0 / {})", a),
        UnaryOp::Sign => format!("(double)(({0} > 0.0) - ({0} < 0.0))", a),
        UnaryOp::Sin => format!("sin({})", a),
        UnaryOp::Cos => format!("cos({})", a),
        UnaryOp::Tanh => format!("tanh({})", a),
    }
}

fn binary_expr(op: BinaryOp, a: &str, b: &str) -> String {
    match op {
        BinaryOp::Add => format!("({} + {})", a, b),
        BinaryOp::Subtract => format!("({} - {})", a, b),
        BinaryOp::Multiply => format!("({} * {})", a, b),
        BinaryOp::Divide => format!("({} / {})", a, b),
        BinaryOp::Maximum => format!("fmax({}, {})", a, b),
        BinaryOp::Minimum => format!("fmin({}, {})", a, b),
        BinaryOp::Power => format!("pow({}, {})", a, b),
    }
}

fn compare_expr(op: CmpOp, a: &str, b: &str) -> String {
    let sym = match op {
        CmpOp::Equal => "==",
        CmpOp::NotEqual => "!=",
        CmpOp::Greater => ">",
        CmpOp::Less => "<",
        CmpOp::GreaterEqual => ">=",
        CmpOp::LessEqual => "<=",
    };
    format!("(({} {} {}) ? 1.0 : 0.0)", a, sym, b)
}

fn reduce_init(op: ReduceOp) -> String {
    c_literal(op.identity())
}

fn reduce_combine(op: ReduceOp, acc: &str, v: &str) -> String {
    match op {
        ReduceOp::Sum => format!("{} + {}", acc, v),
        ReduceOp::Max => format!("fmax({}, {})", acc, v),
        ReduceOp::Min => format!("fmin({}, {})", acc, v),
    }
}

/// Whether `generate` can turn this step into kernel code.
pub fn is_generated(step: &Primitive) -> bool {
    matches!(
        step,
        Primitive::Unary { .. }
            | Primitive::Binary { .. }
            | Primitive::Compare { .. }
            | Primitive::Reduce { .. }
            | Primitive::ArgReduce { .. }
            | Primitive::Copy { .. }
            | Primitive::Fill { .. }
            | Primitive::Onehot { .. }
    )
}

/// Steps whose loop runs once per output element, reading each input at
/// the same logical index.
fn is_pointwise(step: &Primitive) -> bool {
    matches!(
        step,
        Primitive::Unary { .. }
            | Primitive::Binary { .. }
            | Primitive::Compare { .. }
            | Primitive::Copy { .. }
            | Primitive::Fill { .. }
    )
}

/// How a generated kernel is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Parallel,
    Staged,
}

/// A generated kernel body, before it is named.
#[derive(Debug, Clone)]
pub struct Generated {
    /// Kernel parameters, one per distinct view, in order of first use.
    pub params: Vec<View>,
    pub schedule: Schedule,
    /// Work items of the largest step.
    pub work: usize,
    pub shared_size: u32,
    /// The body with `{name}` standing in for the kernel name.
    template: String,
    ops: Vec<&'static str>,
}

impl Generated {
    pub fn ops(&self) -> &[&'static str] {
        &self.ops
    }
}

struct Emitter {
    params: Vec<View>,
    lookup: HashMap<View, usize>,
}

impl Emitter {
    fn param(&mut self, view: View) -> usize {
        if let Some(&i) = self.lookup.get(&view) {
            return i;
        }
        let i = self.params.len();
        self.lookup.insert(view.clone(), i);
        self.params.push(view);
        i
    }

    fn load(&mut self, op: &Operand, var: &str) -> String {
        let view = View::of(op);
        let idx = index_expr(&view.dims, &view.strides, var);
        let dtype = view.dtype;
        let p = self.param(view);
        format!("ld_{}(p{}, {})", suffix(dtype), p, idx)
    }

    fn store(&mut self, op: &Operand, var: &str, value: &str) -> String {
        let view = View::of(op);
        let idx = index_expr(&view.dims, &view.strides, var);
        let dtype = view.dtype;
        let p = self.param(view);
        format!("st_{}(p{}, {}, {});", suffix(dtype), p, idx, value)
    }

    /// Parameter and index expressions for the leaf dims of axes
    /// `range` of `op`.
    fn part(&mut self, op: &Operand, range: std::ops::Range<usize>, var: &str) -> (usize, String) {
        let (dims, strides) = op.td.leaf_layout(range);
        let p = self.param(View::of(op));
        (p, index_expr(&dims, &strides, var))
    }
}

/// Statements computing element `i` of a pointwise step.
fn pointwise_body(e: &mut Emitter, step: &Primitive) -> Result<String> {
    Ok(match step {
        Primitive::Unary { op, x, out } => {
            let a = e.load(x, "i");
            e.store(out, "i", &unary_expr(*op, &a))
        }
        Primitive::Binary { op, x, y, out } => {
            let a = e.load(x, "i");
            let b = e.load(y, "i");
            e.store(out, "i", &binary_expr(*op, &a, &b))
        }
        Primitive::Compare { op, x, y, out } => {
            let a = e.load(x, "i");
            let b = e.load(y, "i");
            e.store(out, "i", &compare_expr(*op, &a, &b))
        }
        Primitive::Copy { x, out } => {
            let a = e.load(x, "i");
            e.store(out, "i", &a)
        }
        Primitive::Fill { out, value } => e.store(out, "i", &c_literal(*value)),
        other => {
            return Err(Error::Internal(format!("{} is not a pointwise step", other.name())));
        }
    })
}

/// A loop over `n` items, strided by the launch's thread count.
fn grid_loop(n: usize, body: &str) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "    for (long long i = tid; i < {}LL; i += nthreads) {{", n);
    for line in body.lines() {
        let _ = writeln!(s, "        {}", line);
    }
    s.push_str("    }\n");
    s
}

fn step_loop(e: &mut Emitter, step: &Primitive) -> Result<String> {
    match step {
        Primitive::Reduce { op, x, out } => {
            let n = out.td.size();
            let r = x.td.axes().get(0).map_or(1, |a| a.length());
            let (px, red) = e.part(x, 0..1, "r");
            let (_, rest) = e.part(x, 1..x.td.ndim(), "i");
            let dtype = suffix(x.td.dtype());
            let mut body = String::new();
            let _ = writeln!(body, "double acc = {};", reduce_init(*op));
            let _ = writeln!(body, "for (long long r = 0; r < {}LL; ++r) {{", r);
            let _ = writeln!(body, "    double v = ld_{}(p{}, {} + {});", dtype, px, red, rest);
            let _ = writeln!(body, "    acc = {};", reduce_combine(*op, "acc", "v"));
            body.push_str("}\n");
            body.push_str(&e.store(out, "i", "acc"));
            Ok(grid_loop(n, &body))
        }
        Primitive::ArgReduce { max, x, out } => {
            let n = out.td.size();
            let r = x.td.axes().get(0).map_or(1, |a| a.length());
            let (px, red) = e.part(x, 0..1, "r");
            let (_, rest) = e.part(x, 1..x.td.ndim(), "i");
            let (_, first) = e.part(x, 0..1, "0");
            let dtype = suffix(x.td.dtype());
            let cmp = if *max { ">" } else { "<" };
            let mut body = String::new();
            let _ = writeln!(body, "long long best = 0;");
            let _ = writeln!(body, "double bv = ld_{}(p{}, {} + {});", dtype, px, first, rest);
            let _ = writeln!(body, "for (long long r = 1; r < {}LL; ++r) {{", r);
            let _ = writeln!(body, "    double v = ld_{}(p{}, {} + {});", dtype, px, red, rest);
            let _ = writeln!(body, "    if (v {} bv) {{ bv = v; best = r; }}", cmp);
            body.push_str("}\n");
            body.push_str(&e.store(out, "i", "(double)best"));
            Ok(grid_loop(n, &body))
        }
        Primitive::Onehot { x, out } => {
            let n = x.td.size();
            let depth = out.td.axes().get(0).map_or(1, |a| a.length());
            let v = e.load(x, "i");
            let (po, hot) = e.part(out, 0..1, "d");
            let (_, rest) = e.part(out, 1..out.td.ndim(), "i");
            let dtype = suffix(out.td.dtype());
            let mut body = String::new();
            let _ = writeln!(body, "double v = {};", v);
            let _ = writeln!(body, "for (long long d = 0; d < {}LL; ++d) {{", depth);
            let _ = writeln!(
                body,
                "    st_{}(p{}, {} + {}, (v >= 0.0 && (long long)v == d) ? 1.0 : 0.0);",
                dtype, po, hot, rest
            );
            body.push_str("}\n");
            Ok(grid_loop(n, &body))
        }
        step => {
            let body = pointwise_body(e, step)?;
            Ok(grid_loop(step.out().td.size(), &body))
        }
    }
}

/// Every slot written by the steps must be accessed through one layout and
/// every step must walk the same number of elements.
fn choose_schedule(steps: &[&Primitive]) -> Schedule {
    if !steps.iter().all(|s| is_pointwise(s)) {
        return if steps.len() == 1 {
            Schedule::Parallel
        } else {
            Schedule::Staged
        };
    }
    let n = steps.first().map_or(0, |s| s.out().td.size());
    if steps.iter().any(|s| s.out().td.size() != n) {
        return Schedule::Staged;
    }
    let mut layouts: BTreeMap<usize, Vec<View>> = BTreeMap::new();
    for step in steps {
        for op in step.inputs().into_iter().chain(std::iter::once(step.out())) {
            layouts.entry(op.buffer).or_default().push(View::of(op));
        }
    }
    let written: Vec<usize> = steps.iter().map(|s| s.out().buffer).collect();
    for buffer in written {
        if let Some(views) = layouts.get(&buffer) {
            if views.iter().any(|v| v != &views[0]) {
                return Schedule::Staged;
            }
        }
    }
    Schedule::Parallel
}

/// Generate one kernel for `steps`, all of which must satisfy
/// `is_generated`.
pub fn generate(steps: &[&Primitive]) -> Result<Generated> {
    if steps.is_empty() {
        return Err(Error::Internal("cannot generate a kernel with no steps".to_string()));
    }
    if let Some(bad) = steps.iter().find(|s| !is_generated(s)) {
        return Err(Error::unsupported(bad.name(), "cuda codegen"));
    }
    let schedule = choose_schedule(steps);
    let mut e = Emitter {
        params: Vec::new(),
        lookup: HashMap::new(),
    };
    let mut loops = String::new();
    match schedule {
        Schedule::Parallel if steps.iter().all(|s| is_pointwise(s)) => {
            let mut body = String::new();
            for step in steps {
                let _ = writeln!(body, "// {}", step.name());
                body.push_str(&pointwise_body(&mut e, step)?);
                body.push('\n');
            }
            loops.push_str(&grid_loop(steps[0].out().td.size(), &body));
        }
        _ => {
            for (k, step) in steps.iter().enumerate() {
                if k > 0 {
                    loops.push_str("    __syncthreads();\n");
                }
                let _ = writeln!(loops, "    // {}", step.name());
                loops.push_str(&step_loop(&mut e, step)?);
            }
        }
    }

    let args: Vec<String> = (0..e.params.len()).map(|i| format!("unsigned char* p{}", i)).collect();
    let mut template = String::new();
    let _ = writeln!(template, "extern \"C\" __global__ void {{name}}({}) {{", args.join(", "));
    template.push_str("    const long long tid = (long long)blockIdx.x * blockDim.x + threadIdx.x;\n");
    template.push_str("    const long long nthreads = (long long)gridDim.x * blockDim.x;\n");
    template.push_str(&loops);
    template.push_str("}\n");

    let work = steps
        .iter()
        .map(|s| match s {
            Primitive::Onehot { x, .. } => x.td.size(),
            s => s.out().td.size(),
        })
        .max()
        .unwrap_or(0);
    Ok(Generated {
        params: e.params,
        schedule,
        work,
        shared_size: 0,
        template,
        ops: steps.iter().map(|s| s.name()).collect(),
    })
}

/// Names of compiled fused kernels, keyed by body.
#[derive(Debug, Default)]
pub struct KernelCache {
    by_body: HashMap<String, String>,
    sources: BTreeMap<String, String>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name for the body of `generated`; a body seen before keeps its name.
    /// Returns the name and whether it is new.
    pub fn name(&mut self, generated: &Generated) -> (String, bool) {
        let signature: Vec<String> = generated
            .params
            .iter()
            .map(|v| format!("{:?}", v.layout_key()))
            .collect();
        let key = format!("{}\n{}", signature.join(";"), generated.template);
        if let Some(name) = self.by_body.get(&key) {
            return (name.clone(), false);
        }
        let name = format!("fused_{}_{}", self.sources.len(), generated.ops.first().copied().unwrap_or("op"));
        let source = generated.template.replace("{name}", &name);
        log::trace!("codegen: new kernel {}\n{}", name, source);
        self.by_body.insert(key, name.clone());
        self.sources.insert(name.clone(), source);
        (name, true)
    }

    pub fn source(&self, name: &str) -> Option<&str> {
        self.sources.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_expr_skips_unit_dims() {
        assert_eq!(index_expr(&[3, 4], &[4, 1], "i"), "(i / 4) * 4 + (i % 4)");
        assert_eq!(index_expr(&[1, 4], &[4, 1], "i"), "(i % 4)");
        assert_eq!(index_expr(&[3, 4], &[1, 3], "i"), "(i / 4) + (i % 4) * 3");
        assert_eq!(index_expr(&[3, 4], &[0, 1], "i"), "(i % 4)");
        assert_eq!(index_expr(&[], &[], "i"), "0");
    }

    #[test]
    fn test_c_literal() {
        assert_eq!(c_literal(1.0), "1.0");
        assert_eq!(c_literal(-0.5), "-0.5");
        assert_eq!(c_literal(f64::NEG_INFINITY), "(-INFINITY)");
        assert!(c_literal(1e-30).contains('e'));
    }

    #[test]
    fn test_dense_detection() {
        let v = View::dense(Slot::Buffer(0), DType::F32, vec![2, 3]);
        assert!(v.is_dense());
        let t = View {
            strides: vec![1, 2],
            ..v.clone()
        };
        assert!(!t.is_dense());
        let column = View {
            dims: vec![2, 1],
            strides: vec![1, 7],
            ..v
        };
        assert!(column.is_dense());
    }
}
