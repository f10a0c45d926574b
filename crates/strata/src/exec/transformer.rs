// Transformer: from a built graph to callable computations
//
// A transformer owns one graph and one backend and moves through
//
//   Constructed -> Finalized -> Allocated -> Initialized -> (call)*
//
// Each phase runs the ones before it if needed, and running a phase twice
// is a no-op.
//
//   finalize    prune, collect initializers, order the ops, describe every
//               value, plan memory
//   allocate    one backend buffer per planned buffer; load constants,
//               numpy tensors and random tensors; compile every computation
//               over the instructions it can reach
//   initialize  run the initializer program once
//
// Computations must be registered before finalize. A call copies its
// arguments into the placeholders, runs the computation and reads back its
// results.
//
// Values written by initializers (variables and whatever the initializers
// compute) keep dedicated buffers, so nothing a later computation does can
// overwrite them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;

use strata_core::description::StorageId;
use strata_core::dtype::DType;
use strata_core::error::{Error, Result};
use strata_core::graph::{GraphBuilder, OpId, RngId};
use strata_core::op::{OpKind, RandomDist};
use strata_core::prune::simple_prune;
use strata_core::tensor::HostTensor;

use super::backend::Backend;
use super::lower::{Descriptions, Lowering};
use super::plan::{Dataflow, MemoryPlan, MemoryPlanner};

/// Settings shared by every computation of a transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerConfig {
    /// Storage dtype of floating point values (None: as built).
    pub dtype: Option<DType>,
    /// Group consecutive elementwise ops into fused units.
    pub fusion: bool,
    /// Added to every RNG seed of the graph.
    pub seed: u64,
    /// Let values with disjoint lifetimes share buffers.
    pub memory_reuse: bool,
    /// Let host kernels split work across rayon tasks.
    pub parallel: bool,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            dtype: None,
            fusion: true,
            seed: 0,
            memory_reuse: true,
            parallel: true,
        }
    }
}

impl TransformerConfig {
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_fusion(mut self, fusion: bool) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_memory_reuse(mut self, reuse: bool) -> Self {
        self.memory_reuse = reuse;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Constructed,
    Finalized,
    Allocated,
    Initialized,
}

/// The shape of what a computation returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Returns {
    Single(OpId),
    Tuple(Vec<OpId>),
    /// Results keyed by their op.
    Map(Vec<OpId>),
}

impl Returns {
    pub fn ops(&self) -> &[OpId] {
        match self {
            Returns::Single(op) => std::slice::from_ref(op),
            Returns::Tuple(ops) | Returns::Map(ops) => ops,
        }
    }
}

impl From<OpId> for Returns {
    fn from(op: OpId) -> Self {
        Returns::Single(op)
    }
}

impl From<Vec<OpId>> for Returns {
    fn from(ops: Vec<OpId>) -> Self {
        Returns::Tuple(ops)
    }
}

/// Results of one call, shaped like the computation's `Returns`.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Single(HostTensor),
    Tuple(Vec<HostTensor>),
    Map(BTreeMap<OpId, HostTensor>),
}

impl Output {
    pub fn into_single(self) -> Result<HostTensor> {
        match self {
            Output::Single(t) => Ok(t),
            other => Err(Error::msg(format!("expected a single result, got {}", other.kind()))),
        }
    }

    pub fn into_tuple(self) -> Result<Vec<HostTensor>> {
        match self {
            Output::Tuple(ts) => Ok(ts),
            other => Err(Error::msg(format!("expected a tuple of results, got {}", other.kind()))),
        }
    }

    pub fn into_map(self) -> Result<BTreeMap<OpId, HostTensor>> {
        match self {
            Output::Map(m) => Ok(m),
            other => Err(Error::msg(format!("expected a map of results, got {}", other.kind()))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Output::Single(_) => "single",
            Output::Tuple(_) => "tuple",
            Output::Map(_) => "map",
        }
    }
}

/// A computation argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Broadcast to every element of the parameter.
    Scalar(f64),
    Array(HostTensor),
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<HostTensor> for Value {
    fn from(t: HostTensor) -> Self {
        Value::Array(t)
    }
}

/// Handle returned by `Transformer::computation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputationId(usize);

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "computation{}", self.0)
    }
}

struct Computation<P> {
    returns: Returns,
    params: Vec<OpId>,
    program: Option<P>,
}

/// Compiles the computations of one graph for one backend.
pub struct Transformer<B: Backend> {
    graph: GraphBuilder,
    backend: B,
    config: TransformerConfig,
    state: State,
    computations: Vec<Computation<B::Program>>,
    descriptions: Descriptions,
    dataflow: Dataflow,
    init_ops: Vec<OpId>,
    plan: Option<MemoryPlan>,
    init_program: Option<B::Program>,
    buffers: Vec<B::Storage>,
}

impl<B: Backend> Transformer<B> {
    pub fn new(graph: GraphBuilder, backend: B, config: TransformerConfig) -> Self {
        Transformer {
            graph,
            backend,
            config,
            state: State::Constructed,
            computations: Vec::new(),
            descriptions: Descriptions::default(),
            dataflow: Dataflow::default(),
            init_ops: Vec::new(),
            plan: None,
            init_program: None,
            buffers: Vec::new(),
        }
    }

    pub fn graph(&self) -> &GraphBuilder {
        &self.graph
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The memory plan, once finalized.
    pub fn plan(&self) -> Option<&MemoryPlan> {
        self.plan.as_ref()
    }

    /// The computing ops of the initializer program, in run order.
    pub fn initializer_ops(&self) -> &[OpId] {
        &self.init_ops
    }

    /// Register a computation returning `returns` whose positional
    /// arguments are `params`.
    pub fn computation(&mut self, returns: impl Into<Returns>, params: &[OpId]) -> Result<ComputationId> {
        if self.state != State::Constructed {
            return Err(Error::InvalidState(
                "cannot add a computation to a finalized transformer".to_string(),
            ));
        }
        let returns = returns.into();
        for &op in returns.ops().iter().chain(params) {
            if op.index() >= self.graph.len() {
                return Err(Error::msg(format!("{} is not an op of this graph", op)));
            }
        }
        self.computations.push(Computation {
            returns,
            params: params.to_vec(),
            program: None,
        });
        Ok(ComputationId(self.computations.len() - 1))
    }

    pub fn finalize(&mut self) -> Result<()> {
        if self.state >= State::Finalized {
            return Ok(());
        }
        let roots: Vec<OpId> = self
            .computations
            .iter()
            .flat_map(|c| c.returns.ops().iter().chain(&c.params).copied())
            .collect();
        simple_prune(&mut self.graph, &roots)?;

        let init_roots = collect_initializers(&self.graph, &roots);
        simple_prune(&mut self.graph, &init_roots)?;

        let init_order = self.graph.ordered_ops(&init_roots);
        let main_order = self.graph.ordered_ops(&roots);
        let mut all = init_order.clone();
        all.extend(&main_order);
        self.descriptions = Descriptions::build(&self.graph, &all, self.config.dtype)?;

        let init_flow = Dataflow::build(&self.graph, &init_order, &self.descriptions);
        self.dataflow = Dataflow::build(&self.graph, &main_order, &self.descriptions);

        let init_touched: HashSet<StorageId> = init_flow
            .instructions()
            .iter()
            .flat_map(|i| i.defs.iter().chain(&i.uses).copied())
            .collect();
        let computed: HashSet<StorageId> = self
            .dataflow
            .instructions()
            .iter()
            .flat_map(|i| i.defs.iter().copied())
            .collect();
        let mut planned = Vec::new();
        let mut dedicated = Vec::new();
        for s in 0..self.descriptions.storage_count() {
            let storage = StorageId(s as u32);
            let value = self.descriptions.value(storage)?;
            if computed.contains(&storage) && !init_touched.contains(&storage) {
                planned.push(value);
            } else {
                dedicated.push(value);
            }
        }
        let results: Vec<StorageId> = roots
            .iter()
            .filter_map(|&op| self.descriptions.storage(op))
            .collect();

        let plan = MemoryPlanner::new(self.config.memory_reuse, self.config.fusion).plan(
            &self.dataflow,
            &planned,
            &dedicated,
            &results,
        )?;
        self.init_ops = init_flow.instructions().iter().map(|i| i.op).collect();
        log::debug!(
            "finalize: {} computations, {} instructions, {} initializer instructions, {} buffers",
            self.computations.len(),
            self.dataflow.len(),
            self.init_ops.len(),
            plan.buffers().len()
        );
        self.plan = Some(plan);
        self.state = State::Finalized;
        Ok(())
    }

    pub fn allocate(&mut self) -> Result<()> {
        self.finalize()?;
        if self.state >= State::Allocated {
            return Ok(());
        }
        self.backend.configure(&self.config);
        self.create_buffers()?;
        self.load_allocations()?;
        self.compile()?;
        self.state = State::Allocated;
        Ok(())
    }

    fn planned(&self) -> Result<&MemoryPlan> {
        self.plan
            .as_ref()
            .ok_or_else(|| Error::InvalidState("transformer is not finalized".to_string()))
    }

    fn create_buffers(&mut self) -> Result<()> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| Error::InvalidState("transformer is not finalized".to_string()))?;
        let mut buffers = Vec::with_capacity(plan.buffers().len());
        for buffer in plan.buffers() {
            buffers.push(self.backend.empty(buffer)?);
        }
        self.buffers = buffers;
        Ok(())
    }

    /// Compile every computation over the instructions it can reach, and
    /// the initializers.
    fn compile(&mut self) -> Result<()> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| Error::InvalidState("transformer is not finalized".to_string()))?;
        let ops: Vec<OpId> = self.dataflow.instructions().iter().map(|i| i.op).collect();
        let lowering = Lowering::new(&self.graph, &self.descriptions, plan);
        for (i, computation) in self.computations.iter_mut().enumerate() {
            let reach = self.dataflow.can_reach(&self.graph, computation.returns.ops());
            let units = lowering.units(&ops, &reach)?;
            let name = ComputationId(i).to_string();
            log::debug!("allocate: compiling {} ({} units)", name, units.len());
            computation.program = Some(self.backend.compile(&name, units)?);
        }
        if !self.init_ops.is_empty() {
            let units = lowering.unfused(&self.init_ops)?;
            self.init_program = Some(self.backend.compile("initializers", units)?);
        }
        Ok(())
    }

    /// Load every storage owned by a constant, numpy tensor or random op.
    fn load_allocations(&mut self) -> Result<()> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| Error::InvalidState("transformer is not finalized".to_string()))?;
        let mut rngs: HashMap<RngId, StdRng> = HashMap::new();
        for s in 0..self.descriptions.storage_count() {
            let storage = StorageId(s as u32);
            let Some(op) = self.descriptions.owner(storage) else {
                continue;
            };
            let Some(b) = plan.buffer_of(storage) else {
                continue;
            };
            let td = self.descriptions.get(op)?;
            let buf = &mut self.buffers[b];
            match self.graph.kind(op) {
                OpKind::Constant(v) => self.backend.fill(buf, td, *v)?,
                OpKind::Tensor(data) => self.backend.nparray(buf, td, data)?,
                OpKind::Random { rng, dist } => {
                    let seed = self.graph.rng_seed(*rng).wrapping_add(self.config.seed);
                    let rng = rngs.entry(*rng).or_insert_with(|| StdRng::seed_from_u64(seed));
                    match *dist {
                        RandomDist::Uniform { low, high } => {
                            self.backend.rng_uniform_tensor(buf, td, rng, low, high)?
                        }
                        RandomDist::Normal { loc, scale } => {
                            self.backend.rng_normal_tensor(buf, td, rng, loc, scale)?
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn initialize(&mut self) -> Result<()> {
        self.allocate()?;
        if self.state >= State::Initialized {
            return Ok(());
        }
        if let Some(program) = &mut self.init_program {
            log::debug!("initialize: running {} initializer ops", self.init_ops.len());
            self.backend.run(program, &mut self.buffers)?;
        }
        self.state = State::Initialized;
        Ok(())
    }

    /// Run computation `id` with positional `args`.
    pub fn call(&mut self, id: ComputationId, args: &[Value]) -> Result<Output> {
        self.initialize()?;
        let (params, returns) = match self.computations.get(id.0) {
            Some(c) => (c.params.clone(), c.returns.clone()),
            None => return Err(Error::InvalidState(format!("unknown {}", id))),
        };
        if args.len() != params.len() {
            return Err(Error::ArgumentCountMismatch {
                expected: params.len(),
                got: args.len(),
            });
        }
        for (&param, arg) in params.iter().zip(args) {
            self.copy_to_model(param, arg)?;
        }
        let program = self.computations[id.0]
            .program
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} was not compiled", id)))?;
        self.backend.run(program, &mut self.buffers)?;

        Ok(match returns {
            Returns::Single(op) => Output::Single(self.read(op)?),
            Returns::Tuple(ops) => Output::Tuple(ops.iter().map(|&op| self.read(op)).collect::<Result<_>>()?),
            Returns::Map(ops) => Output::Map(
                ops.iter()
                    .map(|&op| Ok((op, self.read(op)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    fn copy_to_model(&mut self, param: OpId, value: &Value) -> Result<()> {
        let td = self.descriptions.get(param)?;
        let b = self
            .planned()?
            .buffer_of(td.storage())
            .ok_or_else(|| Error::Internal(format!("{} has no buffer", param)))?;
        let buf = &mut self.buffers[b];
        match value {
            Value::Scalar(v) => self.backend.fill(buf, td, *v),
            Value::Array(data) => {
                if data.shape() != td.shape().as_slice() {
                    return Err(Error::ShapeMismatch {
                        expected: td.shape(),
                        got: data.shape().to_vec(),
                    });
                }
                self.backend.set_item(buf, td, data)
            }
        }
    }

    /// Current value of `op`. Ops without a value read as an empty tensor.
    pub fn read(&self, op: OpId) -> Result<HostTensor> {
        if self.state < State::Allocated {
            return Err(Error::InvalidState(format!("read of {} before allocation", op)));
        }
        if !self.graph.kind(op).defines_value() {
            return Ok(HostTensor::empty());
        }
        let td = self.descriptions.get(op)?;
        let b = self
            .planned()?
            .buffer_of(td.storage())
            .ok_or_else(|| Error::Internal(format!("{} has no buffer", op)))?;
        self.backend.read(&self.buffers[b], td)
    }
}

/// Initializer ops of everything reachable from `roots`, an initializer's
/// own dependencies' initializers first.
fn collect_initializers(g: &GraphBuilder, roots: &[OpId]) -> Vec<OpId> {
    fn visit(g: &GraphBuilder, ops: &[OpId], seen: &mut HashSet<OpId>, out: &mut Vec<OpId>) {
        for op in g.ordered_ops(ops) {
            for &init in g.node(op).initializers() {
                if seen.insert(init) {
                    visit(g, &[init], seen, out);
                    out.push(init);
                }
            }
        }
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    visit(g, roots, &mut seen, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::host::HostBackend;
    use strata_core::axes::Axis;

    fn host(g: GraphBuilder) -> Transformer<HostBackend> {
        Transformer::new(g, HostBackend::new(), TransformerConfig::default())
    }

    #[test]
    fn test_phases_are_idempotent() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 2);
        let x = g.placeholder([a]);
        let y = g.exp(x);
        let mut t = host(g);
        t.computation(y, &[x]).unwrap();
        t.finalize().unwrap();
        t.finalize().unwrap();
        assert_eq!(t.state(), State::Finalized);
        t.initialize().unwrap();
        t.allocate().unwrap();
        assert_eq!(t.state(), State::Initialized);
    }

    #[test]
    fn test_computation_rejected_after_finalize() {
        let mut g = GraphBuilder::new();
        let x = g.placeholder([Axis::named("A", 2)]);
        let mut t = host(g);
        t.computation(x, &[x]).unwrap();
        t.finalize().unwrap();
        assert!(matches!(t.computation(x, &[]), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_argument_count_and_shape_checks() {
        let mut g = GraphBuilder::new();
        let x = g.placeholder([Axis::named("A", 2)]);
        let y = g.negative(x);
        let mut t = host(g);
        let c = t.computation(y, &[x]).unwrap();
        assert!(matches!(
            t.call(c, &[]),
            Err(Error::ArgumentCountMismatch { expected: 1, got: 0 })
        ));
        let wrong = HostTensor::new(vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(t.call(c, &[wrong.into()]), Err(Error::ShapeMismatch { .. })));
        let out = t.call(c, &[Value::Scalar(2.0)]).unwrap().into_single().unwrap();
        assert_eq!(out.data(), &[-2.0, -2.0]);
    }

    #[test]
    fn test_tuple_and_map_returns() {
        let mut g = GraphBuilder::new();
        let x = g.placeholder([Axis::named("A", 2)]);
        let y = g.square(x);
        let z = g.negative(x);
        let mut t = host(g);
        let tup = t.computation(vec![y, z], &[x]).unwrap();
        let map = t.computation(Returns::Map(vec![y, z]), &[x]).unwrap();
        let arg = HostTensor::new(vec![2], vec![1.0, 3.0]).unwrap();
        let out = t.call(tup, &[arg.clone().into()]).unwrap().into_tuple().unwrap();
        assert_eq!(out[0].data(), &[1.0, 9.0]);
        assert_eq!(out[1].data(), &[-1.0, -3.0]);
        let out = t.call(map, &[arg.into()]).unwrap().into_map().unwrap();
        assert_eq!(out[&z].data(), &[-1.0, -3.0]);
    }

    #[test]
    fn test_initializer_values_are_dedicated() {
        let mut g = GraphBuilder::new();
        let a = Axis::named("A", 3);
        let v = g.variable_filled([a.clone()], 1.5);
        let x = g.placeholder([a]);
        let y = g.add(v, x);
        let mut t = host(g);
        t.computation(y, &[x]).unwrap();
        t.finalize().unwrap();
        let plan = t.plan().unwrap();
        let vs = t.descriptions.storage(v).unwrap();
        assert!(plan.buffers()[plan.buffer_of(vs).unwrap()].dedicated);
        assert_eq!(t.initializer_ops().len(), 1);
    }
}
