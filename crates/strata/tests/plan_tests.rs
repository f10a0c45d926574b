// Plan Tests: memory planner properties on random dataflows
//
// The oracle gives every value the closed interval [def, last use], or
// [def, end] when it is a result. Two values whose intervals overlap must
// never share a buffer. On top of that the greedy coloring must stay
// within (max degree + 1) colors and never use more bytes than giving
// each value its own buffer.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use strata::core::StorageId;
use strata::exec::plan::Value as PlanValue;
use strata::exec::{Dataflow, Instruction, MemoryPlan, MemoryPlanner};
use strata::prelude::*;

struct RandomFlow {
    dataflow: Dataflow,
    values: Vec<PlanValue>,
    results: Vec<StorageId>,
}

fn random_flow(rng: &mut StdRng, n: usize) -> RandomFlow {
    let mut instructions = Vec::with_capacity(n);
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        let uses = if i == 0 {
            Vec::new()
        } else {
            let count = rng.gen_range(0..=3.min(i));
            let mut uses: Vec<StorageId> = (0..count)
                .map(|_| StorageId(rng.gen_range(0..i) as u32))
                .collect();
            uses.sort();
            uses.dedup();
            uses
        };
        let elems = rng.gen_range(1..64);
        instructions.push(Instruction {
            op: OpId(i as u32),
            defs: vec![StorageId(i as u32)],
            uses,
            elems,
            fusible: false,
        });
        values.push(PlanValue {
            storage: StorageId(i as u32),
            bytes: elems * 4,
            elems,
        });
    }
    let results = (0..n)
        .filter(|_| rng.gen_bool(0.15))
        .map(|i| StorageId(i as u32))
        .collect();
    RandomFlow {
        dataflow: Dataflow::new(instructions),
        values,
        results,
    }
}

fn intervals(flow: &RandomFlow) -> BTreeMap<StorageId, (usize, usize)> {
    let n = flow.dataflow.len();
    let mut spans = BTreeMap::new();
    for (i, instr) in flow.dataflow.instructions().iter().enumerate() {
        for &d in &instr.defs {
            spans.insert(d, (i, i));
        }
        for u in &instr.uses {
            if let Some(span) = spans.get_mut(u) {
                span.1 = span.1.max(i);
            }
        }
    }
    for r in &flow.results {
        if let Some(span) = spans.get_mut(r) {
            span.1 = n;
        }
    }
    spans
}

fn plan(flow: &RandomFlow, reuse: bool) -> MemoryPlan {
    MemoryPlanner::new(reuse, false)
        .plan(&flow.dataflow, &flow.values, &[], &flow.results)
        .unwrap()
}

#[test]
fn test_overlapping_values_never_share() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..50 {
        let flow = random_flow(&mut rng, 40);
        let plan = plan(&flow, true);
        let spans = intervals(&flow);
        for (&a, &(a0, a1)) in &spans {
            for (&b, &(b0, b1)) in &spans {
                if a >= b {
                    continue;
                }
                let overlap = a0.max(b0) <= a1.min(b1);
                if overlap {
                    assert_ne!(
                        plan.buffer_of(a),
                        plan.buffer_of(b),
                        "{:?} {:?} and {:?} {:?} share a buffer",
                        a,
                        (a0, a1),
                        b,
                        (b0, b1)
                    );
                }
            }
        }
    }
}

#[test]
fn test_color_count_is_bounded_by_degree() {
    let mut rng = StdRng::seed_from_u64(12);
    for _ in 0..50 {
        let flow = random_flow(&mut rng, 30);
        let plan = plan(&flow, true);
        let ids: Vec<StorageId> = flow.values.iter().map(|v| v.storage).collect();
        let max_degree = ids
            .iter()
            .map(|&a| ids.iter().filter(|&&b| b != a && plan.interferes(a, b)).count())
            .max()
            .unwrap_or(0);
        assert!(plan.stats().num_colors <= max_degree + 1);
    }
}

#[test]
fn test_planned_bytes_never_exceed_naive() {
    let mut rng = StdRng::seed_from_u64(13);
    for _ in 0..50 {
        let flow = random_flow(&mut rng, 30);
        let reused = plan(&flow, true);
        let stats = reused.stats();
        assert!(stats.planned_bytes <= stats.naive_bytes);
        assert_eq!(stats.naive_bytes, flow.values.iter().map(|v| v.bytes).sum::<usize>());
        // Every value lands in a buffer at least as large as itself.
        for v in &flow.values {
            let b = reused.buffer_of(v.storage).unwrap();
            assert!(reused.buffers()[b].size >= v.bytes);
            assert!(reused.buffers()[b].elems >= v.elems);
        }

        let naive = plan(&flow, false);
        assert_eq!(naive.stats().num_colors, flow.values.len());
        assert_eq!(naive.stats().planned_bytes, naive.stats().naive_bytes);
    }
}

#[test]
fn test_plan_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(14);
    let flow = random_flow(&mut rng, 60);
    let first = plan(&flow, true);
    let second = plan(&flow, true);
    for v in &flow.values {
        assert_eq!(first.buffer_of(v.storage), second.buffer_of(v.storage));
    }
    assert_eq!(first.buffers(), second.buffers());
}

#[test]
fn test_chain_reuses_two_buffers() {
    // v0 -> v1 -> v2 -> ... each value only feeds the next one.
    let n = 10;
    let instructions = (0..n)
        .map(|i| Instruction {
            op: OpId(i),
            defs: vec![StorageId(i)],
            uses: if i == 0 { Vec::new() } else { vec![StorageId(i - 1)] },
            elems: 8,
            fusible: false,
        })
        .collect();
    let values: Vec<PlanValue> = (0..n)
        .map(|i| PlanValue {
            storage: StorageId(i),
            bytes: 32,
            elems: 8,
        })
        .collect();
    let plan = MemoryPlanner::new(true, false)
        .plan(&Dataflow::new(instructions), &values, &[], &[StorageId(n - 1)])
        .unwrap();
    assert_eq!(plan.stats().num_colors, 2);
    assert_eq!(plan.footprint(), 64);
}

/// A random graph of elementwise, broadcast and reduction ops over two
/// placeholders, reduced to one scalar. Every op keeps the axes (A, B).
fn random_graph(rng: &mut StdRng) -> (GraphBuilder, OpId, OpId, OpId) {
    let a = Axis::named("A", 3);
    let b = Axis::named("B", 4);
    let mut g = GraphBuilder::new();
    let x = g.placeholder([a.clone(), b.clone()]);
    let v = g.placeholder([b.clone()]);
    let mut pool = vec![x];
    for _ in 0..25 {
        let p = pool[rng.gen_range(0..pool.len())];
        let q = pool[rng.gen_range(0..pool.len())];
        let next = match rng.gen_range(0..7) {
            0 => g.add(p, q),
            1 => g.multiply(p, q),
            2 => g.tanh(p),
            3 => {
                let s = g.sin(p);
                g.subtract(s, v)
            }
            4 => g.maximum(p, v),
            5 => {
                let m = g.max(p, Reduction::over([b.clone()])).unwrap();
                g.add(p, m)
            }
            _ => {
                let t = g.square(q);
                let one = g.constant(1.0);
                let d = g.add(t, one);
                g.divide(p, d)
            }
        };
        pool.push(next);
    }
    let mut root = pool[pool.len() - 1];
    // Keep a few earlier values alive across the whole computation.
    for &extra in pool.iter().step_by(7) {
        root = g.add(root, extra);
    }
    let total = g.sum(root, Reduction::All).unwrap();
    (g, total, x, v)
}

fn run_random_graph(seed: u64, config: TransformerConfig) -> (f64, HostTensor) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (mut g, total, x, v) = random_graph(&mut rng);
    let grad = deriv(&mut g, total, x).unwrap();
    let mut t = Transformer::new(g, HostBackend::new(), config.with_dtype(DType::F64));
    let f = t.computation(vec![total, grad], &[x, v]).unwrap();
    let xa: Vec<f64> = (0..12).map(|i| (i as f64 * 0.37).sin()).collect();
    let va: Vec<f64> = (0..4).map(|i| (i as f64 * 0.91).cos()).collect();
    let args = [
        HostTensor::new(vec![3, 4], xa).unwrap().into(),
        HostTensor::new(vec![4], va).unwrap().into(),
    ];
    let out = t.call(f, &args).unwrap().into_tuple().unwrap();
    (out[0].to_scalar().unwrap(), out[1].clone())
}

#[test]
fn test_reuse_and_fusion_do_not_change_results() {
    for seed in 0..8 {
        let reference = run_random_graph(
            seed,
            TransformerConfig::default()
                .with_memory_reuse(false)
                .with_fusion(false),
        );
        for (reuse, fusion) in [(true, false), (false, true), (true, true)] {
            let (total, grad) = run_random_graph(
                seed,
                TransformerConfig::default()
                    .with_memory_reuse(reuse)
                    .with_fusion(fusion),
            );
            assert!(
                (total - reference.0).abs() <= 1e-12 * (1.0 + reference.0.abs()),
                "seed {} reuse {} fusion {}: {} vs {}",
                seed,
                reuse,
                fusion,
                total,
                reference.0
            );
            assert!(grad.max_abs_diff(&reference.1) <= 1e-12 * (1.0 + reference.0.abs()));
        }
    }
}

#[test]
fn test_transformer_plan_reuses_memory() {
    let mut rng = StdRng::seed_from_u64(3);
    let (g, total, x, v) = random_graph(&mut rng);
    let mut t = Transformer::new(g, HostBackend::new(), TransformerConfig::default());
    t.computation(total, &[x, v]).unwrap();
    t.finalize().unwrap();
    let stats = t.plan().unwrap().stats();
    assert!(stats.num_values > 0);
    assert!(stats.planned_bytes <= stats.naive_bytes);
}
