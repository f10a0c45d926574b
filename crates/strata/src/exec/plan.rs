// Memory planning: which values may share a buffer
//
// The planner works on the dataflow of one transformer: the ordered list of
// computing instructions (views are resolved to the storage they look at and
// are not instructions). Each instruction defines at most one value and uses
// the values of its operands.
//
//   1. Fusion groups consecutive fusible elementwise instructions with the
//      same element count into one node. Every value a node touches is live
//      for the whole node, since a fused kernel runs all of its ops at once.
//
//   2. Liveness runs backward from the end:
//        live_out[last] = results
//        live_out[i]    = (live_out[i+1] - defs[i+1]) | uses[i+1]
//
//   3. Interference: a value defined at node i conflicts with every other
//      value defined at i, read at i, or live after i.
//
//   4. Coloring: greedy, highest degree first (ties by definition order); a
//      value takes the lowest color none of its neighbours hold. A color's
//      buffer is as large as its largest value.
//
// Storage owned by allocation ops (placeholders, variables, constants, ...)
// never takes part: each such value gets a dedicated buffer.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::ops::Range;
use std::time::Instant;

use strata_core::description::StorageId;
use strata_core::error::{Error, Result};
use strata_core::graph::{GraphBuilder, OpId};

use super::lower::Descriptions;

/// One computing op of the dataflow.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: OpId,
    pub defs: Vec<StorageId>,
    pub uses: Vec<StorageId>,
    /// Elements written (the op's logical size).
    pub elems: usize,
    pub fusible: bool,
}

/// The ordered instructions of a transformer.
#[derive(Debug, Clone, Default)]
pub struct Dataflow {
    instructions: Vec<Instruction>,
}

impl Dataflow {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Dataflow { instructions }
    }

    /// Instructions for the computing ops of `order` (allocations and views
    /// are skipped).
    pub fn build(g: &GraphBuilder, order: &[OpId], descriptions: &Descriptions) -> Self {
        let mut instructions = Vec::new();
        for &op in order {
            let kind = g.kind(op);
            if kind.is_allocation() || kind.is_view() {
                continue;
            }
            let defs = descriptions.storage(op).into_iter().collect();
            let mut uses: Vec<StorageId> = Vec::new();
            for &arg in g.node(op).args() {
                if let Some(s) = descriptions.storage(arg) {
                    if !uses.contains(&s) {
                        uses.push(s);
                    }
                }
            }
            instructions.push(Instruction {
                op,
                defs,
                uses,
                elems: g.axes(op).size(),
                fusible: kind.is_elementwise(),
            });
        }
        Dataflow { instructions }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Indices, in order, of the instructions needed for `results`.
    pub fn can_reach(&self, g: &GraphBuilder, results: &[OpId]) -> Vec<usize> {
        let reachable: HashSet<OpId> = g.ordered_ops(results).into_iter().collect();
        self.instructions
            .iter()
            .enumerate()
            .filter(|(_, instr)| reachable.contains(&instr.op))
            .map(|(i, _)| i)
            .collect()
    }
}

/// A value to be placed in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub storage: StorageId,
    pub bytes: usize,
    pub elems: usize,
}

/// A physical allocation shared by the values (views) assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub color: usize,
    /// Bytes: the largest of its values.
    pub size: usize,
    /// Element capacity: the largest of its values.
    pub elems: usize,
    pub views: Vec<StorageId>,
    /// Owned by a single allocation op rather than shared by coloring.
    pub dedicated: bool,
}

/// Statistics from one planning run.
#[derive(Debug, Clone, Default)]
pub struct PlanStats {
    pub num_instructions: usize,
    pub num_values: usize,
    pub num_colors: usize,
    /// Values that share a buffer with an earlier value.
    pub num_reused: usize,
    /// Bytes without any sharing.
    pub naive_bytes: usize,
    /// Bytes of the colored buffers.
    pub planned_bytes: usize,
    pub dedicated_bytes: usize,
    pub num_fused_groups: usize,
    pub num_fused_instructions: usize,
    pub plan_time_us: u64,
}

impl fmt::Display for PlanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryPlan: {} instructions, {} values in {} colors ({} reused), {} -> {} bytes (+{} dedicated), {} fused groups ({} instructions), planned in {}μs",
            self.num_instructions,
            self.num_values,
            self.num_colors,
            self.num_reused,
            self.naive_bytes,
            self.planned_bytes,
            self.dedicated_bytes,
            self.num_fused_groups,
            self.num_fused_instructions,
            self.plan_time_us,
        )
    }
}

/// Result of planning: buffers and the storage -> buffer map.
#[derive(Debug, Clone)]
pub struct MemoryPlan {
    buffers: Vec<Buffer>,
    buffer_of: BTreeMap<StorageId, usize>,
    groups: Vec<Range<usize>>,
    group_of: Vec<usize>,
    interference: BTreeMap<StorageId, BTreeSet<StorageId>>,
    stats: PlanStats,
}

impl MemoryPlan {
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffer_of(&self, storage: StorageId) -> Option<usize> {
        self.buffer_of.get(&storage).copied()
    }

    /// Color of a planned (non-dedicated) value.
    pub fn color_of(&self, storage: StorageId) -> Option<usize> {
        let buffer = &self.buffers[self.buffer_of(storage)?];
        (!buffer.dedicated).then_some(buffer.color)
    }

    /// Fusion groups, as ranges of instruction indices covering the
    /// dataflow in order.
    pub fn groups(&self) -> &[Range<usize>] {
        &self.groups
    }

    /// Index of the group holding instruction `i`.
    pub fn group_of(&self, i: usize) -> usize {
        self.group_of[i]
    }

    pub fn interferes(&self, a: StorageId, b: StorageId) -> bool {
        self.interference.get(&a).is_some_and(|n| n.contains(&b))
    }

    /// Bytes of the colored buffers.
    pub fn footprint(&self) -> usize {
        self.stats.planned_bytes
    }

    pub fn stats(&self) -> &PlanStats {
        &self.stats
    }
}

/// Partition `instructions` into fusion groups. Without fusion every
/// instruction is its own group.
pub fn fuse(instructions: &[Instruction], enabled: bool) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=instructions.len() {
        let extend = enabled
            && i < instructions.len()
            && instructions[i].fusible
            && instructions[start].fusible
            && instructions[i].elems == instructions[start].elems;
        if !extend {
            groups.push(start..i);
            start = i;
        }
    }
    groups
}

struct Node {
    defs: BTreeSet<StorageId>,
    uses: BTreeSet<StorageId>,
}

fn group_nodes(
    instructions: &[Instruction],
    groups: &[Range<usize>],
    planned: &BTreeSet<StorageId>,
) -> Vec<Node> {
    groups
        .iter()
        .map(|range| {
            let group = &instructions[range.clone()];
            let defs: BTreeSet<StorageId> = group
                .iter()
                .flat_map(|instr| instr.defs.iter().copied())
                .filter(|s| planned.contains(s))
                .collect();
            let uses = group
                .iter()
                .flat_map(|instr| instr.uses.iter().copied())
                .filter(|s| planned.contains(s) && !defs.contains(s))
                .collect();
            Node { defs, uses }
        })
        .collect()
}

/// Values resident after each node.
fn liveness(nodes: &[Node], results: &BTreeSet<StorageId>) -> Vec<BTreeSet<StorageId>> {
    let mut live_out = vec![BTreeSet::new(); nodes.len()];
    if nodes.is_empty() {
        return live_out;
    }
    live_out[nodes.len() - 1] = results.clone();
    for i in (0..nodes.len() - 1).rev() {
        let next = &nodes[i + 1];
        let mut live: BTreeSet<StorageId> = live_out[i + 1].difference(&next.defs).copied().collect();
        live.extend(next.uses.iter().copied());
        live_out[i] = live;
    }
    live_out
}

fn interference(
    nodes: &[Node],
    live_out: &[BTreeSet<StorageId>],
    planned: &BTreeSet<StorageId>,
) -> BTreeMap<StorageId, BTreeSet<StorageId>> {
    let mut graph: BTreeMap<StorageId, BTreeSet<StorageId>> =
        planned.iter().map(|&s| (s, BTreeSet::new())).collect();
    for (node, live) in nodes.iter().zip(live_out) {
        let conflicts: BTreeSet<StorageId> = node
            .defs
            .iter()
            .chain(node.uses.iter())
            .chain(live.iter())
            .copied()
            .collect();
        for &d in &node.defs {
            for &other in &conflicts {
                if other != d {
                    graph.entry(d).or_default().insert(other);
                    graph.entry(other).or_default().insert(d);
                }
            }
        }
    }
    graph
}

/// Liveness, interference and coloring over a dataflow.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPlanner {
    reuse: bool,
    fusion: bool,
}

impl Default for MemoryPlanner {
    fn default() -> Self {
        MemoryPlanner {
            reuse: true,
            fusion: true,
        }
    }
}

impl MemoryPlanner {
    pub fn new(reuse: bool, fusion: bool) -> Self {
        MemoryPlanner { reuse, fusion }
    }

    /// Plan `values` (defined by the dataflow) and give every `dedicated`
    /// value its own buffer. `results` stay live to the end.
    pub fn plan(
        &self,
        dataflow: &Dataflow,
        values: &[Value],
        dedicated: &[Value],
        results: &[StorageId],
    ) -> Result<MemoryPlan> {
        let start = Instant::now();
        let instructions = dataflow.instructions();
        let info: BTreeMap<StorageId, Value> = values.iter().map(|v| (v.storage, *v)).collect();
        let planned: BTreeSet<StorageId> = info.keys().copied().collect();

        let groups = fuse(instructions, self.fusion);
        let mut group_of = vec![0; instructions.len()];
        for (g, range) in groups.iter().enumerate() {
            for i in range.clone() {
                group_of[i] = g;
            }
        }
        let nodes = group_nodes(instructions, &groups, &planned);
        let results: BTreeSet<StorageId> = results.iter().copied().filter(|s| planned.contains(s)).collect();
        let live_out = liveness(&nodes, &results);
        let graph = interference(&nodes, &live_out, &planned);

        // Definition position for tie breaking; values never defined go last.
        let mut def_at: BTreeMap<StorageId, usize> = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for &d in &node.defs {
                def_at.entry(d).or_insert(i);
            }
        }
        let mut order: Vec<StorageId> = planned.iter().copied().collect();
        order.sort_by_key(|s| {
            let degree = graph.get(s).map_or(0, |n| n.len());
            (std::cmp::Reverse(degree), def_at.get(s).copied().unwrap_or(usize::MAX), *s)
        });

        let mut colors: Vec<Vec<StorageId>> = Vec::new();
        let mut color_of: BTreeMap<StorageId, usize> = BTreeMap::new();
        for s in order {
            let neighbours = graph.get(&s);
            let taken: BTreeSet<usize> = neighbours
                .map(|n| n.iter().filter_map(|o| color_of.get(o).copied()).collect())
                .unwrap_or_default();
            let color = if self.reuse {
                (0..).find(|c| !taken.contains(c)).unwrap_or(colors.len())
            } else {
                colors.len()
            };
            if color == colors.len() {
                colors.push(Vec::new());
            } else if let Some(&clash) = colors[color]
                .iter()
                .find(|m| neighbours.is_some_and(|n| n.contains(*m)))
            {
                return Err(Error::Internal(format!(
                    "storage {:?} and {:?} are live together but were given color {}",
                    s, clash, color
                )));
            }
            colors[color].push(s);
            color_of.insert(s, color);
        }

        let mut buffers = Vec::with_capacity(colors.len() + dedicated.len());
        let mut buffer_of = BTreeMap::new();
        for (color, members) in colors.into_iter().enumerate() {
            let size = members.iter().map(|s| info[s].bytes).max().unwrap_or(0);
            let elems = members.iter().map(|s| info[s].elems).max().unwrap_or(0);
            for &s in &members {
                buffer_of.insert(s, buffers.len());
            }
            buffers.push(Buffer {
                color,
                size,
                elems,
                views: members,
                dedicated: false,
            });
        }
        let num_colors = buffers.len();
        for v in dedicated {
            buffer_of.insert(v.storage, buffers.len());
            buffers.push(Buffer {
                color: buffers.len(),
                size: v.bytes,
                elems: v.elems,
                views: vec![v.storage],
                dedicated: true,
            });
        }

        let stats = PlanStats {
            num_instructions: instructions.len(),
            num_values: planned.len(),
            num_colors,
            num_reused: planned.len() - num_colors,
            naive_bytes: values.iter().map(|v| v.bytes).sum(),
            planned_bytes: buffers[..num_colors].iter().map(|b| b.size).sum(),
            dedicated_bytes: dedicated.iter().map(|v| v.bytes).sum(),
            num_fused_groups: groups.iter().filter(|r| r.len() > 1).count(),
            num_fused_instructions: groups.iter().filter(|r| r.len() > 1).map(|r| r.len()).sum(),
            plan_time_us: start.elapsed().as_micros() as u64,
        };
        log::debug!("{}", stats);

        Ok(MemoryPlan {
            buffers,
            buffer_of,
            groups,
            group_of,
            interference: graph,
            stats,
        })
    }
}
