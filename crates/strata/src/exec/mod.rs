// Exec: planning, lowering and running computations
//
// The pipeline from a built graph to results:
//
//   GraphBuilder -> Transformer::finalize
//                     prune, order, describe (lower::Descriptions)
//                     plan memory (plan::MemoryPlanner)
//                -> Transformer::allocate
//                     buffers and loads through the Backend
//                     lower ops to primitives (lower::Lowering), compile
//                -> Transformer::call
//                     copy arguments in, run, read results out
//
// HostBackend interprets the primitives directly; engine holds its
// convolution and pooling kernels. Device backends implement the same
// Backend trait in their own crates.
//
// USAGE:
//   let mut t = Transformer::new(graph, HostBackend::new(), TransformerConfig::default());
//   let f = t.computation(y, &[x])?;
//   let out = t.call(f, &[input.into()])?.into_single()?;

pub mod backend;
pub mod engine;
pub mod host;
pub mod lower;
pub mod plan;
pub mod transformer;

pub use backend::{Backend, Communicator, LocalCommunicator, ThreadCommunicator};
pub use host::{HostBackend, HostProgram};
pub use lower::{Descriptions, ExecUnit, Lowering, Operand, Primitive};
pub use plan::{Buffer, Dataflow, Instruction, MemoryPlan, MemoryPlanner, PlanStats};
pub use transformer::{ComputationId, Output, Returns, State, Transformer, TransformerConfig, Value};
