//! # strata
//!
//! A tensor computation compiler: build a graph of axis-typed ops,
//! differentiate it, plan its memory and run it.
//!
//! This is the facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use strata::prelude::*;
//!
//! # fn main() -> strata::Result<()> {
//! let mut g = GraphBuilder::new();
//! let c = Axis::named("C", 2);
//! let x = g.placeholder([c]);
//! let y = g.square(x);
//! let mut t = Transformer::new(g, HostBackend::new(), TransformerConfig::default());
//! let f = t.computation(y, &[x])?;
//! let out = t.call(f, &[HostTensor::new(vec![2], vec![3.0, 4.0])?.into()])?;
//! assert_eq!(out.into_single()?.data(), &[9.0, 16.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `strata-core` | Axes, tensor descriptions, op graph, autodiff, pruning |
//! | `strata` | Memory planning, lowering, transformers, host interpreter |
//! | `strata-cuda` | Fused CUDA kernel generation and the GPU backend (feature-gated) |

/// Re-export core types.
pub use strata_core::{
    adjoints, deriv, simple_prune, Axes, Axis, AxisSlice, ConvParams, DType, Error, GraphBuilder,
    HostTensor, OpId, OpKind, PoolParams, Reduction, Result, SliceItem, TensorDescription,
};

/// The core crate, for everything not re-exported at the top level.
pub mod core {
    pub use strata_core::*;
}

/// Planning, lowering and running computations.
pub mod exec;

pub use exec::{
    Backend, ComputationId, HostBackend, MemoryPlan, MemoryPlanner, Output, Returns, Transformer,
    TransformerConfig, Value,
};

/// Everything needed to build and run a graph.
pub mod prelude {
    pub use strata_core::{
        deriv, Axes, Axis, AxisSlice, ConvParams, CrossEntropyOptions, DType, DotAxes, GraphBuilder,
        HostTensor, OpId, PoolParams, Reduction, SliceItem,
    };

    pub use crate::exec::{
        Backend, ComputationId, HostBackend, Output, Returns, Transformer, TransformerConfig, Value,
    };
}
