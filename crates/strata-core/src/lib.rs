//! # strata-core
//!
//! Axes algebra, op-graph IR and reverse-mode autodiff for strata.
//!
//! This crate provides:
//! - [`Axis`] / [`Axes`]: named tensor dimensions and their set algebra
//! - [`TensorDescription`]: strided view of a buffer, addressed by axes
//! - [`GraphBuilder`]: arena of ops; every op constructor lives on it
//! - [`adjoints`] / [`deriv`]: gradients expressed as more graph ops
//! - [`simple_prune`]: algebraic clean-up before compilation
//!
//! Executing a graph is the job of a transformer (see the `strata` crate).

pub mod autodiff;
pub mod axes;
pub mod conv;
pub mod description;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod op;
pub mod ops;
pub mod prune;
pub mod tensor;

pub use autodiff::{adjoints, deriv, Adjoints};
pub use axes::{linear_map_axes, Axes, Axis, AxisId, AxisIdTuple, AxisKind, AxisSlice};
pub use conv::{ConvParams, PoolOp, PoolParams};
pub use description::{AxisPosition, LeafOffsets, SliceItem, StorageId, TensorDescription};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use graph::{CaptureGuard, GraphBuilder, Node, OpId, RngId, Tag};
pub use op::{BinaryOp, CmpOp, DotInfo, OpKind, RandomDist, ReduceOp, Schema, UnaryOp};
pub use ops::{CrossEntropyOptions, DotAxes, Reduction};
pub use prune::simple_prune;
pub use tensor::HostTensor;
