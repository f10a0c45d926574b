// Codegen Tests: kernel splitting, fusion and binding without a GPU
//
// Everything here runs on the host: kernels are generated, named and bound
// to made-up device addresses, and the tests look at the resulting launch
// lists and sources.

use strata::exec::{Operand, Primitive};
use strata_core::axes::{Axes, Axis, AxisSlice};
use strata_core::conv::PoolParams;
use strata_core::description::{SliceItem, StorageId, TensorDescription};
use strata_core::dtype::DType;
use strata_core::error::Error;
use strata_core::op::{BinaryOp, ReduceOp, UnaryOp};

use strata_cuda::codegen::{self, KernelCache, Schedule, Slot};
use strata_cuda::{Arg, Bound, GpuKernel, LaunchShape, Task};

fn operand(buffer: usize, axes: &[Axis], dtype: DType) -> Operand {
    Operand {
        buffer,
        td: TensorDescription::new(Axes::new(axes.to_vec()), dtype, StorageId(buffer as u32)),
    }
}

/// The same operand seen through `axes` (a permutation or broadcast).
fn reaxed(op: &Operand, axes: &[Axis]) -> Operand {
    Operand {
        buffer: op.buffer,
        td: op.td.reaxe(&Axes::new(axes.to_vec()), true).unwrap(),
    }
}

fn ab() -> (Axis, Axis) {
    (Axis::named("A", 3), Axis::named("B", 4))
}

/// exp(x) + x -> out, with the temporary in its own buffer.
fn chain(first_buffer: usize) -> Vec<Primitive> {
    let (a, b) = ab();
    let x = operand(first_buffer, &[a.clone(), b.clone()], DType::F32);
    let t = operand(first_buffer + 1, &[a.clone(), b.clone()], DType::F32);
    let out = operand(first_buffer + 2, &[a, b], DType::F32);
    vec![
        Primitive::Unary {
            op: UnaryOp::Exp,
            x: x.clone(),
            out: t.clone(),
        },
        Primitive::Binary {
            op: BinaryOp::Add,
            x: t,
            y: x,
            out,
        },
    ]
}

fn launches(kernel: &GpuKernel) -> Vec<&strata_cuda::Launch> {
    kernel
        .tasks()
        .iter()
        .filter_map(|t| match t {
            Task::Launch(l) => Some(l),
            Task::AllReduce { .. } => None,
        })
        .collect()
}

#[test]
fn test_elementwise_chain_is_one_parallel_kernel() {
    let steps = chain(0);
    let refs: Vec<&Primitive> = steps.iter().collect();
    let generated = codegen::generate(&refs).unwrap();
    assert_eq!(generated.schedule, Schedule::Parallel);
    // x is read twice through one view.
    assert_eq!(generated.params.len(), 3);
    assert_eq!(generated.work, 12);
    assert_eq!(generated.ops(), &["exp", "add"]);

    let mut cache = KernelCache::new();
    let (name, new) = cache.name(&generated);
    assert!(new);
    let source = cache.source(&name).unwrap();
    assert!(source.contains(&format!("void {}(", name)));
    assert!(source.contains("exp(ld_f32(p0, "));
    assert!(source.contains("st_f32(p1, "));
    assert!(!source.contains("__syncthreads"));
}

#[test]
fn test_cache_reuses_bodies_across_buffers() {
    let mut cache = KernelCache::new();
    let mut first = GpuKernel::new("first");
    for step in chain(0) {
        first.add_op(step);
    }
    let mut second = GpuKernel::new("second");
    for step in chain(5) {
        second.add_op(step);
    }
    assert_eq!(first.generate(&mut cache).unwrap().len(), 1);
    assert!(second.generate(&mut cache).unwrap().is_empty());
    assert_eq!(cache.len(), 1);
    assert_eq!(launches(&first)[0].function, launches(&second)[0].function);
    assert_ne!(launches(&first)[0].args, launches(&second)[0].args);
}

#[test]
fn test_transposed_read_of_a_fresh_value_is_staged() {
    let (a, b) = ab();
    let x = operand(0, &[a.clone(), b.clone()], DType::F64);
    let t = operand(1, &[a.clone(), b.clone()], DType::F64);
    let out = operand(2, &[b.clone(), a.clone()], DType::F64);
    let steps = [
        Primitive::Unary {
            op: UnaryOp::Tanh,
            x,
            out: t.clone(),
        },
        Primitive::Copy {
            x: reaxed(&t, &[b, a]),
            out,
        },
    ];
    let refs: Vec<&Primitive> = steps.iter().collect();
    let generated = codegen::generate(&refs).unwrap();
    assert_eq!(generated.schedule, Schedule::Staged);

    let mut cache = KernelCache::new();
    let (name, _) = cache.name(&generated);
    assert_eq!(cache.source(&name).unwrap().matches("__syncthreads").count(), 1);
}

#[test]
fn test_reduction_after_elementwise_is_staged() {
    let (a, b) = ab();
    let x = operand(0, &[a.clone(), b.clone()], DType::F32);
    let sq = operand(1, &[a.clone(), b.clone()], DType::F32);
    let out = operand(2, &[b], DType::F32);
    let steps = [
        Primitive::Unary {
            op: UnaryOp::Square,
            x,
            out: sq.clone(),
        },
        Primitive::Reduce {
            op: ReduceOp::Sum,
            x: sq,
            out,
        },
    ];
    let refs: Vec<&Primitive> = steps.iter().collect();
    let generated = codegen::generate(&refs).unwrap();
    assert_eq!(generated.schedule, Schedule::Staged);
    assert_eq!(generated.work, 12);

    // A lone reduction runs in parallel, one thread per output element.
    let alone = codegen::generate(&refs[1..]).unwrap();
    assert_eq!(alone.schedule, Schedule::Parallel);
    assert_eq!(alone.work, 4);
}

#[test]
fn test_native_dot_stages_strided_operand() {
    let m = Axis::named("M", 2);
    let k = Axis::named("K", 3);
    let n = Axis::named("N", 4);
    let x_base = operand(0, &[k.clone(), m.clone()], DType::F64);
    let x = reaxed(&x_base, &[m.clone(), k.clone()]);
    let y = operand(1, &[k, n.clone()], DType::F64);
    let out = operand(2, &[m, n], DType::F64);

    let mut kernel = GpuKernel::new("dot");
    kernel.add_op(Primitive::Dot { x, y, out });
    assert!(kernel.generate(&mut KernelCache::new()).unwrap().is_empty());
    assert!(kernel.is_compound());
    assert_eq!(kernel.scratch(), &[6 * 8]);

    let l = launches(&kernel);
    assert_eq!(l.len(), 2);
    assert_eq!(l[0].function, "copy_strided_f64");
    assert_eq!(l[0].meta, vec![2, 6, 2, 3, 1, 2, 3, 1]);
    assert_eq!(l[1].function, "matmul_f64");
    assert_eq!(l[1].meta, vec![2, 3, 4]);
    assert_eq!(l[1].shape, LaunchShape::Tiled { rows: 2, cols: 4 });
    match &l[1].args[0] {
        Arg::View(v) => assert_eq!(v.slot, Slot::Scratch(0)),
        other => panic!("unexpected {:?}", other),
    }

    assert!(!kernel.is_bound());
    kernel
        .bind_buffers(&[1000, 2000, 3000], &[5000], &[7000, 8000])
        .unwrap();
    let bound = kernel.bound().unwrap();
    assert_eq!(bound[0], vec![Bound::Ptr(1000), Bound::Ptr(5000), Bound::Ptr(7000)]);
    assert_eq!(
        bound[1],
        vec![Bound::Ptr(5000), Bound::Ptr(2000), Bound::Ptr(3000), Bound::Ptr(8000)]
    );
}

#[test]
fn test_binding_folds_view_offsets() {
    let a = Axis::named("A", 4);
    let base = operand(0, &[a], DType::F32);
    let sliced = Axes::new([Axis::sliced(&base.td.axes()[0], AxisSlice::reversed()).unwrap()]);
    let rev = Operand {
        buffer: 0,
        td: base
            .td
            .slice(&[SliceItem::Range(AxisSlice::reversed())], &sliced)
            .unwrap(),
    };
    let out = operand(1, &[rev.td.axes()[0].clone()], DType::F32);
    let mut kernel = GpuKernel::new("reverse");
    kernel.add_op(Primitive::Copy { x: rev, out });
    kernel.generate(&mut KernelCache::new()).unwrap();
    kernel.bind_buffers(&[1 << 20, 2 << 20], &[], &[0]).unwrap();
    let bound = &kernel.bound().unwrap()[0];
    // The reversed view starts at its last element.
    assert!(bound.contains(&Bound::Ptr((1 << 20) + 12)));
    assert!(bound.contains(&Bound::Ptr(2 << 20)));
}

#[test]
fn test_pool_and_allreduce_tasks() {
    let dims = [("C", 1), ("D", 1), ("H", 4), ("W", 4), ("N", 2)];
    let input_axes: Vec<Axis> = dims.iter().map(|&(n, l)| Axis::named(n, l)).collect();
    let out_axes: Vec<Axis> = [("C", 1), ("D", 1), ("H", 2), ("W", 2), ("N", 2)]
        .iter()
        .map(|&(n, l)| Axis::named(n, l))
        .collect();
    let input = operand(0, &input_axes, DType::F32);
    let argmax = operand(1, &out_axes, DType::I64);
    let out = operand(2, &out_axes, DType::F32);
    let summed = operand(3, &out_axes, DType::F32);

    let mut kernel = GpuKernel::new("pool");
    kernel.add_op(Primitive::Pool {
        input,
        argmax,
        out: out.clone(),
        params: PoolParams::max([1, 1, 2, 2]).with_stride([1, 1, 2, 2]),
    });
    kernel.add_op(Primitive::AllReduce { x: out, out: summed });
    kernel.generate(&mut KernelCache::new()).unwrap();

    assert_eq!(kernel.tasks().len(), 2);
    let l = launches(&kernel);
    assert_eq!(l[0].function, "pool_fprop_f32");
    assert_eq!(l[0].meta.len(), 22);
    assert_eq!(l[0].meta[..9], [1, 1, 4, 4, 2, 1, 1, 2, 2]);
    assert_eq!(l[0].meta[21], 0);
    assert!(matches!(kernel.tasks()[1], Task::AllReduce { .. }));

    kernel.bind_buffers(&[1, 2, 3, 4], &[], &[100, 0]).unwrap();
    assert!(kernel.bound().unwrap()[1].is_empty());
}

#[test]
fn test_half_precision_natives_are_unsupported() {
    let k = Axis::named("K", 3);
    let x = operand(0, &[k.clone()], DType::F16);
    let y = operand(1, &[k], DType::F16);
    let out = operand(2, &[], DType::F16);
    let mut kernel = GpuKernel::new("dot16");
    kernel.add_op(Primitive::Dot { x, y, out });
    let err = kernel.generate(&mut KernelCache::new()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation { .. }));
}

#[test]
fn test_mixed_generated_and_native_steps_split_into_runs() {
    let m = Axis::named("M", 2);
    let k = Axis::named("K", 2);
    let n = Axis::named("N", 3);
    let x = operand(0, &[m.clone(), k.clone()], DType::F32);
    let t = operand(1, &[m.clone(), k.clone()], DType::F32);
    let w = operand(2, &[k, n.clone()], DType::F32);
    let d = operand(3, &[m.clone(), n.clone()], DType::F32);
    let e = operand(4, &[m, n], DType::F32);
    let mut kernel = GpuKernel::new("mixed");
    kernel.add_op(Primitive::Unary {
        op: UnaryOp::Sin,
        x,
        out: t.clone(),
    });
    kernel.add_op(Primitive::Dot {
        x: t,
        y: w,
        out: d.clone(),
    });
    kernel.add_op(Primitive::Unary {
        op: UnaryOp::Cos,
        x: d,
        out: e,
    });
    let fresh = kernel.generate(&mut KernelCache::new()).unwrap();
    assert_eq!(fresh.len(), 2);
    let names: Vec<&str> = launches(&kernel).iter().map(|l| l.function.as_str()).collect();
    assert_eq!(names.len(), 3);
    assert_eq!(names[1], "matmul_f32");
    assert!(names[0].ends_with("_sin") && names[2].ends_with("_cos"));
}
