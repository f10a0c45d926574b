// Device: the CUDA implementation of Backend
//
// Storage is one CudaSlice<u8> per planned buffer. A program is a list of
// GpuKernels plus the device memory they own: scratch slots and the meta
// arrays of native launches, both allocated at compile time.
//
// Kernels are bound to buffer addresses lazily, on the first run and again
// whenever the transformer hands in different buffers. Every run ends with
// a device synchronize, so results are visible to read() as soon as run()
// returns.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::sys::CUdevice_attribute_enum;
use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};

use strata::exec::{Backend, Buffer, Communicator, ExecUnit, LocalCommunicator, Operand};
use strata_core::description::TensorDescription;
use strata_core::error::{Error, Result};
use strata_core::tensor::HostTensor;

use crate::codegen::{KernelCache, View};
use crate::kernel::{fill_launch, launch_dims, Bound, GpuKernel, Launch, Task};
use crate::kernels::{self, NATIVE_MODULE};
use crate::memory;
use crate::GpuConfig;

fn device_err(what: &str) -> impl FnOnce(cudarc::driver::DriverError) -> Error + '_ {
    move |e| Error::Device(format!("{}: {}", what, e))
}

/// A computation compiled for one device.
pub struct GpuProgram {
    name: String,
    kernels: Vec<GpuKernel>,
    scratch: Vec<Vec<CudaSlice<u8>>>,
    /// Per kernel, per task.
    meta: Vec<Vec<Option<CudaSlice<i64>>>>,
    /// Buffer addresses the kernels were last bound to.
    bound_to: Vec<u64>,
}

impl GpuProgram {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernels(&self) -> &[GpuKernel] {
        &self.kernels
    }

    /// Kernel launches per run.
    pub fn launch_count(&self) -> usize {
        self.kernels
            .iter()
            .flat_map(|k| k.tasks())
            .filter(|t| matches!(t, Task::Launch(_)))
            .count()
    }
}

/// CUDA backend over one device.
pub struct GpuBackend {
    dev: Arc<CudaDevice>,
    config: GpuConfig,
    arch: &'static str,
    cache: KernelCache,
    loaded: HashSet<String>,
    communicator: Arc<dyn Communicator>,
}

impl GpuBackend {
    /// Open device `config.ordinal` and build the native library for it.
    pub fn new(config: GpuConfig) -> Result<Self> {
        let dev = CudaDevice::new(config.ordinal).map_err(device_err("CUDA device creation failed"))?;
        // Target the device's own SASS (sm_XX) rather than compute_XX PTX so
        // toolkit and driver PTX versions never have to agree.
        let major = dev
            .attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .map_err(device_err("compute capability"))?;
        let minor = dev
            .attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .map_err(device_err("compute capability"))?;
        let arch: &'static str = Box::leak(format!("sm_{}{}", major, minor).into_boxed_str());
        let mut backend = GpuBackend {
            dev,
            config,
            arch,
            cache: KernelCache::new(),
            loaded: HashSet::new(),
            communicator: Arc::new(LocalCommunicator),
        };
        let names: Vec<&'static str> = kernels::native_names()
            .into_iter()
            .map(|n| &*Box::leak(n.into_boxed_str()))
            .collect();
        backend.load(NATIVE_MODULE, &kernels::native_source(), &names)?;
        log::info!("cuda: device {} ({}) ready", config.ordinal, arch);
        Ok(backend)
    }

    pub fn with_communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = communicator;
        self
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    /// Fused kernels compiled so far.
    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    fn load(&mut self, module: &str, source: &str, functions: &[&'static str]) -> Result<()> {
        let opts = CompileOptions {
            arch: Some(self.arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(source, opts)
            .map_err(|e| Error::Device(format!("NVRTC compilation of {} failed: {}", module, e)))?;
        self.dev
            .load_ptx(ptx, module, functions)
            .map_err(device_err("PTX load failed"))?;
        self.loaded.insert(module.to_string());
        log::debug!("cuda: loaded module {} ({} function(s))", module, functions.len());
        Ok(())
    }

    fn launch(&self, launch: &Launch, bound: &[Bound]) -> Result<()> {
        let func = self
            .dev
            .get_func(&launch.module, &launch.function)
            .ok_or_else(|| Error::Device(format!("kernel {} not loaded", launch.function)))?;
        let (grid_dim, block_dim) = launch_dims(launch.shape, self.config.block_size);
        let cfg = LaunchConfig {
            grid_dim,
            block_dim,
            shared_mem_bytes: launch.shared_size,
        };
        // The driver reads each argument through a pointer to its value.
        let mut values: Vec<Bound> = bound.to_vec();
        let mut params: Vec<*mut c_void> = values
            .iter_mut()
            .map(|b| match b {
                Bound::Ptr(p) => p as *mut u64 as *mut c_void,
                Bound::F64(v) => v as *mut f64 as *mut c_void,
            })
            .collect();
        unsafe { func.launch(cfg, &mut params[..]) }
            .map_err(|e| Error::Device(format!("launch {}: {}", launch.function, e)))
    }

    fn download(&self, storage: &CudaSlice<u8>) -> Result<Vec<u8>> {
        self.dev.dtoh_sync_copy(storage).map_err(device_err("device to host copy"))
    }

    fn upload(&self, bytes: &[u8], storage: &mut CudaSlice<u8>) -> Result<()> {
        self.dev
            .htod_sync_copy_into(bytes, storage)
            .map_err(device_err("host to device copy"))
    }

    fn all_reduce(&mut self, x: &Operand, out: &Operand, buffers: &mut [CudaSlice<u8>]) -> Result<()> {
        let src = buffers
            .get(x.buffer)
            .ok_or_else(|| Error::Internal(format!("all_reduce reads missing buffer {}", x.buffer)))?;
        let mut values = memory::read_view(&self.download(src)?, &x.td)?;
        self.communicator.allreduce_sum(&mut values)?;
        let dst = buffers
            .get_mut(out.buffer)
            .ok_or_else(|| Error::Internal(format!("all_reduce writes missing buffer {}", out.buffer)))?;
        let mut bytes = self.download(dst)?;
        memory::write_view(&mut bytes, &out.td, &values)?;
        self.upload(&bytes, dst)
    }
}

impl Backend for GpuBackend {
    type Storage = CudaSlice<u8>;
    type Program = GpuProgram;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn empty(&mut self, buffer: &Buffer) -> Result<CudaSlice<u8>> {
        self.dev
            .alloc_zeros::<u8>(buffer.size.max(1))
            .map_err(device_err("buffer allocation"))
    }

    fn nparray(&mut self, storage: &mut CudaSlice<u8>, td: &TensorDescription, data: &HostTensor) -> Result<()> {
        if data.elem_count() != td.size() {
            return Err(Error::ShapeMismatch {
                expected: td.shape(),
                got: data.shape().to_vec(),
            });
        }
        let mut bytes = self.download(storage)?;
        memory::write_view(&mut bytes, td, data.data())?;
        self.upload(&bytes, storage)
    }

    fn fill(&mut self, storage: &mut CudaSlice<u8>, td: &TensorDescription, value: f64) -> Result<()> {
        let view = View::of(&Operand {
            buffer: 0,
            td: td.clone(),
        });
        match fill_launch(&view, value) {
            Ok(launch) => {
                let meta = self.dev.htod_copy(launch.meta.clone()).map_err(device_err("meta upload"))?;
                let base = *storage.device_ptr();
                let addr = base
                    .checked_add_signed(view.byte_offset() as i64)
                    .ok_or_else(|| Error::Internal(format!("fill offset {} underflows", view.offset)))?;
                let bound = [Bound::Ptr(addr), Bound::F64(value), Bound::Ptr(*meta.device_ptr())];
                self.launch(&launch, &bound)?;
                self.dev.synchronize().map_err(device_err("synchronize"))
            }
            // No native fill for this dtype; edit the bytes on the host.
            Err(_) => {
                let mut bytes = self.download(storage)?;
                memory::write_view(&mut bytes, td, &vec![value; td.size()])?;
                self.upload(&bytes, storage)
            }
        }
    }

    fn read(&self, storage: &CudaSlice<u8>, td: &TensorDescription) -> Result<HostTensor> {
        let data = memory::read_view(&self.download(storage)?, td)?;
        Ok(HostTensor::new(td.shape(), data)?.with_dtype(td.dtype()))
    }

    fn compile(&mut self, name: &str, units: Vec<ExecUnit>) -> Result<GpuProgram> {
        let mut program = GpuProgram {
            name: name.to_string(),
            kernels: Vec::with_capacity(units.len()),
            scratch: Vec::with_capacity(units.len()),
            meta: Vec::with_capacity(units.len()),
            bound_to: Vec::new(),
        };
        for (i, unit) in units.into_iter().enumerate() {
            let mut kernel = GpuKernel::new(format!("{}[{}]", name, i));
            for step in unit.steps {
                kernel.add_op(step);
            }
            for fresh in kernel.generate(&mut self.cache)? {
                if self.loaded.contains(&fresh) {
                    continue;
                }
                let body = self
                    .cache
                    .source(&fresh)
                    .ok_or_else(|| Error::Internal(format!("kernel {} has no source", fresh)))?;
                let source = kernels::fused_source(body);
                let function: &'static str = Box::leak(fresh.clone().into_boxed_str());
                self.load(&fresh, &source, &[function])?;
            }
            let scratch = kernel
                .scratch()
                .iter()
                .map(|&bytes| self.dev.alloc_zeros::<u8>(bytes).map_err(device_err("scratch allocation")))
                .collect::<Result<Vec<_>>>()?;
            let meta = kernel
                .tasks()
                .iter()
                .map(|task| match task {
                    Task::Launch(l) if !l.meta.is_empty() => self
                        .dev
                        .htod_copy(l.meta.clone())
                        .map(Some)
                        .map_err(device_err("meta upload")),
                    _ => Ok(None),
                })
                .collect::<Result<Vec<_>>>()?;
            program.kernels.push(kernel);
            program.scratch.push(scratch);
            program.meta.push(meta);
        }
        log::debug!(
            "cuda: compiled {} into {} launch(es), {} cached kernel(s)",
            name,
            program.launch_count(),
            self.cache.len()
        );
        Ok(program)
    }

    fn run(&mut self, program: &mut GpuProgram, buffers: &mut [CudaSlice<u8>]) -> Result<()> {
        let addrs: Vec<u64> = buffers.iter().map(|b| *b.device_ptr()).collect();
        if program.bound_to != addrs || program.kernels.iter().any(|k| !k.is_bound()) {
            for ((kernel, scratch), meta) in program.kernels.iter_mut().zip(&program.scratch).zip(&program.meta) {
                let scratch: Vec<u64> = scratch.iter().map(|s| *s.device_ptr()).collect();
                let meta: Vec<u64> = meta.iter().map(|m| m.as_ref().map_or(0, |m| *m.device_ptr())).collect();
                kernel.bind_buffers(&addrs, &scratch, &meta)?;
            }
            program.bound_to = addrs;
            log::trace!("cuda: bound {} to {} buffer(s)", program.name, program.bound_to.len());
        }
        for kernel in &program.kernels {
            let bound = kernel
                .bound()
                .ok_or_else(|| Error::Internal(format!("{} ran unbound", kernel.name())))?;
            for (task, args) in kernel.tasks().iter().zip(bound) {
                match task {
                    Task::Launch(launch) => self.launch(launch, args)?,
                    Task::AllReduce { x, out } => {
                        self.dev.synchronize().map_err(device_err("synchronize"))?;
                        self.all_reduce(x, out, buffers)?;
                    }
                }
            }
        }
        self.dev.synchronize().map_err(device_err("synchronize"))
    }

    fn allreduce(&mut self, values: &mut [f64]) -> Result<()> {
        self.communicator.allreduce_sum(values)
    }
}
