// Backend: the device a transformer lowers to
//
// A transformer owns the graph, the descriptions and the memory plan; a
// backend owns only storage and programs. Everything the transformer asks of
// a device goes through this trait:
//
//   allocation   empty (one buffer per planned color or dedicated value)
//   loading      nparray, rng_uniform_tensor, rng_normal_tensor, fill,
//                set_item
//   readback     read
//   execution    compile (once per computation), run (per call)
//   collectives  allreduce (optional)
//
// Descriptions passed in always refer to the buffer handed in alongside
// them, so a backend never needs to know about coloring.
//
// AllReduce goes through a Communicator. Ranks run the same program and
// block in allreduce_sum until every rank of the group has arrived; a rank
// that never arrives leaves the others waiting.

use std::sync::{Arc, Condvar, Mutex};

use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

use strata_core::description::TensorDescription;
use strata_core::error::{Error, Result};
use strata_core::tensor::HostTensor;

use super::lower::ExecUnit;
use super::plan::Buffer;
use super::transformer::TransformerConfig;

/// A device that stores buffers and runs lowered programs.
pub trait Backend {
    /// One physical buffer.
    type Storage;
    /// A compiled computation.
    type Program;

    fn name(&self) -> &'static str;

    /// Adopt transformer-wide settings before anything is allocated.
    fn configure(&mut self, _config: &TransformerConfig) {}

    /// Uninitialized storage for one planned buffer.
    fn empty(&mut self, buffer: &Buffer) -> Result<Self::Storage>;

    /// Copy `data` (row-major over `td`'s shape) into the view `td`.
    fn nparray(&mut self, storage: &mut Self::Storage, td: &TensorDescription, data: &HostTensor)
        -> Result<()>;

    fn rng_uniform_tensor(
        &mut self,
        storage: &mut Self::Storage,
        td: &TensorDescription,
        rng: &mut StdRng,
        low: f64,
        high: f64,
    ) -> Result<()> {
        if low >= high {
            return Err(Error::Configuration(format!(
                "uniform range [{}, {}) is empty",
                low, high
            )));
        }
        let dist = Uniform::new(low, high);
        let data: Vec<f64> = (0..td.size()).map(|_| dist.sample(rng)).collect();
        self.nparray(storage, td, &HostTensor::new(td.shape(), data)?)
    }

    fn rng_normal_tensor(
        &mut self,
        storage: &mut Self::Storage,
        td: &TensorDescription,
        rng: &mut StdRng,
        loc: f64,
        scale: f64,
    ) -> Result<()> {
        let dist = Normal::new(loc, scale)
            .map_err(|e| Error::Configuration(format!("normal({}, {}): {}", loc, scale, e)))?;
        let data: Vec<f64> = (0..td.size()).map(|_| dist.sample(rng)).collect();
        self.nparray(storage, td, &HostTensor::new(td.shape(), data)?)
    }

    /// Set every element of the view `td` to `value`.
    fn fill(&mut self, storage: &mut Self::Storage, td: &TensorDescription, value: f64) -> Result<()>;

    /// Like `nparray`, for values supplied at call time.
    fn set_item(&mut self, storage: &mut Self::Storage, td: &TensorDescription, data: &HostTensor)
        -> Result<()> {
        self.nparray(storage, td, data)
    }

    /// Row-major copy of the view `td`.
    fn read(&self, storage: &Self::Storage, td: &TensorDescription) -> Result<HostTensor>;

    fn compile(&mut self, name: &str, units: Vec<ExecUnit>) -> Result<Self::Program>;

    fn run(&mut self, program: &mut Self::Program, buffers: &mut [Self::Storage]) -> Result<()>;

    /// Sum `values` elementwise across every rank.
    fn allreduce(&mut self, _values: &mut [f64]) -> Result<()> {
        Err(Error::unsupported("all_reduce", self.name()))
    }
}

/// A group of ranks that can sum arrays together.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replace `values` with their elementwise sum over all ranks. Blocks
    /// until every rank has contributed.
    fn allreduce_sum(&self, values: &mut [f64]) -> Result<()>;
}

/// A world of one rank: allreduce is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn allreduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    departed: usize,
    sum: Vec<f64>,
    result: Vec<f64>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    round: Mutex<Round>,
    cond: Condvar,
}

/// One rank of an in-process group; ranks usually live on separate threads.
#[derive(Debug, Clone)]
pub struct ThreadCommunicator {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadCommunicator {
    /// Handles for every rank of a new group of `world_size`.
    pub fn group(world_size: usize) -> Vec<ThreadCommunicator> {
        let shared = Arc::new(Shared {
            world_size,
            round: Mutex::new(Round::default()),
            cond: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| ThreadCommunicator {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::msg("communicator lock poisoned")
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn allreduce_sum(&self, values: &mut [f64]) -> Result<()> {
        let shared = &self.shared;
        let mut round = shared.round.lock().map_err(poisoned)?;
        // A new round starts only after every rank has collected the last one.
        while round.departed != 0 {
            round = shared.cond.wait(round).map_err(poisoned)?;
        }
        if round.arrived == 0 {
            round.sum = vec![0.0; values.len()];
        } else if round.sum.len() != values.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![round.sum.len()],
                got: vec![values.len()],
            });
        }
        for (s, v) in round.sum.iter_mut().zip(values.iter()) {
            *s += v;
        }
        round.arrived += 1;
        let generation = round.generation;
        if round.arrived == shared.world_size {
            round.result = std::mem::take(&mut round.sum);
            round.arrived = 0;
            round.generation += 1;
            shared.cond.notify_all();
        } else {
            while round.generation == generation {
                round = shared.cond.wait(round).map_err(poisoned)?;
            }
        }
        values.copy_from_slice(&round.result);
        round.departed += 1;
        if round.departed == shared.world_size {
            round.departed = 0;
            shared.cond.notify_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_local_allreduce_is_identity() {
        let mut v = vec![1.0, 2.0];
        LocalCommunicator.allreduce_sum(&mut v).unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn test_thread_group_sums_over_rounds() {
        let handles: Vec<_> = ThreadCommunicator::group(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let mut out = Vec::new();
                    for round in 0..4 {
                        let mut v = vec![comm.rank() as f64, round as f64];
                        comm.allreduce_sum(&mut v).unwrap();
                        out.push(v);
                    }
                    out
                })
            })
            .collect();
        for h in handles {
            let out = h.join().unwrap();
            for (round, v) in out.iter().enumerate() {
                assert_eq!(v, &vec![3.0, 3.0 * round as f64]);
            }
        }
    }
}
