//! Bounded worker execution on rayon

use rayon::prelude::*;
use std::ops::Range;

pub use rayon::ThreadPoolBuildError as PoolBuildError;

/// How work units are spread over threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    /// Everything on the calling thread
    Sequential,
    /// The global rayon pool
    #[default]
    Parallel,
    /// A dedicated pool with this many workers
    ParallelWith(usize),
}

impl ProcessingMode {
    /// Mode for a concurrency limit. A limit of one runs on the calling
    /// thread; zero means "use the global pool".
    pub fn from_concurrency(limit: usize) -> Self {
        match limit {
            0 => ProcessingMode::Parallel,
            1 => ProcessingMode::Sequential,
            n => ProcessingMode::ParallelWith(n),
        }
    }

    /// Upper bound on simultaneously running units
    pub fn threads(&self) -> usize {
        match self {
            ProcessingMode::Sequential => 1,
            ProcessingMode::Parallel => num_cpus(),
            ProcessingMode::ParallelWith(n) => (*n).max(1),
        }
    }
}

/// Index-driven execution under a [`ProcessingMode`]
pub trait ParallelStrategy {
    /// Run `f` once per index. Completion order is unspecified for the
    /// parallel modes.
    fn par_for_each<F>(&self, range: Range<usize>, f: F) -> Result<(), PoolBuildError>
    where
        F: Fn(usize) + Sync + Send;
}

impl ParallelStrategy for ProcessingMode {
    fn par_for_each<F>(&self, range: Range<usize>, f: F) -> Result<(), PoolBuildError>
    where
        F: Fn(usize) + Sync + Send,
    {
        match *self {
            ProcessingMode::Sequential => range.for_each(f),
            ProcessingMode::Parallel => range.into_par_iter().for_each(f),
            ProcessingMode::ParallelWith(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("phytostat-worker-{i}"))
                .build()?
                .install(|| range.into_par_iter().for_each(f)),
        }
        Ok(())
    }
}

/// Threads in the global rayon pool
pub fn num_cpus() -> usize {
    rayon::current_num_threads()
}
