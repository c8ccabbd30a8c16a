//! Thread pools for flush and compaction work.

use crate::error::{Result, VirtaError};
use std::sync::Arc;

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs closures on background threads.
///
/// Stores receive an executor at construction instead of spawning threads
/// themselves, so the embedding process decides how work is scheduled.
pub trait TaskExecutor: Send + Sync {
    /// Queues a task. Returns immediately.
    fn submit(&self, task: Task);
}

/// A named rayon thread pool.
pub struct RayonExecutor {
    name: String,
    pool: rayon::ThreadPool,
}

impl RayonExecutor {
    /// Creates a pool with `threads` workers (at least one).
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let thread_name = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(move |i| format!("{}-{}", thread_name, i))
            .build()
            .map_err(|e| VirtaError::Internal(format!("cannot build {} pool: {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    /// Creates a shared pool.
    pub fn shared(name: &str, threads: usize) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(name, threads)?))
    }

    /// Runs `op` inside the pool and waits for it, so rayon parallel
    /// iterators used by `op` run on this pool's workers.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of worker threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskExecutor for RayonExecutor {
    fn submit(&self, task: Task) {
        self.pool.spawn(task);
    }
}

impl std::fmt::Debug for RayonExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonExecutor")
            .field("name", &self.name)
            .field("threads", &self.threads())
            .finish()
    }
}
