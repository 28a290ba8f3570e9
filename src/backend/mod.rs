//! Compute backend storage pools
//!
//! A backend owns the physical data behind tensor ids. The engine talks to
//! it through four primitives: `register`, `write`, `read`, `dispose`. The
//! reference [`CpuBackend`] stores eagerly; the [`AccelBackend`] simulates a
//! device-style pipeline with delayed materialization and a buffer pool.

pub mod accel;
pub mod cpu;
pub mod pool;

pub use accel::AccelBackend;
pub use cpu::CpuBackend;
pub use pool::{PoolConfig, ResourcePool};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::{DType, TensorData};

/// Storage counters reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReport {
    /// Registered, non-disposed tensor ids
    pub registered: usize,
    /// Ids whose physical storage is currently materialized
    pub materialized: usize,
    /// Free buffers waiting in the resource pool
    pub pool_free: usize,
    /// Peak number of physical buffers alive at once
    pub peak_physical: usize,
    /// Bytes held by materialized storage
    pub bytes: usize,
}

/// Storage pool interface every compute backend implements.
///
/// Exactly one backend holds the live data for a given tensor id at a time.
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Announce a tensor id and its format. No physical storage is required
    /// to exist yet.
    fn register(&mut self, id: u64, shape: &[usize], dtype: DType);

    /// Replace the logical contents of `id`. A backend with a materialized
    /// physical copy must release it before accepting the new data, so stale
    /// device memory is never read.
    fn write(&mut self, id: u64, data: TensorData) -> Result<()>;

    /// Read the contents of `id`, materializing physical storage if needed
    fn read(&mut self, id: u64) -> Result<TensorData>;

    /// Release all storage for `id`. Unknown ids are ignored.
    fn dispose(&mut self, id: u64);

    fn memory(&self) -> MemoryReport;
}
