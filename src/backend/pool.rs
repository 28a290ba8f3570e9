//! Pooled physical buffers for the accelerated backend
//!
//! Fixed-format buffers are expensive to allocate on a device, so disposal
//! returns them to a free list keyed by `(shape, dtype)` instead of freeing
//! them. A later acquisition of the same class is served from the list.

use std::collections::HashMap;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::tensor::{DType, TensorData};

/// Pool tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Free buffers retained per `(shape, dtype)` class; excess is freed on
    /// release instead of pooled
    pub max_free_per_class: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_free_per_class: 32,
        }
    }
}

impl PoolConfig {
    /// Set the per-class free-list capacity
    pub fn with_max_free_per_class(mut self, max_free_per_class: usize) -> Self {
        self.max_free_per_class = max_free_per_class;
        self
    }
}

/// One physical buffer slot, standing in for a single device allocation
#[derive(Debug)]
pub struct PoolBuffer {
    data: TensorData,
}

impl PoolBuffer {
    /// Upload new contents into the buffer
    pub(crate) fn fill(&mut self, data: TensorData) {
        self.data = data;
    }

    pub(crate) fn contents(&self) -> &TensorData {
        &self.data
    }
}

/// Reusable physical buffers keyed by `(shape, dtype)` class
#[derive(Debug)]
pub struct ResourcePool {
    config: PoolConfig,
    free: HashMap<(Vec<usize>, DType), Vec<PoolBuffer>>,
    acquired: usize,
    num_buffers: usize,
    peak_buffers: usize,
}

impl ResourcePool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            free: HashMap::new(),
            acquired: 0,
            num_buffers: 0,
            peak_buffers: 0,
        }
    }

    /// Take a buffer of the given class, reusing a pooled one when possible
    pub fn acquire(&mut self, shape: &[usize], dtype: DType) -> PoolBuffer {
        let key = (shape.to_vec(), dtype);
        self.acquired += 1;
        if let Some(buffer) = self.free.get_mut(&key).and_then(|list| list.pop()) {
            trace!("pool: reusing {shape:?}/{dtype:?} buffer");
            return buffer;
        }
        self.num_buffers += 1;
        self.peak_buffers = self.peak_buffers.max(self.num_buffers);
        debug!(
            "pool: allocating {shape:?}/{dtype:?} buffer ({} live)",
            self.num_buffers
        );
        PoolBuffer {
            data: TensorData::zeros(shape, dtype),
        }
    }

    /// Return a buffer to its class's free list, or free it when the list is
    /// at capacity
    pub fn release(&mut self, shape: &[usize], dtype: DType, buffer: PoolBuffer) {
        self.acquired -= 1;
        let list = self.free.entry((shape.to_vec(), dtype)).or_default();
        if list.len() < self.config.max_free_per_class {
            list.push(buffer);
        } else {
            self.num_buffers -= 1;
            trace!("pool: freeing {shape:?}/{dtype:?} buffer, class is full");
        }
    }

    /// Buffers currently handed out
    pub fn acquired_count(&self) -> usize {
        self.acquired
    }

    /// Buffers waiting on free lists
    pub fn free_count(&self) -> usize {
        self.free.values().map(|list| list.len()).sum()
    }

    /// Peak of concurrently existing buffers
    pub fn peak(&self) -> usize {
        self.peak_buffers
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
