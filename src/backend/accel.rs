//! Accelerated backend with delayed materialization
//!
//! Models a device-style backend independent of any graphics API: a write
//! only updates a logical shadow copy, and a physical buffer is acquired
//! from the resource pool the first time a read forces materialization.
//! Each id is a two-state record `{logical, physical}`; materialization is
//! the pure transition `{Some(data), None} -> {None, Some(buffer)}`.

use std::collections::HashMap;

use log::trace;

use crate::error::{Error, Result};
use crate::tensor::{DType, TensorData};

use super::pool::{PoolBuffer, PoolConfig, ResourcePool};
use super::{Backend, MemoryReport};

#[derive(Debug)]
struct AccelSlot {
    shape: Vec<usize>,
    dtype: DType,
    logical: Option<TensorData>,
    physical: Option<PoolBuffer>,
}

/// Pool-backed backend with lazy physical materialization
#[derive(Debug)]
pub struct AccelBackend {
    slots: HashMap<u64, AccelSlot>,
    pool: ResourcePool,
}

impl AccelBackend {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            slots: HashMap::new(),
            pool: ResourcePool::new(config),
        }
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Acquire and fill the physical buffer for a slot, if it has none.
    /// Reading an id that was never written materializes zeros.
    fn materialize(slot: &mut AccelSlot, pool: &mut ResourcePool) {
        if slot.physical.is_some() {
            return;
        }
        let data = slot
            .logical
            .take()
            .unwrap_or_else(|| TensorData::zeros(&slot.shape, slot.dtype));
        let mut buffer = pool.acquire(&slot.shape, slot.dtype);
        buffer.fill(data);
        slot.physical = Some(buffer);
    }
}

impl Default for AccelBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for AccelBackend {
    fn name(&self) -> &'static str {
        "accel"
    }

    fn register(&mut self, id: u64, shape: &[usize], dtype: DType) {
        self.slots.insert(
            id,
            AccelSlot {
                shape: shape.to_vec(),
                dtype,
                logical: None,
                physical: None,
            },
        );
    }

    fn write(&mut self, id: u64, data: TensorData) -> Result<()> {
        let slot = self.slots.get_mut(&id).ok_or(Error::DisposedTensor(id))?;
        if data.dtype() != slot.dtype {
            return Err(Error::InvalidDType(format!(
                "tensor {id} is registered as {:?}, write carried {:?}",
                slot.dtype,
                data.dtype()
            )));
        }
        if data.shape() != slot.shape {
            return Err(Error::ShapeMismatch {
                expected: slot.shape.clone(),
                got: data.shape(),
            });
        }
        // A materialized copy is now stale: hand it back before accepting
        // the new logical data.
        if let Some(buffer) = slot.physical.take() {
            trace!("accel: write to materialized tensor {id}, releasing stale buffer");
            self.pool.release(&slot.shape, slot.dtype, buffer);
        }
        slot.logical = Some(data);
        Ok(())
    }

    fn read(&mut self, id: u64) -> Result<TensorData> {
        let slot = self.slots.get_mut(&id).ok_or(Error::DisposedTensor(id))?;
        Self::materialize(slot, &mut self.pool);
        match &slot.physical {
            Some(buffer) => Ok(buffer.contents().clone()),
            None => Err(Error::DisposedTensor(id)),
        }
    }

    fn dispose(&mut self, id: u64) {
        if let Some(slot) = self.slots.remove(&id) {
            if let Some(buffer) = slot.physical {
                self.pool.release(&slot.shape, slot.dtype, buffer);
            }
        }
    }

    fn memory(&self) -> MemoryReport {
        let materialized = self
            .slots
            .values()
            .filter(|slot| slot.physical.is_some())
            .count();
        let bytes = self
            .slots
            .values()
            .filter_map(|slot| slot.physical.as_ref())
            .map(|buffer| buffer.contents().byte_size())
            .sum();
        MemoryReport {
            registered: self.slots.len(),
            materialized,
            pool_free: self.pool.free_count(),
            peak_physical: self.pool.peak(),
            bytes,
        }
    }
}
