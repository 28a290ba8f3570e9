//! Reference CPU backend with eager storage

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::tensor::{DType, TensorData};

use super::{Backend, MemoryReport};

#[derive(Debug)]
struct CpuSlot {
    shape: Vec<usize>,
    dtype: DType,
    data: Option<TensorData>,
}

/// Host-memory backend. Writes store eagerly; reads clone.
#[derive(Debug, Default)]
pub struct CpuBackend {
    slots: HashMap<u64, CpuSlot>,
    peak_materialized: usize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn materialized(&self) -> usize {
        self.slots.values().filter(|s| s.data.is_some()).count()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn register(&mut self, id: u64, shape: &[usize], dtype: DType) {
        self.slots.insert(
            id,
            CpuSlot {
                shape: shape.to_vec(),
                dtype,
                data: None,
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
        slot.data = Some(data);
        self.peak_materialized = self.peak_materialized.max(self.materialized());
        Ok(())
    }

    fn read(&mut self, id: u64) -> Result<TensorData> {
        let data = {
            let slot = self.slots.get_mut(&id).ok_or(Error::DisposedTensor(id))?;
            // A registered-but-unwritten id reads as zeros and stays that way.
            if slot.data.is_none() {
                slot.data = Some(TensorData::zeros(&slot.shape, slot.dtype));
            }
            match &slot.data {
                Some(data) => data.clone(),
                None => return Err(Error::DisposedTensor(id)),
            }
        };
        self.peak_materialized = self.peak_materialized.max(self.materialized());
        Ok(data)
    }

    fn dispose(&mut self, id: u64) {
        self.slots.remove(&id);
    }

    fn memory(&self) -> MemoryReport {
        let materialized = self.materialized();
        let bytes = self
            .slots
            .values()
            .filter_map(|s| s.data.as_ref())
            .map(|d| d.byte_size())
            .sum();
        MemoryReport {
            registered: self.slots.len(),
            materialized,
            pool_free: 0,
            peak_physical: self.peak_materialized.max(materialized),
            bytes,
        }
    }
}
