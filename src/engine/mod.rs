//! Recording engine: tensor arena, tape, scopes and differentiation
//!
//! The engine is the single owner of all mutable runtime state. There is no
//! ambient global recording log: an explicit [`Engine`] value is passed by
//! `&mut` to every operation, and its tape, arena and scope stack live and
//! die with it.

mod scope;

#[cfg(test)]
mod tests;

pub use scope::TensorContainer;

use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use crate::backend::{Backend, CpuBackend, MemoryReport};
use crate::error::{Error, Result};
use crate::tape::{
    backpropagate_gradients, filter_nodes_x_to_y, GradientFn, NodeIo, OpKind, TapeNode,
};
use crate::tensor::{DType, TensorData, TensorHandle};

use scope::ScopeFrame;

/// Arena entry for a live tensor id
#[derive(Debug)]
struct TensorInfo {
    shape: Vec<usize>,
    dtype: DType,
}

/// Single-owner tensor runtime.
///
/// Owns the active backend, the tensor arena (the source of truth for
/// liveness), the operation tape and the scope stack. The engine is
/// deliberately single-threaded: a multi-threaded host must serialize all
/// tensor operations through the one `Engine` owner.
pub struct Engine {
    backend: Box<dyn Backend>,
    tensors: HashMap<u64, TensorInfo>,
    next_tensor_id: u64,
    tape: Vec<TapeNode>,
    next_node_id: u64,
    scopes: Vec<ScopeFrame>,
    kept: HashSet<u64>,
}

impl Engine {
    /// Create an engine on the given backend
    pub fn new(backend: Box<dyn Backend>) -> Self {
        debug!("engine: starting on backend `{}`", backend.name());
        Self {
            backend,
            tensors: HashMap::new(),
            next_tensor_id: 0,
            tape: Vec::new(),
            next_node_id: 0,
            scopes: Vec::new(),
            kept: HashSet::new(),
        }
    }

    /// Create an engine on the reference CPU backend
    pub fn cpu() -> Self {
        Self::new(Box::new(CpuBackend::new()))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    // === Tensor arena ===

    /// Register a tensor with the backend and write its data.
    ///
    /// The new tensor is tracked by the innermost scope frame, if any.
    pub fn tensor(&mut self, data: TensorData) -> Result<TensorHandle> {
        let shape = data.shape();
        let dtype = data.dtype();
        let handle = self.alloc(shape, dtype);
        self.backend.write(handle.id(), data)?;
        Ok(handle)
    }

    /// Zero-filled tensor
    pub fn zeros(&mut self, shape: &[usize], dtype: DType) -> Result<TensorHandle> {
        self.tensor(TensorData::zeros(shape, dtype))
    }

    /// One-filled f32 tensor
    pub fn ones(&mut self, shape: &[usize]) -> Result<TensorHandle> {
        self.tensor(TensorData::ones(shape))
    }

    /// 0-dimensional f32 tensor
    pub fn scalar(&mut self, value: f32) -> Result<TensorHandle> {
        self.tensor(TensorData::from_f32(vec![value], &[])?)
    }

    /// F32 tensor from a flat vector and shape
    pub fn from_vec(&mut self, values: Vec<f32>, shape: &[usize]) -> Result<TensorHandle> {
        self.tensor(TensorData::from_f32(values, shape)?)
    }

    /// Read the materialized contents of a tensor.
    ///
    /// On the accelerated backend this is the call that forces
    /// materialization and blocks on device completion.
    pub fn read(&mut self, handle: &TensorHandle) -> Result<TensorData> {
        self.ensure_live(handle)?;
        self.backend.read(handle.id())
    }

    /// Whether the id behind `handle` is still registered
    pub fn is_live(&self, handle: &TensorHandle) -> bool {
        self.tensors.contains_key(&handle.id())
    }

    /// Rebuild a handle from a live tensor id, e.g. a gradient-map key
    pub fn handle(&self, id: u64) -> Option<TensorHandle> {
        self.tensors
            .get(&id)
            .map(|info| TensorHandle::new(id, info.shape.clone(), info.dtype))
    }

    /// Release a tensor's storage.
    ///
    /// Idempotent: disposing an already-disposed handle is a no-op, so a
    /// user disposal inside a scope is not double-freed at scope exit.
    pub fn dispose(&mut self, handle: &TensorHandle) {
        if self.tensors.remove(&handle.id()).is_some() {
            self.backend.dispose(handle.id());
            self.kept.remove(&handle.id());
            trace!("engine: disposed tensor {}", handle.id());
        }
    }

    /// Pin a tensor so that no scope exit disposes it
    pub fn keep(&mut self, handle: &TensorHandle) -> TensorHandle {
        self.kept.insert(handle.id());
        handle.clone()
    }

    /// Count of live tensor ids
    pub fn live_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Storage counters of the active backend
    pub fn memory(&self) -> MemoryReport {
        self.backend.memory()
    }

    fn alloc(&mut self, shape: Vec<usize>, dtype: DType) -> TensorHandle {
        let id = self.next_tensor_id;
        self.next_tensor_id += 1;
        self.backend.register(id, &shape, dtype);
        self.tensors.insert(
            id,
            TensorInfo {
                shape: shape.clone(),
                dtype,
            },
        );
        if let Some(frame) = self.scopes.last_mut() {
            frame.created.push(id);
        }
        TensorHandle::new(id, shape, dtype)
    }

    fn ensure_live(&self, handle: &TensorHandle) -> Result<()> {
        if self.tensors.contains_key(&handle.id()) {
            Ok(())
        } else {
            Err(Error::DisposedTensor(handle.id()))
        }
    }

    // === Tape ===

    /// Execute a primitive operation and record it on the tape.
    ///
    /// `compute` produces the output tensor(s) against this engine; the tape
    /// gains one node capturing `inputs`, the output and the optional local
    /// gradient rule. Recording is always on — gradient computation is
    /// opt-in at differentiation time, which is what makes pruning worth it.
    pub fn record_op<F>(
        &mut self,
        name: &str,
        kind: OpKind,
        inputs: Vec<(String, TensorHandle)>,
        compute: F,
        gradient: Option<GradientFn>,
    ) -> Result<NodeIo>
    where
        F: FnOnce(&mut Engine) -> Result<NodeIo>,
    {
        for (_, handle) in &inputs {
            self.ensure_live(handle)?;
        }
        let output = compute(self)?;
        let id = self.next_node_id;
        self.next_node_id += 1;
        trace!("tape: node {id} `{name}`");
        self.tape.push(TapeNode {
            id,
            kind,
            name: name.to_string(),
            inputs,
            output: output.clone(),
            gradient,
        });
        Ok(output)
    }

    /// Number of recorded nodes
    pub fn tape_len(&self) -> usize {
        self.tape.len()
    }

    /// Drop all recorded nodes. Call between independent differentiation
    /// sessions; recorded handles themselves stay live.
    pub fn clear_tape(&mut self) {
        self.tape.clear();
    }

    // === Scopes ===

    /// Run `f` inside a fresh scope frame.
    ///
    /// Every tensor `f` allocates is disposed at exit except the ones
    /// reachable from its return value, which are promoted to the parent
    /// frame. Cleanup also runs when `f` fails, so device memory cannot leak
    /// on error paths.
    pub fn scope<T, F>(&mut self, f: F) -> Result<T>
    where
        T: TensorContainer,
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        self.start_scope();
        match f(self) {
            Ok(value) => {
                let mut kept_ids = HashSet::new();
                value.collect_ids(&mut kept_ids);
                self.end_scope(&kept_ids);
                Ok(value)
            }
            Err(err) => {
                self.end_scope(&HashSet::new());
                Err(err)
            }
        }
    }

    /// Push a scope frame without a closure. Pair with [`Engine::end_scope`].
    pub fn start_scope(&mut self) {
        self.scopes.push(ScopeFrame::default());
    }

    /// Pop the innermost frame, disposing its allocations except `kept_ids`
    /// and globally pinned tensors. Kept ids created in this frame are
    /// re-registered with the parent frame so an outer exit owns them.
    pub fn end_scope(&mut self, kept_ids: &HashSet<u64>) {
        let frame = match self.scopes.pop() {
            Some(frame) => frame,
            None => return,
        };
        let mut disposed = 0usize;
        for id in &frame.created {
            if kept_ids.contains(id) || self.kept.contains(id) {
                continue;
            }
            if self.tensors.remove(id).is_some() {
                self.backend.dispose(*id);
                disposed += 1;
            }
        }
        trace!(
            "scope: exit disposed {disposed} of {} tracked tensors",
            frame.created.len()
        );
        if let Some(parent) = self.scopes.last_mut() {
            for id in &frame.created {
                if kept_ids.contains(id) && self.tensors.contains_key(id) {
                    parent.created.push(*id);
                }
            }
        }
    }

    // === Differentiation ===

    /// Gradients of `y` with respect to each tensor in `xs`.
    ///
    /// `seed` is the gradient at `y`; `None` seeds with ones of `y`'s shape.
    /// The result maps tensor id → gradient for every root with a path to
    /// `y`. Roots without a path have no entry — an absence, not an error,
    /// since many programs differentiate with respect to inputs that
    /// provably do not affect a given output.
    pub fn gradients(
        &mut self,
        xs: &[TensorHandle],
        y: &TensorHandle,
        seed: Option<TensorHandle>,
    ) -> Result<HashMap<u64, TensorHandle>> {
        self.ensure_live(y)?;
        for x in xs {
            self.ensure_live(x)?;
        }
        if let Some(seed) = &seed {
            self.ensure_live(seed)?;
            if seed.dtype() != DType::F32 {
                return Err(Error::InvalidDType(format!(
                    "gradient seed must be f32, got {:?}",
                    seed.dtype()
                )));
            }
            if seed.shape() != y.shape() {
                return Err(Error::ShapeMismatch {
                    expected: y.shape().to_vec(),
                    got: seed.shape().to_vec(),
                });
            }
        }

        let filtered = filter_nodes_x_to_y(&self.tape, xs, y);
        debug!(
            "backprop: {} of {} tape nodes lie between the roots and the target",
            filtered.len(),
            self.tape.len()
        );

        let root_ids: HashSet<u64> = xs.iter().map(|x| x.id()).collect();
        let y_id = y.id();
        let y_shape = y.shape().to_vec();
        self.scope(|engine| {
            // A default seed is allocated inside the scope, so it is
            // reclaimed unless it surfaces as a root gradient.
            let seed = match seed {
                Some(seed) => seed,
                None => engine.ones(&y_shape)?,
            };
            let mut grads: HashMap<u64, TensorHandle> = HashMap::new();
            grads.insert(y_id, seed);
            backpropagate_gradients(engine, &mut grads, &filtered)?;
            grads.retain(|id, _| root_ids.contains(id));
            Ok(grads)
        })
    }

    /// Elementwise sum of two gradient tensors.
    ///
    /// Accumulation is engine-internal and not recorded on the tape.
    pub(crate) fn accumulate(
        &mut self,
        a: &TensorHandle,
        b: &TensorHandle,
    ) -> Result<TensorHandle> {
        let lhs = self.read(a)?;
        let rhs = self.read(b)?;
        self.tensor(lhs.add(&rhs)?)
    }
}
