//! Operation tape: recording, pruning and backward accumulation
//!
//! Every primitive operation executed through the engine appends one
//! [`TapeNode`]. Differentiation never sorts the tape: node ids strictly
//! increase in recording order, and an operation can only reference
//! previously recorded outputs, so recording order is already topological.


use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::tensor::{DType, TensorHandle};

/// Kind of a recorded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// A compute kernel (arithmetic, reduction, comparison)
    Kernel,
    /// A layout-only operation (reshape and friends)
    ShapeOp,
}

/// Inputs or outputs of a tape node
///
/// Single-output kernels use `Single`; multi-output kernels use `Named`,
/// which preserves insertion order. Pruning and accumulation operate
/// uniformly over both variants.
#[derive(Clone)]
pub enum NodeIo {
    Single(TensorHandle),
    Named(Vec<(String, TensorHandle)>),
}

impl NodeIo {
    /// All handles in this io, in order
    pub fn handles(&self) -> Vec<&TensorHandle> {
        match self {
            NodeIo::Single(h) => vec![h],
            NodeIo::Named(entries) => entries.iter().map(|(_, h)| h).collect(),
        }
    }

    /// All tensor ids in this io, in order
    pub fn ids(&self) -> Vec<u64> {
        self.handles().iter().map(|h| h.id()).collect()
    }

    /// The sole handle of a `Single` io
    pub fn single(&self) -> Result<&TensorHandle> {
        match self {
            NodeIo::Single(h) => Ok(h),
            NodeIo::Named(_) => Err(Error::InvalidOp(
                "expected a single-output io, got a named map".to_string(),
            )),
        }
    }

    /// Look up a `Named` entry by name
    pub fn get(&self, name: &str) -> Option<&TensorHandle> {
        match self {
            NodeIo::Single(_) => None,
            NodeIo::Named(entries) => entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, h)| h),
        }
    }
}

impl fmt::Debug for NodeIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeIo::Single(h) => f.debug_tuple("Single").field(&h.id()).finish(),
            NodeIo::Named(entries) => {
                let names: Vec<_> = entries.iter().map(|(n, h)| (n.as_str(), h.id())).collect();
                f.debug_tuple("Named").field(&names).finish()
            }
        }
    }
}

/// A deferred gradient contribution for one input.
///
/// Thunks are only evaluated for inputs that survive pruning, so gradients
/// nobody asked for are never computed.
pub type GradThunk = Box<dyn FnOnce(&mut Engine) -> Result<TensorHandle>>;

/// Per-input gradient thunks, keyed by input name
pub type NamedGradients = Vec<(String, GradThunk)>;

/// Local gradient rule of a recorded operation.
///
/// Receives the incoming gradient `dy` (mirroring the node's output
/// structure) and the output `y` itself, and returns one thunk per input.
pub type GradientFn = Rc<dyn Fn(&mut Engine, &NodeIo, &NodeIo) -> Result<NamedGradients>>;

/// One recorded operation: inputs, outputs and optional local gradient rule
#[derive(Clone)]
pub struct TapeNode {
    /// Strictly increasing in recording order; the sole topological tie-break
    pub id: u64,
    pub kind: OpKind,
    pub name: String,
    pub inputs: Vec<(String, TensorHandle)>,
    pub output: NodeIo,
    /// `None` marks a non-differentiable operation
    pub gradient: Option<GradientFn>,
}

impl fmt::Debug for TapeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapeNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("gradient", &self.gradient.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Restrict `tape` to the minimal ordered subsequence of nodes lying on a
/// directed path from some tensor in `xs` to `y`.
///
/// Two linear passes over the tape:
///
/// 1. Forward, in recording order: grow the set of tensor ids reachable from
///    `xs`; a node any of whose inputs is reachable marks all its outputs
///    reachable and becomes forward-live.
/// 2. Backward, in reverse recording order over forward-live nodes: a node is
///    kept iff one of its outputs leads to `y`; keeping it marks its
///    forward-reachable inputs as leading to `y`.
///
/// Kept nodes are emitted in recording order with input entries (and, for
/// multi-output nodes, output entries) pruned to the ids on the path. A node
/// whose inputs are all pruned away is still kept if its output is on the
/// path; a node whose entire output is off the path is dropped even when
/// forward-live.
pub fn filter_nodes_x_to_y(tape: &[TapeNode], xs: &[TensorHandle], y: &TensorHandle) -> Vec<TapeNode> {
    // Pass 1: which tensors are computable from xs.
    let mut reachable_from_x: HashSet<u64> = xs.iter().map(|x| x.id()).collect();
    let mut forward_live: HashSet<u64> = HashSet::new();
    for node in tape {
        let any_input_from_x = node
            .inputs
            .iter()
            .any(|(_, h)| reachable_from_x.contains(&h.id()));
        if any_input_from_x {
            for id in node.output.ids() {
                reachable_from_x.insert(id);
            }
            forward_live.insert(node.id);
        }
    }

    // Pass 2: which of those tensors flow onward into y.
    let mut reachable_to_y: HashSet<u64> = HashSet::new();
    reachable_to_y.insert(y.id());
    let mut kept: HashSet<u64> = HashSet::new();
    for node in tape.iter().rev() {
        if !forward_live.contains(&node.id) {
            continue;
        }
        let leads_to_y = node.output.ids().iter().any(|id| reachable_to_y.contains(id));
        if leads_to_y {
            kept.insert(node.id);
            for (_, h) in &node.inputs {
                if reachable_from_x.contains(&h.id()) {
                    reachable_to_y.insert(h.id());
                }
            }
        }
    }

    tape.iter()
        .filter(|node| kept.contains(&node.id))
        .map(|node| {
            let inputs = node
                .inputs
                .iter()
                .filter(|(_, h)| reachable_to_y.contains(&h.id()))
                .cloned()
                .collect();
            let output = match &node.output {
                NodeIo::Single(h) => NodeIo::Single(h.clone()),
                NodeIo::Named(entries) => NodeIo::Named(
                    entries
                        .iter()
                        .filter(|(_, h)| reachable_to_y.contains(&h.id()))
                        .cloned()
                        .collect(),
                ),
            };
            TapeNode {
                id: node.id,
                kind: node.kind,
                name: node.name.clone(),
                inputs,
                output,
                gradient: node.gradient.clone(),
            }
        })
        .collect()
}

/// Walk a pruned tape in reverse recording order, accumulating gradients.
///
/// `grads` must be pre-seeded with the seed gradient at the target's id. On
/// return it holds, for every reachable root, the sum of all contributions
/// that flowed to it. Roots the pruner found unreachable simply have no
/// entry; callers treat that absence as "no gradient", distinct from a
/// computed zero.
pub fn backpropagate_gradients(
    engine: &mut Engine,
    grads: &mut HashMap<u64, TensorHandle>,
    pruned: &[TapeNode],
) -> Result<()> {
    for node in pruned.iter().rev() {
        // No gradient flows through any output: nothing to do here.
        let any_inflow = node.output.ids().iter().any(|id| grads.contains_key(id));
        if !any_inflow {
            continue;
        }

        let gradient = node.gradient.clone().ok_or_else(|| {
            Error::MissingGradient(format!(
                "operation `{}` has no gradient function but lies on the differentiation path",
                node.name
            ))
        })?;

        // Mirror the node's (pruned) output structure; outputs that received
        // no gradient get a zero-filled dy of their own shape.
        let dy = match &node.output {
            NodeIo::Single(h) => match grads.get(&h.id()) {
                Some(g) => NodeIo::Single(g.clone()),
                None => NodeIo::Single(engine.zeros(h.shape(), DType::F32)?),
            },
            NodeIo::Named(entries) => {
                let mut dys = Vec::with_capacity(entries.len());
                for (name, h) in entries {
                    let g = match grads.get(&h.id()) {
                        Some(g) => g.clone(),
                        None => engine.zeros(h.shape(), DType::F32)?,
                    };
                    dys.push((name.clone(), g));
                }
                NodeIo::Named(dys)
            }
        };

        let mut thunks: HashMap<String, GradThunk> =
            gradient(engine, &dy, &node.output)?.into_iter().collect();

        for (input_name, input) in &node.inputs {
            let thunk = thunks.remove(input_name).ok_or_else(|| {
                Error::MissingGradient(format!(
                    "operation `{}` defines no gradient for input `{input_name}`",
                    node.name
                ))
            })?;
            let dx = thunk(engine)?;
            if dx.dtype() != DType::F32 {
                return Err(Error::InvalidDType(format!(
                    "gradient for input `{input_name}` of `{}` must be f32, got {:?}",
                    node.name,
                    dx.dtype()
                )));
            }
            if dx.shape() != input.shape() {
                return Err(Error::ShapeMismatch {
                    expected: input.shape().to_vec(),
                    got: dx.shape().to_vec(),
                });
            }

            // Additive accumulation: a tensor feeding several downstream
            // nodes receives the sum of every contribution.
            match grads.get(&input.id()) {
                Some(existing) => {
                    let sum = engine.accumulate(existing, &dx)?;
                    grads.insert(input.id(), sum);
                }
                None => {
                    grads.insert(input.id(), dx);
                }
            }
        }
    }
    Ok(())
}
