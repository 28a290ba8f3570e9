//! # Trazar: Tape-Based Tensor Runtime
//!
//! Trazar provides N-dimensional tensor handles, interchangeable compute
//! backends (a reference CPU backend and a pooled, lazily-materializing
//! accelerated backend), and a reverse-mode automatic differentiation engine
//! built on an operation tape.
//!
//! ## Architecture
//!
//! - **engine**: single-owner recording engine, scope manager, gradient orchestration
//! - **tape**: tape nodes, two-pass graph pruning, backward accumulation
//! - **backend**: storage pools (eager CPU, pool-backed accelerated)
//! - **ops**: primitive kernels with their local gradient rules
//! - **tensor**: handles, element types, raw tensor data
//!
//! ## Example
//!
//! ```
//! use trazar::{ops, Engine};
//!
//! let mut engine = Engine::cpu();
//!
//! // d(x²)/dx at x = 3
//! let x = engine.from_vec(vec![3.0], &[1]).unwrap();
//! let y = ops::square(&mut engine, &x).unwrap();
//!
//! let grads = engine.gradients(&[x.clone()], &y, None).unwrap();
//! let dx = engine.read(&grads[&x.id()]).unwrap();
//! assert_eq!(dx.as_f32().unwrap().as_slice().unwrap(), &[6.0]);
//! ```
//!
//! Intermediate tensors are reclaimed deterministically with scopes:
//!
//! ```
//! use trazar::{ops, Engine};
//!
//! let mut engine = Engine::cpu();
//! let x = engine.from_vec(vec![1.0, 2.0], &[2]).unwrap();
//!
//! // Everything allocated inside the scope is disposed on exit, except the
//! // returned tensor.
//! let y = engine
//!     .scope(|eng| {
//!         let a = ops::square(eng, &x)?;
//!         let b = ops::relu(eng, &a)?;
//!         ops::sum(eng, &b)
//!     })
//!     .unwrap();
//! assert!(engine.is_live(&y));
//! ```

pub mod backend;
pub mod engine;
pub mod ops;
pub mod tape;
pub mod tensor;

pub mod error;

// Re-export commonly used types
pub use engine::{Engine, TensorContainer};
pub use error::{Error, Result};
pub use tensor::{DType, TensorData, TensorHandle};
