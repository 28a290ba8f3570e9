//! Primitive kernels and their local gradient rules
//!
//! Every operation here goes through [`Engine::record_op`]: it computes its
//! result against the active backend and leaves one node on the tape. The
//! gradient rules return per-input thunks, so a gradient nobody asked for is
//! never evaluated.
//!
//! Operands must share a shape; these kernels do not broadcast.


use std::rc::Rc;

use ndarray::{ArrayD, IxDyn, Zip};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::tape::{GradThunk, GradientFn, NodeIo, OpKind};
use crate::tensor::{DType, TensorData, TensorHandle};

fn thunk<F>(f: F) -> GradThunk
where
    F: FnOnce(&mut Engine) -> Result<TensorHandle> + 'static,
{
    Box::new(f)
}

fn check_f32(handle: &TensorHandle) -> Result<()> {
    if handle.dtype() != DType::F32 {
        return Err(Error::InvalidDType(format!(
            "kernel expects f32 input, got {:?}",
            handle.dtype()
        )));
    }
    Ok(())
}

fn check_binary(a: &TensorHandle, b: &TensorHandle) -> Result<()> {
    check_f32(a)?;
    check_f32(b)?;
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}

/// Elementwise addition
pub fn add(engine: &mut Engine, a: &TensorHandle, b: &TensorHandle) -> Result<TensorHandle> {
    check_binary(a, b)?;
    let (ca, cb) = (a.clone(), b.clone());
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy_a = dy.single()?.clone();
        let dy_b = dy_a.clone();
        Ok(vec![
            ("a".to_string(), thunk(move |_eng| Ok(dy_a))),
            ("b".to_string(), thunk(move |_eng| Ok(dy_b))),
        ])
    });
    let output = engine.record_op(
        "add",
        OpKind::Kernel,
        vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())],
        move |eng| {
            let lhs = eng.read(&ca)?;
            let rhs = eng.read(&cb)?;
            let result = TensorData::F32(lhs.as_f32()? + rhs.as_f32()?);
            Ok(NodeIo::Single(eng.tensor(result)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Elementwise subtraction
pub fn sub(engine: &mut Engine, a: &TensorHandle, b: &TensorHandle) -> Result<TensorHandle> {
    check_binary(a, b)?;
    let (ca, cb) = (a.clone(), b.clone());
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy_a = dy.single()?.clone();
        let dy_b = dy_a.clone();
        Ok(vec![
            ("a".to_string(), thunk(move |_eng| Ok(dy_a))),
            ("b".to_string(), thunk(move |eng| scale(eng, &dy_b, -1.0))),
        ])
    });
    let output = engine.record_op(
        "sub",
        OpKind::Kernel,
        vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())],
        move |eng| {
            let lhs = eng.read(&ca)?;
            let rhs = eng.read(&cb)?;
            let result = TensorData::F32(lhs.as_f32()? - rhs.as_f32()?);
            Ok(NodeIo::Single(eng.tensor(result)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Elementwise multiplication
pub fn mul(engine: &mut Engine, a: &TensorHandle, b: &TensorHandle) -> Result<TensorHandle> {
    check_binary(a, b)?;
    let (ca, cb) = (a.clone(), b.clone());
    let (ga, gb) = (a.clone(), b.clone());
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy_a = dy.single()?.clone();
        let dy_b = dy_a.clone();
        let a_in = ga.clone();
        let b_in = gb.clone();
        Ok(vec![
            // ∂(a·b)/∂a = b
            ("a".to_string(), thunk(move |eng| mul(eng, &dy_a, &b_in))),
            // ∂(a·b)/∂b = a
            ("b".to_string(), thunk(move |eng| mul(eng, &dy_b, &a_in))),
        ])
    });
    let output = engine.record_op(
        "mul",
        OpKind::Kernel,
        vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())],
        move |eng| {
            let lhs = eng.read(&ca)?;
            let rhs = eng.read(&cb)?;
            let result = TensorData::F32(lhs.as_f32()? * rhs.as_f32()?);
            Ok(NodeIo::Single(eng.tensor(result)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Multiply by a scalar constant
pub fn scale(engine: &mut Engine, x: &TensorHandle, factor: f32) -> Result<TensorHandle> {
    check_f32(x)?;
    let cx = x.clone();
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy = dy.single()?.clone();
        Ok(vec![(
            "x".to_string(),
            thunk(move |eng| scale(eng, &dy, factor)),
        )])
    });
    let output = engine.record_op(
        "scale",
        OpKind::Kernel,
        vec![("x".to_string(), x.clone())],
        move |eng| {
            let data = eng.read(&cx)?;
            let result = TensorData::F32(data.as_f32()?.mapv(|v| v * factor));
            Ok(NodeIo::Single(eng.tensor(result)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Elementwise negation
pub fn neg(engine: &mut Engine, x: &TensorHandle) -> Result<TensorHandle> {
    scale(engine, x, -1.0)
}

/// Elementwise square
pub fn square(engine: &mut Engine, x: &TensorHandle) -> Result<TensorHandle> {
    check_f32(x)?;
    let cx = x.clone();
    let gx = x.clone();
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy = dy.single()?.clone();
        let x_in = gx.clone();
        Ok(vec![(
            "x".to_string(),
            // ∂(x²)/∂x = 2x
            thunk(move |eng| {
                let dx = mul(eng, &dy, &x_in)?;
                scale(eng, &dx, 2.0)
            }),
        )])
    });
    let output = engine.record_op(
        "square",
        OpKind::Kernel,
        vec![("x".to_string(), x.clone())],
        move |eng| {
            let data = eng.read(&cx)?;
            let result = TensorData::F32(data.as_f32()?.mapv(|v| v * v));
            Ok(NodeIo::Single(eng.tensor(result)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Rectified linear unit
pub fn relu(engine: &mut Engine, x: &TensorHandle) -> Result<TensorHandle> {
    check_f32(x)?;
    let cx = x.clone();
    let gx = x.clone();
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy = dy.single()?.clone();
        let x_in = gx.clone();
        Ok(vec![(
            "x".to_string(),
            // Gradient passes where the input was positive, zero elsewhere.
            thunk(move |eng| {
                let x_data = eng.read(&x_in)?;
                let dy_data = eng.read(&dy)?;
                let masked = Zip::from(x_data.as_f32()?)
                    .and(dy_data.as_f32()?)
                    .map_collect(|&x, &d| if x > 0.0 { d } else { 0.0 });
                eng.tensor(TensorData::F32(masked))
            }),
        )])
    });
    let output = engine.record_op(
        "relu",
        OpKind::Kernel,
        vec![("x".to_string(), x.clone())],
        move |eng| {
            let data = eng.read(&cx)?;
            let result = TensorData::F32(data.as_f32()?.mapv(|v| v.max(0.0)));
            Ok(NodeIo::Single(eng.tensor(result)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Copy a tensor into a fresh id
pub fn identity(engine: &mut Engine, x: &TensorHandle) -> Result<TensorHandle> {
    check_f32(x)?;
    let cx = x.clone();
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy = dy.single()?.clone();
        Ok(vec![("x".to_string(), thunk(move |_eng| Ok(dy)))])
    });
    let output = engine.record_op(
        "identity",
        OpKind::Kernel,
        vec![("x".to_string(), x.clone())],
        move |eng| {
            let data = eng.read(&cx)?;
            Ok(NodeIo::Single(eng.tensor(data)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Sum every element down to a scalar
pub fn sum(engine: &mut Engine, x: &TensorHandle) -> Result<TensorHandle> {
    check_f32(x)?;
    let cx = x.clone();
    let x_shape = x.shape().to_vec();
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy = dy.single()?.clone();
        let shape = x_shape.clone();
        Ok(vec![(
            "x".to_string(),
            // The scalar gradient broadcasts to every input element.
            thunk(move |eng| {
                let dy_data = eng.read(&dy)?;
                let value = dy_data.as_f32()?.sum();
                let full = ArrayD::from_elem(IxDyn(&shape), value);
                eng.tensor(TensorData::F32(full))
            }),
        )])
    });
    let output = engine.record_op(
        "sum",
        OpKind::Kernel,
        vec![("x".to_string(), x.clone())],
        move |eng| {
            let data = eng.read(&cx)?;
            let total = data.as_f32()?.sum();
            Ok(NodeIo::Single(eng.tensor(TensorData::from_f32(
                vec![total],
                &[],
            )?)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Elementwise `a > b`, producing a boolean mask. Non-differentiable.
pub fn greater(engine: &mut Engine, a: &TensorHandle, b: &TensorHandle) -> Result<TensorHandle> {
    check_binary(a, b)?;
    let (ca, cb) = (a.clone(), b.clone());
    let output = engine.record_op(
        "greater",
        OpKind::Kernel,
        vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())],
        move |eng| {
            let lhs = eng.read(&ca)?;
            let rhs = eng.read(&cb)?;
            let mask = Zip::from(lhs.as_f32()?)
                .and(rhs.as_f32()?)
                .map_collect(|&x, &y| x > y);
            Ok(NodeIo::Single(eng.tensor(TensorData::Bool(mask))?))
        },
        None,
    )?;
    Ok(output.single()?.clone())
}

/// Reinterpret a tensor's shape without touching its data
pub fn reshape(engine: &mut Engine, x: &TensorHandle, shape: &[usize]) -> Result<TensorHandle> {
    check_f32(x)?;
    let new_size: usize = shape.iter().product();
    if new_size != x.size() {
        return Err(Error::ShapeMismatch {
            expected: x.shape().to_vec(),
            got: shape.to_vec(),
        });
    }
    let cx = x.clone();
    let old_shape = x.shape().to_vec();
    let new_shape = shape.to_vec();
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy = dy.single()?.clone();
        let back = old_shape.clone();
        Ok(vec![(
            "x".to_string(),
            thunk(move |eng| reshape(eng, &dy, &back)),
        )])
    });
    let output = engine.record_op(
        "reshape",
        OpKind::ShapeOp,
        vec![("x".to_string(), x.clone())],
        move |eng| {
            let data = eng.read(&cx)?;
            let values: Vec<f32> = data.as_f32()?.iter().copied().collect();
            Ok(NodeIo::Single(eng.tensor(TensorData::from_f32(
                values,
                &new_shape,
            )?)?))
        },
        Some(gradient),
    )?;
    Ok(output.single()?.clone())
}

/// Split a 1-D tensor into `left` (first `at` elements) and `right`
pub fn split(
    engine: &mut Engine,
    x: &TensorHandle,
    at: usize,
) -> Result<(TensorHandle, TensorHandle)> {
    check_f32(x)?;
    if x.shape().len() != 1 {
        return Err(Error::InvalidOp(format!(
            "split expects a 1-D tensor, got shape {:?}",
            x.shape()
        )));
    }
    let len = x.size();
    if at > len {
        return Err(Error::InvalidOp(format!(
            "split point {at} is past the end of a length-{len} tensor"
        )));
    }
    let cx = x.clone();
    let (left_len, right_len) = (at, len - at);
    let gradient: GradientFn = Rc::new(move |_engine, dy, _y| {
        let dy_left = dy.get("left").cloned();
        let dy_right = dy.get("right").cloned();
        Ok(vec![(
            "x".to_string(),
            // Concatenate the output gradients; a pruned-away output
            // contributes zeros.
            thunk(move |eng| {
                let mut values = match dy_left {
                    Some(handle) => {
                        let data = eng.read(&handle)?;
                        data.as_f32()?.iter().copied().collect::<Vec<f32>>()
                    }
                    None => vec![0.0; left_len],
                };
                let right = match dy_right {
                    Some(handle) => {
                        let data = eng.read(&handle)?;
                        data.as_f32()?.iter().copied().collect::<Vec<f32>>()
                    }
                    None => vec![0.0; right_len],
                };
                values.extend(right);
                let total = values.len();
                eng.tensor(TensorData::from_f32(values, &[total])?)
            }),
        )])
    });
    let output = engine.record_op(
        "split",
        OpKind::Kernel,
        vec![("x".to_string(), x.clone())],
        move |eng| {
            let data = eng.read(&cx)?;
            let values: Vec<f32> = data.as_f32()?.iter().copied().collect();
            let left = eng.tensor(TensorData::from_f32(values[..at].to_vec(), &[at])?)?;
            let right = eng.tensor(TensorData::from_f32(values[at..].to_vec(), &[len - at])?)?;
            Ok(NodeIo::Named(vec![
                ("left".to_string(), left),
                ("right".to_string(), right),
            ]))
        },
        Some(gradient),
    )?;
    let left = output
        .get("left")
        .cloned()
        .ok_or_else(|| Error::InvalidOp("split produced no `left` output".to_string()))?;
    let right = output
        .get("right")
        .cloned()
        .ok_or_else(|| Error::InvalidOp("split produced no `right` output".to_string()))?;
    Ok((left, right))
}
