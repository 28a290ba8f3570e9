//! Tests for the engine: arena, recording, scopes and gradient orchestration

use std::collections::HashSet;

use approx::assert_abs_diff_eq;

use super::*;
use crate::ops;

fn scalar_value(engine: &mut Engine, handle: &TensorHandle) -> f32 {
    engine.read(handle).unwrap().as_f32().unwrap().sum()
}

#[test]
fn test_tensor_round_trip() {
    let mut engine = Engine::cpu();
    let t = engine.from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
    assert_eq!(t.shape(), &[3]);
    assert_eq!(t.dtype(), DType::F32);

    let data = engine.read(&t).unwrap();
    assert_eq!(data.as_f32().unwrap().as_slice().unwrap(), &[1.0, 2.0, 3.0]);
}

#[test]
fn test_tensor_ids_are_monotonic() {
    let mut engine = Engine::cpu();
    let a = engine.scalar(0.0).unwrap();
    let b = engine.scalar(0.0).unwrap();
    let c = engine.scalar(0.0).unwrap();
    assert!(a.id() < b.id());
    assert!(b.id() < c.id());
}

#[test]
fn test_handle_lookup_by_id() {
    let mut engine = Engine::cpu();
    let t = engine.from_vec(vec![1.0, 2.0], &[2]).unwrap();

    let rebuilt = engine.handle(t.id()).unwrap();
    assert_eq!(rebuilt, t);

    engine.dispose(&t);
    assert!(engine.handle(t.id()).is_none());
}

#[test]
fn test_dispose_invalidates_reads() {
    let mut engine = Engine::cpu();
    let t = engine.scalar(1.0).unwrap();
    assert!(engine.is_live(&t));

    engine.dispose(&t);
    assert!(!engine.is_live(&t));
    match engine.read(&t) {
        Err(Error::DisposedTensor(id)) => assert_eq!(id, t.id()),
        other => panic!("expected DisposedTensor, got {other:?}"),
    }

    // Disposing again is a no-op.
    engine.dispose(&t);
}

#[test]
fn test_record_op_appends_to_tape() {
    let mut engine = Engine::cpu();
    let x = engine.scalar(2.0).unwrap();
    assert_eq!(engine.tape_len(), 0);

    ops::square(&mut engine, &x).unwrap();
    assert_eq!(engine.tape_len(), 1);

    ops::square(&mut engine, &x).unwrap();
    assert_eq!(engine.tape_len(), 2);

    engine.clear_tape();
    assert_eq!(engine.tape_len(), 0);
    assert!(engine.is_live(&x));
}

#[test]
fn test_record_op_rejects_disposed_input() {
    let mut engine = Engine::cpu();
    let x = engine.scalar(2.0).unwrap();
    engine.dispose(&x);

    let result = ops::square(&mut engine, &x);
    assert!(matches!(result, Err(Error::DisposedTensor(_))));
}

#[test]
fn test_scope_disposes_unkept_tensors() {
    let mut engine = Engine::cpu();
    let before = engine.live_tensors();

    let kept = engine
        .scope(|eng| {
            let a = eng.scalar(1.0)?;
            let _b = eng.scalar(2.0)?;
            let _c = eng.scalar(3.0)?;
            Ok(a)
        })
        .unwrap();

    // Three allocated, one kept.
    assert_eq!(engine.live_tensors(), before + 1);
    assert!(engine.is_live(&kept));
}

#[test]
fn test_scope_keeps_containers() {
    let mut engine = Engine::cpu();
    let before = engine.live_tensors();

    let (a, rest) = engine
        .scope(|eng| {
            let a = eng.scalar(1.0)?;
            let b = eng.scalar(2.0)?;
            let c = eng.scalar(3.0)?;
            let _dead = eng.scalar(4.0)?;
            Ok((a, vec![b, c]))
        })
        .unwrap();

    assert_eq!(engine.live_tensors(), before + 3);
    assert!(engine.is_live(&a));
    assert!(rest.iter().all(|h| engine.is_live(h)));
}

#[test]
fn test_scope_cleanup_on_error() {
    let mut engine = Engine::cpu();
    let before = engine.live_tensors();

    let result: Result<TensorHandle> = engine.scope(|eng| {
        let _a = eng.scalar(1.0)?;
        let _b = eng.scalar(2.0)?;
        Err(Error::InvalidOp("forced failure".to_string()))
    });

    assert!(matches!(result, Err(Error::InvalidOp(_))));
    // Cleanup ran on the error path.
    assert_eq!(engine.live_tensors(), before);
}

#[test]
fn test_nested_scopes_promote_kept_tensors() {
    let mut engine = Engine::cpu();
    let before = engine.live_tensors();

    engine
        .scope(|eng| {
            let inner = eng.scope(|eng| {
                let t = eng.scalar(1.0)?;
                Ok(t)
            })?;
            // Kept by the inner scope, now owned by this one.
            assert!(eng.is_live(&inner));
            Ok(())
        })
        .unwrap();

    // The outer exit disposed the promoted tensor.
    assert_eq!(engine.live_tensors(), before);
}

#[test]
fn test_keep_survives_scope_exit() {
    let mut engine = Engine::cpu();

    let mut pinned = None;
    engine
        .scope(|eng| {
            let t = eng.scalar(1.0)?;
            pinned = Some(eng.keep(&t));
            Ok(())
        })
        .unwrap();

    let pinned = pinned.unwrap();
    assert!(engine.is_live(&pinned));
    engine.dispose(&pinned);
}

#[test]
fn test_user_dispose_inside_scope_is_not_double_freed() {
    let mut engine = Engine::cpu();
    let before = engine.live_tensors();

    engine
        .scope(|eng| {
            let t = eng.scalar(1.0)?;
            eng.dispose(&t);
            assert!(!eng.is_live(&t));
            Ok(())
        })
        .unwrap();

    assert_eq!(engine.live_tensors(), before);
}

#[test]
fn test_manual_scope_pair() {
    let mut engine = Engine::cpu();
    let before = engine.live_tensors();

    engine.start_scope();
    let a = engine.scalar(1.0).unwrap();
    let _b = engine.scalar(2.0).unwrap();
    engine.end_scope(&HashSet::from([a.id()]));

    assert_eq!(engine.live_tensors(), before + 1);
    assert!(engine.is_live(&a));
}

#[test]
fn test_gradients_square() {
    let mut engine = Engine::cpu();
    let x = engine.from_vec(vec![3.0], &[1]).unwrap();
    let y = ops::square(&mut engine, &x).unwrap();

    let grads = engine.gradients(&[x.clone()], &y, None).unwrap();
    let dx = grads.get(&x.id()).unwrap().clone();
    assert_abs_diff_eq!(scalar_value(&mut engine, &dx), 6.0);
}

#[test]
fn test_gradients_with_explicit_seed() {
    let mut engine = Engine::cpu();
    let x = engine.from_vec(vec![3.0], &[1]).unwrap();
    let y = ops::square(&mut engine, &x).unwrap();
    let seed = engine.from_vec(vec![10.0], &[1]).unwrap();

    let grads = engine.gradients(&[x.clone()], &y, Some(seed)).unwrap();
    let dx = grads.get(&x.id()).unwrap().clone();
    assert_abs_diff_eq!(scalar_value(&mut engine, &dx), 60.0);
}

#[test]
fn test_gradients_seed_shape_checked() {
    let mut engine = Engine::cpu();
    let x = engine.from_vec(vec![3.0], &[1]).unwrap();
    let y = ops::square(&mut engine, &x).unwrap();
    let seed = engine.from_vec(vec![1.0, 1.0], &[2]).unwrap();

    let result = engine.gradients(&[x], &y, Some(seed));
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
}

#[test]
fn test_gradients_seed_dtype_checked() {
    let mut engine = Engine::cpu();
    let x = engine.from_vec(vec![3.0], &[1]).unwrap();
    let y = ops::square(&mut engine, &x).unwrap();
    let seed = engine.zeros(&[1], DType::I32).unwrap();

    let result = engine.gradients(&[x], &y, Some(seed));
    assert!(matches!(result, Err(Error::InvalidDType(_))));
}

#[test]
fn test_gradients_disposed_target_rejected() {
    let mut engine = Engine::cpu();
    let x = engine.from_vec(vec![3.0], &[1]).unwrap();
    let y = ops::square(&mut engine, &x).unwrap();
    engine.dispose(&y);

    let result = engine.gradients(&[x], &y, None);
    assert!(matches!(result, Err(Error::DisposedTensor(_))));
}

#[test]
fn test_gradients_unreachable_root_has_no_entry() {
    let mut engine = Engine::cpu();
    let x = engine.from_vec(vec![3.0], &[1]).unwrap();
    let unrelated = engine.from_vec(vec![7.0], &[1]).unwrap();
    let y = ops::square(&mut engine, &x).unwrap();

    let grads = engine
        .gradients(&[x.clone(), unrelated.clone()], &y, None)
        .unwrap();
    assert!(grads.contains_key(&x.id()));
    // Absence, not an error.
    assert!(!grads.contains_key(&unrelated.id()));
}

#[test]
fn test_gradients_reclaims_intermediates() {
    let mut engine = Engine::cpu();
    let x = engine.from_vec(vec![3.0], &[1]).unwrap();
    let y = engine
        .scope(|eng| {
            let a = ops::square(eng, &x)?;
            ops::identity(eng, &a)
        })
        .unwrap();

    let before = engine.live_tensors();
    let grads = engine.gradients(&[x.clone()], &y, None).unwrap();

    // Exactly the returned gradients survive the backward scope.
    assert_eq!(engine.live_tensors(), before + grads.len());
}

#[test]
fn test_gradients_missing_rule_propagates_and_cleans_up() {
    let mut engine = Engine::cpu();
    let x = engine.from_vec(vec![3.0], &[1]).unwrap();
    let zeros = engine.zeros(&[1], DType::F32).unwrap();
    let mask = ops::greater(&mut engine, &x, &zeros).unwrap();

    let before = engine.live_tensors();
    let result = engine.gradients(&[x], &mask, None);
    assert!(matches!(result, Err(Error::MissingGradient(_))));
    // The aborted backward scope still ran its cleanup.
    assert_eq!(engine.live_tensors(), before);
}
