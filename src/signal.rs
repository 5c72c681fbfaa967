//! The `raise`/signal-handler path (§4.7).
//!
//! There is no try/catch in Jaspr: a raised error is ordinary data walked
//! through the dynamic-binding stack looking for the innermost
//! `signal-handler` binding. A handler that's found is *called*, and its
//! return value becomes `raise`'s result — the handler decides whether to
//! resume, substitute a value, or (by calling `raise` itself) re-raise to an
//! outer handler. If no handler is bound anywhere on the stack, the owning
//! Branch is cancelled and the failure is reported to the tracer as a last
//! resort; the `raise` expression itself then never produces a value, exactly
//! like any other computation on a cancelled branch.

use crate::{
    error::JasprError,
    fiber::{BranchId, Ex, Rt},
    heap::{HeapData, ObjectMap},
    value::Value,
};

/// The well-known dynamic-variable handles every program's root scope binds
/// (§3.4): `signal-handler` (consulted by `raise`) and `name` (the
/// fully-qualified identifier of whatever definition is currently being
/// evaluated, bound by the scope/defs assembler, §4.6).
#[derive(Clone, Copy)]
pub struct Globals {
    pub signal_handler: crate::heap::HeapId,
    pub name: crate::heap::HeapId,
}

/// Converts a [`JasprError`] into the plain Jaspr object a signal handler
/// receives: `{"err": ..., "why": ..., ...context}` (§6.6: "required keys
/// `err` ... and `why`").
fn err_to_value(rt: &Rt, err: &JasprError) -> Value {
    let mut runtime = rt.borrow_mut();
    let err_key = runtime.interns.intern("err");
    let why_key = runtime.interns.intern("why");
    let code_str: &'static str = err.err.into();
    let code_val = Value::Str(runtime.interns.intern(code_str));
    let why_val = Value::Str(runtime.interns.intern(&err.why));
    let mut map = ObjectMap::default();
    map.insert(err_key, code_val);
    map.insert(why_key, why_val);
    for (key, value) in &err.context {
        let key_id = runtime.interns.intern(key);
        map.insert(key_id, *value);
    }
    Value::Object(runtime.heap.alloc(HeapData::Object(map)))
}

/// Raises `err` on `branch`. Resolves to the handling closure's return value
/// if one is bound; otherwise cancels `branch` and never resolves.
pub(crate) async fn raise(rt: Rt, exec: Ex, branch: BranchId, dynamics: crate::dynamic::Dynamics, globals: Globals, err: JasprError) -> Value {
    rt.borrow().tracer.on_raised(&err);
    let value = err_to_value(&rt, &err);

    if let Some((handler, outer)) = dynamics.lookup_with_outer(globals.signal_handler) {
        if let Value::Closure(handler_id) = handler {
            return crate::eval::apply_closure(rt, exec, branch, outer, globals, handler_id, vec![value]).await;
        }
    }

    unhandled(&rt, &globals, branch, err).await
}

async fn unhandled(rt: &Rt, _globals: &Globals, branch: BranchId, err: JasprError) -> Value {
    rt.borrow().tracer.on_unhandled(&err);
    let callback = rt.borrow().unhandled_callback.clone();
    if let Some(callback) = callback {
        callback(&err);
    }
    rt.borrow_mut().cancel_branch(branch);
    std::future::pending::<Value>().await
}
