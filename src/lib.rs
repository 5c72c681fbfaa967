//! Jaspr's evaluation core: the data model, macro-expander, evaluator,
//! structured-concurrency fiber runtime, lazy-value discipline, dynamic
//! variable stack, and scope/module resolution a Jaspr implementation's
//! front end (surface parser, module loader, REPL, primitive library) is
//! built on top of. None of those front-end pieces live in this crate; see
//! `SPEC_FULL.md` §1/§6 for the exact boundary.
//!
//! A program is a JSON document; every JSON document is a valid program
//! (§1). [`from_json`]/[`to_json`] are the only conversion this core owns
//! between `serde_json::Value` and the arena-addressed internal [`Value`].
//! [`run_script`] and [`run_module`] are the two entry points an embedder
//! (or this crate's own tests) drives a definitions mapping through.

mod builtins;
mod channel;
mod closure;
mod defs;
mod dynamic;
mod error;
mod eval;
mod expand;
mod fiber;
mod heap;
mod intern;
mod native;
mod reserved;
mod scope;
mod signal;
mod tracer;
mod value;

use std::{cell::RefCell, rc::Rc};

pub use crate::{
    defs::Namespace,
    dynamic::Dynamics,
    error::{ErrCode, JasprError, RunResult},
    fiber::{BranchId, Ex, Executor, ResourceLimits, Rt, Runtime},
    heap::{Heap, HeapId},
    intern::{Interns, StringId},
    scope::{Context, Scope},
    signal::Globals,
    tracer::{JasprTracer, NoopTracer, StderrTracer},
    value::{from_json, to_json, value_eq, Value},
};

/// The result of running a script or module's definitions through the
/// scope/defs assembler (§6.2): the scope every definition landed in, and —
/// if the source's top-level defs had a `main` value binding — that
/// binding's value (possibly still a [`Value::Deferred`] if evaluation
/// hasn't been driven to completion or is legitimately waiting on external
/// input, e.g. an unresolved channel or native callback).
///
/// `rt`/`exec`/`root_branch` are exposed so a caller can keep driving the
/// program after construction: force further deferreds, spawn additional
/// fibers against the same root branch, or cancel it outright.
pub struct Program {
    pub rt: Rt,
    pub exec: Ex,
    pub root_branch: BranchId,
    pub globals: Globals,
    pub scope: Scope,
    pub main: Option<Value>,
}

/// Runs `defs_json` (a JSON object, the "definitions mapping" of §6.2) as a
/// script: no module namespace, so every definition is bound only under its
/// short name and syntax-quote's qualified-name lookup is a pass-through.
///
/// # Errors
///
/// Returns the structural error (a bad definition name, a misplaced
/// `doc`/`test` context, …) if scope assembly itself fails with no signal
/// handler bound to resume it — the only way that can be observed from
/// outside the evaluator, since an unhandled `raise` otherwise just cancels
/// the root branch silently (§7).
pub fn run_script(defs_json: &serde_json::Value) -> RunResult<Program> {
    run(None, defs_json)
}

/// Runs `defs_json` as a module under `namespace`: every definition is bound
/// under its short name, `{module}.{name}`, and the fully-qualified
/// `{module}@{version}.{name}` form (§4.6 expansion note), and syntax-quote
/// resolves short names to their qualified form.
///
/// # Errors
///
/// See [`run_script`].
pub fn run_module(namespace: Namespace, defs_json: &serde_json::Value) -> RunResult<Program> {
    run(Some(namespace), defs_json)
}

fn run(namespace: Option<Namespace>, defs_json: &serde_json::Value) -> RunResult<Program> {
    let mut runtime = Runtime::new();
    let signal_handler = runtime.heap.alloc(heap::HeapData::Dynamic(dynamic::DynamicVar { default: Value::Null }));
    let name = runtime.heap.alloc(heap::HeapData::Dynamic(dynamic::DynamicVar { default: Value::Null }));
    let globals = Globals { signal_handler, name };
    let prelude_scope = builtins::install_prelude(&mut runtime, globals);
    let root_branch = runtime.root_branch();

    let captured_error: Rc<RefCell<Option<JasprError>>> = Rc::new(RefCell::new(None));
    let captured_error2 = captured_error.clone();
    runtime.set_unhandled_callback(move |err| *captured_error2.borrow_mut() = Some(err.clone()));

    let rt: Rt = Rc::new(RefCell::new(runtime));
    let exec: Ex = Executor::new_shared();

    let defs_value = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, defs_json) };

    let outcome: Rc<RefCell<Option<Scope>>> = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    let rt2 = rt.clone();
    let exec2 = exec.clone();
    let prelude_scope2 = prelude_scope.clone();
    let fut: fiber::BoxFuture<Value> = Box::pin(async move {
        if let Ok(scope) = defs::assemble_scope(rt2, exec2, root_branch, prelude_scope2, Dynamics::empty(), globals, defs_value, namespace, true).await {
            *outcome2.borrow_mut() = Some(scope);
        }
        Value::Null
    });
    fiber::spawn_fiber(&exec, &rt, root_branch, fut);
    fiber::Executor::run_until_stalled(&exec);

    let Some(scope) = outcome.borrow_mut().take() else {
        let err = captured_error.borrow_mut().take().unwrap_or_else(|| JasprError::new(ErrCode::EvalFailed, "module assembly did not complete"));
        return Err(err);
    };

    let main_name = { rt.borrow_mut().interns.intern("main") };
    let main = scope.lookup(Context::Value, main_name);

    Ok(Program { rt, exec, root_branch, globals, scope, main })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_without_main_has_no_main_handle() {
        let defs = serde_json::json!({"x": ["", 1.0]});
        let program = run_script(&defs).unwrap();
        assert!(program.main.is_none());
        let x_id = { program.rt.borrow_mut().interns.intern("x") };
        assert!(program.scope.lookup(Context::Value, x_id).is_some());
    }

    #[test]
    fn script_main_evaluates_to_a_concrete_value() {
        let defs = serde_json::json!({"main": ["$add", 2.0, 3.0]});
        let program = run_script(&defs).unwrap();
        let main = program.main.expect("main should be bound");
        let rtb = program.rt.borrow();
        assert_eq!(to_json(&rtb.heap, &rtb.interns, main), Some(serde_json::json!(5.0)));
    }

    #[test]
    fn module_qualifies_main_and_siblings_see_each_other() {
        let defs = serde_json::json!({
            "helper": ["$closure", {}, ["$add", 1.0, [0.0, "$args"]], {}],
            "main": ["helper", 41.0],
        });
        let namespace = Namespace::new("demo", "1.0.0");
        let program = run_module(namespace, &defs).unwrap();
        let main = program.main.expect("main should be bound");
        let rtb = program.rt.borrow();
        assert_eq!(to_json(&rtb.heap, &rtb.interns, main), Some(serde_json::json!(42.0)));
    }

    #[test]
    fn bad_definition_name_is_reported_as_an_error() {
        let defs = serde_json::json!({"$bad": ["", 1.0]});
        let err = run_script(&defs).unwrap_err();
        assert_eq!(err.err, ErrCode::BadName);
    }
}
