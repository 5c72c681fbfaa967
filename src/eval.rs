//! The evaluator (§4.5): interprets an expanded code tree against a scope,
//! `$args`, and a dynamic stack.
//!
//! Like the expander, every entry point is an `async fn`-shaped `BoxFuture`
//! that never returns a `Result` — a structural error is folded into a
//! [`crate::signal::raise`] call on the current branch and whatever `raise`
//! resolves to (a resumed value, or a future that never completes on a
//! cancelled branch) is returned directly (see `SPEC_FULL.md`'s "uniform
//! error flow" note).

use crate::{
    closure::Closure,
    defs,
    dynamic::Dynamics,
    error::{ErrCode, JasprError},
    expand,
    fiber::{self, BoxFuture, BranchId, Ex, Rt},
    heap::{HeapData, HeapId},
    native::NativeFn,
    reserved,
    scope::{Context, Scope},
    signal::{self, Globals},
    value::{self, Value},
};

async fn raise_here(rt: Rt, exec: Ex, branch: BranchId, dynamics: Dynamics, globals: Globals, err: JasprError) -> Value {
    signal::raise(rt, exec, branch, dynamics, globals, err).await
}

fn head_str(rt: &Rt, items: &[Value]) -> Option<String> {
    match items.first() {
        Some(Value::Str(s)) => Some(rt.borrow().interns.get(*s).to_owned()),
        _ => None,
    }
}

/// Same test `expand.rs` uses to recognize a `$closure` literal: a
/// four-element array headed by the literal string `$closure`. A closure
/// literal is never a call, at both expansion and evaluation time (§4.4
/// "Tie-breaks").
pub(crate) fn is_closure_literal(rt: &Rt, items: &[Value]) -> bool {
    items.len() == 4 && head_str(rt, items).as_deref() == Some(reserved::CLOSURE)
}

/// Evaluates `code` against `scope`/`dynamics` on `branch`. `$args` is not a
/// separate parameter: it is an ordinary `value`-context binding the closure
/// call path (§4.5.1) installs on a fresh scope layer before evaluating a
/// body, exactly like any other name.
pub(crate) fn eval(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, code: Value) -> BoxFuture<Value> {
    Box::pin(async move {
        match code {
            Value::Null | Value::Bool(_) | Value::Number(_) => code,
            Value::Str(s) => eval_string(rt, exec, branch, scope, dynamics, globals, s).await,
            Value::Array(_) => eval_array(rt, exec, branch, scope, dynamics, globals, code).await,
            Value::Object(_) => eval_object(rt, exec, branch, scope, dynamics, globals, code).await,
            // A raw Deferred, closure, dynamic handle, channel, or native
            // function reaching `eval` as *code* means some earlier pass
            // handed it back an already-evaluated value (e.g. `$eval`'s
            // second evaluation of its own result) — in that case the right
            // behavior is to treat it as a self-evaluating literal, same as
            // any other non-array/object value.
            other => other,
        }
    })
}

async fn eval_string(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, s: crate::intern::StringId) -> Value {
    let text = rt.borrow().interns.get(s).to_owned();
    if reserved::is_reserved_prefixed(&text) {
        if text == reserved::ARGS {
            return lookup_or_raise(rt, exec, branch, scope, dynamics, globals, s, &text).await;
        }
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::new(ErrCode::BadName, format!("reserved name used as a value: {text}"))).await;
    }
    lookup_or_raise(rt, exec, branch, scope, dynamics, globals, s, &text).await
}

async fn lookup_or_raise(
    rt: Rt,
    exec: Ex,
    branch: BranchId,
    scope: Scope,
    dynamics: Dynamics,
    globals: Globals,
    s: crate::intern::StringId,
    text: &str,
) -> Value {
    match scope.lookup(Context::Value, s) {
        Some(v) => fiber::force(rt, v).await,
        None => raise_here(rt, exec, branch, dynamics, globals, JasprError::no_binding(format!("no binding for {text:?}"))).await,
    }
}

async fn eval_object(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, code: Value) -> Value {
    let entries = { let rtb = rt.borrow(); value::object_entries(&rtb.heap, code).expect("caller checked Object") };
    if entries.is_empty() {
        return code;
    }
    // Each value is an independent Deferred (§4.5 "Objects evaluate
    // key-by-key ... producing a new object"): spawned as a fiber on the
    // current branch so siblings may run concurrently.
    let mut handles = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let fut: BoxFuture<Value> = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, v);
        handles.push((k, fiber::spawn_fiber(&exec, &rt, branch, fut)));
    }
    let mut out = Vec::with_capacity(handles.len());
    for (k, handle) in handles {
        out.push((k, handle.await_result(&rt).await));
    }
    let mut rtb = rt.borrow_mut();
    value::make_object(&mut rtb.heap, out)
}

async fn eval_array(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, code: Value) -> Value {
    let items = { let rtb = rt.borrow(); value::array_items(&rtb.heap, code).expect("caller checked Array") };
    if items.is_empty() {
        return code;
    }

    if is_closure_literal(&rt, &items) {
        return eval_closure_literal(rt, exec, branch, scope, dynamics, globals, items).await;
    }

    if let Some(head) = head_str(&rt, &items) {
        if head == reserved::QUOTE {
            return if items.len() == 2 {
                items[1]
            } else {
                raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("quote takes exactly one argument")).await
            };
        }
        if reserved::is_reserved_prefixed(&head) {
            return eval_special_form(rt, exec, branch, scope, dynamics, globals, head, items).await;
        }
    }

    eval_general_call(rt, exec, branch, scope, dynamics, globals, items).await
}

/// `$closure defs body fields` (§4.5): build the new scope via §4.6, finish
/// expanding `body` now if it was left unexpanded (the `macro.`-def case,
/// §4.4), evaluate `fields` as an ordinary object, and return the closure.
async fn eval_closure_literal(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    let defs = items[1];
    let body = items[2];
    let fields = items[3];

    let new_scope = match defs::assemble_scope(rt.clone(), exec.clone(), branch, scope, dynamics.clone(), globals, defs, None, false).await {
        Ok(s) => s,
        Err(v) => return v,
    };

    let deferred_body = expand::has_macro_def(&rt, defs);
    let final_body = if deferred_body {
        expand::expand(rt.clone(), exec.clone(), branch, new_scope.clone(), dynamics.clone(), globals, body).await
    } else {
        body
    };

    let fields_value = eval(rt.clone(), exec.clone(), branch, new_scope.clone(), dynamics, globals, fields).await;
    let field_entries = { let rtb = rt.borrow(); value::object_entries(&rtb.heap, fields_value).unwrap_or_default() };

    let mut rtb = rt.borrow_mut();
    let closure = Closure { captured_scope: new_scope, body: final_body, fields: field_entries };
    Value::Closure(rtb.heap.alloc(HeapData::Closure(closure)))
}

async fn eval_special_form(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, head: String, items: Vec<Value>) -> Value {
    match head.as_str() {
        reserved::IF => eval_if(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::THEN => eval_then(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::APPLY => eval_apply(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::DYNAMIC_GET => eval_dynamic_get(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::DYNAMIC_LET => eval_dynamic_let(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::CONTEXT_GET => eval_context_get(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::JUNCTION => eval_junction(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::EVAL => eval_eval(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::MACROEXPAND => eval_macroexpand(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::ARRAY_MAKE => eval_array_make(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::OBJECT_MAKE => eval_object_make(rt, exec, branch, scope, dynamics, globals, items).await,
        reserved::EVAL_SYNTAX_QUOTE | reserved::EVAL_UNQUOTE | reserved::EVAL_UNQUOTE_SPLICING => {
            raise_here(rt, exec, branch, dynamics, globals, JasprError::no_primitive(&head)).await
        }
        other => {
            let primitive = { let id = rt.borrow_mut().interns.intern(other); rt.borrow().primitives.get(&id).copied() };
            match primitive {
                Some(callee) => {
                    let args = items[1..].to_vec();
                    let forced_args = force_all(rt.clone(), exec.clone(), branch, scope, dynamics.clone(), globals, args).await;
                    call_dispatch(rt, exec, branch, dynamics, globals, callee, forced_args).await
                }
                None => raise_here(rt, exec, branch, dynamics, globals, JasprError::no_primitive(other)).await,
            }
        }
    }
}

async fn eval_if(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 4 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$if takes exactly 3 arguments")).await;
    }
    let cond = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    let cond = fiber::force(rt.clone(), cond).await;
    let truthy = { let rtb = rt.borrow(); cond.is_truthy(&rtb.heap, &rtb.interns) };
    let branch_expr = if truthy { items[2] } else { items[3] };
    eval(rt, exec, branch, scope, dynamics, globals, branch_expr).await
}

async fn eval_then(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 3 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$then takes exactly 2 arguments")).await;
    }
    let _ = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    eval(rt, exec, branch, scope, dynamics, globals, items[2]).await
}

async fn eval_apply(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 3 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$apply takes exactly 2 arguments")).await;
    }
    let callee = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    let callee = fiber::force(rt.clone(), callee).await;
    let args_value = eval(rt.clone(), exec.clone(), branch, scope, dynamics.clone(), globals, items[2]).await;
    let args_value = fiber::force(rt.clone(), args_value).await;
    let Some(arg_items) = ({ let rtb = rt.borrow(); value::array_items(&rtb.heap, args_value) }) else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$apply: second argument must evaluate to an array")).await;
    };
    let forced = force_values(rt.clone(), arg_items).await;
    call_dispatch(rt, exec, branch, dynamics, globals, callee, forced).await
}

async fn eval_dynamic_get(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 2 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$dynamicGet takes exactly 1 argument")).await;
    }
    let dyn_val = eval(rt.clone(), exec.clone(), branch, scope, dynamics.clone(), globals, items[1]).await;
    let dyn_val = fiber::force(rt.clone(), dyn_val).await;
    let Value::Dynamic(key) = dyn_val else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$dynamicGet: argument must be a dynamic handle")).await;
    };
    match dynamics.lookup(key) {
        Some(v) => fiber::force(rt, v).await,
        None => {
            let rtb = rt.borrow();
            let HeapData::Dynamic(var) = rtb.heap.get(key) else { unreachable!("Dynamic HeapId must address HeapData::Dynamic") };
            var.default
        }
    }
}

async fn eval_dynamic_let(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 4 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$dynamicLet takes exactly 3 arguments")).await;
    }
    let dyn_val = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    let dyn_val = fiber::force(rt.clone(), dyn_val).await;
    let Value::Dynamic(key) = dyn_val else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$dynamicLet: first argument must be a dynamic handle")).await;
    };
    let new_value = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[2]).await;
    let extended = dynamics.push(key, new_value);
    eval(rt, exec, branch, scope, extended, globals, items[3]).await
}

async fn eval_context_get(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 3 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$contextGet takes exactly 2 arguments")).await;
    }
    let ctx_val = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    let ctx_val = fiber::force(rt.clone(), ctx_val).await;
    let name_val = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[2]).await;
    let name_val = fiber::force(rt.clone(), name_val).await;
    let (Value::Str(ctx_id), Value::Str(name_id)) = (ctx_val, name_val) else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$contextGet: both arguments must be strings")).await;
    };
    let ctx_text = rt.borrow().interns.get(ctx_id).to_owned();
    let Some(ctx) = parse_context(&ctx_text) else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args(format!("$contextGet: unknown context {ctx_text:?}"))).await;
    };
    match scope.lookup(ctx, name_id) {
        Some(v) => fiber::force(rt, v).await,
        None => {
            let name_text = rt.borrow().interns.get(name_id).to_owned();
            raise_here(rt, exec, branch, dynamics, globals, JasprError::no_binding(format!("no {ctx_text} binding for {name_text:?}"))).await
        }
    }
}

pub(crate) fn parse_context(s: &str) -> Option<Context> {
    Some(match s {
        "value" => Context::Value,
        "macro" => Context::Macro,
        "check" => Context::Check,
        "doc" => Context::Doc,
        "test" => Context::Test,
        _ => return None,
    })
}

async fn eval_junction(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() < 2 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$junction takes at least one argument")).await;
    }
    let futures: Vec<BoxFuture<Value>> = items[1..]
        .iter()
        .map(|&expr| eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, expr))
        .collect();
    match fiber::spawn_junction(&exec, &rt, branch, futures) {
        Ok(handle) => handle.await_result(&rt).await,
        Err(err) => raise_here(rt, exec, branch, dynamics, globals, err).await,
    }
}

async fn eval_eval(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 2 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$eval takes exactly 1 argument")).await;
    }
    let inner_code = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    let inner_code = fiber::force(rt.clone(), inner_code).await;
    eval(rt, exec, branch, scope, dynamics, globals, inner_code).await
}

async fn eval_macroexpand(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 2 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$macroexpand takes exactly 1 argument")).await;
    }
    let inner_code = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    let inner_code = fiber::force(rt.clone(), inner_code).await;
    expand::expand(rt, exec, branch, scope, dynamics, globals, inner_code).await
}

async fn eval_array_make(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 3 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$arrayMake takes exactly 2 arguments")).await;
    }
    let callee = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    let callee = fiber::force(rt.clone(), callee).await;
    let len_val = eval(rt.clone(), exec.clone(), branch, scope, dynamics.clone(), globals, items[2]).await;
    let len_val = fiber::force(rt.clone(), len_val).await;
    let Value::Number(len_f) = len_val else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$arrayMake: length must be a number")).await;
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let len = if len_f.is_sign_negative() || !len_f.is_finite() { 0usize } else { len_f as usize };

    let mut slots = Vec::with_capacity(len);
    for i in 0..len {
        #[allow(clippy::cast_precision_loss)]
        let index = Value::Number(i as f64);
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let dynamics2 = dynamics.clone();
        let fut: BoxFuture<Value> = Box::pin(async move { call_dispatch(rt2, exec2, branch, dynamics2, globals, callee, vec![index]).await });
        slots.push(fiber::spawn_fiber(&exec, &rt, branch, fut).into_deferred());
    }
    let mut rtb = rt.borrow_mut();
    value::make_array(&mut rtb.heap, slots)
}

async fn eval_object_make(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    if items.len() != 3 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$objectMake takes exactly 2 arguments")).await;
    }
    let callee = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[1]).await;
    let callee = fiber::force(rt.clone(), callee).await;
    let keys_val = eval(rt.clone(), exec.clone(), branch, scope, dynamics.clone(), globals, items[2]).await;
    let keys_val = fiber::force(rt.clone(), keys_val).await;
    let Some(key_items) = ({ let rtb = rt.borrow(); value::array_items(&rtb.heap, keys_val) }) else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$objectMake: keys must be an array")).await;
    };
    let keys = force_values(rt.clone(), key_items).await;

    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        let Value::Str(key_id) = key else {
            return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("$objectMake: every key must be a string")).await;
        };
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let dynamics2 = dynamics.clone();
        let fut: BoxFuture<Value> = Box::pin(async move { call_dispatch(rt2, exec2, branch, dynamics2, globals, callee, vec![key]).await });
        entries.push((key_id, fiber::spawn_fiber(&exec, &rt, branch, fut).into_deferred()));
    }
    let mut rtb = rt.borrow_mut();
    value::make_object(&mut rtb.heap, entries)
}

/// General call (§4.5 "General calls"): head is not a literal special-form
/// string. Evaluate head and each argument as independent fibers (§2: "spawn
/// sub-fibers for subterms that may run in parallel"; §5 "argument order of
/// evaluation is unspecified"), then dispatch.
async fn eval_general_call(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    let head_fut: BoxFuture<Value> = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, items[0]);
    let head_handle = fiber::spawn_fiber(&exec, &rt, branch, head_fut);

    let mut arg_handles = Vec::with_capacity(items.len() - 1);
    for &arg in &items[1..] {
        let fut: BoxFuture<Value> = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, arg);
        arg_handles.push(fiber::spawn_fiber(&exec, &rt, branch, fut));
    }

    let head_value = fiber::force(rt.clone(), head_handle.await_result(&rt).await).await;
    let mut args = Vec::with_capacity(arg_handles.len());
    for handle in arg_handles {
        args.push(fiber::force(rt.clone(), handle.await_result(&rt).await).await);
    }

    call_dispatch(rt, exec, branch, dynamics, globals, head_value, args).await
}

/// Forces a list of already-evaluated code results (used by `$apply` /
/// `$objectMake`, whose argument/key lists are themselves runtime values,
/// not expressions).
async fn force_values(rt: Rt, values: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        out.push(fiber::force(rt.clone(), v).await);
    }
    out
}

/// Evaluates and forces each of `exprs` as code (used by the user-registered
/// primitives path, §6.5: "arguments ... are always fully resolved first").
async fn force_all(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, exprs: Vec<Value>) -> Vec<Value> {
    let mut handles = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let fut: BoxFuture<Value> = eval(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, expr);
        handles.push(fiber::spawn_fiber(&exec, &rt, branch, fut));
    }
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(fiber::force(rt.clone(), handle.await_result(&rt).await).await);
    }
    out
}

/// Call dispatch (§4.5.1). `args` are already fully forced `Value`s.
pub(crate) fn call_dispatch(rt: Rt, exec: Ex, branch: BranchId, dynamics: Dynamics, globals: Globals, callee: Value, args: Vec<Value>) -> BoxFuture<Value> {
    Box::pin(async move {
        match callee {
            Value::Closure(id) => apply_closure(rt, exec, branch, dynamics, globals, id, args).await,
            Value::Native(id) => {
                let native = { let rtb = rt.borrow(); let HeapData::Native(f) = rtb.heap.get(id) else { unreachable!("Native HeapId must address HeapData::Native") }; f.clone() };
                match native.call(&rt, args).await {
                    Ok(v) => v,
                    Err(err) => raise_here(rt, exec, branch, dynamics, globals, err).await,
                }
            }
            Value::Array(id) => {
                let is_empty = { let rtb = rt.borrow(); matches!(rtb.heap.get(id), HeapData::Array(items) if items.is_empty()) };
                if is_empty {
                    construct_object(rt, exec, branch, dynamics, globals, args).await
                } else {
                    raise_here(rt, exec, branch, dynamics, globals, JasprError::not_callable("array is not callable")).await
                }
            }
            Value::Object(id) => {
                let is_empty = { let rtb = rt.borrow(); matches!(rtb.heap.get(id), HeapData::Object(map) if map.is_empty()) };
                if is_empty {
                    construct_object(rt, exec, branch, dynamics, globals, args).await
                } else {
                    raise_here(rt, exec, branch, dynamics, globals, JasprError::not_callable("object is not callable")).await
                }
            }
            Value::Number(n) => index_array(rt, exec, branch, dynamics, globals, n, args).await,
            Value::Str(s) => index_object(rt, exec, branch, dynamics, globals, s, args).await,
            _ => raise_here(rt, exec, branch, dynamics, globals, JasprError::not_callable("value is not callable")).await,
        }
    })
}

async fn construct_object(rt: Rt, exec: Ex, branch: BranchId, dynamics: Dynamics, globals: Globals, args: Vec<Value>) -> Value {
    let result = { let mut rtb = rt.borrow_mut(); crate::builtins::object_from_pairs(&mut rtb, &args) };
    match result {
        Ok(v) => v,
        Err(err) => raise_here(rt, exec, branch, dynamics, globals, err).await,
    }
}

async fn index_array(rt: Rt, exec: Ex, branch: BranchId, dynamics: Dynamics, globals: Globals, n: f64, args: Vec<Value>) -> Value {
    if args.len() != 1 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("numeric index takes exactly 1 argument")).await;
    }
    let Some(items) = ({ let rtb = rt.borrow(); value::array_items(&rtb.heap, args[0]) }) else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("numeric index: argument must be an array")).await;
    };
    #[allow(clippy::cast_possible_truncation)]
    let idx = n as i64;
    let len = items.len() as i64;
    let resolved = if idx < 0 { idx + len } else { idx };
    if resolved < 0 || resolved >= len {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::no_key(format!("index {idx} out of range for array of length {len}"))).await;
    }
    #[allow(clippy::cast_sign_loss)]
    let slot = items[resolved as usize];
    fiber::force(rt, slot).await
}

/// Entries visible to string-key indexing (§4.5.1 "string ... look up ... as
/// a key of the single argument, must be an object"). A closure counts too:
/// §3.1/§3.2 describe a magic object as "an ordinary mapping that
/// additionally carries a hidden handle", so a closure literal's `fields`
/// map is reachable through ordinary key lookup exactly like a plain
/// object's entries, even though the closure itself is never itself treated
/// as a plain object by call dispatch (it's called instead, §4.5.1).
fn indexable_entries(rt: &Rt, v: Value) -> Option<Vec<(crate::intern::StringId, Value)>> {
    if let Some(entries) = { let rtb = rt.borrow(); value::object_entries(&rtb.heap, v) } {
        return Some(entries);
    }
    if let Value::Closure(id) = v {
        let rtb = rt.borrow();
        let HeapData::Closure(c) = rtb.heap.get(id) else { unreachable!("Closure HeapId must address HeapData::Closure") };
        return Some(c.fields.clone());
    }
    None
}

async fn index_object(rt: Rt, exec: Ex, branch: BranchId, dynamics: Dynamics, globals: Globals, key: crate::intern::StringId, args: Vec<Value>) -> Value {
    if args.len() != 1 {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("string index takes exactly 1 argument")).await;
    }
    let Some(entries) = indexable_entries(&rt, args[0]) else {
        return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("string index: argument must be an object")).await;
    };
    match entries.into_iter().find(|(k, _)| *k == key) {
        Some((_, v)) => fiber::force(rt, v).await,
        None => {
            let key_text = rt.borrow().interns.get(key).to_owned();
            raise_here(rt, exec, branch, dynamics, globals, JasprError::no_key(format!("no key {key_text:?}"))).await
        }
    }
}

/// Closure call dispatch (§4.5.1): resolve body and scope, rebind `$args` to
/// the arguments within a fresh `value`-context layer, evaluate body as a
/// tail call. Exposed crate-wide: the signal path (§4.7) calls a bound signal
/// handler the same way, and the macro-expander (§4.4) calls a macro as an
/// ordinary function over unevaluated arguments.
pub(crate) async fn apply_closure(rt: Rt, exec: Ex, branch: BranchId, dynamics: Dynamics, globals: Globals, closure_id: HeapId, args: Vec<Value>) -> Value {
    let (captured_scope, body) = {
        let rtb = rt.borrow();
        let HeapData::Closure(c) = rtb.heap.get(closure_id) else { unreachable!("Closure HeapId must address HeapData::Closure") };
        (c.captured_scope.clone(), c.body)
    };

    let args_array = { let mut rtb = rt.borrow_mut(); value::make_array(&mut rtb.heap, args) };
    let mut builder = captured_scope.child();
    let args_name = { let mut rtb = rt.borrow_mut(); rtb.interns.intern(reserved::ARGS) };
    builder.define(Context::Value, args_name, args_array);
    let call_scope = builder.finish();

    eval(rt, exec, branch, call_scope, dynamics, globals, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builtins,
        fiber::{Executor, Runtime},
        heap::HeapData as HD,
    };
    use std::{cell::RefCell, rc::Rc};

    fn setup() -> (Rt, Ex, BranchId, Scope, Dynamics, Globals) {
        let mut runtime = Runtime::new();
        let signal_handler = runtime.heap.alloc(HD::Dynamic(crate::dynamic::DynamicVar { default: Value::Null }));
        let name = runtime.heap.alloc(HD::Dynamic(crate::dynamic::DynamicVar { default: Value::Null }));
        let globals = Globals { signal_handler, name };
        let scope = builtins::install_prelude(&mut runtime, globals);
        let branch = runtime.root_branch();
        let rt: Rt = Rc::new(RefCell::new(runtime));
        let exec = Executor::new_shared();
        (rt, exec, branch, scope, Dynamics::empty(), globals)
    }

    fn run_eval(code: serde_json::Value) -> serde_json::Value {
        let (rt, exec, branch, scope, dynamics, globals) = setup();
        let value = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &code) };
        let out = Rc::new(RefCell::new(None));
        let out2 = out.clone();
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let expanded = expand::expand(rt2.clone(), exec2.clone(), branch, scope.clone(), dynamics.clone(), globals, value).await;
            let result = eval(rt2, exec2, branch, scope, dynamics, globals, expanded).await;
            *out2.borrow_mut() = Some(result);
            Value::Null
        });
        fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);
        let result = out.borrow().expect("eval fiber did not complete");
        let rtb = rt.borrow();
        value::to_json(&rtb.heap, &rtb.interns, result).unwrap()
    }

    #[test]
    fn if_scenarios_from_spec() {
        assert_eq!(run_eval(serde_json::json!(["$if", true, 1.0, 2.0])), serde_json::json!(1.0));
        assert_eq!(run_eval(serde_json::json!(["$if", false, 1.0, 2.0])), serde_json::json!(2.0));
        assert_eq!(run_eval(serde_json::json!(["$if", 0.0, 1.0, 2.0])), serde_json::json!(2.0));
        assert_eq!(run_eval(serde_json::json!(["$if", [], 1.0, 2.0])), serde_json::json!(2.0));
        assert_eq!(run_eval(serde_json::json!(["$if", "", 1.0, 2.0])), serde_json::json!(2.0));
    }

    #[test]
    fn quote_round_trips_any_pure_json() {
        let tree = serde_json::json!({"a": [1.0, null, true, "x"]});
        assert_eq!(run_eval(serde_json::json!(["", tree.clone()])), tree);
    }

    #[test]
    fn closure_call_binds_args_and_indexes_them() {
        // C = $closure{{}, ["$add", 1, [0, "$args"]], {}}; [C, 4] -> 5
        let closure = serde_json::json!(["$closure", {}, ["$add", 1.0, [0.0, "$args"]], {}]);
        let call = serde_json::json!([closure, 4.0]);
        assert_eq!(run_eval(call), serde_json::json!(5.0));
    }

    #[test]
    fn numeric_index_scenarios() {
        assert_eq!(run_eval(serde_json::json!([0.0, ["", ["a", "b"]]])), serde_json::json!("a"));
        assert_eq!(run_eval(serde_json::json!([-1.0, ["", ["a", "b"]]])), serde_json::json!("b"));
    }

    #[test]
    fn numeric_index_out_of_range_raises_no_key() {
        // With no signal handler bound, the raise cancels the branch and the
        // fiber never resolves; observe that instead of a returned value.
        let (rt, exec, branch, scope, dynamics, globals) = setup();
        let code = serde_json::json!([2.0, ["", ["a", "b"]]]);
        let value = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &code) };
        let fut: BoxFuture<Value> = eval(rt.clone(), exec.clone(), branch, scope, dynamics, globals, value);
        let handle = fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);
        assert!(rt.borrow().is_cancelled(branch));
        let _ = handle;
    }

    #[test]
    fn object_form_index_scenarios() {
        let target = serde_json::json!(["", {"a": 1.0, "b": 2.0}]);
        assert_eq!(run_eval(serde_json::json!([["", "b"], target.clone()])), serde_json::json!(2.0));
    }

    #[test]
    fn closure_user_fields_are_reachable_by_string_key() {
        // A closure is a magic object that's "an ordinary mapping ... carrying
        // a hidden handle" (§3.1/§3.2): its `fields` map is visible to ordinary
        // string-key indexing, same as any plain object's entries.
        let closure = serde_json::json!(["$closure", {}, ["", null], {"tag": ["", "greeter"]}]);
        let code = serde_json::json!([["", "tag"], closure]);
        assert_eq!(run_eval(code), serde_json::json!("greeter"));
    }

    #[test]
    fn empty_array_call_constructs_object() {
        let code = serde_json::json!([[], ["", "a"], 1.0, ["", "b"], 2.0]);
        assert_eq!(run_eval(code), serde_json::json!({"a": 1.0, "b": 2.0}));
    }

    #[test]
    fn arity_mismatch_on_if_cancels_branch() {
        let (rt, exec, branch, scope, dynamics, globals) = setup();
        let code = serde_json::json!(["$if", true]);
        let value = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &code) };
        let fut: BoxFuture<Value> = eval(rt.clone(), exec.clone(), branch, scope, dynamics, globals, value);
        fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);
        assert!(rt.borrow().is_cancelled(branch));
    }

    #[test]
    fn junction_returns_the_fast_result() {
        // One branch sleeps forever ($dynamicGet on an unbound dynamic whose
        // default never resolves would still terminate, so use an explicit
        // never-resolving form: a call to a closure that itself recurses
        // infinitely is overkill here — model "slow" as a channel recv with
        // nothing ever sent, via a native function that never completes).
        let (rt, exec, branch, scope, dynamics, globals) = setup();
        let never = {
            let mut rtb = rt.borrow_mut();
            let f = NativeFn::r#async(|_rt, _args| Box::pin(std::future::pending()));
            Value::Native(rtb.heap.alloc(HD::Native(f)))
        };
        let never_name = { rt.borrow_mut().interns.intern("never") };
        let mut builder = scope.child();
        builder.define(Context::Value, never_name, never);
        let scope = builder.finish();

        let code = serde_json::json!(["$junction", ["", 1.0], ["never"]]);
        let value = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &code) };
        let out = Rc::new(RefCell::new(None));
        let out2 = out.clone();
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let expanded = expand::expand(rt2.clone(), exec2.clone(), branch, scope.clone(), dynamics.clone(), globals, value).await;
            let result = eval(rt2, exec2, branch, scope, dynamics, globals, expanded).await;
            *out2.borrow_mut() = Some(result);
            Value::Null
        });
        fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);
        let result = out.borrow().expect("junction fiber did not complete");
        let rtb = rt.borrow();
        assert_eq!(value::to_json(&rtb.heap, &rtb.interns, result).unwrap(), serde_json::json!(1.0));
    }

    #[test]
    fn syntax_quote_unquote_evaluates_the_inner_expression() {
        // `["$syntaxQuote", ["$unquote", "foo"]]` unwraps to exactly `foo`'s
        // value — a single unquote contributes no structure of its own.
        let (rt, exec, branch, scope, dynamics, globals) = setup();
        let foo_name = { rt.borrow_mut().interns.intern("foo") };
        let mut builder = scope.child();
        builder.define(Context::Value, foo_name, Value::Number(1.0));
        let scope = builder.finish();

        let code = serde_json::json!(["$syntaxQuote", ["$unquote", "foo"]]);
        let value = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &code) };
        let out = Rc::new(RefCell::new(None));
        let out2 = out.clone();
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let expanded = expand::expand(rt2.clone(), exec2.clone(), branch, scope.clone(), dynamics.clone(), globals, value).await;
            let result = eval(rt2, exec2, branch, scope, dynamics, globals, expanded).await;
            *out2.borrow_mut() = Some(result);
            Value::Null
        });
        fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);
        let result = out.borrow().expect("syntax-quote fiber did not complete");
        let rtb = rt.borrow();
        assert_eq!(value::to_json(&rtb.heap, &rtb.interns, result).unwrap(), serde_json::json!(1.0));
    }

    #[test]
    fn syntax_quote_splicing_flattens_into_surrounding_array() {
        // `[1 ~@[2 3] 4]` splices the quoted array in place: [1, 2, 3, 4].
        let code = serde_json::json!(["$syntaxQuote", [1.0, ["$unquoteSplicing", ["", [2.0, 3.0]]], 4.0]]);
        assert_eq!(run_eval(code), serde_json::json!([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn dynamic_let_shadows_and_restores() {
        let (rt, exec, branch, scope, dynamics, globals) = setup();
        let default_val = Value::Number(0.0);
        let dyn_id = { let mut rtb = rt.borrow_mut(); rtb.heap.alloc(HD::Dynamic(crate::dynamic::DynamicVar { default: default_val })) };
        let dyn_val = Value::Dynamic(dyn_id);
        let d_name = { rt.borrow_mut().interns.intern("d") };
        let mut builder = scope.child();
        builder.define(Context::Value, d_name, dyn_val);
        let scope = builder.finish();

        let code = serde_json::json!(["$dynamicLet", "d", 1.0, ["$dynamicGet", "d"]]);
        let value = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &code) };
        let out = Rc::new(RefCell::new(None));
        let out2 = out.clone();
        let rt2 = rt.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let result = eval(rt2, exec.clone(), branch, scope, dynamics, globals, value).await;
            *out2.borrow_mut() = Some(result);
            Value::Null
        });
        let exec2 = Executor::new_shared();
        fiber::spawn_fiber(&exec2, &rt, branch, fut);
        Executor::run_until_stalled(&exec2);
        let result = out.borrow().expect("dynamic-let fiber did not complete");
        let rtb = rt.borrow();
        assert_eq!(value::to_json(&rtb.heap, &rtb.interns, result).unwrap(), serde_json::json!(1.0));
    }
}
