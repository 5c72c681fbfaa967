//! The Scope/Defs assembler (§4.6): builds a new [`Scope`] from a
//! definitions object so that every definition in it is simultaneously
//! visible, supporting mutual recursion regardless of the order definitions
//! appear in the source.
//!
//! Used both by the evaluator's `$closure` handling (nested defs, no module
//! namespace, `doc`/`test` contexts rejected) and by [`crate::run_module`]/
//! [`crate::run_script`] (module-level defs, namespace optional, `doc`/`test`
//! permitted).

use crate::{
    dynamic::Dynamics,
    error::{ErrCode, JasprError},
    eval, expand,
    fiber::{self, BoxFuture, BranchId, Ex, Rt},
    scope::{Context, Scope},
    signal::{self, Globals},
    value::{self, Value},
};

/// A module's identity (§6.2): `{module-name, version}`. `None` means a
/// script with no module qualification — every definition is bound only
/// under its short name, and syntax-quote's qualified-name lookup is a
/// pass-through (§3.3 `resolve_qualified`'s documented fallback).
#[derive(Debug, Clone)]
pub struct Namespace {
    pub module: String,
    pub version: String,
}

impl Namespace {
    #[must_use]
    pub fn new(module: impl Into<String>, version: impl Into<String>) -> Self {
        Self { module: module.into(), version: version.into() }
    }

    /// The `"{module}@{version}.{ident}"` shape this implementation fixes
    /// for the spec's unspecified "fully qualified name" string (§4.6
    /// expansion note, resolved in `DESIGN.md`).
    fn qualify(&self, ident: &str) -> String {
        format!("{}@{}.{ident}", self.module, self.version)
    }

    fn module_dotted(&self, ident: &str) -> String {
        format!("{}.{ident}", self.module)
    }
}

struct ParsedDef {
    ctx: Context,
    ident: String,
    raw: Value,
}

fn split_context(key: &str) -> (Context, &str) {
    if let Some(idx) = key.rfind('.') {
        let (prefix, rest) = (&key[..idx], &key[idx + 1..]);
        if let Some(ctx) = eval::parse_context(prefix) {
            return (ctx, rest);
        }
    }
    (Context::Value, key)
}

/// The legal-name check from §4.6 step 1: no leading `$`, no empty segments,
/// not `null`/`true`/`false`, not a bare number.
fn is_legal_ident(ident: &str) -> bool {
    if ident.is_empty() || ident.starts_with('$') {
        return false;
    }
    if matches!(ident, "null" | "true" | "false") {
        return false;
    }
    if ident.parse::<f64>().is_ok() {
        return false;
    }
    ident.split('.').all(|seg| !seg.is_empty() && !seg.starts_with(|c: char| c.is_ascii_digit()))
}

async fn raise_here(rt: Rt, exec: Ex, branch: BranchId, dynamics: Dynamics, globals: Globals, err: JasprError) -> Value {
    signal::raise(rt, exec, branch, dynamics, globals, err).await
}

/// Builds a new child scope from `defs` (§4.6). `top_level` gates whether
/// `doc`/`test` contexts are permitted (module-level defs only, never a
/// `$closure` literal's `defs`, §4.6 step 1).
///
/// Returns `Err(value)` when assembly itself fails structurally (a bad name,
/// a misplaced `doc`/`test` context, a non-string `doc` value) — `value` is
/// whatever `raise()` resolved to (a resumed value, or a future that never
/// completes on a cancelled branch, exactly like any other evaluator error).
#[allow(clippy::too_many_arguments)]
pub(crate) async fn assemble_scope(
    rt: Rt,
    exec: Ex,
    branch: BranchId,
    parent: Scope,
    dynamics: Dynamics,
    globals: Globals,
    defs: Value,
    namespace: Option<Namespace>,
    top_level: bool,
) -> Result<Scope, Value> {
    let entries = { let rtb = rt.borrow(); value::object_entries(&rtb.heap, defs).unwrap_or_default() };

    let mut parsed = Vec::with_capacity(entries.len());
    for (key_id, raw) in entries {
        let key = rt.borrow().interns.get(key_id).to_owned();
        let (ctx, ident) = split_context(&key);
        let ident = ident.to_owned();

        if matches!(ctx, Context::Doc | Context::Test) && !top_level {
            return Err(raise_here(
                rt,
                exec,
                branch,
                dynamics,
                globals,
                JasprError::new(ErrCode::BadName, format!("{key:?}: doc/test definitions are only permitted at module top level")),
            )
            .await);
        }
        if !is_legal_ident(&ident) {
            return Err(raise_here(rt, exec, branch, dynamics, globals, JasprError::new(ErrCode::BadName, format!("illegal definition name: {key:?}"))).await);
        }
        if ctx == Context::Doc && !matches!(raw, Value::Str(_)) {
            return Err(raise_here(rt, exec, branch, dynamics, globals, JasprError::new(ErrCode::BadName, format!("doc.{ident}: value must be a literal string"))).await);
        }

        parsed.push(ParsedDef { ctx, ident, raw });
    }

    // Placeholder pass (§4.6 step 2): every non-doc/test definition gets a
    // fresh Deferred before any body evaluates, so forward references and
    // mutual recursion work unconditionally.
    let mut builder = parent.child();
    let mut placeholders = Vec::with_capacity(parsed.len());
    for def in &parsed {
        if matches!(def.ctx, Context::Doc | Context::Test) {
            let ident_id = { rt.borrow_mut().interns.intern(&def.ident) };
            builder.define(def.ctx, ident_id, def.raw);
            continue;
        }

        let placeholder = fiber::new_deferred(&rt);
        let placeholder_val = Value::Deferred(placeholder);
        let ident_id = { rt.borrow_mut().interns.intern(&def.ident) };
        builder.define(def.ctx, ident_id, placeholder_val);

        let qualified_name = if let Some(ns) = &namespace {
            let module_dotted_id = { rt.borrow_mut().interns.intern(&ns.module_dotted(&def.ident)) };
            builder.define(def.ctx, module_dotted_id, placeholder_val);
            let qualified = ns.qualify(&def.ident);
            let qualified_id = { rt.borrow_mut().interns.intern(&qualified) };
            builder.define(def.ctx, qualified_id, placeholder_val);
            builder.alias_qualified(ident_id, qualified_id);
            qualified
        } else {
            def.ident.clone()
        };

        placeholders.push((placeholder, qualified_name, def.ctx, def.raw));
    }

    let new_scope = builder.finish();

    // Evaluate pass (§4.6 step 4): macro-expand then evaluate each body in
    // the new scope, with `name` bound to its fully-qualified identifier,
    // resolving the matching placeholder. Spawned as independent fibers: a
    // definition that references a sibling simply awaits that sibling's
    // still-unresolved Deferred, which this crate's cooperative scheduler
    // resolves whenever that sibling's own fiber completes, in any order.
    for (placeholder, qualified_name, _ctx, raw) in placeholders {
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let scope2 = new_scope.clone();
        let dynamics2 = dynamics.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let name_val = Value::Str({ rt2.borrow_mut().interns.intern(&qualified_name) });
            let def_dynamics = dynamics2.push(globals.name, name_val);
            let expanded = expand::expand(rt2.clone(), exec2.clone(), branch, scope2.clone(), def_dynamics.clone(), globals, raw).await;
            let result = eval::eval(rt2.clone(), exec2, branch, scope2, def_dynamics, globals, expanded).await;
            fiber::resolve_deferred(&rt2, placeholder, result);
            Value::Null
        });
        fiber::spawn_fiber(&exec, &rt, branch, fut);
    }

    Ok(new_scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builtins,
        fiber::{Executor, Runtime},
        heap::HeapData,
    };
    use std::{cell::RefCell, rc::Rc};

    fn setup() -> (Rt, Ex, BranchId, Scope, Globals) {
        let mut runtime = Runtime::new();
        let signal_handler = runtime.heap.alloc(HeapData::Dynamic(crate::dynamic::DynamicVar { default: Value::Null }));
        let name = runtime.heap.alloc(HeapData::Dynamic(crate::dynamic::DynamicVar { default: Value::Null }));
        let globals = Globals { signal_handler, name };
        let scope = builtins::install_prelude(&mut runtime, globals);
        let branch = runtime.root_branch();
        let rt: Rt = Rc::new(RefCell::new(runtime));
        let exec = Executor::new_shared();
        (rt, exec, branch, scope, globals)
    }

    #[test]
    fn mutual_recursion_resolves_regardless_of_definition_order() {
        let (rt, exec, branch, scope, globals) = setup();
        // b is defined after a but a's body (quoted, never actually calls b -
        // the assembler itself doesn't need real recursion to prove ordering
        // independence) references it by name.
        let defs = serde_json::json!({
            "a": ["", "placeholder-a"],
            "b": ["", "placeholder-b"],
        });
        let defs_val = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &defs) };

        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let new_scope = assemble_scope(rt2, exec2, branch, scope, Dynamics::empty(), globals, defs_val, None, true).await.unwrap();
            *result2.borrow_mut() = Some(new_scope);
            Value::Null
        });
        fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);

        let new_scope = result.borrow().clone().expect("assembly did not complete");
        let a_id = rt.borrow_mut().interns.intern("a");
        let b_id = rt.borrow_mut().interns.intern("b");
        let a_val = new_scope.lookup(Context::Value, a_id).unwrap();
        let b_val = new_scope.lookup(Context::Value, b_id).unwrap();
        let rtb = rt.borrow();
        assert_eq!(value::to_json(&rtb.heap, &rtb.interns, a_val), Some(serde_json::json!("placeholder-a")));
        assert_eq!(value::to_json(&rtb.heap, &rtb.interns, b_val), Some(serde_json::json!("placeholder-b")));
    }

    #[test]
    fn module_namespace_aliases_short_and_qualified_names() {
        let (rt, exec, branch, scope, globals) = setup();
        let defs = serde_json::json!({"f": ["", 1.0]});
        let defs_val = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &defs) };
        let ns = Namespace::new("mymod", "1.0.0");

        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let new_scope = assemble_scope(rt2, exec2, branch, scope, Dynamics::empty(), globals, defs_val, Some(ns), true).await.unwrap();
            *result2.borrow_mut() = Some(new_scope);
            Value::Null
        });
        fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);

        let new_scope = result.borrow().clone().expect("assembly did not complete");
        let short = rt.borrow_mut().interns.intern("f");
        let dotted = rt.borrow_mut().interns.intern("mymod.f");
        let qualified = rt.borrow_mut().interns.intern("mymod@1.0.0.f");
        assert!(new_scope.lookup(Context::Value, short).is_some());
        assert!(new_scope.lookup(Context::Value, dotted).is_some());
        assert!(new_scope.lookup(Context::Value, qualified).is_some());
        assert_eq!(new_scope.resolve_qualified(short), qualified);
    }

    #[test]
    fn doc_at_non_top_level_is_rejected() {
        let (rt, exec, branch, scope, globals) = setup();
        let defs = serde_json::json!({"doc.f": "hello"});
        let defs_val = { let mut rtb = rt.borrow_mut(); value::from_json(&mut rtb.heap, &mut rtb.interns, &defs) };

        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let outcome = assemble_scope(rt2, exec2, branch, scope, Dynamics::empty(), globals, defs_val, None, false).await;
            *result2.borrow_mut() = Some(outcome.is_err());
            Value::Null
        });
        fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);
        assert_eq!(*result.borrow(), Some(true));
    }
}
