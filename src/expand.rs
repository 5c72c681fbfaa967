//! The macro-expander (§4.4): rewrites a code tree using macros drawn from
//! scope, lowers `syntax-quote`, and leaves everything else untouched.
//!
//! Every public entry point is an `async fn`-shaped `BoxFuture` that never
//! returns a `Result`: a structural expansion error (bad arity on a special
//! form, a splice outside an array) is folded into a `raise()` call on the
//! current branch, exactly like the evaluator (see `SPEC_FULL.md`'s "uniform
//! error flow" note — there is no panic path distinct from user-raisable
//! errors).

use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;

use crate::{
    dynamic::Dynamics,
    error::JasprError,
    fiber::{self, BoxFuture, BranchId, Ex, Rt},
    intern::StringId,
    reserved,
    scope::{Context, Scope},
    signal::{self, Globals},
    value::{self, Value},
};

type Gensyms = Rc<RefCell<AHashMap<String, StringId>>>;

async fn raise_here(rt: Rt, exec: Ex, branch: BranchId, dynamics: Dynamics, globals: Globals, err: JasprError) -> Value {
    signal::raise(rt, exec, branch, dynamics, globals, err).await
}

/// Full macro-expansion pass (§4.4 "Full step"): top-expand, then recurse
/// into children, with the `["", x]` (opaque quote) and `$closure`-literal
/// exceptions.
pub(crate) fn expand(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, code: Value) -> BoxFuture<Value> {
    Box::pin(async move {
        let top = expand_top(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, code).await;

        if let Some(items) = { let rtb = rt.borrow(); value::array_items(&rtb.heap, top) } {
            if items.is_empty() || is_quote_form(&rt, &items) {
                return top;
            }
            if is_closure_literal(&rt, &items) {
                return expand_closure_literal(rt, exec, branch, scope, dynamics, globals, items).await;
            }
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, item).await);
            }
            let new_array = { let mut rtb = rt.borrow_mut(); value::make_array(&mut rtb.heap, out) };
            return new_array;
        }

        if let Some(entries) = { let rtb = rt.borrow(); value::object_entries(&rtb.heap, top) } {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let expanded = expand(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, v).await;
                out.push((k, expanded));
            }
            let new_object = { let mut rtb = rt.borrow_mut(); value::make_object(&mut rtb.heap, out) };
            return new_object;
        }

        top
    })
}

fn head_str(rt: &Rt, items: &[Value]) -> Option<String> {
    match items.first() {
        Some(Value::Str(s)) => Some(rt.borrow().interns.get(*s).to_owned()),
        _ => None,
    }
}

fn is_quote_form(rt: &Rt, items: &[Value]) -> bool {
    items.len() == 2 && head_str(rt, items).as_deref() == Some(reserved::QUOTE)
}

fn is_closure_literal(rt: &Rt, items: &[Value]) -> bool {
    items.len() == 4 && head_str(rt, items).as_deref() == Some(reserved::CLOSURE)
}

/// Whether a `$closure` literal's `defs` object declares any `macro.`-context
/// definition — the condition that defers body expansion to instantiation
/// time (§4.4). `defs` itself is always left untouched by `expand()`, and is
/// instead macro-expanded exactly once by the scope/defs assembler (§4.6),
/// whether it's building a `$closure`'s scope or a module's.
pub(crate) fn has_macro_def(rt: &Rt, defs: Value) -> bool {
    let rtb = rt.borrow();
    let Some(entries) = value::object_entries(&rtb.heap, defs) else { return false };
    entries.iter().any(|(k, _)| rtb.interns.get(*k).starts_with("macro."))
}

async fn expand_closure_literal(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, items: Vec<Value>) -> Value {
    let head = items[0];
    let defs = items[1];
    let body = items[2];
    let fields = items[3];

    let deferred = has_macro_def(&rt, defs);
    let new_body = if deferred {
        body
    } else {
        expand(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, body).await
    };

    let new_fields = if let Some(entries) = { let rtb = rt.borrow(); value::object_entries(&rtb.heap, fields) } {
        let mut out = Vec::with_capacity(entries.len());
        for (k, v) in entries {
            let top = expand_top(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, v).await;
            out.push((k, top));
        }
        let mut rtb = rt.borrow_mut();
        value::make_object(&mut rtb.heap, out)
    } else {
        fields
    };

    let mut rtb = rt.borrow_mut();
    value::make_array(&mut rtb.heap, vec![head, defs, new_body, new_fields])
}

/// Top-expand step (§4.4 "Top-level step"): dispatches on the literal
/// `syntax-quote` surface sugar and on macro invocation; loops so a macro's
/// own expansion is re-top-expanded. Scalars and objects never top-expand.
pub(crate) fn expand_top(rt: Rt, exec: Ex, branch: BranchId, scope: Scope, dynamics: Dynamics, globals: Globals, code: Value) -> BoxFuture<Value> {
    Box::pin(async move {
        let mut current = code;
        loop {
            let Some(items) = ({ let rtb = rt.borrow(); value::array_items(&rtb.heap, current) }) else {
                return current;
            };
            if items.is_empty() {
                return current;
            }
            let Some(head) = head_str(&rt, &items) else {
                return current;
            };

            if head == reserved::SYNTAX_QUOTE_SUGAR {
                if items.len() != 2 {
                    return raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("syntax-quote takes exactly one argument")).await;
                }
                let gensyms: Gensyms = Rc::new(RefCell::new(AHashMap::new()));
                let lowered = lower_syntax_quote(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, gensyms, items[1]).await;
                current = match lowered {
                    Ok(Lowered::Literal(v)) => {
                        let mut rtb = rt.borrow_mut();
                        value::quote(&mut rtb.heap, &mut rtb.interns, v)
                    }
                    Ok(Lowered::Expr(v)) => v,
                    Ok(Lowered::Splice(_)) => {
                        return raise_here(rt, exec, branch, dynamics, globals, JasprError::not_callable("unquote-splicing used outside an array")).await;
                    }
                    Err(value) => return value,
                };
                continue;
            }

            if reserved::is_reserved_prefixed(&head) {
                return current;
            }

            let name_id = { let mut rtb = rt.borrow_mut(); rtb.interns.intern(&head) };
            let Some(macro_value) = scope.lookup(Context::Macro, name_id) else {
                return current;
            };
            let forced = fiber::force(rt.clone(), macro_value).await;
            let Value::Closure(closure_id) = forced else {
                return raise_here(rt, exec, branch, dynamics, globals, JasprError::not_callable(format!("macro {head:?} is not a closure"))).await;
            };
            let args = items[1..].to_vec();
            current = crate::eval::apply_closure(rt.clone(), exec.clone(), branch, dynamics.clone(), globals, closure_id, args).await;
        }
    })
}

/// Result of lowering one syntax-quoted subtree (§4.4.1). `Literal` carries a
/// plain value safe to embed directly in a literal array/object without
/// further evaluation; `Expr` carries a code expression that must be
/// evaluated at runtime (an `unquote`, or any subtree containing one);
/// `Splice` carries an `unquote-splicing` expression, valid only as a direct
/// array child.
enum Lowered {
    Literal(Value),
    Expr(Value),
    Splice(Value),
}

/// §4.4.1 syntax-quote lowering.
///
/// **Redesign note (see `DESIGN.md`):** the literal wording would fold a
/// non-splice `unquote` inside an array into the same `["", [...]]` quote as
/// its literal siblings, which would silently stop it from ever re-evaluating
/// at runtime (quote is opaque to everything inside it, by definition — the
/// `""` head in §4.5). This implementation instead treats a lone `unquote`
/// exactly like a singleton `unquote-splicing`: it breaks the run and
/// contributes a one-element array built via `$arrayMake` (the only reserved
/// form that can construct an array from an arbitrary runtime expression,
/// since bare `[x]` syntax is itself a zero-argument call to `x`). This is
/// the only way `` `[1 ~foo 2] `` can re-evaluate `foo` on every use, matching
/// ordinary quasiquote semantics.
fn lower_syntax_quote(
    rt: Rt,
    exec: Ex,
    branch: BranchId,
    scope: Scope,
    dynamics: Dynamics,
    globals: Globals,
    gensyms: Gensyms,
    tree: Value,
) -> BoxFuture<Result<Lowered, Value>> {
    Box::pin(async move {
        match tree {
            Value::Str(s) => {
                let text = rt.borrow().interns.get(s).to_owned();
                if let Some(base) = reserved::gensym_target(&text) {
                    Ok(Lowered::Literal(Value::Str(gensym_for(&rt, &gensyms, base))))
                } else {
                    let resolved = scope.resolve_qualified(s);
                    Ok(Lowered::Literal(Value::Str(resolved)))
                }
            }
            Value::Array(_) => lower_array(rt, exec, branch, scope, dynamics, globals, gensyms, tree).await,
            Value::Object(_) => lower_object(rt, exec, branch, scope, dynamics, globals, gensyms, tree).await,
            scalar => Ok(Lowered::Literal(scalar)),
        }
    })
}

/// Interns (once per syntax-quote invocation) the gensym for `.NAME.`'s base
/// identifier, memoized in `gensyms` so every occurrence of `.NAME.` within
/// one syntax-quote resolves to the same fresh name (§4.4.1).
fn gensym_for(rt: &Rt, gensyms: &Gensyms, base: &str) -> StringId {
    if let Some(&id) = gensyms.borrow().get(base) {
        return id;
    }
    let id = rt.borrow_mut().interns.gensym(base);
    gensyms.borrow_mut().insert(base.to_owned(), id);
    id
}

async fn lower_array(
    rt: Rt,
    exec: Ex,
    branch: BranchId,
    scope: Scope,
    dynamics: Dynamics,
    globals: Globals,
    gensyms: Gensyms,
    tree: Value,
) -> Result<Lowered, Value> {
    let items = { let rtb = rt.borrow(); value::array_items(&rtb.heap, tree).expect("caller checked Array") };

    if items.is_empty() {
        return Ok(Lowered::Literal(tree));
    }
    if let Some(head) = head_str(&rt, &items) {
        if head == reserved::UNQUOTE {
            if items.len() != 2 {
                return Err(raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("unquote takes exactly one argument")).await);
            }
            return Ok(Lowered::Expr(items[1]));
        }
        if head == reserved::UNQUOTE_SPLICING {
            if items.len() != 2 {
                return Err(raise_here(rt, exec, branch, dynamics, globals, JasprError::bad_args("unquote-splicing takes exactly one argument")).await);
            }
            return Ok(Lowered::Splice(items[1]));
        }
    }

    let mut children = Vec::with_capacity(items.len());
    for item in items {
        children.push(lower_syntax_quote(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, gensyms.clone(), item).await?);
    }

    if children.iter().all(|c| matches!(c, Lowered::Literal(_))) {
        let values = children
            .into_iter()
            .map(|c| match c {
                Lowered::Literal(v) => v,
                Lowered::Expr(_) | Lowered::Splice(_) => unreachable!("checked all-Literal above"),
            })
            .collect();
        let array = { let mut rtb = rt.borrow_mut(); value::make_array(&mut rtb.heap, values) };
        return Ok(Lowered::Literal(array));
    }

    Ok(Lowered::Expr(build_array_concat(&rt, children)))
}

/// Builds `["$arrayMake", ["$closure", {}, expr, {}], 1]`: the single
/// reserved-form way to turn an arbitrary runtime expression into a
/// one-element array (see the redesign note on [`lower_syntax_quote`]).
fn singleton_array(rt: &Rt, expr: Value) -> Value {
    let mut rtb = rt.borrow_mut();
    let empty_defs = value::make_object(&mut rtb.heap, Vec::new());
    let empty_fields = value::make_object(&mut rtb.heap, Vec::new());
    let closure_head = Value::Str(rtb.interns.intern(reserved::CLOSURE));
    let closure_lit = value::make_array(&mut rtb.heap, vec![closure_head, empty_defs, expr, empty_fields]);
    let array_make_head = Value::Str(rtb.interns.intern(reserved::ARRAY_MAKE));
    value::make_array(&mut rtb.heap, vec![array_make_head, closure_lit, Value::Number(1.0)])
}

fn flush_run(rt: &Rt, run: &mut Vec<Value>, args: &mut Vec<Value>) {
    if run.is_empty() {
        return;
    }
    let taken = std::mem::take(run);
    let mut rtb = rt.borrow_mut();
    let literal = value::make_array(&mut rtb.heap, taken);
    let quoted = value::quote(&mut rtb.heap, &mut rtb.interns, literal);
    args.push(quoted);
}

fn build_array_concat(rt: &Rt, children: Vec<Lowered>) -> Value {
    let mut args = Vec::new();
    let mut run = Vec::new();

    for child in children {
        match child {
            Lowered::Literal(v) => run.push(v),
            Lowered::Expr(e) => {
                flush_run(rt, &mut run, &mut args);
                args.push(singleton_array(rt, e));
            }
            Lowered::Splice(x) => {
                flush_run(rt, &mut run, &mut args);
                args.push(x);
            }
        }
    }
    flush_run(rt, &mut run, &mut args);

    let mut rtb = rt.borrow_mut();
    let head = Value::Str(rtb.interns.intern(reserved::ARRAY_CONCAT));
    let mut call = Vec::with_capacity(args.len() + 1);
    call.push(head);
    call.extend(args);
    value::make_array(&mut rtb.heap, call)
}

async fn lower_object(
    rt: Rt,
    exec: Ex,
    branch: BranchId,
    scope: Scope,
    dynamics: Dynamics,
    globals: Globals,
    gensyms: Gensyms,
    tree: Value,
) -> Result<Lowered, Value> {
    let entries = { let rtb = rt.borrow(); value::object_entries(&rtb.heap, tree).expect("caller checked Object") };

    let mut lowered_entries = Vec::with_capacity(entries.len());
    let mut all_literal = true;
    for (key, value) in entries {
        let key_text = rt.borrow().interns.get(key).to_owned();
        let new_key = if let Some(base) = reserved::gensym_target(&key_text) {
            gensym_for(&rt, &gensyms, base)
        } else {
            scope.resolve_qualified(key)
        };
        let lowered = lower_syntax_quote(rt.clone(), exec.clone(), branch, scope.clone(), dynamics.clone(), globals, gensyms.clone(), value).await?;
        if let Lowered::Splice(_) = lowered {
            return Err(raise_here(rt, exec, branch, dynamics, globals, JasprError::not_callable("unquote-splicing used outside an array")).await);
        }
        if !matches!(lowered, Lowered::Literal(_)) {
            all_literal = false;
        }
        lowered_entries.push((new_key, lowered));
    }

    if all_literal {
        let values = lowered_entries
            .into_iter()
            .map(|(k, v)| match v {
                Lowered::Literal(value) => (k, value),
                Lowered::Expr(_) | Lowered::Splice(_) => unreachable!("checked all-Literal above"),
            })
            .collect();
        let object = { let mut rtb = rt.borrow_mut(); value::make_object(&mut rtb.heap, values) };
        return Ok(Lowered::Literal(object));
    }

    let mut out = Vec::with_capacity(lowered_entries.len());
    for (k, v) in lowered_entries {
        let expr = match v {
            Lowered::Literal(value) => {
                let mut rtb = rt.borrow_mut();
                value::quote(&mut rtb.heap, &mut rtb.interns, value)
            }
            Lowered::Expr(e) => e,
            Lowered::Splice(_) => unreachable!("checked above"),
        };
        out.push((k, expr));
    }
    let object = { let mut rtb = rt.borrow_mut(); value::make_object(&mut rtb.heap, out) };
    Ok(Lowered::Expr(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builtins,
        fiber::{Executor, Runtime},
        heap::HeapData,
    };

    fn setup() -> (Rt, Ex, BranchId, Scope, Dynamics, Globals) {
        let mut runtime = Runtime::new();
        let signal_handler = runtime.heap.alloc(HeapData::Dynamic(crate::dynamic::DynamicVar { default: Value::Null }));
        let name = runtime.heap.alloc(HeapData::Dynamic(crate::dynamic::DynamicVar { default: Value::Null }));
        let globals = Globals { signal_handler, name };
        let scope = builtins::install_prelude(&mut runtime, globals);
        let branch = runtime.root_branch();
        let rt: Rt = Rc::new(RefCell::new(runtime));
        let exec = Executor::new_shared();
        (rt, exec, branch, scope, Dynamics::empty(), globals)
    }

    fn run_expand(code: serde_json::Value) -> serde_json::Value {
        let (rt, exec, branch, scope, dynamics, globals) = setup();
        let value = { let mut rtb = rt.borrow_mut(); crate::value::from_json(&mut rtb.heap, &mut rtb.interns, &code) };
        let out = Rc::new(RefCell::new(None));
        let out2 = out.clone();
        let rt2 = rt.clone();
        let exec2 = exec.clone();
        let fut: BoxFuture<Value> = Box::pin(async move {
            let result = expand(rt2, exec2, branch, scope, dynamics, globals, value).await;
            *out2.borrow_mut() = Some(result);
            Value::Null
        });
        fiber::spawn_fiber(&exec, &rt, branch, fut);
        Executor::run_until_stalled(&exec);
        let result = out.borrow().expect("expand fiber did not complete");
        let rtb = rt.borrow();
        value::to_json(&rtb.heap, &rtb.interns, result).unwrap()
    }

    #[test]
    fn quote_form_is_left_alone() {
        let input = serde_json::json!(["", ["a", "b"]]);
        assert_eq!(run_expand(input.clone()), input);
    }

    #[test]
    fn plain_array_expands_elementwise() {
        let input = serde_json::json!(["", [1.0, 2.0, 3.0]]);
        assert_eq!(run_expand(input.clone()), input);
    }
}
