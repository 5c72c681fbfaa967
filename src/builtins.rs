//! The one ambient function the spec requires in every scope (`arrayConcat`,
//! §6.1) and the primitives table that backs `$`-prefixed call heads the
//! fixed special forms (§4.5) don't claim.
//!
//! §1 puts "the surface primitive library (arithmetic, string, channel
//! operations)" out of scope: this module does not attempt to be that
//! library. It ships the one binding the spec mandates (`arrayConcat`, which
//! syntax-quote lowering itself can emit, §4.4.1) plus a handful of
//! minimal arithmetic/comparison primitives so the evaluator is exercisable
//! end to end in this crate's own tests without an external embedder — the
//! same role `ouros::builtins` plays for the bytecode VM, just much smaller
//! since only the *contract* (§6.5) is in scope here.

use crate::{
    error::JasprError,
    fiber::Runtime,
    heap::{HeapData, ObjectMap},
    native::NativeFn,
    scope::{Context, Scope, ScopeBuilder},
    signal::Globals,
    value::Value,
};

fn as_array<'a>(rt: &'a Runtime, v: Value) -> Option<&'a [Value]> {
    match v {
        Value::Array(id) => match rt.heap.get(id) {
            HeapData::Array(items) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn as_number(v: Value) -> Option<f64> {
    match v {
        Value::Number(n) => Some(n),
        _ => None,
    }
}

/// `arrayConcat(arr1, arr2, ...)`: concatenates every array argument, in
/// order. Any non-array argument is a `BadArgs` error — this is the one
/// function syntax-quote lowering (§4.4.1) itself can call, so its contract
/// (flatten zero or more arrays, preserving order) is fixed by the spec even
/// though arithmetic/string primitives are not.
fn array_concat(rt: &mut Runtime, args: &[Value]) -> Result<Value, JasprError> {
    let mut out = Vec::new();
    for &arg in args {
        let Some(items) = as_array(rt, arg) else {
            return Err(JasprError::bad_args("arrayConcat: every argument must be an array"));
        };
        out.extend_from_slice(items);
    }
    Ok(Value::Array(rt.heap.alloc(HeapData::Array(out))))
}

fn numeric_binop(name: &'static str, f: impl Fn(f64, f64) -> f64 + 'static) -> NativeFn {
    NativeFn::sync(move |_rt, args| {
        let [a, b] = args else {
            return Err(JasprError::bad_args(format!("{name}: expected exactly 2 arguments")));
        };
        let (Some(a), Some(b)) = (as_number(*a), as_number(*b)) else {
            return Err(JasprError::bad_args(format!("{name}: expected two numbers")));
        };
        Ok(Value::Number(f(a, b)))
    })
}

/// Sign-of-divisor modulus, fixing the Open Question the spec flags about the
/// source's `abs(a)*sign(b) % b` formulation (§9 design notes). Documented in
/// DESIGN.md.
fn modulus(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && r.signum() != b.signum() { r + b } else { r }
}

/// Installs the `arrayConcat` binding, the well-known dynamics (§3.4), and
/// the example `$`-prefixed primitives into the runtime's primitives table
/// and root scope.
///
/// `signal-handler` and `name` are bound here as ordinary `value`-context
/// names so user code can reach them the only way a magic Dynamic handle is
/// ever reachable: `$dynamicLet "signal-handler" handler body` /
/// `$dynamicGet "name"`. The assembler (§4.6) and `raise` (§4.7) address the
/// same two handles directly through `globals`, never by this lookup.
#[must_use]
pub fn install_prelude(rt: &mut Runtime, globals: Globals) -> Scope {
    let mut builder: ScopeBuilder = Scope::root().child();

    let array_concat_name = rt.interns.intern("arrayConcat");
    let array_concat_fn = rt.heap.alloc(HeapData::Native(NativeFn::sync(array_concat)));
    builder.define(Context::Value, array_concat_name, Value::Native(array_concat_fn));

    let signal_handler_name = rt.interns.intern("signal-handler");
    builder.define(Context::Value, signal_handler_name, Value::Dynamic(globals.signal_handler));
    let name_name = rt.interns.intern("name");
    builder.define(Context::Value, name_name, Value::Dynamic(globals.name));

    for (name, op) in [
        ("$add", (|a: f64, b: f64| a + b) as fn(f64, f64) -> f64),
        ("$sub", |a, b| a - b),
        ("$mul", |a, b| a * b),
        ("$div", |a, b| a / b),
        ("$modulus", modulus),
    ] {
        register_primitive(rt, name, numeric_binop(name, op));
    }

    register_primitive(
        rt,
        "$eq",
        NativeFn::sync(|rt, args| {
            let [a, b] = args else {
                return Err(JasprError::bad_args("$eq: expected exactly 2 arguments"));
            };
            Ok(Value::Bool(crate::value::value_eq(&rt.heap, &rt.interns, *a, *b)))
        }),
    );

    register_primitive(
        rt,
        "$not",
        NativeFn::sync(|rt, args| {
            let [a] = args else {
                return Err(JasprError::bad_args("$not: expected exactly 1 argument"));
            };
            Ok(Value::Bool(!a.is_truthy(&rt.heap, &rt.interns)))
        }),
    );

    builder.finish()
}

/// Registers a native primitive under a `$`-prefixed name, consulted by
/// array-head dispatch (§4.5) whenever the head isn't one of the fixed
/// special forms.
pub fn register_primitive(rt: &mut Runtime, name: &str, native: NativeFn) {
    let id = rt.interns.intern(name);
    let fn_id = rt.heap.alloc(HeapData::Native(native));
    rt.primitives.insert(id, Value::Native(fn_id));
}

/// Flat key/value pairs → object, used by call-dispatch's empty-array /
/// empty-object constructor case (§4.5.1).
pub(crate) fn object_from_pairs(rt: &mut Runtime, args: &[Value]) -> Result<Value, JasprError> {
    if args.len() % 2 != 0 {
        return Err(JasprError::bad_args("object constructor requires an even number of arguments"));
    }
    let mut map = ObjectMap::default();
    for pair in args.chunks_exact(2) {
        let Value::Str(key) = pair[0] else {
            return Err(JasprError::bad_args("object constructor keys must be strings"));
        };
        map.insert(key, pair[1]);
    }
    Ok(Value::Object(rt.heap.alloc(HeapData::Object(map))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Runtime;

    #[test]
    fn array_concat_flattens_in_order() {
        let mut rt = Runtime::new();
        let a = Value::Array(rt.heap.alloc(HeapData::Array(vec![Value::Number(1.0)])));
        let b = Value::Array(rt.heap.alloc(HeapData::Array(vec![Value::Number(2.0), Value::Number(3.0)])));
        let result = array_concat(&mut rt, &[a, b]).unwrap();
        let Value::Array(id) = result else { panic!("expected array") };
        let HeapData::Array(items) = rt.heap.get(id) else { panic!() };
        assert_eq!(items.iter().filter_map(|v| as_number(*v)).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn modulus_follows_divisor_sign() {
        assert_eq!(modulus(5.0, 3.0), 2.0);
        assert_eq!(modulus(-5.0, 3.0), 1.0);
        assert_eq!(modulus(5.0, -3.0), -1.0);
        assert_eq!(modulus(-5.0, -3.0), -2.0);
    }
}
