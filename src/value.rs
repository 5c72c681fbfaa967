//! The Value type (§3.1) and the handful of free functions that need to walk
//! it: structural equality, JSON (de)serialization, and the magic-object check.

use crate::{
    heap::{Heap, HeapData, HeapId, ObjectMap},
    intern::{Interns, StringId},
};

/// One Jaspr value.
///
/// Scalars (`Null`, `Bool`, `Number`, `Str`) are immediate and `Copy`.
/// Everything else is an index into the [`Heap`] arena. `Value` itself is
/// therefore always `Copy`: cloning a `Value` never clones the data it
/// addresses, matching the arena's append-only, never-deep-copied design.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(StringId),
    Array(HeapId),
    Object(HeapId),
    /// A write-once placeholder (§4.1). Never itself observed as "the value"
    /// by user code — every evaluator/expander step that reads a slot must
    /// force a `Deferred` before inspecting it further.
    Deferred(HeapId),
    /// Magic: closure. Captured scope + body code + optional user fields.
    Closure(HeapId),
    /// Magic: dynamic-variable handle (§3.4).
    Dynamic(HeapId),
    /// Magic: channel (§4.2).
    Channel(HeapId),
    /// Magic: a host-provided native function (§6.5).
    Native(HeapId),
}

impl Value {
    #[must_use]
    pub fn is_deferred(self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    /// Whether this value is one of the three magic kinds (§3.1). Magic
    /// values are opaque to user code, compare by identity, and cannot be
    /// part of a JSON-serializable tree.
    #[must_use]
    pub fn is_magic(self) -> bool {
        matches!(self, Self::Closure(_) | Self::Dynamic(_) | Self::Channel(_) | Self::Native(_))
    }

    /// Whether this value takes `$if`'s "then" branch (§8 concrete scenarios:
    /// `false`, `0`, `[]` are falsy; `"x"` is truthy). Emptiness is falsy
    /// across every collection-shaped value — string, array, and object
    /// alike — matching the pattern those scenarios establish; everything
    /// else, including every magic object, is truthy. Must not be called on
    /// an unforced `Deferred`.
    #[must_use]
    pub fn is_truthy(self, heap: &Heap, interns: &Interns) -> bool {
        match self {
            Self::Bool(b) => b,
            Self::Null => false,
            Self::Number(n) => n != 0.0,
            Self::Str(s) => !interns.get(s).is_empty(),
            Self::Array(id) => match heap.get(id) {
                HeapData::Array(items) => !items.is_empty(),
                _ => unreachable!("Array HeapId must address HeapData::Array"),
            },
            Self::Object(id) => match heap.get(id) {
                HeapData::Object(map) => !map.is_empty(),
                _ => unreachable!("Object HeapId must address HeapData::Object"),
            },
            Self::Deferred(_) => unreachable!("is_truthy called on an unforced Deferred"),
            Self::Closure(_) | Self::Dynamic(_) | Self::Channel(_) | Self::Native(_) => true,
        }
    }
}

/// Strict value equality (`is?`, §3.1 & §8 property 2).
///
/// Magic objects compare by identity (same `HeapId` and variant); everything
/// else compares recursively, type-exact (a number is never equal to a string
/// that prints the same, an array is never equal to an object).
///
/// `heap` must already have every `Deferred` slot involved forced to a
/// concrete value; comparing through an unresolved `Deferred` is a caller bug
/// (the evaluator never exposes one to `is?` without forcing it first).
#[must_use]
pub fn value_eq(heap: &Heap, interns: &Interns, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y || interns.get(x) == interns.get(y),
        (Value::Closure(x), Value::Closure(y))
        | (Value::Dynamic(x), Value::Dynamic(y))
        | (Value::Channel(x), Value::Channel(y))
        | (Value::Native(x), Value::Native(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            if x == y {
                return true;
            }
            let (HeapData::Array(xs), HeapData::Array(ys)) = (heap.get(x), heap.get(y)) else {
                unreachable!("Array HeapId must address HeapData::Array")
            };
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(&a, &b)| value_eq(heap, interns, a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            if x == y {
                return true;
            }
            let (HeapData::Object(xs), HeapData::Object(ys)) = (heap.get(x), heap.get(y)) else {
                unreachable!("Object HeapId must address HeapData::Object")
            };
            xs.len() == ys.len()
                && xs.iter().all(|(k, &v)| ys.get(k).is_some_and(|&v2| value_eq(heap, interns, v, v2)))
        }
        _ => false,
    }
}

/// Converts a fully forced, non-magic `Value` tree into `serde_json::Value`.
///
/// Returns `None` if any reachable slot is still a `Deferred` (caller must
/// force first) or is magic (§3.1: "JSON serialization fails if and only if
/// the tree, fully forced, contains a magic object").
#[must_use]
pub fn to_json(heap: &Heap, interns: &Interns, v: Value) -> Option<serde_json::Value> {
    Some(match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Str(s) => serde_json::Value::String(interns.get(s).to_owned()),
        Value::Array(id) => {
            let HeapData::Array(items) = heap.get(id) else {
                unreachable!("Array HeapId must address HeapData::Array")
            };
            let mut out = Vec::with_capacity(items.len());
            for &item in items {
                out.push(to_json(heap, interns, item)?);
            }
            serde_json::Value::Array(out)
        }
        Value::Object(id) => {
            let HeapData::Object(map) = heap.get(id) else {
                unreachable!("Object HeapId must address HeapData::Object")
            };
            let mut out = serde_json::Map::with_capacity(map.len());
            for (&k, &val) in map {
                out.insert(interns.get(k).to_owned(), to_json(heap, interns, val)?);
            }
            serde_json::Value::Object(out)
        }
        Value::Deferred(_) | Value::Closure(_) | Value::Dynamic(_) | Value::Channel(_) | Value::Native(_) => return None,
    })
}

/// Loads a `serde_json::Value` into the arena as a fully-resolved `Value`
/// tree (no slot is ever a `Deferred`). This is the adapter side of §6.3's
/// "parser interface": the surface parser is external, but every JSON
/// document the parser (or any other source) hands us is already a valid
/// program, so this is the only conversion the core itself must own.
pub fn from_json(heap: &mut Heap, interns: &mut Interns, v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::Str(interns.intern(s)),
        serde_json::Value::Array(items) => {
            let values = items.iter().map(|item| from_json(heap, interns, item)).collect();
            Value::Array(heap.alloc(HeapData::Array(values)))
        }
        serde_json::Value::Object(map) => {
            let mut out = crate::heap::ObjectMap::default();
            for (k, val) in map {
                let key = interns.intern(k);
                let val = from_json(heap, interns, val);
                out.insert(key, val);
            }
            Value::Object(heap.alloc(HeapData::Object(out)))
        }
    }
}

/// Clones a code/data array's elements out of the heap (cheap: `Value` is
/// `Copy`), releasing the borrow before the caller recurses or awaits.
#[must_use]
pub(crate) fn array_items(heap: &Heap, v: Value) -> Option<Vec<Value>> {
    match v {
        Value::Array(id) => match heap.get(id) {
            HeapData::Array(items) => Some(items.clone()),
            _ => unreachable!("Array HeapId must address HeapData::Array"),
        },
        _ => None,
    }
}

/// Clones an object's entries out of the heap, same rationale as
/// [`array_items`].
#[must_use]
pub(crate) fn object_entries(heap: &Heap, v: Value) -> Option<Vec<(StringId, Value)>> {
    match v {
        Value::Object(id) => match heap.get(id) {
            HeapData::Object(map) => Some(map.iter().map(|(&k, &v)| (k, v)).collect()),
            _ => unreachable!("Object HeapId must address HeapData::Object"),
        },
        _ => None,
    }
}

pub(crate) fn make_array(heap: &mut Heap, items: Vec<Value>) -> Value {
    Value::Array(heap.alloc(HeapData::Array(items)))
}

pub(crate) fn make_object(heap: &mut Heap, entries: Vec<(StringId, Value)>) -> Value {
    let mut map = ObjectMap::default();
    for (k, v) in entries {
        map.insert(k, v);
    }
    Value::Object(heap.alloc(HeapData::Object(map)))
}

/// Builds the quote form `["", v]` (§4.5 `""` head): evaluating it returns
/// `v` verbatim.
pub(crate) fn quote(heap: &mut Heap, interns: &mut Interns, v: Value) -> Value {
    let quote_head = Value::Str(interns.intern(""));
    make_array(heap, vec![quote_head, v])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(json: serde_json::Value) -> serde_json::Value {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let v = from_json(&mut heap, &mut interns, &json);
        to_json(&heap, &interns, v).unwrap()
    }

    #[test]
    fn json_fidelity_for_scalars_and_containers() {
        let doc = serde_json::json!({"a": [1, 2.5, null, true, "x"], "b": {}});
        assert_eq!(roundtrip(doc.clone()), doc);
    }

    #[test]
    fn structural_equality_is_type_exact() {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let one = Value::Number(1.0);
        let one_str = from_json(&mut heap, &mut interns, &serde_json::json!("1"));
        assert!(!value_eq(&heap, &interns, one, one_str));

        let a1 = from_json(&mut heap, &mut interns, &serde_json::json!([1, 2]));
        let a2 = from_json(&mut heap, &mut interns, &serde_json::json!([1, 2]));
        assert!(value_eq(&heap, &interns, a1, a2));
    }
}
