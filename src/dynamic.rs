//! Dynamic variables and the dynamic-binding stack (§3.4, §4.3).
//!
//! A dynamic handle is a magic object (`Value::Dynamic`) with a default
//! value. The binding *stack* carried alongside `scope` through every call is
//! a persistent (immutable) linked list of frames, exactly as §9's design
//! notes recommend: cheap to clone (an `Rc` bump), cheap to look up (depth is
//! always small), and with no risk of one call's `dynamic-let` leaking into a
//! sibling's.

use std::rc::Rc;

use crate::{heap::HeapId, value::Value};

/// One dynamic-variable handle's private data.
#[derive(Debug)]
pub(crate) struct DynamicVar {
    pub(crate) default: Value,
}

/// One frame of the dynamic-binding stack: `{ key, value, parent }` (§3.4).
struct Frame {
    key: HeapId,
    value: Value,
    parent: Option<Rc<Frame>>,
}

/// The dynamic-binding stack, threaded through evaluation alongside `scope`.
/// Cloning is an `Rc` bump, not a deep copy.
#[derive(Clone)]
pub struct Dynamics(Option<Rc<Frame>>);

impl Default for Dynamics {
    fn default() -> Self {
        Self::empty()
    }
}

impl Dynamics {
    #[must_use]
    pub fn empty() -> Self {
        Self(None)
    }

    /// `dynamic-let(dyn, value, body)`'s binding half: push one frame.
    #[must_use]
    pub fn push(&self, key: HeapId, value: Value) -> Self {
        Self(Some(Rc::new(Frame { key, value, parent: self.0.clone() })))
    }

    /// Walks from innermost to outermost; `None` on a miss (caller falls back
    /// to the dynamic's own default, per §4.3).
    #[must_use]
    pub(crate) fn lookup(&self, key: HeapId) -> Option<Value> {
        self.lookup_with_outer(key).map(|(v, _outer)| v)
    }

    /// Like [`Self::lookup`], but also returns the binding stack as it stood
    /// *outside* that frame. `raise` (§4.7) uses this to run a signal handler
    /// with the dynamic stack it closed over at its own `$dynamicLet` site,
    /// not the stack at the point it was invoked from — otherwise a handler
    /// that itself raises would immediately find itself as the innermost
    /// handler again.
    #[must_use]
    pub(crate) fn lookup_with_outer(&self, key: HeapId) -> Option<(Value, Self)> {
        let mut frame = self.0.as_ref();
        while let Some(f) = frame {
            if f.key == key {
                return Some((f.value, Self(f.parent.clone())));
            }
            frame = f.parent.as_ref();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn lookup_walks_innermost_first_and_restores_outer() {
        let mut heap = Heap::new();
        let key = crate::value::Value::Dynamic(heap.alloc(crate::heap::HeapData::Dynamic(DynamicVar {
            default: Value::Null,
        })));
        let Value::Dynamic(key_id) = key else { unreachable!() };

        let outer = Dynamics::empty().push(key_id, Value::Number(1.0));
        assert!(matches!(outer.lookup(key_id), Some(Value::Number(n)) if n == 1.0));

        let inner = outer.push(key_id, Value::Number(2.0));
        assert!(matches!(inner.lookup(key_id), Some(Value::Number(n)) if n == 2.0));

        // Popping back to `outer` (simply not using `inner` again) restores the outer binding.
        assert!(matches!(outer.lookup(key_id), Some(Value::Number(n)) if n == 1.0));
    }
}
