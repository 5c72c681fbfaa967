//! The value arena.
//!
//! Every Value that is not an immediate (`null`, bool, number, or interned
//! string) lives here, addressed by [`HeapId`]. This is the "arena of
//! index-addressed cells" the spec's design notes recommend in place of a
//! cyclic object graph: scope/defs assembly builds cycles of mutually
//! recursive Deferreds, and an index-addressed arena lets those cycles exist
//! without any language-level `Rc`-cycle or garbage collector.
//!
//! Unlike the teacher crate's heap (which free-lists and reference-counts
//! individual cells to bound memory in long-lived sandboxed sessions), this
//! arena is append-only: a `Heap` is dropped as a whole when the program that
//! built it finishes, which releases every cell at once (`§9 Design Notes`).
//! There is nothing in the spec's Non-goals or testable properties that
//! depends on reclaiming individual cells, so the simpler arena is preferred.

use std::task::Waker;

use indexmap::IndexMap;

use crate::{channel::ChannelState, closure::Closure, dynamic::DynamicVar, intern::StringId, native::NativeFn, value::Value};

/// Index into the [`Heap`] arena. Cheap to copy, compare, and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// State of a write-once [`crate::value::Value::Deferred`] cell (§4.1).
#[derive(Debug)]
pub(crate) enum DeferredState {
    /// Not yet resolved. Holds wakers of tasks suspended on this cell via `await`.
    Unresolved(Vec<Waker>),
    /// Resolved exactly once; further resolution attempts are a fatal error.
    Resolved(Value),
    /// Cancelled: accepts no further listeners and no further resolution.
    Cancelled,
}

/// An ordered string-keyed mapping. Iteration order is insertion order for the
/// lifetime of the value, satisfying §3.1's "stable key-iteration order"
/// requirement without committing to any semantic meaning for that order.
pub(crate) type ObjectMap = IndexMap<StringId, Value, ahash::RandomState>;

/// Tagged payload for everything addressed by a [`HeapId`].
#[derive(Debug)]
pub(crate) enum HeapData {
    Array(Vec<Value>),
    Object(ObjectMap),
    Deferred(DeferredState),
    Closure(Closure),
    Dynamic(DynamicVar),
    Channel(ChannelState),
    Native(NativeFn),
}

impl HeapData {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Deferred(_) => "deferred",
            Self::Closure(_) => "closure",
            Self::Dynamic(_) => "dynamic",
            Self::Channel(_) => "channel",
            Self::Native(_) => "native",
        }
    }
}

/// The value arena itself.
#[derive(Debug, Default)]
pub struct Heap {
    cells: Vec<HeapData>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn alloc(&mut self, data: HeapData) -> HeapId {
        let id = HeapId(u32::try_from(self.cells.len()).expect("heap arena overflow"));
        self.cells.push(data);
        id
    }

    pub(crate) fn get(&self, id: HeapId) -> &HeapData {
        &self.cells[id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.cells[id.index()]
    }

    /// Live-cell count, purely diagnostic (no limit is enforced here; see
    /// [`crate::fiber::ResourceLimits`] for the limits that are enforced).
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
