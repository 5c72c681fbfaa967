//! String interning and gensym generation.
//!
//! Every `Value::Str` is a `StringId` into a single [`Interns`] table rather than
//! an owned `String`. This keeps `Value` small and `Copy`, and makes identifier
//! comparison (used constantly by scope lookup and reserved-name checks) an
//! integer comparison instead of a string comparison.
//!
//! Gensym support lives here too: syntax-quote lowering needs to turn a source
//! form like `.NAME.` into a process-unique identifier, memoized per expansion
//! so that repeated occurrences of `.NAME.` within one syntax-quote produce the
//! same generated symbol (see `expand::SyntaxQuoteCtx`).

use ahash::AHashMap;

/// Index into the string interner's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owns the canonical copy of every string the runtime has seen: source
/// literals, identifiers, object keys, and gensym-generated names.
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<Box<str>>,
    lookup: AHashMap<Box<str>, StringId>,
    gensym_counter: u64,
}

impl Interns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `s`, returning the existing id if already seen.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("interned string table overflow"));
        self.strings.push(s.into());
        self.lookup.insert(s.into(), id);
        id
    }

    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Generates a process-unique name derived from `base`, used both by
    /// syntax-quote's `.NAME.` lowering and by any future `gensym` primitive.
    ///
    /// The generated name carries a reserved separator (`#`) that cannot occur
    /// in a surface identifier, so it can never collide with a user-written name.
    pub fn gensym(&mut self, base: &str) -> StringId {
        self.gensym_counter += 1;
        let unique = format!("{base}#{}", self.gensym_counter);
        self.intern(&unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern("foo");
        let b = interns.intern("foo");
        assert_eq!(a, b);
        assert_eq!(interns.get(a), "foo");
    }

    #[test]
    fn gensym_is_unique_per_call() {
        let mut interns = Interns::new();
        let a = interns.gensym("x");
        let b = interns.gensym("x");
        assert_ne!(a, b);
        assert_ne!(interns.get(a), interns.get(b));
    }
}
