//! Scope (§3.3): the five per-context symbol tables plus the qualified-name
//! map, with prototype-like chaining (a nested scope extends its parent by
//! layered lookup; nothing is ever deleted).
//!
//! A `Scope` is an `Rc`-chained list of layers, same idea as [`crate::dynamic::Dynamics`]:
//! building a child scope never copies the parent's tables, so the cost of
//! `$closure`/module nesting is proportional to what that layer actually
//! defines, not to the whole program's symbol count.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{intern::StringId, value::Value};

/// One of the five namespaces a name can live in (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Value,
    Macro,
    Check,
    Doc,
    Test,
}

#[derive(Debug, Default)]
struct Layer {
    value: AHashMap<StringId, Value>,
    macro_: AHashMap<StringId, Value>,
    check: AHashMap<StringId, Value>,
    doc: AHashMap<StringId, Value>,
    test: AHashMap<StringId, Value>,
    qualified: AHashMap<StringId, StringId>,
}

impl Layer {
    fn table(&self, ctx: Context) -> &AHashMap<StringId, Value> {
        match ctx {
            Context::Value => &self.value,
            Context::Macro => &self.macro_,
            Context::Check => &self.check,
            Context::Doc => &self.doc,
            Context::Test => &self.test,
        }
    }

    fn table_mut(&mut self, ctx: Context) -> &mut AHashMap<StringId, Value> {
        match ctx {
            Context::Value => &mut self.value,
            Context::Macro => &mut self.macro_,
            Context::Check => &mut self.check,
            Context::Doc => &mut self.doc,
            Context::Test => &mut self.test,
        }
    }
}

#[derive(Debug)]
struct ScopeNode {
    parent: Option<Scope>,
    layer: Layer,
}

/// A scope. Cheap to clone (`Rc` bump); the clone shares the whole chain.
#[derive(Debug, Clone)]
pub struct Scope(Rc<ScopeNode>);

impl Scope {
    /// The empty root scope: no parent, nothing bound. `$args`, `arrayConcat`,
    /// and the reserved-name builtins are installed on top of this by the
    /// evaluator's bootstrap, not baked in here.
    #[must_use]
    pub fn root() -> Self {
        Self(Rc::new(ScopeNode { parent: None, layer: Layer::default() }))
    }

    /// Looks up `name` in `ctx`, walking from this scope outward to the root.
    /// Child shadows parent.
    #[must_use]
    pub fn lookup(&self, ctx: Context, name: StringId) -> Option<Value> {
        let mut node = Some(self);
        while let Some(n) = node {
            if let Some(&v) = n.0.layer.table(ctx).get(&name) {
                return Some(v);
            }
            node = n.0.parent.as_ref();
        }
        None
    }

    /// Resolves `name` through the qualified-name table (used by syntax-quote
    /// lowering, §4.4.1). Falls back to returning `name` unchanged if no
    /// definition in scope claims it as a short name — an unqualified symbol
    /// that isn't locally defined stays as written.
    #[must_use]
    pub fn resolve_qualified(&self, name: StringId) -> StringId {
        let mut node = Some(self);
        while let Some(n) = node {
            if let Some(&q) = n.0.layer.qualified.get(&name) {
                return q;
            }
            node = n.0.parent.as_ref();
        }
        name
    }

    /// Builds a child scope with a single fresh layer, ready for `builder()`
    /// to populate. Used by both `$closure`'s scope build and the module/defs
    /// assembler (§4.6).
    #[must_use]
    pub fn child(&self) -> ScopeBuilder {
        ScopeBuilder { parent: Some(self.clone()), layer: Layer::default() }
    }
}

/// Builds one new scope layer. Kept separate from `Scope` so that the
/// placeholder pass (§4.6 step 2) can insert every definition's Deferred
/// before any body evaluates — a `Scope` itself, once finished, is read-only
/// except for the backing Deferred cells resolving (§5 "Shared resources").
pub struct ScopeBuilder {
    parent: Option<Scope>,
    layer: Layer,
}

impl ScopeBuilder {
    pub fn define(&mut self, ctx: Context, name: StringId, value: Value) {
        self.layer.table_mut(ctx).insert(name, value);
    }

    pub fn alias_qualified(&mut self, short: StringId, qualified: StringId) {
        self.layer.qualified.insert(short, qualified);
    }

    #[must_use]
    pub fn finish(self) -> Scope {
        Scope(Rc::new(ScopeNode { parent: self.parent, layer: self.layer }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    #[test]
    fn child_shadows_parent_and_parent_is_unaffected() {
        let mut interns = Interns::new();
        let x = interns.intern("x");

        let root = Scope::root();
        let mut b = root.child();
        b.define(Context::Value, x, Value::Number(1.0));
        let parent = b.finish();

        let mut b2 = parent.child();
        b2.define(Context::Value, x, Value::Number(2.0));
        let child = b2.finish();

        assert!(matches!(child.lookup(Context::Value, x), Some(Value::Number(n)) if n == 2.0));
        assert!(matches!(parent.lookup(Context::Value, x), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn contexts_are_independent() {
        let mut interns = Interns::new();
        let name = interns.intern("foo");
        let mut b = Scope::root().child();
        b.define(Context::Macro, name, Value::Null);
        let scope = b.finish();
        assert!(scope.lookup(Context::Value, name).is_none());
        assert!(scope.lookup(Context::Macro, name).is_some());
    }
}
