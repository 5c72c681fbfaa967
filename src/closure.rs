//! Closures (§3.2): the magic object produced by `$closure` and consumed by
//! call dispatch (§4.5.1).

use crate::{scope::Scope, value::Value};

/// A closure's hidden fields. `fields` carries whatever extra user-visible
/// keys the closure literal's `fields` map supplied; they ride along on the
/// magic object but play no role in calling it.
#[derive(Debug, Clone)]
pub(crate) struct Closure {
    pub(crate) captured_scope: Scope,
    /// The expanded body. May itself still be a `Value::Deferred` if body
    /// expansion was deferred until instantiation (closures whose `defs`
    /// define a macro, §4.4's closure-literal special case).
    pub(crate) body: Value,
    pub(crate) fields: Vec<(crate::intern::StringId, Value)>,
}
