//! Reserved identifiers (§6.1) and the expansion-only pseudo-forms §4.4
//! recognizes (`syntax-quote`, `unquote`, `unquote-splicing`), collected in
//! one place so `expand.rs` and `eval.rs` agree on exact spelling.

/// `$`-prefixed names meaningful to the evaluator itself (§6.1). `$args` is
/// the one reserved name usable as an ordinary value (the array bound by the
/// innermost closure call, §4.5 "Literals"); every other name here is only
/// legal in call-head position — evaluating any of them as a bare value is a
/// `BadName` error (§4.5 "reserved-prefix strings ... are errors unless
/// listed under §6 reserved names").
pub(crate) const RESERVED_NAMES: &[&str] = &[
    "$closure",
    "$code",
    "$args",
    "$chan",
    "$dynamic",
    "$default",
    "$syntaxQuote",
    "$unquote",
    "$unquoteSplicing",
    "$if",
    "$then",
    "$junction",
    "$eval",
    "$macroexpand",
    "$contextGet",
    "$dynamicLet",
    "$dynamicGet",
    "$apply",
    "$arrayMake",
    "$objectMake",
];

pub(crate) const ARGS: &str = "$args";
pub(crate) const CLOSURE: &str = "$closure";
pub(crate) const QUOTE: &str = "";
pub(crate) const ARRAY_CONCAT: &str = "arrayConcat";

pub(crate) const IF: &str = "$if";
pub(crate) const THEN: &str = "$then";
pub(crate) const APPLY: &str = "$apply";
pub(crate) const DYNAMIC_GET: &str = "$dynamicGet";
pub(crate) const DYNAMIC_LET: &str = "$dynamicLet";
pub(crate) const CONTEXT_GET: &str = "$contextGet";
pub(crate) const JUNCTION: &str = "$junction";
pub(crate) const EVAL: &str = "$eval";
pub(crate) const MACROEXPAND: &str = "$macroexpand";
pub(crate) const ARRAY_MAKE: &str = "$arrayMake";
pub(crate) const OBJECT_MAKE: &str = "$objectMake";
/// The surface heads the macro-expander recognizes for syntax-quote lowering
/// (§4.4, §4.4.1) — `$syntaxQuote`/`$unquote`/`$unquoteSplicing`, the exact
/// spelling §6.1's reserved-name list and §8's own test scenario use (e.g.
/// `["$syntaxQuote", ["$unquote", "foo"]]`). Expansion always lowers them
/// away before eval ever sees the tree; the same constants are reused by
/// `eval.rs`'s reserved-form dispatch as the `NoPrimitive` fallback for the
/// (only reachable via malformed/unexpanded code) case where one of them
/// survives to evaluation time (§4.5: "as evaluated forms are `NoPrimitive`
/// errors").
pub(crate) const SYNTAX_QUOTE_SUGAR: &str = "$syntaxQuote";
pub(crate) const UNQUOTE: &str = "$unquote";
pub(crate) const UNQUOTE_SPLICING: &str = "$unquoteSplicing";
pub(crate) const EVAL_SYNTAX_QUOTE: &str = SYNTAX_QUOTE_SUGAR;
pub(crate) const EVAL_UNQUOTE: &str = UNQUOTE;
pub(crate) const EVAL_UNQUOTE_SPLICING: &str = UNQUOTE_SPLICING;

pub(crate) const CHAN: &str = "$chan";
pub(crate) const DYNAMIC_CTOR: &str = "$dynamic";
pub(crate) const DEFAULT: &str = "$default";
pub(crate) const CODE: &str = "$code";

#[must_use]
pub(crate) fn is_reserved_prefixed(name: &str) -> bool {
    name.starts_with('$')
}

/// Recognizes the `.NAME.` gensym-target pattern from §4.4.1.
#[must_use]
pub(crate) fn gensym_target(name: &str) -> Option<&str> {
    let bytes = name.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'.' && bytes[bytes.len() - 1] == b'.' { Some(&name[1..name.len() - 1]) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `$chan`/`$dynamic`/`$default`/`$code` are reserved (§6.1) but have no
    /// evaluator dispatch arm (§4.5 is exhaustive without them; see
    /// `DESIGN.md`'s Open Question note) — they're still protected from
    /// ordinary value binding by the blanket `$`-prefix check.
    #[test]
    fn dispatch_less_reserved_names_are_still_prefix_reserved() {
        for name in [CHAN, DYNAMIC_CTOR, DEFAULT, CODE] {
            assert!(is_reserved_prefixed(name));
            assert!(RESERVED_NAMES.contains(&name));
        }
    }
}
