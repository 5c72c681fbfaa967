/// End-to-end tests for module assembly (§4.6, §6.2): mutual recursion
/// across definitions regardless of source order, and qualified-name
/// aliasing for a real module namespace.
use jaspr::{run_module, run_script, to_json, Context, Namespace};
use pretty_assertions::assert_eq;

/// `even`/`odd` call each other; the scope/defs assembler must bind both
/// placeholders before either body is evaluated, so the textual order below
/// (odd defined before even, but calling it) must still resolve.
#[test]
fn mutually_recursive_definitions_see_each_other_regardless_of_order() {
    let defs = serde_json::json!({
        "odd": ["$closure", {}, ["$if", [0.0, "$args"], false, ["even", ["$sub", [0.0, "$args"], 1.0]]], {}],
        "even": ["$closure", {}, ["$if", [0.0, "$args"], true, ["odd", ["$sub", [0.0, "$args"], 1.0]]], {}],
        "main": ["even", 10.0],
    });
    let program = run_script(&defs).unwrap();
    let main = program.main.expect("main should be bound");
    let rtb = program.rt.borrow();
    assert_eq!(to_json(&rtb.heap, &rtb.interns, main), Some(serde_json::json!(true)));
}

/// A module's definitions are reachable under their short name, the
/// `module.name` form, and the fully-qualified `module@version.name` form.
#[test]
fn module_definitions_are_reachable_under_every_alias() {
    let defs = serde_json::json!({
        "helper": ["$closure", {}, ["$add", 1.0, [0.0, "$args"]], {}],
        "main": ["helper", 9.0],
    });
    let namespace = Namespace::new("arith", "2.1.0");
    let program = run_module(namespace, &defs).unwrap();

    let (short_id, dotted_id, qualified_id) = {
        let mut rtb = program.rt.borrow_mut();
        (rtb.interns.intern("helper"), rtb.interns.intern("arith.helper"), rtb.interns.intern("arith@2.1.0.helper"))
    };
    assert!(program.scope.lookup(Context::Value, short_id).is_some());
    assert!(program.scope.lookup(Context::Value, dotted_id).is_some());
    assert!(program.scope.lookup(Context::Value, qualified_id).is_some());

    let rtb = program.rt.borrow();
    let main = program.main.expect("main should be bound");
    assert_eq!(to_json(&rtb.heap, &rtb.interns, main), Some(serde_json::json!(10.0)));
}

/// A definition whose name is itself reserved (`$`-prefixed) is a structural
/// error, surfaced to the caller rather than silently dropped (§6.1, §6.2).
#[test]
fn reserved_definition_name_fails_module_assembly() {
    let defs = serde_json::json!({"$reserved": ["", 1.0]});
    let err = run_script(&defs).unwrap_err();
    assert_eq!(err.err, jaspr::ErrCode::BadName);
}
