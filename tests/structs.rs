//! `struct` declarations and literals.
//!
//! A `struct` declaration binds its name to a callable constructor; the
//! constructed value behaves like a bare `{ field: value }` literal (no
//! backing class), reachable through `.field` the same way a class
//! instance's fields are.

mod common;

use common::run_source;

#[test]
fn struct_constructor_builds_fields_positionally() {
    let run = run_source(
        r#"
        struct Point { x, y }
        var p = Point(3, 4);
        var sum = p.x + p.y;
        "#,
    );
    assert_eq!(run.global("main", "sum").as_number(), Some(7.0));
}

#[test]
fn struct_literal_matches_constructor_output() {
    let run = run_source(
        r#"
        struct Point { x, y }
        var a = Point(1, 2);
        var b = { x: 1, y: 2 };
        var result = a.x == b.x && a.y == b.y;
        "#,
    );
    assert!(run.global("main", "result").is_truthy());
}

#[test]
fn nested_struct_constructor_call() {
    let run = run_source(
        r#"
        struct Pair { first, second }
        func make() {
            return Pair(10, 20);
        }
        var p = make();
        var result = p.first + p.second;
        "#,
    );
    assert_eq!(run.global("main", "result").as_number(), Some(30.0));
}
