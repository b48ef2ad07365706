//! Upvalue capture and scope-exit behavior.
//!
//! The VM captures locals by reference through `ObjUpvalue`, open while the
//! owning stack slot is live and closed (detached, holding its own copy)
//! once the slot goes out of scope — see `Compiler::end_scope`'s
//! `CloseUpvalue` emission for a captured `Local`.

mod common;

use common::run_source;

#[test]
fn nested_function_reads_enclosing_local() {
    let run = run_source(
        r#"
        func make_adder(x) {
            func add(y) {
                return x + y;
            }
            return add;
        }
        var add5 = make_adder(5);
        var result = add5(3);
        "#,
    );
    assert_eq!(run.global("main", "result").as_number(), Some(8.0));
}

#[test]
fn closure_over_loop_local_sees_distinct_values_per_iteration() {
    // Each iteration's `i` is a fresh local in a fresh scope, so closures
    // created in different iterations must not alias one shared slot.
    let run = run_source(
        r#"
        var funcs = [nil, nil, nil];
        for (var i = 0; i < 3; i = i + 1) {
            var captured = i;
            func get() { return captured; }
            funcs[i] = get;
        }
        var a = funcs[0]();
        var b = funcs[1]();
        var c = funcs[2]();
        "#,
    );
    assert_eq!(run.global("main", "a").as_number(), Some(0.0));
    assert_eq!(run.global("main", "b").as_number(), Some(1.0));
    assert_eq!(run.global("main", "c").as_number(), Some(2.0));
}

#[test]
fn mutating_captured_variable_is_visible_through_closure() {
    let run = run_source(
        r#"
        func make_counter() {
            var count = 0;
            func increment() {
                count = count + 1;
                return count;
            }
            return increment;
        }
        var counter = make_counter();
        counter();
        counter();
        var result = counter();
        "#,
    );
    assert_eq!(run.global("main", "result").as_number(), Some(3.0));
}

#[test]
fn recursive_local_function_can_call_itself() {
    let run = run_source(
        r#"
        func outer() {
            func fact(n) {
                if (n <= 1) {
                    return 1;
                }
                return n * fact(n - 1);
            }
            return fact(5);
        }
        var result = outer();
        "#,
    );
    assert_eq!(run.global("main", "result").as_number(), Some(120.0));
}
