//! Class declaration, constructor dispatch, and `super`.
//!
//! Covers the `compile_class_decl` stack-order contract (`Opcode::Inherit`
//! expects the superclass at `peek(1)` and the subclass at `peek(0)`) and
//! the `"super"`-as-captured-upvalue binding.

mod common;

use common::run_source;

#[test]
fn constructor_named_after_class_initializes_fields() {
    let run = run_source(
        r#"
        class Point {
            Point(x, y) {
                this.x = x;
                this.y = y;
            }
            sum() {
                return this.x + this.y;
            }
        }
        var p = Point(3, 4);
        var result = p.sum();
        "#,
    );
    assert_eq!(run.global("main", "result").as_number(), Some(7.0));
}

#[test]
fn subclass_inherits_and_overrides_methods() {
    let run = run_source(
        r#"
        class Animal {
            speak() {
                return "...";
            }
        }
        class Dog : Animal {
            speak() {
                return "woof";
            }
        }
        var inherited = Animal().speak();
        var overridden = Dog().speak();
        "#,
    );
    let inherited = run.global("main", "inherited");
    let overridden = run.global("main", "overridden");
    assert_eq!(inherited.as_obj().unwrap().as_string().unwrap().value, "...");
    assert_eq!(overridden.as_obj().unwrap().as_string().unwrap().value, "woof");
}

#[test]
fn super_call_reaches_parent_method_from_overridden_method() {
    let run = run_source(
        r#"
        class Animal {
            speak() {
                return "generic noise";
            }
        }
        class Dog : Animal {
            speak() {
                return super.speak() + " (woof)";
            }
        }
        var result = Dog().speak();
        "#,
    );
    assert_eq!(
        run.global("main", "result").as_obj().unwrap().as_string().unwrap().value,
        "generic noise (woof)"
    );
}

#[test]
fn class_without_superclass_has_no_open_super_scope_leak() {
    // Regression for the stack-order fix: a class with no `: Parent` clause
    // must not touch `Inherit`/`"super"` at all, and its own name must
    // already be bound by the time the method-attach loop reads it back.
    let run = run_source(
        r#"
        class Counter {
            Counter() {
                this.count = 0;
            }
            bump() {
                this.count = this.count + 1;
                return this.count;
            }
        }
        var c = Counter();
        c.bump();
        var result = c.bump();
        "#,
    );
    assert_eq!(run.global("main", "result").as_number(), Some(2.0));
}

#[test]
fn self_inheritance_is_a_compile_error() {
    let err = common::try_compile("class Loop : Loop { }\n").unwrap_err();
    assert_eq!(err[0].code, talon::error_codes::SELF_INHERITANCE);
}
