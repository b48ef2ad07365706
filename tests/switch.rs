//! `switch`/`case`/`default`/`advance` control flow.

mod common;

use common::run_source;

#[test]
fn switch_falls_through_on_advance() {
    let run = run_source(
        r#"
        var log = 0;
        func classify(n) {
            switch (n) {
                case 1:
                    log = log + 1;
                    advance;
                case 2:
                    log = log + 10;
                default:
                    log = log + 100;
            }
        }
        classify(1);
        var after_one = log;
        log = 0;
        classify(2);
        var after_two = log;
        log = 0;
        classify(99);
        var after_default = log;
        "#,
    );
    assert_eq!(run.global("main", "after_one").as_number(), Some(111.0));
    assert_eq!(run.global("main", "after_two").as_number(), Some(110.0));
    assert_eq!(run.global("main", "after_default").as_number(), Some(100.0));
}

#[test]
fn advance_in_last_arm_falls_through_to_end_without_error() {
    // `default` is the textually last arm here, so `advance` inside it has
    // no next arm to fall into — it must just reach the end of the switch
    // rather than being a compile error.
    let run = run_source(
        r#"
        var x = 0;
        switch (99) {
            case 1:
                x = 1;
            default:
                x = 2;
                advance;
        }
        "#,
    );
    assert_eq!(run.global("main", "x").as_number(), Some(2.0));
}

#[test]
fn case_without_advance_or_break_falls_through() {
    // Fallthrough is the default: a case body that runs to completion
    // continues into the next case's body without re-testing it, exactly
    // as if it had ended in `advance`.
    let run = run_source(
        r#"
        var x = 0;
        switch (1) {
            case 1:
                x = 1;
            case 2:
                x = x + 100;
        }
        "#,
    );
    assert_eq!(run.global("main", "x").as_number(), Some(101.0));
}

#[test]
fn break_stops_fallthrough() {
    let run = run_source(
        r#"
        var x = 0;
        switch (1) {
            case 1:
                x = 1;
                break;
            case 2:
                x = x + 100;
        }
        "#,
    );
    assert_eq!(run.global("main", "x").as_number(), Some(1.0));
}
