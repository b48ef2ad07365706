//! Garbage-collector liveness under heap growth.
//!
//! These don't poke the collector's internals directly; they run programs
//! that allocate far more objects than the heap's starting capacity holds,
//! forcing multiple mark-compact cycles (and, for the larger counts, at
//! least one capacity growth), then check every value that must still be
//! reachable through a live reference actually survived with its original
//! content intact. A single corrupted pointer after compaction  would show
//! up as a wrong sum, a wrong string, or a panic.

mod common;

use common::run_source;
use proptest::prelude::*;

fn sum_of_n_closures(n: u32) -> f64 {
    let source = format!(
        r#"
        func make(n) {{
            func get() {{ return n; }}
            return get;
        }}
        var total = 0;
        for (var i = 0; i < {n}; i = i + 1) {{
            var f = make(i);
            total = total + f();
        }}
        "#,
    );
    let run = run_source(&source);
    run.global("main", "total").as_number().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Allocating `n` short-lived closures (each boxing one captured
    /// number) and summing their results must equal the closed-form sum
    /// 0+1+...+(n-1), regardless of how many collections ran in between.
    #[test]
    fn closure_chain_survives_collection(n in 1u32..4000) {
        let expected: f64 = (0..n).map(f64::from).sum();
        prop_assert_eq!(sum_of_n_closures(n), expected);
    }
}

#[test]
fn surviving_instance_keeps_its_field_value_after_many_collections() {
    let run = run_source(
        r#"
        class Box {
            Box(value) {
                this.value = value;
            }
        }
        var boxes = [];
        for (var i = 0; i < 500; i = i + 1) {
            boxes = [Box(i)];
        }
        var last = boxes[0];
        var result = last.value;
        "#,
    );
    assert_eq!(run.global("main", "result").as_number(), Some(499.0));
}

#[test]
fn long_string_concatenation_survives_growth() {
    let run = run_source(
        r#"
        var s = "";
        for (var i = 0; i < 2000; i = i + 1) {
            s = s + "x";
        }
        var len_result = len(s);
        "#,
    );
    assert_eq!(run.global("main", "len_result").as_number(), Some(2000.0));
}
