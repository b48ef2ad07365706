//! Native (builtin) functions
//!
//! Each entry implements [`crate::heap::object::NativeFn`] and is installed
//! into the global table under its bare name by [`crate::vm::install_natives`]
//! — these are the only bare, undeclared globals a module may reference
//! (see the compiler's `BUILTIN_GLOBALS`).

use crate::heap::object::ObjType;
use crate::value::{RuntimeError, Value};
use crate::vm::Shared;

pub const NATIVES: &[(&str, i32, crate::heap::object::NativeFn)] =
    &[("len", 1, len), ("str", 1, str_of), ("clock", 0, clock), ("type_of", 1, type_of)];

/// Length of a string (byte count) or array (element count).
fn len(_shared: &mut Shared, args: &[Value]) -> Result<Value, RuntimeError> {
    let v = args[0];
    match v.as_obj() {
        Some(obj) if obj.tag() == ObjType::String => Ok(Value::Number(obj.as_string().unwrap().value.len() as f64)),
        Some(obj) if obj.tag() == ObjType::Array => Ok(Value::Number(obj.as_array().unwrap().elements.len() as f64)),
        _ => Err(RuntimeError::NotIndexable(v.type_name())),
    }
}

/// Render any value the way `print` would, as an interned string.
fn str_of(shared: &mut Shared, args: &[Value]) -> Result<Value, RuntimeError> {
    let rendered = args[0].to_string();
    Ok(Value::Obj(shared.interner.intern(&mut shared.heap, &rendered)))
}

/// Wall-clock seconds since the UNIX epoch, as a float (spec.md §5's
/// stdlib contract leaves precision to the implementer).
fn clock(_shared: &mut Shared, _args: &[Value]) -> Result<Value, RuntimeError> {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Value::Number(dur.as_secs_f64()))
}

/// The runtime type name of a value, as an interned string — `"nil"`,
/// `"bool"`, `"number"`, or the heap object's kind (`"string"`, `"array"`,
/// `"closure"`, `"instance"`, ...).
fn type_of(shared: &mut Shared, args: &[Value]) -> Result<Value, RuntimeError> {
    let name = args[0].type_name();
    Ok(Value::Obj(shared.interner.intern(&mut shared.heap, name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_string(s: &str) -> (Shared, Value) {
        let mut shared = Shared::new();
        let obj = shared.interner.intern(&mut shared.heap, s);
        (shared, Value::Obj(obj))
    }

    #[test]
    fn test_len_string() {
        let (mut shared, v) = shared_with_string("hello");
        assert_eq!(len(&mut shared, &[v]).unwrap(), Value::Number(5.0));
    }

    #[test]
    fn test_len_rejects_number() {
        let mut shared = Shared::new();
        assert!(len(&mut shared, &[Value::Number(3.0)]).is_err());
    }

    #[test]
    fn test_type_of_number() {
        let mut shared = Shared::new();
        let result = type_of(&mut shared, &[Value::Number(1.0)]).unwrap();
        let obj = result.as_obj().unwrap();
        assert_eq!(obj.as_string().unwrap().value, "number");
    }

    #[test]
    fn test_str_of_number_matches_display() {
        let mut shared = Shared::new();
        let result = str_of(&mut shared, &[Value::Number(42.0)]).unwrap();
        assert_eq!(result.as_obj().unwrap().as_string().unwrap().value, "42");
    }
}
