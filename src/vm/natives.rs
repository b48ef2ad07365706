//! Wires [`crate::stdlib`]'s native function table into the global table.

use super::Shared;
use crate::heap::object::{ObjHeader, ObjNativeFn, ObjType};

pub fn install_natives(shared: &mut Shared) {
    for &(name, arity, func) in crate::stdlib::NATIVES {
        let obj = shared.heap.alloc(ObjNativeFn {
            header: ObjHeader::new(ObjType::NativeFn, std::mem::size_of::<ObjNativeFn>()),
            name: name.to_string(),
            arity,
            func,
        });
        shared.globals.insert(name.to_string(), crate::value::Value::Obj(obj));
    }
}
