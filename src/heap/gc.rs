//! Lisp-2 style moving mark-compact collector
//!
//! Six phases, named the way `original_source/src/MemoryManagment/
//! garbageCollector.cpp` names them: Pause (the caller already stopped the
//! world before calling [`crate::heap::Heap::collect`]), Mark, Plan,
//! Rewrite, Compact, Resume. The forwarding pointer in every
//! [`super::object::ObjHeader`] does double duty exactly as the original
//! does: a sentinel during Mark ("this object is reachable"), then a
//! concrete relocation target during Plan/Rewrite/Compact.

use super::object::{
    ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader, ObjInstance, ObjType,
    ObjUpvalue, UpvalueLocation,
};
use crate::value::Value;
use std::ptr::NonNull;

/// Implemented by whatever owns GC roots (the VM's threads, globals table,
/// and the interned string table). `collect` calls these twice: once to
/// mark, once to rewrite pointers after objects have a planned address.
pub trait GcRoots {
    fn visit_value_roots(&mut self, visit: &mut dyn FnMut(&mut Value));
    fn visit_obj_roots(&mut self, visit: &mut dyn FnMut(&mut super::object::ObjRef));
}

use super::object::ObjRef;

/// Sentinel marking written into `forward` during Mark; distinct from any
/// real offset because offsets are encoded as `offset + 1` (see
/// [`encode_offset`]), so `1` never legitimately appears as a planned
/// address.
const MARK_SENTINEL: *mut ObjHeader = 1 as *mut ObjHeader;

pub fn mark_sentinel() -> *mut ObjHeader {
    MARK_SENTINEL
}

pub fn encode_offset(offset: usize) -> *mut ObjHeader {
    (offset + 1) as *mut ObjHeader
}

pub fn decode_offset(p: *mut ObjHeader) -> usize {
    (p as usize) - 1
}

/// Visit every child pointer a heap object holds, dispatching on its tag.
/// Used by both Mark (to push children onto the work list) and Rewrite (to
/// translate each child to its post-compaction address).
///
/// # Safety
/// `header` must point at a live, fully-initialized object matching its tag.
pub unsafe fn for_each_child(header: *mut ObjHeader, visit: &mut dyn FnMut(&mut ObjRef)) {
    match (*header).tag {
        ObjType::String | ObjType::NativeFn | ObjType::File | ObjType::Mutex | ObjType::Future => {}
        ObjType::Array => {
            let obj = &mut *(header as *mut ObjArray);
            for v in obj.elements.iter_mut() {
                if let Value::Obj(r) = v {
                    visit(r);
                }
            }
        }
        ObjType::Function => {
            let obj = &mut *(header as *mut ObjFunction);
            if let Some(n) = obj.name.as_mut() {
                visit(n);
            }
            for c in obj.chunk.constants.iter_mut() {
                if let Value::Obj(r) = c {
                    visit(r);
                }
            }
        }
        ObjType::Closure => {
            let obj = &mut *(header as *mut ObjClosure);
            visit(&mut obj.function);
            for u in obj.upvalues.iter_mut() {
                visit(u);
            }
        }
        ObjType::Upvalue => {
            let obj = &mut *(header as *mut ObjUpvalue);
            if let UpvalueLocation::Closed(v) = &mut obj.location {
                if let Value::Obj(r) = v {
                    visit(r);
                }
            }
        }
        ObjType::Class => {
            let obj = &mut *(header as *mut ObjClass);
            visit(&mut obj.name);
            for m in obj.methods.values_mut() {
                visit(m);
            }
        }
        ObjType::Instance => {
            let obj = &mut *(header as *mut ObjInstance);
            visit(&mut obj.class);
            for v in obj.fields.values_mut() {
                if let Value::Obj(r) = v {
                    visit(r);
                }
            }
        }
        ObjType::BoundMethod => {
            let obj = &mut *(header as *mut ObjBoundMethod);
            if let Value::Obj(r) = &mut obj.receiver {
                visit(r);
            }
            visit(&mut obj.method);
        }
    }
}

/// Run the destructor for whatever concrete type `header` names, without
/// freeing the backing memory (the bump arena owns that; overflow
/// allocations free themselves via `Box::from_raw` in their own glue).
///
/// # Safety
/// `header` must not be touched again afterwards other than to read its
/// (non-`Drop`) `tag`/`forward`/`size` fields.
pub unsafe fn drop_obj_in_place(header: *mut ObjHeader) {
    use super::object::{ObjFile, ObjFuture, ObjNativeFn, ObjString};
    match (*header).tag {
        ObjType::String => std::ptr::drop_in_place(header as *mut ObjString),
        ObjType::Array => std::ptr::drop_in_place(header as *mut ObjArray),
        ObjType::Function => std::ptr::drop_in_place(header as *mut ObjFunction),
        ObjType::NativeFn => std::ptr::drop_in_place(header as *mut ObjNativeFn),
        ObjType::Closure => std::ptr::drop_in_place(header as *mut ObjClosure),
        ObjType::Upvalue => std::ptr::drop_in_place(header as *mut ObjUpvalue),
        ObjType::Class => std::ptr::drop_in_place(header as *mut ObjClass),
        ObjType::Instance => std::ptr::drop_in_place(header as *mut ObjInstance),
        ObjType::BoundMethod => std::ptr::drop_in_place(header as *mut ObjBoundMethod),
        ObjType::File => std::ptr::drop_in_place(header as *mut ObjFile),
        ObjType::Mutex => std::ptr::drop_in_place(header as *mut super::object::ObjMutex),
        ObjType::Future => std::ptr::drop_in_place(header as *mut ObjFuture),
    }
}

/// Mark phase: flood-fill reachability from the roots, using an explicit
/// work list rather than recursion (script-authored object graphs can
/// nest far deeper than the host stack should absorb).
pub fn mark<R: GcRoots>(roots: &mut R) {
    let mut worklist: Vec<ObjRef> = Vec::new();
    roots.visit_value_roots(&mut |v| {
        if let Value::Obj(r) = v {
            worklist.push(*r);
        }
    });
    roots.visit_obj_roots(&mut |r| worklist.push(*r));

    while let Some(r) = worklist.pop() {
        if !r.header().is_marked() {
            unsafe {
                (*r.0.as_ptr()).forward = MARK_SENTINEL;
                for_each_child(r.0.as_ptr(), &mut |child| worklist.push(*child));
            }
        }
    }
}

/// A resolved target address: either inside the (possibly newly-grown)
/// arena, or unchanged because the original pointer referred to an
/// overflow allocation that never moves.
pub fn translate(
    r: ObjRef,
    old_arena_base: *mut u8,
    old_bump: usize,
    target_base: NonNull<u8>,
) -> ObjRef {
    let addr = r.0.as_ptr() as usize;
    let base = old_arena_base as usize;
    if addr >= base && addr < base + old_bump {
        let offset = decode_offset(r.header().forward);
        unsafe { ObjRef::from_raw(target_base.as_ptr().add(offset) as *mut ObjHeader) }
    } else {
        r
    }
}
