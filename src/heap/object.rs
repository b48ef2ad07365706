//! Heap object layout
//!
//! Every heap allocation starts with an [`ObjHeader`] so the collector can
//! walk the arena without knowing the concrete type at each address, and so
//! a `*mut ObjHeader` can be reinterpreted as `*mut ObjString`/`*mut
//! ObjArray`/etc once `tag` is known. Grounded directly on
//! `original_source/src/MemoryManagment/heapObject.h` and
//! `original_source/src/Objects/objects.h` (the "what": one header, one tag
//! enum, one struct per kind) rewritten as `#[repr(C)]` Rust structs instead
//! of a C++ class hierarchy, since the collector moves objects by raw byte
//! copy rather than virtual dispatch.

use crate::bytecode::Chunk;
use crate::value::{RuntimeError, Value};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex};

/// Discriminant stored in every [`ObjHeader`]. Exactly the 12 kinds
/// spec.md §3 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    String,
    Array,
    Function,
    NativeFn,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
    File,
    Mutex,
    Future,
}

impl fmt::Display for ObjType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjType::String => "string",
            ObjType::Array => "array",
            ObjType::Function => "function",
            ObjType::NativeFn => "native function",
            ObjType::Closure => "closure",
            ObjType::Upvalue => "upvalue",
            ObjType::Class => "class",
            ObjType::Instance => "instance",
            ObjType::BoundMethod => "bound method",
            ObjType::File => "file",
            ObjType::Mutex => "mutex",
            ObjType::Future => "future",
        };
        write!(f, "{s}")
    }
}

/// Header prefixing every heap object.
///
/// `forward` serves two purposes at different points in a collection cycle
/// (the Lisp-2 trick from `garbageCollector.cpp`): during mark it is either
/// null (unvisited) or the sentinel `MARKED` pointer (visited, live);
/// during the plan phase it is overwritten with the object's post-compaction
/// address, which `compact` then uses to relocate both the object itself and
/// every pointer that refers to it.
#[repr(C)]
pub struct ObjHeader {
    pub tag: ObjType,
    pub forward: *mut ObjHeader,
    /// Total size in bytes of this allocation, header included. Used by the
    /// sweep/compact passes to walk the arena without per-type knowledge.
    pub size: usize,
}

/// Sentinel written into `forward` during mark to mean "visited, live,
/// forwarding address not yet assigned" without aliasing a real address.
pub const MARKED: *mut ObjHeader = 1 as *mut ObjHeader;

impl ObjHeader {
    pub fn new(tag: ObjType, size: usize) -> Self {
        Self {
            tag,
            forward: std::ptr::null_mut(),
            size,
        }
    }

    pub fn is_marked(&self) -> bool {
        !self.forward.is_null()
    }

    pub fn mark(&mut self) {
        if self.forward.is_null() {
            self.forward = MARKED;
        }
    }

    pub fn unmark(&mut self) {
        self.forward = std::ptr::null_mut();
    }
}

/// A GC-managed pointer. `Copy` because a `Value::Obj` is just this pointer;
/// cloning never duplicates the pointee. Never held across a potential
/// allocation without being re-read from a root, since the collector may
/// relocate the object (see [`crate::heap::Heap::collect`]).
#[derive(Clone, Copy)]
pub struct ObjRef(pub NonNull<ObjHeader>);

/// Safe to hand to another thread: every access to the pointee goes through
/// the heap's single allocation lock (see [`crate::vm`]'s `Shared`), which
/// is what actually serializes mutation, not `Send`/`Sync` on the pointer
/// itself.
unsafe impl Send for ObjRef {}

impl ObjRef {
    /// # Safety
    /// `ptr` must point at a live, fully-initialized `ObjHeader`-prefixed
    /// allocation.
    pub unsafe fn from_raw(ptr: *mut ObjHeader) -> Self {
        ObjRef(NonNull::new_unchecked(ptr))
    }

    pub fn header(&self) -> &ObjHeader {
        unsafe { self.0.as_ref() }
    }

    pub fn header_mut(&mut self) -> &mut ObjHeader {
        unsafe { self.0.as_mut() }
    }

    pub fn tag(&self) -> ObjType {
        self.header().tag
    }

    pub fn type_name(&self) -> &'static str {
        match self.tag() {
            ObjType::String => "string",
            ObjType::Array => "array",
            ObjType::Function => "function",
            ObjType::NativeFn => "native function",
            ObjType::Closure => "closure",
            ObjType::Upvalue => "upvalue",
            ObjType::Class => "class",
            ObjType::Instance => "instance",
            ObjType::BoundMethod => "bound method",
            ObjType::File => "file",
            ObjType::Mutex => "mutex",
            ObjType::Future => "future",
        }
    }

    pub fn same_identity(&self, other: &ObjRef) -> bool {
        self.0 == other.0
    }

    fn as_ptr<T>(&self) -> *mut T {
        self.0.as_ptr() as *mut T
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        (self.tag() == ObjType::String).then(|| unsafe { &*self.as_ptr::<ObjString>() })
    }

    pub fn as_string_mut(&mut self) -> Option<&mut ObjString> {
        (self.tag() == ObjType::String).then(|| unsafe { &mut *self.as_ptr::<ObjString>() })
    }

    pub fn as_array(&self) -> Option<&ObjArray> {
        (self.tag() == ObjType::Array).then(|| unsafe { &*self.as_ptr::<ObjArray>() })
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ObjArray> {
        (self.tag() == ObjType::Array).then(|| unsafe { &mut *self.as_ptr::<ObjArray>() })
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        (self.tag() == ObjType::Function).then(|| unsafe { &*self.as_ptr::<ObjFunction>() })
    }

    pub fn as_native(&self) -> Option<&ObjNativeFn> {
        (self.tag() == ObjType::NativeFn).then(|| unsafe { &*self.as_ptr::<ObjNativeFn>() })
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        (self.tag() == ObjType::Closure).then(|| unsafe { &*self.as_ptr::<ObjClosure>() })
    }

    pub fn as_closure_mut(&mut self) -> Option<&mut ObjClosure> {
        (self.tag() == ObjType::Closure).then(|| unsafe { &mut *self.as_ptr::<ObjClosure>() })
    }

    pub fn as_upvalue(&self) -> Option<&ObjUpvalue> {
        (self.tag() == ObjType::Upvalue).then(|| unsafe { &*self.as_ptr::<ObjUpvalue>() })
    }

    pub fn as_upvalue_mut(&mut self) -> Option<&mut ObjUpvalue> {
        (self.tag() == ObjType::Upvalue).then(|| unsafe { &mut *self.as_ptr::<ObjUpvalue>() })
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        (self.tag() == ObjType::Class).then(|| unsafe { &*self.as_ptr::<ObjClass>() })
    }

    pub fn as_class_mut(&mut self) -> Option<&mut ObjClass> {
        (self.tag() == ObjType::Class).then(|| unsafe { &mut *self.as_ptr::<ObjClass>() })
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        (self.tag() == ObjType::Instance).then(|| unsafe { &*self.as_ptr::<ObjInstance>() })
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut ObjInstance> {
        (self.tag() == ObjType::Instance).then(|| unsafe { &mut *self.as_ptr::<ObjInstance>() })
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        (self.tag() == ObjType::BoundMethod).then(|| unsafe { &*self.as_ptr::<ObjBoundMethod>() })
    }

    pub fn as_file_mut(&mut self) -> Option<&mut ObjFile> {
        (self.tag() == ObjType::File).then(|| unsafe { &mut *self.as_ptr::<ObjFile>() })
    }

    pub fn as_mutex(&self) -> Option<&ObjMutex> {
        (self.tag() == ObjType::Mutex).then(|| unsafe { &*self.as_ptr::<ObjMutex>() })
    }

    pub fn as_future(&self) -> Option<&ObjFuture> {
        (self.tag() == ObjType::Future).then(|| unsafe { &*self.as_ptr::<ObjFuture>() })
    }

    pub fn as_future_mut(&mut self) -> Option<&mut ObjFuture> {
        (self.tag() == ObjType::Future).then(|| unsafe { &mut *self.as_ptr::<ObjFuture>() })
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            ObjType::String => write!(f, "{}", self.as_string().unwrap().value),
            ObjType::Array => {
                let arr = self.as_array().unwrap();
                write!(f, "[")?;
                for (i, v) in arr.elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            ObjType::Function => {
                let func = self.as_function().unwrap();
                match &func.name {
                    Some(n) => write!(f, "<fn {}>", n.as_string().unwrap().value),
                    None => write!(f, "<script>"),
                }
            }
            ObjType::NativeFn => write!(f, "<native fn {}>", self.as_native().unwrap().name),
            ObjType::Closure => write!(f, "{}", ObjRef(self.0).as_closure().unwrap().function),
            ObjType::Upvalue => write!(f, "<upvalue>"),
            ObjType::Class => write!(f, "{}", self.as_class().unwrap().name.as_string().unwrap().value),
            ObjType::Instance => {
                let inst = self.as_instance().unwrap();
                let class_name = inst.class.as_class().unwrap().name.as_string().unwrap();
                write!(f, "<{} instance>", class_name.value)
            }
            ObjType::BoundMethod => write!(f, "{}", self.as_bound_method().unwrap().method),
            ObjType::File => write!(f, "<file>"),
            ObjType::Mutex => write!(f, "<mutex>"),
            ObjType::Future => write!(f, "<future>"),
        }
    }
}

#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub hash: u64,
    pub value: String,
}

#[repr(C)]
pub struct ObjArray {
    pub header: ObjHeader,
    pub elements: Vec<Value>,
}

#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub module_index: u32,
}

/// Native functions may declare `arity = -1` to accept any argument count
/// (spec.md §5). Takes `&mut Shared` rather than `&mut Thread` because a
/// native runs from inside `Thread::step` while the caller's `Shared` lock
/// is already held — going through `Thread` would tempt a native into
/// relocking the same mutex it's already inside and deadlocking.
pub type NativeFn = fn(&mut crate::vm::Shared, &[Value]) -> Result<Value, RuntimeError>;

#[repr(C)]
pub struct ObjNativeFn {
    pub header: ObjHeader,
    pub name: String,
    pub arity: i32,
    pub func: NativeFn,
}

#[derive(Clone, Copy)]
pub enum UpvalueLocation {
    /// Points at a slot on the value stack of the thread that created it
    /// (`thread_index` indexes `Shared.threads`). Absolute slot indices
    /// are only meaningful within their owning thread's own stack, so the
    /// thread index disambiguates which stack `slot` refers to once a
    /// closure crosses into another thread (e.g. as a `launch_async`
    /// argument) while the upvalue is still open.
    Open { thread_index: usize, slot: usize },
    /// The owning frame returned (or its thread exited); the value now
    /// lives in the upvalue itself.
    Closed(Value),
}

#[repr(C)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub location: UpvalueLocation,
}

#[repr(C)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[repr(C)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: ObjRef,
    /// Copy-down inheritance (spec.md §3): at `inherit` time the parent's
    /// whole method table is copied in, rather than walked at dispatch
    /// time. A subclass overriding a method just overwrites the entry
    /// copied from its parent.
    pub methods: HashMap<String, ObjRef>,
}

#[repr(C)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: ObjRef,
    pub fields: HashMap<String, Value>,
}

#[repr(C)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: ObjRef,
}

#[repr(C)]
pub struct ObjFile {
    pub header: ObjHeader,
    pub path: String,
    pub handle: Option<std::fs::File>,
}

#[repr(C)]
pub struct ObjMutex {
    pub header: ObjHeader,
    pub inner: Arc<Mutex<()>>,
}

pub struct FutureState {
    pub done: bool,
    pub result: Option<Result<Value, RuntimeError>>,
}

#[repr(C)]
pub struct ObjFuture {
    pub header: ObjHeader,
    pub state: Arc<(Mutex<FutureState>, Condvar)>,
    pub handle: Option<std::thread::JoinHandle<()>>,
}
