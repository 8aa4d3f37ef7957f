//! Heap object variants.
//!
//! Every heap allocation lives in exactly one [`crate::heap::Heap`] slot and
//! is addressed through an [`ObjRef`] — a small `Copy` handle rather than a
//! raw pointer, so the collector can be a flat vector of owning slots (see
//! the reimplementation note in the design doc) instead of an intrusive
//! linked list of boxes.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;
use std::fmt;

/// A handle to a heap-allocated object. Cheap to copy, meaningless on its
/// own — always resolved through a [`crate::heap::Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    /// Raw slot index, exposed for diagnostics only.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An interned, immutable string. Two live strings with equal bytes are
/// always the same [`ObjRef`] — see `Heap::intern`.
#[derive(Debug, Clone)]
pub struct LoxString {
    pub chars: String,
    pub hash: u32,
}

impl LoxString {
    pub fn new(chars: String) -> Self {
        let hash = fnv1a_hash(chars.as_bytes());
        Self { chars, hash }
    }
}

/// FNV-1a over raw bytes, as specified for the interning table.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A compiled function: arity, captured-upvalue count, and its chunk.
/// Immutable once the compiler hands it to the VM.
#[derive(Debug)]
pub struct LoxFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` for the top-level script.
    pub name: Option<ObjRef>,
}

impl LoxFunction {
    pub fn new(name: Option<ObjRef>) -> Self {
        Self { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name }
    }
}

/// A native (host) function, exposed as a global (e.g. `clock`).
pub struct NativeFn {
    pub name: &'static str,
    pub arity: u8,
    pub func: fn(&[Value]) -> Result<Value, String>,
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).finish()
    }
}

/// A function paired with its captured environment.
#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Whether an upvalue still aliases a live stack slot or has been hoisted
/// onto the heap after its owning frame returned.
#[derive(Debug, Clone)]
pub enum UpvalueState {
    /// Aliases `stack[index]` in the VM's value stack.
    Open(usize),
    /// The variable has outlived its stack frame; the value now lives here.
    Closed(Value),
}

/// A stable indirection letting a closure reference an outer function's
/// local variable, open while that variable is still on the stack.
#[derive(Debug)]
pub struct Upvalue {
    pub state: UpvalueState,
}

/// A class: a name and its method table (method name -> `Closure` value).
#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    pub methods: Table,
}

impl Class {
    pub fn new(name: ObjRef) -> Self {
        Self { name, methods: Table::new() }
    }
}

/// An instance of a [`Class`] with its own field table.
#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: ObjRef) -> Self {
        Self { class, fields: Table::new() }
    }
}

/// A method closure bound to a particular receiver, produced by property
/// access on an instance (`GET_PROPERTY`) when the name resolves to a
/// method rather than a field.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// The payload of a heap slot. `kind()` names the dynamic type for error
/// messages without requiring a caller to match the full enum.
#[derive(Debug)]
pub enum ObjData {
    Str(LoxString),
    Function(LoxFunction),
    Native(NativeFn),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

impl ObjData {
    /// Short type name, used in runtime error messages ("Can only call
    /// functions and classes", etc.).
    pub fn kind(&self) -> &'static str {
        match self {
            ObjData::Str(_) => "string",
            ObjData::Function(_) => "function",
            ObjData::Native(_) => "native function",
            ObjData::Closure(_) => "closure",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "bound method",
        }
    }
}
