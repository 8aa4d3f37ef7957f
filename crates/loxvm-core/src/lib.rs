//! loxvm-core — value/object model, chunk format, interning table and GC.
//!
//! This crate has no knowledge of parsing or dispatch; it is the substrate
//! both `loxvm-compiler` and `loxvm-vm` build on:
//!
//! - [`chunk`] — `Chunk`/`Op`, the compiled form of a function body.
//! - [`value`] — the tagged `Value` union.
//! - [`object`] — heap object variants (`String`, `Function`, `Closure`, …).
//! - [`table`] — the open-addressed hash table used for globals, fields,
//!   methods, and string interning.
//! - [`heap`] — the allocator and mark-sweep collector.

#![deny(rust_2018_idioms, unused_must_use)]

pub mod chunk;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, Op, UpvalueCapture};
pub use heap::{Heap, NoRoots, Roots};
pub use object::{
    BoundMethod, Class, Closure, Instance, LoxFunction, LoxString, NativeFn, ObjData, ObjRef,
    Upvalue, UpvalueState,
};
pub use table::Table;
pub use value::Value;

/// Maximum number of constants a single chunk may hold (one-byte operand).
pub const MAX_CONSTANTS: usize = 256;

/// Maximum forward/backward distance a jump/loop instruction may span.
pub const MAX_JUMP: usize = u16::MAX as usize;

/// Maximum number of locals live in a single function (one-byte slot).
pub const MAX_LOCALS: usize = 256;

/// Maximum number of upvalues a single function may capture.
pub const MAX_UPVALUES: usize = 256;

/// Growth factor applied to `next_gc` after a collection cycle.
pub const GC_GROW_FACTOR: usize = 2;

/// `bytes_allocated` threshold for the very first collection.
pub const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;
