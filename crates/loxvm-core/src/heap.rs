//! The allocator and precise mark-sweep collector.
//!
//! Rather than the intrusive linked list of heap objects the original
//! implementation uses (each object's header carries a `next` pointer), the
//! object list here is a flat, owning `Vec<Slot>` addressed by generational
//! — well, non-generational, but index-stable — [`ObjRef`] handles. This is
//! the substitution the design notes explicitly call out as acceptable: a
//! "flat vector of owning boxes plus ... indices", as long as sweep can
//! still enumerate every live allocation without walking user data, and
//! mark/sweep semantics are preserved exactly.

use crate::object::{LoxString, ObjData, ObjRef};
use crate::table::Table;
use crate::value::Value;
use std::mem::size_of;
use tracing::trace;

struct Slot {
    data: Option<ObjData>,
    marked: bool,
}

/// Anything that holds live references into the heap and must be walked
/// when a collection starts. The VM implements this for its stack, call
/// frames, globals and open-upvalue list; the compiler implements it for
/// its chain of in-progress function frames.
pub trait Roots {
    fn mark_roots(&self, heap: &mut Heap);
}

/// A [`Roots`] with nothing to mark — for callers of [`crate::Heap`] that
/// have no live VM to union in (standalone compiles, tests).
pub struct NoRoots;

impl Roots for NoRoots {
    fn mark_roots(&self, _heap: &mut Heap) {}
}

/// The allocator, object store, string-interning table, and collector
/// state for one isolated VM instance.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Content-keyed interning pool: key = the interned string itself,
    /// value is unused (`Value::Nil`). See [`Heap::intern`].
    strings: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    /// When set, every allocation triggers a collection first — a stress
    /// test for GC soundness rather than a throughput knob.
    pub stress_gc: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: crate::GC_INITIAL_THRESHOLD,
            stress_gc: false,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.data.is_some()).count()
    }

    /// Allocates `data`, reusing a freed slot when one is available.
    /// Does not itself trigger a collection — callers decide the safe
    /// point via [`Heap::collect_if_needed`], after protecting the new
    /// reference on a root (see the allocation-hazard note on
    /// [`Heap::collect_if_needed`]).
    pub fn alloc(&mut self, data: ObjData) -> ObjRef {
        self.bytes_allocated += weight(&data);
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Slot { data: Some(data), marked: false };
            ObjRef(idx)
        } else {
            self.slots.push(Slot { data: Some(data), marked: false });
            ObjRef((self.slots.len() - 1) as u32)
        }
    }

    pub fn get(&self, r: ObjRef) -> &ObjData {
        self.slots[r.0 as usize].data.as_ref().expect("dangling ObjRef")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut ObjData {
        self.slots[r.0 as usize].data.as_mut().expect("dangling ObjRef")
    }

    pub fn as_string(&self, r: ObjRef) -> &LoxString {
        match self.get(r) {
            ObjData::Str(s) => s,
            other => panic!("expected string, found {}", other.kind()),
        }
    }

    /// Interns `chars`, returning the existing `ObjRef` if an equal-content
    /// string already lives on the heap, allocating a new one otherwise.
    /// This is the operation that upholds the "equal content implies
    /// identical identity" invariant for every live string.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = crate::object::fnv1a_hash(chars.as_bytes());
        if let Some(existing) =
            self.strings.find_by(hash, |r| self.as_string(r).chars == chars)
        {
            return existing;
        }
        let obj = self.alloc(ObjData::Str(LoxString::new(chars.to_string())));
        self.strings.set(obj, hash, Value::Nil);
        obj
    }

    /// Renders an object's user-visible form (used by `print`, string
    /// concatenation, and `Value::display`).
    pub fn display_obj(&self, r: ObjRef) -> String {
        match self.get(r) {
            ObjData::Str(s) => s.chars.clone(),
            ObjData::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.as_string(name).chars),
                None => "<script>".to_string(),
            },
            ObjData::Native(n) => format!("<native fn {}>", n.name),
            ObjData::Closure(c) => self.display_obj(c.function),
            ObjData::Upvalue(_) => "<upvalue>".to_string(),
            ObjData::Class(c) => self.as_string(c.name).chars.clone(),
            ObjData::Instance(i) => format!("{} instance", self.as_string(self.class_name(i.class)).chars),
            ObjData::BoundMethod(b) => self.display_obj(b.method),
        }
    }

    fn class_name(&self, class: ObjRef) -> ObjRef {
        match self.get(class) {
            ObjData::Class(c) => c.name,
            _ => unreachable!("class ref did not point at a Class"),
        }
    }

    /// Runs a collection if warranted: either `stress_gc` is set, or
    /// `bytes_allocated` has crossed `next_gc`. Call this right after an
    /// allocating helper has protected its result (pushed it on the value
    /// stack, stored it in a local variable slot, etc.) — any object
    /// reachable *only* through an unprotected native-language variable is
    /// invisible to `roots` and would be collected out from under it.
    pub fn collect_if_needed(&mut self, roots: &dyn Roots) {
        if self.stress_gc || self.bytes_allocated > self.next_gc {
            self.collect_garbage(roots);
        }
    }

    pub fn collect_garbage(&mut self, roots: &dyn Roots) {
        trace!(bytes_allocated = self.bytes_allocated, "gc begin");
        roots.mark_roots(self);
        self.trace_references();
        self.remove_white_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated * crate::GC_GROW_FACTOR;
        trace!(bytes_allocated = self.bytes_allocated, next_gc = self.next_gc, "gc end");
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = &mut self.slots[r.0 as usize];
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Marks every object a live object directly references. Children are
    /// copied out (every field involved is `Copy`) before recursing so we
    /// never hold a borrow of `self.slots` across a `mark_object` call.
    fn blacken(&mut self, r: ObjRef) {
        let mut obj_children: Vec<ObjRef> = Vec::new();
        let mut value_children: Vec<Value> = Vec::new();
        match self.get(r) {
            ObjData::Str(_) | ObjData::Native(_) => {}
            ObjData::Function(f) => {
                obj_children.extend(f.name);
                value_children.extend_from_slice(f.chunk.constants());
            }
            ObjData::Closure(c) => {
                obj_children.push(c.function);
                obj_children.extend(c.upvalues.iter().copied());
            }
            ObjData::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(v) = &u.state {
                    value_children.push(*v);
                }
            }
            ObjData::Class(c) => {
                obj_children.push(c.name);
                for (k, _, v) in c.methods.iter() {
                    obj_children.push(k);
                    value_children.push(v);
                }
            }
            ObjData::Instance(i) => {
                obj_children.push(i.class);
                for (k, _, v) in i.fields.iter() {
                    obj_children.push(k);
                    value_children.push(v);
                }
            }
            ObjData::BoundMethod(b) => {
                obj_children.push(b.method);
                value_children.push(b.receiver);
            }
        }
        for child in obj_children {
            self.mark_object(child);
        }
        for value in value_children {
            self.mark_value(value);
        }
    }

    fn remove_white_strings(&mut self) {
        let slots = &self.slots;
        self.strings.retain_marked(|r| slots[r.0 as usize].marked);
    }

    fn sweep(&mut self) {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.data.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                let freed = slot.data.take().expect("checked above");
                self.bytes_allocated -= weight(&freed);
                self.free.push(idx as u32);
            }
        }
    }
}

/// A crude but monotonic size estimate per object, used only to decide
/// when `bytes_allocated` has grown enough to warrant a collection.
fn weight(data: &ObjData) -> usize {
    let base = size_of::<ObjData>();
    base + match data {
        ObjData::Str(s) => s.chars.len(),
        ObjData::Function(f) => f.chunk.code().len() * 16 + f.chunk.constants().len() * 16,
        ObjData::Native(_) => 0,
        ObjData::Closure(c) => c.upvalues.len() * 8,
        ObjData::Upvalue(_) => 0,
        ObjData::Class(c) => c.methods.len() * 24,
        ObjData::Instance(i) => i.fields.len() * 24,
        ObjData::BoundMethod(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct NoRoots;
    impl Roots for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }

    struct OneRoot(ObjRef);
    impl Roots for OneRoot {
        fn mark_roots(&self, heap: &mut Heap) {
            heap.mark_object(self.0);
        }
    }

    #[test]
    fn interning_gives_identical_refs_for_equal_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        let c = heap.intern("world");
        assert_ne!(a, c);
    }

    #[test]
    fn sweep_frees_unreachable_objects_and_keeps_rooted_ones() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let _garbage = heap.intern("garbage");
        assert_eq!(heap.object_count(), 2);

        heap.collect_garbage(&OneRoot(kept));

        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.as_string(kept).chars, "kept");
    }

    #[test]
    fn collect_with_no_roots_frees_everything() {
        let mut heap = Heap::new();
        heap.intern("a");
        heap.intern("b");
        heap.collect_garbage(&NoRoots);
        assert_eq!(heap.object_count(), 0);
    }
}
