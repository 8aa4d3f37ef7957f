//! The stack-based dispatch loop: call frames, upvalue capture/close,
//! property/method dispatch, and the runtime error taxonomy of §7.
//!
//! `Vm` does not own a [`Heap`] — like [`loxvm_compiler::compiler::Compiler`]
//! it takes one as an explicit `&mut` parameter on every method. This keeps
//! `Vm`'s own borrows (its stack, its frames) disjoint from the heap's, the
//! same trick the compiler uses to let a `Roots` impl borrow `self`
//! immutably while the caller holds `&mut Heap` separately.

use loxvm_core::heap::Roots;
use loxvm_core::object::{
    BoundMethod, Class, Closure, Instance, NativeFn, ObjData, ObjRef, Upvalue, UpvalueState,
};
use loxvm_core::{Heap, Op, Table, Value};
use std::io::Write;

use crate::error::RuntimeError;

/// Hard caps mirroring the original's fixed-size stacks.
const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

/// Runtime knobs layered on top of spec's core semantics (§12): both are
/// no-ops for program *output*, only for diagnostics and GC cadence.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Log every dispatched instruction and the stack before it executes.
    pub trace: bool,
    /// Run a collection before every allocation instead of only past the
    /// `next_gc` threshold — exercises GC correctness, not throughput.
    pub stress_gc: bool,
}

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Index into `Vm::stack` of this frame's slot 0 (the callee/receiver).
    slots: usize,
}

/// One isolated interpreter instance. All mutable state — value stack,
/// frame stack, globals, open-upvalue list — lives here; a second `Vm`
/// has entirely disjoint state, per §5.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Kept in descending order by stack location, per §8 invariant 6.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    options: VmOptions,
    /// Where `print` writes. Defaults to stdout; tests substitute an
    /// in-memory buffer to assert on program output.
    stdout: Box<dyn Write>,
}

impl Roots for Vm {
    fn mark_roots(&self, heap: &mut Heap) {
        for value in &self.stack {
            heap.mark_value(*value);
        }
        for frame in &self.frames {
            heap.mark_object(frame.closure);
        }
        for upvalue in &self.open_upvalues {
            heap.mark_object(*upvalue);
        }
        for (key, _, value) in self.globals.iter() {
            heap.mark_object(key);
            heap.mark_value(value);
        }
        heap.mark_object(self.init_string);
    }
}

impl Vm {
    pub fn new(heap: &mut Heap, options: VmOptions) -> Self {
        Self::with_stdout(heap, options, Box::new(std::io::stdout()))
    }

    /// Like [`Vm::new`], but `print` writes to `stdout` instead of the
    /// process's standard output — how tests observe program output.
    pub fn with_stdout(heap: &mut Heap, options: VmOptions, stdout: Box<dyn Write>) -> Self {
        let init_string = heap.intern("init");
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(8),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            options,
            stdout,
        }
    }

    /// Registers the standard library. Called once by [`crate::interpret`]
    /// before running the compiled script.
    pub fn define_native(&mut self, heap: &mut Heap, name: &str, native: NativeFn) {
        let name_ref = heap.intern(name);
        let native_ref = heap.alloc(ObjData::Native(native));
        self.globals.set(name_ref, heap.as_string(name_ref).hash, Value::Obj(native_ref));
    }

    /// Wraps `function` in a closure, pushes it as frame 0, and runs the
    /// dispatch loop to completion.
    pub fn run_function(&mut self, heap: &mut Heap, function: ObjRef) -> Result<(), RuntimeError> {
        let closure = heap.alloc(ObjData::Closure(Closure { function, upvalues: Vec::new() }));
        self.push(Value::Obj(closure));
        self.call(heap, closure, 0)?;
        self.run(heap)
    }

    // -----------------------------------------------------------------
    // Stack helpers
    // -----------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("dispatch never pops past a frame's own pushes")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // -----------------------------------------------------------------
    // Error construction
    // -----------------------------------------------------------------

    fn runtime_error(&self, heap: &Heap, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        tracing::debug!(%message, "runtime error");
        let mut stack_trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = match heap.get(frame.closure) {
                ObjData::Closure(c) => c.function,
                _ => unreachable!("frame.closure always refers to a Closure"),
            };
            let (name, chunk_line) = match heap.get(function) {
                ObjData::Function(f) => {
                    let line = f.chunk.line(frame.ip.saturating_sub(1));
                    let name = match f.name {
                        Some(n) => heap.as_string(n).chars.clone(),
                        None => "script".to_string(),
                    };
                    (name, line)
                }
                _ => unreachable!("closure.function always refers to a Function"),
            };
            stack_trace.push(format!("[line {chunk_line}] in {name}"));
        }
        RuntimeError { message, stack_trace }
    }

    // -----------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------

    fn run(&mut self, heap: &mut Heap) -> Result<(), RuntimeError> {
        loop {
            let op = {
                let frame = self.frames.last().expect("run is only called with an active frame");
                let chunk = self.chunk_of(heap, frame.closure);
                chunk.code()[frame.ip].clone()
            };
            self.frames.last_mut().expect("checked above").ip += 1;

            if self.options.trace {
                tracing::trace!(?op, stack = ?self.stack, "dispatch");
            }

            match op {
                Op::Constant(idx) => {
                    let value = self.chunk_of(heap, self.frame().closure).constant(idx);
                    self.push(value);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),
                Op::Pop => {
                    self.pop();
                }
                Op::GetLocal(slot) => {
                    let idx = self.frame().slots + slot as usize;
                    self.push(self.stack[idx]);
                }
                Op::SetLocal(slot) => {
                    let idx = self.frame().slots + slot as usize;
                    self.stack[idx] = self.peek(0);
                }
                Op::GetGlobal(idx) => {
                    let name = self.chunk_of(heap, self.frame().closure).constant(idx);
                    let name_ref = name.as_obj().expect("identifier constants are always strings");
                    let hash = heap.as_string(name_ref).hash;
                    match self.globals.get(name_ref, hash) {
                        Some(v) => self.push(v),
                        None => {
                            let msg =
                                format!("Undefined variable '{}'.", heap.as_string(name_ref).chars);
                            return Err(self.runtime_error(heap, msg));
                        }
                    }
                }
                Op::SetGlobal(idx) => {
                    let name = self.chunk_of(heap, self.frame().closure).constant(idx);
                    let name_ref = name.as_obj().expect("identifier constants are always strings");
                    let hash = heap.as_string(name_ref).hash;
                    if self.globals.set(name_ref, hash, self.peek(0)) {
                        self.globals.delete(name_ref, hash);
                        let msg =
                            format!("Undefined variable '{}'.", heap.as_string(name_ref).chars);
                        return Err(self.runtime_error(heap, msg));
                    }
                }
                Op::DefineGlobal(idx) => {
                    let name = self.chunk_of(heap, self.frame().closure).constant(idx);
                    let name_ref = name.as_obj().expect("identifier constants are always strings");
                    let hash = heap.as_string(name_ref).hash;
                    let value = self.pop();
                    self.globals.set(name_ref, hash, value);
                }
                Op::GetUpvalue(idx) => {
                    let closure_ref = self.frame().closure;
                    let upvalue_ref = match heap.get(closure_ref) {
                        ObjData::Closure(c) => c.upvalues[idx as usize],
                        _ => unreachable!(),
                    };
                    let value = match heap.get(upvalue_ref) {
                        ObjData::Upvalue(u) => match u.state {
                            UpvalueState::Open(i) => self.stack[i],
                            UpvalueState::Closed(v) => v,
                        },
                        _ => unreachable!(),
                    };
                    self.push(value);
                }
                Op::SetUpvalue(idx) => {
                    let closure_ref = self.frame().closure;
                    let upvalue_ref = match heap.get(closure_ref) {
                        ObjData::Closure(c) => c.upvalues[idx as usize],
                        _ => unreachable!(),
                    };
                    let value = self.peek(0);
                    let location = match heap.get(upvalue_ref) {
                        ObjData::Upvalue(u) => match u.state {
                            UpvalueState::Open(i) => Some(i),
                            UpvalueState::Closed(_) => None,
                        },
                        _ => unreachable!(),
                    };
                    match location {
                        Some(i) => self.stack[i] = value,
                        None => match heap.get_mut(upvalue_ref) {
                            ObjData::Upvalue(u) => u.state = UpvalueState::Closed(value),
                            _ => unreachable!(),
                        },
                    }
                }
                Op::CloseUpvalue => {
                    let from = self.stack.len() - 1;
                    self.close_upvalues(heap, from);
                    self.pop();
                }
                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Op::Greater => self.numeric_binary(heap, |a, b| Value::Bool(a > b))?,
                Op::Less => self.numeric_binary(heap, |a, b| Value::Bool(a < b))?,
                Op::Add => self.add(heap)?,
                Op::Subtract => self.numeric_binary(heap, |a, b| Value::Number(a - b))?,
                Op::Multiply => self.numeric_binary(heap, |a, b| Value::Number(a * b))?,
                Op::Divide => self.numeric_binary(heap, |a, b| Value::Number(a / b))?,
                Op::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                Op::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error(heap, "Operand must be a number.")),
                    }
                }
                Op::Print => {
                    let v = self.pop();
                    let _ = writeln!(self.stdout, "{}", v.display(heap));
                }
                Op::Jump(offset) => {
                    self.frame_mut().ip += offset as usize;
                }
                Op::JumpIfFalse(offset) => {
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                Op::Loop(offset) => {
                    self.frame_mut().ip -= offset as usize;
                }
                Op::Call(argc) => {
                    let callee = self.peek(argc as usize);
                    self.call_value(heap, callee, argc)?;
                }
                Op::Invoke(name_idx, argc) => {
                    let name = self.chunk_of(heap, self.frame().closure).constant(name_idx);
                    let name_ref = name.as_obj().expect("identifier constants are always strings");
                    self.invoke(heap, name_ref, argc)?;
                }
                Op::Closure(idx, captures) => {
                    let function_value = self.chunk_of(heap, self.frame().closure).constant(idx);
                    let function_ref =
                        function_value.as_obj().expect("CLOSURE operand is a Function constant");
                    let enclosing = self.frame().closure;
                    let mut upvalues = Vec::with_capacity(captures.len());
                    for capture in &captures {
                        if capture.is_local {
                            let location = self.frame().slots + capture.index as usize;
                            upvalues.push(self.capture_upvalue(heap, location));
                        } else {
                            let up = match heap.get(enclosing) {
                                ObjData::Closure(c) => c.upvalues[capture.index as usize],
                                _ => unreachable!(),
                            };
                            upvalues.push(up);
                        }
                    }
                    let closure_ref =
                        heap.alloc(ObjData::Closure(Closure { function: function_ref, upvalues }));
                    self.push(Value::Obj(closure_ref));
                    heap.collect_if_needed(self);
                }
                Op::Class(name_idx) => {
                    let name = self.chunk_of(heap, self.frame().closure).constant(name_idx);
                    let name_ref = name.as_obj().expect("identifier constants are always strings");
                    let class_ref = heap.alloc(ObjData::Class(Class::new(name_ref)));
                    self.push(Value::Obj(class_ref));
                    heap.collect_if_needed(self);
                }
                Op::Method(name_idx) => {
                    let name = self.chunk_of(heap, self.frame().closure).constant(name_idx);
                    let name_ref = name.as_obj().expect("identifier constants are always strings");
                    let method = self.pop();
                    let class_ref =
                        self.peek(0).as_obj().expect("METHOD always follows a CLASS on the stack");
                    let hash = heap.as_string(name_ref).hash;
                    match heap.get_mut(class_ref) {
                        ObjData::Class(c) => {
                            c.methods.set(name_ref, hash, method);
                        }
                        _ => unreachable!(),
                    }
                }
                Op::GetProperty(name_idx) => {
                    let name = self.chunk_of(heap, self.frame().closure).constant(name_idx);
                    let name_ref = name.as_obj().expect("identifier constants are always strings");
                    self.get_property(heap, name_ref)?;
                }
                Op::SetProperty(name_idx) => {
                    let name = self.chunk_of(heap, self.frame().closure).constant(name_idx);
                    let name_ref = name.as_obj().expect("identifier constants are always strings");
                    self.set_property(heap, name_ref)?;
                }
                Op::Return => {
                    let result = self.pop();
                    let frame_slots = self.frame().slots;
                    self.close_upvalues(heap, frame_slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.stack.truncate(frame_slots);
                        return Ok(());
                    }
                    self.stack.truncate(frame_slots);
                    self.push(result);
                }
            }
        }
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("dispatch always runs with an active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("dispatch always runs with an active frame")
    }

    fn chunk_of<'h>(&self, heap: &'h Heap, closure: ObjRef) -> &'h loxvm_core::Chunk {
        let function = match heap.get(closure) {
            ObjData::Closure(c) => c.function,
            _ => unreachable!("frame.closure always refers to a Closure"),
        };
        match heap.get(function) {
            ObjData::Function(f) => &f.chunk,
            _ => unreachable!("closure.function always refers to a Function"),
        }
    }

    // -----------------------------------------------------------------
    // Arithmetic
    // -----------------------------------------------------------------

    fn numeric_binary(
        &mut self,
        heap: &Heap,
        op: impl Fn(f64, f64) -> Value,
    ) -> Result<(), RuntimeError> {
        let (Some(a), Some(b)) = (self.peek(1).as_number(), self.peek(0).as_number()) else {
            return Err(self.runtime_error(heap, "Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    fn add(&mut self, heap: &mut Heap) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                return Ok(());
            }
            _ => {}
        }
        let a_str = a.as_obj().filter(|r| matches!(heap.get(*r), ObjData::Str(_)));
        let b_str = b.as_obj().filter(|r| matches!(heap.get(*r), ObjData::Str(_)));
        if let (Some(a_ref), Some(b_ref)) = (a_str, b_str) {
            let concatenated = format!("{}{}", heap.as_string(a_ref).chars, heap.as_string(b_ref).chars);
            self.pop();
            self.pop();
            let interned = heap.intern(&concatenated);
            self.push(Value::Obj(interned));
            heap.collect_if_needed(self);
            return Ok(());
        }
        Err(self.runtime_error(heap, "Operands must be two numbers or two strings."))
    }

    // -----------------------------------------------------------------
    // Calling
    // -----------------------------------------------------------------

    fn call_value(&mut self, heap: &mut Heap, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Value::Obj(obj_ref) = callee else {
            return Err(self.runtime_error(heap, "Can only call functions and classes."));
        };
        enum Kind {
            Closure,
            Class,
            BoundMethod(Value, ObjRef),
            Native,
            Other,
        }
        let kind = match heap.get(obj_ref) {
            ObjData::Closure(_) => Kind::Closure,
            ObjData::Class(_) => Kind::Class,
            ObjData::BoundMethod(b) => Kind::BoundMethod(b.receiver, b.method),
            ObjData::Native(_) => Kind::Native,
            _ => Kind::Other,
        };
        match kind {
            Kind::Closure => self.call(heap, obj_ref, argc),
            Kind::Class => {
                let class_ref = obj_ref;
                let hash = heap.as_string(self.init_string).hash;
                let init = match heap.get(class_ref) {
                    ObjData::Class(c) => c.methods.get(self.init_string, hash),
                    _ => unreachable!(),
                };
                let instance = heap.alloc(ObjData::Instance(Instance::new(class_ref)));
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Obj(instance);
                heap.collect_if_needed(self);
                match init {
                    Some(Value::Obj(init_closure)) => self.call(heap, init_closure, argc),
                    Some(_) => unreachable!("methods are always closures"),
                    None if argc == 0 => Ok(()),
                    None => Err(self.runtime_error(
                        heap,
                        format!("Expected 0 arguments but got {argc}."),
                    )),
                }
            }
            Kind::BoundMethod(receiver, method) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = receiver;
                self.call(heap, method, argc)
            }
            Kind::Native => {
                let native_func = match heap.get(obj_ref) {
                    ObjData::Native(n) => n.func,
                    _ => unreachable!(),
                };
                let start = self.stack.len() - argc as usize;
                let result = native_func(&self.stack[start..]);
                match result {
                    Ok(value) => {
                        self.stack.truncate(start - 1);
                        self.push(value);
                        Ok(())
                    }
                    Err(message) => Err(self.runtime_error(heap, message)),
                }
            }
            Kind::Other => Err(self.runtime_error(heap, "Can only call functions and classes.")),
        }
    }

    fn call(&mut self, heap: &mut Heap, closure_ref: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let function_ref = match heap.get(closure_ref) {
            ObjData::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let arity = match heap.get(function_ref) {
            ObjData::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(self.runtime_error(
                heap,
                format!("Expected {arity} arguments but got {argc}."),
            ));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error(heap, "Stack overflow."));
        }
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error(heap, "Stack overflow."));
        }
        let slots = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots });
        Ok(())
    }

    fn invoke(&mut self, heap: &mut Heap, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Value::Obj(receiver_ref) = receiver else {
            return Err(self.runtime_error(heap, "Only instances have methods."));
        };
        let ObjData::Instance(instance) = heap.get(receiver_ref) else {
            return Err(self.runtime_error(heap, "Only instances have methods."));
        };
        let hash = heap.as_string(name).hash;
        if let Some(field) = instance.fields.get(name, hash) {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = field;
            return self.call_value(heap, field, argc);
        }
        let class_ref = instance.class;
        let method = match heap.get(class_ref) {
            ObjData::Class(c) => c.methods.get(name, hash),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(closure_ref)) => self.call(heap, closure_ref, argc),
            Some(_) => unreachable!("methods are always closures"),
            None => Err(self.runtime_error(
                heap,
                format!("Undefined property '{}'.", heap.as_string(name).chars),
            )),
        }
    }

    fn get_property(&mut self, heap: &mut Heap, name: ObjRef) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        let Value::Obj(receiver_ref) = receiver else {
            return Err(self.runtime_error(heap, "Only instances have properties."));
        };
        let ObjData::Instance(instance) = heap.get(receiver_ref) else {
            return Err(self.runtime_error(heap, "Only instances have properties."));
        };
        let hash = heap.as_string(name).hash;
        if let Some(value) = instance.fields.get(name, hash) {
            self.pop();
            self.push(value);
            return Ok(());
        }
        let class_ref = instance.class;
        let method = match heap.get(class_ref) {
            ObjData::Class(c) => c.methods.get(name, hash),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(closure_ref)) => {
                self.pop();
                let bound = heap.alloc(ObjData::BoundMethod(BoundMethod {
                    receiver,
                    method: closure_ref,
                }));
                self.push(Value::Obj(bound));
                heap.collect_if_needed(self);
                Ok(())
            }
            Some(_) => unreachable!("methods are always closures"),
            None => Err(self.runtime_error(
                heap,
                format!("Undefined property '{}'.", heap.as_string(name).chars),
            )),
        }
    }

    fn set_property(&mut self, heap: &mut Heap, name: ObjRef) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let receiver = self.peek(1);
        let Value::Obj(receiver_ref) = receiver else {
            return Err(self.runtime_error(heap, "Only instances have fields."));
        };
        if !matches!(heap.get(receiver_ref), ObjData::Instance(_)) {
            return Err(self.runtime_error(heap, "Only instances have fields."));
        }
        let hash = heap.as_string(name).hash;
        match heap.get_mut(receiver_ref) {
            ObjData::Instance(i) => {
                i.fields.set(name, hash, value);
            }
            _ => unreachable!(),
        }
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Upvalues
    // -----------------------------------------------------------------

    fn capture_upvalue(&mut self, heap: &mut Heap, location: usize) -> ObjRef {
        for &existing in &self.open_upvalues {
            if let ObjData::Upvalue(u) = heap.get(existing) {
                match u.state {
                    UpvalueState::Open(loc) if loc == location => return existing,
                    UpvalueState::Open(loc) if loc < location => break,
                    _ => {}
                }
            }
        }
        let created = heap.alloc(ObjData::Upvalue(Upvalue { state: UpvalueState::Open(location) }));
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|&r| match heap.get(r) {
                ObjData::Upvalue(u) => match u.state {
                    UpvalueState::Open(loc) => loc < location,
                    _ => false,
                },
                _ => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, created);
        created
    }

    fn close_upvalues(&mut self, heap: &mut Heap, from: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let location = match heap.get(first) {
                ObjData::Upvalue(u) => match u.state {
                    UpvalueState::Open(loc) => loc,
                    UpvalueState::Closed(_) => break,
                },
                _ => unreachable!(),
            };
            if location < from {
                break;
            }
            let value = self.stack[location];
            match heap.get_mut(first) {
                ObjData::Upvalue(u) => u.state = UpvalueState::Closed(value),
                _ => unreachable!(),
            }
            self.open_upvalues.remove(0);
        }
    }
}
