//! Single-pass Pratt compiler: parses, resolves scopes/upvalues, and emits
//! bytecode in one forward pass over the token stream — no separate AST.
//!
//! The per-token prefix/infix dispatch table the design notes mention as
//! the classic "function-pointer parse table" is implemented here as a
//! tagged match over [`TokenKind`] (the alternative the notes explicitly
//! sanction), which sidesteps storing `fn` pointers with a `Compiler`
//! receiver alongside a separately-threaded `Heap` borrow.

use crate::error::{CompileError, DiagLocation, Diagnostic};
use crate::scanner::{Scanner, Token, TokenKind};
use loxvm_core::heap::Roots;
use loxvm_core::object::{LoxFunction, ObjData, ObjRef};
use loxvm_core::{Chunk, Heap, Op, UpvalueCapture as CoreUpvalueCapture, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash => Precedence::Factor,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    /// `-1` is the sentinel for "declared but its initializer has not yet
    /// run" — reading it is an error (`var a = a;`).
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FnFrame<'src> {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FnFrame<'src> {
    fn new(function: ObjRef, kind: FunctionKind) -> Self {
        // Slot 0 is reserved for the callee (plain functions) or the
        // receiver (methods, where it is addressable as `this`).
        let slot0_name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            "this"
        } else {
            ""
        };
        let sentinel = Token { kind: TokenKind::Identifier, lexeme: slot0_name, line: 0 };
        Self {
            function,
            kind,
            locals: vec![Local { name: sentinel, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Tracks class nesting so `this` can be rejected outside of a method.
/// `super`/inheritance is not implemented (see the design notes' open
/// question), so there is nothing else to track here yet.
struct ClassContext;

/// Drives one `compile()` call end to end. Holds the scanner, the parser's
/// lookahead pair, and the stack of in-progress function frames.
pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    frames: Vec<FnFrame<'src>>,
    classes: Vec<ClassContext>,
    /// Upvalue captures for the function most recently finished by
    /// [`Compiler::end_function`], consumed by the `Closure` instruction
    /// its caller emits right after.
    pending_upvalues: Vec<CoreUpvalueCapture>,
    /// Roots outside the compiler itself that a mid-compile collection must
    /// also walk — namely a live `Vm`'s stack and globals, when compiling
    /// inside a REPL that reuses one `Heap` across many `compile` calls. A
    /// standalone compile has nothing to union in here ([`loxvm_core::NoRoots`]).
    extra_roots: &'src dyn Roots,
}

/// Compiles `source` into a top-level (nameless) `Function`, or collects
/// every diagnostic reported along the way.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    compile_with_roots(source, heap, &loxvm_core::NoRoots)
}

/// Like [`compile`], but a mid-compile collection also marks `extra_roots` —
/// needed whenever the `Heap` is shared with a `Vm` that is already holding
/// live references (globals, stack values) the compiler itself knows nothing
/// about.
pub fn compile_with_roots(
    source: &str,
    heap: &mut Heap,
    extra_roots: &dyn Roots,
) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(source, heap, extra_roots);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof, heap) {
        compiler.declaration(heap);
    }
    let function = compiler.end_function(heap);
    if compiler.had_error {
        Err(CompileError { diagnostics: compiler.diagnostics })
    } else {
        Ok(function)
    }
}

impl<'src> Roots for Compiler<'src> {
    fn mark_roots(&self, heap: &mut Heap) {
        for frame in &self.frames {
            heap.mark_object(frame.function);
        }
        self.extra_roots.mark_roots(heap);
    }
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str, heap: &mut Heap, extra_roots: &'src dyn Roots) -> Self {
        let function = heap.alloc(ObjData::Function(LoxFunction::new(None)));
        let eof = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Self {
            scanner: Scanner::new(source),
            current: eof,
            previous: eof,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            frames: vec![FnFrame::new(function, FunctionKind::Script)],
            classes: Vec::new(),
            pending_upvalues: Vec::new(),
            extra_roots,
        }
    }

    fn frame(&self) -> &FnFrame<'src> {
        self.frames.last().expect("at least the script frame is always present")
    }

    fn frame_mut(&mut self) -> &mut FnFrame<'src> {
        self.frames.last_mut().expect("at least the script frame is always present")
    }

    fn chunk_mut<'h>(&self, heap: &'h mut Heap) -> &'h mut Chunk {
        match heap.get_mut(self.frame().function) {
            ObjData::Function(f) => &mut f.chunk,
            _ => unreachable!("frame.function always refers to a Function"),
        }
    }

    // ---------------------------------------------------------------
    // Parser plumbing
    // ---------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current_scanner(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind, _heap: &mut Heap) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current_scanner(&mut self, message: &str) {
        self.report(self.current.line, DiagLocation::None, message.to_string());
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        let location = if token.kind == TokenKind::Eof {
            DiagLocation::End
        } else {
            DiagLocation::Lexeme(token.lexeme.to_string())
        };
        self.report(token.line, location, message.to_string());
    }

    fn report(&mut self, line: u32, location: DiagLocation, message: String) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        tracing::debug!(line, %message, "compile error");
        self.diagnostics.push(Diagnostic { line, location, message });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Fun | Var | For | If | While | Print | Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---------------------------------------------------------------
    // Emission helpers
    // ---------------------------------------------------------------

    fn emit(&mut self, op: Op, heap: &mut Heap) -> usize {
        let line = self.previous.line;
        self.chunk_mut(heap).write(op, line)
    }

    fn emit_return(&mut self, heap: &mut Heap) {
        if self.frame().kind == FunctionKind::Initializer {
            self.emit(Op::GetLocal(0), heap);
        } else {
            self.emit(Op::Nil, heap);
        }
        self.emit(Op::Return, heap);
    }

    fn make_constant(&mut self, value: Value, heap: &mut Heap) -> u8 {
        match self.chunk_mut(heap).add_constant(value) {
            Ok(idx) => {
                heap.collect_if_needed(self);
                idx
            }
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn identifier_constant(&mut self, name: &str, heap: &mut Heap) -> u8 {
        // `intern` can itself allocate; don't run a collection between it
        // and `make_constant` pushing the result into the chunk's constant
        // pool — until then the interned string is reachable from no root
        // (see the allocation-hazard note on `Heap::collect_if_needed`).
        let interned = heap.intern(name);
        self.make_constant(Value::Obj(interned), heap)
    }

    fn emit_jump(&mut self, op: Op, heap: &mut Heap) -> usize {
        self.emit(op, heap)
    }

    fn patch_jump(&mut self, offset: usize, heap: &mut Heap) {
        let distance = self.chunk_mut(heap).code().len() - offset - 1;
        if self.chunk_mut(heap).patch_jump(offset, distance).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize, heap: &mut Heap) {
        let distance = self.chunk_mut(heap).code().len() - loop_start + 1;
        if distance > loxvm_core::MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit(Op::Loop(distance as u16), heap);
    }

    // ---------------------------------------------------------------
    // Scope / local / upvalue resolution
    // ---------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self, heap: &mut Heap) {
        self.frame_mut().scope_depth -= 1;
        let depth = self.frame().scope_depth;
        while let Some(local) = self.frame().locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.is_captured;
            self.frame_mut().locals.pop();
            if captured {
                self.emit(Op::CloseUpvalue, heap);
            } else {
                self.emit(Op::Pop, heap);
            }
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.frame().locals.len() >= loxvm_core::MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let depth = self.frame().scope_depth;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str, heap: &mut Heap) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.frame().scope_depth > 0 {
            return 0;
        }
        let lexeme = self.previous.lexeme.to_string();
        self.identifier_constant(&lexeme, heap)
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        self.frame_mut().locals.last_mut().expect("just declared").depth = depth;
    }

    fn define_variable(&mut self, global: u8, heap: &mut Heap) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Op::DefineGlobal(global), heap);
    }

    fn resolve_local(frame: &FnFrame<'src>, name: &str) -> Option<(u8, bool)> {
        for (idx, local) in frame.locals.iter().enumerate().rev() {
            if local.name.lexeme == name {
                return Some((idx as u8, local.depth == -1));
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str, heap: &mut Heap) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        if let Some((slot, uninitialized)) = Self::resolve_local(&self.frames[frame_idx - 1], name)
        {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            self.frames[frame_idx - 1].locals[slot as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, slot, true, heap));
        }
        let outer = self.resolve_upvalue(frame_idx - 1, name, heap)?;
        Some(self.add_upvalue(frame_idx, outer, false, heap))
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool, _heap: &mut Heap) -> u8 {
        let frame = &mut self.frames[frame_idx];
        for (i, up) in frame.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if frame.upvalues.len() >= loxvm_core::MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueDesc { index, is_local });
        (frame.upvalues.len() - 1) as u8
    }

    // ---------------------------------------------------------------
    // Declarations & statements
    // ---------------------------------------------------------------

    fn declaration(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Class, heap) {
            self.class_declaration(heap);
        } else if self.match_token(TokenKind::Fun, heap) {
            self.fun_declaration(heap);
        } else if self.match_token(TokenKind::Var, heap) {
            self.var_declaration(heap);
        } else {
            self.statement(heap);
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable("Expect variable name.", heap);
        if self.match_token(TokenKind::Equal, heap) {
            self.expression(heap);
        } else {
            self.emit(Op::Nil, heap);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, heap);
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable("Expect function name.", heap);
        self.mark_initialized();
        self.function(FunctionKind::Function, heap);
        self.define_variable(global, heap);
    }

    fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_const = self.identifier_constant(class_name.lexeme, heap);
        self.declare_variable();
        self.emit(Op::Class(name_const), heap);
        self.define_variable(name_const, heap);

        self.classes.push(ClassContext);
        self.named_variable(class_name, false, heap);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(Op::Pop, heap);
        self.classes.pop();
    }

    fn method(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name, heap);
        let kind =
            if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, heap);
        self.emit(Op::Method(constant), heap);
    }

    fn function(&mut self, kind: FunctionKind, heap: &mut Heap) {
        // Neither the interned name nor the fresh `Function` is reachable
        // from any root until it lands in `self.frames`, so no collection
        // may run between these allocations and that push.
        let name_ref = heap.intern(self.previous.lexeme);
        let function = heap.alloc(ObjData::Function(LoxFunction::new(Some(name_ref))));
        self.frames.push(FnFrame::new(function, kind));

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                match heap.get(self.frame().function) {
                    ObjData::Function(f) if f.arity == 255 => {
                        self.error_at_current("Can't have more than 255 parameters.");
                    }
                    ObjData::Function(_) => {}
                    _ => unreachable!(),
                }
                match heap.get_mut(self.frame().function) {
                    ObjData::Function(f) => f.arity = f.arity.saturating_add(1),
                    _ => unreachable!(),
                }
                let param = self.parse_variable("Expect parameter name.", heap);
                self.define_variable(param, heap);
                if !self.match_token(TokenKind::Comma, heap) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block(heap);

        let compiled = self.end_function(heap);
        let captures = std::mem::take(&mut self.pending_upvalues);
        let constant = self.make_constant(Value::Obj(compiled), heap);
        self.emit(Op::Closure(constant, captures), heap);
    }

    /// Ends the current frame, writes its captured `upvalue_count` onto the
    /// `Function` object, and returns it. Pops back to the enclosing frame.
    fn end_function(&mut self, heap: &mut Heap) -> ObjRef {
        self.emit_return(heap);
        let frame = self.frames.pop().expect("ends a frame that was pushed");
        let upvalue_count = frame.upvalues.len() as u8;
        self.pending_upvalues = frame
            .upvalues
            .iter()
            .map(|u| CoreUpvalueCapture { index: u.index, is_local: u.is_local })
            .collect();
        match heap.get_mut(frame.function) {
            ObjData::Function(f) => f.upvalue_count = upvalue_count,
            _ => unreachable!(),
        }
        frame.function
    }

    fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn statement(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Print, heap) {
            self.print_statement(heap);
        } else if self.match_token(TokenKind::If, heap) {
            self.if_statement(heap);
        } else if self.match_token(TokenKind::While, heap) {
            self.while_statement(heap);
        } else if self.match_token(TokenKind::For, heap) {
            self.for_statement(heap);
        } else if self.match_token(TokenKind::Return, heap) {
            self.return_statement(heap);
        } else if self.match_token(TokenKind::LeftBrace, heap) {
            self.begin_scope();
            self.block(heap);
            self.end_scope(heap);
        } else {
            self.expression_statement(heap);
        }
    }

    fn print_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(Op::Print, heap);
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(Op::Pop, heap);
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse(0), heap);
        self.emit(Op::Pop, heap);
        self.statement(heap);
        let else_jump = self.emit_jump(Op::Jump(0), heap);

        self.patch_jump(then_jump, heap);
        self.emit(Op::Pop, heap);
        if self.match_token(TokenKind::Else, heap) {
            self.statement(heap);
        }
        self.patch_jump(else_jump, heap);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.chunk_mut(heap).code().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse(0), heap);
        self.emit(Op::Pop, heap);
        self.statement(heap);
        self.emit_loop(loop_start, heap);

        self.patch_jump(exit_jump, heap);
        self.emit(Op::Pop, heap);
    }

    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon, heap) {
            // no initializer
        } else if self.match_token(TokenKind::Var, heap) {
            self.var_declaration(heap);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.chunk_mut(heap).code().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon, heap) {
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse(0), heap));
            self.emit(Op::Pop, heap);
        }

        if !self.match_token(TokenKind::RightParen, heap) {
            let body_jump = self.emit_jump(Op::Jump(0), heap);
            let increment_start = self.chunk_mut(heap).code().len();
            self.expression(heap);
            self.emit(Op::Pop, heap);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start, heap);
            loop_start = increment_start;
            self.patch_jump(body_jump, heap);
        }

        self.statement(heap);
        self.emit_loop(loop_start, heap);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump, heap);
            self.emit(Op::Pop, heap);
        }
        self.end_scope(heap);
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        if self.frame().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon, heap) {
            self.emit_return(heap);
        } else {
            if self.frame().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(Op::Return, heap);
        }
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    fn expression(&mut self, heap: &mut Heap) {
        self.parse_precedence(Precedence::Assignment, heap);
    }

    fn parse_precedence(&mut self, min: Precedence, heap: &mut Heap) {
        self.advance();
        let can_assign = min <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign, heap) {
            self.error("Expect expression.");
            return;
        }

        while precedence_of(self.current.kind) >= min {
            self.advance();
            self.infix(self.previous.kind, can_assign, heap);
        }

        if can_assign && self.match_token(TokenKind::Equal, heap) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool, heap: &mut Heap) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(heap),
            Minus | Bang => self.unary(kind, heap),
            Number => self.number(heap),
            String => self.string(heap),
            True | False | Nil => self.literal(kind, heap),
            Identifier => self.variable(can_assign, heap),
            This => self.this_expr(heap),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool, heap: &mut Heap) {
        use TokenKind::*;
        match kind {
            Minus | Plus | Star | Slash | BangEqual | EqualEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(kind, heap),
            And => self.and(heap),
            Or => self.or(heap),
            LeftParen => self.call(heap),
            Dot => self.dot(can_assign, heap),
            _ => unreachable!("token {kind:?} has no infix rule"),
        }
    }

    fn grouping(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, op: TokenKind, heap: &mut Heap) {
        self.parse_precedence(Precedence::Unary, heap);
        match op {
            TokenKind::Minus => self.emit(Op::Negate, heap),
            TokenKind::Bang => self.emit(Op::Not, heap),
            _ => unreachable!(),
        };
    }

    fn binary(&mut self, op: TokenKind, heap: &mut Heap) {
        let prec = precedence_of(op);
        self.parse_precedence(prec.next(), heap);
        match op {
            TokenKind::Plus => self.emit(Op::Add, heap),
            TokenKind::Minus => self.emit(Op::Subtract, heap),
            TokenKind::Star => self.emit(Op::Multiply, heap),
            TokenKind::Slash => self.emit(Op::Divide, heap),
            TokenKind::EqualEqual => self.emit(Op::Equal, heap),
            TokenKind::Greater => self.emit(Op::Greater, heap),
            TokenKind::Less => self.emit(Op::Less, heap),
            TokenKind::BangEqual => {
                self.emit(Op::Equal, heap);
                self.emit(Op::Not, heap)
            }
            TokenKind::GreaterEqual => {
                self.emit(Op::Less, heap);
                self.emit(Op::Not, heap)
            }
            TokenKind::LessEqual => {
                self.emit(Op::Greater, heap);
                self.emit(Op::Not, heap)
            }
            _ => unreachable!(),
        };
    }

    fn number(&mut self, heap: &mut Heap) {
        let n: f64 = self.previous.lexeme.parse().expect("scanner only emits valid numerals");
        let idx = self.make_constant(Value::Number(n), heap);
        self.emit(Op::Constant(idx), heap);
    }

    fn string(&mut self, heap: &mut Heap) {
        let raw = self.previous.lexeme;
        let contents = &raw[1..raw.len() - 1];
        let interned = heap.intern(contents);
        let idx = self.make_constant(Value::Obj(interned), heap);
        self.emit(Op::Constant(idx), heap);
    }

    fn literal(&mut self, kind: TokenKind, heap: &mut Heap) {
        match kind {
            TokenKind::True => self.emit(Op::True, heap),
            TokenKind::False => self.emit(Op::False, heap),
            TokenKind::Nil => self.emit(Op::Nil, heap),
            _ => unreachable!(),
        };
    }

    fn and(&mut self, heap: &mut Heap) {
        let end_jump = self.emit_jump(Op::JumpIfFalse(0), heap);
        self.emit(Op::Pop, heap);
        self.parse_precedence(Precedence::And, heap);
        self.patch_jump(end_jump, heap);
    }

    fn or(&mut self, heap: &mut Heap) {
        let else_jump = self.emit_jump(Op::JumpIfFalse(0), heap);
        let end_jump = self.emit_jump(Op::Jump(0), heap);
        self.patch_jump(else_jump, heap);
        self.emit(Op::Pop, heap);
        self.parse_precedence(Precedence::Or, heap);
        self.patch_jump(end_jump, heap);
    }

    fn call(&mut self, heap: &mut Heap) {
        let argc = self.argument_list(heap);
        self.emit(Op::Call(argc), heap);
    }

    fn dot(&mut self, can_assign: bool, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme, heap);
        if can_assign && self.match_token(TokenKind::Equal, heap) {
            self.expression(heap);
            self.emit(Op::SetProperty(name), heap);
        } else if self.match_token(TokenKind::LeftParen, heap) {
            let argc = self.argument_list(heap);
            self.emit(Op::Invoke(name, argc), heap);
        } else {
            self.emit(Op::GetProperty(name), heap);
        }
    }

    fn argument_list(&mut self, heap: &mut Heap) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap);
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma, heap) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn variable(&mut self, can_assign: bool, heap: &mut Heap) {
        let name = self.previous;
        self.named_variable(name, can_assign, heap);
    }

    fn this_expr(&mut self, heap: &mut Heap) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
        }
        let token = self.previous;
        self.named_variable(token, false, heap);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool, heap: &mut Heap) {
        let frame_idx = self.frames.len() - 1;
        let (get, set) = if let Some((slot, uninitialized)) =
            Self::resolve_local(&self.frames[frame_idx], name.lexeme)
        {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            (Op::GetLocal(slot), Op::SetLocal(slot))
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, name.lexeme, heap) {
            (Op::GetUpvalue(slot), Op::SetUpvalue(slot))
        } else {
            let idx = self.identifier_constant(name.lexeme, heap);
            (Op::GetGlobal(idx), Op::SetGlobal(idx))
        };

        if can_assign && self.match_token(TokenKind::Equal, heap) {
            self.expression(heap);
            self.emit(set, heap);
        } else {
            self.emit(get, heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use loxvm_core::ObjData;

    fn compile_ok(src: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        let function = compile(src, &mut heap).unwrap_or_else(|e| panic!("{e}"));
        (function, heap)
    }

    fn ops(src: &str) -> Vec<Op> {
        let (function, heap) = compile_ok(src);
        match heap.get(function) {
            ObjData::Function(f) => f.chunk.code().to_vec(),
            _ => unreachable!(),
        }
    }

    /// Flattens every instruction reachable from `function`'s chunk,
    /// descending into nested function constants — closures live in their
    /// own chunk, not their enclosing function's.
    fn all_ops(function: ObjRef, heap: &Heap) -> Vec<Op> {
        let mut out = Vec::new();
        let chunk = match heap.get(function) {
            ObjData::Function(f) => &f.chunk,
            _ => unreachable!(),
        };
        out.extend(chunk.code().iter().cloned());
        for constant in chunk.constants() {
            if let Value::Obj(r) = constant {
                if matches!(heap.get(*r), ObjData::Function(_)) {
                    out.extend(all_ops(*r, heap));
                }
            }
        }
        out
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let code = ops("1 + 2 * 3;");
        assert!(code.contains(&Op::Pop));
        assert!(code.contains(&Op::Add));
        assert!(code.contains(&Op::Multiply));
    }

    #[test]
    fn global_variable_roundtrip_compiles() {
        let code = ops("var a = 1; a = a + 1; print a;");
        assert!(code.iter().any(|op| matches!(op, Op::DefineGlobal(_))));
        assert!(code.iter().any(|op| matches!(op, Op::SetGlobal(_))));
        assert!(code.iter().any(|op| matches!(op, Op::GetGlobal(_))));
        assert!(code.contains(&Op::Print));
    }

    #[test]
    fn local_variable_uses_slot_ops_not_globals() {
        let code = ops("{ var a = 1; print a; }");
        assert!(code.iter().any(|op| matches!(op, Op::GetLocal(_))));
        assert!(!code.iter().any(|op| matches!(op, Op::GetGlobal(_))));
    }

    #[test]
    fn closure_captures_enclosing_local_as_upvalue() {
        let (function, heap) = compile_ok(indoc::indoc! {"
            fun outer() {
                var x = 1;
                fun inner() {
                    return x;
                }
                return inner;
            }
        "});
        let code = all_ops(function, &heap);
        assert!(code.iter().any(|op| matches!(op, Op::Closure(_, caps) if !caps.is_empty())));
    }

    #[test]
    fn class_with_method_emits_class_and_method_ops() {
        let code = ops(indoc::indoc! {"
            class Greeter {
                greet() {
                    print \"hi\";
                }
            }
        "});
        assert!(code.iter().any(|op| matches!(op, Op::Class(_))));
        assert!(code.iter().any(|op| matches!(op, Op::Method(_))));
    }

    #[test]
    fn reading_local_in_its_own_initializer_is_an_error() {
        let mut heap = Heap::new();
        let err = compile("{ var a = a; }", &mut heap).unwrap_err();
        assert!(err.diagnostics[0].message.contains("its own initializer"));
    }

    #[test]
    fn using_this_outside_a_class_is_an_error() {
        let mut heap = Heap::new();
        let err = compile("print this;", &mut heap).unwrap_err();
        assert!(err.diagnostics[0].message.contains("'this' outside"));
    }

    #[test]
    fn returning_a_value_from_top_level_is_an_error() {
        let mut heap = Heap::new();
        let err = compile("return 1;", &mut heap).unwrap_err();
        assert!(err.diagnostics[0].message.contains("top-level"));
    }

    #[test]
    fn parse_errors_report_source_line() {
        let mut heap = Heap::new();
        let err = compile("var;\n", &mut heap).unwrap_err();
        assert_eq!(err.diagnostics[0].line, 1);
    }

    #[test]
    fn for_loop_compiles_condition_and_increment() {
        let code = ops("for (var i = 0; i < 3; i = i + 1) print i;");
        assert!(code.iter().any(|op| matches!(op, Op::Loop(_))));
        assert!(code.iter().any(|op| matches!(op, Op::JumpIfFalse(_))));
    }
}
