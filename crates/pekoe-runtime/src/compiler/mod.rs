//! Single-pass bytecode compiler
//!
//! Lexing, parsing and emission are interleaved: the parser pulls tokens
//! from the lexer and emits bytes into the function being built as it
//! goes. There is no AST. One [`FnCompiler`] record exists per function
//! nesting level, held in a stack; a parallel stack tracks enclosing
//! classes. Expressions are parsed by the Pratt table in [`expr`],
//! statements and declarations by [`stmt`].
//!
//! - Expressions leave their result on the stack
//! - Locals occupy stack slots resolved at compile time; slot 0 is the
//!   receiver in methods and anonymous otherwise
//! - Module-level bindings are referenced by name constant
//! - Closures capture enclosing locals through flattened upvalue chains

mod expr;
mod stmt;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::bytecode::{Chunk, Opcode};
use crate::diagnostic::Diagnostic;
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use crate::value::{AccessLevel, Function, FunctionKind, Module, Value};
use crate::vm::{GcRoot, Vm};

/// Local and upvalue indices are one byte, so 256 slots per function
const MAX_SLOTS: usize = 256;

/// Compile `source` as the body of `module`.
///
/// Always parses to end of input; returns the module function only when no
/// error was reported. Outside REPL mode the VM's module-const table is
/// cleared afterwards — immutability tracking is per compilation unit.
pub fn compile(
    vm: &mut Vm,
    module: Rc<Module>,
    source: &str,
) -> Result<Rc<Function>, Vec<Diagnostic>> {
    Compiler::new(vm, module, source).run()
}

/// Parser half of the compiler: token window and error state
pub(super) struct Parser {
    pub(super) lexer: Lexer,
    pub(super) current: Token,
    pub(super) previous: Token,
    pub(super) module: Rc<Module>,
    pub(super) had_error: bool,
    pub(super) panic_mode: bool,
    pub(super) diagnostics: Vec<Diagnostic>,
}

/// A local variable slot
#[derive(Debug, Clone)]
pub(super) struct Local {
    pub(super) name: Token,
    /// Scope depth; -1 while declared but not yet initialized
    pub(super) depth: i32,
    /// Captured by a closure; scope exit must close it instead of popping
    pub(super) is_captured: bool,
    pub(super) constant: bool,
}

/// One captured variable of the function being compiled
#[derive(Debug, Clone, Copy)]
pub(super) struct UpvalueDesc {
    /// Slot in the parent's locals (`is_local`) or index into the parent's
    /// upvalues
    pub(super) index: u8,
    pub(super) is_local: bool,
    /// Const flag propagated from the originating local
    pub(super) constant: bool,
}

/// Loop bookkeeping for break/continue and exit patching
#[derive(Debug, Clone, Copy)]
pub(super) struct Loop {
    /// Offset `continue` and the closing `Loop` jump back to
    pub(super) start: usize,
    /// Offset of the first body instruction; break placeholders are
    /// rewritten from here to the end of the loop
    pub(super) body: usize,
    /// Offset of the exit-jump placeholder; `None` for condition-less loops
    pub(super) end: Option<usize>,
    /// Scope depth at loop entry; break/continue pop locals above it
    pub(super) scope_depth: i32,
}

/// Per-class compile state; classes nest in a stack parallel to functions
pub(super) struct ClassCompiler {
    pub(super) name: Token,
    pub(super) has_superclass: bool,
    pub(super) static_method: bool,
    pub(super) is_abstract: bool,
    /// Names of `var` class fields, recorded for private-member dispatch
    /// once access levels land in the VM
    #[allow(dead_code)]
    pub(super) private_members: HashSet<Rc<str>>,
}

impl ClassCompiler {
    fn new(name: Token) -> Self {
        Self {
            name,
            has_superclass: false,
            static_method: false,
            is_abstract: false,
            private_members: HashSet::new(),
        }
    }
}

/// Per-function compile state
pub(super) struct FnCompiler {
    /// The function object being filled in
    pub(super) function: Function,
    pub(super) kind: FunctionKind,
    pub(super) locals: Vec<Local>,
    pub(super) upvalues: Vec<UpvalueDesc>,
    pub(super) loops: Vec<Loop>,
    pub(super) scope_depth: i32,
    /// Identifier → constant index, so a name is pooled once per function
    pub(super) string_constants: HashMap<Rc<str>, u8>,
    /// Offset before which peephole folding must not reach; bumped on
    /// every jump emit/patch so folding never crosses a jump target
    pub(super) fold_barrier: usize,
    /// Start offsets of the last three emitted instructions, oldest
    /// first. Folding consults this window instead of guessing opcode
    /// boundaries from the byte tail, where operand bytes can alias
    /// opcode values.
    pub(super) last_ops: [Option<usize>; 3],
}

/// Compiler driving a whole compilation unit
pub struct Compiler<'vm> {
    pub(super) vm: &'vm mut Vm,
    pub(super) parser: Parser,
    pub(super) states: Vec<FnCompiler>,
    pub(super) classes: Vec<ClassCompiler>,
}

impl<'vm> Compiler<'vm> {
    /// Create a compiler for one module's source, with the top-level
    /// function record already open
    pub fn new(vm: &'vm mut Vm, module: Rc<Module>, source: &str) -> Self {
        let parser = Parser {
            lexer: Lexer::new(source),
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            module,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
        };

        let mut compiler = Self {
            vm,
            parser,
            states: Vec::new(),
            classes: Vec::new(),
        };
        compiler.push_state(FunctionKind::TopLevel, AccessLevel::Public);
        compiler
    }

    /// Parse declarations to end of input and finish the module function
    pub fn run(mut self) -> Result<Rc<Function>, Vec<Diagnostic>> {
        self.advance();

        if !self.match_token(TokenKind::Eof) {
            loop {
                self.declaration();
                if self.match_token(TokenKind::Eof) {
                    break;
                }
            }
        }

        let function = self.end_compiler();

        if !self.vm.repl() {
            self.vm.clear_module_consts();
        }

        if self.parser.had_error {
            Err(self.parser.diagnostics)
        } else {
            Ok(function)
        }
    }

    /// Enumerate every object this compilation keeps alive: the functions
    /// still being built and the interned identifiers in their constant
    /// maps. A collector running mid-compile marks these as roots.
    pub fn mark_roots(&self, mark: &mut dyn FnMut(GcRoot<'_>)) {
        for state in self.states.iter().rev() {
            mark(GcRoot::Function(&state.function));
            for name in state.string_constants.keys() {
                mark(GcRoot::String(name));
            }
        }
    }

    // === Function compile states ===

    /// Open a new function record; slot 0 holds `this` in methods and
    /// initializers, otherwise it is anonymous and unreferenced
    pub(super) fn push_state(&mut self, kind: FunctionKind, access: AccessLevel) {
        let mut function = Function::new(kind, access, Rc::clone(&self.parser.module));
        function.name = match kind {
            FunctionKind::TopLevel => None,
            _ => Some(self.vm.intern(&self.parser.previous.lexeme)),
        };
        function.max_locals = 1;

        let slot_zero = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            Token::synthetic("this")
        } else {
            Token::synthetic("")
        };

        self.states.push(FnCompiler {
            function,
            kind,
            locals: vec![Local {
                name: slot_zero,
                depth: 0,
                is_captured: false,
                constant: false,
            }],
            upvalues: Vec::new(),
            loops: Vec::new(),
            scope_depth: 0,
            string_constants: HashMap::new(),
            fold_barrier: 0,
            last_ops: [None; 3],
        });
    }

    /// Close the innermost function record: emit the implicit return and,
    /// when nested, a `Closure` referencing the finished function in the
    /// parent followed by one `(is_local, index)` pair per upvalue
    pub(super) fn end_compiler(&mut self) -> Rc<Function> {
        self.emit_return();

        let state = self.states.pop().expect("function compiler stack underflow");
        let mut function = state.function;
        function.upvalue_count = state.upvalues.len();
        let function = Rc::new(function);

        if !self.states.is_empty() {
            let constant = self.make_constant(Value::Function(Rc::clone(&function)));
            self.emit_op_byte(Opcode::Closure, constant);
            for upvalue in &state.upvalues {
                self.emit_byte(upvalue.is_local as u8);
                self.emit_byte(upvalue.index);
            }
        }

        function
    }

    pub(super) fn state(&self) -> &FnCompiler {
        self.states.last().expect("no open function compiler")
    }

    pub(super) fn state_mut(&mut self) -> &mut FnCompiler {
        self.states.last_mut().expect("no open function compiler")
    }

    pub(super) fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.chunk
    }

    pub(super) fn current_chunk_ref(&self) -> &Chunk {
        &self.state().function.chunk
    }

    // === Token plumbing ===

    pub(super) fn advance(&mut self) {
        self.parser.previous = std::mem::replace(&mut self.parser.current, Token::synthetic(""));

        loop {
            self.parser.current = self.parser.lexer.next_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.lexeme.clone();
            self.error_at_current(&message);
        }
    }

    pub(super) fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    pub(super) fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    pub(super) fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // === Error reporting ===

    fn report(&mut self, token: Token, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;

        let mut diagnostic =
            Diagnostic::error(message, self.parser.module.name.as_ref(), token.line);
        match token.kind {
            TokenKind::Eof => diagnostic = diagnostic.at_end(),
            TokenKind::Error => {}
            _ => diagnostic = diagnostic.with_lexeme(token.lexeme),
        }
        self.parser.diagnostics.push(diagnostic);
    }

    /// Report at the previous token
    pub(super) fn error(&mut self, message: &str) {
        let token = self.parser.previous.clone();
        self.report(token, message);
    }

    /// Report at the current token
    pub(super) fn error_at_current(&mut self, message: &str) {
        let token = self.parser.current.clone();
        self.report(token, message);
    }

    /// Report at an explicit token
    pub(super) fn error_at_token(&mut self, token: Token, message: &str) {
        self.report(token, message);
    }

    /// Leave panic mode by skipping to the next statement boundary: a
    /// semicolon, a declaration-starting keyword, or end of input
    pub(super) fn synchronize(&mut self) {
        self.parser.panic_mode = false;

        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }

            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Def
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Break
                | TokenKind::Return
                | TokenKind::Import => return,
                _ => {}
            }

            self.advance();
        }
    }

    // === Emission ===

    pub(super) fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.current_chunk().write(byte, line);
    }

    pub(super) fn emit_op(&mut self, op: Opcode) {
        let offset = self.current_chunk_ref().len();
        let state = self.state_mut();
        state.last_ops = [state.last_ops[1], state.last_ops[2], Some(offset)];
        self.emit_byte(op as u8);
    }

    pub(super) fn emit_op_byte(&mut self, op: Opcode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    /// Emit the implicit function epilogue; initializers return `this`
    pub(super) fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit_op_byte(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);
    }

    /// Emit `op` followed by a two-byte placeholder and return the offset
    /// of the placeholder for later patching
    pub(super) fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.bump_fold_barrier();
        self.current_chunk_ref().len() - 2
    }

    /// Replace the placeholder at `offset` with a forward offset to the
    /// current end of the chunk
    pub(super) fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the offset bytes themselves.
        let jump = self.current_chunk_ref().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.current_chunk()
            .patch(offset, ((jump >> 8) & 0xFF) as u8, (jump & 0xFF) as u8);
        self.bump_fold_barrier();
    }

    /// Emit a backward jump to `loop_start`
    pub(super) fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Opcode::Loop);

        let offset = self.current_chunk_ref().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xFF) as u8);
        self.emit_byte((offset & 0xFF) as u8);
        self.bump_fold_barrier();
    }

    fn bump_fold_barrier(&mut self) {
        let len = self.current_chunk_ref().len();
        self.state_mut().fold_barrier = len;
    }

    // === Constants ===

    pub(super) fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    pub(super) fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(Opcode::Constant, constant);
    }

    /// Pool an identifier, reusing the index if this function has already
    /// pooled the same name
    pub(super) fn identifier_constant(&mut self, name: &Token) -> u8 {
        let interned = self.vm.intern(&name.lexeme);
        if let Some(&index) = self.state().string_constants.get(&interned) {
            return index;
        }

        let index = self.make_constant(Value::String(Rc::clone(&interned)));
        self.state_mut().string_constants.insert(interned, index);
        index
    }

    // === Scopes and locals ===

    pub(super) fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Close the innermost scope, popping its locals in reverse
    /// declaration order; captured locals are closed instead of popped
    pub(super) fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;

        loop {
            let state = self.state();
            let popped = match state.locals.last() {
                Some(local) if local.depth > state.scope_depth => Some(local.is_captured),
                _ => None,
            };
            match popped {
                Some(is_captured) => {
                    self.state_mut().locals.pop();
                    if is_captured {
                        self.emit_op(Opcode::CloseUpvalue);
                    } else {
                        self.emit_op(Opcode::Pop);
                    }
                }
                None => break,
            }
        }
    }

    pub(super) fn add_local(&mut self, name: Token) {
        if self.state().locals.len() == MAX_SLOTS {
            self.error("Too many local variables in function.");
            return;
        }

        let state = self.state_mut();
        state.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
            constant: false,
        });
        if state.locals.len() > state.function.max_locals {
            state.function.max_locals = state.locals.len();
        }
    }

    /// Reserve a slot for `name` in the current scope; module-level names
    /// are implicitly declared
    pub(super) fn declare_variable(&mut self, name: &Token) {
        if self.state().scope_depth == 0 {
            return;
        }

        let mut duplicate = false;
        {
            let state = self.state();
            for local in state.locals.iter().rev() {
                if local.depth != -1 && local.depth < state.scope_depth {
                    break;
                }
                if identifiers_equal(name, &local.name) {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error_at_token(
                name.clone(),
                "Variable with this name already declared in this scope.",
            );
        }

        self.add_local(name.clone());
    }

    /// Consume a variable name; returns its name-constant index at module
    /// scope, 0 for locals
    pub(super) fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_message);

        if self.state().scope_depth == 0 {
            let name = self.parser.previous.clone();
            return self.identifier_constant(&name);
        }

        let name = self.parser.previous.clone();
        self.declare_variable(&name);
        0
    }

    /// Finish a variable declaration: define the module binding, or mark
    /// the local slot initialized; records the const flag either way
    pub(super) fn define_variable(&mut self, global: u8, constant: bool) {
        if self.state().scope_depth == 0 {
            if constant {
                let name = self
                    .current_chunk_ref()
                    .constants
                    .get(global as usize)
                    .and_then(Value::as_string)
                    .cloned();
                if let Some(name) = name {
                    self.vm.define_module_const_interned(name);
                }
            }
            self.emit_op_byte(Opcode::DefineModule, global);
        } else {
            let state = self.state_mut();
            if let Some(local) = state.locals.last_mut() {
                local.depth = state.scope_depth;
                local.constant = constant;
            }
        }
    }

    // === Identifier resolution ===

    /// Resolve `name` against the locals of `state_index`, innermost
    /// first so shadowing works. Reading a local inside its own
    /// initializer is an error unless resolving on behalf of a nested
    /// function (`in_function`).
    pub(super) fn resolve_local(
        &mut self,
        state_index: usize,
        name: &Token,
        in_function: bool,
    ) -> Option<usize> {
        let mut found = None;
        {
            let state = &self.states[state_index];
            for slot in (0..state.locals.len()).rev() {
                let local = &state.locals[slot];
                if identifiers_equal(name, &local.name) {
                    found = Some((slot, local.depth == -1));
                    break;
                }
            }
        }

        let (slot, uninitialized) = found?;
        if !in_function && uninitialized {
            self.error("Cannot read local variable in its own initializer.");
        }
        Some(slot)
    }

    /// Add an upvalue to `state_index`, coalescing duplicates
    pub(super) fn add_upvalue(
        &mut self,
        state_index: usize,
        index: u8,
        is_local: bool,
        constant: bool,
    ) -> usize {
        let upvalues = &self.states[state_index].upvalues;
        for (i, upvalue) in upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i;
            }
        }

        if upvalues.len() == MAX_SLOTS {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let state = &mut self.states[state_index];
        state.upvalues.push(UpvalueDesc {
            index,
            is_local,
            constant,
        });
        state.function.upvalue_count = state.upvalues.len();
        state.upvalues.len() - 1
    }

    /// Resolve `name` as a capture from an enclosing function.
    ///
    /// If the name is a local of the immediately enclosing function it is
    /// marked captured and referenced directly; otherwise the search
    /// recurses outward and every intermediate function gains a chaining
    /// upvalue, flattening the closure.
    pub(super) fn resolve_upvalue(&mut self, state_index: usize, name: &Token) -> Option<usize> {
        if state_index == 0 {
            return None;
        }
        let parent = state_index - 1;

        if let Some(slot) = self.resolve_local(parent, name, true) {
            self.states[parent].locals[slot].is_captured = true;
            let constant = self.states[parent].locals[slot].constant;
            return Some(self.add_upvalue(state_index, slot as u8, true, constant));
        }

        if let Some(upvalue) = self.resolve_upvalue(parent, name) {
            let constant = self.states[parent].upvalues[upvalue].constant;
            return Some(self.add_upvalue(state_index, upvalue as u8, false, constant));
        }

        None
    }

    /// Reject assignment through `set_op` when the target is constant
    pub(super) fn check_const(&mut self, set_op: Opcode, arg: usize) {
        match set_op {
            Opcode::SetLocal => {
                if self.state().locals[arg].constant {
                    self.error("Cannot assign to a constant.");
                }
            }
            Opcode::SetUpvalue => {
                if self.state().upvalues[arg].constant {
                    self.error("Cannot assign to a constant.");
                }
            }
            Opcode::SetModule => {
                let name = self
                    .current_chunk_ref()
                    .constants
                    .get(arg)
                    .and_then(Value::as_string)
                    .cloned();
                if let Some(name) = name {
                    if self.vm.is_module_const(&name) {
                        self.error("Cannot assign to a constant.");
                    }
                }
            }
            _ => {}
        }
    }

    /// Emit a read or write of `name`, dispatching between local,
    /// upvalue, builtin global (read-only) and module binding, and
    /// desugaring compound assignment to get-op-set
    pub(super) fn named_variable(&mut self, name: Token, can_assign: bool) {
        let top = self.states.len() - 1;

        let (get_op, set_op, arg, can_assign) =
            if let Some(slot) = self.resolve_local(top, &name, false) {
                (Opcode::GetLocal, Some(Opcode::SetLocal), slot, can_assign)
            } else if let Some(index) = self.resolve_upvalue(top, &name) {
                (
                    Opcode::GetUpvalue,
                    Some(Opcode::SetUpvalue),
                    index,
                    can_assign,
                )
            } else {
                let arg = self.identifier_constant(&name) as usize;
                if self.vm.has_global(&name.lexeme) {
                    (Opcode::GetGlobal, None, arg, false)
                } else {
                    (Opcode::GetModule, Some(Opcode::SetModule), arg, can_assign)
                }
            };

        let assignment = if can_assign {
            compound_operator(self.parser.current.kind)
        } else {
            None
        };

        match (assignment, set_op) {
            (Some(operator), Some(set_op)) => {
                self.advance();
                self.check_const(set_op, arg);
                match operator {
                    Some(operator) => {
                        self.named_variable(name, false);
                        expr::expression(self);
                        self.emit_op(operator);
                    }
                    None => expr::expression(self),
                }
                self.emit_op_byte(set_op, arg as u8);
            }
            _ => self.emit_op_byte(get_op, arg as u8),
        }
    }
}

/// Map an assignment token to its desugared binary opcode; plain `=`
/// maps to `Some(None)`
pub(super) fn compound_operator(kind: TokenKind) -> Option<Option<Opcode>> {
    let operator = match kind {
        TokenKind::Equal => None,
        TokenKind::PlusEqual => Some(Opcode::Add),
        TokenKind::MinusEqual => Some(Opcode::Subtract),
        TokenKind::StarEqual => Some(Opcode::Multiply),
        TokenKind::SlashEqual => Some(Opcode::Divide),
        TokenKind::AmpEqual => Some(Opcode::BitwiseAnd),
        TokenKind::CaretEqual => Some(Opcode::BitwiseXor),
        TokenKind::PipeEqual => Some(Opcode::BitwiseOr),
        _ => return None,
    };
    Some(operator)
}

pub(super) fn identifiers_equal(a: &Token, b: &Token) -> bool {
    a.lexeme == b.lexeme
}
