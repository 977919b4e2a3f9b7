//! Statement and declaration parsing
//!
//! Declarations: `var`, `def`, `class`. Statements: `if`, `while`, `for`,
//! `return`, `break`, `continue`, `import`, `from … import`, blocks and
//! expression statements. Loops are lowered with a condition exit jump
//! and a backward `Loop`; `break` emits a placeholder that `end_loop`
//! rewrites into a forward `Jump` once the loop's end is known.

use std::rc::Rc;

use super::{expr, ClassCompiler, Compiler, Loop};
use crate::bytecode::Opcode;
use crate::token::{Token, TokenKind};
use crate::value::{AccessLevel, ClassKind, FunctionKind, Value};

impl Compiler<'_> {
    pub(super) fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
            if self.parser.panic_mode {
                self.synchronize();
            }
            return;
        }

        if self.match_token(TokenKind::Def) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Import) {
            self.import_statement();
        } else if self.match_token(TokenKind::From) {
            self.from_import_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.brace_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else {
            self.expression_statement();
        }
    }

    /// A `{` statement: a block, except that the degenerate `{};` compiles
    /// as an expression statement pushing the empty value
    fn brace_statement(&mut self) {
        if self.check(TokenKind::RightBrace) {
            self.advance();
            if self.check(TokenKind::Semicolon) {
                self.advance();
                self.emit_op(Opcode::Empty);
                self.emit_statement_pop(false);
            }
            // A bare `{}` is an empty block and emits nothing.
            return;
        }

        self.begin_scope();
        self.block();
        self.end_scope();
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    /// Pop the value of an expression statement; in REPL mode top-level
    /// non-assignment results are printed instead of discarded
    fn emit_statement_pop(&mut self, is_assignment: bool) {
        if self.vm.repl() && !is_assignment && self.state().kind == FunctionKind::TopLevel {
            self.emit_op(Opcode::PopRepl);
        } else {
            self.emit_op(Opcode::Pop);
        }
    }

    fn expression_statement(&mut self) {
        // Peek one token past the start of the expression to spot an
        // assignment, then rewind the lexer so the expression parses
        // normally. Only non-assignments print in the REPL.
        let previous = self.parser.previous.clone();
        self.advance();
        let lookahead = self.parser.current.kind;
        for _ in 0..self.parser.current.lexeme.chars().count() {
            self.parser.lexer.backtrack();
        }
        self.parser.current = self.parser.previous.clone();
        self.parser.previous = previous;

        expr::expression(self);
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_statement_pop(lookahead == TokenKind::Equal);
    }

    // === Variables ===

    pub(super) fn var_declaration(&mut self, constant: bool) {
        loop {
            let global = self.parse_variable("Expect variable name.");

            if self.match_token(TokenKind::Equal) || constant {
                expr::expression(self);
            } else {
                // Default to nil.
                self.emit_op(Opcode::Nil);
            }

            self.define_variable(global, constant);

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
    }

    // === Functions ===

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.function(FunctionKind::Function, AccessLevel::Public);
        self.define_variable(global, false);
    }

    /// Compile a function body in a fresh compiler state; `end_compiler`
    /// emits the `Closure` in the enclosing function
    fn function(&mut self, kind: FunctionKind, access: AccessLevel) {
        self.begin_function(kind, access);
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        self.end_compiler();
    }

    /// Open the function's compiler state and parse its parameter list
    fn begin_function(&mut self, kind: FunctionKind, access: AccessLevel) {
        self.push_state(kind, access);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");

        if !self.check(TokenKind::RightParen) {
            let mut optional = false;
            let mut spread = false;
            let mut param_count: u32 = 0;

            loop {
                if spread {
                    self.error("spread parameter must be last in the parameter list");
                }

                let var_keyword = self.match_token(TokenKind::Var);
                spread = self.match_token(TokenKind::DotDotDot);

                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let name = self.parser.previous.clone();
                let param_constant = self.identifier_constant(&name);
                self.declare_variable(&name);
                self.define_variable(param_constant, false);

                if kind == FunctionKind::Initializer && var_keyword {
                    let function = &mut self.state_mut().function;
                    function.property_count = function.property_count.saturating_add(1);
                } else if var_keyword {
                    self.error("var keyword in a function definition that is not a class constructor");
                }

                if spread {
                    if kind == FunctionKind::Initializer {
                        self.error("spread parameter cannot be used in a class constructor");
                    }
                    self.state_mut().function.is_variadic = true;
                }

                if self.match_token(TokenKind::Equal) {
                    if spread {
                        self.error("spread parameter cannot have an optional value");
                    }
                    let function = &mut self.state_mut().function;
                    function.arity_optional = function.arity_optional.saturating_add(1);
                    optional = true;
                    expr::expression(self);
                } else {
                    let function = &mut self.state_mut().function;
                    function.arity = function.arity.saturating_add(1);
                    if optional {
                        self.error("Cannot have non-optional parameter after optional.");
                    }
                }

                param_count += 1;
                if param_count > 255 {
                    self.error("Cannot have more than 255 parameters.");
                }

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }

            if self.state().function.arity_optional > 0 {
                let (arity, arity_optional) = {
                    let function = &self.state().function;
                    (function.arity, function.arity_optional)
                };
                self.emit_op(Opcode::DefineOptional);
                self.emit_byte(arity);
                self.emit_byte(arity_optional);
            }
        }

        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
    }

    // === Classes ===

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name = self.parser.previous.clone();
        let name_constant = self.identifier_constant(&name);
        self.declare_variable(&name);

        self.classes.push(ClassCompiler::new(name));

        if self.match_token(TokenKind::Less) {
            expr::expression(self);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }

            // Bind the just-evaluated superclass to a scoped local named
            // "super" so methods can capture it.
            self.begin_scope();
            self.add_local(Token::synthetic("super"));
            self.define_variable(0, false);

            self.emit_op_byte(Opcode::Subclass, ClassKind::Default as u8);
        } else {
            self.emit_op_byte(Opcode::Class, ClassKind::Default as u8);
        }

        self.emit_byte(name_constant);

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        self.class_body();
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");

        let has_superclass = self.classes.last().is_some_and(|class| class.has_superclass);
        if has_superclass {
            self.end_scope();
            self.emit_op(Opcode::EndClass);
        }

        self.classes.pop();
        self.define_variable(name_constant, false);
    }

    fn class_body(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Var) {
                self.consume(TokenKind::Identifier, "Expect class variable name.");
                let name = self.parser.previous.clone();
                let name_constant = self.identifier_constant(&name);

                let interned = self.vm.intern(&name.lexeme);
                if let Some(class) = self.classes.last_mut() {
                    class.private_members.insert(interned);
                }

                self.consume(TokenKind::Equal, "Expect '=' after class variable identifier.");
                expr::expression(self);
                self.emit_op_byte(Opcode::SetClassVar, name_constant);
                self.emit_byte(false as u8);

                self.consume(
                    TokenKind::Semicolon,
                    "Expect ';' after class variable declaration.",
                );
            } else {
                self.method();
            }
        }
    }

    fn method(&mut self) {
        if let Some(class) = self.classes.last_mut() {
            class.static_method = false;
        }

        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.parser.previous.clone();
        let constant = self.identifier_constant(&name);

        // A method literally named "init" is the initializer.
        let is_abstract = self.classes.last().is_some_and(|class| class.is_abstract);
        let kind = if name.lexeme == "init" {
            FunctionKind::Initializer
        } else if is_abstract {
            FunctionKind::Abstract
        } else {
            FunctionKind::Method
        };

        if kind == FunctionKind::Abstract {
            // Abstract methods declare a signature only.
            self.begin_function(kind, AccessLevel::Public);
            self.end_compiler();

            if self.check(TokenKind::LeftBrace) {
                self.error("Abstract methods can not have an implementation.");
                return;
            }
        } else {
            self.function(kind, AccessLevel::Public);
        }

        self.emit_op_byte(Opcode::Method, constant);
    }

    // === Control flow ===

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        expr::expression(self);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // Jump to the else branch if the condition is false.
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);

        self.emit_op(Opcode::Pop); // Condition.
        self.statement();

        // Jump over the else branch when the then branch ran.
        let end_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop); // Condition.

        if self.match_token(TokenKind::Else) {
            self.statement();
        }

        self.patch_jump(end_jump);
    }

    fn while_statement(&mut self) {
        let start = self.current_chunk_ref().len();
        let scope_depth = self.state().scope_depth;
        self.state_mut().loops.push(Loop {
            start,
            body: 0,
            end: None,
            scope_depth,
        });

        // An omitted condition is constant true.
        if self.check(TokenKind::LeftBrace) {
            self.emit_op(Opcode::True);
        } else {
            self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
            expr::expression(self);
            self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        }

        // Jump out of the loop if the condition is false.
        let exit = self.emit_jump(Opcode::JumpIfFalse);
        if let Some(current) = self.state_mut().loops.last_mut() {
            current.end = Some(exit);
        }

        self.emit_op(Opcode::Pop); // Condition.
        let body = self.current_chunk_ref().len();
        if let Some(current) = self.state_mut().loops.last_mut() {
            current.body = body;
        }
        self.statement();

        self.emit_loop(start);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        // for (var i = 0; i < 10; i = i + 1) body;
        //
        //   var i = 0;
        // start:                      <--.
        //   if (i < 10) goto exit;  --.  |
        //   goto body;  -----------.  |  |
        // increment:            <--+--+--+--.
        //   i = i + 1;             |  |  |  |
        //   goto start;  ----------+--+--'  |
        // body:                 <--'  |     |
        //   ...                       |     |
        //   goto increment;  ---------+-----'
        // exit:                    <--'

        // Scope for the loop variable.
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else {
            self.expression_statement();
        }

        let start = self.current_chunk_ref().len();
        let scope_depth = self.state().scope_depth;
        self.state_mut().loops.push(Loop {
            start,
            body: 0,
            end: None,
            scope_depth,
        });

        // The exit condition.
        if !self.match_token(TokenKind::Semicolon) {
            expr::expression(self);
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            let exit = self.emit_jump(Opcode::JumpIfFalse);
            if let Some(current) = self.state_mut().loops.last_mut() {
                current.end = Some(exit);
            }
            self.emit_op(Opcode::Pop); // Condition.
        }

        // Increment step, jumped over on the way into the body; the loop
        // start relocates to it for subsequent iterations.
        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);

            let increment_start = self.current_chunk_ref().len();
            expr::expression(self);
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            let loop_start = self.state().loops.last().map_or(start, |l| l.start);
            self.emit_loop(loop_start);
            if let Some(current) = self.state_mut().loops.last_mut() {
                current.start = increment_start;
            }

            self.patch_jump(body_jump);
        }

        let body = self.current_chunk_ref().len();
        if let Some(current) = self.state_mut().loops.last_mut() {
            current.body = body;
        }
        self.statement();

        // Jump back to the start (or the increment).
        let loop_start = self.state().loops.last().map_or(start, |l| l.start);
        self.emit_loop(loop_start);

        self.end_loop();
        self.end_scope(); // Loop variable.
    }

    /// Finish the innermost loop: patch the exit jump and rewrite every
    /// `Break` placeholder in the body into a `Jump` to this point
    fn end_loop(&mut self) {
        let finished = self
            .state()
            .loops
            .last()
            .copied()
            .expect("end_loop outside of a loop");

        if let Some(exit) = finished.end {
            self.patch_jump(exit);
            self.emit_op(Opcode::Pop); // Condition.
        }

        // A real Break placeholder always carries its two offset bytes.
        let mut offset = finished.body;
        while offset < self.current_chunk_ref().len() {
            if self.current_chunk_ref().code[offset] == Opcode::Break as u8
                && offset + 3 <= self.current_chunk_ref().len()
            {
                self.current_chunk().code[offset] = Opcode::Jump as u8;
                self.patch_jump(offset + 1);
                offset += 3;
            } else {
                offset += self.current_chunk_ref().instruction_len(offset);
            }
        }

        self.state_mut().loops.pop();
    }

    /// Emit `CloseUpvalue`/`Pop` for every local above the innermost
    /// loop's scope, without removing them from the compiler's list;
    /// used by break and continue which leave the scope early
    fn discard_loop_locals(&mut self) {
        let scope_depth = match self.state().loops.last() {
            Some(current) => current.scope_depth,
            None => return,
        };

        let captured_flags: Vec<bool> = self
            .state()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > scope_depth)
            .map(|local| local.is_captured)
            .collect();

        for is_captured in captured_flags {
            if is_captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    fn break_statement(&mut self) {
        if self.state().loops.is_empty() {
            self.error("Cannot utilise 'break' outside of a loop.");
            return;
        }

        self.consume(TokenKind::Semicolon, "Expected semicolon after break");

        self.discard_loop_locals();
        self.emit_jump(Opcode::Break);
    }

    fn continue_statement(&mut self) {
        if self.state().loops.is_empty() {
            self.error("Cannot utilise 'continue' outside of a loop.");
            return;
        }

        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");

        self.discard_loop_locals();

        // Jump to the top of the innermost loop.
        let start = self.state().loops.last().map_or(0, |l| l.start);
        self.emit_loop(start);
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::TopLevel {
            self.error("Cannot return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("Cannot return a value from an initializer.");
            }

            expr::expression(self);
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");

            self.emit_op(Opcode::Return);
        }
    }

    // === Imports ===

    /// `import "path" [as name];`
    fn import_statement(&mut self) {
        if self.match_token(TokenKind::String) {
            let path = self.string_body();
            let constant = self.make_constant(Value::String(path));

            self.emit_op_byte(Opcode::Import, constant);
            self.emit_op(Opcode::Pop);

            if self.match_token(TokenKind::As) {
                let alias = self.parse_variable("Expect import alias.");
                self.emit_op(Opcode::ImportVariable);
                self.define_variable(alias, false);
            }
        }

        self.emit_op(Opcode::ImportEnd);
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");
    }

    /// `from "path" import a, b, c;`
    fn from_import_statement(&mut self) {
        if self.match_token(TokenKind::String) {
            let path = self.string_body();
            let constant = self.make_constant(Value::String(path));

            self.consume(TokenKind::Import, "Expect 'import' after import path.");
            self.emit_op_byte(Opcode::Import, constant);
            self.emit_op(Opcode::Pop);

            let mut variables: Vec<u8> = Vec::new();
            let mut names: Vec<Token> = Vec::new();

            loop {
                self.consume(TokenKind::Identifier, "Expect variable name.");
                let name = self.parser.previous.clone();
                variables.push(self.identifier_constant(&name));
                names.push(name);

                if variables.len() > 255 {
                    self.error("Cannot have more than 255 variables.");
                }

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }

            self.emit_op_byte(Opcode::ImportFrom, variables.len().min(255) as u8);
            for &variable in &variables {
                self.emit_byte(variable);
            }

            // Module scope defines in reverse so the VM pops imported
            // values in stack order; locals declare in source order.
            if self.state().scope_depth == 0 {
                for &variable in variables.iter().rev() {
                    self.define_variable(variable, false);
                }
            } else {
                for name in &names {
                    self.declare_variable(name);
                    self.define_variable(0, false);
                }
            }
        }

        self.emit_op(Opcode::ImportEnd);
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");
    }

    /// Interned contents of the string token in `previous`, quotes
    /// stripped and escapes kept as written
    fn string_body(&mut self) -> Rc<str> {
        let lexeme = &self.parser.previous.lexeme;
        let body = lexeme[1..lexeme.len() - 1].to_string();
        self.vm.intern(&body)
    }
}
