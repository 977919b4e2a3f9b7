//! Pratt expression parser
//!
//! One rule per token kind: an optional prefix handler, an optional infix
//! handler and a precedence level. `parse_precedence` drives the table;
//! handlers emit bytecode directly. Infix handlers receive the token that
//! preceded the operator so `.` can recognise calls through `this` or the
//! enclosing class name.

use super::{identifiers_equal, ClassCompiler, Compiler};
use crate::bytecode::Opcode;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Precedence levels, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Indices,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    /// The next-higher level; binary operators parse their right operand
    /// one level up to get left associativity
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Indices,
            Precedence::Indices => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type PrefixFn = fn(&mut Compiler<'_>, bool);
type InfixFn = fn(&mut Compiler<'_>, Token, bool);

/// One entry of the Pratt table
pub(super) struct ParseRule {
    prefix: Option<PrefixFn>,
    infix: Option<InfixFn>,
    precedence: Precedence,
}

fn rule(prefix: Option<PrefixFn>, infix: Option<InfixFn>, precedence: Precedence) -> ParseRule {
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

/// The Pratt table, keyed by token kind
pub(super) fn rule_for(kind: TokenKind) -> ParseRule {
    match kind {
        TokenKind::LeftParen => rule(Some(grouping), Some(call), Precedence::Call),
        TokenKind::Dot => rule(None, Some(dot), Precedence::Call),

        TokenKind::Minus => rule(Some(unary), Some(binary), Precedence::Term),
        TokenKind::Plus => rule(None, Some(binary), Precedence::Term),
        TokenKind::Slash => rule(None, Some(binary), Precedence::Factor),
        TokenKind::Star => rule(None, Some(binary), Precedence::Factor),
        TokenKind::Percent => rule(None, Some(binary), Precedence::Factor),
        TokenKind::StarStar => rule(None, Some(binary), Precedence::Indices),
        TokenKind::Not => rule(Some(unary), None, Precedence::None),

        TokenKind::BangEqual => rule(None, Some(binary), Precedence::Equality),
        TokenKind::EqualEqual => rule(None, Some(binary), Precedence::Equality),
        TokenKind::Greater => rule(None, Some(binary), Precedence::Comparison),
        TokenKind::GreaterEqual => rule(None, Some(binary), Precedence::Comparison),
        TokenKind::Less => rule(None, Some(binary), Precedence::Comparison),
        TokenKind::LessEqual => rule(None, Some(binary), Precedence::Comparison),

        TokenKind::Identifier => rule(Some(variable), None, Precedence::None),
        TokenKind::String => rule(Some(string), None, Precedence::None),
        TokenKind::RString => rule(Some(r_string), None, Precedence::None),
        TokenKind::Number => rule(Some(number), None, Precedence::None),

        TokenKind::And => rule(None, Some(and_), Precedence::And),
        TokenKind::Or => rule(None, Some(or_), Precedence::Or),

        TokenKind::True | TokenKind::False | TokenKind::Nil => {
            rule(Some(literal), None, Precedence::None)
        }
        TokenKind::Super => rule(Some(super_), None, Precedence::None),
        TokenKind::This => rule(Some(this_), None, Precedence::None),

        _ => rule(None, None, Precedence::None),
    }
}

/// Parse anything at or above `precedence`
pub(super) fn parse_precedence(c: &mut Compiler, precedence: Precedence) {
    c.advance();

    let Some(prefix) = rule_for(c.parser.previous.kind).prefix else {
        c.error("Expect expression.");
        return;
    };

    let can_assign = precedence <= Precedence::Assignment;
    prefix(c, can_assign);

    while precedence <= rule_for(c.parser.current.kind).precedence {
        let token = c.parser.previous.clone();
        c.advance();
        if let Some(infix) = rule_for(c.parser.previous.kind).infix {
            infix(c, token, can_assign);
        }
    }

    if can_assign && c.match_token(TokenKind::Equal) {
        // The `=` could not be consumed by any rule, so the left-hand
        // side is not an lvalue.
        c.error("Invalid assignment target.");
    }
}

pub(super) fn expression(c: &mut Compiler) {
    parse_precedence(c, Precedence::Assignment);
}

/// Parse a parenthesized argument list; returns (count, unpack flag)
pub(super) fn argument_list(c: &mut Compiler) -> (u8, bool) {
    let mut arg_count: u32 = 0;
    let mut unpack = false;

    if !c.check(TokenKind::RightParen) {
        loop {
            if unpack {
                c.error_at_current("Value unpacking must be the last argument.");
            }
            if c.match_token(TokenKind::DotDotDot) {
                unpack = true;
            }

            expression(c);
            arg_count += 1;
            if arg_count > 255 {
                c.error("Cannot have more than 255 arguments.");
            }

            if !c.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    c.consume(TokenKind::RightParen, "Expect ')' after arguments.");

    (arg_count.min(255) as u8, unpack)
}

// === Prefix rules ===

fn grouping(c: &mut Compiler, _can_assign: bool) {
    expression(c);
    c.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(c: &mut Compiler, _can_assign: bool) {
    // Strip underscore separators before parsing.
    let raw: String = c
        .parser
        .previous
        .lexeme
        .chars()
        .filter(|&ch| ch != '_')
        .collect();

    match raw.parse::<f64>() {
        Ok(value) => c.emit_constant(Value::Number(value)),
        Err(_) => c.error("Invalid number literal."),
    }
}

fn string(c: &mut Compiler, _can_assign: bool) {
    let lexeme = &c.parser.previous.lexeme;
    let body = &lexeme[1..lexeme.len() - 1];
    let processed = decode_escapes(body);
    let value = Value::String(c.vm.intern(&processed));
    c.emit_constant(value);
}

/// A raw string: the `r` prefix followed by a string whose bytes are kept
/// exactly as written
fn r_string(c: &mut Compiler, _can_assign: bool) {
    if c.match_token(TokenKind::String) {
        let lexeme = &c.parser.previous.lexeme;
        let body = lexeme[1..lexeme.len() - 1].to_string();
        let value = Value::String(c.vm.intern(&body));
        c.emit_constant(value);
        return;
    }

    c.consume(TokenKind::String, "Expected string after r delimiter");
}

/// Decode the escape sequences of a quoted string body.
///
/// Unknown escapes are kept as written, backslash included.
fn decode_escapes(body: &str) -> String {
    let mut decoded = String::with_capacity(body.len());
    let mut chars = body.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            decoded.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => decoded.push('\n'),
            Some('t') => decoded.push('\t'),
            Some('r') => decoded.push('\r'),
            Some('v') => decoded.push('\u{000B}'),
            Some('\\') => decoded.push('\\'),
            Some('\'') => decoded.push('\''),
            Some('"') => decoded.push('"'),
            Some(other) => {
                decoded.push('\\');
                decoded.push(other);
            }
            None => decoded.push('\\'),
        }
    }

    decoded
}

fn literal(c: &mut Compiler, _can_assign: bool) {
    match c.parser.previous.kind {
        TokenKind::False => c.emit_op(Opcode::False),
        TokenKind::Nil => c.emit_op(Opcode::Nil),
        TokenKind::True => c.emit_op(Opcode::True),
        _ => unreachable!("literal rule on non-literal token"),
    }
}

fn variable(c: &mut Compiler, can_assign: bool) {
    let name = c.parser.previous.clone();
    c.named_variable(name, can_assign);
}

fn this_(c: &mut Compiler, _can_assign: bool) {
    match c.classes.last() {
        None => c.error("Cannot utilise 'this' outside of a class."),
        Some(class) if class.static_method => {
            c.error("Cannot utilise 'this' inside a static method.")
        }
        _ => variable(c, false),
    }
}

fn super_(c: &mut Compiler, _can_assign: bool) {
    match c.classes.last() {
        None => c.error("Cannot utilise 'super' outside of a class."),
        Some(class) if !class.has_superclass => {
            c.error("Cannot utilise 'super' in a class with no superclass.")
        }
        _ => {}
    }

    c.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    c.consume(TokenKind::Identifier, "Expect superclass method name.");
    let name_token = c.parser.previous.clone();
    let name = c.identifier_constant(&name_token);

    // Push the receiver.
    c.named_variable(Token::synthetic("this"), false);

    if c.match_token(TokenKind::LeftParen) {
        let (arg_count, unpack) = argument_list(c);
        push_superclass(c);
        c.emit_op_byte(Opcode::Super, arg_count);
        c.emit_byte(name);
        c.emit_byte(unpack as u8);
    } else {
        push_superclass(c);
        c.emit_op_byte(Opcode::GetSuper, name);
    }
}

fn push_superclass(c: &mut Compiler) {
    if c.classes.is_empty() {
        return;
    }
    c.named_variable(Token::synthetic("super"), false);
}

fn unary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.parser.previous.kind;
    parse_precedence(c, Precedence::Unary);

    if fold_unary(c, operator) {
        return;
    }

    match operator {
        TokenKind::Not => c.emit_op(Opcode::Not),
        TokenKind::Minus => c.emit_op(Opcode::Negate),
        _ => {}
    }
}

// === Infix rules ===

fn binary(c: &mut Compiler, _previous: Token, _can_assign: bool) {
    let operator = c.parser.previous.kind;
    let rule = rule_for(operator);
    parse_precedence(c, rule.precedence.next());

    if fold_binary(c, operator) {
        return;
    }

    match operator {
        TokenKind::BangEqual => {
            c.emit_op(Opcode::Equal);
            c.emit_op(Opcode::Not);
        }
        TokenKind::EqualEqual => c.emit_op(Opcode::Equal),
        TokenKind::Greater => c.emit_op(Opcode::Greater),
        TokenKind::GreaterEqual => {
            c.emit_op(Opcode::Less);
            c.emit_op(Opcode::Not);
        }
        TokenKind::Less => c.emit_op(Opcode::Less),
        TokenKind::LessEqual => {
            c.emit_op(Opcode::Greater);
            c.emit_op(Opcode::Not);
        }
        TokenKind::Plus => c.emit_op(Opcode::Add),
        TokenKind::Minus => c.emit_op(Opcode::Subtract),
        TokenKind::Star => c.emit_op(Opcode::Multiply),
        TokenKind::Slash => c.emit_op(Opcode::Divide),
        TokenKind::Percent => c.emit_op(Opcode::Mod),
        TokenKind::StarStar => c.emit_op(Opcode::Pow),
        _ => {}
    }
}

fn call(c: &mut Compiler, _previous: Token, _can_assign: bool) {
    let (arg_count, unpack) = argument_list(c);
    c.emit_op_byte(Opcode::Call, arg_count);
    c.emit_byte(unpack as u8);
}

fn dot(c: &mut Compiler, previous: Token, can_assign: bool) {
    c.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let name_token = c.parser.previous.clone();
    let name = c.identifier_constant(&name_token);

    if c.match_token(TokenKind::LeftParen) {
        let (arg_count, unpack) = argument_list(c);
        if receiver_is_internal(c.classes.last(), &previous) {
            c.emit_op_byte(Opcode::InvokeInternal, arg_count);
        } else {
            c.emit_op_byte(Opcode::Invoke, arg_count);
        }
        c.emit_byte(name);
        c.emit_byte(unpack as u8);
        return;
    }

    let compound = if can_assign {
        match super::compound_operator(c.parser.current.kind) {
            Some(Some(operator)) => Some(operator),
            _ => None,
        }
    } else {
        None
    };

    if can_assign && c.match_token(TokenKind::Equal) {
        expression(c);
        c.emit_op_byte(Opcode::SetProperty, name);
    } else if let Some(operator) = compound {
        c.advance();
        c.emit_op_byte(Opcode::GetPropertyNoPop, name);
        expression(c);
        c.emit_op(operator);
        c.emit_op_byte(Opcode::SetProperty, name);
    } else {
        c.emit_op_byte(Opcode::GetProperty, name);
    }
}

/// A call through `this` or the enclosing class's own name may reach
/// private members, so it dispatches internally
fn receiver_is_internal(class: Option<&ClassCompiler>, previous: &Token) -> bool {
    match class {
        Some(class) => {
            previous.kind == TokenKind::This || identifiers_equal(previous, &class.name)
        }
        None => false,
    }
}

fn and_(c: &mut Compiler, _previous: Token, _can_assign: bool) {
    // left operand...
    // JUMP_IF_FALSE    ------.
    // POP  // left operand   |
    // right operand...       |
    //   <--------------------'

    // Short circuit keeping a falsy left operand.
    let end_jump = c.emit_jump(Opcode::JumpIfFalse);

    c.emit_op(Opcode::Pop);
    parse_precedence(c, Precedence::And);

    c.patch_jump(end_jump);
}

fn or_(c: &mut Compiler, _previous: Token, _can_assign: bool) {
    // left operand...
    // JUMP_IF_FALSE    ---.
    // JUMP             ---+--.
    //   <-----------------'  |
    // POP  // left operand   |
    // right operand...       |
    //   <--------------------'

    // A falsy left operand falls through to the right operand; a truthy
    // one jumps to the end and is kept.
    let else_jump = c.emit_jump(Opcode::JumpIfFalse);
    let end_jump = c.emit_jump(Opcode::Jump);

    c.patch_jump(else_jump);
    c.emit_op(Opcode::Pop);

    parse_precedence(c, Precedence::Or);
    c.patch_jump(end_jump);
}

// === Constant folding ===

/// Fold `const OP const` when both operands are the two most recently
/// emitted instructions, both numeric constants, and no jump target
/// intervenes. The two instructions collapse to one `Constant` and the
/// right operand leaves the pool.
fn fold_binary(c: &mut Compiler, operator: TokenKind) -> bool {
    if !matches!(
        operator,
        TokenKind::Plus | TokenKind::Minus | TokenKind::Star | TokenKind::Slash
    ) {
        return false;
    }

    let (lhs_index, result) = {
        let state = c.state();
        let chunk = &state.function.chunk;
        let len = chunk.code.len();

        if len < 4 || len - 4 < state.fold_barrier {
            return false;
        }
        if state.last_ops[2] != Some(len - 2) || state.last_ops[1] != Some(len - 4) {
            return false;
        }
        if chunk.code[len - 2] != Opcode::Constant as u8
            || chunk.code[len - 4] != Opcode::Constant as u8
        {
            return false;
        }

        let lhs_index = chunk.code[len - 3] as usize;
        let rhs_index = chunk.code[len - 1] as usize;
        // The right operand must be the newest pool entry so it can be
        // dropped without disturbing other indices.
        if rhs_index != chunk.constants.len() - 1 || lhs_index == rhs_index {
            return false;
        }

        let (Some(lhs), Some(rhs)) = (
            chunk.constants.get(lhs_index).and_then(Value::as_number),
            chunk.constants.get(rhs_index).and_then(Value::as_number),
        ) else {
            return false;
        };

        let result = match operator {
            TokenKind::Plus => lhs + rhs,
            TokenKind::Minus => lhs - rhs,
            TokenKind::Star => lhs * rhs,
            TokenKind::Slash => lhs / rhs,
            _ => return false,
        };
        (lhs_index, result)
    };

    let chunk = c.current_chunk();
    let len = chunk.code.len();
    chunk.constants[lhs_index] = Value::Number(result);
    chunk.constants.pop();
    chunk.code.truncate(len - 2);
    chunk.lines.truncate(len - 2);

    let state = c.state_mut();
    state.last_ops = [None, state.last_ops[0], state.last_ops[1]];

    true
}

/// Fold unary minus into a just-emitted numeric constant, and `not` into
/// a just-emitted `True`/`False`
fn fold_unary(c: &mut Compiler, operator: TokenKind) -> bool {
    match operator {
        TokenKind::Minus => {
            let index = {
                let state = c.state();
                let chunk = &state.function.chunk;
                let len = chunk.code.len();

                if len < 2 || len - 2 < state.fold_barrier {
                    return false;
                }
                if state.last_ops[2] != Some(len - 2)
                    || chunk.code[len - 2] != Opcode::Constant as u8
                {
                    return false;
                }

                let index = chunk.code[len - 1] as usize;
                if chunk.constants.get(index).and_then(Value::as_number).is_none() {
                    return false;
                }
                index
            };

            if let Some(Value::Number(n)) = c.current_chunk().constants.get_mut(index) {
                *n = -*n;
            }
            true
        }

        TokenKind::Not => {
            let replacement = {
                let state = c.state();
                let chunk = &state.function.chunk;
                let len = chunk.code.len();

                if len < 1 || len - 1 < state.fold_barrier {
                    return false;
                }
                if state.last_ops[2] != Some(len - 1) {
                    return false;
                }

                if chunk.code[len - 1] == Opcode::True as u8 {
                    Opcode::False as u8
                } else if chunk.code[len - 1] == Opcode::False as u8 {
                    Opcode::True as u8
                } else {
                    return false;
                }
            };

            let chunk = c.current_chunk();
            let len = chunk.code.len();
            chunk.code[len - 1] = replacement;
            true
        }

        _ => false,
    }
}
