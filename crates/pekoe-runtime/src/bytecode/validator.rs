//! Bytecode validator — static checks over compiled functions
//!
//! Walks a function's chunk (and every nested function in its constant
//! pool) verifying the structural invariants the compiler promises:
//!
//! 1. **Decode pass** — every byte is a known opcode with all its operand
//!    bytes present, and the line table covers every code byte
//! 2. **Jump targets** — forward jumps land on an instruction boundary;
//!    `Loop` targets land on a boundary at or before the instruction itself
//! 3. **Index refs** — constant, local-slot and upvalue operands are in
//!    range for the function
//! 4. **Break rewriting** — no `Break` placeholder survives compilation
//! 5. **Termination** — the chunk ends with `Return`
//!
//! The validator is advisory: the compiler never calls it on its own
//! output, but the test suite runs it over every chunk it produces.

use thiserror::Error;

use super::{Chunk, Opcode};
use crate::value::{Function, Value};

/// A validation error with the byte offset where it was detected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("offset {offset:#06x}: {kind}")]
pub struct ValidationError {
    /// Byte offset in the instruction stream where the error was detected
    pub offset: usize,
    /// What went wrong
    pub kind: ValidationErrorKind,
}

/// Kinds of errors the validator can detect
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationErrorKind {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("instruction {opcode} is truncated (missing operand bytes)")]
    TruncatedInstruction { opcode: String },
    #[error("line table covers {lines} bytes but the chunk has {code} bytes")]
    LineTableMismatch { lines: usize, code: usize },
    #[error("jump target {target} is out of bounds (len={len})")]
    JumpOutOfBounds { target: usize, len: usize },
    #[error("jump target {target} does not land on an instruction boundary")]
    JumpMisaligned { target: usize },
    #[error("loop target {target} is past the loop instruction at {offset}")]
    LoopNotBackward { target: usize, offset: usize },
    #[error("constant index {index} out of bounds (pool size={pool_size})")]
    ConstantIndexOutOfBounds { index: usize, pool_size: usize },
    #[error("closure constant {index} is not a function")]
    ClosureConstantNotFunction { index: usize },
    #[error("local slot {slot} exceeds the function's {max_locals} slots")]
    LocalSlotOutOfRange { slot: usize, max_locals: usize },
    #[error("upvalue index {index} exceeds the function's {count} upvalues")]
    UpvalueIndexOutOfRange { index: usize, count: usize },
    #[error("unpatched break placeholder")]
    ResidualBreak,
    #[error("chunk does not end with Return")]
    MissingReturn,
}

/// Validate `function` and every nested function it embeds.
///
/// Returns every detected problem; does not short-circuit on the first.
pub fn validate(function: &Function) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    validate_into(function, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_into(function: &Function, errors: &mut Vec<ValidationError>) {
    let chunk = &function.chunk;

    if chunk.lines.len() != chunk.code.len() {
        errors.push(ValidationError {
            offset: 0,
            kind: ValidationErrorKind::LineTableMismatch {
                lines: chunk.lines.len(),
                code: chunk.code.len(),
            },
        });
    }

    let decoded = decode(chunk, errors);
    let boundaries: std::collections::HashSet<usize> =
        decoded.iter().map(|&(offset, _)| offset).collect();

    for &(offset, opcode) in &decoded {
        let Some(opcode) = opcode else { continue };
        check_instruction(function, offset, opcode, &boundaries, errors);
    }

    match decoded.last() {
        Some(&(_, Some(Opcode::Return))) => {}
        _ => errors.push(ValidationError {
            offset: chunk.code.len(),
            kind: ValidationErrorKind::MissingReturn,
        }),
    }

    // Nested functions live in the constant pool; check them too.
    for constant in &chunk.constants {
        if let Value::Function(nested) = constant {
            validate_into(nested, errors);
        }
    }
}

/// Decode the chunk into `(offset, opcode)` pairs, reporting unknown
/// opcodes and truncated trailing instructions.
fn decode(chunk: &Chunk, errors: &mut Vec<ValidationError>) -> Vec<(usize, Option<Opcode>)> {
    let mut decoded = Vec::new();
    let mut offset = 0;

    while offset < chunk.code.len() {
        let byte = chunk.code[offset];
        match Opcode::try_from(byte) {
            Ok(opcode) => {
                let len = chunk.instruction_len(offset);
                if offset + len > chunk.code.len() {
                    errors.push(ValidationError {
                        offset,
                        kind: ValidationErrorKind::TruncatedInstruction {
                            opcode: format!("{:?}", opcode),
                        },
                    });
                    decoded.push((offset, Some(opcode)));
                    break;
                }
                decoded.push((offset, Some(opcode)));
                offset += len;
            }
            Err(_) => {
                errors.push(ValidationError {
                    offset,
                    kind: ValidationErrorKind::UnknownOpcode(byte),
                });
                decoded.push((offset, None));
                offset += 1;
            }
        }
    }

    decoded
}

fn check_instruction(
    function: &Function,
    offset: usize,
    opcode: Opcode,
    boundaries: &std::collections::HashSet<usize>,
    errors: &mut Vec<ValidationError>,
) {
    let chunk = &function.chunk;
    let len = chunk.code.len();
    let mut report = |kind| errors.push(ValidationError { offset, kind });

    match opcode {
        Opcode::Jump | Opcode::JumpIfFalse => {
            let jump = read_u16(chunk, offset + 1) as usize;
            let target = offset + 3 + jump;
            if target >= len {
                report(ValidationErrorKind::JumpOutOfBounds { target, len });
            } else if !boundaries.contains(&target) {
                report(ValidationErrorKind::JumpMisaligned { target });
            }
        }

        Opcode::Loop => {
            let jump = read_u16(chunk, offset + 1) as usize;
            let Some(target) = (offset + 3).checked_sub(jump) else {
                report(ValidationErrorKind::JumpOutOfBounds { target: 0, len });
                return;
            };
            if target > offset {
                report(ValidationErrorKind::LoopNotBackward { target, offset });
            } else if !boundaries.contains(&target) {
                report(ValidationErrorKind::JumpMisaligned { target });
            }
        }

        Opcode::Break => report(ValidationErrorKind::ResidualBreak),

        Opcode::Constant
        | Opcode::GetGlobal
        | Opcode::GetModule
        | Opcode::SetModule
        | Opcode::DefineModule
        | Opcode::GetProperty
        | Opcode::GetPropertyNoPop
        | Opcode::SetProperty
        | Opcode::GetSuper
        | Opcode::Method
        | Opcode::Import => {
            check_constant(chunk, chunk.code[offset + 1] as usize, &mut report);
        }

        Opcode::Invoke | Opcode::InvokeInternal | Opcode::Super => {
            check_constant(chunk, chunk.code[offset + 2] as usize, &mut report);
        }

        Opcode::Class | Opcode::Subclass => {
            check_constant(chunk, chunk.code[offset + 2] as usize, &mut report);
        }

        Opcode::SetClassVar => {
            check_constant(chunk, chunk.code[offset + 1] as usize, &mut report);
        }

        Opcode::Closure => {
            let index = chunk.code[offset + 1] as usize;
            match chunk.constants.get(index) {
                Some(Value::Function(_)) => {}
                Some(_) => report(ValidationErrorKind::ClosureConstantNotFunction { index }),
                None => report(ValidationErrorKind::ConstantIndexOutOfBounds {
                    index,
                    pool_size: chunk.constants.len(),
                }),
            }
        }

        Opcode::ImportFrom => {
            let count = chunk.code[offset + 1] as usize;
            for i in 0..count {
                check_constant(chunk, chunk.code[offset + 2 + i] as usize, &mut report);
            }
        }

        Opcode::GetLocal | Opcode::SetLocal => {
            let slot = chunk.code[offset + 1] as usize;
            if slot >= function.max_locals {
                report(ValidationErrorKind::LocalSlotOutOfRange {
                    slot,
                    max_locals: function.max_locals,
                });
            }
        }

        Opcode::GetUpvalue | Opcode::SetUpvalue => {
            let index = chunk.code[offset + 1] as usize;
            if index >= function.upvalue_count {
                report(ValidationErrorKind::UpvalueIndexOutOfRange {
                    index,
                    count: function.upvalue_count,
                });
            }
        }

        _ => {}
    }
}

fn check_constant(chunk: &Chunk, index: usize, report: &mut impl FnMut(ValidationErrorKind)) {
    if index >= chunk.constants.len() {
        report(ValidationErrorKind::ConstantIndexOutOfBounds {
            index,
            pool_size: chunk.constants.len(),
        });
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    ((chunk.code[offset] as u16) << 8) | chunk.code[offset + 1] as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{AccessLevel, FunctionKind, Module};

    fn function_with_code(code: &[u8]) -> Function {
        let module = Module::new("test");
        let mut function = Function::new(FunctionKind::TopLevel, AccessLevel::Public, module);
        for &byte in code {
            function.chunk.write(byte, 1);
        }
        function
    }

    #[test]
    fn test_minimal_chunk_is_valid() {
        let function = function_with_code(&[Opcode::Nil as u8, Opcode::Return as u8]);
        assert!(validate(&function).is_ok());
    }

    #[test]
    fn test_missing_return_is_reported() {
        let function = function_with_code(&[Opcode::Nil as u8, Opcode::Pop as u8]);
        let errors = validate(&function).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.kind == ValidationErrorKind::MissingReturn));
    }

    #[test]
    fn test_residual_break_is_reported() {
        let function = function_with_code(&[
            Opcode::Break as u8,
            0xFF,
            0xFF,
            Opcode::Nil as u8,
            Opcode::Return as u8,
        ]);
        let errors = validate(&function).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.kind == ValidationErrorKind::ResidualBreak));
    }

    #[test]
    fn test_jump_past_end_is_reported() {
        let function = function_with_code(&[
            Opcode::Jump as u8,
            0x00,
            0x10,
            Opcode::Nil as u8,
            Opcode::Return as u8,
        ]);
        let errors = validate(&function).unwrap_err();
        assert!(matches!(
            errors[0].kind,
            ValidationErrorKind::JumpOutOfBounds { .. }
        ));
    }

    #[test]
    fn test_constant_out_of_bounds_is_reported() {
        let function = function_with_code(&[
            Opcode::Constant as u8,
            5,
            Opcode::Nil as u8,
            Opcode::Return as u8,
        ]);
        let errors = validate(&function).unwrap_err();
        assert!(matches!(
            errors[0].kind,
            ValidationErrorKind::ConstantIndexOutOfBounds { .. }
        ));
    }
}
