//! Bytecode disassembler
//!
//! Converts a chunk back to a human-readable listing. Used for debugging
//! and golden-snapshot tests.

use std::fmt::Write;

use super::{Chunk, Opcode};

/// Disassemble a chunk to a human-readable listing
///
/// # Format
/// ```text
/// == <module demo> ==
/// === Constants ===
/// 0: 1
/// 1: "x"
///
/// === Instructions ===
/// 0000  Constant 0 (1)
/// 0002  DefineModule 1 ("x")
/// 0004  Nil
/// 0005  Return
/// ```
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut output = String::new();
    writeln!(output, "== {} ==", name).unwrap();

    if !chunk.constants.is_empty() {
        writeln!(output, "=== Constants ===").unwrap();
        for (index, constant) in chunk.constants.iter().enumerate() {
            writeln!(output, "{}: {}", index, constant).unwrap();
        }
        writeln!(output).unwrap();
    }

    writeln!(output, "=== Instructions ===").unwrap();
    let mut offset = 0;
    while offset < chunk.code.len() {
        let line = disassemble_instruction(chunk, offset);
        writeln!(output, "{}", line).unwrap();
        offset += chunk.instruction_len(offset);
    }

    output
}

/// Render the single instruction starting at `offset`
fn disassemble_instruction(chunk: &Chunk, offset: usize) -> String {
    let byte = chunk.code[offset];
    let opcode = match Opcode::try_from(byte) {
        Ok(op) => op,
        Err(_) => return format!("{:04}  <invalid opcode: {:#04x}>", offset, byte),
    };

    let end = offset + chunk.instruction_len(offset);
    if end > chunk.code.len() {
        return format!("{:04}  {:?} <truncated>", offset, opcode);
    }

    match opcode {
        // Constant-pool operand
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
            let index = chunk.code[offset + 1] as usize;
            format!(
                "{:04}  {:?} {} ({})",
                offset,
                opcode,
                index,
                constant_display(chunk, index)
            )
        }

        // Slot/index operand
        Opcode::GetLocal | Opcode::SetLocal | Opcode::GetUpvalue | Opcode::SetUpvalue => {
            format!("{:04}  {:?} {}", offset, opcode, chunk.code[offset + 1])
        }

        // Forward jumps
        Opcode::Jump | Opcode::JumpIfFalse | Opcode::Break => {
            let jump = read_u16(chunk, offset + 1);
            format!(
                "{:04}  {:?} {} (to {:04})",
                offset,
                opcode,
                jump,
                offset + 3 + jump as usize
            )
        }

        // Backward jump
        Opcode::Loop => {
            let jump = read_u16(chunk, offset + 1);
            format!(
                "{:04}  {:?} {} (to {:04})",
                offset,
                opcode,
                jump,
                (offset + 3).saturating_sub(jump as usize)
            )
        }

        Opcode::Call => {
            format!(
                "{:04}  {:?} {} unpack={}",
                offset,
                opcode,
                chunk.code[offset + 1],
                chunk.code[offset + 2]
            )
        }

        Opcode::Invoke | Opcode::InvokeInternal | Opcode::Super => {
            let name = chunk.code[offset + 2] as usize;
            format!(
                "{:04}  {:?} {} {} ({}) unpack={}",
                offset,
                opcode,
                chunk.code[offset + 1],
                name,
                constant_display(chunk, name),
                chunk.code[offset + 3]
            )
        }

        Opcode::Closure => {
            let index = chunk.code[offset + 1] as usize;
            let mut line = format!(
                "{:04}  {:?} {} ({})",
                offset,
                opcode,
                index,
                constant_display(chunk, index)
            );
            let mut pair = offset + 2;
            while pair + 1 < end {
                let source = if chunk.code[pair] == 1 { "local" } else { "upvalue" };
                write!(line, " ({} {})", source, chunk.code[pair + 1]).unwrap();
                pair += 2;
            }
            line
        }

        Opcode::Class | Opcode::Subclass => {
            let name = chunk.code[offset + 2] as usize;
            format!(
                "{:04}  {:?} kind={} {} ({})",
                offset,
                opcode,
                chunk.code[offset + 1],
                name,
                constant_display(chunk, name)
            )
        }

        Opcode::SetClassVar => {
            let name = chunk.code[offset + 1] as usize;
            format!(
                "{:04}  {:?} {} ({}) private={}",
                offset,
                opcode,
                name,
                constant_display(chunk, name),
                chunk.code[offset + 2]
            )
        }

        Opcode::DefineOptional => {
            format!(
                "{:04}  {:?} {} {}",
                offset,
                opcode,
                chunk.code[offset + 1],
                chunk.code[offset + 2]
            )
        }

        Opcode::ImportFrom => {
            let count = chunk.code[offset + 1] as usize;
            let mut line = format!("{:04}  {:?} {}:", offset, opcode, count);
            for i in 0..count {
                write!(line, " {}", chunk.code[offset + 2 + i]).unwrap();
            }
            line
        }

        // Everything else is operand-free
        _ => format!("{:04}  {:?}", offset, opcode),
    }
}

fn constant_display(chunk: &Chunk, index: usize) -> String {
    match chunk.constants.get(index) {
        Some(value) => value.to_string(),
        None => "<out of range>".to_string(),
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    ((chunk.code[offset] as u16) << 8) | chunk.code[offset + 1] as u16
}
