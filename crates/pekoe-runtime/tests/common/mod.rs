//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::rc::Rc;

use pekoe_runtime::bytecode::{validate, Chunk, Opcode};
use pekoe_runtime::compiler;
use pekoe_runtime::diagnostic::Diagnostic;
use pekoe_runtime::value::{Function, Module};
use pekoe_runtime::vm::Vm;

/// Compile `source` in `vm`, validating every produced chunk
pub fn compile_in(vm: &mut Vm, source: &str) -> Rc<Function> {
    let module = Module::new("scratch");
    let function = compiler::compile(vm, module, source).unwrap_or_else(|errors| {
        let rendered: Vec<String> = errors.iter().map(Diagnostic::to_human_string).collect();
        panic!("compilation failed:\n{}", rendered.join("\n"));
    });
    if let Err(errors) = validate(&function) {
        panic!("invalid bytecode: {:?}", errors);
    }
    function
}

/// Compile `source` in a fresh script-mode VM
pub fn compile_src(source: &str) -> Rc<Function> {
    compile_in(&mut Vm::new(), source)
}

/// Compile `source` expecting failure; returns the diagnostics
pub fn compile_err(source: &str) -> Vec<Diagnostic> {
    let mut vm = Vm::new();
    let module = Module::new("scratch");
    match compiler::compile(&mut vm, module, source) {
        Ok(_) => panic!("expected compilation of {:?} to fail", source),
        Err(errors) => errors,
    }
}

/// The opcode sequence of a chunk, operands skipped
pub fn opcodes(chunk: &Chunk) -> Vec<Opcode> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < chunk.code.len() {
        out.push(Opcode::try_from(chunk.code[offset]).expect("undecodable byte"));
        offset += chunk.instruction_len(offset);
    }
    out
}

/// Count occurrences of `op` in a chunk
pub fn count_op(chunk: &Chunk, op: Opcode) -> usize {
    opcodes(chunk).into_iter().filter(|&o| o == op).count()
}

/// Byte offset of the first occurrence of `op`, walking instructions
pub fn find_op(chunk: &Chunk, op: Opcode) -> Option<usize> {
    let mut offset = 0;
    while offset < chunk.code.len() {
        if chunk.code[offset] == op as u8 {
            return Some(offset);
        }
        offset += chunk.instruction_len(offset);
    }
    None
}

/// The first function constant of a chunk
pub fn first_function(chunk: &Chunk) -> Rc<Function> {
    chunk
        .constants
        .iter()
        .find_map(|constant| constant.as_function().cloned())
        .expect("chunk has no function constant")
}
