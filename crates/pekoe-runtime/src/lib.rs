//! Pekoe runtime front-end — the bytecode compiler core
//!
//! This crate turns the source text of a single Pekoe module into an
//! executable function object: a byte-encoded chunk, its constant pool,
//! and closure metadata. Compilation is single-pass — lexing, parsing and
//! emission interleave with no intermediate AST — with local constant
//! folding over just-emitted instructions.
//!
//! The executing VM, the collector and the standard library are external
//! collaborators; this crate exposes the interfaces they rely on (the
//! opcode set and operand widths, the value constructors, the GC root
//! hook) without implementing them.
//!
//! ```
//! use pekoe_runtime::compiler;
//! use pekoe_runtime::value::Module;
//! use pekoe_runtime::vm::Vm;
//!
//! let mut vm = Vm::new();
//! let module = Module::new("example");
//! let function = compiler::compile(&mut vm, module, "var x = 1 + 2;").unwrap();
//! assert!(!function.chunk.code.is_empty());
//! ```

/// Pekoe runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod lexer;
pub mod token;
pub mod value;
pub mod vm;
