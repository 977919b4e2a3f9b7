//! Function declaration tests: parameters, defaults, spreads, arity
//! metadata and returns

mod common;

use common::{compile_src, first_function, opcodes};
use pekoe_runtime::bytecode::Opcode;
use pekoe_runtime::value::FunctionKind;
use pretty_assertions::assert_eq;

#[test]
fn function_declaration_defines_module_binding() {
    let function = compile_src("def f() {}");

    assert_eq!(
        opcodes(&function.chunk),
        vec![
            Opcode::Closure,
            Opcode::DefineModule,
            Opcode::Nil,
            Opcode::Return
        ]
    );

    let f = first_function(&function.chunk);
    assert_eq!(f.kind, FunctionKind::Function);
    assert_eq!(f.name.as_deref(), Some("f"));
    assert_eq!(f.arity, 0);
}

#[test]
fn parameters_occupy_local_slots() {
    let function = compile_src("def add(a, b) { return a + b; }");

    let add = first_function(&function.chunk);
    assert_eq!(add.arity, 2);
    assert_eq!(
        add.chunk.code,
        vec![
            Opcode::GetLocal as u8,
            1,
            Opcode::GetLocal as u8,
            2,
            Opcode::Add as u8,
            Opcode::Return as u8,
            Opcode::Nil as u8,
            Opcode::Return as u8,
        ]
    );
}

#[test]
fn optional_parameters_emit_define_optional() {
    let function = compile_src("def f(a, b = 1) {}");

    let f = first_function(&function.chunk);
    assert_eq!(f.arity, 1);
    assert_eq!(f.arity_optional, 1);

    // Parameter names occupy pool slots 0 and 1; the default value is
    // pooled after them and its expression runs at entry, then the
    // arity shape.
    assert_eq!(
        f.chunk.code,
        vec![
            Opcode::Constant as u8,
            2,
            Opcode::DefineOptional as u8,
            1,
            1,
            Opcode::Nil as u8,
            Opcode::Return as u8,
        ]
    );
}

#[test]
fn spread_parameter_marks_variadic() {
    let function = compile_src("def f(a, ...rest) {}");

    let f = first_function(&function.chunk);
    assert!(f.is_variadic);
    assert_eq!(f.arity, 2);
}

#[test]
fn implicit_return_is_nil() {
    let function = compile_src("def f() { 1; }");
    let f = first_function(&function.chunk);
    assert_eq!(
        opcodes(&f.chunk),
        vec![Opcode::Constant, Opcode::Pop, Opcode::Nil, Opcode::Return]
    );
}

#[test]
fn bare_return_emits_nil() {
    let function = compile_src("def f() { return; }");
    let f = first_function(&function.chunk);
    assert_eq!(
        opcodes(&f.chunk),
        vec![Opcode::Nil, Opcode::Return, Opcode::Nil, Opcode::Return]
    );
}

#[test]
fn local_function_declaration_uses_slots() {
    let function = compile_src("def outer() { def inner() {} inner(); }");

    let outer = first_function(&function.chunk);
    let ops = opcodes(&outer.chunk);
    assert_eq!(ops[0], Opcode::Closure);
    assert!(ops.contains(&Opcode::GetLocal));
    assert!(ops.contains(&Opcode::Call));
}

#[test]
fn max_locals_tracks_high_water_mark() {
    let function = compile_src("def f(a, b, c) { var d = 1; }");
    let f = first_function(&function.chunk);
    // this-slot placeholder + three parameters + one local.
    assert_eq!(f.max_locals, 5);
}
