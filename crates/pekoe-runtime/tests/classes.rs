//! Class compilation tests: declarations, initializers, constructor
//! field parameters, superclasses and internal dispatch

mod common;

use common::{compile_src, count_op, find_op, first_function, opcodes};
use pekoe_runtime::bytecode::Opcode;
use pekoe_runtime::value::FunctionKind;
use pretty_assertions::assert_eq;

#[test]
fn class_declaration_emits_class_and_method() {
    let function = compile_src("class A { init(var x) {} }");

    let class_offset = find_op(&function.chunk, Opcode::Class).unwrap();
    // Class kind byte, then the name constant.
    assert_eq!(function.chunk.code[class_offset + 1], 0);
    assert_eq!(function.chunk.code[class_offset + 2], 0);
    assert_eq!(
        function.chunk.constants[0].as_string().unwrap().as_ref(),
        "A"
    );

    assert_eq!(count_op(&function.chunk, Opcode::Method), 1);
    assert_eq!(count_op(&function.chunk, Opcode::DefineModule), 1);
}

#[test]
fn constructor_var_parameter_is_recorded_as_property() {
    let function = compile_src("class A { init(var x) {} }");

    let init = first_function(&function.chunk);
    assert_eq!(init.kind, FunctionKind::Initializer);
    assert_eq!(init.arity, 1);
    assert_eq!(init.property_count, 1);

    // Initializers implicitly return `this` (slot 0).
    assert_eq!(
        init.chunk.code,
        vec![Opcode::GetLocal as u8, 0, Opcode::Return as u8]
    );
}

#[test]
fn subclass_binds_super_and_ends_class() {
    let function = compile_src(
        "class A { init(var x) {} } class B < A { init() { super.init(); } }",
    );

    assert_eq!(count_op(&function.chunk, Opcode::Subclass), 1);
    assert_eq!(count_op(&function.chunk, Opcode::EndClass), 1);
    // The scoped `super` local is captured by B.init and closed at the
    // end of the class body.
    assert_eq!(count_op(&function.chunk, Opcode::CloseUpvalue), 1);

    // B.init: receiver, captured superclass, then the super call.
    let b_init = function
        .chunk
        .constants
        .iter()
        .filter_map(|constant| constant.as_function())
        .find(|f| f.kind == FunctionKind::Initializer && f.upvalue_count == 1)
        .expect("B.init not found");

    assert_eq!(
        b_init.chunk.code,
        vec![
            Opcode::GetLocal as u8,
            0,
            Opcode::GetUpvalue as u8,
            0,
            Opcode::Super as u8,
            0,
            0,
            0,
            Opcode::Pop as u8,
            Opcode::GetLocal as u8,
            0,
            Opcode::Return as u8,
        ]
    );
}

#[test]
fn super_property_access_uses_get_super() {
    let function = compile_src(
        "class A { m() {} } class B < A { m() { return super.m; } }",
    );

    let b_m = function
        .chunk
        .constants
        .iter()
        .filter_map(|constant| constant.as_function())
        .find(|f| f.upvalue_count == 1)
        .expect("B.m not found");
    assert!(opcodes(&b_m.chunk).contains(&Opcode::GetSuper));
}

#[test]
fn class_variable_emits_set_class_var() {
    let function = compile_src("class A { var count = 0; init() {} }");

    let offset = find_op(&function.chunk, Opcode::SetClassVar).unwrap();
    // Name constant then the private flag.
    let name_index = function.chunk.code[offset + 1] as usize;
    assert_eq!(
        function.chunk.constants[name_index]
            .as_string()
            .unwrap()
            .as_ref(),
        "count"
    );
    assert_eq!(function.chunk.code[offset + 2], 0);
}

#[test]
fn method_call_through_this_dispatches_internally() {
    let function = compile_src("class A { m() { this.n(); } }");

    let m = first_function(&function.chunk);
    assert!(opcodes(&m.chunk).contains(&Opcode::InvokeInternal));
    assert!(!opcodes(&m.chunk).contains(&Opcode::Invoke));
}

#[test]
fn method_call_through_class_name_dispatches_internally() {
    let function = compile_src("class A { m() { A.helper(); } }");

    let m = first_function(&function.chunk);
    assert!(opcodes(&m.chunk).contains(&Opcode::InvokeInternal));
}

#[test]
fn external_method_call_dispatches_publicly() {
    let function = compile_src("o.m(1);");

    let offset = find_op(&function.chunk, Opcode::Invoke).unwrap();
    assert_eq!(function.chunk.code[offset + 1], 1); // arg count
    assert_eq!(function.chunk.code[offset + 3], 0); // unpack flag
    assert!(!opcodes(&function.chunk).contains(&Opcode::InvokeInternal));
}

#[test]
fn this_property_assignment_is_an_ordinary_property_write() {
    let function = compile_src("class A { init(v) { this.v = v; } }");

    let init = first_function(&function.chunk);
    assert_eq!(
        opcodes(&init.chunk),
        vec![
            Opcode::GetLocal,
            Opcode::GetLocal,
            Opcode::SetProperty,
            Opcode::Pop,
            Opcode::GetLocal,
            Opcode::Return
        ]
    );
}

#[test]
fn methods_compile_with_this_in_slot_zero() {
    let function = compile_src("class A { m() { return this; } }");

    let m = first_function(&function.chunk);
    assert_eq!(m.kind, FunctionKind::Method);
    assert_eq!(
        m.chunk.code,
        vec![
            Opcode::GetLocal as u8,
            0,
            Opcode::Return as u8,
            Opcode::Nil as u8,
            Opcode::Return as u8,
        ]
    );
}
