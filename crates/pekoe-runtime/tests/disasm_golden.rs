//! Disassembly golden tests

mod common;

use common::{compile_src, first_function};
use pekoe_runtime::bytecode::disassemble;

#[test]
fn empty_module_listing() {
    let function = compile_src("");
    let listing = disassemble(&function.chunk, "top");
    insta::assert_snapshot!(listing.trim_end(), @r"
    == top ==
    === Instructions ===
    0000  Nil
    0001  Return
    ");
}

#[test]
fn module_variable_listing() {
    let function = compile_src("var x = 1;");
    let listing = disassemble(&function.chunk, "top");
    insta::assert_snapshot!(listing.trim_end(), @r#"
    == top ==
    === Constants ===
    0: "x"
    1: 1

    === Instructions ===
    0000  Constant 1 (1)
    0002  DefineModule 0 ("x")
    0004  Nil
    0005  Return
    "#);
}

#[test]
fn if_else_listing() {
    let function = compile_src("if (true) 1; else 2;");
    let listing = disassemble(&function.chunk, "top");
    insta::assert_snapshot!(listing.trim_end(), @r"
    == top ==
    === Constants ===
    0: 1
    1: 2

    === Instructions ===
    0000  True
    0001  JumpIfFalse 7 (to 0011)
    0004  Pop
    0005  Constant 0 (1)
    0007  Pop
    0008  Jump 4 (to 0015)
    0011  Pop
    0012  Constant 1 (2)
    0014  Pop
    0015  Nil
    0016  Return
    ");
}

#[test]
fn function_declaration_listing() {
    let function = compile_src("def f() {}");
    let listing = disassemble(&function.chunk, "top");
    insta::assert_snapshot!(listing.trim_end(), @r#"
    == top ==
    === Constants ===
    0: "f"
    1: <fn f>

    === Instructions ===
    0000  Closure 1 (<fn f>)
    0002  DefineModule 0 ("f")
    0004  Nil
    0005  Return
    "#);

    let f = first_function(&function.chunk);
    let nested = disassemble(&f.chunk, "f");
    insta::assert_snapshot!(nested.trim_end(), @r"
    == f ==
    === Instructions ===
    0000  Nil
    0001  Return
    ");
}
