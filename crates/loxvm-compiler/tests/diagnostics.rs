//! Exercises the compile-error taxonomy end to end: each case should
//! surface a readable, correctly located diagnostic rather than panic.

use loxvm_core::Heap;
use loxvm_compiler::compile;
use pretty_assertions::assert_eq;

fn compile_errors(src: &str) -> Vec<String> {
    let mut heap = Heap::new();
    match compile(src, &mut heap) {
        Ok(_) => panic!("expected a compile error for: {src:?}"),
        Err(e) => e.diagnostics.iter().map(std::string::ToString::to_string).collect(),
    }
}

#[test]
fn unterminated_string_reports_scanner_error() {
    let errors = compile_errors("print \"oops;\n");
    assert!(errors[0].contains("Unterminated string"));
}

#[test]
fn missing_semicolon_reports_error_at_offending_token() {
    let errors = compile_errors("var a = 1\nprint a;");
    assert!(errors[0].contains("Expect ';'"));
}

#[test]
fn duplicate_local_in_same_scope_is_rejected() {
    let errors = compile_errors("{ var a = 1; var a = 2; }");
    assert!(errors[0].contains("Already a variable with this name"));
}

#[test]
fn error_at_end_of_file_uses_the_end_marker() {
    let errors = compile_errors("fun f() {");
    assert!(errors.iter().any(|e| e.contains("Error at end")));
}

#[test]
fn multiple_independent_errors_are_all_reported() {
    let errors = compile_errors("var;\nvar;\n");
    assert_eq!(errors.len(), 2);
    assert!(errors[0].starts_with("[line 1]"));
    assert!(errors[1].starts_with("[line 2]"));
}

#[test]
fn assigning_to_a_non_lvalue_is_rejected() {
    let errors = compile_errors("1 + 2 = 3;");
    assert!(errors[0].contains("Invalid assignment target"));
}

#[test]
fn returning_from_initializer_is_rejected() {
    let errors = compile_errors(
        "class C { init() { return 1; } }",
    );
    assert!(errors[0].contains("Can't return a value from an initializer"));
}
