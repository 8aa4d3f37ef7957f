//! Runs the literal I/O scenarios against `interpret()` end to end, plus
//! the runtime error path and the balanced-stack/GC-stress properties.

use loxvm_core::Heap;
use loxvm_vm::{interpret_with_stdout, InterpretError, VmOptions};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(src: &str) -> (Result<(), InterpretError>, String) {
    run_with_options(src, VmOptions::default())
}

fn run_with_options(src: &str, options: VmOptions) -> (Result<(), InterpretError>, String) {
    let mut heap = Heap::new();
    let buf = SharedBuf::default();
    let result = interpret_with_stdout(src, &mut heap, options, Box::new(buf.clone()));
    let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    (result, output)
}

#[test]
fn arithmetic_and_precedence() {
    let (result, out) = run("print 1 + 2 * 3 - 4 / 2;");
    assert!(result.is_ok());
    assert_eq!(out, "5\n");
}

#[test]
fn globals_and_blocks_shadow_correctly() {
    let (result, out) = run(indoc::indoc! {r#"
        var a = "outer";
        { var a = "inner"; print a; }
        print a;
    "#});
    assert!(result.is_ok());
    assert_eq!(out, "inner\nouter\n");
}

#[test]
fn for_loop_accumulates() {
    let (result, out) = run(indoc::indoc! {"
        var s = 0;
        for (var i = 1; i <= 5; i = i + 1) s = s + i;
        print s;
    "});
    assert!(result.is_ok());
    assert_eq!(out, "15\n");
}

#[test]
fn closures_share_captured_state_across_calls() {
    let (result, out) = run(indoc::indoc! {"
        fun makeCounter() {
          var n = 0;
          fun inc() { n = n + 1; return n; }
          return inc;
        }
        var c = makeCounter();
        print c(); print c(); print c();
    "});
    assert!(result.is_ok());
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn classes_with_init_and_methods() {
    let (result, out) = run(indoc::indoc! {r#"
        class Greeter {
          init(who) { this.who = who; }
          hi() { print "hi " + this.who; }
        }
        Greeter("world").hi();
    "#});
    assert!(result.is_ok());
    assert_eq!(out, "hi world\n");
}

#[test]
fn adding_number_to_string_is_a_runtime_error() {
    let (result, _out) = run("print 1 + \"a\";");
    let err = match result {
        Err(InterpretError::Runtime(e)) => e,
        other => panic!("expected a runtime error, got {other:?}"),
    };
    assert!(err.message.contains("Operands must be two numbers or two strings"));
    assert_eq!(err.stack_trace, vec!["[line 1] in script".to_string()]);
}

#[test]
fn undefined_global_read_is_a_runtime_error() {
    let (result, _out) = run("print nope;");
    assert!(matches!(result, Err(InterpretError::Runtime(_))));
}

#[test]
fn parse_failure_surfaces_as_compile_error_not_runtime() {
    let (result, _out) = run("var;");
    assert!(matches!(result, Err(InterpretError::Compile(_))));
}

#[test]
fn successful_program_leaves_nothing_printed_but_its_own_output() {
    let (result, out) = run("var a = 1; var b = 2; var c = a + b;");
    assert!(result.is_ok());
    assert_eq!(out, "");
}

#[test]
fn gc_stress_mode_does_not_change_program_output() {
    let src = indoc::indoc! {r#"
        class Node { init(v) { this.v = v; } }
        var n = Node("x");
        fun build() {
          var s = "";
          for (var i = 0; i < 50; i = i + 1) s = s + "a";
          return s;
        }
        print build();
        print n.v;
    "#};
    let (result, out) = run_with_options(src, VmOptions { trace: false, stress_gc: true });
    assert!(result.is_ok());
    assert_eq!(out, format!("{}\nx\n", "a".repeat(50)));
}

#[test]
fn recursive_function_runs_to_completion() {
    let (result, out) = run(indoc::indoc! {"
        fun fib(n) {
          if (n < 2) return n;
          return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    "});
    assert!(result.is_ok());
    assert_eq!(out, "55\n");
}

