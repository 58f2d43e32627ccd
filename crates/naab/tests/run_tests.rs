//! End-to-end host-language scenarios driven through the public API with
//! a collecting print writer.

use naab::{CollectPrint, Config, Exception, Interpreter};
use pretty_assertions::assert_eq;

fn run(source: &str) -> String {
    let writer = CollectPrint::new();
    let handle = writer.handle();
    let mut interp = Interpreter::with_writer(Config::default(), Box::new(writer));
    interp.run_source(source, "test.naab").unwrap();
    let out = handle.borrow().clone();
    out
}

fn run_err(source: &str) -> Exception {
    let writer = CollectPrint::new();
    let mut interp = Interpreter::with_writer(Config::default(), Box::new(writer));
    interp.run_source(source, "test.naab").unwrap_err()
}

#[test]
fn arithmetic_and_control_flow() {
    let out = run("let x = 0\nfor i in 1..=5 { x = x + i }\nprint(x)\n");
    assert_eq!(out, "15\n");
}

#[test]
fn exclusive_range_stops_early() {
    let out = run("let x = 0\nfor i in 1..5 { x = x + i }\nprint(x)\n");
    assert_eq!(out, "10\n");
}

#[test]
fn struct_with_nullable_field_and_type_enforcement() {
    let out = run(concat!(
        "struct P { id: int, note: string? }\n",
        "let a = new P { id: 1, note: null }\n",
        "let b = new P { id: 2, note: \"hi\" }\n",
        "print(a.note)\nprint(b.note)\n",
    ));
    assert_eq!(out, "null\nhi\n");

    let exc = run_err(concat!(
        "struct P { id: int, note: string? }\n",
        "let a = new P { id: 1, note: null }\n",
        "a.note = 5\n",
    ));
    assert_eq!(exc.kind, "TypeError");
}

#[test]
fn try_catch_finally_ordering() {
    let out = run(concat!(
        "let log = \"\"\n",
        "try { log = log + \"A\"\n throw \"boom\" }\n",
        "catch (e) { log = log + \"B:\" + e[\"message\"] }\n",
        "finally { log = log + \"C\" }\n",
        "print(log)\n",
    ));
    assert_eq!(out, "AB:boomC\n");
}

#[test]
fn pipeline_keeps_the_enclosing_return() {
    let out = run(concat!(
        "fn double(x: int) -> int { return x * 2 }\n",
        "fn caller() -> int { let y = 3 |> double()\n return y + 1 }\n",
        "print(caller())\n",
    ));
    assert_eq!(out, "7\n");
}

#[test]
fn pipeline_identity_with_extra_args() {
    let out = run(concat!(
        "fn add3(a: int, b: int, c: int) -> int { return a + b + c }\n",
        "print(1 |> add3(2, 3))\n",
        "print(add3(1, 2, 3))\n",
    ));
    assert_eq!(out, "6\n6\n");
}

#[test]
fn function_locals_are_invisible_to_the_caller() {
    let out = run(concat!(
        "fn f() -> int { let hidden = 1\n return hidden }\n",
        "f()\n",
        "try { print(hidden) } catch (e) { print(e[\"type\"]) }\n",
    ));
    assert_eq!(out, "NameError\n");
}

#[test]
fn block_scope_pops_on_exception() {
    let out = run(concat!(
        "let seen = \"\"\n",
        "try {\n",
        "  let inner = \"x\"\n",
        "  throw \"stop\"\n",
        "} catch (e) { seen = e[\"message\"] }\n",
        "try { print(inner) } catch (e) { print(e[\"type\"]) }\n",
        "print(seen)\n",
    ));
    assert_eq!(out, "NameError\nstop\n");
}

#[test]
fn closures_share_their_defining_scope() {
    let out = run(concat!(
        "fn make() -> any {\n",
        "  let count = [0]\n",
        "  return fn () -> int { count[0] = count[0] + 1\n return count[0] }\n",
        "}\n",
        "let bump = make()\n",
        "print(bump())\nprint(bump())\nprint(bump())\n",
    ));
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let out = run(concat!(
        "let total = 0\nlet i = 0\n",
        "while true {\n",
        "  i = i + 1\n",
        "  if i > 10 { break }\n",
        "  if i % 2 == 0 { continue }\n",
        "  total = total + i\n",
        "}\n",
        "print(total)\n",
    ));
    assert_eq!(out, "25\n");
}

#[test]
fn union_and_nullable_declarations() {
    let out = run(concat!(
        "let v: int | string = 1\n",
        "let w: int | string = \"x\"\n",
        "let n: float? = null\n",
        "print(v)\nprint(w)\nprint(n)\n",
    ));
    assert_eq!(out, "1\nx\nnull\n");
    let exc = run_err("let v: int | string = 1.5\n");
    assert_eq!(exc.kind, "TypeError");
}

#[test]
fn float_widening_on_declaration_and_params() {
    let out = run(concat!(
        "let f: float = 1\n",
        "print(f)\n",
        "fn half(x: float) -> float { return x / 2 }\n",
        "print(half(5))\n",
    ));
    assert_eq!(out, "1.0\n2.5\n");
}

#[test]
fn generic_struct_specialization() {
    let out = run(concat!(
        "struct Box<T> { v: T }\n",
        "let a = new Box<int> { v: 1 }\n",
        "let b = new Box<string> { v: \"s\" }\n",
        "print(typeof(a))\nprint(typeof(b))\nprint(a.v + 1)\n",
    ));
    assert_eq!(out, "Box_int\nBox_string\n2\n");
    let exc = run_err("struct Box<T> { v: T }\nlet bad = new Box<int> { v: \"s\" }\n");
    assert_eq!(exc.kind, "TypeError");
}

#[test]
fn generic_function_inference_validates_returns() {
    let out = run(concat!(
        "fn id<T>(x: T) -> T { return x }\n",
        "print(id(3))\nprint(id(\"s\"))\n",
    ));
    assert_eq!(out, "3\ns\n");
}

#[test]
fn struct_field_defaults() {
    let out = run(concat!(
        "struct Conn { host: string, port: int = 8080 }\n",
        "let c = new Conn { host: \"db\" }\n",
        "print(c.port)\n",
    ));
    assert_eq!(out, "8080\n");
}

#[test]
fn dict_and_list_operations() {
    let out = run(concat!(
        "let d = {\"a\": 1, \"b\": 2}\n",
        "d[\"c\"] = 3\n",
        "let keys = \"\"\n",
        "for k in d { keys = keys + k }\n",
        "print(keys)\n",
        "let xs = [1, 2] + [3]\n",
        "xs[0] = 9\n",
        "print(xs)\n",
        "print(\"hello\"[1])\n",
    ));
    assert_eq!(out, "abc\n[9, 2, 3]\ne\n", "insertion order preserved");
}

#[test]
fn list_aliasing_is_observable() {
    let out = run(concat!(
        "let a = [1, 2]\n",
        "let b = a\n",
        "b[0] = 7\n",
        "print(a)\n",
    ));
    assert_eq!(out, "[7, 2]\n");
}

#[test]
fn subscript_errors() {
    assert_eq!(run_err("let xs = [1]\nprint(xs[5])\n").kind, "RangeError");
    assert_eq!(run_err("let d = {\"a\": 1}\nprint(d[\"b\"])\n").kind, "KeyError");
    assert_eq!(run_err("print(1 / 0)\n").kind, "DivisionByZero");
    assert_eq!(run_err("print(1.0 / 0.0)\n").kind, "DivisionByZero");
    assert_eq!(run_err("fn f(a: int) -> int { return a }\nf(1, 2)\n").kind, "ArityError");
    assert_eq!(run_err("let r = 1..\"x\"\n").kind, "RangeError");
}

#[test]
fn thrown_error_round_trips_unchanged() {
    let out = run(concat!(
        "try { throw \"x\" } catch (e) {\n",
        "  try { throw e } catch (e2) {\n",
        "    print(e2[\"message\"] == e[\"message\"])\n",
        "    print(e2[\"type\"] == e[\"type\"])\n",
        "    print(e2[\"stack\"] == e[\"stack\"])\n",
        "  }\n",
        "}\n",
    ));
    assert_eq!(out, "true\ntrue\ntrue\n");
}

#[test]
fn throw_in_finally_supersedes() {
    let out = run(concat!(
        "try {\n",
        "  try { throw \"first\" } finally { throw \"second\" }\n",
        "} catch (e) { print(e[\"message\"]) }\n",
    ));
    assert_eq!(out, "second\n");
}

#[test]
fn finally_runs_on_return_paths() {
    let out = run(concat!(
        "let log = [\"\"]\n",
        "fn f() -> int {\n",
        "  try { return 1 } finally { log[0] = log[0] + \"F\" }\n",
        "}\n",
        "print(f())\nprint(log[0])\n",
    ));
    assert_eq!(out, "1\nF\n");
}

#[test]
fn gc_collects_unreachable_cycles() {
    let out = run(concat!(
        "let a = [1, 2]\n",
        "let b = [a]\n",
        "a[0] = b\n",
        "a = null\n",
        "b = null\n",
        "print(gc_collect())\n",
    ));
    assert_eq!(out, "2\n", "exactly the two cycle members are freed");
}

#[test]
fn gc_does_not_collect_reachable_values() {
    let writer = CollectPrint::new();
    let handle = writer.handle();
    let mut interp = Interpreter::with_writer(Config::default(), Box::new(writer));
    interp
        .run_source(
            concat!(
                "let keep = [[1], [2], [3]]\n",
                "gc_collect()\n",
                "print(keep)\n",
            ),
            "test.naab",
        )
        .unwrap();
    assert_eq!(handle.borrow().as_str(), "[[1], [2], [3]]\n");
    assert!(interp.heap_stats().collections >= 1);
}

#[test]
fn allocation_threshold_triggers_collection() {
    let mut config = Config::default();
    config.gc_threshold = 50;
    let writer = CollectPrint::new();
    let mut interp = Interpreter::with_writer(config, Box::new(writer));
    interp
        .run_source(
            "let i = 0\nwhile i < 500 { let tmp = [i]\n i = i + 1 }\n",
            "test.naab",
        )
        .unwrap();
    let stats = interp.heap_stats();
    assert!(stats.collections >= 2, "stats: {stats:?}");
    assert!(
        stats.live_objects < 400,
        "loop garbage must not accumulate: {stats:?}"
    );
}

#[test]
fn name_error_carries_a_suggestion() {
    let exc = run_err("let value = 1\nprint(valu)\n");
    assert_eq!(exc.kind, "NameError");
    assert_eq!(exc.help.as_deref(), Some("did you mean `value`?"));
}

#[test]
fn stdlib_module_suggestion() {
    let exc = run_err("print(math.pi)\n");
    assert_eq!(exc.kind, "NameError");
    assert_eq!(
        exc.help.as_deref(),
        Some("`math` is a standard module; add `use math`")
    );
}

#[test]
fn stack_frames_name_call_sites() {
    let exc = run_err(concat!(
        "fn inner() -> int { return 1 / 0 }\n",
        "fn outer() -> int { return inner() }\n",
        "outer()\n",
    ));
    assert_eq!(exc.kind, "DivisionByZero");
    assert!(exc.stack[0].starts_with("at inner (test.naab:"));
    assert!(exc.stack[1].starts_with("at outer (test.naab:"));
    assert!(exc.stack[2].starts_with("at <main> (test.naab:"));
}

#[test]
fn typeof_builtin() {
    let out = run(concat!(
        "print(typeof(1))\nprint(typeof(1.5))\nprint(typeof(\"s\"))\n",
        "print(typeof(null))\nprint(typeof([1]))\nprint(typeof({\"a\": 1}))\n",
    ));
    assert_eq!(out, "int\nfloat\nstring\nnull\nlist\ndict\n");
}

#[test]
fn equality_is_structural_for_containers() {
    let out = run(concat!(
        "print([1, [2]] == [1, [2]])\n",
        "print({\"a\": 1} == {\"a\": 1})\n",
        "print({\"a\": 1} == {\"a\": 2})\n",
        "struct P { x: int }\n",
        "print(new P { x: 1 } == new P { x: 1 })\n",
        "fn f() -> int { return 1 }\n",
        "let g = f\n",
        "print(f == g)\nprint(f == fn () -> int { return 1 })\n",
    ));
    assert_eq!(out, "true\ntrue\nfalse\ntrue\ntrue\nfalse\n");
}

#[test]
fn truthiness_rules() {
    let out = run(concat!(
        "if 0 { print(\"a\") } else { print(\"b\") }\n",
        "if \"\" { print(\"a\") } else { print(\"b\") }\n",
        "if [] { print(\"a\") } else { print(\"b\") }\n",
        "if \"x\" && 1 { print(\"both\") }\n",
        "if null || 2 { print(\"or\") }\n",
    ));
    assert_eq!(out, "b\nb\nb\nboth\nor\n");
}

#[test]
fn return_outside_function_is_reported() {
    let exc = run_err("return 1\n");
    assert_eq!(exc.kind, "UserError");
}

#[test]
fn recursion_depth_is_bounded() {
    let exc = run_err("fn f() -> int { return f() }\nf()\n");
    assert_eq!(exc.kind, "RangeError");
    assert!(exc.message.contains("call depth"));
}

#[test]
fn shadowing_in_nested_blocks() {
    let out = run(concat!(
        "let x = 1\n",
        "{\n  let x = 2\n  print(x)\n}\n",
        "print(x)\n",
    ));
    assert_eq!(out, "2\n1\n");
}
