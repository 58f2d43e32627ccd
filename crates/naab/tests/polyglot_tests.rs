//! Inline-block scenarios. Tests probe for the foreign runtime on PATH
//! and return early when it is absent, so the suite passes on minimal
//! machines; shell tests rely only on `sh`.

use std::time::Duration;

use naab::polyglot::find_tool;
use naab::{CollectPrint, Config, Exception, Interpreter};
use pretty_assertions::assert_eq;

fn run_with(config: Config, source: &str) -> Result<String, Exception> {
    let writer = CollectPrint::new();
    let handle = writer.handle();
    let mut interp = Interpreter::with_writer(config, Box::new(writer));
    interp.run_source(source, "test.naab")?;
    let out = handle.borrow().clone();
    Ok(out)
}

fn run(source: &str) -> String {
    run_with(Config::default(), source).unwrap()
}

fn sh_available() -> bool {
    find_tool(&["sh"]).is_some()
}

fn python_available() -> bool {
    find_tool(&["python3", "python"]).is_some()
}

#[test]
fn shell_block_returns_the_result_struct() {
    if !sh_available() {
        return;
    }
    let out = run(concat!(
        "let r = <<bash echo hi >>\n",
        "print(r.exit_code)\nprint(r.stdout)\n",
    ));
    // the trailing newline is part of stdout
    assert_eq!(out, "0\nhi\n\n");
}

#[test]
fn shell_struct_has_the_expected_shape() {
    if !sh_available() {
        return;
    }
    let out = run(concat!(
        "let r = <<bash echo oops >>\n",
        "print(typeof(r))\nprint(r.stderr)\n",
    ));
    assert_eq!(out, "ShellResult\n\n");
}

#[test]
fn shell_nonzero_exit_is_data() {
    if !sh_available() {
        return;
    }
    let out = run(concat!(
        "let r = <<bash exit 3 >>\n",
        "print(r.exit_code)\n",
    ));
    assert_eq!(out, "3\n");
}

#[test]
fn shell_pipeline_uses_an_interpreter() {
    if !sh_available() {
        return;
    }
    let out = run(concat!(
        "let r = <<bash printf 'a\\nb\\n' | wc -l >>\n",
        "print(r.exit_code)\n",
    ));
    assert_eq!(out, "0\n");
}

#[test]
fn timeout_kills_the_block() {
    if !sh_available() {
        return;
    }
    let mut config = Config::default();
    config.timeout = Duration::from_millis(300);
    let out = run_with(
        config,
        concat!(
            "try {\n",
            "  let r = <<bash sleep 30 >>\n",
            "  print(r.exit_code)\n",
            "} catch (e) { print(e[\"type\"]) }\n",
        ),
    )
    .unwrap();
    assert_eq!(out, "TimeoutError\n");
}

#[test]
fn unknown_language_tag_raises() {
    let writer = CollectPrint::new();
    let mut interp = Interpreter::with_writer(Config::default(), Box::new(writer));
    let exc = interp
        .run_source("let r = <<fortran PRINT *, 1 >>\n", "test.naab")
        .unwrap_err();
    assert_eq!(exc.kind, "PolyglotError");
}

#[test]
fn python_block_value_and_bindings() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let n = 20\n",
        "let doubled = <<python[n]\nn * 2 + 2\n>>\n",
        "print(doubled)\n",
    ));
    assert_eq!(out, "42\n");
}

#[test]
fn python_structured_return_marshals_to_dict_and_list() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let r = <<python\n{\"xs\": [1, 2.5, None], \"ok\": True}\n>>\n",
        "print(r[\"xs\"])\nprint(r[\"ok\"])\n",
    ));
    assert_eq!(out, "[1, 2.5, null]\ntrue\n");
}

#[test]
fn python_stdout_passes_through_before_the_value() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let r = <<python\nprint(\"side\")\n7\n>>\n",
        "print(r)\n",
    ));
    assert_eq!(out, "side\n7\n");
}

#[test]
fn python_error_becomes_polyglot_error() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "try {\n",
        "  let r = <<python\nraise ValueError(\"nope\")\n>>\n",
        "  print(r)\n",
        "} catch (e) { print(e[\"type\"]) }\n",
    ));
    assert_eq!(out, "PolyglotError\n");
}

#[test]
fn python_return_wrapper_captures_the_return() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let v = <<python\nif 1 > 0:\n    return 10\nreturn 20\n>>\n",
        "print(v)\n",
    ));
    assert_eq!(out, "10\n");
}

#[test]
fn python_unmarshallable_return_is_a_foreign_handle() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let v = <<python\nobject()\n>>\n",
        "print(typeof(v))\n",
    ));
    assert_eq!(out, "foreign\n");
}

#[test]
fn host_function_binding_is_callable_from_python() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "fn double(x: int) -> int { return x * 2 }\n",
        "let r = <<python[double]\ndouble(21)\n>>\n",
        "print(r)\n",
    ));
    assert_eq!(out, "42\n");
}

#[test]
fn host_callback_errors_surface_inside_python() {
    if !python_available() {
        return;
    }
    // wrong arity is rejected by the callback wrapper, which the python
    // side can catch like any of its own exceptions
    let out = run(concat!(
        "fn one(x: int) -> int { return x }\n",
        "let r = <<python[one]\n",
        "try:\n",
        "    one(1, 2)\n",
        "    __v = \"called\"\n",
        "except RuntimeError:\n",
        "    __v = \"rejected\"\n",
        "__v\n",
        ">>\n",
        "print(r)\n",
    ));
    assert_eq!(out, "rejected\n");
}

#[test]
fn function_bindings_are_rejected_for_shell() {
    if !sh_available() {
        return;
    }
    let writer = CollectPrint::new();
    let mut interp = Interpreter::with_writer(Config::default(), Box::new(writer));
    let exc = interp
        .run_source(
            "fn f() -> int { return 1 }\nlet r = <<bash[f] echo hi >>\n",
            "test.naab",
        )
        .unwrap_err();
    assert_eq!(exc.kind, "PolyglotError");
}

#[test]
fn independent_blocks_parallelize_with_sequential_semantics() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let a = <<python\n1 + 1\n>>\n",
        "let b = <<python\n2 + 2\n>>\n",
        "print(a)\nprint(b)\n",
    ));
    assert_eq!(out, "2\n4\n");
}

#[test]
fn dependent_blocks_stay_serial() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let a = <<python\n10\n>>\n",
        "let b = <<python[a]\na * 3\n>>\n",
        "print(b)\n",
    ));
    assert_eq!(out, "30\n");
}

#[test]
fn group_output_is_written_back_in_source_order() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let slow = <<python\nimport time\ntime.sleep(0.4)\nprint(\"slow\")\n\"s\"\n>>\n",
        "let fast = <<python\nprint(\"fast\")\n\"f\"\n>>\n",
        "print(slow + fast)\n",
    ));
    // even though `fast` finishes first, its output and binding commit
    // after `slow`'s
    assert_eq!(out, "slow\nfast\nsf\n");
}

#[test]
fn failing_group_member_reraises_after_all_settle() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let log = \"\"\n",
        "try {\n",
        "  let a = <<python\nraise RuntimeError(\"first\")\n>>\n",
        "  let b = <<python\n2\n>>\n",
        "  log = \"unreachable\"\n",
        "} catch (e) { log = e[\"type\"] }\n",
        "print(log)\n",
    ));
    assert_eq!(out, "PolyglotError\n");
}

#[test]
fn mixed_statements_are_barriers() {
    if !python_available() {
        return;
    }
    let out = run(concat!(
        "let a = <<python\n5\n>>\n",
        "let mid = a + 1\n",
        "let b = <<python[mid]\nmid * 2\n>>\n",
        "print(b)\n",
    ));
    assert_eq!(out, "12\n");
}

#[test]
fn rust_block_compiles_runs_and_caches() {
    if find_tool(&["rustc"]).is_none() {
        return;
    }
    let cache_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.cache_root = Some(cache_dir.path().to_path_buf());
    config.timeout = Duration::from_secs(120);

    let source = concat!(
        "let out = <<rust\nprintln!(\"{}\", 6 * 7);\n>>\n",
        "print(out)\n",
    );
    let first = run_with(config.clone(), source).unwrap();
    assert_eq!(first, "42\n\n");

    // second run must hit the cache and produce the identical value
    let second = run_with(config, source).unwrap();
    assert_eq!(second, first);
    let lang_dir = cache_dir.path().join("rust");
    assert!(lang_dir.join("metadata.json").is_file());
}
