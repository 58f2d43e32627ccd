//! Module loader scenarios over real files in a temp directory.

use std::fs;
use std::path::Path;

use naab::{CollectPrint, Config, Exception, Interpreter};
use pretty_assertions::assert_eq;

fn run_in(dir: &Path, source: &str) -> Result<String, Exception> {
    let main = dir.join("main.naab");
    fs::write(&main, source).unwrap();
    let writer = CollectPrint::new();
    let handle = writer.handle();
    let mut interp = Interpreter::with_writer(Config::default(), Box::new(writer));
    interp.run_source(source, &main.display().to_string())?;
    let out = handle.borrow().clone();
    Ok(out)
}

#[test]
fn imports_bind_the_leaf_name() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("greet.naab"),
        "export fn hello(name: string) -> string { return \"hi \" + name }\n",
    )
    .unwrap();
    let out = run_in(
        dir.path(),
        "use greet\nprint(greet.hello(\"naab\"))\n",
    )
    .unwrap();
    assert_eq!(out, "hi naab\n");
}

#[test]
fn alias_binding() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("geometry.naab"), "export let pi = 3\n").unwrap();
    let out = run_in(dir.path(), "use geometry as g\nprint(g.pi)\n").unwrap();
    assert_eq!(out, "3\n");
}

#[test]
fn member_import_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("util.naab"),
        "export fn twice(x: int) -> int { return x * 2 }\n",
    )
    .unwrap();
    let out = run_in(dir.path(), "use util.twice\nprint(twice(4))\n").unwrap();
    assert_eq!(out, "8\n");
}

#[test]
fn nested_directory_resolution() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("pkg")).unwrap();
    fs::write(
        dir.path().join("pkg").join("inner.naab"),
        "export let marker = \"nested\"\n",
    )
    .unwrap();
    let out = run_in(dir.path(), "use pkg.inner\nprint(inner.marker)\n").unwrap();
    assert_eq!(out, "nested\n");
}

#[test]
fn module_evaluates_once_and_exports_are_identical() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("counted.naab"),
        concat!(
            "let evals = [0]\n",
            "evals[0] = evals[0] + 1\n",
            "export fn count() -> int { return evals[0] }\n",
        ),
    )
    .unwrap();
    let out = run_in(
        dir.path(),
        concat!(
            "use counted\n",
            "use counted as again\n",
            "print(counted == again)\n",
            "print(counted.count())\n",
        ),
    )
    .unwrap();
    // same exports table (pointer identity), body evaluated exactly once
    assert_eq!(out, "true\n1\n");
}

#[test]
fn exported_closures_capture_module_state() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("tally.naab"),
        concat!(
            "let state = [0]\n",
            "export fn bump() -> int { state[0] = state[0] + 1\n return state[0] }\n",
        ),
    )
    .unwrap();
    let out = run_in(
        dir.path(),
        "use tally\nprint(tally.bump())\nprint(tally.bump())\n",
    )
    .unwrap();
    assert_eq!(out, "1\n2\n");
}

#[test]
fn modules_are_isolated_from_the_importer() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("peek.naab"),
        "export fn look() -> any { return secret }\n",
    )
    .unwrap();
    let out = run_in(
        dir.path(),
        concat!(
            "let secret = 42\n",
            "use peek\n",
            "try { print(peek.look()) } catch (e) { print(e[\"type\"]) }\n",
        ),
    )
    .unwrap();
    assert_eq!(out, "NameError\n");
}

#[test]
fn unexported_names_are_not_visible() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("priv.naab"),
        "let internal = 1\nexport let shared = 2\n",
    )
    .unwrap();
    let out = run_in(
        dir.path(),
        concat!(
            "use priv\n",
            "print(priv.shared)\n",
            "try { print(priv.internal) } catch (e) { print(e[\"type\"]) }\n",
        ),
    )
    .unwrap();
    assert_eq!(out, "2\nNameError\n");
}

#[test]
fn circular_imports_are_detected() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.naab"), "use b\nexport let va = 1\n").unwrap();
    fs::write(dir.path().join("b.naab"), "use a\nexport let vb = 2\n").unwrap();
    let exc = run_in(dir.path(), "use a\n").unwrap_err();
    assert_eq!(exc.kind, "ModuleError");
    assert!(exc.message.contains("circular import"));
    assert!(exc.message.contains("a.naab"), "names the cycle: {}", exc.message);
}

#[test]
fn missing_module_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let exc = run_in(dir.path(), "use ghost.town\n").unwrap_err();
    assert_eq!(exc.kind, "ModuleError");
    assert!(exc.message.contains("ghost.town"));
}

#[test]
fn module_parse_failure_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("broken.naab"), "let = = 1\n").unwrap();
    let exc = run_in(dir.path(), "use broken\n").unwrap_err();
    assert_eq!(exc.kind, "ModuleError");
    assert!(exc.message.contains("broken.naab"));
}

#[test]
fn search_roots_from_config() {
    let lib_dir = tempfile::tempdir().unwrap();
    fs::write(lib_dir.path().join("shared.naab"), "export let v = 9\n").unwrap();
    let mut config = Config::default();
    config.module_paths = vec![lib_dir.path().to_path_buf()];
    let writer = CollectPrint::new();
    let handle = writer.handle();
    let mut interp = Interpreter::with_writer(config, Box::new(writer));
    interp
        .run_source("use shared\nprint(shared.v)\n", "test.naab")
        .unwrap();
    assert_eq!(handle.borrow().as_str(), "9\n");
}

#[test]
fn transitive_imports_evaluate_depth_first() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("base.naab"), "export let origin = \"base\"\n").unwrap();
    fs::write(
        dir.path().join("mid.naab"),
        "use base\nexport fn from() -> string { return base.origin + \"+mid\" }\n",
    )
    .unwrap();
    let out = run_in(dir.path(), "use mid\nprint(mid.from())\n").unwrap();
    assert_eq!(out, "base+mid\n");
}
