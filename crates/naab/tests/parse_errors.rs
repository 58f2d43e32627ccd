//! Parser-facing failures and the stable report format.

use naab::report::render_report;
use naab::{check_source, parse_source, CollectPrint, Config, Interpreter};

#[test]
fn syntax_error_carries_location() {
    let err = parse_source("let x = \n", "bad.naab").unwrap_err();
    assert_eq!(err.kind, "ParseError");
    let loc = err.location.unwrap();
    assert_eq!(loc.file, "bad.naab");
    assert_eq!(loc.line, 1);
}

#[test]
fn unterminated_block_is_reported() {
    let err = parse_source("if true {\nprint(1)\n", "bad.naab").unwrap_err();
    assert_eq!(err.kind, "ParseError");
    assert!(err.message.contains("unclosed block"));
}

#[test]
fn unterminated_polyglot_is_reported() {
    let err = parse_source("let r = <<python\nprint(1)\n", "bad.naab").unwrap_err();
    assert!(err.message.contains(">>"));
}

#[test]
fn check_accepts_valid_programs() {
    check_source(
        "fn f() -> int { for i in 1..3 { break }\n return 0 }\n",
        "ok.naab",
    )
    .unwrap();
}

#[test]
fn check_rejects_stray_control_flow() {
    assert!(check_source("break\n", "bad.naab").is_err());
    assert!(check_source("continue\n", "bad.naab").is_err());
    assert!(check_source("return 1\n", "bad.naab").is_err());
    assert!(check_source("while true { break }\nreturn 1\n", "bad.naab").is_err());
}

#[test]
fn check_rejects_duplicate_parameters() {
    let err = check_source("fn f(a: int, a: int) -> int { return a }\n", "bad.naab")
        .unwrap_err();
    assert!(err.message.contains("duplicate parameter"));
}

#[test]
fn runtime_error_report_has_the_stable_shape() {
    let source = "let z = 1\nlet y = zz + 1\n";
    let writer = CollectPrint::new();
    let mut interp = Interpreter::with_writer(Config::default(), Box::new(writer));
    let exc = interp.run_source(source, "main.naab").unwrap_err();
    let report = render_report(&exc, Some(source), false);
    let lines: Vec<&str> = report.lines().collect();
    assert!(lines[0].starts_with("error: NameError:"));
    assert_eq!(lines[1], "  --> main.naab:2:9");
    assert!(lines[3].contains("let z = 1"));
    assert!(lines[4].contains("let y = zz + 1"));
    assert!(lines[5].contains('^'));
    assert!(lines[6].starts_with("help: did you mean"));
}

#[test]
fn color_can_be_disabled() {
    let source = "print(nope)\n";
    let writer = CollectPrint::new();
    let mut interp = Interpreter::with_writer(Config::default(), Box::new(writer));
    let exc = interp.run_source(source, "main.naab").unwrap_err();
    let plain = render_report(&exc, Some(source), false);
    assert!(!plain.contains('\u{1b}'), "no ANSI escapes when disabled");
    let colored = render_report(&exc, Some(source), true);
    assert!(colored.contains('\u{1b}'));
}
