//! Integration tests for the sheetline binary

use std::fs;
use std::path::Path;
use std::process::Command;

const MODELS: &str = r#"{"product": {
    "fields": [{"name": "x", "kind": "integer"}, {"name": "label", "string": "Label", "kind": "char"}],
    "records": [{"x": 3, "label": "a"}, {"x": 5, "label": "b"}]
}}"#;

const ITEMS: &str = r#"
name = "items"

[dataset]
source = "model"
model = "product"

[[formulas]]
name = "x"
type = "integer"

[[formulas]]
name = "y"
type = "float"
expression = "=x*2"
"#;

fn run(dir: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_sheetline"))
        .arg("--db")
        .arg(dir.join("test.db"))
        .arg("--models")
        .arg(dir.join("models.json"))
        // Tests must not depend on a user's ~/.config/sheetline/config.toml.
        .arg("--config")
        .arg(dir.join("config.toml"))
        .args(args)
        .env_remove("SHEETLINE_LOG")
        .output()
        .expect("Failed to execute sheetline");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code().unwrap_or(-1))
}

fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("models.json"), MODELS).unwrap();
    fs::write(dir.path().join("config.toml"), "default_timeout = 10\n").unwrap();
    fs::write(dir.path().join("items.toml"), ITEMS).unwrap();
    dir
}

#[test]
fn test_define_activate_show() {
    let dir = workspace();
    let items = dir.path().join("items.toml");
    let (stdout, stderr, code) = run(dir.path(), &["define", items.to_str().unwrap()]);
    assert_eq!(code, 0, "{}", stderr);
    assert_eq!(stdout.trim(), "Defined items (2 formulas)");

    let (stdout, stderr, code) = run(dir.path(), &["activate", "items"]);
    assert_eq!(code, 0, "{}", stderr);
    assert!(stdout.contains("computed 2 rows"), "{}", stdout);

    let (stdout, _, code) = run(dir.path(), &["show", "items"]);
    assert_eq!(code, 0);
    assert_eq!(
        stdout,
        "| id | x | y |\n|---|---|---|\n| 1 | 3 | 6.0 |\n| 2 | 5 | 10.0 |\n"
    );

    let (stdout, _, code) = run(
        dir.path(),
        &["show", "items", "--filter", r#"[["x", ">", 4]]"#, "--format", "csv"],
    );
    assert_eq!(code, 0);
    assert_eq!(stdout, "id,x,y\n2,5,10.0\n");

    let (stdout, _, code) = run(dir.path(), &["sheets"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "items\tactive\t2\titems");
}

#[test]
fn test_check_reports_forward_reference() {
    let dir = workspace();
    let path = dir.path().join("order.toml");
    fs::write(
        &path,
        "name = \"order\"\n[[formulas]]\nname = \"b\"\ntype = \"integer\"\nexpression = \"=a+1\"\n\
         [[formulas]]\nname = \"a\"\ntype = \"integer\"\n",
    )
    .unwrap();
    let (_, stderr, code) = run(dir.path(), &["define", path.to_str().unwrap()]);
    assert_eq!(code, 0, "{}", stderr);

    let (stdout, _, code) = run(dir.path(), &["check", "order"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("b\twarning"), "{}", stdout);
    assert!(stdout.contains("a\tnone"), "{}", stdout);

    let (_, stderr, code) = run(dir.path(), &["activate", "order"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("prevent activation"), "{}", stderr);
}

#[test]
fn test_migration_loss_needs_acknowledgement() {
    let dir = workspace();
    let items = dir.path().join("items.toml");
    run(dir.path(), &["define", items.to_str().unwrap()]);
    run(dir.path(), &["activate", "items"]);
    let (_, stderr, code) = run(dir.path(), &["draft", "items"]);
    assert_eq!(code, 0, "{}", stderr);

    fs::write(&items, ITEMS.replace("name = \"y\"", "name = \"z\"")).unwrap();
    let (_, stderr, code) = run(dir.path(), &["define", items.to_str().unwrap()]);
    assert_eq!(code, 0, "{}", stderr);

    let (_, stderr, code) = run(dir.path(), &["activate", "items"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("- y"), "{}", stderr);
    assert!(stderr.contains("--accept-loss"), "{}", stderr);

    let (stdout, stderr, code) = run(dir.path(), &["activate", "items", "--accept-loss"]);
    assert_eq!(code, 0, "{}", stderr);
    assert!(stdout.contains("copied 2 rows"), "{}", stdout);

    let (stdout, _, code) = run(dir.path(), &["reap", "--days", "0"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Removed 1 tables"), "{}", stdout);
}

#[test]
fn test_unknown_sheet_fails() {
    let dir = workspace();
    let (_, stderr, code) = run(dir.path(), &["compute", "missing"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("Unknown sheet: missing"), "{}", stderr);
}

#[test]
fn test_script_functions_flag() {
    let dir = workspace();
    let lib = dir.path().join("lib.rhai");
    fs::write(&lib, "fn triple(v) { v * 3 }\n").unwrap();
    let items = dir.path().join("items.toml");
    fs::write(&items, ITEMS.replace("=x*2", "=TRIPLE(x)")).unwrap();

    let (_, stderr, code) = run(dir.path(), &["define", items.to_str().unwrap()]);
    assert_eq!(code, 0, "{}", stderr);
    let (_, stderr, code) = run(dir.path(), &["activate", "items", "-f", lib.to_str().unwrap()]);
    assert_eq!(code, 0, "{}", stderr);

    let (stdout, _, code) = run(dir.path(), &["show", "items", "--format", "csv"]);
    assert_eq!(code, 0);
    assert_eq!(stdout, "id,x,y\n1,3,9.0\n2,5,15.0\n");

    let (stdout, _, code) = run(dir.path(), &["check", "items"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("y\terror"), "{}", stdout);
}

#[test]
fn test_verbose_logs_commands() {
    let dir = workspace();
    let (_, stderr, code) = run(dir.path(), &["init"]);
    assert_eq!(code, 0, "{}", stderr);
    assert!(!stderr.contains("opening session"), "{}", stderr);

    let (_, stderr, code) = run(dir.path(), &["--verbose", "init"]);
    assert_eq!(code, 0, "{}", stderr);
    assert!(stderr.contains("opening session"), "{}", stderr);
}
