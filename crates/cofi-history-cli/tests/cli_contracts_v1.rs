#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use cofi_history_core::{RecipeId, RecipeReference};
use cofi_history_store_sqlite::seed_minimal_recipe;
use jsonschema::JSONSchema;
use rusqlite::Connection;
use serde_json::Value;

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cofi-history"))
}

fn repo_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(relative)
}

fn run(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run cofi-history {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn assert_matches_contract(schema_file: &str, value: &Value) {
    let path = repo_path(&format!("contracts/history/v1/schemas/{schema_file}"));
    let body = match std::fs::read_to_string(&path) {
        Ok(value) => value,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    };
    let schema: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("failed to parse {}: {err}", path.display()),
    };
    let compiled = match JSONSchema::compile(&schema) {
        Ok(value) => value,
        Err(err) => panic!("failed to compile {}: {err}", path.display()),
    };
    if let Err(errors) = compiled.validate(value) {
        let messages = errors.map(|err| err.to_string()).collect::<Vec<_>>();
        panic!("{schema_file} rejected output:\n{}", messages.join("\n"));
    };
}

fn temp_dir() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(value) => value,
        Err(err) => panic!("failed to create temp dir: {err}"),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(binary_path())
        .args(["history", "--help"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["log", "show", "list", "delete", "stats"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn log_then_show_returns_the_same_record() {
    let dir = temp_dir();
    let db = dir.path().join("history.sqlite3");

    let logged = run(
        &db,
        &[
            "history",
            "log",
            "--recipe-id",
            "42",
            "--brewed-at",
            "2024-01-15T08:30:00",
            "--beans-used",
            "18.5",
            "--notes",
            "extra bloom",
        ],
    );
    assert_success(&logged);
    let logged = stdout_json(&logged);
    assert_matches_contract("brew-history-record.schema.json", &logged);
    assert_eq!(logged["brew_date"], serde_json::json!("2024-01-15T08:30:00Z"));

    let id = match logged["id"].as_i64() {
        Some(value) => value.to_string(),
        None => panic!("logged record must carry an id: {logged}"),
    };

    let shown = run(&db, &["history", "show", "--id", &id]);
    assert_success(&shown);
    assert_eq!(stdout_json(&shown), logged);

    let listed = run(&db, &["history", "list", "--recipe-id", "42"]);
    assert_success(&listed);
    assert_eq!(stdout_json(&listed), serde_json::json!([logged]));
}

#[test]
fn show_missing_record_exits_non_zero() {
    let dir = temp_dir();
    let db = dir.path().join("history.sqlite3");

    let output = run(&db, &["history", "show", "--id", "404"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("brew history record 404 not found"),
        "stderr={stderr}"
    );
}

#[test]
fn schema_show_output_matches_contract() {
    let dir = temp_dir();
    let db = dir.path().join("history.sqlite3");
    let mapping = repo_path("contracts/history/v1/fixtures/history-schema.sample.json");
    let mapping_arg = mapping.to_string_lossy().to_string();

    let output = run(&db, &["--schema", &mapping_arg, "schema", "show"]);
    assert_success(&output);
    let value = stdout_json(&output);

    assert_matches_contract("history-schema-show.schema.json", &value);
    assert_eq!(value["schema"]["recipe_reference"]["table"], "recipe");
}

#[test]
fn recipe_reference_mapping_rejects_unknown_recipe() {
    let dir = temp_dir();
    let db = dir.path().join("history.sqlite3");
    let mapping = repo_path("contracts/history/v1/fixtures/history-schema.sample.json");
    let mapping_arg = mapping.to_string_lossy().to_string();

    let conn = match Connection::open(&db) {
        Ok(value) => value,
        Err(err) => panic!("failed to open seed connection: {err}"),
    };
    let reference = RecipeReference {
        table: "recipe".to_string(),
        column: "id".to_string(),
    };
    if let Err(err) = seed_minimal_recipe(&conn, &reference, RecipeId(42)) {
        panic!("failed to seed recipe: {err}");
    }
    drop(conn);

    let known = run(
        &db,
        &[
            "--schema",
            &mapping_arg,
            "history",
            "log",
            "--recipe-id",
            "42",
            "--beans-used",
            "16",
        ],
    );
    assert_success(&known);

    let orphan = run(
        &db,
        &[
            "--schema",
            &mapping_arg,
            "history",
            "log",
            "--recipe-id",
            "7",
            "--beans-used",
            "16",
        ],
    );
    assert!(!orphan.status.success());
    let stderr = String::from_utf8_lossy(&orphan.stderr);
    assert!(
        stderr.contains("FOREIGN KEY constraint failed"),
        "stderr={stderr}"
    );
}

#[test]
fn stats_output_matches_contract_and_lists_unused_recipes() {
    let dir = temp_dir();
    let db = dir.path().join("history.sqlite3");
    let mapping = repo_path("contracts/history/v1/fixtures/history-schema.sample.json");
    let mapping_arg = mapping.to_string_lossy().to_string();

    let conn = match Connection::open(&db) {
        Ok(value) => value,
        Err(err) => panic!("failed to open seed connection: {err}"),
    };
    let reference = RecipeReference {
        table: "recipe".to_string(),
        column: "id".to_string(),
    };
    for recipe in [3, 7, 42] {
        if let Err(err) = seed_minimal_recipe(&conn, &reference, RecipeId(recipe)) {
            panic!("failed to seed recipe {recipe}: {err}");
        }
    }
    drop(conn);

    for recipe in ["42", "7", "42"] {
        let logged = run(
            &db,
            &[
                "--schema",
                &mapping_arg,
                "history",
                "log",
                "--recipe-id",
                recipe,
                "--beans-used",
                "18",
            ],
        );
        assert_success(&logged);
    }

    let output = run(&db, &["--schema", &mapping_arg, "history", "stats"]);
    assert_success(&output);
    let value = stdout_json(&output);

    assert_matches_contract("history-stats.schema.json", &value);
    assert_eq!(value["total_brews"], serde_json::json!(3));
    assert_eq!(value["recipes"][0]["recipe_id"], serde_json::json!(42));
    assert_eq!(value["recipes"][0]["brew_count"], serde_json::json!(2));
    assert_eq!(value["frequent_recipes"], serde_json::json!([42, 7]));
    assert_eq!(value["unused_recipes"], serde_json::json!([3]));
}
