//! End-to-end tests for the `recall` binary, run fully offline.

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

fn recall(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("recall").unwrap();
    cmd.env_remove("RECALL_ENDPOINT")
        .env_remove("RECALL_TOKEN")
        .env_remove("RECALL_OWNER")
        .env_remove("RECALL_DB")
        .env_remove("RECALL_TEST_DB")
        .env_remove("RUST_LOG")
        .env("HOME", dir.path())
        .env("RECALL_CONFIG", dir.path().join("config.json"))
        .arg("--db")
        .arg(dir.path().join("recall.db"))
        .args(["--owner", "owner_1", "--offline", "--json"]);
    cmd
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_commands_require_init() {
    let dir = TempDir::new().unwrap();
    recall(&dir).arg("due").assert().code(2);
}

#[test]
fn test_offline_add_review_and_status() {
    let dir = TempDir::new().unwrap();
    recall(&dir).arg("init").assert().success();

    let added = json_stdout(recall(&dir).args([
        "add",
        "jn 3:16",
        "--text",
        "For God so loved the world",
    ]));
    assert_eq!(added["action"], "manual");
    assert_eq!(added["item"]["canonical_reference"], "John 3:16");
    assert_eq!(added["item"]["verified"], false);

    let due = json_stdout(recall(&dir).arg("due"));
    assert_eq!(due.as_array().unwrap().len(), 1);

    let review = json_stdout(recall(&dir).args(["review", "John 3:16"]));
    assert_eq!(review["event"]["succeeded"], true);
    assert_eq!(review["progress"]["current_streak"], 1);

    let status = json_stdout(recall(&dir).arg("status"));
    assert_eq!(status["owner_id"], "owner_1");
    assert_eq!(status["counts"]["active"], 1);
    assert_eq!(status["counts"]["review_events"], 1);
}

#[test]
fn test_offline_add_without_text_fails() {
    let dir = TempDir::new().unwrap();
    recall(&dir).arg("init").assert().success();

    recall(&dir).args(["add", "Romans 8:28"]).assert().code(4);
}

#[test]
fn test_duplicate_add_is_rejected() {
    let dir = TempDir::new().unwrap();
    recall(&dir).arg("init").assert().success();

    recall(&dir)
        .args(["add", "Psalm 23:1", "--text", "The Lord is my shepherd"])
        .assert()
        .success();
    recall(&dir)
        .args(["add", "psalm 23:1", "--text", "The Lord is my shepherd"])
        .assert()
        .code(5);
}
