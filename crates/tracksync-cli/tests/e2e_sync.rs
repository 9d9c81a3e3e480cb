//! End-to-end runs of the `tsync` binary against a real project directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn tsync_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tsync"));
    cmd.current_dir(dir);
    cmd.env("TRACKSYNC_LOG", "error");
    cmd.env("XDG_CONFIG_HOME", dir.join(".user-config"));
    cmd.env_remove("FORMAT");
    cmd.env_remove("TRACKSYNC_CONFLICT_POLICY");
    cmd
}

fn init_project() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    tsync_cmd(dir.path()).args(["init"]).assert().success();
    dir
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().expect("run tsync");
    assert!(
        output.status.success(),
        "tsync failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON on stdout")
}

fn create_item(dir: &Path, connection: &str, sets: &[&str]) -> u64 {
    let mut args = vec!["create", "--connection", connection, "--json"];
    for set in sets {
        args.push("--set");
        args.push(set);
    }
    let outcome = json_stdout(tsync_cmd(dir).args(&args));
    outcome["created"][0].as_u64().expect("created id")
}

fn state_of(dir: &Path, id: u64) -> String {
    let view = json_stdout(tsync_cmd(dir).args(["show", &id.to_string(), "--json"]));
    view["state"].as_str().expect("state").to_string()
}

fn write_batch(dir: &Path, name: &str, batch: &Value) -> String {
    let path = dir.join(name);
    let bytes = serde_json::to_vec_pretty(batch).expect("encode batch");
    std::fs::write(&path, bytes).expect("write batch");
    path.display().to_string()
}

fn server_item(id: u64, status: &str) -> Value {
    serde_json::json!({
        "op": "updated",
        "id": id,
        "connection": "jira",
        "values": {
            "status": { "type": "text", "value": status },
            "summary": { "type": "text", "value": "Crash on start" }
        }
    })
}

fn batch_of(id: u64, status: &str) -> Value {
    serde_json::json!([server_item(id, status)])
}

#[test]
fn commands_outside_a_project_point_at_init() {
    let dir = tempfile::tempdir().expect("tempdir");
    tsync_cmd(dir.path())
        .args(["list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tsync init"));
}

#[test]
fn init_twice_requires_force() {
    let dir = init_project();
    tsync_cmd(dir.path())
        .args(["init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    tsync_cmd(dir.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn created_item_is_dirty_until_uploaded() {
    let dir = init_project();
    let id = create_item(dir.path(), "jira", &["status=open", "summary=Crash on start"]);
    assert_eq!(state_of(dir.path(), id), "local-dirty");

    let report = json_stdout(tsync_cmd(dir.path()).args(["upload", "--json"]));
    assert_eq!(report["confirmed"], serde_json::json!([id]));
    assert_eq!(state_of(dir.path(), id), "clean");

    tsync_cmd(dir.path())
        .args(["--format", "text", "list", "--state", "clean"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{id} clean jira")));
}

#[test]
fn overlapping_edit_and_download_conflict_until_resolved() {
    let dir = init_project();
    let first = write_batch(dir.path(), "first.json", &batch_of(42, "open"));
    let report = json_stdout(tsync_cmd(dir.path()).args(["download", &first, "--json"]));
    assert_eq!(report["created"], serde_json::json!([42]));
    assert_eq!(state_of(dir.path(), 42), "clean");

    tsync_cmd(dir.path())
        .args(["edit", "42", "--set", "status=closed", "--json"])
        .assert()
        .success();
    assert_eq!(state_of(dir.path(), 42), "local-dirty");

    let second = write_batch(dir.path(), "second.json", &batch_of(42, "reopened"));
    let report = json_stdout(tsync_cmd(dir.path()).args(["download", &second, "--json"]));
    assert_eq!(report["merged"][0][1], "conflicted");
    assert_eq!(state_of(dir.path(), 42), "conflicted");

    tsync_cmd(dir.path())
        .args(["resolve", "42", "--take-server", "--json"])
        .assert()
        .success();
    let view = json_stdout(tsync_cmd(dir.path()).args(["show", "42", "--json"]));
    assert_eq!(view["state"], "clean");
    assert_eq!(view["trunk"]["status"]["value"], "reopened");
}

#[test]
fn policy_override_resolves_conflicts_on_download() {
    let dir = init_project();
    let first = write_batch(dir.path(), "first.json", &batch_of(42, "open"));
    tsync_cmd(dir.path()).args(["download", &first]).assert().success();
    tsync_cmd(dir.path())
        .args(["edit", "42", "--set", "status=closed"])
        .assert()
        .success();

    let second = write_batch(dir.path(), "second.json", &batch_of(42, "reopened"));
    tsync_cmd(dir.path())
        .env("TRACKSYNC_CONFLICT_POLICY", "server-wins")
        .args(["download", &second])
        .assert()
        .success();
    assert_eq!(state_of(dir.path(), 42), "clean");
}

#[test]
fn rejected_upload_keeps_the_item_dirty_and_reports_a_problem() {
    let dir = init_project();
    let id = create_item(dir.path(), "jira", &["status=open"]);

    tsync_cmd(dir.path())
        .args(["upload", &id.to_string(), "--reject", &format!("{id}=workflow forbids it")])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{id} rejected")))
        .stderr(predicate::str::contains("upload rejected: workflow forbids it"));
    assert_eq!(state_of(dir.path(), id), "local-dirty");
}

#[test]
fn offline_upload_fails_and_records_remote_problems() {
    let dir = init_project();
    let id = create_item(dir.path(), "jira", &["status=open"]);

    tsync_cmd(dir.path())
        .args(["upload", "--offline"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("server unreachable"));
    assert_eq!(state_of(dir.path(), id), "local-dirty");
}

#[test]
fn removing_a_master_removes_its_slaves() {
    let dir = init_project();
    let master = create_item(dir.path(), "jira", &["summary=parent"]);
    let outcome = json_stdout(tsync_cmd(dir.path()).args([
        "create",
        "--parent",
        &master.to_string(),
        "--set",
        "body=child",
        "--json",
    ]));
    let slave = outcome["created"][0].as_u64().expect("slave id");

    tsync_cmd(dir.path())
        .args(["remove", &master.to_string()])
        .assert()
        .success();

    let rows = json_stdout(tsync_cmd(dir.path()).args(["list", "--json"]));
    let ids: Vec<u64> = rows
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|row| row["id"].as_u64())
        .collect();
    assert!(!ids.contains(&master));
    assert!(!ids.contains(&slave));
}

#[test]
fn show_unknown_item_reports_its_error_code() {
    let dir = init_project();
    tsync_cmd(dir.path())
        .args(["show", "999", "--json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("\"error_code\": \"E2001\""));
}
