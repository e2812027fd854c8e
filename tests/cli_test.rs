//! Integration tests for the tsk commands.

mod common;

use std::fs;
use std::time::Duration;

use common::{TestEnv, tsk_file};
use predicates::prelude::*;
use tskfile::storage::lock::FileLock;
use tskfile::storage::xml::CURRENT_VERSION;

const V20_BODY: &str = r#"<task id="t1" status="0" subject="Plan" prerequisites="t2"><effort id="e1" start="2020-01-01 09:00:00" stop="2020-01-01 10:00:00"/></task>
<task id="t2" status="0" subject="Build"/>
<category id="c1" subject="Work" categorizables="t1"/>
<note id="n1" subject="Ideas"/>"#;

fn v20_file(env: &TestEnv) -> std::path::PathBuf {
    env.write("work.tsk", &tsk_file(20, V20_BODY))
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

// === Info ===

#[test]
fn test_info_json() {
    let env = TestEnv::new();
    v20_file(&env);

    env.tsk()
        .args(["info", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""version":20"#))
        .stdout(predicate::str::contains(format!(
            r#""current_version":{}"#,
            CURRENT_VERSION
        )))
        .stdout(predicate::str::contains(r#""tasks":2"#))
        .stdout(predicate::str::contains(r#""categories":1"#))
        .stdout(predicate::str::contains(r#""efforts":1"#))
        .stdout(predicate::str::contains(r#""locked":false"#));
}

#[test]
fn test_info_human() {
    let env = TestEnv::new();
    v20_file(&env);

    env.tsk()
        .args(["-H", "info", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "Format version: 20 (current is {})",
            CURRENT_VERSION
        )))
        .stdout(predicate::str::contains("Tasks: 2"));
}

#[test]
fn test_info_missing_file_is_an_error() {
    let env = TestEnv::new();

    env.tsk()
        .args(["info", "nowhere.tsk"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains(r#""error""#))
        .stderr(predicate::str::contains("nowhere.tsk"));

    env.tsk()
        .args(["-H", "info", "nowhere.tsk"])
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("Error: "));
}

#[test]
fn test_info_refuses_newer_format() {
    let env = TestEnv::new();
    env.write("future.tsk", &tsk_file(CURRENT_VERSION + 1, ""));

    env.tsk()
        .args(["info", "future.tsk"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("newer than the supported version"));
}

// === Check ===

#[test]
fn test_check_clean_file() {
    let env = TestEnv::new();
    v20_file(&env);

    env.tsk()
        .args(["-H", "check", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK (version 20)"));
}

#[test]
fn test_check_reports_issues_without_failing() {
    let env = TestEnv::new();
    env.write(
        "broken.tsk",
        &tsk_file(
            CURRENT_VERSION,
            r#"<task id="a" priority="high" prerequisites="ghost"/>"#,
        ),
    );

    let output = env.tsk().args(["check", "broken.tsk"]).output().unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["ok"], false);
    let issues = json["issues"].as_array().unwrap();
    assert_eq!(issues.len(), 2);
    assert!(issues.iter().any(|i| i["type"] == "dangling_reference" && i["to"] == "ghost"));
    assert!(issues.iter().any(|i| i["type"] == "malformed_field" && i["field"] == "priority"));
}

// === Upgrade ===

#[test]
fn test_upgrade_rewrites_in_current_format() {
    let env = TestEnv::new();
    let path = v20_file(&env);

    env.tsk()
        .args(["upgrade", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""from_version":20"#))
        .stdout(predicate::str::contains(format!(
            r#""to_version":{}"#,
            CURRENT_VERSION
        )));

    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains(&format!("tskversion=\"{}\"", CURRENT_VERSION)));
    assert!(contents.contains("Plan"));

    env.tsk()
        .args(["-H", "info", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tasks: 2"))
        .stdout(predicate::str::contains("Devices sharing: 0"));
}

#[test]
fn test_upgrade_missing_file_creates_nothing() {
    let env = TestEnv::new();

    env.tsk().args(["upgrade", "new.tsk"]).assert().failure();
    assert!(!env.file("new.tsk").exists());
}

// === Import ===

#[test]
fn test_import_merges_objects() {
    let env = TestEnv::new();
    v20_file(&env);
    env.write(
        "other.tsk",
        &tsk_file(
            CURRENT_VERSION,
            r#"<task id="t2" subject="Build (imported)"/><task id="t9" subject="Extra"/>"#,
        ),
    );

    env.tsk()
        .args(["import", "work.tsk", "other.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""added":2"#))
        .stdout(predicate::str::contains(r#""replaced":["t2"]"#));

    env.tsk()
        .args(["info", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""tasks":3"#));
    assert!(fs::read_to_string(env.file("work.tsk"))
        .unwrap()
        .contains("Build (imported)"));
}

// === Changes ===

#[test]
fn test_changes_lists_pending_ledgers() {
    let env = TestEnv::new();
    let path = v20_file(&env);

    env.tsk()
        .args(["-H", "changes", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no change ledgers"));

    let mut laptop = env.open("work.tsk");
    let desktop = env.open("work.tsk");
    laptop
        .modify_task("t2", |t| t.base.subject = "Build it".into())
        .unwrap();
    laptop.save().unwrap();

    let output = env.tsk().args(["changes", "work.tsk"]).output().unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    let pending = &json["devices"][desktop.device_guid()]["t2"];
    assert!(pending.as_array().unwrap().iter().any(|n| n == "subject"));
    assert!(path.exists());
}

// === Lock ===

#[test]
fn test_lock_status_and_break() {
    let env = TestEnv::new();
    let path = v20_file(&env);

    env.tsk()
        .args(["lock", "status", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""locked":false"#));

    let mut lock = FileLock::for_document(&path);
    lock.acquire(Duration::from_secs(1)).unwrap();

    env.tsk()
        .args(["lock", "status", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""locked":true"#))
        .stdout(predicate::str::contains(format!(
            r#""pid":{}"#,
            std::process::id()
        )));

    // Holder is alive, so a plain break refuses
    env.tsk()
        .args(["lock", "break", "work.tsk"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("live process"));

    env.tsk()
        .args(["lock", "break", "work.tsk", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""broken":true"#));
    assert!(!lock.is_locked_by_me());
}

#[test]
fn test_stale_lock_from_another_host_is_broken() {
    let env = TestEnv::new();
    v20_file(&env);
    env.write("work.tsk.lock", "PID=4242\nHOST=elsewhere.invalid\nTOKEN=abc\n");

    env.tsk()
        .args(["-H", "lock", "break", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed lock"));
    assert!(!env.file("work.tsk.lock").exists());
}

#[test]
fn test_upgrade_times_out_on_held_lock() {
    let env = TestEnv::new();
    let path = v20_file(&env);
    let before = fs::read(&path).unwrap();

    let mut lock = FileLock::for_document(&path);
    lock.acquire(Duration::from_secs(1)).unwrap();

    env.tsk()
        .args(["upgrade", "work.tsk", "--lock-timeout-ms", "200"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("waiting for lock"));
    assert_eq!(fs::read(&path).unwrap(), before);
    lock.release().unwrap();
}

// === Backups ===

#[test]
fn test_backups_list_and_restore() {
    let env = TestEnv::new();
    let original = tsk_file(20, V20_BODY);
    env.write("work.tsk", &original);

    env.tsk()
        .args(["-H", "backups", "list", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups"));

    env.tsk().args(["upgrade", "work.tsk"]).assert().success();

    let output = env
        .tsk()
        .args(["backups", "list", "work.tsk"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    let backups = json["backups"].as_array().unwrap();
    assert_eq!(backups.len(), 1);
    let id = backups[0]["id"].as_str().unwrap().to_string();
    assert!(
        backups[0]["path"]
            .as_str()
            .unwrap()
            .starts_with(env.data_path().to_str().unwrap())
    );

    env.tsk()
        .args(["backups", "restore", "work.tsk", &id, "-o", "restored.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&id));
    assert_eq!(fs::read_to_string(env.file("restored.tsk")).unwrap(), original);
}

#[test]
fn test_backups_restore_rejects_bad_id() {
    let env = TestEnv::new();
    v20_file(&env);

    env.tsk()
        .args(["backups", "restore", "work.tsk", "yesterday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_no_backups_flag() {
    let env = TestEnv::new();
    v20_file(&env);

    env.tsk()
        .args(["--no-backups", "upgrade", "work.tsk"])
        .assert()
        .success();

    env.tsk()
        .args(["backups", "list", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""backups":[]"#));
}

// === Config ===

#[test]
fn test_config_show_defaults() {
    let env = TestEnv::new();

    env.tsk()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            r#""durability":{"value":"durable","source":"default"}"#,
        ));
}

#[test]
fn test_config_show_precedence() {
    let env = TestEnv::new();
    v20_file(&env);
    fs::write(
        env.config_dir.path().join("config.kdl"),
        "lock-timeout-ms 1234\nbackups #false\n",
    )
    .unwrap();
    env.write(".tskfile.kdl", "durability \"best-effort\"\nlock-timeout-ms 50\n");

    env.tsk()
        .args(["config", "show", "work.tsk"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            r#""lock_timeout_ms":{"value":50,"source":"document"}"#,
        ))
        .stdout(predicate::str::contains(
            r#""backups":{"value":false,"source":"system"}"#,
        ))
        .stdout(predicate::str::contains(
            r#""durability":{"value":"best-effort","source":"document"}"#,
        ));

    env.tsk()
        .args(["-H", "config", "show", "work.tsk", "--lock-timeout-ms", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("lock-timeout-ms = 7 (cli)"));
}

#[test]
fn test_version_flag() {
    let env = TestEnv::new();

    env.tsk()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
