use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const SESSION: &str = r#"{"uuid":"00000000-0000-4000-8000-000000000001","parentUuid":null,"type":"user","message":{"role":"user","content":"Why does the nightly export time out?"},"timestamp":"2025-03-01T09:00:00Z","sessionId":"cli-session"}
{"uuid":"00000000-0000-4000-8000-000000000002","parentUuid":"00000000-0000-4000-8000-000000000001","type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Grep","input":{"pattern":"timeout"}}]},"timestamp":"2025-03-01T09:00:05Z","sessionId":"cli-session"}
{"uuid":"00000000-0000-4000-8000-000000000003","parentUuid":"00000000-0000-4000-8000-000000000002","type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"export.rs:42: const TIMEOUT_SECS: u64 = 30;"}]},"timestamp":"2025-03-01T09:00:06Z","sessionId":"cli-session"}
{broken line
{"uuid":"00000000-0000-4000-8000-000000000004","parentUuid":"00000000-0000-4000-8000-000000000003","type":"assistant","message":{"role":"assistant","content":"The export timeout is hard-coded to 30 seconds; raising it to 300 fixes the nightly job."},"timestamp":"2025-03-01T09:00:10Z","sessionId":"cli-session"}
"#;

fn prebake(home: &Path) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("prebake");
    cmd.current_dir(home)
        .env("HOME", home)
        .env("PREBAKE_HOME", home.join("prebake-home"))
        .env("PREBAKE_CONFIG_PATH", home.join("absent.toml"))
        .env("PREBAKE_ORACLE_PROVIDER", "local")
        .env("PREBAKE_LOG", "warn")
        .env_remove("PREBAKE_SESSIONS_DIR")
        .env_remove("PREBAKE_LOGS_DIR");
    cmd
}

fn write_session(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("session.jsonl");
    fs::write(&path, SESSION).expect("write session");
    path
}

#[test]
fn run_writes_final_artifact_and_audit_log() {
    let tmp = tempdir().expect("tempdir");
    let source = write_session(tmp.path());

    prebake(tmp.path())
        .arg("run")
        .arg(&source)
        .arg("--no-progress")
        .assert()
        .success()
        .stdout(predicate::str::contains("run: ok"))
        .stdout(predicate::str::contains("final_session_id="))
        .stdout(predicate::str::contains("original_session_id=cli-session"));

    let sessions = tmp.path().join("prebake-home/sessions");
    let artifacts = fs::read_dir(&sessions)
        .expect("sessions dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        .count();
    assert_eq!(artifacts, 3);

    let audit = fs::read_to_string(tmp.path().join("prebake-home/logs/audit.log")).expect("audit log");
    assert!(audit.contains("\"phase\":\"stage-c\""));
    assert!(audit.contains("\"status\":\"completed\""));
}

#[test]
fn run_json_reports_stage_results() {
    let tmp = tempdir().expect("tempdir");
    let source = write_session(tmp.path());

    let output = prebake(tmp.path())
        .args(["run", "--json", "--no-progress"])
        .arg(&source)
        .output()
        .expect("run prebake");
    assert!(output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json result");
    assert_eq!(result["success"], true);
    assert_eq!(result["stage_results"].as_array().map(Vec::len), Some(3));
    assert_eq!(result["stage_results"][0]["metadata"]["malformed_lines"], 1);
    assert_eq!(result["states"].as_array().and_then(|s| s.last()).cloned(), Some("done".into()));
}

#[test]
fn condense_without_input_session_exits_nonzero() {
    let tmp = tempdir().expect("tempdir");

    prebake(tmp.path())
        .args(["run", "--skip-ingest", "--skip-retention", "--no-progress"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("no input session"))
        .stderr(predicate::str::contains("error: run reported 1 issue(s)"));
}

#[test]
fn run_rejects_missing_source() {
    let tmp = tempdir().expect("tempdir");

    prebake(tmp.path())
        .args(["run", "does-not-exist.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("source log not found"));
}

#[test]
fn inspect_reports_malformed_lines_and_content_mix() {
    let tmp = tempdir().expect("tempdir");
    let source = write_session(tmp.path());

    prebake(tmp.path())
        .arg("inspect")
        .arg(&source)
        .assert()
        .success()
        .stdout(predicate::str::contains("lines=5 valid=4 malformed=1"))
        .stdout(predicate::str::contains("entries: user=2 assistant=2"))
        .stdout(predicate::str::contains("checkpoint: structural=true consistency=true"));
}

#[test]
fn status_lists_paths_and_local_oracle() {
    let tmp = tempdir().expect("tempdir");

    prebake(tmp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("status: ok"))
        .stdout(predicate::str::contains("prebake-home"))
        .stdout(predicate::str::contains("oracle=local"));
}
