use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write");
}

#[test]
fn run_executes_a_minimal_pipeline_and_exits_zero() {
    let td = tempdir().expect("tempdir");
    let script = td.path().join("pipeline.yaml");
    write_file(
        &script,
        r#"
pipeline:
  stages:
    - name: build
      steps:
        kind: step
        name: echo
        arguments: "hello from the e2e test"
"#,
    );

    Command::cargo_bin("pipeline-cli")
        .expect("binary")
        .args(["run", script.to_str().unwrap(), "--workspace"])
        .arg(td.path())
        .assert()
        .success()
        .stdout(contains("build: Success"))
        .stdout(contains("overall: Success"));
}

#[test]
fn run_reports_a_failing_step_with_nonzero_exit() {
    let td = tempdir().expect("tempdir");
    let script = td.path().join("pipeline.yaml");
    write_file(
        &script,
        r#"
pipeline:
  stages:
    - name: build
      steps:
        kind: step
        name: error
        arguments: "boom"
"#,
    );

    Command::cargo_bin("pipeline-cli")
        .expect("binary")
        .args(["run", script.to_str().unwrap(), "--workspace"])
        .arg(td.path())
        .assert()
        .failure()
        .code(1)
        .stdout(contains("build: Failure"));
}

#[test]
fn validate_reports_stage_count_without_running_anything() {
    let td = tempdir().expect("tempdir");
    let script = td.path().join("pipeline.yaml");
    write_file(
        &script,
        r#"
pipeline:
  stages:
    - name: build
      steps:
        kind: step
        name: echo
        arguments: "noop"
"#,
    );

    Command::cargo_bin("pipeline-cli")
        .expect("binary")
        .args(["validate", script.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("ok: 1 stage(s)"));
}

#[test]
fn validate_fails_on_a_pipeline_with_no_stages() {
    let td = tempdir().expect("tempdir");
    let script = td.path().join("pipeline.yaml");
    write_file(&script, "pipeline:\n  stages: []\n");

    Command::cargo_bin("pipeline-cli")
        .expect("binary")
        .args(["validate", script.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("at least one stage"));
}

#[test]
fn doctor_reports_shell_availability() {
    Command::cargo_bin("pipeline-cli")
        .expect("binary")
        .arg("doctor")
        .assert()
        .success()
        .stdout(contains("sh available:"));
}
