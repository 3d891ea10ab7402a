use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("qrun_cli_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn fixture_model() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/model.json")
}

fn write_config(dir: &Path, body: serde_json::Value) -> PathBuf {
    let path = dir.join("node.json");
    fs::write(&path, body.to_string()).expect("write config");
    path
}

fn binary_config(dir: &Path, processor: &str) -> PathBuf {
    write_config(
        dir,
        serde_json::json!({
            "static": {
                "name": "det",
                "id": 7,
                "processorType": processor,
                "loadType": "binary",
                "modelPath": fixture_model(),
            }
        }),
    )
}

fn qrun(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_qrun"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("run qrun binary")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_else(|| panic!("no stdout; stderr:\n{}", String::from_utf8_lossy(&output.stderr)));
    serde_json::from_str(line).unwrap_or_else(|e| panic!("stdout is not JSON: {e}\n{stdout}"))
}

fn assert_envelope(value: &serde_json::Value, command: &str, ok: bool) {
    assert_eq!(value["schema_version"].as_u64(), Some(1), "{value}");
    assert_eq!(value["command"].as_str(), Some(command), "{value}");
    assert_eq!(value["ok"].as_bool(), Some(ok), "{value}");
}

#[test]
fn validate_reports_static_summary() {
    let dir = unique_temp_dir("validate_ok");
    let config = binary_config(&dir, "htp1");
    let output = qrun(&["validate", "--config", config.to_str().expect("utf8"), "--json"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let value = stdout_json(&output);
    assert_envelope(&value, "validate", true);
    assert_eq!(value["section"], "static");
    assert_eq!(value["name"], "det");
    assert_eq!(value["id"], 7);
    assert_eq!(value["processor"], "htp1");
    assert_eq!(value["load"], "binary");
}

#[test]
fn validate_rejects_incomplete_config_with_error_code() {
    let dir = unique_temp_dir("validate_bad");
    let config = write_config(&dir, serde_json::json!({"static": {"id": 1}}));
    let output = qrun(&["validate", "--config", config.to_str().expect("utf8"), "--json"]);
    assert_eq!(output.status.code(), Some(200));

    let value = stdout_json(&output);
    assert_envelope(&value, "validate", false);
    assert_eq!(value["kind"], "bad arguments");
    assert!(
        value["error"].as_str().unwrap_or_default().contains("name"),
        "{value}"
    );
}

#[test]
fn validate_accepts_dynamic_section() {
    let dir = unique_temp_dir("validate_dyn");
    let config = write_config(&dir, serde_json::json!({"dynamic": {"enablePerf": true}}));
    let output = qrun(&["validate", "--config", config.to_str().expect("utf8"), "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["section"], "dynamic");
    assert_eq!(value["enable_perf"], true);
}

#[test]
fn options_lists_model_tensors() {
    let dir = unique_temp_dir("options");
    let config = binary_config(&dir, "htp0");
    let output = qrun(&["options", "--config", config.to_str().expect("utf8")]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let value = stdout_json(&output);
    assert_envelope(&value, "options", true);
    let model = &value["options"]["model"];
    assert_eq!(model["inputs"][0]["name"], "image");
    assert_eq!(model["outputs"].as_array().map(Vec::len), Some(2));
    assert_eq!(model["outputs"][1]["quantType"], "scale_offset");
}

#[test]
fn options_from_buffer_load_needs_context() {
    let dir = unique_temp_dir("options_buffer");
    let config = write_config(
        &dir,
        serde_json::json!({
            "static": {
                "name": "det",
                "id": 2,
                "loadType": "buffer",
                "contextBufferId": 1,
            }
        }),
    );
    let config = config.to_str().expect("utf8");

    let missing = qrun(&["options", "--config", config]);
    assert_eq!(missing.status.code(), Some(200));
    assert_envelope(&stdout_json(&missing), "options", false);

    let model = fixture_model();
    let output = qrun(&["options", "--config", config, "--context", model.to_str().expect("utf8")]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output)["options"]["model"]["inputs"][0]["name"], "image");
}

#[test]
fn run_sync_completes_every_frame() {
    let dir = unique_temp_dir("run_sync");
    let config = binary_config(&dir, "htp0");
    let output = qrun(&[
        "run",
        "--config",
        config.to_str().expect("utf8"),
        "--frames",
        "5",
        "--perf",
        "--json",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let value = stdout_json(&output);
    assert_envelope(&value, "run", true);
    assert_eq!(value["mode"], "sync");
    assert_eq!(value["completed"], 5);
    assert_eq!(value["failed"], 0);
    assert_eq!(value["metrics"]["sync_executed"], 5);
    assert_eq!(value["perf"]["entire_exec_time_us"], 1250);
}

#[test]
fn run_async_collects_more_frames_than_slots() {
    let dir = unique_temp_dir("run_async");
    let config = binary_config(&dir, "htp0");
    let output = qrun(&[
        "run",
        "--config",
        config.to_str().expect("utf8"),
        "--frames",
        "24",
        "--async",
        "--latency-us",
        "100",
        "--json",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let value = stdout_json(&output);
    assert_envelope(&value, "run", true);
    assert_eq!(value["mode"], "async");
    assert_eq!(value["completed"], 24);
    assert_eq!(value["metrics"]["async_dispatched"], 24);
    assert_eq!(value["metrics"]["async_succeeded"], 24);
    assert!(value["perf"].is_null());
}

#[test]
fn run_on_cpu_uses_raw_memory_path() {
    let dir = unique_temp_dir("run_cpu");
    let config = binary_config(&dir, "cpu");
    let output = qrun(&["run", "--config", config.to_str().expect("utf8"), "--frames", "3", "--json"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let value = stdout_json(&output);
    assert_eq!(value["processor"], "cpu");
    assert_eq!(value["completed"], 3);
}

#[test]
fn run_rejects_zero_frames() {
    let dir = unique_temp_dir("run_zero");
    let config = binary_config(&dir, "htp0");
    let output = qrun(&["run", "--config", config.to_str().expect("utf8"), "--frames", "0", "--json"]);
    assert_eq!(output.status.code(), Some(200));
    assert_envelope(&stdout_json(&output), "run", false);
}
