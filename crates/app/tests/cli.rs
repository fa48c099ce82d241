use std::process::Command;

fn neuronflow(data_dir: &std::path::Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_neuronflow"));
    command
        .arg("--data-dir")
        .arg(data_dir)
        .env_remove("RUST_LOG")
        .env_remove("NEURONFLOW_DATA_DIR");
    command
}

#[test]
fn plan_prints_window_grid_as_json() {
    let data_dir = tempfile::tempdir().unwrap();
    let output = neuronflow(data_dir.path())
        .args(["plan", "64", "64", "--patch", "32", "--overlap", "0.5", "--batch-size", "4"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["batches"], 3);
    assert_eq!(summary["plan"]["windows"].as_array().unwrap().len(), 9);
    assert_eq!(summary["plan"]["stride"], serde_json::json!([16, 16]));
    assert_eq!(
        summary["variants"],
        serde_json::json!(["identity", "noise", "flip-height", "flip-width"])
    );
}

#[test]
fn plan_rejects_invalid_overlap() {
    let data_dir = tempfile::tempdir().unwrap();
    let output = neuronflow(data_dir.path())
        .args(["plan", "64", "64", "--overlap", "1.5"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("overlap"));
}

#[test]
fn infer_without_outputs_fails_before_loading_model() {
    let data_dir = tempfile::tempdir().unwrap();
    let output = neuronflow(data_dir.path())
        .args(["infer", "missing.png"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no output requested"));
}
