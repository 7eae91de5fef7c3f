use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn onto_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("onto");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::write(
        root.join("doc.txt"),
        "Marie Curie studied radioactivity in Paris.",
    )
    .unwrap();

    let config_path = root.join("ontology.yaml");
    fs::write(
        &config_path,
        "storage_type: local\nmax_tokens: 500\nollama_api_url: http://127.0.0.1:9\n",
    )
    .unwrap();

    (tmp, config_path)
}

fn run_onto(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = onto_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .env_remove("CLAUDE_API_KEY")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run onto binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_help_lists_enrich() {
    let output = Command::new(onto_binary()).arg("--help").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("enrich"));
}

#[test]
fn test_missing_input_fails() {
    let (tmp, config) = setup_test_env();
    let missing = tmp.path().join("nope.txt");
    let (_, stderr, ok) = run_onto(
        &config,
        &["enrich", missing.to_str().unwrap(), "--llm", "ollama"],
    );
    assert!(!ok);
    assert!(stderr.contains("cannot read input"), "stderr: {}", stderr);
}

#[test]
fn test_unknown_format_fails() {
    let (tmp, config) = setup_test_env();
    let input = tmp.path().join("doc.txt");
    let (_, stderr, ok) = run_onto(
        &config,
        &["enrich", input.to_str().unwrap(), "--llm", "ollama", "--format", "owl"],
    );
    assert!(!ok);
    assert!(stderr.contains("unsupported output format"), "stderr: {}", stderr);
    assert!(!tmp.path().join("doc.tsv").exists());
}

#[test]
fn test_openai_without_key_fails() {
    let (tmp, config) = setup_test_env();
    let input = tmp.path().join("doc.txt");
    let (_, _, ok) = run_onto(&config, &["enrich", input.to_str().unwrap(), "--llm", "openai"]);
    assert!(!ok);
}

#[test]
fn test_unknown_llm_fails() {
    let (tmp, config) = setup_test_env();
    let input = tmp.path().join("doc.txt");
    let (_, _, ok) = run_onto(&config, &["enrich", input.to_str().unwrap(), "--llm", "gpt"]);
    assert!(!ok);
}

#[test]
fn test_invalid_progress_mode_is_rejected() {
    let (tmp, config) = setup_test_env();
    let input = tmp.path().join("doc.txt");
    let (_, stderr, ok) = run_onto(
        &config,
        &["enrich", input.to_str().unwrap(), "--progress", "loud"],
    );
    assert!(!ok);
    assert!(stderr.contains("invalid progress mode"), "stderr: {}", stderr);
}

#[test]
fn test_bad_config_fails() {
    let (tmp, _) = setup_test_env();
    let config = tmp.path().join("bad.yaml");
    fs::write(&config, "max_tokens: 0\n").unwrap();
    let input = tmp.path().join("doc.txt");
    let (_, _, ok) = run_onto(&config, &["enrich", input.to_str().unwrap(), "--llm", "ollama"]);
    assert!(!ok);
}
