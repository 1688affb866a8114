//! CLI tests: drive the `dchat` binary against a pre-populated mirror.
//! Nothing here talks to Google; `download` is covered in `drive_api.rs`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dchat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // test binary name
    path.pop(); // deps/
    path.push("dchat");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("config")).unwrap();

    let mirror = root.join("downloaded_files");
    fs::create_dir_all(mirror.join("Engineering")).unwrap();
    fs::create_dir_all(mirror.join("Handbook/Benefits")).unwrap();
    fs::write(
        mirror.join("Engineering/alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        mirror.join("Handbook/Benefits/leave.md"),
        "# Leave\n\nAnnual leave is twenty days.\n\nUnused leave expires in March.",
    )
    .unwrap();
    fs::write(
        mirror.join("notes.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/dchat.sqlite"

[chunking]
max_tokens = 700
overlap_tokens = 80

[retrieval]
final_limit = 12

[drive]
credentials_path = "{root}/credentials.json"
token_path = "{root}/token.json"

[mirror]
root = "{root}/downloaded_files"
metadata_file = "{root}/file_metadata.json"
"#,
        root = root.display()
    );
    let config_path = root.join("config").join("dchat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_dchat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dchat_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dchat binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn first_id(search_out: &str) -> Option<String> {
    search_out
        .lines()
        .find(|l| l.trim().starts_with("id:"))
        .and_then(|l| l.split("id:").nth(1))
        .map(|s| s.trim().to_string())
}

#[test]
fn init_creates_database_and_is_idempotent() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dchat(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/dchat.sqlite").exists());

    let (_, _, again) = run_dchat(&config_path, &["init"]);
    assert!(again, "second init failed");
}

#[test]
fn ingest_reports_documents() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dchat(&config_path, &["ingest"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents found: 3"));
    assert!(stdout.contains("upserted documents: 3"));
    assert!(stdout.contains("extraction skipped: 0"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn ingest_is_incremental() {
    let (tmp, config_path) = setup_test_env();

    run_dchat(&config_path, &["ingest"]);
    let (stdout, _, _) = run_dchat(&config_path, &["ingest"]);
    assert!(stdout.contains("upserted documents: 0"), "got: {}", stdout);
    assert!(stdout.contains("unchanged: 3"), "got: {}", stdout);

    fs::write(
        tmp.path().join("downloaded_files/Engineering/alpha.md"),
        "# Alpha Document Updated\n\nThis file was modified.",
    )
    .unwrap();
    let (stdout, _, _) = run_dchat(&config_path, &["ingest"]);
    assert!(stdout.contains("upserted documents: 1"), "got: {}", stdout);

    let (stdout, _, _) = run_dchat(&config_path, &["ingest", "--full"]);
    assert!(stdout.contains("upserted documents: 3"), "got: {}", stdout);
}

#[test]
fn ingest_prunes_removed_files() {
    let (tmp, config_path) = setup_test_env();

    run_dchat(&config_path, &["ingest"]);
    fs::remove_file(tmp.path().join("downloaded_files/notes.txt")).unwrap();
    let (stdout, _, success) = run_dchat(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("removed: 1"), "got: {}", stdout);

    let (stats, _, _) = run_dchat(&config_path, &["stats"]);
    assert!(stats.contains("documents: 2"), "got: {}", stats);
}

#[test]
fn ingest_dry_run_and_limit() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_dchat(&config_path, &["ingest", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("documents found: 3"));

    let (stdout, _, success) = run_dchat(&config_path, &["ingest", "--limit", "1"]);
    assert!(success);
    assert!(stdout.contains("upserted documents: 1"));
    assert!(stdout.contains("removed: 0"));
}

#[test]
fn ingest_by_doc_type() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_dchat(&config_path, &["ingest", "--doc-type", "Handbook"]);
    assert!(success);
    assert!(stdout.contains("upserted documents: 1"), "got: {}", stdout);

    let (stats, _, _) = run_dchat(&config_path, &["stats"]);
    assert!(stats.contains("Handbook"), "got: {}", stats);
    assert!(!stats.contains("Engineering"), "got: {}", stats);
}

#[test]
fn ingest_without_mirror_fails() {
    let (tmp, config_path) = setup_test_env();
    fs::remove_dir_all(tmp.path().join("downloaded_files")).unwrap();

    let (_, stderr, success) = run_dchat(&config_path, &["ingest"]);
    assert!(!success);
    assert!(stderr.contains("mirror directory does not exist"), "got: {}", stderr);
}

#[test]
fn search_keyword_finds_document() {
    let (_tmp, config_path) = setup_test_env();
    run_dchat(&config_path, &["ingest"]);

    let (stdout, _, success) = run_dchat(&config_path, &["search", "Rust programming"]);
    assert!(success, "search failed");
    assert!(stdout.contains("alpha.md"), "got: {}", stdout);
    assert!(stdout.contains("Engineering / alpha.md"), "got: {}", stdout);
}

#[test]
fn search_doc_type_filter() {
    let (_tmp, config_path) = setup_test_env();
    run_dchat(&config_path, &["ingest"]);

    let (stdout, _, success) =
        run_dchat(&config_path, &["search", "leave", "--doc-type", "Engineering"]);
    assert!(success);
    assert!(stdout.contains("No results"), "got: {}", stdout);

    let (stdout, _, _) = run_dchat(&config_path, &["search", "leave", "--doc-type", "Handbook"]);
    assert!(stdout.contains("Handbook/Benefits/leave.md"), "got: {}", stdout);
}

#[test]
fn search_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    run_dchat(&config_path, &["ingest"]);

    let (stdout1, _, _) = run_dchat(&config_path, &["search", "document"]);
    let (stdout2, _, _) = run_dchat(&config_path, &["search", "document"]);
    assert_eq!(stdout1, stdout2);
}

#[test]
fn search_empty_and_unmatched_queries() {
    let (_tmp, config_path) = setup_test_env();
    run_dchat(&config_path, &["ingest"]);

    let (stdout, _, success) = run_dchat(&config_path, &["search", ""]);
    assert!(success, "empty query should not fail");
    assert!(stdout.contains("No results"));

    let (stdout, _, success) = run_dchat(&config_path, &["search", "xyznonexistent"]);
    assert!(success);
    assert!(stdout.contains("No results"));

    let (_, stderr, success) = run_dchat(&config_path, &["search", "AND OR (\"", "--mode", "keyword"]);
    assert!(success, "punctuation should not break FTS: {}", stderr);
}

#[test]
fn search_modes_without_embeddings() {
    let (_tmp, config_path) = setup_test_env();
    run_dchat(&config_path, &["ingest"]);

    let (_, stderr, success) = run_dchat(&config_path, &["search", "leave", "--mode", "semantic"]);
    assert!(!success, "semantic needs embeddings");
    assert!(stderr.contains("embeddings"), "got: {}", stderr);

    let (stdout, _, success) = run_dchat(&config_path, &["search", "leave", "--mode", "hybrid"]);
    assert!(success, "hybrid falls back to keyword");
    assert!(stdout.contains("leave.md"), "got: {}", stdout);

    let (_, stderr, success) = run_dchat(&config_path, &["search", "x", "--mode", "fuzzy"]);
    assert!(!success);
    assert!(stderr.contains("invalid value"), "got: {}", stderr);
}

#[test]
fn get_document_by_id() {
    let (_tmp, config_path) = setup_test_env();
    run_dchat(&config_path, &["ingest"]);

    let (search_out, _, _) = run_dchat(&config_path, &["search", "twenty days"]);
    let doc_id = first_id(&search_out).expect("search should print an id");
    let (stdout, _, success) = run_dchat(&config_path, &["get", &doc_id]);
    assert!(success);
    assert!(stdout.contains("--- Document ---"));
    assert!(stdout.contains(&doc_id));
    assert!(stdout.contains("doc_type:     Handbook"));
    assert!(stdout.contains("Annual leave is twenty days."));
}

#[test]
fn get_missing_document() {
    let (_tmp, config_path) = setup_test_env();
    run_dchat(&config_path, &["init"]);

    let (_, stderr, success) = run_dchat(&config_path, &["get", "nonexistent-id"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn embed_commands_need_a_provider() {
    let (_tmp, config_path) = setup_test_env();
    run_dchat(&config_path, &["init"]);

    for args in [&["embed", "pending"][..], &["embed", "pending", "--dry-run"], &["embed", "rebuild"]] {
        let (_, stderr, success) = run_dchat(&config_path, args);
        assert!(!success, "{:?} should fail with embeddings disabled", args);
        assert!(stderr.contains("disabled"), "got: {}", stderr);
    }
}

#[test]
fn status_reports_missing_pieces() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_dchat(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("credentials"));
    assert!(stdout.contains("MISSING"), "token should be missing: {}", stdout);
    assert!(stdout.contains("3 files"), "got: {}", stdout);

    run_dchat(&config_path, &["ingest"]);
    let (stdout, _, _) = run_dchat(&config_path, &["status"]);
    assert!(stdout.contains("3 documents"), "got: {}", stdout);
}

#[test]
fn tree_without_credentials_fails_cleanly() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_dchat(&config_path, &["tree"]);
    assert!(!success);
    assert!(stderr.contains("credentials"), "got: {}", stderr);
}

#[test]
fn chat_needs_an_api_key() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_dchat(&config_path, &["chat"]);
    assert!(!success);
    assert!(stderr.contains("OPENAI_API_KEY"), "got: {}", stderr);
}
