//! Office and PDF files in the mirror: extraction, skipping and the
//! stored content type, checked through the `dchat` binary.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dchat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("dchat");
    path
}

fn zip_with(entries: &[(&str, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, body) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

fn docx_with_text(phrase: &str) -> Vec<u8> {
    zip_with(&[(
        "word/document.xml",
        format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        ),
    )])
}

fn pptx_with_text(phrase: &str) -> Vec<u8> {
    zip_with(&[(
        "ppt/slides/slide1.xml",
        format!(
            "<?xml version=\"1.0\"?><p:sld xmlns:p=\"http://schemas.openxmlformats.org/presentationml/2006/main\" xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
            phrase
        ),
    )])
}

/// Mirror with one file per entry of `files` (path relative to the mirror
/// root) and a config whose extraction cap is `max_extract_bytes`.
fn setup_env(files: &[(&str, Vec<u8>)], max_extract_bytes: u64) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("config")).unwrap();

    let mirror = root.join("mirror");
    for (rel, bytes) in files {
        let path = mirror.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }
    fs::create_dir_all(&mirror).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/dchat.sqlite"

[chunking]
max_tokens = 700

[retrieval]
final_limit = 12

[mirror]
root = "{root}/mirror"
metadata_file = "{root}/file_metadata.json"

[loader]
max_extract_bytes = {max}
"#,
        root = root.display(),
        max = max_extract_bytes,
    );
    let config_path = root.join("config").join("dchat.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_dchat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(dchat_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run dchat");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn docx_text_is_searchable() {
    let (_tmp, config) = setup_env(
        &[("Policies/handbook.docx", docx_with_text("quarterly offsite itinerary"))],
        50_000_000,
    );

    let (stdout, stderr, success) = run_dchat(&config, &["ingest"]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("upserted documents: 1"), "got: {}", stdout);
    assert!(stdout.contains("extraction skipped: 0"), "got: {}", stdout);

    let (stdout, _, _) = run_dchat(&config, &["search", "offsite itinerary"]);
    assert!(stdout.contains("Policies/handbook.docx"), "got: {}", stdout);
    assert!(stdout.contains("Policies / handbook.docx"), "got: {}", stdout);
}

#[test]
fn pptx_slides_are_searchable() {
    let (_tmp, config) = setup_env(
        &[("Decks/kickoff.pptx", pptx_with_text("roadmap milestones"))],
        50_000_000,
    );

    let (_, stderr, success) = run_dchat(&config, &["ingest"]);
    assert!(success, "ingest failed: {}", stderr);
    let (stdout, _, _) = run_dchat(&config, &["search", "milestones"]);
    assert!(stdout.contains("Decks/kickoff.pptx"), "got: {}", stdout);
}

#[test]
fn broken_pdf_is_skipped_not_fatal() {
    let (_tmp, config) = setup_env(
        &[
            ("Reports/broken.pdf", b"this is not a pdf".to_vec()),
            ("Reports/summary.md", b"# Summary\n\nAll good.".to_vec()),
        ],
        50_000_000,
    );

    let (stdout, stderr, success) = run_dchat(&config, &["ingest"]);
    assert!(success, "ingest must survive a bad file: {}", stderr);
    assert!(stdout.contains("documents found: 1"), "got: {}", stdout);
    assert!(stdout.contains("extraction skipped: 1"), "got: {}", stdout);
}

#[test]
fn oversized_binary_is_skipped() {
    let docx = docx_with_text("too big to read");
    let cap = (docx.len() - 1) as u64;
    let (_tmp, config) = setup_env(
        &[
            ("Policies/huge.docx", docx),
            ("Policies/small.txt", b"small".to_vec()),
        ],
        cap,
    );

    let (stdout, _, success) = run_dchat(&config, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("extraction skipped: 1"), "got: {}", stdout);
    assert!(stdout.contains("upserted documents: 1"), "got: {}", stdout);
}

#[test]
fn reingest_of_binary_is_unchanged() {
    let (_tmp, config) = setup_env(
        &[("Policies/handbook.docx", docx_with_text("stable content"))],
        50_000_000,
    );

    run_dchat(&config, &["ingest"]);
    let (stdout, _, _) = run_dchat(&config, &["ingest"]);
    assert!(stdout.contains("upserted documents: 0"), "got: {}", stdout);
    assert!(stdout.contains("unchanged: 1"), "got: {}", stdout);
}

#[test]
fn content_type_is_stored() {
    let (_tmp, config) = setup_env(
        &[("Policies/handbook.docx", docx_with_text("content type probe"))],
        50_000_000,
    );
    run_dchat(&config, &["ingest"]);

    let (search_out, _, _) = run_dchat(&config, &["search", "probe"]);
    let id = search_out
        .lines()
        .find_map(|l| l.trim().strip_prefix("id:").map(|s| s.trim().to_string()))
        .expect("search should print an id");

    let (stdout, _, success) = run_dchat(&config, &["get", &id]);
    assert!(success);
    assert!(
        stdout.contains(
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        ),
        "got: {}",
        stdout
    );
    assert!(stdout.contains("content type probe"));
}
