//! Multi-format extraction through `kgw extract`.
//!
//! Covers: PDF reading order, Office (docx) paragraphs, plain-text formats,
//! unknown extensions, and failures on malformed or binary input.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kgw_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kgw"))
}

/// Minimal one-page PDF; the content stream draws the lower line first.
fn minimal_pdf_with_two_lines() -> Vec<u8> {
    let content = "BT /F1 12 Tf 100 200 Td (inspect yearly) Tj ET BT /F1 12 Tf 100 700 Td (boiler rules) Tj ET";
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// Minimal docx (ZIP) whose `word/document.xml` holds one paragraph per entry.
fn minimal_docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", p))
        .collect();

    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file(
            "word/document.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn extract(dir: &Path, name: &str, content: &[u8]) -> (String, String, bool) {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();

    let output = Command::new(kgw_binary())
        .arg("--config")
        .arg(dir.join("no-config.toml"))
        .arg("extract")
        .arg(&path)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run kgw");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn file_support_pdf_reading_order() {
    let tmp = TempDir::new().unwrap();
    let (stdout, stderr, ok) = extract(tmp.path(), "rules.pdf", &minimal_pdf_with_two_lines());
    assert!(ok, "extract failed: {}", stderr);
    assert_eq!(stdout.trim_end(), "boiler rules\ninspect yearly");
}

#[test]
fn file_support_docx_paragraphs() {
    let tmp = TempDir::new().unwrap();
    let docx = minimal_docx_with_paragraphs(&["Safety   rules", "", "Inspect yearly"]);
    let (stdout, stderr, ok) = extract(tmp.path(), "rules.docx", &docx);
    assert!(ok, "extract failed: {}", stderr);
    assert_eq!(stdout.trim_end(), "Safety rules\nInspect yearly");
}

#[test]
fn file_support_plain_text_is_cleaned() {
    let tmp = TempDir::new().unwrap();
    let (stdout, stderr, ok) = extract(tmp.path(), "notes.txt", b"hello   world\r\n\r\n\r\nbye");
    assert!(ok, "extract failed: {}", stderr);
    assert_eq!(stdout.trim_end(), "hello world\nbye");
}

#[test]
fn file_support_csv_verbatim_rows() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, ok) = extract(tmp.path(), "table.csv", b"name,cycle\nboiler,12\n");
    assert!(ok);
    assert_eq!(stdout.trim_end(), "name,cycle\nboiler,12");
}

#[test]
fn file_support_unknown_text_extension() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, ok) = extract(tmp.path(), "settings.ini", b"[main]\nkey = value\n");
    assert!(ok);
    assert!(stdout.contains("key = value"));
}

#[test]
fn file_support_binary_is_unsupported() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = extract(tmp.path(), "image.bin", &[0x89, 0x50, 0xFF, 0xFE, 0x00, 0xC3]);
    assert!(!ok);
    assert!(stderr.contains("unsupported file format"));
}

#[test]
fn file_support_broken_pdf_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = extract(tmp.path(), "broken.pdf", b"%PDF-1.4 truncated");
    assert!(!ok);
    assert!(stderr.contains("PDF extraction failed"));
}

#[test]
fn file_support_empty_docx_is_empty_content() {
    let tmp = TempDir::new().unwrap();
    let docx = minimal_docx_with_paragraphs(&["   "]);
    let (_, stderr, ok) = extract(tmp.path(), "blank.docx", &docx);
    assert!(!ok);
    assert!(stderr.contains("no text could be extracted"));
}
