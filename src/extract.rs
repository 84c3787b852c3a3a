//! Multi-format text extraction for uploaded documents.
//!
//! Converts an uploaded file (PDF, DOCX, DOC, XLSX, XLS, TXT, MD, CSV) into a
//! single cleaned UTF-8 string that can be sent to the remote index. The
//! format is chosen from the original file name's extension; unknown
//! extensions fall back to plain-text decoding.
//!
//! Every format goes through the same cleaning pass ([`clean_text`]):
//!
//! 1. normalize `\r\n` and `\r` to `\n`
//! 2. collapse runs of spaces/tabs to a single space
//! 3. collapse blank-line runs to a single `\n`
//! 4. trim, then truncate to [`MAX_TEXT_CHARS`] characters followed by
//!    [`TRUNCATION_MARKER`]
//!
//! Extraction never panics on malformed input; it returns an
//! [`ExtractError`] and the caller aborts the ingestion.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::LazyLock;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use regex::Regex;
use thiserror::Error;

/// Largest accepted upload (50 MiB).
pub const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;
/// Cleaned text is capped at this many characters.
pub const MAX_TEXT_CHARS: usize = 100_000;
/// Appended to text that was cut at [`MAX_TEXT_CHARS`].
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extensions handled by a dedicated extractor.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "csv", "pdf", "docx", "doc", "xlsx", "xls"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("no text could be extracted from {0}")]
    EmptyContent(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("Office extraction failed: {0}")]
    Office(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::UnsupportedFormat(_) => "unsupported_format",
            ExtractError::FileTooLarge { .. } => "file_too_large",
            ExtractError::EmptyContent(_) => "empty_content",
            ExtractError::Pdf(_) | ExtractError::Office(_) | ExtractError::Io(_) => {
                "extract_failed"
            }
        }
    }
}

/// Size and length limits applied by the extractor.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_file_bytes: u64,
    pub max_chars: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: MAX_FILE_BYTES,
            max_chars: MAX_TEXT_CHARS,
        }
    }
}

/// Extractor selected from a file name's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Pdf,
    Docx,
    Doc,
    Spreadsheet,
    /// No dedicated extractor; decoded as UTF-8 text if possible.
    Unknown,
}

impl FileKind {
    pub fn from_name(name: &str) -> Self {
        let ext = file_extension(name)
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "md" | "csv" => FileKind::Text,
            "pdf" => FileKind::Pdf,
            "docx" => FileKind::Docx,
            "doc" => FileKind::Doc,
            "xlsx" | "xls" => FileKind::Spreadsheet,
            _ => FileKind::Unknown,
        }
    }
}

/// Returns the extension of `name` including the leading dot (`".pdf"`),
/// with its original casing, or `None` when the name has no dot.
pub fn file_extension(name: &str) -> Option<&str> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.rfind('.').map(|idx| &base[idx..])
}

/// Pre-flight check for an upload, run before any network call.
pub fn check_upload(name: &str, size: u64, limits: &ExtractLimits) -> Result<FileKind, ExtractError> {
    if size > limits.max_file_bytes {
        return Err(ExtractError::FileTooLarge {
            size,
            limit: limits.max_file_bytes,
        });
    }
    Ok(FileKind::from_name(name))
}

/// Extract cleaned text from a file on disk.
///
/// `original_name` is the client-supplied file name; its extension picks the
/// extractor (the on-disk path is usually an anonymous temporary file).
pub fn extract_file(
    path: &Path,
    original_name: &str,
    limits: &ExtractLimits,
) -> Result<String, ExtractError> {
    let size = std::fs::metadata(path)?.len();
    check_upload(original_name, size, limits)?;
    let bytes = std::fs::read(path)?;
    extract_bytes(&bytes, original_name, limits)
}

/// Extract cleaned text from an in-memory file.
pub fn extract_bytes(
    bytes: &[u8],
    original_name: &str,
    limits: &ExtractLimits,
) -> Result<String, ExtractError> {
    let kind = check_upload(original_name, bytes.len() as u64, limits)?;
    tracing::debug!(file = original_name, ?kind, size = bytes.len(), "extracting text");

    let raw = match kind {
        FileKind::Text => decode_text(bytes, false)?,
        FileKind::Pdf => extract_pdf(bytes)?,
        FileKind::Docx => extract_docx(bytes)?,
        FileKind::Doc => extract_doc(bytes)?,
        FileKind::Spreadsheet => extract_spreadsheet(bytes)?,
        FileKind::Unknown => {
            tracing::warn!(file = original_name, "unrecognized extension, decoding as plain text");
            decode_text(bytes, true)
                .map_err(|_| ExtractError::UnsupportedFormat(original_name.to_string()))?
        }
    };

    let text = clean_text(&raw, limits.max_chars);
    if text.is_empty() {
        return Err(ExtractError::EmptyContent(original_name.to_string()));
    }

    tracing::info!(file = original_name, chars = text.chars().count(), "text extracted");
    Ok(text)
}

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));

/// Normalize whitespace and cap the length of extracted text.
pub fn clean_text(raw: &str, max_chars: usize) -> String {
    let text = raw.replace("\r\n", "\n").replace('\r', "\n");
    let text = HORIZONTAL_WS.replace_all(&text, " ");
    let text = BLANK_LINES.replace_all(&text, "\n");
    let text = text.trim();

    if text.chars().count() > max_chars {
        tracing::warn!(limit = max_chars, "extracted text too long, truncating");
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push_str(TRUNCATION_MARKER);
        cut
    } else {
        text.to_string()
    }
}

fn decode_text(bytes: &[u8], strict: bool) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if strict {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ExtractError::UnsupportedFormat(e.to_string()))
    } else {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed font tables
    let result = std::panic::catch_unwind(|| -> Result<String, pdf_extract::OutputError> {
        let mut doc = pdf_extract::Document::load_mem(bytes)?;
        if doc.is_encrypted() {
            doc.decrypt("")?;
        }
        let mut layout = ReadingOrder::default();
        pdf_extract::output_doc(&doc, &mut layout)?;
        Ok(layout.pages.join("\n"))
    });
    match result {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
        Err(_) => Err(ExtractError::Pdf("parser panicked on malformed input".to_string())),
    }
}

/// One decoded glyph in PDF user space (origin bottom-left).
#[derive(Debug, Clone)]
struct Glyph {
    x: f64,
    y: f64,
    end: f64,
    size: f64,
    text: String,
}

/// Collects positioned glyphs and lays each page out top-to-bottom,
/// left-to-right, independent of content-stream order.
#[derive(Default)]
struct ReadingOrder {
    glyphs: Vec<Glyph>,
    pages: Vec<String>,
}

impl pdf_extract::OutputDev for ReadingOrder {
    fn begin_page(
        &mut self,
        _page_num: u32,
        _media_box: &pdf_extract::MediaBox,
        _art_box: Option<(f64, f64, f64, f64)>,
    ) -> Result<(), pdf_extract::OutputError> {
        self.glyphs.clear();
        Ok(())
    }

    fn end_page(&mut self) -> Result<(), pdf_extract::OutputError> {
        let glyphs = std::mem::take(&mut self.glyphs);
        self.pages.push(layout_page(glyphs));
        Ok(())
    }

    fn output_character(
        &mut self,
        trm: &pdf_extract::Transform,
        width: f64,
        _spacing: f64,
        font_size: f64,
        text: &str,
    ) -> Result<(), pdf_extract::OutputError> {
        let sx = font_size * (trm.m11 + trm.m21);
        let sy = font_size * (trm.m12 + trm.m22);
        let size = (sx * sy).abs().sqrt();
        self.glyphs.push(Glyph {
            x: trm.m31,
            y: trm.m32,
            end: trm.m31 + width * size,
            size,
            text: text.to_string(),
        });
        Ok(())
    }

    fn begin_word(&mut self) -> Result<(), pdf_extract::OutputError> {
        Ok(())
    }

    fn end_word(&mut self) -> Result<(), pdf_extract::OutputError> {
        Ok(())
    }

    fn end_line(&mut self) -> Result<(), pdf_extract::OutputError> {
        Ok(())
    }
}

/// Groups glyphs into lines by baseline (highest first), orders each line by
/// x and inserts a space wherever the gap exceeds a tenth of the font size.
fn layout_page(mut glyphs: Vec<Glyph>) -> String {
    glyphs.sort_by(|a, b| b.y.total_cmp(&a.y).then(a.x.total_cmp(&b.x)));

    let mut lines: Vec<Vec<Glyph>> = Vec::new();
    for glyph in glyphs {
        match lines.last_mut() {
            Some(line) if (line[0].y - glyph.y).abs() <= line[0].size.max(1.0) * 0.5 => {
                line.push(glyph)
            }
            _ => lines.push(vec![glyph]),
        }
    }

    let mut out = String::new();
    for mut line in lines {
        line.sort_by(|a, b| a.x.total_cmp(&b.x));
        let mut last_end: Option<f64> = None;
        for glyph in &line {
            if let Some(end) = last_end {
                if glyph.x > end + glyph.size * 0.1 {
                    out.push(' ');
                }
            }
            out.push_str(&glyph.text);
            last_end = Some(glyph.end);
        }
        out.push('\n');
    }
    out
}

// ============ Word (OOXML) ============

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Office(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry.take(max_bytes).read_to_end(&mut out)?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Office(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::Office(e.to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    docx_paragraphs(&xml)
}

/// Walks `word/document.xml`, emitting run text in document order with one
/// line per paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tab" => out.push('\t'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Office(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Office(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ Word 97 (compound file) ============

/// FIB offsets for Word 97 and later.
const FIB_IDENT: u16 = 0xA5EC;
const FIB_FLAGS: usize = 0x000A;
const FIB_CCP_TEXT: usize = 0x004C;
const FIB_FC_CLX: usize = 0x01A2;
const FIB_LCB_CLX: usize = 0x01A6;
/// `fWhichTblStm`: the piece table lives in `1Table` rather than `0Table`.
const FIB_WHICH_TABLE: u16 = 0x0200;

fn extract_doc(bytes: &[u8]) -> Result<String, ExtractError> {
    let office = |e: std::io::Error| ExtractError::Office(e.to_string());

    let mut file = cfb::CompoundFile::open(Cursor::new(bytes)).map_err(office)?;
    let mut word = Vec::new();
    file.open_stream("/WordDocument")
        .map_err(office)?
        .read_to_end(&mut word)?;

    if read_u16(&word, 0) != Some(FIB_IDENT) {
        return Err(ExtractError::Office("not a Word 97 document".to_string()));
    }
    let flags = read_u16(&word, FIB_FLAGS).unwrap_or(0);
    let table_name = if flags & FIB_WHICH_TABLE != 0 {
        "/1Table"
    } else {
        "/0Table"
    };
    let mut table = Vec::new();
    file.open_stream(table_name)
        .map_err(office)?
        .read_to_end(&mut table)?;

    let fc_clx = read_u32(&word, FIB_FC_CLX).unwrap_or(0) as usize;
    let lcb_clx = read_u32(&word, FIB_LCB_CLX).unwrap_or(0) as usize;
    let clx = table
        .get(fc_clx..fc_clx + lcb_clx)
        .ok_or_else(|| ExtractError::Office("piece table out of bounds".to_string()))?;

    let mut text = decode_pieces(&word, clx)?;
    let ccp_text = read_u32(&word, FIB_CCP_TEXT).unwrap_or(0) as usize;
    if ccp_text > 0 && text.chars().count() > ccp_text {
        // Main document only; footnotes and headers follow it.
        text = text.chars().take(ccp_text).collect();
    }
    Ok(strip_word_controls(&text))
}

/// Decodes the text referenced by the `Pcdt` entry of a `Clx` structure.
fn decode_pieces(word: &[u8], clx: &[u8]) -> Result<String, ExtractError> {
    let bad = || ExtractError::Office("malformed piece table".to_string());

    let mut pos = 0;
    // Skip Prc entries (clxt = 0x01) preceding the Pcdt.
    while clx.get(pos) == Some(&0x01) {
        let cb = read_u16(clx, pos + 1).ok_or_else(bad)? as usize;
        pos += 3 + cb;
    }
    if clx.get(pos) != Some(&0x02) {
        return Err(bad());
    }
    let lcb = read_u32(clx, pos + 1).ok_or_else(bad)? as usize;
    let plc = clx.get(pos + 5..pos + 5 + lcb).ok_or_else(bad)?;
    if lcb < 4 {
        return Err(bad());
    }
    let pieces = (lcb - 4) / 12;

    let mut out = String::new();
    for i in 0..pieces {
        let cp_start = read_u32(plc, i * 4).ok_or_else(bad)? as usize;
        let cp_end = read_u32(plc, (i + 1) * 4).ok_or_else(bad)? as usize;
        let chars = cp_end.saturating_sub(cp_start);
        let pcd = (pieces + 1) * 4 + i * 8;
        let fc = read_u32(plc, pcd + 2).ok_or_else(bad)?;

        if fc & 0x4000_0000 != 0 {
            let start = ((fc & !0x4000_0000) / 2) as usize;
            let raw = word.get(start..start + chars).ok_or_else(bad)?;
            out.extend(raw.iter().map(|&b| cp1252_char(b)));
        } else {
            let start = fc as usize;
            let raw = word.get(start..start + chars * 2).ok_or_else(bad)?;
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            out.push_str(&String::from_utf16_lossy(&units));
        }
    }
    Ok(out)
}

/// Maps Word's in-text control characters to plain text and drops field
/// instructions, keeping field results.
fn strip_word_controls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    // Nesting depth of field-instruction regions (between 0x13 and 0x14/0x15).
    let mut in_instruction: Vec<bool> = Vec::new();
    for ch in text.chars() {
        match ch {
            '\u{13}' => in_instruction.push(true),
            '\u{14}' => {
                if let Some(top) = in_instruction.last_mut() {
                    *top = false;
                }
            }
            '\u{15}' => {
                in_instruction.pop();
            }
            _ if in_instruction.iter().any(|&i| i) => {}
            '\r' | '\u{0B}' | '\u{0C}' => out.push('\n'),
            '\u{07}' => out.push('\t'),
            '\t' | '\n' => out.push(ch),
            c if (c as u32) < 0x20 => {}
            c => out.push(c),
        }
    }
    out
}

fn cp1252_char(b: u8) -> char {
    const HIGH: [char; 32] = [
        '€', '\u{81}', '‚', 'ƒ', '„', '…', '†', '‡', 'ˆ', '‰', 'Š', '‹', 'Œ', '\u{8D}', 'Ž',
        '\u{8F}', '\u{90}', '‘', '’', '“', '”', '•', '–', '—', '˜', '™', 'š', '›', 'œ', '\u{9D}',
        'ž', 'Ÿ',
    ];
    match b {
        0x80..=0x9F => HIGH[(b - 0x80) as usize],
        _ => b as char,
    }
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

// ============ Spreadsheets ============

fn extract_spreadsheet(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| ExtractError::Office(e.to_string()))?;

    let mut out = String::new();
    for name in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| ExtractError::Office(format!("sheet {}: {}", name, e)))?;
        let formulas = workbook.worksheet_formula(&name).ok();

        out.push_str("Sheet: ");
        out.push_str(&name);
        out.push('\n');

        let (row0, col0) = range.start().unwrap_or((0, 0));
        for (r, row) in range.rows().enumerate() {
            let cells: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(c, cell)| {
                    let at = (row0 + r as u32, col0 + c as u32);
                    let formula = formulas
                        .as_ref()
                        .and_then(|f| f.get_value(at))
                        .filter(|f| !f.is_empty());
                    match (cell, formula) {
                        // No cached result: fall back to the formula text.
                        (Data::Empty, Some(f)) => format!("={}", f),
                        _ => format_cell(cell),
                    }
                })
                .filter(|v| !v.trim().is_empty())
                .collect();
            if !cells.is_empty() {
                out.push_str(&cells.join("\t"));
                out.push('\n');
            }
        }
        out.push('\n');
    }
    Ok(out)
}

/// Render one spreadsheet cell as text.
pub fn format_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => format_number(*f),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) if ts.time() == chrono::NaiveTime::MIN => ts.format("%Y-%m-%d").to_string(),
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => format_number(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(_) => "#ERROR#".to_string(),
    }
}

fn format_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}
