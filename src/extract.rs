//! Text extraction collaborator for the pre-processing stage.
//!
//! [`TextExtractor`] turns the bytes of a raw object into plain UTF-8 text,
//! keyed by the document's file type (its lower-cased extension).
//! [`LocalTextExtractor`] handles everything in
//! [`SUPPORTED_FILETYPES`](crate::configuration::SUPPORTED_FILETYPES):
//!
//! | File type | Method |
//! |-----------|--------|
//! | `pdf` | `pdf-extract` |
//! | `docx`, `pptx`, `xlsx` | `zip` + `quick-xml`, bounded entry reads |
//! | `md`, `txt`, `csv`, `json` | UTF-8 decode |
//! | `html`, `htm` | UTF-8 decode, tags and scripts stripped |
//!
//! Extraction is CPU-bound and synchronous; callers run it on the blocking
//! thread pool.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use thiserror::Error;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: '{0}'")]
    UnsupportedFileType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("document is not valid UTF-8")]
    Encoding,
}

/// Plain-text extraction from raw document bytes.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], file_type: &str) -> Result<String, ExtractError>;
}

/// Extractor for the bundled file formats.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTextExtractor;

impl TextExtractor for LocalTextExtractor {
    fn extract(&self, bytes: &[u8], file_type: &str) -> Result<String, ExtractError> {
        extract_text(bytes, file_type)
    }
}

pub fn extract_text(bytes: &[u8], file_type: &str) -> Result<String, ExtractError> {
    match file_type {
        "pdf" => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        "docx" => extract_docx(bytes),
        "pptx" => extract_pptx(bytes),
        "xlsx" => extract_xlsx(bytes),
        "md" | "txt" | "csv" | "json" => decode_utf8(bytes),
        "html" | "htm" => decode_utf8(bytes).map(|html| strip_html(&html)),
        other => Err(ExtractError::UnsupportedFileType(other.to_string())),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::Encoding)
}

/// Visible text of an HTML page: tags removed, `<script>`/`<style>`
/// bodies dropped, common entities decoded, block boundaries kept as
/// paragraph breaks.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            rest = "";
            break;
        };
        let tag = after[..close].trim().to_ascii_lowercase();
        rest = &after[close + 1..];

        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();

        if !tag.starts_with('/') && (name == "script" || name == "style") {
            let end = format!("</{}", name);
            match rest.to_ascii_lowercase().find(&end) {
                Some(pos) => {
                    let tail = &rest[pos..];
                    rest = tail.find('>').map(|i| &tail[i + 1..]).unwrap_or("");
                }
                None => rest = "",
            }
            continue;
        }

        if matches!(
            name.as_str(),
            "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "section"
        ) {
            out.push_str("\n\n");
        }
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    decoded
        .split("\n\n")
        .map(|para| para.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|para| !para.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries named `<prefix><n>.xml`, ordered by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<*:t>` element. A paragraph break is
/// emitted at the end of each element whose local name is `para`.
fn collect_text_runs(xml: &[u8], para: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == para && !out.is_empty() && !out.ends_with("\n\n") {
                    out.push_str("\n\n");
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim_end().to_string())
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml, b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_entry_bounded(&mut archive, &name)?;
        let text = collect_text_runs(&xml, b"p")?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        let xml = read_entry_bounded(&mut archive, "xl/sharedStrings.xml")?;
        read_shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry_bounded(&mut archive, &name)?;
        let rows = sheet_rows(&xml, &shared_strings)?;
        if !rows.is_empty() {
            sheets.push(rows.join("\n"));
        }
    }
    Ok(sheets.join("\n\n"))
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One tab-separated line per spreadsheet row. Shared-string cells are
/// resolved; other cells contribute their literal value.
fn sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    let mut cells = 0usize;

    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                let text = if shared {
                    value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i))
                        .cloned()
                } else {
                    Some(value.to_string())
                };
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    row.push(text);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn unsupported_file_type_is_an_error() {
        let err = extract_text(b"foo", "png").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFileType(ref t) if t == "png"));
    }

    #[test]
    fn invalid_binaries_are_errors() {
        assert!(matches!(
            extract_text(b"not a pdf", "pdf").unwrap_err(),
            ExtractError::Pdf(_)
        ));
        assert!(matches!(
            extract_text(b"not a zip", "docx").unwrap_err(),
            ExtractError::Ooxml(_)
        ));
    }

    #[test]
    fn text_formats_are_decoded() {
        assert_eq!(extract_text(b"\xEF\xBB\xBF# Title", "md").unwrap(), "# Title");
        assert!(matches!(
            extract_text(&[0xff, 0xfe, 0x00], "txt").unwrap_err(),
            ExtractError::Encoding
        ));
    }

    #[test]
    fn html_is_stripped() {
        let html = "<html><head><style>p { color: red }</style><script>var x = 1;</script></head>\
                    <body><h1>Title</h1><p>Fish &amp; chips</p><p>are   <b>good</b></p></body></html>";
        assert_eq!(
            extract_text(html.as_bytes(), "html").unwrap(),
            "Title\n\nFish & chips\n\nare good"
        );
    }

    #[test]
    fn docx_paragraphs_are_kept() {
        let doc = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p>
            <w:p><w:r><w:t>Second</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = zip_of(&[("word/document.xml", doc)]);
        assert_eq!(extract_text(&bytes, "docx").unwrap(), "Hello world\n\nSecond");
    }

    #[test]
    fn pptx_slides_are_ordered_numerically() {
        let slide = |text: &str| {
            format!(r#"<p:sld xmlns:a="a" xmlns:p="p"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#, text)
        };
        let s2 = slide("two");
        let s10 = slide("ten");
        let bytes = zip_of(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
        ]);
        assert_eq!(extract_text(&bytes, "pptx").unwrap(), "two\n\nten");
    }

    #[test]
    fn xlsx_cells_become_rows() {
        let shared = r#"<sst><si><t>Name</t></si><si><t>Ada</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c><v>42</v></c></row>
            <row><c t="s"><v>1</v></c></row>
        </sheetData></worksheet>"#;
        let bytes = zip_of(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        assert_eq!(extract_text(&bytes, "xlsx").unwrap(), "Name\t42\nAda");
    }
}
