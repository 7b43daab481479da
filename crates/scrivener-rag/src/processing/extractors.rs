//! File-format extractors: bytes + filename in, plain text out.
//!
//! Extractors are pure functions over the given buffer. They never touch
//! the network and never mutate their inputs. The registry maps a
//! detected file type (extension, case-insensitive) to exactly one
//! extractor; unknown types fail before any parsing happens.

use std::collections::HashMap;
use std::io::Read;

use crate::error::{RagError, Result};

/// Separator inserted between PDF pages so page boundaries survive
/// chunking.
pub const PAGE_SEPARATOR: char = '\u{c}';

pub trait Extractor: Send + Sync {
    /// Cheap structural check before full extraction. Returns the reason
    /// on rejection.
    fn validate(&self, bytes: &[u8]) -> std::result::Result<(), String>;

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<String>;

    /// Format-reported attributes (page count, producer, core
    /// properties). Best-effort; an empty map is fine.
    fn metadata(&self, bytes: &[u8]) -> HashMap<String, String>;

    fn format_name(&self) -> &'static str;
}

pub struct ExtractorRegistry {
    by_extension: HashMap<&'static str, Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Registry with the stock extractors: PDF, DOCX, plain text.
    pub fn new() -> Self {
        let mut by_extension: HashMap<&'static str, Box<dyn Extractor>> = HashMap::new();
        by_extension.insert("pdf", Box::new(PdfExtractor));
        by_extension.insert("docx", Box::new(DocxExtractor));
        by_extension.insert("txt", Box::new(TextExtractor));
        by_extension.insert("md", Box::new(TextExtractor));
        Self { by_extension }
    }

    pub fn supported_extensions(&self) -> Vec<&'static str> {
        let mut exts: Vec<&'static str> = self.by_extension.keys().copied().collect();
        exts.sort_unstable();
        exts
    }

    /// Look up the extractor for a filename. Unknown extensions are a
    /// validation error carrying the supported set.
    pub fn for_filename(&self, filename: &str) -> Result<&dyn Extractor> {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();

        self.by_extension
            .get(extension.as_str())
            .map(|e| e.as_ref())
            .ok_or_else(|| RagError::Validation {
                field: Some("filename".to_string()),
                message: format!(
                    "Unsupported file type '{}'. Supported: {}",
                    extension,
                    self.supported_extensions().join(", ")
                ),
                action: Some("Upload a PDF, DOCX, or plain-text file".to_string()),
                invalid_programs: Vec::new(),
                valid_programs: Vec::new(),
            })
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// PDF extraction via pdf-extract, with lopdf supplying structural
/// metadata (page count, producer).
pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn validate(&self, bytes: &[u8]) -> std::result::Result<(), String> {
        if bytes.is_empty() {
            return Err("empty file".to_string());
        }
        if !bytes.starts_with(b"%PDF-") {
            return Err("missing %PDF header".to_string());
        }
        Ok(())
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<String> {
        // Per-page extraction keeps page separators in the output, which
        // downstream chunking treats as hard paragraph breaks.
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| {
            RagError::validation_field(
                "file",
                format!("Could not extract text from PDF '{}': {}", filename, e),
                "Check that the PDF is not encrypted or image-only",
            )
        })?;

        let mut text = String::new();
        for (i, page) in pages.iter().enumerate() {
            let cleaned = clean_extracted_text(page);
            if i > 0 {
                text.push(PAGE_SEPARATOR);
                text.push('\n');
            }
            text.push_str(&cleaned);
        }

        if text.trim().is_empty() {
            return Err(RagError::validation_field(
                "file",
                format!("PDF '{}' contains no extractable text", filename),
                "Scanned PDFs need OCR before upload",
            ));
        }
        Ok(text)
    }

    fn metadata(&self, bytes: &[u8]) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        if let Ok(doc) = lopdf::Document::load_mem(bytes) {
            meta.insert("page_count".to_string(), doc.get_pages().len().to_string());
            if let Ok(info_ref) = doc.trailer.get(b"Info") {
                if let Ok(info) = info_ref
                    .as_reference()
                    .and_then(|id| doc.get_object(id))
                    .and_then(|obj| obj.as_dict())
                {
                    for (key, label) in [(&b"Title"[..], "title"), (&b"Producer"[..], "producer")] {
                        if let Ok(lopdf::Object::String(raw, _)) = info.get(key) {
                            if let Ok(s) = std::str::from_utf8(raw) {
                                if !s.is_empty() {
                                    meta.insert(label.to_string(), s.to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
        meta
    }

    fn format_name(&self) -> &'static str {
        "pdf"
    }
}

/// DOCX extraction: word/document.xml streamed with quick-xml. Paragraph
/// text and table cells come out in reading order because table cells
/// nest ordinary paragraphs.
pub struct DocxExtractor;

impl DocxExtractor {
    fn document_xml(bytes: &[u8]) -> Result<String> {
        let cursor = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(cursor).map_err(|e| {
            RagError::validation_field(
                "file",
                format!("Not a valid DOCX archive: {}", e),
                "Re-save the document as .docx and retry",
            )
        })?;

        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|_| {
                RagError::validation_field(
                    "file",
                    "DOCX is missing word/document.xml",
                    "Re-save the document as .docx and retry",
                )
            })?
            .read_to_string(&mut xml)
            .map_err(|e| RagError::internal(format!("Failed reading document.xml: {}", e)))?;
        Ok(xml)
    }

    fn extract_xml_text(xml: &str) -> String {
        use quick_xml::events::Event;

        let mut reader = quick_xml::Reader::from_str(xml);
        let mut text = String::new();
        let mut in_text_run = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    if e.local_name().as_ref() == b"t" {
                        in_text_run = true;
                    }
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"t" => in_text_run = false,
                    // Paragraph end, table cell end, explicit line break
                    b"p" => text.push('\n'),
                    b"tc" => text.push('\t'),
                    _ => {}
                },
                Ok(Event::Empty(e)) => {
                    if e.local_name().as_ref() == b"br" {
                        text.push('\n');
                    }
                }
                Ok(Event::Text(t)) => {
                    if in_text_run {
                        if let Ok(s) = t.unescape() {
                            text.push_str(&s);
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(_) => break,
                _ => {}
            }
        }

        clean_extracted_text(&text)
    }
}

impl Extractor for DocxExtractor {
    fn validate(&self, bytes: &[u8]) -> std::result::Result<(), String> {
        if bytes.is_empty() {
            return Err("empty file".to_string());
        }
        // DOCX is a ZIP container: PK magic.
        if !bytes.starts_with(b"PK") {
            return Err("not a ZIP container".to_string());
        }
        Ok(())
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<String> {
        let xml = Self::document_xml(bytes)?;
        let text = Self::extract_xml_text(&xml);
        if text.trim().is_empty() {
            return Err(RagError::validation_field(
                "file",
                format!("DOCX '{}' contains no extractable text", filename),
                "Check that the document body is not empty",
            ));
        }
        Ok(text)
    }

    fn metadata(&self, bytes: &[u8]) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        if let Ok(xml) = Self::document_xml(bytes) {
            let paragraph_count = xml.matches("</w:p>").count();
            let table_count = xml.matches("<w:tbl>").count();
            meta.insert("paragraph_count".to_string(), paragraph_count.to_string());
            if table_count > 0 {
                meta.insert("table_count".to_string(), table_count.to_string());
            }
        }
        meta
    }

    fn format_name(&self) -> &'static str {
        "docx"
    }
}

/// Plain text with encoding auto-detection: UTF-8 first, Latin-1
/// fallback. Latin-1 maps every byte to the code point of the same
/// value, so the fallback cannot fail; empty input is still rejected.
pub struct TextExtractor;

impl TextExtractor {
    fn decode(bytes: &[u8]) -> String {
        match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

impl Extractor for TextExtractor {
    fn validate(&self, bytes: &[u8]) -> std::result::Result<(), String> {
        if bytes.is_empty() {
            return Err("empty file".to_string());
        }
        Ok(())
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<String> {
        let text = Self::decode(bytes);
        if text.trim().is_empty() {
            return Err(RagError::validation_field(
                "file",
                format!("Text file '{}' is empty", filename),
                "Upload a file with content",
            ));
        }
        Ok(text)
    }

    fn metadata(&self, bytes: &[u8]) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        let encoding = if std::str::from_utf8(bytes).is_ok() {
            "utf-8"
        } else {
            "latin-1"
        };
        meta.insert("encoding".to_string(), encoding.to_string());
        meta
    }

    fn format_name(&self) -> &'static str {
        "text"
    }
}

/// Collapse extraction artifacts: trim line ends, drop runs of blank
/// lines beyond one.
fn clean_extracted_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0usize;
    for line in raw.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_extension() {
        let registry = ExtractorRegistry::new();
        let err = registry.for_filename("photo.png").unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("png"));
    }

    #[test]
    fn registry_is_case_insensitive() {
        let registry = ExtractorRegistry::new();
        assert!(registry.for_filename("Report.PDF").is_ok());
        assert!(registry.for_filename("notes.TXT").is_ok());
    }

    #[test]
    fn text_extractor_decodes_latin1_fallback() {
        let extractor = TextExtractor;
        // 0xE9 is 'é' in Latin-1 and invalid as a lone UTF-8 byte.
        let bytes = b"r\xe9sum\xe9 narrative";
        let text = extractor.extract(bytes, "notes.txt").unwrap();
        assert_eq!(text, "résumé narrative");
        assert_eq!(extractor.metadata(bytes).get("encoding").unwrap(), "latin-1");
    }

    #[test]
    fn text_extractor_rejects_empty() {
        let extractor = TextExtractor;
        assert!(extractor.validate(b"").is_err());
        assert!(extractor.extract(b"   \n  ", "blank.txt").is_err());
    }

    #[test]
    fn pdf_validate_checks_header() {
        let extractor = PdfExtractor;
        assert!(extractor.validate(b"%PDF-1.7 rest").is_ok());
        assert!(extractor.validate(b"not a pdf").is_err());
    }

    #[test]
    fn docx_text_covers_paragraphs_and_table_cells() {
        let xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
    <w:tbl>
      <w:tr>
        <w:tc><w:p><w:r><w:t>Cell A</w:t></w:r></w:p></w:tc>
        <w:tc><w:p><w:r><w:t>Cell B</w:t></w:r></w:p></w:tc>
      </w:tr>
    </w:tbl>
    <w:p><w:r><w:t>Closing paragraph.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let text = DocxExtractor::extract_xml_text(xml);
        assert!(text.contains("First paragraph."));
        assert!(text.contains("Cell A"));
        assert!(text.contains("Cell B"));
        assert!(text.contains("Closing paragraph."));
        // Reading order preserved
        let a = text.find("Cell A").unwrap();
        let b = text.find("Cell B").unwrap();
        assert!(a < b);
    }

    #[test]
    fn clean_text_collapses_blank_runs() {
        let cleaned = clean_extracted_text("a  \n\n\n\nb\n");
        assert_eq!(cleaned, "a\n\nb");
    }
}
