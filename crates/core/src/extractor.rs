use crate::chunking::clean_text;
use crate::error::IngestError;
use crate::models::{DocumentKind, TextUnit};
use lopdf::Document;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

const DOCX_BODY_PART: &str = "word/document.xml";

pub trait DocumentExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<TextUnit>, IngestError>;
}

/// One unit per non-blank page, pages numbered from 1 in document order.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl DocumentExtractor for PdfExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<TextUnit>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::extraction(path, error))?;

        let mut units = Vec::new();
        for page_no in document.get_pages().keys().copied() {
            let text = document.extract_text(&[page_no]).map_err(|error| {
                IngestError::extraction(path, format!("page {page_no}: {error}"))
            })?;

            if clean_text(&text).is_empty() {
                debug!(path = %path.display(), page = page_no, "skipping blank page");
                continue;
            }

            units.push(TextUnit {
                text,
                page: Some(page_no),
            });
        }

        Ok(units)
    }
}

/// All paragraphs of the document body joined by newlines, without pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocxExtractor;

impl DocumentExtractor for DocxExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<TextUnit>, IngestError> {
        let file = File::open(path).map_err(|error| IngestError::extraction(path, error))?;
        let mut archive =
            ZipArchive::new(file).map_err(|error| IngestError::extraction(path, error))?;

        let mut xml = String::new();
        archive
            .by_name(DOCX_BODY_PART)
            .map_err(|error| IngestError::extraction(path, format!("{DOCX_BODY_PART}: {error}")))?
            .read_to_string(&mut xml)
            .map_err(|error| IngestError::extraction(path, error))?;

        let paragraphs = docx_paragraphs(&xml).map_err(|error| IngestError::extraction(path, error))?;
        let text = paragraphs.join("\n");

        if clean_text(&text).is_empty() {
            debug!(path = %path.display(), "docx has no paragraph text");
            return Ok(Vec::new());
        }

        Ok(vec![TextUnit { text, page: None }])
    }
}

/// Collects the text of every `w:p` element of a WordprocessingML body.
pub fn docx_paragraphs(xml: &str) -> Result<Vec<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(element) => match element.name().as_ref() {
                b"w:p" => current.clear(),
                b"w:t" => in_text = true,
                _ => {}
            },
            Event::Empty(element) => match element.name().as_ref() {
                b"w:tab" => current.push('\t'),
                b"w:br" | b"w:cr" => current.push('\n'),
                b"w:p" => paragraphs.push(String::new()),
                _ => {}
            },
            Event::Text(text) if in_text => current.push_str(&text.unescape()?),
            Event::End(element) => match element.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(paragraphs)
}

/// Picks the extractor from the file extension and runs it.
pub fn extract_document(path: &Path) -> Result<(DocumentKind, Vec<TextUnit>), IngestError> {
    let kind = DocumentKind::from_path(path)?;
    let units = match kind {
        DocumentKind::Pdf => PdfExtractor.extract(path)?,
        DocumentKind::Docx => DocxExtractor.extract(path)?,
    };
    Ok((kind, units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{write_docx, write_pdf};
    use tempfile::tempdir;

    #[test]
    fn pdf_pages_are_numbered_and_blank_pages_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("three.pdf");
        write_pdf(&path, &["First page text", "", "Third page text"])?;

        let units = PdfExtractor.extract(&path)?;

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].page, Some(1));
        assert!(clean_text(&units[0].text).contains("First page text"));
        assert_eq!(units[1].page, Some(3));
        assert!(clean_text(&units[1].text).contains("Third page text"));
        Ok(())
    }

    #[test]
    fn docx_paragraphs_are_joined_by_newlines() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.docx");
        write_docx(&path, &["The sky is blue.", "The grass is green."])?;

        let units = DocxExtractor.extract(&path)?;

        assert_eq!(
            units,
            vec![TextUnit {
                text: "The sky is blue.\nThe grass is green.".to_string(),
                page: None,
            }]
        );
        Ok(())
    }

    #[test]
    fn docx_xml_handles_runs_tabs_and_entities() -> Result<(), Box<dyn std::error::Error>> {
        let xml = r#"<w:document><w:body>
            <w:p><w:r><w:t>Salt &amp; </w:t></w:r><w:r><w:t>pepper</w:t><w:tab/><w:t>x</w:t></w:r></w:p>
            <w:p/>
            <w:p><w:pPr><w:jc w:val="center"/></w:pPr><w:r><w:t>Last</w:t></w:r></w:p>
        </w:body></w:document>"#;

        let paragraphs = docx_paragraphs(xml)?;

        assert_eq!(paragraphs, vec!["Salt & pepper\tx", "", "Last"]);
        Ok(())
    }

    #[test]
    fn empty_docx_yields_no_units() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.docx");
        write_docx(&path, &["", "   "])?;

        assert!(DocxExtractor.extract(&path)?.is_empty());
        Ok(())
    }

    #[test]
    fn unsupported_extension_is_rejected_before_reading() {
        let result = extract_document(Path::new("/does/not/exist/readme.txt"));
        assert!(matches!(
            result,
            Err(IngestError::UnsupportedFormat { ref extension }) if extension == "txt"
        ));
    }

    #[test]
    fn corrupt_files_report_extraction_errors() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pdf = dir.path().join("broken.pdf");
        let docx = dir.path().join("broken.docx");
        std::fs::write(&pdf, b"%PDF-1.4\n%broken")?;
        std::fs::write(&docx, b"not a zip archive")?;

        for path in [&pdf, &docx] {
            match extract_document(path) {
                Err(IngestError::Extraction { path: reported, .. }) => assert_eq!(&reported, path),
                other => panic!("expected extraction error, got {other:?}"),
            }
        }
        Ok(())
    }
}
