use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use super::walker::DocumentFormat;

pub fn extract_text(path: &Path, format: DocumentFormat) -> Result<String> {
    match format {
        DocumentFormat::PlainText => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read text file: {}", path.display())),
        DocumentFormat::Pdf => pdf_extract::extract_text(path)
            .with_context(|| format!("Failed to extract PDF text: {}", path.display())),
        DocumentFormat::Docx => extract_docx(path),
    }
}

fn extract_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open DOCX: {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read DOCX as ZIP: {}", path.display()))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .with_context(|| format!("No word/document.xml in {}", path.display()))?
        .read_to_string(&mut xml)?;

    Ok(docx_paragraphs(&xml).join("\n"))
}

/// Text runs (`<w:t>`) grouped by paragraph (`</w:p>`), with XML entities decoded.
fn docx_paragraphs(xml: &str) -> Vec<String> {
    xml.split("</w:p>")
        .map(|paragraph| text_runs(paragraph).concat())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .collect()
}

fn text_runs(xml: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut rest = xml;

    while let Some(open) = rest.find("<w:t") {
        let after = &rest[open + 4..];
        // `<w:tab/>` and `<w:tbl>` share the prefix.
        if !after.starts_with('>') && !after.starts_with(' ') {
            rest = after;
            continue;
        }
        let Some(tag_end) = after.find('>') else { break };
        let content = &after[tag_end + 1..];
        let Some(close) = content.find("</w:t>") else { break };
        runs.push(decode_entities(&content[..close]));
        rest = &content[close + 6..];
    }

    runs
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOCUMENT_XML: &str = r#"<w:document><w:body>
<w:p><w:r><w:t>CISNR </w:t></w:r><w:r><w:t xml:space="preserve">R&amp;D centre</w:t></w:r></w:p>
<w:p><w:r><w:tab/><w:t>Second paragraph</w:t></w:r></w:p>
<w:p></w:p>
</w:body></w:document>"#;

    #[test]
    fn paragraphs_are_split_and_decoded() {
        assert_eq!(
            docx_paragraphs(DOCUMENT_XML),
            vec!["CISNR R&D centre".to_string(), "Second paragraph".to_string()]
        );
    }

    #[test]
    fn extracts_plain_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("about.md");
        std::fs::write(&path, "# CISNR\nWireless sensor networks.").unwrap();

        let text = extract_text(&path, DocumentFormat::PlainText).unwrap();
        assert!(text.contains("Wireless sensor networks."));
    }

    #[test]
    fn extracts_docx_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brochure.docx");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        writer
            .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(DOCUMENT_XML.as_bytes()).unwrap();
        writer.finish().unwrap();

        let text = extract_text(&path, DocumentFormat::Docx).unwrap();
        assert_eq!(text, "CISNR R&D centre\nSecond paragraph");
    }

    #[test]
    fn docx_without_document_part_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.docx");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        writer
            .start_file("other.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.finish().unwrap();

        assert!(extract_text(&path, DocumentFormat::Docx).is_err());
    }
}
