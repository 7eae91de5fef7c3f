//! Document format parsers.
//!
//! Each supported file extension maps to a factory producing a fresh
//! [`DocumentParser`]. A parser turns the raw file into plain UTF-8 text and
//! remembers a few format-specific facts (title, page count, ...) that end up
//! in the metadata manifest.
//!
//! | Extension | Parser | Notes |
//! |-----------|--------|-------|
//! | `.txt` | [`TextParser`] | passthrough |
//! | `.md`, `.markdown` | [`MarkdownParser`] | markup stripped via `pulldown-cmark` |
//! | `.html`, `.htm` | [`HtmlParser`] | visible text via `scraper` |
//! | `.docx` | [`DocxParser`] | `word/document.xml` runs via `zip` + `quick-xml` |
//! | `.pdf` | [`PdfParser`] | `pdf-extract` |

use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use thiserror::Error;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no parser registered for extension '{0}'")]
    UnsupportedExtension(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts one document into plain text.
pub trait DocumentParser: Send {
    /// Read the whole document and return its text content as UTF-8 bytes.
    fn parse(&mut self, reader: &mut dyn Read) -> Result<Vec<u8>, ParseError>;

    /// Format-specific facts gathered by the last [`parse`](Self::parse).
    fn format_metadata(&self) -> BTreeMap<String, String>;
}

type ParserFactory = fn() -> Box<dyn DocumentParser>;

/// Extension → parser factory table. Extensions are lowercase with a leading dot.
pub struct ParserRegistry {
    factories: HashMap<String, ParserFactory>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(".txt", || Box::new(TextParser::default()));
        registry.register(".md", || Box::new(MarkdownParser::default()));
        registry.register(".markdown", || Box::new(MarkdownParser::default()));
        registry.register(".html", || Box::new(HtmlParser::default()));
        registry.register(".htm", || Box::new(HtmlParser::default()));
        registry.register(".docx", || Box::new(DocxParser::default()));
        registry.register(".pdf", || Box::new(PdfParser::default()));
        registry
    }
}

impl ParserRegistry {
    pub fn register(&mut self, extension: &str, factory: ParserFactory) {
        self.factories
            .insert(normalize_extension(extension), factory);
    }

    /// Registered extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.factories.keys().cloned().collect();
        exts.sort();
        exts
    }

    pub fn for_extension(&self, extension: &str) -> Option<Box<dyn DocumentParser>> {
        self.factories
            .get(&normalize_extension(extension))
            .map(|factory| factory())
    }

    /// Parser for `path`, chosen by its extension.
    pub fn for_path(&self, path: &str) -> Result<Box<dyn DocumentParser>, ParseError> {
        let ext = extension_of(path);
        self.for_extension(&ext)
            .ok_or(ParseError::UnsupportedExtension(ext))
    }

    pub fn is_supported(&self, path: &str) -> bool {
        self.factories.contains_key(&extension_of(path))
    }
}

fn normalize_extension(ext: &str) -> String {
    let lower = ext.to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

/// Lowercase dot-prefixed extension of the last path component, or `""`.
pub fn extension_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(i) if i > 0 => name[i..].to_lowercase(),
        _ => String::new(),
    }
}

fn read_all(reader: &mut dyn Read) -> Result<Vec<u8>, ParseError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

fn metadata(format: &str) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("format".to_string(), format.to_string());
    m
}

// ============ Plain text ============

#[derive(Default)]
pub struct TextParser {
    lines: usize,
}

impl DocumentParser for TextParser {
    fn parse(&mut self, reader: &mut dyn Read) -> Result<Vec<u8>, ParseError> {
        let bytes = read_all(reader)?;
        self.lines = String::from_utf8_lossy(&bytes).lines().count();
        Ok(bytes)
    }

    fn format_metadata(&self) -> BTreeMap<String, String> {
        let mut m = metadata("text");
        m.insert("lines".to_string(), self.lines.to_string());
        m
    }
}

// ============ Markdown ============

#[derive(Default)]
pub struct MarkdownParser {
    title: Option<String>,
    headings: usize,
}

impl DocumentParser for MarkdownParser {
    fn parse(&mut self, reader: &mut dyn Read) -> Result<Vec<u8>, ParseError> {
        use pulldown_cmark::{Event, Parser, Tag};

        let bytes = read_all(reader)?;
        let source = String::from_utf8_lossy(&bytes);

        let mut out = String::new();
        let mut heading: Option<String> = None;
        for event in Parser::new(&source) {
            match event {
                Event::Start(Tag::Heading(..)) => {
                    self.headings += 1;
                    heading = Some(String::new());
                }
                Event::End(Tag::Heading(..)) => {
                    if let Some(text) = heading.take() {
                        if self.title.is_none() && !text.trim().is_empty() {
                            self.title = Some(text.trim().to_string());
                        }
                    }
                    out.push_str("\n\n");
                }
                Event::End(Tag::Paragraph | Tag::CodeBlock(_) | Tag::BlockQuote) => {
                    out.push_str("\n\n");
                }
                Event::End(Tag::Item) => out.push('\n'),
                Event::Text(text) | Event::Code(text) => {
                    if let Some(h) = heading.as_mut() {
                        h.push_str(&text);
                    }
                    out.push_str(&text);
                }
                Event::SoftBreak | Event::HardBreak => out.push('\n'),
                _ => {}
            }
        }

        Ok(out.trim_end().as_bytes().to_vec())
    }

    fn format_metadata(&self) -> BTreeMap<String, String> {
        let mut m = metadata("markdown");
        m.insert("headings".to_string(), self.headings.to_string());
        if let Some(title) = &self.title {
            m.insert("title".to_string(), title.clone());
        }
        m
    }
}

// ============ HTML ============

#[derive(Default)]
pub struct HtmlParser {
    title: Option<String>,
}

impl DocumentParser for HtmlParser {
    fn parse(&mut self, reader: &mut dyn Read) -> Result<Vec<u8>, ParseError> {
        use scraper::{Html, Node, Selector};

        let bytes = read_all(reader)?;
        let document = Html::parse_document(&String::from_utf8_lossy(&bytes));

        if let Ok(selector) = Selector::parse("title") {
            self.title = document
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .filter(|t| !t.is_empty());
        }

        let root = match Selector::parse("body")
            .ok()
            .and_then(|s| document.select(&s).next())
        {
            Some(body) => body,
            None => document.root_element(),
        };

        let mut pieces = Vec::new();
        for node in root.descendants() {
            let Node::Text(text) = node.value() else {
                continue;
            };
            let hidden = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| e.name().to_string()))
                .is_some_and(|name| matches!(name.as_str(), "script" | "style" | "noscript"));
            let trimmed = text.trim();
            if !hidden && !trimmed.is_empty() {
                pieces.push(trimmed.to_string());
            }
        }

        Ok(pieces.join(" ").into_bytes())
    }

    fn format_metadata(&self) -> BTreeMap<String, String> {
        let mut m = metadata("html");
        if let Some(title) = &self.title {
            m.insert("title".to_string(), title.clone());
        }
        m
    }
}

// ============ DOCX ============

#[derive(Default)]
pub struct DocxParser {
    paragraphs: usize,
}

impl DocumentParser for DocxParser {
    fn parse(&mut self, reader: &mut dyn Read) -> Result<Vec<u8>, ParseError> {
        let bytes = read_all(reader)?;
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.as_slice()))
            .map_err(|e| ParseError::Ooxml(e.to_string()))?;
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|e| ParseError::Ooxml(format!("word/document.xml: {}", e)))?;
        let mut doc_xml = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ParseError::Ooxml(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }

        let (text, paragraphs) = docx_text(&doc_xml)?;
        self.paragraphs = paragraphs;
        Ok(text.into_bytes())
    }

    fn format_metadata(&self) -> BTreeMap<String, String> {
        let mut m = metadata("docx");
        m.insert("paragraphs".to_string(), self.paragraphs.to_string());
        m
    }
}

/// Concatenate `w:t` runs; each non-empty `w:p` becomes one line.
fn docx_text(xml: &[u8]) -> Result<(String, usize), ParseError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !current.trim().is_empty() {
                        paragraphs.push(current.trim().to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }

    let count = paragraphs.len();
    Ok((paragraphs.join("\n"), count))
}

// ============ PDF ============

#[derive(Default)]
pub struct PdfParser {
    pages: usize,
}

impl DocumentParser for PdfParser {
    fn parse(&mut self, reader: &mut dyn Read) -> Result<Vec<u8>, ParseError> {
        let bytes = read_all(reader)?;
        let text =
            pdf_extract::extract_text_from_mem(&bytes).map_err(|e| ParseError::Pdf(e.to_string()))?;
        // pdf-extract separates pages with form feeds.
        self.pages = text.matches('\u{c}').count().max(1);
        Ok(text.replace('\u{c}', "\n").into_bytes())
    }

    fn format_metadata(&self) -> BTreeMap<String, String> {
        let mut m = metadata("pdf");
        m.insert("pages".to_string(), self.pages.to_string());
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse_with(ext: &str, data: &[u8]) -> (String, BTreeMap<String, String>) {
        let registry = ParserRegistry::default();
        let mut parser = registry.for_extension(ext).unwrap();
        let out = parser.parse(&mut &data[..]).unwrap();
        (String::from_utf8(out).unwrap(), parser.format_metadata())
    }

    #[test]
    fn extensions_are_case_insensitive() {
        let registry = ParserRegistry::default();
        assert!(registry.is_supported("docs/README.MD"));
        assert!(registry.is_supported("page.htm"));
        assert!(!registry.is_supported("image.png"));
        assert!(!registry.is_supported("Makefile"));
        assert!(matches!(
            registry.for_path("a.png"),
            Err(ParseError::UnsupportedExtension(ext)) if ext == ".png"
        ));
    }

    #[test]
    fn extension_of_ignores_dotfiles_and_dirs() {
        assert_eq!(extension_of("a/b.c/file.TXT"), ".txt");
        assert_eq!(extension_of(".hidden"), "");
        assert_eq!(extension_of("dir.d/noext"), "");
    }

    #[test]
    fn text_passthrough() {
        let (text, meta) = parse_with(".txt", b"line one\nline two\n");
        assert_eq!(text, "line one\nline two\n");
        assert_eq!(meta["lines"], "2");
        assert_eq!(meta["format"], "text");
    }

    #[test]
    fn markdown_strips_markup() {
        let (text, meta) = parse_with(".md", b"# Solar System\n\nThe **Sun** is a `star`.\n\n## Planets\n");
        assert!(text.contains("Solar System"));
        assert!(text.contains("The Sun is a star."));
        assert!(!text.contains('#'));
        assert!(!text.contains("**"));
        assert_eq!(meta["title"], "Solar System");
        assert_eq!(meta["headings"], "2");
    }

    #[test]
    fn html_skips_scripts() {
        let html = b"<html><head><title>Atlas</title><script>var x = 1;</script></head>\
<body><h1>Maps</h1><p>Paris is in France.</p><script>track()</script></body></html>";
        let (text, meta) = parse_with(".html", html);
        assert_eq!(text, "Maps Paris is in France.");
        assert_eq!(meta["title"], "Atlas");
    }

    #[test]
    fn docx_paragraphs() {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(
                br#"<w:document xmlns:w="x"><w:body>
<w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p>
<w:p><w:r><w:t>Second &amp; last</w:t></w:r></w:p>
</w:body></w:document>"#,
            )
            .unwrap();
            zip.finish().unwrap();
        }
        let (text, meta) = parse_with(".docx", buf.get_ref());
        assert_eq!(text, "Hello world\nSecond & last");
        assert_eq!(meta["paragraphs"], "2");
    }

    #[test]
    fn broken_binaries_are_errors() {
        let registry = ParserRegistry::default();
        let mut pdf = registry.for_extension(".pdf").unwrap();
        assert!(matches!(pdf.parse(&mut &b"not a pdf"[..]), Err(ParseError::Pdf(_))));
        let mut docx = registry.for_extension("docx").unwrap();
        assert!(matches!(docx.parse(&mut &b"not a zip"[..]), Err(ParseError::Ooxml(_))));
    }
}
