use std::borrow::Cow;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use docview_core::{
    document_id_for_path, DocumentInfo, DocumentProvider, OpenedDocument, PageContent,
    PageNumber, PageRenderer,
};
use encoding_rs::WINDOWS_1252;
use rayon::prelude::*;
use tracing::{debug, instrument, warn};

/// Roughly one printed page of prose.
pub const DEFAULT_CHARS_PER_PAGE: usize = 3000;

const FORM_FEED: char = '\x0c';
const TITLE_MAX_CHARS: usize = 80;

/// Opens plain-text files as paginated documents.
pub struct TextDocumentProvider {
    chars_per_page: usize,
}

impl TextDocumentProvider {
    pub fn new() -> Self {
        Self::with_chars_per_page(DEFAULT_CHARS_PER_PAGE)
    }

    pub fn with_chars_per_page(chars_per_page: usize) -> Self {
        Self {
            chars_per_page: chars_per_page.max(1),
        }
    }
}

impl Default for TextDocumentProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentProvider for TextDocumentProvider {
    #[instrument(skip(self))]
    async fn open(&self, path: &Path) -> Result<OpenedDocument> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let bytes = fs::read(&absolute).with_context(|| format!("failed to read {:?}", absolute))?;
        let text: Arc<str> = Arc::from(decode_text(&bytes).into_owned());
        let renderer = TextPageRenderer::new(Arc::clone(&text), self.chars_per_page);

        let info = DocumentInfo {
            id: document_id_for_path(&absolute),
            path: absolute,
            page_count: renderer.page_count(),
            title: title_of(&text),
        };
        debug!(pages = info.page_count, bytes = text.len(), "opened text document");
        Ok(OpenedDocument {
            info,
            text,
            renderer: Arc::new(renderer),
        })
    }
}

/// Decodes file contents as UTF-8 (BOM stripped), falling back to
/// Windows-1252 for legacy 8-bit files. Never fails.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(err) => {
            warn!(valid_up_to = err.valid_up_to(), "not UTF-8, decoding as Windows-1252");
            let (decoded, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
            decoded
        }
    }
}

/// Splits `text` into page byte ranges.
///
/// Pages break at line boundaries once `chars_per_page` would be exceeded, and
/// always at a form feed. A single line longer than the budget stays whole.
/// The newline ending a page and the form feed itself belong to no page.
/// There is always at least one page.
pub fn paginate(text: &str, chars_per_page: usize) -> Vec<Range<usize>> {
    let budget = chars_per_page.max(1);
    let mut pages = Vec::new();
    let sheets: Vec<&str> = text.split(FORM_FEED).collect();
    let last_sheet = sheets.len() - 1;
    let mut offset = 0;

    for (i, sheet) in sheets.iter().enumerate() {
        let sheet_start = offset;
        offset += sheet.len() + FORM_FEED.len_utf8();

        // A form feed ending the file does not open another page.
        if sheet.is_empty() && i == last_sheet && i > 0 {
            break;
        }

        let mut page_start = sheet_start;
        let mut page_chars = 0;
        let mut cursor = sheet_start;
        for line in sheet.split_inclusive('\n') {
            let line_chars = line.chars().count();
            if page_chars > 0 && page_chars + line_chars > budget {
                pages.push(without_newline(text, page_start..cursor));
                page_start = cursor;
                page_chars = 0;
            }
            page_chars += line_chars;
            cursor += line.len();
        }
        pages.push(without_newline(text, page_start..cursor));
    }
    pages
}

fn without_newline(text: &str, range: Range<usize>) -> Range<usize> {
    if text[range.clone()].ends_with('\n') {
        range.start..range.end - 1
    } else {
        range
    }
}

fn title_of(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.contains(FORM_FEED))
        .map(|line| line.chars().take(TITLE_MAX_CHARS).collect())
}

/// Serves page text layers straight out of the extracted text.
pub struct TextPageRenderer {
    text: Arc<str>,
    pages: Vec<Range<usize>>,
}

impl TextPageRenderer {
    pub fn new(text: Arc<str>, chars_per_page: usize) -> Self {
        let pages = paginate(&text, chars_per_page);
        Self { text, pages }
    }

    /// Byte range of `page` within the extracted text.
    pub fn page_range(&self, page: PageNumber) -> Option<Range<usize>> {
        let index = usize::try_from(page).ok()?.checked_sub(1)?;
        self.pages.get(index).cloned()
    }
}

impl PageRenderer for TextPageRenderer {
    fn page_count(&self) -> PageNumber {
        PageNumber::try_from(self.pages.len()).unwrap_or(PageNumber::MAX)
    }

    fn render_page(&self, page: PageNumber) -> Result<PageContent> {
        let range = self
            .page_range(page)
            .ok_or_else(|| anyhow!("page {} out of range", page))?;
        Ok(PageContent::with_offset(page, range.start, &self.text[range]))
    }

    #[instrument(skip(self), fields(count = pages.len()))]
    fn render_pages(&self, pages: &[PageNumber]) -> Result<Vec<PageContent>> {
        pages
            .par_iter()
            .map(|page| self.render_page(*page))
            .collect()
    }
}
