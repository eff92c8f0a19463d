use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::Serialize;
use uuid::Uuid;

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod highlight;
pub mod locator;
pub mod surface;
pub mod viewer;
pub mod window;

pub use config::ViewerConfig;
pub use controller::{SearchController, SearchUpdate};
pub use engine::{Match, MatchSet, MatchWorker, DEFAULT_MATCH_LIMIT};
pub use error::{ConfigError, SearchError};
pub use highlight::HighlightInjector;
pub use locator::{Confidence, MatchLocation, MatchLocator};
pub use surface::{Inline, Mark, PageContent, Surface, TextRun};
pub use viewer::DocumentViewer;
pub use window::RenderWindow;

/// 1-based page number.
pub type PageNumber = u32;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f6d1a0e-52b4-5c1e-9d7a-8e2b4c6f0a19").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: PageNumber,
    pub title: Option<String>,
}

/// Produces the rendered text content of individual pages.
pub trait PageRenderer: Send + Sync {
    fn page_count(&self) -> PageNumber;

    fn render_page(&self, page: PageNumber) -> Result<PageContent>;

    fn render_pages(&self, pages: &[PageNumber]) -> Result<Vec<PageContent>> {
        pages.iter().map(|page| self.render_page(*page)).collect()
    }
}

/// A document ready for viewing: its extracted text and a way to render
/// its pages.
pub struct OpenedDocument {
    pub info: DocumentInfo,
    pub text: Arc<str>,
    pub renderer: Arc<dyn PageRenderer>,
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<OpenedDocument>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetQuery { query: String },
    NextMatch { count: usize },
    PrevMatch { count: usize },
    JumpTo { index: usize },
    ToggleCaseSensitive,
    CloseSearch,
    /// Viewport intersection report for a page, `ratio` in `0.0..=1.0`.
    ObservePage { page: PageNumber, ratio: f32 },
    GotoPage { page: PageNumber },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScrollTarget {
    /// Center the mark for `match_index`, found on `line` of `page`.
    Mark {
        page: PageNumber,
        line: usize,
        match_index: usize,
    },
    /// Scroll to the top of `page`; used when no mark could be found.
    Page { page: PageNumber },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    MatchesChanged { count: usize },
    SelectionChanged { index: usize },
    ScrollTo(ScrollTarget),
    CurrentPageChanged(PageNumber),
    SearchClosed,
}
