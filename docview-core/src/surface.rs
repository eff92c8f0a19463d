//! The live rendered-pages tree.
//!
//! Pages are materialized and dropped as whole subtrees by the viewer; only
//! the highlight injector rewrites the inline nodes inside a page. Everyone
//! else reads.

use std::collections::BTreeMap;

use crate::PageNumber;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mark {
    pub match_index: usize,
    pub current: bool,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inline {
    Text(String),
    Mark(Mark),
}

impl Inline {
    pub fn as_str(&self) -> &str {
        match self {
            Inline::Text(text) => text,
            Inline::Mark(mark) => &mark.text,
        }
    }
}

/// One rendered line of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    nodes: Vec<Inline>,
}

impl TextRun {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            nodes: vec![Inline::Text(text.into())],
        }
    }

    /// Builds a run from prebuilt nodes, e.g. a page restored with its marks.
    pub fn from_nodes(nodes: Vec<Inline>) -> Self {
        let mut run = Self { nodes };
        run.normalize();
        run
    }

    pub fn nodes(&self) -> &[Inline] {
        &self.nodes
    }

    pub fn text(&self) -> String {
        self.nodes.iter().map(Inline::as_str).collect()
    }

    pub fn text_len(&self) -> usize {
        self.nodes.iter().map(|node| node.as_str().len()).sum()
    }

    pub fn marks(&self) -> impl Iterator<Item = &Mark> {
        self.nodes.iter().filter_map(|node| match node {
            Inline::Mark(mark) => Some(mark),
            Inline::Text(_) => None,
        })
    }

    pub(crate) fn replace_nodes(&mut self, nodes: Vec<Inline>) {
        self.nodes = nodes;
        self.normalize();
    }

    /// Turns every mark back into plain text and merges adjacent text nodes.
    /// Returns the number of marks removed.
    pub(crate) fn unmark(&mut self) -> usize {
        let removed = self.marks().count();
        if removed > 0 || self.nodes.len() != 1 {
            let nodes = std::mem::take(&mut self.nodes)
                .into_iter()
                .map(|node| match node {
                    Inline::Mark(mark) => Inline::Text(mark.text),
                    text => text,
                })
                .collect();
            self.replace_nodes(nodes);
        }
        removed
    }

    fn normalize(&mut self) {
        let mut merged: Vec<Inline> = Vec::with_capacity(self.nodes.len());
        for node in std::mem::take(&mut self.nodes) {
            match node {
                Inline::Text(text) if text.is_empty() => {}
                Inline::Text(text) => match merged.last_mut() {
                    Some(Inline::Text(prev)) => prev.push_str(&text),
                    _ => merged.push(Inline::Text(text)),
                },
                mark => merged.push(mark),
            }
        }
        if merged.is_empty() {
            merged.push(Inline::Text(String::new()));
        }
        self.nodes = merged;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    number: PageNumber,
    runs: Vec<TextRun>,
    source_offset: Option<usize>,
}

impl PageContent {
    pub fn new(number: PageNumber, runs: Vec<TextRun>) -> Self {
        Self {
            number,
            runs,
            source_offset: None,
        }
    }

    /// One run per line of `text`.
    pub fn from_text(number: PageNumber, text: &str) -> Self {
        Self::new(number, text.split('\n').map(TextRun::new).collect())
    }

    /// Like [`PageContent::from_text`], for a page known to start at byte
    /// `offset` of the extracted text.
    pub fn with_offset(number: PageNumber, offset: usize, text: &str) -> Self {
        Self {
            source_offset: Some(offset),
            ..Self::from_text(number, text)
        }
    }

    pub fn number(&self) -> PageNumber {
        self.number
    }

    pub fn source_offset(&self) -> Option<usize> {
        self.source_offset
    }

    pub fn runs(&self) -> &[TextRun] {
        &self.runs
    }

    pub(crate) fn runs_mut(&mut self) -> &mut [TextRun] {
        &mut self.runs
    }

    pub fn text(&self) -> String {
        let mut text = String::new();
        for (i, run) in self.runs.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            for node in run.nodes() {
                text.push_str(node.as_str());
            }
        }
        text
    }

    pub fn marks(&self) -> impl Iterator<Item = &Mark> {
        self.runs.iter().flat_map(TextRun::marks)
    }

    /// Line index of the mark carrying `match_index`.
    pub fn find_mark(&self, match_index: usize) -> Option<usize> {
        self.runs
            .iter()
            .position(|run| run.marks().any(|mark| mark.match_index == match_index))
    }

    pub(crate) fn unmark(&mut self) -> usize {
        self.runs.iter_mut().map(TextRun::unmark).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkPosition {
    pub page: PageNumber,
    pub line: usize,
}

#[derive(Debug, Default)]
pub struct Surface {
    pages: BTreeMap<PageNumber, PageContent>,
}

impl Surface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, page: PageContent) -> Option<PageContent> {
        self.pages.insert(page.number(), page)
    }

    pub fn remove(&mut self, number: PageNumber) -> Option<PageContent> {
        self.pages.remove(&number)
    }

    pub fn contains(&self, number: PageNumber) -> bool {
        self.pages.contains_key(&number)
    }

    pub fn page(&self, number: PageNumber) -> Option<&PageContent> {
        self.pages.get(&number)
    }

    pub(crate) fn page_mut(&mut self, number: PageNumber) -> Option<&mut PageContent> {
        self.pages.get_mut(&number)
    }

    pub(crate) fn pages_mut(&mut self) -> impl Iterator<Item = &mut PageContent> {
        self.pages.values_mut()
    }

    pub fn pages(&self) -> impl Iterator<Item = &PageContent> {
        self.pages.values()
    }

    pub fn page_numbers(&self) -> impl Iterator<Item = PageNumber> + '_ {
        self.pages.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn find_mark(&self, match_index: usize) -> Option<MarkPosition> {
        self.pages.values().find_map(|page| {
            page.find_mark(match_index).map(|line| MarkPosition {
                page: page.number(),
                line,
            })
        })
    }

    pub fn mark_count(&self) -> usize {
        self.pages.values().map(|page| page.marks().count()).sum()
    }
}
