use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, trace};

use crate::engine::Match;
use crate::surface::{Inline, Mark, PageContent, Surface};
use crate::PageNumber;

/// Everything a paint pass needs, captured at request time.
#[derive(Debug, Clone)]
pub struct PaintRequest {
    /// Query generation the matches belong to.
    pub generation: u64,
    pub matcher: Regex,
    pub matches: Arc<[Match]>,
    pub current: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintAdmission {
    Started,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintProgress {
    Idle,
    InProgress,
    Finished,
    /// The pass belonged to an older query and was thrown away.
    Abandoned,
}

struct PaintPass {
    request: PaintRequest,
    queue: VecDeque<PageNumber>,
}

/// Wraps query occurrences on materialized pages in marks, and unwraps them
/// again.
///
/// A pass covers the pages present when it starts and advances a few pages
/// per [`HighlightInjector::step`]. While a pass runs, further requests wait
/// in a single deferred slot (latest wins).
pub struct HighlightInjector {
    text: Arc<str>,
    page_count: PageNumber,
    pages_per_step: usize,
    anchors: HashMap<PageNumber, Option<usize>>,
    active: Option<PaintPass>,
    deferred: Option<PaintRequest>,
}

impl HighlightInjector {
    pub fn new(text: Arc<str>, page_count: PageNumber, pages_per_step: usize) -> Self {
        Self {
            text,
            page_count: page_count.max(1),
            pages_per_step: pages_per_step.max(1),
            anchors: HashMap::new(),
            active: None,
            deferred: None,
        }
    }

    pub fn is_painting(&self) -> bool {
        self.active.is_some()
    }

    pub fn request(&mut self, surface: &Surface, request: PaintRequest) -> PaintAdmission {
        if self.active.is_some() {
            trace!(generation = request.generation, "deferring paint request");
            self.deferred = Some(request);
            return PaintAdmission::Deferred;
        }
        self.start(surface, request);
        PaintAdmission::Started
    }

    fn start(&mut self, surface: &Surface, request: PaintRequest) {
        let queue: VecDeque<PageNumber> = surface.page_numbers().collect();
        debug!(
            generation = request.generation,
            pages = queue.len(),
            matches = request.matches.len(),
            "starting paint pass"
        );
        self.active = Some(PaintPass { request, queue });
    }

    /// Advances the active pass. `live_generation` is the query generation
    /// the caller currently displays; a pass for any other generation is
    /// abandoned and its marks removed.
    pub fn step(&mut self, surface: &mut Surface, live_generation: u64) -> PaintProgress {
        let Some(pass) = self.active.as_mut() else {
            return PaintProgress::Idle;
        };

        if pass.request.generation != live_generation {
            debug!(
                stale = pass.request.generation,
                live = live_generation,
                "abandoning stale paint pass"
            );
            self.active = None;
            unmark_all(surface);
            if let Some(next) = self.deferred.take() {
                self.start(surface, next);
            }
            return PaintProgress::Abandoned;
        }

        for _ in 0..self.pages_per_step {
            let Some(number) = pass.queue.pop_front() else {
                break;
            };
            let Some(page) = surface.page_mut(number) else {
                continue;
            };
            let anchor = *self
                .anchors
                .entry(number)
                .or_insert_with(|| align_page(&self.text, page, self.page_count));
            let painted = paint_page(page, anchor, &pass.request);
            trace!(page = number, painted, "painted page");
        }

        if !pass.queue.is_empty() {
            return PaintProgress::InProgress;
        }

        self.active = None;
        if let Some(next) = self.deferred.take() {
            self.start(surface, next);
        }
        PaintProgress::Finished
    }

    /// Runs `request` to completion, finishing or abandoning whatever pass
    /// was already underway first.
    pub fn paint(&mut self, surface: &mut Surface, request: PaintRequest) {
        let generation = request.generation;
        self.request(surface, request);
        while self.active.is_some() {
            self.step(surface, generation);
        }
    }

    /// Removes every mark and drops any pending pass. Idempotent.
    pub fn clear(&mut self, surface: &mut Surface) {
        self.active = None;
        self.deferred = None;
        unmark_all(surface);
    }
}

fn unmark_all(surface: &mut Surface) {
    let removed: usize = surface.pages_mut().map(PageContent::unmark).sum();
    if removed > 0 {
        debug!(removed, "cleared highlight marks");
    }
}

/// Byte offset of the page's text inside the extracted text, used to number
/// marks with the engine's global indices.
///
/// The renderer's recorded offset wins when it checks out. Otherwise the
/// occurrence closest to where the page should start proportionally is used,
/// so text repeated elsewhere in the document does not capture the page.
fn align_page(text: &str, page: &PageContent, page_count: PageNumber) -> Option<usize> {
    let page_text = page.text();
    if page_text.trim().is_empty() {
        return None;
    }
    if let Some(offset) = page.source_offset() {
        let recorded = offset
            .checked_add(page_text.len())
            .and_then(|end| text.get(offset..end));
        if recorded == Some(page_text.as_str()) {
            return Some(offset);
        }
        debug!(page = page.number(), offset, "recorded page offset does not match text");
    }

    let expected = expected_offset(text.len(), page.number(), page_count);
    let anchor = text
        .match_indices(page_text.as_str())
        .map(|(at, _)| at)
        .min_by_key(|at| at.abs_diff(expected));
    if anchor.is_none() {
        debug!(page = page.number(), "page text not found in extracted text");
    }
    anchor
}

fn expected_offset(text_len: usize, page: PageNumber, page_count: PageNumber) -> usize {
    let before = u64::from(page.saturating_sub(1).min(page_count));
    let offset = (text_len as u64).saturating_mul(before) / u64::from(page_count.max(1));
    usize::try_from(offset).unwrap_or(text_len)
}

fn paint_page(page: &mut PageContent, anchor: Option<usize>, request: &PaintRequest) -> usize {
    page.unmark();
    let Some(anchor) = anchor else {
        return 0;
    };

    let mut painted = 0;
    let mut run_offset = anchor;
    for run in page.runs_mut() {
        let text = run.text();
        let mut nodes = Vec::new();
        let mut cursor = 0;
        for found in request.matcher.find_iter(&text) {
            if found.is_empty() {
                continue;
            }
            let Some(index) = match_index_at(&request.matches, run_offset + found.start()) else {
                continue;
            };
            if found.start() > cursor {
                nodes.push(Inline::Text(text[cursor..found.start()].to_owned()));
            }
            nodes.push(Inline::Mark(Mark {
                match_index: index,
                current: request.current == Some(index),
                text: found.as_str().to_owned(),
            }));
            cursor = found.end();
            painted += 1;
        }
        if !nodes.is_empty() {
            if cursor < text.len() {
                nodes.push(Inline::Text(text[cursor..].to_owned()));
            }
            run.replace_nodes(nodes);
        }
        run_offset += text.len() + 1;
    }
    painted
}

fn match_index_at(matches: &[Match], start: usize) -> Option<usize> {
    matches
        .binary_search_by_key(&start, |m| m.start)
        .ok()
        .map(|position| matches[position].index)
}
