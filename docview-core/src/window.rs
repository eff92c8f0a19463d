use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use tracing::debug;

use crate::config::WindowConfig;
use crate::PageNumber;

/// Decides which pages are materialized.
///
/// Two sources feed the set: the scroll window (most visible page plus a
/// buffer on each side) and pages pinned by search navigation. Pinned pages
/// only ever accumulate until [`RenderWindow::release_search_pages`].
#[derive(Debug)]
pub struct RenderWindow {
    page_count: PageNumber,
    buffer: u32,
    min_visible_ratio: f32,
    ratios: BTreeMap<PageNumber, f32>,
    current_page: PageNumber,
    scroll_pages: BTreeSet<PageNumber>,
    search_pages: BTreeSet<PageNumber>,
    revision: u64,
}

impl RenderWindow {
    pub fn new(page_count: PageNumber, config: &WindowConfig) -> Self {
        let page_count = page_count.max(1);
        let mut window = Self {
            page_count,
            buffer: config.buffer,
            min_visible_ratio: config.min_visible_ratio,
            ratios: BTreeMap::new(),
            current_page: 1,
            scroll_pages: BTreeSet::new(),
            search_pages: BTreeSet::new(),
            revision: 0,
        };
        window.recenter(1);
        window
    }

    pub fn page_count(&self) -> PageNumber {
        self.page_count
    }

    pub fn current_page(&self) -> PageNumber {
        self.current_page
    }

    /// Bumped whenever the visible set changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn visible_pages(&self) -> BTreeSet<PageNumber> {
        self.scroll_pages
            .union(&self.search_pages)
            .copied()
            .collect()
    }

    pub fn is_visible(&self, page: PageNumber) -> bool {
        self.scroll_pages.contains(&page) || self.search_pages.contains(&page)
    }

    /// Records the intersection ratio of `page` with the viewport. Returns the
    /// new current page when the most visible page changed.
    pub fn observe(&mut self, page: PageNumber, ratio: f32) -> Option<PageNumber> {
        if !(1..=self.page_count).contains(&page) {
            return None;
        }
        let ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if ratio > 0.0 {
            self.ratios.insert(page, ratio);
        } else {
            self.ratios.remove(&page);
        }

        // Pages below the threshold never take over, so a sliver of the next
        // page at the viewport edge does not flip the indicator.
        let most_visible = self
            .ratios
            .iter()
            .filter(|(_, ratio)| **ratio >= self.min_visible_ratio)
            .fold(None::<(PageNumber, f32)>, |best, (page, ratio)| match best {
                Some((_, best_ratio)) if best_ratio >= *ratio => best,
                _ => Some((*page, *ratio)),
            })
            .map(|(page, _)| page)?;

        if most_visible == self.current_page {
            return None;
        }
        self.recenter(most_visible);
        Some(most_visible)
    }

    /// Moves the current page directly, e.g. after a programmatic scroll.
    pub fn set_current_page(&mut self, page: PageNumber) -> bool {
        let page = page.clamp(1, self.page_count);
        self.ratios.clear();
        if page == self.current_page {
            return false;
        }
        self.recenter(page);
        true
    }

    /// Adds pages to the search-pinned set. Never removes anything.
    pub fn expand<I>(&mut self, pages: I) -> usize
    where
        I: IntoIterator<Item = PageNumber>,
    {
        let page_count = self.page_count;
        let added = pages
            .into_iter()
            .filter(|page| (1..=page_count).contains(page))
            .filter(|page| self.search_pages.insert(*page))
            .count();
        if added > 0 {
            self.revision += 1;
            debug!(added, pinned = self.search_pages.len(), "expanded render window");
        }
        added
    }

    pub fn expand_around(&mut self, center: PageNumber, radius: u32) -> usize {
        self.expand(page_range(center, radius, self.page_count))
    }

    /// Drops every search-pinned page; only the scroll window remains.
    pub fn release_search_pages(&mut self) {
        if !self.search_pages.is_empty() {
            self.search_pages.clear();
            self.revision += 1;
        }
    }

    fn recenter(&mut self, page: PageNumber) {
        self.current_page = page;
        let next: BTreeSet<PageNumber> = page_range(page, self.buffer, self.page_count).collect();
        if next != self.scroll_pages {
            self.scroll_pages = next;
            self.revision += 1;
        }
    }
}

/// `center ± radius`, clamped to `1..=page_count`.
pub fn page_range(center: PageNumber, radius: u32, page_count: PageNumber) -> RangeInclusive<PageNumber> {
    let center = center.clamp(1, page_count.max(1));
    let start = center.saturating_sub(radius).max(1);
    let end = center.saturating_add(radius).min(page_count.max(1));
    start..=end
}
