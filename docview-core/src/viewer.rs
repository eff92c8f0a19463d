use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::ViewerConfig;
use crate::controller::{SearchController, SearchUpdate};
use crate::engine::{build_matcher, Match};
use crate::error::SearchError;
use crate::highlight::{HighlightInjector, PaintProgress, PaintRequest};
use crate::locator::{MatchLocation, MatchLocator, NavigationStep};
use crate::surface::Surface;
use crate::window::RenderWindow;
use crate::{Command, DocumentInfo, OpenedDocument, PageNumber, PageRenderer, ScrollTarget, ViewerEvent};

/// One open document with its search pipeline.
///
/// Single-threaded and clock-driven: commands arrive through
/// [`DocumentViewer::apply`] and the host calls [`DocumentViewer::tick`]
/// regularly to advance debounce, rendering, painting and probing.
pub struct DocumentViewer {
    info: DocumentInfo,
    text: Arc<str>,
    renderer: Arc<dyn PageRenderer>,
    config: ViewerConfig,
    search: SearchController,
    window: RenderWindow,
    locator: MatchLocator,
    injector: HighlightInjector,
    surface: Surface,
    scheduled: BTreeMap<PageNumber, Instant>,
    search_open: bool,
    scroll_target: Option<ScrollTarget>,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
}

impl DocumentViewer {
    pub fn new(document: OpenedDocument, config: ViewerConfig) -> Result<Self, SearchError> {
        let OpenedDocument {
            info,
            text,
            renderer,
        } = document;
        let search = SearchController::new(Arc::clone(&text), config.search.clone())?;
        let window = RenderWindow::new(info.page_count, &config.window);
        let locator = MatchLocator::new(config.locator.clone());
        let injector = HighlightInjector::new(
            Arc::clone(&text),
            info.page_count,
            config.highlight.pages_per_step,
        );
        Ok(Self {
            info,
            text,
            renderer,
            config,
            search,
            window,
            locator,
            injector,
            surface: Surface::new(),
            scheduled: BTreeMap::new(),
            search_open: false,
            scroll_target: None,
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn window(&self) -> &RenderWindow {
        &self.window
    }

    pub fn current_page(&self) -> PageNumber {
        self.window.current_page()
    }

    pub fn query(&self) -> &str {
        self.search.query()
    }

    pub fn matches(&self) -> &[Match] {
        self.search.matches()
    }

    pub fn current_match_index(&self) -> Option<usize> {
        self.search.current_match_index()
    }

    pub fn current_match(&self) -> Option<&Match> {
        self.search.current_match()
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_searching()
    }

    pub fn case_sensitive(&self) -> bool {
        self.search.case_sensitive()
    }

    pub fn is_search_open(&self) -> bool {
        self.search_open
    }

    pub fn location(&self, match_index: usize) -> Option<MatchLocation> {
        self.locator.location(match_index)
    }

    pub fn scroll_target(&self) -> Option<ScrollTarget> {
        self.scroll_target
    }

    pub fn is_navigating(&self) -> bool {
        self.locator.pending().is_some()
    }

    /// True once nothing is waiting on a timer or the engine.
    pub fn is_idle(&self) -> bool {
        !self.search.has_pending_work()
            && self.locator.pending().is_none()
            && !self.injector.is_painting()
            && self.scheduled.is_empty()
    }

    #[instrument(skip(self, now), fields(document = %self.info.id))]
    pub fn apply(&mut self, command: Command, now: Instant) -> Result<(), SearchError> {
        match command {
            Command::SetQuery { query } => {
                self.search_open = true;
                let update = self.search.set_query(&query, now);
                self.handle_search_updates(update, now);
            }
            Command::NextMatch { count } => {
                let update = self.search.next(count);
                self.handle_search_updates(update, now);
            }
            Command::PrevMatch { count } => {
                let update = self.search.previous(count);
                self.handle_search_updates(update, now);
            }
            Command::JumpTo { index } => {
                let update = self.search.jump_to(index)?;
                self.handle_search_updates(Some(update), now);
            }
            Command::ToggleCaseSensitive => {
                let enabled = !self.search.case_sensitive();
                let update = self.search.set_case_sensitive(enabled, now);
                self.handle_search_updates(update, now);
            }
            Command::CloseSearch => self.close_search(),
            Command::ObservePage { page, ratio } => {
                if let Some(page) = self.window.observe(page, ratio) {
                    self.push_event(ViewerEvent::CurrentPageChanged(page));
                }
            }
            Command::GotoPage { page } => {
                let page = page.clamp(1, self.info.page_count.max(1));
                if self.window.set_current_page(page) {
                    self.push_event(ViewerEvent::CurrentPageChanged(page));
                }
                self.scroll_to(ScrollTarget::Page { page });
            }
        }
        Ok(())
    }

    /// Advances every timer-driven part of the pipeline to `now`.
    pub fn tick(&mut self, now: Instant) {
        let updates = self.search.poll(now);
        self.handle_search_updates(updates, now);

        self.sync_materialized(now);

        if self.injector.step(&mut self.surface, self.search.generation()) == PaintProgress::Finished
        {
            self.locator.record_painted(&self.surface);
        }

        let selected = self.search.current_match_index();
        if let Some(step) = self.locator.poll(now, selected, &self.surface) {
            self.handle_navigation(step);
        }
    }

    /// Ticks at `interval` until idle or until `limit` of simulated time has
    /// passed, blocking briefly on the engine when a search is in flight.
    /// Returns the simulated time reached.
    pub fn run_until_idle(&mut self, start: Instant, interval: Duration, limit: Duration) -> Instant {
        let interval = interval.max(Duration::from_millis(1));
        let mut now = start;
        while now.duration_since(start) <= limit {
            self.tick(now);
            if self.is_idle() {
                break;
            }
            if self.search.has_pending_work() {
                let updates = self.search.settle(now, Duration::from_millis(50));
                self.handle_search_updates(updates, now);
            }
            now += interval;
        }
        now
    }

    fn handle_search_updates<I>(&mut self, updates: I, now: Instant)
    where
        I: IntoIterator<Item = SearchUpdate>,
    {
        for update in updates {
            match update {
                SearchUpdate::MatchesChanged { count } => {
                    debug!(count, query = self.search.query(), "matches changed");
                    self.locator.reset();
                    self.push_event(ViewerEvent::MatchesChanged { count });
                    self.repaint();
                    if let Some(index) = self.search.current_match_index() {
                        self.push_event(ViewerEvent::SelectionChanged { index });
                        self.navigate(index, now);
                    }
                }
                SearchUpdate::SelectionChanged { index } => {
                    self.push_event(ViewerEvent::SelectionChanged { index });
                    self.repaint();
                    self.navigate(index, now);
                }
                SearchUpdate::Cleared => {
                    self.locator.reset();
                    self.injector.clear(&mut self.surface);
                    self.push_event(ViewerEvent::MatchesChanged { count: 0 });
                }
            }
        }
    }

    fn navigate(&mut self, index: usize, now: Instant) {
        let Some(target) = self.search.matches().get(index).cloned() else {
            return;
        };
        let step = self
            .locator
            .locate(&target, self.text.len(), self.info.page_count, now);
        self.handle_navigation(step);
    }

    fn handle_navigation(&mut self, step: NavigationStep) {
        match step {
            NavigationStep::Expand { center, radius, .. } => {
                self.window.expand_around(center, radius);
            }
            NavigationStep::Confirmed {
                match_index,
                page,
                line,
            } => {
                if self.window.set_current_page(page) {
                    self.push_event(ViewerEvent::CurrentPageChanged(page));
                }
                self.scroll_to(ScrollTarget::Mark {
                    page,
                    line,
                    match_index,
                });
            }
            NavigationStep::FellBack { page, .. } => {
                if self.window.set_current_page(page) {
                    self.push_event(ViewerEvent::CurrentPageChanged(page));
                }
                self.scroll_to(ScrollTarget::Page { page });
            }
            NavigationStep::Discarded { .. } => {}
        }
    }

    fn scroll_to(&mut self, target: ScrollTarget) {
        self.scroll_target = Some(target);
        self.push_event(ViewerEvent::ScrollTo(target));
    }

    fn repaint(&mut self) {
        if self.search.matches().is_empty() {
            self.injector.clear(&mut self.surface);
            return;
        }
        let matcher = match build_matcher(self.search.query(), self.search.case_sensitive()) {
            Ok(matcher) => matcher,
            Err(err) => {
                warn!(%err, "cannot highlight query");
                self.injector.clear(&mut self.surface);
                return;
            }
        };
        self.injector.request(
            &self.surface,
            PaintRequest {
                generation: self.search.generation(),
                matcher,
                matches: self.search.shared_matches(),
                current: self.search.current_match_index(),
            },
        );
    }

    /// Brings the surface in line with the render window: pages that left are
    /// dropped, new pages are scheduled, and due pages are rendered.
    fn sync_materialized(&mut self, now: Instant) {
        let wanted = self.window.visible_pages();
        let mut changed = false;

        let leaving: Vec<PageNumber> = self
            .surface
            .page_numbers()
            .filter(|page| !wanted.contains(page))
            .collect();
        for page in leaving {
            self.surface.remove(page);
            changed = true;
        }
        self.scheduled.retain(|page, _| wanted.contains(page));

        let latency = self.config.render.latency;
        for page in &wanted {
            if !self.surface.contains(*page) {
                self.scheduled.entry(*page).or_insert(now + latency);
            }
        }

        let due: Vec<PageNumber> = self
            .scheduled
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(page, _)| *page)
            .collect();
        if !due.is_empty() {
            for page in &due {
                self.scheduled.remove(page);
            }
            match self.renderer.render_pages(&due) {
                Ok(pages) => {
                    debug!(count = pages.len(), "materialized pages");
                    for page in pages {
                        if wanted.contains(&page.number()) {
                            self.surface.insert(page);
                            changed = true;
                        }
                    }
                }
                Err(err) => {
                    warn!(?err, pages = ?due, "failed to render pages, retrying");
                    let retry_at = now + self.config.render.retry_delay;
                    for page in due {
                        self.scheduled.insert(page, retry_at);
                    }
                }
            }
        }

        if changed && !self.search.matches().is_empty() {
            self.repaint();
        }
    }

    fn close_search(&mut self) {
        self.search.close();
        self.locator.reset();
        self.injector.clear(&mut self.surface);
        self.window.release_search_pages();
        self.search_open = false;
        self.push_event(ViewerEvent::SearchClosed);
    }

    fn push_event(&self, event: ViewerEvent) {
        self.events.lock().push(event);
    }
}
