use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::config::SearchConfig;
use crate::engine::{EngineRequest, EngineResponse, Match, MatchWorker};
use crate::error::SearchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchUpdate {
    /// A new match list is in place; the selection was reset with it.
    MatchesChanged { count: usize },
    SelectionChanged { index: usize },
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    case_sensitive: bool,
}

#[derive(Debug)]
struct PendingQuery {
    query: String,
    due: Instant,
}

/// Owns the query, the current match list and the selected match.
///
/// Input is debounced: only the last query typed within the debounce window
/// reaches the engine. Every query change bumps a generation counter and
/// engine responses for older generations are dropped on arrival.
pub struct SearchController {
    text: Arc<str>,
    config: SearchConfig,
    worker: MatchWorker,
    query: String,
    matches: Arc<[Match]>,
    current: Option<usize>,
    searching: bool,
    debounce: Option<PendingQuery>,
    in_flight: Option<u64>,
    generation: u64,
    cache: HashMap<CacheKey, Arc<[Match]>>,
    engine_requests: usize,
}

impl SearchController {
    pub fn new(text: Arc<str>, config: SearchConfig) -> Result<Self, SearchError> {
        Ok(Self {
            text,
            config,
            worker: MatchWorker::spawn()?,
            query: String::new(),
            matches: Arc::from(Vec::new()),
            current: None,
            searching: false,
            debounce: None,
            in_flight: None,
            generation: 0,
            cache: HashMap::new(),
            engine_requests: 0,
        })
    }

    pub fn text(&self) -> &Arc<str> {
        &self.text
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    pub fn shared_matches(&self) -> Arc<[Match]> {
        Arc::clone(&self.matches)
    }

    pub fn current_match_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_match(&self) -> Option<&Match> {
        self.current.and_then(|index| self.matches.get(index))
    }

    pub fn is_searching(&self) -> bool {
        self.searching
    }

    pub fn case_sensitive(&self) -> bool {
        self.config.case_sensitive
    }

    /// Identifies the query the current match list belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of requests handed to the engine so far.
    pub fn engine_requests(&self) -> usize {
        self.engine_requests
    }

    pub fn has_pending_work(&self) -> bool {
        self.debounce.is_some() || self.in_flight.is_some()
    }

    #[instrument(skip(self, now))]
    pub fn set_query(&mut self, query: &str, now: Instant) -> Option<SearchUpdate> {
        self.query = query.to_owned();
        self.debounce = None;
        self.in_flight = None;
        self.generation += 1;

        if query.is_empty() {
            self.searching = false;
            self.current = None;
            self.matches = Arc::from(Vec::new());
            return Some(SearchUpdate::Cleared);
        }

        if query.chars().count() < self.config.min_query_len {
            debug!("query below minimum length");
            self.searching = false;
            return Some(self.replace_matches(Arc::from(Vec::new())));
        }

        if let Some(cached) = self.cache.get(&self.cache_key(query)).cloned() {
            debug!(count = cached.len(), "serving cached matches");
            self.searching = false;
            return Some(self.replace_matches(cached));
        }

        self.searching = true;
        self.debounce = Some(PendingQuery {
            query: query.to_owned(),
            due: now + self.config.debounce,
        });
        if self.matches.is_empty() {
            return None;
        }
        // Old matches belong to a different query and must not stay visible.
        Some(self.replace_matches(Arc::from(Vec::new())))
    }

    pub fn set_case_sensitive(&mut self, case_sensitive: bool, now: Instant) -> Option<SearchUpdate> {
        if self.config.case_sensitive == case_sensitive {
            return None;
        }
        self.config.case_sensitive = case_sensitive;
        let query = self.query.clone();
        self.set_query(&query, now)
    }

    /// Fires the debounce timer when due and collects engine responses.
    pub fn poll(&mut self, now: Instant) -> Vec<SearchUpdate> {
        let mut updates = Vec::new();
        if self.debounce.as_ref().is_some_and(|pending| now >= pending.due) {
            if let Some(pending) = self.debounce.take() {
                updates.extend(self.dispatch(pending.query));
            }
        }

        loop {
            match self.worker.try_recv() {
                Ok(Some(response)) => updates.extend(self.accept(response)),
                Ok(None) => break,
                Err(err) => {
                    updates.extend(self.fail_in_flight(err));
                    break;
                }
            }
        }
        updates
    }

    /// Blocks up to `timeout` for the outstanding engine response. Meant for
    /// non-interactive callers and tests.
    pub fn settle(&mut self, now: Instant, timeout: Duration) -> Vec<SearchUpdate> {
        let mut updates = self.poll(now);
        let deadline = Instant::now() + timeout;
        while self.in_flight.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.worker.recv_timeout(remaining) {
                Ok(Some(response)) => updates.extend(self.accept(response)),
                Ok(None) => break,
                Err(err) => updates.extend(self.fail_in_flight(err)),
            }
        }
        updates
    }

    /// Moves the selection `count` matches forward, wrapping at the end.
    /// A count of zero moves one match.
    pub fn next(&mut self, count: usize) -> Option<SearchUpdate> {
        let len = self.matches.len();
        if len == 0 {
            return None;
        }
        let step = count.max(1) % len;
        let index = match self.current {
            Some(current) => (current + step) % len,
            None => (step + len - 1) % len,
        };
        self.select(index)
    }

    pub fn previous(&mut self, count: usize) -> Option<SearchUpdate> {
        let len = self.matches.len();
        if len == 0 {
            return None;
        }
        let step = count.max(1) % len;
        let index = match self.current {
            Some(current) => (current + len - step) % len,
            None => (len - step) % len,
        };
        self.select(index)
    }

    pub fn jump_to(&mut self, index: usize) -> Result<SearchUpdate, SearchError> {
        let count = self.matches.len();
        if index >= count {
            return Err(SearchError::MatchOutOfRange { index, count });
        }
        self.current = Some(index);
        Ok(SearchUpdate::SelectionChanged { index })
    }

    /// Drops the query, the matches and any pending work. The cache survives.
    pub fn close(&mut self) -> SearchUpdate {
        self.set_query("", Instant::now())
            .unwrap_or(SearchUpdate::Cleared)
    }

    fn select(&mut self, index: usize) -> Option<SearchUpdate> {
        self.current = Some(index);
        Some(SearchUpdate::SelectionChanged { index })
    }

    fn cache_key(&self, query: &str) -> CacheKey {
        CacheKey {
            query: query.to_owned(),
            case_sensitive: self.config.case_sensitive,
        }
    }

    fn replace_matches(&mut self, matches: Arc<[Match]>) -> SearchUpdate {
        self.current = if matches.is_empty() { None } else { Some(0) };
        self.matches = matches;
        SearchUpdate::MatchesChanged {
            count: self.matches.len(),
        }
    }

    fn dispatch(&mut self, query: String) -> Option<SearchUpdate> {
        let request = EngineRequest {
            generation: self.generation,
            text: Arc::clone(&self.text),
            query,
            case_sensitive: self.config.case_sensitive,
            limit: self.config.max_matches,
        };
        self.engine_requests += 1;
        debug!(generation = request.generation, query = %request.query, "dispatching search");
        match self.worker.submit(request) {
            Ok(()) => {
                self.in_flight = Some(self.generation);
                None
            }
            Err(err) => {
                warn!(%err, "could not reach match engine");
                self.searching = false;
                Some(self.replace_matches(Arc::from(Vec::new())))
            }
        }
    }

    fn accept(&mut self, response: EngineResponse) -> Option<SearchUpdate> {
        if self.in_flight != Some(response.generation) {
            debug!(generation = response.generation, "dropping stale engine response");
            return None;
        }
        self.in_flight = None;
        self.searching = false;

        match response.outcome {
            Ok(set) => {
                if set.truncated {
                    debug!(count = set.count, "match list truncated at limit");
                }
                let matches: Arc<[Match]> = set.matches.into();
                self.cache.insert(
                    CacheKey {
                        query: response.query,
                        case_sensitive: response.case_sensitive,
                    },
                    Arc::clone(&matches),
                );
                Some(self.replace_matches(matches))
            }
            Err(err) => {
                warn!(%err, "match engine failed, showing no results");
                Some(self.replace_matches(Arc::from(Vec::new())))
            }
        }
    }

    fn fail_in_flight(&mut self, err: SearchError) -> Option<SearchUpdate> {
        self.in_flight.take()?;
        warn!(%err, "match engine went away mid-search");
        self.searching = false;
        Some(self.replace_matches(Arc::from(Vec::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "alpha beta alpha gamma alpha";
    const WAIT: Duration = Duration::from_secs(5);

    fn controller() -> SearchController {
        SearchController::new(Arc::from(TEXT), SearchConfig::default()).unwrap()
    }

    fn after_debounce(t0: Instant) -> Instant {
        t0 + SearchConfig::default().debounce
    }

    #[test]
    fn debounced_query_reaches_engine_once() {
        let mut search = controller();
        let t0 = Instant::now();
        search.set_query("al", t0);
        search.set_query("alp", t0 + Duration::from_millis(50));
        search.set_query("alpha", t0 + Duration::from_millis(100));
        assert!(search.is_searching());
        assert!(search.poll(t0 + Duration::from_millis(150)).is_empty());
        assert_eq!(search.engine_requests(), 0);

        let updates = search.settle(t0 + Duration::from_millis(300), WAIT);
        assert_eq!(updates, vec![SearchUpdate::MatchesChanged { count: 3 }]);
        assert_eq!(search.engine_requests(), 1);
        assert!(!search.is_searching());
        let starts: Vec<usize> = search.matches().iter().map(|m| m.start).collect();
        assert_eq!(starts, vec![0, 11, 23]);
        assert_eq!(search.current_match_index(), Some(0));
    }

    #[test]
    fn short_queries_never_reach_the_engine() {
        let mut search = controller();
        let t0 = Instant::now();
        let update = search.set_query("a", t0);
        assert_eq!(update, Some(SearchUpdate::MatchesChanged { count: 0 }));
        assert!(search.matches().is_empty());
        assert!(!search.is_searching());
        assert!(search.settle(after_debounce(t0), Duration::from_millis(50)).is_empty());
        assert_eq!(search.engine_requests(), 0);
    }

    #[test]
    fn absent_query_yields_empty_result() {
        let mut search = controller();
        let t0 = Instant::now();
        search.set_query("xyz", t0);
        let updates = search.settle(after_debounce(t0), WAIT);
        assert_eq!(updates, vec![SearchUpdate::MatchesChanged { count: 0 }]);
        assert!(search.matches().is_empty());
        assert_eq!(search.current_match_index(), None);
        assert!(!search.is_searching());
    }

    #[test]
    fn repeated_queries_are_served_from_cache() {
        let mut search = controller();
        let t0 = Instant::now();
        search.set_query("alpha", t0);
        search.settle(after_debounce(t0), WAIT);
        search.set_query("beta", t0);
        search.settle(after_debounce(t0), WAIT);
        assert_eq!(search.engine_requests(), 2);

        let update = search.set_query("alpha", t0);
        assert_eq!(update, Some(SearchUpdate::MatchesChanged { count: 3 }));
        assert!(!search.has_pending_work());
        assert_eq!(search.engine_requests(), 2);
    }

    #[test]
    fn clearing_cancels_pending_debounce() {
        let mut search = controller();
        let t0 = Instant::now();
        search.set_query("alpha", t0);
        assert_eq!(search.set_query("", t0), Some(SearchUpdate::Cleared));
        assert!(!search.is_searching());
        assert!(search.poll(after_debounce(t0)).is_empty());
        assert_eq!(search.engine_requests(), 0);
    }

    #[test]
    fn responses_for_superseded_queries_are_dropped() {
        let mut search = controller();
        let t0 = Instant::now();
        search.set_query("alpha", t0);
        search.poll(after_debounce(t0));
        assert_eq!(search.engine_requests(), 1);

        // Typed again before the response was read.
        let t1 = after_debounce(t0);
        search.set_query("gamma", t1);
        let updates = search.settle(after_debounce(t1), WAIT);
        assert_eq!(updates, vec![SearchUpdate::MatchesChanged { count: 1 }]);
        assert_eq!(search.matches()[0].text, "gamma");
    }

    #[test]
    fn engine_errors_surface_as_empty_results() {
        let config = SearchConfig {
            min_query_len: 1,
            ..SearchConfig::default()
        };
        // The literal occurs in the text, so only a failed compile yields nothing.
        let huge = "x".repeat(1 << 22);
        let mut search = SearchController::new(Arc::from(huge.as_str()), config).unwrap();
        let t0 = Instant::now();
        search.set_query(&huge, t0);
        let updates = search.settle(after_debounce(t0), WAIT);
        assert_eq!(updates, vec![SearchUpdate::MatchesChanged { count: 0 }]);
        assert!(!search.is_searching());
    }

    #[test]
    fn navigation_wraps_around() {
        let mut search = controller();
        let t0 = Instant::now();
        search.set_query("alpha", t0);
        search.settle(after_debounce(t0), WAIT);

        assert_eq!(search.next(1), Some(SearchUpdate::SelectionChanged { index: 1 }));
        assert_eq!(search.next(1), Some(SearchUpdate::SelectionChanged { index: 2 }));
        assert_eq!(search.next(1), Some(SearchUpdate::SelectionChanged { index: 0 }));
        assert_eq!(search.previous(1), Some(SearchUpdate::SelectionChanged { index: 2 }));
        assert_eq!(search.jump_to(1).unwrap(), SearchUpdate::SelectionChanged { index: 1 });
        assert!(matches!(
            search.jump_to(3),
            Err(SearchError::MatchOutOfRange { index: 3, count: 3 })
        ));
        assert_eq!(search.current_match().unwrap().start, 11);
    }

    #[test]
    fn counted_navigation_jumps_directly() {
        let mut search = controller();
        let t0 = Instant::now();
        search.set_query("alpha", t0);
        search.settle(after_debounce(t0), WAIT);

        assert_eq!(search.next(4), Some(SearchUpdate::SelectionChanged { index: 1 }));
        assert_eq!(search.previous(2), Some(SearchUpdate::SelectionChanged { index: 2 }));
        assert_eq!(search.next(0), Some(SearchUpdate::SelectionChanged { index: 0 }));
        // usize::MAX % 3 == 0, so a saturated prefix lands where it started.
        assert_eq!(
            search.next(usize::MAX),
            Some(SearchUpdate::SelectionChanged { index: 0 })
        );
        assert_eq!(
            search.previous(usize::MAX - 1),
            Some(SearchUpdate::SelectionChanged { index: 1 })
        );
    }

    #[test]
    fn navigation_without_matches_is_a_no_op() {
        let mut search = controller();
        assert_eq!(search.next(1), None);
        assert_eq!(search.previous(5), None);
    }

    #[test]
    fn case_sensitivity_reissues_the_query() {
        let mut search =
            SearchController::new(Arc::from("Alpha alpha ALPHA"), SearchConfig::default()).unwrap();
        let t0 = Instant::now();
        search.set_query("alpha", t0);
        search.settle(after_debounce(t0), WAIT);
        assert_eq!(search.matches().len(), 3);

        search.set_case_sensitive(true, t0);
        search.settle(after_debounce(t0), WAIT);
        assert_eq!(search.matches().len(), 1);
        assert_eq!(search.matches()[0].start, 6);
    }
}
