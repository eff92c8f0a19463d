use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::config::LocatorConfig;
use crate::engine::Match;
use crate::surface::Surface;
use crate::PageNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Estimated,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchLocation {
    pub page: PageNumber,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    Widened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNavigation {
    pub match_index: usize,
    pub target_page: PageNumber,
    pub attempts: u32,
    pub max_attempts: u32,
    pub phase: Phase,
    due: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationStep {
    /// Materialize `center ± radius` before the next probe.
    Expand {
        match_index: usize,
        center: PageNumber,
        radius: u32,
    },
    Confirmed {
        match_index: usize,
        page: PageNumber,
        line: usize,
    },
    /// Budget exhausted; scroll to the best guess without focusing a mark.
    FellBack {
        match_index: usize,
        page: PageNumber,
    },
    /// The selection moved on before this navigation completed.
    Discarded {
        match_index: usize,
    },
}

/// Proportional page estimate for a byte offset.
pub fn estimate_page(start: usize, text_len: usize, page_count: PageNumber) -> PageNumber {
    let page_count = page_count.max(1);
    if text_len == 0 {
        return 1;
    }
    let ratio = start as f64 / text_len as f64;
    let page = (ratio * f64::from(page_count)).ceil();
    (page as PageNumber).clamp(1, page_count)
}

/// Resolves matches to pages: estimate first, then confirm by finding the
/// match's mark in rendered content, probing with growing delays and one
/// widening of the render window.
#[derive(Debug)]
pub struct MatchLocator {
    config: LocatorConfig,
    locations: HashMap<usize, MatchLocation>,
    pending: Option<PendingNavigation>,
}

impl MatchLocator {
    pub fn new(config: LocatorConfig) -> Self {
        Self {
            config,
            locations: HashMap::new(),
            pending: None,
        }
    }

    /// Forgets every location; called whenever the match list changes.
    pub fn reset(&mut self) {
        self.locations.clear();
        self.pending = None;
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(match_index = pending.match_index, "navigation cancelled");
        }
    }

    pub fn location(&self, match_index: usize) -> Option<MatchLocation> {
        self.locations.get(&match_index).copied()
    }

    pub fn pending(&self) -> Option<&PendingNavigation> {
        self.pending.as_ref()
    }

    /// Starts navigating to `target`, superseding any navigation in flight.
    #[instrument(skip(self, target), fields(match_index = target.index))]
    pub fn locate(
        &mut self,
        target: &Match,
        text_len: usize,
        page_count: PageNumber,
        now: Instant,
    ) -> NavigationStep {
        let page = match self.locations.get(&target.index) {
            Some(location) if location.confidence == Confidence::Confirmed => location.page,
            _ => {
                let page = estimate_page(target.start, text_len, page_count);
                self.locations.insert(
                    target.index,
                    MatchLocation {
                        page,
                        confidence: Confidence::Estimated,
                    },
                );
                page
            }
        };

        if let Some(previous) = self.pending.as_ref() {
            debug!(
                superseded = previous.match_index,
                "replacing in-flight navigation"
            );
        }
        self.pending = Some(PendingNavigation {
            match_index: target.index,
            target_page: page,
            attempts: 0,
            max_attempts: self.config.max_attempts.max(1),
            phase: Phase::Initial,
            due: now + self.config.probe_delay,
        });

        NavigationStep::Expand {
            match_index: target.index,
            center: page,
            radius: self.config.initial_radius,
        }
    }

    /// Runs the probe if it is due. `selected` is the session's current match.
    pub fn poll(
        &mut self,
        now: Instant,
        selected: Option<usize>,
        surface: &Surface,
    ) -> Option<NavigationStep> {
        if now < self.pending.as_ref()?.due {
            return None;
        }
        let pending = self.pending.take()?;
        let match_index = pending.match_index;

        if selected != Some(match_index) {
            debug!(match_index, ?selected, "discarding stale navigation");
            return Some(NavigationStep::Discarded { match_index });
        }

        if let Some(position) = surface.find_mark(match_index) {
            self.confirm(match_index, position.page);
            debug!(match_index, page = position.page, "match location confirmed");
            return Some(NavigationStep::Confirmed {
                match_index,
                page: position.page,
                line: position.line,
            });
        }

        let attempts = pending.attempts + 1;
        if attempts < pending.max_attempts {
            self.pending = Some(PendingNavigation {
                attempts,
                due: now + self.retry_delay(attempts),
                ..pending
            });
            return None;
        }

        match pending.phase {
            Phase::Initial if self.config.widened_attempts > 0 => {
                debug!(
                    match_index,
                    radius = self.config.widened_radius,
                    "widening search window"
                );
                self.pending = Some(PendingNavigation {
                    attempts: 0,
                    max_attempts: self.config.widened_attempts,
                    phase: Phase::Widened,
                    due: now + self.config.probe_delay,
                    ..pending
                });
                Some(NavigationStep::Expand {
                    match_index,
                    center: pending.target_page,
                    radius: self.config.widened_radius,
                })
            }
            _ => {
                warn!(
                    match_index,
                    page = pending.target_page,
                    "match not found in rendered pages, falling back to estimate"
                );
                Some(NavigationStep::FellBack {
                    match_index,
                    page: pending.target_page,
                })
            }
        }
    }

    /// Upgrades every mark currently painted to a confirmed location.
    pub fn record_painted(&mut self, surface: &Surface) -> usize {
        let observed: Vec<(usize, PageNumber)> = surface
            .pages()
            .flat_map(|page| page.marks().map(move |mark| (mark.match_index, page.number())))
            .collect();
        let mut upgraded = 0;
        for (match_index, page) in observed {
            if self.location(match_index).map(|l| l.confidence) != Some(Confidence::Confirmed) {
                self.confirm(match_index, page);
                upgraded += 1;
            }
        }
        upgraded
    }

    fn confirm(&mut self, match_index: usize, page: PageNumber) {
        self.locations.insert(
            match_index,
            MatchLocation {
                page,
                confidence: Confidence::Confirmed,
            },
        );
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.config.probe_delay + self.config.retry_step * attempt
    }
}
