//! Literal, case-insensitive match scanning and the background worker that
//! runs it off the interactive thread.
//!
//! The worker owns nothing but its channel ends: requests carry an immutable
//! `Arc<str>` of the document text and responses carry freshly built match
//! lists, so no state is shared with the caller while a scan runs.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SearchError;

pub const DEFAULT_MATCH_LIMIT: usize = 1000;

const SNIPPET_BEFORE: usize = 50;
const SNIPPET_AFTER: usize = 150;

/// One occurrence of the query. `start..end` is a byte range into the text
/// the match was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Match {
    /// Context excerpt around the match, widened to char boundaries and
    /// marked with `...` where the source continues.
    pub fn snippet(&self, source: &str, before: usize, after: usize) -> String {
        if self.end > source.len() || self.start > self.end {
            return String::new();
        }

        let mut start = self.start.saturating_sub(before);
        while !source.is_char_boundary(start) {
            start -= 1;
        }
        let mut end = self.end.saturating_add(after).min(source.len());
        while !source.is_char_boundary(end) {
            end += 1;
        }

        let mut snippet = String::with_capacity(end - start + 6);
        if start > 0 {
            snippet.push_str("...");
        }
        snippet.push_str(&source[start..end]);
        if end < source.len() {
            snippet.push_str("...");
        }
        snippet
    }

    pub fn default_snippet(&self, source: &str) -> String {
        self.snippet(source, SNIPPET_BEFORE, SNIPPET_AFTER)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSet {
    pub matches: Vec<Match>,
    pub count: usize,
    /// The scan stopped at the limit with more occurrences remaining.
    pub truncated: bool,
}

/// Builds the literal matcher used both by the engine and by the highlight
/// pass, so that both agree on what an occurrence is.
pub fn build_matcher(query: &str, case_sensitive: bool) -> Result<Regex, SearchError> {
    if query.is_empty() {
        return Err(SearchError::EmptyQuery);
    }
    let matcher = RegexBuilder::new(&regex::escape(query))
        .case_insensitive(!case_sensitive)
        .build()?;
    Ok(matcher)
}

pub fn search(
    text: &str,
    query: &str,
    case_sensitive: bool,
    limit: usize,
) -> Result<MatchSet, SearchError> {
    let matcher = build_matcher(query, case_sensitive)?;
    Ok(collect_matches(&matcher, text, limit))
}

pub fn collect_matches(matcher: &Regex, text: &str, limit: usize) -> MatchSet {
    let mut matches: Vec<Match> = matcher
        .find_iter(text)
        .filter(|found| !found.is_empty())
        .take(limit.saturating_add(1))
        .enumerate()
        .map(|(index, found)| Match {
            index,
            start: found.start(),
            end: found.end(),
            text: found.as_str().to_owned(),
        })
        .collect();

    let truncated = matches.len() > limit;
    matches.truncate(limit);
    MatchSet {
        count: matches.len(),
        matches,
        truncated,
    }
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub generation: u64,
    pub text: Arc<str>,
    pub query: String,
    pub case_sensitive: bool,
    pub limit: usize,
}

#[derive(Debug)]
pub struct EngineResponse {
    pub generation: u64,
    pub query: String,
    pub case_sensitive: bool,
    pub outcome: Result<MatchSet, SearchError>,
}

/// Handle to the background scanning thread.
pub struct MatchWorker {
    requests: Option<Sender<EngineRequest>>,
    responses: Receiver<EngineResponse>,
    handle: Option<JoinHandle<()>>,
}

impl MatchWorker {
    pub fn spawn() -> Result<Self, SearchError> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<EngineRequest>();
        let (response_tx, response_rx) = crossbeam_channel::unbounded::<EngineResponse>();
        let handle = thread::Builder::new()
            .name("match-engine".into())
            .spawn(move || run_worker(request_rx, response_tx))
            .map_err(|err| {
                warn!(?err, "failed to spawn match engine thread");
                SearchError::WorkerUnavailable
            })?;
        Ok(Self {
            requests: Some(request_tx),
            responses: response_rx,
            handle: Some(handle),
        })
    }

    /// Queues a request, respawning the thread once if it has gone away.
    pub fn submit(&mut self, request: EngineRequest) -> Result<(), SearchError> {
        let request = match self.send(request) {
            Ok(()) => return Ok(()),
            Err(request) => request,
        };

        warn!("match engine thread is gone, respawning");
        *self = Self::spawn()?;
        self.send(request)
            .map_err(|_| SearchError::WorkerUnavailable)
    }

    fn send(&self, request: EngineRequest) -> Result<(), EngineRequest> {
        match &self.requests {
            Some(tx) => tx.send(request).map_err(|err| err.into_inner()),
            None => Err(request),
        }
    }

    /// Non-blocking receive. A disconnected worker is reported as an error so
    /// that an outstanding request is never waited on forever.
    pub fn try_recv(&self) -> Result<Option<EngineResponse>, SearchError> {
        match self.responses.try_recv() {
            Ok(response) => Ok(Some(response)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SearchError::WorkerUnavailable),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<EngineResponse>, SearchError> {
        match self.responses.recv_timeout(timeout) {
            Ok(response) => Ok(Some(response)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SearchError::WorkerUnavailable),
        }
    }
}

impl Drop for MatchWorker {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(requests: Receiver<EngineRequest>, responses: Sender<EngineResponse>) {
    while let Ok(mut request) = requests.recv() {
        // Only the newest queued request matters; older ones are already stale.
        while let Ok(newer) = requests.try_recv() {
            debug!(
                skipped = request.generation,
                next = newer.generation,
                "coalescing queued search request"
            );
            request = newer;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            search(
                &request.text,
                &request.query,
                request.case_sensitive,
                request.limit,
            )
        }))
        .unwrap_or_else(|payload| Err(SearchError::EnginePanicked(panic_message(payload))));

        let response = EngineResponse {
            generation: request.generation,
            query: request.query,
            case_sensitive: request.case_sensitive,
            outcome,
        };
        if responses.send(response).is_err() {
            break;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
