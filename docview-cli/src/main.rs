use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use docview_core::locator::estimate_page;
use docview_core::{
    Command, Confidence, DocumentInfo, DocumentProvider, DocumentViewer, MatchLocation,
    PageNumber, ScrollTarget, ViewerConfig, ViewerEvent,
};
use docview_render::{TextDocumentProvider, DEFAULT_CHARS_PER_PAGE};
use docview_tty::{
    draw_page, status_text, viewport_start, write_status_line, EventMapper, InputMode, StatusInfo,
    UiEvent,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const TICK: Duration = Duration::from_millis(20);
const BATCH_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(
    name = "docview",
    version,
    about = "Terminal text-document viewer with incremental in-document search"
)]
struct Args {
    /// Text file to open
    file: PathBuf,

    /// Run this search non-interactively and print the matches as JSON
    #[arg(short = 'q', long = "query")]
    query: Option<String>,

    /// With --query: select this match (0-based) before reporting
    #[arg(short = 'j', long = "jump", requires = "query")]
    jump: Option<usize>,

    /// With --query: navigate to every match so each reported page is confirmed
    #[arg(long = "resolve-all", requires = "query")]
    resolve_all: bool,

    /// Match case exactly
    #[arg(short = 'c', long = "case-sensitive")]
    case_sensitive: bool,

    /// Page to open the document on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<PageNumber>,

    /// Characters per page when paginating
    #[arg(long = "chars-per-page", default_value_t = DEFAULT_CHARS_PER_PAGE)]
    chars_per_page: usize,

    /// Configuration file (defaults to config.toml in the platform config dir)
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "docview", "docview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let mut config = load_config(args.config.as_deref())?;
    if args.case_sensitive {
        config.search.case_sensitive = true;
    }

    let provider = TextDocumentProvider::with_chars_per_page(args.chars_per_page);
    let document = provider
        .open(&args.file)
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?;
    info!(
        path = %document.info.path.display(),
        pages = document.info.page_count,
        "opened document"
    );
    let mut viewer = DocumentViewer::new(document, config)?;

    let start = Instant::now();
    if let Some(page) = args.page {
        viewer.apply(Command::GotoPage { page }, start)?;
    }

    match args.query.clone() {
        Some(query) => run_batch(&mut viewer, &args, query, start),
        None => run_interactive(&mut viewer),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<ViewerConfig> {
    match explicit {
        Some(path) => Ok(ViewerConfig::load(path)?),
        None => match ViewerConfig::default_path() {
            Some(path) => Ok(ViewerConfig::load_or_default(&path)?),
            None => Ok(ViewerConfig::default()),
        },
    }
}

#[derive(Debug, Serialize)]
struct BatchReport<'a> {
    document: &'a DocumentInfo,
    query: &'a str,
    case_sensitive: bool,
    count: usize,
    current: Option<usize>,
    current_page: PageNumber,
    scroll_target: Option<ScrollTarget>,
    matches: Vec<MatchReport>,
}

#[derive(Debug, Serialize)]
struct MatchReport {
    index: usize,
    start: usize,
    end: usize,
    text: String,
    snippet: String,
    #[serde(flatten)]
    location: MatchLocation,
}

fn run_batch(viewer: &mut DocumentViewer, args: &Args, query: String, start: Instant) -> Result<()> {
    viewer.apply(Command::SetQuery { query }, start)?;
    let mut now = viewer.run_until_idle(start, TICK, BATCH_LIMIT);

    if args.resolve_all {
        for index in 0..viewer.matches().len() {
            viewer.apply(Command::JumpTo { index }, now)?;
            now = viewer.run_until_idle(now, TICK, BATCH_LIMIT);
        }
    }
    if let Some(index) = args.jump {
        viewer.apply(Command::JumpTo { index }, now)?;
        viewer.run_until_idle(now, TICK, BATCH_LIMIT);
    }

    let text_len = viewer.text().len();
    let page_count = viewer.info().page_count;
    let matches = viewer
        .matches()
        .iter()
        .map(|m| MatchReport {
            index: m.index,
            start: m.start,
            end: m.end,
            text: m.text.clone(),
            snippet: m.default_snippet(viewer.text()),
            location: viewer.location(m.index).unwrap_or(MatchLocation {
                page: estimate_page(m.start, text_len, page_count),
                confidence: Confidence::Estimated,
            }),
        })
        .collect();

    let report = BatchReport {
        document: viewer.info(),
        query: viewer.query(),
        case_sensitive: viewer.case_sensitive(),
        count: viewer.matches().len(),
        current: viewer.current_match_index(),
        current_page: viewer.current_page(),
        scroll_target: viewer.scroll_target(),
        matches,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, &report)?;
    writeln!(out)?;
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

fn run_interactive(viewer: &mut DocumentViewer) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide, Clear(ClearType::All))?;

    let events = viewer.events();
    let mut mapper = EventMapper::new();
    let mut focus_line = 0;
    let mut dirty = true;

    loop {
        let now = Instant::now();
        viewer.tick(now);

        let published: Vec<ViewerEvent> = events.lock().drain(..).collect();
        for event in published {
            match event {
                ViewerEvent::ScrollTo(ScrollTarget::Mark { line, .. }) => focus_line = line,
                ViewerEvent::ScrollTo(ScrollTarget::Page { .. }) => focus_line = 0,
                _ => {}
            }
            dirty = true;
        }

        if dirty || !viewer.is_idle() {
            redraw(&mut stdout, viewer, focus_line, mapper.pending_input())?;
            dirty = false;
        }

        if event::poll(TICK)? {
            let ui_event = mapper.map_event(event::read()?);
            match handle_event(ui_event, viewer, &mut mapper, Instant::now()) {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
        }
    }

    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    Ok(())
}

fn handle_event(
    event: UiEvent,
    viewer: &mut DocumentViewer,
    mapper: &mut EventMapper,
    now: Instant,
) -> LoopAction {
    let command = match event {
        UiEvent::Quit => return LoopAction::Quit,
        UiEvent::None => return LoopAction::Continue,
        UiEvent::BeginSearch => return LoopAction::ContinueRedraw,
        UiEvent::ScrollPages { delta } => {
            let last = i64::from(viewer.info().page_count.max(1));
            let target = i64::from(viewer.current_page())
                .saturating_add(delta)
                .clamp(1, last);
            Command::GotoPage {
                page: PageNumber::try_from(target).unwrap_or(1),
            }
        }
        UiEvent::SearchQueryChanged { query } => Command::SetQuery { query },
        UiEvent::SearchSubmit { query } => {
            mapper.set_mode(InputMode::Normal);
            if query == viewer.query() {
                return LoopAction::ContinueRedraw;
            }
            Command::SetQuery { query }
        }
        UiEvent::SearchCancel => Command::CloseSearch,
        UiEvent::Command(command) => command,
    };

    if let Err(err) = viewer.apply(command, now) {
        warn!(%err, "command rejected");
    }
    LoopAction::ContinueRedraw
}

fn redraw(
    stdout: &mut io::Stdout,
    viewer: &DocumentViewer,
    focus_line: usize,
    pending_input: Option<String>,
) -> Result<()> {
    let (columns, rows) = terminal::size()?;
    let text_rows = rows.saturating_sub(1).max(1);
    let page = viewer.surface().page(viewer.current_page());
    let total_lines = page.map_or(0, |page| page.runs().len());
    let first_line = viewport_start(focus_line, usize::from(text_rows), total_lines);
    draw_page(stdout, page, first_line, columns, text_rows)?;

    let status = StatusInfo {
        page: viewer.current_page(),
        page_count: viewer.info().page_count,
        query: Some(viewer.query()),
        current_match: viewer.current_match_index(),
        match_count: viewer.matches().len(),
        searching: viewer.is_searching(),
        case_sensitive: viewer.case_sensitive(),
        pending_input,
    };
    write_status_line(stdout, text_rows, &status_text(&status))?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory at {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::never(log_dir, "docview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // stdout carries the page or the JSON report.
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_requires_a_query() {
        assert!(Args::try_parse_from(["docview", "notes.txt", "--jump", "2"]).is_err());
        let args =
            Args::try_parse_from(["docview", "notes.txt", "-q", "alpha", "-j", "2"]).unwrap();
        assert_eq!(args.jump, Some(2));
        assert_eq!(args.chars_per_page, DEFAULT_CHARS_PER_PAGE);
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("config.toml");
        fs::write(&path, "[search]\nmin_query_len = 3\n").unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().search.min_query_len, 3);
    }
}
