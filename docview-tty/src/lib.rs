use std::io::{self, Write};

use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    queue,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use docview_core::{Command, Inline, PageContent, PageNumber};

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    /// Relative page movement; the caller resolves it against the current page.
    ScrollPages { delta: i64 },
    BeginSearch,
    SearchQueryChanged { query: String },
    SearchSubmit { query: String },
    SearchCancel,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Search,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    search_buffer: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.search_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Search => self.map_event_search(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Down, KeyModifiers::NONE)
            | (KeyCode::PageDown, _) => {
                let count = self.take_count();
                UiEvent::ScrollPages {
                    delta: i64::try_from(count).unwrap_or(i64::MAX),
                }
            }
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Up, KeyModifiers::NONE)
            | (KeyCode::PageUp, _) => {
                let count = self.take_count();
                UiEvent::ScrollPages {
                    delta: -i64::try_from(count).unwrap_or(i64::MAX),
                }
            }
            (KeyCode::Char('/'), KeyModifiers::NONE) => {
                self.set_mode(InputMode::Search);
                UiEvent::BeginSearch
            }
            (KeyCode::Char('n'), KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::NextMatch { count })
            }
            (KeyCode::Char('N'), modifiers)
                if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
            {
                let count = self.take_count();
                UiEvent::Command(Command::PrevMatch { count })
            }
            // `{count}<Enter>` selects match number `count`.
            (KeyCode::Enter, _) => match self.pending_count.take() {
                Some(number) if number > 0 => {
                    self.reset_count();
                    UiEvent::Command(Command::JumpTo { index: number - 1 })
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            (KeyCode::Char('c'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::ToggleCaseSensitive)
            }
            (KeyCode::Esc, _) => {
                self.reset_count();
                UiEvent::Command(Command::CloseSearch)
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                let page = self.pending_count.take().unwrap_or(1);
                self.reset_count();
                UiEvent::Command(Command::GotoPage {
                    page: PageNumber::try_from(page).unwrap_or(PageNumber::MAX),
                })
            }
            (KeyCode::Char('G'), KeyModifiers::SHIFT) | (KeyCode::End, _) => {
                self.reset_count();
                UiEvent::Command(Command::GotoPage {
                    page: PageNumber::MAX,
                })
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_event_search(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::SearchCancel
            }
            (KeyCode::Enter, _) => {
                let query = self.search_buffer.clone();
                self.set_mode(InputMode::Normal);
                UiEvent::SearchSubmit { query }
            }
            (KeyCode::Backspace, _) => {
                self.search_buffer.pop();
                UiEvent::SearchQueryChanged {
                    query: self.search_buffer.clone(),
                }
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.search_buffer.push(c);
                UiEvent::SearchQueryChanged {
                    query: self.search_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if matches!(self.mode, InputMode::Search) {
            return Some(format!("/{}", self.search_buffer));
        }
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStyle {
    Plain,
    Match,
    CurrentMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub style: SegmentStyle,
}

/// Flattens a page's runs into terminal lines, cut to `width` columns.
pub fn layout_page(page: &PageContent, width: usize) -> Vec<Vec<Segment>> {
    page.runs()
        .iter()
        .map(|run| {
            let mut remaining = width;
            let mut segments = Vec::new();
            for node in run.nodes() {
                if remaining == 0 {
                    break;
                }
                let (text, style) = match node {
                    Inline::Text(text) => (text.as_str(), SegmentStyle::Plain),
                    Inline::Mark(mark) if mark.current => (mark.text.as_str(), SegmentStyle::CurrentMatch),
                    Inline::Mark(mark) => (mark.text.as_str(), SegmentStyle::Match),
                };
                let visible: String = text
                    .chars()
                    .filter(|c| !c.is_control())
                    .take(remaining)
                    .collect();
                remaining -= visible.chars().count();
                if !visible.is_empty() {
                    segments.push(Segment {
                        text: visible,
                        style,
                    });
                }
            }
            segments
        })
        .collect()
}

/// First line to show so that `focus` sits in the middle of `rows` lines.
pub fn viewport_start(focus: usize, rows: usize, total_lines: usize) -> usize {
    let start = focus.saturating_sub(rows / 2);
    start.min(total_lines.saturating_sub(rows))
}

/// Draws `page` from `first_line` into the top `rows` rows of the screen.
pub fn draw_page<W: Write>(
    writer: &mut W,
    page: Option<&PageContent>,
    first_line: usize,
    columns: u16,
    rows: u16,
) -> io::Result<()> {
    queue!(writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    let Some(page) = page else {
        queue!(writer, Print("rendering..."))?;
        return writer.flush();
    };
    let lines = layout_page(page, usize::from(columns));
    for (row, line) in lines.iter().skip(first_line).take(usize::from(rows)).enumerate() {
        let row = u16::try_from(row).unwrap_or(u16::MAX);
        queue!(writer, cursor::MoveTo(0, row))?;
        for segment in line {
            write_segment(writer, segment)?;
        }
    }
    writer.flush()
}

fn write_segment<W: Write>(writer: &mut W, segment: &Segment) -> io::Result<()> {
    match segment.style {
        SegmentStyle::Plain => queue!(writer, Print(&segment.text)),
        SegmentStyle::Match => queue!(
            writer,
            SetAttribute(Attribute::Reverse),
            Print(&segment.text),
            SetAttribute(Attribute::Reset)
        ),
        SegmentStyle::CurrentMatch => queue!(
            writer,
            SetBackgroundColor(Color::Yellow),
            SetForegroundColor(Color::Black),
            SetAttribute(Attribute::Bold),
            Print(&segment.text),
            SetAttribute(Attribute::Reset),
            ResetColor
        ),
    }
}

/// What the status line reports about the viewer.
#[derive(Debug, Clone, Default)]
pub struct StatusInfo<'a> {
    pub page: PageNumber,
    pub page_count: PageNumber,
    pub query: Option<&'a str>,
    pub current_match: Option<usize>,
    pub match_count: usize,
    pub searching: bool,
    pub case_sensitive: bool,
    pub pending_input: Option<String>,
}

pub fn status_text(status: &StatusInfo<'_>) -> String {
    let mut parts = vec![format!("page {}/{}", status.page, status.page_count)];
    if let Some(query) = status.query.filter(|query| !query.is_empty()) {
        let case = if status.case_sensitive { " (Aa)" } else { "" };
        parts.push(format!("\"{}\"{}", query, case));
        if status.searching {
            parts.push("searching...".to_owned());
        } else if status.match_count == 0 {
            parts.push("no matches".to_owned());
        } else {
            let current = status.current_match.map_or(0, |index| index + 1);
            parts.push(format!("match {}/{}", current, status.match_count));
        }
    }
    if let Some(pending) = &status.pending_input {
        parts.push(pending.clone());
    }
    parts.join("  ")
}

pub fn write_status_line<W: Write>(writer: &mut W, row: u16, label: &str) -> io::Result<()> {
    queue!(
        writer,
        cursor::MoveTo(0, row),
        Clear(ClearType::CurrentLine),
        Print(label)
    )?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState};
    use docview_core::{Mark, TextRun};

    fn key_event(code: KeyCode) -> Event {
        key_event_with_modifiers(code, KeyModifiers::NONE)
    }

    fn key_event_with_modifiers(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    fn marked(text: &str, match_index: usize, current: bool) -> Inline {
        Inline::Mark(Mark {
            match_index,
            current,
            text: text.to_owned(),
        })
    }

    fn preview(lines: &[Vec<Segment>]) -> String {
        lines
            .iter()
            .map(|line| {
                line.iter()
                    .map(|segment| match segment.style {
                        SegmentStyle::Plain => segment.text.clone(),
                        SegmentStyle::Match => format!("[{}]", segment.text),
                        SegmentStyle::CurrentMatch => format!("{{{}}}", segment.text),
                    })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn sample_page() -> PageContent {
        let first = TextRun::from_nodes(vec![
            marked("alpha", 0, false),
            Inline::Text(" beta ".into()),
            marked("alpha", 1, true),
        ]);
        let second = TextRun::from_nodes(vec![
            Inline::Text("a long line with ".into()),
            marked("alpha", 2, false),
            Inline::Text(" at the end".into()),
        ]);
        PageContent::new(4, vec![first, second])
    }

    #[test]
    fn event_mapper_uses_numeric_prefix_for_match_navigation() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('1'))),
            UiEvent::None
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('2'))),
            UiEvent::None
        ));
        assert_eq!(mapper.pending_input().as_deref(), Some("12"));

        match mapper.map_event(key_event(KeyCode::Char('n'))) {
            UiEvent::Command(Command::NextMatch { count }) => assert_eq!(count, 12),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mapper.pending_input().is_none());

        match mapper.map_event(key_event_with_modifiers(
            KeyCode::Char('N'),
            KeyModifiers::SHIFT,
        )) {
            UiEvent::Command(Command::PrevMatch { count }) => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_counts_scroll_pages() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('3')));
        match mapper.map_event(key_event(KeyCode::Char('k'))) {
            UiEvent::ScrollPages { delta } => assert_eq!(delta, -3),
            other => panic!("unexpected event: {:?}", other),
        }
        match mapper.map_event(key_event(KeyCode::Char('j'))) {
            UiEvent::ScrollPages { delta } => assert_eq!(delta, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn saturated_prefix_keeps_scroll_direction() {
        let mut mapper = EventMapper::new();
        for _ in 0..25 {
            mapper.map_event(key_event(KeyCode::Char('9')));
        }
        match mapper.map_event(key_event(KeyCode::Char('j'))) {
            UiEvent::ScrollPages { delta } => assert_eq!(delta, i64::MAX),
            other => panic!("unexpected event: {:?}", other),
        }
        for _ in 0..25 {
            mapper.map_event(key_event(KeyCode::Char('9')));
        }
        match mapper.map_event(key_event(KeyCode::Char('k'))) {
            UiEvent::ScrollPages { delta } => assert_eq!(delta, -i64::MAX),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_drops_prefix_on_other_command() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('4')));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('x'))),
            UiEvent::None
        ));
        match mapper.map_event(key_event(KeyCode::Char('n'))) {
            UiEvent::Command(Command::NextMatch { count }) => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_enter_with_prefix_jumps_to_match() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Enter)),
            UiEvent::None
        ));
        mapper.map_event(key_event(KeyCode::Char('7')));
        match mapper.map_event(key_event(KeyCode::Enter)) {
            UiEvent::Command(Command::JumpTo { index }) => assert_eq!(index, 6),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_maps_page_jumps() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('4')));
        mapper.map_event(key_event(KeyCode::Char('2')));
        match mapper.map_event(key_event(KeyCode::Char('g'))) {
            UiEvent::Command(Command::GotoPage { page }) => assert_eq!(page, 42),
            other => panic!("unexpected event: {:?}", other),
        }
        match mapper.map_event(key_event_with_modifiers(
            KeyCode::Char('G'),
            KeyModifiers::SHIFT,
        )) {
            UiEvent::Command(Command::GotoPage { page }) => assert_eq!(page, PageNumber::MAX),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_slash_enters_search_mode_and_collects_input() {
        let mut mapper = EventMapper::new();

        match mapper.map_event(key_event(KeyCode::Char('/'))) {
            UiEvent::BeginSearch => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mapper.mode(), InputMode::Search);
        assert_eq!(mapper.pending_input().as_deref(), Some("/"));

        match mapper.map_event(key_event(KeyCode::Char('f'))) {
            UiEvent::SearchQueryChanged { ref query } => assert_eq!(query, "f"),
            other => panic!("unexpected event: {:?}", other),
        }
        match mapper.map_event(key_event(KeyCode::Backspace)) {
            UiEvent::SearchQueryChanged { ref query } => assert!(query.is_empty()),
            other => panic!("unexpected event: {:?}", other),
        }
        match mapper.map_event(key_event_with_modifiers(
            KeyCode::Char('G'),
            KeyModifiers::SHIFT,
        )) {
            UiEvent::SearchQueryChanged { ref query } => assert_eq!(query, "G"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mapper.pending_input().as_deref(), Some("/G"));

        match mapper.map_event(key_event(KeyCode::Enter)) {
            UiEvent::SearchSubmit { ref query } => assert_eq!(query, "G"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mapper.mode(), InputMode::Normal);
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn escape_cancels_search_then_closes_it() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('/')));
        mapper.map_event(key_event(KeyCode::Char('a')));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Esc)),
            UiEvent::SearchCancel
        ));
        match mapper.map_event(key_event(KeyCode::Esc)) {
            UiEvent::Command(Command::CloseSearch) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            mapper.map_event(key_event_with_modifiers(
                KeyCode::Char('c'),
                KeyModifiers::CONTROL
            )),
            UiEvent::Quit
        ));
    }

    #[test]
    fn layout_styles_marks_and_truncates() {
        let page = sample_page();
        insta::assert_snapshot!(preview(&layout_page(&page, 80)), @r###"
        [alpha] beta {alpha}
        a long line with [alpha] at the end
        "###);
        insta::assert_snapshot!(preview(&layout_page(&page, 20)), @r###"
        [alpha] beta {alpha}
        a long line with [alp]
        "###);
    }

    #[test]
    fn viewport_centers_focus_line() {
        assert_eq!(viewport_start(0, 10, 100), 0);
        assert_eq!(viewport_start(50, 10, 100), 45);
        assert_eq!(viewport_start(98, 10, 100), 90);
        assert_eq!(viewport_start(3, 10, 4), 0);
    }

    #[test]
    fn draw_page_emits_marked_text() {
        let mut output = Vec::new();
        draw_page(&mut output, Some(&sample_page()), 1, 80, 10).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("\x1b["));
        assert!(output.contains("a long line with "));
        assert!(!output.contains("beta"));
    }

    #[test]
    fn status_text_reports_search_state() {
        let mut status = StatusInfo {
            page: 3,
            page_count: 12,
            ..StatusInfo::default()
        };
        insta::assert_snapshot!(status_text(&status), @"page 3/12");

        status.query = Some("alpha");
        status.searching = true;
        insta::assert_snapshot!(status_text(&status), @r###"page 3/12  "alpha"  searching..."###);

        status.searching = false;
        status.match_count = 5;
        status.current_match = Some(1);
        status.case_sensitive = true;
        status.pending_input = Some("4".into());
        insta::assert_snapshot!(status_text(&status), @r###"page 3/12  "alpha" (Aa)  match 2/5  4"###);

        status.match_count = 0;
        status.current_match = None;
        status.case_sensitive = false;
        status.pending_input = None;
        insta::assert_snapshot!(status_text(&status), @r###"page 3/12  "alpha"  no matches"###);
    }
}
