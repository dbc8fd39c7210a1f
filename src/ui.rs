use std::io::{self, Stdout};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::{Frame, Terminal};
use unicode_width::UnicodeWidthStr;

use crate::cache::PageCache;
use crate::data::{InteractionService, TaleService};
use crate::feed::{
    card_lines, summary_lines, ControllerOptions, FeedController, FeedEvent, FeedState,
    LoadTrigger,
};
use crate::history;
use crate::platform::Context;

const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SELECTED_BG: Color = Color::Rgb(69, 71, 90);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

struct Spinner {
    index: usize,
}

impl Spinner {
    fn new() -> Self {
        Self { index: 0 }
    }

    fn advance(&mut self) -> bool {
        self.index = (self.index + 1) % SPINNER_FRAMES.len();
        true
    }

    fn reset(&mut self) {
        self.index = 0;
    }

    fn current(&self) -> &'static str {
        SPINNER_FRAMES[self.index]
    }
}

enum AsyncResponse {
    Interaction {
        action: &'static str,
        tale_id: String,
        result: Result<()>,
    },
}

struct FeedPage {
    controller: FeedController,
    events: Receiver<FeedEvent>,
    selected: usize,
}

impl FeedPage {
    fn new(
        context: Context,
        max_window: usize,
        width: usize,
        tales: Arc<dyn TaleService>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let controller = FeedController::new(ControllerOptions {
            context,
            max_window,
            width,
            tales,
            events: tx,
        });
        Self {
            controller,
            events: rx,
            selected: 0,
        }
    }
}

pub struct Options {
    pub status_message: String,
    pub tales: Arc<dyn TaleService>,
    pub interactions: Option<Arc<dyn InteractionService>>,
    pub history: Option<history::Store>,
    pub max_window_size: usize,
    pub page_cache_size: usize,
    pub config_path: String,
}

pub struct Model {
    status_message: String,
    tales: Arc<dyn TaleService>,
    interactions: Option<Arc<dyn InteractionService>>,
    history: Option<history::Store>,
    max_window_size: usize,
    pages: PageCache<Context, FeedPage>,
    current: Context,
    feed_width: usize,
    feed_height: usize,
    needs_redraw: bool,
    spinner: Spinner,
    config_path: String,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
}

impl Model {
    pub fn new(options: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        let mut pages = PageCache::new(
            options.page_cache_size,
            Box::new(|_context: &Context, page: &mut FeedPage| {
                page.controller.teardown();
            }),
        );
        let current = Context::Ambient;
        let tales = options.tales.clone();
        let max_window = options.max_window_size;
        let _ = pages.get_or_create(current.clone(), || {
            Ok(FeedPage::new(
                Context::Ambient,
                max_window,
                72,
                tales.clone(),
            ))
        });
        Self {
            status_message: options.status_message,
            tales: options.tales,
            interactions: options.interactions,
            history: options.history,
            max_window_size: options.max_window_size,
            pages,
            current,
            feed_width: 72,
            feed_height: 24,
            needs_redraw: true,
            spinner: Spinner::new(),
            config_path: options.config_path,
            response_tx,
            response_rx,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        let tick_rate = Duration::from_millis(120);

        loop {
            if self.poll_background() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
            }

            let timeout = tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {}", err);
                                self.mark_dirty();
                            }
                        }
                    }
                }
            }

            if self.poll_background() {
                self.mark_dirty();
            }

            if last_tick.elapsed() >= tick_rate {
                last_tick = Instant::now();
                if self.is_loading() {
                    self.spinner.advance();
                    self.mark_dirty();
                } else {
                    self.spinner.reset();
                }
            }
        }

        self.pages.clear();
        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn is_loading(&self) -> bool {
        self.pages
            .peek(&self.current)
            .map(|page| page.controller.state() == FeedState::Loading)
            .unwrap_or(false)
    }

    fn current_page_mut(&mut self) -> Option<&mut FeedPage> {
        self.pages.get_mut(&self.current)
    }

    /// Drains finished fetches and republished feed events for every cached
    /// page, so a load still in flight when the user switches contexts lands
    /// in its window instead of waiting for a switch back. Status updates are
    /// only taken from the page being shown. Returns true when anything
    /// changed.
    fn poll_background(&mut self) -> bool {
        let mut changed = false;
        let mut pending_events = Vec::new();

        let current = self.current.clone();
        for (context, page) in self.pages.iter_mut() {
            if page.controller.poll() {
                changed = true;
            }
            let is_current = *context == current;
            pending_events.extend(page.events.try_iter().map(|event| (is_current, event)));
        }
        for (is_current, event) in pending_events {
            changed = true;
            match event {
                FeedEvent::TalesLoaded { .. } | FeedEvent::ContextLoaded { .. }
                    if !is_current => {}
                event => self.handle_feed_event(event),
            }
        }

        let responses: Vec<AsyncResponse> = self.response_rx.try_iter().collect();
        for response in responses {
            match response {
                AsyncResponse::Interaction {
                    action,
                    tale_id,
                    result,
                } => {
                    if let Err(err) = result {
                        self.status_message =
                            format!("Failed to {} tale {}: {:#}", action, tale_id, err);
                    }
                }
            }
            changed = true;
        }

        changed
    }

    fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::ContextLoaded { context } => {
                self.status_message = format!("Loaded {}.", context.label());
            }
            FeedEvent::TalesLoaded { count } => {
                self.status_message = if count == 0 {
                    "No more tales in this feed.".to_string()
                } else {
                    format!("Loaded {} tale{}.", count, if count == 1 { "" } else { "s" })
                };
            }
            FeedEvent::Viewed { tale_id } => self.report_viewed(tale_id),
            FeedEvent::Pin { tale_id } => self.send_interaction("pin", tale_id),
            FeedEvent::ViewImages { paths, index } => {
                if let Some(path) = paths.get(index) {
                    if webbrowser::open(path).is_err() {
                        self.status_message = format!("Unable to open image {}", path);
                    }
                }
            }
            FeedEvent::ViewAuthor { author } => {
                self.switch_context(Context::Author(author));
            }
        }
    }

    /// A card's first visibility marks it viewed: recorded locally so a
    /// restart does not re-report, then reported to the platform off-thread.
    fn report_viewed(&mut self, tale_id: String) {
        if let Some(store) = self.history.as_ref() {
            match store.is_viewed(&tale_id) {
                Ok(true) => return,
                Ok(false) => {
                    if let Err(err) = store.mark_viewed(&tale_id) {
                        self.status_message = format!("History write failed: {:#}", err);
                    }
                }
                Err(err) => {
                    self.status_message = format!("History read failed: {:#}", err);
                }
            }
        }
        self.send_interaction("mark viewed", tale_id);
    }

    fn send_interaction(&mut self, action: &'static str, tale_id: String) {
        let Some(service) = self.interactions.clone() else {
            return;
        };
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = match action {
                "pin" => service.pin(&tale_id),
                _ => service.report_viewed(&tale_id),
            };
            let _ = tx.send(AsyncResponse::Interaction {
                action,
                tale_id,
                result,
            });
        });
    }

    fn switch_context(&mut self, context: Context) {
        if context == self.current {
            return;
        }
        let tales = self.tales.clone();
        let max_window = self.max_window_size;
        let width = self.feed_width;
        let label = context.label();
        match self.pages.get_or_create(context.clone(), || {
            Ok(FeedPage::new(context.clone(), max_window, width, tales))
        }) {
            Ok(_) => {
                self.current = context;
                self.status_message = format!("Viewing {}.", label);
            }
            Err(err) => {
                self.status_message = format!("Failed to open {}: {:#}", label, err);
            }
        }
        self.mark_dirty();
    }

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => self.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.move_selection(-1),
            KeyCode::PageDown | KeyCode::Char('d') => self.scroll_rows(self.feed_height as i64),
            KeyCode::PageUp | KeyCode::Char('u') => self.scroll_rows(-(self.feed_height as i64)),
            KeyCode::Char('g') => self.scroll_to_top(),
            KeyCode::Char('m') => self.manual_load(),
            KeyCode::Char('p') => self.pin_selected(),
            KeyCode::Char('o') => self.open_selected_images(),
            KeyCode::Char('a') => self.open_selected_author(),
            KeyCode::Enter => self.open_selected_replies(),
            KeyCode::Char('b') => self.switch_context(Context::Ambient),
            _ => {}
        }
        Ok(false)
    }

    fn move_selection(&mut self, delta: i64) {
        let height = self.feed_height;
        if let Some(page) = self.current_page_mut() {
            let len = page.controller.window_len();
            if len == 0 {
                return;
            }
            let max_index = len - 1;
            let selected = if delta >= 0 {
                page.selected.saturating_add(delta as usize).min(max_index)
            } else {
                page.selected.saturating_sub(delta.unsigned_abs() as usize)
            };
            page.selected = selected;
            ensure_selected_visible(page, height);
        }
        self.mark_dirty();
    }

    fn scroll_rows(&mut self, delta: i64) {
        let height = self.feed_height;
        if let Some(page) = self.current_page_mut() {
            page.controller.scroll_mut().scroll_by(delta);
            let max = page.controller.content_height().saturating_sub(height);
            page.controller.scroll_mut().clamp(max);
        }
        self.mark_dirty();
    }

    fn scroll_to_top(&mut self) {
        if let Some(page) = self.current_page_mut() {
            let offset = page.controller.scroll().offset();
            page.controller.scroll_mut().scroll_by(-(offset as i64));
            page.selected = 0;
        }
        self.mark_dirty();
    }

    fn manual_load(&mut self) {
        let started = self
            .current_page_mut()
            .map(|page| page.controller.request_load(LoadTrigger::Manual));
        match started {
            Some(true) => self.status_message = "Loading more tales…".to_string(),
            Some(false) => self.status_message = "A load is already in flight.".to_string(),
            None => {}
        }
        self.mark_dirty();
    }

    fn selected_tale_id(&mut self) -> Option<String> {
        let page = self.current_page_mut()?;
        let index = page.selected.min(page.controller.window_len().checked_sub(1)?);
        page.controller.card(index).map(|card| card.id().to_string())
    }

    fn pin_selected(&mut self) {
        if let Some(id) = self.selected_tale_id() {
            if let Some(page) = self.current_page_mut() {
                page.controller.emit_pin(&id);
            }
            self.status_message = format!("Pinning tale {}…", id);
            self.mark_dirty();
        }
    }

    fn open_selected_images(&mut self) {
        if let Some(id) = self.selected_tale_id() {
            if let Some(page) = self.current_page_mut() {
                page.controller.emit_view_images(&id, 0);
            }
            self.mark_dirty();
        }
    }

    fn open_selected_author(&mut self) {
        if let Some(id) = self.selected_tale_id() {
            if let Some(page) = self.current_page_mut() {
                page.controller.emit_view_author(&id);
            }
            self.mark_dirty();
        }
    }

    fn open_selected_replies(&mut self) {
        if let Some(id) = self.selected_tale_id() {
            self.switch_context(Context::Tale(id));
        }
    }

    fn draw(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(2)])
            .split(frame.size());

        self.draw_feed(frame, chunks[0]);
        self.draw_status(frame, chunks[1]);
    }

    fn draw_feed(&mut self, frame: &mut Frame, area: Rect) {
        let inner_width = area.width.saturating_sub(2).max(8) as usize;
        let inner_height = area.height.saturating_sub(2).max(1) as usize;
        self.feed_width = inner_width;
        self.feed_height = inner_height;

        let spinner = self.spinner.current();
        let Some(page) = self.pages.get_mut(&self.current) else {
            return;
        };
        page.controller.resize(inner_width);

        // Visibility pass before rendering: viewed reports and the sentinel
        // check both key off what this frame will show.
        let max = page
            .controller
            .content_height()
            .saturating_sub(inner_height);
        page.controller.scroll_mut().clamp(max);
        page.controller.frame(inner_height);

        let mut rows: Vec<Line> = Vec::new();
        if let Some(summary) = page.controller.summary() {
            for (i, text) in summary_lines(summary.summary(), inner_width)
                .into_iter()
                .enumerate()
            {
                let style = if i == 0 {
                    Style::default()
                        .fg(COLOR_ACCENT)
                        .add_modifier(Modifier::BOLD)
                } else {
                    Style::default().fg(COLOR_TEXT_SECONDARY)
                };
                rows.push(Line::from(Span::styled(text, style)));
            }
        }
        for (index, card) in page.controller.cards().enumerate() {
            let selected = index == page.selected;
            for (i, text) in card_lines(card.tale(), inner_width).into_iter().enumerate() {
                let mut style = if i == 0 {
                    Style::default()
                        .fg(COLOR_ACCENT)
                        .add_modifier(Modifier::BOLD)
                } else if i == 1 {
                    Style::default().fg(COLOR_TEXT_SECONDARY)
                } else {
                    Style::default().fg(COLOR_TEXT_PRIMARY)
                };
                let text = if selected {
                    style = style.bg(COLOR_SELECTED_BG);
                    pad_to_width(&text, inner_width)
                } else {
                    text
                };
                rows.push(Line::from(Span::styled(text, style)));
            }
        }
        rows.push(load_row(&page.controller, spinner));

        let offset = page.controller.scroll().offset();
        let visible: Vec<Line> = rows
            .into_iter()
            .skip(offset)
            .take(inner_height)
            .collect();

        let title = format!(" {} ", self.current.label());
        let block = Block::default()
            .borders(Borders::ALL)
            .title(title)
            .style(Style::default().bg(COLOR_BG));
        frame.render_widget(Paragraph::new(visible).block(block), area);
    }

    fn draw_status(&mut self, frame: &mut Frame, area: Rect) {
        let error = self.pages.peek(&self.current).and_then(|page| {
            page.controller
                .last_error()
                .or(page.controller.summary_error())
                .map(str::to_string)
        });
        let mut lines = vec![Line::from(Span::styled(
            self.status_message.clone(),
            Style::default().fg(COLOR_TEXT_PRIMARY),
        ))];
        if let Some(error) = error {
            lines.push(Line::from(Span::styled(
                error,
                Style::default().fg(COLOR_ERROR),
            )));
        } else {
            lines.push(Line::from(Span::styled(
                format!(
                    "j/k scroll  m load more  p pin  o images  Enter replies  b back  q quit  ({})",
                    self.config_path
                ),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            )));
        }
        frame.render_widget(Paragraph::new(lines), area);
    }
}

/// Scrolls just enough to bring the selected card fully into view.
fn ensure_selected_visible(page: &mut FeedPage, viewport_rows: usize) {
    let mut top = page
        .controller
        .summary()
        .map(|summary| summary.height())
        .unwrap_or(0);
    let mut target = None;
    for (index, card) in page.controller.cards().enumerate() {
        if index == page.selected {
            target = Some((top, top + card.height()));
            break;
        }
        top += card.height();
    }
    let Some((top, bottom)) = target else {
        return;
    };
    let offset = page.controller.scroll().offset();
    if top < offset {
        let delta = offset - top;
        page.controller.scroll_mut().scroll_by(-(delta as i64));
    } else if bottom > offset + viewport_rows {
        let delta = bottom - (offset + viewport_rows);
        page.controller.scroll_mut().scroll_by(delta as i64);
    }
}

fn load_row<'a>(controller: &FeedController, spinner: &'a str) -> Line<'a> {
    let (text, style) = match controller.state() {
        FeedState::Loading => (
            format!("{} Loading more tales…", spinner),
            Style::default().fg(COLOR_ACCENT),
        ),
        FeedState::Removed => (String::new(), Style::default()),
        FeedState::Idle => {
            if controller.more_available() {
                (
                    "Press m to load more tales".to_string(),
                    Style::default().fg(COLOR_TEXT_SECONDARY),
                )
            } else {
                (
                    "No more tales. Press m to retry.".to_string(),
                    Style::default().fg(COLOR_TEXT_SECONDARY),
                )
            }
        }
    };
    Line::from(Span::styled(text, style))
}

fn pad_to_width(text: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(text);
    if current >= width {
        return text.to_string();
    }
    let mut padded = text.to_string();
    padded.push_str(&" ".repeat(width - current));
    padded
}
