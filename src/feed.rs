//! Incremental, memory-bounded feed renderer.
//!
//! The feed keeps a sliding window of rendered tale cards: pages append at
//! the tail, the oldest cards are evicted from the head once the window
//! exceeds its cap, and the scroll offset is compensated so the content the
//! user is looking at does not jump. A sentinel row after the last card
//! drives automatic pagination; every card reports "viewed" exactly once the
//! first time it scrolls into the viewport.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::data::TaleService;
use crate::platform::{Context, ContextSummary, Tale};

/// Rows occupied by the sentinel/load affordance after the last card.
pub const SENTINEL_ROWS: usize = 1;

/// Fires a one-shot callback the first time a card becomes visible. A card
/// that scrolls in and out of view repeatedly still reports once; cancelling
/// before the first visibility drops the callback with no error.
#[derive(Default)]
pub struct VisibilityTracker {
    pending: HashMap<String, Box<dyn FnOnce() + Send>>,
}

impl VisibilityTracker {
    pub fn observe(&mut self, id: impl Into<String>, on_visible: Box<dyn FnOnce() + Send>) {
        self.pending.insert(id.into(), on_visible);
    }

    pub fn cancel(&mut self, id: &str) {
        self.pending.remove(id);
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Reports the set of currently visible card ids. Each registered id
    /// fires at most once and is unregistered as it fires.
    pub fn notify_visible<'a, I>(&mut self, visible: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for id in visible {
            if let Some(callback) = self.pending.remove(id) {
                callback();
            }
        }
    }
}

/// End-of-list detector. Arming is owned by the controller: a fire disarms
/// the trigger so a fast scroll cannot queue a second request while one is in
/// flight.
#[derive(Default)]
pub struct SentinelTrigger {
    armed: bool,
}

impl SentinelTrigger {
    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// Idempotent; safe to call when not armed.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Returns true exactly once per arming when the sentinel is visible,
    /// disarming itself in the same step.
    pub fn take_fire(&mut self, sentinel_visible: bool) -> bool {
        if self.armed && sentinel_visible {
            self.armed = false;
            true
        } else {
            false
        }
    }
}

/// One rendered feed card. Owns its tale data and rendered height; its
/// visibility registration lives in the controller's tracker under the same
/// id and is cancelled when the card is evicted.
#[derive(Debug, Clone)]
pub struct Card {
    tale: Tale,
    height: usize,
}

impl Card {
    pub fn new(tale: Tale, width: usize) -> Self {
        let height = card_lines(&tale, width).len();
        Self { tale, height }
    }

    pub fn id(&self) -> &str {
        &self.tale.id
    }

    pub fn tale(&self) -> &Tale {
        &self.tale
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn relayout(&mut self, width: usize) {
        self.height = card_lines(&self.tale, width).len();
    }

    #[cfg(test)]
    pub fn set_height(&mut self, height: usize) {
        self.height = height;
    }
}

/// Ordered sliding window of cards. Append at the tail, evict from the head;
/// relative order of untouched cards is never disturbed.
#[derive(Default)]
pub struct CardStore {
    cards: std::collections::VecDeque<Card>,
}

impl CardStore {
    pub fn push_back(&mut self, card: Card) {
        self.cards.push_back(card);
    }

    /// Removes cards from the head, oldest first, until `len <= max`.
    /// Returns the removed cards so the caller can measure and tear them
    /// down. No-op when already within the bound.
    pub fn evict_excess(&mut self, max: usize) -> Vec<Card> {
        let mut removed = Vec::new();
        while self.cards.len() > max {
            if let Some(card) = self.cards.pop_front() {
                removed.push(card);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Card> {
        self.cards.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Card> {
        self.cards.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Card> {
        self.cards.get(index)
    }

    pub fn clear(&mut self) {
        self.cards.clear();
    }
}

/// Scroll offset into the feed, in rows from the top of the card window.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScrollState {
    offset: usize,
}

impl ScrollState {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Relative adjustment, saturating at the top.
    pub fn scroll_by(&mut self, delta: i64) {
        if delta >= 0 {
            self.offset = self.offset.saturating_add(delta as usize);
        } else {
            self.offset = self.offset.saturating_sub(delta.unsigned_abs() as usize);
        }
    }

    pub fn clamp(&mut self, max: usize) {
        self.offset = self.offset.min(max);
    }
}

/// Counteracts the layout shift caused by head eviction: the heights of the
/// removed cards (measured before removal) sum to a single relative upward
/// scroll adjustment. Nothing happens for an empty removal.
pub fn compensate(removed: &[Card], scroll: &mut ScrollState) {
    if removed.is_empty() {
        return;
    }
    let total: usize = removed.iter().map(Card::height).sum();
    scroll.scroll_by(-(total as i64));
}

/// The pinned context card. Loaded once per feed, never evicted, never
/// counted against the window cap.
pub struct SummaryCard {
    summary: ContextSummary,
    height: usize,
}

impl SummaryCard {
    fn new(summary: ContextSummary, width: usize) -> Self {
        let height = summary_lines(&summary, width).len();
        Self { summary, height }
    }

    pub fn summary(&self) -> &ContextSummary {
        &self.summary
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn relayout(&mut self, width: usize) {
        self.height = summary_lines(&self.summary, width).len();
    }
}

/// Events republished upward by the controller, annotated with enough
/// identity for the embedding page to act without reaching into the window.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    ContextLoaded { context: Context },
    TalesLoaded { count: usize },
    Viewed { tale_id: String },
    Pin { tale_id: String },
    ViewImages { paths: Vec<String>, index: usize },
    ViewAuthor { author: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Loading,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTrigger {
    Sentinel,
    Manual,
}

enum LoadOutcome {
    Page(Result<Vec<Tale>>),
    Summary(Result<Option<ContextSummary>>),
}

pub struct ControllerOptions {
    pub context: Context,
    pub max_window: usize,
    pub width: usize,
    pub tales: Arc<dyn TaleService>,
    pub events: Sender<FeedEvent>,
}

/// Orchestrates the feed window: pagination trigger -> fetch -> eviction ->
/// compensation -> append -> re-arm, with at most one load in flight.
pub struct FeedController {
    context: Context,
    max_window: usize,
    width: usize,
    state: FeedState,
    more_available: bool,
    store: CardStore,
    summary: Option<SummaryCard>,
    tracker: VisibilityTracker,
    sentinel: SentinelTrigger,
    scroll: ScrollState,
    tales: Arc<dyn TaleService>,
    events: Sender<FeedEvent>,
    outcome_tx: Sender<LoadOutcome>,
    outcome_rx: Receiver<LoadOutcome>,
    last_error: Option<String>,
    summary_error: Option<String>,
}

impl FeedController {
    pub fn new(options: ControllerOptions) -> Self {
        let (outcome_tx, outcome_rx) = unbounded();
        let mut controller = Self {
            context: options.context,
            max_window: options.max_window.max(1),
            width: options.width.max(8),
            state: FeedState::Idle,
            more_available: true,
            store: CardStore::default(),
            summary: None,
            tracker: VisibilityTracker::default(),
            sentinel: SentinelTrigger::default(),
            scroll: ScrollState::default(),
            tales: options.tales,
            events: options.events,
            outcome_tx,
            outcome_rx,
            last_error: None,
            summary_error: None,
        };
        // Armed from the start: the sentinel of an empty feed is visible on
        // the first frame, which kicks off the initial load.
        controller.sentinel.arm();
        if controller.context.has_summary() {
            controller.request_summary();
        }
        controller
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn more_available(&self) -> bool {
        self.more_available
    }

    pub fn window_len(&self) -> usize {
        self.store.len()
    }

    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.store.iter()
    }

    pub fn card(&self, index: usize) -> Option<&Card> {
        self.store.get(index)
    }

    pub fn summary(&self) -> Option<&SummaryCard> {
        self.summary.as_ref()
    }

    pub fn scroll(&self) -> &ScrollState {
        &self.scroll
    }

    pub fn scroll_mut(&mut self) -> &mut ScrollState {
        &mut self.scroll
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn summary_error(&self) -> Option<&str> {
        self.summary_error.as_deref()
    }

    pub fn sentinel_armed(&self) -> bool {
        self.sentinel.is_armed()
    }

    /// Single source of truth for whether a new load may start.
    pub fn manual_load_enabled(&self) -> bool {
        self.state == FeedState::Idle
    }

    /// Total rendered rows: pinned summary, card window, sentinel row.
    pub fn content_height(&self) -> usize {
        let summary = self.summary.as_ref().map(SummaryCard::height).unwrap_or(0);
        let cards: usize = self.store.iter().map(Card::height).sum();
        summary + cards + SENTINEL_ROWS
    }

    /// Gates `Idle -> Loading`. Both the sentinel and the manual affordance
    /// funnel through here, so a second trigger while a request is in flight
    /// is rejected and at most one fetch is outstanding.
    pub fn request_load(&mut self, _trigger: LoadTrigger) -> bool {
        if self.state != FeedState::Idle {
            return false;
        }
        self.state = FeedState::Loading;
        self.sentinel.disarm();
        let service = self.tales.clone();
        let context = self.context.clone();
        let tx = self.outcome_tx.clone();
        thread::spawn(move || {
            let result = service.fetch_more(&context);
            let _ = tx.send(LoadOutcome::Page(result));
        });
        true
    }

    fn request_summary(&mut self) {
        let service = self.tales.clone();
        let context = self.context.clone();
        let tx = self.outcome_tx.clone();
        thread::spawn(move || {
            let result = service.fetch_summary(&context);
            let _ = tx.send(LoadOutcome::Summary(result));
        });
    }

    /// Drains finished fetches. Returns true when anything was applied.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            match outcome {
                LoadOutcome::Page(result) => self.apply_loaded(result),
                LoadOutcome::Summary(result) => self.apply_summary(result),
            }
            changed = true;
        }
        changed
    }

    /// Completes a load cycle. On success: evict the head excess with scroll
    /// compensation, append the new cards, register each for visibility,
    /// update `more_available`, emit `TalesLoaded`. On failure the error is
    /// swallowed here and `more_available` keeps its previous value. Either
    /// way the controller returns to `Idle` and the sentinel is re-armed iff
    /// more content may exist.
    pub fn apply_loaded(&mut self, result: Result<Vec<Tale>>) {
        if self.state == FeedState::Removed {
            return;
        }
        match result {
            Ok(tales) => {
                let count = tales.len();
                // Shrink the head so the incoming page lands within the cap.
                let keep = self.max_window.saturating_sub(count);
                let removed = self.store.evict_excess(keep);
                for card in &removed {
                    self.tracker.cancel(card.id());
                }
                compensate(&removed, &mut self.scroll);

                for tale in tales {
                    let card = Card::new(tale, self.width);
                    let events = self.events.clone();
                    let tale_id = card.id().to_string();
                    self.tracker.observe(
                        card.id(),
                        Box::new(move || {
                            let _ = events.send(FeedEvent::Viewed { tale_id });
                        }),
                    );
                    self.store.push_back(card);
                }

                // A page larger than the cap spills straight back out of the
                // head; the oldest of the new arrivals go first.
                let spill = self.store.evict_excess(self.max_window);
                for card in &spill {
                    self.tracker.cancel(card.id());
                }
                compensate(&spill, &mut self.scroll);

                self.more_available = count > 0;
                self.last_error = None;
                let _ = self.events.send(FeedEvent::TalesLoaded { count });
            }
            Err(err) => {
                self.last_error = Some(format!("{err:#}"));
            }
        }
        self.state = FeedState::Idle;
        if self.more_available {
            self.sentinel.arm();
        } else {
            self.sentinel.disarm();
        }
    }

    /// Completes the one-time context load. A failed summary is non-fatal:
    /// the pinned card is skipped and pagination proceeds.
    pub fn apply_summary(&mut self, result: Result<Option<ContextSummary>>) {
        if self.state == FeedState::Removed {
            return;
        }
        match result {
            Ok(Some(summary)) => {
                self.summary = Some(SummaryCard::new(summary, self.width));
                let _ = self.events.send(FeedEvent::ContextLoaded {
                    context: self.context.clone(),
                });
            }
            Ok(None) => {}
            Err(err) => {
                self.summary_error = Some(format!("{err:#}"));
            }
        }
    }

    /// Per-frame visibility pass: reports cards intersecting the viewport to
    /// the tracker and fires the sentinel when its row is in view.
    pub fn frame(&mut self, viewport_rows: usize) {
        if self.state == FeedState::Removed {
            return;
        }
        let top = self.scroll.offset();
        let bottom = top.saturating_add(viewport_rows);
        let mut y = self.summary.as_ref().map(SummaryCard::height).unwrap_or(0);
        let mut visible = Vec::new();
        for card in self.store.iter() {
            let card_top = y;
            let card_bottom = y + card.height();
            if card_top < bottom && card_bottom > top {
                visible.push(card.id().to_string());
            }
            y = card_bottom;
        }
        self.tracker
            .notify_visible(visible.iter().map(String::as_str));

        let sentinel_visible = y < bottom;
        if self.sentinel.take_fire(sentinel_visible) {
            self.request_load(LoadTrigger::Sentinel);
        }
    }

    pub fn resize(&mut self, width: usize) {
        let width = width.max(8);
        if width == self.width || self.state == FeedState::Removed {
            return;
        }
        self.width = width;
        for card in self.store.iter_mut() {
            card.relayout(width);
        }
        if let Some(summary) = self.summary.as_mut() {
            summary.relayout(width);
        }
    }

    pub fn emit_pin(&self, tale_id: &str) {
        let _ = self.events.send(FeedEvent::Pin {
            tale_id: tale_id.to_string(),
        });
    }

    pub fn emit_view_images(&self, tale_id: &str, index: usize) {
        let Some(card) = self.store.iter().find(|card| card.id() == tale_id) else {
            return;
        };
        if card.tale().image_paths.is_empty() {
            return;
        }
        let paths = card.tale().image_paths.clone();
        let index = index.min(paths.len() - 1);
        let _ = self.events.send(FeedEvent::ViewImages { paths, index });
    }

    pub fn emit_view_author(&self, tale_id: &str) {
        let Some(card) = self.store.iter().find(|card| card.id() == tale_id) else {
            return;
        };
        let _ = self.events.send(FeedEvent::ViewAuthor {
            author: card.tale().author.clone(),
        });
    }

    /// Terminal transition: cancels every visibility registration, disarms
    /// the sentinel, and drops the window. No further transitions are
    /// processed.
    pub fn teardown(&mut self) {
        self.tracker.cancel_all();
        self.sentinel.disarm();
        self.store.clear();
        self.summary = None;
        self.state = FeedState::Removed;
    }
}

/// Renders a tale into plain card rows for the current width. The row count
/// is the card's height used by eviction accounting.
pub fn card_lines(tale: &Tale, width: usize) -> Vec<String> {
    let width = width.max(8);
    let mut lines = Vec::new();
    if !tale.title.trim().is_empty() {
        lines.push(tale.title.trim().to_string());
    }
    lines.push(format!(
        "@{}  {} replies  {} reactions",
        tale.author, tale.reply_count, tale.reaction_count
    ));
    for paragraph in tale.body.split('\n') {
        if paragraph.trim().is_empty() {
            lines.push(String::new());
            continue;
        }
        for wrapped in textwrap::wrap(paragraph, width) {
            lines.push(wrapped.to_string());
        }
    }
    if !tale.image_paths.is_empty() {
        let n = tale.image_paths.len();
        lines.push(format!("[{} image{}]", n, if n == 1 { "" } else { "s" }));
    }
    lines.push(String::new());
    lines
}

pub fn summary_lines(summary: &ContextSummary, width: usize) -> Vec<String> {
    match summary {
        ContextSummary::Tale(tale) => {
            let mut lines = card_lines(tale, width);
            lines.insert(0, "── tale ──".to_string());
            lines
        }
        ContextSummary::Author(author) => {
            let width = width.max(8);
            let display = if author.display_name.trim().is_empty() {
                author.name.as_str()
            } else {
                author.display_name.trim()
            };
            let mut lines = vec![
                format!("{} (@{})", display, author.name),
                format!(
                    "{} tales  {} followers",
                    author.tale_count, author.follower_count
                ),
            ];
            for wrapped in textwrap::wrap(&author.bio, width) {
                lines.push(wrapped.to_string());
            }
            lines.push(String::new());
            lines
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{sample_tale, MockTaleService};
    use std::time::{Duration, Instant};

    fn tale(id: &str) -> Tale {
        sample_tale(id, &format!("Tale {id}"), "A short body.")
    }

    fn page(prefix: &str, from: usize, count: usize) -> Vec<Tale> {
        (from..from + count)
            .map(|i| tale(&format!("{prefix}{i}")))
            .collect()
    }

    fn controller(
        context: Context,
        max_window: usize,
        service: Arc<MockTaleService>,
    ) -> (FeedController, Receiver<FeedEvent>) {
        let (tx, rx) = unbounded();
        let controller = FeedController::new(ControllerOptions {
            context,
            max_window,
            width: 60,
            tales: service,
            events: tx,
        });
        (controller, rx)
    }

    fn pump_until<F>(controller: &mut FeedController, pred: F)
    where
        F: Fn(&FeedController) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            controller.poll();
            if pred(controller) {
                return;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for feed controller");
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn run_cycle(controller: &mut FeedController, trigger: LoadTrigger) {
        assert!(controller.request_load(trigger));
        pump_until(controller, |c| c.state() == FeedState::Idle);
    }

    #[test]
    fn tracker_fires_exactly_once() {
        let (tx, rx) = unbounded::<&'static str>();
        let mut tracker = VisibilityTracker::default();
        tracker.observe("a", {
            let tx = tx.clone();
            Box::new(move || {
                let _ = tx.send("a");
            })
        });
        tracker.notify_visible(["a"]);
        tracker.notify_visible(["a"]);
        tracker.notify_visible(["a", "b"]);
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn tracker_cancel_drops_pending_callback() {
        let (tx, rx) = unbounded::<&'static str>();
        let mut tracker = VisibilityTracker::default();
        tracker.observe(
            "a",
            Box::new(move || {
                let _ = tx.send("a");
            }),
        );
        tracker.cancel("a");
        tracker.cancel("a");
        tracker.notify_visible(["a"]);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn sentinel_fires_once_per_arming() {
        let mut sentinel = SentinelTrigger::default();
        assert!(!sentinel.take_fire(true));
        sentinel.arm();
        assert!(!sentinel.take_fire(false));
        assert!(sentinel.is_armed());
        assert!(sentinel.take_fire(true));
        assert!(!sentinel.is_armed());
        assert!(!sentinel.take_fire(true));
        sentinel.disarm();
        sentinel.disarm();
    }

    #[test]
    fn store_evicts_fifo_from_head() {
        let mut store = CardStore::default();
        for i in 0..5 {
            store.push_back(Card::new(tale(&format!("t{i}")), 60));
        }
        let removed = store.evict_excess(2);
        let removed_ids: Vec<&str> = removed.iter().map(Card::id).collect();
        assert_eq!(removed_ids, ["t0", "t1", "t2"]);
        let remaining: Vec<&str> = store.iter().map(Card::id).collect();
        assert_eq!(remaining, ["t3", "t4"]);
    }

    #[test]
    fn store_eviction_is_noop_within_bound() {
        let mut store = CardStore::default();
        store.push_back(Card::new(tale("t0"), 60));
        assert!(store.evict_excess(1).is_empty());
        assert!(store.evict_excess(5).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn compensation_applies_summed_heights_once() {
        let mut removed = vec![
            Card::new(tale("a"), 60),
            Card::new(tale("b"), 60),
            Card::new(tale("c"), 60),
        ];
        removed[0].set_height(3);
        removed[1].set_height(4);
        removed[2].set_height(5);
        let mut scroll = ScrollState::default();
        scroll.scroll_by(100);
        compensate(&removed, &mut scroll);
        assert_eq!(scroll.offset(), 88);
    }

    #[test]
    fn compensation_skips_empty_removals() {
        let mut scroll = ScrollState::default();
        scroll.scroll_by(40);
        compensate(&[], &mut scroll);
        assert_eq!(scroll.offset(), 40);
    }

    #[test]
    fn compensation_saturates_at_top() {
        let mut removed = vec![Card::new(tale("a"), 60)];
        removed[0].set_height(50);
        let mut scroll = ScrollState::default();
        scroll.scroll_by(10);
        compensate(&removed, &mut scroll);
        assert_eq!(scroll.offset(), 0);
    }

    #[test]
    fn window_bound_holds_across_loads() {
        let pages: Vec<Vec<Tale>> = (0..10).map(|p| page("t", p * 5, 5)).collect();
        let service = Arc::new(MockTaleService::with_pages(pages));
        let (mut controller, _events) = controller(Context::Ambient, 12, service);
        for _ in 0..10 {
            run_cycle(&mut controller, LoadTrigger::Manual);
            assert!(controller.window_len() <= 12);
        }
        assert_eq!(controller.window_len(), 12);
        // Newest content survives.
        let ids: Vec<&str> = controller.cards().map(Card::id).collect();
        assert_eq!(ids.first(), Some(&"t38"));
        assert_eq!(ids.last(), Some(&"t49"));
    }

    #[test]
    fn single_flight_loads() {
        let service = Arc::new(MockTaleService::with_pages(vec![page("t", 0, 3)]));
        let (mut controller, _events) = controller(Context::Ambient, 30, service.clone());
        assert!(controller.request_load(LoadTrigger::Sentinel));
        // Both trigger paths are rejected while the request is in flight.
        assert!(!controller.request_load(LoadTrigger::Manual));
        assert!(!controller.request_load(LoadTrigger::Sentinel));
        assert!(!controller.manual_load_enabled());
        assert!(!controller.sentinel_armed());
        pump_until(&mut controller, |c| c.state() == FeedState::Idle);
        assert_eq!(service.fetch_calls(), 1);
        assert_eq!(controller.window_len(), 3);
    }

    #[test]
    fn failure_leaves_more_available_and_rearms() {
        let service = Arc::new(MockTaleService::with_pages(vec![
            page("t", 0, 3),
            page("t", 3, 3),
        ]));
        let (mut controller, _events) = controller(Context::Ambient, 30, service.clone());
        run_cycle(&mut controller, LoadTrigger::Manual);
        assert!(controller.more_available());

        service.fail_next();
        run_cycle(&mut controller, LoadTrigger::Manual);
        assert!(controller.more_available());
        assert!(controller.sentinel_armed());
        assert!(controller.manual_load_enabled());
        assert!(controller.last_error().is_some());
        assert_eq!(controller.window_len(), 3);
    }

    #[test]
    fn failure_does_not_rearm_exhausted_feed() {
        let service = Arc::new(MockTaleService::with_pages(vec![page("t", 0, 3)]));
        let (mut controller, _events) = controller(Context::Ambient, 30, service.clone());
        run_cycle(&mut controller, LoadTrigger::Manual);
        run_cycle(&mut controller, LoadTrigger::Manual); // empty page
        assert!(!controller.more_available());
        assert!(!controller.sentinel_armed());

        service.fail_next();
        run_cycle(&mut controller, LoadTrigger::Manual); // manual retry fails
        assert!(!controller.more_available());
        assert!(!controller.sentinel_armed());
    }

    #[test]
    fn viewed_reported_exactly_once_per_card() {
        let service = Arc::new(MockTaleService::with_pages(vec![page("t", 0, 2)]));
        let (mut controller, events) = controller(Context::Ambient, 30, service);
        run_cycle(&mut controller, LoadTrigger::Manual);
        drain_events(&events);

        // In view, out of view, back in view.
        controller.frame(100);
        controller.scroll_mut().scroll_by(1000);
        controller.frame(100);
        controller.scroll_mut().scroll_by(-1000);
        controller.frame(100);

        let viewed: Vec<String> = events
            .try_iter()
            .filter_map(|event| match event {
                FeedEvent::Viewed { tale_id } => Some(tale_id),
                _ => None,
            })
            .collect();
        assert_eq!(viewed, ["t0", "t1"]);
    }

    #[test]
    fn frame_only_reports_cards_in_viewport() {
        let service = Arc::new(MockTaleService::with_pages(vec![page("t", 0, 10)]));
        let (mut controller, events) = controller(Context::Ambient, 30, service);
        run_cycle(&mut controller, LoadTrigger::Manual);
        drain_events(&events);

        let first_height = controller.card(0).unwrap().height();
        controller.frame(first_height); // viewport covers only the first card
        let viewed: Vec<String> = events
            .try_iter()
            .filter_map(|event| match event {
                FeedEvent::Viewed { tale_id } => Some(tale_id),
                _ => None,
            })
            .collect();
        assert_eq!(viewed, ["t0"]);
    }

    #[test]
    fn sentinel_frame_triggers_load() {
        let service = Arc::new(MockTaleService::with_pages(vec![page("t", 0, 4)]));
        let (mut controller, _events) = controller(Context::Ambient, 30, service.clone());
        controller.frame(40); // empty feed: sentinel visible, armed at construction
        assert_eq!(controller.state(), FeedState::Loading);
        pump_until(&mut controller, |c| c.state() == FeedState::Idle);
        assert_eq!(service.fetch_calls(), 1);
        assert_eq!(controller.window_len(), 4);
    }

    #[test]
    fn eviction_compensates_scroll() {
        let service = Arc::new(MockTaleService::with_pages(vec![
            page("t", 0, 6),
            page("t", 6, 6),
        ]));
        let (mut controller, _events) = controller(Context::Ambient, 6, service);
        run_cycle(&mut controller, LoadTrigger::Manual);
        let evicted_height: usize = controller.cards().map(Card::height).sum();
        controller.scroll_mut().scroll_by(200);
        run_cycle(&mut controller, LoadTrigger::Manual);
        assert_eq!(controller.scroll().offset(), 200 - evicted_height);
        assert_eq!(controller.window_len(), 6);
    }

    #[test]
    fn oversized_page_still_honors_cap() {
        let service = Arc::new(MockTaleService::with_pages(vec![page("t", 0, 9)]));
        let (mut controller, _events) = controller(Context::Ambient, 4, service);
        run_cycle(&mut controller, LoadTrigger::Manual);
        assert_eq!(controller.window_len(), 4);
        let ids: Vec<&str> = controller.cards().map(Card::id).collect();
        assert_eq!(ids, ["t5", "t6", "t7", "t8"]);
    }

    #[test]
    fn teardown_is_terminal() {
        let service = Arc::new(MockTaleService::with_pages(vec![page("t", 0, 3)]));
        let (mut controller, _events) = controller(Context::Ambient, 30, service);
        run_cycle(&mut controller, LoadTrigger::Manual);
        controller.teardown();
        assert_eq!(controller.state(), FeedState::Removed);
        assert_eq!(controller.window_len(), 0);
        assert!(!controller.request_load(LoadTrigger::Manual));
        controller.frame(50);
        assert_eq!(controller.state(), FeedState::Removed);
        controller.apply_loaded(Ok(page("x", 0, 2)));
        assert_eq!(controller.window_len(), 0);
    }

    #[test]
    fn end_to_end_single_tale_context() {
        let summary = ContextSummary::Tale(tale("root"));
        let pages: Vec<Vec<Tale>> = (0..4)
            .map(|p| page("r", p * 10, 10))
            .chain(std::iter::once(Vec::new()))
            .collect();
        let service =
            Arc::new(MockTaleService::with_pages(pages).with_summary(summary));
        let (mut controller, events) =
            controller(Context::Tale("root".into()), 30, service.clone());

        // Construction issues exactly one context-summary fetch; the pinned
        // card is prepended regardless of pagination state.
        pump_until(&mut controller, |c| c.summary().is_some());
        assert_eq!(service.summary_calls(), 1);
        assert!(events
            .try_iter()
            .any(|event| matches!(event, FeedEvent::ContextLoaded { .. })));

        let mut sizes = Vec::new();
        for _ in 0..4 {
            controller.frame(1000); // sentinel in view fires the next load
            pump_until(&mut controller, |c| c.state() == FeedState::Idle);
            sizes.push(controller.window_len());
            assert!(controller.more_available());
            assert!(controller.sentinel_armed());
        }
        assert_eq!(sizes, [10, 20, 30, 30]);
        // After the 4th cycle the 10 oldest replies are gone.
        let ids: Vec<&str> = controller.cards().map(Card::id).collect();
        assert_eq!(ids.first(), Some(&"r10"));
        assert_eq!(ids.last(), Some(&"r39"));
        // The pinned card never counts against the cap and is never evicted.
        assert!(controller.summary().is_some());

        // A 5th load returns no items: the sentinel stays disarmed and only
        // the manual affordance can retry.
        controller.frame(1000);
        pump_until(&mut controller, |c| c.state() == FeedState::Idle);
        assert!(!controller.more_available());
        assert!(!controller.sentinel_armed());
        controller.frame(1000);
        assert_eq!(controller.state(), FeedState::Idle);
        assert!(controller.manual_load_enabled());

        let counts: Vec<usize> = events
            .try_iter()
            .filter_map(|event| match event {
                FeedEvent::TalesLoaded { count } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, [10, 10, 10, 10, 0]);
        assert_eq!(service.fetch_calls(), 5);
    }

    #[test]
    fn summary_failure_is_nonfatal() {
        // No summary configured: the mock returns Ok(None), so force an
        // error through the page-fail knob on a summary-bearing context.
        struct FailingSummaries;
        impl TaleService for FailingSummaries {
            fn fetch_more(&self, _context: &Context) -> Result<Vec<Tale>> {
                Ok(vec![tale("t0")])
            }
            fn fetch_summary(&self, _context: &Context) -> Result<Option<ContextSummary>> {
                anyhow::bail!("summary unavailable")
            }
        }
        let (tx, _rx) = unbounded();
        let mut controller = FeedController::new(ControllerOptions {
            context: Context::Author("mira".into()),
            max_window: 30,
            width: 60,
            tales: Arc::new(FailingSummaries),
            events: tx,
        });
        pump_until(&mut controller, |c| c.summary_error().is_some());
        assert!(controller.summary().is_none());
        // Pagination is unaffected.
        run_cycle(&mut controller, LoadTrigger::Manual);
        assert_eq!(controller.window_len(), 1);
    }

    #[test]
    fn republishes_item_events_with_identity() {
        let mut with_images = tale("t0");
        with_images.image_paths = vec!["a.png".into(), "b.png".into()];
        let service = Arc::new(MockTaleService::with_pages(vec![vec![
            with_images,
            tale("t1"),
        ]]));
        let (mut controller, events) = controller(Context::Ambient, 30, service);
        run_cycle(&mut controller, LoadTrigger::Manual);
        drain_events(&events);

        controller.emit_pin("t1");
        controller.emit_view_images("t0", 5);
        controller.emit_view_author("t1");
        controller.emit_view_images("t1", 0); // no images: no event

        let collected: Vec<FeedEvent> = events.try_iter().collect();
        assert_eq!(
            collected,
            vec![
                FeedEvent::Pin {
                    tale_id: "t1".into()
                },
                FeedEvent::ViewImages {
                    paths: vec!["a.png".into(), "b.png".into()],
                    index: 1,
                },
                FeedEvent::ViewAuthor {
                    author: "tales".into()
                },
            ]
        );
    }

    fn drain_events(events: &Receiver<FeedEvent>) {
        for _ in events.try_iter() {}
    }
}
