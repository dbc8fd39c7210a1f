use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use parking_lot::Mutex;

use crate::platform::{self, Context, ContextSummary, Tale};

pub trait TaleService: Send + Sync {
    /// Fetches the next page of tales for a context. An empty page means the
    /// feed has no more content for now.
    fn fetch_more(&self, context: &Context) -> Result<Vec<Tale>>;
    /// Fetches the one-time pinned summary for a scoped context. Returns
    /// `None` for the ambient context, which has no summary card.
    fn fetch_summary(&self, context: &Context) -> Result<Option<ContextSummary>>;
}

pub trait InteractionService: Send + Sync {
    fn report_viewed(&self, tale_id: &str) -> Result<()>;
    fn pin(&self, tale_id: &str) -> Result<()>;
}

pub struct PlatformTaleService {
    client: Arc<platform::Client>,
}

impl PlatformTaleService {
    pub fn new(client: Arc<platform::Client>) -> Self {
        Self { client }
    }
}

impl TaleService for PlatformTaleService {
    fn fetch_more(&self, context: &Context) -> Result<Vec<Tale>> {
        let page = self
            .client
            .tales_after(context)
            .context("fetch tale page")?;
        Ok(page.items)
    }

    fn fetch_summary(&self, context: &Context) -> Result<Option<ContextSummary>> {
        match context {
            Context::Ambient => Ok(None),
            Context::Tale(id) => {
                let tale = self.client.tale_summary(id).context("fetch tale summary")?;
                Ok(Some(ContextSummary::Tale(tale)))
            }
            Context::Author(name) => {
                let author = self
                    .client
                    .author_summary(name)
                    .context("fetch author summary")?;
                Ok(Some(ContextSummary::Author(author)))
            }
        }
    }
}

pub struct PlatformInteractionService {
    client: Arc<platform::Client>,
}

impl PlatformInteractionService {
    pub fn new(client: Arc<platform::Client>) -> Self {
        Self { client }
    }
}

impl InteractionService for PlatformInteractionService {
    fn report_viewed(&self, tale_id: &str) -> Result<()> {
        self.client.report_viewed(tale_id)
    }

    fn pin(&self, tale_id: &str) -> Result<()> {
        self.client.pin_tale(tale_id)
    }
}

/// Deterministic in-memory service used for offline browsing and tests.
/// Pages are served front-to-back; once exhausted, every fetch returns an
/// empty page.
#[derive(Default)]
pub struct MockTaleService {
    pages: Mutex<VecDeque<Vec<Tale>>>,
    summary: Mutex<Option<ContextSummary>>,
    fail_next: AtomicBool,
    fetch_calls: AtomicUsize,
    summary_calls: AtomicUsize,
}

impl MockTaleService {
    pub fn with_pages(pages: Vec<Vec<Tale>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            ..Self::default()
        }
    }

    pub fn with_summary(self, summary: ContextSummary) -> Self {
        *self.summary.lock() = Some(summary);
        self
    }

    /// Makes the next `fetch_more` call fail once.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    pub fn sample() -> Self {
        let intro = vec![
            sample_tale(
                "welcome",
                "Welcome to Tales-TUI",
                "Browse the Tales platform from your terminal.\n\nUse j/k to scroll, m to load more, Enter to open a tale's replies.",
            ),
            sample_tale(
                "shortcuts",
                "Keyboard shortcuts",
                "j/k: Scroll\nm: Load more tales\np: Pin the selected tale\no: Open images\nq: Quit",
            ),
        ];
        Self::with_pages(vec![intro])
    }
}

impl TaleService for MockTaleService {
    fn fetch_more(&self, _context: &Context) -> Result<Vec<Tale>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("mock: transient fetch failure");
        }
        Ok(self.pages.lock().pop_front().unwrap_or_default())
    }

    fn fetch_summary(&self, context: &Context) -> Result<Option<ContextSummary>> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        if !context.has_summary() {
            return Ok(None);
        }
        Ok(self.summary.lock().clone())
    }
}

#[derive(Default)]
pub struct MockInteractionService {
    viewed: Mutex<Vec<String>>,
    pinned: Mutex<Vec<String>>,
}

impl MockInteractionService {
    pub fn viewed(&self) -> Vec<String> {
        self.viewed.lock().clone()
    }

    pub fn pinned(&self) -> Vec<String> {
        self.pinned.lock().clone()
    }
}

impl InteractionService for MockInteractionService {
    fn report_viewed(&self, tale_id: &str) -> Result<()> {
        self.viewed.lock().push(tale_id.to_string());
        Ok(())
    }

    fn pin(&self, tale_id: &str) -> Result<()> {
        self.pinned.lock().push(tale_id.to_string());
        Ok(())
    }
}

pub fn sample_tale(id: &str, title: &str, body: &str) -> Tale {
    Tale {
        id: id.to_string(),
        author: "tales".to_string(),
        title: title.to_string(),
        body: body.to_string(),
        image_paths: Vec::new(),
        reply_count: 0,
        reaction_count: 0,
        created_utc: 0.0,
    }
}
