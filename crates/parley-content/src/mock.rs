//! Scriptable content source for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use parley_core::content::{ContentSource, PageContent, StagedEntry};
use parley_core::errors::ContentError;
use parley_core::ids::ContentId;

/// Content source whose responses are set by the test.
pub struct MockContentSource {
    content_id: ContentId,
    url: Mutex<String>,
    title: Mutex<String>,
    content: Mutex<PageContent>,
    delay: Mutex<Option<Duration>>,
    failing: AtomicBool,
    permission: AtomicBool,
    staged: Mutex<Option<Vec<StagedEntry>>>,
    screenshots: Mutex<Option<Vec<Bytes>>>,
    fetch_count: AtomicUsize,
}

impl MockContentSource {
    pub fn new(content_id: ContentId, url: &str, text: &str) -> Self {
        Self {
            content_id,
            url: Mutex::new(url.to_string()),
            title: Mutex::new(format!("Page {}", content_id)),
            content: Mutex::new(PageContent::new(text, false)),
            delay: Mutex::new(None),
            failing: AtomicBool::new(false),
            permission: AtomicBool::new(true),
            staged: Mutex::new(None),
            screenshots: Mutex::new(None),
            fetch_count: AtomicUsize::new(0),
        }
    }

    pub fn set_text(&self, text: &str) {
        self.content.lock().text = text.to_string();
    }

    pub fn set_video(&self, is_video: bool) {
        self.content.lock().is_video = is_video;
    }

    pub fn set_token(&self, token: &str) {
        self.content.lock().invalidation_token = token.to_string();
    }

    pub fn set_url(&self, url: &str) {
        *self.url.lock() = url.to_string();
    }

    pub fn set_title(&self, title: &str) {
        *self.title.lock() = title.to_string();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn set_permission(&self, allowed: bool) {
        self.permission.store(allowed, Ordering::Relaxed);
    }

    pub fn set_staged_entries(&self, entries: Option<Vec<StagedEntry>>) {
        *self.staged.lock() = entries;
    }

    pub fn set_screenshots(&self, shots: Option<Vec<Bytes>>) {
        *self.screenshots.lock() = shots;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContentSource for MockContentSource {
    fn content_id(&self) -> ContentId {
        self.content_id
    }

    fn url(&self) -> String {
        self.url.lock().clone()
    }

    fn title(&self) -> String {
        self.title.lock().clone()
    }

    async fn fetch_content(&self) -> Result<PageContent, ContentError> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(ContentError::Extraction("mock failure".into()));
        }
        Ok(self.content.lock().clone())
    }

    fn cached_text(&self) -> String {
        self.content.lock().text.clone()
    }

    fn cached_is_video(&self) -> bool {
        self.content.lock().is_video
    }

    async fn staged_entries(&self) -> Option<Vec<StagedEntry>> {
        self.staged.lock().clone()
    }

    fn has_permission(&self) -> bool {
        self.permission.load(Ordering::Relaxed)
    }

    async fn screenshots(&self) -> Option<Vec<Bytes>> {
        self.screenshots.lock().clone()
    }
}
