use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use parley_core::content::{ContentSource, PageContent};

struct FetchState {
    cached: PageContent,
    in_flight: bool,
    /// Bumped when pending waiters are resolved out of band, so a late
    /// fetch result from an older generation is discarded.
    generation: u64,
    waiters: Vec<oneshot::Sender<PageContent>>,
    fetches_started: u64,
}

/// Single-flight fetcher and cache in front of one content source.
///
/// At most one underlying fetch runs at a time. Every caller that arrives
/// while it runs receives that fetch's result.
pub struct FetchCoordinator {
    source: Arc<dyn ContentSource>,
    state: Arc<Mutex<FetchState>>,
}

impl FetchCoordinator {
    pub fn new(source: Arc<dyn ContentSource>) -> Self {
        let cached = PageContent::new(source.cached_text(), source.cached_is_video());
        Self {
            source,
            state: Arc::new(Mutex::new(FetchState {
                cached,
                in_flight: false,
                generation: 0,
                waiters: Vec::new(),
                fetches_started: 0,
            })),
        }
    }

    pub fn source(&self) -> &Arc<dyn ContentSource> {
        &self.source
    }

    pub fn cached(&self) -> PageContent {
        self.state.lock().cached.clone()
    }

    pub fn cached_text(&self) -> String {
        self.state.lock().cached.text.clone()
    }

    pub fn cached_is_video(&self) -> bool {
        self.state.lock().cached.is_video
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Number of underlying fetches started so far.
    pub fn fetches_started(&self) -> u64 {
        self.state.lock().fetches_started
    }

    /// Current content of the source, fetching it if needed.
    pub async fn get_content(&self) -> PageContent {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut state = self.state.lock();
            state.waiters.push(tx);
            if state.in_flight {
                None
            } else {
                state.in_flight = true;
                state.fetches_started += 1;
                Some(state.generation)
            }
        };

        if let Some(generation) = start {
            self.spawn_fetch(generation);
        } else {
            debug!(content_id = %self.source.content_id(), "joining in-flight fetch");
        }

        match rx.await {
            Ok(content) => content,
            Err(_) => self.cached(),
        }
    }

    fn spawn_fetch(&self, generation: u64) {
        let source = Arc::clone(&self.source);
        let mut completion = FetchCompletion {
            state: Arc::clone(&self.state),
            generation,
            done: false,
        };
        tokio::spawn(async move {
            let content = match source.fetch_content().await {
                Ok(content) => content,
                Err(e) => {
                    warn!(content_id = %source.content_id(), error = %e, "content fetch failed, using empty content");
                    PageContent::default()
                }
            };
            completion.complete(content);
        });
    }

    /// Resolve every pending waiter now with `content`, which becomes the
    /// cache. A fetch still running is abandoned and its result dropped.
    pub fn resolve_pending(&self, content: PageContent) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.cached = content.clone();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(content.clone());
        }
        state.in_flight = false;
    }
}

/// Completes a fetch generation. Also runs on drop so waiters are
/// released if the fetch task is aborted.
struct FetchCompletion {
    state: Arc<Mutex<FetchState>>,
    generation: u64,
    done: bool,
}

impl FetchCompletion {
    fn complete(&mut self, content: PageContent) {
        self.done = true;
        let mut state = self.state.lock();
        if state.generation != self.generation {
            debug!("discarding result of superseded fetch");
            return;
        }
        let unchanged = !content.invalidation_token.is_empty()
            && content.invalidation_token == state.cached.invalidation_token;
        if !unchanged {
            state.cached = content;
        }
        let resolved = state.cached.clone();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(resolved.clone());
        }
        state.in_flight = false;
    }
}

impl Drop for FetchCompletion {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.state.lock();
        if state.generation != self.generation {
            return;
        }
        let cached = state.cached.clone();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(cached.clone());
        }
        state.in_flight = false;
    }
}
