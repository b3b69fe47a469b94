//! Scripted generation engine for deterministic tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use parley_content::text::strip_page_tags;
use parley_core::engine::{GenerationEngine, GenerationRequest, TurnEventStream};
use parley_core::errors::ApiError;
use parley_core::turn::TurnEvent;

/// Pre-programmed reply to one `generate_response` call.
pub enum MockReply {
    /// Yield these items, then end the stream.
    Events(Vec<Result<TurnEvent, ApiError>>),
    /// Fail the call itself.
    Error(ApiError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
    /// Yield these items, then never end.
    Stall(Vec<Result<TurnEvent, ApiError>>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Events(vec![Ok(TurnEvent::Completion {
            completion: text.to_string(),
        })])
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Events(
            chunks
                .iter()
                .map(|c| Ok(TurnEvent::Completion { completion: c.to_string() }))
                .collect(),
        )
    }

    pub fn stream_error(error: ApiError) -> Self {
        Self::Events(vec![Err(error)])
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Engine that answers from a queue of scripted replies.
pub struct MockEngine {
    incremental: bool,
    replies: Mutex<VecDeque<MockReply>>,
    suggestion_replies: Mutex<VecDeque<Result<Vec<String>, ApiError>>>,
    suggestion_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<GenerationRequest>>,
    suggestion_calls: AtomicUsize,
    clear_calls: AtomicUsize,
}

impl MockEngine {
    pub fn new(incremental: bool) -> Self {
        Self {
            incremental,
            replies: Mutex::new(VecDeque::new()),
            suggestion_replies: Mutex::new(VecDeque::new()),
            suggestion_delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            suggestion_calls: AtomicUsize::new(0),
            clear_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_replies(incremental: bool, replies: Vec<MockReply>) -> Self {
        let engine = Self::new(incremental);
        engine.replies.lock().extend(replies);
        engine
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn push_suggestions(&self, reply: Result<Vec<String>, ApiError>) {
        self.suggestion_replies.lock().push_back(reply);
    }

    pub fn set_suggestion_delay(&self, delay: Duration) {
        *self.suggestion_delay.lock() = Some(delay);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn suggestion_calls(&self) -> usize {
        self.suggestion_calls.load(Ordering::Relaxed)
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl GenerationEngine for MockEngine {
    fn sanitize(&self, text: &mut String) {
        *text = strip_page_tags(text);
    }

    fn supports_incremental_text(&self) -> bool {
        self.incremental
    }

    async fn generate_response(&self, request: GenerationRequest) -> Result<TurnEventStream, ApiError> {
        let call = self.requests.lock().len();
        self.requests.lock().push(request);
        let Some(mut reply) = self.replies.lock().pop_front() else {
            return Err(ApiError::Engine {
                message: format!("MockEngine: no reply configured for call {call}"),
            });
        };
        loop {
            match reply {
                MockReply::Events(events) => return Ok(Box::pin(stream::iter(events))),
                MockReply::Stall(events) => {
                    return Ok(Box::pin(stream::iter(events).chain(stream::pending())));
                }
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    reply = *inner;
                }
            }
        }
    }

    async fn generate_suggestions(
        &self,
        _is_video: bool,
        _content: &str,
        _selected_language: Option<&str>,
    ) -> Result<Vec<String>, ApiError> {
        let _ = self.suggestion_calls.fetch_add(1, Ordering::Relaxed);
        let delay = *self.suggestion_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.suggestion_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::ConnectionIssue))
    }

    fn clear_all_queries(&self) {
        let _ = self.clear_calls.fetch_add(1, Ordering::Relaxed);
    }
}
