//! Per-conversation state machine.
//!
//! A `ConversationSession` owns the turn history and the content attached to
//! one conversation. Requests move `Idle -> AwaitingContent -> Generating`
//! and end in `Idle` or `Erroring`. At most one request runs at a time and at
//! most one further human turn may wait behind it.
//!
//! All state lives behind a single mutex; the lock is never held across an
//! await point or while calling a manager method that notifies observers.

use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_content::archive::ArchivedContent;
use parley_content::{ContentAssociationManager, ContentObserver, Subscription};
use parley_core::content::{PageContent, StagedEntry};
use parley_core::conversation::{ContentRef, ContentType, ConversationArchive};
use parley_core::engine::{GenerationEngine, GenerationRequest};
use parley_core::errors::ApiError;
use parley_core::events::SessionEvent;
use parley_core::ids::ConversationId;
use parley_core::suggestion::{
    Suggestion, SuggestionStatus, SUMMARIZE_PAGE_PROMPT, SUMMARIZE_PAGE_TITLE, SUMMARIZE_VIDEO_PROMPT,
    SUMMARIZE_VIDEO_TITLE,
};
use parley_core::turn::{ActionType, Turn, TurnEvent};

use crate::assembler::{AssemblyOutcome, ResponseAssembler};
use crate::context::AppContext;
use crate::error::SessionError;
use crate::suggestions::sample_default_suggestions;

const EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestPhase {
    #[default]
    Idle,
    AwaitingContent,
    Generating,
    /// Blocks new submissions until `retry` or `clear_error`.
    Erroring,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started,
    /// Held until the running request finishes or the user opts in.
    Queued,
}

/// Point-in-time copy of a session's observable state.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub conversation_id: ConversationId,
    pub history: Vec<Turn>,
    pub pending: Option<Turn>,
    pub suggestions: Vec<Suggestion>,
    pub suggestion_status: SuggestionStatus,
    pub current_error: Option<ApiError>,
    pub phase: RequestPhase,
    pub model_key: String,
    pub selected_language: Option<String>,
    pub should_send: bool,
    pub associated_content: Vec<ContentRef>,
    pub clients: usize,
}

struct ActiveRequest {
    id: u64,
    cancel: CancellationToken,
}

struct SessionState {
    history: Vec<Turn>,
    pending: Option<Turn>,
    suggestions: Vec<Suggestion>,
    suggestion_status: SuggestionStatus,
    /// Sampled once so the default list does not reshuffle on every reseed.
    default_suggestions: Vec<Suggestion>,
    current_error: Option<ApiError>,
    phase: RequestPhase,
    model_key: String,
    engine: Arc<dyn GenerationEngine>,
    selected_language: Option<String>,
    should_send: bool,
    clients: usize,
    request: Option<ActiveRequest>,
    next_request_id: u64,
    /// Bumped whenever the content changes; in-flight suggestion results
    /// from an older generation are dropped.
    suggestion_generation: u64,
}

impl SessionState {
    fn is_current(&self, id: u64) -> bool {
        self.request.as_ref().is_some_and(|r| r.id == id)
    }

    fn has_committed_history(&self) -> bool {
        self.history.iter().any(|t| !t.is_staged)
    }
}

struct SessionInner {
    id: ConversationId,
    is_temporary: bool,
    ctx: AppContext,
    content: ContentAssociationManager,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    weak_self: Weak<SessionInner>,
    _subscription: Subscription,
}

/// Cheap, cloneable handle to one conversation's working state.
#[derive(Clone)]
pub struct ConversationSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("id", &self.inner.id)
            .field("is_temporary", &self.inner.is_temporary)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Counts an attached UI client for as long as it is held.
#[must_use = "the client is detached when the guard is dropped"]
pub struct ClientGuard {
    session: Weak<SessionInner>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            let mut state = inner.state.lock();
            state.clients = state.clients.saturating_sub(1);
            debug!(conversation_id = %inner.id, clients = state.clients, "client detached");
            inner.emit(SessionEvent::ClientsChanged {
                conversation_id: inner.id.clone(),
                connected: state.clients,
            });
        }
    }
}

fn resolve_engine(
    ctx: &AppContext,
    requested: Option<String>,
) -> Result<(String, usize, Arc<dyn GenerationEngine>), SessionError> {
    if let Some(key) = requested {
        match ctx.models.model(&key) {
            Some(model) => match ctx.models.engine_for(&key) {
                Ok(engine) => return Ok((key, model.max_content_length, engine)),
                Err(e) => warn!(model_key = %key, error = %e, "model unusable, falling back to default"),
            },
            None => warn!(model_key = %key, "unknown model, falling back to default"),
        }
    }
    let key = ctx.models.default_model_key();
    let model = ctx
        .models
        .model(&key)
        .ok_or_else(|| SessionError::ModelNotFound(key.clone()))?;
    let engine = ctx.models.engine_for(&key)?;
    Ok((key, model.max_content_length, engine))
}

/// Summarize suggestions are submitted by title; map them to their action.
fn classify(turn: &mut Turn) {
    if turn.action_type != ActionType::Unspecified {
        return;
    }
    let (action, prompt) = match turn.text.as_str() {
        SUMMARIZE_PAGE_TITLE => (ActionType::SummarizePage, Some(SUMMARIZE_PAGE_PROMPT)),
        SUMMARIZE_VIDEO_TITLE => (ActionType::SummarizeVideo, Some(SUMMARIZE_VIDEO_PROMPT)),
        _ => (ActionType::Query, None),
    };
    turn.action_type = action;
    if turn.prompt.is_none() {
        turn.prompt = prompt.map(str::to_string);
    }
}

fn staged_turns(entries: &[StagedEntry]) -> Vec<Turn> {
    entries
        .iter()
        .flat_map(|e| {
            [
                Turn::human_with_action(e.query.clone(), ActionType::Query).staged(),
                Turn::assistant_with_text(e.summary.clone()).staged(),
            ]
        })
        .collect()
}

impl ConversationSession {
    /// Start a fresh session. An unknown or unusable `model_key` falls back
    /// to the catalog default.
    pub fn new(
        id: ConversationId,
        ctx: AppContext,
        is_temporary: bool,
        model_key: Option<String>,
    ) -> Result<Self, SessionError> {
        let (model_key, budget, engine) = resolve_engine(&ctx, model_key)?;
        let default_suggestions = sample_default_suggestions(ctx.suggestion_sample_size);
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let content = ContentAssociationManager::new(budget);
            let observer: Weak<dyn ContentObserver> = weak.clone();
            let subscription = content.subscribe(observer);
            let (events, _) = broadcast::channel(EVENT_CAPACITY);
            SessionInner {
                id,
                is_temporary,
                ctx,
                content,
                state: Mutex::new(SessionState {
                    history: Vec::new(),
                    pending: None,
                    suggestions: default_suggestions.clone(),
                    suggestion_status: SuggestionStatus::None,
                    default_suggestions,
                    current_error: None,
                    phase: RequestPhase::Idle,
                    model_key,
                    engine,
                    selected_language: None,
                    should_send: true,
                    clients: 0,
                    request: None,
                    next_request_id: 0,
                    suggestion_generation: 0,
                }),
                events,
                weak_self: weak.clone(),
                _subscription: subscription,
            }
        });
        info!(conversation_id = %inner.id, is_temporary, "session created");
        Ok(Self { inner })
    }

    /// Rebuild a session from persisted entries and archived content.
    pub fn restore(
        id: ConversationId,
        ctx: AppContext,
        model_key: Option<String>,
        archive: ConversationArchive,
    ) -> Result<Self, SessionError> {
        let session = Self::new(id, ctx, false, model_key)?;
        let inner = &session.inner;
        for content_ref in &archive.associated_content {
            let text = archive.text_for(&content_ref.uuid).unwrap_or_default();
            let content = PageContent::new(text, content_ref.content_type == ContentType::Video);
            let archived = ArchivedContent::new(
                content_ref.content_id,
                content_ref.url.clone(),
                content_ref.title.clone(),
                content,
            );
            inner
                .content
                .add_archived(content_ref.uuid.clone(), archived, content_ref.turn_uuid.clone());
        }
        {
            let mut state = inner.state.lock();
            state.history = archive.entries;
            inner.reseed_suggestions(&mut state, true);
        }
        debug!(conversation_id = %inner.id, entries = session.history().len(), "session restored");
        Ok(session)
    }

    pub fn id(&self) -> &ConversationId {
        &self.inner.id
    }

    pub fn is_temporary(&self) -> bool {
        self.inner.is_temporary
    }

    pub fn content(&self) -> &ContentAssociationManager {
        &self.inner.content
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn history(&self) -> Vec<Turn> {
        self.inner.state.lock().history.clone()
    }

    /// History plus the queued turn, as a client should render it.
    pub fn visible_history(&self) -> Vec<Turn> {
        let state = self.inner.state.lock();
        let mut turns = state.history.clone();
        turns.extend(state.pending.clone());
        turns
    }

    /// True once a non-staged turn exists.
    pub fn has_any_history(&self) -> bool {
        self.inner.state.lock().has_committed_history()
    }

    pub fn is_request_in_progress(&self) -> bool {
        self.inner.state.lock().request.is_some()
    }

    pub fn phase(&self) -> RequestPhase {
        self.inner.state.lock().phase
    }

    pub fn current_error(&self) -> Option<ApiError> {
        self.inner.state.lock().current_error.clone()
    }

    pub fn pending_turn(&self) -> Option<Turn> {
        self.inner.state.lock().pending.clone()
    }

    pub fn suggestions(&self) -> (Vec<Suggestion>, SuggestionStatus) {
        let state = self.inner.state.lock();
        (state.suggestions.clone(), state.suggestion_status)
    }

    pub fn model_key(&self) -> String {
        self.inner.state.lock().model_key.clone()
    }

    pub fn should_send(&self) -> bool {
        self.inner.state.lock().should_send
    }

    pub fn clients(&self) -> usize {
        self.inner.state.lock().clients
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state.lock();
        SessionSnapshot {
            conversation_id: self.inner.id.clone(),
            history: state.history.clone(),
            pending: state.pending.clone(),
            suggestions: state.suggestions.clone(),
            suggestion_status: state.suggestion_status,
            current_error: state.current_error.clone(),
            phase: state.phase,
            model_key: state.model_key.clone(),
            selected_language: state.selected_language.clone(),
            should_send: state.should_send,
            associated_content: self.inner.content.associated_content(),
            clients: state.clients,
        }
    }

    /// Submit a human turn. Queued when the user has not opted in or a
    /// request is already running.
    pub fn submit(&self, turn: Turn) -> Result<SubmitOutcome, SessionError> {
        let mut state = self.inner.state.lock();
        self.inner.submit_locked(&mut state, turn)
    }

    /// Submit one of the current suggestions by title.
    pub fn submit_suggestion(&self, title: &str) -> Result<SubmitOutcome, SessionError> {
        let mut state = self.inner.state.lock();
        let suggestion = state
            .suggestions
            .iter()
            .find(|s| s.title == title)
            .cloned()
            .ok_or_else(|| SessionError::SuggestionNotFound(title.to_string()))?;
        let mut turn = Turn::human_with_action(suggestion.title.clone(), suggestion.action_type);
        turn.prompt = suggestion.prompt.clone();
        let outcome = self.inner.submit_locked(&mut state, turn)?;
        if outcome == SubmitOutcome::Queued {
            state.suggestions.retain(|s| s.title != title);
            self.inner.emit_suggestions(&state);
        }
        Ok(outcome)
    }

    /// Replace the text of the queued turn.
    pub fn edit_pending(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        let engine = Arc::clone(&state.engine);
        let pending = state.pending.as_mut().ok_or(SessionError::NothingQueued)?;
        let mut text = text.into();
        engine.sanitize(&mut text);
        pending.text = text;
        pending.prompt = None;
        pending.action_type = ActionType::Unspecified;
        self.inner.emit_history(None);
        Ok(())
    }

    /// Cancel the running request. A trailing human turn that got no reply
    /// is detached and returned; a queued turn starts in its place.
    pub fn stop_generation(&self) -> Option<Turn> {
        let mut state = self.inner.state.lock();
        let detached = self.inner.stop_locked(&mut state);
        self.inner.replay_pending(&mut state);
        detached
    }

    /// Clear the error and resubmit the most recent human turn.
    pub fn retry(&self) -> Result<SubmitOutcome, SessionError> {
        let mut state = self.inner.state.lock();
        if state.request.is_some() {
            return Err(SessionError::RequestInProgress);
        }
        let index = state
            .history
            .iter()
            .rposition(|t| t.is_human())
            .ok_or(SessionError::NothingToRetry)?;
        let removed = state.history.split_off(index);
        self.inner.emit_removed(&removed);
        self.inner.reset_error(&mut state);
        let mut removed = removed.into_iter();
        let turn = removed.next().ok_or(SessionError::NothingToRetry)?;
        info!(conversation_id = %self.inner.id, "retrying last turn");
        self.inner.submit_locked(&mut state, turn)
    }

    /// Clear the error and hand back the turn that failed.
    pub fn clear_error(&self) -> Option<Turn> {
        let mut state = self.inner.state.lock();
        if state.phase != RequestPhase::Erroring {
            return None;
        }
        self.inner.reset_error(&mut state);
        let turn = state.history.pop();
        if let Some(turn) = &turn {
            self.inner.emit_removed(std::slice::from_ref(turn));
        }
        self.inner.emit_history(None);
        self.inner.reseed_suggestions(&mut state, false);
        self.inner.replay_pending(&mut state);
        turn
    }

    /// Edit the turn at `index`. Assistant edits are recorded in place;
    /// human edits drop everything after the turn and resubmit it.
    pub fn modify(&self, index: usize, text: impl Into<String>) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        if state.request.is_some() {
            return Err(SessionError::RequestInProgress);
        }
        let target = state.history.get(index).ok_or(SessionError::IndexOutOfRange(index))?;
        let mut text = text.into();

        if target.is_assistant() {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed == target.latest().text {
                return Ok(());
            }
            let mut edit = Turn::assistant_with_text(trimmed);
            edit.model_key = target.model_key.clone();
            let turn = &mut state.history[index];
            turn.edits.push(edit);
            let updated = turn.clone();
            self.inner.emit(SessionEvent::EntryUpdated {
                conversation_id: self.inner.id.clone(),
                turn: updated,
            });
            self.inner.emit_history(None);
            return Ok(());
        }

        state.engine.sanitize(&mut text);
        let target = &state.history[index];
        if text.trim().is_empty() || text == target.latest().text {
            return Ok(());
        }
        let mut removed = state.history.split_off(index);
        self.inner.emit_removed(&removed);
        let mut turn = removed.remove(0);
        let action = if turn.action_type.is_summarize() {
            ActionType::Query
        } else {
            turn.action_type
        };
        let mut edit = Turn::human_with_action(text, action);
        edit.selected_text = turn.selected_text.clone();
        turn.edits.push(edit);
        self.inner.reset_error(&mut state);
        self.inner.submit_locked(&mut state, turn).map(|_| ())
    }

    /// Ask the engine for more suggestions about the associated content.
    pub fn generate_suggestions(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if !inner.ctx.has_user_opted_in() {
            return Err(SessionError::NotOptedIn);
        }
        let (engine, language, generation) = {
            let mut state = inner.state.lock();
            if !(state.should_send && inner.content.has_content()) {
                return Err(SessionError::NoContent);
            }
            if matches!(
                state.suggestion_status,
                SuggestionStatus::IsGenerating | SuggestionStatus::HasGenerated
            ) {
                return Err(SessionError::SuggestionsAlreadyGenerated);
            }
            state.suggestion_status = SuggestionStatus::IsGenerating;
            inner.emit_suggestions(&state);
            (
                Arc::clone(&state.engine),
                state.selected_language.clone(),
                state.suggestion_generation,
            )
        };
        tokio::spawn(Arc::clone(inner).run_suggestions(engine, language, generation));
        Ok(())
    }

    /// Toggle whether associated content is sent with requests.
    pub fn set_should_send(&self, should_send: bool) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock();
            if should_send && !self.inner.content.has_content() {
                return Err(SessionError::NoContent);
            }
            if state.should_send == should_send {
                return Ok(());
            }
            state.should_send = should_send;
            self.inner.emit_content(&state);
            self.inner.reseed_suggestions(&mut state, true);
        }
        self.inner.refresh_staged_entries();
        Ok(())
    }

    /// Switch models. An in-flight request is restarted on the new engine.
    pub fn change_model(&self, key: &str) -> Result<(), SessionError> {
        let inner = &self.inner;
        let model = inner
            .ctx
            .models
            .model(key)
            .ok_or_else(|| SessionError::ModelNotFound(key.to_string()))?;
        let engine = match inner.ctx.models.engine_for(key) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(conversation_id = %inner.id, model_key = key, error = %e, "model change rejected");
                let mut state = inner.state.lock();
                state.current_error = Some(e.clone());
                inner.emit(SessionEvent::ApiError {
                    conversation_id: inner.id.clone(),
                    error: Some(e.clone()),
                });
                return Err(e.into());
            }
        };

        let mut state = inner.state.lock();
        let interrupted = inner.stop_locked(&mut state);
        state.engine = engine;
        state.model_key = model.key.clone();
        inner.content.set_budget(model.max_content_length);
        info!(conversation_id = %inner.id, model_key = %model.key, "model changed");
        inner.emit(SessionEvent::ModelChanged {
            conversation_id: inner.id.clone(),
            model_key: model.key,
        });
        inner.emit_content(&state);
        if let Some(turn) = interrupted {
            inner.submit_locked(&mut state, turn)?;
        }
        Ok(())
    }

    /// Register a UI client. Staged entries and queued turns wait for one.
    pub fn attach_client(&self) -> ClientGuard {
        {
            let mut state = self.inner.state.lock();
            state.clients += 1;
            debug!(conversation_id = %self.inner.id, clients = state.clients, "client attached");
            self.inner.emit(SessionEvent::ClientsChanged {
                conversation_id: self.inner.id.clone(),
                connected: state.clients,
            });
            self.inner.replay_pending(&mut state);
        }
        self.inner.refresh_staged_entries();
        ClientGuard {
            session: Arc::downgrade(&self.inner),
        }
    }

    /// The user opted in: replay anything that was waiting on consent.
    pub fn on_user_opted_in(&self) {
        {
            let mut state = self.inner.state.lock();
            self.inner.replay_pending(&mut state);
        }
        self.inner.refresh_staged_entries();
    }
}

impl ContentObserver for SessionInner {
    fn on_associated_content_changed(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        {
            let mut state = this.state.lock();
            if !this.content.has_content() && !state.should_send {
                state.should_send = true;
            }
            this.emit_content(&state);
            this.reseed_suggestions(&mut state, true);
        }
        this.refresh_staged_entries();
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        // No receivers is normal while no client or registry listens.
        let _ = self.events.send(event);
    }

    fn emit_history(&self, partial_turn: Option<Turn>) {
        self.emit(SessionEvent::HistoryChanged {
            conversation_id: self.id.clone(),
            partial_turn,
        });
    }

    fn emit_in_progress(&self, in_progress: bool) {
        self.emit(SessionEvent::RequestInProgress {
            conversation_id: self.id.clone(),
            in_progress,
        });
    }

    fn emit_removed(&self, turns: &[Turn]) {
        for turn in turns {
            self.emit(SessionEvent::EntryRemoved {
                conversation_id: self.id.clone(),
                turn_uuid: turn.uuid.clone(),
            });
        }
    }

    fn emit_suggestions(&self, state: &SessionState) {
        self.emit(SessionEvent::SuggestionsChanged {
            conversation_id: self.id.clone(),
            suggestions: state.suggestions.clone(),
            status: state.suggestion_status,
        });
    }

    fn emit_content(&self, state: &SessionState) {
        self.emit(SessionEvent::AssociatedContentChanged {
            conversation_id: self.id.clone(),
            content: self.content.associated_content(),
            should_send: state.should_send,
        });
    }

    fn reset_error(&self, state: &mut SessionState) {
        if state.current_error.take().is_some() || state.phase == RequestPhase::Erroring {
            state.phase = RequestPhase::Idle;
            self.emit(SessionEvent::ApiError {
                conversation_id: self.id.clone(),
                error: None,
            });
        }
    }

    fn submit_locked(&self, state: &mut SessionState, turn: Turn) -> Result<SubmitOutcome, SessionError> {
        if !turn.is_human() {
            return Err(SessionError::NotHuman);
        }
        if state.phase == RequestPhase::Erroring {
            warn!(conversation_id = %self.id, "submit rejected while erroring");
            return Err(SessionError::Erroring);
        }
        if !self.ctx.has_user_opted_in() || state.request.is_some() {
            if state.pending.is_some() {
                warn!(conversation_id = %self.id, "submit rejected, a turn is already queued");
                return Err(SessionError::QueueFull);
            }
            debug!(conversation_id = %self.id, "turn queued");
            state.pending = Some(turn);
            self.emit_history(None);
            return Ok(SubmitOutcome::Queued);
        }
        self.start_request(state, turn);
        Ok(SubmitOutcome::Started)
    }

    /// Start the queued turn if nothing blocks it any more.
    fn replay_pending(&self, state: &mut SessionState) {
        if !self.ctx.has_user_opted_in() || state.request.is_some() || state.phase == RequestPhase::Erroring {
            return;
        }
        if let Some(turn) = state.pending.take() {
            debug!(conversation_id = %self.id, "replaying queued turn");
            self.start_request(state, turn);
        }
    }

    fn start_request(&self, state: &mut SessionState, mut turn: Turn) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let engine = Arc::clone(&state.engine);
        if turn.edits.is_empty() {
            engine.sanitize(&mut turn.text);
        }
        if let Some(selected) = turn.selected_text.as_mut() {
            engine.sanitize(selected);
        }
        classify(&mut turn);
        turn.model_key = Some(state.model_key.clone());

        // The first real turn makes staged turns part of the record.
        for staged in state.history.iter_mut().filter(|t| t.is_staged) {
            staged.is_staged = false;
            self.emit(SessionEvent::EntryAdded {
                conversation_id: self.id.clone(),
                turn: staged.clone(),
            });
        }

        let latest = turn.latest();
        let question = latest.prompt.clone().unwrap_or_else(|| latest.text.clone());
        let submitted_title = turn.text.clone();
        let turn_uuid = turn.uuid.clone();
        state.history.push(turn.clone());
        self.emit(SessionEvent::EntryAdded {
            conversation_id: self.id.clone(),
            turn,
        });
        self.emit_history(None);

        state.suggestions.retain(|s| s.title != submitted_title);
        self.reseed_suggestions(state, false);

        let with_content = state.should_send && self.content.has_content();
        if with_content {
            self.content.bind_to_turn(&turn_uuid);
            state.phase = RequestPhase::AwaitingContent;
        } else {
            state.phase = RequestPhase::Generating;
        }

        let id = state.next_request_id;
        state.next_request_id += 1;
        let cancel = CancellationToken::new();
        state.request = Some(ActiveRequest {
            id,
            cancel: cancel.clone(),
        });
        debug!(conversation_id = %self.id, request_id = id, with_content, "request started");
        self.emit_in_progress(true);

        let language = state.selected_language.clone();
        let model_key = state.model_key.clone();
        tokio::spawn(this.run_request(RequestPlan {
            id,
            cancel,
            with_content,
            engine,
            question,
            language,
            model_key,
        }));
    }

    #[instrument(skip_all, fields(conversation_id = %self.id, request_id = plan.id))]
    async fn run_request(self: Arc<Self>, plan: RequestPlan) {
        let RequestPlan {
            id,
            cancel,
            with_content,
            engine,
            question,
            language,
            model_key,
        } = plan;

        let mut contents = Vec::new();
        if with_content {
            contents = tokio::select! {
                _ = cancel.cancelled() => return,
                contents = self.content.get_content() => contents,
            };
            for content in &mut contents {
                engine.sanitize(&mut content.text);
            }
        }

        let request = {
            let mut state = self.state.lock();
            if !state.is_current(id) {
                return;
            }
            state.phase = RequestPhase::Generating;
            if with_content {
                self.emit_content(&state);
            }
            GenerationRequest {
                conversation_id: self.id.clone(),
                contents,
                history: state.history.clone(),
                question,
                selected_language: language,
            }
        };

        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            stream = engine.generate_response(request) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                self.finish_request(id, Some(e));
                return;
            }
        };

        let assembler = ResponseAssembler::new(engine.supports_incremental_text(), Some(model_key));
        let mut failure = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                Some(Ok(event)) => {
                    if !self.apply_event(id, &assembler, event) {
                        return;
                    }
                }
            }
        }
        self.finish_request(id, failure);
    }

    fn apply_event(&self, id: u64, assembler: &ResponseAssembler, event: TurnEvent) -> bool {
        let mut state = self.state.lock();
        if !state.is_current(id) {
            return false;
        }
        match assembler.apply(&mut state.history, event) {
            AssemblyOutcome::TurnUpdated => {
                let partial = state.history.last().cloned();
                self.emit_history(partial);
            }
            AssemblyOutcome::Title(title) => {
                self.emit(SessionEvent::TitleChanged {
                    conversation_id: self.id.clone(),
                    title,
                });
            }
            AssemblyOutcome::Language(language) => {
                debug!(conversation_id = %self.id, %language, "selected language");
                state.selected_language = Some(language);
            }
            AssemblyOutcome::TokenInfo {
                total_tokens,
                trimmed_tokens,
            } => {
                self.emit(SessionEvent::TokenInfoChanged {
                    conversation_id: self.id.clone(),
                    total_tokens,
                    trimmed_tokens,
                });
            }
        }
        true
    }

    fn finish_request(&self, id: u64, failure: Option<ApiError>) {
        let mut state = self.state.lock();
        if !state.is_current(id) {
            return;
        }
        state.request = None;
        let completed = matches!(state.history.last(), Some(t) if t.is_assistant() && t.has_completion());

        if failure.is_none() && completed {
            state.phase = RequestPhase::Idle;
            if let Some(turn) = state.history.last().cloned() {
                self.emit(SessionEvent::EntryAdded {
                    conversation_id: self.id.clone(),
                    turn,
                });
            }
            self.emit_history(None);
            self.emit_in_progress(false);
            debug!(conversation_id = %self.id, request_id = id, "request complete");
            self.replay_pending(&mut state);
            return;
        }

        if matches!(state.history.last(), Some(t) if t.is_assistant()) {
            state.history.pop();
            self.emit_history(None);
        }
        let error = failure.unwrap_or(ApiError::ConnectionIssue);
        warn!(conversation_id = %self.id, request_id = id, error = %error, "request failed");
        state.current_error = Some(error.clone());
        state.phase = RequestPhase::Erroring;
        self.emit(SessionEvent::ApiError {
            conversation_id: self.id.clone(),
            error: Some(error),
        });
        self.emit_in_progress(false);
    }

    fn stop_locked(&self, state: &mut SessionState) -> Option<Turn> {
        let request = state.request.take()?;
        request.cancel.cancel();
        state.engine.clear_all_queries();
        state.phase = RequestPhase::Idle;
        info!(conversation_id = %self.id, request_id = request.id, "generation stopped");

        if matches!(state.history.last(), Some(t) if t.is_assistant() && !t.has_completion()) {
            state.history.pop();
        }
        let detached = match state.history.last() {
            Some(t) if t.is_assistant() => {
                let turn = t.clone();
                self.emit(SessionEvent::EntryAdded {
                    conversation_id: self.id.clone(),
                    turn,
                });
                None
            }
            Some(t) if t.is_human() => {
                let turn = state.history.pop();
                if let Some(turn) = &turn {
                    self.emit_removed(std::slice::from_ref(turn));
                }
                turn
            }
            _ => None,
        };
        self.emit_history(None);
        self.emit_in_progress(false);
        if detached.is_some() {
            self.reseed_suggestions(state, false);
        }
        detached
    }

    /// Recompute the suggestion list. `content_changed` drops anything the
    /// engine generated for the previous content.
    fn reseed_suggestions(&self, state: &mut SessionState, content_changed: bool) {
        let associated = state.should_send && self.content.has_content();
        let mut suggestions = Vec::new();
        let before = state.suggestion_status;
        if content_changed {
            state.suggestion_generation += 1;
            if state.suggestion_status == SuggestionStatus::IsGenerating {
                state.suggestion_status = SuggestionStatus::CanGenerate;
            }
        }
        if associated {
            if state.suggestion_status == SuggestionStatus::None {
                state.suggestion_status = SuggestionStatus::CanGenerate;
            }
            if !state.history.iter().any(|t| t.action_type.is_summarize()) {
                suggestions.push(Suggestion::summarize(self.content.is_video()));
            }
            if !content_changed {
                suggestions.extend(
                    state
                        .suggestions
                        .iter()
                        .filter(|s| s.action_type == ActionType::Suggestion)
                        .cloned(),
                );
            }
        } else {
            state.suggestion_status = SuggestionStatus::None;
        }
        if !state.has_committed_history() && state.pending.is_none() {
            suggestions.extend(state.default_suggestions.iter().cloned());
        }
        if suggestions != state.suggestions || before != state.suggestion_status {
            state.suggestions = suggestions;
            self.emit_suggestions(state);
        }
    }

    #[instrument(skip_all, fields(conversation_id = %self.id))]
    async fn run_suggestions(
        self: Arc<Self>,
        engine: Arc<dyn GenerationEngine>,
        language: Option<String>,
        generation: u64,
    ) {
        let _ = self.content.get_content().await;
        let is_video = self.content.is_video();
        let text = self.content.cached_text();
        let result = engine.generate_suggestions(is_video, &text, language.as_deref()).await;

        let mut state = self.state.lock();
        if state.suggestion_generation != generation || state.suggestion_status != SuggestionStatus::IsGenerating {
            debug!("suggestions discarded, content changed while generating");
            return;
        }
        match result {
            Ok(generated) => {
                state.suggestions.extend(generated.into_iter().map(Suggestion::generated));
                state.suggestion_status = SuggestionStatus::HasGenerated;
            }
            Err(e) => {
                warn!(error = %e, "suggestion generation failed");
                state.suggestion_status = SuggestionStatus::CanGenerate;
            }
        }
        self.emit_suggestions(&state);
    }

    /// Fetch staged entries when a client, consent and content are all
    /// present; drop staged turns when content is no longer sent.
    fn refresh_staged_entries(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let sources = {
            let mut state = self.state.lock();
            if state.has_committed_history() {
                return;
            }
            let associated = state.should_send && self.content.has_content();
            if !associated {
                let before = state.history.len();
                state.history.retain(|t| !t.is_staged);
                if state.history.len() != before {
                    debug!(conversation_id = %self.id, "staged entries cleared");
                    self.emit_history(None);
                }
                return;
            }
            if state.clients == 0 || !self.ctx.has_user_opted_in() {
                return;
            }
            self.content.live_sources()
        };
        if sources.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for source in sources {
                if let Some(entries) = source.staged_entries().await {
                    this.apply_staged_entries(&entries);
                }
            }
        });
    }

    fn apply_staged_entries(&self, entries: &[StagedEntry]) {
        let mut state = self.state.lock();
        if state.has_committed_history() || !(state.should_send && self.content.has_content()) {
            return;
        }
        let turns = staged_turns(entries);
        let unchanged = turns.len() == state.history.len()
            && turns
                .iter()
                .zip(&state.history)
                .all(|(a, b)| a.character == b.character && a.text == b.text);
        if unchanged {
            return;
        }
        debug!(conversation_id = %self.id, count = entries.len(), "staged entries applied");
        state.history = turns;
        self.emit_history(None);
        self.reseed_suggestions(&mut state, false);
    }
}

struct RequestPlan {
    id: u64,
    cancel: CancellationToken,
    with_content: bool,
    engine: Arc<dyn GenerationEngine>,
    question: String,
    language: Option<String>,
    model_key: String,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockEngine, MockReply};
    use crate::models::{StaticModelCatalog, ADVANCED_MODEL_KEY};
    use parley_content::mock::MockContentSource;
    use parley_core::content::ContentSource;
    use parley_core::engine::ModelInfo;
    use parley_core::ids::ContentId;

    fn context(engine: &Arc<MockEngine>, opted_in: bool) -> AppContext {
        let catalog = StaticModelCatalog::with_engine(engine.clone());
        AppContext::new(Arc::new(catalog), opted_in)
    }

    fn setup(replies: Vec<MockReply>) -> (ConversationSession, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::with_replies(true, replies));
        let session = ConversationSession::new(ConversationId::new(), context(&engine, true), false, None).unwrap();
        (session, engine)
    }

    fn page(id: i64, text: &str) -> Arc<MockContentSource> {
        Arc::new(MockContentSource::new(ContentId(id), &format!("https://{id}.test"), text))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    async fn settle(session: &ConversationSession) {
        wait_for(|| !session.is_request_in_progress()).await;
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn submit_without_content_produces_reply() {
        let (session, engine) = setup(vec![MockReply::text("Hello there")]);
        let mut rx = session.subscribe();

        assert_eq!(session.submit(Turn::human("Hi")).unwrap(), SubmitOutcome::Started);
        assert!(session.is_request_in_progress());
        settle(&session).await;

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert!(history[0].is_human());
        assert_eq!(history[0].action_type, ActionType::Query);
        assert_eq!(history[1].text, "Hello there");
        assert_eq!(session.phase(), RequestPhase::Idle);
        assert!(engine.requests()[0].contents.is_empty());

        let toggles: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::RequestInProgress { in_progress, .. } => Some(in_progress),
                _ => None,
            })
            .collect();
        assert_eq!(toggles, vec![true, false]);
    }

    #[tokio::test]
    async fn streamed_chunks_merge_into_one_turn() {
        let (session, _) = setup(vec![MockReply::chunks(&["This", " is ", "successful."])]);
        session.submit(Turn::human("go")).unwrap();
        settle(&session).await;
        let history = session.history();
        assert_eq!(history[1].text, "This is successful.");
        assert_eq!(history[1].events.len(), 1);
    }

    #[tokio::test]
    async fn side_channel_events_update_session() {
        let (session, _) = setup(vec![MockReply::Events(vec![
            Ok(TurnEvent::completion("answer")),
            Ok(TurnEvent::ConversationTitle { title: "Greeting".into() }),
            Ok(TurnEvent::SelectedLanguage { language: "fr".into() }),
            Ok(TurnEvent::ContentReceipt {
                total_tokens: 120,
                trimmed_tokens: 20,
            }),
        ])]);
        let mut rx = session.subscribe();
        session.submit(Turn::human("hi")).unwrap();
        settle(&session).await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::TitleChanged { title, .. } if title == "Greeting")));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::TokenInfoChanged { total_tokens: 120, trimmed_tokens: 20, .. }
        )));
        assert_eq!(session.snapshot().selected_language.as_deref(), Some("fr"));
        assert_eq!(session.history()[1].events.len(), 1);
    }

    #[tokio::test]
    async fn queued_until_opt_in() {
        let engine = Arc::new(MockEngine::with_replies(true, vec![MockReply::text("ok")]));
        let ctx = context(&engine, false);
        let session = ConversationSession::new(ConversationId::new(), ctx.clone(), false, None).unwrap();

        assert_eq!(session.submit(Turn::human("first")).unwrap(), SubmitOutcome::Queued);
        assert!(matches!(session.submit(Turn::human("second")), Err(SessionError::QueueFull)));
        assert!(session.history().is_empty());
        assert_eq!(session.visible_history().len(), 1);

        session.edit_pending("first, edited").unwrap();
        ctx.set_user_opted_in(true);
        session.on_user_opted_in();
        settle(&session).await;

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "first, edited");
        assert!(session.pending_turn().is_none());
    }

    #[tokio::test]
    async fn submit_during_request_runs_afterwards() {
        let (session, engine) = setup(vec![
            MockReply::delayed(Duration::from_millis(20), MockReply::text("one")),
            MockReply::text("two"),
        ]);
        session.submit(Turn::human("a")).unwrap();
        assert_eq!(session.submit(Turn::human("b")).unwrap(), SubmitOutcome::Queued);
        wait_for(|| session.history().len() == 4).await;
        settle(&session).await;

        let texts: Vec<String> = session.history().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["a", "one", "b", "two"]);
        assert_eq!(engine.request_count(), 2);
    }

    #[tokio::test]
    async fn non_human_turn_rejected() {
        let (session, _) = setup(vec![]);
        assert!(matches!(
            session.submit(Turn::assistant_with_text("nope")),
            Err(SessionError::NotHuman)
        ));
    }

    #[tokio::test]
    async fn stream_error_blocks_until_retry() {
        let (session, engine) = setup(vec![
            MockReply::Events(vec![Ok(TurnEvent::completion("par")), Err(ApiError::RateLimitReached)]),
            MockReply::text("recovered"),
        ]);
        session.submit(Turn::human("hi")).unwrap();
        settle(&session).await;

        assert_eq!(session.phase(), RequestPhase::Erroring);
        assert_eq!(session.current_error(), Some(ApiError::RateLimitReached));
        assert_eq!(session.history().len(), 1);
        assert!(matches!(session.submit(Turn::human("again")), Err(SessionError::Erroring)));

        session.retry().unwrap();
        settle(&session).await;
        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text, "recovered");
        assert_eq!(session.current_error(), None);
        assert_eq!(engine.request_count(), 2);
    }

    #[tokio::test]
    async fn empty_completion_is_connection_issue() {
        let (session, _) = setup(vec![MockReply::Events(vec![])]);
        session.submit(Turn::human("hi")).unwrap();
        settle(&session).await;
        assert_eq!(session.current_error(), Some(ApiError::ConnectionIssue));
        assert_eq!(session.phase(), RequestPhase::Erroring);
    }

    #[tokio::test]
    async fn clear_error_returns_failed_turn() {
        let (session, _) = setup(vec![MockReply::Error(ApiError::ServiceOverloaded)]);
        session.submit(Turn::human("hi")).unwrap();
        settle(&session).await;

        let turn = session.clear_error().unwrap();
        assert_eq!(turn.text, "hi");
        assert!(session.history().is_empty());
        assert_eq!(session.phase(), RequestPhase::Idle);
        assert!(session.clear_error().is_none());
    }

    #[tokio::test]
    async fn stop_detaches_unanswered_turn() {
        let (session, engine) = setup(vec![MockReply::Stall(vec![])]);
        let mut rx = session.subscribe();
        session.submit(Turn::human("hi")).unwrap();
        wait_for(|| engine.request_count() == 1).await;

        let detached = session.stop_generation().unwrap();
        assert_eq!(detached.text, "hi");
        assert!(session.history().is_empty());
        assert!(!session.is_request_in_progress());
        assert_eq!(engine.clear_calls(), 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::EntryRemoved { turn_uuid, .. } if *turn_uuid == detached.uuid)));
    }

    #[tokio::test]
    async fn stop_keeps_partial_answer() {
        let (session, _) = setup(vec![MockReply::Stall(vec![Ok(TurnEvent::completion("partial"))])]);
        session.submit(Turn::human("hi")).unwrap();
        wait_for(|| session.history().len() == 2).await;

        assert!(session.stop_generation().is_none());
        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text, "partial");
        assert_eq!(session.phase(), RequestPhase::Idle);
    }

    #[tokio::test]
    async fn queued_turn_runs_after_stop() {
        let (session, engine) = setup(vec![MockReply::Stall(vec![]), MockReply::text("second answer")]);
        assert!(matches!(session.submit(Turn::human("a")), Ok(SubmitOutcome::Started)));
        wait_for(|| engine.request_count() == 1).await;
        assert!(matches!(session.submit(Turn::human("b")), Ok(SubmitOutcome::Queued)));

        let detached = session.stop_generation().unwrap();
        assert_eq!(detached.text, "a");
        assert!(session.pending_turn().is_none());
        assert!(session.is_request_in_progress());

        settle(&session).await;
        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "b");
        assert_eq!(history[1].text, "second answer");
        assert_eq!(engine.request_count(), 2);
    }

    #[tokio::test]
    async fn debug_shows_id_and_phase() {
        let (session, _) = setup(vec![]);
        let printed = format!("{session:?}");
        assert!(printed.contains(session.id().as_str()));
        assert!(printed.contains("Idle"));
    }

    #[tokio::test]
    async fn modify_assistant_records_edit() {
        let (session, engine) = setup(vec![MockReply::text("original")]);
        session.submit(Turn::human("hi")).unwrap();
        settle(&session).await;

        session.modify(1, "  corrected ").unwrap();
        let history = session.history();
        assert_eq!(history[1].latest().text, "corrected");
        assert_eq!(history[1].text, "original");
        assert_eq!(engine.request_count(), 1);

        session.modify(1, "corrected").unwrap();
        assert_eq!(session.history()[1].edits.len(), 1);
    }

    #[tokio::test]
    async fn modify_human_truncates_and_resubmits() {
        let (session, engine) = setup(vec![MockReply::text("one"), MockReply::text("two")]);
        session.submit(Turn::human("Hi")).unwrap();
        settle(&session).await;

        session.modify(0, "Hello").unwrap();
        settle(&session).await;

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].latest().text, "Hello");
        assert_eq!(history[1].text, "two");
        assert_eq!(engine.requests()[1].question, "Hello");
        assert!(matches!(session.modify(9, "x"), Err(SessionError::IndexOutOfRange(9))));
    }

    #[tokio::test]
    async fn default_suggestions_cleared_by_first_query() {
        let (session, _) = setup(vec![MockReply::text("ok")]);
        let (suggestions, status) = session.suggestions();
        assert_eq!(suggestions.len(), crate::context::DEFAULT_SUGGESTION_SAMPLE_SIZE);
        assert_eq!(status, SuggestionStatus::None);

        session.submit(Turn::human("hi")).unwrap();
        settle(&session).await;
        assert!(session.suggestions().0.is_empty());
    }

    #[tokio::test]
    async fn summarize_suggestion_sends_prompt_with_content() {
        let (session, engine) = setup(vec![MockReply::text("summary")]);
        let source = page(1, "page body");
        session.content().add(source.clone(), true, false);

        let (suggestions, status) = session.suggestions();
        assert_eq!(suggestions[0].title, SUMMARIZE_PAGE_TITLE);
        assert_eq!(status, SuggestionStatus::CanGenerate);

        session.submit_suggestion(SUMMARIZE_PAGE_TITLE).unwrap();
        settle(&session).await;

        let request = &engine.requests()[0];
        assert_eq!(request.question, SUMMARIZE_PAGE_PROMPT);
        assert_eq!(request.contents[0].text, "page body");
        let history = session.history();
        assert_eq!(history[0].action_type, ActionType::SummarizePage);
        assert!(session.suggestions().0.iter().all(|s| s.title != SUMMARIZE_PAGE_TITLE));
        assert_eq!(session.content().associated_content()[0].turn_uuid, Some(history[0].uuid.clone()));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn disabled_content_is_not_sent() {
        let (session, engine) = setup(vec![MockReply::text("ok")]);
        let source = page(1, "secret");
        session.content().add(source.clone(), true, false);
        session.set_should_send(false).unwrap();

        session.submit(Turn::human("hi")).unwrap();
        settle(&session).await;
        assert!(engine.requests()[0].contents.is_empty());
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn enabling_send_without_content_is_refused() {
        let (session, _) = setup(vec![]);
        session.set_should_send(false).unwrap();
        assert!(matches!(session.set_should_send(true), Err(SessionError::NoContent)));
    }

    #[tokio::test]
    async fn generate_suggestions_ratchets() {
        let (session, engine) = setup(vec![]);
        engine.push_suggestions(Ok(vec!["What is it?".into(), "Who wrote it?".into()]));
        session.content().add(page(1, "text"), true, false);

        session.generate_suggestions().unwrap();
        assert_eq!(session.suggestions().1, SuggestionStatus::IsGenerating);
        wait_for(|| session.suggestions().1 == SuggestionStatus::HasGenerated).await;

        let (suggestions, _) = session.suggestions();
        assert!(suggestions.iter().any(|s| s.title == "What is it?" && s.action_type == ActionType::Suggestion));
        assert!(matches!(
            session.generate_suggestions(),
            Err(SessionError::SuggestionsAlreadyGenerated)
        ));
    }

    #[tokio::test]
    async fn failed_suggestion_generation_can_retry() {
        let (session, engine) = setup(vec![]);
        engine.push_suggestions(Err(ApiError::ConnectionIssue));
        session.content().add(page(1, "text"), true, false);

        session.generate_suggestions().unwrap();
        wait_for(|| engine.suggestion_calls() == 1 && session.suggestions().1 == SuggestionStatus::CanGenerate).await;
    }

    #[tokio::test]
    async fn suggestions_for_replaced_content_are_dropped() {
        let (session, engine) = setup(vec![]);
        session.content().add(page(1, "first"), true, false);
        engine.set_suggestion_delay(Duration::from_millis(50));
        engine.push_suggestions(Ok(vec!["About page one?".into()]));

        session.generate_suggestions().unwrap();
        session.content().add(page(2, "second"), true, false);
        assert_eq!(session.suggestions().1, SuggestionStatus::CanGenerate);

        wait_for(|| engine.suggestion_calls() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (suggestions, status) = session.suggestions();
        assert!(suggestions.iter().all(|s| s.title != "About page one?"));
        assert_ne!(status, SuggestionStatus::HasGenerated);
    }

    #[tokio::test]
    async fn unassociating_resets_suggestions() {
        let (session, _) = setup(vec![]);
        let source = page(1, "text");
        session.content().add(source.clone(), true, false);
        assert_eq!(session.suggestions().1, SuggestionStatus::CanGenerate);

        session.content().remove_source(source.content_id(), true);
        let (suggestions, status) = session.suggestions();
        assert_eq!(status, SuggestionStatus::None);
        assert!(suggestions.iter().all(|s| s.title != SUMMARIZE_PAGE_TITLE));
    }

    #[tokio::test]
    async fn staged_entries_follow_should_send() {
        let (session, _) = setup(vec![]);
        let _client = session.attach_client();
        let source = page(1, "results");
        source.set_staged_entries(Some(vec![StagedEntry {
            query: "rust async".into(),
            summary: "Rust async is ...".into(),
        }]));
        session.content().add(source, true, false);
        wait_for(|| session.history().len() == 2).await;

        let history = session.history();
        assert!(history.iter().all(|t| t.is_staged));
        assert!(!session.has_any_history());

        let mut rx = session.subscribe();
        session.set_should_send(false).unwrap();
        assert!(session.history().is_empty());
        let history_events = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::HistoryChanged { .. }))
            .count();
        assert_eq!(history_events, 1);
        assert!(!session.has_any_history());
    }

    #[tokio::test]
    async fn staged_entries_promoted_on_first_query() {
        let (session, _) = setup(vec![MockReply::text("sure")]);
        let _client = session.attach_client();
        let source = page(1, "results");
        source.set_staged_entries(Some(vec![StagedEntry {
            query: "q".into(),
            summary: "s".into(),
        }]));
        session.content().add(source, true, false);
        wait_for(|| session.history().len() == 2).await;

        let mut rx = session.subscribe();
        session.submit(Turn::human("follow up")).unwrap();
        settle(&session).await;

        assert!(session.history().iter().all(|t| !t.is_staged));
        let added = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::EntryAdded { .. }))
            .count();
        assert_eq!(added, 4);
    }

    #[tokio::test]
    async fn no_staged_fetch_without_client() {
        let (session, _) = setup(vec![]);
        let source = page(1, "results");
        source.set_staged_entries(Some(vec![StagedEntry {
            query: "q".into(),
            summary: "s".into(),
        }]));
        session.content().add(source, true, false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn client_guard_counts_clients() {
        let (session, _) = setup(vec![]);
        let first = session.attach_client();
        let second = session.attach_client();
        assert_eq!(session.clients(), 2);
        drop(first);
        drop(second);
        assert_eq!(session.clients(), 0);
    }

    #[tokio::test]
    async fn change_model_switches_budget() {
        let (session, _) = setup(vec![]);
        let mut rx = session.subscribe();
        session.change_model(ADVANCED_MODEL_KEY).unwrap();
        assert_eq!(session.model_key(), ADVANCED_MODEL_KEY);
        assert_eq!(session.content().budget(), 100_000);
        assert!(drain(&mut rx).iter().any(|e| matches!(e, SessionEvent::ModelChanged { .. })));
        assert!(matches!(session.change_model("missing"), Err(SessionError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn invalid_custom_model_surfaces_error() {
        let engine = Arc::new(MockEngine::new(true));
        let mut catalog = StaticModelCatalog::with_engine(engine.clone());
        catalog.add_model(ModelInfo {
            key: "custom".into(),
            display_name: "Custom".into(),
            max_content_length: 1_000,
            is_custom: true,
            endpoint: Some("http://remote.example.com".into()),
        });
        let ctx = AppContext::new(Arc::new(catalog), true);
        let session = ConversationSession::new(ConversationId::new(), ctx, false, None).unwrap();

        let err = session.change_model("custom").unwrap_err();
        assert!(matches!(err, SessionError::Api(ApiError::InvalidEndpointUrl)));
        assert_eq!(session.current_error(), Some(ApiError::InvalidEndpointUrl));
        assert_ne!(session.model_key(), "custom");
    }

    #[tokio::test]
    async fn restore_replays_archive() {
        let engine = Arc::new(MockEngine::new(true));
        let human = Turn::human_with_action("what is this?", ActionType::Query);
        let content_ref = ContentRef {
            uuid: parley_core::ids::ContentRefId::new(),
            content_id: ContentId(7),
            url: "https://gone.test".into(),
            title: "Gone".into(),
            content_type: ContentType::Page,
            used_percentage: 100,
            turn_uuid: Some(human.uuid.clone()),
        };
        let archive = ConversationArchive {
            entries: vec![human, Turn::assistant_with_text("a page")],
            associated_content: vec![content_ref.clone()],
            content_text: vec![parley_core::conversation::ArchivedContentText {
                content_uuid: content_ref.uuid.clone(),
                text: "archived body".into(),
            }],
        };

        let session = ConversationSession::restore(ConversationId::new(), context(&engine, true), None, archive).unwrap();
        assert_eq!(session.history().len(), 2);
        assert!(session.has_any_history());
        assert!(!session.content().has_live_content());
        assert_eq!(session.content().cached_text(), "archived body");
        assert_eq!(session.content().associated_content()[0].uuid, content_ref.uuid);
    }
}
