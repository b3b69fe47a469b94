//! Conversation registry.
//!
//! Owns conversation metadata, materializes sessions on demand, maps
//! content sources to the conversation they feed, writes session changes
//! through to the store and unloads idle sessions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use parley_core::content::ContentSource;
use parley_core::conversation::{Conversation, ContentRef};
use parley_core::events::{RegistryEvent, SessionEvent};
use parley_core::ids::{ContentId, ConversationId};
use parley_core::turn::Turn;
use parley_engine::{AppContext, ConversationSession};
use parley_store::conversations::updated_between;
use parley_store::{ConversationStore, StoreError};

use crate::bridge::{spawn_session_bridge, SessionEventSink};
use crate::error::ServiceError;
use crate::settings::ParleySettings;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub history_enabled: bool,
    /// `None` uses the catalog default.
    pub default_model: Option<String>,
    pub unload_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_enabled: true,
            default_model: None,
            unload_delay: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    pub fn from_settings(settings: &ParleySettings) -> Self {
        Self {
            history_enabled: settings.history_enabled,
            default_model: Some(settings.default_model.clone()),
            unload_delay: settings.unload_delay(),
        }
    }
}

struct ConversationRecord {
    meta: Conversation,
    /// At least one committed entry exists.
    has_history: bool,
    /// A row exists in the store.
    persisted: bool,
}

pub struct ConversationRegistry {
    ctx: AppContext,
    config: RegistryConfig,
    store: Option<Arc<dyn ConversationStore>>,
    records: RwLock<HashMap<ConversationId, ConversationRecord>>,
    sessions: DashMap<ConversationId, ConversationSession>,
    /// Written only under the write lock; one writer at a time.
    content_map: RwLock<HashMap<ContentId, ConversationId>>,
    unload_generation: DashMap<ConversationId, u64>,
    events: broadcast::Sender<RegistryEvent>,
    weak_self: Weak<Self>,
}

impl ConversationRegistry {
    /// Build the registry, loading stored conversation metadata when
    /// history is enabled.
    pub fn new(
        ctx: AppContext,
        config: RegistryConfig,
        store: Option<Arc<dyn ConversationStore>>,
    ) -> Result<Arc<Self>, ServiceError> {
        let mut records = HashMap::new();
        if let (Some(store), true) = (&store, config.history_enabled) {
            for meta in store.list_conversations()? {
                records.insert(
                    meta.uuid.clone(),
                    ConversationRecord {
                        meta,
                        has_history: true,
                        persisted: true,
                    },
                );
            }
        }
        info!(conversations = records.len(), history_enabled = config.history_enabled, "registry ready");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Arc::new_cyclic(|weak| Self {
            ctx,
            config,
            store,
            records: RwLock::new(records),
            sessions: DashMap::new(),
            content_map: RwLock::new(HashMap::new()),
            unload_generation: DashMap::new(),
            events,
            weak_self: weak.clone(),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn loaded_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_loaded(&self, id: &ConversationId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Conversation bound to `content_id`, if any.
    pub fn conversation_for_content(&self, content_id: ContentId) -> Option<ConversationId> {
        self.content_map.read().get(&content_id).cloned()
    }

    pub fn create_conversation(&self, is_temporary: bool) -> Result<ConversationSession, ServiceError> {
        let id = ConversationId::new();
        let session = ConversationSession::new(
            id.clone(),
            self.ctx.clone(),
            is_temporary,
            self.config.default_model.clone(),
        )?;
        let mut meta = Conversation::new(id.clone(), is_temporary);
        meta.model_key = Some(session.model_key());
        self.records.write().insert(
            id.clone(),
            ConversationRecord {
                meta,
                has_history: false,
                persisted: false,
            },
        );
        info!(conversation_id = %id, is_temporary, "conversation created");
        Ok(self.materialize(session))
    }

    /// Loaded session only; never touches the store.
    pub fn get_conversation(&self, id: &ConversationId) -> Option<ConversationSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Loaded session, or one rehydrated from the store.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn load_conversation(&self, id: &ConversationId) -> Result<ConversationSession, ServiceError> {
        if let Some(session) = self.get_conversation(id) {
            return Ok(session);
        }
        let (model_key, is_temporary, persisted) = {
            let records = self.records.read();
            let record = records.get(id).ok_or_else(|| ServiceError::NotFound(id.clone()))?;
            (record.meta.model_key.clone(), record.meta.is_temporary, record.persisted)
        };
        let session = match (&self.store, persisted) {
            (Some(store), true) => {
                let archive = store.load_archive(id)?;
                ConversationSession::restore(id.clone(), self.ctx.clone(), model_key, archive)?
            }
            _ => ConversationSession::new(id.clone(), self.ctx.clone(), is_temporary, model_key)?,
        };
        debug!("conversation loaded");
        Ok(self.materialize(session))
    }

    /// The conversation `source` feeds, creating one when it feeds none.
    pub fn get_or_create_for_content(
        &self,
        source: Arc<dyn ContentSource>,
    ) -> Result<ConversationSession, ServiceError> {
        let content_id = source.content_id();
        loop {
            // Lookup and reservation happen under one write guard.
            let mapped = {
                let mut map = self.content_map.write();
                if let Some(id) = map.get(&content_id).cloned() {
                    id
                } else {
                    let session = self.create_conversation(false)?;
                    map.insert(content_id, session.id().clone());
                    drop(map);
                    session.content().add(source, true, false);
                    debug!(conversation_id = %session.id(), %content_id, "content associated");
                    return Ok(session);
                }
            };
            match self.load_conversation(&mapped) {
                Ok(session) => {
                    session.content().add(source, true, false);
                    return Ok(session);
                }
                Err(ServiceError::NotFound(_)) => self.unmap_content(content_id, &mapped),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn associate_content(&self, id: &ConversationId, source: Arc<dyn ContentSource>) -> Result<(), ServiceError> {
        let session = self.load_conversation(id)?;
        let content_id = source.content_id();
        self.content_map.write().insert(content_id, id.clone());
        session.content().add(source, true, false);
        debug!(conversation_id = %id, %content_id, "content associated");
        Ok(())
    }

    /// Returns whether anything was detached.
    pub fn disassociate_content(&self, id: &ConversationId, content_id: ContentId) -> Result<bool, ServiceError> {
        let session = self.load_conversation(id)?;
        self.unmap_content(content_id, id);
        let removed = session.content().remove_source(content_id, true);
        debug!(conversation_id = %id, %content_id, removed, "content disassociated");
        Ok(removed)
    }

    /// The source moved to a different page. A conversation with history
    /// keeps an archived copy and releases the source; an empty one simply
    /// carries on with the new page.
    pub fn on_content_navigated(&self, content_id: ContentId) {
        let Some(id) = self.conversation_for_content(content_id) else {
            return;
        };
        let Some(session) = self.get_conversation(&id) else {
            self.unmap_content(content_id, &id);
            return;
        };
        if !session.has_any_history() {
            debug!(conversation_id = %id, %content_id, "navigation in empty conversation");
            return;
        }
        session.content().on_navigated(content_id);
        self.unmap_content(content_id, &id);
        info!(conversation_id = %id, %content_id, "content released after navigation");
        self.schedule_unload(&id);
    }

    pub fn rename_conversation(&self, id: &ConversationId, title: &str) -> Result<(), ServiceError> {
        let persisted = {
            let mut records = self.records.write();
            let record = records.get_mut(id).ok_or_else(|| ServiceError::NotFound(id.clone()))?;
            record.meta.title = title.to_string();
            record.persisted
        };
        if let (Some(store), true) = (&self.store, persisted) {
            store.update_title(id, title)?;
        }
        self.notify_list();
        Ok(())
    }

    /// Removes the conversation everywhere. Returns whether it existed.
    pub fn delete_conversation(&self, id: &ConversationId) -> Result<bool, ServiceError> {
        let session = self.sessions.remove(id).map(|(_, s)| s);
        if let Some(session) = &session {
            session.stop_generation();
        }
        self.unload_generation.remove(id);
        let record = self.records.write().remove(id);
        self.content_map.write().retain(|_, c| c != id);

        let mut deleted = session.is_some() || record.is_some();
        if let Some(store) = &self.store {
            deleted |= store.delete_conversation(id)?;
        }
        if deleted {
            info!(conversation_id = %id, "conversation deleted");
            if session.is_some() {
                self.emit(RegistryEvent::ConversationUnloaded {
                    conversation_id: id.clone(),
                });
            }
            self.notify_list();
        }
        Ok(deleted)
    }

    /// Deletes conversations last updated in `[begin, end)`.
    pub fn delete_conversations_in_range(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, ServiceError> {
        let metas: Vec<Conversation> = self.records.read().values().map(|r| r.meta.clone()).collect();
        let mut deleted = 0;
        for id in updated_between(&metas, begin, end) {
            if self.delete_conversation(&id)? {
                deleted += 1;
            }
        }
        info!(deleted, "conversations deleted in range");
        Ok(deleted)
    }

    /// Non-temporary conversations with history, most recently updated first.
    pub fn list_conversations(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .records
            .read()
            .values()
            .filter(|r| r.has_history && !r.meta.is_temporary)
            .map(|r| r.meta.clone())
            .collect();
        list.sort_by(|a, b| b.updated_time.cmp(&a.updated_time));
        list
    }

    pub fn set_user_opted_in(&self, opted_in: bool) {
        self.ctx.set_user_opted_in(opted_in);
        if !opted_in {
            return;
        }
        let sessions: Vec<ConversationSession> = self.sessions.iter().map(|s| s.value().clone()).collect();
        for session in sessions {
            session.on_user_opted_in();
        }
    }

    /// Conversation for a source that carries staged entries. The source
    /// must have granted permission.
    pub fn open_conversation_with_staged_entries(
        &self,
        source: Arc<dyn ContentSource>,
    ) -> Result<ConversationSession, ServiceError> {
        if !source.has_permission() {
            warn!(content_id = %source.content_id(), "staged entries refused, no permission");
            return Err(ServiceError::PermissionDenied);
        }
        self.get_or_create_for_content(source)
    }

    fn materialize(&self, session: ConversationSession) -> ConversationSession {
        let id = session.id().clone();
        let session = match self.sessions.entry(id.clone()) {
            Entry::Occupied(existing) => return existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(session).clone(),
        };
        spawn_session_bridge(self.weak_self.clone(), session.subscribe());
        self.schedule_unload(&id);
        session
    }

    fn unmap_content(&self, content_id: ContentId, id: &ConversationId) {
        let mut map = self.content_map.write();
        if map.get(&content_id) == Some(id) {
            map.remove(&content_id);
        }
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    fn notify_list(&self) {
        self.emit(RegistryEvent::ConversationListChanged {
            conversations: self.list_conversations(),
        });
    }

    /// Re-check `id` once the unload delay passes. A later call supersedes
    /// an earlier one.
    fn schedule_unload(&self, id: &ConversationId) {
        if !self.sessions.contains_key(id) {
            return;
        }
        let generation = {
            let mut entry = self.unload_generation.entry(id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let weak = self.weak_self.clone();
        let id = id.clone();
        let delay = self.config.unload_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(registry) = weak.upgrade() else {
                return;
            };
            if registry.unload_generation.get(&id).map(|g| *g) == Some(generation) {
                registry.maybe_unload(&id);
            }
        });
    }

    fn persistence_enabled(&self, meta: &Conversation) -> bool {
        self.config.history_enabled && !meta.is_temporary && self.store.is_some()
    }

    fn maybe_unload(&self, id: &ConversationId) {
        let persist = match self.records.read().get(id) {
            Some(record) => self.persistence_enabled(&record.meta),
            None => false,
        };
        let mut has_history = false;
        let removed = self.sessions.remove_if(id, |_, session| {
            if session.clients() > 0 || session.is_request_in_progress() {
                return false;
            }
            has_history = session.has_any_history();
            !(has_history && persist && session.content().has_live_content())
        });
        if removed.is_none() {
            return;
        }
        self.unload_generation.remove(id);

        let drop_metadata = !persist || !has_history;
        if drop_metadata {
            self.records.write().remove(id);
            self.content_map.write().retain(|_, c| c != id);
        }
        info!(conversation_id = %id, drop_metadata, "conversation unloaded");
        self.emit(RegistryEvent::ConversationUnloaded {
            conversation_id: id.clone(),
        });
        if drop_metadata && has_history {
            self.notify_list();
        }
    }

    /// Store to write `id`'s changes to, if it has been persisted.
    fn persisted_store(&self, id: &ConversationId) -> Option<&Arc<dyn ConversationStore>> {
        let records = self.records.read();
        let record = records.get(id)?;
        if record.persisted && self.persistence_enabled(&record.meta) {
            self.store.as_ref()
        } else {
            None
        }
    }

    fn write_through(&self, id: &ConversationId, op: &str, write: impl FnOnce(&dyn ConversationStore) -> Result<(), StoreError>) {
        if let Some(store) = self.persisted_store(id) {
            if let Err(e) = write(store.as_ref()) {
                error!(conversation_id = %id, op, error = %e, "store write failed");
            }
        }
    }

    fn touch(&self, id: &ConversationId) -> bool {
        match self.records.write().get_mut(id) {
            Some(record) => {
                record.meta.updated_time = Utc::now();
                true
            }
            None => false,
        }
    }

    fn on_entry_added(&self, id: &ConversationId, turn: &Turn) {
        let (meta, first_write, listed) = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(id) else {
                return;
            };
            record.meta.updated_time = Utc::now();
            let listed = !record.has_history && !record.meta.is_temporary;
            record.has_history = true;
            (record.meta.clone(), !record.persisted, listed)
        };

        if let (Some(store), true) = (&self.store, self.persistence_enabled(&meta)) {
            if first_write {
                match self.create_row(store.as_ref(), &meta, turn) {
                    Ok(()) => {
                        if let Some(record) = self.records.write().get_mut(id) {
                            record.persisted = true;
                        }
                        debug!(conversation_id = %id, "conversation persisted");
                    }
                    Err(e) => error!(conversation_id = %id, error = %e, "failed to persist conversation"),
                }
            } else if let Err(e) = store.add_entry(id, turn) {
                error!(conversation_id = %id, error = %e, "failed to persist entry");
            }
        }
        if listed {
            self.notify_list();
        }
    }

    fn create_row(&self, store: &dyn ConversationStore, meta: &Conversation, turn: &Turn) -> Result<(), StoreError> {
        store.add_conversation(meta, turn)?;
        if let Some(session) = self.get_conversation(&meta.uuid) {
            let content = session.content();
            store.upsert_associated_content(&meta.uuid, &content.associated_content(), &content.archived_texts())?;
        }
        Ok(())
    }

    fn on_content_changed(&self, id: &ConversationId, content: Vec<ContentRef>) {
        {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(id) else {
                return;
            };
            record.meta.has_content = !content.is_empty();
            record.meta.associated_content = content.clone();
        }
        let Some(session) = self.get_conversation(id) else {
            return;
        };
        let texts = session.content().archived_texts();
        self.write_through(id, "upsert_associated_content", |store| {
            store.upsert_associated_content(id, &content, &texts)
        });
    }

    /// An engine-provided title applies only while the conversation has none.
    fn on_title_changed(&self, id: &ConversationId, title: String) {
        let applied = {
            let mut records = self.records.write();
            match records.get_mut(id) {
                Some(record) if record.meta.title.is_empty() => {
                    record.meta.title = title.clone();
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.write_through(id, "update_title", |store| store.update_title(id, &title));
            self.notify_list();
        }
    }
}

impl SessionEventSink for ConversationRegistry {
    fn on_session_event(&self, event: SessionEvent) {
        let id = event.conversation_id().clone();
        match event {
            SessionEvent::EntryAdded { turn, .. } => self.on_entry_added(&id, &turn),
            SessionEvent::EntryUpdated { turn, .. } => {
                if self.touch(&id) {
                    self.write_through(&id, "update_entry", |store| store.update_entry(&id, &turn));
                }
            }
            SessionEvent::EntryRemoved { turn_uuid, .. } => {
                if self.touch(&id) {
                    self.write_through(&id, "delete_entry", |store| store.delete_entry(&id, &turn_uuid));
                }
            }
            SessionEvent::TitleChanged { title, .. } => self.on_title_changed(&id, title),
            SessionEvent::TokenInfoChanged {
                total_tokens,
                trimmed_tokens,
                ..
            } => {
                if let Some(record) = self.records.write().get_mut(&id) {
                    record.meta.total_tokens = total_tokens;
                    record.meta.trimmed_tokens = trimmed_tokens;
                }
                self.write_through(&id, "update_tokens", |store| {
                    store.update_tokens(&id, total_tokens, trimmed_tokens)
                });
            }
            SessionEvent::ModelChanged { model_key, .. } => {
                if let Some(record) = self.records.write().get_mut(&id) {
                    record.meta.model_key = Some(model_key.clone());
                }
                self.write_through(&id, "update_model", |store| store.update_model(&id, &model_key));
            }
            SessionEvent::AssociatedContentChanged { content, .. } => self.on_content_changed(&id, content),
            SessionEvent::ClientsChanged { .. } | SessionEvent::RequestInProgress { in_progress: false, .. } => {
                self.schedule_unload(&id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use parley_content::mock::MockContentSource;
    use parley_core::conversation::Conversation;
    use parley_core::turn::TurnEvent;
    use parley_engine::mock::{MockEngine, MockReply};
    use parley_engine::models::StaticModelCatalog;
    use parley_store::{ConversationRepo, Database};

    use super::*;

    struct Fixture {
        registry: Arc<ConversationRegistry>,
        engine: Arc<MockEngine>,
        store: Arc<ConversationRepo>,
        db: Database,
    }

    fn context(engine: &Arc<MockEngine>) -> AppContext {
        AppContext::new(Arc::new(StaticModelCatalog::with_engine(engine.clone())), true)
    }

    fn fixture_with(config: RegistryConfig, replies: Vec<MockReply>) -> Fixture {
        let engine = Arc::new(MockEngine::with_replies(true, replies));
        let db = Database::in_memory().unwrap();
        let store = Arc::new(ConversationRepo::new(db.clone()));
        let registry = ConversationRegistry::new(context(&engine), config, Some(store.clone())).unwrap();
        Fixture {
            registry,
            engine,
            store,
            db,
        }
    }

    fn fixture(replies: Vec<MockReply>) -> Fixture {
        fixture_with(RegistryConfig::default(), replies)
    }

    fn page(id: i64) -> Arc<MockContentSource> {
        Arc::new(MockContentSource::new(ContentId(id), &format!("https://{id}.test"), "page text"))
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

    fn stored_entries(store: &ConversationRepo, id: &ConversationId) -> usize {
        store.load_archive(id).map(|a| a.entries.len()).unwrap_or(0)
    }

    #[tokio::test]
    async fn conversation_is_listed_and_persisted_after_first_exchange() {
        let f = fixture(vec![MockReply::text("Hello")]);
        let session = f.registry.create_conversation(false).unwrap();
        let _client = session.attach_client();
        assert!(f.registry.list_conversations().is_empty());

        session.submit(Turn::human("Hi")).unwrap();
        let id = session.id().clone();
        wait_for(|| stored_entries(&f.store, &id) == 2).await;

        let list = f.registry.list_conversations();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].uuid, id);
        let archive = f.store.load_archive(&id).unwrap();
        assert_eq!(archive.entries[0].text, "Hi");
        assert_eq!(archive.entries[1].text, "Hello");
    }

    #[tokio::test]
    async fn temporary_conversations_are_never_persisted() {
        let f = fixture(vec![MockReply::text("Hello")]);
        let session = f.registry.create_conversation(true).unwrap();
        let _client = session.attach_client();
        session.submit(Turn::human("Hi")).unwrap();
        wait_for(|| session.history().len() == 2 && !session.is_request_in_progress()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(f.store.list_conversations().unwrap().is_empty());
        assert!(f.registry.list_conversations().is_empty());
    }

    #[tokio::test]
    async fn history_disabled_keeps_conversations_in_memory_only() {
        let config = RegistryConfig {
            history_enabled: false,
            ..Default::default()
        };
        let f = fixture_with(config, vec![MockReply::text("Hello")]);
        let session = f.registry.create_conversation(false).unwrap();
        let _client = session.attach_client();
        session.submit(Turn::human("Hi")).unwrap();
        wait_for(|| f.registry.list_conversations().len() == 1).await;

        assert!(f.store.list_conversations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_content_maps_to_same_conversation() {
        let f = fixture(vec![]);
        let first = f.registry.get_or_create_for_content(page(1)).unwrap();
        let again = f.registry.get_or_create_for_content(page(1)).unwrap();
        let other = f.registry.get_or_create_for_content(page(2)).unwrap();

        assert_eq!(first.id(), again.id());
        assert_ne!(first.id(), other.id());
        assert_eq!(first.content().len(), 1);
        assert_eq!(f.registry.conversation_for_content(ContentId(2)), Some(other.id().clone()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_share_one_conversation() {
        let f = fixture(vec![]);
        let handle = tokio::runtime::Handle::current();
        for round in 0..5 {
            let content_id = 100 + round;
            let barrier = Arc::new(std::sync::Barrier::new(8));
            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let registry = Arc::clone(&f.registry);
                    let barrier = Arc::clone(&barrier);
                    let handle = handle.clone();
                    std::thread::spawn(move || {
                        let _runtime = handle.enter();
                        barrier.wait();
                        registry.get_or_create_for_content(page(content_id)).unwrap().id().clone()
                    })
                })
                .collect();
            let ids: Vec<ConversationId> = threads.into_iter().map(|t| t.join().unwrap()).collect();

            assert!(ids.iter().all(|id| *id == ids[0]), "round {round}: {ids:?}");
            assert_eq!(f.registry.conversation_for_content(ContentId(content_id)), Some(ids[0].clone()));
        }
    }

    #[tokio::test]
    async fn navigation_with_history_archives_and_releases_content() {
        let f = fixture(vec![MockReply::text("Summary")]);
        let session = f.registry.get_or_create_for_content(page(7)).unwrap();
        let _client = session.attach_client();
        session.submit(Turn::human("What is this?")).unwrap();
        wait_for(|| session.history().len() == 2 && !session.is_request_in_progress()).await;

        f.registry.on_content_navigated(ContentId(7));
        assert!(!session.content().has_live_content());
        assert!(session.content().has_content());
        assert_eq!(f.registry.conversation_for_content(ContentId(7)), None);

        let next = f.registry.get_or_create_for_content(page(7)).unwrap();
        assert_ne!(next.id(), session.id());
    }

    #[tokio::test]
    async fn navigation_without_history_keeps_conversation() {
        let f = fixture(vec![]);
        let session = f.registry.get_or_create_for_content(page(3)).unwrap();
        f.registry.on_content_navigated(ContentId(3));

        assert!(session.content().has_live_content());
        assert_eq!(f.registry.conversation_for_content(ContentId(3)), Some(session.id().clone()));
    }

    #[tokio::test]
    async fn disassociate_detaches_source() {
        let f = fixture(vec![]);
        let session = f.registry.get_or_create_for_content(page(4)).unwrap();
        assert!(f.registry.disassociate_content(session.id(), ContentId(4)).unwrap());
        assert!(!session.content().has_content());
        assert_eq!(f.registry.conversation_for_content(ContentId(4)), None);
        assert!(!f.registry.disassociate_content(session.id(), ContentId(4)).unwrap());
    }

    #[tokio::test]
    async fn stored_conversations_rehydrate_in_a_new_registry() {
        let f = fixture(vec![MockReply::text("Hello")]);
        let session = f.registry.get_or_create_for_content(page(9)).unwrap();
        let _client = session.attach_client();
        session.submit(Turn::human("Hi")).unwrap();
        let id = session.id().clone();
        wait_for(|| stored_entries(&f.store, &id) == 2).await;

        let store: Arc<dyn ConversationStore> = Arc::new(ConversationRepo::new(f.db.clone()));
        let reopened = ConversationRegistry::new(context(&f.engine), RegistryConfig::default(), Some(store)).unwrap();
        assert_eq!(reopened.list_conversations().len(), 1);
        assert!(!reopened.is_loaded(&id));

        let restored = reopened.load_conversation(&id).unwrap();
        assert_eq!(restored.history().len(), 2);
        assert_eq!(restored.content().len(), 1);
        assert!(!restored.content().has_live_content());
        assert!(reopened.is_loaded(&id));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let f = fixture(vec![]);
        let err = f.registry.load_conversation(&ConversationId::new()).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn engine_title_applies_once_and_rename_persists() {
        let f = fixture(vec![
            MockReply::Events(vec![
                Ok(TurnEvent::completion("answer")),
                Ok(TurnEvent::ConversationTitle { title: "Greeting".into() }),
            ]),
            MockReply::Events(vec![
                Ok(TurnEvent::completion("again")),
                Ok(TurnEvent::ConversationTitle { title: "Other".into() }),
            ]),
        ]);
        let session = f.registry.create_conversation(false).unwrap();
        let _client = session.attach_client();
        let id = session.id().clone();

        session.submit(Turn::human("Hi")).unwrap();
        wait_for(|| f.store.get_conversation(&id).map(|c| c.title == "Greeting").unwrap_or(false)).await;
        wait_for(|| !session.is_request_in_progress()).await;
        session.submit(Turn::human("More")).unwrap();
        wait_for(|| stored_entries(&f.store, &id) == 4).await;
        assert_eq!(f.registry.list_conversations()[0].title, "Greeting");

        f.registry.rename_conversation(&id, "Renamed").unwrap();
        assert_eq!(f.store.get_conversation(&id).unwrap().title, "Renamed");
        assert_eq!(f.registry.list_conversations()[0].title, "Renamed");
    }

    #[tokio::test]
    async fn delete_removes_everywhere() {
        let f = fixture(vec![MockReply::text("Hello")]);
        let session = f.registry.get_or_create_for_content(page(5)).unwrap();
        let _client = session.attach_client();
        session.submit(Turn::human("Hi")).unwrap();
        let id = session.id().clone();
        wait_for(|| stored_entries(&f.store, &id) == 2).await;

        let mut rx = f.registry.subscribe();
        assert!(f.registry.delete_conversation(&id).unwrap());
        assert!(!f.registry.is_loaded(&id));
        assert!(f.registry.list_conversations().is_empty());
        assert!(f.store.list_conversations().unwrap().is_empty());
        assert_eq!(f.registry.conversation_for_content(ContentId(5)), None);
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::ConversationUnloaded { conversation_id } if conversation_id == id
        ));
        assert!(!f.registry.delete_conversation(&id).unwrap());
    }

    #[tokio::test]
    async fn delete_in_range_uses_updated_time() {
        let f = fixture(vec![MockReply::text("one"), MockReply::text("two")]);
        let mut ids = Vec::new();
        for text in ["a", "b"] {
            let session = f.registry.create_conversation(false).unwrap();
            let _client = session.attach_client();
            session.submit(Turn::human(text)).unwrap();
            let id = session.id().clone();
            wait_for(|| stored_entries(&f.store, &id) == 2).await;
            ids.push(id);
        }
        let now = Utc::now();
        assert_eq!(
            f.registry
                .delete_conversations_in_range(now - ChronoDuration::days(2), now - ChronoDuration::days(1))
                .unwrap(),
            0
        );
        assert_eq!(
            f.registry
                .delete_conversations_in_range(now - ChronoDuration::hours(1), now + ChronoDuration::hours(1))
                .unwrap(),
            2
        );
        assert!(f.registry.list_conversations().is_empty());
    }

    #[tokio::test]
    async fn list_is_most_recent_first() {
        let f = fixture(vec![MockReply::text("one"), MockReply::text("two")]);
        let older = f.registry.create_conversation(false).unwrap();
        let newer = f.registry.create_conversation(false).unwrap();
        let _a = older.attach_client();
        let _b = newer.attach_client();
        older.submit(Turn::human("first")).unwrap();
        wait_for(|| stored_entries(&f.store, older.id()) == 2).await;
        newer.submit(Turn::human("second")).unwrap();
        wait_for(|| stored_entries(&f.store, newer.id()) == 2).await;

        let list: Vec<ConversationId> = f.registry.list_conversations().into_iter().map(|c| c.uuid).collect();
        assert_eq!(list, vec![newer.id().clone(), older.id().clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_empty_conversation_unloads_after_delay() {
        let f = fixture(vec![]);
        let session = f.registry.create_conversation(false).unwrap();
        let id = session.id().clone();
        drop(session);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.registry.is_loaded(&id));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!f.registry.is_loaded(&id));
        assert!(matches!(f.registry.load_conversation(&id), Err(ServiceError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn attached_client_prevents_unload() {
        let f = fixture(vec![]);
        let session = f.registry.create_conversation(false).unwrap();
        let id = session.id().clone();
        let client = session.attach_client();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(f.registry.is_loaded(&id));

        drop(client);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!f.registry.is_loaded(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_conversation_with_live_content_stays_loaded() {
        let f = fixture(vec![MockReply::text("Hello")]);
        let session = f.registry.get_or_create_for_content(page(11)).unwrap();
        let id = session.id().clone();
        let client = session.attach_client();
        session.submit(Turn::human("Hi")).unwrap();
        wait_for(|| stored_entries(&f.store, &id) == 2).await;
        drop(client);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(f.registry.is_loaded(&id));

        f.registry.on_content_navigated(ContentId(11));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!f.registry.is_loaded(&id));
        assert_eq!(f.registry.list_conversations().len(), 1);
        assert_eq!(f.registry.load_conversation(&id).unwrap().history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unloading_without_persistence_drops_metadata() {
        let config = RegistryConfig {
            history_enabled: false,
            ..Default::default()
        };
        let f = fixture_with(config, vec![MockReply::text("Hello")]);
        let session = f.registry.create_conversation(false).unwrap();
        let id = session.id().clone();
        let client = session.attach_client();
        session.submit(Turn::human("Hi")).unwrap();
        wait_for(|| f.registry.list_conversations().len() == 1).await;
        drop(client);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!f.registry.is_loaded(&id));
        assert!(f.registry.list_conversations().is_empty());
    }

    #[tokio::test]
    async fn staged_entries_need_permission() {
        let f = fixture(vec![]);
        let source = page(12);
        source.set_permission(false);
        let err = f.registry.open_conversation_with_staged_entries(source.clone()).unwrap_err();
        assert!(matches!(err, ServiceError::PermissionDenied));
        assert_eq!(f.registry.loaded_count(), 0);

        source.set_permission(true);
        let session = f.registry.open_conversation_with_staged_entries(source).unwrap();
        assert!(session.content().contains(ContentId(12)));
    }

    #[tokio::test]
    async fn opting_in_replays_queued_turns() {
        let f = fixture(vec![MockReply::text("Hello")]);
        f.registry.set_user_opted_in(false);
        let session = f.registry.create_conversation(false).unwrap();
        let _client = session.attach_client();
        session.submit(Turn::human("Hi")).unwrap();
        assert!(session.pending_turn().is_some());
        assert_eq!(f.engine.request_count(), 0);

        f.registry.set_user_opted_in(true);
        wait_for(|| session.history().len() == 2).await;
        assert!(session.pending_turn().is_none());
    }

    #[tokio::test]
    async fn model_and_token_changes_reach_the_store() {
        let f = fixture(vec![MockReply::Events(vec![
            Ok(TurnEvent::completion("answer")),
            Ok(TurnEvent::ContentReceipt {
                total_tokens: 300,
                trimmed_tokens: 12,
            }),
        ])]);
        let session = f.registry.create_conversation(false).unwrap();
        let _client = session.attach_client();
        let id = session.id().clone();
        session.submit(Turn::human("Hi")).unwrap();
        wait_for(|| stored_entries(&f.store, &id) == 2).await;
        wait_for(|| f.store.get_conversation(&id).map(|c| c.total_tokens == 300).unwrap_or(false)).await;

        session.change_model("chat-advanced").unwrap();
        wait_for(|| {
            f.store
                .get_conversation(&id)
                .map(|c: Conversation| c.model_key.as_deref() == Some("chat-advanced"))
                .unwrap_or(false)
        })
        .await;
        assert_eq!(f.store.get_conversation(&id).unwrap().trimmed_tokens, 12);
    }
}
