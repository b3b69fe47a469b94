use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use parley_core::content::{ContentSource, PageContent};
use parley_core::conversation::{ArchivedContentText, ContentRef, ContentType};
use parley_core::ids::{ContentId, ContentRefId, TurnId};

use crate::archive::ArchivedContent;
use crate::fetch::FetchCoordinator;
use crate::subscription::{ContentObserver, ObserverList, Subscription};
use crate::text::{self, PAGE_OVERHEAD};

struct Attachment {
    uuid: ContentRefId,
    coordinator: Arc<FetchCoordinator>,
    archived: bool,
    turn_uuid: Option<TurnId>,
}

type JoinWaiters = Arc<Mutex<Option<Vec<oneshot::Sender<()>>>>>;

/// The content sources feeding one conversation.
///
/// Live sources are held by reference; archives created here are owned
/// here and dropped when detached.
pub struct ContentAssociationManager {
    attachments: Mutex<Vec<Attachment>>,
    budget: AtomicUsize,
    join_waiters: JoinWaiters,
    observers: Arc<ObserverList>,
}

impl ContentAssociationManager {
    /// `budget` is the model's content length limit in characters.
    pub fn new(budget: usize) -> Self {
        Self {
            attachments: Mutex::new(Vec::new()),
            budget: AtomicUsize::new(budget),
            join_waiters: Arc::new(Mutex::new(None)),
            observers: Arc::new(ObserverList::default()),
        }
    }

    pub fn subscribe(&self, observer: Weak<dyn ContentObserver>) -> Subscription {
        self.observers.add(observer)
    }

    pub fn budget(&self) -> usize {
        self.budget.load(Ordering::Relaxed)
    }

    pub fn set_budget(&self, budget: usize) {
        self.budget.store(budget, Ordering::Relaxed);
    }

    /// Attach `source`. Re-attaching a source that is already live is a
    /// no-op returning the existing id; re-attaching one that was archived
    /// brings it back to life in the same slot.
    pub fn add(&self, source: Arc<dyn ContentSource>, notify: bool, detach_existing: bool) -> ContentRefId {
        let content_id = source.content_id();
        let uuid = {
            let mut attachments = self.attachments.lock();
            if detach_existing {
                attachments.clear();
            }
            let position = attachments
                .iter()
                .position(|a| a.coordinator.source().content_id() == content_id);
            match position {
                Some(i) if !attachments[i].archived => {
                    debug!(%content_id, "content already attached");
                    return attachments[i].uuid.clone();
                }
                Some(i) => {
                    debug!(%content_id, "re-attaching archived content");
                    let existing = &mut attachments[i];
                    existing.coordinator = Arc::new(FetchCoordinator::new(source));
                    existing.archived = false;
                    existing.uuid.clone()
                }
                None => {
                    let uuid = ContentRefId::new();
                    attachments.push(Attachment {
                        uuid: uuid.clone(),
                        coordinator: Arc::new(FetchCoordinator::new(source)),
                        archived: false,
                        turn_uuid: None,
                    });
                    uuid
                }
            }
        };
        info!(%content_id, content_uuid = %uuid, "content attached");
        if notify {
            self.observers.notify();
        }
        uuid
    }

    /// Attach an already archived snapshot, as when restoring from storage.
    pub fn add_archived(&self, uuid: ContentRefId, archive: ArchivedContent, turn_uuid: Option<TurnId>) {
        self.attachments.lock().push(Attachment {
            uuid,
            coordinator: Arc::new(FetchCoordinator::new(Arc::new(archive))),
            archived: true,
            turn_uuid,
        });
    }

    /// Detach by attachment id. Archives are dropped along with the entry.
    pub fn remove(&self, uuid: &ContentRefId, notify: bool) -> bool {
        let removed = {
            let mut attachments = self.attachments.lock();
            let before = attachments.len();
            attachments.retain(|a| &a.uuid != uuid);
            attachments.len() != before
        };
        if removed && notify {
            self.observers.notify();
        }
        removed
    }

    /// Detach every attachment of the given source.
    pub fn remove_source(&self, content_id: ContentId, notify: bool) -> bool {
        let removed = {
            let mut attachments = self.attachments.lock();
            let before = attachments.len();
            attachments.retain(|a| a.coordinator.source().content_id() != content_id);
            attachments.len() != before
        };
        if removed && notify {
            self.observers.notify();
        }
        removed
    }

    pub fn clear(&self, notify: bool) {
        let had_any = {
            let mut attachments = self.attachments.lock();
            let had_any = !attachments.is_empty();
            attachments.clear();
            had_any
        };
        if had_any && notify {
            self.observers.notify();
        }
    }

    /// The source navigated away: freeze what we know about it in place and
    /// release anyone waiting on its fetch with that snapshot.
    pub fn on_navigated(&self, content_id: ContentId) -> bool {
        let mut archived_any = false;
        {
            let mut attachments = self.attachments.lock();
            for attachment in attachments
                .iter_mut()
                .filter(|a| !a.archived && a.coordinator.source().content_id() == content_id)
            {
                let live = Arc::clone(&attachment.coordinator);
                let snapshot = live.cached();
                let archive = ArchivedContent::snapshot(live.source().as_ref(), snapshot.clone());
                attachment.coordinator = Arc::new(FetchCoordinator::new(Arc::new(archive)));
                attachment.archived = true;
                live.resolve_pending(snapshot);
                archived_any = true;
            }
        }
        if archived_any {
            info!(%content_id, "content archived after navigation");
            self.observers.notify();
        }
        archived_any
    }

    /// Record `turn_uuid` on attachments that are not yet tied to a turn.
    pub fn bind_to_turn(&self, turn_uuid: &TurnId) {
        for attachment in self.attachments.lock().iter_mut() {
            if attachment.turn_uuid.is_none() {
                attachment.turn_uuid = Some(turn_uuid.clone());
            }
        }
    }

    pub fn has_content(&self) -> bool {
        !self.attachments.lock().is_empty()
    }

    pub fn has_live_content(&self) -> bool {
        self.attachments.lock().iter().any(|a| !a.archived)
    }

    pub fn contains(&self, content_id: ContentId) -> bool {
        self.attachments
            .lock()
            .iter()
            .any(|a| a.coordinator.source().content_id() == content_id)
    }

    pub fn len(&self) -> usize {
        self.attachments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_sources(&self) -> Vec<Arc<dyn ContentSource>> {
        self.attachments
            .lock()
            .iter()
            .filter(|a| !a.archived)
            .map(|a| Arc::clone(a.coordinator.source()))
            .collect()
    }

    /// True when exactly one source is attached and it is a video.
    pub fn is_video(&self) -> bool {
        let attachments = self.attachments.lock();
        attachments.len() == 1 && attachments[0].coordinator.cached_is_video()
    }

    fn coordinators(&self) -> Vec<Arc<FetchCoordinator>> {
        self.attachments
            .lock()
            .iter()
            .map(|a| Arc::clone(&a.coordinator))
            .collect()
    }

    /// Attached content in attachment order, with budget usage recomputed.
    pub fn associated_content(&self) -> Vec<ContentRef> {
        let budget = self.budget();
        let mut consumed = 0usize;
        self.attachments
            .lock()
            .iter()
            .map(|a| {
                let source = a.coordinator.source();
                let cached = a.coordinator.cached();
                let len = cached.text.chars().count() + PAGE_OVERHEAD;
                let used_percentage = text::used_percentage(budget, consumed, len);
                consumed += len;
                ContentRef {
                    uuid: a.uuid.clone(),
                    content_id: source.content_id(),
                    url: source.url(),
                    title: source.title(),
                    content_type: if cached.is_video { ContentType::Video } else { ContentType::Page },
                    used_percentage,
                    turn_uuid: a.turn_uuid.clone(),
                }
            })
            .collect()
    }

    /// Cached text of every attachment, keyed by attachment id, for persistence.
    pub fn archived_texts(&self) -> Vec<ArchivedContentText> {
        self.attachments
            .lock()
            .iter()
            .map(|a| ArchivedContentText {
                content_uuid: a.uuid.clone(),
                text: a.coordinator.cached_text(),
            })
            .collect()
    }

    /// Fetch every attachment concurrently and return their content once
    /// all have resolved. Calls made while a join is pending wait for that
    /// join instead of starting another.
    pub async fn get_content(&self) -> Vec<PageContent> {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut waiters = self.join_waiters.lock();
            match waiters.as_mut() {
                Some(pending) => {
                    pending.push(tx);
                    false
                }
                None => {
                    *waiters = Some(vec![tx]);
                    true
                }
            }
        };

        if start {
            let coordinators = self.coordinators();
            let completion = JoinCompletion(Arc::clone(&self.join_waiters));
            tokio::spawn(async move {
                let _completion = completion;
                join_all(coordinators.iter().map(|c| c.get_content())).await;
            });
        } else {
            debug!("joining pending content fetch");
        }

        let _ = rx.await;
        self.coordinators().iter().map(|c| c.cached()).collect()
    }

    /// Text for the engine. A single source is passed through as is;
    /// several are each wrapped in page delimiters.
    pub fn cached_text(&self) -> String {
        let coordinators = self.coordinators();
        match coordinators.as_slice() {
            [] => String::new(),
            [only] => only.cached_text(),
            many => many.iter().map(|c| text::wrap_page(&c.cached_text())).collect(),
        }
    }

    /// Screenshots from every source, flattened. `None` when no source
    /// produced any.
    pub async fn screenshots(&self) -> Option<Vec<Bytes>> {
        let sources: Vec<Arc<dyn ContentSource>> = self
            .coordinators()
            .iter()
            .map(|c| Arc::clone(c.source()))
            .collect();
        let results = join_all(sources.iter().map(|s| s.screenshots())).await;
        let shots: Vec<Bytes> = results.into_iter().flatten().flatten().collect();
        if shots.is_empty() {
            None
        } else {
            Some(shots)
        }
    }
}

/// Releases join waiters when dropped, including when the join task is aborted.
struct JoinCompletion(JoinWaiters);

impl Drop for JoinCompletion {
    fn drop(&mut self) {
        let waiters = self.0.lock().take().unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}
