use notetogether_core::{
    AwarenessEntry, AwarenessSet, AwarenessUpdate, ClientId, DocumentError, SharedDocument,
};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, MutexGuard, OnceCell, RwLock};
use uuid::Uuid;

/// Awareness slot owned by the relay itself; sessions start at 1
const RELAY_CLIENT_ID: ClientId = 0;

/// Event fanned out to every session of a document
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Update delta merged from `origin`
    Update {
        origin: ClientId,
        update: Arc<Vec<u8>>,
    },
    /// Awareness entries changed by `origin`
    Awareness {
        origin: ClientId,
        update: Arc<AwarenessUpdate>,
    },
    /// Stateless control payload; `None` origin means the server
    Stateless {
        origin: Option<ClientId>,
        payload: Arc<str>,
    },
    /// The document is gone; every session must close
    Shutdown,
}

/// A resident collaborative document and its fan-out state
pub struct DocumentHandle {
    id: Uuid,
    /// Serializes every mutation of this document
    doc: Mutex<SharedDocument>,
    /// Load guard: initialized once the stored snapshot has been applied
    loaded: OnceCell<()>,
    events: broadcast::Sender<RelayEvent>,
    awareness: Mutex<AwarenessSet>,
    sessions: AtomicUsize,
    next_client_id: AtomicU64,
    deleted: AtomicBool,
}

impl DocumentHandle {
    pub fn new(id: Uuid, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            id,
            doc: Mutex::new(SharedDocument::new()),
            loaded: OnceCell::new(),
            events,
            awareness: Mutex::new(AwarenessSet::new(RELAY_CLIENT_ID)),
            sessions: AtomicUsize::new(0),
            next_client_id: AtomicU64::new(RELAY_CLIENT_ID + 1),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run `load` unless it already ran for this handle.
    ///
    /// Concurrent callers wait for the in-flight load instead of starting
    /// their own, so the stored snapshot is applied at most once.
    pub async fn ensure_loaded<F, Fut>(&self, load: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.loaded.get_or_init(load).await;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    /// Exclusive access to the document model
    pub async fn document(&self) -> MutexGuard<'_, SharedDocument> {
        self.doc.lock().await
    }

    /// Merge an update from `origin` and relay it to the other sessions
    pub async fn apply_update(&self, origin: ClientId, update: &[u8]) -> Result<(), DocumentError> {
        let doc = self.doc.lock().await;
        doc.apply_update(update)?;
        let _ = self.events.send(RelayEvent::Update {
            origin,
            update: Arc::new(update.to_vec()),
        });
        Ok(())
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.doc.lock().await.encode_state()
    }

    pub async fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        self.doc.lock().await.encode_diff(state_vector)
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().await.state_vector()
    }

    /// Replace the awareness state of `client_id` and relay the change
    pub async fn set_awareness(&self, client_id: ClientId, state: Option<Value>) -> AwarenessEntry {
        let entry = self.awareness.lock().await.set_state(client_id, state);
        self.broadcast_awareness(client_id, entry.clone());
        entry
    }

    /// Drop the awareness entry of a departed client and relay the removal
    pub async fn remove_awareness(&self, client_id: ClientId) -> Option<AwarenessEntry> {
        let entry = self.awareness.lock().await.remove(client_id)?;
        self.broadcast_awareness(client_id, entry.clone());
        Some(entry)
    }

    /// Every live awareness entry
    pub async fn awareness_snapshot(&self) -> AwarenessUpdate {
        self.awareness.lock().await.encode_all()
    }

    fn broadcast_awareness(&self, origin: ClientId, entry: AwarenessEntry) {
        let _ = self.events.send(RelayEvent::Awareness {
            origin,
            update: Arc::new(AwarenessUpdate::single(entry)),
        });
    }

    /// Send a stateless payload to every session
    pub fn broadcast_stateless(&self, origin: Option<ClientId>, payload: &str) -> usize {
        self.events
            .send(RelayEvent::Stateless {
                origin,
                payload: Arc::from(payload),
            })
            .unwrap_or(0)
    }

    /// Mark the document deleted and tell every session to close
    pub fn shut_down(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        let _ = self.events.send(RelayEvent::Shutdown);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn allocate_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

/// Registry of resident documents, one handle per document id.
///
/// The map lock is held only to look up, insert or evict a handle; all
/// document work happens on the handle itself, so unrelated documents
/// never contend.
pub struct DocumentRegistry {
    documents: RwLock<HashMap<Uuid, Arc<DocumentHandle>>>,
    capacity: usize,
    evict_on_last_disconnect: bool,
}

impl DocumentRegistry {
    pub fn new(capacity: usize, evict_on_last_disconnect: bool) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            capacity,
            evict_on_last_disconnect,
        }
    }

    /// Get or create the handle for a document and count one more session
    pub async fn attach(&self, document_id: Uuid) -> Arc<DocumentHandle> {
        // First try to get existing
        {
            let docs = self.documents.read().await;
            if let Some(doc) = docs.get(&document_id) {
                if !doc.is_deleted() {
                    doc.sessions.fetch_add(1, Ordering::SeqCst);
                    return Arc::clone(doc);
                }
            }
        }

        let mut docs = self.documents.write().await;
        // Double-check after acquiring write lock
        if let Some(doc) = docs.get(&document_id) {
            if !doc.is_deleted() {
                doc.sessions.fetch_add(1, Ordering::SeqCst);
                return Arc::clone(doc);
            }
        }

        let doc = Arc::new(DocumentHandle::new(document_id, self.capacity));
        doc.sessions.fetch_add(1, Ordering::SeqCst);
        docs.insert(document_id, Arc::clone(&doc));
        tracing::debug!("Document {} is now resident", document_id);
        doc
    }

    /// Count one session less; evicts the handle after the last one.
    ///
    /// Returns true when the handle was evicted.
    pub async fn detach(&self, handle: &Arc<DocumentHandle>) -> bool {
        let mut docs = self.documents.write().await;
        let remaining = handle.sessions.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining > 0 || !self.evict_on_last_disconnect {
            return false;
        }
        Self::remove_locked(&mut docs, handle)
    }

    /// Drop a handle from the registry if it is still the resident one
    pub async fn remove(&self, handle: &Arc<DocumentHandle>) -> bool {
        let mut docs = self.documents.write().await;
        Self::remove_locked(&mut docs, handle)
    }

    fn remove_locked(
        docs: &mut HashMap<Uuid, Arc<DocumentHandle>>,
        handle: &Arc<DocumentHandle>,
    ) -> bool {
        let resident = docs
            .get(&handle.id())
            .is_some_and(|doc| Arc::ptr_eq(doc, handle));
        if resident {
            docs.remove(&handle.id());
            tracing::debug!("Document {} evicted from memory", handle.id());
        }
        resident
    }

    pub async fn get(&self, document_id: Uuid) -> Option<Arc<DocumentHandle>> {
        self.documents.read().await.get(&document_id).cloned()
    }

    /// Get document count
    pub async fn count(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new(256, true)
    }
}
