use notetogether_core::{AwarenessUpdate, ClientId, ControlMessage, StatelessPayload};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::collab::bridge::{ControlOutcome, PersistenceBridge};
use crate::collab::document::{DocumentHandle, DocumentRegistry, RelayEvent};
use crate::error::AppError;
use crate::storage::DocumentStorage;

/// Lifecycle of one client's attachment to a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Synced,
    Disconnected,
}

/// Something a session must forward to its client
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Update delta from another session
    Update(Arc<Vec<u8>>),
    /// Full state after this session fell behind the relay buffer
    Resync(Vec<u8>),
    Awareness(Arc<AwarenessUpdate>),
    /// Stateless payload, e.g. a `DELETED` notification
    Stateless(Arc<str>),
    /// The document was deleted; the session is over
    Terminated,
}

/// Binds sessions to resident documents and routes their traffic
#[derive(Clone)]
pub struct Relay {
    registry: Arc<DocumentRegistry>,
    bridge: Arc<PersistenceBridge>,
}

impl Relay {
    pub fn new(registry: Arc<DocumentRegistry>, bridge: Arc<PersistenceBridge>) -> Self {
        Self { registry, bridge }
    }

    /// Relay with default registry settings over `storage`
    pub fn with_storage(storage: Arc<dyn DocumentStorage>) -> Self {
        Self::new(
            Arc::new(DocumentRegistry::default()),
            Arc::new(PersistenceBridge::new(storage)),
        )
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Attach a new session to `document_id`.
    ///
    /// The first session of a resident document triggers the load hook;
    /// sessions arriving while it runs wait for it and do not load again.
    pub async fn connect(&self, document_id: Uuid) -> Session {
        let handle = self.registry.attach(document_id).await;
        let client_id = handle.allocate_client_id();
        let events = handle.subscribe();
        let mut session = Session {
            document_id,
            client_id,
            handle,
            events,
            status: SessionStatus::Connecting,
            deletion_sent: false,
            released: false,
            relay: self.clone(),
        };

        let bridge = &self.bridge;
        let handle = &session.handle;
        handle
            .ensure_loaded(move || bridge.on_load(document_id, handle))
            .await;

        session.status = SessionStatus::Connected;
        tracing::debug!("Client {} connected to {}", client_id, document_id);
        session
    }

    async fn handle_stateless(
        &self,
        session: &Session,
        payload: StatelessPayload<'_>,
    ) -> Result<ControlOutcome, AppError> {
        let outcome = self
            .bridge
            .on_control_message(session.document_id, &session.handle, payload)
            .await?;
        if outcome == ControlOutcome::Deleted {
            self.registry.remove(&session.handle).await;
        }
        Ok(outcome)
    }
}

/// One client's connection to one document
pub struct Session {
    document_id: Uuid,
    client_id: ClientId,
    handle: Arc<DocumentHandle>,
    events: broadcast::Receiver<RelayEvent>,
    status: SessionStatus,
    /// `DELETED` has already been handed to the client
    deletion_sent: bool,
    /// Set once the handle has been detached from the registry
    released: bool,
    relay: Relay,
}

impl Session {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Full document state for a client joining with nothing
    pub async fn initial_state(&mut self) -> Vec<u8> {
        let state = self.handle.encode_state().await;
        self.mark_synced();
        state
    }

    /// Relay state vector for the client to diff against
    pub async fn state_vector(&self) -> Vec<u8> {
        self.handle.state_vector().await
    }

    /// Answer a client's state vector with what it is missing
    pub async fn sync_step1(&mut self, state_vector: &[u8]) -> Result<Vec<u8>, AppError> {
        let diff = self.handle.encode_diff(state_vector).await?;
        self.mark_synced();
        Ok(diff)
    }

    fn mark_synced(&mut self) {
        if self.status == SessionStatus::Connected {
            self.status = SessionStatus::Synced;
        }
    }

    /// Merge a client delta and relay it to the other sessions
    pub async fn apply_update(&self, update: &[u8]) -> Result<(), AppError> {
        self.ensure_open()?;
        self.handle.apply_update(self.client_id, update).await?;
        Ok(())
    }

    /// Publish this client's presence, or clear it with `None`
    pub async fn set_awareness(&self, state: Option<Value>) -> Result<(), AppError> {
        self.ensure_open()?;
        self.handle.set_awareness(self.client_id, state).await;
        Ok(())
    }

    /// Every presence entry currently known to the relay
    pub async fn awareness_snapshot(&self) -> AwarenessUpdate {
        self.handle.awareness_snapshot().await
    }

    /// Route a stateless payload to the persistence bridge
    pub async fn send_stateless(
        &self,
        payload: StatelessPayload<'_>,
    ) -> Result<ControlOutcome, AppError> {
        self.ensure_open()?;
        self.relay.handle_stateless(self, payload).await
    }

    /// Send a typed control command
    pub async fn send_command(&self, message: &ControlMessage) -> Result<ControlOutcome, AppError> {
        let json = message.to_json();
        self.send_stateless(StatelessPayload::Text(&json)).await
    }

    /// Wait for the next event addressed to this session.
    ///
    /// Once the document is deleted the session yields `DELETED` (unless
    /// already delivered) and then `Terminated`, even when the relay buffer
    /// dropped those events. Returns `None` once the session is disconnected.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.status == SessionStatus::Disconnected {
            return None;
        }
        if self.handle.is_deleted() {
            return Some(self.close_deleted());
        }
        loop {
            match self.events.recv().await {
                Ok(RelayEvent::Update { origin, update }) => {
                    if origin != self.client_id {
                        return Some(SessionEvent::Update(update));
                    }
                }
                Ok(RelayEvent::Awareness { origin, update }) => {
                    if origin != self.client_id {
                        return Some(SessionEvent::Awareness(update));
                    }
                }
                Ok(RelayEvent::Stateless { origin, payload }) => {
                    if origin != Some(self.client_id) {
                        if ControlMessage::parse(&*payload) == Some(ControlMessage::Deleted) {
                            self.deletion_sent = true;
                        }
                        return Some(SessionEvent::Stateless(payload));
                    }
                }
                Ok(RelayEvent::Shutdown) => return Some(self.close_deleted()),
                Err(RecvError::Lagged(skipped)) => {
                    if self.handle.is_deleted() {
                        return Some(self.close_deleted());
                    }
                    tracing::warn!(
                        "Client {} on {} lagged by {} events, resyncing",
                        self.client_id,
                        self.document_id,
                        skipped
                    );
                    return Some(SessionEvent::Resync(self.handle.encode_state().await));
                }
                Err(RecvError::Closed) => {
                    self.status = SessionStatus::Disconnected;
                    return None;
                }
            }
        }
    }

    fn close_deleted(&mut self) -> SessionEvent {
        if self.deletion_sent {
            self.status = SessionStatus::Disconnected;
            return SessionEvent::Terminated;
        }
        self.deletion_sent = true;
        SessionEvent::Stateless(Arc::from(ControlMessage::Deleted.to_json()))
    }

    /// Leave the document: drop presence and release the handle
    pub async fn disconnect(mut self) {
        self.handle.remove_awareness(self.client_id).await;
        let evicted = self.relay.registry.detach(&self.handle).await;
        self.released = true;
        self.status = SessionStatus::Disconnected;
        tracing::debug!(
            "Client {} left {}{}",
            self.client_id,
            self.document_id,
            if evicted { " (evicted)" } else { "" }
        );
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.status == SessionStatus::Disconnected || self.handle.is_deleted() {
            return Err(AppError::NotFound(format!(
                "Document {} is no longer available",
                self.document_id
            )));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped without disconnect(): release the handle in the background
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let handle = Arc::clone(&self.handle);
        let registry = Arc::clone(&self.relay.registry);
        let client_id = self.client_id;
        runtime.spawn(async move {
            handle.remove_awareness(client_id).await;
            registry.detach(&handle).await;
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("document_id", &self.document_id)
            .field("client_id", &self.client_id)
            .field("status", &self.status)
            .finish()
    }
}
