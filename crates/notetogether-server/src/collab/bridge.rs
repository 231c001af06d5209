use chrono::Utc;
use notetogether_core::{normalize_snapshot, ControlMessage, StatelessPayload};
use std::sync::Arc;
use uuid::Uuid;

use crate::collab::document::DocumentHandle;
use crate::db::models::DocumentSnapshot;
use crate::error::AppError;
use crate::storage::DocumentStorage;

/// Result of handling one control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Unparseable, unknown or server-only message; nothing happened
    Ignored,
    /// State persisted under `title`
    Saved { title: String, bytes: usize },
    /// Row removed and every session told to leave
    Deleted,
}

/// Hooks binding resident documents to durable storage
pub struct PersistenceBridge {
    storage: Arc<dyn DocumentStorage>,
}

impl PersistenceBridge {
    pub fn new(storage: Arc<dyn DocumentStorage>) -> Self {
        Self { storage }
    }

    /// Apply the stored snapshot, if any, to a freshly created handle.
    ///
    /// Missing rows, empty state and storage failures all leave the model
    /// empty; the next SAVE writes the row.
    pub async fn on_load(&self, document_id: Uuid, handle: &DocumentHandle) {
        let row = match self.storage.select(document_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::debug!("No stored row for {}, starting empty", document_id);
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to load {}, starting empty: {}", document_id, e);
                return;
            }
        };

        let Some(raw) = row.binary_state.filter(|raw| !raw.is_empty()) else {
            tracing::debug!("Document {} has no saved state yet", document_id);
            return;
        };

        let (update, encoding) = match normalize_snapshot(&raw) {
            Ok(normalized) => normalized,
            Err(e) => {
                tracing::warn!("Unreadable snapshot for {}: {}", document_id, e);
                return;
            }
        };

        let doc = handle.document().await;
        match doc.apply_update(&update) {
            Ok(()) => tracing::info!(
                "Loaded document {} ({} bytes, {:?})",
                document_id,
                update.len(),
                encoding
            ),
            Err(e) => tracing::warn!("Failed to apply snapshot for {}: {}", document_id, e),
        }
    }

    /// Handle a stateless payload sent by a session of `document_id`
    pub async fn on_control_message(
        &self,
        document_id: Uuid,
        handle: &DocumentHandle,
        payload: StatelessPayload<'_>,
    ) -> Result<ControlOutcome, AppError> {
        let Some(message) = ControlMessage::parse(payload) else {
            tracing::debug!("Ignoring malformed control message for {}", document_id);
            return Ok(ControlOutcome::Ignored);
        };

        match message {
            ControlMessage::Save { title } => self.save(document_id, handle, title).await,
            ControlMessage::Delete => self.delete(document_id, handle).await,
            ControlMessage::Deleted => {
                tracing::debug!("Ignoring client-sent DELETED for {}", document_id);
                Ok(ControlOutcome::Ignored)
            }
        }
    }

    async fn save(
        &self,
        document_id: Uuid,
        handle: &DocumentHandle,
        requested_title: Option<String>,
    ) -> Result<ControlOutcome, AppError> {
        let (binary_state, document_title, meta_title) = {
            let doc = handle.document().await;
            (doc.encode_state(), doc.title(), doc.meta_title())
        };
        let title = resolve_title(document_title, meta_title, requested_title);
        let bytes = binary_state.len();

        let snapshot = DocumentSnapshot {
            id: document_id,
            title: title.clone(),
            binary_state,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.storage.upsert(&snapshot).await {
            tracing::error!("Failed to save {}: {}", document_id, e);
            return Err(e);
        }

        tracing::info!("Saved document {} ({} bytes)", document_id, bytes);
        Ok(ControlOutcome::Saved { title, bytes })
    }

    async fn delete(
        &self,
        document_id: Uuid,
        handle: &DocumentHandle,
    ) -> Result<ControlOutcome, AppError> {
        if let Err(e) = self.storage.delete(document_id).await {
            tracing::error!("Failed to delete {}: {}", document_id, e);
            return Err(e);
        }

        let notified = handle.broadcast_stateless(None, &ControlMessage::Deleted.to_json());
        handle.shut_down();
        tracing::info!(
            "Deleted document {}, notified {} sessions",
            document_id,
            notified
        );
        Ok(ControlOutcome::Deleted)
    }
}

/// First non-blank of the title text, `meta.title` and the message title
fn resolve_title(
    document_title: String,
    meta_title: Option<String>,
    requested: Option<String>,
) -> String {
    [Some(document_title), meta_title, requested]
        .into_iter()
        .flatten()
        .find(|title| !title.trim().is_empty())
        .unwrap_or_default()
}
