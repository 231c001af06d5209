//! Durable document storage.
//!
//! The persistence bridge is the only writer of document content; the REST
//! layer only provisions empty rows and reads metadata.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{DocumentRow, DocumentSnapshot, DocumentSummary};
use crate::error::AppError;

/// Row store keyed by document id
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Fetch the row for `id`, if any
    async fn select(&self, id: Uuid) -> Result<Option<DocumentRow>, AppError>;

    /// Insert or overwrite title, state and `updated_at`
    async fn upsert(&self, snapshot: &DocumentSnapshot) -> Result<(), AppError>;

    /// Remove the row; `NotFound` when there is none
    async fn delete(&self, id: Uuid) -> Result<(), AppError>;

    /// Provision an empty row, returning the existing one if already present
    async fn create(&self, id: Uuid) -> Result<DocumentRow, AppError>;

    /// Titles of the given documents, newest first; unknown ids are skipped
    async fn titles(&self, ids: &[Uuid]) -> Result<Vec<DocumentSummary>, AppError>;
}

/// In-process storage used without a database and in tests
#[derive(Default)]
pub struct MemoryStorage {
    rows: RwLock<HashMap<Uuid, DocumentRow>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing the bridge
    pub async fn insert_row(&self, row: DocumentRow) {
        self.rows.write().await.insert(row.id, row);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStorage for MemoryStorage {
    async fn select(&self, id: Uuid) -> Result<Option<DocumentRow>, AppError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn upsert(&self, snapshot: &DocumentSnapshot) -> Result<(), AppError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .entry(snapshot.id)
            .or_insert_with(|| DocumentRow::empty(snapshot.id));
        row.title = snapshot.title.clone();
        row.binary_state = Some(snapshot.binary_state.clone());
        row.updated_at = snapshot.updated_at;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Document {} not found", id)))
    }

    async fn create(&self, id: Uuid) -> Result<DocumentRow, AppError> {
        let mut rows = self.rows.write().await;
        Ok(rows
            .entry(id)
            .or_insert_with(|| DocumentRow::empty(id))
            .clone())
    }

    async fn titles(&self, ids: &[Uuid]) -> Result<Vec<DocumentSummary>, AppError> {
        let rows = self.rows.read().await;
        let unique: HashSet<&Uuid> = ids.iter().collect();
        let mut found: Vec<&DocumentRow> = unique.into_iter().filter_map(|id| rows.get(id)).collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found
            .into_iter()
            .map(|row| DocumentSummary {
                id: row.id,
                title: row.title.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let storage = MemoryStorage::new();
        let id = Uuid::new_v4();

        let first = storage.create(id).await.unwrap();
        let second = storage.create(id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.title, "");
        assert!(first.binary_state.is_none());
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_upsert_then_select() {
        let storage = MemoryStorage::new();
        let id = Uuid::new_v4();
        storage
            .upsert(&DocumentSnapshot {
                id,
                title: "Plan".to_string(),
                binary_state: vec![1, 2, 3],
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let row = storage.select(id).await.unwrap().unwrap();
        assert_eq!(row.title, "Plan");
        assert_eq!(row.binary_state, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_delete_missing_row_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage.delete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_titles_skip_unknown_ids() {
        let storage = MemoryStorage::new();
        let known = Uuid::new_v4();
        storage.create(known).await.unwrap();

        let titles = storage.titles(&[known, Uuid::new_v4()]).await.unwrap();
        assert_eq!(titles.len(), 1);
        assert_eq!(titles[0].id, known);
    }
}
