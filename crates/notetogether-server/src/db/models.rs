use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable document row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentRow {
    pub id: Uuid,
    pub title: String,
    /// Encoded CRDT state; `None` until the first SAVE
    pub binary_state: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRow {
    /// Freshly provisioned row with no content
    pub fn empty(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: String::new(),
            binary_state: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Values written by a SAVE
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub id: Uuid,
    pub title: String,
    pub binary_state: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// Id and title, for document lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub title: String,
}
