pub mod models;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::AppError;
use crate::storage::DocumentStorage;
use models::{DocumentRow, DocumentSnapshot, DocumentSummary};

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStorage for Database {
    async fn select(&self, id: Uuid) -> Result<Option<DocumentRow>, AppError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"SELECT id, title, binary_state, created_at, updated_at FROM documents WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn upsert(&self, snapshot: &DocumentSnapshot) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, title, binary_state, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id)
            DO UPDATE SET title = $2, binary_state = $3, updated_at = $4
            "#,
        )
        .bind(snapshot.id)
        .bind(&snapshot.title)
        .bind(&snapshot.binary_state)
        .bind(snapshot.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Document {} not found", id)));
        }

        Ok(())
    }

    async fn create(&self, id: Uuid) -> Result<DocumentRow, AppError> {
        sqlx::query("INSERT INTO documents (id, title) VALUES ($1, '') ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.select(id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Document {} vanished after insert", id)))
    }

    async fn titles(&self, ids: &[Uuid]) -> Result<Vec<DocumentSummary>, AppError> {
        let summaries = sqlx::query_as::<_, DocumentSummary>(
            r#"SELECT id, title FROM documents WHERE id = ANY($1) ORDER BY created_at DESC"#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(summaries)
    }
}
