use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::{DocumentRow, DocumentSummary};
use crate::error::AppError;
use crate::AppState;

/// Request to provision a new document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub document_id: Uuid,
}

/// Request for the titles of several documents
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitlesRequest {
    #[serde(default)]
    pub document_ids: Vec<Uuid>,
}

/// Document metadata and stored state
#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub title: String,
    /// Base64 of the stored CRDT state
    pub binary_state: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<DocumentRow> for DocumentResponse {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            binary_state: row.binary_state.map(|state| STANDARD.encode(state)),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DocumentEnvelope {
    pub document: DocumentResponse,
}

#[derive(Debug, Serialize)]
pub struct TitlesResponse {
    pub documents: Vec<DocumentSummary>,
}

/// Provision an empty document row
async fn create_document(
    State(state): State<AppState>,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<Json<DocumentEnvelope>, AppError> {
    let row = state.storage.create(req.document_id).await?;
    tracing::info!("Created document {}", row.id);
    Ok(Json(DocumentEnvelope {
        document: row.into(),
    }))
}

/// Get a document by ID
async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentEnvelope>, AppError> {
    let row = state
        .storage
        .select(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Document {} not found", id)))?;
    Ok(Json(DocumentEnvelope {
        document: row.into(),
    }))
}

/// Titles for a list of document ids
async fn document_titles(
    State(state): State<AppState>,
    Json(req): Json<TitlesRequest>,
) -> Result<Json<TitlesResponse>, AppError> {
    if req.document_ids.is_empty() {
        return Ok(Json(TitlesResponse {
            documents: Vec::new(),
        }));
    }
    let documents = state.storage.titles(&req.document_ids).await?;
    Ok(Json(TitlesResponse { documents }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/documents", post(create_document))
        .route("/api/documents/titles", post(document_titles))
        .route("/api/documents/{id}", get(get_document))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::storage::MemoryStorage;
    use crate::{app, AppState};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn state() -> AppState {
        AppState::new(Arc::new(MemoryStorage::new()), &Config::default())
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_fetch_document() {
        let state = state();
        let id = Uuid::new_v4();

        let (status, created) =
            call(&state, post_json("/api/documents", json!({ "documentId": id }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["document"]["id"], json!(id));
        assert_eq!(created["document"]["title"], "");
        assert!(created["document"]["binary_state"].is_null());

        let request = Request::builder()
            .uri(format!("/api/documents/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, fetched) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["document"]["id"], json!(id));
    }

    #[tokio::test]
    async fn test_fetch_unknown_document_is_404() {
        let request = Request::builder()
            .uri(format!("/api/documents/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_titles() {
        let state = state();
        let id = Uuid::new_v4();
        state.storage.create(id).await.unwrap();

        let (status, body) = call(
            &state,
            post_json(
                "/api/documents/titles",
                json!({ "documentIds": [id, Uuid::new_v4()] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents"].as_array().unwrap().len(), 1);

        let (_, empty) = call(
            &state,
            post_json("/api/documents/titles", json!({ "documentIds": [] })),
        )
        .await;
        assert_eq!(empty["documents"], json!([]));
    }

    #[tokio::test]
    async fn test_health_reports_resident_documents() {
        let state = state();
        let session = state.relay.connect(Uuid::new_v4()).await;

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["documents"], 1);

        session.disconnect().await;
    }
}
