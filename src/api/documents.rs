use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::models::{AddDocumentRequest, Document};
use crate::state::AppState;

/// GET /api/documents - List indexed documents, newest first
pub async fn list_documents(State(state): State<AppState>) -> Json<Vec<Document>> {
    let mut documents = state.documents.read().clone();
    documents.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
    Json(documents)
}

/// POST /api/documents - Chunk, embed and index already-extracted page text
pub async fn add_document(
    State(state): State<AppState>,
    Json(req): Json<AddDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), (StatusCode, String)> {
    let filename = req.filename.trim().to_string();
    if filename.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Filename is required".to_string()));
    }
    if req.pages.iter().all(|p| p.trim().is_empty()) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Document contains no text".to_string(),
        ));
    }

    match state.ingest(&filename, &req.pages).await {
        Ok(document) => Ok((StatusCode::CREATED, Json(document))),
        Err(e) => {
            tracing::error!("Failed to index {filename}: {e:#}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Indexing failed: {e:#}"),
            ))
        }
    }
}

/// DELETE /api/documents/{id} - Remove a document from both indices
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    match state.remove_document(id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err((StatusCode::NOT_FOUND, "Document not found".to_string())),
        Err(e) => {
            tracing::error!("Failed to delete {id}: {e:#}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Delete failed: {e:#}"),
            ))
        }
    }
}
