use std::convert::Infallible;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::models::{Fragment, QueryRequest, QueryResult};
use crate::state::AppState;

const MAX_QUERY_LEN: usize = 2000;

/// POST /api/query - Answer a question and return the whole result
pub async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResult>, (StatusCode, String)> {
    validate(&req)?;

    let _permit = state
        .query_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Query service at capacity".to_string(),
            )
        })?;

    state
        .pipeline
        .answer(req)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /api/query-stream - Answer a question as server-sent events.
///
/// Event names follow the fragment type: `answer_chunk`, `correction`,
/// then `metadata`, or a single `error`.
pub async fn query_stream(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    validate(&req)?;

    let permit = state
        .query_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Query service at capacity".to_string(),
            )
        })?;

    let cancel = CancellationToken::new();
    // Client disconnect drops the SSE stream, which cancels the run
    let guard = cancel.clone().drop_guard();
    let fragments = state.pipeline.clone().answer_stream(req, cancel);

    let events = fragments.map(move |fragment| {
        let _permit = &permit;
        let _guard = &guard;
        Ok(fragment_event(&fragment))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn validate(req: &QueryRequest) -> Result<(), (StatusCode, String)> {
    if req.query.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Query is required".to_string()));
    }
    if req.query.len() > MAX_QUERY_LEN {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Query exceeds {MAX_QUERY_LEN} bytes"),
        ));
    }
    Ok(())
}

fn fragment_event(fragment: &Fragment) -> Event {
    let name = match fragment {
        Fragment::AnswerChunk { .. } => "answer_chunk",
        Fragment::Correction { .. } => "correction",
        Fragment::Metadata(_) => "metadata",
        Fragment::Error { .. } => "error",
    };
    Event::default()
        .event(name)
        .json_data(fragment)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

pub(crate) fn error_response(err: PipelineError) -> (StatusCode, String) {
    let status = match &err {
        PipelineError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        PipelineError::GenerationFailure(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}
