//! HTTP surface for the pipeline: the chat completion endpoint consumed
//! by the widget/dashboard and the training webhook consumed from the
//! ingestion queue.
//!
//! Error mapping follows the pipeline's taxonomy: moderation refusals are
//! 403 so the UI can show a specific message, unknown projects/links are
//! 404, duplicate training triggers answer 200 with an
//! `already_training` status, and everything else is a generic 500 that
//! leaks no internals.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::chat::ChatService;
use crate::message::ChatMessage;
use crate::training::{TrainMode, TrainingOrchestrator};
use crate::types::PipelineError;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub trainer: Arc<TrainingOrchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/training", post(training_handler))
        .with_state(state)
}

#[derive(Deserialize)]
struct ChatRequest {
    project_id: Uuid,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    message: String,
}

#[derive(Deserialize)]
struct ChatQuery {
    #[serde(default)]
    stream: bool,
}

async fn chat_handler(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if query.stream {
        match state
            .chat
            .answer_stream(request.project_id, &request.messages, &request.message)
            .await
        {
            Ok(answer) => (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                Body::from_stream(answer.stream),
            )
                .into_response(),
            Err(err) => chat_error_response(err),
        }
    } else {
        match state
            .chat
            .answer(request.project_id, &request.messages, &request.message)
            .await
        {
            Ok(answer) => Json(json!({
                "content": answer.content,
                "sources": answer.sources,
            }))
            .into_response(),
            Err(err) => chat_error_response(err),
        }
    }
}

fn chat_error_response(err: PipelineError) -> Response {
    match err {
        PipelineError::Flagged => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "message flagged by moderation" })),
        )
            .into_response(),
        PipelineError::NotFound { kind, id } => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{kind} {id} not found") })),
        )
            .into_response(),
        other => {
            error!(error = %other, "chat turn failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to answer" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct TrainingTrigger {
    link_id: Uuid,
    #[serde(default = "default_mode")]
    mode: TrainMode,
}

fn default_mode() -> TrainMode {
    TrainMode::Train
}

/// Queue deliveries are at-least-once; the handler acknowledges only
/// after the run reaches a terminal state, and a redelivery racing an
/// in-flight run gets the benign `already_training` answer.
async fn training_handler(
    State(state): State<AppState>,
    Json(trigger): Json<TrainingTrigger>,
) -> Response {
    match state.trainer.run(trigger.link_id, trigger.mode).await {
        Ok(report) => Json(json!({
            "status": report.status.as_str(),
            "sections": report.sections,
            "stored": report.stored,
            "failed": report.failed,
            "error": report.error,
        }))
        .into_response(),
        Err(PipelineError::AlreadyTraining(_)) => {
            Json(json!({ "status": "already_training" })).into_response()
        }
        Err(PipelineError::NotFound { kind, id }) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{kind} {id} not found") })),
        )
            .into_response(),
        Err(other) => {
            error!(link_id = %trigger.link_id, error = %other, "training trigger failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "training failed" })),
            )
                .into_response()
        }
    }
}
