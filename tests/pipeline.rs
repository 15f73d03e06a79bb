//! End-to-end pipeline tests against a mock provider and mock web pages.
//!
//! Ingestion scenarios drive the orchestrator through fetch → split →
//! embed → store and check the recorded training state; chat scenarios
//! drive moderation, retrieval, and completion. The provider API is
//! mocked with httpmock, so these tests are deterministic and offline.

use std::sync::Arc;

use futures_util::StreamExt;
use httpmock::prelude::*;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use pagesmith::chat::{ChatOptions, ChatService};
use pagesmith::message::ChatMessage;
use pagesmith::provider::ModelClient;
use pagesmith::server::{self, AppState};
use pagesmith::stores::{MemoryStore, Project, SourceLink, TrainingStatus, VectorBackend};
use pagesmith::training::{TrainMode, TrainingOrchestrator};
use pagesmith::types::PipelineError;

const DIMS: usize = 4;
const UNIT_X: [f32; 4] = [1.0, 0.0, 0.0, 0.0];

fn embedding_json(vector: &[f32]) -> serde_json::Value {
    json!({
        "object": "list",
        "data": [{ "object": "embedding", "index": 0, "embedding": vector }],
        "model": "text-embedding-ada-002",
        "usage": { "prompt_tokens": 10, "total_tokens": 10 },
    })
}

fn provider_client(provider: &MockServer) -> ModelClient {
    ModelClient::new(provider.base_url(), "test-key")
}

async fn seeded_store(page_url: &str) -> (Arc<MemoryStore>, Project, SourceLink) {
    let store = Arc::new(MemoryStore::new(DIMS));
    let project = Project::new("Acme");
    store.insert_project(&project).await.unwrap();
    let link = SourceLink::new(project.id, Url::parse(page_url).unwrap());
    store.insert_link(&link).await.unwrap();
    (store, project, link)
}

#[tokio::test]
async fn ingesting_a_two_heading_page_stores_three_chunks() {
    let pages = MockServer::start();
    pages.mock(|when, then| {
        when.method(GET).path("/docs");
        then.status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body(
                "<html><head><title>Acme Handbook</title></head><body>\
                 <p>Welcome to the handbook, the place where everything starts.</p>\
                 <h2>Installation</h2><p>Download the binary and put it on your path.</p>\
                 <h2>Configuration</h2><p>Set the API key and pick a port.</p>\
                 </body></html>",
            );
    });

    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200).json_body(embedding_json(&UNIT_X));
    });

    let (store, project, link) = seeded_store(&pages.url("/docs")).await;
    assert_eq!(link.training_status, TrainingStatus::Idle);

    let trainer = TrainingOrchestrator::new(store.clone(), provider_client(&provider));
    let report = trainer.run(link.id, TrainMode::Train).await.unwrap();

    assert_eq!(report.status, TrainingStatus::Trained);
    assert_eq!(report.sections, 3); // preamble + two headings
    assert_eq!(report.stored, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(store.count_chunks(project.id).await.unwrap(), 3);

    let link = store.get_link(link.id).await.unwrap().unwrap();
    assert_eq!(link.training_status, TrainingStatus::Trained);
    assert!(link.last_trained_at.is_some());
    assert_eq!(link.metadata.title.as_deref(), Some("Acme Handbook"));
}

#[tokio::test]
async fn one_failing_section_out_of_five_still_trains() {
    let keywords = ["alphaone", "bravotwo", "charliethree", "deltafour", "echofive"];
    let pages = MockServer::start();
    let body: String = keywords
        .iter()
        .map(|kw| format!("<h2>Topic {kw}</h2><p>Body about {kw}.</p>"))
        .collect();
    pages.mock(|when, then| {
        when.method(GET).path("/docs");
        then.status(200)
            .header("content-type", "text/html")
            .body(format!("<html><body>{body}</body></html>"));
    });

    let provider = MockServer::start();
    // Four sections embed fine; the matchers are disjoint by keyword.
    for kw in &keywords[..4] {
        provider.mock(|when, then| {
            when.method(POST).path("/v1/embeddings").body_contains(*kw);
            then.status(200).json_body(embedding_json(&UNIT_X));
        });
    }
    // The fifth section hits a rate limit every time.
    provider.mock(|when, then| {
        when.method(POST)
            .path("/v1/embeddings")
            .body_contains("echofive");
        then.status(429).body("rate limited");
    });

    let (store, project, link) = seeded_store(&pages.url("/docs")).await;
    let trainer = TrainingOrchestrator::new(store.clone(), provider_client(&provider));
    let report = trainer.run(link.id, TrainMode::Train).await.unwrap();

    assert_eq!(report.status, TrainingStatus::Trained);
    assert_eq!(report.sections, 5);
    assert_eq!(report.stored, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(store.count_chunks(project.id).await.unwrap(), 4);
}

#[tokio::test]
async fn total_embedding_failure_fails_the_run() {
    let pages = MockServer::start();
    pages.mock(|when, then| {
        when.method(GET).path("/docs");
        then.status(200).header("content-type", "text/html").body(
            "<html><body>\
             <h2>A</h2><p>one</p><h2>B</h2><p>two</p><h2>C</h2><p>three</p>\
             <h2>D</h2><p>four</p><h2>E</h2><p>five</p>\
             </body></html>",
        );
    });

    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(500).body("provider down");
    });

    let (store, project, link) = seeded_store(&pages.url("/docs")).await;
    let trainer = TrainingOrchestrator::new(store.clone(), provider_client(&provider));
    let report = trainer.run(link.id, TrainMode::Train).await.unwrap();

    assert_eq!(report.status, TrainingStatus::Failed);
    assert_eq!(report.stored, 0);
    assert_eq!(store.count_chunks(project.id).await.unwrap(), 0);
    let link = store.get_link(link.id).await.unwrap().unwrap();
    assert_eq!(link.training_status, TrainingStatus::Failed);
}

#[tokio::test]
async fn unreachable_page_records_failure() {
    let pages = MockServer::start();
    pages.mock(|when, then| {
        when.method(GET).path("/docs");
        then.status(404).body("gone");
    });
    let provider = MockServer::start();

    let (store, _, link) = seeded_store(&pages.url("/docs")).await;
    let trainer = TrainingOrchestrator::new(store.clone(), provider_client(&provider));
    let report = trainer.run(link.id, TrainMode::Train).await.unwrap();

    assert_eq!(report.status, TrainingStatus::Failed);
    assert!(report.error.is_some());
    let link = store.get_link(link.id).await.unwrap().unwrap();
    assert_eq!(link.training_status, TrainingStatus::Failed);
}

#[tokio::test]
async fn duplicate_trigger_while_training_is_rejected() {
    let pages = MockServer::start();
    let provider = MockServer::start();
    let (store, _, link) = seeded_store(&pages.url("/docs")).await;

    // Simulate an in-flight run holding the guard.
    assert!(store.begin_training(link.id).await.unwrap());

    let trainer = TrainingOrchestrator::new(store.clone(), provider_client(&provider));
    let err = trainer.run(link.id, TrainMode::Train).await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyTraining(_)));

    // The guard is still held by the original run.
    let link = store.get_link(link.id).await.unwrap().unwrap();
    assert_eq!(link.training_status, TrainingStatus::Training);
}

#[tokio::test]
async fn retrain_replaces_all_chunks_from_before() {
    let pages = MockServer::start();
    let mut first_page = pages.mock(|when, then| {
        when.method(GET).path("/docs");
        then.status(200).header("content-type", "text/html").body(
            "<html><body><h2>Old</h2><p>stale firstedition text</p></body></html>",
        );
    });

    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200).json_body(embedding_json(&UNIT_X));
    });

    let (store, project, link) = seeded_store(&pages.url("/docs")).await;
    let trainer = TrainingOrchestrator::new(store.clone(), provider_client(&provider));
    trainer.run(link.id, TrainMode::Train).await.unwrap();
    assert_eq!(store.count_chunks(project.id).await.unwrap(), 1);

    // The page changes, then the operator retrains.
    first_page.delete();
    pages.mock(|when, then| {
        when.method(GET).path("/docs");
        then.status(200).header("content-type", "text/html").body(
            "<html><body>\
             <h2>New</h2><p>fresh secondedition text</p>\
             <h2>Extra</h2><p>more secondedition text</p>\
             </body></html>",
        );
    });

    let report = trainer.run(link.id, TrainMode::Retrain).await.unwrap();
    assert_eq!(report.status, TrainingStatus::Trained);
    assert_eq!(report.stored, 2);

    let hits = store.search(project.id, &UNIT_X, 0.5, 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(
        hits.iter()
            .all(|hit| !hit.chunk.content.contains("firstedition")),
        "retrain left chunks from before the retrain began"
    );
}

#[tokio::test]
async fn chat_with_no_matching_chunks_still_completes_with_empty_sources() {
    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/v1/moderations");
        then.status(200)
            .json_body(json!({ "results": [{ "flagged": false }] }));
    });
    provider.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200).json_body(embedding_json(&UNIT_X));
    });
    provider.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({
            "choices": [{ "message": {
                "role": "assistant",
                "content": "Sorry, I don't know how to help with that.",
            } }],
        }));
    });

    let store = Arc::new(MemoryStore::new(DIMS));
    let project = Project::new("Acme");
    store.insert_project(&project).await.unwrap();

    let chat = ChatService::new(
        store.clone(),
        provider_client(&provider),
        ChatOptions::default(),
    )
    .unwrap();
    let answer = chat
        .answer(project.id, &[], "What is the meaning of life?")
        .await
        .unwrap();

    assert_eq!(answer.content, "Sorry, I don't know how to help with that.");
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn flagged_message_short_circuits_before_embedding_or_completion() {
    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/v1/moderations");
        then.status(200)
            .json_body(json!({ "results": [{ "flagged": true }] }));
    });
    let embeddings = provider.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200).json_body(embedding_json(&UNIT_X));
    });
    let completions = provider.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({ "choices": [] }));
    });

    let store = Arc::new(MemoryStore::new(DIMS));
    let project = Project::new("Acme");
    store.insert_project(&project).await.unwrap();

    let chat = ChatService::new(
        store.clone(),
        provider_client(&provider),
        ChatOptions::default(),
    )
    .unwrap();
    let err = chat
        .answer(project.id, &[], "something policy violating")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Flagged));
    assert_eq!(embeddings.hits(), 0);
    assert_eq!(completions.hits(), 0);
}

#[tokio::test]
async fn answers_cite_the_urls_of_contributing_chunks() {
    let pages = MockServer::start();
    pages.mock(|when, then| {
        when.method(GET).path("/pricing");
        then.status(200).header("content-type", "text/html").body(
            "<html><body><h2>Pricing</h2><p>The pro plan costs ten dollars.</p></body></html>",
        );
    });

    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/v1/moderations");
        then.status(200)
            .json_body(json!({ "results": [{ "flagged": false }] }));
    });
    provider.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200).json_body(embedding_json(&UNIT_X));
    });
    provider.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({
            "choices": [{ "message": {
                "role": "assistant",
                "content": "The pro plan costs ten dollars.",
            } }],
        }));
    });

    let (store, project, link) = seeded_store(&pages.url("/pricing")).await;
    let trainer = TrainingOrchestrator::new(store.clone(), provider_client(&provider));
    trainer.run(link.id, TrainMode::Train).await.unwrap();

    let chat = ChatService::new(
        store.clone(),
        provider_client(&provider),
        ChatOptions::default(),
    )
    .unwrap();
    let history = vec![ChatMessage::assistant("Hi! How can I help?")];
    let answer = chat
        .answer(project.id, &history, "How much is the pro plan?")
        .await
        .unwrap();

    assert_eq!(answer.sources, vec![pages.url("/pricing")]);
    assert!(answer.content.contains("ten dollars"));
}

#[tokio::test]
async fn streamed_answers_arrive_as_deltas() {
    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/v1/moderations");
        then.status(200)
            .json_body(json!({ "results": [{ "flagged": false }] }));
    });
    provider.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200).json_body(embedding_json(&UNIT_X));
    });
    provider.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_contains("\"stream\":true");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Par\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"tial\"}}]}\n\n",
                "data: [DONE]\n\n",
            ));
    });

    let store = Arc::new(MemoryStore::new(DIMS));
    let project = Project::new("Acme");
    store.insert_project(&project).await.unwrap();

    let chat = ChatService::new(
        store.clone(),
        provider_client(&provider),
        ChatOptions::default(),
    )
    .unwrap();
    let answer = chat.answer_stream(project.id, &[], "stream it").await.unwrap();
    assert!(answer.sources.is_empty());

    let deltas: Vec<String> = answer
        .stream
        .map(|delta| delta.unwrap())
        .collect()
        .await;
    assert_eq!(deltas.join(""), "Partial");
}

#[tokio::test]
async fn http_endpoints_map_pipeline_outcomes_to_statuses() {
    let pages = MockServer::start();
    pages.mock(|when, then| {
        when.method(GET).path("/docs");
        then.status(200).header("content-type", "text/html").body(
            "<html><body><h2>Guide</h2><p>Everything you need.</p></body></html>",
        );
    });

    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/v1/moderations");
        then.status(200)
            .json_body(json!({ "results": [{ "flagged": true }] }));
    });
    provider.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200).json_body(embedding_json(&UNIT_X));
    });

    let (store, _, link) = seeded_store(&pages.url("/docs")).await;
    let client = provider_client(&provider);
    let trainer = Arc::new(TrainingOrchestrator::new(store.clone(), client.clone()));
    let chat = Arc::new(
        ChatService::new(store.clone(), client, ChatOptions::default()).unwrap(),
    );

    let router = server::router(AppState { chat, trainer });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let http = reqwest::Client::new();
    let base = format!("http://{address}");

    // Training a registered link runs to a terminal state.
    let response = http
        .post(format!("{base}/api/training"))
        .json(&json!({ "link_id": link.id, "mode": "train" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "trained");

    // Unknown links are 404.
    let response = http
        .post(format!("{base}/api/training"))
        .json(&json!({ "link_id": Uuid::new_v4(), "mode": "train" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Moderation refusals surface as 403, not a generic failure.
    let response = http
        .post(format!("{base}/api/chat"))
        .json(&json!({
            "project_id": link.project_id,
            "messages": [],
            "message": "flag me",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Unknown projects are 404.
    let response = http
        .post(format!("{base}/api/chat"))
        .json(&json!({
            "project_id": Uuid::new_v4(),
            "messages": [],
            "message": "hello",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
